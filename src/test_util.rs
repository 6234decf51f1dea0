//! Heap buffers standing in for code in unit tests

use std::cell::RefCell;
use std::ptr;
use std::rc::Rc;

use crate::patcher::byte::BytePatcher;
use crate::patcher::{Patcher, WriteError};

/// Prologue that resolves to 6 bytes in both modes: `mov edi, edi; xor eax, eax; mov ebp, esp`
pub const PROLOGUE: [u8; 9] = [0x8b, 0xff, 0x33, 0xc0, 0x8b, 0xec, 0x83, 0xec, 0x10];

/// Heap allocation that is only ever touched through raw pointers, the same as foreign code would be
pub struct CodeBuffer {
    /// Start of the allocation
    data: *mut u8,
    /// Length of the allocation
    len: usize,
}
impl CodeBuffer {
    /// Allocates a copy of `bytes`
    pub fn new(bytes: &[u8]) -> Self {
        let boxed: Box<[u8]> = bytes.into();
        let len = boxed.len();
        let data = Box::into_raw(boxed).cast::<u8>();
        Self { data, len }
    }

    /// Allocates `len` bytes of `int3` with [`PROLOGUE`] copied to each offset in `sites`
    pub fn with_sites(len: usize, sites: &[usize]) -> Self {
        let mut bytes = vec![0xcc; len];
        for &site in sites {
            bytes[site..site + PROLOGUE.len()].copy_from_slice(&PROLOGUE);
        }
        Self::new(&bytes)
    }

    /// Pointer to the start of the buffer
    pub fn ptr(&self) -> *mut u8 {
        self.data
    }

    /// Pointer to `offset` bytes into the buffer
    pub fn at(&self, offset: usize) -> *mut u8 {
        assert!(offset < self.len);
        unsafe { self.data.add(offset) }
    }

    /// Copy of the current contents
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = vec![0; self.len];
        unsafe { ptr::copy_nonoverlapping(self.data, out.as_mut_ptr(), self.len) };
        out
    }

    /// Copy of `len` bytes starting at `offset`
    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        self.bytes()[offset..offset + len].to_vec()
    }

    /// Overwrites bytes at `offset`, bypassing any patcher
    pub fn poke(&self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.len);
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.add(offset), bytes.len()) };
    }
}
impl Drop for CodeBuffer {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.data, self.len)));
        }
    }
}

/// Byte patcher that refuses to write at chosen addresses, the way a page that can't be unprotected would
///
/// Clones share the failing addresses, so a test can keep one while a registry owns another.
#[derive(Clone, Default)]
pub struct FailingPatcher {
    /// Addresses whose writes fail
    failing: Rc<RefCell<Vec<usize>>>,
}
impl FailingPatcher {
    /// Makes every write starting at `address` fail from now on
    pub fn fail_at(&self, address: *const u8) {
        self.failing.borrow_mut().push(address as usize);
    }

    /// Lets every write through again
    pub fn heal(&self) {
        self.failing.borrow_mut().clear();
    }
}
unsafe impl Patcher for FailingPatcher {
    type Error = WriteError;

    unsafe fn write(&self, target: *mut u8, bytes: &[u8]) -> Result<(), WriteError> {
        if self.failing.borrow().contains(&(target as usize)) {
            return Err(WriteError::Protection {
                address: target as usize,
                len: bytes.len(),
                source: region::Error::UnmappedRegion,
            });
        }
        BytePatcher::new().write(target, bytes).map_err(WriteError::from)
    }
}
