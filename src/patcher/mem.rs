//! This module contains a patcher which adjusts memory permissions to patch read-only code

use region::Protection;
use thiserror::Error;

use crate::code::x86::flush_instruction_cache;

use super::{Patcher, WriteError};

/// Errors when using permission patching
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// Error when setting memory protections
    #[error("Error setting memory protections at {address:#x}")]
    ProtectionError {
        /// Location of the write
        address: usize,
        /// Length of the write
        len: usize,
        /// Error from `region`
        #[source]
        source: region::Error,
    },
    /// Custom error type from the underlying patcher
    #[error("{0}")]
    CustomError(E),
}
impl<E: Into<WriteError>> From<PermissionError<E>> for WriteError {
    fn from(e: PermissionError<E>) -> Self {
        match e {
            PermissionError::ProtectionError {
                address,
                len,
                source,
            } => WriteError::Protection {
                address,
                len,
                source,
            },
            PermissionError::CustomError(e) => e.into(),
        }
    }
}

/// This struct wraps patchers to allow them to write to memory that's normally unwritable.
/// It achieves this result by changing the memory permissions of the target memory, triggering the write, and then reverting the permissions.
///
/// Nothing is logged or allocated between the two protection changes.
///
/// # Safety
///
/// `PermissionWrapper` relies on the size of the written bytes to determine how many pages to change write permissions,
/// pairing `PermissionWrapper` with a patcher that writes more memory than it is given is undefined behavior.
///
/// As always, casting a `&T` or `&mut T` to a `*mut u8` for use with `PermissionWrapper` can result in  undefined behavior because rust assumes `&T` will never change and `&mut T` will only be changed via that reference.
/// The `*mut u8` **MUST** be memory not tracked by Rust, or ensured that reading from and writing to data tracked by Rust will not trigger undefined behavior.
pub struct PermissionWrapper<P: Patcher> {
    /// Underlying patcher.
    patcher: P,
}
impl<P: Patcher> PermissionWrapper<P> {
    /// Creates a new PermissionWrapper
    pub fn new(patcher: P) -> Self {
        Self { patcher }
    }
}

unsafe impl<P> Patcher for PermissionWrapper<P>
where
    P: Patcher,
{
    type Error = PermissionError<P::Error>;

    unsafe fn write(&self, target: *mut u8, bytes: &[u8]) -> Result<(), Self::Error> {
        let len = bytes.len();
        // the guard puts the original protection back when it drops
        let guard = region::protect_with_handle(target, len, Protection::READ_WRITE_EXECUTE)
            .map_err(|source| PermissionError::ProtectionError {
                address: target as usize,
                len,
                source,
            })?;
        let written = self.patcher.write(target, bytes);
        drop(guard);
        flush_instruction_cache(target, len);
        written.map_err(PermissionError::CustomError)
    }
}

#[cfg(test)]
mod tests {
    use std::slice;

    use region::Protection;

    use crate::patcher::byte::BytePatcher;
    use crate::patcher::mem::PermissionWrapper;
    use crate::patcher::{Patcher, WriteError};
    use crate::test_util::CodeBuffer;

    #[test]
    /// Test write functionality on writable memory
    fn test_write() {
        let buffer = CodeBuffer::new(&[1, 2, 3, 4]);

        // create the patcher and wrapper
        let patcher = BytePatcher::new();
        let wrapper = PermissionWrapper::new(patcher);

        unsafe { wrapper.write(buffer.ptr(), &[4, 3, 2, 1]).unwrap() };
        assert_eq!(buffer.bytes(), [4, 3, 2, 1]);

        unsafe { wrapper.write(buffer.ptr(), &[1, 2, 3, 4]).unwrap() };
        assert_eq!(buffer.bytes(), [1, 2, 3, 4]);
    }

    #[test]
    /// Tests to ensure permissions are actually set
    fn test_perms() {
        // A fresh read-only mapping. Normally, writing to it would result in a segfault,
        // but PermissionWrapper changes the permissions to be writable so that no fault occurs
        let page = region::alloc(region::page::size(), Protection::READ).unwrap();
        let ptr = page.as_ptr::<u8>();
        let size = 4;

        // sanity check
        // make sure the data is what we expect and that the data is definitely read-only
        assert_eq!(unsafe { slice::from_raw_parts(ptr, size) }, [0, 0, 0, 0]);
        for region in region::query_range(ptr, size).unwrap() {
            let region = region.unwrap();
            assert!(!region.is_guarded());
            assert_eq!(region.protection(), Protection::READ);
        }

        let wrapper = PermissionWrapper::new(BytePatcher::new());

        unsafe { wrapper.write(ptr.cast_mut(), &[4, 3, 2, 1]).unwrap() };
        assert_eq!(unsafe { slice::from_raw_parts(ptr, size) }, [4, 3, 2, 1]);

        // make sure permissions reverted correctly after the write
        for region in region::query_range(ptr, size).unwrap() {
            let region = region.unwrap();
            assert!(!region.is_guarded());
            assert_eq!(region.protection(), Protection::READ);
        }

        // put the original data back
        unsafe { wrapper.write(ptr.cast_mut(), &[0, 0, 0, 0]).unwrap() };
        assert_eq!(unsafe { slice::from_raw_parts(ptr, size) }, [0, 0, 0, 0]);
        for region in region::query_range(ptr, size).unwrap() {
            let region = region.unwrap();
            assert_eq!(region.protection(), Protection::READ);
        }
    }

    #[test]
    /// Unmapped memory fails before anything is written
    fn test_unmapped() {
        let wrapper = PermissionWrapper::new(BytePatcher::new());
        // the zero page is never mapped
        let result = unsafe { wrapper.write(0x10 as *mut u8, &[0x90]) };
        let error: WriteError = result.unwrap_err().into();
        assert!(matches!(error, WriteError::Protection { address: 0x10, len: 1, .. }));
    }
}
