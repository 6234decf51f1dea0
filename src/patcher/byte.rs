//! This module contains a byte patcher

use std::convert::Infallible;
use std::{mem, ptr};

use super::Patcher;

/// Patcher for writing byte arrays straight into memory.
/// This patcher never fails.
///
/// Writes that are exactly one aligned machine word go out as a single store, so threads running through
/// the target never see half of the new bytes.
#[derive(Default)]
pub struct BytePatcher;
impl BytePatcher {
    /// Creates a new [`BytePatcher`]
    pub fn new() -> Self {
        Self::default()
    }
}
unsafe impl Patcher for BytePatcher {
    type Error = Infallible;

    unsafe fn write(&self, target: *mut u8, bytes: &[u8]) -> Result<(), Self::Error> {
        let address = target as usize;
        match bytes.len() {
            2 if address % 2 == 0 => {
                ptr::write_volatile(target.cast::<u16>(), u16::from_ne_bytes([bytes[0], bytes[1]]))
            }
            4 if address % 4 == 0 => ptr::write_volatile(
                target.cast::<u32>(),
                u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            ),
            8 if address % 8 == 0 && mem::size_of::<usize>() == 8 => {
                let mut word = [0; 8];
                word.copy_from_slice(bytes);
                ptr::write_volatile(target.cast::<u64>(), u64::from_ne_bytes(word))
            }
            // Safety: caller must ensure that `target` is writable for the full length of `bytes`
            _ => ptr::copy_nonoverlapping(bytes.as_ptr(), target, bytes.len()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::patcher::byte::BytePatcher;
    use crate::patcher::Patcher;
    use crate::test_util::CodeBuffer;

    #[test]
    /// Test write functionality
    fn test_write() {
        let buffer = CodeBuffer::new(&[1, 2, 3, 4]);

        // sanity check
        assert_eq!(buffer.bytes(), [1, 2, 3, 4]);

        // patch the buffer's data
        let patcher = BytePatcher::new();
        unsafe { patcher.write(buffer.ptr(), &[4, 3, 2, 1]).unwrap() };

        // make sure the data was actually changed
        assert_eq!(buffer.bytes(), [4, 3, 2, 1]);
    }

    #[test]
    /// Tests a partial write of a block to ensure we're not overwriting outside the patch area
    fn test_partial_write() {
        let buffer = CodeBuffer::new(&[1, 2, 3, 4]);

        let patcher = BytePatcher::new();
        unsafe { patcher.write(buffer.ptr().add(1), &[5, 5]).unwrap() };

        assert_eq!(buffer.bytes(), [1, 5, 5, 4]);
    }

    #[test]
    /// Aligned word-sized writes land the same as byte copies
    fn test_word_write() {
        let buffer = CodeBuffer::new(&[0; 24]);
        let base = buffer.ptr();
        let offset = base.align_offset(8);

        let patcher = BytePatcher::new();
        unsafe {
            patcher
                .write(base.add(offset), &[1, 2, 3, 4, 5, 6, 7, 8])
                .unwrap();
            patcher.write(base.add(offset + 9), &[9, 9, 9, 9, 9]).unwrap();
        }

        let bytes = buffer.bytes();
        assert_eq!(bytes[offset..offset + 8], [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(bytes[offset + 8], 0);
        assert_eq!(bytes[offset + 9..offset + 14], [9, 9, 9, 9, 9]);
    }
}
