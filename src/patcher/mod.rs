//! # Patcher
//!
//! This module covers patchers, the only code allowed to write over process memory.
//! Patchers don't remember anything: saving and restoring original bytes is up to their callers.

use std::convert::Infallible;

use thiserror::Error;

pub mod byte;
pub mod mem;

/// Writes bytes over a location in memory
///
/// # Safety
///
/// Patchers are inherently unsafe. The implementor must ensure that `write` either changes all of `bytes.len()`
/// bytes at the target or none of them, and never touches memory outside of that range.
pub unsafe trait Patcher {
    /// Error type that can occur when writing. If writing always succeeds, use [`Infallible`].
    type Error: Into<WriteError>;

    /// Writes `bytes` at `target`
    ///
    /// # Safety
    ///
    /// `target` must be [https://doc.rust-lang.org/stable/std/ptr/index.html#safety](valid) for the full length of `bytes`,
    /// and must be writable in whatever way the patcher requires
    unsafe fn write(&self, target: *mut u8, bytes: &[u8]) -> Result<(), Self::Error>;
}

/// Errors surfaced by any patcher
#[derive(Debug, Error)]
pub enum WriteError {
    /// The page(s) holding the target couldn't be made writable
    #[error("failed to make {len} bytes at {address:#x} writable")]
    Protection {
        /// First byte of the write
        address: usize,
        /// Length of the write
        len: usize,
        /// Error from the OS
        #[source]
        source: region::Error,
    },
}
impl From<Infallible> for WriteError {
    fn from(e: Infallible) -> Self {
        match e {}
    }
}
