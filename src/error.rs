//! Errors returned by patch registry operations

use thiserror::Error;

use crate::code::x86::length::LengthError;
use crate::hook::HookError;
use crate::patcher::WriteError;
use crate::registry::PatchHandle;

/// Everything that can go wrong creating, toggling or destroying a patch
///
/// Every failure leaves the registry as it was before the call.
#[derive(Debug, Error)]
pub enum PatchError {
    /// The resolver couldn't find a safe rewrite length; retry with a forced length
    #[error("failed to resolve rewrite length: {0}")]
    Resolution(#[from] LengthError),
    /// The jump couldn't be written at creation time
    #[error("failed to install patch: {0}")]
    Install(#[from] HookError),
    /// The target couldn't be written while enabling or disabling
    #[error("memory protection failed: {0}")]
    MemoryProtection(#[source] WriteError),
    /// The bytes at the target aren't the ones saved at creation, someone else patched it
    #[error("bytes at {address:#x} no longer match the original code of `{name}`")]
    ByteMismatch {
        /// Identifier of the patch
        name: String,
        /// Target of the patch
        address: usize,
    },
    /// A patch with this identifier already exists
    #[error("a patch named `{0}` already exists")]
    DuplicateIdentifier(String),
    /// The target range overlaps a live patch
    #[error("{address:#x} is already patched by `{owner}`")]
    AddressInUse {
        /// Target of the rejected patch
        address: usize,
        /// Identifier of the live patch covering it
        owner: String,
    },
    /// Identifiers can't be empty
    #[error("patch identifiers can't be empty")]
    EmptyIdentifier,
    /// The handle's patch has been destroyed
    #[error("stale patch handle {0:?}")]
    StaleHandle(PatchHandle),
}
impl PatchError {
    /// Whether the caller can fix the request and retry
    ///
    /// Resolution failures take a forced length, identifier and address clashes take a different
    /// name or target, and byte mismatches go away once the other writer is gone.
    pub fn is_recoverable(&self) -> bool {
        match self {
            PatchError::Resolution(_)
            | PatchError::ByteMismatch { .. }
            | PatchError::DuplicateIdentifier(_)
            | PatchError::AddressInUse { .. }
            | PatchError::EmptyIdentifier => true,
            PatchError::Install(HookError::RewriteTooShort { .. }) => true,
            PatchError::Install(HookError::Write(_))
            | PatchError::MemoryProtection(_)
            | PatchError::StaleHandle(_) => false,
        }
    }
}
