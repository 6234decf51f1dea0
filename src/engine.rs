//! # Engine
//!
//! Process-wide patch registry behind free functions.
//!
//! The registry is created on first use and writes through a [`PermissionWrapper`], so patching
//! read-only code works out of the box. Every call takes a global lock; callers must still
//! serialize calls involving the same target themselves, and keep other threads out of the
//! patched code while it is being rewritten.

use std::sync::{Mutex, MutexGuard, PoisonError};

use lazy_static::lazy_static;

use crate::error::PatchError;
use crate::hook::FunctionPointer;
use crate::patcher::byte::BytePatcher;
use crate::patcher::mem::PermissionWrapper;
use crate::registry::{CreateOptions, PatchHandle, PatchRegistry};

/// Patcher used by the process-wide registry
pub type DefaultPatcher = PermissionWrapper<BytePatcher>;

lazy_static! {
    static ref ENGINE: Mutex<PatchRegistry<DefaultPatcher>> =
        Mutex::new(PatchRegistry::new(PermissionWrapper::new(BytePatcher::new())));
}

/// Locks the registry, ignoring poisoning: every registry operation leaves it consistent
fn lock() -> MutexGuard<'static, PatchRegistry<DefaultPatcher>> {
    ENGINE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs `f` with exclusive access to the process-wide registry
///
/// Calling any other function of this module from `f` deadlocks.
pub fn with_registry<R>(f: impl FnOnce(&mut PatchRegistry<DefaultPatcher>) -> R) -> R {
    f(&mut lock())
}

/// Turns tracing of every install and restore on or off
pub fn set_debug(debug: bool) {
    lock().set_debug(debug);
}

/// Whether installs and restores are traced
pub fn is_debug() -> bool {
    lock().is_debug()
}

/// Forces the rewrite length of the next create, see [`PatchRegistry::set_forced_rewrite_len`]
pub fn set_forced_rewrite_len(len: usize) {
    lock().set_forced_rewrite_len(len);
}

/// Redirects `target` to `destination` under `name`
///
/// # Safety
///
/// See [`PatchRegistry::create`]
pub unsafe fn create(target: *const u8, destination: *const u8, name: &str) -> Result<PatchHandle, PatchError> {
    create_with(target, destination, name, CreateOptions::default())
}

/// Redirects `target` to `destination` under `name` with explicit options
///
/// # Safety
///
/// See [`PatchRegistry::create`]
pub unsafe fn create_with(
    target: *const u8,
    destination: *const u8,
    name: &str,
    options: CreateOptions,
) -> Result<PatchHandle, PatchError> {
    lock().create(target, destination, name, options)
}

/// Redirects calls of `original` to `replacement`
///
/// # Safety
///
/// See [`PatchRegistry::create`]. `replacement` should have the signature of `original`, calls of
/// `original` land in it with their arguments untouched.
pub unsafe fn create_fn_patch<F: FunctionPointer>(
    original: F,
    replacement: F,
    name: &str,
) -> Result<PatchHandle, PatchError> {
    create(original.to_ptr(), replacement.to_ptr(), name)
}

/// Disables and forgets a patch, `false` if the handle is stale
pub fn destroy(handle: PatchHandle) -> Result<bool, PatchError> {
    lock().destroy(handle)
}

/// Finds a patch by identifier
pub fn find_by_name(name: &str) -> Option<PatchHandle> {
    lock().find_by_name(name)
}

/// Finds a patch by identifier hash
pub fn find_by_hash(hash: u32) -> Option<PatchHandle> {
    lock().find_by_hash(hash)
}

/// Reinstalls the jump of a disabled patch
pub fn enable(handle: PatchHandle) -> Result<(), PatchError> {
    lock().enable(handle)
}

/// Puts the original bytes of a patch back, keeping the patch
pub fn disable(handle: PatchHandle) -> Result<(), PatchError> {
    lock().disable(handle)
}

/// Whether the jump of a patch is in place
pub fn is_patched(handle: PatchHandle) -> Result<bool, PatchError> {
    lock().is_patched(handle)
}

/// Identifier hash of a patch
pub fn hash(handle: PatchHandle) -> Result<u32, PatchError> {
    lock().hash(handle)
}

/// Identifier of a patch
pub fn name(handle: PatchHandle) -> Result<String, PatchError> {
    lock().name(handle).map(str::to_owned)
}

/// Destroys every patch, restoring all patched code
pub fn shutdown() -> Result<(), PatchError> {
    lock().destroy_all()
}
