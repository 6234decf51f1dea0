//! # Registry
//!
//! Name- and hash-addressable storage of live function patches.
//!
//! Each patch has exactly one of its original bytes or its jump in place at any time. Creating a
//! patch installs the jump immediately, disabling puts the original bytes back and enabling
//! writes the same jump again. Destroying a patch disables it first.
//!
//! The registry does no locking of its own: callers serialize calls touching the same target.

use std::collections::HashMap;
use std::slice;

use tracing::{debug, warn};

use crate::code::x86::length;
use crate::code::x86::Jump;
use crate::error::PatchError;
use crate::hook::jmphook::JmpHook;
use crate::hook::HookError;
use crate::patcher::Patcher;

use self::arena::{Arena, Index};
use self::scope::{ScopeId, ScopedSets};

pub mod arena;
pub mod scope;

/// Opaque reference to a patch in a [`PatchRegistry`]
///
/// Handles of destroyed patches stay stale forever, even once their slot is reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PatchHandle(pub(crate) Index);

/// Options for [`PatchRegistry::create`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Rewrite this many bytes instead of resolving the length from the code
    ///
    /// Only needed when the resolver doesn't know an instruction in the way. The count must cover
    /// whole instructions; nothing checks that it does.
    pub rewrite_len: Option<usize>,
}
impl CreateOptions {
    /// Options forcing the rewrite length
    pub fn rewrite_len(len: usize) -> Self {
        Self {
            rewrite_len: Some(len),
        }
    }
}

/// A live patch
#[derive(Debug)]
pub struct PatchRecord {
    /// Unique identifier, also the display name
    name: String,
    /// Hash of `name`
    hash: u32,
    /// First byte being overwritten
    target: usize,
    /// Where the jump goes
    destination: usize,
    /// Original bytes at `target`
    saved: Box<[u8]>,
    /// Jump bytes, same length as `saved`
    jump: Box<[u8]>,
    /// Whether the jump is in place
    active: bool,
    /// Scope that destroys this patch when torn down
    scope: Option<ScopeId>,
}
impl PatchRecord {
    /// Identifier of the patch
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hash of the identifier
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Address of the first overwritten byte
    pub fn target(&self) -> usize {
        self.target
    }

    /// Address execution is redirected to
    pub fn destination(&self) -> usize {
        self.destination
    }

    /// Bytes that were at the target before patching
    pub fn saved_bytes(&self) -> &[u8] {
        &self.saved
    }

    /// Bytes written while the patch is active
    pub fn jump_bytes(&self) -> &[u8] {
        &self.jump
    }

    /// Number of bytes rewritten
    pub fn len(&self) -> usize {
        self.saved.len()
    }

    /// Whether the jump is currently installed
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Scope the patch was created in
    pub fn scope(&self) -> Option<ScopeId> {
        self.scope
    }

    /// Whether `[start, start + len)` overlaps the rewritten bytes
    fn overlaps(&self, start: usize, len: usize) -> bool {
        start < self.target + self.len() && self.target < start + len
    }
}

/// 32-bit FNV-1a of an identifier
pub fn name_hash(name: &str) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    name.bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u32::from(byte)).wrapping_mul(PRIME))
}

/// Every live patch, addressable by handle, name and hash
pub struct PatchRegistry<P: Patcher> {
    /// Writes and removes jumps
    hook: JmpHook<P>,
    /// Patch records
    records: Arena<PatchRecord>,
    /// Identifier lookup
    by_name: HashMap<String, PatchHandle>,
    /// Hash lookup, identifiers may collide
    by_hash: HashMap<u32, Vec<PatchHandle>>,
    /// Single-shot rewrite length for the next create
    forced_len: Option<usize>,
    /// Plugin-scoped patch sets
    scopes: ScopedSets,
}
impl<P: Patcher> PatchRegistry<P> {
    /// Creates an empty registry writing through `patcher`
    pub fn new(patcher: P) -> Self {
        Self {
            hook: JmpHook::new(patcher),
            records: Arena::new(),
            by_name: HashMap::new(),
            by_hash: HashMap::new(),
            forced_len: None,
            scopes: ScopedSets::default(),
        }
    }

    /// Traces every install and restore when on. Never changes what is written.
    pub fn set_debug(&mut self, debug: bool) {
        self.hook.set_debug(debug);
    }

    /// Whether installs and restores are traced
    pub fn is_debug(&self) -> bool {
        self.hook.is_debug()
    }

    /// Forces the rewrite length of the next [`PatchRegistry::create`] call, whatever its outcome
    ///
    /// Prefer [`CreateOptions::rewrite_len`]: this override is consumed by whichever create comes next,
    /// so it isn't safe to use from independent callers.
    pub fn set_forced_rewrite_len(&mut self, len: usize) {
        self.forced_len = Some(len);
    }

    /// Redirects execution from `target` to `destination`
    ///
    /// The jump is written before this returns. If anything fails, no bytes are changed and nothing
    /// is recorded. A pending forced rewrite length is consumed either way.
    ///
    /// # Safety
    ///
    /// - `target` must point to code that stays mapped for as long as the patch exists, readable for
    ///   the rewrite length plus 14 bytes
    /// - `destination` must be code that can take over from `target`
    /// - The rewritten instructions must not be running on another thread while they are replaced
    pub unsafe fn create(
        &mut self,
        target: *const u8,
        destination: *const u8,
        name: &str,
        options: CreateOptions,
    ) -> Result<PatchHandle, PatchError> {
        let forced = self.forced_len.take();
        let forced = options.rewrite_len.or(forced);

        if name.is_empty() {
            return Err(PatchError::EmptyIdentifier);
        }
        if self.by_name.contains_key(name) {
            return Err(PatchError::DuplicateIdentifier(name.to_owned()));
        }

        let address = target as usize;
        let required = Jump::route(address, destination as usize, self.hook.mode()).len();
        let len = match forced {
            Some(len) if len < required => {
                return Err(HookError::RewriteTooShort { len, required }.into())
            }
            Some(len) => len,
            None => length::resolve(target, required, self.hook.mode())?,
        };

        if let Some((_, owner)) = self.records.iter().find(|(_, r)| r.overlaps(address, len)) {
            return Err(PatchError::AddressInUse {
                address,
                owner: owner.name.clone(),
            });
        }

        let installed = self.hook.install(target as *mut u8, len, destination)?;

        let hash = name_hash(name);
        let handle = PatchHandle(self.records.insert(PatchRecord {
            name: name.to_owned(),
            hash,
            target: address,
            destination: destination as usize,
            saved: installed.saved,
            jump: installed.jump,
            active: true,
            scope: None,
        }));
        self.by_name.insert(name.to_owned(), handle);
        self.by_hash.entry(hash).or_default().push(handle);
        let scope = self.scopes.track(handle);
        if let Some(record) = self.records.get_mut(handle.0) {
            record.scope = scope;
        }

        debug!(patch = name, address = %format!("{address:#x}"), len, ?scope, "created patch");
        Ok(handle)
    }

    /// Looks up the record behind `handle`
    pub fn get(&self, handle: PatchHandle) -> Option<&PatchRecord> {
        self.records.get(handle.0)
    }

    /// Looks up the record behind `handle`, failing on stale handles
    fn record(&self, handle: PatchHandle) -> Result<&PatchRecord, PatchError> {
        self.get(handle).ok_or(PatchError::StaleHandle(handle))
    }

    /// Finds a patch by identifier
    pub fn find_by_name(&self, name: &str) -> Option<PatchHandle> {
        self.by_name.get(name).copied()
    }

    /// Finds the first patch whose identifier hashes to `hash`
    pub fn find_by_hash(&self, hash: u32) -> Option<PatchHandle> {
        self.by_hash.get(&hash).and_then(|handles| handles.first()).copied()
    }

    /// Whether the jump of `handle` is in place
    pub fn is_patched(&self, handle: PatchHandle) -> Result<bool, PatchError> {
        self.record(handle).map(PatchRecord::is_active)
    }

    /// Identifier of `handle`
    pub fn name(&self, handle: PatchHandle) -> Result<&str, PatchError> {
        self.record(handle).map(PatchRecord::name)
    }

    /// Identifier hash of `handle`
    pub fn hash(&self, handle: PatchHandle) -> Result<u32, PatchError> {
        self.record(handle).map(PatchRecord::hash)
    }

    /// Puts the jump of an inactive patch back
    ///
    /// Does nothing if the patch is already active. Fails with [`PatchError::ByteMismatch`] if the
    /// bytes at the target are no longer the saved originals, leaving them alone.
    pub fn enable(&mut self, handle: PatchHandle) -> Result<(), PatchError> {
        let record = self.record(handle)?;
        if record.active {
            return Ok(());
        }
        // Safety: `create` requires the target to stay mapped for the lifetime of the record
        let current = unsafe { slice::from_raw_parts(record.target as *const u8, record.len()) };
        if current != record.saved_bytes() {
            warn!(patch = %record.name, address = %format!("{:#x}", record.target), "original bytes changed, not enabling");
            return Err(PatchError::ByteMismatch {
                name: record.name.clone(),
                address: record.target,
            });
        }
        unsafe {
            self.hook
                .reinstall(record.target as *mut u8, &record.jump)
                .map_err(into_write_error)?;
        }
        if let Some(record) = self.records.get_mut(handle.0) {
            record.active = true;
        }
        Ok(())
    }

    /// Puts the original bytes of an active patch back without forgetting the patch
    ///
    /// Does nothing if the patch is already inactive.
    pub fn disable(&mut self, handle: PatchHandle) -> Result<(), PatchError> {
        let record = self.record(handle)?;
        if !record.active {
            return Ok(());
        }
        // Safety: `create` requires the target to stay mapped for the lifetime of the record
        unsafe {
            self.hook
                .restore(record.target as *mut u8, &record.saved)
                .map_err(into_write_error)?;
        }
        if let Some(record) = self.records.get_mut(handle.0) {
            record.active = false;
        }
        Ok(())
    }

    /// Disables and forgets a patch, permanently restoring its original bytes
    ///
    /// Returns `Ok(false)` for stale handles. If the original bytes can't be written back, the
    /// patch is kept so the call can be retried.
    pub fn destroy(&mut self, handle: PatchHandle) -> Result<bool, PatchError> {
        if !self.records.contains(handle.0) {
            return Ok(false);
        }
        self.disable(handle)?;
        let Some(record) = self.records.remove(handle.0) else {
            return Ok(false);
        };
        self.by_name.remove(&record.name);
        if let Some(handles) = self.by_hash.get_mut(&record.hash) {
            handles.retain(|&h| h != handle);
            if handles.is_empty() {
                self.by_hash.remove(&record.hash);
            }
        }
        if let Some(scope) = record.scope {
            self.scopes.untrack(scope, handle);
        }
        debug!(patch = %record.name, "destroyed patch");
        Ok(true)
    }

    /// Destroys every patch
    ///
    /// Keeps going past patches that can't be restored; those stay registered and the first error is returned.
    pub fn destroy_all(&mut self) -> Result<(), PatchError> {
        let mut first_error = None;
        for index in self.records.indices() {
            if let Err(e) = self.destroy(PatchHandle(index)) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Makes `scope` the scope new patches are tracked under, returning the one it replaced
    pub fn enter_scope(&mut self, scope: ScopeId) -> Option<ScopeId> {
        self.scopes.enter(scope)
    }

    /// Reactivates the scope returned by the matching [`PatchRegistry::enter_scope`]
    pub fn leave_scope(&mut self, previous: Option<ScopeId>) {
        self.scopes.leave(previous);
    }

    /// Scope new patches are currently tracked under
    pub fn active_scope(&self) -> Option<ScopeId> {
        self.scopes.active()
    }

    /// Patches still tracked under `scope`
    pub fn scope_handles(&self, scope: ScopeId) -> &[PatchHandle] {
        self.scopes.handles(scope)
    }

    /// Destroys every patch still tracked under `scope`, returning how many went
    ///
    /// Keeps going past patches that can't be restored; those stay tracked and the first error is returned.
    pub fn destroy_scope(&mut self, scope: ScopeId) -> Result<usize, PatchError> {
        let handles = self.scopes.handles(scope).to_vec();
        let mut destroyed = 0;
        let mut first_error = None;
        for handle in handles {
            match self.destroy(handle) {
                Ok(true) => destroyed += 1,
                Ok(false) => self.scopes.untrack(scope, handle),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                self.scopes.close(scope);
                Ok(destroyed)
            }
        }
    }

    /// Number of live patches
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no patches are live
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates over live patches
    pub fn iter(&self) -> impl Iterator<Item = (PatchHandle, &PatchRecord)> {
        self.records.iter().map(|(index, record)| (PatchHandle(index), record))
    }
}
impl<P: Patcher> Drop for PatchRegistry<P> {
    fn drop(&mut self) {
        for (_, record) in self.records.iter().filter(|(_, r)| r.active) {
            // Safety: `create` requires the target to stay mapped for the lifetime of the record
            let _ = unsafe { self.hook.restore(record.target as *mut u8, &record.saved) };
        }
    }
}

/// Write failures while toggling surface as [`PatchError::MemoryProtection`]
fn into_write_error(e: HookError) -> PatchError {
    match e {
        HookError::Write(e) => PatchError::MemoryProtection(e),
        e => PatchError::Install(e),
    }
}
