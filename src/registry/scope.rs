//! Plugin-scoped patch sets
//!
//! While a scope is entered, every patch created is appended to that scope's set. Tearing the scope
//! down later destroys whatever is still in the set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::PatchHandle;

/// Identifies one owner of scoped patches, usually a loaded plugin
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);
impl ScopeId {
    /// Allocates an id no other scope in this process has
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ScopeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}
impl Default for ScopeId {
    fn default() -> Self {
        Self::new()
    }
}

/// Sets of patches per scope, plus the scope patches currently land in
#[derive(Debug, Default)]
pub struct ScopedSets {
    /// Scope new patches are tracked under
    active: Option<ScopeId>,
    /// Tracked patches, in creation order
    sets: HashMap<ScopeId, Vec<PatchHandle>>,
}
impl ScopedSets {
    /// Makes `scope` the active one, returning the scope it replaced
    pub fn enter(&mut self, scope: ScopeId) -> Option<ScopeId> {
        self.sets.entry(scope).or_default();
        self.active.replace(scope)
    }

    /// Puts back the scope that was active before the matching [`ScopedSets::enter`]
    pub fn leave(&mut self, previous: Option<ScopeId>) {
        self.active = previous;
    }

    /// Scope new patches are tracked under
    pub fn active(&self) -> Option<ScopeId> {
        self.active
    }

    /// Tracks `handle` under the active scope, returning that scope
    pub fn track(&mut self, handle: PatchHandle) -> Option<ScopeId> {
        let scope = self.active?;
        self.sets.entry(scope).or_default().push(handle);
        Some(scope)
    }

    /// Stops tracking `handle` under `scope`
    pub fn untrack(&mut self, scope: ScopeId, handle: PatchHandle) {
        if let Some(set) = self.sets.get_mut(&scope) {
            set.retain(|&tracked| tracked != handle);
        }
    }

    /// Patches tracked under `scope`
    pub fn handles(&self, scope: ScopeId) -> &[PatchHandle] {
        self.sets.get(&scope).map(Vec::as_slice).unwrap_or_default()
    }

    /// Forgets `scope` once its set is empty
    pub fn close(&mut self, scope: ScopeId) {
        if self.sets.get(&scope).is_some_and(Vec::is_empty) {
            self.sets.remove(&scope);
        }
    }
}
