//! Query-result scope (C2).
//!
//! A [`Scope`] memoizes *original entity* → *scope-local deep clone* so that
//! two sessions reading the same row never share mutable state. Re-scoping
//! a value seen before returns the same clone rather than a fresh one,
//! which is what makes re-presenting a tracked entry idempotent.
//!
//! Memoization here is keyed by [`EntityIdentifier`] rather than by
//! reference identity: every entity value that reaches a scope already
//! arrived as an owned, independently-deserialized value, so there is no
//! pointer identity to key on in the first place.

use std::collections::HashMap;

use parking_lot::Mutex;

use entitystore_types::EntityIdentifier;

/// The scope name stamped onto load results that live in the engine's
/// revision cache, before a session scopes them to its own [`Scope`].
pub const GLOBAL_SCOPE_NAME: &str = "global";

/// A per-session entity scope.
pub struct Scope<E> {
    name: String,
    memo: Mutex<HashMap<EntityIdentifier, E>>,
}

impl<E: Clone> Scope<E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the scope-local clone of `original`, memoizing it the first
    /// time `id` is presented.
    pub fn scope_entity(&self, id: &EntityIdentifier, original: &E) -> E {
        let mut memo = self.memo.lock();
        memo.entry(id.clone()).or_insert_with(|| original.clone()).clone()
    }

    /// Clears every memoized clone, matching the session reset performed on
    /// rollback.
    pub fn reset(&self) {
        self.memo.lock().clear();
    }
}

/// The singleton global scope used by the engine's revision cache: every
/// call returns a fresh deep clone, with no memoization, since cache
/// entries must never share mutable state with any session's copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalScope;

impl GlobalScope {
    pub fn scope_entity<E: Clone>(&self, original: &E) -> E {
        original.clone()
    }
}
