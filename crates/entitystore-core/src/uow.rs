//! Unit of work (C5).
//!
//! Tracks, per entity identifier, the state transitions a single session
//! applies within one logical unit of work, and resolves them into an
//! ordered [`CommitAttempt`] at commit time. See the module's transition
//! table in the crate's design notes for the full state machine.

use std::collections::HashMap;

use entitystore_types::{ConcurrencyToken, ConcurrencyTokenFactory, DomainEvent, EntityIdentifier, Revision};

use crate::error::Error;
use crate::load_result::{EntityLoadResult, NotFound};

/// The lifecycle state of one tracked entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedState {
    /// No longer part of the modifying set, but the entry is kept around so
    /// a later `store`/`delete` on the same id can reuse its allocated
    /// concurrency token, revision, and event list.
    Untracked,
    /// Loaded, observed, never mutated this unit of work.
    Unchanged,
    /// Observed absent; no mutation recorded yet.
    NonExistent,
    /// Will be stored as a brand-new row on commit.
    Created,
    /// Will be stored over an existing row on commit.
    Updated,
    /// Will be removed (or tombstoned) on commit.
    Deleted,
}

/// One entity's tracked state within a single unit of work.
#[derive(Debug, Clone)]
pub struct TrackedEntry<E> {
    pub identifier: EntityIdentifier,
    original_load_result: EntityLoadResult<E>,
    current_load_result: EntityLoadResult<E>,
    updated_concurrency_token: ConcurrencyToken,
    updated_revision: Option<Revision>,
    state: TrackedState,
    events: Vec<DomainEvent>,
    entity: Option<E>,
}

impl<E: Clone> TrackedEntry<E> {
    /// Builds a freshly observed entry. `original` is set once here and
    /// never overwritten for the life of the entry.
    pub fn new(
        identifier: EntityIdentifier,
        load_result: EntityLoadResult<E>,
        updated_concurrency_token: ConcurrencyToken,
        state: TrackedState,
    ) -> Self {
        Self {
            identifier,
            original_load_result: load_result.clone(),
            current_load_result: load_result,
            updated_concurrency_token,
            updated_revision: None,
            state,
            events: Vec::new(),
            entity: None,
        }
    }

    pub fn state(&self) -> TrackedState {
        self.state
    }

    pub fn original(&self) -> &EntityLoadResult<E> {
        &self.original_load_result
    }

    pub fn current(&self) -> &EntityLoadResult<E> {
        &self.current_load_result
    }

    pub fn updated_concurrency_token(&self) -> &ConcurrencyToken {
        &self.updated_concurrency_token
    }

    /// The revision this entry will commit at, if it has transitioned to a
    /// modifying state at least once. `None` for an entry still `Unchanged`
    /// or `NonExistent`.
    pub fn updated_revision(&self) -> Option<Revision> {
        self.updated_revision
    }

    pub fn events(&self) -> &[DomainEvent] {
        &self.events
    }

    pub fn entity(&self) -> Option<&E> {
        self.entity.as_ref()
    }

    fn original_revision(&self) -> Revision {
        self.original_load_result.revision()
    }

    fn ensure_updated_revision(&mut self) {
        if self.updated_revision.is_none() {
            self.updated_revision = Some(self.original_revision().next());
        }
    }
}

/// One operation a [`CommitAttempt`] asks the storage engine to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOperation {
    Store,
    Delete,
    /// Raises events against an id that has no corresponding *live* row —
    /// the one path allowed to touch storage without ever having had a
    /// `Found` row, per the unit of work's `NonExistent` + events case.
    /// The engine still persists/bumps a tombstone-shaped marker row for
    /// this operation, purely so repeated appends against the same id never
    /// reuse an `(revision, epoch)` pair.
    AppendEventsOnly,
}

/// One per-entity operation within a [`CommitAttempt`].
#[derive(Debug, Clone)]
pub struct CommitEntry<E> {
    pub id: EntityIdentifier,
    pub operation: CommitOperation,
    pub new_revision: Revision,
    pub new_concurrency_token: ConcurrencyToken,
    pub events: Vec<DomainEvent>,
    pub expected_revision: Revision,
    pub entity: Option<E>,
}

/// An ordered, ready-to-commit list of per-entity operations.
///
/// Order is preserved from unit-of-work insertion order; nothing downstream
/// may reorder entries.
#[derive(Debug, Clone, Default)]
pub struct CommitAttempt<E> {
    entries: Vec<CommitEntry<E>>,
}

impl<E> CommitAttempt<E> {
    pub fn new(entries: Vec<CommitEntry<E>>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[CommitEntry<E>] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<CommitEntry<E>> {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Maps every entry's entity payload through `f`, used by pipeline
    /// processors to narrow a concrete attempt-entry shape to a canonical
    /// one without disturbing ordering or the other entry fields.
    pub fn map_entities<F, E2>(self, mut f: F) -> CommitAttempt<E2>
    where
        F: FnMut(Option<E>) -> Option<E2>,
    {
        CommitAttempt {
            entries: self
                .entries
                .into_iter()
                .map(|entry| CommitEntry {
                    entity: f(entry.entity),
                    id: entry.id,
                    operation: entry.operation,
                    new_revision: entry.new_revision,
                    new_concurrency_token: entry.new_concurrency_token,
                    events: entry.events,
                    expected_revision: entry.expected_revision,
                })
                .collect(),
        }
    }
}

/// The outcome of a commit attempt: a plain value, never an `Err` (see the
/// crate's error-handling design — concurrency loss is expected, not a
/// fault).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityCommitResult {
    Success,
    ConcurrencyFailure,
}

/// Whatever accepts a finished [`CommitAttempt`] and turns it into a
/// result — the storage engine itself, or a [`crate::pipeline::CommitPipeline`]
/// wrapping it. Kept as a trait (rather than a concrete dependency on
/// [`crate::engine::StorageEngine`]) so the unit of work never needs to know
/// which of the two it is talking to.
#[async_trait::async_trait]
pub trait CommitAttemptHandler<E>: Send + Sync {
    async fn commit(&self, attempt: CommitAttempt<E>) -> Result<EntityCommitResult, Error>;
}

/// Per-session tracking of entities loaded, created, updated, and deleted.
pub struct UnitOfWork<E> {
    entries: HashMap<EntityIdentifier, TrackedEntry<E>>,
    order: Vec<EntityIdentifier>,
}

impl<E: Clone> Default for UnitOfWork<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone> UnitOfWork<E> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn get(&self, id: &EntityIdentifier) -> Option<&TrackedEntry<E>> {
        self.entries.get(id)
    }

    /// A snapshot of every identifier tracked this unit of work, in
    /// insertion order, regardless of tracked state.
    pub fn tracked_ids(&self) -> Vec<EntityIdentifier> {
        self.order.clone()
    }

    fn note_order(&mut self, id: &EntityIdentifier) {
        if !self.order.contains(id) {
            self.order.push(id.clone());
        }
    }

    fn fresh_nonexistent(id: &EntityIdentifier, factory: &dyn ConcurrencyTokenFactory) -> TrackedEntry<E> {
        let not_found = EntityLoadResult::NotFound(NotFound {
            id: id.clone(),
            loaded_from_cache: false,
            scope: String::new(),
        });
        not_found.as_tracked(factory)
    }

    /// Inserts a fresh `Unchanged`/`NonExistent` entry for `load_result` if
    /// none exists yet; replaces an `Untracked` entry with a fresh one while
    /// preserving its allocated token/revision/events; otherwise returns the
    /// existing entry untouched. Entry construction itself is
    /// [`EntityLoadResult::as_tracked`]; this method only decides when a
    /// fresh entry is needed and what of the old one survives.
    pub fn get_or_update(
        &mut self,
        load_result: EntityLoadResult<E>,
        factory: &dyn ConcurrencyTokenFactory,
    ) -> TrackedEntry<E> {
        let id = load_result.id().clone();
        self.note_order(&id);

        let entry = match self.entries.remove(&id) {
            None => load_result.as_tracked(factory),
            Some(existing) if existing.state == TrackedState::Untracked => {
                let mut fresh = load_result.as_tracked(factory);
                fresh.updated_concurrency_token = existing.updated_concurrency_token;
                fresh.updated_revision = existing.updated_revision;
                fresh.events = existing.events;
                fresh
            }
            Some(existing) => existing,
        };

        self.entries.insert(id, entry.clone());
        entry
    }

    /// Records a create/update, appending `new_events` and transitioning the
    /// entry per the unit of work's transition table.
    pub fn record_create_or_update(
        &mut self,
        id: EntityIdentifier,
        entity: E,
        new_events: Vec<DomainEvent>,
        factory: &dyn ConcurrencyTokenFactory,
    ) -> Result<TrackedState, Error> {
        self.note_order(&id);
        let existed = self.entries.contains_key(&id);
        let mut entry = if existed {
            self.entries.remove(&id).expect("just checked contains_key")
        } else {
            Self::fresh_nonexistent(&id, factory)
        };

        let new_state = match entry.state {
            TrackedState::Unchanged => TrackedState::Updated,
            TrackedState::NonExistent => TrackedState::Created,
            TrackedState::Created => TrackedState::Created,
            TrackedState::Updated => TrackedState::Updated,
            TrackedState::Deleted => TrackedState::Updated,
            TrackedState::Untracked => {
                return Err(Error::Argument(format!(
                    "cannot store {id}: entry is untracked (this happens after a create was cancelled by a delete in the same unit of work without an intervening load)"
                )))
            }
        };

        entry.events.extend(new_events);
        entry.entity = Some(entity);
        entry.state = new_state;
        entry.ensure_updated_revision();

        self.entries.insert(id, entry);
        Ok(new_state)
    }

    /// Records a delete, appending `new_events` and transitioning the entry
    /// per the unit of work's transition table. A `Created` entry being
    /// deleted drops out of the modifying set entirely (becomes
    /// `Untracked`) but keeps its allocated token/revision/events in case
    /// the same id is stored again within this unit of work.
    pub fn record_delete(
        &mut self,
        id: EntityIdentifier,
        new_events: Vec<DomainEvent>,
        factory: &dyn ConcurrencyTokenFactory,
    ) -> Result<TrackedState, Error> {
        self.note_order(&id);
        let existed = self.entries.contains_key(&id);
        let mut entry = if existed {
            self.entries.remove(&id).expect("just checked contains_key")
        } else {
            Self::fresh_nonexistent(&id, factory)
        };

        let new_state = match entry.state {
            TrackedState::Unchanged => TrackedState::Deleted,
            TrackedState::NonExistent => TrackedState::NonExistent,
            TrackedState::Created => TrackedState::Untracked,
            TrackedState::Updated => TrackedState::Deleted,
            TrackedState::Deleted => TrackedState::Deleted,
            TrackedState::Untracked => {
                return Err(Error::Argument(format!(
                    "cannot delete {id}: entry is untracked"
                )))
            }
        };

        entry.events.extend(new_events);
        entry.entity = None;
        if !matches!(new_state, TrackedState::Untracked | TrackedState::NonExistent) {
            entry.ensure_updated_revision();
        }
        entry.state = new_state;

        self.entries.insert(id, entry);
        Ok(new_state)
    }

    /// Clears every tracked entry, discarding all pending mutations.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Builds a [`CommitAttempt`] from entries in `Created`/`Updated`/
    /// `Deleted` state (plus `NonExistent` entries carrying events-only
    /// mutations), in unit-of-work insertion order.
    pub fn build_commit_attempt(&self) -> CommitAttempt<E> {
        let mut entries = Vec::new();
        for id in &self.order {
            let Some(entry) = self.entries.get(id) else { continue };
            match entry.state {
                TrackedState::Created | TrackedState::Updated => {
                    entries.push(CommitEntry {
                        id: entry.identifier.clone(),
                        operation: CommitOperation::Store,
                        new_revision: entry.updated_revision.unwrap_or_else(|| entry.original_revision().next()),
                        new_concurrency_token: entry.updated_concurrency_token.clone(),
                        events: entry.events.clone(),
                        expected_revision: entry.original_revision(),
                        entity: entry.entity.clone(),
                    });
                }
                TrackedState::Deleted => {
                    entries.push(CommitEntry {
                        id: entry.identifier.clone(),
                        operation: CommitOperation::Delete,
                        new_revision: entry.updated_revision.unwrap_or_else(|| entry.original_revision().next()),
                        new_concurrency_token: entry.updated_concurrency_token.clone(),
                        events: entry.events.clone(),
                        expected_revision: entry.original_revision(),
                        entity: None,
                    });
                }
                TrackedState::NonExistent if !entry.events.is_empty() => {
                    entries.push(CommitEntry {
                        id: entry.identifier.clone(),
                        operation: CommitOperation::AppendEventsOnly,
                        new_revision: Revision::NONE,
                        new_concurrency_token: entry.updated_concurrency_token.clone(),
                        events: entry.events.clone(),
                        expected_revision: Revision::NONE,
                        entity: None,
                    });
                }
                _ => {}
            }
        }
        CommitAttempt::new(entries)
    }

    /// Builds a commit attempt, hands it to `handler`, and unconditionally
    /// resets regardless of the outcome.
    pub async fn commit(&mut self, handler: &dyn CommitAttemptHandler<E>) -> Result<EntityCommitResult, Error>
    where
        E: Send + Sync + 'static,
    {
        let attempt = self.build_commit_attempt();
        let result = handler.commit(attempt).await;
        self.reset();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitystore_types::RandomConcurrencyTokenFactory;

    fn id(s: &str) -> EntityIdentifier {
        EntityIdentifier::new("widget", s).unwrap()
    }

    fn not_found(i: EntityIdentifier) -> EntityLoadResult<String> {
        EntityLoadResult::NotFound(NotFound {
            id: i,
            loaded_from_cache: false,
            scope: String::new(),
        })
    }

    #[test]
    fn create_then_delete_drops_the_entry_from_the_commit_attempt() {
        let factory = RandomConcurrencyTokenFactory;
        let mut uow: UnitOfWork<String> = UnitOfWork::new();
        let wid = id("1");

        uow.get_or_update(not_found(wid.clone()), &factory);
        uow.record_create_or_update(wid.clone(), "v1".into(), vec![], &factory)
            .unwrap();
        uow.record_delete(wid.clone(), vec![], &factory).unwrap();

        let attempt = uow.build_commit_attempt();
        assert!(attempt.is_empty());
        assert_eq!(uow.get(&wid).unwrap().state(), TrackedState::Untracked);
    }

    #[test]
    fn store_after_create_then_delete_reuses_the_allocated_token() {
        let factory = RandomConcurrencyTokenFactory;
        let mut uow: UnitOfWork<String> = UnitOfWork::new();
        let wid = id("1");

        uow.record_create_or_update(wid.clone(), "v1".into(), vec![], &factory)
            .unwrap();
        uow.record_delete(wid.clone(), vec![], &factory).unwrap();
        let token_before = uow.get(&wid).unwrap().updated_concurrency_token().clone();

        uow.get_or_update(not_found(wid.clone()), &factory);
        let token_after = uow.get(&wid).unwrap().updated_concurrency_token().clone();
        assert_eq!(token_before, token_after);
    }

    #[test]
    fn update_keeps_a_single_revision_bump_across_repeated_stores() {
        let factory = RandomConcurrencyTokenFactory;
        let mut uow: UnitOfWork<String> = UnitOfWork::new();
        let wid = id("1");

        uow.get_or_update(not_found(wid.clone()), &factory);
        uow.record_create_or_update(wid.clone(), "v1".into(), vec![], &factory)
            .unwrap();
        uow.record_create_or_update(wid.clone(), "v2".into(), vec![], &factory)
            .unwrap();

        let attempt = uow.build_commit_attempt();
        assert_eq!(attempt.len(), 1);
        assert_eq!(attempt.entries()[0].new_revision, Revision::new(1));
        assert_eq!(attempt.entries()[0].entity.as_deref(), Some("v2"));
    }

    #[test]
    fn commit_attempt_preserves_insertion_order() {
        let factory = RandomConcurrencyTokenFactory;
        let mut uow: UnitOfWork<String> = UnitOfWork::new();

        uow.record_create_or_update(id("b"), "b".into(), vec![], &factory).unwrap();
        uow.record_create_or_update(id("a"), "a".into(), vec![], &factory).unwrap();

        let attempt = uow.build_commit_attempt();
        let ids: Vec<_> = attempt.entries().iter().map(|e| e.id.id().to_string()).collect();
        assert_eq!(ids, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn events_only_on_nonexistent_entity_is_emitted_as_append_events_only() {
        let factory = RandomConcurrencyTokenFactory;
        let mut uow: UnitOfWork<String> = UnitOfWork::new();
        let wid = id("1");

        uow.get_or_update(not_found(wid.clone()), &factory);
        uow.record_delete(wid.clone(), vec![DomainEvent::new("Noop", vec![])], &factory)
            .unwrap();

        let attempt = uow.build_commit_attempt();
        assert_eq!(attempt.len(), 1);
        assert_eq!(attempt.entries()[0].operation, CommitOperation::AppendEventsOnly);
    }

    #[test]
    fn reset_clears_every_tracked_entry() {
        let factory = RandomConcurrencyTokenFactory;
        let mut uow: UnitOfWork<String> = UnitOfWork::new();
        uow.record_create_or_update(id("1"), "v".into(), vec![], &factory).unwrap();
        uow.reset();
        assert!(uow.get(&id("1")).is_none());
        assert!(uow.build_commit_attempt().is_empty());
    }
}
