//! Storage engine (C4).
//!
//! Bridges domain-level load/commit operations to a [`Database`]. Owns the
//! in-memory revision cache and runs the commit algorithm described in the
//! crate's design notes: a cache pre-check, a transactional apply loop that
//! retries on optimistic-concurrency loss, and post-commit event dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{once, BoxStream};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use entitystore_types::{Epoch, EntityIdentifier, Revision, StoredDomainEventBatch, StoredEntity};

use crate::database::{Database, DatabaseScope};
use crate::dispatch::{EventDispatcher, EventSink};
use crate::error::Error;
use crate::load_result::{EntityLoadResult, Found, NotFound};
use crate::scope::GLOBAL_SCOPE_NAME;
use crate::uow::{CommitAttempt, CommitAttemptHandler, CommitEntry, CommitOperation, EntityCommitResult};

/// Configuration for one [`StorageEngine`] instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    scope: String,
    synchronous_event_dispatch: bool,
    initial_dispatch_failure_delay: Duration,
    max_dispatch_failure_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineConfig {
    /// Sane defaults: no data-partition scope, asynchronous dispatch,
    /// 50ms initial backoff bounded at 30s.
    pub fn new() -> Self {
        Self {
            scope: String::new(),
            synchronous_event_dispatch: false,
            initial_dispatch_failure_delay: Duration::from_millis(50),
            max_dispatch_failure_delay: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    #[must_use]
    pub fn with_synchronous_event_dispatch(mut self, synchronous: bool) -> Self {
        self.synchronous_event_dispatch = synchronous;
        self
    }

    #[must_use]
    pub fn with_initial_dispatch_delay(mut self, delay: Duration) -> Self {
        self.initial_dispatch_failure_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_dispatch_delay(mut self, delay: Duration) -> Self {
        self.max_dispatch_failure_delay = delay;
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn synchronous_event_dispatch(&self) -> bool {
        self.synchronous_event_dispatch
    }
}

#[derive(Clone)]
struct CacheEntry<E> {
    load_result: EntityLoadResult<E>,
    epoch: Epoch,
}

/// The storage engine. Shared across entity storage sessions; its revision
/// cache is protected by a single mutex with critical sections bounded to
/// hashmap access, per the crate's concurrency model.
pub struct StorageEngine<E, D> {
    database: Arc<D>,
    cache: Mutex<HashMap<EntityIdentifier, CacheEntry<E>>>,
    dispatcher: Arc<EventDispatcher<D>>,
    config: EngineConfig,
    cancellation: CancellationToken,
    disposed: AtomicBool,
}

impl<E, D> StorageEngine<E, D>
where
    E: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    D: Database + 'static,
{
    pub fn new(database: Arc<D>, sink: Arc<dyn EventSink>, config: EngineConfig) -> Self {
        let cancellation = CancellationToken::new();
        let dispatcher = Arc::new(EventDispatcher::new(
            database.clone(),
            sink,
            config.initial_dispatch_failure_delay,
            config.max_dispatch_failure_delay,
            cancellation.clone(),
        ));
        Self {
            database,
            cache: Mutex::new(HashMap::new()),
            dispatcher,
            config,
            cancellation,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_not_disposed(&self) -> Result<(), Error> {
        if self.is_disposed() {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }

    /// Drains every pending event batch in the engine's configured scope.
    /// Called once at startup; a failure to even enumerate the outbox
    /// disposes the engine immediately, since a half-initialized engine
    /// must not accept work.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), Error> {
        self.ensure_not_disposed()?;
        match self.dispatcher.pending_batches(&self.config.scope).await {
            Ok(batches) => {
                debug!(count = batches.len(), "draining pending event batches at startup");
                self.enqueue_batches(batches).await
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to enumerate the outbox at startup, disposing engine");
                self.dispose();
                Err(Error::Database(err))
            }
        }
    }

    /// Cancels all in-flight operations and marks the engine disposed;
    /// every subsequent call fails with [`Error::Disposed`].
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.cancellation.cancel();
    }

    /// Loads one entity by identifier.
    #[instrument(skip(self), fields(%id, bypass_cache))]
    pub async fn query_entity(&self, id: &EntityIdentifier, bypass_cache: bool) -> Result<EntityLoadResult<E>, Error> {
        self.ensure_not_disposed()?;

        if !bypass_cache {
            if let Some(hit) = self.cache.lock().get(id).cloned() {
                debug!("cache hit");
                return Ok(hit.load_result.as_cached(true));
            }
        }

        debug!("reading through to the database");
        let row = self
            .database
            .get_one(id.type_tag(), id.id(), &self.config.scope)
            .await
            .map_err(Error::Database)?;
        let (result, epoch) = self.load_result_from_row(id, row)?;
        self.overwrite_cache(id, result.clone(), epoch);
        Ok(result)
    }

    /// Streams every live (not marked-as-deleted) entity of `entity_type`.
    /// Every emission refreshes the cache, matching the single-entity path.
    pub fn query_entities<'a>(&'a self, entity_type: &str, bypass_cache: bool) -> BoxStream<'a, Result<Found<E>, Error>> {
        let _ = bypass_cache; // enumeration always consults the database; there is no cached listing to reuse.
        if let Err(err) = self.ensure_not_disposed() {
            return Box::pin(once(async move { Err(err) }));
        }

        let entity_type = entity_type.to_string();
        let scope = self.config.scope.clone();

        Box::pin(async_stream::stream! {
            let mut rows = self.database.get_all(&entity_type, &scope);
            while let Some(row) = rows.next().await {
                let row = match row {
                    Ok(row) => row,
                    Err(e) => {
                        yield Err(Error::Database(e));
                        continue;
                    }
                };
                if row.is_marked_as_deleted {
                    continue;
                }
                let id = match EntityIdentifier::new(row.entity_type.clone(), row.entity_id.clone()) {
                    Ok(id) => id,
                    Err(e) => {
                        yield Err(Error::InvalidArgument(e));
                        continue;
                    }
                };
                let found = match self.decode_found(&id, &row) {
                    Ok(found) => found,
                    Err(e) => {
                        yield Err(e);
                        continue;
                    }
                };
                self.overwrite_cache(&id, EntityLoadResult::Found(found.clone()), row.epoch);
                yield Ok(found);
            }
        })
    }

    /// Atomically applies a [`CommitAttempt`], per the engine's commit
    /// algorithm: a cache pre-check, a transactional apply loop retried on
    /// optimistic-concurrency loss, and post-commit cache refresh plus event
    /// dispatch.
    #[instrument(skip(self, attempt), fields(entries = attempt.len()))]
    pub async fn commit(&self, attempt: CommitAttempt<E>) -> Result<EntityCommitResult, Error> {
        self.ensure_not_disposed()?;
        if attempt.is_empty() {
            return Ok(EntityCommitResult::Success);
        }

        // Step 1: pre-check concurrency against the cache.
        for entry in attempt.entries() {
            if entry.operation == CommitOperation::AppendEventsOnly {
                continue;
            }
            let cached = self.query_entity(&entry.id, false).await?;
            if cached.revision() != entry.expected_revision {
                let reread = self.query_entity(&entry.id, true).await?;
                if reread.revision() != entry.expected_revision {
                    warn!(id = %entry.id, "commit pre-check lost the concurrency race");
                    return Ok(EntityCommitResult::ConcurrencyFailure);
                }
            }
        }

        loop {
            let mut scope = self.database.create_scope().await;
            let mut produced_batches = Vec::new();
            let mut concurrency_failure = false;

            for entry in attempt.entries() {
                let row = scope
                    .get_one(entry.id.type_tag(), entry.id.id(), &self.config.scope)
                    .await
                    .map_err(Error::Database)?;
                let effective_revision = row.as_ref().map(StoredEntity::effective_revision).unwrap_or(Revision::NONE);

                if entry.operation != CommitOperation::AppendEventsOnly && effective_revision != entry.expected_revision {
                    warn!(id = %entry.id, "commit lost the concurrency race inside the transaction");
                    concurrency_failure = true;
                    scope.rollback().await;
                    self.refresh_cache_after_conflict(&entry.id).await?;
                    break;
                }

                let epoch_after = self.apply_operation(scope.as_mut(), entry, row).await?;

                if !entry.events.is_empty() {
                    let batch = StoredDomainEventBatch::new(
                        entry.id.type_tag(),
                        entry.id.id(),
                        entry.new_revision,
                        epoch_after,
                        self.config.scope.clone(),
                        entry.operation == CommitOperation::Delete,
                        entry.events.clone(),
                    );
                    scope.store_batch(batch.clone()).await.map_err(Error::Database)?;
                    produced_batches.push(batch);
                }
            }

            if concurrency_failure {
                return Ok(EntityCommitResult::ConcurrencyFailure);
            }

            if scope.try_commit().await.map_err(Error::Database)? {
                for entry in attempt.entries() {
                    self.update_cache_after_commit(entry);
                }
                self.enqueue_batches(produced_batches).await?;
                return Ok(EntityCommitResult::Success);
            }
            debug!("database commit lost a race, retrying the transactional loop");
        }
    }

    async fn refresh_cache_after_conflict(&self, id: &EntityIdentifier) -> Result<(), Error> {
        let row = self
            .database
            .get_one(id.type_tag(), id.id(), &self.config.scope)
            .await
            .map_err(Error::Database)?;
        let (result, epoch) = self.load_result_from_row(id, row)?;
        self.update_cache_guarded(id, result, epoch);
        Ok(())
    }

    async fn apply_operation(
        &self,
        scope: &mut dyn DatabaseScope,
        entry: &CommitEntry<E>,
        row: Option<StoredEntity>,
    ) -> Result<Epoch, Error> {
        match entry.operation {
            CommitOperation::Delete => {
                let was_tombstone = row.as_ref().map(|r| r.is_marked_as_deleted).unwrap_or(false);
                let had_row = row.is_some();
                if !entry.events.is_empty() || was_tombstone {
                    let epoch = match &row {
                        Some(r) if r.is_marked_as_deleted => r.epoch.next(),
                        Some(r) => r.epoch,
                        None => Epoch::ZERO,
                    };
                    let tombstone = StoredEntity::tombstone(
                        entry.id.type_tag(),
                        entry.id.id(),
                        self.config.scope.clone(),
                        entry.new_revision,
                        entry.new_concurrency_token.clone(),
                        epoch,
                    );
                    scope.store(tombstone).await.map_err(Error::Database)?;
                    Ok(epoch)
                } else {
                    if had_row {
                        scope
                            .remove(entry.id.type_tag(), entry.id.id(), &self.config.scope)
                            .await
                            .map_err(Error::Database)?;
                    }
                    Ok(Epoch::ZERO)
                }
            }
            CommitOperation::Store => {
                let epoch = match &row {
                    Some(r) if r.is_marked_as_deleted => r.epoch.next(),
                    Some(r) => r.epoch,
                    None => Epoch::ZERO,
                };
                let bytes = serde_json::to_vec(
                    entry
                        .entity
                        .as_ref()
                        .expect("a Store commit entry always carries an entity payload"),
                )
                .map_err(|e| Error::Argument(format!("failed to serialize entity {}: {e}", entry.id)))?;
                let live = StoredEntity::live(
                    entry.id.type_tag(),
                    entry.id.id(),
                    self.config.scope.clone(),
                    entry.new_revision,
                    entry.new_concurrency_token.clone(),
                    epoch,
                    bytes,
                );
                scope.store(live).await.map_err(Error::Database)?;
                Ok(epoch)
            }
            CommitOperation::AppendEventsOnly => {
                // Bump the marker's epoch on every append, including the very
                // first one against an id with no row at all, so repeated
                // append-only commits against the same id (most commonly: the
                // same still-tombstoned, not-yet-dispatched id) never hash to
                // the same batch id and overwrite each other's events.
                let epoch = row.as_ref().map(|r| r.epoch.next()).unwrap_or(Epoch::ZERO);
                let marker = StoredEntity::tombstone(
                    entry.id.type_tag(),
                    entry.id.id(),
                    self.config.scope.clone(),
                    Revision::NONE,
                    entry.new_concurrency_token.clone(),
                    epoch,
                );
                scope.store(marker).await.map_err(Error::Database)?;
                Ok(epoch)
            }
        }
    }

    fn update_cache_after_commit(&self, entry: &CommitEntry<E>) {
        match entry.operation {
            CommitOperation::Store => {
                let found = Found {
                    id: entry.id.clone(),
                    entity: entry
                        .entity
                        .clone()
                        .expect("a Store commit entry always carries an entity payload"),
                    concurrency_token: entry.new_concurrency_token.clone(),
                    revision: entry.new_revision,
                    loaded_from_cache: false,
                    scope: GLOBAL_SCOPE_NAME.to_string(),
                };
                self.overwrite_cache(&entry.id, EntityLoadResult::Found(found), Epoch::ZERO);
            }
            CommitOperation::Delete => {
                let not_found = NotFound {
                    id: entry.id.clone(),
                    loaded_from_cache: false,
                    scope: GLOBAL_SCOPE_NAME.to_string(),
                };
                self.overwrite_cache(&entry.id, EntityLoadResult::NotFound(not_found), Epoch::ZERO);
            }
            CommitOperation::AppendEventsOnly => {}
        }
    }

    fn overwrite_cache(&self, id: &EntityIdentifier, result: EntityLoadResult<E>, epoch: Epoch) {
        self.cache.lock().insert(id.clone(), CacheEntry { load_result: result, epoch });
    }

    /// The stricter of the two policies the spec leaves open: rejects a
    /// cache write that is not strictly newer than what is already cached,
    /// by `(epoch, revision)`. Used only when refreshing the cache off the
    /// back of a concurrency conflict, so a lagging reader can never clobber
    /// an entry a concurrent, already-committed writer installed first.
    fn update_cache_guarded(&self, id: &EntityIdentifier, result: EntityLoadResult<E>, epoch: Epoch) {
        let mut cache = self.cache.lock();
        if let Some(existing) = cache.get(id) {
            if (existing.epoch, existing.load_result.revision()) >= (epoch, result.revision()) {
                debug!(%id, "rejecting stale cache refresh after concurrency conflict");
                return;
            }
        }
        cache.insert(id.clone(), CacheEntry { load_result: result, epoch });
    }

    fn load_result_from_row(&self, id: &EntityIdentifier, row: Option<StoredEntity>) -> Result<(EntityLoadResult<E>, Epoch), Error> {
        match row {
            Some(row) if !row.is_marked_as_deleted => {
                let epoch = row.epoch;
                let found = self.decode_found(id, &row)?;
                Ok((EntityLoadResult::Found(found), epoch))
            }
            Some(row) => Ok((
                EntityLoadResult::NotFound(NotFound {
                    id: id.clone(),
                    loaded_from_cache: false,
                    scope: GLOBAL_SCOPE_NAME.to_string(),
                }),
                row.epoch,
            )),
            None => Ok((
                EntityLoadResult::NotFound(NotFound {
                    id: id.clone(),
                    loaded_from_cache: false,
                    scope: GLOBAL_SCOPE_NAME.to_string(),
                }),
                Epoch::ZERO,
            )),
        }
    }

    fn decode_found(&self, id: &EntityIdentifier, row: &StoredEntity) -> Result<Found<E>, Error> {
        let bytes = row
            .entity
            .as_deref()
            .ok_or_else(|| Error::Argument(format!("row for {id} has no entity payload but is not a tombstone")))?;
        let entity: E =
            serde_json::from_slice(bytes).map_err(|e| Error::Argument(format!("failed to deserialize entity {id}: {e}")))?;
        Ok(Found {
            id: id.clone(),
            entity,
            concurrency_token: row.concurrency_token.clone(),
            revision: row.revision,
            loaded_from_cache: false,
            scope: GLOBAL_SCOPE_NAME.to_string(),
        })
    }

    async fn enqueue_batches(&self, batches: Vec<StoredDomainEventBatch>) -> Result<(), Error> {
        if batches.is_empty() {
            return Ok(());
        }

        if self.config.synchronous_event_dispatch {
            for batch in batches {
                self.dispatcher.dispatch_batch(batch, &self.config.scope).await?;
            }
        } else {
            for batch in batches {
                let dispatcher = self.dispatcher.clone();
                let scope = self.config.scope.clone();
                tokio::spawn(async move {
                    if let Err(err) = dispatcher.dispatch_batch(batch, &scope).await {
                        warn!(error = %err, "background event batch dispatch ended without acknowledgement");
                    }
                });
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<E, D> CommitAttemptHandler<E> for StorageEngine<E, D>
where
    E: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    D: Database + 'static,
{
    async fn commit(&self, attempt: CommitAttempt<E>) -> Result<EntityCommitResult, Error> {
        StorageEngine::commit(self, attempt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryDatabase;
    use crate::uow::UnitOfWork;
    use entitystore_types::{ConcurrencyToken, DomainEvent, RandomConcurrencyTokenFactory};
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Widget {
        name: String,
    }

    struct NullSink;

    #[async_trait::async_trait]
    impl EventSink for NullSink {
        async fn dispatch(&self, _message: crate::dispatch::DispatchMessage) -> bool {
            true
        }
    }

    fn engine() -> StorageEngine<Widget, MemoryDatabase> {
        StorageEngine::new(Arc::new(MemoryDatabase::new()), Arc::new(NullSink), EngineConfig::new())
    }

    fn id(s: &str) -> EntityIdentifier {
        EntityIdentifier::new("widget", s).unwrap()
    }

    #[tokio::test]
    async fn query_entity_on_empty_store_is_not_found() {
        let engine = engine();
        let result = engine.query_entity(&id("1"), false).await.unwrap();
        assert!(result.is_found().is_none());
        assert_eq!(result.revision(), Revision::NONE);
    }

    #[tokio::test]
    async fn store_then_load_round_trips() {
        let engine = engine();
        let factory = RandomConcurrencyTokenFactory;
        let mut uow: UnitOfWork<Widget> = UnitOfWork::new();

        let not_found = engine.query_entity(&id("1"), false).await.unwrap();
        uow.get_or_update(not_found, &factory);
        uow.record_create_or_update(id("1"), Widget { name: "a".into() }, vec![], &factory)
            .unwrap();

        let result = uow.commit(&engine).await.unwrap();
        assert_eq!(result, EntityCommitResult::Success);

        let loaded = engine.query_entity(&id("1"), true).await.unwrap();
        let found = loaded.is_found().unwrap();
        assert_eq!(found.entity, Widget { name: "a".into() });
        assert_eq!(found.revision, Revision::new(1));
    }

    #[tokio::test]
    async fn concurrent_commits_on_the_same_entity_yield_one_success_one_conflict() {
        let engine = engine();
        let factory = RandomConcurrencyTokenFactory;

        // Seed the entity at revision 1.
        let mut seeding: UnitOfWork<Widget> = UnitOfWork::new();
        let not_found = engine.query_entity(&id("1"), false).await.unwrap();
        seeding.get_or_update(not_found, &factory);
        seeding
            .record_create_or_update(id("1"), Widget { name: "v1".into() }, vec![], &factory)
            .unwrap();
        seeding.commit(&engine).await.unwrap();

        // Two independent sessions both load revision 1 and race to update it.
        let mut session_a: UnitOfWork<Widget> = UnitOfWork::new();
        let mut session_b: UnitOfWork<Widget> = UnitOfWork::new();

        let loaded_a = engine.query_entity(&id("1"), true).await.unwrap();
        let loaded_b = engine.query_entity(&id("1"), true).await.unwrap();
        session_a.get_or_update(loaded_a, &factory);
        session_b.get_or_update(loaded_b, &factory);

        session_a
            .record_create_or_update(id("1"), Widget { name: "from-a".into() }, vec![], &factory)
            .unwrap();
        session_b
            .record_create_or_update(id("1"), Widget { name: "from-b".into() }, vec![], &factory)
            .unwrap();

        let result_a = session_a.commit(&engine).await.unwrap();
        let result_b = session_b.commit(&engine).await.unwrap();

        assert_eq!(result_a, EntityCommitResult::Success);
        assert_eq!(result_b, EntityCommitResult::ConcurrencyFailure);
    }

    #[tokio::test]
    async fn delete_then_recreate_bumps_the_epoch() {
        let engine = engine();
        let factory = RandomConcurrencyTokenFactory;

        let mut uow: UnitOfWork<Widget> = UnitOfWork::new();
        let not_found = engine.query_entity(&id("1"), false).await.unwrap();
        uow.get_or_update(not_found, &factory);
        uow.record_create_or_update(id("1"), Widget { name: "v1".into() }, vec![], &factory)
            .unwrap();
        uow.commit(&engine).await.unwrap();

        let loaded = engine.query_entity(&id("1"), true).await.unwrap();
        uow.get_or_update(loaded, &factory);
        uow.record_delete(id("1"), vec![DomainEvent::new("Deleted", vec![])], &factory)
            .unwrap();
        uow.commit(&engine).await.unwrap();

        let not_found_again = engine.query_entity(&id("1"), true).await.unwrap();
        assert!(not_found_again.is_found().is_none());

        uow.get_or_update(not_found_again, &factory);
        uow.record_create_or_update(id("1"), Widget { name: "v2".into() }, vec![], &factory)
            .unwrap();
        uow.commit(&engine).await.unwrap();

        let recreated = engine.query_entity(&id("1"), true).await.unwrap();
        assert_eq!(recreated.is_found().unwrap().entity, Widget { name: "v2".into() });
        assert_eq!(recreated.revision(), Revision::new(1));
    }

    #[tokio::test]
    async fn repeated_append_events_only_commits_never_reuse_a_batch_id() {
        // Simulates `delete(id)` called twice in separate sessions/commits
        // against the same still-undispatched id: each commit only ever
        // builds an `AppendEventsOnly` entry, never a `Store`/`Delete` one,
        // so the row never becomes independently observable as `Found`.
        let engine = engine();
        let factory = RandomConcurrencyTokenFactory;
        let ghost = id("ghost");

        let mut epochs = Vec::new();
        for attempt in 0..3u8 {
            let mut uow: UnitOfWork<Widget> = UnitOfWork::new();
            let not_found = engine.query_entity(&ghost, true).await.unwrap();
            uow.get_or_update(not_found, &factory);
            uow.record_delete(ghost.clone(), vec![DomainEvent::new(&format!("Attempt{attempt}"), vec![])], &factory)
                .unwrap();

            let commit_attempt = uow.build_commit_attempt();
            assert_eq!(commit_attempt.len(), 1);
            let entry = &commit_attempt.entries()[0];
            assert_eq!(entry.operation, CommitOperation::AppendEventsOnly);

            let mut scope = engine.database.create_scope().await;
            let row = scope.get_one(entry.id.type_tag(), entry.id.id(), "").await.unwrap();
            let epoch = engine.apply_operation(scope.as_mut(), entry, row).await.unwrap();
            assert!(scope.try_commit().await.unwrap());
            epochs.push(epoch);
        }

        let batch_ids: Vec<_> = epochs
            .iter()
            .map(|epoch| StoredDomainEventBatch::batch_id("widget", "ghost", Revision::NONE, *epoch, ""))
            .collect();
        let unique: std::collections::HashSet<_> = batch_ids.iter().collect();
        assert_eq!(
            unique.len(),
            batch_ids.len(),
            "repeated append-only commits against the same id must never collide on a batch id"
        );
    }

    #[tokio::test]
    async fn disposed_engine_rejects_every_operation() {
        let engine = engine();
        engine.dispose();
        let err = engine.query_entity(&id("1"), false).await.unwrap_err();
        assert!(matches!(err, Error::Disposed));
    }

    #[tokio::test]
    async fn startup_drain_dispatches_every_preloaded_batch() {
        let db = Arc::new(MemoryDatabase::new());
        db.store_batch(StoredDomainEventBatch::new(
            "widget",
            "1",
            Revision::new(1),
            Epoch::ZERO,
            "S",
            false,
            vec![DomainEvent::new("A", vec![])],
        ))
        .await;
        db.store_batch(StoredDomainEventBatch::new(
            "widget",
            "2",
            Revision::new(1),
            Epoch::ZERO,
            "S",
            false,
            vec![DomainEvent::new("B", vec![])],
        ))
        .await;

        let engine: StorageEngine<Widget, MemoryDatabase> =
            StorageEngine::new(db.clone(), Arc::new(NullSink), EngineConfig::new().with_scope("S").with_synchronous_event_dispatch(true));
        engine.initialize().await.unwrap();

        assert!(db
            .get_one_batch(&StoredDomainEventBatch::batch_id("widget", "1", Revision::new(1), Epoch::ZERO, "S"), "S")
            .await
            .unwrap()
            .is_none());
        assert!(db
            .get_one_batch(&StoredDomainEventBatch::batch_id("widget", "2", Revision::new(1), Epoch::ZERO, "S"), "S")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn synchronous_dispatch_awaits_delivery_before_commit_returns() {
        struct CountingSink {
            delivered: std::sync::atomic::AtomicUsize,
        }
        #[async_trait::async_trait]
        impl EventSink for CountingSink {
            async fn dispatch(&self, _message: crate::dispatch::DispatchMessage) -> bool {
                self.delivered.fetch_add(1, Ordering::SeqCst);
                true
            }
        }

        let sink = Arc::new(CountingSink {
            delivered: std::sync::atomic::AtomicUsize::new(0),
        });
        let engine: StorageEngine<Widget, MemoryDatabase> = StorageEngine::new(
            Arc::new(MemoryDatabase::new()),
            sink.clone(),
            EngineConfig::new().with_synchronous_event_dispatch(true),
        );
        let factory = RandomConcurrencyTokenFactory;
        let mut uow: UnitOfWork<Widget> = UnitOfWork::new();
        let not_found = engine.query_entity(&id("1"), false).await.unwrap();
        uow.get_or_update(not_found, &factory);
        uow.record_create_or_update(
            id("1"),
            Widget { name: "v1".into() },
            vec![DomainEvent::new("Created", vec![])],
            &factory,
        )
        .unwrap();

        uow.commit(&engine).await.unwrap();
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
    }
}
