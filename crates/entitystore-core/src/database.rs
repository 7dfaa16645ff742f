//! The storage backend seam.
//!
//! `entitystore-core` never speaks to a concrete key-value store. Host
//! applications implement [`Database`] against whatever they run in
//! production; everything above this module — the engine, the unit of
//! work, the entity storage session — only ever calls through the trait.
//!
//! A [`Database`] hands out [`DatabaseScope`] values, one per commit
//! attempt. A scope buffers reads and writes and is asked to
//! [`DatabaseScope::try_commit`] atomically; a `false` return means another
//! writer won the race and the caller should retry with a fresh scope, not
//! that the commit faulted.

use async_trait::async_trait;
use futures::stream::BoxStream;

use entitystore_types::{StoredDomainEventBatch, StoredEntity};

pub mod memory;

/// The error type returned by a [`Database`] implementation.
///
/// Boxed and opaque on purpose: the engine does not interpret backend
/// errors, it only propagates them as [`crate::error::Error::Database`].
pub type DbError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A pluggable storage backend.
///
/// Implementations own durability, indexing, and whatever locking or MVCC
/// scheme they need to make [`DatabaseScope::try_commit`] atomic. Rows are
/// addressed by `(entity_type, entity_id, scope)`; event batches are
/// addressed by `(batch_id, scope)`.
#[async_trait]
pub trait Database: Send + Sync {
    /// Reads the current row for one entity, if any exists.
    async fn get_one(
        &self,
        entity_type: &str,
        entity_id: &str,
        scope: &str,
    ) -> Result<Option<StoredEntity>, DbError>;

    /// Streams every row of a given entity type within a scope, live and
    /// tombstoned alike; callers filter tombstones by inspecting
    /// `is_marked_as_deleted`.
    fn get_all(&self, entity_type: &str, scope: &str) -> BoxStream<'_, Result<StoredEntity, DbError>>;

    /// Writes a row outside of a commit-attempt transaction. Used only by
    /// the engine's startup catch-up pass; the commit pipeline always goes
    /// through a [`DatabaseScope`].
    async fn store(&self, row: StoredEntity) -> Result<(), DbError>;

    /// Removes a row outside of a commit-attempt transaction.
    async fn remove(&self, row: StoredEntity) -> Result<(), DbError>;

    /// Opens a new transactional scope for one commit attempt.
    async fn create_scope(&self) -> Box<dyn DatabaseScope>;

    /// Reads one pending event batch by id, if it has not yet been
    /// dispatched and removed.
    async fn get_one_batch(
        &self,
        batch_id: &str,
        scope: &str,
    ) -> Result<Option<StoredDomainEventBatch>, DbError>;

    /// Streams every pending event batch in a scope, in the order the
    /// dispatcher should attempt them.
    fn get_all_batches(&self, scope: &str) -> BoxStream<'_, Result<StoredDomainEventBatch, DbError>>;

    /// Removes a dispatched batch from the outbox.
    async fn remove_batch(&self, batch_id: &str, scope: &str) -> Result<(), DbError>;
}

/// One buffered, all-or-nothing commit attempt against a [`Database`].
///
/// A scope is single-use: [`try_commit`](DatabaseScope::try_commit) and
/// [`rollback`](DatabaseScope::rollback) both consume it. Reads issued
/// through a scope must observe the scope's own buffered writes before they
/// are committed, so that a unit of work reading back an entity it just
/// staged sees its own write.
#[async_trait]
pub trait DatabaseScope: Send {
    /// Reads a row, honoring any write already buffered in this scope.
    async fn get_one(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        scope: &str,
    ) -> Result<Option<StoredEntity>, DbError>;

    /// Buffers a row write.
    async fn store(&mut self, row: StoredEntity) -> Result<(), DbError>;

    /// Buffers a row removal.
    async fn remove(&mut self, entity_type: &str, entity_id: &str, scope: &str) -> Result<(), DbError>;

    /// Buffers a new outbox batch.
    async fn store_batch(&mut self, batch: StoredDomainEventBatch) -> Result<(), DbError>;

    /// Buffers removal of a dispatched outbox batch.
    async fn remove_batch(&mut self, batch_id: &str, scope: &str) -> Result<(), DbError>;

    /// Attempts to apply every buffered write atomically.
    ///
    /// `Ok(true)` means the commit landed. `Ok(false)` means the scope lost
    /// an optimistic-concurrency race with a concurrent committer and every
    /// buffered write was discarded; the caller decides whether to retry.
    /// `Err` means the backend itself faulted.
    async fn try_commit(self: Box<Self>) -> Result<bool, DbError>;

    /// Discards every buffered write without attempting to commit.
    async fn rollback(self: Box<Self>);
}
