//! `entitystore` — transactional persistence for aggregate entities with a
//! continuously-dispatched domain-event outbox.
//!
//! This crate re-exports the types split across `entitystore-types` (the
//! shared data model) and `entitystore-core` (the storage engine, unit of
//! work, entity storage session, query processors, commit pipeline, and
//! event dispatcher) under one name, the way the teacher codebase's
//! top-level `ormdb` crate re-exports `ormdb-core` and `ormdb-proto`. It adds
//! one convenience on top: [`EntityStore`], which wires a [`StorageEngine`]
//! and a shared concurrency-token factory together so that opening a new
//! [`EntityStorage`] session doesn't require threading both through by hand.
//!
//! Host applications:
//!
//! 1. Implement [`Database`] against their production key-value store (or
//!    use [`entitystore_core::database::memory::MemoryDatabase`] to get
//!    started).
//! 2. Implement [`EntityMetadata`] on every entity type they persist.
//! 3. Build one [`EntityStore`] per aggregate type, call
//!    [`EntityStore::initialize`] once at startup, and open a session per
//!    logical unit of work via [`EntityStore::session`].

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use entitystore_core as core;
pub use entitystore_types as types;

pub use entitystore_core::{
    ByConcurrencyTokenQueryProcessor, ByRevisionRangeQueryProcessor, CommitAttempt, CommitAttemptHandler, CommitEntry,
    CommitOperation, CommitPipeline, CommitProcessor, Database, DatabaseScope, DbError, DefaultQueryProcessor, DispatchMessage,
    EngineConfig, EntityCommitResult, EntityIdFactory, EntityLoadResult, EntityMetadata, EntityStorage, Error, EventDispatcher,
    EventSink, Found, NotFound, ProcessorHandle, QueryExecutor, QueryProcessor, Scope, StorageEngine, TrackedEntry, TrackedState,
    UnitOfWork, VerificationFailed, VerificationKind,
};
pub use entitystore_types::{
    ConcurrencyToken, ConcurrencyTokenFactory, DomainEvent, EntityIdentifier, Epoch, RandomConcurrencyTokenFactory, Revision,
    StoredDomainEventBatch, StoredEntity,
};

/// A fully wired [`StorageEngine`] plus the shared concurrency-token factory
/// every session it opens needs. One `EntityStore` is normally constructed
/// per aggregate type and shared across however many sessions the host
/// application opens concurrently.
pub struct EntityStore<E, D> {
    engine: Arc<StorageEngine<E, D>>,
    token_factory: Arc<dyn ConcurrencyTokenFactory>,
}

impl<E, D> EntityStore<E, D>
where
    E: Clone + Serialize + DeserializeOwned + EntityMetadata + Send + Sync + 'static,
    D: Database + 'static,
{
    /// Builds the store around a fresh [`StorageEngine`], using
    /// [`RandomConcurrencyTokenFactory`] for token minting.
    pub fn new(database: Arc<D>, sink: Arc<dyn EventSink>, config: EngineConfig) -> Self {
        Self::with_token_factory(database, sink, config, Arc::new(RandomConcurrencyTokenFactory))
    }

    /// As [`EntityStore::new`], but with a caller-supplied
    /// [`ConcurrencyTokenFactory`] (e.g. one producing content-addressed or
    /// sequential tokens instead of random ones).
    pub fn with_token_factory(
        database: Arc<D>,
        sink: Arc<dyn EventSink>,
        config: EngineConfig,
        token_factory: Arc<dyn ConcurrencyTokenFactory>,
    ) -> Self {
        Self {
            engine: Arc::new(StorageEngine::new(database, sink, config)),
            token_factory,
        }
    }

    /// Wraps an already-constructed engine (e.g. one shared with a
    /// [`CommitPipeline`] built elsewhere).
    pub fn from_engine(engine: Arc<StorageEngine<E, D>>, token_factory: Arc<dyn ConcurrencyTokenFactory>) -> Self {
        Self { engine, token_factory }
    }

    /// Drains every pending event batch left over from a previous run.
    /// Must be called once before any session commits, per the engine's
    /// initialization contract.
    pub async fn initialize(&self) -> Result<(), Error> {
        self.engine.initialize().await
    }

    /// The underlying engine, shared across every session this store opens.
    pub fn engine(&self) -> &Arc<StorageEngine<E, D>> {
        &self.engine
    }

    /// Opens a new session committing straight to the engine.
    pub fn session(&self, scope_name: impl Into<String>, id_factory: Arc<dyn EntityIdFactory<E>>) -> EntityStorage<E, D> {
        EntityStorage::new(self.engine.clone(), scope_name, self.token_factory.clone(), id_factory)
    }

    /// Opens a new session committing through `pipeline` (which must
    /// terminate in this store's engine).
    pub fn session_with_pipeline(
        &self,
        pipeline: Arc<dyn CommitAttemptHandler<E>>,
        scope_name: impl Into<String>,
        id_factory: Arc<dyn EntityIdFactory<E>>,
    ) -> EntityStorage<E, D> {
        EntityStorage::with_handler(self.engine.clone(), pipeline, scope_name, self.token_factory.clone(), id_factory)
    }

    /// Cancels in-flight operations and marks the engine disposed; every
    /// subsequent call against it (including on sessions already holding a
    /// reference to it) fails with [`Error::Disposed`].
    pub fn dispose(&self) {
        self.engine.dispose();
    }
}
