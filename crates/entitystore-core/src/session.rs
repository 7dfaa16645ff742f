//! Entity storage session (C6).
//!
//! The user-facing façade: one unit of work plus one query-result scope,
//! talking to a shared [`StorageEngine`] through whatever
//! [`CommitAttemptHandler`] sits in front of it (the engine directly, or a
//! [`crate::pipeline::CommitPipeline`] wrapping it). A session is not
//! thread-safe on its own — per the crate's concurrency model it is owned by
//! one logical task at a time — but its internals use `parking_lot::Mutex`
//! rather than plain field mutation so that [`QueryExecutor`] (which the
//! query processor calls through a `&dyn` reference, not `&mut`) can still
//! record unit-of-work side effects.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use entitystore_types::{ConcurrencyToken, ConcurrencyTokenFactory, DomainEvent, EntityIdentifier, Revision};

use crate::database::Database;
use crate::engine::StorageEngine;
use crate::error::Error;
use crate::load_result::{EntityLoadResult, Found};
use crate::query_processor::{DefaultQueryProcessor, QueryExecutor, QueryProcessor};
use crate::scope::Scope;
use crate::uow::{CommitAttemptHandler, EntityCommitResult, TrackedState, UnitOfWork};

/// The external collaborator an entity instance must satisfy for a session
/// to stamp identity and versioning metadata onto it after a load, store, or
/// delete.
///
/// The spec describes this as either a well-known interface the entity
/// satisfies or a reflective fallback keyed by property name; Rust has no
/// runtime reflection, so only the well-known-interface path applies here —
/// host entity types implement this trait directly.
pub trait EntityMetadata {
    /// The stable type tag this entity is stored under.
    const ENTITY_TYPE: &'static str;

    fn id(&self) -> Option<&str>;
    fn set_id(&mut self, id: String);
    fn set_concurrency_token(&mut self, token: ConcurrencyToken);
    fn set_revision(&mut self, revision: Revision);

    /// Domain events raised since the last [`EntityMetadata::commit_events`],
    /// collected by `store`/`delete` and attached to the resulting commit
    /// entry.
    fn uncommitted_events(&self) -> Vec<DomainEvent>;
    /// Marks every currently-uncommitted event as committed.
    fn commit_events(&mut self);
}

/// Mints a fresh identifier for an entity that has none yet.
pub trait EntityIdFactory<E>: Send + Sync {
    fn create(&self, entity: &E) -> Result<String, Error>;
}

struct SessionExecutor<'a, E, D> {
    session: &'a EntityStorage<E, D>,
    id: EntityIdentifier,
}

#[async_trait::async_trait]
impl<'a, E, D> QueryExecutor<E> for SessionExecutor<'a, E, D>
where
    E: Clone + Serialize + DeserializeOwned + EntityMetadata + Send + Sync + 'static,
    D: Database + 'static,
{
    async fn execute(&self, bypass_cache: bool) -> Result<EntityLoadResult<E>, Error> {
        if !bypass_cache {
            if let Some(tracked) = self.session.uow.lock().get(&self.id) {
                return Ok(tracked.current().clone());
            }
        }

        let result = self.session.engine.query_entity(&self.id, bypass_cache).await?;
        let scoped = result.as_scoped_to(&self.session.scope);
        self.session
            .uow
            .lock()
            .get_or_update(scoped.clone(), self.session.token_factory.as_ref());
        Ok(scoped)
    }
}

/// One client-facing entity storage session.
pub struct EntityStorage<E, D> {
    engine: Arc<StorageEngine<E, D>>,
    handler: Arc<dyn CommitAttemptHandler<E>>,
    uow: Mutex<UnitOfWork<E>>,
    scope: Scope<E>,
    token_factory: Arc<dyn ConcurrencyTokenFactory>,
    id_factory: Arc<dyn EntityIdFactory<E>>,
}

impl<E, D> EntityStorage<E, D>
where
    E: Clone + Serialize + DeserializeOwned + EntityMetadata + Send + Sync + 'static,
    D: Database + 'static,
{
    /// Builds a session backed directly by `engine` (no commit pipeline
    /// stages in front of it).
    pub fn new(
        engine: Arc<StorageEngine<E, D>>,
        scope_name: impl Into<String>,
        token_factory: Arc<dyn ConcurrencyTokenFactory>,
        id_factory: Arc<dyn EntityIdFactory<E>>,
    ) -> Self {
        Self::with_handler(engine.clone(), engine, scope_name, token_factory, id_factory)
    }

    /// Builds a session whose commits go through `handler` (typically a
    /// [`crate::pipeline::CommitPipeline`] terminating in `engine`), while
    /// loads still go straight to `engine`.
    pub fn with_handler(
        engine: Arc<StorageEngine<E, D>>,
        handler: Arc<dyn CommitAttemptHandler<E>>,
        scope_name: impl Into<String>,
        token_factory: Arc<dyn ConcurrencyTokenFactory>,
        id_factory: Arc<dyn EntityIdFactory<E>>,
    ) -> Self {
        Self {
            engine,
            handler,
            uow: Mutex::new(UnitOfWork::new()),
            scope: Scope::new(scope_name),
            token_factory,
            id_factory,
        }
    }

    /// Loads one entity, delegating the cache/bypass decision to
    /// `processor` ([`DefaultQueryProcessor`] if `None`).
    pub async fn load(&self, id: &EntityIdentifier, processor: Option<&dyn QueryProcessor<E>>) -> Result<EntityLoadResult<E>, Error> {
        let executor = SessionExecutor { session: self, id: id.clone() };
        let result = match processor {
            Some(processor) => processor.process(id, &executor).await?,
            None => DefaultQueryProcessor.process(id, &executor).await?,
        };
        Ok(self.stamp_metadata(result))
    }

    /// Streams every live entity of `entity_type`, scoping and tracking
    /// each one; an entity already marked deleted in this session's unit of
    /// work is suppressed even if the database still reports it as live.
    pub fn load_all<'a>(&'a self, entity_type: &str) -> BoxStream<'a, Result<Found<E>, Error>> {
        let entity_type = entity_type.to_string();
        Box::pin(async_stream::stream! {
            let mut rows = self.engine.query_entities(&entity_type, false);
            while let Some(item) = rows.next().await {
                let found = match item {
                    Ok(found) => found,
                    Err(e) => {
                        yield Err(e);
                        continue;
                    }
                };
                let scoped = EntityLoadResult::Found(found).as_scoped_to(&self.scope);
                let tracked = self.uow.lock().get_or_update(scoped.clone(), self.token_factory.as_ref());
                if tracked.state() == TrackedState::Deleted {
                    continue;
                }
                if let EntityLoadResult::Found(found) = self.stamp_metadata(scoped) {
                    yield Ok(found);
                }
            }
        })
    }

    /// Resolves (allocating via the id factory if absent), tracks, and
    /// records a create/update for `entity`, attaching its uncommitted
    /// events to the resulting commit entry.
    pub async fn store(&self, entity: &mut E) -> Result<(), Error> {
        let id = self.resolve_id(entity)?;
        self.ensure_tracked(&id).await?;
        let events = entity.uncommitted_events();
        self.uow
            .lock()
            .record_create_or_update(id.clone(), entity.clone(), events, self.token_factory.as_ref())?;
        entity.commit_events();
        self.stamp_from_uow(entity, &id);
        Ok(())
    }

    /// Resolves, tracks, and records a delete for `entity`.
    pub async fn delete(&self, entity: &mut E) -> Result<(), Error> {
        let id = self.resolve_id(entity)?;
        self.ensure_tracked(&id).await?;
        let events = entity.uncommitted_events();
        self.uow.lock().record_delete(id.clone(), events, self.token_factory.as_ref())?;
        entity.commit_events();
        self.stamp_from_uow(entity, &id);
        Ok(())
    }

    /// Builds a commit attempt from every tracked mutation and hands it to
    /// the session's handler; the unit of work resets regardless of the
    /// outcome.
    ///
    /// Built by hand, rather than delegating to [`UnitOfWork::commit`], so
    /// the unit of work's mutex is never held across the `.await`.
    pub async fn commit(&self) -> Result<EntityCommitResult, Error> {
        let attempt = self.uow.lock().build_commit_attempt();
        let result = self.handler.commit(attempt).await;
        self.uow.lock().reset();
        result
    }

    /// Discards every pending mutation and clears scope-local memoized
    /// clones.
    pub fn rollback(&self) {
        self.uow.lock().reset();
        self.scope.reset();
    }

    /// A snapshot of every identifier currently tracked by this session's
    /// unit of work, in insertion order.
    pub fn loaded_entities(&self) -> Vec<EntityIdentifier> {
        self.uow.lock().tracked_ids()
    }

    fn stamp_metadata(&self, result: EntityLoadResult<E>) -> EntityLoadResult<E> {
        match result {
            EntityLoadResult::Found(mut found) => {
                found.entity.set_id(found.id.id().to_string());
                found.entity.set_concurrency_token(found.concurrency_token.clone());
                found.entity.set_revision(found.revision);
                EntityLoadResult::Found(found)
            }
            other => other,
        }
    }

    fn stamp_from_uow(&self, entity: &mut E, id: &EntityIdentifier) {
        let uow = self.uow.lock();
        let Some(tracked) = uow.get(id) else { return };
        entity.set_id(id.id().to_string());
        entity.set_concurrency_token(tracked.updated_concurrency_token().clone());
        if let Some(revision) = tracked.updated_revision() {
            entity.set_revision(revision);
        }
    }

    fn resolve_id(&self, entity: &mut E) -> Result<EntityIdentifier, Error> {
        let id = match entity.id() {
            Some(existing) => existing.to_string(),
            None => {
                let created = self.id_factory.create(entity)?;
                entity.set_id(created.clone());
                created
            }
        };
        EntityIdentifier::new(E::ENTITY_TYPE, id).map_err(Error::InvalidArgument)
    }

    async fn ensure_tracked(&self, id: &EntityIdentifier) -> Result<(), Error> {
        if self.uow.lock().get(id).is_some() {
            return Ok(());
        }
        self.load(id, None).await?;
        Ok(())
    }
}
