//! End-to-end scenarios exercising the crate's public API together: the
//! entity storage session, the storage engine, the query processors, and
//! the event dispatcher's startup drain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use entitystore_core::database::memory::MemoryDatabase;
use entitystore_core::{
    ByRevisionRangeQueryProcessor, Database, DispatchMessage, EngineConfig, EntityCommitResult, EntityIdFactory, EntityMetadata,
    EntityStorage, Error, EventSink, StorageEngine,
};
use entitystore_types::{
    ConcurrencyToken, DomainEvent, EntityIdentifier, Epoch, RandomConcurrencyTokenFactory, Revision, StoredDomainEventBatch,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
struct Account {
    #[serde(skip)]
    id: Option<String>,
    #[serde(skip)]
    concurrency_token: ConcurrencyToken,
    #[serde(skip)]
    revision: Revision,
    #[serde(skip)]
    events: Vec<DomainEvent>,
    balance_cents: i64,
}

impl EntityMetadata for Account {
    const ENTITY_TYPE: &'static str = "account";

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: String) {
        self.id = Some(id);
    }

    fn set_concurrency_token(&mut self, token: ConcurrencyToken) {
        self.concurrency_token = token;
    }

    fn set_revision(&mut self, revision: Revision) {
        self.revision = revision;
    }

    fn uncommitted_events(&self) -> Vec<DomainEvent> {
        self.events.clone()
    }

    fn commit_events(&mut self) {
        self.events.clear();
    }
}

struct FixedIdFactory(&'static str);

impl EntityIdFactory<Account> for FixedIdFactory {
    fn create(&self, _entity: &Account) -> Result<String, Error> {
        Ok(self.0.to_string())
    }
}

struct NullSink;

#[async_trait::async_trait]
impl EventSink for NullSink {
    async fn dispatch(&self, _message: DispatchMessage) -> bool {
        true
    }
}

fn engine(db: Arc<MemoryDatabase>, config: EngineConfig) -> Arc<StorageEngine<Account, MemoryDatabase>> {
    Arc::new(StorageEngine::new(db, Arc::new(NullSink), config))
}

fn session(engine: Arc<StorageEngine<Account, MemoryDatabase>>, id: &'static str) -> EntityStorage<Account, MemoryDatabase> {
    EntityStorage::new(engine, "session", Arc::new(RandomConcurrencyTokenFactory), Arc::new(FixedIdFactory(id)))
}

/// Scenario 1: create then load. `store({id:"a", v:1}); commit()` succeeds;
/// a fresh session then `load("a")` returns `Found{revision=1, v=1}`.
#[tokio::test]
async fn create_then_load() {
    let engine = engine(Arc::new(MemoryDatabase::new()), EngineConfig::new());
    let writer = session(engine.clone(), "a");

    let mut account = Account { balance_cents: 100, ..Default::default() };
    writer.store(&mut account).await.unwrap();
    assert_eq!(writer.commit().await.unwrap(), EntityCommitResult::Success);

    let reader = session(engine, "a");
    let id = EntityIdentifier::new("account", "a").unwrap();
    let loaded = reader.load(&id, None).await.unwrap();
    let found = loaded.is_found().unwrap();
    assert_eq!(found.revision, Revision::new(1));
    assert_eq!(found.entity.balance_cents, 100);
}

/// Scenario 2: concurrency conflict. Two sessions load the same entity and
/// both try to commit a change; only the first succeeds.
#[tokio::test]
async fn concurrency_conflict_between_two_sessions() {
    let engine = engine(Arc::new(MemoryDatabase::new()), EngineConfig::new());
    let seeder = session(engine.clone(), "a");
    let mut seed = Account { balance_cents: 0, ..Default::default() };
    seeder.store(&mut seed).await.unwrap();
    seeder.commit().await.unwrap();

    let id = EntityIdentifier::new("account", "a").unwrap();

    let session_a = session(engine.clone(), "a");
    let session_b = session(engine.clone(), "a");
    let loaded_a = session_a.load(&id, None).await.unwrap().into_found().unwrap();
    let loaded_b = session_b.load(&id, None).await.unwrap().into_found().unwrap();

    let mut entity_a = loaded_a.entity;
    entity_a.id = Some("a".into());
    entity_a.concurrency_token = loaded_a.concurrency_token;
    entity_a.revision = loaded_a.revision;
    entity_a.balance_cents = 10;
    session_a.store(&mut entity_a).await.unwrap();

    let mut entity_b = loaded_b.entity;
    entity_b.id = Some("a".into());
    entity_b.concurrency_token = loaded_b.concurrency_token;
    entity_b.revision = loaded_b.revision;
    entity_b.balance_cents = 20;
    session_b.store(&mut entity_b).await.unwrap();

    assert_eq!(session_a.commit().await.unwrap(), EntityCommitResult::Success);
    assert_eq!(session_b.commit().await.unwrap(), EntityCommitResult::ConcurrencyFailure);
}

/// Scenario 3: delete-then-recreate epoch bump. Three mutations against the
/// same entity id (create, delete-with-event, recreate) each raise a batch
/// with a strictly different primary key, and synchronous dispatch drains
/// every one of them as it happens.
#[tokio::test]
async fn delete_then_recreate_bumps_epoch_and_produces_distinct_batch_ids() {
    let db = Arc::new(MemoryDatabase::new());
    let engine = engine(db.clone(), EngineConfig::new().with_synchronous_event_dispatch(true));
    let writer = session(engine.clone(), "a");
    let id = EntityIdentifier::new("account", "a").unwrap();

    let mut account = Account { balance_cents: 1, events: vec![DomainEvent::new("AccountOpened", vec![])], ..Default::default() };
    writer.store(&mut account).await.unwrap();
    writer.commit().await.unwrap();
    let batch_create = StoredDomainEventBatch::batch_id("account", "a", Revision::new(1), Epoch::ZERO, "");

    let loaded = writer.load(&id, None).await.unwrap().into_found().unwrap();
    let mut to_delete = loaded.entity;
    to_delete.id = Some("a".into());
    to_delete.concurrency_token = loaded.concurrency_token;
    to_delete.revision = loaded.revision;
    to_delete.events = vec![DomainEvent::new("AccountClosed", vec![])];
    writer.delete(&mut to_delete).await.unwrap();
    writer.commit().await.unwrap();
    let batch_delete = StoredDomainEventBatch::batch_id("account", "a", Revision::new(2), Epoch::ZERO, "");

    let mut recreated = Account { balance_cents: 2, events: vec![DomainEvent::new("AccountOpened", vec![])], ..Default::default() };
    writer.store(&mut recreated).await.unwrap();
    writer.commit().await.unwrap();
    let batch_recreate = StoredDomainEventBatch::batch_id("account", "a", Revision::new(1), Epoch::new(1), "");

    assert_ne!(batch_create, batch_delete);
    assert_ne!(batch_delete, batch_recreate);
    assert_ne!(batch_create, batch_recreate);

    // All three batches were dispatched synchronously as they were raised,
    // so none remain in the outbox once the last commit returns.
    let mut pending = db.get_all_batches("");
    assert!(pending.next().await.is_none());
}

/// Scenario 4: revision-range processor. `min=3, max=5`: revision 2 fails,
/// revision 4 succeeds, revision 7 fails.
#[tokio::test]
async fn revision_range_processor_bounds_acceptable_revisions() {
    let engine = engine(Arc::new(MemoryDatabase::new()), EngineConfig::new());
    let writer = session(engine.clone(), "a");
    let id = EntityIdentifier::new("account", "a").unwrap();

    let mut account = Account::default();
    for revision in 1..=7u64 {
        account.balance_cents = revision as i64;
        if revision == 1 {
            writer.store(&mut account).await.unwrap();
        } else {
            let loaded = writer.load(&id, None).await.unwrap().into_found().unwrap();
            account = loaded.entity;
            account.id = Some("a".into());
            account.concurrency_token = loaded.concurrency_token;
            account.revision = loaded.revision;
            account.balance_cents = revision as i64;
            writer.store(&mut account).await.unwrap();
        }
        writer.commit().await.unwrap();

        if revision == 2 || revision == 4 || revision == 7 {
            let processor = ByRevisionRangeQueryProcessor::new(Some(Revision::new(3)), Some(Revision::new(5)));
            let result = writer.load(&id, Some(&processor)).await.unwrap();
            if revision == 4 {
                assert!(result.is_found().is_some(), "revision 4 should satisfy [3, 5]");
            } else {
                assert!(
                    result.is_verification_failed().is_some(),
                    "revision {revision} should fall outside [3, 5]"
                );
            }
        }
    }
}

/// Scenario 5: synchronous dispatch. With `synchronous_event_dispatch=true`
/// a commit raising one event only returns after the sink acknowledges it.
#[tokio::test]
async fn synchronous_dispatch_blocks_commit_until_sink_acknowledges() {
    struct CountingSink {
        delivered: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventSink for CountingSink {
        async fn dispatch(&self, _message: DispatchMessage) -> bool {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    let sink = Arc::new(CountingSink { delivered: AtomicUsize::new(0) });
    let engine: Arc<StorageEngine<Account, MemoryDatabase>> = Arc::new(StorageEngine::new(
        Arc::new(MemoryDatabase::new()),
        sink.clone(),
        EngineConfig::new().with_synchronous_event_dispatch(true),
    ));
    let writer = session(engine, "a");

    let mut account = Account { balance_cents: 1, events: vec![DomainEvent::new("AccountOpened", vec![])], ..Default::default() };
    writer.store(&mut account).await.unwrap();
    writer.commit().await.unwrap();

    assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
}

/// Scenario 6: startup drain. Two undispatched batches preloaded for scope
/// `"S"` are both dispatched and removed within `initialize`.
#[tokio::test]
async fn startup_drain_dispatches_every_preloaded_batch_for_its_scope() {
    let db = Arc::new(MemoryDatabase::new());
    db.store_batch(StoredDomainEventBatch::new(
        "account",
        "a",
        Revision::new(1),
        Epoch::ZERO,
        "S",
        false,
        vec![DomainEvent::new("AccountOpened", vec![])],
    ))
    .await;
    db.store_batch(StoredDomainEventBatch::new(
        "account",
        "b",
        Revision::new(1),
        Epoch::ZERO,
        "S",
        false,
        vec![DomainEvent::new("AccountOpened", vec![])],
    ))
    .await;

    let engine: Arc<StorageEngine<Account, MemoryDatabase>> = engine(
        db.clone(),
        EngineConfig::new().with_scope("S").with_synchronous_event_dispatch(true),
    );
    engine.initialize().await.unwrap();

    let mut pending = db.get_all_batches("S");
    assert!(pending.next().await.is_none());
}
