//! An in-memory [`Database`](super::Database), for tests and as a runnable
//! reference.
//!
//! Every row and event batch lives in a `parking_lot::RwLock<HashMap<_>>`.
//! A [`MemoryScope`] buffers its writes locally and records, for every key
//! it reads, a snapshot of what it saw; `try_commit` takes both locks once,
//! re-checks every snapshot against current state, and only then applies
//! the buffered writes. A stale snapshot aborts the whole scope.

use std::collections::HashMap;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::RwLock;

use entitystore_types::{StoredDomainEventBatch, StoredEntity};

use super::{Database, DatabaseScope, DbError};

type RowKey = (String, String, String);
type BatchKey = (String, String);

fn row_key(entity_type: &str, entity_id: &str, scope: &str) -> RowKey {
    (entity_type.to_string(), entity_id.to_string(), scope.to_string())
}

fn batch_key(batch_id: &str, scope: &str) -> BatchKey {
    (batch_id.to_string(), scope.to_string())
}

/// An in-memory [`Database`] implementation.
#[derive(Default)]
pub struct MemoryDatabase {
    rows: Arc<RwLock<HashMap<RowKey, StoredEntity>>>,
    batches: Arc<RwLock<HashMap<BatchKey, StoredDomainEventBatch>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a batch directly, bypassing the transactional scope. Useful for
    /// fixture setup (e.g. the engine's startup-drain test) where the batch
    /// needs to exist before any engine commit produced it.
    pub async fn store_batch(&self, batch: StoredDomainEventBatch) {
        let key = batch_key(&batch.id, &batch.scope);
        self.batches.write().insert(key, batch);
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn get_one(
        &self,
        entity_type: &str,
        entity_id: &str,
        scope: &str,
    ) -> Result<Option<StoredEntity>, DbError> {
        let key = row_key(entity_type, entity_id, scope);
        Ok(self.rows.read().get(&key).cloned())
    }

    fn get_all(&self, entity_type: &str, scope: &str) -> BoxStream<'_, Result<StoredEntity, DbError>> {
        let entity_type = entity_type.to_string();
        let scope = scope.to_string();
        let snapshot: Vec<StoredEntity> = self
            .rows
            .read()
            .values()
            .filter(|row| row.entity_type == entity_type && row.scope == scope)
            .cloned()
            .collect();
        Box::pin(stream! {
            for row in snapshot {
                yield Ok(row);
            }
        })
    }

    async fn store(&self, row: StoredEntity) -> Result<(), DbError> {
        let key = row_key(&row.entity_type, &row.entity_id, &row.scope);
        self.rows.write().insert(key, row);
        Ok(())
    }

    async fn remove(&self, row: StoredEntity) -> Result<(), DbError> {
        let key = row_key(&row.entity_type, &row.entity_id, &row.scope);
        self.rows.write().remove(&key);
        Ok(())
    }

    async fn create_scope(&self) -> Box<dyn DatabaseScope> {
        Box::new(MemoryScope {
            rows: self.rows.clone(),
            batches: self.batches.clone(),
            row_reads: HashMap::new(),
            row_writes: HashMap::new(),
            batch_reads: HashMap::new(),
            batch_writes: HashMap::new(),
        })
    }

    async fn get_one_batch(
        &self,
        batch_id: &str,
        scope: &str,
    ) -> Result<Option<StoredDomainEventBatch>, DbError> {
        let key = batch_key(batch_id, scope);
        Ok(self.batches.read().get(&key).cloned())
    }

    fn get_all_batches(&self, scope: &str) -> BoxStream<'_, Result<StoredDomainEventBatch, DbError>> {
        let scope = scope.to_string();
        let snapshot: Vec<StoredDomainEventBatch> = self
            .batches
            .read()
            .values()
            .filter(|batch| batch.scope == scope)
            .cloned()
            .collect();
        Box::pin(stream! {
            for batch in snapshot {
                yield Ok(batch);
            }
        })
    }

    async fn remove_batch(&self, batch_id: &str, scope: &str) -> Result<(), DbError> {
        let key = batch_key(batch_id, scope);
        self.batches.write().remove(&key);
        Ok(())
    }
}

enum RowOp {
    Put(StoredEntity),
    Remove,
}

enum BatchOp {
    Put(StoredDomainEventBatch),
    Remove,
}

struct MemoryScope {
    rows: Arc<RwLock<HashMap<RowKey, StoredEntity>>>,
    batches: Arc<RwLock<HashMap<BatchKey, StoredDomainEventBatch>>>,
    row_reads: HashMap<RowKey, Option<StoredEntity>>,
    row_writes: HashMap<RowKey, RowOp>,
    batch_reads: HashMap<BatchKey, Option<StoredDomainEventBatch>>,
    batch_writes: HashMap<BatchKey, BatchOp>,
}

impl MemoryScope {
    fn observe_row(&mut self, key: &RowKey) -> Option<StoredEntity> {
        if let Some(op) = self.row_writes.get(key) {
            return match op {
                RowOp::Put(row) => Some(row.clone()),
                RowOp::Remove => None,
            };
        }
        let current = self.rows.read().get(key).cloned();
        self.row_reads.entry(key.clone()).or_insert_with(|| current.clone());
        current
    }
}

#[async_trait]
impl DatabaseScope for MemoryScope {
    async fn get_one(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        scope: &str,
    ) -> Result<Option<StoredEntity>, DbError> {
        let key = row_key(entity_type, entity_id, scope);
        Ok(self.observe_row(&key))
    }

    async fn store(&mut self, row: StoredEntity) -> Result<(), DbError> {
        let key = row_key(&row.entity_type, &row.entity_id, &row.scope);
        self.row_reads
            .entry(key.clone())
            .or_insert_with(|| self.rows.read().get(&key).cloned());
        self.row_writes.insert(key, RowOp::Put(row));
        Ok(())
    }

    async fn remove(&mut self, entity_type: &str, entity_id: &str, scope: &str) -> Result<(), DbError> {
        let key = row_key(entity_type, entity_id, scope);
        self.row_reads
            .entry(key.clone())
            .or_insert_with(|| self.rows.read().get(&key).cloned());
        self.row_writes.insert(key, RowOp::Remove);
        Ok(())
    }

    async fn store_batch(&mut self, batch: StoredDomainEventBatch) -> Result<(), DbError> {
        let key = batch_key(&batch.id, &batch.scope);
        self.batch_reads
            .entry(key.clone())
            .or_insert_with(|| self.batches.read().get(&key).cloned());
        self.batch_writes.insert(key, BatchOp::Put(batch));
        Ok(())
    }

    async fn remove_batch(&mut self, batch_id: &str, scope: &str) -> Result<(), DbError> {
        let key = batch_key(batch_id, scope);
        self.batch_reads
            .entry(key.clone())
            .or_insert_with(|| self.batches.read().get(&key).cloned());
        self.batch_writes.insert(key, BatchOp::Remove);
        Ok(())
    }

    async fn try_commit(self: Box<Self>) -> Result<bool, DbError> {
        let mut rows = self.rows.write();
        let mut batches = self.batches.write();

        for (key, expected) in &self.row_reads {
            if rows.get(key) != expected.as_ref() {
                return Ok(false);
            }
        }
        for (key, expected) in &self.batch_reads {
            if batches.get(key) != expected.as_ref() {
                return Ok(false);
            }
        }

        for (key, op) in self.row_writes {
            match op {
                RowOp::Put(row) => {
                    rows.insert(key, row);
                }
                RowOp::Remove => {
                    rows.remove(&key);
                }
            }
        }
        for (key, op) in self.batch_writes {
            match op {
                BatchOp::Put(batch) => {
                    batches.insert(key, batch);
                }
                BatchOp::Remove => {
                    batches.remove(&key);
                }
            }
        }

        Ok(true)
    }

    async fn rollback(self: Box<Self>) {}
}
