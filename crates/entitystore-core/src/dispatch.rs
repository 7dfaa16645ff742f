//! Domain-event outbox dispatcher (C9).
//!
//! Drains persisted [`StoredDomainEventBatch`] rows to a user-supplied
//! [`EventSink`], retrying each event indefinitely with exponential backoff
//! bounded by `initial_delay`/`max_delay`. The backoff loop follows the
//! corpus's own retry idiom: `tokio::time::sleep` plus a doubling delay and
//! a `tracing::warn!` on each failed attempt.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use entitystore_types::{DomainEvent, StoredDomainEventBatch};

use crate::database::{Database, DbError};
use crate::error::Error;

/// One event handed to the sink, carrying enough of its originating batch's
/// context for the sink to correlate it back to an entity.
#[derive(Debug, Clone)]
pub struct DispatchMessage {
    pub entity_type: String,
    pub entity_id: String,
    pub event: DomainEvent,
}

/// The user-supplied collaborator domain events are delivered to.
///
/// `dispatch` returning `false` (rather than an `Err`) is what distinguishes
/// "the sink rejected this event, retry it" from a hard fault; sinks that
/// cannot distinguish the two should always return `true` and handle
/// retries internally.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn dispatch(&self, message: DispatchMessage) -> bool;
}

/// Drains the outbox for one [`Database`] into one [`EventSink`].
pub struct EventDispatcher<D> {
    database: Arc<D>,
    sink: Arc<dyn EventSink>,
    initial_delay: Duration,
    max_delay: Duration,
    cancellation: CancellationToken,
}

impl<D: Database> EventDispatcher<D> {
    pub fn new(
        database: Arc<D>,
        sink: Arc<dyn EventSink>,
        initial_delay: Duration,
        max_delay: Duration,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            database,
            sink,
            initial_delay,
            max_delay,
            cancellation,
        }
    }

    /// Dispatches every event in `batch` in order, then retires the batch:
    /// removes its row and, if it was the batch that deleted the entity,
    /// also removes the tombstone (provided it is still on the same epoch).
    #[instrument(skip(self, batch), fields(batch_id = %batch.id, entity_type = %batch.entity_type, entity_id = %batch.entity_id))]
    pub async fn dispatch_batch(&self, batch: StoredDomainEventBatch, scope: &str) -> Result<(), Error> {
        for event in &batch.events {
            self.deliver_with_backoff(&batch, event.clone()).await?;
        }
        self.retire_batch(&batch, scope).await
    }

    async fn deliver_with_backoff(&self, batch: &StoredDomainEventBatch, event: DomainEvent) -> Result<(), Error> {
        let mut current_delay = self.initial_delay;
        loop {
            if self.cancellation.is_cancelled() {
                return Err(Error::Disposed);
            }

            let message = DispatchMessage {
                entity_type: batch.entity_type.clone(),
                entity_id: batch.entity_id.clone(),
                event: event.clone(),
            };
            if self.sink.dispatch(message).await {
                return Ok(());
            }

            warn!(delay_ms = current_delay.as_millis(), "event dispatch failed, retrying after backoff");
            tokio::select! {
                _ = tokio::time::sleep(current_delay) => {}
                _ = self.cancellation.cancelled() => return Err(Error::Disposed),
            }
            current_delay = std::cmp::min(current_delay * 2, self.max_delay);
        }
    }

    async fn retire_batch(&self, batch: &StoredDomainEventBatch, scope: &str) -> Result<(), Error> {
        if !batch.entity_deleted {
            self.database
                .remove_batch(&batch.id, scope)
                .await
                .map_err(Error::Database)?;
            debug!("dispatched batch removed from outbox");
            return Ok(());
        }

        loop {
            let mut txn = self.database.create_scope().await;
            txn.remove_batch(&batch.id, scope).await.map_err(Error::Database)?;

            if let Some(row) = txn
                .get_one(&batch.entity_type, &batch.entity_id, scope)
                .await
                .map_err(Error::Database)?
            {
                if row.is_marked_as_deleted && row.epoch == batch.entity_epoch {
                    txn.remove(&batch.entity_type, &batch.entity_id, scope)
                        .await
                        .map_err(Error::Database)?;
                }
            }

            if txn.try_commit().await.map_err(Error::Database)? {
                debug!("dispatched batch retired, tombstone reclaimed");
                return Ok(());
            }
        }
    }

    /// Enumerates every pending batch in `scope`, used at engine startup.
    pub async fn pending_batches(&self, scope: &str) -> Result<Vec<StoredDomainEventBatch>, DbError> {
        let mut stream = self.database.get_all_batches(scope);
        let mut batches = Vec::new();
        while let Some(batch) = stream.next().await {
            batches.push(batch?);
        }
        Ok(batches)
    }
}
