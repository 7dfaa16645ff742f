//! Commit pipeline (C8).
//!
//! Wraps the storage engine with a chain of [`CommitProcessor`] stages, each
//! seeing the finished [`CommitAttempt`] before the next stage (or, at the
//! end of the chain, the engine itself, via the same
//! [`CommitAttemptHandler`] seam the unit of work uses). Stages compose in
//! reverse registration order: the most recently registered stage runs
//! first, wrapping everything registered before it.
//!
//! The processor registry is a [`DashMap`], so concurrent `register`/
//! `unregister` calls only ever contend on the shard their key falls into.
//! Walking the registry to build the actual call chain on every commit
//! would still mean paying for however many stages are registered on every
//! single commit, so the flattened chain is compiled once and cached behind
//! a small mutex: a commit takes the mutex just long enough to clone the
//! cached `Arc`, and a registry mutation simply clears the cache so the
//! next commit rebuilds it. Two commits racing to rebuild after a clear
//! compute the same chain (it's a pure function of the registry's
//! contents), so the redundant work is harmless.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::Error;
use crate::uow::{CommitAttempt, CommitAttemptHandler, EntityCommitResult};

/// One pipeline stage, sitting between the unit of work and whatever comes
/// after it in the chain.
#[async_trait::async_trait]
pub trait CommitProcessor<E>: Send + Sync {
    /// Process `attempt`, calling `next` to continue the chain. A stage that
    /// never calls `next` short-circuits everything after it, including the
    /// engine itself.
    async fn process(&self, attempt: CommitAttempt<E>, next: &dyn CommitAttemptHandler<E>) -> Result<EntityCommitResult, Error>;
}

/// A registration handle returned by [`CommitPipeline::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessorHandle(u64);

struct ChainLink<E> {
    stage: Arc<dyn CommitProcessor<E>>,
    rest: Arc<dyn CommitAttemptHandler<E>>,
}

#[async_trait::async_trait]
impl<E: Send + Sync + 'static> CommitAttemptHandler<E> for ChainLink<E> {
    async fn commit(&self, attempt: CommitAttempt<E>) -> Result<EntityCommitResult, Error> {
        self.stage.process(attempt, self.rest.as_ref()).await
    }
}

/// A commit pipeline terminating in `terminal`, normally the storage
/// engine. Implements [`CommitAttemptHandler`] itself, so a unit of work
/// never needs to know whether it is committing straight to the engine or
/// through a pipeline wrapping it.
pub struct CommitPipeline<E> {
    terminal: Arc<dyn CommitAttemptHandler<E>>,
    processors: DashMap<u64, Arc<dyn CommitProcessor<E>>>,
    next_order: AtomicU64,
    compiled: Mutex<Option<Arc<dyn CommitAttemptHandler<E>>>>,
}

impl<E: Send + Sync + 'static> CommitPipeline<E> {
    pub fn new(terminal: Arc<dyn CommitAttemptHandler<E>>) -> Self {
        Self {
            terminal,
            processors: DashMap::new(),
            next_order: AtomicU64::new(0),
            compiled: Mutex::new(None),
        }
    }

    /// Registers a new stage. It will run before every stage already
    /// registered (and after every stage registered after it).
    pub fn register(&self, processor: Arc<dyn CommitProcessor<E>>) -> ProcessorHandle {
        let order = self.next_order.fetch_add(1, Ordering::SeqCst);
        self.processors.insert(order, processor);
        self.invalidate();
        ProcessorHandle(order)
    }

    /// Removes a previously registered stage. Returns `false` if `handle`
    /// does not name a currently registered stage.
    pub fn unregister(&self, handle: ProcessorHandle) -> bool {
        let removed = self.processors.remove(&handle.0).is_some();
        if removed {
            self.invalidate();
        }
        removed
    }

    pub fn stage_count(&self) -> usize {
        self.processors.len()
    }

    fn invalidate(&self) {
        *self.compiled.lock() = None;
    }

    fn compiled_chain(&self) -> Arc<dyn CommitAttemptHandler<E>> {
        {
            let cached = self.compiled.lock();
            if let Some(chain) = cached.as_ref() {
                return chain.clone();
            }
        }

        let mut cached = self.compiled.lock();
        if let Some(chain) = cached.as_ref() {
            return chain.clone();
        }

        let mut entries: Vec<(u64, Arc<dyn CommitProcessor<E>>)> =
            self.processors.iter().map(|kv| (*kv.key(), kv.value().clone())).collect();
        entries.sort_by_key(|(order, _)| *order);

        let mut chain: Arc<dyn CommitAttemptHandler<E>> = self.terminal.clone();
        for (_, processor) in entries {
            chain = Arc::new(ChainLink { stage: processor, rest: chain });
        }

        *cached = Some(chain.clone());
        chain
    }
}

#[async_trait::async_trait]
impl<E: Send + Sync + 'static> CommitAttemptHandler<E> for CommitPipeline<E> {
    async fn commit(&self, attempt: CommitAttempt<E>) -> Result<EntityCommitResult, Error> {
        self.compiled_chain().commit(attempt).await
    }
}
