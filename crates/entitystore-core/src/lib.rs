//! The entity storage engine for `entitystore`.
//!
//! This crate has no opinion on what the entity payload type is, nor on
//! what backs the [`Database`](database::Database) trait; it implements the
//! load/commit algorithm and the surrounding concurrency model once, generic
//! over both.
//!
//! # Modules
//!
//! - [`load_result`] - the `EntityLoadResult` algebra (C1).
//! - [`scope`] - the query-result scope (C2).
//! - [`database`] - the pluggable storage backend seam (C3), plus an
//!   in-memory reference implementation.
//! - [`engine`] - the storage engine: revision cache, commit algorithm,
//!   startup drain (C4).
//! - [`uow`] - the unit of work: per-session tracked state and commit
//!   attempts (C5).
//! - [`session`] - the entity storage session, the user-facing façade (C6).
//! - [`query_processor`] - pluggable load policies (C7).
//! - [`pipeline`] - the commit-attempt pipeline (C8).
//! - [`dispatch`] - the domain-event outbox dispatcher (C9).
//! - [`error`] - this crate's fault-only error type.

pub mod database;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod load_result;
pub mod pipeline;
pub mod query_processor;
pub mod scope;
pub mod session;
pub mod uow;

pub use database::{Database, DatabaseScope, DbError};
pub use dispatch::{DispatchMessage, EventDispatcher, EventSink};
pub use engine::{EngineConfig, StorageEngine};
pub use error::Error;
pub use load_result::{EntityLoadResult, Found, NotFound, VerificationFailed, VerificationKind};
pub use pipeline::{CommitPipeline, CommitProcessor, ProcessorHandle};
pub use query_processor::{ByConcurrencyTokenQueryProcessor, ByRevisionRangeQueryProcessor, DefaultQueryProcessor, QueryExecutor, QueryProcessor};
pub use scope::{GlobalScope, Scope, GLOBAL_SCOPE_NAME};
pub use session::{EntityIdFactory, EntityMetadata, EntityStorage};
pub use uow::{CommitAttempt, CommitAttemptHandler, CommitEntry, CommitOperation, EntityCommitResult, TrackedEntry, TrackedState, UnitOfWork};
