//! Core engine errors.
//!
//! Per the crate's error-handling design, expected outcomes
//! (`EntityCommitResult::ConcurrencyFailure`, `EntityLoadResult::NotFound`,
//! `EntityLoadResult::VerificationFailed`) are plain values, never
//! represented here. `Error` is reserved for faults: disposed engines,
//! programmer errors, and whatever the `Database` implementation reports as
//! a transient or permanent failure.

use thiserror::Error;

use crate::database::DbError;

/// Core engine errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The database reported a fault while reading, writing, or committing.
    #[error("database error: {0}")]
    Database(#[from] DbError),

    /// A domain type could not be constructed (e.g. an empty entity id).
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] entitystore_types::Error),

    /// A programmer error: a null/invalid argument, a default
    /// `EntityIdentifier`, or an invalid unit-of-work state transition.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// The engine (or the session/unit of work using it) has been disposed;
    /// any further operation against it is a fault, including in-flight
    /// operations that observe cancellation at a suspension point.
    #[error("engine has been disposed")]
    Disposed,
}
