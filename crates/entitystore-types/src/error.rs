//! Errors raised while constructing domain types.

use thiserror::Error;

/// Errors that can occur while building a value in this crate.
///
/// These are argument faults (see the crate's error-handling design): they
/// signal a programmer error, not an expected runtime outcome, and are never
/// produced by the storage engine's load/commit paths.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// An `EntityIdentifier`'s id component was empty or all whitespace.
    #[error("entity id must be non-empty and non-whitespace, got {0:?}")]
    EmptyEntityId(String),

    /// An `EntityIdentifier`'s type tag was empty.
    #[error("entity type tag must be non-empty")]
    EmptyTypeTag,
}
