//! Revision and epoch counters.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A monotonically non-decreasing per-entity version counter.
///
/// Starts at `0` (non-existent) and is incremented on each successful
/// create/update/delete-that-retains-events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Revision(u64);

impl Revision {
    /// The revision of an entity that has never existed.
    pub const NONE: Revision = Revision(0);

    /// Wrap a raw revision number.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw revision number.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The revision after one more successful mutation.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A counter on a stored entity row, incremented whenever a deleted row is
/// re-created or re-deleted.
///
/// Combined with `(type, id, revision)` this yields a globally unique name
/// for an event batch even across delete/recreate cycles on the same
/// entity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Epoch(u64);

impl Epoch {
    /// The initial epoch for a never-deleted entity.
    pub const ZERO: Epoch = Epoch(0);

    /// Wrap a raw epoch number.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw epoch number.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The epoch after one tombstone/recreate transition.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
