//! Stored row shapes: entities and their event batches.

use serde::{Deserialize, Serialize};

use crate::{ConcurrencyToken, DomainEvent, Epoch, Revision};

/// One stored entity row.
///
/// Invariant: `is_marked_as_deleted` iff `entity.is_none()`. A delete with no
/// associated events removes the row entirely rather than producing a
/// tombstone; a delete with events keeps this row around (as a tombstone) so
/// future events on the same id can still be addressed uniquely (see
/// [`Epoch`]). An events-only append against an id with no live row (never
/// created, or already tombstoned) persists or bumps this same kind of
/// marker row for the same reason, even though the append itself never
/// produces a `Found` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntity {
    /// Entity type tag.
    pub entity_type: String,
    /// Entity id within its type.
    pub entity_id: String,
    /// Data-partition scope this row lives in (empty string = global).
    pub scope: String,
    /// Current revision.
    pub revision: Revision,
    /// Current optimistic-concurrency token.
    pub concurrency_token: ConcurrencyToken,
    /// Whether this row is a tombstone.
    pub is_marked_as_deleted: bool,
    /// Tombstone/recreate transition counter.
    pub epoch: Epoch,
    /// Host-serialized entity bytes, or `None` for a tombstone.
    pub entity: Option<Vec<u8>>,
}

impl StoredEntity {
    /// Build a live (non-deleted) row.
    pub fn live(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        scope: impl Into<String>,
        revision: Revision,
        concurrency_token: ConcurrencyToken,
        epoch: Epoch,
        entity: Vec<u8>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            scope: scope.into(),
            revision,
            concurrency_token,
            is_marked_as_deleted: false,
            epoch,
            entity: Some(entity),
        }
    }

    /// Build a tombstone row.
    pub fn tombstone(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        scope: impl Into<String>,
        revision: Revision,
        concurrency_token: ConcurrencyToken,
        epoch: Epoch,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            scope: scope.into(),
            revision,
            concurrency_token,
            is_marked_as_deleted: true,
            epoch,
            entity: None,
        }
    }

    /// The row's *effective revision*: `0` if the row is absent or marked
    /// deleted, else its recorded revision. Callers that already know a row
    /// doesn't exist should use [`Revision::NONE`] directly rather than
    /// constructing a row to pass through this method.
    pub fn effective_revision(&self) -> Revision {
        if self.is_marked_as_deleted {
            Revision::NONE
        } else {
            self.revision
        }
    }
}

/// One persisted batch of domain events raised by a single commit entry.
///
/// Its primary key is deterministically derived from
/// `(entity_type, entity_id, entity_revision, entity_epoch, scope)` via
/// [`StoredDomainEventBatch::batch_id`], so at most one batch exists per
/// `(epoch, revision)` pair for a given entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDomainEventBatch {
    /// Deterministic batch id, see [`StoredDomainEventBatch::batch_id`].
    pub id: String,
    /// Entity type tag.
    pub entity_type: String,
    /// Entity id within its type.
    pub entity_id: String,
    /// The entity revision this batch was raised against.
    pub entity_revision: Revision,
    /// The entity epoch this batch was raised against.
    pub entity_epoch: Epoch,
    /// Data-partition scope.
    pub scope: String,
    /// Whether this batch is the one that deleted the entity (the positive
    /// reading: `true` means dispatching this batch may also retire the
    /// entity's tombstone row, per the engine's dispatch algorithm).
    pub entity_deleted: bool,
    /// The events in commit order.
    pub events: Vec<DomainEvent>,
}

impl StoredDomainEventBatch {
    /// Build a batch, computing its deterministic id from the given key
    /// components.
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        entity_revision: Revision,
        entity_epoch: Epoch,
        scope: impl Into<String>,
        entity_deleted: bool,
        events: Vec<DomainEvent>,
    ) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        let scope = scope.into();
        let id = Self::batch_id(&entity_type, &entity_id, entity_revision, entity_epoch, &scope);

        Self {
            id,
            entity_type,
            entity_id,
            entity_revision,
            entity_epoch,
            scope,
            entity_deleted,
            events,
        }
    }

    /// Deterministically derive a batch id from its key components.
    ///
    /// Hashing the tuple (rather than concatenating it into a delimited
    /// string) sidesteps any ambiguity from a type tag or scope containing
    /// the delimiter, while still guaranteeing global uniqueness over time:
    /// the `(revision, epoch)` pair never repeats for a given
    /// `(entity_type, entity_id, scope)`, including across
    /// delete-then-recreate cycles, because [`Epoch`] is bumped on every
    /// tombstone/recreate transition.
    pub fn batch_id(
        entity_type: &str,
        entity_id: &str,
        entity_revision: Revision,
        entity_epoch: Epoch,
        scope: &str,
    ) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(entity_type.as_bytes());
        hasher.update(&[0]);
        hasher.update(entity_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(&entity_revision.value().to_be_bytes());
        hasher.update(&entity_epoch.value().to_be_bytes());
        hasher.update(scope.as_bytes());
        hex::encode(hasher.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_revision_is_zero_for_tombstone() {
        let row = StoredEntity::tombstone(
            "User",
            "u-1",
            "",
            Revision::new(3),
            ConcurrencyToken::new("t"),
            Epoch::ZERO,
        );
        assert_eq!(row.effective_revision(), Revision::NONE);
    }

    #[test]
    fn effective_revision_is_recorded_for_live_row() {
        let row = StoredEntity::live(
            "User",
            "u-1",
            "",
            Revision::new(3),
            ConcurrencyToken::new("t"),
            Epoch::ZERO,
            b"{}".to_vec(),
        );
        assert_eq!(row.effective_revision(), Revision::new(3));
    }

    #[test]
    fn batch_id_is_deterministic_and_unique_per_revision_epoch() {
        let id_a = StoredDomainEventBatch::batch_id("User", "u-1", Revision::new(1), Epoch::ZERO, "");
        let id_a_again = StoredDomainEventBatch::batch_id("User", "u-1", Revision::new(1), Epoch::ZERO, "");
        let id_b = StoredDomainEventBatch::batch_id("User", "u-1", Revision::new(2), Epoch::ZERO, "");
        let id_epoch_bumped =
            StoredDomainEventBatch::batch_id("User", "u-1", Revision::new(1), Epoch::new(1), "");

        assert_eq!(id_a, id_a_again);
        assert_ne!(id_a, id_b);
        assert_ne!(id_a, id_epoch_bumped);
    }
}
