//! Domain events raised by entity mutations.

use serde::{Deserialize, Serialize};

/// One domain event raised during a create/update/delete.
///
/// The payload is opaque to the engine — it is whatever bytes the host
/// application's entity-to-event codec produced (typically `serde_json`
/// output), the same way `ormdb_core::storage::Record` treats its `data`
/// field as an opaque blob the caller owns the shape of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    event_type: String,
    payload: Vec<u8>,
}

impl DomainEvent {
    /// Build an event from a type tag and raw payload bytes.
    pub fn new(event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Build an event from a type tag and a `serde`-serializable payload,
    /// encoded as JSON.
    pub fn from_json(event_type: impl Into<String>, payload: &impl Serialize) -> serde_json::Result<Self> {
        Ok(Self::new(event_type, serde_json::to_vec(payload)?))
    }

    /// The event's type tag.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the payload as JSON into `T`.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }
}
