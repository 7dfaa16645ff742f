//! Shared domain types for `entitystore`.
//!
//! This crate defines the vocabulary the storage engine, the unit of work,
//! and the entity storage session all agree on: identifiers, concurrency
//! tokens, revisions/epochs, domain events, and the stored-row shapes.
//!
//! # Modules
//!
//! - [`identifier`] - `EntityIdentifier`, the `(type, id)` pair naming an
//!   aggregate.
//! - [`token`] - `ConcurrencyToken` and its factory trait.
//! - [`revision`] - `Revision` and `Epoch` counters.
//! - [`event`] - `DomainEvent`.
//! - [`row`] - `StoredEntity` and `StoredDomainEventBatch`, the persisted
//!   row shapes.
//! - [`error`] - Argument-fault errors raised while constructing these
//!   types.

pub mod error;
pub mod event;
pub mod identifier;
pub mod revision;
pub mod row;
pub mod token;

pub use error::Error;
pub use event::DomainEvent;
pub use identifier::EntityIdentifier;
pub use revision::{Epoch, Revision};
pub use row::{StoredDomainEventBatch, StoredEntity};
pub use token::{ConcurrencyToken, ConcurrencyTokenFactory, RandomConcurrencyTokenFactory};
