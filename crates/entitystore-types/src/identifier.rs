//! Entity identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Uniquely names one aggregate: a `(type-tag, string id)` pair.
///
/// `(type_tag, id)` uniquely names an aggregate across the whole engine; the
/// type tag is a plain string rather than a Rust type because the engine is
/// generic over whatever entity types the host application defines (there is
/// no compile-time registry of entity types here, only a runtime one).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityIdentifier {
    type_tag: String,
    id: String,
}

impl EntityIdentifier {
    /// Build an identifier, validating that both components are well-formed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyTypeTag`] if `type_tag` is empty, or
    /// [`Error::EmptyEntityId`] if `id` is empty or entirely whitespace.
    pub fn new(type_tag: impl Into<String>, id: impl Into<String>) -> Result<Self, Error> {
        let type_tag = type_tag.into();
        let id = id.into();

        if type_tag.is_empty() {
            return Err(Error::EmptyTypeTag);
        }
        if id.trim().is_empty() {
            return Err(Error::EmptyEntityId(id));
        }

        Ok(Self { type_tag, id })
    }

    /// The entity's type tag (the row schema this identifier belongs to).
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// The entity's id within its type.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for EntityIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_tag, self.id)
    }
}
