//! The entity-load-result algebra (C1).
//!
//! A tagged sum rather than a class hierarchy: [`EntityLoadResult`] is either
//! [`Found`], [`NotFound`], or [`VerificationFailed`]. Capabilities that a
//! deep inheritance tree would model as subclasses are instead narrowing
//! functions returning `Option<_>` ([`EntityLoadResult::is_found`],
//! [`EntityLoadResult::is_verification_failed`]).

use entitystore_types::{ConcurrencyToken, ConcurrencyTokenFactory, EntityIdentifier, Revision};

use crate::scope::Scope;
use crate::uow::{TrackedEntry, TrackedState};

/// A successfully loaded entity.
#[derive(Debug, Clone)]
pub struct Found<E> {
    pub id: EntityIdentifier,
    pub entity: E,
    pub concurrency_token: ConcurrencyToken,
    pub revision: Revision,
    pub loaded_from_cache: bool,
    pub scope: String,
}

/// No row exists for the given identifier.
#[derive(Debug, Clone)]
pub struct NotFound {
    pub id: EntityIdentifier,
    pub loaded_from_cache: bool,
    pub scope: String,
}

/// Why a verification check rejected an otherwise-loadable row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationKind {
    ConcurrencyIssue,
    UnexpectedRevision,
}

/// A load that failed a query processor's verification, with the
/// underlying `Found` retained (if the row existed) purely as a diagnostic.
#[derive(Debug, Clone)]
pub struct VerificationFailed<E> {
    pub id: EntityIdentifier,
    pub kind: VerificationKind,
    pub found: Option<Found<E>>,
    /// Diagnostic only; never consulted for control flow.
    pub reason: String,
}

/// The outcome of loading one entity.
#[derive(Debug, Clone)]
pub enum EntityLoadResult<E> {
    Found(Found<E>),
    NotFound(NotFound),
    VerificationFailed(VerificationFailed<E>),
}

impl<E> EntityLoadResult<E> {
    pub fn id(&self) -> &EntityIdentifier {
        match self {
            Self::Found(f) => &f.id,
            Self::NotFound(n) => &n.id,
            Self::VerificationFailed(v) => &v.id,
        }
    }

    /// Narrows to `Found`, the only capability query that inspects the
    /// entity itself.
    pub fn is_found(&self) -> Option<&Found<E>> {
        match self {
            Self::Found(f) => Some(f),
            _ => None,
        }
    }

    pub fn into_found(self) -> Option<Found<E>> {
        match self {
            Self::Found(f) => Some(f),
            _ => None,
        }
    }

    /// Narrows to `VerificationFailed`.
    pub fn is_verification_failed(&self) -> Option<&VerificationFailed<E>> {
        match self {
            Self::VerificationFailed(v) => Some(v),
            _ => None,
        }
    }

    /// Revision carried by this result; `0` for `NotFound` and for an empty
    /// `VerificationFailed`.
    pub fn revision(&self) -> Revision {
        match self {
            Self::Found(f) => f.revision,
            Self::NotFound(_) => Revision::NONE,
            Self::VerificationFailed(v) => v.found.as_ref().map(|f| f.revision).unwrap_or(Revision::NONE),
        }
    }

    pub fn loaded_from_cache(&self) -> bool {
        match self {
            Self::Found(f) => f.loaded_from_cache,
            Self::NotFound(n) => n.loaded_from_cache,
            Self::VerificationFailed(v) => v.found.as_ref().map(|f| f.loaded_from_cache).unwrap_or(false),
        }
    }
}

impl<E: Clone> EntityLoadResult<E> {
    /// Returns a result whose `loaded_from_cache` flag equals `from_cache`.
    pub fn as_cached(self, from_cache: bool) -> Self {
        match self {
            Self::Found(mut f) => {
                f.loaded_from_cache = from_cache;
                Self::Found(f)
            }
            Self::NotFound(mut n) => {
                n.loaded_from_cache = from_cache;
                Self::NotFound(n)
            }
            Self::VerificationFailed(mut v) => {
                if let Some(found) = v.found.as_mut() {
                    found.loaded_from_cache = from_cache;
                }
                Self::VerificationFailed(v)
            }
        }
    }

    /// Returns a result whose entity (if any) is the scope-local clone.
    /// Scoping a `NotFound` is metadata-only.
    pub fn as_scoped_to(self, scope: &Scope<E>) -> Self {
        match self {
            Self::Found(mut f) => {
                f.entity = scope.scope_entity(&f.id, &f.entity);
                f.scope = scope.name().to_string();
                Self::Found(f)
            }
            Self::NotFound(n) => Self::NotFound(n),
            Self::VerificationFailed(mut v) => {
                if let Some(found) = v.found.as_mut() {
                    found.entity = scope.scope_entity(&found.id, &found.entity);
                    found.scope = scope.name().to_string();
                }
                Self::VerificationFailed(v)
            }
        }
    }

    /// Wraps the result for unit-of-work tracking, eagerly allocating the
    /// entry's future concurrency token.
    pub fn as_tracked(&self, factory: &dyn ConcurrencyTokenFactory) -> TrackedEntry<E> {
        let id = self.id().clone();
        let token = factory.create(&id);
        match self {
            Self::Found(f) => TrackedEntry::new(id, self.clone(), token, TrackedState::Unchanged),
            Self::NotFound(_) => TrackedEntry::new(id, self.clone(), token, TrackedState::NonExistent),
            Self::VerificationFailed(_) => TrackedEntry::new(id, self.clone(), token, TrackedState::NonExistent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn found(revision: u64, from_cache: bool) -> EntityLoadResult<String> {
        EntityLoadResult::Found(Found {
            id: EntityIdentifier::new("widget", "1").unwrap(),
            entity: "payload".to_string(),
            concurrency_token: ConcurrencyToken::new("t"),
            revision: Revision::new(revision),
            loaded_from_cache: from_cache,
            scope: String::new(),
        })
    }

    #[test]
    fn is_found_narrows_only_found_variant() {
        let result = found(1, false);
        assert!(result.is_found().is_some());

        let not_found = EntityLoadResult::<String>::NotFound(NotFound {
            id: EntityIdentifier::new("widget", "1").unwrap(),
            loaded_from_cache: false,
            scope: String::new(),
        });
        assert!(not_found.is_found().is_none());
    }

    #[test]
    fn as_cached_overwrites_the_flag_without_touching_other_fields() {
        let result = found(3, false).as_cached(true);
        let found = result.is_found().unwrap();
        assert!(found.loaded_from_cache);
        assert_eq!(found.revision, Revision::new(3));
    }

    #[test]
    fn not_found_revision_is_zero() {
        let not_found = EntityLoadResult::<String>::NotFound(NotFound {
            id: EntityIdentifier::new("widget", "1").unwrap(),
            loaded_from_cache: false,
            scope: String::new(),
        });
        assert_eq!(not_found.revision(), Revision::NONE);
    }
}
