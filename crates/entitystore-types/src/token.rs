//! Optimistic-concurrency tokens.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque value stamping a version of an entity for optimistic
/// concurrency checks.
///
/// `ConcurrencyToken::default()` is the sentinel "no expectation" value: it
/// compares equal to itself but is never produced by
/// [`ConcurrencyTokenFactory::create`](crate::ConcurrencyTokenFactory::create)
/// and callers must treat it as "don't check" rather than as a real stamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ConcurrencyToken(String);

impl ConcurrencyToken {
    /// Wrap a raw token value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Whether this is the sentinel "no expectation" value.
    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw token value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produces fresh [`ConcurrencyToken`] values for an entity.
///
/// Implementations must never reuse a value within the logical lifetime of
/// an entity identifier and must never return the default/sentinel token.
pub trait ConcurrencyTokenFactory: Send + Sync {
    /// Mint a fresh, non-default token for the given identifier.
    fn create(&self, id: &crate::EntityIdentifier) -> ConcurrencyToken;
}

/// A [`ConcurrencyTokenFactory`] backed by random UUID-shaped strings.
///
/// This is the reference implementation used by the crate's own tests and
/// suitable as a default for host applications that have no stronger
/// requirement (e.g. content-addressed tokens).
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomConcurrencyTokenFactory;

impl ConcurrencyTokenFactory for RandomConcurrencyTokenFactory {
    fn create(&self, _id: &crate::EntityIdentifier) -> ConcurrencyToken {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::time::{SystemTime, UNIX_EPOCH};

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before Unix epoch")
            .as_nanos();
        let counter = COUNTER.fetch_add(1, Ordering::SeqCst);

        ConcurrencyToken::new(format!("{now:x}-{counter:x}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityIdentifier;

    #[test]
    fn default_token_is_sentinel() {
        assert!(ConcurrencyToken::default().is_default());
        assert!(!ConcurrencyToken::new("abc").is_default());
    }

    #[test]
    fn factory_never_returns_default() {
        let factory = RandomConcurrencyTokenFactory;
        let id = EntityIdentifier::new("User", "u-1").unwrap();
        for _ in 0..100 {
            assert!(!factory.create(&id).is_default());
        }
    }

    #[test]
    fn factory_values_are_unique() {
        let factory = RandomConcurrencyTokenFactory;
        let id = EntityIdentifier::new("User", "u-1").unwrap();
        let a = factory.create(&id);
        let b = factory.create(&id);
        assert_ne!(a, b);
    }
}
