//! Selecting sets of request identities.

use cadence_core::QueryKey;
use std::fmt;
use std::sync::Arc;

type KeyPredicate = Arc<dyn Fn(&QueryKey) -> bool + Send + Sync>;

/// Selects cache entries for invalidation, dehydration, or eviction.
#[derive(Clone)]
pub enum KeyFilter {
    /// Every entry.
    All,
    /// One identity, compared structurally.
    Exact(QueryKey),
    /// Every identity whose leading segments equal the prefix.
    Prefix(QueryKey),
    /// Arbitrary caller-supplied predicate.
    Predicate(KeyPredicate),
}

impl KeyFilter {
    pub fn exact(key: QueryKey) -> Self {
        Self::Exact(key)
    }

    pub fn prefix(key: QueryKey) -> Self {
        Self::Prefix(key)
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&QueryKey) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            Self::All => true,
            Self::Exact(target) => key == target,
            Self::Prefix(prefix) => key.starts_with(prefix),
            Self::Predicate(f) => f(key),
        }
    }
}

impl From<QueryKey> for KeyFilter {
    fn from(key: QueryKey) -> Self {
        Self::Exact(key)
    }
}

impl fmt::Debug for KeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "All"),
            Self::Exact(key) => write!(f, "Exact({})", key),
            Self::Prefix(key) => write!(f, "Prefix({})", key),
            Self::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(parts: &[&str]) -> QueryKey {
        let mut key = QueryKey::new(parts[0]).unwrap();
        for part in &parts[1..] {
            key = key.arg(*part);
        }
        key
    }

    #[test]
    fn test_exact_matches_only_equal_key() {
        let filter = KeyFilter::exact(key(&["track", "42"]));
        assert!(filter.matches(&key(&["track", "42"])));
        assert!(!filter.matches(&key(&["track", "43"])));
        assert!(!filter.matches(&key(&["track"])));
    }

    #[test]
    fn test_prefix_matches_descendants() {
        let filter = KeyFilter::prefix(key(&["artist", "7"]));
        assert!(filter.matches(&key(&["artist", "7"])));
        assert!(filter.matches(&key(&["artist", "7", "releases"])));
        assert!(!filter.matches(&key(&["artist", "8"])));
    }

    #[test]
    fn test_predicate_filter() {
        let filter = KeyFilter::predicate(|k| k.entity() == "moderation_queue");
        assert!(filter.matches(&key(&["moderation_queue", "open"])));
        assert!(!filter.matches(&key(&["track", "1"])));
        assert_eq!(format!("{:?}", filter), "Predicate(..)");
    }
}
