//! Catalogue of remote graph operations.
//!
//! Every query the platform issues is declared here exactly once, with one
//! staleness window. Every mutation declares the query entities it makes
//! stale. Call sites look operations up by name instead of restating
//! documents, windows or invalidation lists, so two pages requesting the
//! same operation always cache it the same way.

use cadence_core::{ConfigError, QueryKey};
use cadence_query::{InvalidationRouter, KeyFilter};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::guard::Role;

const EVERYONE: &[Role] = Role::ALL;
const CREATORS: &[Role] = &[Role::Artist, Role::Moderator, Role::Admin];
const STAFF: &[Role] = &[Role::Moderator, Role::Admin];
const ROYALTY_HOLDERS: &[Role] = &[Role::Artist, Role::Admin];

/// A named, parameterized read.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOperation {
    pub name: &'static str,
    pub document: &'static str,
    /// Field of the response `data` object holding the result.
    pub root_field: &'static str,
    pub stale_time: Duration,
    pub roles: &'static [Role],
}

/// A named remote write.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOperation {
    pub name: &'static str,
    pub document: &'static str,
    pub root_field: &'static str,
    /// Query entities made stale when the write succeeds.
    pub invalidates: &'static [&'static str],
    pub roles: &'static [Role],
}

pub const PLATFORM_QUERIES: &[QueryOperation] = &[
    QueryOperation {
        name: "track",
        document: "query track($id: ID!) { track(id: $id) { id title durationMs likes artist { id name } } }",
        root_field: "track",
        stale_time: Duration::from_secs(60),
        roles: EVERYONE,
    },
    QueryOperation {
        name: "artist",
        document: "query artist($id: ID!) { artist(id: $id) { id name bio followers } }",
        root_field: "artist",
        stale_time: Duration::from_secs(300),
        roles: EVERYONE,
    },
    QueryOperation {
        name: "catalog",
        document: "query catalog($genre: String, $page: Int!) { catalog(genre: $genre, page: $page) { items { id title } nextPage } }",
        root_field: "catalog",
        stale_time: Duration::from_secs(30),
        roles: EVERYONE,
    },
    QueryOperation {
        name: "listenerLibrary",
        document: "query listenerLibrary { listenerLibrary { likedTracks { id title } followedArtists { id name } } }",
        root_field: "listenerLibrary",
        stale_time: Duration::from_secs(60),
        roles: &[Role::Listener],
    },
    QueryOperation {
        name: "artistReleases",
        document: "query artistReleases($artistId: ID!) { artistReleases(artistId: $artistId) { id title status } }",
        root_field: "artistReleases",
        stale_time: Duration::from_secs(30),
        roles: CREATORS,
    },
    QueryOperation {
        name: "artistRoyalties",
        document: "query artistRoyalties($artistId: ID!, $period: String!) { artistRoyalties(artistId: $artistId, period: $period) { period grossCents netCents } }",
        root_field: "artistRoyalties",
        stale_time: Duration::from_secs(120),
        roles: ROYALTY_HOLDERS,
    },
    QueryOperation {
        name: "escrowBalance",
        document: "query escrowBalance($artistId: ID!) { escrowBalance(artistId: $artistId) { heldCents releasableCents } }",
        root_field: "escrowBalance",
        stale_time: Duration::from_secs(15),
        roles: ROYALTY_HOLDERS,
    },
    QueryOperation {
        name: "moderationQueue",
        document: "query moderationQueue($status: String!) { moderationQueue(status: $status) { id releaseId submittedAt } }",
        root_field: "moderationQueue",
        stale_time: Duration::from_secs(10),
        roles: STAFF,
    },
    QueryOperation {
        name: "adminPayouts",
        document: "query adminPayouts($status: String!) { adminPayouts(status: $status) { id artistId amountCents status } }",
        root_field: "adminPayouts",
        stale_time: Duration::from_secs(30),
        roles: &[Role::Admin],
    },
];

pub const PLATFORM_MUTATIONS: &[MutationOperation] = &[
    MutationOperation {
        name: "likeTrack",
        document: "mutation likeTrack($trackId: ID!) { likeTrack(trackId: $trackId) { id likes } }",
        root_field: "likeTrack",
        invalidates: &["track", "listenerLibrary"],
        roles: EVERYONE,
    },
    MutationOperation {
        name: "followArtist",
        document: "mutation followArtist($artistId: ID!) { followArtist(artistId: $artistId) { id followers } }",
        root_field: "followArtist",
        invalidates: &["artist", "listenerLibrary"],
        roles: EVERYONE,
    },
    MutationOperation {
        name: "submitRelease",
        document: "mutation submitRelease($input: ReleaseInput!) { submitRelease(input: $input) { id status } }",
        root_field: "submitRelease",
        invalidates: &["artistReleases", "moderationQueue"],
        roles: CREATORS,
    },
    MutationOperation {
        name: "approveRelease",
        document: "mutation approveRelease($releaseId: ID!) { approveRelease(releaseId: $releaseId) { id status } }",
        root_field: "approveRelease",
        invalidates: &["moderationQueue", "artistReleases", "catalog"],
        roles: STAFF,
    },
    MutationOperation {
        name: "rejectRelease",
        document: "mutation rejectRelease($releaseId: ID!, $reason: String!) { rejectRelease(releaseId: $releaseId, reason: $reason) { id status } }",
        root_field: "rejectRelease",
        invalidates: &["moderationQueue", "artistReleases"],
        roles: STAFF,
    },
    MutationOperation {
        name: "requestPayout",
        document: "mutation requestPayout($artistId: ID!, $amountCents: Int!) { requestPayout(artistId: $artistId, amountCents: $amountCents) { id status } }",
        root_field: "requestPayout",
        invalidates: &["escrowBalance", "artistRoyalties", "adminPayouts"],
        roles: ROYALTY_HOLDERS,
    },
    MutationOperation {
        name: "settlePayout",
        document: "mutation settlePayout($payoutId: ID!) { settlePayout(payoutId: $payoutId) { id status } }",
        root_field: "settlePayout",
        invalidates: &["adminPayouts", "escrowBalance", "artistRoyalties"],
        roles: &[Role::Admin],
    },
];

/// Lookup table of every operation a client may issue.
#[derive(Debug, Clone, Default)]
pub struct OperationCatalog {
    queries: BTreeMap<&'static str, QueryOperation>,
    mutations: BTreeMap<&'static str, MutationOperation>,
}

impl OperationCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every operation of the platform's portals.
    pub fn platform() -> Self {
        let catalog = PLATFORM_QUERIES
            .iter()
            .cloned()
            .fold(Self::empty(), Self::with_query);
        PLATFORM_MUTATIONS
            .iter()
            .cloned()
            .fold(catalog, Self::with_mutation)
    }

    pub fn with_query(mut self, operation: QueryOperation) -> Self {
        self.queries.insert(operation.name, operation);
        self
    }

    pub fn with_mutation(mut self, operation: MutationOperation) -> Self {
        self.mutations.insert(operation.name, operation);
        self
    }

    /// Replace the staleness window of a query everywhere it is used.
    pub fn with_stale_time(mut self, name: &str, stale_time: Duration) -> Result<Self, ConfigError> {
        let operation = self
            .queries
            .get_mut(name)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "stale_times".to_string(),
                value: name.to_string(),
                reason: "not a known query operation".to_string(),
            })?;
        debug!(operation = name, ?stale_time, "staleness window overridden");
        operation.stale_time = stale_time;
        Ok(self)
    }

    pub fn query(&self, name: &str) -> Option<&QueryOperation> {
        self.queries.get(name)
    }

    pub fn mutation(&self, name: &str) -> Option<&MutationOperation> {
        self.mutations.get(name)
    }

    pub fn queries(&self) -> impl Iterator<Item = &QueryOperation> {
        self.queries.values()
    }

    pub fn mutations(&self) -> impl Iterator<Item = &MutationOperation> {
        self.mutations.values()
    }

    /// Check that every mutation only invalidates known queries.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for mutation in self.mutations.values() {
            if let Some(unknown) = mutation
                .invalidates
                .iter()
                .find(|entity| !self.queries.contains_key(**entity))
            {
                return Err(ConfigError::InvalidValue {
                    field: format!("{}.invalidates", mutation.name),
                    value: unknown.to_string(),
                    reason: "not a known query operation".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Register every mutation's invalidation list with `router`.
    ///
    /// Each listed entity becomes a prefix filter, so all variables of that
    /// query are invalidated. Returns the number of targets registered.
    pub fn register_invalidations(&self, router: &InvalidationRouter) -> usize {
        let mut registered = 0;
        for mutation in self.mutations.values() {
            for entity in mutation.invalidates {
                if let Ok(prefix) = QueryKey::new(*entity) {
                    router.register(mutation.name, KeyFilter::prefix(prefix));
                    registered += 1;
                }
            }
        }
        registered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_query::QueryStore;
    use std::collections::HashSet;

    #[test]
    fn test_platform_catalog_is_consistent() {
        let catalog = OperationCatalog::platform();
        catalog.validate().unwrap();
        assert_eq!(catalog.queries().count(), PLATFORM_QUERIES.len());
        assert_eq!(catalog.mutations().count(), PLATFORM_MUTATIONS.len());
    }

    #[test]
    fn test_operation_names_are_unique() {
        let mut seen = HashSet::new();
        for name in PLATFORM_QUERIES
            .iter()
            .map(|op| op.name)
            .chain(PLATFORM_MUTATIONS.iter().map(|op| op.name))
        {
            assert!(seen.insert(name), "duplicate operation {name}");
        }
    }

    #[test]
    fn test_root_fields_match_names() {
        for op in PLATFORM_QUERIES {
            assert_eq!(op.root_field, op.name);
            assert!(op.document.contains(op.name));
        }
    }

    #[test]
    fn test_stale_time_override() {
        let catalog = OperationCatalog::platform()
            .with_stale_time("track", Duration::from_secs(5))
            .unwrap();
        assert_eq!(
            catalog.query("track").unwrap().stale_time,
            Duration::from_secs(5)
        );
        assert!(OperationCatalog::platform()
            .with_stale_time("nope", Duration::ZERO)
            .is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_invalidation_target() {
        let catalog = OperationCatalog::empty().with_mutation(MutationOperation {
            name: "renameTrack",
            document: "mutation renameTrack { renameTrack { id } }",
            root_field: "renameTrack",
            invalidates: &["track"],
            roles: EVERYONE,
        });
        assert!(catalog.validate().is_err());
    }

    #[test]
    fn test_register_invalidations_with_router() {
        let catalog = OperationCatalog::platform();
        let router = InvalidationRouter::new(QueryStore::with_defaults());
        let expected: usize = PLATFORM_MUTATIONS.iter().map(|m| m.invalidates.len()).sum();
        assert_eq!(catalog.register_invalidations(&router), expected);
        assert_eq!(router.registered(&"approveRelease".into()).len(), 3);
    }
}
