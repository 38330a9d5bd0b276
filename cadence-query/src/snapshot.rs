//! Snapshot codec: capture part of a store, ship it, install it elsewhere.
//!
//! A [`Snapshot`] carries only identity, value and timestamp for each entry.
//! Its id is the SHA-256 of the canonical entry list, so applying the same
//! snapshot twice can be detected and skipped.
//!
//! Installation is newest-wins: a snapshot entry never overwrites a local
//! entry whose timestamp is the same or newer. Such conflicts are counted,
//! not reported as errors.

use cadence_core::{QueryKey, SnapshotError, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::{debug, warn};

use crate::entry::{QueryData, QueryStatus};
use crate::filter::KeyFilter;
use crate::stats::Counters;
use crate::store::QueryStore;

/// Content-derived snapshot identity (hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub key: QueryKey,
    pub data: Value,
    pub updated_at: Timestamp,
}

/// Immutable copy of selected cache entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    id: SnapshotId,
    entries: Vec<SnapshotEntry>,
}

fn digest(entries: &[SnapshotEntry]) -> Result<SnapshotId, SnapshotError> {
    let bytes = serde_json::to_vec(entries).map_err(|e| SnapshotError::Payload {
        reason: e.to_string(),
    })?;
    Ok(SnapshotId(hex::encode(Sha256::digest(&bytes))))
}

impl Snapshot {
    /// Build a snapshot from entries, ordering them canonically.
    pub fn from_entries(mut entries: Vec<SnapshotEntry>) -> Result<Self, SnapshotError> {
        entries.sort_by_cached_key(|entry| entry.key.to_string());
        let id = digest(&entries)?;
        Ok(Self { id, entries })
    }

    pub fn id(&self) -> &SnapshotId {
        &self.id
    }

    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
        self.entries.iter().map(|entry| &entry.key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode as JSON that can sit inside an HTML `<script>` element.
    ///
    /// `<`, `>`, `&`, U+2028 and U+2029 only ever occur inside JSON strings,
    /// so replacing them with `\u` escapes keeps the document valid JSON.
    pub fn to_payload(&self) -> Result<String, SnapshotError> {
        let json = serde_json::to_string(self).map_err(|e| SnapshotError::Payload {
            reason: e.to_string(),
        })?;
        let mut out = String::with_capacity(json.len() + 16);
        for c in json.chars() {
            match c {
                '<' => out.push_str("\\u003c"),
                '>' => out.push_str("\\u003e"),
                '&' => out.push_str("\\u0026"),
                '\u{2028}' => out.push_str("\\u2028"),
                '\u{2029}' => out.push_str("\\u2029"),
                c => out.push(c),
            }
        }
        Ok(out)
    }

    /// Decode a payload produced by [`Snapshot::to_payload`], verifying its id.
    pub fn from_payload(payload: &str) -> Result<Self, SnapshotError> {
        let snapshot: Snapshot =
            serde_json::from_str(payload).map_err(|e| SnapshotError::Payload {
                reason: e.to_string(),
            })?;
        let expected = digest(&snapshot.entries)?;
        if expected != snapshot.id {
            return Err(SnapshotError::Payload {
                reason: format!(
                    "snapshot id {} does not match its contents ({expected})",
                    snapshot.id
                ),
            });
        }
        Ok(snapshot)
    }
}

/// Result of [`dehydrate_report`].
#[derive(Debug, Clone)]
pub struct Dehydration {
    pub snapshot: Snapshot,
    /// Entries left out because their value could not be serialized.
    pub excluded: Vec<SnapshotError>,
}

/// Capture every successful entry accepted by `filter`.
pub fn dehydrate(store: &QueryStore, filter: &KeyFilter) -> Result<Snapshot, SnapshotError> {
    dehydrate_report(store, filter).map(|report| report.snapshot)
}

/// Like [`dehydrate`], also listing entries excluded for serialization failures.
///
/// An unserializable value never fails the snapshot; the entry is logged and
/// skipped. Only entries with status success and a timestamp are captured.
pub fn dehydrate_report(
    store: &QueryStore,
    filter: &KeyFilter,
) -> Result<Dehydration, SnapshotError> {
    let mut entries = Vec::new();
    let mut excluded = Vec::new();
    for entry in store.entries_matching(filter) {
        if entry.status() != QueryStatus::Success {
            continue;
        }
        let (Some(data), Some(updated_at)) = (entry.data(), entry.updated_at()) else {
            continue;
        };
        match data.to_json() {
            Ok(data) => entries.push(SnapshotEntry {
                key: entry.key().clone(),
                data,
                updated_at,
            }),
            Err(err) => {
                warn!(key = %entry.key(), error = %err, "entry excluded from snapshot");
                excluded.push(SnapshotError::Serialization {
                    key: entry.key().to_string(),
                    reason: err.to_string(),
                });
            }
        }
    }

    let snapshot = Snapshot::from_entries(entries)?;
    debug!(
        snapshot = %snapshot.id(),
        entries = snapshot.len(),
        excluded = excluded.len(),
        "dehydrated store"
    );
    Ok(Dehydration { snapshot, excluded })
}

/// Outcome of installing a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HydrationReport {
    pub installed: usize,
    /// Entries discarded because the local copy was as new or newer.
    pub conflicts: usize,
}

/// Merge `snapshot` into `store`, newest-wins.
///
/// Installed entries stay fresh for the store's hydration stale time,
/// counted from their original timestamp. Applying the same snapshot again
/// installs nothing.
pub fn hydrate(snapshot: &Snapshot, store: &QueryStore) -> HydrationReport {
    let stale_time = store.config().hydration_stale_time;
    let mut report = HydrationReport::default();
    for entry in snapshot.entries() {
        let installed = store.install_if_newer(
            &entry.key,
            QueryData::from_json(entry.data.clone()),
            entry.updated_at,
            stale_time,
        );
        if installed {
            report.installed += 1;
        } else {
            debug!(key = %entry.key, "local entry is newer, snapshot entry discarded");
            report.conflicts += 1;
        }
    }

    let counters = store.counters();
    Counters::add(&counters.hydrated, report.installed as u64);
    Counters::add(&counters.hydration_conflicts, report.conflicts as u64);
    debug!(
        snapshot = %snapshot.id(),
        installed = report.installed,
        conflicts = report.conflicts,
        "hydrated store"
    );
    report
}
