//! Cache entries and the states views observe.
//!
//! Results are stored type-erased in [`QueryData`] so one store can hold every
//! query of the application. A typed view is recovered with
//! [`QueryData::decode`], which is a pointer downcast for values written by a
//! fetch and a JSON decode for values installed from a snapshot.

use cadence_core::{FetchError, QueryKey, Timestamp};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

type ErasedValue = Arc<dyn Any + Send + Sync>;
type EncodeFn = fn(&(dyn Any + Send + Sync)) -> Result<Value, serde_json::Error>;

fn encode_as<T>(value: &(dyn Any + Send + Sync)) -> Result<Value, serde_json::Error>
where
    T: Serialize + 'static,
{
    match value.downcast_ref::<T>() {
        Some(typed) => serde_json::to_value(typed),
        None => Err(serde::ser::Error::custom(format!(
            "stored value is not a {}",
            std::any::type_name::<T>()
        ))),
    }
}

/// A cached result value of any serializable type.
#[derive(Clone)]
pub struct QueryData {
    value: ErasedValue,
    encode: EncodeFn,
    type_name: &'static str,
}

impl QueryData {
    pub fn new<T>(value: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        Self::from_arc(Arc::new(value))
    }

    pub fn from_arc<T>(value: Arc<T>) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        Self {
            value,
            encode: encode_as::<T>,
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Raw JSON, as installed by hydration.
    pub fn from_json(value: Value) -> Self {
        Self::new(value)
    }

    /// Serialize the value for a snapshot.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        (self.encode)(self.value.as_ref())
    }

    /// Recover a typed view of the value.
    pub fn decode<T>(&self) -> Result<Arc<T>, serde_json::Error>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        if let Ok(typed) = Arc::clone(&self.value).downcast::<T>() {
            return Ok(typed);
        }
        let json = match self.value.downcast_ref::<Value>() {
            Some(raw) => raw.clone(),
            None => self.to_json()?,
        };
        serde_json::from_value(json).map(Arc::new)
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// True if both handles point at the same stored value.
    pub fn ptr_eq(&self, other: &QueryData) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for QueryData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryData")
            .field("type", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Idle,
    Loading,
    Success,
    Error,
}

/// Latest known state of one request identity.
///
/// Entries are owned by the [`crate::QueryStore`]; callers only ever see
/// clones.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub(crate) key: QueryKey,
    pub(crate) data: Option<QueryData>,
    pub(crate) status: QueryStatus,
    pub(crate) updated_at: Option<Timestamp>,
    pub(crate) stale_at: Option<Timestamp>,
    pub(crate) error: Option<FetchError>,
    pub(crate) error_count: u32,
    pub(crate) last_read_at: Timestamp,
    /// Bumped whenever a fetch already in flight must not overwrite the entry.
    pub(crate) generation: u64,
}

impl CacheEntry {
    pub(crate) fn idle(key: QueryKey, now: Timestamp) -> Self {
        Self {
            key,
            data: None,
            status: QueryStatus::Idle,
            updated_at: None,
            stale_at: None,
            error: None,
            error_count: 0,
            last_read_at: now,
            generation: 0,
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn data(&self) -> Option<&QueryData> {
        self.data.as_ref()
    }

    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// When the current value was produced.
    pub fn updated_at(&self) -> Option<Timestamp> {
        self.updated_at
    }

    pub fn stale_at(&self) -> Option<Timestamp> {
        self.stale_at
    }

    pub fn error(&self) -> Option<&FetchError> {
        self.error.as_ref()
    }

    /// Consecutive failed fetches since the last success.
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn last_read_at(&self) -> Timestamp {
        self.last_read_at
    }

    /// Whether the entry is due for a refresh at `now`.
    ///
    /// An entry without a deadline (never succeeded) is always stale.
    pub fn is_stale(&self, now: Timestamp) -> bool {
        self.stale_at.map_or(true, |deadline| now >= deadline)
    }

    /// Whether the entry was explicitly invalidated.
    pub fn is_invalidated(&self) -> bool {
        self.stale_at == Some(DateTime::<Utc>::MIN_UTC)
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub(crate) fn expire(&mut self) {
        self.stale_at = Some(DateTime::<Utc>::MIN_UTC);
        self.supersede();
    }

    /// Outdate any fetch started before this point.
    pub(crate) fn supersede(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    /// Status the entry settles to when no fetch is running.
    pub(crate) fn settled_status(&self) -> QueryStatus {
        if self.error.is_some() {
            QueryStatus::Error
        } else if self.data.is_some() {
            QueryStatus::Success
        } else {
            QueryStatus::Idle
        }
    }
}

pub(crate) fn deadline(from: Timestamp, window: Duration) -> Timestamp {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// What a view sees when it reads an identity.
///
/// Every view must handle all variants; a stale value can accompany an error.
#[derive(Debug, Clone)]
pub enum QueryState<T> {
    /// Nothing has been requested for this identity yet.
    Idle,
    /// First fetch in progress, no value to show.
    Loading,
    Success {
        data: Arc<T>,
        updated_at: Option<Timestamp>,
        /// A refresh is running in the background.
        is_fetching: bool,
    },
    Error {
        error: FetchError,
        stale: Option<Arc<T>>,
    },
}

impl<T> QueryState<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    /// Project a cache entry into a typed state.
    pub fn from_entry(entry: Option<&CacheEntry>) -> Self {
        let Some(entry) = entry else {
            return Self::Idle;
        };
        let decoded = match entry.data.as_ref().map(QueryData::decode::<T>) {
            None => None,
            Some(Ok(value)) => Some(value),
            Some(Err(err)) => {
                return Self::Error {
                    error: FetchError::Decode {
                        key: entry.key.to_string(),
                        reason: err.to_string(),
                    },
                    stale: None,
                }
            }
        };
        match (entry.status, decoded) {
            (QueryStatus::Error, stale) => Self::Error {
                error: entry
                    .error
                    .clone()
                    .unwrap_or_else(|| FetchError::transient("unknown failure")),
                stale,
            },
            (QueryStatus::Idle, None) => Self::Idle,
            (QueryStatus::Loading, None) | (QueryStatus::Success, None) => Self::Loading,
            (status, Some(data)) => Self::Success {
                data,
                updated_at: entry.updated_at,
                is_fetching: status == QueryStatus::Loading,
            },
        }
    }
}

impl<T> QueryState<T> {
    /// The value to render, fresh or stale.
    pub fn data(&self) -> Option<&Arc<T>> {
        match self {
            Self::Success { data, .. } => Some(data),
            Self::Error { stale, .. } => stale.as_ref(),
            Self::Idle | Self::Loading => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            Self::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Track {
        name: String,
    }

    fn key() -> QueryKey {
        QueryKey::new("track").unwrap().arg("42")
    }

    #[test]
    fn test_decode_same_type_is_pointer_downcast() {
        let data = QueryData::new(Track {
            name: "X".to_string(),
        });
        let a = data.decode::<Track>().unwrap();
        let b = data.decode::<Track>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_decode_from_hydrated_json() {
        let data = QueryData::from_json(json!({"name": "X"}));
        let track = data.decode::<Track>().unwrap();
        assert_eq!(track.name, "X");
    }

    #[test]
    fn test_decode_wrong_shape_fails() {
        let data = QueryData::from_json(json!({"title": 3}));
        assert!(data.decode::<Track>().is_err());
    }

    #[test]
    fn test_to_json_failure_for_non_string_map_keys() {
        let mut map: HashMap<(u8, u8), u8> = HashMap::new();
        map.insert((1, 2), 3);
        let data = QueryData::new(map);
        assert!(data.to_json().is_err());
    }

    #[test]
    fn test_idle_entry_is_stale() {
        let entry = CacheEntry::idle(key(), DateTime::UNIX_EPOCH);
        assert!(entry.is_stale(DateTime::UNIX_EPOCH));
        assert!(!entry.is_invalidated());
    }

    #[test]
    fn test_expired_entry_reports_invalidated() {
        let mut entry = CacheEntry::idle(key(), DateTime::UNIX_EPOCH);
        entry.stale_at = Some(deadline(DateTime::UNIX_EPOCH, Duration::from_secs(60)));
        assert!(!entry.is_stale(DateTime::UNIX_EPOCH));
        entry.expire();
        assert!(entry.is_invalidated());
        assert!(entry.is_stale(DateTime::UNIX_EPOCH));
        assert_eq!(entry.generation, 1);
    }

    #[test]
    fn test_state_error_keeps_stale_value() {
        let mut entry = CacheEntry::idle(key(), DateTime::UNIX_EPOCH);
        entry.data = Some(QueryData::new(Track {
            name: "X".to_string(),
        }));
        entry.status = QueryStatus::Error;
        entry.error = Some(FetchError::transient("offline"));

        let state = QueryState::<Track>::from_entry(Some(&entry));
        assert_eq!(state.error(), Some(&FetchError::transient("offline")));
        assert_eq!(state.data().unwrap().name, "X");
    }

    #[test]
    fn test_state_loading_with_value_is_fetching_success() {
        let mut entry = CacheEntry::idle(key(), DateTime::UNIX_EPOCH);
        entry.data = Some(QueryData::new(Track {
            name: "X".to_string(),
        }));
        entry.status = QueryStatus::Loading;

        match QueryState::<Track>::from_entry(Some(&entry)) {
            QueryState::Success { is_fetching, .. } => assert!(is_fetching),
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[test]
    fn test_state_without_entry_is_idle() {
        assert!(matches!(
            QueryState::<Track>::from_entry(None),
            QueryState::Idle
        ));
    }
}
