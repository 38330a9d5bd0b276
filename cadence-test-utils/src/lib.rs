//! CADENCE Test Utilities
//!
//! Centralized test infrastructure for the Cadence workspace:
//! - Proptest generators for keys, timestamps and payload values
//! - Scripted fetch functions and a mock graph transport
//! - Test fixtures for common scenarios
//! - Custom assertions for cache state

pub use cadence_client::{GraphRequest, GraphResponse, GraphTransport};
pub use cadence_core::{
    Clock, FetchError, KeySegment, ManualClock, QueryKey, SharedClock, Timestamp,
};
pub use cadence_query::{
    AbortSignal, CacheEntry, QueryConfig, QueryDescriptor, QueryRead, QueryStatus, QueryStore,
    ReadSource,
};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

// ============================================================================
// SCRIPTED FETCHES
// ============================================================================

/// A fetch function that counts its calls and answers from a script.
///
/// Clones share the counter, the gate and the script. A gated fetch parks
/// every call until [`CountingFetch::open`] is called, so tests can line up
/// concurrent readers before anything resolves. Aborting a parked call
/// resolves it with [`FetchError::Cancelled`].
#[derive(Debug)]
pub struct CountingFetch<T> {
    calls: Arc<AtomicUsize>,
    value: Arc<Mutex<T>>,
    failures: Arc<Mutex<VecDeque<FetchError>>>,
    gate: Arc<watch::Sender<bool>>,
}

impl<T> Clone for CountingFetch<T> {
    fn clone(&self) -> Self {
        Self {
            calls: Arc::clone(&self.calls),
            value: Arc::clone(&self.value),
            failures: Arc::clone(&self.failures),
            gate: Arc::clone(&self.gate),
        }
    }
}

impl<T> CountingFetch<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// A fetch that resolves immediately with `value`.
    pub fn new(value: T) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            value: Arc::new(Mutex::new(value)),
            failures: Arc::new(Mutex::new(VecDeque::new())),
            gate: Arc::new(watch::channel(true).0),
        }
    }

    /// A fetch that parks every call until opened.
    pub fn gated(value: T) -> Self {
        let fetch = Self::new(value);
        fetch.gate.send_replace(false);
        fetch
    }

    /// Release parked calls and let later calls through.
    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    /// Park later calls again.
    pub fn close(&self) {
        self.gate.send_replace(false);
    }

    /// Value returned by later successful calls.
    pub fn set_value(&self, value: T) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }

    /// Make the next call fail with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, error: FetchError) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// Number of times the fetch function was invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Descriptor for `key` backed by this fetch.
    pub fn descriptor(&self, key: QueryKey) -> QueryDescriptor<T> {
        let fetch = self.clone();
        QueryDescriptor::new(key, move |signal: AbortSignal| {
            let fetch = fetch.clone();
            async move { fetch.call(signal).await }
        })
    }

    async fn call(&self, signal: AbortSignal) -> Result<T, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        tokio::select! {
            opened = gate.wait_for(|open| *open) => {
                if opened.is_err() {
                    return Err(FetchError::Cancelled);
                }
            }
            _ = signal.aborted() => return Err(FetchError::Cancelled),
        }
        let failure = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match failure {
            Some(error) => Err(error),
            None => Ok(self.value.lock().unwrap_or_else(PoisonError::into_inner).clone()),
        }
    }
}

// ============================================================================
// MOCK TRANSPORT
// ============================================================================

/// In-memory graph transport with one scripted reply per operation.
///
/// Every request is recorded. Operations without a scripted reply fail with
/// a remote error naming the operation.
#[derive(Debug, Default)]
pub struct MockTransport {
    replies: Mutex<HashMap<String, Result<GraphResponse, FetchError>>>,
    requests: Mutex<Vec<GraphRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `operation` with `{"data": {operation: value}}`.
    pub fn with_data(self, operation: &str, value: Value) -> Self {
        let mut data = serde_json::Map::new();
        data.insert(operation.to_string(), value);
        self.with_response(operation, GraphResponse::with_data(Value::Object(data)))
    }

    pub fn with_response(self, operation: &str, response: GraphResponse) -> Self {
        self.reply(operation, Ok(response));
        self
    }

    /// Fail `operation` before it produces a response.
    pub fn with_error(self, operation: &str, error: FetchError) -> Self {
        self.reply(operation, Err(error));
        self
    }

    /// Replace the reply for `operation` after construction.
    pub fn reply(&self, operation: &str, reply: Result<GraphResponse, FetchError>) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation.to_string(), reply);
    }

    /// All requests seen so far, in arrival order.
    pub fn requests(&self) -> Vec<GraphRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of requests seen for `operation`.
    pub fn request_count(&self, operation: &str) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|request| request.operation_name == operation)
            .count()
    }
}

#[async_trait]
impl GraphTransport for MockTransport {
    async fn execute(
        &self,
        request: GraphRequest,
        signal: AbortSignal,
    ) -> Result<GraphResponse, FetchError> {
        if signal.is_aborted() {
            return Err(FetchError::Cancelled);
        }
        let operation = request.operation_name.clone();
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&operation)
            .cloned()
            .unwrap_or_else(|| Err(FetchError::remote(format!("no reply scripted for {operation}"))))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use chrono::{DateTime, Utc};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    /// Generate an entity name.
    pub fn arb_entity() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("track".to_string()),
            Just("artist".to_string()),
            Just("catalog".to_string()),
            Just("escrowBalance".to_string()),
            "[a-z][a-zA-Z]{2,12}",
        ]
    }

    /// Generate a key segment. Floats never appear in keys.
    pub fn arb_segment() -> impl Strategy<Value = KeySegment> {
        let leaf = prop_oneof![
            Just(KeySegment::Null),
            any::<bool>().prop_map(KeySegment::Bool),
            any::<i64>().prop_map(KeySegment::Int),
            "[a-zA-Z0-9 _-]{0,16}".prop_map(KeySegment::Str),
        ];
        leaf.prop_recursive(3, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(KeySegment::List),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|fields: BTreeMap<String, KeySegment>| KeySegment::Map(fields)),
            ]
        })
    }

    /// Generate a query key with up to three argument segments.
    pub fn arb_query_key() -> impl Strategy<Value = QueryKey> {
        (arb_entity(), prop::collection::vec(arb_segment(), 0..3)).prop_filter_map(
            "entity must be a valid key head",
            |(entity, args)| {
                QueryKey::new(entity)
                    .ok()
                    .map(|key| args.into_iter().fold(key, |key, segment| key.arg(segment)))
            },
        )
    }

    /// Generate a timestamp between 2020 and 2030, at millisecond precision.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1_577_836_800_000i64..1_893_456_000_000i64).prop_map(|millis| {
            DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        })
    }

    /// Generate a JSON value without floats.
    pub fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            any::<String>().prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::hash_map("[a-zA-Z]{1,8}", inner, 0..4)
                    .prop_map(|fields| Value::Object(fields.into_iter().collect())),
            ]
        })
    }

    /// Generate text that is dangerous to embed in an HTML page.
    pub fn arb_hostile_text() -> impl Strategy<Value = String> {
        let fragment = prop_oneof![
            Just("</script>".to_string()),
            Just("<!--".to_string()),
            Just("&amp;".to_string()),
            Just("\u{2028}".to_string()),
            Just("\u{2029}".to_string()),
            Just("\"".to_string()),
            any::<String>(),
        ];
        prop::collection::vec(fragment, 0..6).prop_map(|parts| parts.concat())
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;
    use cadence_client::ClientConfig;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    /// Client configuration with no retry delay and short windows.
    pub const CLIENT_CONFIG_TOML: &str = r#"
endpoint = "http://graph.test/graphql"
request_timeout_ms = 5000

[cache]
default_stale_time_ms = 0
hydration_stale_time_ms = 30000
gc_retention_ms = 300000
gc_interval_ms = 60000

[retry]
max_attempts = 1
base_delay_ms = 1
max_delay_ms = 1
multiplier = 1.0

[logging]
level = "warn"
json = false
"#;

    pub fn client_config() -> ClientConfig {
        ClientConfig::from_toml_str(CLIENT_CONFIG_TOML).expect("fixture config is valid")
    }

    /// Fixed start instant for manual clocks.
    pub fn epoch() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0)
            .single()
            .expect("valid fixture instant")
    }

    pub fn manual_clock() -> ManualClock {
        ManualClock::new(epoch())
    }

    /// A store on a manual clock with the given default staleness window.
    pub fn manual_store(stale_time: Duration) -> (Arc<QueryStore>, ManualClock) {
        let clock = manual_clock();
        let config = QueryConfig::new().with_stale_time(stale_time);
        (QueryStore::new(Arc::new(clock.clone()), config), clock)
    }

    pub fn track_key(id: &str) -> QueryKey {
        QueryKey::new("track").expect("valid entity").arg(id)
    }

    pub fn artist_key(id: &str) -> QueryKey {
        QueryKey::new("artist").expect("valid entity").arg(id)
    }

    pub fn catalog_key(genre: &str, page: i64) -> QueryKey {
        QueryKey::new("catalog")
            .expect("valid entity")
            .arg(genre)
            .arg(page)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    use super::*;

    /// Assert that a read came from the specified source.
    pub fn assert_source<T: std::fmt::Debug>(read: &QueryRead<T>, expected: ReadSource) {
        assert_eq!(
            read.source(),
            expected,
            "Expected read from {:?}, got {:?}",
            expected,
            read
        );
    }

    /// Assert that the store holds an entry for `key` in `status`.
    pub fn assert_status(store: &QueryStore, key: &QueryKey, status: QueryStatus) {
        let entry = store
            .peek(key)
            .unwrap_or_else(|| panic!("Expected an entry for {}", key));
        assert_eq!(entry.status(), status, "Unexpected status for {}", key);
    }

    /// Assert that the entry for `key` exists and is stale now.
    pub fn assert_stale(store: &QueryStore, key: &QueryKey) {
        let entry = store
            .peek(key)
            .unwrap_or_else(|| panic!("Expected an entry for {}", key));
        assert!(entry.is_stale(store.now()), "Expected {} to be stale", key);
    }

    /// Assert that the entry for `key` exists and is fresh now.
    pub fn assert_fresh(store: &QueryStore, key: &QueryKey) {
        let entry = store
            .peek(key)
            .unwrap_or_else(|| panic!("Expected an entry for {}", key));
        assert!(!entry.is_stale(store.now()), "Expected {} to be fresh", key);
    }

    /// Assert that the cached value for `key` decodes to `expected`.
    pub fn assert_cached<T>(store: &QueryStore, key: &QueryKey, expected: &T)
    where
        T: DeserializeOwned + PartialEq + std::fmt::Debug + Send + Sync + 'static,
    {
        let entry = store
            .peek(key)
            .unwrap_or_else(|| panic!("Expected an entry for {}", key));
        let data = entry
            .data()
            .unwrap_or_else(|| panic!("Expected data for {}", key));
        let value = data
            .decode::<T>()
            .unwrap_or_else(|e| panic!("Failed to decode {}: {}", key, e));
        assert_eq!(value.as_ref(), expected, "Unexpected value for {}", key);
    }
}
