//! The process-wide table of cache entries.
//!
//! # Locking
//!
//! All state sits behind one `RwLock` that is held only for the duration of a
//! table operation. It is never held across an `.await` and never while a
//! listener runs, so listeners may read the store (or even write to it)
//! from inside their callback.
//!
//! # Lifetime
//!
//! A store is constructed explicitly and shared as `Arc<QueryStore>`: once
//! per process on the client, once per request on the server. There is no
//! global instance.

use cadence_core::{FetchError, QueryKey, SharedClock, SystemClock, Timestamp};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::QueryConfig;
use crate::entry::{deadline, CacheEntry, QueryData, QueryStatus};
use crate::filter::KeyFilter;
use crate::stats::{CacheStats, Counters};

/// Callback notified whenever an entry's value or status changes.
pub type Listener = dyn Fn(&CacheEntry) + Send + Sync;

struct ListenerSlot {
    id: u64,
    listener: Weak<Listener>,
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<QueryKey, CacheEntry>,
    listeners: HashMap<QueryKey, Vec<ListenerSlot>>,
}

impl StoreInner {
    /// Upgrade live listeners for `key` in insertion order, dropping dead ones.
    fn live_listeners(&mut self, key: &QueryKey) -> Vec<Arc<Listener>> {
        let Some(slots) = self.listeners.get_mut(key) else {
            return Vec::new();
        };
        let mut live = Vec::with_capacity(slots.len());
        slots.retain(|slot| match slot.listener.upgrade() {
            Some(listener) => {
                live.push(listener);
                true
            }
            None => false,
        });
        if slots.is_empty() {
            self.listeners.remove(key);
        }
        live
    }

    fn has_live_listeners(&self, key: &QueryKey) -> bool {
        self.listeners
            .get(key)
            .is_some_and(|slots| slots.iter().any(|s| s.listener.strong_count() > 0))
    }
}

type Notification = (CacheEntry, Vec<Arc<Listener>>);

fn deliver(notifications: Vec<Notification>) {
    for (entry, listeners) in notifications {
        for listener in listeners {
            listener(&entry);
        }
    }
}

/// Query cache keyed by [`QueryKey`].
///
/// Reads and writes are synchronous. Every mutating call notifies the
/// subscribers of the touched entries before it returns, in subscription
/// order. No operation on the store fails.
pub struct QueryStore {
    inner: RwLock<StoreInner>,
    clock: SharedClock,
    config: QueryConfig,
    counters: Counters,
    next_listener_id: AtomicU64,
}

impl QueryStore {
    /// Create a store with an explicit clock and configuration.
    pub fn new(clock: SharedClock, config: QueryConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(StoreInner::default()),
            clock,
            config,
            counters: Counters::default(),
            next_listener_id: AtomicU64::new(1),
        })
    }

    /// Create a store on the system clock with default configuration.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(Arc::new(SystemClock), QueryConfig::default())
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Read an entry, recording the access for garbage collection.
    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        let now = self.clock.now();
        let mut inner = self.write();
        let entry = inner.entries.get_mut(key)?;
        entry.last_read_at = now;
        Some(entry.clone())
    }

    /// Read an entry without counting it as an access.
    pub fn peek(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.read().entries.get(key).cloned()
    }

    /// Clones of every entry accepted by `filter`.
    pub fn entries_matching(&self, filter: &KeyFilter) -> Vec<CacheEntry> {
        self.read()
            .entries
            .values()
            .filter(|entry| filter.matches(&entry.key))
            .cloned()
            .collect()
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        self.read().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let count = self.len() as u64;
        self.counters.snapshot(count)
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Apply `f` to the entry for `key` (creating it idle if absent), then notify.
    fn update<R>(&self, key: &QueryKey, f: impl FnOnce(&mut CacheEntry) -> R) -> R {
        let now = self.clock.now();
        let (result, notification) = {
            let mut inner = self.write();
            let entry = inner
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::idle(key.clone(), now));
            let result = f(entry);
            let snapshot = entry.clone();
            let listeners = inner.live_listeners(key);
            (result, (snapshot, listeners))
        };
        deliver(vec![notification]);
        result
    }

    /// Store a successful result using the default staleness window.
    pub fn set(&self, key: &QueryKey, data: QueryData, updated_at: Timestamp) {
        self.set_with_stale_time(key, data, updated_at, self.config.default_stale_time);
    }

    /// Store a successful result that stays fresh for `stale_time`.
    ///
    /// Replaces the value, sets status to success, and clears any error.
    pub fn set_with_stale_time(
        &self,
        key: &QueryKey,
        data: QueryData,
        updated_at: Timestamp,
        stale_time: Duration,
    ) {
        trace!(key = %key, ?stale_time, "cache set");
        self.update(key, |entry| {
            entry.data = Some(data);
            entry.status = QueryStatus::Success;
            entry.updated_at = Some(updated_at);
            entry.stale_at = Some(deadline(updated_at, stale_time));
            entry.error = None;
            entry.error_count = 0;
        });
    }

    /// Record a failure while keeping the last good value readable.
    pub fn mark_error(&self, key: &QueryKey, error: FetchError) {
        debug!(key = %key, error = %error, "cache entry errored");
        self.update(key, |entry| {
            entry.status = QueryStatus::Error;
            entry.error = Some(error);
            entry.error_count = entry.error_count.saturating_add(1);
        });
    }

    /// Expire every matching entry. Data is kept and nothing is fetched.
    ///
    /// Returns the number of entries invalidated.
    pub fn invalidate(&self, filter: &KeyFilter) -> usize {
        let notifications: Vec<Notification> = {
            let mut inner = self.write();
            let keys: Vec<QueryKey> = inner
                .entries
                .keys()
                .filter(|key| filter.matches(key))
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| {
                    let entry = inner.entries.get_mut(&key)?;
                    entry.expire();
                    let snapshot = entry.clone();
                    let listeners = inner.live_listeners(&key);
                    Some((snapshot, listeners))
                })
                .collect()
        };
        let count = notifications.len();
        debug!(?filter, count, "invalidated cache entries");
        deliver(notifications);
        count
    }

    /// Mark a fetch as started, returning the entry generation it belongs to.
    pub(crate) fn mark_loading(&self, key: &QueryKey) -> u64 {
        self.update(key, |entry| {
            entry.status = QueryStatus::Loading;
            entry.generation
        })
    }

    /// Current generation of `key`, or zero when absent.
    pub(crate) fn generation(&self, key: &QueryKey) -> u64 {
        self.read().entries.get(key).map_or(0, |entry| entry.generation)
    }

    /// Undo [`Self::mark_loading`] for a fetch that was abandoned.
    pub(crate) fn revert_loading(&self, key: &QueryKey) {
        self.update(key, |entry| {
            if entry.status == QueryStatus::Loading {
                entry.status = entry.settled_status();
            }
        });
    }

    /// Record the outcome of a fetch started at `generation`.
    ///
    /// Nothing is written if the entry was invalidated, written
    /// optimistically or restored since the fetch started. Returns true if
    /// the outcome was recorded.
    pub(crate) fn finish_fetch(
        &self,
        key: &QueryKey,
        generation: u64,
        outcome: &Result<QueryData, FetchError>,
        stale_time: Duration,
    ) -> bool {
        let now = self.clock.now();
        let notification = {
            let mut inner = self.write();
            let entry = inner
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::idle(key.clone(), now));
            if entry.generation != generation {
                return false;
            }
            match outcome {
                Ok(data) => {
                    entry.data = Some(data.clone());
                    entry.status = QueryStatus::Success;
                    entry.updated_at = Some(now);
                    entry.stale_at = Some(deadline(now, stale_time));
                    entry.error = None;
                    entry.error_count = 0;
                }
                Err(error) => {
                    entry.status = QueryStatus::Error;
                    entry.error = Some(error.clone());
                    entry.error_count = entry.error_count.saturating_add(1);
                }
            }
            let snapshot = entry.clone();
            let listeners = inner.live_listeners(key);
            (snapshot, listeners)
        };
        deliver(vec![notification]);
        true
    }

    /// Write a tentative value that stays fresh until explicitly replaced.
    pub(crate) fn write_optimistic(&self, key: &QueryKey, data: QueryData) {
        let now = self.clock.now();
        self.update(key, |entry| {
            entry.data = Some(data);
            entry.status = QueryStatus::Success;
            entry.updated_at = Some(now);
            entry.stale_at = Some(DateTime::<Utc>::MAX_UTC);
            entry.error = None;
            entry.supersede();
        });
    }

    /// Put back an earlier entry, or remove the key if there was none.
    ///
    /// Value, deadlines and error are restored exactly. The generation moves
    /// forward so a fetch that raced the optimistic write cannot land, and
    /// a captured loading status settles since that fetch no longer owns
    /// the entry.
    pub(crate) fn restore(&self, key: &QueryKey, previous: Option<CacheEntry>) {
        let notification = {
            let mut inner = self.write();
            let current = inner.entries.get(key).map_or(0, |entry| entry.generation);
            let visible = match previous {
                Some(mut entry) => {
                    entry.generation = current.max(entry.generation);
                    entry.supersede();
                    if entry.status == QueryStatus::Loading {
                        entry.status = entry.settled_status();
                    }
                    inner.entries.insert(key.clone(), entry.clone());
                    entry
                }
                None => {
                    inner.entries.remove(key);
                    CacheEntry::idle(key.clone(), self.clock.now())
                }
            };
            let listeners = inner.live_listeners(key);
            (visible, listeners)
        };
        deliver(vec![notification]);
    }

    /// Install a value unless the local entry is at least as new.
    ///
    /// Returns true if the value was installed.
    pub(crate) fn install_if_newer(
        &self,
        key: &QueryKey,
        data: QueryData,
        updated_at: Timestamp,
        stale_time: Duration,
    ) -> bool {
        let now = self.clock.now();
        let notification = {
            let mut inner = self.write();
            let entry = inner
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::idle(key.clone(), now));
            if entry.updated_at.is_some_and(|local| local >= updated_at) {
                return false;
            }
            entry.data = Some(data);
            entry.updated_at = Some(updated_at);
            entry.stale_at = Some(deadline(updated_at, stale_time));
            entry.error = None;
            entry.error_count = 0;
            if entry.status != QueryStatus::Loading {
                entry.status = QueryStatus::Success;
            }
            let snapshot = entry.clone();
            let listeners = inner.live_listeners(key);
            (snapshot, listeners)
        };
        deliver(vec![notification]);
        true
    }

    // ========================================================================
    // SUBSCRIPTIONS
    // ========================================================================

    /// Register `listener` for changes to `key`.
    ///
    /// The store keeps only a weak reference; the listener lives as long as
    /// the returned [`Subscription`].
    pub fn subscribe<F>(self: &Arc<Self>, key: &QueryKey, listener: F) -> Subscription
    where
        F: Fn(&CacheEntry) + Send + Sync + 'static,
    {
        let listener: Arc<Listener> = Arc::new(listener);
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.write()
            .listeners
            .entry(key.clone())
            .or_default()
            .push(ListenerSlot {
                id,
                listener: Arc::downgrade(&listener),
            });
        Subscription {
            key: key.clone(),
            id,
            store: Arc::downgrade(self),
            _listener: listener,
        }
    }

    fn remove_listener(&self, key: &QueryKey, id: u64) {
        let mut inner = self.write();
        if let Some(slots) = inner.listeners.get_mut(key) {
            slots.retain(|slot| slot.id != id);
            if slots.is_empty() {
                inner.listeners.remove(key);
            }
        }
    }

    /// Number of live subscriptions for `key`.
    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        self.read()
            .listeners
            .get(key)
            .map_or(0, |slots| {
                slots
                    .iter()
                    .filter(|s| s.listener.strong_count() > 0)
                    .count()
            })
    }

    // ========================================================================
    // GARBAGE COLLECTION
    // ========================================================================

    /// Evict entries unread for longer than `retention`.
    ///
    /// Entries that are loading or still subscribed are kept regardless of age.
    pub fn collect_garbage(&self, retention: Duration) -> usize {
        let now = self.clock.now();
        let mut inner = self.write();
        let expired: Vec<QueryKey> = inner
            .entries
            .values()
            .filter(|entry| {
                !entry.is_loading()
                    && !inner.has_live_listeners(&entry.key)
                    && deadline(entry.last_read_at, retention) < now
            })
            .map(|entry| entry.key.clone())
            .collect();
        for key in &expired {
            inner.entries.remove(key);
            inner.listeners.remove(key);
        }
        drop(inner);

        let evicted = expired.len();
        if evicted > 0 {
            Counters::add(&self.counters.evictions, evicted as u64);
            debug!(evicted, ?retention, "evicted unread cache entries");
        }
        evicted
    }
}

impl fmt::Debug for QueryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryStore")
            .field("entries", &self.len())
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish()
    }
}

/// Handle tying a listener to its component.
///
/// Dropping it (or calling [`Subscription::unsubscribe`]) removes the
/// listener. Unsubscribing never cancels a fetch.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    key: QueryKey,
    id: u64,
    store: Weak<QueryStore>,
    _listener: Arc<Listener>,
}

impl Subscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.remove_listener(&self.key, self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}
