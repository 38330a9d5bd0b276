//! Periodic eviction of unread entries.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::store::QueryStore;

/// Run [`QueryStore::collect_garbage`] every `interval` until the store is dropped.
///
/// The task holds only a weak reference, so it never keeps a store alive.
pub fn spawn_gc(store: &Arc<QueryStore>, interval: Duration, retention: Duration) -> JoinHandle<()> {
    let store = Arc::downgrade(store);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(store) = store.upgrade() else {
                debug!("store dropped, garbage collector exiting");
                return;
            };
            let evicted = store.collect_garbage(retention);
            if evicted > 0 {
                info!(evicted, remaining = store.len(), "garbage collection pass");
            }
        }
    })
}

/// [`spawn_gc`] with the interval and retention from the store's config.
pub fn spawn_default_gc(store: &Arc<QueryStore>) -> JoinHandle<()> {
    let config = store.config();
    spawn_gc(store, config.gc_interval, config.gc_retention)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryConfig;
    use crate::entry::QueryData;
    use cadence_core::{Clock, ManualClock, QueryKey};

    #[tokio::test(start_paused = true)]
    async fn test_gc_task_evicts_and_exits_with_store() {
        let clock = ManualClock::at_epoch();
        let store = QueryStore::new(Arc::new(clock.clone()), QueryConfig::default());
        let key = QueryKey::new("track").unwrap().arg("1");
        store.set(&key, QueryData::new(1u32), clock.now());

        let handle = spawn_gc(&store, Duration::from_secs(10), Duration::from_secs(30));
        clock.advance(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(store.peek(&key).is_none());

        drop(store);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(handle.is_finished());
    }
}
