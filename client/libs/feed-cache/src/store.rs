//! Keyed query-result store with subscribe/notify
//!
//! The store is an explicit handle (cheap to clone, shared through an `Arc`)
//! rather than a process global, so every test builds its own.
//!
//! Listeners are always invoked after the entry map and listener registry
//! guards have been released, which lets a listener read the store again.

use crate::error::{FeedCacheError, Result};
use crate::keys::{KeyPattern, QueryKey};
use crate::models::QueryData;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Identifier of one fetch attempt for a key
pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Idle,
    Fetching,
    Error,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: QueryKey,
    pub data: Option<QueryData>,
    pub fetched_at: Option<Instant>,
    pub is_stale: bool,
    pub status: FetchStatus,
    /// Last fetch error; prior data is kept alongside it
    pub error: Option<FeedCacheError>,
    pub in_flight_request: Option<RequestId>,
    /// Bumped on every data write
    pub version: u64,
    /// Bumped when server data replaces the value (fetch or `set`)
    pub generation: u64,
    pub last_accessed: Instant,
}

impl CacheEntry {
    fn empty(key: QueryKey) -> Self {
        Self {
            key,
            data: None,
            fetched_at: None,
            is_stale: false,
            status: FetchStatus::Idle,
            error: None,
            in_flight_request: None,
            version: 0,
            generation: 0,
            last_accessed: Instant::now(),
        }
    }

    /// Has data, not invalidated, younger than `stale_time`
    pub fn is_fresh(&self, stale_time: Duration) -> bool {
        if self.data.is_none() || self.is_stale {
            return false;
        }
        self.fetched_at
            .map(|at| at.elapsed() < stale_time)
            .unwrap_or(false)
    }

    pub fn is_fetching(&self) -> bool {
        self.status == FetchStatus::Fetching
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEventKind {
    Updated,
    Invalidated,
    FetchStarted,
    Errored,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    pub key: QueryKey,
    pub kind: CacheEventKind,
}

type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

#[derive(Default)]
struct StoreInner {
    entries: DashMap<QueryKey, CacheEntry>,
    listeners: Mutex<HashMap<QueryKey, Vec<(u64, Listener)>>>,
    next_listener_id: AtomicU64,
    next_request_id: AtomicU64,
}

/// Shared cache store handle
#[derive(Clone, Default)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the entry, touching its access time
    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        let mut entry = self.inner.entries.get_mut(key)?;
        entry.last_accessed = Instant::now();
        Some(entry.clone())
    }

    pub fn get_data(&self, key: &QueryKey) -> Option<QueryData> {
        self.get(key).and_then(|entry| entry.data)
    }

    pub fn version(&self, key: &QueryKey) -> Option<u64> {
        self.inner.entries.get(key).map(|entry| entry.version)
    }

    pub fn generation(&self, key: &QueryKey) -> Option<u64> {
        self.inner.entries.get(key).map(|entry| entry.generation)
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.inner.entries.contains_key(key)
    }

    pub fn has_data(&self, key: &QueryKey) -> bool {
        self.inner
            .entries
            .get(key)
            .map(|entry| entry.data.is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Store a fresh value. Returns the new version.
    pub fn set(&self, key: &QueryKey, data: QueryData) -> u64 {
        let version = {
            let mut entry = self
                .inner
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::empty(key.clone()));
            let now = Instant::now();
            entry.data = Some(data);
            entry.fetched_at = Some(now);
            entry.last_accessed = now;
            entry.is_stale = false;
            entry.error = None;
            if entry.status == FetchStatus::Error {
                entry.status = FetchStatus::Idle;
            }
            entry.version += 1;
            entry.generation += 1;
            entry.version
        };

        trace!(key = %key, version, "Cache set");
        self.notify(key, CacheEventKind::Updated);
        version
    }

    /// Edit existing data in place. `edit` reports whether it changed anything;
    /// returns the new version only when it did.
    pub fn update<F>(&self, key: &QueryKey, edit: F) -> Option<u64>
    where
        F: FnOnce(&mut QueryData) -> bool,
    {
        let version = {
            let mut entry = self.inner.entries.get_mut(key)?;
            let data = entry.data.as_mut()?;
            if !edit(data) {
                return None;
            }
            entry.version += 1;
            entry.version
        };

        trace!(key = %key, version, "Cache updated in place");
        self.notify(key, CacheEventKind::Updated);
        Some(version)
    }

    /// Put back a previously captured value verbatim, keeping `fetched_at`.
    pub fn restore(&self, key: &QueryKey, data: Option<QueryData>) -> u64 {
        let version = {
            let mut entry = self
                .inner
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::empty(key.clone()));
            entry.data = data;
            entry.version += 1;
            entry.version
        };

        trace!(key = %key, version, "Cache restored");
        self.notify(key, CacheEventKind::Updated);
        version
    }

    pub fn remove(&self, key: &QueryKey) -> Option<CacheEntry> {
        let removed = self.inner.entries.remove(key).map(|(_, entry)| entry);
        if removed.is_some() {
            debug!(key = %key, "Cache entry removed");
            self.notify(key, CacheEventKind::Removed);
        }
        removed
    }

    /// Mark one entry stale. Returns whether it transitioned.
    pub fn mark_stale(&self, key: &QueryKey) -> bool {
        let changed = match self.inner.entries.get_mut(key) {
            Some(mut entry) if !entry.is_stale => {
                entry.is_stale = true;
                true
            }
            _ => false,
        };
        if changed {
            self.notify(key, CacheEventKind::Invalidated);
        }
        changed
    }

    /// Mark every matching entry stale (data is kept) and return the matched
    /// keys. Running the same pattern twice yields the same set.
    pub fn invalidate(&self, pattern: &KeyPattern) -> Vec<QueryKey> {
        let mut matched = Vec::new();
        let mut transitioned = Vec::new();

        for mut entry in self.inner.entries.iter_mut() {
            if !pattern.matches(entry.key()) {
                continue;
            }
            matched.push(entry.key().clone());
            if !entry.is_stale {
                entry.is_stale = true;
                transitioned.push(entry.key().clone());
            }
        }

        debug!(
            pattern = %pattern,
            matched = matched.len(),
            newly_stale = transitioned.len(),
            "Invalidated pattern"
        );

        for key in &transitioned {
            self.notify(key, CacheEventKind::Invalidated);
        }
        matched.sort();
        matched
    }

    pub fn keys_matching(&self, pattern: &KeyPattern) -> Vec<QueryKey> {
        self.keys_where(|entry| pattern.matches(&entry.key))
    }

    /// Keys whose entry satisfies `predicate`, sorted
    pub fn keys_where<P>(&self, predicate: P) -> Vec<QueryKey>
    where
        P: Fn(&CacheEntry) -> bool,
    {
        let mut keys: Vec<QueryKey> = self
            .inner
            .entries
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Register a listener for `key`. Dropping the handle unsubscribes.
    pub fn subscribe<F>(&self, key: &QueryKey, listener: F) -> Subscription
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(listener)));

        debug!(key = %key, listener_id = id, "Subscribed");
        Subscription {
            store: Arc::downgrade(&self.inner),
            key: key.clone(),
            id,
        }
    }

    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        self.inner
            .listeners
            .lock()
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    // ============= In-flight protocol =============

    /// Start a fetch, superseding any request already in flight for `key`
    pub fn begin_fetch(&self, key: &QueryKey) -> RequestId {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut entry = self
                .inner
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::empty(key.clone()));
            entry.status = FetchStatus::Fetching;
            entry.in_flight_request = Some(request_id);
            entry.last_accessed = Instant::now();
        }

        trace!(key = %key, request_id, "Fetch started");
        self.notify(key, CacheEventKind::FetchStarted);
        request_id
    }

    /// Settle a fetch. Returns `false` (result discarded) when `request_id` is
    /// no longer the key's in-flight request. Errors keep the prior data.
    pub fn finish_fetch(
        &self,
        key: &QueryKey,
        request_id: RequestId,
        result: Result<QueryData>,
    ) -> bool {
        let kind = {
            let mut entry = match self.inner.entries.get_mut(key) {
                Some(entry) => entry,
                None => return false,
            };
            if entry.in_flight_request != Some(request_id) {
                return false;
            }
            entry.in_flight_request = None;

            match result {
                Ok(data) => {
                    let now = Instant::now();
                    entry.data = Some(data);
                    entry.fetched_at = Some(now);
                    entry.is_stale = false;
                    entry.status = FetchStatus::Idle;
                    entry.error = None;
                    entry.version += 1;
                    entry.generation += 1;
                    CacheEventKind::Updated
                }
                Err(e) => {
                    entry.status = FetchStatus::Error;
                    entry.error = Some(e);
                    CacheEventKind::Errored
                }
            }
        };

        self.notify(key, kind);
        true
    }

    /// Drop the in-flight marker. Returns the cancelled request, if any.
    pub fn cancel_fetch(&self, key: &QueryKey) -> Option<RequestId> {
        let mut entry = self.inner.entries.get_mut(key)?;
        let request_id = entry.in_flight_request.take()?;
        if entry.status == FetchStatus::Fetching {
            entry.status = FetchStatus::Idle;
        }
        trace!(key = %key, request_id, "Fetch cancelled");
        Some(request_id)
    }

    pub fn in_flight(&self, key: &QueryKey) -> Option<RequestId> {
        self.inner
            .entries
            .get(key)
            .and_then(|entry| entry.in_flight_request)
    }

    /// Stale entries that currently have at least one subscriber
    pub fn stale_observed_keys(&self) -> Vec<QueryKey> {
        let observed: Vec<QueryKey> = self
            .inner
            .listeners
            .lock()
            .iter()
            .filter(|(_, listeners)| !listeners.is_empty())
            .map(|(key, _)| key.clone())
            .collect();

        let mut keys: Vec<QueryKey> = observed
            .into_iter()
            .filter(|key| {
                self.inner
                    .entries
                    .get(key)
                    .map(|entry| entry.is_stale && entry.in_flight_request.is_none())
                    .unwrap_or(false)
            })
            .collect();
        keys.sort();
        keys
    }

    /// Remove entries with no subscribers and no in-flight request that were
    /// last touched at least `gc_time` ago.
    pub fn evict_inactive(&self, gc_time: Duration) -> Vec<QueryKey> {
        let candidates = self.keys_where(|entry| {
            entry.in_flight_request.is_none() && entry.last_accessed.elapsed() >= gc_time
        });

        let mut evicted = Vec::new();
        for key in candidates {
            if self.subscriber_count(&key) > 0 {
                continue;
            }
            if self.inner.entries.remove(&key).is_some() {
                evicted.push(key);
            }
        }

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted inactive entries");
        }
        evicted
    }

    pub fn clear(&self) {
        self.inner.entries.clear();
    }

    fn notify(&self, key: &QueryKey, kind: CacheEventKind) {
        notify_listeners(&self.inner, key, kind);
    }
}

fn notify_listeners(inner: &StoreInner, key: &QueryKey, kind: CacheEventKind) {
    let listeners: Vec<Listener> = match inner.listeners.lock().get(key) {
        Some(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
        None => return,
    };

    let event = CacheEvent {
        key: key.clone(),
        kind,
    };
    for listener in listeners {
        listener(&event);
    }
}

/// Listener handle; unsubscribes on drop
pub struct Subscription {
    store: Weak<StoreInner>,
    key: QueryKey,
    id: u64,
}

impl Subscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.store.upgrade() else {
            return;
        };

        {
            let mut listeners = inner.listeners.lock();
            if let Some(registered) = listeners.get_mut(&self.key) {
                registered.retain(|(id, _)| *id != self.id);
                if registered.is_empty() {
                    listeners.remove(&self.key);
                }
            }
        }

        // gc window starts when the last observer leaves
        if let Some(mut entry) = inner.entries.get_mut(&self.key) {
            entry.last_accessed = Instant::now();
        }
        debug!(key = %self.key, listener_id = self.id, "Unsubscribed");
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn flag_key(id: &str) -> QueryKey {
        QueryKey::new(["likes", "check", id, "u1"])
    }

    #[test]
    fn test_get_missing_key_is_empty() {
        let store = CacheStore::new();
        assert!(store.get(&flag_key("p1")).is_none());
        assert!(store.get_data(&flag_key("p1")).is_none());
    }

    #[test]
    fn test_set_notifies_subscribers() {
        let store = CacheStore::new();
        let key = flag_key("p1");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        let _sub = store.subscribe(&key, move |event| seen_clone.lock().push(event.kind));

        store.set(&key, QueryData::Flag(true));
        store.mark_stale(&key);
        store.remove(&key);

        assert_eq!(
            *seen.lock(),
            vec![
                CacheEventKind::Updated,
                CacheEventKind::Invalidated,
                CacheEventKind::Removed
            ]
        );
    }

    #[test]
    fn test_listener_may_read_store() {
        let store = CacheStore::new();
        let key = flag_key("p1");
        let read_back = Arc::new(Mutex::new(None));

        let store_clone = store.clone();
        let key_clone = key.clone();
        let read_clone = read_back.clone();
        let _sub = store.subscribe(&key, move |_| {
            *read_clone.lock() = store_clone.get_data(&key_clone);
        });

        store.set(&key, QueryData::Flag(true));
        assert_eq!(*read_back.lock(), Some(QueryData::Flag(true)));
    }

    #[test]
    fn test_subscription_drop_unsubscribes() {
        let store = CacheStore::new();
        let key = flag_key("p1");
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let sub = store.subscribe(&key, move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(store.subscriber_count(&key), 1);

        drop(sub);
        assert_eq!(store.subscriber_count(&key), 0);

        store.set(&key, QueryData::Flag(false));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_update_bumps_version_only_on_change() {
        let store = CacheStore::new();
        let key = flag_key("p1");
        let v1 = store.set(&key, QueryData::Flag(false));

        let unchanged = store.update(&key, |_| false);
        assert_eq!(unchanged, None);

        let v2 = store.update(&key, |data| {
            *data = QueryData::Flag(true);
            true
        });
        assert_eq!(v2, Some(v1 + 1));
        assert_eq!(store.get_data(&key), Some(QueryData::Flag(true)));

        // No data yet: nothing to edit
        assert_eq!(store.update(&flag_key("p2"), |_| true), None);
    }

    #[test]
    fn test_generation_moves_only_on_server_data() {
        let store = CacheStore::new();
        let key = flag_key("p1");
        store.set(&key, QueryData::Flag(false));
        assert_eq!(store.generation(&key), Some(1));

        store.update(&key, |data| {
            *data = QueryData::Flag(true);
            true
        });
        store.restore(&key, Some(QueryData::Flag(false)));
        assert_eq!(store.generation(&key), Some(1));

        let request = store.begin_fetch(&key);
        assert!(store.finish_fetch(&key, request, Ok(QueryData::Flag(true))));
        assert_eq!(store.generation(&key), Some(2));
        assert_eq!(store.generation(&flag_key("missing")), None);
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let store = CacheStore::new();
        store.set(&QueryKey::feed("campus"), QueryData::Flag(true));
        store.set(&QueryKey::feed("following"), QueryData::Flag(true));
        store.set(&QueryKey::post_detail("p1"), QueryData::Flag(true));

        let pattern = KeyPattern::prefix(["posts", "feed"]);
        let first = store.invalidate(&pattern);
        let second = store.invalidate(&pattern);

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert!(store.get(&QueryKey::feed("campus")).unwrap().is_stale);
        assert!(!store.get(&QueryKey::post_detail("p1")).unwrap().is_stale);
        // Data survives invalidation
        assert!(store.get_data(&QueryKey::feed("campus")).is_some());
    }

    #[test]
    fn test_superseded_fetch_is_discarded() {
        let store = CacheStore::new();
        let key = flag_key("p1");

        let old = store.begin_fetch(&key);
        let new = store.begin_fetch(&key);
        assert_ne!(old, new);

        assert!(!store.finish_fetch(&key, old, Ok(QueryData::Flag(false))));
        assert!(store.finish_fetch(&key, new, Ok(QueryData::Flag(true))));

        let entry = store.get(&key).unwrap();
        assert_eq!(entry.data, Some(QueryData::Flag(true)));
        assert_eq!(entry.status, FetchStatus::Idle);
        assert!(entry.in_flight_request.is_none());
    }

    #[test]
    fn test_fetch_error_keeps_data() {
        let store = CacheStore::new();
        let key = flag_key("p1");
        store.set(&key, QueryData::Flag(true));

        let id = store.begin_fetch(&key);
        assert!(store.finish_fetch(&key, id, Err(FeedCacheError::Network("offline".into()))));

        let entry = store.get(&key).unwrap();
        assert_eq!(entry.status, FetchStatus::Error);
        assert_eq!(entry.data, Some(QueryData::Flag(true)));
        assert!(matches!(entry.error, Some(FeedCacheError::Network(_))));
    }

    #[test]
    fn test_cancel_fetch() {
        let store = CacheStore::new();
        let key = flag_key("p1");
        let id = store.begin_fetch(&key);

        assert_eq!(store.cancel_fetch(&key), Some(id));
        assert_eq!(store.cancel_fetch(&key), None);
        assert!(!store.finish_fetch(&key, id, Ok(QueryData::Flag(true))));
        assert_eq!(store.get(&key).unwrap().status, FetchStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshness_expires() {
        let store = CacheStore::new();
        let key = flag_key("p1");
        store.set(&key, QueryData::Flag(true));

        let stale_time = Duration::from_secs(30);
        assert!(store.get(&key).unwrap().is_fresh(stale_time));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!store.get(&key).unwrap().is_fresh(stale_time));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_inactive_skips_observed() {
        let store = CacheStore::new();
        let observed = flag_key("p1");
        let idle = flag_key("p2");
        store.set(&observed, QueryData::Flag(true));
        store.set(&idle, QueryData::Flag(true));
        let _sub = store.subscribe(&observed, |_| {});

        tokio::time::advance(Duration::from_secs(10)).await;
        let evicted = store.evict_inactive(Duration::from_secs(5));

        assert_eq!(evicted, vec![idle.clone()]);
        assert!(store.contains(&observed));
        assert!(!store.contains(&idle));
    }

    #[test]
    fn test_stale_observed_keys() {
        let store = CacheStore::new();
        let observed = flag_key("p1");
        let unobserved = flag_key("p2");
        store.set(&observed, QueryData::Flag(true));
        store.set(&unobserved, QueryData::Flag(true));
        let _sub = store.subscribe(&observed, |_| {});

        store.invalidate(&KeyPattern::prefix(["likes"]));
        assert_eq!(store.stale_observed_keys(), vec![observed]);
    }
}
