//! Query executor
//!
//! Reads go through [`QueryExecutor::fetch`]: fresh entries are served from the
//! store, everything else runs the query function in a spawned task whose
//! result is fanned out to every concurrent caller through a shared future.
//! A later request for the same key supersedes (and aborts) an earlier one.

use crate::config::CacheConfig;
use crate::error::{FeedCacheError, Result};
use crate::keys::QueryKey;
use crate::models::{ContentItem, Cursor, InfinitePages, PaginatedResult, QueryData};
use crate::retry::{with_retry, RetryConfig};
use crate::stats::StatsCollector;
use crate::store::{CacheEvent, CacheStore, RequestId, Subscription};
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

pub type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<QueryData>> + Send + Sync>;

pub type PageFetcher = Arc<
    dyn Fn(Option<Cursor>) -> BoxFuture<'static, Result<PaginatedResult<ContentItem>>>
        + Send
        + Sync,
>;

/// How to load a key
#[derive(Clone)]
pub enum QueryFn {
    Single(Fetcher),
    /// Cursor-paginated; pages accumulate as [`InfinitePages`]
    Paged(PageFetcher),
}

impl QueryFn {
    pub fn single<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<QueryData>> + Send + 'static,
    {
        QueryFn::Single(Arc::new(move || f().boxed()))
    }

    pub fn paged<F, Fut>(f: F) -> Self
    where
        F: Fn(Option<Cursor>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PaginatedResult<ContentItem>>> + Send + 'static,
    {
        QueryFn::Paged(Arc::new(move |cursor: Option<Cursor>| f(cursor).boxed()))
    }

    pub fn is_paged(&self) -> bool {
        matches!(self, QueryFn::Paged(_))
    }
}

impl std::fmt::Debug for QueryFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryFn::Single(_) => write!(f, "QueryFn::Single"),
            QueryFn::Paged(_) => write!(f, "QueryFn::Paged"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub stale_time: Duration,
    /// Disabled queries only ever return what is cached
    pub enabled: bool,
    pub retry: RetryConfig,
}

impl QueryOptions {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            stale_time: config.stale_time,
            enabled: true,
            retry: config.retry.clone(),
        }
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

#[derive(Debug, Clone)]
enum FetchMode {
    /// Load (or reload) the first page / the single value
    Refresh,
    NextPage(Cursor),
}

type SharedFetch = Shared<BoxFuture<'static, Result<QueryData>>>;

struct InFlight {
    request_id: RequestId,
    shared: SharedFetch,
    abort: AbortHandle,
}

struct Registered {
    query_fn: QueryFn,
    options: QueryOptions,
}

#[derive(Default)]
struct ExecutorInner {
    in_flight: Mutex<HashMap<QueryKey, InFlight>>,
    registry: Mutex<HashMap<QueryKey, Registered>>,
}

/// Fetches, deduplicates and paginates queries into a [`CacheStore`]
#[derive(Clone)]
pub struct QueryExecutor {
    store: CacheStore,
    stats: StatsCollector,
    defaults: QueryOptions,
    gc_time: Duration,
    inner: Arc<ExecutorInner>,
}

impl QueryExecutor {
    pub fn new(store: CacheStore, config: &CacheConfig, stats: StatsCollector) -> Self {
        Self {
            store,
            stats,
            defaults: QueryOptions::from_config(config),
            gc_time: config.gc_time,
            inner: Arc::new(ExecutorInner::default()),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn stats(&self) -> &StatsCollector {
        &self.stats
    }

    /// Options built from the executor's configuration
    pub fn default_options(&self) -> QueryOptions {
        self.defaults.clone()
    }

    /// Cached value when fresh, otherwise the result of (joining) a fetch.
    ///
    /// Returns `Ok(None)` only for a disabled query with nothing cached.
    pub async fn fetch(
        &self,
        key: &QueryKey,
        query_fn: &QueryFn,
        options: &QueryOptions,
    ) -> Result<Option<QueryData>> {
        if !options.enabled {
            return Ok(self.store.get_data(key));
        }

        if let Some(entry) = self.store.get(key) {
            if entry.is_fresh(options.stale_time) {
                debug!(key = %key, "Cache hit");
                self.stats.record_hit();
                return Ok(entry.data);
            }
        }

        self.stats.record_miss();

        if let Some(shared) = self.joinable(key) {
            debug!(key = %key, "Joined in-flight fetch");
            self.stats.record_dedup();
            return shared.await.map(Some);
        }

        debug!(key = %key, "Cache miss, fetching");
        self.start(key, FetchMode::Refresh, query_fn, options)
            .await
            .map(Some)
    }

    /// Force a new request, superseding anything in flight for `key`
    pub async fn refetch(
        &self,
        key: &QueryKey,
        query_fn: &QueryFn,
        options: &QueryOptions,
    ) -> Result<QueryData> {
        self.start(key, FetchMode::Refresh, query_fn, options).await
    }

    /// Append the page after the last cursor. A no-op returning the current
    /// pages once the last page reports `has_more = false`.
    pub async fn fetch_next_page(
        &self,
        key: &QueryKey,
        query_fn: &QueryFn,
        options: &QueryOptions,
    ) -> Result<Option<QueryData>> {
        if !query_fn.is_paged() {
            return Err(FeedCacheError::Internal(format!(
                "Key {} is not a paginated query",
                key
            )));
        }

        if let Some(shared) = self.joinable(key) {
            self.stats.record_dedup();
            return shared.await.map(Some);
        }

        let current = match self.store.get_data(key) {
            Some(QueryData::Pages(pages)) => pages,
            _ => return self.fetch(key, query_fn, options).await,
        };

        let cursor = match current.next_cursor() {
            Some(cursor) if options.enabled => cursor.clone(),
            _ => {
                debug!(key = %key, "No further pages");
                return Ok(Some(QueryData::Pages(current)));
            }
        };

        self.start(key, FetchMode::NextPage(cursor), query_fn, options)
            .await
            .map(Some)
    }

    /// Abort the in-flight request for `key`, if any
    pub fn cancel(&self, key: &QueryKey) -> bool {
        let aborted = match self.inner.in_flight.lock().remove(key) {
            Some(in_flight) => {
                in_flight.abort.abort();
                true
            }
            None => false,
        };
        let cleared = self.store.cancel_fetch(key).is_some();

        if aborted || cleared {
            debug!(key = %key, "Cancelled in-flight fetch");
        }
        aborted || cleared
    }

    /// Register `key` and subscribe `listener`. A stale or empty entry
    /// triggers a background fetch. Must be called inside a tokio runtime.
    pub fn observe<F>(
        &self,
        key: &QueryKey,
        query_fn: QueryFn,
        options: QueryOptions,
        listener: F,
    ) -> QueryObserver
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let subscription = self.store.subscribe(key, listener);

        let needs_fetch = options.enabled
            && self.store.in_flight(key).is_none()
            && self
                .store
                .get(key)
                .map(|entry| !entry.is_fresh(options.stale_time))
                .unwrap_or(true);

        if needs_fetch {
            // Detached: the spawned task keeps running without the handle
            drop(self.start(key, FetchMode::Refresh, &query_fn, &options));
        }

        self.inner
            .registry
            .lock()
            .insert(key.clone(), Registered { query_fn, options });

        QueryObserver {
            key: key.clone(),
            subscription: Some(subscription),
            executor: self.clone(),
        }
    }

    /// Refetch every stale entry that has observers. Returns how many
    /// refetches were started.
    pub async fn refetch_stale(&self) -> usize {
        let keys = self.store.stale_observed_keys();
        let mut pending = Vec::new();

        for key in keys {
            let registered = self
                .inner
                .registry
                .lock()
                .get(&key)
                .map(|r| (r.query_fn.clone(), r.options.clone()));
            if let Some((query_fn, options)) = registered {
                if options.enabled {
                    pending.push(self.start(&key, FetchMode::Refresh, &query_fn, &options));
                }
            }
        }

        let started = pending.len();
        if started > 0 {
            debug!(count = started, "Refetching stale observed queries");
        }
        join_all(pending).await;
        started
    }

    /// Evict entries idle for longer than the configured gc time
    pub fn collect_garbage(&self) -> usize {
        let evicted = self.store.evict_inactive(self.gc_time);
        {
            let mut registry = self.inner.registry.lock();
            for key in &evicted {
                registry.remove(key);
            }
        }
        self.stats.record_evictions(evicted.len());
        evicted.len()
    }

    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.store.in_flight(key).is_some()
    }

    /// The in-flight future for `key` if the store still considers it current
    fn joinable(&self, key: &QueryKey) -> Option<SharedFetch> {
        let current = self.store.in_flight(key)?;
        let in_flight = self.inner.in_flight.lock();
        in_flight
            .get(key)
            .filter(|f| f.request_id == current)
            .map(|f| f.shared.clone())
    }

    fn start(
        &self,
        key: &QueryKey,
        mode: FetchMode,
        query_fn: &QueryFn,
        options: &QueryOptions,
    ) -> SharedFetch {
        let request_id = self.store.begin_fetch(key);
        self.stats.record_fetch();

        // Held across spawn so the task cannot deregister before it is registered
        let mut in_flight = self.inner.in_flight.lock();

        let task = tokio::spawn(run_fetch(
            self.store.clone(),
            self.stats.clone(),
            self.inner.clone(),
            key.clone(),
            request_id,
            mode,
            query_fn.clone(),
            options.retry.clone(),
        ));
        let abort = task.abort_handle();

        let shared = async move {
            match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => {
                    Err(FeedCacheError::Cancelled("Request superseded or cancelled".into()))
                }
                Err(e) => Err(FeedCacheError::Internal(format!("Fetch task failed: {}", e))),
            }
        }
        .boxed()
        .shared();

        let previous = in_flight.insert(
            key.clone(),
            InFlight {
                request_id,
                shared: shared.clone(),
                abort,
            },
        );
        if let Some(previous) = previous {
            debug!(key = %key, superseded = previous.request_id, "Superseding in-flight fetch");
            previous.abort.abort();
        }

        shared
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_fetch(
    store: CacheStore,
    stats: StatsCollector,
    inner: Arc<ExecutorInner>,
    key: QueryKey,
    request_id: RequestId,
    mode: FetchMode,
    query_fn: QueryFn,
    retry: RetryConfig,
) -> Result<QueryData> {
    let result = load(&store, &key, &mode, &query_fn, &retry).await;

    if let Err(e) = &result {
        warn!(key = %key, error = %e, "Fetch failed");
        stats.record_fetch_error();
    }

    if !store.finish_fetch(&key, request_id, result.clone()) {
        warn!(key = %key, request_id, "Discarding result of superseded fetch");
        stats.record_discarded();
    }

    let mut in_flight = inner.in_flight.lock();
    if in_flight.get(&key).map(|f| f.request_id) == Some(request_id) {
        in_flight.remove(&key);
    }

    result
}

async fn load(
    store: &CacheStore,
    key: &QueryKey,
    mode: &FetchMode,
    query_fn: &QueryFn,
    retry: &RetryConfig,
) -> Result<QueryData> {
    match (query_fn, mode) {
        (QueryFn::Single(fetcher), FetchMode::Refresh) => with_retry(retry, key, || fetcher()).await,
        (QueryFn::Single(_), FetchMode::NextPage(_)) => Err(FeedCacheError::Internal(
            "Single-value query has no pages".into(),
        )),
        (QueryFn::Paged(fetcher), FetchMode::Refresh) => {
            let page = with_retry(retry, key, || fetcher(None)).await?;
            let pages = match store.get_data(key) {
                Some(QueryData::Pages(mut pages)) => {
                    pages.replace_first(page);
                    pages
                }
                _ => InfinitePages::from_first(page),
            };
            Ok(QueryData::Pages(pages))
        }
        (QueryFn::Paged(fetcher), FetchMode::NextPage(cursor)) => {
            let page = with_retry(retry, key, || fetcher(Some(cursor.clone()))).await?;
            let mut pages = match store.get_data(key) {
                Some(QueryData::Pages(pages)) => pages,
                _ => InfinitePages::default(),
            };
            pages.push(page);
            Ok(QueryData::Pages(pages))
        }
    }
}

/// Keeps a query registered and subscribed. Dropping the last observer of a
/// key cancels its in-flight fetch.
pub struct QueryObserver {
    key: QueryKey,
    subscription: Option<Subscription>,
    executor: QueryExecutor,
}

impl QueryObserver {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn data(&self) -> Option<QueryData> {
        self.executor.store.get_data(&self.key)
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        drop(self.subscription.take());

        if self.executor.store.subscriber_count(&self.key) == 0 {
            self.executor.inner.registry.lock().remove(&self.key);
            self.executor.cancel(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPattern;
    use crate::models::Collection;
    use crate::store::CacheEventKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    fn executor() -> QueryExecutor {
        let config = CacheConfig {
            retry: RetryConfig::none(),
            ..CacheConfig::default()
        };
        QueryExecutor::new(CacheStore::new(), &config, StatsCollector::new())
    }

    fn counting_flag(calls: Arc<AtomicU32>, value: bool) -> QueryFn {
        QueryFn::single(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(QueryData::Flag(value)) }
        })
    }

    fn post(id: &str) -> ContentItem {
        ContentItem::new(id, Collection::Posts, "author")
    }

    #[tokio::test]
    async fn test_fresh_entry_served_from_cache() {
        let executor = executor();
        let key = QueryKey::post_detail("p1");
        let calls = Arc::new(AtomicU32::new(0));
        let query = counting_flag(calls.clone(), true);
        let options = executor.default_options();

        let first = executor.fetch(&key, &query, &options).await.unwrap();
        let second = executor.fetch(&key, &query, &options).await.unwrap();

        assert_eq!(first, Some(QueryData::Flag(true)));
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.stats().snapshot().hits, 1);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_request() {
        let executor = executor();
        let key = QueryKey::post_detail("p1");
        let calls = Arc::new(AtomicU32::new(0));
        let gate = Arc::new(Notify::new());

        let calls_clone = calls.clone();
        let gate_clone = gate.clone();
        let query = QueryFn::single(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            let gate = gate_clone.clone();
            async move {
                gate.notified().await;
                Ok(QueryData::Flag(true))
            }
        });
        let options = executor.default_options();

        let a = executor.fetch(&key, &query, &options);
        let b = executor.fetch(&key, &query, &options);
        let release = async {
            tokio::task::yield_now().await;
            gate.notify_one();
        };
        let (a, b, _) = tokio::join!(a, b, release);

        assert_eq!(a.unwrap(), Some(QueryData::Flag(true)));
        assert_eq!(b.unwrap(), Some(QueryData::Flag(true)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.stats().snapshot().deduplicated, 1);
    }

    #[tokio::test]
    async fn test_disabled_query_skips_network() {
        let executor = executor();
        let key = QueryKey::post_detail("p1");
        let calls = Arc::new(AtomicU32::new(0));
        let query = counting_flag(calls.clone(), true);

        let result = executor
            .fetch(&key, &query, &executor.default_options().disabled())
            .await
            .unwrap();

        assert_eq!(result, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_error_surfaces_and_keeps_data() {
        let executor = executor();
        let key = QueryKey::post_detail("p1");
        executor.store().set(&key, QueryData::Flag(true));
        executor.store().mark_stale(&key);

        let failing = QueryFn::single(|| async { Err(FeedCacheError::Network("offline".into())) });
        let result = executor
            .fetch(&key, &failing, &executor.default_options())
            .await;

        assert_eq!(result, Err(FeedCacheError::Network("offline".into())));
        let entry = executor.store().get(&key).unwrap();
        assert_eq!(entry.data, Some(QueryData::Flag(true)));
        assert!(entry.error.is_some());

        // Still retryable
        let ok = counting_flag(Arc::new(AtomicU32::new(0)), false);
        let retried = executor
            .fetch(&key, &ok, &executor.default_options())
            .await
            .unwrap();
        assert_eq!(retried, Some(QueryData::Flag(false)));
    }

    #[tokio::test]
    async fn test_pagination_appends_until_exhausted() {
        let executor = executor();
        let key = QueryKey::feed("campus");
        let calls = Arc::new(AtomicU32::new(0));

        let calls_clone = calls.clone();
        let query = QueryFn::paged(move |cursor: Option<Cursor>| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok(match cursor {
                    None => PaginatedResult::new(vec![post("a"), post("b")], Some(Cursor::new("2"))),
                    Some(_) => PaginatedResult::last(vec![post("c")]),
                })
            }
        });
        let options = executor.default_options();

        executor.fetch(&key, &query, &options).await.unwrap();
        let second = executor
            .fetch_next_page(&key, &query, &options)
            .await
            .unwrap()
            .unwrap()
            .into_pages()
            .unwrap();
        assert_eq!(second.page_count(), 2);
        assert_eq!(second.len(), 3);

        let third = executor
            .fetch_next_page(&key, &query, &options)
            .await
            .unwrap()
            .unwrap()
            .into_pages()
            .unwrap();
        assert_eq!(third, second);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refetch_supersedes_in_flight() {
        let executor = executor();
        let key = QueryKey::post_detail("p1");
        let gate = Arc::new(Notify::new());

        let gate_clone = gate.clone();
        let slow = QueryFn::single(move || {
            let gate = gate_clone.clone();
            async move {
                gate.notified().await;
                Ok(QueryData::Flag(false))
            }
        });
        let fast = QueryFn::single(|| async { Ok(QueryData::Flag(true)) });
        let options = executor.default_options();

        let stale_call = executor.fetch(&key, &slow, &options);
        let superseding = async {
            tokio::task::yield_now().await;
            executor.refetch(&key, &fast, &options).await
        };
        let (old, new) = tokio::join!(stale_call, superseding);

        assert!(matches!(old, Err(FeedCacheError::Cancelled(_))));
        assert_eq!(new.unwrap(), QueryData::Flag(true));
        assert_eq!(executor.store().get_data(&key), Some(QueryData::Flag(true)));
    }

    #[tokio::test]
    async fn test_observe_fetches_and_drop_cancels() {
        let executor = executor();
        let key = QueryKey::post_detail("p1");
        let events = Arc::new(Mutex::new(Vec::new()));

        let events_clone = events.clone();
        let pending = QueryFn::single(|| futures::future::pending::<Result<QueryData>>());
        let observer = executor.observe(
            &key,
            pending,
            executor.default_options(),
            move |event: &CacheEvent| events_clone.lock().push(event.kind),
        );

        tokio::task::yield_now().await;
        assert!(executor.is_fetching(&key));

        drop(observer);
        assert!(!executor.is_fetching(&key));
        assert_eq!(executor.store().subscriber_count(&key), 0);
        assert_eq!(*events.lock(), vec![CacheEventKind::FetchStarted]);
    }

    #[tokio::test]
    async fn test_refetch_stale_only_touches_observed() {
        let executor = executor();
        let observed = QueryKey::post_detail("p1");
        let unobserved = QueryKey::post_detail("p2");
        let calls = Arc::new(AtomicU32::new(0));
        let options = executor.default_options();

        executor
            .fetch(&unobserved, &counting_flag(calls.clone(), true), &options)
            .await
            .unwrap();
        let _observer = executor.observe(
            &observed,
            counting_flag(calls.clone(), true),
            options.clone(),
            |_| {},
        );
        tokio::task::yield_now().await;
        while executor.is_fetching(&observed) {
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        executor.store().invalidate(&KeyPattern::prefix(["posts", "detail"]));
        let started = executor.refetch_stale().await;

        assert_eq!(started, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!executor.store().get(&observed).unwrap().is_stale);
        assert!(executor.store().get(&unobserved).unwrap().is_stale);
    }
}
