/// Query cache lifecycle: deduplication, staleness, errors, pagination,
/// garbage collection and pushed changes
use feed_cache::memory::InMemoryBackend;
use feed_cache::{
    CacheConfig, CacheEventKind, Collection, ContentItem, DocumentChange, FeedCacheError,
    FeedClient, KeyPattern, QueryKey, RetryConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

fn config() -> CacheConfig {
    CacheConfig {
        stale_time: Duration::from_secs(1),
        gc_time: Duration::from_secs(10),
        page_size: 10,
        refetch_on_settle: false,
        retry: RetryConfig::none(),
        ..CacheConfig::default()
    }
}

fn setup(posts: usize) -> (FeedClient, Arc<InMemoryBackend>) {
    let backend = Arc::new(InMemoryBackend::new());
    for i in 0..posts {
        backend.insert_item(ContentItem::new(format!("p{}", i), Collection::Posts, "author"));
    }
    (FeedClient::with_backend(config(), backend.clone()), backend)
}

// ==================== Fetch Tests ====================

#[tokio::test]
async fn test_concurrent_reads_share_one_request() {
    let (client, backend) = setup(3);

    let (first, second) = tokio::join!(client.post("p1"), client.post("p1"));

    assert_eq!(assert_ok!(first).id, "p1");
    assert_eq!(assert_ok!(second).id, "p1");
    assert_eq!(backend.calls("get_by_id"), 1);
    assert_eq!(client.stats().deduplicated, 1);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_hit_then_stale_refetch() {
    let (client, backend) = setup(3);

    assert_ok!(client.post("p1").await);
    assert_ok!(client.post("p1").await);
    assert_eq!(backend.calls("get_by_id"), 1);
    assert_eq!(client.stats().hits, 1);

    tokio::time::advance(Duration::from_secs(2)).await;

    assert_ok!(client.post("p1").await);
    assert_eq!(backend.calls("get_by_id"), 2);
}

#[tokio::test]
async fn test_failed_refetch_keeps_previous_data() {
    let (client, backend) = setup(3);
    let key = QueryKey::post_detail("p1");
    assert_ok!(client.post("p1").await);

    client.store().invalidate(&KeyPattern::exact(&key));
    backend.set_offline(true);

    let err = assert_err!(client.post("p1").await);
    assert!(matches!(err, FeedCacheError::Network(_)));

    let entry = client.store().get(&key).unwrap();
    assert_eq!(entry.data.unwrap().as_item().unwrap().id, "p1");
    assert!(entry.error.is_some());
    assert_eq!(client.stats().fetch_errors, 1);
}

#[tokio::test]
async fn test_missing_post_is_not_found() {
    let (client, _) = setup(1);

    let err = assert_err!(client.post("nope").await);

    assert!(matches!(err, FeedCacheError::NotFound(_)));
}

// ==================== Invalidation Tests ====================

#[tokio::test]
async fn test_invalidation_is_idempotent() {
    let (client, _) = setup(3);
    assert_ok!(client.post("p1").await);
    assert_ok!(client.feed("campus").await);
    let pattern = KeyPattern::prefix(["posts"]);

    let first = client.store().invalidate(&pattern);
    let second = client.store().invalidate(&pattern);

    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
    assert!(first
        .iter()
        .all(|key| client.store().get(key).unwrap().is_stale));
}

#[tokio::test]
async fn test_pushed_change_marks_entries_stale() {
    let (client, _) = setup(3);
    assert_ok!(client.post("p1").await);
    assert_ok!(client.post("p2").await);
    assert_ok!(client.feed("campus").await);

    let (tx, rx) = mpsc::channel(8);
    let listener = client.listen_for_changes(rx);
    assert_ok!(
        tx.send(DocumentChange::updated(Collection::Posts, "p1", None))
            .await
    );
    drop(tx);
    assert_ok!(listener.await);

    let stale = |key: QueryKey| client.store().get(&key).unwrap().is_stale;
    assert!(stale(QueryKey::post_detail("p1")));
    assert!(stale(QueryKey::feed("campus")));
    assert!(!stale(QueryKey::post_detail("p2")));
}

// ==================== Pagination Tests ====================

#[tokio::test]
async fn test_pages_accumulate_until_exhausted() {
    let (client, backend) = setup(25);

    let first = assert_ok!(client.feed("campus").await);
    assert_eq!(first.page_count(), 1);
    assert!(first.has_next_page());

    assert_ok!(client.feed_next_page("campus").await);
    let all = assert_ok!(client.feed_next_page("campus").await);
    assert_eq!(all.page_count(), 3);
    assert_eq!(all.len(), 25);
    assert!(!all.has_next_page());

    let again = assert_ok!(client.feed_next_page("campus").await);
    assert_eq!(again, all);
    assert_eq!(backend.calls("query_page"), 3);
}

// ==================== Observer and GC Tests ====================

#[tokio::test(start_paused = true)]
async fn test_observed_entries_survive_gc() {
    let (client, _) = setup(3);
    assert_ok!(client.post("p1").await);

    let updates = Arc::new(AtomicUsize::new(0));
    let counter = updates.clone();
    let observer = client.observe_feed("campus", move |event| {
        if event.kind == CacheEventKind::Updated {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    for _ in 0..100 {
        if observer.data().is_some() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(observer.data().is_some());
    assert_eq!(updates.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(client.collect_garbage(), 1);
    assert!(!client.store().contains(&QueryKey::post_detail("p1")));
    assert!(client.store().contains(&QueryKey::feed("campus")));

    drop(observer);
    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(client.collect_garbage(), 1);
    assert!(client.store().is_empty());
    assert_eq!(client.stats().evictions, 2);
}
