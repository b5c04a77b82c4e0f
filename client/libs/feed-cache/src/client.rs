//! Feed client facade
//!
//! Wires one [`CacheStore`] to the executor, membership checker, mutation
//! coordinator and invalidation propagator, and exposes typed reads and
//! writes for the feed screens. Cheap to clone; clones share all state.

use crate::backend::{DocumentStore, MutationRpc, QueryFilters};
use crate::changes::{ChangeListener, DocumentChange};
use crate::config::CacheConfig;
use crate::coordinator::MutationCoordinator;
use crate::error::{FeedCacheError, Result};
use crate::executor::{QueryExecutor, QueryFn, QueryObserver, QueryOptions};
use crate::feed::FeedComposer;
use crate::invalidation::InvalidationPropagator;
use crate::keys::QueryKey;
use crate::membership::MembershipBatchChecker;
use crate::models::{
    Collection, ContentItem, Cursor, FeedItem, InfinitePages, InteractionKind, MembershipState,
    QueryData, SponsoredItem,
};
use crate::mutation::{Mutation, MutationOutcome};
use crate::retry::RetryConfig;
use crate::stats::{CacheStats, StatsCollector};
use crate::store::{CacheEvent, CacheStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Clone)]
pub struct FeedClient {
    config: CacheConfig,
    stats: StatsCollector,
    executor: QueryExecutor,
    documents: Arc<dyn DocumentStore>,
    membership: MembershipBatchChecker,
    coordinator: MutationCoordinator,
    propagator: InvalidationPropagator,
}

impl FeedClient {
    pub fn new(
        config: CacheConfig,
        documents: Arc<dyn DocumentStore>,
        rpc: Arc<dyn MutationRpc>,
    ) -> Self {
        let store = CacheStore::new();
        let stats = StatsCollector::new();
        let executor = QueryExecutor::new(store.clone(), &config, stats.clone());
        let membership = MembershipBatchChecker::new(executor.clone(), documents.clone());
        let propagator = InvalidationPropagator::new(store, stats.clone());
        let coordinator = MutationCoordinator::new(
            executor.clone(),
            membership.clone(),
            rpc,
            propagator.clone(),
            &config,
        );

        Self {
            config,
            stats,
            executor,
            documents,
            membership,
            coordinator,
            propagator,
        }
    }

    /// One backend serving both reads and mutations
    pub fn with_backend<B>(config: CacheConfig, backend: Arc<B>) -> Self
    where
        B: DocumentStore + MutationRpc + 'static,
    {
        Self::new(config, backend.clone(), backend)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &CacheStore {
        self.executor.store()
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    pub fn membership(&self) -> &MembershipBatchChecker {
        &self.membership
    }

    pub fn coordinator(&self) -> &MutationCoordinator {
        &self.coordinator
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    // ============= Query functions =============

    pub fn post_query(&self, post_id: &str) -> QueryFn {
        let documents = self.documents.clone();
        let post_id = post_id.to_string();
        QueryFn::single(move || {
            let documents = documents.clone();
            let post_id = post_id.clone();
            async move {
                documents
                    .get_by_id(Collection::Posts, &post_id)
                    .await
                    .map(QueryData::Item)
            }
        })
    }

    fn paged_query(&self, collection: Collection, filters: QueryFilters) -> QueryFn {
        let documents = self.documents.clone();
        let page_size = self.config.page_size;
        QueryFn::paged(move |cursor: Option<Cursor>| {
            let documents = documents.clone();
            let filters = filters.clone();
            async move {
                documents
                    .query_page(collection, &filters, cursor, page_size)
                    .await
            }
        })
    }

    pub fn feed_query(&self, scope: &str) -> QueryFn {
        self.paged_query(Collection::Posts, QueryFilters::feed(scope))
    }

    pub fn user_posts_query(&self, user_id: &str) -> QueryFn {
        self.paged_query(Collection::Posts, QueryFilters::by_author(user_id))
    }

    pub fn comments_query(&self, post_id: &str) -> QueryFn {
        self.paged_query(Collection::Comments, QueryFilters::by_parent(post_id))
    }

    pub fn saved_query(&self, user_id: &str) -> QueryFn {
        self.paged_query(Collection::Posts, QueryFilters::saved_by(user_id))
    }

    fn sponsored_query(&self) -> QueryFn {
        let documents = self.documents.clone();
        QueryFn::single(move || {
            let documents = documents.clone();
            async move { documents.list_sponsored().await.map(QueryData::Sponsored) }
        })
    }

    // ============= Reads =============

    async fn load(&self, key: &QueryKey, query: &QueryFn) -> Result<QueryData> {
        self.load_with(key, query, &self.executor.default_options()).await
    }

    async fn load_with(
        &self,
        key: &QueryKey,
        query: &QueryFn,
        options: &QueryOptions,
    ) -> Result<QueryData> {
        self.executor
            .fetch(key, query, options)
            .await?
            .ok_or_else(|| FeedCacheError::NotFound(format!("No data for {}", key)))
    }

    async fn load_next(&self, key: &QueryKey, query: &QueryFn) -> Result<InfinitePages> {
        self.executor
            .fetch_next_page(key, query, &self.executor.default_options())
            .await?
            .ok_or_else(|| FeedCacheError::NotFound(format!("No data for {}", key)))?
            .into_pages()
    }

    /// Post detail renders above the fold, so transient failures get the
    /// [`RetryConfig::interactive`] policy instead of the configured one
    pub async fn post(&self, post_id: &str) -> Result<ContentItem> {
        let options = self
            .executor
            .default_options()
            .with_retry(RetryConfig::interactive());
        self.load_with(&QueryKey::post_detail(post_id), &self.post_query(post_id), &options)
            .await?
            .into_item()
    }

    pub async fn feed(&self, scope: &str) -> Result<InfinitePages> {
        self.load(&QueryKey::feed(scope), &self.feed_query(scope))
            .await?
            .into_pages()
    }

    pub async fn feed_next_page(&self, scope: &str) -> Result<InfinitePages> {
        self.load_next(&QueryKey::feed(scope), &self.feed_query(scope))
            .await
    }

    pub async fn user_posts(&self, user_id: &str) -> Result<InfinitePages> {
        self.load(&QueryKey::user_posts(user_id), &self.user_posts_query(user_id))
            .await?
            .into_pages()
    }

    pub async fn comments(&self, post_id: &str) -> Result<InfinitePages> {
        self.load(&QueryKey::comments(post_id), &self.comments_query(post_id))
            .await?
            .into_pages()
    }

    pub async fn comments_next_page(&self, post_id: &str) -> Result<InfinitePages> {
        self.load_next(&QueryKey::comments(post_id), &self.comments_query(post_id))
            .await
    }

    pub async fn saved_posts(&self, user_id: &str) -> Result<InfinitePages> {
        self.load(&QueryKey::saved_list(user_id), &self.saved_query(user_id))
            .await?
            .into_pages()
    }

    pub async fn sponsored(&self) -> Result<Vec<SponsoredItem>> {
        self.load(&QueryKey::sponsored(), &self.sponsored_query())
            .await?
            .into_sponsored()
    }

    /// Every loaded page of a feed with sponsored items interleaved. A
    /// failing sponsored pool degrades to the plain feed.
    pub async fn composed_feed(&self, scope: &str) -> Result<Vec<Vec<FeedItem>>> {
        let pages = self.feed(scope).await?;
        let pool = match self.sponsored().await {
            Ok(pool) => pool,
            Err(e) => {
                warn!(error = %e, "Sponsored pool unavailable, composing without it");
                Vec::new()
            }
        };

        Ok(FeedComposer::new(self.config.sponsored_interval).compose_pages(&pages, &pool))
    }

    pub async fn check_memberships<S: AsRef<str>>(
        &self,
        kind: InteractionKind,
        user_id: &str,
        ids: &[S],
    ) -> Result<MembershipState> {
        self.membership.check_batch(kind, user_id, ids).await
    }

    /// Keep a feed subscribed so invalidations refetch it
    pub fn observe_feed<F>(&self, scope: &str, listener: F) -> QueryObserver
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.executor.observe(
            &QueryKey::feed(scope),
            self.feed_query(scope),
            self.executor.default_options(),
            listener,
        )
    }

    pub fn observe_post<F>(&self, post_id: &str, listener: F) -> QueryObserver
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.executor.observe(
            &QueryKey::post_detail(post_id),
            self.post_query(post_id),
            self.executor.default_options(),
            listener,
        )
    }

    // ============= Writes =============

    pub async fn mutate(&self, mutation: Mutation) -> Result<MutationOutcome> {
        self.coordinator.mutate(mutation).await
    }

    pub async fn toggle_like(&self, post_id: &str, user_id: &str) -> Result<MutationOutcome> {
        self.mutate(Mutation::ToggleLike {
            post_id: post_id.to_string(),
            user_id: user_id.to_string(),
        })
        .await
    }

    pub async fn toggle_save(&self, post_id: &str, user_id: &str) -> Result<MutationOutcome> {
        self.mutate(Mutation::ToggleSave {
            post_id: post_id.to_string(),
            user_id: user_id.to_string(),
        })
        .await
    }

    pub async fn toggle_report(&self, post_id: &str, user_id: &str) -> Result<MutationOutcome> {
        self.mutate(Mutation::ToggleReport {
            post_id: post_id.to_string(),
            user_id: user_id.to_string(),
        })
        .await
    }

    pub async fn toggle_follow(
        &self,
        target_user_id: &str,
        user_id: &str,
    ) -> Result<MutationOutcome> {
        self.mutate(Mutation::ToggleFollow {
            target_user_id: target_user_id.to_string(),
            user_id: user_id.to_string(),
        })
        .await
    }

    pub async fn create_comment(
        &self,
        post_id: &str,
        parent_id: Option<&str>,
        author_id: &str,
        body: &str,
    ) -> Result<MutationOutcome> {
        self.mutate(Mutation::CreateComment {
            post_id: post_id.to_string(),
            parent_id: parent_id.map(str::to_string),
            author_id: author_id.to_string(),
            body: body.to_string(),
        })
        .await
    }

    pub async fn create_post(&self, author_id: &str, body: &str) -> Result<MutationOutcome> {
        self.mutate(Mutation::CreatePost {
            author_id: author_id.to_string(),
            body: body.to_string(),
        })
        .await
    }

    pub async fn delete_comment(
        &self,
        comment_id: &str,
        post_id: &str,
        user_id: &str,
    ) -> Result<MutationOutcome> {
        self.mutate(Mutation::DeleteComment {
            comment_id: comment_id.to_string(),
            post_id: post_id.to_string(),
            user_id: user_id.to_string(),
        })
        .await
    }

    pub async fn delete_post(&self, post_id: &str, user_id: &str) -> Result<MutationOutcome> {
        self.mutate(Mutation::DeletePost {
            post_id: post_id.to_string(),
            user_id: user_id.to_string(),
        })
        .await
    }

    // ============= Maintenance =============

    /// Start consuming pushed document changes
    pub fn listen_for_changes(&self, changes: mpsc::Receiver<DocumentChange>) -> JoinHandle<()> {
        ChangeListener::new(
            self.propagator.clone(),
            self.executor.clone(),
            self.config.refetch_on_settle,
        )
        .spawn(changes)
    }

    pub fn collect_garbage(&self) -> usize {
        self.executor.collect_garbage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;

    fn client() -> (FeedClient, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        for i in 0..12 {
            backend.insert_item(ContentItem::new(format!("p{}", i), Collection::Posts, "author"));
        }
        backend.add_sponsored(SponsoredItem::new("ad0", "Ad 0"));
        backend.add_sponsored(SponsoredItem::new("ad1", "Ad 1"));

        let config = CacheConfig {
            page_size: 12,
            refetch_on_settle: false,
            retry: RetryConfig::none(),
            ..CacheConfig::default()
        };
        (FeedClient::with_backend(config, backend.clone()), backend)
    }

    #[tokio::test]
    async fn test_composed_feed_interleaves_ads() {
        let (client, _) = client();

        let pages = client.composed_feed("campus").await.unwrap();

        assert_eq!(pages.len(), 1);
        let sponsored: Vec<(usize, &str)> = pages[0]
            .iter()
            .filter(|i| i.is_sponsored())
            .map(|i| (i.position, i.id()))
            .collect();
        assert_eq!(sponsored, vec![(5, "ad0"), (11, "ad1")]);
    }

    #[tokio::test]
    async fn test_composed_feed_survives_sponsored_failure() {
        let (client, backend) = client();
        client.feed("campus").await.unwrap();

        backend.fail_next(FeedCacheError::Network("ads down".into()));
        let pages = client.composed_feed("campus").await.unwrap();

        assert_eq!(pages[0].len(), 12);
    }

    #[tokio::test]
    async fn test_reads_are_cached() {
        let (client, backend) = client();

        let first = client.post("p3").await.unwrap();
        let second = client.post("p3").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.calls("get_by_id"), 1);
        assert!(client.post("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_read_retries_transient_failure() {
        let (client, backend) = client();
        backend.fail_next(FeedCacheError::Network("flaky wifi".into()));
        backend.fail_next(FeedCacheError::Network("flaky wifi".into()));

        let post = client.post("p4").await.unwrap();

        assert_eq!(post.id, "p4");
        assert_eq!(backend.calls("get_by_id"), 3);
        assert_eq!(client.stats().fetch_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_read_uses_configured_retry() {
        let (client, backend) = client();
        backend.fail_next(FeedCacheError::Network("flaky wifi".into()));

        assert!(client.feed("campus").await.is_err());
        assert_eq!(backend.calls("query_page"), 1);
    }

    #[tokio::test]
    async fn test_saved_posts_follow_save_toggle() {
        let (client, backend) = client();
        backend.set_member(InteractionKind::Save, "u1", "p2", true);
        assert_eq!(client.saved_posts("u1").await.unwrap().len(), 1);
        client.post("p5").await.unwrap();

        let outcome = client.toggle_save("p5", "u1").await.unwrap();

        assert_eq!(outcome, MutationOutcome::Toggled { active: true });
        let saved = client
            .store()
            .get_data(&QueryKey::saved_list("u1"))
            .unwrap();
        let saved = saved.as_pages().unwrap();
        assert!(saved.contains("p5"));
        assert!(saved.contains("p2"));
    }
}
