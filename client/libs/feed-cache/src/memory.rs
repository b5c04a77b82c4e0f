//! In-process backend implementing both [`DocumentStore`] and [`MutationRpc`]
//!
//! Used by the integration tests and the demo binary. Supports going offline,
//! injecting one-shot failures, holding mutation calls open and counting
//! calls per method.

use crate::backend::{DocumentStore, MutationRpc, QueryFilters};
use crate::error::{FeedCacheError, Result};
use crate::models::{
    Collection, ContentItem, Counter, Cursor, InteractionKind, PaginatedResult, SponsoredItem,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct State {
    items: HashMap<String, ContentItem>,
    /// Insertion order, oldest first
    order: Vec<String>,
    edges: HashSet<(InteractionKind, String, String)>,
    sponsored: Vec<SponsoredItem>,
}

pub struct InMemoryBackend {
    state: Mutex<State>,
    offline: AtomicBool,
    failures: Mutex<VecDeque<FeedCacheError>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    /// `true` while mutation calls may proceed
    gate: watch::Sender<bool>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Mutex::new(State::default()),
            offline: AtomicBool::new(false),
            failures: Mutex::new(VecDeque::new()),
            calls: Mutex::new(HashMap::new()),
            gate,
        }
    }

    // ============= Seeding =============

    pub fn insert_item(&self, item: ContentItem) {
        let mut state = self.state.lock();
        if !state.items.contains_key(&item.id) {
            state.order.push(item.id.clone());
        }
        state.items.insert(item.id.clone(), item);
    }

    pub fn set_member(&self, kind: InteractionKind, user_id: &str, target_id: &str, member: bool) {
        let edge = (kind, user_id.to_string(), target_id.to_string());
        let mut state = self.state.lock();
        if member {
            state.edges.insert(edge);
        } else {
            state.edges.remove(&edge);
        }
    }

    pub fn add_sponsored(&self, item: SponsoredItem) {
        self.state.lock().sponsored.push(item);
    }

    pub fn item(&self, id: &str) -> Option<ContentItem> {
        self.state.lock().items.get(id).cloned()
    }

    pub fn has_edge(&self, kind: InteractionKind, user_id: &str, target_id: &str) -> bool {
        self.state
            .lock()
            .edges
            .contains(&(kind, user_id.to_string(), target_id.to_string()))
    }

    // ============= Fault injection =============

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// The next call (of any method) fails with `error`
    pub fn fail_next(&self, error: FeedCacheError) {
        self.failures.lock().push_back(error);
    }

    /// Mutation calls block until [`Self::resume_mutations`]
    pub fn pause_mutations(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume_mutations(&self) {
        self.gate.send_replace(true);
    }

    // ============= Call accounting =============

    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().get(method).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }

    fn enter(&self, method: &'static str) -> Result<()> {
        *self.calls.lock().entry(method).or_insert(0) += 1;

        if self.offline.load(Ordering::SeqCst) {
            debug!(method, "Backend offline");
            return Err(FeedCacheError::Network("offline".into()));
        }
        if let Some(error) = self.failures.lock().pop_front() {
            debug!(method, error = %error, "Injected failure");
            return Err(error);
        }
        Ok(())
    }

    async fn enter_mutation(&self, method: &'static str) -> Result<()> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        self.enter(method)
    }

    fn toggle_edge(&self, kind: InteractionKind, user_id: &str, target_id: &str) -> bool {
        let edge = (kind, user_id.to_string(), target_id.to_string());
        let mut state = self.state.lock();
        if state.edges.remove(&edge) {
            false
        } else {
            state.edges.insert(edge);
            true
        }
    }

    fn adjust(&self, id: &str, counter: Counter, delta: i64) -> Result<()> {
        let mut state = self.state.lock();
        let item = state
            .items
            .get_mut(id)
            .filter(|item| !item.is_deleted)
            .ok_or_else(|| FeedCacheError::NotFound(format!("Content {} not found", id)))?;
        item.adjust(counter, delta);
        item.updated_at = Utc::now();
        Ok(())
    }

    fn require_live(&self, id: &str) -> Result<()> {
        match self.state.lock().items.get(id) {
            Some(item) if !item.is_deleted => Ok(()),
            _ => Err(FeedCacheError::NotFound(format!("Content {} not found", id))),
        }
    }

    fn tombstone(&self, id: &str, user_id: &str) -> Result<ContentItem> {
        let mut state = self.state.lock();
        let item = state
            .items
            .get_mut(id)
            .filter(|item| !item.is_deleted)
            .ok_or_else(|| FeedCacheError::NotFound(format!("Content {} not found", id)))?;
        if item.author_id != user_id {
            return Err(FeedCacheError::Conflict(format!(
                "User {} cannot delete {}",
                user_id, id
            )));
        }
        item.tombstone();
        Ok(item.clone())
    }
}

#[async_trait]
impl DocumentStore for InMemoryBackend {
    async fn get_by_id(&self, collection: Collection, id: &str) -> Result<ContentItem> {
        self.enter("get_by_id")?;
        self.state
            .lock()
            .items
            .get(id)
            .filter(|item| item.collection == collection && !item.is_deleted)
            .cloned()
            .ok_or_else(|| FeedCacheError::NotFound(format!("{} {} not found", collection, id)))
    }

    async fn query_page(
        &self,
        collection: Collection,
        filters: &QueryFilters,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<PaginatedResult<ContentItem>> {
        self.enter("query_page")?;

        let offset = match &cursor {
            Some(cursor) => cursor.as_str().parse::<usize>().map_err(|_| {
                FeedCacheError::Validation(format!("Malformed cursor: {}", cursor.as_str()))
            })?,
            None => 0,
        };

        let state = self.state.lock();
        // Newest first
        let matching: Vec<ContentItem> = state
            .order
            .iter()
            .rev()
            .filter_map(|id| state.items.get(id))
            .filter(|item| item.collection == collection && filters.matches(item))
            .filter(|item| match &filters.saved_by {
                Some(user) => state
                    .edges
                    .contains(&(InteractionKind::Save, user.clone(), item.id.clone())),
                None => true,
            })
            .cloned()
            .collect();

        let limit = limit.max(1);
        let items: Vec<ContentItem> = matching.iter().skip(offset).take(limit).cloned().collect();
        let next = offset + items.len();
        let next_cursor = if next < matching.len() {
            Some(Cursor::new(next.to_string()))
        } else {
            None
        };
        Ok(PaginatedResult::new(items, next_cursor))
    }

    async fn create(&self, item: ContentItem) -> Result<ContentItem> {
        self.enter("create")?;
        let mut created = item;
        if created.is_temporary() || created.id.is_empty() {
            created.id = Uuid::new_v4().to_string();
        }
        self.insert_item(created.clone());
        Ok(created)
    }

    async fn update(&self, item: ContentItem) -> Result<ContentItem> {
        self.enter("update")?;
        self.require_live(&item.id)?;
        let mut updated = item;
        updated.updated_at = Utc::now();
        self.insert_item(updated.clone());
        Ok(updated)
    }

    async fn delete(&self, _collection: Collection, id: &str) -> Result<()> {
        self.enter("delete")?;
        let mut state = self.state.lock();
        match state.items.get_mut(id) {
            Some(item) if !item.is_deleted => {
                item.tombstone();
                Ok(())
            }
            _ => Err(FeedCacheError::NotFound(format!("Content {} not found", id))),
        }
    }

    async fn find_memberships(
        &self,
        kind: InteractionKind,
        user_id: &str,
        ids: &[String],
    ) -> Result<BTreeSet<String>> {
        self.enter("find_memberships")?;
        let state = self.state.lock();
        Ok(ids
            .iter()
            .filter(|id| {
                state
                    .edges
                    .contains(&(kind, user_id.to_string(), id.to_string()))
            })
            .cloned()
            .collect())
    }

    async fn is_member(&self, kind: InteractionKind, user_id: &str, target_id: &str) -> Result<bool> {
        self.enter("is_member")?;
        Ok(self.has_edge(kind, user_id, target_id))
    }

    async fn list_sponsored(&self) -> Result<Vec<SponsoredItem>> {
        self.enter("list_sponsored")?;
        Ok(self.state.lock().sponsored.clone())
    }
}

#[async_trait]
impl MutationRpc for InMemoryBackend {
    async fn toggle_like(&self, post_id: &str, user_id: &str) -> Result<bool> {
        self.enter_mutation("toggle_like").await?;
        self.require_live(post_id)?;
        let liked = self.toggle_edge(InteractionKind::Like, user_id, post_id);
        self.adjust(post_id, Counter::Likes, if liked { 1 } else { -1 })?;
        Ok(liked)
    }

    async fn toggle_save(&self, post_id: &str, user_id: &str) -> Result<bool> {
        self.enter_mutation("toggle_save").await?;
        self.require_live(post_id)?;
        Ok(self.toggle_edge(InteractionKind::Save, user_id, post_id))
    }

    async fn toggle_report(&self, content_id: &str, user_id: &str) -> Result<bool> {
        self.enter_mutation("toggle_report").await?;
        self.require_live(content_id)?;
        let reported = self.toggle_edge(InteractionKind::Report, user_id, content_id);
        if reported {
            self.adjust(content_id, Counter::Reports, 1)?;
        }
        Ok(reported)
    }

    async fn toggle_follow(&self, target_user_id: &str, user_id: &str) -> Result<bool> {
        self.enter_mutation("toggle_follow").await?;
        if target_user_id == user_id {
            return Err(FeedCacheError::Conflict("Cannot follow yourself".into()));
        }
        Ok(self.toggle_edge(InteractionKind::Follow, user_id, target_user_id))
    }

    async fn create_comment(
        &self,
        post_id: &str,
        parent_id: Option<String>,
        author_id: &str,
        body: &str,
    ) -> Result<ContentItem> {
        self.enter_mutation("create_comment").await?;
        self.require_live(post_id)?;

        let comment = ContentItem::new(Uuid::new_v4().to_string(), Collection::Comments, author_id)
            .with_body(body)
            .with_parent(parent_id.unwrap_or_else(|| post_id.to_string()));
        self.insert_item(comment.clone());
        self.adjust(post_id, Counter::Replies, 1)?;
        Ok(comment)
    }

    async fn create_post(&self, author_id: &str, body: &str) -> Result<ContentItem> {
        self.enter_mutation("create_post").await?;
        let post = ContentItem::new(Uuid::new_v4().to_string(), Collection::Posts, author_id)
            .with_body(body);
        self.insert_item(post.clone());
        Ok(post)
    }

    async fn delete_comment(&self, comment_id: &str, user_id: &str) -> Result<()> {
        self.enter_mutation("delete_comment").await?;
        let comment = self.tombstone(comment_id, user_id)?;

        // Walk up to the owning post
        let mut parent = comment.parent_id;
        while let Some(id) = parent {
            let item = self.item(&id);
            match item {
                Some(item) if item.collection == Collection::Posts => {
                    self.adjust(&item.id, Counter::Replies, -1)?;
                    break;
                }
                Some(item) => parent = item.parent_id,
                None => break,
            }
        }
        Ok(())
    }

    async fn delete_post(&self, post_id: &str, user_id: &str) -> Result<()> {
        self.enter_mutation("delete_post").await?;
        self.tombstone(post_id, user_id).map(|_| ())
    }
}
