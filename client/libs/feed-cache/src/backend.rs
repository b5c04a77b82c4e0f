//! Seams to the remote document store and mutation endpoints
//!
//! The cache never talks to the network directly; everything goes through
//! these two traits so tests can swap in [`crate::memory::InMemoryBackend`]
//! or a mock.

use crate::error::Result;
use crate::models::{Collection, ContentItem, Cursor, InteractionKind, PaginatedResult, SponsoredItem};
use async_trait::async_trait;
use std::collections::BTreeSet;

/// Filters for a paginated collection query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilters {
    /// Feed scope name, e.g. `campus`
    pub scope: Option<String>,
    pub author_id: Option<String>,
    pub parent_id: Option<String>,
    /// Only items this user has saved; resolved by the store against its edges
    pub saved_by: Option<String>,
    pub include_hidden: bool,
}

impl QueryFilters {
    pub fn feed(scope: &str) -> Self {
        Self {
            scope: Some(scope.to_string()),
            ..Default::default()
        }
    }

    pub fn by_author(author_id: &str) -> Self {
        Self {
            author_id: Some(author_id.to_string()),
            ..Default::default()
        }
    }

    pub fn by_parent(parent_id: &str) -> Self {
        Self {
            parent_id: Some(parent_id.to_string()),
            ..Default::default()
        }
    }

    pub fn saved_by(user_id: &str) -> Self {
        Self {
            saved_by: Some(user_id.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, item: &ContentItem) -> bool {
        if item.is_deleted {
            return false;
        }
        if item.is_hidden && !self.include_hidden {
            return false;
        }
        if let Some(author) = &self.author_id {
            if &item.author_id != author {
                return false;
            }
        }
        if let Some(parent) = &self.parent_id {
            if item.parent_id.as_ref() != Some(parent) {
                return false;
            }
        }
        true
    }
}

/// Read/write access to the remote document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_by_id(&self, collection: Collection, id: &str) -> Result<ContentItem>;

    async fn query_page(
        &self,
        collection: Collection,
        filters: &QueryFilters,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<PaginatedResult<ContentItem>>;

    async fn create(&self, item: ContentItem) -> Result<ContentItem>;

    async fn update(&self, item: ContentItem) -> Result<ContentItem>;

    async fn delete(&self, collection: Collection, id: &str) -> Result<()>;

    /// Subset of `ids` for which the user holds a `kind` edge
    async fn find_memberships(
        &self,
        kind: InteractionKind,
        user_id: &str,
        ids: &[String],
    ) -> Result<BTreeSet<String>>;

    async fn is_member(&self, kind: InteractionKind, user_id: &str, target_id: &str) -> Result<bool>;

    async fn list_sponsored(&self) -> Result<Vec<SponsoredItem>>;
}

/// Server-side mutation endpoints. Toggles return the server's new state.
#[async_trait]
pub trait MutationRpc: Send + Sync {
    async fn toggle_like(&self, post_id: &str, user_id: &str) -> Result<bool>;

    async fn toggle_save(&self, post_id: &str, user_id: &str) -> Result<bool>;

    async fn toggle_report(&self, content_id: &str, user_id: &str) -> Result<bool>;

    async fn toggle_follow(&self, target_user_id: &str, user_id: &str) -> Result<bool>;

    async fn create_comment(
        &self,
        post_id: &str,
        parent_id: Option<String>,
        author_id: &str,
        body: &str,
    ) -> Result<ContentItem>;

    async fn create_post(&self, author_id: &str, body: &str) -> Result<ContentItem>;

    async fn delete_comment(&self, comment_id: &str, user_id: &str) -> Result<()>;

    async fn delete_post(&self, post_id: &str, user_id: &str) -> Result<()>;
}
