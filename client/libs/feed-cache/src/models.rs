//! Domain models held by the cache
//!
//! Content items are owned by the remote document store; the cache only holds
//! read-through copies that the mutation coordinator edits optimistically.

use crate::error::{FeedCacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Prefix of client-generated ids for items not yet acknowledged by the server
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Document collection a content item lives in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Posts,
    Comments,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Posts => "posts",
            Collection::Comments => "comments",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Boolean user → content relation tracked through membership sets
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Like,
    Save,
    Report,
    /// Target is a user id rather than a content id
    Follow,
}

impl InteractionKind {
    /// First segment of every key for this kind
    pub fn prefix(&self) -> &'static str {
        match self {
            InteractionKind::Like => "likes",
            InteractionKind::Save => "saves",
            InteractionKind::Report => "reports",
            InteractionKind::Follow => "follows",
        }
    }
}

impl std::fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

/// Mutable counters on a content item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Likes,
    Replies,
    Reports,
}

/// A post or comment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentItem {
    pub id: String,
    pub collection: Collection,
    pub author_id: String,
    pub body: String,
    /// Post id for top-level comments, comment id for threaded replies
    pub parent_id: Option<String>,
    pub like_count: u32,
    pub reply_count: u32,
    pub report_count: u32,
    pub is_deleted: bool,
    pub is_hidden: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContentItem {
    pub fn new(id: impl Into<String>, collection: Collection, author_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            collection,
            author_id: author_id.into(),
            body: String::new(),
            parent_id: None,
            like_count: 0,
            reply_count: 0,
            report_count: 0,
            is_deleted: false,
            is_hidden: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Client-side placeholder shown until the server assigns an id
    pub fn draft(
        collection: Collection,
        author_id: &str,
        body: &str,
        parent_id: Option<String>,
    ) -> Self {
        let mut item = Self::new(
            format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4()),
            collection,
            author_id,
        );
        item.body = body.to_string();
        item.parent_id = parent_id;
        item
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_like_count(mut self, count: u32) -> Self {
        self.like_count = count;
        self
    }

    pub fn with_reply_count(mut self, count: u32) -> Self {
        self.reply_count = count;
        self
    }

    pub fn is_temporary(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }

    /// Deleted and hidden items never reach a rendered list
    pub fn is_visible(&self) -> bool {
        !self.is_deleted && !self.is_hidden
    }

    pub fn counter(&self, counter: Counter) -> u32 {
        match counter {
            Counter::Likes => self.like_count,
            Counter::Replies => self.reply_count,
            Counter::Reports => self.report_count,
        }
    }

    /// Apply a signed delta, clamping at zero
    pub fn adjust(&mut self, counter: Counter, delta: i64) {
        let slot = match counter {
            Counter::Likes => &mut self.like_count,
            Counter::Replies => &mut self.reply_count,
            Counter::Reports => &mut self.report_count,
        };
        let next = (*slot as i64 + delta).clamp(0, u32::MAX as i64);
        *slot = next as u32;
    }

    pub fn tombstone(&mut self) {
        self.is_deleted = true;
        self.updated_at = Utc::now();
    }
}

/// Opaque continuation token passed back to the store unchanged
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(pub String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of a paginated query
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    pub cursor: Option<Cursor>,
    pub has_more: bool,
}

impl<T> PaginatedResult<T> {
    pub fn new(items: Vec<T>, cursor: Option<Cursor>) -> Self {
        let has_more = cursor.is_some();
        Self {
            items,
            cursor,
            has_more,
        }
    }

    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            cursor: None,
            has_more: false,
        }
    }
}

/// All pages fetched so far for one paginated key, in fetch order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct InfinitePages {
    pub pages: Vec<PaginatedResult<ContentItem>>,
}

impl InfinitePages {
    pub fn from_first(page: PaginatedResult<ContentItem>) -> Self {
        Self { pages: vec![page] }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn has_next_page(&self) -> bool {
        self.pages.last().map(|p| p.has_more).unwrap_or(false)
    }

    pub fn next_cursor(&self) -> Option<&Cursor> {
        self.pages.last().filter(|p| p.has_more).and_then(|p| p.cursor.as_ref())
    }

    /// Refetch of page 1 replaces page 1 only
    pub fn replace_first(&mut self, page: PaginatedResult<ContentItem>) {
        if self.pages.is_empty() {
            self.pages.push(page);
        } else {
            self.pages[0] = page;
        }
    }

    pub fn push(&mut self, page: PaginatedResult<ContentItem>) {
        self.pages.push(page);
    }

    pub fn items(&self) -> impl Iterator<Item = &ContentItem> {
        self.pages.iter().flat_map(|p| p.items.iter())
    }

    pub fn items_mut(&mut self) -> impl Iterator<Item = &mut ContentItem> {
        self.pages.iter_mut().flat_map(|p| p.items.iter_mut())
    }

    pub fn len(&self) -> usize {
        self.pages.iter().map(|p| p.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items().any(|item| item.id == id)
    }

    pub fn find(&self, id: &str) -> Option<&ContentItem> {
        self.items().find(|item| item.id == id)
    }

    /// (page, index) of the first occurrence of `id`
    pub fn position(&self, id: &str) -> Option<(usize, usize)> {
        self.pages.iter().enumerate().find_map(|(page, result)| {
            result
                .items
                .iter()
                .position(|item| item.id == id)
                .map(|index| (page, index))
        })
    }

    /// Put `item` back at `(page, index)`, clamped to what is loaded now
    pub fn insert_at(&mut self, page: usize, index: usize, item: ContentItem) {
        match self.pages.len().checked_sub(1) {
            Some(last) => {
                let items = &mut self.pages[page.min(last)].items;
                items.insert(index.min(items.len()), item);
            }
            None => self.pages.push(PaginatedResult::last(vec![item])),
        }
    }

    /// Insert at the head of the first page
    pub fn insert_head(&mut self, item: ContentItem) {
        match self.pages.first_mut() {
            Some(first) => first.items.insert(0, item),
            None => self.pages.push(PaginatedResult::last(vec![item])),
        }
    }

    /// Remove every occurrence of `id`; returns whether anything was removed
    pub fn remove(&mut self, id: &str) -> bool {
        let mut removed = false;
        for page in &mut self.pages {
            let before = page.items.len();
            page.items.retain(|item| item.id != id);
            removed |= page.items.len() != before;
        }
        removed
    }

    /// Swap the item with `id` for `replacement`, keeping its position
    pub fn replace_item(&mut self, id: &str, replacement: &ContentItem) -> bool {
        let mut replaced = false;
        for item in self.items_mut() {
            if item.id == id {
                *item = replacement.clone();
                replaced = true;
            }
        }
        replaced
    }
}

/// Cached answer to "which of these ids satisfy the predicate for the user"
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MembershipSet {
    /// The id batch the set was resolved for
    pub ids: BTreeSet<String>,
    /// Subset of `ids` satisfying the predicate
    pub members: BTreeSet<String>,
}

impl MembershipSet {
    pub fn new(ids: BTreeSet<String>, members: BTreeSet<String>) -> Self {
        let members = members.intersection(&ids).cloned().collect();
        Self { ids, members }
    }

    /// Whether `id` belongs to the batch this set answers for
    pub fn covers(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    /// Flip membership of an id inside the batch; ids outside it are ignored
    pub fn set(&mut self, id: &str, member: bool) -> bool {
        if !self.covers(id) {
            return false;
        }
        if member {
            self.members.insert(id.to_string())
        } else {
            self.members.remove(id)
        }
    }
}

/// Three-state batch result so "still loading" is never read as "false"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipState {
    Unknown,
    Empty,
    Populated(BTreeSet<String>),
}

impl MembershipState {
    pub fn from_members(members: BTreeSet<String>) -> Self {
        if members.is_empty() {
            MembershipState::Empty
        } else {
            MembershipState::Populated(members)
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, MembershipState::Unknown)
    }

    /// `None` while unknown
    pub fn contains(&self, id: &str) -> Option<bool> {
        match self {
            MembershipState::Unknown => None,
            MembershipState::Empty => Some(false),
            MembershipState::Populated(members) => Some(members.contains(id)),
        }
    }

    /// Resolved member ids; empty while unknown
    pub fn members(&self) -> BTreeSet<String> {
        match self {
            MembershipState::Populated(members) => members.clone(),
            _ => BTreeSet::new(),
        }
    }
}

/// Secondary stream item merged into feeds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SponsoredItem {
    pub id: String,
    pub title: String,
    pub target_url: String,
    /// Rendered once above the first page instead of rotating
    #[serde(default)]
    pub pinned: bool,
}

impl SponsoredItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            target_url: String::new(),
            pinned: false,
        }
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEntry {
    Content(ContentItem),
    Sponsored(SponsoredItem),
}

/// One row of a composed feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub entry: FeedEntry,
    /// 0-based index in the composed sequence
    pub position: usize,
}

impl FeedItem {
    pub fn is_sponsored(&self) -> bool {
        matches!(self.entry, FeedEntry::Sponsored(_))
    }

    pub fn id(&self) -> &str {
        match &self.entry {
            FeedEntry::Content(item) => &item.id,
            FeedEntry::Sponsored(item) => &item.id,
        }
    }
}

/// Everything a cache entry can hold
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryData {
    Item(ContentItem),
    Pages(InfinitePages),
    Membership(MembershipSet),
    /// Individual membership check
    Flag(bool),
    Sponsored(Vec<SponsoredItem>),
}

impl QueryData {
    pub fn as_item(&self) -> Option<&ContentItem> {
        match self {
            QueryData::Item(item) => Some(item),
            _ => None,
        }
    }

    pub fn as_pages(&self) -> Option<&InfinitePages> {
        match self {
            QueryData::Pages(pages) => Some(pages),
            _ => None,
        }
    }

    pub fn as_membership(&self) -> Option<&MembershipSet> {
        match self {
            QueryData::Membership(set) => Some(set),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            QueryData::Flag(flag) => Some(*flag),
            _ => None,
        }
    }

    pub fn into_item(self) -> Result<ContentItem> {
        match self {
            QueryData::Item(item) => Ok(item),
            other => Err(mismatch("item", &other)),
        }
    }

    pub fn into_pages(self) -> Result<InfinitePages> {
        match self {
            QueryData::Pages(pages) => Ok(pages),
            other => Err(mismatch("pages", &other)),
        }
    }

    pub fn into_membership(self) -> Result<MembershipSet> {
        match self {
            QueryData::Membership(set) => Ok(set),
            other => Err(mismatch("membership", &other)),
        }
    }

    pub fn into_flag(self) -> Result<bool> {
        match self {
            QueryData::Flag(flag) => Ok(flag),
            other => Err(mismatch("flag", &other)),
        }
    }

    pub fn into_sponsored(self) -> Result<Vec<SponsoredItem>> {
        match self {
            QueryData::Sponsored(items) => Ok(items),
            other => Err(mismatch("sponsored", &other)),
        }
    }

    fn variant(&self) -> &'static str {
        match self {
            QueryData::Item(_) => "item",
            QueryData::Pages(_) => "pages",
            QueryData::Membership(_) => "membership",
            QueryData::Flag(_) => "flag",
            QueryData::Sponsored(_) => "sponsored",
        }
    }
}

fn mismatch(expected: &str, actual: &QueryData) -> FeedCacheError {
    FeedCacheError::Internal(format!(
        "Expected {} data, found {}",
        expected,
        actual.variant()
    ))
}
