//! Per-kind mutation strategies and the optimistic edits they produce
//!
//! A [`MutationStrategy`] is plain data: which membership edge the mutation
//! flips, how it moves counters, and where in the cache its effect shows up.
//! The coordinator is generic over these records.

use crate::keys::{KeyPattern, QueryKey};
use crate::models::{ContentItem, Counter, InfinitePages, InteractionKind, QueryData};
use crate::mutation::{Mutation, MutationKind};
use crate::store::CacheStore;
use std::collections::BTreeSet;

/// Counter movement when a relation is added / removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterDelta {
    pub counter: Counter,
    pub on_add: i64,
    pub on_remove: i64,
}

impl CounterDelta {
    pub fn for_state(&self, adding: bool) -> Option<(Counter, i64)> {
        let delta = if adding { self.on_add } else { self.on_remove };
        (delta != 0).then_some((self.counter, delta))
    }
}

pub struct MutationStrategy {
    pub kind: MutationKind,
    /// Membership flipped by a toggle
    pub edge: Option<InteractionKind>,
    pub counter: Option<CounterDelta>,
    /// Cached locations the optimistic edit writes to
    pub locate: fn(&Mutation, &CacheStore) -> Vec<QueryKey>,
    /// Lists that receive a created item at their head
    pub insert_into: fn(&Mutation, &CacheStore) -> Vec<QueryKey>,
}

static TOGGLE_LIKE: MutationStrategy = MutationStrategy {
    kind: MutationKind::ToggleLike,
    edge: Some(InteractionKind::Like),
    counter: Some(CounterDelta {
        counter: Counter::Likes,
        on_add: 1,
        on_remove: -1,
    }),
    locate: locate_like,
    insert_into: no_lists,
};

static TOGGLE_SAVE: MutationStrategy = MutationStrategy {
    kind: MutationKind::ToggleSave,
    edge: Some(InteractionKind::Save),
    counter: None,
    locate: locate_save,
    insert_into: no_lists,
};

static TOGGLE_REPORT: MutationStrategy = MutationStrategy {
    kind: MutationKind::ToggleReport,
    edge: Some(InteractionKind::Report),
    // Reports are never withdrawn from the count
    counter: Some(CounterDelta {
        counter: Counter::Reports,
        on_add: 1,
        on_remove: 0,
    }),
    locate: locate_report,
    insert_into: no_lists,
};

static TOGGLE_FOLLOW: MutationStrategy = MutationStrategy {
    kind: MutationKind::ToggleFollow,
    edge: Some(InteractionKind::Follow),
    counter: None,
    locate: locate_follow,
    insert_into: no_lists,
};

static CREATE_COMMENT: MutationStrategy = MutationStrategy {
    kind: MutationKind::CreateComment,
    edge: None,
    counter: Some(CounterDelta {
        counter: Counter::Replies,
        on_add: 1,
        on_remove: 0,
    }),
    locate: locate_create_comment,
    insert_into: comment_lists,
};

static CREATE_POST: MutationStrategy = MutationStrategy {
    kind: MutationKind::CreatePost,
    edge: None,
    counter: None,
    locate: post_lists,
    insert_into: post_lists,
};

static DELETE_COMMENT: MutationStrategy = MutationStrategy {
    kind: MutationKind::DeleteComment,
    edge: None,
    counter: Some(CounterDelta {
        counter: Counter::Replies,
        on_add: 0,
        on_remove: -1,
    }),
    locate: locate_delete_comment,
    insert_into: no_lists,
};

static DELETE_POST: MutationStrategy = MutationStrategy {
    kind: MutationKind::DeletePost,
    edge: None,
    counter: None,
    locate: locate_delete_post,
    insert_into: no_lists,
};

pub fn strategy_for(kind: MutationKind) -> &'static MutationStrategy {
    match kind {
        MutationKind::ToggleLike => &TOGGLE_LIKE,
        MutationKind::ToggleSave => &TOGGLE_SAVE,
        MutationKind::ToggleReport => &TOGGLE_REPORT,
        MutationKind::ToggleFollow => &TOGGLE_FOLLOW,
        MutationKind::CreateComment => &CREATE_COMMENT,
        MutationKind::CreatePost => &CREATE_POST,
        MutationKind::DeleteComment => &DELETE_COMMENT,
        MutationKind::DeletePost => &DELETE_POST,
    }
}

impl MutationStrategy {
    /// Every cached location the mutation writes to, de-duplicated
    pub fn locations(&self, mutation: &Mutation, store: &CacheStore) -> BTreeSet<QueryKey> {
        let mut keys: BTreeSet<QueryKey> = (self.locate)(mutation, store).into_iter().collect();
        keys.extend((self.insert_into)(mutation, store));
        keys
    }

    /// Compute the optimistic edit. `prior` is the known membership before a
    /// toggle; it is ignored for creates and deletes.
    pub fn plan(&self, mutation: &Mutation, store: &CacheStore, prior: Option<bool>) -> OptimisticEdit {
        if let Some(kind) = self.edge {
            let member = !prior.unwrap_or(false);
            let target_id = mutation.target_id().to_string();
            let saved_list = (self.kind == MutationKind::ToggleSave)
                .then(|| QueryKey::saved_list(mutation.user_id()));
            let saved_item = if saved_list.is_some() && member {
                find_cached_item(store, &target_id)
            } else {
                None
            };
            return OptimisticEdit::Toggle {
                kind,
                target_id,
                member,
                counter: self.counter.and_then(|c| c.for_state(member)),
                saved_list,
                saved_item,
            };
        }

        if let Some(item) = mutation.draft() {
            let parent_post = match self.kind {
                MutationKind::CreateComment => mutation.post_id().map(str::to_string),
                _ => None,
            };
            return OptimisticEdit::Insert {
                item,
                lists: (self.insert_into)(mutation, store).into_iter().collect(),
                parent_post,
                counter: self.counter.and_then(|c| c.for_state(true)),
            };
        }

        let parent_post = match self.kind {
            MutationKind::DeleteComment => mutation.post_id().map(str::to_string),
            _ => None,
        };
        OptimisticEdit::Remove {
            id: mutation.target_id().to_string(),
            parent_post,
            counter: self.counter.and_then(|c| c.for_state(false)),
        }
    }
}

/// Local rewrite applied to every snapshotted location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimisticEdit {
    Toggle {
        kind: InteractionKind,
        target_id: String,
        member: bool,
        counter: Option<(Counter, i64)>,
        /// Saved list spliced by a save toggle
        saved_list: Option<QueryKey>,
        saved_item: Option<ContentItem>,
    },
    Insert {
        item: ContentItem,
        lists: BTreeSet<QueryKey>,
        parent_post: Option<String>,
        counter: Option<(Counter, i64)>,
    },
    Remove {
        id: String,
        parent_post: Option<String>,
        counter: Option<(Counter, i64)>,
    },
}

impl OptimisticEdit {
    /// Rewrite `data` stored under `key`. Returns whether anything changed.
    pub fn apply(&self, key: &QueryKey, data: &mut QueryData) -> bool {
        match self {
            OptimisticEdit::Toggle {
                kind,
                target_id,
                member,
                counter,
                saved_list,
                saved_item,
            } => match data {
                QueryData::Membership(set) if key.entity_type() == Some(kind.prefix()) => {
                    set.set(target_id, *member)
                }
                QueryData::Flag(flag) if key.entity_type() == Some(kind.prefix()) => {
                    let changed = *flag != *member;
                    *flag = *member;
                    changed
                }
                QueryData::Item(item) => adjust_if(item, target_id, *counter),
                QueryData::Pages(pages) => {
                    let mut changed = false;
                    if saved_list.as_ref() == Some(key) {
                        if *member {
                            if let Some(saved) = saved_item {
                                if !pages.contains(&saved.id) {
                                    pages.insert_head(saved.clone());
                                    changed = true;
                                }
                            }
                        } else {
                            changed |= pages.remove(target_id);
                        }
                    }
                    for item in pages.items_mut() {
                        changed |= adjust_if(item, target_id, *counter);
                    }
                    changed
                }
                _ => false,
            },
            OptimisticEdit::Insert {
                item,
                lists,
                parent_post,
                counter,
            } => match data {
                QueryData::Pages(pages) => {
                    let mut changed = false;
                    if lists.contains(key) && !pages.contains(&item.id) {
                        pages.insert_head(item.clone());
                        changed = true;
                    }
                    if let Some(parent) = parent_post {
                        for existing in pages.items_mut() {
                            changed |= adjust_if(existing, parent, *counter);
                        }
                    }
                    changed
                }
                QueryData::Item(existing) => match parent_post {
                    Some(parent) => adjust_if(existing, parent, *counter),
                    None => false,
                },
                _ => false,
            },
            OptimisticEdit::Remove {
                id,
                parent_post,
                counter,
            } => match data {
                QueryData::Pages(pages) => {
                    let mut changed = pages.remove(id);
                    if let Some(parent) = parent_post {
                        for existing in pages.items_mut() {
                            changed |= adjust_if(existing, parent, *counter);
                        }
                    }
                    changed
                }
                QueryData::Item(existing) if existing.id == *id => {
                    if existing.is_deleted {
                        false
                    } else {
                        existing.tombstone();
                        true
                    }
                }
                QueryData::Item(existing) => match parent_post {
                    Some(parent) => adjust_if(existing, parent, *counter),
                    None => false,
                },
                _ => false,
            },
        }
    }

    /// Undo this edit inside `data`, leaving other writes to the same entry in
    /// place. `before` is the value captured just before the edit; counters
    /// move back by the delta that was actually applied to it.
    pub fn revert(&self, key: &QueryKey, before: Option<&QueryData>, data: &mut QueryData) -> bool {
        match self {
            OptimisticEdit::Toggle {
                kind,
                target_id,
                counter,
                saved_list,
                ..
            } => match data {
                QueryData::Membership(set) if key.entity_type() == Some(kind.prefix()) => {
                    match before.and_then(QueryData::as_membership) {
                        Some(prior) if prior.covers(target_id) => {
                            set.set(target_id, prior.contains(target_id))
                        }
                        _ => false,
                    }
                }
                QueryData::Flag(flag) if key.entity_type() == Some(kind.prefix()) => {
                    match before.and_then(QueryData::as_flag) {
                        Some(prior) => {
                            let changed = *flag != prior;
                            *flag = prior;
                            changed
                        }
                        None => false,
                    }
                }
                QueryData::Item(item) => undo_adjust(item, target_id, *counter, before),
                QueryData::Pages(pages) => {
                    let mut changed = false;
                    if saved_list.as_ref() == Some(key) {
                        changed |= restore_presence(pages, target_id, before);
                    }
                    for item in pages.items_mut() {
                        changed |= undo_adjust(item, target_id, *counter, before);
                    }
                    changed
                }
                _ => false,
            },
            OptimisticEdit::Insert {
                item,
                lists,
                parent_post,
                counter,
            } => match data {
                QueryData::Pages(pages) => {
                    let mut changed = false;
                    if lists.contains(key) {
                        changed |= restore_presence(pages, &item.id, before);
                    }
                    if let Some(parent) = parent_post {
                        for existing in pages.items_mut() {
                            changed |= undo_adjust(existing, parent, *counter, before);
                        }
                    }
                    changed
                }
                QueryData::Item(existing) => match parent_post {
                    Some(parent) => undo_adjust(existing, parent, *counter, before),
                    None => false,
                },
                _ => false,
            },
            OptimisticEdit::Remove {
                id,
                parent_post,
                counter,
            } => match data {
                QueryData::Pages(pages) => {
                    let mut changed = restore_presence(pages, id, before);
                    if let Some(parent) = parent_post {
                        for existing in pages.items_mut() {
                            changed |= undo_adjust(existing, parent, *counter, before);
                        }
                    }
                    changed
                }
                QueryData::Item(existing) if existing.id == *id => {
                    match before.and_then(|prior| cached_item(prior, id)) {
                        Some(prior) if existing.is_deleted && !prior.is_deleted => {
                            existing.is_deleted = false;
                            existing.updated_at = prior.updated_at;
                            true
                        }
                        _ => false,
                    }
                }
                QueryData::Item(existing) => match parent_post {
                    Some(parent) => undo_adjust(existing, parent, *counter, before),
                    None => false,
                },
                _ => false,
            },
        }
    }

    /// Member state written by a toggle
    pub fn member(&self) -> Option<bool> {
        match self {
            OptimisticEdit::Toggle { member, .. } => Some(*member),
            _ => None,
        }
    }

    /// Temporary client id of a created item
    pub fn temp_id(&self) -> Option<&str> {
        match self {
            OptimisticEdit::Insert { item, .. } => Some(&item.id),
            _ => None,
        }
    }
}

/// Swap a temporary item for the server's copy wherever it was inserted
pub fn replace_temporary(data: &mut QueryData, temp_id: &str, server_item: &ContentItem) -> bool {
    match data {
        QueryData::Pages(pages) => {
            if pages.contains(&server_item.id) {
                // A refetch already brought the server copy in
                pages.remove(temp_id)
            } else {
                pages.replace_item(temp_id, server_item)
            }
        }
        _ => false,
    }
}

fn adjust_if(item: &mut ContentItem, id: &str, counter: Option<(Counter, i64)>) -> bool {
    match counter {
        Some((counter, delta)) if item.id == id => {
            let before = item.counter(counter);
            item.adjust(counter, delta);
            item.counter(counter) != before
        }
        _ => false,
    }
}

/// Move `item`'s counter back by whatever `counter` changed it by in `before`
fn undo_adjust(
    item: &mut ContentItem,
    id: &str,
    counter: Option<(Counter, i64)>,
    before: Option<&QueryData>,
) -> bool {
    let Some((counter, delta)) = counter else {
        return false;
    };
    if item.id != id {
        return false;
    }
    let Some(prior) = before.and_then(|data| cached_item(data, id)) else {
        return false;
    };

    let was = prior.counter(counter) as i64;
    let applied = (was + delta).clamp(0, u32::MAX as i64) - was;
    if applied == 0 {
        return false;
    }
    let current = item.counter(counter);
    item.adjust(counter, -applied);
    item.counter(counter) != current
}

/// Make `id` present or absent in `pages` as it was in `before`
fn restore_presence(pages: &mut InfinitePages, id: &str, before: Option<&QueryData>) -> bool {
    let Some(prior) = before.and_then(QueryData::as_pages) else {
        return false;
    };
    match (prior.position(id), prior.find(id), pages.contains(id)) {
        (Some((page, index)), Some(item), false) => {
            pages.insert_at(page, index, item.clone());
            true
        }
        (None, _, true) => pages.remove(id),
        _ => false,
    }
}

fn cached_item<'a>(data: &'a QueryData, id: &str) -> Option<&'a ContentItem> {
    match data {
        QueryData::Item(item) if item.id == id => Some(item),
        QueryData::Pages(pages) => pages.find(id),
        _ => None,
    }
}

/// Any cached copy of a content item, detail entry first
pub fn find_cached_item(store: &CacheStore, id: &str) -> Option<ContentItem> {
    if let Some(QueryData::Item(item)) = store.get_data(&QueryKey::post_detail(id)) {
        return Some(item);
    }
    pages_containing(store, id)
        .into_iter()
        .find_map(|key| match store.get_data(&key) {
            Some(QueryData::Pages(pages)) => pages.find(id).cloned(),
            _ => None,
        })
}

// ============= Location finders =============

fn pages_containing(store: &CacheStore, id: &str) -> Vec<QueryKey> {
    store.keys_where(|entry| matches!(&entry.data, Some(QueryData::Pages(pages)) if pages.contains(id)))
}

fn with_data(store: &CacheStore, keys: impl IntoIterator<Item = QueryKey>) -> Vec<QueryKey> {
    keys.into_iter()
        .filter(|key| store.has_data(key))
        .collect()
}

fn membership_locations(kind: InteractionKind, mutation: &Mutation, store: &CacheStore) -> Vec<QueryKey> {
    let target = mutation.target_id();
    let user = mutation.user_id();
    let batch = KeyPattern::prefix([kind.prefix(), "batch", user]);

    let mut keys = with_data(store, [QueryKey::membership_check(kind, target, user)]);
    keys.extend(store.keys_where(|entry| {
        batch.matches(&entry.key)
            && matches!(&entry.data, Some(QueryData::Membership(set)) if set.covers(target))
    }));
    keys
}

fn content_locations(kind: InteractionKind, mutation: &Mutation, store: &CacheStore) -> Vec<QueryKey> {
    let target = mutation.target_id();
    let mut keys = membership_locations(kind, mutation, store);
    keys.extend(with_data(store, [QueryKey::post_detail(target)]));
    keys.extend(pages_containing(store, target));
    keys
}

fn locate_like(mutation: &Mutation, store: &CacheStore) -> Vec<QueryKey> {
    content_locations(InteractionKind::Like, mutation, store)
}

fn locate_save(mutation: &Mutation, store: &CacheStore) -> Vec<QueryKey> {
    let mut keys = content_locations(InteractionKind::Save, mutation, store);
    keys.extend(with_data(store, [QueryKey::saved_list(mutation.user_id())]));
    keys
}

fn locate_report(mutation: &Mutation, store: &CacheStore) -> Vec<QueryKey> {
    content_locations(InteractionKind::Report, mutation, store)
}

fn locate_follow(mutation: &Mutation, store: &CacheStore) -> Vec<QueryKey> {
    membership_locations(InteractionKind::Follow, mutation, store)
}

fn locate_create_comment(mutation: &Mutation, store: &CacheStore) -> Vec<QueryKey> {
    let post = mutation.target_id();
    let mut keys = with_data(store, [QueryKey::post_detail(post)]);
    keys.extend(pages_containing(store, post));
    keys
}

fn locate_delete_comment(mutation: &Mutation, store: &CacheStore) -> Vec<QueryKey> {
    let mut keys = pages_containing(store, mutation.target_id());
    if let Some(post) = mutation.post_id() {
        keys.extend(with_data(store, [QueryKey::post_detail(post)]));
        keys.extend(pages_containing(store, post));
    }
    keys
}

fn locate_delete_post(mutation: &Mutation, store: &CacheStore) -> Vec<QueryKey> {
    let post = mutation.target_id();
    let mut keys = with_data(store, [QueryKey::post_detail(post)]);
    keys.extend(pages_containing(store, post));
    keys
}

fn comment_lists(mutation: &Mutation, store: &CacheStore) -> Vec<QueryKey> {
    with_data(store, [QueryKey::comments(mutation.target_id())])
}

/// Every cached feed plus the author's own list
fn post_lists(mutation: &Mutation, store: &CacheStore) -> Vec<QueryKey> {
    let mut keys = store.keys_where(|entry| {
        KeyPattern::prefix(["posts", "feed"]).matches(&entry.key)
            && matches!(entry.data, Some(QueryData::Pages(_)))
    });
    keys.extend(with_data(store, [QueryKey::user_posts(mutation.user_id())]));
    keys
}

fn no_lists(_: &Mutation, _: &CacheStore) -> Vec<QueryKey> {
    Vec::new()
}
