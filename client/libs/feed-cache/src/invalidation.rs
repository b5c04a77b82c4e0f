//! Invalidation propagator
//!
//! A static table maps each mutation kind to key-pattern templates. After a
//! mutation settles the templates are filled in from its variables and every
//! matching entry is marked stale. Entries keep their data; observed ones are
//! refetched by the executor.
//!
//! Membership sets are deliberately absent from the table: the coordinator
//! already reconciled them in place from the server's answer.

use crate::changes::{ChangeAction, DocumentChange};
use crate::keys::{KeyPattern, QueryKey};
use crate::models::Collection;
use crate::mutation::{Mutation, MutationKind};
use crate::stats::StatsCollector;
use crate::store::CacheStore;
use std::collections::BTreeSet;
use tracing::debug;

/// One segment of a pattern template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Literal(&'static str),
    /// The mutation's target id
    Target,
    /// The acting user
    User,
    /// The post the mutation concerns
    Post,
    /// The parent comment of a reply
    Parent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternTemplate {
    pub segments: &'static [Segment],
    pub prefix: bool,
}

impl PatternTemplate {
    const fn exact(segments: &'static [Segment]) -> Self {
        Self {
            segments,
            prefix: false,
        }
    }

    const fn prefix(segments: &'static [Segment]) -> Self {
        Self {
            segments,
            prefix: true,
        }
    }

    /// `None` when a placeholder has no value for this mutation
    pub fn resolve(&self, mutation: &Mutation) -> Option<KeyPattern> {
        let mut resolved = Vec::with_capacity(self.segments.len());
        for segment in self.segments {
            let value = match segment {
                Segment::Literal(s) => *s,
                Segment::Target => mutation.target_id(),
                Segment::User => mutation.user_id(),
                Segment::Post => mutation.post_id()?,
                Segment::Parent => mutation.parent_id()?,
            };
            resolved.push(value.to_string());
        }

        Some(if self.prefix {
            KeyPattern::prefix(resolved)
        } else {
            KeyPattern::exact(&QueryKey::new(resolved))
        })
    }
}

use Segment::{Literal as L, Parent, Post, Target, User};

const POST_DETAIL_TARGET: PatternTemplate =
    PatternTemplate::exact(&[L("posts"), L("detail"), Target]);
const POST_DETAIL_POST: PatternTemplate = PatternTemplate::exact(&[L("posts"), L("detail"), Post]);
const COMMENTS_OF_POST: PatternTemplate = PatternTemplate::exact(&[L("comments"), L("list"), Post]);
const ALL_FEEDS: PatternTemplate = PatternTemplate::prefix(&[L("posts"), L("feed")]);
const AUTHOR_POSTS: PatternTemplate = PatternTemplate::exact(&[L("posts"), L("user"), User]);

/// Mutation kind → patterns marked stale once it settles.
///
/// Membership entries (`likes:check:{post}:{user}`, `likes:batch:{user}:*` and
/// their save/report/follow counterparts) are never listed: the optimistic
/// edit writes the new state into them and a settle that disagrees restores
/// them, so they already match the server when this table is applied.
pub static INVALIDATION_TABLE: &[(MutationKind, &[PatternTemplate])] = &[
    (MutationKind::ToggleLike, &[POST_DETAIL_TARGET]),
    (
        MutationKind::ToggleSave,
        &[PatternTemplate::exact(&[L("saves"), L("list"), User])],
    ),
    (MutationKind::ToggleReport, &[POST_DETAIL_TARGET]),
    (
        MutationKind::ToggleFollow,
        &[
            PatternTemplate::exact(&[L("users"), L("profile"), Target]),
            PatternTemplate::exact(&[L("posts"), L("feed"), L("following")]),
        ],
    ),
    (
        MutationKind::CreateComment,
        &[
            COMMENTS_OF_POST,
            POST_DETAIL_POST,
            PatternTemplate::exact(&[L("comments"), L("list"), Parent]),
        ],
    ),
    (MutationKind::CreatePost, &[ALL_FEEDS, AUTHOR_POSTS]),
    (MutationKind::DeleteComment, &[COMMENTS_OF_POST, POST_DETAIL_POST]),
    (
        MutationKind::DeletePost,
        &[
            POST_DETAIL_TARGET,
            ALL_FEEDS,
            AUTHOR_POSTS,
            PatternTemplate::prefix(&[L("saves"), L("list")]),
            PatternTemplate::exact(&[L("comments"), L("list"), Target]),
        ],
    ),
];

pub fn templates_for(kind: MutationKind) -> &'static [PatternTemplate] {
    INVALIDATION_TABLE
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, templates)| *templates)
        .unwrap_or(&[])
}

#[derive(Clone)]
pub struct InvalidationPropagator {
    store: CacheStore,
    stats: StatsCollector,
}

impl InvalidationPropagator {
    pub fn new(store: CacheStore, stats: StatsCollector) -> Self {
        Self { store, stats }
    }

    /// Patterns made stale by a settled mutation
    pub fn on_mutation_settled(mutation: &Mutation) -> BTreeSet<KeyPattern> {
        templates_for(mutation.kind())
            .iter()
            .filter_map(|template| template.resolve(mutation))
            .collect()
    }

    /// Patterns made stale by a pushed document change
    pub fn patterns_for_change(change: &DocumentChange) -> BTreeSet<KeyPattern> {
        let mut patterns = BTreeSet::new();
        let id = change.document_id.as_str();

        match change.collection {
            Collection::Posts => {
                patterns.insert(KeyPattern::exact(&QueryKey::post_detail(id)));
                patterns.insert(KeyPattern::prefix(["posts", "feed"]));
                patterns.insert(KeyPattern::prefix(["posts", "user"]));
                if change.action == ChangeAction::Deleted {
                    patterns.insert(KeyPattern::prefix(["saves", "list"]));
                    patterns.insert(KeyPattern::exact(&QueryKey::comments(id)));
                }
            }
            Collection::Comments => match &change.parent_id {
                Some(parent) => {
                    patterns.insert(KeyPattern::exact(&QueryKey::comments(parent)));
                    patterns.insert(KeyPattern::exact(&QueryKey::post_detail(parent)));
                }
                None => {
                    patterns.insert(KeyPattern::prefix(["comments", "list"]));
                }
            },
        }
        patterns
    }

    /// Mark everything a settled mutation affects as stale
    pub fn propagate(&self, mutation: &Mutation) -> Vec<QueryKey> {
        let patterns = Self::on_mutation_settled(mutation);
        debug!(
            kind = %mutation.kind(),
            patterns = patterns.len(),
            "Propagating mutation invalidation"
        );
        self.apply(&patterns)
    }

    pub fn propagate_change(&self, change: &DocumentChange) -> Vec<QueryKey> {
        self.apply(&Self::patterns_for_change(change))
    }

    /// Invalidate every pattern; returns the matched keys, sorted and unique
    pub fn apply(&self, patterns: &BTreeSet<KeyPattern>) -> Vec<QueryKey> {
        let keys: BTreeSet<QueryKey> = patterns
            .iter()
            .flat_map(|pattern| self.store.invalidate(pattern))
            .collect();
        self.stats.record_invalidations(keys.len());
        keys.into_iter().collect()
    }
}
