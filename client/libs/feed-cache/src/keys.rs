//! Query key schema
//!
//! Every cached query is indexed by a [`QueryKey`], an ordered tuple of
//! string segments. All call sites must use the builders below so that the
//! invalidation table can address keys by prefix.
//!
//! Key format (display form): `{entity}:{view}:{identifier}[:sub_key]`

use crate::models::InteractionKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Segment separator used by the display form of keys and patterns
pub const SEGMENT_SEPARATOR: char = ':';

/// Marker for a wildcard segment inside a pattern
pub const WILDCARD: &str = "*";

/// Marker terminating a prefix pattern in its display form
pub const PREFIX_MARKER: &str = "**";

/// Structurally comparable cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First segment, e.g. `posts` for `posts:detail:42`
    pub fn entity_type(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    // ============= Post Keys =============

    /// Single post detail
    /// Format: posts:detail:{post_id}
    pub fn post_detail(post_id: &str) -> Self {
        Self::new(["posts", "detail", post_id])
    }

    /// Paginated feed for a scope (e.g. `campus`, `following`)
    /// Format: posts:feed:{scope}
    pub fn feed(scope: &str) -> Self {
        Self::new(["posts", "feed", scope])
    }

    /// Paginated posts authored by a user
    /// Format: posts:user:{user_id}
    pub fn user_posts(user_id: &str) -> Self {
        Self::new(["posts", "user", user_id])
    }

    // ============= Comment Keys =============

    /// Paginated comments under a post
    /// Format: comments:list:{post_id}
    pub fn comments(post_id: &str) -> Self {
        Self::new(["comments", "list", post_id])
    }

    // ============= Interaction Keys =============

    /// Individual membership check
    /// Format: {kind}:check:{content_id}:{user_id}
    pub fn membership_check(kind: InteractionKind, content_id: &str, user_id: &str) -> Self {
        Self::new([kind.prefix(), "check", content_id, user_id])
    }

    /// Batch membership set for one id-batch signature
    /// Format: {kind}:batch:{user_id}:{signature}
    pub fn membership_batch(kind: InteractionKind, user_id: &str, signature: &str) -> Self {
        Self::new([kind.prefix(), "batch", user_id, signature])
    }

    /// Posts saved by a user
    /// Format: saves:list:{user_id}
    pub fn saved_list(user_id: &str) -> Self {
        Self::new(["saves", "list", user_id])
    }

    // ============= Misc Keys =============

    /// Active sponsored pool
    /// Format: ads:active
    pub fn sponsored() -> Self {
        Self::new(["ads", "active"])
    }

    /// Public profile of a user
    /// Format: users:profile:{user_id}
    pub fn user_profile(user_id: &str) -> Self {
        Self::new(["users", "profile", user_id])
    }

    /// Parse the display form back into a key
    pub fn parse(key: &str) -> Option<Self> {
        if key.is_empty() {
            return None;
        }
        let segments: Vec<&str> = key.split(SEGMENT_SEPARATOR).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        Some(Self::new(segments))
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(":"))
    }
}

/// One segment of a [`KeyPattern`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PatternSegment {
    Exact(String),
    /// Matches any single segment
    Any,
}

impl PatternSegment {
    fn matches(&self, segment: &str) -> bool {
        match self {
            PatternSegment::Exact(expected) => expected == segment,
            PatternSegment::Any => true,
        }
    }
}

impl From<&str> for PatternSegment {
    fn from(s: &str) -> Self {
        if s == WILDCARD {
            PatternSegment::Any
        } else {
            PatternSegment::Exact(s.to_string())
        }
    }
}

/// Pattern addressing one key exactly or a family of keys by prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyPattern {
    segments: Vec<PatternSegment>,
    exact: bool,
}

impl KeyPattern {
    /// Matches only `key`
    pub fn exact(key: &QueryKey) -> Self {
        Self {
            segments: key
                .segments()
                .iter()
                .map(|s| PatternSegment::Exact(s.clone()))
                .collect(),
            exact: true,
        }
    }

    /// Matches every key starting with `segments`; `*` matches any segment
    pub fn prefix<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            segments: segments
                .into_iter()
                .map(|s| PatternSegment::from(s.as_ref()))
                .collect(),
            exact: false,
        }
    }

    /// Parse a display-form pattern. A trailing `**` segment makes it a
    /// prefix pattern, otherwise it is exact.
    ///
    /// ```
    /// use feed_cache::{KeyPattern, QueryKey};
    ///
    /// let pattern = KeyPattern::parse("likes:batch:u1:**");
    /// assert!(pattern.matches(&QueryKey::new(["likes", "batch", "u1", "a,b"])));
    /// assert!(!pattern.matches(&QueryKey::new(["likes", "batch", "u2", "a,b"])));
    /// ```
    pub fn parse(pattern: &str) -> Self {
        let mut parts: Vec<&str> = pattern.split(SEGMENT_SEPARATOR).collect();
        let exact = parts.last() != Some(&PREFIX_MARKER);
        if !exact {
            parts.pop();
        }
        Self {
            segments: parts.into_iter().map(PatternSegment::from).collect(),
            exact,
        }
    }

    pub fn is_exact(&self) -> bool {
        self.exact
    }

    pub fn segments(&self) -> &[PatternSegment] {
        &self.segments
    }

    pub fn matches(&self, key: &QueryKey) -> bool {
        let key_segments = key.segments();
        if self.exact && key_segments.len() != self.segments.len() {
            return false;
        }
        if key_segments.len() < self.segments.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(key_segments)
            .all(|(pattern, segment)| pattern.matches(segment))
    }
}

impl From<&QueryKey> for KeyPattern {
    fn from(key: &QueryKey) -> Self {
        KeyPattern::exact(key)
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<&str> = self
            .segments
            .iter()
            .map(|s| match s {
                PatternSegment::Exact(value) => value.as_str(),
                PatternSegment::Any => WILDCARD,
            })
            .collect();
        if !self.exact {
            parts.push(PREFIX_MARKER);
        }
        write!(f, "{}", parts.join(":"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_detail_key() {
        let key = QueryKey::post_detail("p1");
        assert_eq!(key.to_string(), "posts:detail:p1");
        assert_eq!(key.entity_type(), Some("posts"));
    }

    #[test]
    fn test_membership_keys() {
        let check = QueryKey::membership_check(InteractionKind::Like, "p1", "u1");
        assert_eq!(check.to_string(), "likes:check:p1:u1");

        let batch = QueryKey::membership_batch(InteractionKind::Save, "u1", "a,b");
        assert_eq!(batch.to_string(), "saves:batch:u1:a,b");
    }

    #[test]
    fn test_parse_key() {
        assert_eq!(
            QueryKey::parse("posts:detail:p1"),
            Some(QueryKey::post_detail("p1"))
        );
        assert_eq!(QueryKey::parse(""), None);
        assert_eq!(QueryKey::parse("posts::p1"), None);
    }

    #[test]
    fn test_exact_pattern_requires_same_length() {
        let pattern = KeyPattern::exact(&QueryKey::post_detail("p1"));
        assert!(pattern.matches(&QueryKey::post_detail("p1")));
        assert!(!pattern.matches(&QueryKey::post_detail("p2")));
        assert!(!pattern.matches(&QueryKey::new(["posts", "detail", "p1", "extra"])));
    }

    #[test]
    fn test_prefix_pattern() {
        let pattern = KeyPattern::prefix(["posts", "feed"]);
        assert!(pattern.matches(&QueryKey::feed("campus")));
        assert!(pattern.matches(&QueryKey::feed("following")));
        assert!(!pattern.matches(&QueryKey::post_detail("p1")));
        assert!(!pattern.matches(&QueryKey::new(["posts"])));
    }

    #[test]
    fn test_wildcard_segment() {
        let pattern = KeyPattern::prefix(["likes", "check", "*", "u1"]);
        assert!(pattern.matches(&QueryKey::membership_check(InteractionKind::Like, "p1", "u1")));
        assert!(pattern.matches(&QueryKey::membership_check(InteractionKind::Like, "p9", "u1")));
        assert!(!pattern.matches(&QueryKey::membership_check(InteractionKind::Like, "p1", "u2")));
    }

    #[test]
    fn test_pattern_display_and_parse() {
        let prefix = KeyPattern::prefix(["likes", "batch", "u1"]);
        assert_eq!(prefix.to_string(), "likes:batch:u1:**");
        assert_eq!(KeyPattern::parse("likes:batch:u1:**"), prefix);

        let exact = KeyPattern::exact(&QueryKey::post_detail("p1"));
        assert_eq!(exact.to_string(), "posts:detail:p1");
        assert_eq!(KeyPattern::parse("posts:detail:p1"), exact);
        assert!(exact.is_exact());
    }
}
