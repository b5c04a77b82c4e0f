//! User actions that write through the cache
//!
//! Every action is one variant of [`Mutation`]; the coordinator looks up the
//! per-kind behaviour in [`crate::strategy`].

use crate::error::{FeedCacheError, Result};
use crate::models::{Collection, ContentItem};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    ToggleLike,
    ToggleSave,
    ToggleReport,
    ToggleFollow,
    CreateComment,
    CreatePost,
    DeleteComment,
    DeletePost,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::ToggleLike => "toggle_like",
            MutationKind::ToggleSave => "toggle_save",
            MutationKind::ToggleReport => "toggle_report",
            MutationKind::ToggleFollow => "toggle_follow",
            MutationKind::CreateComment => "create_comment",
            MutationKind::CreatePost => "create_post",
            MutationKind::DeleteComment => "delete_comment",
            MutationKind::DeletePost => "delete_post",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    ToggleLike {
        post_id: String,
        user_id: String,
    },
    ToggleSave {
        post_id: String,
        user_id: String,
    },
    ToggleReport {
        post_id: String,
        user_id: String,
    },
    ToggleFollow {
        target_user_id: String,
        user_id: String,
    },
    CreateComment {
        post_id: String,
        /// Comment being replied to; `None` for a top-level comment
        parent_id: Option<String>,
        author_id: String,
        body: String,
    },
    CreatePost {
        author_id: String,
        body: String,
    },
    DeleteComment {
        comment_id: String,
        post_id: String,
        user_id: String,
    },
    DeletePost {
        post_id: String,
        user_id: String,
    },
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::ToggleLike { .. } => MutationKind::ToggleLike,
            Mutation::ToggleSave { .. } => MutationKind::ToggleSave,
            Mutation::ToggleReport { .. } => MutationKind::ToggleReport,
            Mutation::ToggleFollow { .. } => MutationKind::ToggleFollow,
            Mutation::CreateComment { .. } => MutationKind::CreateComment,
            Mutation::CreatePost { .. } => MutationKind::CreatePost,
            Mutation::DeleteComment { .. } => MutationKind::DeleteComment,
            Mutation::DeletePost { .. } => MutationKind::DeletePost,
        }
    }

    /// Id the mutation acts on: the content item, the followed user, or for
    /// creates the post being commented on / the author
    pub fn target_id(&self) -> &str {
        match self {
            Mutation::ToggleLike { post_id, .. }
            | Mutation::ToggleSave { post_id, .. }
            | Mutation::ToggleReport { post_id, .. }
            | Mutation::CreateComment { post_id, .. }
            | Mutation::DeletePost { post_id, .. } => post_id,
            Mutation::ToggleFollow { target_user_id, .. } => target_user_id,
            Mutation::CreatePost { author_id, .. } => author_id,
            Mutation::DeleteComment { comment_id, .. } => comment_id,
        }
    }

    /// Acting user
    pub fn user_id(&self) -> &str {
        match self {
            Mutation::ToggleLike { user_id, .. }
            | Mutation::ToggleSave { user_id, .. }
            | Mutation::ToggleReport { user_id, .. }
            | Mutation::ToggleFollow { user_id, .. }
            | Mutation::DeleteComment { user_id, .. }
            | Mutation::DeletePost { user_id, .. } => user_id,
            Mutation::CreateComment { author_id, .. } | Mutation::CreatePost { author_id, .. } => {
                author_id
            }
        }
    }

    /// Post the mutation concerns, if any
    pub fn post_id(&self) -> Option<&str> {
        match self {
            Mutation::ToggleLike { post_id, .. }
            | Mutation::ToggleSave { post_id, .. }
            | Mutation::ToggleReport { post_id, .. }
            | Mutation::CreateComment { post_id, .. }
            | Mutation::DeleteComment { post_id, .. }
            | Mutation::DeletePost { post_id, .. } => Some(post_id.as_str()),
            Mutation::ToggleFollow { .. } | Mutation::CreatePost { .. } => None,
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        match self {
            Mutation::CreateComment { parent_id, .. } => parent_id.as_deref(),
            _ => None,
        }
    }

    pub fn is_toggle(&self) -> bool {
        matches!(
            self.kind(),
            MutationKind::ToggleLike
                | MutationKind::ToggleSave
                | MutationKind::ToggleReport
                | MutationKind::ToggleFollow
        )
    }

    pub fn is_create(&self) -> bool {
        matches!(self.kind(), MutationKind::CreateComment | MutationKind::CreatePost)
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind(), MutationKind::DeleteComment | MutationKind::DeletePost)
    }

    /// Placeholder item shown until the server answers a create
    pub fn draft(&self) -> Option<ContentItem> {
        match self {
            Mutation::CreateComment {
                post_id,
                parent_id,
                author_id,
                body,
            } => Some(ContentItem::draft(
                Collection::Comments,
                author_id,
                body,
                Some(parent_id.clone().unwrap_or_else(|| post_id.clone())),
            )),
            Mutation::CreatePost { author_id, body } => {
                Some(ContentItem::draft(Collection::Posts, author_id, body, None))
            }
            _ => None,
        }
    }

    /// Reject malformed input before anything touches the cache or network
    pub fn validate(&self, max_body_len: usize) -> Result<()> {
        let ids: Vec<(&str, &str)> = match self {
            Mutation::ToggleLike { post_id, user_id }
            | Mutation::ToggleSave { post_id, user_id }
            | Mutation::ToggleReport { post_id, user_id }
            | Mutation::DeletePost { post_id, user_id } => {
                vec![("post_id", post_id.as_str()), ("user_id", user_id.as_str())]
            }
            Mutation::ToggleFollow {
                target_user_id,
                user_id,
            } => {
                if target_user_id == user_id {
                    return Err(FeedCacheError::Validation(
                        "Users cannot follow themselves".into(),
                    ));
                }
                vec![("target_user_id", target_user_id.as_str()), ("user_id", user_id.as_str())]
            }
            Mutation::CreateComment {
                post_id, author_id, ..
            } => vec![("post_id", post_id.as_str()), ("author_id", author_id.as_str())],
            Mutation::CreatePost { author_id, .. } => vec![("author_id", author_id.as_str())],
            Mutation::DeleteComment {
                comment_id,
                post_id,
                user_id,
            } => vec![
                ("comment_id", comment_id.as_str()),
                ("post_id", post_id.as_str()),
                ("user_id", user_id.as_str()),
            ],
        };

        for (field, value) in ids {
            if value.trim().is_empty() {
                return Err(FeedCacheError::Validation(format!("{} is required", field)));
            }
        }

        if let Mutation::CreateComment { body, .. } | Mutation::CreatePost { body, .. } = self {
            if body.trim().is_empty() {
                return Err(FeedCacheError::Validation("Body cannot be empty".into()));
            }
            let len = body.chars().count();
            if len > max_body_len {
                return Err(FeedCacheError::Validation(format!(
                    "Body is {} characters, limit is {}",
                    len, max_body_len
                )));
            }
        }

        Ok(())
    }
}

/// Result of a settled mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// Server state of the relation after the toggle
    Toggled { active: bool },
    Created(ContentItem),
    Deleted,
    /// An identical mutation was still pending
    Ignored,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn like() -> Mutation {
        Mutation::ToggleLike {
            post_id: "p1".into(),
            user_id: "u1".into(),
        }
    }

    #[test]
    fn test_accessors() {
        let m = like();
        assert_eq!(m.kind(), MutationKind::ToggleLike);
        assert_eq!(m.target_id(), "p1");
        assert_eq!(m.user_id(), "u1");
        assert!(m.is_toggle());

        let delete = Mutation::DeleteComment {
            comment_id: "c1".into(),
            post_id: "p1".into(),
            user_id: "u1".into(),
        };
        assert_eq!(delete.target_id(), "c1");
        assert_eq!(delete.post_id(), Some("p1"));
        assert!(delete.is_delete());
    }

    #[test]
    fn test_validation() {
        assert!(like().validate(10).is_ok());

        let missing = Mutation::ToggleSave {
            post_id: " ".into(),
            user_id: "u1".into(),
        };
        assert!(matches!(missing.validate(10), Err(FeedCacheError::Validation(_))));

        let long = Mutation::CreatePost {
            author_id: "u1".into(),
            body: "x".repeat(11),
        };
        assert!(matches!(long.validate(10), Err(FeedCacheError::Validation(_))));

        let empty = Mutation::CreateComment {
            post_id: "p1".into(),
            parent_id: None,
            author_id: "u1".into(),
            body: "   ".into(),
        };
        assert!(empty.validate(10).is_err());

        let self_follow = Mutation::ToggleFollow {
            target_user_id: "u1".into(),
            user_id: "u1".into(),
        };
        assert!(self_follow.validate(10).is_err());
    }

    #[test]
    fn test_comment_draft_defaults_parent_to_post() {
        let create = Mutation::CreateComment {
            post_id: "p1".into(),
            parent_id: None,
            author_id: "u1".into(),
            body: "hello".into(),
        };
        let draft = create.draft().unwrap();
        assert!(draft.is_temporary());
        assert_eq!(draft.parent_id.as_deref(), Some("p1"));
        assert_eq!(draft.collection, Collection::Comments);
        assert!(like().draft().is_none());
    }

    #[test]
    fn test_serde_tagged() {
        let json = serde_json::to_value(like()).unwrap();
        assert_eq!(json["kind"], "toggle_like");
        let back: Mutation = serde_json::from_value(json).unwrap();
        assert_eq!(back, like());
    }
}
