//! Error types for cache, query and mutation operations

use thiserror::Error;

/// Errors surfaced by the feed cache.
///
/// The enum is `Clone` because a single in-flight fetch result is fanned out
/// to every caller attached to it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedCacheError {
    /// Transient transport or store failure
    #[error("Network error: {0}")]
    Network(String),

    /// Target document no longer exists
    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote rejected the write (duplicate report, username taken, ...)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Caller-side input rejected before any network call
    #[error("Validation error: {0}")]
    Validation(String),

    /// Request aborted or superseded by a newer one
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FeedCacheError {
    /// Only transport failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedCacheError::Network(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FeedCacheError::NotFound(_))
    }

    /// Short label used in log fields and stats.
    pub fn kind(&self) -> &'static str {
        match self {
            FeedCacheError::Network(_) => "network",
            FeedCacheError::NotFound(_) => "not_found",
            FeedCacheError::Conflict(_) => "conflict",
            FeedCacheError::Validation(_) => "validation",
            FeedCacheError::Cancelled(_) => "cancelled",
            FeedCacheError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for FeedCacheError {
    fn from(err: serde_json::Error) -> Self {
        FeedCacheError::Internal(format!("Serialization error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, FeedCacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FeedCacheError::Conflict("already reported".to_string());
        assert_eq!(err.to_string(), "Conflict: already reported");

        let err = FeedCacheError::Validation("comment body is empty".to_string());
        assert_eq!(err.to_string(), "Validation error: comment body is empty");
    }

    #[test]
    fn test_only_network_is_retryable() {
        assert!(FeedCacheError::Network("offline".into()).is_retryable());
        assert!(!FeedCacheError::NotFound("post".into()).is_retryable());
        assert!(!FeedCacheError::Conflict("dup".into()).is_retryable());
        assert!(!FeedCacheError::Validation("bad".into()).is_retryable());
        assert!(!FeedCacheError::Cancelled("superseded".into()).is_retryable());
    }

    #[test]
    fn test_error_from_serde() {
        let json_err = serde_json::from_str::<String>("invalid json").unwrap_err();
        let err: FeedCacheError = json_err.into();
        assert!(matches!(err, FeedCacheError::Internal(_)));
        assert_eq!(err.kind(), "internal");
    }
}
