//! Campus feed client cache
//!
//! Client-side data layer for the university social feed:
//! - Reactive query cache with staleness, request deduplication and
//!   cursor pagination
//! - Batched membership checks (liked / saved / reported / followed)
//! - Optimistic mutations with snapshot rollback and pattern invalidation
//! - Sponsored-item interleaving for feed pages
//!
//! Everything network-facing goes through the [`DocumentStore`] and
//! [`MutationRpc`] traits; [`memory::InMemoryBackend`] implements both for
//! tests and the demo binary.

pub mod backend;
pub mod changes;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod feed;
pub mod invalidation;
pub mod keys;
pub mod membership;
pub mod memory;
pub mod models;
pub mod mutation;
pub mod retry;
pub mod stats;
pub mod store;
pub mod strategy;
pub mod telemetry;

pub use backend::{DocumentStore, MutationRpc, QueryFilters};
pub use changes::{ChangeAction, ChangeListener, DocumentChange};
pub use client::FeedClient;
pub use config::{CacheConfig, ConfigError};
pub use coordinator::MutationCoordinator;
pub use error::{FeedCacheError, Result};
pub use executor::{QueryExecutor, QueryFn, QueryObserver, QueryOptions};
pub use feed::{compose_page, Composition, FeedComposer};
pub use invalidation::InvalidationPropagator;
pub use keys::{KeyPattern, QueryKey};
pub use membership::MembershipBatchChecker;
pub use models::{
    Collection, ContentItem, Cursor, FeedEntry, FeedItem, InfinitePages, InteractionKind,
    MembershipSet, MembershipState, PaginatedResult, QueryData, SponsoredItem,
};
pub use mutation::{Mutation, MutationKind, MutationOutcome};
pub use retry::RetryConfig;
pub use stats::{CacheStats, StatsCollector};
pub use store::{CacheEntry, CacheEvent, CacheEventKind, CacheStore, FetchStatus};
