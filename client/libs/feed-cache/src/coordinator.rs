//! Mutation coordinator
//!
//! One generic write path for every [`Mutation`]:
//!
//! 1. validate, and drop the call if an identical mutation is still pending
//! 2. cancel fetches for the affected keys, snapshot them and write the
//!    optimistic edit into each one
//! 3. call the remote endpoint
//! 4. on success reconcile (swap temporary ids, roll back a toggle the server
//!    disagrees with) and invalidate dependent patterns; on failure restore
//!    every snapshot and surface the error
//!
//! Per-kind behaviour lives in [`crate::strategy`].

use crate::backend::MutationRpc;
use crate::config::CacheConfig;
use crate::error::{FeedCacheError, Result};
use crate::executor::QueryExecutor;
use crate::invalidation::InvalidationPropagator;
use crate::keys::QueryKey;
use crate::membership::MembershipBatchChecker;
use crate::models::{ContentItem, InteractionKind, QueryData};
use crate::mutation::{Mutation, MutationKind, MutationOutcome};
use crate::stats::StatsCollector;
use crate::strategy::{replace_temporary, strategy_for, MutationStrategy, OptimisticEdit};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

type PendingKey = (MutationKind, String, String);

type PendingSet = Arc<Mutex<HashSet<PendingKey>>>;

fn pending_key(mutation: &Mutation) -> PendingKey {
    (
        mutation.kind(),
        mutation.target_id().to_string(),
        mutation.user_id().to_string(),
    )
}

/// Holds a (kind, target, user) slot until dropped
struct PendingGuard {
    pending: PendingSet,
    key: PendingKey,
}

impl PendingGuard {
    fn acquire(pending: &PendingSet, key: PendingKey) -> Option<Self> {
        if !pending.lock().insert(key.clone()) {
            return None;
        }
        Some(Self {
            pending: pending.clone(),
            key,
        })
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.key);
    }
}

/// Value of one location before the optimistic write
#[derive(Debug, Clone)]
struct Snapshot {
    key: QueryKey,
    before: Option<QueryData>,
    /// Server generation the edit was applied on top of
    generation: Option<u64>,
    /// Version produced by the optimistic write; `None` if the edit was a no-op
    written_version: Option<u64>,
}

enum RemoteResult {
    Toggled(bool),
    Created(ContentItem),
    Deleted,
}

#[derive(Clone)]
pub struct MutationCoordinator {
    executor: QueryExecutor,
    membership: MembershipBatchChecker,
    rpc: Arc<dyn MutationRpc>,
    propagator: InvalidationPropagator,
    pending: PendingSet,
    max_body_len: usize,
    refetch_on_settle: bool,
}

impl MutationCoordinator {
    pub fn new(
        executor: QueryExecutor,
        membership: MembershipBatchChecker,
        rpc: Arc<dyn MutationRpc>,
        propagator: InvalidationPropagator,
        config: &CacheConfig,
    ) -> Self {
        Self {
            executor,
            membership,
            rpc,
            propagator,
            pending: Arc::new(Mutex::new(HashSet::new())),
            max_body_len: config.max_body_len,
            refetch_on_settle: config.refetch_on_settle,
        }
    }

    fn stats(&self) -> &StatsCollector {
        self.executor.stats()
    }

    /// Whether an identical mutation is currently in flight
    pub fn is_pending(&self, mutation: &Mutation) -> bool {
        self.pending.lock().contains(&pending_key(mutation))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Run one mutation through the optimistic lifecycle
    pub async fn mutate(&self, mutation: Mutation) -> Result<MutationOutcome> {
        mutation.validate(self.max_body_len)?;

        let Some(_guard) = PendingGuard::acquire(&self.pending, pending_key(&mutation)) else {
            debug!(
                kind = %mutation.kind(),
                target_id = %mutation.target_id(),
                "Identical mutation pending, ignoring"
            );
            self.stats().record_ignored_mutation();
            return Ok(MutationOutcome::Ignored);
        };

        let strategy = strategy_for(mutation.kind());
        let prior = match strategy.edge {
            Some(edge) => Some(self.prior_membership(edge, &mutation).await),
            None => None,
        };

        let (edit, snapshots) = self.begin(strategy, &mutation, prior);
        let result = self.call_remote(&mutation).await;
        self.settle(&mutation, &edit, &snapshots, result)
    }

    /// Membership before a toggle, from cache or an individual check
    async fn prior_membership(&self, edge: InteractionKind, mutation: &Mutation) -> bool {
        let user_id = mutation.user_id();
        let target_id = mutation.target_id();

        if let Some(known) = self.membership.known_membership(edge, user_id, target_id) {
            return known;
        }

        match self.membership.check_individual(edge, user_id, target_id).await {
            Ok(member) => member,
            Err(e) => {
                // The server's answer reconciles a wrong guess on settle
                warn!(
                    kind = %edge,
                    target_id = %target_id,
                    error = %e,
                    "Prior membership unavailable, assuming none"
                );
                false
            }
        }
    }

    /// Cancel, snapshot and write the optimistic edit into every location
    fn begin(
        &self,
        strategy: &MutationStrategy,
        mutation: &Mutation,
        prior: Option<bool>,
    ) -> (OptimisticEdit, Vec<Snapshot>) {
        let store = self.executor.store();
        let locations = strategy.locations(mutation, store);

        for key in &locations {
            self.executor.cancel(key);
        }

        let edit = strategy.plan(mutation, store, prior);
        let snapshots: Vec<Snapshot> = locations
            .into_iter()
            .map(|key| {
                let before = store.get_data(&key);
                let generation = store.generation(&key);
                let written_version = store.update(&key, |data| edit.apply(&key, data));
                Snapshot {
                    key,
                    before,
                    generation,
                    written_version,
                }
            })
            .collect();

        let written = snapshots
            .iter()
            .filter(|s| s.written_version.is_some())
            .count();
        self.stats().record_optimistic_writes(written);

        debug!(
            kind = %mutation.kind(),
            target_id = %mutation.target_id(),
            locations = snapshots.len(),
            written,
            "Applied optimistic edit"
        );

        (edit, snapshots)
    }

    async fn call_remote(&self, mutation: &Mutation) -> Result<RemoteResult> {
        match mutation {
            Mutation::ToggleLike { post_id, user_id } => self
                .rpc
                .toggle_like(post_id, user_id)
                .await
                .map(RemoteResult::Toggled),
            Mutation::ToggleSave { post_id, user_id } => self
                .rpc
                .toggle_save(post_id, user_id)
                .await
                .map(RemoteResult::Toggled),
            Mutation::ToggleReport { post_id, user_id } => self
                .rpc
                .toggle_report(post_id, user_id)
                .await
                .map(RemoteResult::Toggled),
            Mutation::ToggleFollow {
                target_user_id,
                user_id,
            } => self
                .rpc
                .toggle_follow(target_user_id, user_id)
                .await
                .map(RemoteResult::Toggled),
            Mutation::CreateComment {
                post_id,
                parent_id,
                author_id,
                body,
            } => self
                .rpc
                .create_comment(post_id, parent_id.clone(), author_id, body)
                .await
                .map(RemoteResult::Created),
            Mutation::CreatePost { author_id, body } => self
                .rpc
                .create_post(author_id, body)
                .await
                .map(RemoteResult::Created),
            Mutation::DeleteComment {
                comment_id,
                user_id,
                ..
            } => self
                .rpc
                .delete_comment(comment_id, user_id)
                .await
                .map(|_| RemoteResult::Deleted),
            Mutation::DeletePost { post_id, user_id } => self
                .rpc
                .delete_post(post_id, user_id)
                .await
                .map(|_| RemoteResult::Deleted),
        }
    }

    fn settle(
        &self,
        mutation: &Mutation,
        edit: &OptimisticEdit,
        snapshots: &[Snapshot],
        result: Result<RemoteResult>,
    ) -> Result<MutationOutcome> {
        let outcome = match result {
            Ok(RemoteResult::Toggled(active)) => {
                if edit.member() != Some(active) {
                    // Server kept the prior state; the snapshot already holds it
                    warn!(
                        kind = %mutation.kind(),
                        target_id = %mutation.target_id(),
                        server_state = active,
                        "Server disagrees with optimistic toggle, rolling back"
                    );
                    self.rollback(edit, snapshots);
                    self.propagator.propagate(mutation);
                    return Ok(MutationOutcome::Toggled { active });
                }
                MutationOutcome::Toggled { active }
            }
            Ok(RemoteResult::Created(item)) => {
                if let Some(temp_id) = edit.temp_id() {
                    self.swap_temporary(snapshots, temp_id, &item);
                }
                MutationOutcome::Created(item)
            }
            Ok(RemoteResult::Deleted) => MutationOutcome::Deleted,
            Err(FeedCacheError::NotFound(message)) if mutation.is_delete() => {
                debug!(
                    kind = %mutation.kind(),
                    target_id = %mutation.target_id(),
                    message = %message,
                    "Delete target already gone"
                );
                MutationOutcome::Deleted
            }
            Err(e) => {
                warn!(
                    kind = %mutation.kind(),
                    target_id = %mutation.target_id(),
                    error = %e,
                    "Mutation failed, rolling back"
                );
                self.rollback(edit, snapshots);
                return Err(e);
            }
        };

        self.mark_refreshed(snapshots);
        self.stats().record_commit();
        info!(
            kind = %mutation.kind(),
            target_id = %mutation.target_id(),
            user_id = %mutation.user_id(),
            "Mutation committed"
        );

        self.propagator.propagate(mutation);
        if self.refetch_on_settle {
            self.spawn_refetch();
        }

        Ok(outcome)
    }

    fn spawn_refetch(&self) {
        let executor = self.executor.clone();
        tokio::spawn(async move {
            executor.refetch_stale().await;
        });
    }

    /// Entries refreshed from the server while the call was out no longer
    /// carry the committed edit; mark them for refetch.
    fn mark_refreshed(&self, snapshots: &[Snapshot]) {
        let store = self.executor.store();
        for snapshot in snapshots.iter().filter(|s| s.written_version.is_some()) {
            if store.generation(&snapshot.key) != snapshot.generation {
                store.mark_stale(&snapshot.key);
            }
        }
    }

    /// Undo the optimistic edit in every written location, newest first.
    ///
    /// A location nobody else wrote to gets its snapshot back verbatim. Where
    /// another write landed since, only this edit is reverted and the entry
    /// is marked stale. A location refreshed from the server no longer holds
    /// the edit and is left alone.
    fn rollback(&self, edit: &OptimisticEdit, snapshots: &[Snapshot]) {
        let store = self.executor.store();
        let mut shared = false;

        for snapshot in snapshots.iter().rev() {
            let Some(written) = snapshot.written_version else {
                continue;
            };
            let key = &snapshot.key;

            if store.generation(key) != snapshot.generation {
                debug!(key = %key, "Entry refreshed since optimistic write");
                continue;
            }
            if store.version(key) == Some(written) {
                store.restore(key, snapshot.before.clone());
                continue;
            }

            debug!(key = %key, "Entry changed since optimistic write, reverting in place");
            store.update(key, |data| edit.revert(key, snapshot.before.as_ref(), data));
            store.mark_stale(key);
            shared = true;
        }

        self.stats().record_rollback();
        if shared && self.refetch_on_settle {
            self.spawn_refetch();
        }
    }

    fn swap_temporary(&self, snapshots: &[Snapshot], temp_id: &str, item: &ContentItem) {
        let store = self.executor.store();
        for snapshot in snapshots.iter().filter(|s| s.written_version.is_some()) {
            store.update(&snapshot.key, |data| replace_temporary(data, temp_id, item));
        }
    }
}
