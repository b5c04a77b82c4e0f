//! Membership batch checker
//!
//! Answers "which of these ids did the user like/save/report/follow" with one
//! network call per (kind, user, id batch). Batches are cached under a
//! canonical signature so the same ids in any order share one entry.

use crate::backend::DocumentStore;
use crate::error::Result;
use crate::executor::{QueryExecutor, QueryFn, QueryOptions};
use crate::keys::{KeyPattern, QueryKey};
use crate::models::{InteractionKind, MembershipSet, MembershipState, QueryData};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Sorted, de-duplicated, comma-joined ids
pub fn batch_signature<S: AsRef<str>>(ids: &[S]) -> String {
    canonical_ids(ids)
        .into_iter()
        .collect::<Vec<_>>()
        .join(",")
}

fn canonical_ids<S: AsRef<str>>(ids: &[S]) -> BTreeSet<String> {
    ids.iter()
        .map(|id| id.as_ref().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

#[derive(Clone)]
pub struct MembershipBatchChecker {
    executor: QueryExecutor,
    documents: Arc<dyn DocumentStore>,
}

impl MembershipBatchChecker {
    pub fn new(executor: QueryExecutor, documents: Arc<dyn DocumentStore>) -> Self {
        Self {
            executor,
            documents,
        }
    }

    pub fn batch_key<S: AsRef<str>>(kind: InteractionKind, user_id: &str, ids: &[S]) -> QueryKey {
        QueryKey::membership_batch(kind, user_id, &batch_signature(ids))
    }

    /// Resolve which of `ids` satisfy `kind` for the user.
    ///
    /// An empty id list resolves to [`MembershipState::Empty`] without a
    /// network call.
    pub async fn check_batch<S: AsRef<str>>(
        &self,
        kind: InteractionKind,
        user_id: &str,
        ids: &[S],
    ) -> Result<MembershipState> {
        let canonical = canonical_ids(ids);
        if canonical.is_empty() {
            return Ok(MembershipState::Empty);
        }

        let key = Self::batch_key(kind, user_id, ids);
        let query = self.batch_query(kind, user_id, canonical);
        let options = self.executor.default_options();

        match self.executor.fetch(&key, &query, &options).await? {
            Some(data) => Ok(MembershipState::from_members(data.into_membership()?.members)),
            None => Ok(MembershipState::Unknown),
        }
    }

    /// Non-blocking read: `Unknown` until the batch has resolved once
    pub fn peek_batch<S: AsRef<str>>(
        &self,
        kind: InteractionKind,
        user_id: &str,
        ids: &[S],
    ) -> MembershipState {
        if canonical_ids(ids).is_empty() {
            return MembershipState::Empty;
        }

        let key = Self::batch_key(kind, user_id, ids);
        match self.executor.store().get_data(&key) {
            Some(QueryData::Membership(set)) => MembershipState::from_members(set.members),
            _ => MembershipState::Unknown,
        }
    }

    /// Single-id check, cached under `{kind}:check:{id}:{user}`
    pub async fn check_individual(
        &self,
        kind: InteractionKind,
        user_id: &str,
        target_id: &str,
    ) -> Result<bool> {
        let key = QueryKey::membership_check(kind, target_id, user_id);

        let documents = self.documents.clone();
        let user = user_id.to_string();
        let target = target_id.to_string();
        let query = QueryFn::single(move || {
            let documents = documents.clone();
            let user = user.clone();
            let target = target.clone();
            async move {
                documents
                    .is_member(kind, &user, &target)
                    .await
                    .map(QueryData::Flag)
            }
        });

        match self
            .executor
            .fetch(&key, &query, &self.executor.default_options())
            .await?
        {
            Some(data) => data.into_flag(),
            None => Ok(false),
        }
    }

    /// Answer from any cached location without touching the network
    pub fn known_membership(
        &self,
        kind: InteractionKind,
        user_id: &str,
        target_id: &str,
    ) -> Option<bool> {
        let store = self.executor.store();
        let check_key = QueryKey::membership_check(kind, target_id, user_id);
        if let Some(QueryData::Flag(flag)) = store.get_data(&check_key) {
            return Some(flag);
        }

        self.batch_keys_covering(kind, user_id, target_id)
            .into_iter()
            .find_map(|key| match store.get_data(&key) {
                Some(QueryData::Membership(set)) => Some(set.contains(target_id)),
                _ => None,
            })
    }

    /// Every cached batch for (kind, user) whose id set includes `target_id`
    pub fn batch_keys_covering(
        &self,
        kind: InteractionKind,
        user_id: &str,
        target_id: &str,
    ) -> Vec<QueryKey> {
        let pattern = KeyPattern::prefix([kind.prefix(), "batch", user_id]);
        self.executor.store().keys_where(|entry| {
            pattern.matches(&entry.key)
                && matches!(&entry.data, Some(QueryData::Membership(set)) if set.covers(target_id))
        })
    }

    fn batch_query(&self, kind: InteractionKind, user_id: &str, ids: BTreeSet<String>) -> QueryFn {
        let documents = self.documents.clone();
        let user = user_id.to_string();
        QueryFn::single(move || {
            let documents = documents.clone();
            let user = user.clone();
            let ids = ids.clone();
            async move {
                let requested: Vec<String> = ids.iter().cloned().collect();
                let members = documents.find_memberships(kind, &user, &requested).await?;
                debug!(
                    kind = %kind,
                    user_id = %user,
                    requested = requested.len(),
                    members = members.len(),
                    "Resolved membership batch"
                );
                Ok(QueryData::Membership(MembershipSet::new(ids, members)))
            }
        })
    }

    pub fn options(&self) -> QueryOptions {
        self.executor.default_options()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::memory::InMemoryBackend;
    use crate::stats::StatsCollector;
    use crate::store::CacheStore;

    fn setup() -> (MembershipBatchChecker, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let executor = QueryExecutor::new(
            CacheStore::new(),
            &CacheConfig::default(),
            StatsCollector::new(),
        );
        (MembershipBatchChecker::new(executor, backend.clone()), backend)
    }

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_signature_is_canonical() {
        assert_eq!(batch_signature(&["c", "a", "b", "a"]), "a,b,c");
        assert_eq!(batch_signature::<&str>(&[]), "");
    }

    #[tokio::test]
    async fn test_empty_batch_skips_network() {
        let (checker, backend) = setup();
        let state = checker
            .check_batch::<String>(InteractionKind::Like, "u1", &[])
            .await
            .unwrap();

        assert_eq!(state, MembershipState::Empty);
        assert_eq!(backend.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_batch_is_cached_per_signature() {
        let (checker, backend) = setup();
        backend.set_member(InteractionKind::Like, "u1", "b", true);

        assert_eq!(
            checker.peek_batch(InteractionKind::Like, "u1", &ids(&["a", "b", "c"])),
            MembershipState::Unknown
        );

        let first = checker
            .check_batch(InteractionKind::Like, "u1", &ids(&["a", "b", "c"]))
            .await
            .unwrap();
        let reordered = checker
            .check_batch(InteractionKind::Like, "u1", &ids(&["c", "b", "a"]))
            .await
            .unwrap();

        assert_eq!(first.contains("b"), Some(true));
        assert_eq!(first.contains("a"), Some(false));
        assert_eq!(first, reordered);
        assert_eq!(backend.calls("find_memberships"), 1);
        assert_eq!(
            checker.peek_batch(InteractionKind::Like, "u1", &ids(&["b", "a", "c"])),
            first
        );
    }

    #[tokio::test]
    async fn test_batch_matches_individual_checks() {
        let (checker, backend) = setup();
        backend.set_member(InteractionKind::Save, "u1", "p2", true);
        backend.set_member(InteractionKind::Save, "u1", "p4", true);
        backend.set_member(InteractionKind::Save, "u2", "p1", true);
        let batch = ids(&["p1", "p2", "p3", "p4"]);

        let state = checker
            .check_batch(InteractionKind::Save, "u1", &batch)
            .await
            .unwrap();

        let mut individually = BTreeSet::new();
        for id in &batch {
            if checker
                .check_individual(InteractionKind::Save, "u1", id)
                .await
                .unwrap()
            {
                individually.insert(id.clone());
            }
        }
        assert_eq!(state.members(), individually);
    }

    #[tokio::test]
    async fn test_known_membership_reads_any_location() {
        let (checker, backend) = setup();
        backend.set_member(InteractionKind::Like, "u1", "b", true);

        assert_eq!(checker.known_membership(InteractionKind::Like, "u1", "b"), None);

        checker
            .check_batch(InteractionKind::Like, "u1", &ids(&["a", "b"]))
            .await
            .unwrap();
        assert_eq!(checker.known_membership(InteractionKind::Like, "u1", "b"), Some(true));
        assert_eq!(checker.known_membership(InteractionKind::Like, "u1", "a"), Some(false));
        assert_eq!(checker.known_membership(InteractionKind::Like, "u1", "z"), None);

        assert_eq!(
            checker.batch_keys_covering(InteractionKind::Like, "u1", "a"),
            vec![MembershipBatchChecker::batch_key(InteractionKind::Like, "u1", &["a", "b"])]
        );
    }
}
