//! Push-based document change listener
//!
//! The remote store can push [`DocumentChange`] messages over a tokio
//! channel. The listener maps each one to key patterns, marks the matching
//! entries stale and, when enabled, refetches the observed ones.

use crate::error::Result;
use crate::executor::QueryExecutor;
use crate::invalidation::InvalidationPropagator;
use crate::models::Collection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Created,
    Updated,
    Deleted,
}

/// One remote document change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentChange {
    pub message_id: String,
    pub collection: Collection,
    pub document_id: String,
    pub action: ChangeAction,
    /// Parent post of a changed comment
    #[serde(default)]
    pub parent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DocumentChange {
    pub fn new(
        collection: Collection,
        document_id: impl Into<String>,
        action: ChangeAction,
        parent_id: Option<String>,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            collection,
            document_id: document_id.into(),
            action,
            parent_id,
            timestamp: Utc::now(),
        }
    }

    pub fn created(collection: Collection, document_id: impl Into<String>, parent_id: Option<String>) -> Self {
        Self::new(collection, document_id, ChangeAction::Created, parent_id)
    }

    pub fn updated(collection: Collection, document_id: impl Into<String>, parent_id: Option<String>) -> Self {
        Self::new(collection, document_id, ChangeAction::Updated, parent_id)
    }

    pub fn deleted(collection: Collection, document_id: impl Into<String>, parent_id: Option<String>) -> Self {
        Self::new(collection, document_id, ChangeAction::Deleted, parent_id)
    }

    /// Decode a JSON payload as delivered by the push channel
    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

#[derive(Clone)]
pub struct ChangeListener {
    propagator: InvalidationPropagator,
    executor: QueryExecutor,
    refetch_observed: bool,
}

impl ChangeListener {
    pub fn new(
        propagator: InvalidationPropagator,
        executor: QueryExecutor,
        refetch_observed: bool,
    ) -> Self {
        Self {
            propagator,
            executor,
            refetch_observed,
        }
    }

    /// Apply one change; returns how many entries were marked stale
    pub async fn handle(&self, change: &DocumentChange) -> usize {
        debug!(
            message_id = %change.message_id,
            collection = %change.collection,
            document_id = %change.document_id,
            action = ?change.action,
            "Received document change"
        );

        let keys = self.propagator.propagate_change(change);
        if self.refetch_observed && !keys.is_empty() {
            self.executor.refetch_stale().await;
        }
        keys.len()
    }

    /// Consume typed changes until the sender side closes
    pub fn spawn(self, mut changes: mpsc::Receiver<DocumentChange>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Document change listener started");

            while let Some(change) = changes.recv().await {
                self.handle(&change).await;
            }

            warn!("Document change channel closed");
        })
    }

    /// Consume raw JSON payloads; undecodable ones are logged and skipped
    pub fn spawn_json(self, mut payloads: mpsc::Receiver<String>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Document change listener started (json)");

            while let Some(payload) = payloads.recv().await {
                let change = match DocumentChange::from_json(&payload) {
                    Ok(change) => change,
                    Err(e) => {
                        error!(error = %e, payload = %payload, "Failed to decode document change");
                        continue;
                    }
                };
                self.handle(&change).await;
            }

            warn!("Document change channel closed");
        })
    }
}
