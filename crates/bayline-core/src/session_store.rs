//! Per-chat last-result memory.
//!
//! Follow-up actions ("order those parts", "customer approved") operate on
//! the most recent `EstimateResult` for the chat. One process-wide store;
//! each chat's slot is overwritten atomically under the lock.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use bayline_types::EstimateResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEstimate {
    pub result: EstimateResult,
    pub stored_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct SessionStore {
    inner: Mutex<HashMap<String, StoredEstimate>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the chat's slot with this result.
    pub async fn put(&self, result: EstimateResult) {
        let mut inner = self.inner.lock().await;
        inner.insert(
            result.chat_id.clone(),
            StoredEstimate {
                result,
                stored_at: Utc::now(),
            },
        );
    }

    pub async fn last(&self, chat_id: &str) -> Option<StoredEstimate> {
        self.inner.lock().await.get(chat_id).cloned()
    }

    pub async fn last_result(&self, chat_id: &str) -> Option<EstimateResult> {
        self.last(chat_id).await.map(|s| s.result)
    }

    pub async fn remove(&self, chat_id: &str) -> bool {
        self.inner.lock().await.remove(chat_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}
