//! Suppression List
//!
//! Addresses that must not receive mail again: hard bounces, spam
//! complaints, unsubscribes and manual additions. Keys are normalized
//! addresses.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::models::{normalize_email, SuppressionEntry, SuppressionReason};

/// Suppression list service
pub struct SuppressionList {
    entries: Arc<RwLock<HashMap<String, SuppressionEntry>>>,
}

impl SuppressionList {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Add an address. An existing entry keeps its original reason.
    pub async fn add(&self, email: &str, reason: SuppressionReason) -> bool {
        let key = normalize_email(email);
        let mut entries = self.entries.write().await;
        if entries.contains_key(&key) {
            return false;
        }
        tracing::info!(email = %key, %reason, "Address suppressed");
        entries.insert(
            key.clone(),
            SuppressionEntry {
                email: key,
                reason,
                added_at: Utc::now(),
            },
        );
        true
    }

    pub async fn remove(&self, email: &str) -> bool {
        let mut entries = self.entries.write().await;
        entries.remove(&normalize_email(email)).is_some()
    }

    pub async fn is_suppressed(&self, email: &str) -> bool {
        let entries = self.entries.read().await;
        entries.contains_key(&normalize_email(email))
    }

    pub async fn reason(&self, email: &str) -> Option<SuppressionReason> {
        let entries = self.entries.read().await;
        entries.get(&normalize_email(email)).map(|e| e.reason)
    }

    /// All entries, oldest first
    pub async fn list(&self) -> Vec<SuppressionEntry> {
        let entries = self.entries.read().await;
        let mut list: Vec<SuppressionEntry> = entries.values().cloned().collect();
        list.sort_by(|a, b| a.added_at.cmp(&b.added_at).then_with(|| a.email.cmp(&b.email)));
        list
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for SuppressionList {
    fn default() -> Self {
        Self::new()
    }
}
