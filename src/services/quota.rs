//! Send Quota Service
//!
//! Per-sender rolling counters over a UTC day and a Sunday-aligned week.
//! `authorize` only checks; `record` checks again and commits under the same
//! write lock, so two concurrent requests cannot both pass the last slot.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;

use crate::models::{QuotaKey, QuotaLimits, QuotaUsage, QuotaWindow, QuotaWindowKind};

/// Quota error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuotaError {
    #[error("{window} quota exceeded: {current} of {limit} used, {requested} requested")]
    Exceeded {
        window: QuotaWindowKind,
        limit: u32,
        current: u32,
        requested: u32,
    },
}

/// Quota service
pub struct QuotaService {
    limits: QuotaLimits,
    windows: Arc<RwLock<HashMap<QuotaKey, QuotaWindow>>>,
}

impl QuotaService {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            limits,
            windows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    fn usage_in(&self, windows: &HashMap<QuotaKey, QuotaWindow>, sender_id: &str, at: DateTime<Utc>) -> QuotaUsage {
        let count = |kind| {
            windows
                .get(&QuotaKey::new(sender_id, kind, at))
                .map_or(0, |w| w.count)
        };
        QuotaUsage {
            daily_count: count(QuotaWindowKind::Daily),
            weekly_count: count(QuotaWindowKind::Weekly),
            limits: self.limits,
        }
    }

    fn check(&self, usage: &QuotaUsage, requested: u32) -> Result<(), QuotaError> {
        match usage.exceeded_by(requested) {
            Some(window) => Err(QuotaError::Exceeded {
                window,
                limit: self.limits.limit(window),
                current: usage.count(window),
                requested,
            }),
            None => Ok(()),
        }
    }

    /// Current usage for a sender
    pub async fn usage(&self, sender_id: &str) -> QuotaUsage {
        self.usage_at(sender_id, Utc::now()).await
    }

    pub async fn usage_at(&self, sender_id: &str, at: DateTime<Utc>) -> QuotaUsage {
        let windows = self.windows.read().await;
        self.usage_in(&windows, sender_id, at)
    }

    /// Check whether `requested` more sends fit both windows
    pub async fn authorize(&self, sender_id: &str, requested: u32) -> Result<QuotaUsage, QuotaError> {
        self.authorize_at(sender_id, requested, Utc::now()).await
    }

    pub async fn authorize_at(
        &self,
        sender_id: &str,
        requested: u32,
        at: DateTime<Utc>,
    ) -> Result<QuotaUsage, QuotaError> {
        let usage = self.usage_at(sender_id, at).await;
        if let Err(err) = self.check(&usage, requested) {
            tracing::info!(sender_id, requested, error = %err, "Send request rejected by quota");
            return Err(err);
        }
        Ok(usage)
    }

    /// Commit `count` sends to both windows. Fails without committing if
    /// they no longer fit.
    pub async fn record(&self, sender_id: &str, count: u32) -> Result<QuotaUsage, QuotaError> {
        self.record_at(sender_id, count, Utc::now()).await
    }

    pub async fn record_at(&self, sender_id: &str, count: u32, at: DateTime<Utc>) -> Result<QuotaUsage, QuotaError> {
        let mut windows = self.windows.write().await;

        let usage = self.usage_in(&windows, sender_id, at);
        if let Err(err) = self.check(&usage, count) {
            tracing::info!(sender_id, count, error = %err, "Quota commit rejected");
            return Err(err);
        }

        // Windows of earlier weeks can no longer affect any check
        let stale = prune_before(&mut windows, QuotaWindowKind::Weekly.period_start(at));
        if stale > 0 {
            tracing::debug!(stale, "Pruned expired quota windows");
        }

        for kind in [QuotaWindowKind::Daily, QuotaWindowKind::Weekly] {
            let key = QuotaKey::new(sender_id, kind, at);
            let window = windows.entry(key.clone()).or_insert_with(|| QuotaWindow::new(&key, at));
            window.count += count;
            window.updated_at = at;
        }

        let usage = self.usage_in(&windows, sender_id, at);
        tracing::debug!(
            sender_id,
            count,
            daily = usage.daily_count,
            weekly = usage.weekly_count,
            "Quota recorded"
        );
        Ok(usage)
    }

    /// Drop windows whose period started before `before`
    pub async fn prune(&self, before: NaiveDate) -> usize {
        let mut windows = self.windows.write().await;
        prune_before(&mut windows, before)
    }

    /// All stored windows of a sender
    pub async fn windows(&self, sender_id: &str) -> Vec<QuotaWindow> {
        let windows = self.windows.read().await;
        let mut found: Vec<QuotaWindow> = windows
            .values()
            .filter(|w| w.sender_id == sender_id)
            .cloned()
            .collect();
        found.sort_by_key(|w| (w.period_start, w.kind == QuotaWindowKind::Weekly));
        found
    }
}

fn prune_before(windows: &mut HashMap<QuotaKey, QuotaWindow>, before: NaiveDate) -> usize {
    let len = windows.len();
    windows.retain(|key, _| key.period_start >= before);
    len - windows.len()
}

impl Default for QuotaService {
    fn default() -> Self {
        Self::new(QuotaLimits::default())
    }
}
