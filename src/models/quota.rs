//! Send Quota Models

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Which quota window a count belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaWindowKind {
    Daily,
    Weekly,
}

impl QuotaWindowKind {
    /// First day of the period containing `at` (UTC days, Sunday-aligned weeks)
    pub fn period_start(self, at: DateTime<Utc>) -> NaiveDate {
        let day = at.date_naive();
        match self {
            Self::Daily => day,
            Self::Weekly => day - Duration::days(i64::from(day.weekday().num_days_from_sunday())),
        }
    }
}

impl std::fmt::Display for QuotaWindowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Daily => write!(f, "daily"),
            Self::Weekly => write!(f, "weekly"),
        }
    }
}

/// Per-sender send limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub daily: u32,
    pub weekly: u32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            daily: 60,
            weekly: 240,
        }
    }
}

impl QuotaLimits {
    pub fn limit(&self, kind: QuotaWindowKind) -> u32 {
        match kind {
            QuotaWindowKind::Daily => self.daily,
            QuotaWindowKind::Weekly => self.weekly,
        }
    }
}

/// Key of one counter: sender, window kind and period
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuotaKey {
    pub sender_id: String,
    pub kind: QuotaWindowKind,
    pub period_start: NaiveDate,
}

impl QuotaKey {
    pub fn new(sender_id: &str, kind: QuotaWindowKind, at: DateTime<Utc>) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            kind,
            period_start: kind.period_start(at),
        }
    }
}

/// Counter for one sender and period. Created lazily, never decremented.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaWindow {
    pub sender_id: String,
    pub kind: QuotaWindowKind,
    pub period_start: NaiveDate,
    pub count: u32,
    pub updated_at: DateTime<Utc>,
}

impl QuotaWindow {
    pub fn new(key: &QuotaKey, at: DateTime<Utc>) -> Self {
        Self {
            sender_id: key.sender_id.clone(),
            kind: key.kind,
            period_start: key.period_start,
            count: 0,
            updated_at: at,
        }
    }
}

/// Current usage of one sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub daily_count: u32,
    pub weekly_count: u32,
    pub limits: QuotaLimits,
}

impl QuotaUsage {
    pub fn count(&self, kind: QuotaWindowKind) -> u32 {
        match kind {
            QuotaWindowKind::Daily => self.daily_count,
            QuotaWindowKind::Weekly => self.weekly_count,
        }
    }

    pub fn daily_remaining(&self) -> u32 {
        self.limits.daily.saturating_sub(self.daily_count)
    }

    pub fn weekly_remaining(&self) -> u32 {
        self.limits.weekly.saturating_sub(self.weekly_count)
    }

    /// How many more messages may be sent right now
    pub fn remaining(&self) -> u32 {
        self.daily_remaining().min(self.weekly_remaining())
    }

    /// First window that `requested` more messages would exceed, daily checked first
    pub fn exceeded_by(&self, requested: u32) -> Option<QuotaWindowKind> {
        [QuotaWindowKind::Daily, QuotaWindowKind::Weekly]
            .into_iter()
            .find(|kind| u64::from(self.count(*kind)) + u64::from(requested) > u64::from(self.limits.limit(*kind)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_weekly_period_is_sunday_aligned() {
        // 2026-10-18 is a Sunday
        let sunday = Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap();
        let wednesday = Utc.with_ymd_and_hms(2026, 10, 21, 23, 59, 0).unwrap();
        let saturday = Utc.with_ymd_and_hms(2026, 10, 24, 12, 0, 0).unwrap();
        let next_sunday = Utc.with_ymd_and_hms(2026, 10, 25, 0, 0, 0).unwrap();

        let start = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        assert_eq!(QuotaWindowKind::Weekly.period_start(sunday), start);
        assert_eq!(QuotaWindowKind::Weekly.period_start(wednesday), start);
        assert_eq!(QuotaWindowKind::Weekly.period_start(saturday), start);
        assert_ne!(QuotaWindowKind::Weekly.period_start(next_sunday), start);

        assert_eq!(
            QuotaWindowKind::Daily.period_start(wednesday),
            NaiveDate::from_ymd_opt(2026, 10, 21).unwrap()
        );
    }

    #[test]
    fn test_exceeded_by() {
        let usage = QuotaUsage {
            daily_count: 59,
            weekly_count: 100,
            limits: QuotaLimits::default(),
        };
        assert_eq!(usage.exceeded_by(1), None);
        assert_eq!(usage.exceeded_by(2), Some(QuotaWindowKind::Daily));
        assert_eq!(usage.remaining(), 1);

        let usage = QuotaUsage {
            daily_count: 0,
            weekly_count: 239,
            limits: QuotaLimits::default(),
        };
        assert_eq!(usage.exceeded_by(2), Some(QuotaWindowKind::Weekly));
        assert_eq!(usage.remaining(), 1);
    }
}
