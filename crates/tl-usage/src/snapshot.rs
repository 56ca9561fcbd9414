use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a committed amount was spent on.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageKind {
    #[serde(default)]
    pub is_report: bool,
    #[serde(default)]
    pub is_chat: bool,
}

impl UsageKind {
    pub fn report() -> Self {
        Self {
            is_report: true,
            is_chat: false,
        }
    }

    pub fn chat() -> Self {
        Self {
            is_report: false,
            is_chat: true,
        }
    }
}

/// Period counters after an increment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageTotals {
    pub account_id: String,
    pub period_id: i64,
    pub tokens_used: i64,
    pub tokens_limit: i64,
    pub reports_count: i64,
    pub chat_tokens_used: i64,
    pub period_end: DateTime<Utc>,
}

impl UsageTotals {
    pub fn remaining(&self) -> i64 {
        (self.tokens_limit - self.tokens_used).max(0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum UsageLevel {
    Ok,
    Warning,
    Critical,
    Exceeded,
}

/// Percent-of-quota boundaries used to classify a snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageThresholds {
    pub warning_percent: f64,
    pub critical_percent: f64,
}

impl Default for UsageThresholds {
    fn default() -> Self {
        Self {
            warning_percent: 80.0,
            critical_percent: 95.0,
        }
    }
}

impl UsageThresholds {
    pub fn level(&self, percentage: f64) -> UsageLevel {
        if percentage >= 100.0 {
            UsageLevel::Exceeded
        } else if percentage >= self.critical_percent {
            UsageLevel::Critical
        } else if percentage >= self.warning_percent {
            UsageLevel::Warning
        } else {
            UsageLevel::Ok
        }
    }
}

/// Read-only view of an account's quota for UI and API callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageSnapshot {
    pub allowed: bool,
    pub tokens_used: i64,
    pub tokens_limit: i64,
    pub remaining: i64,
    pub reserved: i64,
    pub percentage: f64,
    pub period_end: DateTime<Utc>,
    pub reports_count: i64,
    pub chat_tokens_used: i64,
    pub level: UsageLevel,
    /// Set when the store could not be read and the values are a
    /// conservative stand-in.
    #[serde(default)]
    pub degraded: bool,
}

/// Counters a snapshot is derived from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SnapshotInput {
    pub tokens_used: i64,
    pub tokens_limit: i64,
    pub reserved: i64,
    pub reports_count: i64,
    pub chat_tokens_used: i64,
    pub period_end: DateTime<Utc>,
}

impl UsageSnapshot {
    pub(crate) fn derive(
        input: SnapshotInput,
        estimated_tokens: i64,
        thresholds: &UsageThresholds,
    ) -> Self {
        let available = input
            .tokens_limit
            .saturating_sub(input.tokens_used)
            .saturating_sub(input.reserved);
        let percentage = usage_percentage(input.tokens_used, input.tokens_limit);
        Self {
            allowed: available >= estimated_tokens,
            tokens_used: input.tokens_used,
            tokens_limit: input.tokens_limit,
            remaining: input.tokens_limit.saturating_sub(input.tokens_used).max(0),
            reserved: input.reserved,
            percentage,
            period_end: input.period_end,
            reports_count: input.reports_count,
            chat_tokens_used: input.chat_tokens_used,
            level: thresholds.level(percentage),
            degraded: false,
        }
    }

    /// Denies admission without claiming any usage. Returned when the store
    /// cannot be read.
    pub fn unavailable(tokens_limit: i64, period_end: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            tokens_used: 0,
            tokens_limit,
            remaining: 0,
            reserved: 0,
            percentage: 0.0,
            period_end,
            reports_count: 0,
            chat_tokens_used: 0,
            level: UsageLevel::Ok,
            degraded: true,
        }
    }
}

/// `used / limit * 100` rounded to one decimal place.
pub fn usage_percentage(tokens_used: i64, tokens_limit: i64) -> f64 {
    if tokens_limit <= 0 {
        return 0.0;
    }
    let raw = tokens_used as f64 / tokens_limit as f64 * 100.0;
    (raw * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn input(used: i64, limit: i64, reserved: i64) -> SnapshotInput {
        SnapshotInput {
            tokens_used: used,
            tokens_limit: limit,
            reserved,
            reports_count: 0,
            chat_tokens_used: 0,
            period_end: Utc.with_ymd_and_hms(2026, 11, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn percentage_rounds_to_one_decimal() {
        assert_eq!(usage_percentage(1, 3), 33.3);
        assert_eq!(usage_percentage(2, 3), 66.7);
        assert_eq!(usage_percentage(2_900_000, 3_000_000), 96.7);
    }

    #[test]
    fn percentage_with_zero_limit_is_zero() {
        assert_eq!(usage_percentage(500, 0), 0.0);
    }

    #[test]
    fn allowed_accounts_for_reservations() {
        let thresholds = UsageThresholds::default();
        let snap = UsageSnapshot::derive(input(2_900_000, 3_000_000, 50_000), 60_000, &thresholds);
        assert!(!snap.allowed);
        assert_eq!(snap.remaining, 100_000);
        let snap = UsageSnapshot::derive(input(2_900_000, 3_000_000, 50_000), 40_000, &thresholds);
        assert!(snap.allowed);
    }

    #[test]
    fn remaining_never_negative() {
        let snap = UsageSnapshot::derive(input(120, 100, 0), 0, &UsageThresholds::default());
        assert_eq!(snap.remaining, 0);
        assert_eq!(snap.level, UsageLevel::Exceeded);
    }

    #[test]
    fn levels_follow_thresholds() {
        let t = UsageThresholds::default();
        assert_eq!(t.level(10.0), UsageLevel::Ok);
        assert_eq!(t.level(80.0), UsageLevel::Warning);
        assert_eq!(t.level(95.0), UsageLevel::Critical);
        assert_eq!(t.level(100.0), UsageLevel::Exceeded);
    }

    #[test]
    fn unavailable_snapshot_denies() {
        let end = Utc.with_ymd_and_hms(2026, 11, 1, 0, 0, 0).unwrap();
        let snap = UsageSnapshot::unavailable(3_000_000, end);
        assert!(!snap.allowed);
        assert!(snap.degraded);
    }

    #[test]
    fn usage_kind_constructors() {
        assert!(UsageKind::report().is_report);
        assert!(UsageKind::chat().is_chat);
        assert_eq!(UsageKind::default(), UsageKind { is_report: false, is_chat: false });
    }
}
