use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PeriodStatus {
    Active,
    Completed,
}

impl PeriodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodStatus::Active => "active",
            PeriodStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(PeriodStatus::Active),
            "completed" => Some(PeriodStatus::Completed),
            _ => None,
        }
    }
}

/// One account's quota window. Completed periods are history and are never
/// written again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsagePeriod {
    pub id: i64,
    pub account_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub tokens_limit: i64,
    pub tokens_used: i64,
    pub reports_count: i64,
    pub chat_tokens_used: i64,
    pub status: PeriodStatus,
}

impl UsagePeriod {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.period_end <= now
    }
}

/// Half-open `[start, end)` interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PeriodBounds {
    /// The calendar month containing `now`.
    pub fn calendar_month(now: DateTime<Utc>) -> Self {
        let today = now.date_naive();
        let first = today.with_day(1).unwrap_or(today);
        let next = first
            .checked_add_months(Months::new(1))
            .unwrap_or(NaiveDate::MAX);
        Self {
            start: midnight(first),
            end: midnight(next),
        }
    }

    /// The monthly window aligned to a subscription's billing anchor that
    /// contains `now`. Anchors in the future fall back to the calendar month.
    pub fn anchored(anchor: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        if anchor > now {
            return Self::calendar_month(now);
        }

        let months = (now.year() - anchor.year()) * 12 + now.month() as i32
            - anchor.month() as i32;
        let mut offset = months.max(0) as u32;
        loop {
            let start = anchor.checked_add_months(Months::new(offset));
            let end = anchor.checked_add_months(Months::new(offset + 1));
            match (start, end) {
                (Some(start), Some(end)) if start <= now && now < end => {
                    return Self { start, end };
                }
                (Some(start), Some(_)) if start > now && offset > 0 => offset -= 1,
                (Some(_), Some(_)) => offset += 1,
                _ => return Self::calendar_month(now),
            }
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Plan parameters injected by the billing layer when a period has to be
/// opened for an account.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaPlan {
    pub tokens_limit: i64,
    pub billing_anchor: Option<DateTime<Utc>>,
}

impl QuotaPlan {
    pub fn new(tokens_limit: i64) -> Self {
        Self {
            tokens_limit,
            billing_anchor: None,
        }
    }

    pub fn anchored_at(mut self, anchor: DateTime<Utc>) -> Self {
        self.billing_anchor = Some(anchor);
        self
    }

    pub fn bounds_at(&self, now: DateTime<Utc>) -> PeriodBounds {
        match self.billing_anchor {
            Some(anchor) => PeriodBounds::anchored(anchor, now),
            None => PeriodBounds::calendar_month(now),
        }
    }
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
pub(crate) fn to_sql_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn from_sql_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}
