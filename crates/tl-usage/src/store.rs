mod jobs;
mod sweep;

use crate::error::{ensure_amount, UsageError};
use crate::job::IN_FLIGHT_SQL;
use crate::migrations;
use crate::period::{from_sql_ts, to_sql_ts, PeriodStatus, QuotaPlan, UsagePeriod};
use crate::snapshot::{SnapshotInput, UsageKind, UsageSnapshot, UsageThresholds, UsageTotals};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub use jobs::{JobCompletion, Settlement, FAILURE_MESSAGE, STALE_JOB_MESSAGE};
pub use sweep::SweepReport;

/// Source of "now" for period rollover and job timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const PERIOD_COLUMNS: &str = "id, account_id, period_start, period_end, tokens_limit, \
     tokens_used, reports_count, chat_tokens_used, status";

/// SQLite-backed ledger of usage periods and report-job reservations.
///
/// Every mutating operation runs in a single `BEGIN IMMEDIATE` transaction,
/// which takes the database write lock before the first read. Admission
/// checks, increments and settlements therefore serialize against each
/// other across connections and processes sharing the same file.
pub struct UsageStore {
    conn: Mutex<Connection>,
    clock: Clock,
}

impl UsageStore {
    pub fn open(path: &Path) -> Result<Self, UsageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migrations::run_migrations(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn in_memory() -> Result<Self, UsageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrations::run_migrations(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock, e.g. to drive period rollover in tests.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Current time as seen by this store's clock.
    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, UsageError> {
        self.conn.lock().map_err(|_| UsageError::Poisoned)
    }

    /// Returns the account's active period, closing an expired one and
    /// opening a fresh window from `plan` when needed.
    pub fn get_or_create_active_period(
        &self,
        account_id: &str,
        plan: &QuotaPlan,
    ) -> Result<UsagePeriod, UsageError> {
        let now = self.now();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let period = ensure_active_period(&tx, account_id, plan, now)?;
        tx.commit()?;
        Ok(period)
    }

    /// Admission check. Returns the amount the caller should record as the
    /// job's reservation, or `None` when the account cannot afford it.
    pub fn try_reserve(
        &self,
        account_id: &str,
        estimated_tokens: i64,
        plan: &QuotaPlan,
    ) -> Result<Option<i64>, UsageError> {
        ensure_amount(estimated_tokens)?;
        let now = self.now();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let available = available_tokens(&tx, account_id, plan, now)?;
        tx.commit()?;

        if available < estimated_tokens {
            tracing::info!(
                account_id,
                available,
                requested = estimated_tokens,
                "Reservation denied"
            );
            return Ok(None);
        }
        Ok(Some(estimated_tokens))
    }

    /// Read-only usage projection. Never creates a period: an account with
    /// no row, or whose active row has expired, reads as a fresh window.
    pub fn check_usage_allowed(
        &self,
        account_id: &str,
        estimated_tokens: i64,
        plan: &QuotaPlan,
        thresholds: &UsageThresholds,
    ) -> Result<UsageSnapshot, UsageError> {
        ensure_amount(estimated_tokens)?;
        let now = self.now();
        let mut conn = self.lock()?;
        // Deferred transaction: one consistent read of period and jobs.
        let tx = conn.transaction()?;
        let period = load_active_period(&tx, account_id)?.filter(|p| !p.is_expired_at(now));
        let reserved = reserved_tokens(&tx, account_id)?;
        drop(tx);

        let input = match period {
            Some(p) => SnapshotInput {
                tokens_used: p.tokens_used,
                tokens_limit: p.tokens_limit,
                reserved,
                reports_count: p.reports_count,
                chat_tokens_used: p.chat_tokens_used,
                period_end: p.period_end,
            },
            None => SnapshotInput {
                tokens_used: 0,
                tokens_limit: plan.tokens_limit,
                reserved,
                reports_count: 0,
                chat_tokens_used: 0,
                period_end: plan.bounds_at(now).end,
            },
        };
        Ok(UsageSnapshot::derive(input, estimated_tokens, thresholds))
    }

    /// Adds spent tokens to the account's active period in one
    /// update-and-return. Job reservations are left untouched.
    pub fn commit_usage(
        &self,
        account_id: &str,
        tokens: i64,
        kind: UsageKind,
        plan: &QuotaPlan,
    ) -> Result<UsageTotals, UsageError> {
        ensure_amount(tokens)?;
        let now = self.now();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let period = ensure_active_period(&tx, account_id, plan, now)?;
        let totals = increment_period(&tx, period.id, tokens, kind, now)?;
        tx.commit()?;

        tracing::debug!(
            account_id,
            tokens,
            tokens_used = totals.tokens_used,
            "Committed usage"
        );
        Ok(totals)
    }

    /// All periods for an account, newest first.
    pub fn period_history(&self, account_id: &str) -> Result<Vec<UsagePeriod>, UsageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PERIOD_COLUMNS} FROM usage_periods
             WHERE account_id = ?1 ORDER BY period_start DESC, id DESC"
        ))?;
        let rows = stmt
            .query_map([account_id], period_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn period_from_row(row: &Row<'_>) -> rusqlite::Result<UsagePeriod> {
    let status: String = row.get(8)?;
    Ok(UsagePeriod {
        id: row.get(0)?,
        account_id: row.get(1)?,
        period_start: from_sql_ts(2, &row.get::<_, String>(2)?)?,
        period_end: from_sql_ts(3, &row.get::<_, String>(3)?)?,
        tokens_limit: row.get(4)?,
        tokens_used: row.get(5)?,
        reports_count: row.get(6)?,
        chat_tokens_used: row.get(7)?,
        status: PeriodStatus::parse(&status).ok_or_else(|| unknown_text(8, &status))?,
    })
}

pub(crate) fn unknown_text(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unrecognized value {value:?}").into(),
    )
}

fn load_active_period(
    conn: &Connection,
    account_id: &str,
) -> rusqlite::Result<Option<UsagePeriod>> {
    conn.query_row(
        &format!(
            "SELECT {PERIOD_COLUMNS} FROM usage_periods
             WHERE account_id = ?1 AND status = 'active'"
        ),
        [account_id],
        period_from_row,
    )
    .optional()
}

/// Must run inside a write transaction. Closes an expired active period,
/// inserts a fresh one unless another caller already did, and reads back
/// the single active row.
pub(crate) fn ensure_active_period(
    conn: &Connection,
    account_id: &str,
    plan: &QuotaPlan,
    now: DateTime<Utc>,
) -> Result<UsagePeriod, UsageError> {
    ensure_amount(plan.tokens_limit)?;
    let now_ts = to_sql_ts(now);

    let closed = conn.execute(
        "UPDATE usage_periods SET status = 'completed', updated_at = ?2
         WHERE account_id = ?1 AND status = 'active' AND period_end <= ?2",
        params![account_id, now_ts],
    )?;
    if closed > 0 {
        tracing::info!(account_id, "Closed expired usage period");
    }

    let bounds = plan.bounds_at(now);
    let opened = conn.execute(
        "INSERT INTO usage_periods
            (account_id, period_start, period_end, tokens_limit, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?5)
         ON CONFLICT (account_id) WHERE status = 'active' DO NOTHING",
        params![
            account_id,
            to_sql_ts(bounds.start),
            to_sql_ts(bounds.end),
            plan.tokens_limit,
            now_ts,
        ],
    )?;
    if opened > 0 {
        tracing::info!(
            account_id,
            tokens_limit = plan.tokens_limit,
            period_end = %bounds.end,
            "Opened usage period"
        );
    }

    let period = conn.query_row(
        &format!(
            "SELECT {PERIOD_COLUMNS} FROM usage_periods
             WHERE account_id = ?1 AND status = 'active'"
        ),
        [account_id],
        period_from_row,
    )?;
    Ok(period)
}

/// Sum of reservations held by the account's in-flight jobs.
pub(crate) fn reserved_tokens(conn: &Connection, account_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        &format!(
            "SELECT COALESCE(SUM(tokens_reserved), 0) FROM report_jobs
             WHERE account_id = ?1 AND status IN {IN_FLIGHT_SQL}"
        ),
        [account_id],
        |row| row.get(0),
    )
}

/// `limit - used - reserved`; negative when concurrent increments overshot.
pub(crate) fn available_tokens(
    conn: &Connection,
    account_id: &str,
    plan: &QuotaPlan,
    now: DateTime<Utc>,
) -> Result<i64, UsageError> {
    let period = ensure_active_period(conn, account_id, plan, now)?;
    let reserved = reserved_tokens(conn, account_id)?;
    Ok(period
        .tokens_limit
        .saturating_sub(period.tokens_used)
        .saturating_sub(reserved))
}

pub(crate) fn increment_period(
    conn: &Connection,
    period_id: i64,
    tokens: i64,
    kind: UsageKind,
    now: DateTime<Utc>,
) -> Result<UsageTotals, UsageError> {
    let chat_tokens = if kind.is_chat { tokens } else { 0 };
    // SQLite turns an overflowing integer sum into REAL, so check first.
    let (used, chat_used, reports): (i64, i64, i64) = conn.query_row(
        "SELECT tokens_used, chat_tokens_used, reports_count FROM usage_periods WHERE id = ?1",
        [period_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    let fits = used.checked_add(tokens).is_some()
        && chat_used.checked_add(chat_tokens).is_some()
        && reports.checked_add(i64::from(kind.is_report)).is_some();
    if !fits {
        return Err(UsageError::AmountOverflow { period_id, tokens });
    }

    let totals = conn.query_row(
        "UPDATE usage_periods
         SET tokens_used = tokens_used + ?2,
             reports_count = reports_count + ?3,
             chat_tokens_used = chat_tokens_used + ?4,
             updated_at = ?5
         WHERE id = ?1 AND status = 'active'
         RETURNING account_id, id, tokens_used, tokens_limit, reports_count,
                   chat_tokens_used, period_end",
        params![
            period_id,
            tokens,
            i64::from(kind.is_report),
            chat_tokens,
            to_sql_ts(now),
        ],
        |row| {
            Ok(UsageTotals {
                account_id: row.get(0)?,
                period_id: row.get(1)?,
                tokens_used: row.get(2)?,
                tokens_limit: row.get(3)?,
                reports_count: row.get(4)?,
                chat_tokens_used: row.get(5)?,
                period_end: from_sql_ts(6, &row.get::<_, String>(6)?)?,
            })
        },
    )?;
    Ok(totals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_clock(at: DateTime<Utc>) -> Clock {
        Arc::new(move || at)
    }

    fn october() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()
    }

    fn store() -> UsageStore {
        UsageStore::in_memory().unwrap().with_clock(fixed_clock(october()))
    }

    #[test]
    fn creates_period_for_current_month() {
        let store = store();
        let period = store
            .get_or_create_active_period("acct", &QuotaPlan::new(1_000))
            .unwrap();
        assert_eq!(period.status, PeriodStatus::Active);
        assert_eq!(period.tokens_limit, 1_000);
        assert_eq!(period.tokens_used, 0);
        assert_eq!(
            period.period_start,
            Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn second_call_returns_same_period() {
        let store = store();
        let plan = QuotaPlan::new(1_000);
        let first = store.get_or_create_active_period("acct", &plan).unwrap();
        // A different limit on a later call does not rewrite the open period.
        let second = store
            .get_or_create_active_period("acct", &QuotaPlan::new(5_000))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(store.period_history("acct").unwrap().len(), 1);
    }

    #[test]
    fn commit_accumulates_counters() {
        let store = store();
        let plan = QuotaPlan::new(1_000);
        store
            .commit_usage("acct", 100, UsageKind::report(), &plan)
            .unwrap();
        let totals = store
            .commit_usage("acct", 50, UsageKind::chat(), &plan)
            .unwrap();
        assert_eq!(totals.tokens_used, 150);
        assert_eq!(totals.reports_count, 1);
        assert_eq!(totals.chat_tokens_used, 50);
        assert_eq!(totals.remaining(), 850);
    }

    #[test]
    fn commit_rejects_negative_tokens() {
        let store = store();
        let result = store.commit_usage("acct", -5, UsageKind::default(), &QuotaPlan::new(10));
        assert!(matches!(result, Err(UsageError::InvalidAmount(-5))));
    }

    #[test]
    fn try_reserve_denies_when_short() {
        let store = store();
        let plan = QuotaPlan::new(1_000);
        store
            .commit_usage("acct", 900, UsageKind::default(), &plan)
            .unwrap();
        assert_eq!(store.try_reserve("acct", 100, &plan).unwrap(), Some(100));
        assert_eq!(store.try_reserve("acct", 101, &plan).unwrap(), None);
    }

    #[test]
    fn check_usage_is_read_only() {
        let store = store();
        let snap = store
            .check_usage_allowed("fresh", 10, &QuotaPlan::new(500), &UsageThresholds::default())
            .unwrap();
        assert!(snap.allowed);
        assert_eq!(snap.remaining, 500);
        assert!(store.period_history("fresh").unwrap().is_empty());
    }

    #[test]
    fn accounts_are_isolated() {
        let store = store();
        let plan = QuotaPlan::new(100);
        store
            .commit_usage("a", 100, UsageKind::default(), &plan)
            .unwrap();
        assert_eq!(store.try_reserve("b", 100, &plan).unwrap(), Some(100));
    }

    #[test]
    fn overflowing_commit_is_rejected_without_writing() {
        let store = store();
        let plan = QuotaPlan::new(3_000_000);
        store
            .commit_usage("acct", 2_900_000, UsageKind::report(), &plan)
            .unwrap();

        let err = store
            .commit_usage("acct", i64::MAX - 1_000, UsageKind::report(), &plan)
            .unwrap_err();
        assert!(matches!(err, UsageError::AmountOverflow { .. }));
        assert_eq!(err.error_code(), "TOKEN_AMOUNT_OVERFLOW");
        assert!(!err.is_retryable());

        let period = store.get_or_create_active_period("acct", &plan).unwrap();
        assert_eq!(period.tokens_used, 2_900_000);
        assert_eq!(period.reports_count, 1);
    }

    #[test]
    fn overflowed_usage_still_reads_as_exhausted() {
        let store = store();
        let plan = QuotaPlan::new(1_000);
        store
            .commit_usage("acct", i64::MAX, UsageKind::default(), &plan)
            .unwrap();
        assert_eq!(store.try_reserve("acct", 1, &plan).unwrap(), None);

        let snapshot = store
            .check_usage_allowed("acct", 0, &plan, &UsageThresholds::default())
            .unwrap();
        assert!(!snapshot.allowed);
        assert_eq!(snapshot.remaining, 0);
    }
}
