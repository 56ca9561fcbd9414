use std::sync::Arc;
use std::time::Duration;

use crate::error::UsageError;
use crate::job::{JobStatus, ReportJob, StepRecord};
use crate::period::{QuotaPlan, UsagePeriod};
use crate::snapshot::{UsageKind, UsageSnapshot, UsageThresholds, UsageTotals};
use crate::store::{JobCompletion, Settlement, SweepReport, UsageStore};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 10;

/// Failure policy on top of [`UsageStore`].
///
/// Admission fails closed, usage reads fail soft, and commits retry before
/// giving up. A commit that still fails is logged and reported as `None`
/// so the caller can finish notifying the user.
pub struct UsageTracker {
    store: Arc<UsageStore>,
    thresholds: UsageThresholds,
}

impl UsageTracker {
    pub fn new(store: Arc<UsageStore>, thresholds: UsageThresholds) -> Self {
        Self { store, thresholds }
    }

    pub fn store(&self) -> &Arc<UsageStore> {
        &self.store
    }

    pub fn thresholds(&self) -> &UsageThresholds {
        &self.thresholds
    }

    pub fn check_usage_allowed(
        &self,
        account_id: &str,
        estimated_tokens: i64,
        plan: &QuotaPlan,
    ) -> UsageSnapshot {
        match self
            .store
            .check_usage_allowed(account_id, estimated_tokens, plan, &self.thresholds)
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(
                    account_id,
                    error = %e,
                    "Usage query failed; returning degraded snapshot"
                );
                let period_end = plan.bounds_at(self.store.now()).end;
                UsageSnapshot::unavailable(plan.tokens_limit, period_end)
            }
        }
    }

    pub fn try_reserve(
        &self,
        account_id: &str,
        estimated_tokens: i64,
        plan: &QuotaPlan,
    ) -> Option<i64> {
        match self.store.try_reserve(account_id, estimated_tokens, plan) {
            Ok(reserved) => reserved,
            Err(e) => {
                tracing::error!(account_id, error = %e, "Admission check failed; denying");
                None
            }
        }
    }

    /// Any error, including an unreachable store, denies the job.
    pub fn reserve_job(
        &self,
        job_id: &str,
        account_id: &str,
        estimated_tokens: i64,
        plan: &QuotaPlan,
    ) -> Result<ReportJob, UsageError> {
        self.store
            .reserve_job(job_id, account_id, estimated_tokens, plan)
            .inspect_err(|e| {
                if e.is_retryable() {
                    tracing::error!(
                        account_id,
                        job_id,
                        error = %e,
                        "Admission check failed; denying"
                    );
                }
            })
    }

    pub fn record_step(
        &self,
        job_id: &str,
        step: &str,
        tokens: i64,
    ) -> Result<StepRecord, UsageError> {
        self.store.record_step(job_id, step, tokens)
    }

    pub fn transition_job(&self, job_id: &str, to: JobStatus) -> Result<ReportJob, UsageError> {
        self.store.transition_job(job_id, to)
    }

    pub fn get_job(&self, job_id: &str) -> Result<ReportJob, UsageError> {
        self.store.get_job(job_id)
    }

    pub fn job_steps(&self, job_id: &str) -> Result<Vec<StepRecord>, UsageError> {
        self.store.job_steps(job_id)
    }

    pub fn period_history(&self, account_id: &str) -> Result<Vec<UsagePeriod>, UsageError> {
        self.store.period_history(account_id)
    }

    pub fn reconcile(
        &self,
        stale_after: Option<chrono::Duration>,
        plan: &QuotaPlan,
    ) -> Result<SweepReport, UsageError> {
        self.store.reconcile(stale_after, plan)
    }

    pub async fn commit_usage(
        &self,
        account_id: &str,
        tokens: i64,
        kind: UsageKind,
        plan: &QuotaPlan,
    ) -> Result<Option<UsageTotals>, UsageError> {
        with_retry("commit_usage", account_id, tokens, || {
            self.store.commit_usage(account_id, tokens, kind, plan)
        })
        .await
    }

    pub async fn complete_job(
        &self,
        job_id: &str,
        tokens: Option<i64>,
        plan: &QuotaPlan,
    ) -> Result<Option<JobCompletion>, UsageError> {
        with_retry("complete_job", job_id, tokens.unwrap_or_default(), || {
            self.store.complete_job(job_id, tokens, plan)
        })
        .await
    }

    pub async fn settle_partial_failure(
        &self,
        job_id: &str,
        account_id: &str,
        error_summary: &str,
        plan: &QuotaPlan,
    ) -> Result<Option<Settlement>, UsageError> {
        with_retry("settle_partial_failure", job_id, 0, || {
            self.store
                .settle_partial_failure(job_id, account_id, error_summary, plan)
        })
        .await
    }

    pub async fn cancel_job(
        &self,
        job_id: &str,
        plan: &QuotaPlan,
    ) -> Result<Option<Settlement>, UsageError> {
        with_retry("cancel_job", job_id, 0, || self.store.cancel_job(job_id, plan)).await
    }
}

/// Retries store failures with exponential backoff. Non-retryable errors
/// return immediately; exhausted retries are logged and yield `Ok(None)`.
async fn with_retry<T>(
    operation: &str,
    subject: &str,
    tokens: i64,
    mut op: impl FnMut() -> Result<T, UsageError>,
) -> Result<Option<T>, UsageError> {
    let mut last_error = None;
    for attempt in 0..MAX_RETRIES {
        match op() {
            Ok(value) => return Ok(Some(value)),
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    operation,
                    subject,
                    attempt,
                    error = %e,
                    "Usage write failed; retrying"
                );
                last_error = Some(e);
                if attempt < MAX_RETRIES - 1 {
                    tokio::time::sleep(Duration::from_millis(INITIAL_BACKOFF_MS * (1 << attempt)))
                        .await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    tracing::error!(
        operation,
        subject,
        tokens,
        error = ?last_error,
        "Usage write dropped after {} attempts; account may be under-billed",
        MAX_RETRIES
    );
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tracker() -> UsageTracker {
        UsageTracker::new(
            Arc::new(UsageStore::in_memory().unwrap()),
            UsageThresholds::default(),
        )
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", "subject", 10, || {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(UsageError::Store(rusqlite::Error::QueryReturnedNoRows))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_gives_up_without_error() {
        let calls = AtomicU32::new(0);
        let result: Option<()> = with_retry("test", "subject", 10, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(UsageError::Store(rusqlite::Error::QueryReturnedNoRows))
        })
        .await
        .unwrap();
        assert_eq!(result, None);
        assert_eq!(calls.load(Ordering::SeqCst), MAX_RETRIES);
    }

    #[tokio::test]
    async fn caller_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<Option<()>, _> = with_retry("test", "subject", 10, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(UsageError::JobNotFound("job".into()))
        })
        .await;
        assert!(matches!(result, Err(UsageError::JobNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn commit_then_query_reflects_usage() {
        let tracker = tracker();
        let plan = QuotaPlan::new(1_000);
        let totals = tracker
            .commit_usage("acct", 800, UsageKind::report(), &plan)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(totals.tokens_used, 800);

        let snapshot = tracker.check_usage_allowed("acct", 100, &plan);
        assert!(snapshot.allowed);
        assert_eq!(snapshot.percentage, 80.0);
        assert_eq!(snapshot.level, crate::UsageLevel::Warning);
        assert!(!snapshot.degraded);
    }

    #[test]
    fn invalid_estimate_fails_closed() {
        let tracker = tracker();
        assert_eq!(tracker.try_reserve("acct", -1, &QuotaPlan::new(100)), None);
    }

    #[test]
    fn invalid_query_fails_soft() {
        let tracker = tracker();
        let snapshot = tracker.check_usage_allowed("acct", -1, &QuotaPlan::new(100));
        assert!(snapshot.degraded);
        assert!(!snapshot.allowed);
    }

    #[test]
    fn degraded_snapshot_uses_store_clock() {
        let at = chrono::Utc.with_ymd_and_hms(2031, 2, 10, 9, 0, 0).unwrap();
        let store = UsageStore::in_memory()
            .unwrap()
            .with_clock(Arc::new(move || at));
        let tracker = UsageTracker::new(Arc::new(store), UsageThresholds::default());

        let snapshot = tracker.check_usage_allowed("acct", -1, &QuotaPlan::new(100));
        assert!(snapshot.degraded);
        assert_eq!(
            snapshot.period_end,
            chrono::Utc.with_ymd_and_hms(2031, 3, 1, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn overflowing_commit_is_reported_not_dropped() {
        let tracker = tracker();
        let plan = QuotaPlan::new(3_000_000);
        tracker
            .commit_usage("acct", 2_900_000, UsageKind::report(), &plan)
            .await
            .unwrap()
            .unwrap();

        let result = tracker
            .commit_usage("acct", i64::MAX - 1_000, UsageKind::report(), &plan)
            .await;
        assert!(matches!(result, Err(UsageError::AmountOverflow { .. })));
    }
}
