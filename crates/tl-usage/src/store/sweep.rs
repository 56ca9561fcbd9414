use chrono::Duration;
use rusqlite::{params, TransactionBehavior};
use serde::Serialize;

use super::{Settlement, UsageStore, STALE_JOB_MESSAGE};
use crate::error::UsageError;
use crate::job::{JobStatus, IN_FLIGHT_SQL};
use crate::period::{to_sql_ts, QuotaPlan};

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    /// Terminal jobs that still held a reservation.
    pub leaked_released: usize,
    /// Pending or processing jobs with no progress inside the age limit,
    /// now failed. Always zero unless stale settlement was requested.
    pub stale_settled: usize,
}

/// In-flight statuses a worker drives. `clarifying` waits on the user and
/// is never treated as stale.
const WORKER_OWNED_SQL: &str = "('pending', 'processing')";

impl UsageStore {
    /// Repairs reservations that outlived their job.
    ///
    /// Terminal jobs never hold quota, so any leftover `tokens_reserved` on
    /// them is zeroed. With `stale_after` set, pending or processing jobs
    /// whose last update is older than that are also settled as failed,
    /// billing recorded steps. `plan` only matters for accounts whose period
    /// has to be reopened.
    pub fn reconcile(
        &self,
        stale_after: Option<Duration>,
        plan: &QuotaPlan,
    ) -> Result<SweepReport, UsageError> {
        let now = self.now();
        let cutoff = stale_after.map(|age| to_sql_ts(now - age));

        let (leaked_released, stale_jobs) = {
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let leaked = tx.execute(
                &format!(
                    "UPDATE report_jobs SET tokens_reserved = 0, updated_at = ?1
                     WHERE tokens_reserved > 0 AND status NOT IN {IN_FLIGHT_SQL}"
                ),
                params![to_sql_ts(now)],
            )?;
            let stale = match &cutoff {
                Some(cutoff) => {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT id FROM report_jobs
                         WHERE status IN {WORKER_OWNED_SQL} AND updated_at < ?1
                         ORDER BY updated_at"
                    ))?;
                    let ids = stmt
                        .query_map([cutoff], |row| row.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    ids
                }
                None => Vec::new(),
            };
            tx.commit()?;
            (leaked, stale)
        };

        if leaked_released > 0 {
            tracing::warn!(count = leaked_released, "Released leaked job reservations");
        }

        let mut stale_settled = 0;
        for job_id in stale_jobs {
            let detail = format!(
                "no progress since before {}",
                cutoff.as_deref().unwrap_or_default()
            );
            let settlement = self.terminate(
                &job_id,
                None,
                JobStatus::Failed,
                Some(STALE_JOB_MESSAGE),
                Some(&detail),
                plan,
            )?;
            if let Settlement::Settled { .. } = settlement {
                stale_settled += 1;
            }
        }

        Ok(SweepReport {
            leaked_released,
            stale_settled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::{Arc, Mutex};

    fn store_at(now: Arc<Mutex<DateTime<Utc>>>) -> UsageStore {
        UsageStore::in_memory()
            .unwrap()
            .with_clock(Arc::new(move || *now.lock().unwrap()))
    }

    #[test]
    fn releases_reservation_left_on_terminal_job() {
        let now = Arc::new(Mutex::new(Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()));
        let store = store_at(now);
        let plan = QuotaPlan::new(1_000);
        store.reserve_job("job-1", "acct", 300, &plan).unwrap();
        // Simulate a writer that marked the job complete without releasing.
        store
            .lock()
            .unwrap()
            .execute("UPDATE report_jobs SET status = 'complete' WHERE id = 'job-1'", [])
            .unwrap();

        let report = store.reconcile(Some(Duration::hours(2)), &plan).unwrap();
        assert_eq!(report.leaked_released, 1);
        assert_eq!(store.get_job("job-1").unwrap().tokens_reserved, 0);
    }

    #[test]
    fn settles_stale_in_flight_jobs() {
        let now = Arc::new(Mutex::new(Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()));
        let store = store_at(now.clone());
        let plan = QuotaPlan::new(1_000);
        store.reserve_job("stale", "acct", 300, &plan).unwrap();
        store.transition_job("stale", JobStatus::Processing).unwrap();
        store.record_step("stale", "an0", 40).unwrap();

        *now.lock().unwrap() = Utc.with_ymd_and_hms(2026, 10, 16, 15, 0, 0).unwrap();
        store.reserve_job("fresh", "acct", 100, &plan).unwrap();

        let report = store.reconcile(Some(Duration::hours(2)), &plan).unwrap();
        assert_eq!(
            report,
            SweepReport {
                leaked_released: 0,
                stale_settled: 1
            }
        );

        let stale = store.get_job("stale").unwrap();
        assert_eq!(stale.status, JobStatus::Failed);
        assert_eq!(stale.error_message.as_deref(), Some(STALE_JOB_MESSAGE));
        assert_eq!(store.get_job("fresh").unwrap().status, JobStatus::Pending);

        let period = store.get_or_create_active_period("acct", &plan).unwrap();
        assert_eq!(period.tokens_used, 40);
    }

    #[test]
    fn clean_ledger_reports_nothing() {
        let now = Arc::new(Mutex::new(Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()));
        let store = store_at(now);
        let report = store
            .reconcile(Some(Duration::hours(2)), &QuotaPlan::new(1_000))
            .unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[test]
    fn idle_clarifying_job_survives_sweep() {
        let now = Arc::new(Mutex::new(Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()));
        let store = store_at(now.clone());
        let plan = QuotaPlan::new(1_000);
        store.reserve_job("waiting", "acct", 300, &plan).unwrap();
        store.transition_job("waiting", JobStatus::Clarifying).unwrap();

        *now.lock().unwrap() = Utc.with_ymd_and_hms(2026, 10, 16, 15, 0, 0).unwrap();
        let report = store.reconcile(Some(Duration::hours(2)), &plan).unwrap();
        assert_eq!(report, SweepReport::default());

        let job = store.get_job("waiting").unwrap();
        assert_eq!(job.status, JobStatus::Clarifying);
        assert_eq!(job.tokens_reserved, 300);
        assert!(job.error_message.is_none());
    }

    #[test]
    fn without_stale_age_only_leaks_are_repaired() {
        let now = Arc::new(Mutex::new(Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()));
        let store = store_at(now.clone());
        let plan = QuotaPlan::new(1_000);
        store.reserve_job("slow", "acct", 200, &plan).unwrap();
        store.transition_job("slow", JobStatus::Processing).unwrap();

        *now.lock().unwrap() = Utc.with_ymd_and_hms(2026, 10, 20, 12, 0, 0).unwrap();
        let report = store.reconcile(None, &plan).unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(store.get_job("slow").unwrap().status, JobStatus::Processing);
    }
}
