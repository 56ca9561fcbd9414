use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;

use super::{
    available_tokens, ensure_active_period, increment_period, unknown_text, UsageStore,
};
use crate::error::{ensure_amount, UsageError};
use crate::job::{JobStatus, ReportJob, StepRecord, IN_FLIGHT_SQL};
use crate::period::{from_sql_ts, to_sql_ts, QuotaPlan};
use crate::snapshot::{UsageKind, UsageTotals};

/// Shown to end users when a job fails. The underlying error stays in
/// `failure_detail` and the logs.
pub const FAILURE_MESSAGE: &str =
    "Report generation failed. You were only charged for the steps that completed.";

pub const STALE_JOB_MESSAGE: &str =
    "Report generation stopped responding. You were only charged for the steps that completed.";

const JOB_COLUMNS: &str =
    "id, account_id, status, tokens_reserved, error_message, created_at, updated_at, completed_at";

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobCompletion {
    Completed { billed: i64, totals: UsageTotals },
    /// The job was not processing, so nothing was billed or released.
    NotProcessing { status: JobStatus },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Settlement {
    Settled {
        status: JobStatus,
        billed: i64,
        totals: Option<UsageTotals>,
    },
    /// Another terminal transition already happened; this call changed
    /// nothing.
    AlreadySettled { status: JobStatus },
}

impl Settlement {
    pub fn billed(&self) -> i64 {
        match self {
            Settlement::Settled { billed, .. } => *billed,
            Settlement::AlreadySettled { .. } => 0,
        }
    }
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<ReportJob> {
    let status: String = row.get(2)?;
    let completed_at: Option<String> = row.get(7)?;
    Ok(ReportJob {
        id: row.get(0)?,
        account_id: row.get(1)?,
        status: JobStatus::parse(&status).ok_or_else(|| unknown_text(2, &status))?,
        tokens_reserved: row.get(3)?,
        error_message: row.get(4)?,
        created_at: from_sql_ts(5, &row.get::<_, String>(5)?)?,
        updated_at: from_sql_ts(6, &row.get::<_, String>(6)?)?,
        completed_at: completed_at
            .as_deref()
            .map(|raw| from_sql_ts(7, raw))
            .transpose()?,
    })
}

fn load_job(conn: &Connection, job_id: &str) -> Result<ReportJob, UsageError> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM report_jobs WHERE id = ?1"),
        [job_id],
        job_from_row,
    )
    .optional()?
    .ok_or_else(|| UsageError::JobNotFound(job_id.to_string()))
}

fn step_total(conn: &Connection, job_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(SUM(tokens), 0) FROM report_job_steps WHERE job_id = ?1",
        [job_id],
        |row| row.get(0),
    )
}

impl UsageStore {
    /// Admission and job creation under one write lock, so no other
    /// reservation can slip in between the check and the insert.
    pub fn reserve_job(
        &self,
        job_id: &str,
        account_id: &str,
        estimated_tokens: i64,
        plan: &QuotaPlan,
    ) -> Result<ReportJob, UsageError> {
        ensure_amount(estimated_tokens)?;
        let now = self.now();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM report_jobs WHERE id = ?1)",
            [job_id],
            |row| row.get(0),
        )?;
        if exists {
            return Err(UsageError::DuplicateJob(job_id.to_string()));
        }

        let available = available_tokens(&tx, account_id, plan, now)?;
        if available < estimated_tokens {
            tracing::info!(
                account_id,
                job_id,
                available,
                requested = estimated_tokens,
                "Reservation denied"
            );
            return Err(UsageError::QuotaExceeded {
                available: available.max(0),
                requested: estimated_tokens,
            });
        }

        let now_ts = to_sql_ts(now);
        tx.execute(
            "INSERT INTO report_jobs
                (id, account_id, status, tokens_reserved, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                job_id,
                account_id,
                JobStatus::Pending.as_str(),
                estimated_tokens,
                now_ts
            ],
        )?;
        tx.commit()?;

        tracing::info!(account_id, job_id, reserved = estimated_tokens, "Reserved tokens for job");
        Ok(ReportJob {
            id: job_id.to_string(),
            account_id: account_id.to_string(),
            status: JobStatus::Pending,
            tokens_reserved: estimated_tokens,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    pub fn get_job(&self, job_id: &str) -> Result<ReportJob, UsageError> {
        let conn = self.lock()?;
        load_job(&conn, job_id)
    }

    pub fn job_steps(&self, job_id: &str) -> Result<Vec<StepRecord>, UsageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT step, tokens, recorded_at FROM report_job_steps
             WHERE job_id = ?1 ORDER BY recorded_at, step",
        )?;
        let rows = stmt
            .query_map([job_id], |row| {
                Ok(StepRecord {
                    step: row.get(0)?,
                    tokens: row.get(1)?,
                    recorded_at: from_sql_ts(2, &row.get::<_, String>(2)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Persists the token count of a finished step. Re-recording a step
    /// replaces its count, so a retried step is billed once.
    pub fn record_step(
        &self,
        job_id: &str,
        step: &str,
        tokens: i64,
    ) -> Result<StepRecord, UsageError> {
        ensure_amount(tokens)?;
        let now = self.now();
        let now_ts = to_sql_ts(now);
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job = load_job(&tx, job_id)?;
        if !job.status.is_in_flight() {
            return Err(UsageError::JobNotInFlight {
                job_id: job_id.to_string(),
                status: job.status,
            });
        }

        tx.execute(
            "INSERT INTO report_job_steps (job_id, step, tokens, recorded_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (job_id, step) DO UPDATE
             SET tokens = excluded.tokens, recorded_at = excluded.recorded_at",
            params![job_id, step, tokens, now_ts],
        )?;
        tx.execute(
            "UPDATE report_jobs SET updated_at = ?2 WHERE id = ?1",
            params![job_id, now_ts],
        )?;
        tx.commit()?;

        tracing::debug!(job_id, step, tokens, "Recorded step tokens");
        Ok(StepRecord {
            step: step.to_string(),
            tokens,
            recorded_at: now,
        })
    }

    /// Moves a job between in-flight states. Terminal states are reached
    /// only through [`complete_job`](Self::complete_job),
    /// [`settle_partial_failure`](Self::settle_partial_failure) and
    /// [`cancel_job`](Self::cancel_job), which also settle the reservation.
    pub fn transition_job(&self, job_id: &str, to: JobStatus) -> Result<ReportJob, UsageError> {
        let now = self.now();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job = load_job(&tx, job_id)?;
        if to.is_terminal() || !job.status.can_transition_to(to) {
            return Err(UsageError::InvalidTransition {
                from: job.status,
                to,
            });
        }

        tx.execute(
            "UPDATE report_jobs SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = ?4",
            params![job_id, to.as_str(), to_sql_ts(now), job.status.as_str()],
        )?;
        tx.commit()?;

        tracing::debug!(job_id, from = %job.status, to = %to, "Job transitioned");
        Ok(ReportJob {
            status: to,
            updated_at: now,
            ..job
        })
    }

    /// Marks a processing job complete, releases its reservation and bills
    /// the account in one transaction. Bills `tokens` when given, otherwise
    /// the sum of the recorded steps.
    pub fn complete_job(
        &self,
        job_id: &str,
        tokens: Option<i64>,
        plan: &QuotaPlan,
    ) -> Result<JobCompletion, UsageError> {
        if let Some(tokens) = tokens {
            ensure_amount(tokens)?;
        }
        let now = self.now();
        let now_ts = to_sql_ts(now);
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job = load_job(&tx, job_id)?;
        let changed = tx.execute(
            "UPDATE report_jobs
             SET status = 'complete', tokens_reserved = 0, completed_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'processing'",
            params![job_id, now_ts],
        )?;
        if changed == 0 {
            tracing::debug!(job_id, status = %job.status, "Completion ignored; job not processing");
            return Ok(JobCompletion::NotProcessing { status: job.status });
        }

        let billed = match tokens {
            Some(tokens) => tokens,
            None => step_total(&tx, job_id)?,
        };
        let period = ensure_active_period(&tx, &job.account_id, plan, now)?;
        let totals = increment_period(&tx, period.id, billed, UsageKind::report(), now)?;
        tx.commit()?;

        tracing::info!(
            account_id = %job.account_id,
            job_id,
            billed,
            released = job.tokens_reserved,
            "Job completed"
        );
        Ok(JobCompletion::Completed { billed, totals })
    }

    /// Terminates an in-flight job as failed, billing only the steps that
    /// durably recorded their tokens. A second call is a no-op.
    pub fn settle_partial_failure(
        &self,
        job_id: &str,
        account_id: &str,
        error_summary: &str,
        plan: &QuotaPlan,
    ) -> Result<Settlement, UsageError> {
        self.terminate(
            job_id,
            Some(account_id),
            JobStatus::Failed,
            Some(FAILURE_MESSAGE),
            Some(error_summary),
            plan,
        )
    }

    /// Cancels an in-flight job. Steps that already finished are billed the
    /// same way as on failure.
    pub fn cancel_job(&self, job_id: &str, plan: &QuotaPlan) -> Result<Settlement, UsageError> {
        self.terminate(job_id, None, JobStatus::Cancelled, None, None, plan)
    }

    pub(crate) fn terminate(
        &self,
        job_id: &str,
        expected_account: Option<&str>,
        target: JobStatus,
        user_message: Option<&str>,
        detail: Option<&str>,
        plan: &QuotaPlan,
    ) -> Result<Settlement, UsageError> {
        let now = self.now();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job = load_job(&tx, job_id)?;
        if let Some(account_id) = expected_account {
            if job.account_id != account_id {
                return Err(UsageError::AccountMismatch {
                    job_id: job_id.to_string(),
                });
            }
        }

        let changed = transition_to_terminal(&tx, job_id, target, user_message, detail, now)?;
        if changed == 0 {
            tracing::debug!(job_id, status = %job.status, "Job already settled");
            return Ok(Settlement::AlreadySettled { status: job.status });
        }

        let billed = step_total(&tx, job_id)?;
        let totals = if billed > 0 {
            let period = ensure_active_period(&tx, &job.account_id, plan, now)?;
            Some(increment_period(&tx, period.id, billed, UsageKind::default(), now)?)
        } else {
            None
        };
        tx.commit()?;

        match target {
            JobStatus::Failed => tracing::warn!(
                account_id = %job.account_id,
                job_id,
                billed,
                released = job.tokens_reserved,
                error = detail.unwrap_or_default(),
                "Job failed; billed completed steps"
            ),
            JobStatus::Cancelled => tracing::info!(
                account_id = %job.account_id,
                job_id,
                billed,
                released = job.tokens_reserved,
                "Job cancelled"
            ),
            JobStatus::Pending
            | JobStatus::Processing
            | JobStatus::Clarifying
            | JobStatus::Complete => {}
        }

        Ok(Settlement::Settled {
            status: target,
            billed,
            totals,
        })
    }
}

/// Conditional in-flight -> terminal update. Returns the number of rows
/// changed, zero when the job already left the in-flight set.
fn transition_to_terminal(
    conn: &Connection,
    job_id: &str,
    target: JobStatus,
    user_message: Option<&str>,
    detail: Option<&str>,
    now: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    let now_ts = to_sql_ts(now);
    conn.execute(
        &format!(
            "UPDATE report_jobs
             SET status = ?2, tokens_reserved = 0, error_message = ?3, failure_detail = ?4,
                 completed_at = ?5, updated_at = ?5
             WHERE id = ?1 AND status IN {IN_FLIGHT_SQL}"
        ),
        params![job_id, target.as_str(), user_message, detail, now_ts],
    )
}
