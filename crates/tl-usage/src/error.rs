use crate::job::JobStatus;

#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("Token quota exceeded: {requested} tokens requested, {available} available")]
    QuotaExceeded { available: i64, requested: i64 },
    #[error("Job not found: {0}")]
    JobNotFound(String),
    #[error("Job already exists: {0}")]
    DuplicateJob(String),
    #[error("Job {job_id} belongs to a different account")]
    AccountMismatch { job_id: String },
    #[error("Invalid job transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("Job {job_id} is no longer in flight ({status})")]
    JobNotInFlight { job_id: String, status: JobStatus },
    #[error("Token amount must not be negative: {0}")]
    InvalidAmount(i64),
    #[error("Adding {tokens} tokens would overflow the usage counters of period {period_id}")]
    AmountOverflow { period_id: i64, tokens: i64 },
    #[error("Usage store lock poisoned")]
    Poisoned,
    #[error("Usage store error: {0}")]
    Store(#[from] rusqlite::Error),
}

impl UsageError {
    pub fn error_code(&self) -> &'static str {
        match self {
            UsageError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            UsageError::JobNotFound(_) => "JOB_NOT_FOUND",
            UsageError::DuplicateJob(_) => "JOB_ALREADY_EXISTS",
            UsageError::AccountMismatch { .. } => "JOB_ACCOUNT_MISMATCH",
            UsageError::InvalidTransition { .. } => "JOB_INVALID_TRANSITION",
            UsageError::JobNotInFlight { .. } => "JOB_NOT_IN_FLIGHT",
            UsageError::InvalidAmount(_) => "INVALID_TOKEN_AMOUNT",
            UsageError::AmountOverflow { .. } => "TOKEN_AMOUNT_OVERFLOW",
            UsageError::Poisoned | UsageError::Store(_) => "STORE_UNAVAILABLE",
        }
    }

    /// Store failures are transient from the caller's point of view; every
    /// other variant needs a different request to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UsageError::Store(_))
    }
}

pub(crate) fn ensure_amount(tokens: i64) -> Result<(), UsageError> {
    if tokens < 0 {
        return Err(UsageError::InvalidAmount(tokens));
    }
    Ok(())
}
