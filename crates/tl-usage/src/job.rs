use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a report-generation job as seen by the accounting engine.
///
/// `Pending -> Processing -> {Complete | Failed | Cancelled}`, with an
/// optional `Clarifying` detour between `Pending` and `Processing`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Clarifying,
    Complete,
    Failed,
    Cancelled,
}

/// SQL list of the statuses whose reservations still hold quota.
pub(crate) const IN_FLIGHT_SQL: &str = "('pending', 'processing', 'clarifying')";

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Clarifying,
        JobStatus::Complete,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Clarifying => "clarifying",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    pub fn is_in_flight(&self) -> bool {
        match self {
            JobStatus::Pending | JobStatus::Processing | JobStatus::Clarifying => true,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_in_flight()
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Processing)
            | (JobStatus::Pending, JobStatus::Clarifying)
            | (JobStatus::Pending, JobStatus::Failed)
            | (JobStatus::Pending, JobStatus::Cancelled) => true,
            (JobStatus::Clarifying, JobStatus::Processing)
            | (JobStatus::Clarifying, JobStatus::Failed)
            | (JobStatus::Clarifying, JobStatus::Cancelled) => true,
            (JobStatus::Processing, JobStatus::Complete)
            | (JobStatus::Processing, JobStatus::Failed)
            | (JobStatus::Processing, JobStatus::Cancelled) => true,
            (JobStatus::Pending, _)
            | (JobStatus::Clarifying, _)
            | (JobStatus::Processing, _)
            | (JobStatus::Complete, _)
            | (JobStatus::Failed, _)
            | (JobStatus::Cancelled, _) => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportJob {
    pub id: String,
    pub account_id: String,
    pub status: JobStatus,
    pub tokens_reserved: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Token count persisted by one finished step of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub step: String,
    pub tokens: i64,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_roundtrip_covers_every_variant() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("paused"), None);
    }

    #[test]
    fn in_flight_set_matches_sql_fragment() {
        for status in JobStatus::ALL {
            let quoted = format!("'{}'", status.as_str());
            assert_eq!(IN_FLIGHT_SQL.contains(&quoted), status.is_in_flight());
        }
    }

    #[test]
    fn clarifying_detour_is_allowed() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Clarifying));
        assert!(JobStatus::Clarifying.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Clarifying.can_transition_to(JobStatus::Complete));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in [JobStatus::Complete, JobStatus::Failed, JobStatus::Cancelled] {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn only_processing_completes() {
        for from in JobStatus::ALL {
            assert_eq!(
                from.can_transition_to(JobStatus::Complete),
                from == JobStatus::Processing
            );
        }
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_value(JobStatus::Clarifying).unwrap();
        assert_eq!(json, "clarifying");
    }
}
