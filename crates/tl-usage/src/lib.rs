//! Token quota accounting for report generation: usage periods, job
//! reservations, usage commits and partial-failure settlement.

pub mod error;
pub mod job;
pub mod migrations;
pub mod period;
pub mod snapshot;
pub mod store;
pub mod tracker;

pub use error::UsageError;
pub use job::{JobStatus, ReportJob, StepRecord};
pub use period::{PeriodBounds, PeriodStatus, QuotaPlan, UsagePeriod};
pub use snapshot::{
    usage_percentage, UsageKind, UsageLevel, UsageSnapshot, UsageThresholds, UsageTotals,
};
pub use store::{Clock, JobCompletion, Settlement, SweepReport, UsageStore};
pub use tracker::UsageTracker;
