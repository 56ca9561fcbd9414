//! Shared helpers used by the `tallyd` daemon binary.

use std::sync::Arc;
use std::time::Duration;

use tl_config::SweepConfig;
use tl_usage::{QuotaPlan, SweepReport, UsageError, UsagePeriod, UsageSnapshot, UsageTracker};
use tokio::task::JoinHandle;

/// Build-time daemon version string.
///
/// When `TALLYD_VERSION` is provided in the build environment (for example
/// by CI release workflows), that value is used. Otherwise we fall back to the
/// crate package version.
pub const DAEMON_VERSION: &str = match option_env!("TALLYD_VERSION") {
    Some(version) => version,
    None => env!("CARGO_PKG_VERSION"),
};

// ---------------------------------------------------------------------------
// Reconciliation sweep
// ---------------------------------------------------------------------------

/// Runs one reconciliation pass on a blocking thread.
pub async fn run_sweep(
    tracker: Arc<UsageTracker>,
    stale_after: Option<chrono::Duration>,
    plan: QuotaPlan,
) -> anyhow::Result<SweepReport> {
    let report =
        tokio::task::spawn_blocking(move || tracker.reconcile(stale_after, &plan)).await??;
    Ok(report)
}

/// Starts the periodic sweep, or returns `None` when it is disabled.
pub fn spawn_sweeper(
    tracker: Arc<UsageTracker>,
    config: &SweepConfig,
    plan: QuotaPlan,
) -> Option<JoinHandle<()>> {
    if !config.enabled {
        tracing::info!("Reconciliation sweep disabled in config");
        return None;
    }

    let every = Duration::from_secs(config.interval_secs);
    let stale_after = stale_job_age(config);
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match run_sweep(tracker.clone(), stale_after, plan.clone()).await {
                Ok(report) if report.leaked_released > 0 || report.stale_settled > 0 => {
                    tracing::info!(
                        leaked_released = report.leaked_released,
                        stale_settled = report.stale_settled,
                        "Reconciliation sweep repaired reservations"
                    );
                }
                Ok(_) => tracing::debug!("Reconciliation sweep found nothing to repair"),
                Err(e) if sweep_error_is_transient(&e) => {
                    tracing::warn!(error = %e, "Reconciliation sweep failed; retrying next tick")
                }
                Err(e) => tracing::error!(error = %e, "Reconciliation sweep failed"),
            }
        }
    }))
}

const MAX_IN_FLIGHT_AGE_CAP_SECS: u64 = 365 * 24 * 60 * 60;

/// Age after which silent jobs are settled, or `None` when stale
/// settlement is off.
pub fn stale_job_age(config: &SweepConfig) -> Option<chrono::Duration> {
    if !config.settle_stale_jobs {
        return None;
    }
    let secs = config.max_in_flight_age_secs.min(MAX_IN_FLIGHT_AGE_CAP_SECS);
    Some(chrono::Duration::seconds(secs as i64))
}

/// Whether a sweep error is worth retrying on the next tick.
pub fn sweep_error_is_transient(err: &anyhow::Error) -> bool {
    err.downcast_ref::<UsageError>()
        .map(UsageError::is_retryable)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// CLI output
// ---------------------------------------------------------------------------

/// Human-readable summary of a usage snapshot for `tallyd usage`.
pub fn format_snapshot(account_id: &str, snapshot: &UsageSnapshot) -> String {
    let mut out = format!(
        "Account:   {account_id}\n\
         Used:      {} / {} tokens ({:.1}%)\n\
         Reserved:  {}\n\
         Remaining: {}\n\
         Reports:   {}\n\
         Chat:      {} tokens\n\
         Level:     {:?}\n\
         Resets:    {}\n\
         Allowed:   {}",
        snapshot.tokens_used,
        snapshot.tokens_limit,
        snapshot.percentage,
        snapshot.reserved,
        snapshot.remaining,
        snapshot.reports_count,
        snapshot.chat_tokens_used,
        snapshot.level,
        snapshot.period_end.format("%Y-%m-%d %H:%M UTC"),
        if snapshot.allowed { "yes" } else { "no" },
    );
    if snapshot.degraded {
        out.push_str("\n(usage store unavailable; values are a stand-in)");
    }
    out
}

/// One line per period, newest first, for `tallyd history`.
pub fn format_history(periods: &[UsagePeriod]) -> String {
    if periods.is_empty() {
        return "No usage periods recorded".to_string();
    }
    periods
        .iter()
        .map(|p| {
            format!(
                "{} .. {}  {:>9}  {:>12} / {:<12} reports={} chat={}",
                p.period_start.format("%Y-%m-%d"),
                p.period_end.format("%Y-%m-%d"),
                p.status.as_str(),
                p.tokens_used,
                p.tokens_limit,
                p.reports_count,
                p.chat_tokens_used,
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
