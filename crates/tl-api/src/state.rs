use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tl_config::DaemonConfig;
use tl_usage::{QuotaPlan, UsageStore, UsageThresholds, UsageTracker};

use crate::auth::hash_token;
use crate::error::{ApiError, ApiErrorResponse};

#[derive(Clone)]
pub struct AppState {
    pub config: DaemonConfig,
    pub tracker: Arc<UsageTracker>,
    pub api_token_hash: Option<String>,
    pub version: &'static str,
}

impl AppState {
    pub fn new(config: DaemonConfig) -> anyhow::Result<Self> {
        let db_path = config.database_path()?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Arc::new(UsageStore::open(&db_path)?);
        tracing::info!(path = %db_path.display(), "Opened usage store");
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: DaemonConfig, store: Arc<UsageStore>) -> Self {
        let thresholds = UsageThresholds {
            warning_percent: config.thresholds.warning_percent,
            critical_percent: config.thresholds.critical_percent,
        };
        let tracker = Arc::new(UsageTracker::new(store, thresholds));
        let api_token_hash = config.api_token.as_deref().map(hash_token);

        Self {
            config,
            tracker,
            api_token_hash,
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Quota parameters for a plan tier, or for the default tier when none
    /// is given. Tier names not listed in the config are rejected.
    pub fn plan_for(
        &self,
        tier: Option<&str>,
        billing_anchor: Option<DateTime<Utc>>,
    ) -> Result<QuotaPlan, ApiErrorResponse> {
        let Some(limit) = self.config.plans.limit_for(tier) else {
            let tier = tier.unwrap_or_default();
            tracing::warn!(tier, "Rejected request for an unknown plan tier");
            return Err(ApiErrorResponse {
                status: StatusCode::BAD_REQUEST,
                error: ApiError::new("UNKNOWN_PLAN", format!("Unknown plan tier: {tier}")),
            });
        };
        let plan = QuotaPlan::new(limit);
        Ok(match billing_anchor {
            Some(anchor) => plan.anchored_at(anchor),
            None => plan,
        })
    }

    /// The default tier's calendar-month plan, used by the sweep.
    pub fn default_plan(&self) -> QuotaPlan {
        // A validated config always lists its default tier.
        QuotaPlan::new(self.config.plans.limit_for(None).unwrap_or(0))
    }
}
