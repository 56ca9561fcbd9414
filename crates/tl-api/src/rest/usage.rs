use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tl_usage::{UsageKind, UsagePeriod, UsageSnapshot, UsageTotals};

use crate::error::{ApiError, ApiErrorResponse};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct UsageQuery {
    #[serde(default)]
    pub estimated_tokens: i64,
    pub plan: Option<String>,
    pub billing_anchor: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct CommitUsageRequest {
    pub tokens: i64,
    #[serde(default)]
    pub is_report: bool,
    #[serde(default)]
    pub is_chat: bool,
    pub plan: Option<String>,
    pub billing_anchor: Option<DateTime<Utc>>,
}

/// Body of every write route. `applied` is false when the store stayed
/// unreachable through all retries and the write was dropped.
#[derive(Serialize)]
pub struct WriteResponse<T> {
    pub applied: bool,
    pub result: Option<T>,
}

impl<T> WriteResponse<T> {
    pub fn from_outcome(outcome: Option<T>) -> (StatusCode, Json<Self>) {
        let status = if outcome.is_some() {
            StatusCode::OK
        } else {
            StatusCode::ACCEPTED
        };
        (
            status,
            Json(Self {
                applied: outcome.is_some(),
                result: outcome,
            }),
        )
    }
}

pub(crate) fn reject_negative(field: &str, value: i64) -> Result<(), ApiErrorResponse> {
    if value < 0 {
        return Err(ApiErrorResponse {
            status: StatusCode::BAD_REQUEST,
            error: ApiError::bad_request(format!("{field} must not be negative")),
        });
    }
    Ok(())
}

pub async fn get_usage(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<UsageSnapshot>, ApiErrorResponse> {
    reject_negative("estimated_tokens", query.estimated_tokens)?;
    let plan = state.plan_for(query.plan.as_deref(), query.billing_anchor)?;
    let snapshot = state
        .tracker
        .check_usage_allowed(&account_id, query.estimated_tokens, &plan);
    Ok(Json(snapshot))
}

pub async fn list_periods(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<Vec<UsagePeriod>>, ApiErrorResponse> {
    let periods = state.tracker.period_history(&account_id)?;
    Ok(Json(periods))
}

pub async fn commit_usage(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(req): Json<CommitUsageRequest>,
) -> Result<(StatusCode, Json<WriteResponse<UsageTotals>>), ApiErrorResponse> {
    reject_negative("tokens", req.tokens)?;
    let plan = state.plan_for(req.plan.as_deref(), req.billing_anchor)?;
    let kind = UsageKind {
        is_report: req.is_report,
        is_chat: req.is_chat,
    };
    let totals = state
        .tracker
        .commit_usage(&account_id, req.tokens, kind, &plan)
        .await?;
    Ok(WriteResponse::from_outcome(totals))
}
