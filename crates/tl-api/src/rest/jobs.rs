use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tl_usage::{JobCompletion, JobStatus, ReportJob, Settlement, StepRecord};

use super::usage::{reject_negative, WriteResponse};
use crate::error::{ApiError, ApiErrorResponse};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateJobRequest {
    /// Generated when omitted.
    pub job_id: Option<String>,
    pub account_id: String,
    pub estimated_tokens: i64,
    pub plan: Option<String>,
    pub billing_anchor: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct StatusRequest {
    pub status: JobStatus,
}

#[derive(Deserialize)]
pub struct StepRequest {
    pub step: String,
    pub tokens: i64,
}

#[derive(Deserialize)]
pub struct CompleteRequest {
    pub tokens: Option<i64>,
    pub plan: Option<String>,
    pub billing_anchor: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct FailRequest {
    pub account_id: String,
    pub error: String,
    pub plan: Option<String>,
    pub billing_anchor: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct PlanQuery {
    pub plan: Option<String>,
    pub billing_anchor: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: ReportJob,
    pub steps: Vec<StepRecord>,
    pub steps_total: i64,
}

pub async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<ReportJob>), ApiErrorResponse> {
    reject_negative("estimated_tokens", req.estimated_tokens)?;
    let job_id = match req.job_id {
        Some(id) if id.trim().is_empty() => {
            return Err(ApiErrorResponse {
                status: StatusCode::BAD_REQUEST,
                error: ApiError::bad_request("job_id must not be empty"),
            });
        }
        Some(id) => id,
        None => uuid::Uuid::new_v4().to_string(),
    };
    let plan = state.plan_for(req.plan.as_deref(), req.billing_anchor)?;
    let job = state
        .tracker
        .reserve_job(&job_id, &req.account_id, req.estimated_tokens, &plan)?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobDetail>, ApiErrorResponse> {
    let job = state.tracker.get_job(&job_id)?;
    let steps = state.tracker.job_steps(&job_id)?;
    let steps_total = steps.iter().map(|s| s.tokens).sum();
    Ok(Json(JobDetail {
        job,
        steps,
        steps_total,
    }))
}

pub async fn set_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(req): Json<StatusRequest>,
) -> Result<Json<ReportJob>, ApiErrorResponse> {
    if req.status.is_terminal() {
        return Err(ApiErrorResponse {
            status: StatusCode::BAD_REQUEST,
            error: ApiError::bad_request(format!(
                "Use the complete, fail or cancel routes to move a job to {}",
                req.status
            )),
        });
    }
    let job = state.tracker.transition_job(&job_id, req.status)?;
    Ok(Json(job))
}

pub async fn record_step(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(req): Json<StepRequest>,
) -> Result<Json<StepRecord>, ApiErrorResponse> {
    reject_negative("tokens", req.tokens)?;
    if req.step.trim().is_empty() {
        return Err(ApiErrorResponse {
            status: StatusCode::BAD_REQUEST,
            error: ApiError::bad_request("step must not be empty"),
        });
    }
    let record = state.tracker.record_step(&job_id, &req.step, req.tokens)?;
    Ok(Json(record))
}

pub async fn complete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(req): Json<CompleteRequest>,
) -> Result<(StatusCode, Json<WriteResponse<JobCompletion>>), ApiErrorResponse> {
    if let Some(tokens) = req.tokens {
        reject_negative("tokens", tokens)?;
    }
    let plan = state.plan_for(req.plan.as_deref(), req.billing_anchor)?;
    let outcome = state
        .tracker
        .complete_job(&job_id, req.tokens, &plan)
        .await?;
    Ok(WriteResponse::from_outcome(outcome))
}

pub async fn fail_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(req): Json<FailRequest>,
) -> Result<(StatusCode, Json<WriteResponse<Settlement>>), ApiErrorResponse> {
    let plan = state.plan_for(req.plan.as_deref(), req.billing_anchor)?;
    let outcome = state
        .tracker
        .settle_partial_failure(&job_id, &req.account_id, &req.error, &plan)
        .await?;
    Ok(WriteResponse::from_outcome(outcome))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<PlanQuery>,
) -> Result<(StatusCode, Json<WriteResponse<Settlement>>), ApiErrorResponse> {
    let plan = state.plan_for(query.plan.as_deref(), query.billing_anchor)?;
    let outcome = state.tracker.cancel_job(&job_id, &plan).await?;
    Ok(WriteResponse::from_outcome(outcome))
}
