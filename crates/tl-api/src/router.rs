use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::auth::service_auth;
use crate::rest::{health, jobs, usage};
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    // Public routes (no auth required)
    let public_routes = Router::new().route("/api/v1/health", get(health::health));

    // Account and job routes (service token required when configured)
    let protected_routes = Router::new()
        .route(
            "/api/v1/accounts/{account_id}/usage",
            get(usage::get_usage).post(usage::commit_usage),
        )
        .route(
            "/api/v1/accounts/{account_id}/periods",
            get(usage::list_periods),
        )
        .route("/api/v1/jobs", post(jobs::create_job))
        .route("/api/v1/jobs/{job_id}", get(jobs::get_job))
        .route("/api/v1/jobs/{job_id}/status", post(jobs::set_status))
        .route("/api/v1/jobs/{job_id}/steps", post(jobs::record_step))
        .route("/api/v1/jobs/{job_id}/complete", post(jobs::complete_job))
        .route("/api/v1/jobs/{job_id}/fail", post(jobs::fail_job))
        .route("/api/v1/jobs/{job_id}/cancel", post(jobs::cancel_job))
        .layer(middleware::from_fn_with_state(state.clone(), service_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
