use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};

use crate::error::{ApiError, ApiErrorResponse};
use crate::state::AppState;

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn extract_bearer_from_headers(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// Requires the configured service token. A daemon started without one
/// accepts every caller, which suits a loopback-only deployment.
pub async fn service_auth(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiErrorResponse> {
    let Some(expected) = state.api_token_hash.as_deref() else {
        return Ok(next.run(req).await);
    };

    let token = extract_bearer_from_headers(req.headers()).ok_or_else(|| ApiErrorResponse {
        status: StatusCode::UNAUTHORIZED,
        error: ApiError::unauthorized(),
    })?;

    if hash_token(&token) != expected {
        return Err(ApiErrorResponse {
            status: StatusCode::UNAUTHORIZED,
            error: ApiError::invalid_token(),
        });
    }

    Ok(next.run(req).await)
}
