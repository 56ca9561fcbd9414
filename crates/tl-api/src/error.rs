use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tl_usage::UsageError;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub retryable: bool,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: false,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn unauthorized() -> Self {
        Self::new("UNAUTHORIZED", "Authentication required")
    }

    pub fn invalid_token() -> Self {
        Self::new("INVALID_TOKEN", "Invalid service token")
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BAD_REQUEST", message)
    }

    pub fn usage_error(err: &UsageError) -> (StatusCode, Self) {
        let code = err.error_code();
        match err {
            UsageError::QuotaExceeded {
                available,
                requested,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                Self::new(
                    code,
                    "You have used your token quota for this billing period. \
                     Upgrade your plan or wait for the next period to start.",
                )
                .with_details(serde_json::json!({
                    "available": available,
                    "requested": requested,
                })),
            ),
            UsageError::JobNotFound(_) => (StatusCode::NOT_FOUND, Self::new(code, err.to_string())),
            UsageError::AccountMismatch { .. } => {
                (StatusCode::FORBIDDEN, Self::new(code, err.to_string()))
            }
            UsageError::DuplicateJob(_)
            | UsageError::InvalidTransition { .. }
            | UsageError::JobNotInFlight { .. } => {
                (StatusCode::CONFLICT, Self::new(code, err.to_string()))
            }
            UsageError::InvalidAmount(_) | UsageError::AmountOverflow { .. } => {
                (StatusCode::BAD_REQUEST, Self::new(code, err.to_string()))
            }
            UsageError::Poisoned | UsageError::Store(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Self::new(code, "Usage store is unavailable").retryable(),
            ),
        }
    }
}

#[derive(Debug)]
pub struct ApiErrorResponse {
    pub status: StatusCode,
    pub error: ApiError,
}

impl IntoResponse for ApiErrorResponse {
    fn into_response(self) -> Response {
        let body = serde_json::to_string(&self.error).unwrap_or_default();
        (self.status, [("content-type", "application/json")], body).into_response()
    }
}

impl From<(StatusCode, ApiError)> for ApiErrorResponse {
    fn from((status, error): (StatusCode, ApiError)) -> Self {
        Self { status, error }
    }
}

impl From<UsageError> for ApiErrorResponse {
    fn from(err: UsageError) -> Self {
        if err.is_retryable() || matches!(err, UsageError::Poisoned) {
            tracing::error!(error = %err, "Usage store request failed");
        }
        ApiError::usage_error(&err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tl_usage::JobStatus;

    #[test]
    fn api_error_new() {
        let err = ApiError::new("CODE", "message");
        assert_eq!(err.code, "CODE");
        assert_eq!(err.message, "message");
        assert!(!err.retryable);
        assert!(err.details.is_none());
    }

    #[test]
    fn api_error_json_serialization() {
        let err = ApiError::new("TEST", "test message");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "TEST");
        assert_eq!(json["message"], "test message");
        assert_eq!(json["retryable"], false);
    }

    #[test]
    fn quota_exceeded_maps_to_payment_required() {
        let err = UsageError::QuotaExceeded {
            available: 50_000,
            requested: 60_000,
        };
        let (status, api_err) = ApiError::usage_error(&err);
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(api_err.code, "QUOTA_EXCEEDED");
        assert!(api_err.message.contains("Upgrade your plan"));
        assert_eq!(api_err.details.unwrap()["available"], 50_000);
        assert!(!api_err.retryable);
    }

    #[test]
    fn amount_overflow_maps_to_bad_request() {
        let err = UsageError::AmountOverflow {
            period_id: 7,
            tokens: i64::MAX,
        };
        let (status, api_err) = ApiError::usage_error(&err);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(api_err.code, "TOKEN_AMOUNT_OVERFLOW");
        assert!(!api_err.retryable);
    }

    #[test]
    fn job_not_found_maps_to_404() {
        let (status, api_err) = ApiError::usage_error(&UsageError::JobNotFound("j".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(api_err.code, "JOB_NOT_FOUND");
    }

    #[test]
    fn invalid_transition_maps_to_conflict() {
        let err = UsageError::InvalidTransition {
            from: JobStatus::Complete,
            to: JobStatus::Processing,
        };
        let (status, api_err) = ApiError::usage_error(&err);
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(api_err.message.contains("complete -> processing"));
    }

    #[test]
    fn store_failure_is_retryable_503() {
        let (status, api_err) = ApiError::usage_error(&UsageError::Poisoned);
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(api_err.retryable);
    }

    #[test]
    fn api_error_response_into_response() {
        let resp = ApiErrorResponse {
            status: StatusCode::BAD_REQUEST,
            error: ApiError::bad_request("bad request"),
        };
        assert_eq!(resp.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
