//! HTTP error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use resumehq_billing::BillingError;

pub struct ApiError(pub BillingError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            BillingError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            BillingError::LimitExceeded { feature, used, limit } => (
                StatusCode::FORBIDDEN,
                format!("Limit reached for '{}': {} of {} used", feature, used, limit),
            ),
            BillingError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            BillingError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            BillingError::SignatureInvalid => {
                (StatusCode::UNAUTHORIZED, "Invalid signature".to_string())
            }
            BillingError::Gateway(msg) => {
                tracing::error!(error = %msg, "Gateway error");
                (StatusCode::BAD_GATEWAY, "Payment gateway error".to_string())
            }
            BillingError::InvariantViolation(msg) => {
                tracing::error!(error = %msg, "Invariant violation");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal billing error".to_string(),
                )
            }
            BillingError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
