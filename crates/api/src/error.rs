//! API error type and HTTP status mapping.
//!
//! Library errors stay typed (`BillingError`); this module is the single
//! place that decides what the wire sees. Every response body carries a
//! stable `code` string so clients can branch without parsing messages.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use lingkar_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,
    #[error("Not found")]
    NotFound,
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error("Database error")]
    Database(#[from] sqlx::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Billing(e) => match e {
                BillingError::Validation(_) | BillingError::AmountMismatch { .. } => {
                    StatusCode::BAD_REQUEST
                }
                BillingError::Unauthorized(_)
                | BillingError::TenantBlocked { .. }
                | BillingError::BillingPolicy(_) => StatusCode::FORBIDDEN,
                BillingError::NotFound(_) => StatusCode::NOT_FOUND,
                BillingError::InvalidState(_)
                | BillingError::ChannelMismatch { .. }
                | BillingError::Conflict(_) => StatusCode::CONFLICT,
                BillingError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Billing(e) => e.code(),
            Self::Database(_) => "database",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // 5xx details stay in the logs, not on the wire.
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            tracing::warn!(status = %status, code = self.code(), error = %self, "Request rejected");
            self.to_string()
        };

        let body = Json(json!({
            "error": message,
            "code": self.code(),
        }));

        (status, body).into_response()
    }
}
