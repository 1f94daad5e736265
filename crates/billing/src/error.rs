//! Billing error taxonomy.
//!
//! Every business-rule violation is a typed variant so callers (and the API
//! layer) can distinguish outcomes without string matching. `Database` is the
//! only infrastructure variant; a multi-entity commit that fails surfaces as
//! `Database` after the transaction has rolled back.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("tenant {tenant_id} is a demo tenant and is blocked from payment actions")]
    TenantBlocked { tenant_id: Uuid },

    #[error("billing policy violation: {0}")]
    BillingPolicy(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("payment channel mismatch: invoice is bound to '{expected}', notification arrived via '{got}'")]
    ChannelMismatch { expected: String, got: String },

    #[error("amount mismatch: expected {expected}, notification reported {got}")]
    AmountMismatch { expected: Decimal, got: Decimal },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl BillingError {
    /// Stable machine-readable code, carried in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::TenantBlocked { .. } => "tenant_blocked",
            Self::BillingPolicy(_) => "billing_policy",
            Self::InvalidState(_) => "invalid_state",
            Self::ChannelMismatch { .. } => "channel_mismatch",
            Self::AmountMismatch { .. } => "amount_mismatch",
            Self::Conflict(_) => "conflict",
            Self::Database(_) => "database",
        }
    }
}
