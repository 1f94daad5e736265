//! Gateway webhook intake.
//!
//! The gateway signs each delivery; the signature is checked against the
//! raw body before anything is parsed. Reconciliation itself is ordered and
//! idempotent, so redeliveries and duplicates answer 200 with a no-op
//! outcome rather than an error.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use time::OffsetDateTime;

use lingkar_billing::{PaymentChannel, PaymentNotification, ReconcileOutcome};

use crate::auth::verify_webhook_signature;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Signature header carried on every gateway delivery.
const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Receive a payment notification from a gateway channel.
pub async fn payment_notification(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<ReconcileOutcome>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!(channel = %channel, "Webhook without signature header");
            ApiError::Unauthorized
        })?;

    if !verify_webhook_signature(
        &state.config.webhook_secret,
        signature,
        body.as_bytes(),
        OffsetDateTime::now_utc(),
    ) {
        tracing::warn!(channel = %channel, "Webhook signature verification failed");
        return Err(ApiError::Unauthorized);
    }

    let notification: PaymentNotification = serde_json::from_str(&body)
        .map_err(|e| ApiError::Validation(format!("invalid notification payload: {e}")))?;

    let channel = PaymentChannel::from(channel);
    let outcome = state
        .billing
        .webhooks
        .handle_notification(&channel, &notification)
        .await?;

    Ok(Json(outcome))
}
