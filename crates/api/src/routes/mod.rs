//! HTTP route registration.

pub mod admin;
pub mod billing;
pub mod webhooks;

use axum::{
    extract::State,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::auth::require_auth;
use crate::error::ApiResult;
use crate::state::AppState;

/// Build the full application router.
///
/// Webhooks and the health probe are public; webhook requests authenticate
/// by signature inside the handler. Everything else requires a bearer token.
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/billing/purchases", post(billing::create_purchase))
        .route("/api/billing/invoices/{id}", get(billing::get_invoice))
        .route(
            "/api/billing/invoices/{id}/instruction",
            post(billing::payment_instruction),
        )
        .route(
            "/api/billing/invoices/{id}/confirm",
            post(billing::confirm_payment),
        )
        .route(
            "/api/billing/invoices/{id}/cancel",
            post(billing::cancel_invoice),
        )
        .route(
            "/api/billing/tenants/{id}/current-invoice",
            get(billing::current_invoice),
        )
        .route(
            "/api/billing/tenants/{id}/status",
            get(billing::billing_status),
        )
        .route("/api/admin/invariants", get(admin::run_invariant_checks))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public = Router::new().route("/health", get(health)).route(
        "/api/webhooks/payments/{channel}",
        post(webhooks::payment_notification),
    );

    public.merge(protected).with_state(state)
}

/// Liveness probe with a database ping.
async fn health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.pool)
        .await?;

    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    })))
}
