//! Platform admin routes.

use axum::{
    extract::{Extension, State},
    Json,
};

use lingkar_billing::{InvariantCheckSummary, Principal};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Run every billing invariant check and report violations.
pub async fn run_invariant_checks(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    if !principal.platform_admin {
        tracing::warn!(actor_id = %principal.actor_id, "Invariant check denied");
        return Err(ApiError::Forbidden);
    }

    let summary = state.invariants.run_all_checks().await?;
    Ok(Json(summary))
}
