//! Billing routes: purchases, payment instructions, confirmation and reads.
//!
//! Handlers parse and authorize; all billing decisions live in
//! `lingkar-billing`. Write paths re-check authorization in the service
//! layer, so the checks here only cover read endpoints.

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use lingkar_billing::{
    Activation, BillingPeriod, BillingStatus, CoverageScope, Invoice, PaymentChannel,
    PaymentInstruction, Principal, Purchase, PurchaseRequest, RecurrenceType, RevenueSplit,
};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreatePurchaseBody {
    pub tenant_id: Uuid,
    pub plan_code: String,
    /// "recurring" or "perpetual".
    pub recurrence: String,
    /// "monthly" or "yearly"; required for recurring plans.
    pub period: Option<String>,
    pub price: Decimal,
    /// "single" or "hierarchy".
    pub scope: String,
}

#[derive(Debug, Deserialize)]
pub struct PaymentInstructionBody {
    /// "manual" or a gateway channel id such as "banktransfer".
    pub channel: String,
}

#[derive(Debug, Serialize)]
pub struct InvoiceDetailResponse {
    pub invoice: Invoice,
    pub splits: Vec<RevenueSplit>,
}

#[derive(Debug, Serialize)]
pub struct CurrentInvoiceResponse {
    pub tenant_id: Uuid,
    pub invoice: Option<Invoice>,
}

// =============================================================================
// Helpers
// =============================================================================

/// Read access: the tenant itself, whoever is billed for it, or platform
/// staff.
fn can_view(principal: &Principal, tenant_id: Uuid, billing_owner_id: Uuid) -> bool {
    principal.platform_admin
        || principal.tenant_id == tenant_id
        || principal.tenant_id == billing_owner_id
}

fn parse_purchase(body: CreatePurchaseBody) -> ApiResult<PurchaseRequest> {
    let recurrence = RecurrenceType::parse(&body.recurrence).ok_or_else(|| {
        ApiError::Validation(format!("unknown recurrence '{}'", body.recurrence))
    })?;

    let period = match body.period.as_deref() {
        Some(p) => Some(
            BillingPeriod::parse(p)
                .ok_or_else(|| ApiError::Validation(format!("unknown period '{p}'")))?,
        ),
        None => None,
    };

    let scope = CoverageScope::parse(&body.scope)
        .ok_or_else(|| ApiError::Validation(format!("unknown scope '{}'", body.scope)))?;

    Ok(PurchaseRequest {
        tenant_id: body.tenant_id,
        plan_code: body.plan_code,
        recurrence,
        period,
        price: body.price,
        scope,
    })
}

// =============================================================================
// Handlers
// =============================================================================

/// Stage a subscription purchase: pending subscription + unpaid invoice +
/// revenue splits, in one transaction.
pub async fn create_purchase(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CreatePurchaseBody>,
) -> ApiResult<(StatusCode, Json<Purchase>)> {
    let request = parse_purchase(body)?;
    let purchase = state
        .billing
        .subscriptions
        .create_purchase(request, &principal)
        .await?;

    Ok((StatusCode::CREATED, Json(purchase)))
}

/// Invoice detail with its revenue splits.
pub async fn get_invoice(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<InvoiceDetailResponse>> {
    let (invoice, splits) = state.billing.invoices.invoice_with_splits(id).await?;

    if !can_view(&principal, invoice.tenant_id, invoice.billing_owner_id) {
        return Err(ApiError::Forbidden);
    }

    Ok(Json(InvoiceDetailResponse { invoice, splits }))
}

/// Resolve the payment channel and issue a transfer instruction.
pub async fn payment_instruction(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(body): Json<PaymentInstructionBody>,
) -> ApiResult<Json<PaymentInstruction>> {
    let channel = PaymentChannel::from(body.channel);
    let instruction = state
        .billing
        .payments
        .request_instruction(id, &channel, &principal)
        .await?;

    Ok(Json(instruction))
}

/// Manually confirm payment of an invoice and activate what it covers.
pub async fn confirm_payment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Activation>> {
    let activation = state
        .billing
        .activation
        .confirm_payment(id, &principal)
        .await?;

    Ok(Json(activation))
}

/// Administrative cancel of an open invoice.
pub async fn cancel_invoice(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Invoice>> {
    let invoice = state.billing.invoices.cancel(id, &principal).await?;
    Ok(Json(invoice))
}

/// The tenant's open invoice, if any.
pub async fn current_invoice(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CurrentInvoiceResponse>> {
    let tenant = state.billing.tenants.tenant(id).await?;
    if !can_view(&principal, tenant.id, tenant.billing_owner_id) {
        return Err(ApiError::Forbidden);
    }

    let invoice = state.billing.invoices.current_invoice(id).await?;
    Ok(Json(CurrentInvoiceResponse {
        tenant_id: id,
        invoice,
    }))
}

/// Point-in-time billing view for the administrative UI.
pub async fn billing_status(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<BillingStatus>> {
    let tenant = state.billing.tenants.tenant(id).await?;
    if !can_view(&principal, tenant.id, tenant.billing_owner_id) {
        return Err(ApiError::Forbidden);
    }

    let status = state
        .billing
        .tenants
        .billing_status(id, OffsetDateTime::now_utc())
        .await?;

    Ok(Json(status))
}
