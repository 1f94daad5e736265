//! Self-initiated subscription purchases.
//!
//! A purchase stages everything payment needs later: a pending (UNPAID)
//! subscription, its invoice with the price frozen in, and the revenue
//! splits that say where the money goes once it arrives. Nothing activates
//! here — activation is payment confirmation's job.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use lingkar_shared::period::{add_months, add_years};

use crate::error::{BillingError, BillingResult};
use crate::invoices::{new_invoice_number, InvoiceService};
use crate::model::{
    Beneficiary, BillingPeriod, CoverageScope, Invoice, Principal, RecurrenceType, RevenueSplit,
    Subscription, SubscriptionSource, SubscriptionStatus, Tenant, TenantRole,
};
use crate::store::BillingStore;
use crate::tenants::TenantService;
use crate::BillingConfig;

/// Invoice numbers are random within a year; a collision is resolved by
/// re-rolling, and this bounds how often we try.
const MAX_NUMBERING_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct PurchaseRequest {
    pub tenant_id: Uuid,
    pub plan_code: String,
    pub recurrence: RecurrenceType,
    /// Required for recurring purchases, absent for perpetual ones.
    pub period: Option<BillingPeriod>,
    pub price: Decimal,
    pub scope: CoverageScope,
}

/// Everything a purchase staged, returned to the caller in one piece.
#[derive(Debug, Clone, Serialize)]
pub struct Purchase {
    pub subscription: Subscription,
    pub invoice: Invoice,
    pub splits: Vec<RevenueSplit>,
}

pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    config: BillingConfig,
    invoices: InvoiceService,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn BillingStore>, config: BillingConfig) -> Self {
        let invoices = InvoiceService::new(store.clone(), config.clone());
        Self {
            store,
            config,
            invoices,
        }
    }

    /// Stage a subscription purchase for the tenant.
    ///
    /// Demo tenants never purchase. A centralized subordinate is paid for
    /// by its primary and may not buy a recurring plan itself; one-time
    /// perpetual purchases are exempt from that policy.
    pub async fn create_purchase(
        &self,
        request: PurchaseRequest,
        principal: &Principal,
    ) -> BillingResult<Purchase> {
        validate(&request)?;

        let tenants = TenantService::new(self.store.clone());
        let tenant = tenants.tenant(request.tenant_id).await?;

        if !principal.can_act_for(tenant.id) {
            return Err(BillingError::Unauthorized(format!(
                "actor {} may not purchase on behalf of tenant {}",
                principal.actor_id, tenant.id
            )));
        }
        if tenant.is_demo() {
            return Err(BillingError::TenantBlocked {
                tenant_id: tenant.id,
            });
        }
        if !tenant.can_initiate_self_purchase() && request.recurrence == RecurrenceType::Recurring
        {
            return Err(BillingError::BillingPolicy(format!(
                "tenant {} is billed centrally through its primary and cannot purchase a recurring plan itself",
                tenant.id
            )));
        }

        let now = OffsetDateTime::now_utc();
        let ends_at = match (request.recurrence, request.period) {
            (RecurrenceType::Recurring, Some(BillingPeriod::Monthly)) => Some(add_months(now, 1)),
            (RecurrenceType::Recurring, Some(BillingPeriod::Yearly)) => Some(add_years(now, 1)),
            _ => None,
        };

        let subscription = Subscription {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            plan_code: request.plan_code.trim().to_string(),
            recurrence: request.recurrence,
            period: request.period,
            price: request.price,
            starts_at: now,
            ends_at,
            status: SubscriptionStatus::Unpaid,
            scope: request.scope,
            source: SubscriptionSource::SelfPurchased,
            created_at: now,
        };

        let billing_owner = tenants.billing_owner(&tenant).await?;
        let mut invoice =
            self.invoices
                .create_for_subscription(&subscription, &tenant, billing_owner.id, now);
        let splits = revenue_splits_for(&invoice, &tenant, self.config.parent_commission_percent);

        // The invoice number carries a random suffix; the unique index is
        // the arbiter and a collision just re-rolls the number.
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self
                .store
                .create_purchase(&subscription, &invoice, &splits)
                .await
            {
                Ok(()) => break,
                Err(BillingError::Conflict(reason)) if attempts < MAX_NUMBERING_ATTEMPTS => {
                    warn!(
                        invoice_number = %invoice.number,
                        attempt = attempts,
                        %reason,
                        "Invoice number collision, re-rolling"
                    );
                    invoice.number = new_invoice_number(now);
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            tenant_id = %tenant.id,
            subscription_id = %subscription.id,
            invoice_id = %invoice.id,
            invoice_number = %invoice.number,
            plan_code = %subscription.plan_code,
            recurrence = subscription.recurrence.as_str(),
            price = %subscription.price,
            "Subscription purchase staged"
        );

        Ok(Purchase {
            subscription,
            invoice,
            splits,
        })
    }
}

fn validate(request: &PurchaseRequest) -> BillingResult<()> {
    let plan = request.plan_code.trim();
    if plan.is_empty() || plan.len() > 64 {
        return Err(BillingError::Validation(
            "plan code must be 1-64 characters".to_string(),
        ));
    }
    if !plan
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(BillingError::Validation(format!(
            "plan code '{plan}' contains invalid characters"
        )));
    }
    if request.price <= Decimal::ZERO {
        return Err(BillingError::Validation(
            "price must be positive".to_string(),
        ));
    }
    match (request.recurrence, request.period) {
        (RecurrenceType::Recurring, None) => Err(BillingError::Validation(
            "recurring purchase requires a billing period".to_string(),
        )),
        (RecurrenceType::Perpetual, Some(_)) => Err(BillingError::Validation(
            "perpetual purchase does not take a billing period".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Decide where the invoice money goes. A subordinate bought in by a
/// parent earns that parent a commission; the platform keeps the exact
/// remainder, so the rows always sum to the invoice amount.
fn revenue_splits_for(invoice: &Invoice, tenant: &Tenant, percent: Decimal) -> Vec<RevenueSplit> {
    let parent = match (tenant.role, tenant.parent_id) {
        (TenantRole::Subordinate, Some(parent_id)) if parent_id != tenant.id => Some(parent_id),
        _ => None,
    };

    if let Some(parent_id) = parent {
        let parent_amount = (invoice.amount * percent / Decimal::new(100, 0)).round_dp(2);
        if parent_amount > Decimal::ZERO {
            return vec![
                RevenueSplit {
                    id: Uuid::new_v4(),
                    invoice_id: invoice.id,
                    beneficiary: Beneficiary::ParentTenant,
                    beneficiary_tenant_id: Some(parent_id),
                    amount: parent_amount,
                },
                RevenueSplit {
                    id: Uuid::new_v4(),
                    invoice_id: invoice.id,
                    beneficiary: Beneficiary::Platform,
                    beneficiary_tenant_id: None,
                    amount: invoice.amount - parent_amount,
                },
            ];
        }
    }

    vec![RevenueSplit {
        id: Uuid::new_v4(),
        invoice_id: invoice.id,
        beneficiary: Beneficiary::Platform,
        beneficiary_tenant_id: None,
        amount: invoice.amount,
    }]
}
