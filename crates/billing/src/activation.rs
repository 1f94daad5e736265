//! Payment confirmation and atomic activation.
//!
//! Confirming a payment is the only path that takes an invoice to PAID, and
//! it drags the subscription and tenant along in the same transaction. The
//! service validates and decides; the store applies the writes atomically.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::model::{shifted_window, CoverageScope, Principal, SubscriptionStatus};
use crate::store::BillingStore;

/// Everything the activation transaction writes, returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activation {
    pub invoice_id: Uuid,
    pub subscription_id: Uuid,
    pub tenant_id: Uuid,
    pub scope: CoverageScope,
    #[serde(with = "time::serde::rfc3339")]
    pub paid_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ends_at: Option<OffsetDateTime>,
}

pub struct ActivationService {
    store: Arc<dyn BillingStore>,
}

impl ActivationService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Confirm payment on an invoice and activate what it covers.
    ///
    /// Requires an invoice in UNPAID or PAYMENT_RECEIVED — a confirmation
    /// after the webhook hand-off must still be explicit. The recurring
    /// window is re-based at the payment moment with its duration intact,
    /// so a paying tenant gets the full paid duration from the moment of
    /// payment, not from the moment of purchase.
    pub async fn confirm_payment(
        &self,
        invoice_id: Uuid,
        principal: &Principal,
    ) -> BillingResult<Activation> {
        let invoice = self
            .store
            .invoice(invoice_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("invoice {invoice_id}")))?;

        if !principal.can_act_for(invoice.billing_owner_id) {
            return Err(BillingError::Unauthorized(format!(
                "actor {} may not confirm payments for billing owner {}",
                principal.actor_id, invoice.billing_owner_id
            )));
        }

        let tenant = self
            .store
            .tenant(invoice.tenant_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("tenant {}", invoice.tenant_id)))?;
        if tenant.is_demo() {
            return Err(BillingError::TenantBlocked {
                tenant_id: tenant.id,
            });
        }

        if !invoice.status.is_open() {
            return Err(BillingError::InvalidState(format!(
                "invoice {} is {} and cannot be confirmed",
                invoice.number, invoice.status
            )));
        }

        let subscription = self
            .store
            .subscription(invoice.subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("subscription {}", invoice.subscription_id))
            })?;
        if subscription.status != SubscriptionStatus::Unpaid {
            return Err(BillingError::InvalidState(format!(
                "subscription {} is {} and cannot be activated",
                subscription.id, subscription.status
            )));
        }

        let now = OffsetDateTime::now_utc();
        let (starts_at, ends_at) =
            shifted_window(subscription.starts_at, subscription.ends_at, now);

        let activation = Activation {
            invoice_id: invoice.id,
            subscription_id: subscription.id,
            tenant_id: tenant.id,
            scope: subscription.scope,
            paid_at: now,
            starts_at,
            ends_at,
        };

        // Re-checked under lock inside the transaction; a racing confirm
        // that commits first turns this into InvalidState.
        self.store.apply_activation(&activation).await?;

        info!(
            invoice_id = %invoice.id,
            invoice_number = %invoice.number,
            subscription_id = %subscription.id,
            tenant_id = %tenant.id,
            starts_at = %starts_at,
            ends_at = ?ends_at,
            "Payment confirmed, subscription activated"
        );

        Ok(activation)
    }
}
