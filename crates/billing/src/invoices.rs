//! Invoice construction, numbering, reads and administrative transitions.

use std::sync::Arc;

use rand::Rng;
use time::{Duration, OffsetDateTime};
use tracing::info;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::model::{
    Invoice, InvoiceStatus, PaymentChannel, PaymentMode, Principal, RevenueSplit, Subscription,
    Tenant,
};
use crate::store::BillingStore;
use crate::BillingConfig;

/// Year-prefixed random suffix. Uniqueness is not guaranteed here — the
/// unique index plus the purchase retry loop make allocation collision-safe.
pub(crate) fn new_invoice_number(now: OffsetDateTime) -> String {
    let mut rng = rand::rng();
    format!("INV-{}-{:06}", now.year(), rng.random_range(0..1_000_000))
}

#[derive(Clone)]
pub struct InvoiceService {
    store: Arc<dyn BillingStore>,
    config: BillingConfig,
}

impl InvoiceService {
    pub fn new(store: Arc<dyn BillingStore>, config: BillingConfig) -> Self {
        Self { store, config }
    }

    /// Build the invoice for a fresh purchase. The amount is copied from
    /// the subscription price and never changes afterwards; payment mode
    /// and channel start at their defaults until a payment attempt binds
    /// them.
    pub fn create_for_subscription(
        &self,
        subscription: &Subscription,
        tenant: &Tenant,
        billing_owner_id: Uuid,
        now: OffsetDateTime,
    ) -> Invoice {
        Invoice {
            id: Uuid::new_v4(),
            number: new_invoice_number(now),
            tenant_id: tenant.id,
            billing_owner_id,
            subscription_id: subscription.id,
            amount: subscription.price,
            status: InvoiceStatus::Unpaid,
            payment_mode: PaymentMode::Centralized,
            channel: PaymentChannel::Manual,
            unique_code: None,
            external_payment_id: None,
            issued_at: now,
            due_at: now + Duration::days(self.config.invoice_due_days),
            received_at: None,
            paid_at: None,
            period_starts_at: None,
            period_ends_at: None,
        }
    }

    pub async fn invoice(&self, id: Uuid) -> BillingResult<Invoice> {
        self.store
            .invoice(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("invoice {id}")))
    }

    pub async fn invoice_with_splits(
        &self,
        id: Uuid,
    ) -> BillingResult<(Invoice, Vec<RevenueSplit>)> {
        let invoice = self.invoice(id).await?;
        let splits = self.store.revenue_splits(id).await?;
        Ok((invoice, splits))
    }

    /// The tenant's open invoice: latest UNPAID or PAYMENT_RECEIVED.
    pub async fn current_invoice(&self, tenant_id: Uuid) -> BillingResult<Option<Invoice>> {
        self.store.current_invoice(tenant_id).await
    }

    pub async fn cancel(&self, id: Uuid, principal: &Principal) -> BillingResult<Invoice> {
        self.transition(id, InvoiceStatus::Canceled, principal).await
    }

    pub async fn refund(&self, id: Uuid, principal: &Principal) -> BillingResult<Invoice> {
        self.transition(id, InvoiceStatus::Refunded, principal).await
    }

    pub async fn fail(&self, id: Uuid, principal: &Principal) -> BillingResult<Invoice> {
        self.transition(id, InvoiceStatus::Failed, principal).await
    }

    async fn transition(
        &self,
        id: Uuid,
        to: InvoiceStatus,
        principal: &Principal,
    ) -> BillingResult<Invoice> {
        let invoice = self.invoice(id).await?;
        if !principal.can_act_for(invoice.billing_owner_id) {
            return Err(BillingError::Unauthorized(format!(
                "actor {} may not administer invoices of billing owner {}",
                principal.actor_id, invoice.billing_owner_id
            )));
        }

        if !self.store.transition_invoice(id, to).await? {
            return Err(BillingError::InvalidState(format!(
                "invoice {} is {} and cannot become {to}",
                invoice.number, invoice.status
            )));
        }

        info!(
            invoice_id = %id,
            invoice_number = %invoice.number,
            from = %invoice.status,
            to = %to,
            "Invoice transitioned administratively"
        );
        self.invoice(id).await
    }
}
