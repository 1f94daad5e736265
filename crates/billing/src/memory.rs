//! In-memory `BillingStore` for the test suite.
//!
//! Writes take a single write lock and commit clones at the end, so every
//! transactional unit is genuinely all-or-nothing. The tenant-update
//! failpoint lets tests prove that a failure mid-activation leaves the
//! invoice and subscription untouched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::activation::Activation;
use crate::error::{BillingError, BillingResult};
use crate::model::{
    CoverageScope, Invoice, InvoiceStatus, PaymentChannel, RevenueSplit, Subscription,
    SubscriptionStatus, Tenant, TenantStatus,
};
use crate::store::BillingStore;

#[derive(Default)]
struct Inner {
    tenants: HashMap<Uuid, Tenant>,
    subscriptions: HashMap<Uuid, Subscription>,
    invoices: HashMap<Uuid, Invoice>,
    splits: HashMap<Uuid, Vec<RevenueSplit>>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    fail_tenant_update: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the tenant-update step of the next activations fail, without
    /// touching anything written before it.
    pub fn set_fail_tenant_update(&self, fail: bool) {
        self.fail_tenant_update.store(fail, Ordering::SeqCst);
    }

    /// Fixture helper: place an invoice directly, bypassing the purchase
    /// flow.
    pub async fn put_invoice(&self, invoice: Invoice) {
        self.inner
            .write()
            .await
            .invoices
            .insert(invoice.id, invoice);
    }

    /// Fixture helper: place a subscription directly.
    pub async fn put_subscription(&self, subscription: Subscription) {
        self.inner
            .write()
            .await
            .subscriptions
            .insert(subscription.id, subscription);
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn tenant(&self, id: Uuid) -> BillingResult<Option<Tenant>> {
        Ok(self.inner.read().await.tenants.get(&id).cloned())
    }

    async fn insert_tenant(&self, tenant: &Tenant) -> BillingResult<()> {
        self.inner
            .write()
            .await
            .tenants
            .insert(tenant.id, tenant.clone());
        Ok(())
    }

    async fn subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.inner.read().await.subscriptions.get(&id).cloned())
    }

    async fn active_subscription(
        &self,
        tenant_id: Uuid,
        scope: CoverageScope,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .inner
            .read()
            .await
            .subscriptions
            .values()
            .find(|s| {
                s.tenant_id == tenant_id
                    && s.scope == scope
                    && s.status == SubscriptionStatus::Active
            })
            .cloned())
    }

    async fn invoice(&self, id: Uuid) -> BillingResult<Option<Invoice>> {
        Ok(self.inner.read().await.invoices.get(&id).cloned())
    }

    async fn invoice_by_number(&self, number: &str) -> BillingResult<Option<Invoice>> {
        Ok(self
            .inner
            .read()
            .await
            .invoices
            .values()
            .find(|i| i.number == number)
            .cloned())
    }

    async fn current_invoice(&self, tenant_id: Uuid) -> BillingResult<Option<Invoice>> {
        Ok(self
            .inner
            .read()
            .await
            .invoices
            .values()
            .filter(|i| i.tenant_id == tenant_id && i.is_open())
            .max_by_key(|i| i.issued_at)
            .cloned())
    }

    async fn revenue_splits(&self, invoice_id: Uuid) -> BillingResult<Vec<RevenueSplit>> {
        Ok(self
            .inner
            .read()
            .await
            .splits
            .get(&invoice_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_purchase(
        &self,
        subscription: &Subscription,
        invoice: &Invoice,
        splits: &[RevenueSplit],
    ) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        if inner.invoices.values().any(|i| i.number == invoice.number) {
            return Err(BillingError::Conflict(format!(
                "invoice number {} already exists",
                invoice.number
            )));
        }
        inner
            .subscriptions
            .insert(subscription.id, subscription.clone());
        inner.invoices.insert(invoice.id, invoice.clone());
        inner.splits.insert(invoice.id, splits.to_vec());
        Ok(())
    }

    async fn bind_payment_reference(
        &self,
        invoice_id: Uuid,
        channel: &PaymentChannel,
        unique_code: Option<i32>,
    ) -> BillingResult<bool> {
        let mut inner = self.inner.write().await;
        let Some(invoice) = inner.invoices.get_mut(&invoice_id) else {
            return Ok(false);
        };
        if invoice.status != InvoiceStatus::Unpaid {
            return Ok(false);
        }
        invoice.channel = channel.clone();
        invoice.unique_code = unique_code;
        Ok(true)
    }

    async fn mark_payment_received(
        &self,
        invoice_id: Uuid,
        external_id: &str,
        received_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut inner = self.inner.write().await;
        let Some(invoice) = inner.invoices.get_mut(&invoice_id) else {
            return Ok(false);
        };
        if invoice.status != InvoiceStatus::Unpaid || invoice.external_payment_id.is_some() {
            return Ok(false);
        }
        invoice.status = InvoiceStatus::PaymentReceived;
        invoice.external_payment_id = Some(external_id.to_string());
        invoice.received_at = Some(received_at);
        Ok(true)
    }

    async fn apply_activation(&self, activation: &Activation) -> BillingResult<()> {
        let mut inner = self.inner.write().await;

        let invoice = inner
            .invoices
            .get(&activation.invoice_id)
            .ok_or_else(|| {
                BillingError::NotFound(format!("invoice {}", activation.invoice_id))
            })?;
        if !invoice.status.is_open() {
            return Err(BillingError::InvalidState(format!(
                "invoice {} is {}",
                invoice.number, invoice.status
            )));
        }

        let mut invoice = invoice.clone();
        invoice.status = InvoiceStatus::Paid;
        invoice.paid_at = Some(activation.paid_at);
        invoice.period_starts_at = Some(activation.starts_at);
        invoice.period_ends_at = activation.ends_at;

        let mut subscription = inner
            .subscriptions
            .get(&activation.subscription_id)
            .cloned()
            .ok_or_else(|| {
                BillingError::NotFound(format!("subscription {}", activation.subscription_id))
            })?;
        subscription.status = SubscriptionStatus::Active;
        subscription.starts_at = activation.starts_at;
        subscription.ends_at = activation.ends_at;

        let superseded: Vec<Uuid> = inner
            .subscriptions
            .values()
            .filter(|s| {
                s.id != activation.subscription_id
                    && s.tenant_id == activation.tenant_id
                    && s.scope == activation.scope
                    && s.status == SubscriptionStatus::Active
            })
            .map(|s| s.id)
            .collect();

        // The tenant step runs last; when it fails nothing above is kept.
        if self.fail_tenant_update.load(Ordering::SeqCst) {
            return Err(BillingError::Database(
                "injected tenant update failure".to_string(),
            ));
        }
        let mut tenant = inner
            .tenants
            .get(&activation.tenant_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("tenant {}", activation.tenant_id)))?;
        tenant.status = TenantStatus::Active;
        tenant.active_until = activation.ends_at;

        inner.invoices.insert(invoice.id, invoice);
        inner.subscriptions.insert(subscription.id, subscription);
        for id in superseded {
            if let Some(s) = inner.subscriptions.get_mut(&id) {
                s.status = SubscriptionStatus::Expired;
            }
        }
        inner.tenants.insert(tenant.id, tenant);
        Ok(())
    }

    async fn transition_invoice(
        &self,
        invoice_id: Uuid,
        to: InvoiceStatus,
    ) -> BillingResult<bool> {
        let mut inner = self.inner.write().await;
        let Some(invoice) = inner.invoices.get_mut(&invoice_id) else {
            return Ok(false);
        };
        if !invoice.status.can_transition_to(to) {
            return Ok(false);
        }
        invoice.status = to;
        Ok(true)
    }
}
