//! Storage trait for billing state.
//!
//! Reads are plain lookups. Writes that touch more than one entity are
//! modeled as one method per transactional unit, so atomicity lives in the
//! implementation and the services stay pure decision logic. `PgStore` is
//! the production implementation; `MemoryStore` backs the test suite.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::activation::Activation;
use crate::error::BillingResult;
use crate::model::{
    CoverageScope, Invoice, InvoiceStatus, PaymentChannel, RevenueSplit, Subscription, Tenant,
};

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Tenants

    async fn tenant(&self, id: Uuid) -> BillingResult<Option<Tenant>>;

    /// Tenants are provisioned outside the billing core; this exists for
    /// seeds and fixtures.
    async fn insert_tenant(&self, tenant: &Tenant) -> BillingResult<()>;

    // Subscriptions

    async fn subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn active_subscription(
        &self,
        tenant_id: Uuid,
        scope: CoverageScope,
    ) -> BillingResult<Option<Subscription>>;

    // Invoices

    async fn invoice(&self, id: Uuid) -> BillingResult<Option<Invoice>>;

    /// Lookup by invoice number — the correlation id gateways echo back.
    async fn invoice_by_number(&self, number: &str) -> BillingResult<Option<Invoice>>;

    /// The latest open (unpaid / payment-received) invoice for a tenant.
    async fn current_invoice(&self, tenant_id: Uuid) -> BillingResult<Option<Invoice>>;

    async fn revenue_splits(&self, invoice_id: Uuid) -> BillingResult<Vec<RevenueSplit>>;

    // Transactional units

    /// Persist a pending purchase: subscription, invoice and its revenue
    /// splits, all or nothing. A taken invoice number surfaces as
    /// `BillingError::Conflict` so the caller can re-number and retry.
    async fn create_purchase(
        &self,
        subscription: &Subscription,
        invoice: &Invoice,
        splits: &[RevenueSplit],
    ) -> BillingResult<()>;

    /// Bind the payment channel and disambiguation code chosen by a payment
    /// attempt. Split-mode invoices carry no code. Guarded on UNPAID;
    /// returns false when the guard misses.
    async fn bind_payment_reference(
        &self,
        invoice_id: Uuid,
        channel: &PaymentChannel,
        unique_code: Option<i32>,
    ) -> BillingResult<bool>;

    /// The webhook claim: UNPAID with no external id becomes
    /// PAYMENT_RECEIVED, storing the external transaction id and receipt
    /// time in the same guarded write. Returns false when the guard misses
    /// (lost race or changed state) — the caller re-reads and decides.
    async fn mark_payment_received(
        &self,
        invoice_id: Uuid,
        external_id: &str,
        received_at: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// The activation transaction: invoice to PAID with the service period
    /// mirrored, subscription to ACTIVE on the shifted window, any
    /// superseded active subscription of the same (tenant, scope) expired,
    /// tenant unlocked with the mirrored window. The invoice row is
    /// re-checked under lock; a lost race is `InvalidState`. Any failure
    /// rolls the whole unit back.
    async fn apply_activation(&self, activation: &Activation) -> BillingResult<()>;

    /// Administrative transition (cancel / refund / fail) guarded on the
    /// invoice still being open. Returns false when the guard misses.
    async fn transition_invoice(&self, invoice_id: Uuid, to: InvoiceStatus)
        -> BillingResult<bool>;
}
