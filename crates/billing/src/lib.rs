// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Purchase construction carries many fields
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Lingkar Billing Module
//!
//! Handles the subscription and payment lifecycle for neighborhood
//! association tenants: purchases, invoicing, payment-channel resolution,
//! gateway webhook reconciliation, and post-payment activation.
//!
//! ## Features
//!
//! - **Purchases**: Self-initiated recurring (monthly/yearly) and perpetual
//!   subscription purchases with eligibility gates
//! - **Invoicing**: Frozen-amount invoices with year-prefixed numbers and a
//!   guarded status machine
//! - **Payment resolution**: Manual settlement or a configured gateway
//!   channel, with bank-transfer disambiguation codes
//! - **Webhooks**: Idempotent reconciliation of gateway payment
//!   notifications against open invoices
//! - **Activation**: Atomic invoice/subscription/tenant commit with a
//!   duration-preserving service window
//! - **Revenue splits**: Platform / parent-tenant commission rows that
//!   always sum to the invoice amount
//! - **Invariants**: SQL sweeps over billing state for the admin surface

pub mod activation;
pub mod error;
pub mod invariants;
pub mod invoices;
pub mod model;
pub mod payments;
pub mod pg_store;
pub mod store;
pub mod subscriptions;
pub mod tenants;
pub mod webhooks;

#[cfg(any(test, feature = "memory-store"))]
pub mod memory;

#[cfg(test)]
mod edge_case_tests;

// Activation
pub use activation::{Activation, ActivationService};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Invoices
pub use invoices::InvoiceService;

// Model
pub use model::{
    shifted_window, Beneficiary, BillingMode, BillingPeriod, CoverageScope, Invoice,
    InvoiceStatus, PaymentChannel, PaymentMode, Principal, RecurrenceType, RevenueSplit,
    Subscription, SubscriptionSource, SubscriptionStatus, Tenant, TenantRole, TenantStatus,
};

// Payments
pub use payments::{PaymentInstruction, PaymentService, PaymentStrategy};

// Store
pub use pg_store::PgStore;
pub use store::BillingStore;

#[cfg(any(test, feature = "memory-store"))]
pub use memory::MemoryStore;

// Subscriptions
pub use subscriptions::{Purchase, PurchaseRequest, SubscriptionService};

// Tenants
pub use tenants::{BillingStatus, TenantService};

// Webhooks
pub use webhooks::{PaymentNotification, ReconcileOutcome, WebhookHandler};

use std::sync::Arc;

use rust_decimal::Decimal;
use sqlx::PgPool;

/// Billing knobs shared by the services. Every field has a production
/// default so a bare environment still boots.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Days between issue and due date on a fresh invoice.
    pub invoice_due_days: i64,
    /// Share of a subordinate's invoice routed to its parent primary,
    /// in percent.
    pub parent_commission_percent: Decimal,
    /// Gateway channel catalog. Payment attempts naming anything else are
    /// rejected; "manual" is always available and not listed here.
    pub gateway_channels: Vec<String>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            invoice_due_days: 7,
            parent_commission_percent: Decimal::new(10, 0),
            gateway_channels: vec!["banktransfer".to_string()],
        }
    }
}

impl BillingConfig {
    /// Read the billing knobs from the environment, falling back to
    /// defaults when unset.
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();

        let invoice_due_days = match std::env::var("BILLING_INVOICE_DUE_DAYS") {
            Ok(v) => v.parse::<i64>().map_err(|_| {
                BillingError::Validation(format!("BILLING_INVOICE_DUE_DAYS is not a number: {v}"))
            })?,
            Err(_) => defaults.invoice_due_days,
        };

        let parent_commission_percent = match std::env::var("BILLING_PARENT_COMMISSION_PERCENT") {
            Ok(v) => v.parse::<Decimal>().map_err(|_| {
                BillingError::Validation(format!(
                    "BILLING_PARENT_COMMISSION_PERCENT is not a number: {v}"
                ))
            })?,
            Err(_) => defaults.parent_commission_percent,
        };

        let gateway_channels = match std::env::var("BILLING_GATEWAY_CHANNELS") {
            Ok(v) => v
                .split(',')
                .map(|c| c.trim().to_lowercase())
                .filter(|c| !c.is_empty())
                .collect(),
            Err(_) => defaults.gateway_channels,
        };

        if invoice_due_days <= 0 {
            return Err(BillingError::Validation(
                "BILLING_INVOICE_DUE_DAYS must be positive".to_string(),
            ));
        }
        if parent_commission_percent < Decimal::ZERO
            || parent_commission_percent > Decimal::new(100, 0)
        {
            return Err(BillingError::Validation(
                "BILLING_PARENT_COMMISSION_PERCENT must be between 0 and 100".to_string(),
            ));
        }

        Ok(Self {
            invoice_due_days,
            parent_commission_percent,
            gateway_channels,
        })
    }
}

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub tenants: TenantService,
    pub subscriptions: SubscriptionService,
    pub invoices: InvoiceService,
    pub payments: PaymentService,
    pub activation: ActivationService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service on any store
    pub fn new(store: Arc<dyn BillingStore>, config: BillingConfig) -> Self {
        Self {
            tenants: TenantService::new(store.clone()),
            subscriptions: SubscriptionService::new(store.clone(), config.clone()),
            invoices: InvoiceService::new(store.clone(), config.clone()),
            payments: PaymentService::new(store.clone(), config),
            activation: ActivationService::new(store.clone()),
            webhooks: WebhookHandler::new(store),
        }
    }

    /// Create a new billing service on Postgres from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        Ok(Self::postgres(pool, config))
    }

    /// Create a new billing service on Postgres with explicit config
    pub fn postgres(pool: PgPool, config: BillingConfig) -> Self {
        Self::new(Arc::new(PgStore::new(pool)), config)
    }
}
