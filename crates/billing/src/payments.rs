//! Payment-channel resolution and transfer instructions.
//!
//! A payment attempt names a channel; the resolver applies the eligibility
//! gates in a fixed order and returns one of a closed set of strategies.
//! The strategy then produces the instruction the payer actually follows:
//! manual settlement against the association's books, or a bank transfer
//! whose total carries a small disambiguation code so a pooled account can
//! map the money back to exactly one invoice.

use std::sync::Arc;

use rand::Rng;
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::model::{
    BillingMode, Invoice, InvoiceStatus, PaymentChannel, PaymentMode, Principal, RecurrenceType,
    TenantRole,
};
use crate::store::BillingStore;
use crate::BillingConfig;

/// Disambiguation codes live in 1..=999 so they never push a transfer
/// into the next thousand.
const UNIQUE_CODE_MIN: i32 = 1;
const UNIQUE_CODE_MAX: i32 = 999;

/// How an invoice gets paid. A closed set: adding a payment method means
/// adding a variant here, not registering anything at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentStrategy {
    /// Settled by hand against the association's books and confirmed by an
    /// administrator.
    Manual,
    /// Paid through a configured gateway channel, identified by its
    /// catalog id.
    Gateway(String),
}

impl PaymentStrategy {
    pub fn channel(&self) -> PaymentChannel {
        match self {
            Self::Manual => PaymentChannel::Manual,
            Self::Gateway(id) => PaymentChannel::Gateway(id.clone()),
        }
    }
}

/// What the payer is told to do, returned by a payment attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentInstruction {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub channel: PaymentChannel,
    /// Nominal invoice amount, before any disambiguation code.
    pub amount: Decimal,
    pub unique_code: Option<i32>,
    /// The exact total the transfer must carry.
    pub amount_total: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub due_at: OffsetDateTime,
    pub instruction: String,
}

pub struct PaymentService {
    store: Arc<dyn BillingStore>,
    config: BillingConfig,
}

impl PaymentService {
    pub fn new(store: Arc<dyn BillingStore>, config: BillingConfig) -> Self {
        Self { store, config }
    }

    /// Resolve the strategy for paying an invoice through the requested
    /// channel. Gates run in a fixed order: catalog, existence, invoice
    /// state, authorization, demo lock, centralized-billing policy.
    pub async fn resolve(
        &self,
        invoice_id: Uuid,
        channel: &PaymentChannel,
        principal: &Principal,
    ) -> BillingResult<PaymentStrategy> {
        let (_, strategy) = self.resolve_invoice(invoice_id, channel, principal).await?;
        Ok(strategy)
    }

    /// Resolve the channel and produce the transfer instruction, binding
    /// the chosen channel (and code, for centralized gateway payments) to
    /// the invoice.
    pub async fn request_instruction(
        &self,
        invoice_id: Uuid,
        channel: &PaymentChannel,
        principal: &Principal,
    ) -> BillingResult<PaymentInstruction> {
        let (invoice, strategy) = self.resolve_invoice(invoice_id, channel, principal).await?;

        let instruction = match &strategy {
            PaymentStrategy::Manual => self.manual_instruction(&invoice).await?,
            PaymentStrategy::Gateway(gateway_id) => {
                self.gateway_instruction(&invoice, gateway_id).await?
            }
        };

        info!(
            invoice_id = %instruction.invoice_id,
            invoice_number = %instruction.invoice_number,
            channel = %instruction.channel,
            amount_total = %instruction.amount_total,
            unique_code = ?instruction.unique_code,
            "Payment instruction issued"
        );
        Ok(instruction)
    }

    async fn resolve_invoice(
        &self,
        invoice_id: Uuid,
        channel: &PaymentChannel,
        principal: &Principal,
    ) -> BillingResult<(Invoice, PaymentStrategy)> {
        let strategy = match channel {
            PaymentChannel::Manual => PaymentStrategy::Manual,
            PaymentChannel::Gateway(id) => {
                if !self.config.gateway_channels.iter().any(|c| c == id) {
                    return Err(BillingError::Validation(format!(
                        "unknown payment channel '{id}'"
                    )));
                }
                PaymentStrategy::Gateway(id.clone())
            }
        };

        let invoice = self
            .store
            .invoice(invoice_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("invoice {invoice_id}")))?;

        if invoice.status != InvoiceStatus::Unpaid {
            return Err(BillingError::InvalidState(format!(
                "invoice {} is {} and cannot take a payment attempt",
                invoice.number, invoice.status
            )));
        }

        if !principal.can_act_for(invoice.billing_owner_id) {
            return Err(BillingError::Unauthorized(format!(
                "actor {} may not pay invoices of billing owner {}",
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

        let subscription = self
            .store
            .subscription(invoice.subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("subscription {}", invoice.subscription_id))
            })?;

        // A centralized subordinate's recurring plan is paid by its
        // primary; only one-time perpetual purchases skip that policy.
        if subscription.recurrence == RecurrenceType::Recurring
            && tenant.billing_mode == BillingMode::Centralized
            && tenant.role == TenantRole::Subordinate
        {
            return Err(BillingError::BillingPolicy(format!(
                "tenant {} is billed centrally through its primary and cannot pay a recurring subscription itself",
                tenant.id
            )));
        }

        Ok((invoice, strategy))
    }

    async fn manual_instruction(&self, invoice: &Invoice) -> BillingResult<PaymentInstruction> {
        // Clears any code left behind by an earlier gateway attempt, so the
        // invoice's expected total goes back to the nominal amount.
        if !self
            .store
            .bind_payment_reference(invoice.id, &PaymentChannel::Manual, None)
            .await?
        {
            return Err(BillingError::InvalidState(format!(
                "invoice {} changed state during the payment attempt",
                invoice.number
            )));
        }

        Ok(PaymentInstruction {
            invoice_id: invoice.id,
            invoice_number: invoice.number.clone(),
            channel: PaymentChannel::Manual,
            amount: invoice.amount,
            unique_code: None,
            amount_total: invoice.amount,
            due_at: invoice.due_at,
            instruction: format!(
                "Record {} against invoice {} in the association ledger, then confirm the payment.",
                invoice.amount, invoice.number
            ),
        })
    }

    async fn gateway_instruction(
        &self,
        invoice: &Invoice,
        gateway_id: &str,
    ) -> BillingResult<PaymentInstruction> {
        let channel = PaymentChannel::Gateway(gateway_id.to_string());

        // Centralized payments land on a pooled account and need the code
        // to disambiguate; split payments are attributed by the gateway
        // itself, so the transfer carries the bare amount.
        let unique_code = match invoice.payment_mode {
            PaymentMode::Centralized => Some(match invoice.unique_code {
                // Re-requesting an instruction must not change the total
                // the payer was already told to transfer.
                Some(code) => code,
                None => rand::rng().random_range(UNIQUE_CODE_MIN..=UNIQUE_CODE_MAX),
            }),
            PaymentMode::Split => None,
        };

        if !self
            .store
            .bind_payment_reference(invoice.id, &channel, unique_code)
            .await?
        {
            return Err(BillingError::InvalidState(format!(
                "invoice {} changed state during the payment attempt",
                invoice.number
            )));
        }

        let amount_total = invoice.amount + Decimal::from(unique_code.unwrap_or(0));
        Ok(PaymentInstruction {
            invoice_id: invoice.id,
            invoice_number: invoice.number.clone(),
            channel: channel.clone(),
            amount: invoice.amount,
            unique_code,
            amount_total,
            due_at: invoice.due_at,
            instruction: format!(
                "Transfer exactly {amount_total} via {channel}, reference {}.",
                invoice.number
            ),
        })
    }
}
