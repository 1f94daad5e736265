//! Gateway payment webhook reconciliation.
//!
//! A notification is matched against an open invoice through a fixed
//! sequence of checks; every exit is either a typed error or an explicit
//! outcome, and redelivery of the same gateway transaction is always a
//! harmless no-op. The webhook never activates anything — it parks the
//! invoice at PAYMENT_RECEIVED for an administrator to confirm.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::model::{InvoiceStatus, PaymentChannel};
use crate::store::BillingStore;

/// Pooled transfers are occasionally off by rounding at the payer's bank;
/// anything within one currency unit of the expected total still matches.
const AMOUNT_TOLERANCE: Decimal = Decimal::ONE;

/// Gateway statuses that mean the money actually moved. Anything else is
/// acknowledged and logged, with no invoice change.
const SUCCESS_STATUSES: &[&str] = &["settlement", "capture", "success", "paid"];

/// A payment notification, normalized from the gateway's callback body.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentNotification {
    /// The gateway's transaction id. Idempotency key for redelivery.
    pub external_id: String,
    /// The invoice number the payer referenced.
    pub correlation_id: String,
    pub status: String,
    pub amount: Decimal,
}

/// Every way a valid notification can land.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// The invoice moved to PAYMENT_RECEIVED.
    Reconciled { invoice_id: Uuid },
    /// This exact gateway transaction was seen before; nothing changed.
    AlreadyProcessed { invoice_id: Uuid },
    /// Payment already recorded through another path; nothing changed.
    AlreadySettled {
        invoice_id: Uuid,
        status: InvoiceStatus,
    },
    /// Non-success gateway status, acknowledged without a state change.
    Ignored { invoice_id: Uuid, status: String },
}

impl ReconcileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Reconciled { .. } => "reconciled",
            Self::AlreadyProcessed { .. } => "already_processed",
            Self::AlreadySettled { .. } => "already_settled",
            Self::Ignored { .. } => "ignored",
        }
    }
}

/// Webhook handler for gateway payment notifications
pub struct WebhookHandler {
    store: Arc<dyn BillingStore>,
}

impl WebhookHandler {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Reconcile one notification that arrived on `channel`.
    ///
    /// The checks run in a fixed order: fields present, invoice known,
    /// tenant not demo, transaction not seen before, invoice still
    /// payable, channel matches, amount within tolerance. Only then does
    /// the status decide between claiming the invoice and acknowledging a
    /// non-success callback.
    pub async fn handle_notification(
        &self,
        channel: &PaymentChannel,
        notification: &PaymentNotification,
    ) -> BillingResult<ReconcileOutcome> {
        let external_id = notification.external_id.trim();
        let correlation_id = notification.correlation_id.trim();
        let status = notification.status.trim().to_ascii_lowercase();
        if external_id.is_empty() || correlation_id.is_empty() || status.is_empty() {
            return Err(BillingError::Validation(
                "notification requires external_id, correlation_id and status".to_string(),
            ));
        }

        let invoice = self
            .store
            .invoice_by_number(correlation_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("invoice {correlation_id}")))?;

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

        // Redelivery of a transaction we already recorded is the normal
        // gateway retry path; answer success and change nothing.
        if invoice.external_payment_id.as_deref() == Some(external_id) {
            tracing::info!(
                invoice_number = %invoice.number,
                external_id = %external_id,
                "Duplicate notification for an already recorded transaction"
            );
            return Ok(ReconcileOutcome::AlreadyProcessed {
                invoice_id: invoice.id,
            });
        }

        if matches!(
            invoice.status,
            InvoiceStatus::Paid | InvoiceStatus::PaymentReceived
        ) {
            tracing::info!(
                invoice_number = %invoice.number,
                external_id = %external_id,
                invoice_status = %invoice.status,
                "Notification for an invoice already settled through another path"
            );
            return Ok(ReconcileOutcome::AlreadySettled {
                invoice_id: invoice.id,
                status: invoice.status,
            });
        }

        if invoice.status != InvoiceStatus::Unpaid {
            return Err(BillingError::InvalidState(format!(
                "invoice {} is {} and cannot take a payment",
                invoice.number, invoice.status
            )));
        }

        if invoice.channel != *channel {
            return Err(BillingError::ChannelMismatch {
                expected: invoice.channel.as_str().to_string(),
                got: channel.as_str().to_string(),
            });
        }

        let expected = invoice.expected_total();
        if (expected - notification.amount).abs() > AMOUNT_TOLERANCE {
            return Err(BillingError::AmountMismatch {
                expected,
                got: notification.amount,
            });
        }

        if !SUCCESS_STATUSES.contains(&status.as_str()) {
            tracing::info!(
                invoice_number = %invoice.number,
                external_id = %external_id,
                gateway_status = %status,
                "Non-success notification acknowledged"
            );
            return Ok(ReconcileOutcome::Ignored {
                invoice_id: invoice.id,
                status,
            });
        }

        let received_at = OffsetDateTime::now_utc();
        if self
            .store
            .mark_payment_received(invoice.id, external_id, received_at)
            .await?
        {
            tracing::info!(
                invoice_id = %invoice.id,
                invoice_number = %invoice.number,
                external_id = %external_id,
                amount = %notification.amount,
                "Payment notification reconciled"
            );
            return Ok(ReconcileOutcome::Reconciled {
                invoice_id: invoice.id,
            });
        }

        // The guarded write lost a race. Re-read and degrade to the same
        // no-op answers a later delivery would have gotten.
        let refreshed = self
            .store
            .invoice(invoice.id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("invoice {correlation_id}")))?;
        if refreshed.external_payment_id.as_deref() == Some(external_id) {
            return Ok(ReconcileOutcome::AlreadyProcessed {
                invoice_id: refreshed.id,
            });
        }
        if matches!(
            refreshed.status,
            InvoiceStatus::Paid | InvoiceStatus::PaymentReceived
        ) {
            return Ok(ReconcileOutcome::AlreadySettled {
                invoice_id: refreshed.id,
                status: refreshed.status,
            });
        }
        Err(BillingError::InvalidState(format!(
            "invoice {} is {} and cannot take a payment",
            refreshed.number, refreshed.status
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_statuses_are_lowercase_compared() {
        for status in ["settlement", "capture", "success", "paid"] {
            assert!(SUCCESS_STATUSES.contains(&status));
        }
        assert!(!SUCCESS_STATUSES.contains(&"pending"));
        assert!(!SUCCESS_STATUSES.contains(&"deny"));
        assert!(!SUCCESS_STATUSES.contains(&"expire"));
    }

    #[test]
    fn outcome_labels_are_stable() {
        let id = Uuid::new_v4();
        assert_eq!(
            ReconcileOutcome::Reconciled { invoice_id: id }.label(),
            "reconciled"
        );
        assert_eq!(
            ReconcileOutcome::AlreadyProcessed { invoice_id: id }.label(),
            "already_processed"
        );
        assert_eq!(
            ReconcileOutcome::AlreadySettled {
                invoice_id: id,
                status: InvoiceStatus::Paid
            }
            .label(),
            "already_settled"
        );
        assert_eq!(
            ReconcileOutcome::Ignored {
                invoice_id: id,
                status: "pending".to_string()
            }
            .label(),
            "ignored"
        );
    }

    #[test]
    fn tolerance_is_one_unit_inclusive() {
        let expected = Decimal::new(150_137, 0);
        for (reported, ok) in [
            (Decimal::new(150_137, 0), true),
            (Decimal::new(1_501_365, 1), true), // 150136.5
            (Decimal::new(150_138, 0), true),   // exactly one unit over
            (Decimal::new(150_135, 0), false),
            (Decimal::new(150_139, 0), false),
        ] {
            let within = (expected - reported).abs() <= AMOUNT_TOLERANCE;
            assert_eq!(within, ok, "reported {reported}");
        }
    }
}
