//! Billing Invariants Module
//!
//! Provides runnable consistency checks for the billing system.
//! These invariants can be run after any mutation or webhook replay to ensure
//! the system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write
//! 4. **Complete**: Covers all critical billing consistency requirements

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Tenant(s) affected
    pub tenant_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - money may be attributed incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for multiple active subscriptions violation
#[derive(Debug, sqlx::FromRow)]
struct MultipleActiveSubsRow {
    tenant_id: Uuid,
    scope: String,
    sub_count: i64,
}

/// Row type for split sum mismatch violation
#[derive(Debug, sqlx::FromRow)]
struct SplitSumMismatchRow {
    invoice_id: Uuid,
    tenant_id: Uuid,
    invoice_number: String,
    amount: rust_decimal::Decimal,
    split_total: rust_decimal::Decimal,
}

/// Row type for paid invoices missing timestamps
#[derive(Debug, sqlx::FromRow)]
struct PaidWithoutTimestampRow {
    invoice_id: Uuid,
    tenant_id: Uuid,
    invoice_number: String,
}

/// Row type for received invoices missing the gateway transaction id
#[derive(Debug, sqlx::FromRow)]
struct ReceivedWithoutExternalIdRow {
    invoice_id: Uuid,
    tenant_id: Uuid,
    invoice_number: String,
}

/// Row type for out-of-range disambiguation codes
#[derive(Debug, sqlx::FromRow)]
struct CodeOutOfRangeRow {
    invoice_id: Uuid,
    tenant_id: Uuid,
    invoice_number: String,
    unique_code: i32,
}

/// Row type for recurring subscriptions with a broken window
#[derive(Debug, sqlx::FromRow)]
struct BrokenWindowRow {
    subscription_id: Uuid,
    tenant_id: Uuid,
    starts_at: OffsetDateTime,
    ends_at: Option<OffsetDateTime>,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        // Run all checks
        violations.extend(self.check_single_active_subscription().await?);
        violations.extend(self.check_splits_sum_to_invoice_amount().await?);
        violations.extend(self.check_paid_invoice_has_timestamps().await?);
        violations.extend(self.check_received_invoice_has_external_id().await?);
        violations.extend(self.check_unique_code_in_range().await?);
        violations.extend(self.check_recurring_window_ordered().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: At most 1 active subscription per (tenant, scope)
    ///
    /// A second active subscription of the same scope means a payment
    /// activated without expiring its predecessor — the tenant would be
    /// double-charged on the next cycle.
    async fn check_single_active_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleActiveSubsRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, scope, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status = 'active'
            GROUP BY tenant_id, scope
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Tenant has {} active '{}' subscriptions (expected at most 1)",
                    row.sub_count, row.scope
                ),
                context: serde_json::json!({
                    "scope": row.scope,
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Revenue splits sum to the invoice amount
    ///
    /// The split rows are the money's routing table; if they don't add up
    /// to the invoice amount, someone is being over- or under-paid.
    async fn check_splits_sum_to_invoice_amount(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SplitSumMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                i.id as invoice_id,
                i.tenant_id,
                i.number as invoice_number,
                i.amount,
                COALESCE(SUM(rs.amount), 0) as split_total
            FROM invoices i
            LEFT JOIN revenue_splits rs ON rs.invoice_id = i.id
            GROUP BY i.id, i.tenant_id, i.number, i.amount
            HAVING COALESCE(SUM(rs.amount), 0) != i.amount
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "splits_sum_to_invoice_amount".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Invoice {} is for {} but its revenue splits sum to {}",
                    row.invoice_number, row.amount, row.split_total
                ),
                context: serde_json::json!({
                    "invoice_id": row.invoice_id,
                    "invoice_number": row.invoice_number,
                    "amount": row.amount,
                    "split_total": row.split_total,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: PAID invoices carry a payment timestamp
    ///
    /// paid_at anchors the activated service window; a PAID invoice
    /// without it means the activation transaction was bypassed.
    async fn check_paid_invoice_has_timestamps(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidWithoutTimestampRow> = sqlx::query_as(
            r#"
            SELECT id as invoice_id, tenant_id, number as invoice_number
            FROM invoices
            WHERE status = 'paid' AND paid_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_invoice_has_timestamps".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Invoice {} is PAID but has no paid_at timestamp",
                    row.invoice_number
                ),
                context: serde_json::json!({
                    "invoice_id": row.invoice_id,
                    "invoice_number": row.invoice_number,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: PAYMENT_RECEIVED invoices carry the gateway id
    ///
    /// The external transaction id is the webhook idempotency key; a
    /// received invoice without one cannot dedupe redeliveries.
    async fn check_received_invoice_has_external_id(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ReceivedWithoutExternalIdRow> = sqlx::query_as(
            r#"
            SELECT id as invoice_id, tenant_id, number as invoice_number
            FROM invoices
            WHERE status = 'payment_received' AND external_payment_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "received_invoice_has_external_id".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Invoice {} is PAYMENT_RECEIVED but has no gateway transaction id",
                    row.invoice_number
                ),
                context: serde_json::json!({
                    "invoice_id": row.invoice_id,
                    "invoice_number": row.invoice_number,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: Disambiguation codes stay in 1..=999
    ///
    /// Codes outside that band can collide with the next whole-thousand
    /// amount and mis-attribute a pooled transfer.
    async fn check_unique_code_in_range(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CodeOutOfRangeRow> = sqlx::query_as(
            r#"
            SELECT id as invoice_id, tenant_id, number as invoice_number, unique_code
            FROM invoices
            WHERE unique_code IS NOT NULL
              AND (unique_code < 1 OR unique_code > 999)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "unique_code_in_range".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Invoice {} carries disambiguation code {} (expected 1-999)",
                    row.invoice_number, row.unique_code
                ),
                context: serde_json::json!({
                    "invoice_id": row.invoice_id,
                    "invoice_number": row.invoice_number,
                    "unique_code": row.unique_code,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 6: Recurring subscriptions have an ordered window
    ///
    /// A recurring subscription must end strictly after it starts;
    /// perpetual subscriptions are the only open-ended ones.
    async fn check_recurring_window_ordered(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BrokenWindowRow> = sqlx::query_as(
            r#"
            SELECT id as subscription_id, tenant_id, starts_at, ends_at
            FROM subscriptions
            WHERE recurrence = 'recurring'
              AND (ends_at IS NULL OR ends_at <= starts_at)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "recurring_window_ordered".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Recurring subscription {} has window {} .. {:?}",
                    row.subscription_id, row.starts_at, row.ends_at
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "starts_at": row.starts_at.to_string(),
                    "ends_at": row.ends_at.map(|e| e.to_string()),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a specific invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_active_subscription" => self.check_single_active_subscription().await,
            "splits_sum_to_invoice_amount" => self.check_splits_sum_to_invoice_amount().await,
            "paid_invoice_has_timestamps" => self.check_paid_invoice_has_timestamps().await,
            "received_invoice_has_external_id" => {
                self.check_received_invoice_has_external_id().await
            }
            "unique_code_in_range" => self.check_unique_code_in_range().await,
            "recurring_window_ordered" => self.check_recurring_window_ordered().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_subscription",
            "splits_sum_to_invoice_amount",
            "paid_invoice_has_timestamps",
            "received_invoice_has_external_id",
            "unique_code_in_range",
            "recurring_window_ordered",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"single_active_subscription"));
        assert!(checks.contains(&"splits_sum_to_invoice_amount"));
    }
}
