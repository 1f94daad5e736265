//! Core billing entities and their status machines.
//!
//! All statuses persist as lowercase strings; the `as_str`/`parse` pairs are
//! the single source of truth for that mapping.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

// ============================================================================
// Tenant
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantRole {
    Primary,
    Subordinate,
}

impl TenantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Subordinate => "subordinate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(Self::Primary),
            "subordinate" => Some(Self::Subordinate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Demo,
    Trial,
    Active,
    Expired,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Demo => "demo",
            Self::Trial => "trial",
            Self::Active => "active",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "demo" => Some(Self::Demo),
            "trial" => Some(Self::Trial),
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a tenant's invoices get paid. Required at tenant creation; there is
/// no implicit fallback anywhere downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    SelfManaged,
    Centralized,
}

impl BillingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SelfManaged => "self_managed",
            Self::Centralized => "centralized",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "self_managed" => Some(Self::SelfManaged),
            "centralized" => Some(Self::Centralized),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub role: TenantRole,
    pub status: TenantStatus,
    pub billing_mode: BillingMode,
    /// The tenant that is actually charged. Defaults to self; for a
    /// centralized subordinate it points at the paying primary.
    pub billing_owner_id: Uuid,
    pub parent_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_starts_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    /// Denormalized end of the confirmed subscription window.
    #[serde(with = "time::serde::rfc3339::option")]
    pub active_until: Option<OffsetDateTime>,
}

impl Tenant {
    /// Point-in-time status: a trial past its window reads as expired
    /// without anything being written.
    pub fn effective_status(&self, now: OffsetDateTime) -> TenantStatus {
        match (self.status, self.trial_ends_at) {
            (TenantStatus::Trial, Some(end)) if end <= now => TenantStatus::Expired,
            _ => self.status,
        }
    }

    /// Demo tenants never purchase; centralized subordinates are paid for
    /// by their primary and may not self-purchase.
    pub fn can_initiate_self_purchase(&self) -> bool {
        if self.status == TenantStatus::Demo {
            return false;
        }
        !(self.billing_mode == BillingMode::Centralized && self.role == TenantRole::Subordinate)
    }

    pub fn is_demo(&self) -> bool {
        self.status == TenantStatus::Demo
    }
}

// ============================================================================
// Subscription
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceType {
    Recurring,
    Perpetual,
}

impl RecurrenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recurring => "recurring",
            Self::Perpetual => "perpetual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "recurring" => Some(Self::Recurring),
            "perpetual" => Some(Self::Perpetual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Monthly,
    Yearly,
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(Self::Monthly),
            "yearly" => Some(Self::Yearly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Unpaid,
    Active,
    Expired,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unpaid => "unpaid",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unpaid" => Some(Self::Unpaid),
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a subscription covers: the buying tenant alone, or the tenant plus
/// every subordinate under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageScope {
    Single,
    Hierarchy,
}

impl CoverageScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Hierarchy => "hierarchy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "single" => Some(Self::Single),
            "hierarchy" => Some(Self::Hierarchy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionSource {
    SelfPurchased,
    Inherited,
}

impl SubscriptionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SelfPurchased => "self_purchased",
            Self::Inherited => "inherited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "self_purchased" => Some(Self::SelfPurchased),
            "inherited" => Some(Self::Inherited),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_code: String,
    pub recurrence: RecurrenceType,
    /// Absent for perpetual subscriptions.
    pub period: Option<BillingPeriod>,
    pub price: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    /// Null for perpetual subscriptions.
    #[serde(with = "time::serde::rfc3339::option")]
    pub ends_at: Option<OffsetDateTime>,
    pub status: SubscriptionStatus,
    pub scope: CoverageScope,
    pub source: SubscriptionSource,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Re-base a service window at `now`, preserving the original duration.
///
/// This is the only rollover rule: a paying tenant gets the full paid
/// duration counted from the moment of payment, never from the moment of
/// purchase. Open-ended windows stay open-ended.
pub fn shifted_window(
    starts_at: OffsetDateTime,
    ends_at: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> (OffsetDateTime, Option<OffsetDateTime>) {
    match ends_at {
        Some(ends) => (now, Some(now + (ends - starts_at))),
        None => (now, None),
    }
}

// ============================================================================
// Invoice
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Unpaid,
    PaymentReceived,
    Paid,
    Canceled,
    Refunded,
    Failed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Unpaid => "unpaid",
            Self::PaymentReceived => "payment_received",
            Self::Paid => "paid",
            Self::Canceled => "canceled",
            Self::Refunded => "refunded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "unpaid" => Some(Self::Unpaid),
            "payment_received" => Some(Self::PaymentReceived),
            "paid" => Some(Self::Paid),
            "canceled" => Some(Self::Canceled),
            "refunded" => Some(Self::Refunded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal statuses accept no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Paid | Self::Canceled | Self::Refunded | Self::Failed
        )
    }

    /// Open means a payment can still land on the invoice.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Unpaid | Self::PaymentReceived)
    }

    /// The invoice status machine. Manual confirmation is the UNPAID -> PAID
    /// edge; the webhook path goes through PAYMENT_RECEIVED.
    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        matches!(
            (self, next),
            (Draft, Unpaid)
                | (Unpaid, PaymentReceived)
                | (Unpaid, Paid)
                | (Unpaid, Canceled)
                | (Unpaid, Refunded)
                | (Unpaid, Failed)
                | (PaymentReceived, Paid)
                | (PaymentReceived, Canceled)
                | (PaymentReceived, Refunded)
                | (PaymentReceived, Failed)
        )
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMode {
    Centralized,
    Split,
}

impl PaymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Centralized => "centralized",
            Self::Split => "split",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "centralized" => Some(Self::Centralized),
            "split" => Some(Self::Split),
            _ => None,
        }
    }
}

/// Where a payment is expected to arrive: settled by hand against the
/// association's books, or through a named gateway channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PaymentChannel {
    Manual,
    Gateway(String),
}

impl PaymentChannel {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Manual => "manual",
            Self::Gateway(id) => id,
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, Self::Manual)
    }
}

impl From<String> for PaymentChannel {
    fn from(s: String) -> Self {
        if s == "manual" {
            Self::Manual
        } else {
            Self::Gateway(s)
        }
    }
}

impl From<&str> for PaymentChannel {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<PaymentChannel> for String {
    fn from(c: PaymentChannel) -> Self {
        c.as_str().to_string()
    }
}

impl std::fmt::Display for PaymentChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    /// Human-readable, globally unique. Also the correlation id gateways
    /// echo back in notifications.
    pub number: String,
    pub tenant_id: Uuid,
    /// Payer, resolved through the billing-owner chain and frozen at
    /// creation time.
    pub billing_owner_id: Uuid,
    pub subscription_id: Uuid,
    /// Copied from the subscription price at creation; never changes.
    pub amount: Decimal,
    pub status: InvoiceStatus,
    pub payment_mode: PaymentMode,
    pub channel: PaymentChannel,
    /// Small integer (1-999) added to the nominal amount so a pooled bank
    /// transfer maps back to exactly one invoice.
    pub unique_code: Option<i32>,
    /// Gateway transaction id, set once. The webhook idempotency key.
    pub external_payment_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub due_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub received_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    /// Service window served by this invoice, mirrored from the
    /// subscription when payment is confirmed.
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_starts_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_ends_at: Option<OffsetDateTime>,
}

impl Invoice {
    /// The total a transfer is expected to carry: nominal amount plus the
    /// disambiguation code when one was issued.
    pub fn expected_total(&self) -> Decimal {
        self.amount + Decimal::from(self.unique_code.unwrap_or(0))
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }
}

// ============================================================================
// Revenue split
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Beneficiary {
    Platform,
    ParentTenant,
}

impl Beneficiary {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Platform => "platform",
            Self::ParentTenant => "parent_tenant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "platform" => Some(Self::Platform),
            "parent_tenant" => Some(Self::ParentTenant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenueSplit {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub beneficiary: Beneficiary,
    /// Null for the platform's own share.
    pub beneficiary_tenant_id: Option<Uuid>,
    pub amount: Decimal,
}

// ============================================================================
// Principal
// ============================================================================

/// The authenticated caller, as handed over by the identity layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub actor_id: Uuid,
    pub tenant_id: Uuid,
    pub platform_admin: bool,
}

impl Principal {
    /// Payment actions require administrative standing over the tenant
    /// that is actually charged.
    pub fn can_act_for(&self, billing_owner_id: Uuid) -> bool {
        self.platform_admin || self.tenant_id == billing_owner_id
    }
}
