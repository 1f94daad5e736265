// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Tests critical boundary conditions and race conditions in:
//! - Purchases (BILL-P01 to BILL-P10)
//! - Payment resolution (BILL-PAY01 to BILL-PAY10)
//! - Webhook reconciliation (BILL-W01 to BILL-W11)
//! - Activation (BILL-A01 to BILL-A10)
//! - Billing status and admin transitions (BILL-T01 to BILL-T05)

#[cfg(test)]
mod fixtures {
    use std::sync::Arc;

    use rust_decimal::Decimal;
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    use crate::memory::MemoryStore;
    use crate::model::*;
    use crate::subscriptions::PurchaseRequest;
    use crate::{BillingConfig, BillingService};

    pub fn config() -> BillingConfig {
        BillingConfig {
            gateway_channels: vec!["banktransfer".to_string(), "qris".to_string()],
            ..BillingConfig::default()
        }
    }

    pub fn service(store: &MemoryStore) -> BillingService {
        BillingService::new(Arc::new(store.clone()), config())
    }

    pub fn tenant(status: TenantStatus, role: TenantRole, mode: BillingMode) -> Tenant {
        let id = Uuid::new_v4();
        Tenant {
            id,
            name: "RW 07 Sukamaju".to_string(),
            role,
            status,
            billing_mode: mode,
            billing_owner_id: id,
            parent_id: None,
            trial_starts_at: None,
            trial_ends_at: None,
            active_until: None,
        }
    }

    pub fn primary_active() -> Tenant {
        tenant(
            TenantStatus::Active,
            TenantRole::Primary,
            BillingMode::SelfManaged,
        )
    }

    pub fn demo_tenant() -> Tenant {
        tenant(
            TenantStatus::Demo,
            TenantRole::Primary,
            BillingMode::SelfManaged,
        )
    }

    /// A subordinate whose invoices are paid by `primary`.
    pub fn centralized_subordinate(primary: &Tenant) -> Tenant {
        let mut t = tenant(
            TenantStatus::Active,
            TenantRole::Subordinate,
            BillingMode::Centralized,
        );
        t.billing_owner_id = primary.id;
        t.parent_id = Some(primary.id);
        t
    }

    pub fn member_of(tenant_id: Uuid) -> Principal {
        Principal {
            actor_id: Uuid::new_v4(),
            tenant_id,
            platform_admin: false,
        }
    }

    pub fn platform_admin() -> Principal {
        Principal {
            actor_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            platform_admin: true,
        }
    }

    pub fn monthly_request(tenant_id: Uuid) -> PurchaseRequest {
        PurchaseRequest {
            tenant_id,
            plan_code: "warga-standard".to_string(),
            recurrence: RecurrenceType::Recurring,
            period: Some(BillingPeriod::Monthly),
            price: Decimal::new(150_000, 0),
            scope: CoverageScope::Single,
        }
    }

    pub fn perpetual_request(tenant_id: Uuid) -> PurchaseRequest {
        PurchaseRequest {
            tenant_id,
            plan_code: "arsip-digital".to_string(),
            recurrence: RecurrenceType::Perpetual,
            period: None,
            price: Decimal::new(500_000, 0),
            scope: CoverageScope::Single,
        }
    }

    /// Hand-built pending subscription for flows the purchase path refuses
    /// to stage (demo tenants, centralized recurring).
    pub fn pending_subscription(
        tenant_id: Uuid,
        recurrence: RecurrenceType,
        starts_at: OffsetDateTime,
        ends_at: Option<OffsetDateTime>,
    ) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            tenant_id,
            plan_code: "warga-standard".to_string(),
            recurrence,
            period: match recurrence {
                RecurrenceType::Recurring => Some(BillingPeriod::Monthly),
                RecurrenceType::Perpetual => None,
            },
            price: Decimal::new(150_000, 0),
            starts_at,
            ends_at,
            status: SubscriptionStatus::Unpaid,
            scope: CoverageScope::Single,
            source: SubscriptionSource::SelfPurchased,
            created_at: starts_at,
        }
    }

    pub fn unpaid_invoice(tenant: &Tenant, subscription: &Subscription) -> Invoice {
        let now = OffsetDateTime::now_utc();
        Invoice {
            id: Uuid::new_v4(),
            number: format!("INV-2026-{:06}", rand_suffix()),
            tenant_id: tenant.id,
            billing_owner_id: tenant.billing_owner_id,
            subscription_id: subscription.id,
            amount: subscription.price,
            status: InvoiceStatus::Unpaid,
            payment_mode: PaymentMode::Centralized,
            channel: PaymentChannel::Manual,
            unique_code: None,
            external_payment_id: None,
            issued_at: now,
            due_at: now + Duration::days(7),
            received_at: None,
            paid_at: None,
            period_starts_at: None,
            period_ends_at: None,
        }
    }

    fn rand_suffix() -> u32 {
        use rand::Rng;
        rand::rng().random_range(0..1_000_000)
    }
}

#[cfg(test)]
mod purchase_tests {
    use rust_decimal::Decimal;
    use time::Duration;

    use super::fixtures::*;
    use crate::error::BillingError;
    use crate::memory::MemoryStore;
    use crate::model::*;
    use crate::store::BillingStore;

    // =========================================================================
    // BILL-P01: Demo tenant purchase - blocked outright
    // =========================================================================
    #[tokio::test]
    async fn test_demo_tenant_cannot_purchase() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let demo = demo_tenant();
        store.insert_tenant(&demo).await.unwrap();

        let err = svc
            .subscriptions
            .create_purchase(monthly_request(demo.id), &member_of(demo.id))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::TenantBlocked { tenant_id } if tenant_id == demo.id));
    }

    // =========================================================================
    // BILL-P02: Centralized subordinate recurring purchase - policy error
    // =========================================================================
    #[tokio::test]
    async fn test_centralized_subordinate_cannot_buy_recurring() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let primary = primary_active();
        let sub = centralized_subordinate(&primary);
        store.insert_tenant(&primary).await.unwrap();
        store.insert_tenant(&sub).await.unwrap();

        let err = svc
            .subscriptions
            .create_purchase(monthly_request(sub.id), &member_of(sub.id))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::BillingPolicy(_)));
    }

    // =========================================================================
    // BILL-P03: Centralized subordinate perpetual purchase - allowed, and
    // the invoice is payable by the primary
    // =========================================================================
    #[tokio::test]
    async fn test_centralized_subordinate_can_buy_perpetual() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let primary = primary_active();
        let sub = centralized_subordinate(&primary);
        store.insert_tenant(&primary).await.unwrap();
        store.insert_tenant(&sub).await.unwrap();

        let purchase = svc
            .subscriptions
            .create_purchase(perpetual_request(sub.id), &member_of(sub.id))
            .await
            .unwrap();

        assert_eq!(purchase.subscription.status, SubscriptionStatus::Unpaid);
        assert_eq!(purchase.subscription.ends_at, None);
        assert_eq!(purchase.invoice.status, InvoiceStatus::Unpaid);
        assert_eq!(
            purchase.invoice.billing_owner_id, primary.id,
            "the paying primary is frozen onto the invoice"
        );
    }

    // =========================================================================
    // BILL-P04: Purchase initiated by an unrelated tenant - unauthorized
    // =========================================================================
    #[tokio::test]
    async fn test_outsider_cannot_purchase_for_tenant() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let t = primary_active();
        store.insert_tenant(&t).await.unwrap();

        let err = svc
            .subscriptions
            .create_purchase(monthly_request(t.id), &member_of(uuid::Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Unauthorized(_)));
    }

    // =========================================================================
    // BILL-P05: Platform admin may purchase on behalf of any tenant
    // =========================================================================
    #[tokio::test]
    async fn test_platform_admin_can_purchase_for_any_tenant() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let t = primary_active();
        store.insert_tenant(&t).await.unwrap();

        let purchase = svc
            .subscriptions
            .create_purchase(monthly_request(t.id), &platform_admin())
            .await
            .unwrap();
        assert_eq!(purchase.subscription.tenant_id, t.id);
    }

    // =========================================================================
    // BILL-P06: Monthly window spans one calendar month from purchase
    // =========================================================================
    #[tokio::test]
    async fn test_monthly_window_is_one_calendar_month() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let t = primary_active();
        store.insert_tenant(&t).await.unwrap();

        let purchase = svc
            .subscriptions
            .create_purchase(monthly_request(t.id), &member_of(t.id))
            .await
            .unwrap();

        let s = purchase.subscription;
        let span = s.ends_at.unwrap() - s.starts_at;
        assert!(
            span >= Duration::days(28) && span <= Duration::days(31),
            "got {span}"
        );
    }

    // =========================================================================
    // BILL-P07: Yearly window spans one calendar year from purchase
    // =========================================================================
    #[tokio::test]
    async fn test_yearly_window_is_one_calendar_year() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let t = primary_active();
        store.insert_tenant(&t).await.unwrap();

        let mut request = monthly_request(t.id);
        request.period = Some(BillingPeriod::Yearly);
        let purchase = svc
            .subscriptions
            .create_purchase(request, &member_of(t.id))
            .await
            .unwrap();

        let s = purchase.subscription;
        let span = s.ends_at.unwrap() - s.starts_at;
        assert!(
            span >= Duration::days(365) && span <= Duration::days(366),
            "got {span}"
        );
    }

    // =========================================================================
    // BILL-P08: Invoice amount is frozen from the price; splits sum to it
    // =========================================================================
    #[tokio::test]
    async fn test_invoice_freezes_price_and_splits_balance() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let primary = primary_active();
        let mut sub = centralized_subordinate(&primary);
        // Self-managed so it can buy its own recurring plan; still a
        // subordinate of the primary, so the parent earns commission.
        sub.billing_mode = BillingMode::SelfManaged;
        sub.billing_owner_id = sub.id;
        store.insert_tenant(&primary).await.unwrap();
        store.insert_tenant(&sub).await.unwrap();

        let purchase = svc
            .subscriptions
            .create_purchase(monthly_request(sub.id), &member_of(sub.id))
            .await
            .unwrap();

        assert_eq!(purchase.invoice.amount, Decimal::new(150_000, 0));
        let total: Decimal = purchase.splits.iter().map(|s| s.amount).sum();
        assert_eq!(total, purchase.invoice.amount);
        assert_eq!(purchase.splits.len(), 2);
        assert_eq!(purchase.splits[0].beneficiary, Beneficiary::ParentTenant);
        assert_eq!(purchase.splits[0].beneficiary_tenant_id, Some(primary.id));
    }

    // =========================================================================
    // BILL-P09: A taken invoice number is a store-level conflict
    // =========================================================================
    #[tokio::test]
    async fn test_duplicate_invoice_number_is_conflict() {
        let store = MemoryStore::new();
        let t = primary_active();
        store.insert_tenant(&t).await.unwrap();

        let now = time::OffsetDateTime::now_utc();
        let sub_a = pending_subscription(t.id, RecurrenceType::Perpetual, now, None);
        let sub_b = pending_subscription(t.id, RecurrenceType::Perpetual, now, None);
        let invoice_a = unpaid_invoice(&t, &sub_a);
        let mut invoice_b = unpaid_invoice(&t, &sub_b);
        invoice_b.number = invoice_a.number.clone();

        store.create_purchase(&sub_a, &invoice_a, &[]).await.unwrap();
        let err = store
            .create_purchase(&sub_b, &invoice_b, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
    }

    // =========================================================================
    // BILL-P10: Due date honors the configured horizon
    // =========================================================================
    #[tokio::test]
    async fn test_invoice_due_date_uses_config() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let t = primary_active();
        store.insert_tenant(&t).await.unwrap();

        let purchase = svc
            .subscriptions
            .create_purchase(monthly_request(t.id), &member_of(t.id))
            .await
            .unwrap();
        assert_eq!(
            purchase.invoice.due_at - purchase.invoice.issued_at,
            Duration::days(7)
        );
    }
}

#[cfg(test)]
mod payment_tests {
    use rust_decimal::Decimal;

    use super::fixtures::*;
    use crate::error::BillingError;
    use crate::memory::MemoryStore;
    use crate::model::*;
    use crate::payments::PaymentStrategy;
    use crate::store::BillingStore;

    async fn staged_invoice(store: &MemoryStore) -> (Tenant, Invoice) {
        let svc = service(store);
        let t = primary_active();
        store.insert_tenant(&t).await.unwrap();
        let purchase = svc
            .subscriptions
            .create_purchase(monthly_request(t.id), &member_of(t.id))
            .await
            .unwrap();
        (t, purchase.invoice)
    }

    // =========================================================================
    // BILL-PAY01: Manual instruction carries the bare amount and no code
    // =========================================================================
    #[tokio::test]
    async fn test_manual_instruction_bare_amount() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let (t, invoice) = staged_invoice(&store).await;

        let instruction = svc
            .payments
            .request_instruction(invoice.id, &PaymentChannel::Manual, &member_of(t.id))
            .await
            .unwrap();

        assert_eq!(instruction.channel, PaymentChannel::Manual);
        assert_eq!(instruction.unique_code, None);
        assert_eq!(instruction.amount_total, invoice.amount);

        let stored = store.invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.channel, PaymentChannel::Manual);
        assert_eq!(stored.unique_code, None);
    }

    // =========================================================================
    // BILL-PAY02: Gateway instruction adds a 1-999 code to the total
    // =========================================================================
    #[tokio::test]
    async fn test_gateway_instruction_adds_code() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let (t, invoice) = staged_invoice(&store).await;

        let instruction = svc
            .payments
            .request_instruction(
                invoice.id,
                &PaymentChannel::from("banktransfer"),
                &member_of(t.id),
            )
            .await
            .unwrap();

        let code = instruction.unique_code.unwrap();
        assert!((1..=999).contains(&code));
        assert_eq!(
            instruction.amount_total,
            invoice.amount + Decimal::from(code)
        );

        let stored = store.invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.unique_code, Some(code));
        assert_eq!(stored.channel, PaymentChannel::from("banktransfer"));
    }

    // =========================================================================
    // BILL-PAY03: Re-requesting an instruction keeps the same total
    // =========================================================================
    #[tokio::test]
    async fn test_repeated_instruction_reuses_code() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let (t, invoice) = staged_invoice(&store).await;
        let channel = PaymentChannel::from("banktransfer");
        let principal = member_of(t.id);

        let first = svc
            .payments
            .request_instruction(invoice.id, &channel, &principal)
            .await
            .unwrap();
        let second = svc
            .payments
            .request_instruction(invoice.id, &channel, &principal)
            .await
            .unwrap();

        assert_eq!(first.unique_code, second.unique_code);
        assert_eq!(first.amount_total, second.amount_total);
    }

    // =========================================================================
    // BILL-PAY04: Unknown gateway id - validation error
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_gateway_rejected() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let (t, invoice) = staged_invoice(&store).await;

        let err = svc
            .payments
            .request_instruction(
                invoice.id,
                &PaymentChannel::from("paypal"),
                &member_of(t.id),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    // =========================================================================
    // BILL-PAY05: Outsider cannot request an instruction
    // =========================================================================
    #[tokio::test]
    async fn test_outsider_cannot_pay() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let (_, invoice) = staged_invoice(&store).await;

        let err = svc
            .payments
            .request_instruction(
                invoice.id,
                &PaymentChannel::Manual,
                &member_of(uuid::Uuid::new_v4()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Unauthorized(_)));
    }

    // =========================================================================
    // BILL-PAY06: Demo tenant invoice is blocked from payment attempts
    // =========================================================================
    #[tokio::test]
    async fn test_demo_invoice_blocked() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let demo = demo_tenant();
        store.insert_tenant(&demo).await.unwrap();

        let now = time::OffsetDateTime::now_utc();
        let sub = pending_subscription(demo.id, RecurrenceType::Perpetual, now, None);
        let invoice = unpaid_invoice(&demo, &sub);
        store.put_subscription(sub).await;
        store.put_invoice(invoice.clone()).await;

        let err = svc
            .payments
            .request_instruction(invoice.id, &PaymentChannel::Manual, &member_of(demo.id))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::TenantBlocked { .. }));
    }

    // =========================================================================
    // BILL-PAY07: Centralized subordinate - recurring blocked, perpetual pays
    // =========================================================================
    #[tokio::test]
    async fn test_centralized_subordinate_payment_policy() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let primary = primary_active();
        let sub_tenant = centralized_subordinate(&primary);
        store.insert_tenant(&primary).await.unwrap();
        store.insert_tenant(&sub_tenant).await.unwrap();
        let payer = member_of(primary.id);

        // Recurring: staged by hand because the purchase path refuses it.
        let now = time::OffsetDateTime::now_utc();
        let recurring = pending_subscription(
            sub_tenant.id,
            RecurrenceType::Recurring,
            now,
            Some(now + time::Duration::days(30)),
        );
        let mut recurring_invoice = unpaid_invoice(&sub_tenant, &recurring);
        recurring_invoice.billing_owner_id = primary.id;
        store.put_subscription(recurring).await;
        store.put_invoice(recurring_invoice.clone()).await;

        let err = svc
            .payments
            .request_instruction(recurring_invoice.id, &PaymentChannel::Manual, &payer)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::BillingPolicy(_)));

        // Perpetual: the one-time exemption.
        let purchase = svc
            .subscriptions
            .create_purchase(perpetual_request(sub_tenant.id), &member_of(sub_tenant.id))
            .await
            .unwrap();
        let instruction = svc
            .payments
            .request_instruction(purchase.invoice.id, &PaymentChannel::Manual, &payer)
            .await
            .unwrap();
        assert_eq!(instruction.amount_total, purchase.invoice.amount);
    }

    // =========================================================================
    // BILL-PAY08: Paying a canceled invoice - invalid state
    // =========================================================================
    #[tokio::test]
    async fn test_canceled_invoice_cannot_take_payment() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let (t, invoice) = staged_invoice(&store).await;
        let principal = member_of(t.id);

        svc.invoices.cancel(invoice.id, &principal).await.unwrap();
        let err = svc
            .payments
            .request_instruction(invoice.id, &PaymentChannel::Manual, &principal)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));
    }

    // =========================================================================
    // BILL-PAY09: Resolver returns the matching closed-set variant
    // =========================================================================
    #[tokio::test]
    async fn test_resolver_strategy_selection() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let (t, invoice) = staged_invoice(&store).await;
        let principal = member_of(t.id);

        let manual = svc
            .payments
            .resolve(invoice.id, &PaymentChannel::Manual, &principal)
            .await
            .unwrap();
        assert_eq!(manual, PaymentStrategy::Manual);

        let gateway = svc
            .payments
            .resolve(invoice.id, &PaymentChannel::from("qris"), &principal)
            .await
            .unwrap();
        assert_eq!(gateway, PaymentStrategy::Gateway("qris".to_string()));
    }

    // =========================================================================
    // BILL-PAY10: Split-mode invoice gets the bare amount, no code
    // =========================================================================
    #[tokio::test]
    async fn test_split_mode_instruction_has_no_code() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let t = primary_active();
        store.insert_tenant(&t).await.unwrap();

        let now = time::OffsetDateTime::now_utc();
        let sub = pending_subscription(t.id, RecurrenceType::Perpetual, now, None);
        let mut invoice = unpaid_invoice(&t, &sub);
        invoice.payment_mode = PaymentMode::Split;
        store.put_subscription(sub).await;
        store.put_invoice(invoice.clone()).await;

        let instruction = svc
            .payments
            .request_instruction(
                invoice.id,
                &PaymentChannel::from("banktransfer"),
                &member_of(t.id),
            )
            .await
            .unwrap();
        assert_eq!(instruction.unique_code, None);
        assert_eq!(instruction.amount_total, invoice.amount);
    }
}

#[cfg(test)]
mod webhook_tests {
    use rust_decimal::Decimal;

    use super::fixtures::*;
    use crate::error::BillingError;
    use crate::memory::MemoryStore;
    use crate::model::*;
    use crate::store::BillingStore;
    use crate::webhooks::{PaymentNotification, ReconcileOutcome};

    /// Stage a purchase and bind it to the bank-transfer gateway, returning
    /// the bound invoice and the exact total a correct transfer carries.
    async fn gateway_invoice(store: &MemoryStore) -> (Tenant, Invoice, Decimal) {
        let svc = service(store);
        let t = primary_active();
        store.insert_tenant(&t).await.unwrap();
        let purchase = svc
            .subscriptions
            .create_purchase(monthly_request(t.id), &member_of(t.id))
            .await
            .unwrap();
        let instruction = svc
            .payments
            .request_instruction(
                purchase.invoice.id,
                &PaymentChannel::from("banktransfer"),
                &member_of(t.id),
            )
            .await
            .unwrap();
        let invoice = store.invoice(purchase.invoice.id).await.unwrap().unwrap();
        (t, invoice, instruction.amount_total)
    }

    fn notification(invoice: &Invoice, amount: Decimal) -> PaymentNotification {
        PaymentNotification {
            external_id: "TXN-20260801-0001".to_string(),
            correlation_id: invoice.number.clone(),
            status: "settlement".to_string(),
            amount,
        }
    }

    fn banktransfer() -> PaymentChannel {
        PaymentChannel::from("banktransfer")
    }

    // =========================================================================
    // BILL-W01: Missing required fields - validation error
    // =========================================================================
    #[tokio::test]
    async fn test_blank_fields_rejected() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let n = PaymentNotification {
            external_id: "  ".to_string(),
            correlation_id: "INV-2026-000001".to_string(),
            status: "settlement".to_string(),
            amount: Decimal::new(150_000, 0),
        };
        let err = svc
            .webhooks
            .handle_notification(&banktransfer(), &n)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    // =========================================================================
    // BILL-W02: Unknown correlation id - not found
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_invoice_not_found() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let n = PaymentNotification {
            external_id: "TXN-1".to_string(),
            correlation_id: "INV-2026-999999".to_string(),
            status: "settlement".to_string(),
            amount: Decimal::new(150_000, 0),
        };
        let err = svc
            .webhooks
            .handle_notification(&banktransfer(), &n)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    // =========================================================================
    // BILL-W03: Demo tenant invoice - blocked
    // =========================================================================
    #[tokio::test]
    async fn test_demo_invoice_blocked_from_webhook() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let demo = demo_tenant();
        store.insert_tenant(&demo).await.unwrap();
        let now = time::OffsetDateTime::now_utc();
        let sub = pending_subscription(demo.id, RecurrenceType::Perpetual, now, None);
        let invoice = unpaid_invoice(&demo, &sub);
        store.put_subscription(sub).await;
        store.put_invoice(invoice.clone()).await;

        let err = svc
            .webhooks
            .handle_notification(&banktransfer(), &notification(&invoice, invoice.amount))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::TenantBlocked { .. }));
    }

    // =========================================================================
    // BILL-W04: Matching notification parks the invoice at PAYMENT_RECEIVED
    // =========================================================================
    #[tokio::test]
    async fn test_successful_reconciliation() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let (_, invoice, total) = gateway_invoice(&store).await;

        let outcome = svc
            .webhooks
            .handle_notification(&banktransfer(), &notification(&invoice, total))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Reconciled { invoice_id } if invoice_id == invoice.id));

        let stored = store.invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::PaymentReceived);
        assert_eq!(
            stored.external_payment_id.as_deref(),
            Some("TXN-20260801-0001")
        );
        assert!(stored.received_at.is_some());
    }

    // =========================================================================
    // BILL-W05: Redelivery of the same transaction - exactly one transition
    // =========================================================================
    #[tokio::test]
    async fn test_redelivery_is_noop() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let (_, invoice, total) = gateway_invoice(&store).await;
        let n = notification(&invoice, total);

        let first = svc
            .webhooks
            .handle_notification(&banktransfer(), &n)
            .await
            .unwrap();
        assert_eq!(first.label(), "reconciled");

        let second = svc
            .webhooks
            .handle_notification(&banktransfer(), &n)
            .await
            .unwrap();
        assert!(
            matches!(second, ReconcileOutcome::AlreadyProcessed { invoice_id } if invoice_id == invoice.id)
        );

        let stored = store.invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::PaymentReceived, "no double move");
    }

    // =========================================================================
    // BILL-W06: Different transaction against a settled invoice - no-op
    // =========================================================================
    #[tokio::test]
    async fn test_second_transaction_on_settled_invoice() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let (_, invoice, total) = gateway_invoice(&store).await;

        svc.webhooks
            .handle_notification(&banktransfer(), &notification(&invoice, total))
            .await
            .unwrap();

        let mut other = notification(&invoice, total);
        other.external_id = "TXN-20260801-0002".to_string();
        let outcome = svc
            .webhooks
            .handle_notification(&banktransfer(), &other)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ReconcileOutcome::AlreadySettled {
                status: InvoiceStatus::PaymentReceived,
                ..
            }
        ));
    }

    // =========================================================================
    // BILL-W07: Canceled invoice - invalid state
    // =========================================================================
    #[tokio::test]
    async fn test_canceled_invoice_rejects_notification() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let (t, invoice, total) = gateway_invoice(&store).await;

        svc.invoices
            .cancel(invoice.id, &member_of(t.id))
            .await
            .unwrap();
        let err = svc
            .webhooks
            .handle_notification(&banktransfer(), &notification(&invoice, total))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));
    }

    // =========================================================================
    // BILL-W08: Notification on the wrong channel - mismatch
    // =========================================================================
    #[tokio::test]
    async fn test_channel_mismatch() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let (_, invoice, total) = gateway_invoice(&store).await;

        let err = svc
            .webhooks
            .handle_notification(
                &PaymentChannel::from("qris"),
                &notification(&invoice, total),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ChannelMismatch { .. }));
    }

    // =========================================================================
    // BILL-W09: Amount tolerance - half a unit passes, two units fail
    // =========================================================================
    #[tokio::test]
    async fn test_amount_tolerance() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let (_, invoice, total) = gateway_invoice(&store).await;

        // Two units short: rejected, invoice untouched.
        let short = notification(&invoice, total - Decimal::new(2, 0));
        let err = svc
            .webhooks
            .handle_notification(&banktransfer(), &short)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::AmountMismatch { .. }));
        let stored = store.invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Unpaid);

        // Half a unit short: within tolerance, reconciled.
        let close = notification(&invoice, total - Decimal::new(5, 1));
        let outcome = svc
            .webhooks
            .handle_notification(&banktransfer(), &close)
            .await
            .unwrap();
        assert_eq!(outcome.label(), "reconciled");
    }

    // =========================================================================
    // BILL-W10: Non-success status acknowledged without a state change
    // =========================================================================
    #[tokio::test]
    async fn test_pending_status_ignored() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let (_, invoice, total) = gateway_invoice(&store).await;

        let mut n = notification(&invoice, total);
        n.status = "pending".to_string();
        let outcome = svc
            .webhooks
            .handle_notification(&banktransfer(), &n)
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Ignored { .. }));

        let stored = store.invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Unpaid);
        assert_eq!(stored.external_payment_id, None);
    }

    // =========================================================================
    // BILL-W11: Concurrent duplicate deliveries - one wins, one no-ops
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_deliveries_transition_once() {
        use std::sync::Arc;
        use tokio::sync::Barrier;

        let store = MemoryStore::new();
        let svc = Arc::new(service(&store));
        let (_, invoice, total) = gateway_invoice(&store).await;
        let n = notification(&invoice, total);

        let barrier = Arc::new(Barrier::new(2));
        let mut handles = vec![];
        for _ in 0..2 {
            let svc = Arc::clone(&svc);
            let barrier = Arc::clone(&barrier);
            let n = n.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                svc.webhooks
                    .handle_notification(&PaymentChannel::from("banktransfer"), &n)
                    .await
            }));
        }

        let mut outcomes = vec![];
        for handle in handles {
            outcomes.push(handle.await.unwrap().unwrap());
        }

        let reconciled = outcomes
            .iter()
            .filter(|o| o.label() == "reconciled")
            .count();
        assert_eq!(reconciled, 1, "exactly one delivery claims the invoice");

        let stored = store.invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::PaymentReceived);
    }
}

#[cfg(test)]
mod activation_tests {
    use time::{Duration, OffsetDateTime};

    use super::fixtures::*;
    use crate::error::BillingError;
    use crate::memory::MemoryStore;
    use crate::model::*;
    use crate::store::BillingStore;

    // =========================================================================
    // BILL-A01: Manual confirm from UNPAID activates everything at once
    // =========================================================================
    #[tokio::test]
    async fn test_confirm_activates_invoice_subscription_tenant() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let mut t = primary_active();
        t.status = TenantStatus::Expired;
        store.insert_tenant(&t).await.unwrap();

        let purchase = svc
            .subscriptions
            .create_purchase(monthly_request(t.id), &member_of(t.id))
            .await
            .unwrap();
        let activation = svc
            .activation
            .confirm_payment(purchase.invoice.id, &member_of(t.id))
            .await
            .unwrap();

        let invoice = store.invoice(purchase.invoice.id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.paid_at, Some(activation.paid_at));
        assert_eq!(invoice.period_starts_at, Some(activation.starts_at));
        assert_eq!(invoice.period_ends_at, activation.ends_at);

        let subscription = store
            .subscription(purchase.subscription.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subscription.status, SubscriptionStatus::Active);

        let tenant = store.tenant(t.id).await.unwrap().unwrap();
        assert_eq!(tenant.status, TenantStatus::Active, "expired tenant unlocked");
        assert_eq!(tenant.active_until, activation.ends_at);
    }

    // =========================================================================
    // BILL-A02: Confirm still required after the webhook hand-off
    // =========================================================================
    #[tokio::test]
    async fn test_confirm_after_payment_received() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let t = primary_active();
        store.insert_tenant(&t).await.unwrap();

        let purchase = svc
            .subscriptions
            .create_purchase(monthly_request(t.id), &member_of(t.id))
            .await
            .unwrap();
        store
            .mark_payment_received(purchase.invoice.id, "TXN-1", OffsetDateTime::now_utc())
            .await
            .unwrap();

        svc.activation
            .confirm_payment(purchase.invoice.id, &member_of(t.id))
            .await
            .unwrap();
        let invoice = store.invoice(purchase.invoice.id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
    }

    // =========================================================================
    // BILL-A03: Late payment re-bases the window, duration intact
    // =========================================================================
    #[tokio::test]
    async fn test_window_shifts_to_payment_moment() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let t = primary_active();
        store.insert_tenant(&t).await.unwrap();

        // Purchased three days ago, paid now.
        let purchased_at = OffsetDateTime::now_utc() - Duration::days(3);
        let sub = pending_subscription(
            t.id,
            RecurrenceType::Recurring,
            purchased_at,
            Some(purchased_at + Duration::days(30)),
        );
        let invoice = unpaid_invoice(&t, &sub);
        store.put_subscription(sub.clone()).await;
        store.put_invoice(invoice.clone()).await;

        let activation = svc
            .activation
            .confirm_payment(invoice.id, &member_of(t.id))
            .await
            .unwrap();

        assert!(activation.starts_at > purchased_at + Duration::days(2));
        assert_eq!(
            activation.ends_at.unwrap() - activation.starts_at,
            Duration::days(30),
            "paid duration preserved from the payment moment"
        );
    }

    // =========================================================================
    // BILL-A04: Perpetual activation leaves the window open-ended
    // =========================================================================
    #[tokio::test]
    async fn test_perpetual_activation_never_expires() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let t = primary_active();
        store.insert_tenant(&t).await.unwrap();

        let purchase = svc
            .subscriptions
            .create_purchase(perpetual_request(t.id), &member_of(t.id))
            .await
            .unwrap();
        let activation = svc
            .activation
            .confirm_payment(purchase.invoice.id, &member_of(t.id))
            .await
            .unwrap();

        assert_eq!(activation.ends_at, None);
        let tenant = store.tenant(t.id).await.unwrap().unwrap();
        assert_eq!(tenant.active_until, None);
    }

    // =========================================================================
    // BILL-A05: Second confirm - invalid state
    // =========================================================================
    #[tokio::test]
    async fn test_double_confirm_rejected() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let t = primary_active();
        store.insert_tenant(&t).await.unwrap();

        let purchase = svc
            .subscriptions
            .create_purchase(monthly_request(t.id), &member_of(t.id))
            .await
            .unwrap();
        svc.activation
            .confirm_payment(purchase.invoice.id, &member_of(t.id))
            .await
            .unwrap();
        let err = svc
            .activation
            .confirm_payment(purchase.invoice.id, &member_of(t.id))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));
    }

    // =========================================================================
    // BILL-A06: Activation expires the superseded active subscription
    // =========================================================================
    #[tokio::test]
    async fn test_superseded_subscription_expires() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let t = primary_active();
        store.insert_tenant(&t).await.unwrap();

        let now = OffsetDateTime::now_utc();
        let mut old = pending_subscription(
            t.id,
            RecurrenceType::Recurring,
            now - Duration::days(20),
            Some(now + Duration::days(10)),
        );
        old.status = SubscriptionStatus::Active;
        store.put_subscription(old.clone()).await;

        let purchase = svc
            .subscriptions
            .create_purchase(monthly_request(t.id), &member_of(t.id))
            .await
            .unwrap();
        svc.activation
            .confirm_payment(purchase.invoice.id, &member_of(t.id))
            .await
            .unwrap();

        let superseded = store.subscription(old.id).await.unwrap().unwrap();
        assert_eq!(superseded.status, SubscriptionStatus::Expired);
        let fresh = store
            .subscription(purchase.subscription.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.status, SubscriptionStatus::Active);
    }

    // =========================================================================
    // BILL-A07: A failing tenant write rolls the whole activation back
    // =========================================================================
    #[tokio::test]
    async fn test_activation_is_atomic() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let t = primary_active();
        store.insert_tenant(&t).await.unwrap();

        let purchase = svc
            .subscriptions
            .create_purchase(monthly_request(t.id), &member_of(t.id))
            .await
            .unwrap();

        store.set_fail_tenant_update(true);
        let err = svc
            .activation
            .confirm_payment(purchase.invoice.id, &member_of(t.id))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Database(_)));

        let invoice = store.invoice(purchase.invoice.id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Unpaid, "invoice untouched");
        let subscription = store
            .subscription(purchase.subscription.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            subscription.status,
            SubscriptionStatus::Unpaid,
            "subscription untouched"
        );

        // Clearing the failpoint lets the same confirm go through.
        store.set_fail_tenant_update(false);
        svc.activation
            .confirm_payment(purchase.invoice.id, &member_of(t.id))
            .await
            .unwrap();
    }

    // =========================================================================
    // BILL-A08: Demo tenant confirm - blocked
    // =========================================================================
    #[tokio::test]
    async fn test_demo_confirm_blocked() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let demo = demo_tenant();
        store.insert_tenant(&demo).await.unwrap();
        let now = OffsetDateTime::now_utc();
        let sub = pending_subscription(demo.id, RecurrenceType::Perpetual, now, None);
        let invoice = unpaid_invoice(&demo, &sub);
        store.put_subscription(sub).await;
        store.put_invoice(invoice.clone()).await;

        let err = svc
            .activation
            .confirm_payment(invoice.id, &platform_admin())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::TenantBlocked { .. }));
    }

    // =========================================================================
    // BILL-A09: Outsider confirm - unauthorized
    // =========================================================================
    #[tokio::test]
    async fn test_outsider_confirm_unauthorized() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let t = primary_active();
        store.insert_tenant(&t).await.unwrap();
        let purchase = svc
            .subscriptions
            .create_purchase(monthly_request(t.id), &member_of(t.id))
            .await
            .unwrap();

        let err = svc
            .activation
            .confirm_payment(purchase.invoice.id, &member_of(uuid::Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Unauthorized(_)));
    }

    // =========================================================================
    // BILL-A10: Racing confirms - exactly one wins
    // =========================================================================
    #[tokio::test]
    async fn test_racing_confirms_activate_once() {
        use std::sync::Arc;
        use tokio::sync::Barrier;

        let store = MemoryStore::new();
        let svc = Arc::new(service(&store));
        let t = primary_active();
        store.insert_tenant(&t).await.unwrap();
        let purchase = svc
            .subscriptions
            .create_purchase(monthly_request(t.id), &member_of(t.id))
            .await
            .unwrap();
        let principal = member_of(t.id);

        let barrier = Arc::new(Barrier::new(2));
        let mut handles = vec![];
        for _ in 0..2 {
            let svc = Arc::clone(&svc);
            let barrier = Arc::clone(&barrier);
            let invoice_id = purchase.invoice.id;
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                svc.activation.confirm_payment(invoice_id, &principal).await
            }));
        }

        let mut ok = 0;
        let mut invalid = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(BillingError::InvalidState(_)) => invalid += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1, "exactly one confirm wins");
        assert_eq!(invalid, 1);

        let subscription = store
            .subscription(purchase.subscription.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subscription.status, SubscriptionStatus::Active);
    }
}

#[cfg(test)]
mod billing_status_tests {
    use time::{Duration, OffsetDateTime};

    use super::fixtures::*;
    use crate::error::BillingError;
    use crate::memory::MemoryStore;
    use crate::model::*;
    use crate::store::BillingStore;

    // =========================================================================
    // BILL-T01: Trial past its window reads expired, nothing written
    // =========================================================================
    #[tokio::test]
    async fn test_billing_status_reflects_trial_expiry() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let mut t = primary_active();
        t.status = TenantStatus::Trial;
        t.trial_ends_at = Some(OffsetDateTime::now_utc() - Duration::days(1));
        store.insert_tenant(&t).await.unwrap();

        let status = svc
            .tenants
            .billing_status(t.id, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(status.status, TenantStatus::Trial);
        assert_eq!(status.effective_status, TenantStatus::Expired);

        let stored = store.tenant(t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TenantStatus::Trial, "no write happened");
    }

    // =========================================================================
    // BILL-T02: Full cycle surfaces in the status view
    // =========================================================================
    #[tokio::test]
    async fn test_billing_status_after_cycle() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let t = primary_active();
        store.insert_tenant(&t).await.unwrap();

        let purchase = svc
            .subscriptions
            .create_purchase(monthly_request(t.id), &member_of(t.id))
            .await
            .unwrap();

        let mid = svc
            .tenants
            .billing_status(t.id, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert!(mid.active_subscription.is_none());
        assert_eq!(
            mid.open_invoice.as_ref().map(|i| i.id),
            Some(purchase.invoice.id)
        );

        svc.activation
            .confirm_payment(purchase.invoice.id, &member_of(t.id))
            .await
            .unwrap();

        let done = svc
            .tenants
            .billing_status(t.id, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(
            done.active_subscription.as_ref().map(|s| s.id),
            Some(purchase.subscription.id)
        );
        assert!(done.open_invoice.is_none());
        assert!(done.active_until.is_some());
    }

    // =========================================================================
    // BILL-T03: Cancel and refund follow the status machine
    // =========================================================================
    #[tokio::test]
    async fn test_admin_transitions_follow_status_machine() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let t = primary_active();
        store.insert_tenant(&t).await.unwrap();
        let principal = member_of(t.id);

        // Cancel an open invoice: fine.
        let purchase = svc
            .subscriptions
            .create_purchase(monthly_request(t.id), &principal)
            .await
            .unwrap();
        let canceled = svc.invoices.cancel(purchase.invoice.id, &principal).await.unwrap();
        assert_eq!(canceled.status, InvoiceStatus::Canceled);

        // Cancel it again: the guard refuses terminal states.
        let err = svc
            .invoices
            .cancel(purchase.invoice.id, &principal)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));

        // Refund is only reachable from an open invoice.
        let second = svc
            .subscriptions
            .create_purchase(monthly_request(t.id), &principal)
            .await
            .unwrap();
        store
            .mark_payment_received(second.invoice.id, "TXN-9", OffsetDateTime::now_utc())
            .await
            .unwrap();
        let refunded = svc
            .invoices
            .refund(second.invoice.id, &principal)
            .await
            .unwrap();
        assert_eq!(refunded.status, InvoiceStatus::Refunded);
    }

    // =========================================================================
    // BILL-T04: Current invoice returns the latest open one
    // =========================================================================
    #[tokio::test]
    async fn test_current_invoice_is_latest_open() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let t = primary_active();
        store.insert_tenant(&t).await.unwrap();
        let principal = member_of(t.id);

        let first = svc
            .subscriptions
            .create_purchase(monthly_request(t.id), &principal)
            .await
            .unwrap();
        svc.invoices.cancel(first.invoice.id, &principal).await.unwrap();

        let second = svc
            .subscriptions
            .create_purchase(monthly_request(t.id), &principal)
            .await
            .unwrap();
        let current = svc.invoices.current_invoice(t.id).await.unwrap().unwrap();
        assert_eq!(current.id, second.invoice.id);
    }

    // =========================================================================
    // BILL-T05: Billing owner chain resolves through the paying primary
    // =========================================================================
    #[tokio::test]
    async fn test_billing_owner_chain() {
        let store = MemoryStore::new();
        let svc = service(&store);
        let primary = primary_active();
        let sub = centralized_subordinate(&primary);
        store.insert_tenant(&primary).await.unwrap();
        store.insert_tenant(&sub).await.unwrap();

        let owner = svc
            .tenants
            .billing_owner(&store.tenant(sub.id).await.unwrap().unwrap())
            .await
            .unwrap();
        assert_eq!(owner.id, primary.id);
    }
}
