//! Postgres-backed `BillingStore`.
//!
//! All SQL lives here. Multi-entity writes run inside one transaction; the
//! activation path locks the invoice row and re-checks its status so racing
//! confirmations serialize instead of double-activating.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::activation::Activation;
use crate::error::{BillingError, BillingResult};
use crate::model::{
    Beneficiary, BillingMode, BillingPeriod, CoverageScope, Invoice, InvoiceStatus,
    PaymentChannel, PaymentMode, RecurrenceType, RevenueSplit, Subscription, SubscriptionSource,
    SubscriptionStatus, Tenant, TenantRole, TenantStatus,
};
use crate::store::BillingStore;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db(e: sqlx::Error) -> BillingError {
    BillingError::Database(e.to_string())
}

/// Unique-key violations are retryable conflicts (invoice numbering), not
/// opaque database failures.
fn db_write(e: sqlx::Error) -> BillingError {
    if let sqlx::Error::Database(ref inner) = e {
        if inner.is_unique_violation() {
            return BillingError::Conflict(inner.message().to_string());
        }
    }
    db(e)
}

fn corrupt(field: &str, value: &str) -> BillingError {
    BillingError::Database(format!("unexpected {field} value '{value}'"))
}

// ============================================================================
// Row mapping
// ============================================================================

#[derive(sqlx::FromRow)]
struct TenantRow {
    id: Uuid,
    name: String,
    role: String,
    status: String,
    billing_mode: String,
    billing_owner_id: Uuid,
    parent_id: Option<Uuid>,
    trial_starts_at: Option<OffsetDateTime>,
    trial_ends_at: Option<OffsetDateTime>,
    active_until: Option<OffsetDateTime>,
}

impl TenantRow {
    fn into_tenant(self) -> BillingResult<Tenant> {
        Ok(Tenant {
            id: self.id,
            name: self.name,
            role: TenantRole::parse(&self.role).ok_or_else(|| corrupt("tenant.role", &self.role))?,
            status: TenantStatus::parse(&self.status)
                .ok_or_else(|| corrupt("tenant.status", &self.status))?,
            billing_mode: BillingMode::parse(&self.billing_mode)
                .ok_or_else(|| corrupt("tenant.billing_mode", &self.billing_mode))?,
            billing_owner_id: self.billing_owner_id,
            parent_id: self.parent_id,
            trial_starts_at: self.trial_starts_at,
            trial_ends_at: self.trial_ends_at,
            active_until: self.active_until,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    tenant_id: Uuid,
    plan_code: String,
    recurrence: String,
    period: Option<String>,
    price: rust_decimal::Decimal,
    starts_at: OffsetDateTime,
    ends_at: Option<OffsetDateTime>,
    status: String,
    scope: String,
    source: String,
    created_at: OffsetDateTime,
}

impl SubscriptionRow {
    fn into_subscription(self) -> BillingResult<Subscription> {
        let period = match self.period {
            Some(ref p) => Some(
                BillingPeriod::parse(p).ok_or_else(|| corrupt("subscription.period", p))?,
            ),
            None => None,
        };
        Ok(Subscription {
            id: self.id,
            tenant_id: self.tenant_id,
            plan_code: self.plan_code,
            recurrence: RecurrenceType::parse(&self.recurrence)
                .ok_or_else(|| corrupt("subscription.recurrence", &self.recurrence))?,
            period,
            price: self.price,
            starts_at: self.starts_at,
            ends_at: self.ends_at,
            status: SubscriptionStatus::parse(&self.status)
                .ok_or_else(|| corrupt("subscription.status", &self.status))?,
            scope: CoverageScope::parse(&self.scope)
                .ok_or_else(|| corrupt("subscription.scope", &self.scope))?,
            source: SubscriptionSource::parse(&self.source)
                .ok_or_else(|| corrupt("subscription.source", &self.source))?,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InvoiceRow {
    id: Uuid,
    number: String,
    tenant_id: Uuid,
    billing_owner_id: Uuid,
    subscription_id: Uuid,
    amount: rust_decimal::Decimal,
    status: String,
    payment_mode: String,
    channel: String,
    unique_code: Option<i32>,
    external_payment_id: Option<String>,
    issued_at: OffsetDateTime,
    due_at: OffsetDateTime,
    received_at: Option<OffsetDateTime>,
    paid_at: Option<OffsetDateTime>,
    period_starts_at: Option<OffsetDateTime>,
    period_ends_at: Option<OffsetDateTime>,
}

impl InvoiceRow {
    fn into_invoice(self) -> BillingResult<Invoice> {
        Ok(Invoice {
            id: self.id,
            number: self.number,
            tenant_id: self.tenant_id,
            billing_owner_id: self.billing_owner_id,
            subscription_id: self.subscription_id,
            amount: self.amount,
            status: InvoiceStatus::parse(&self.status)
                .ok_or_else(|| corrupt("invoice.status", &self.status))?,
            payment_mode: PaymentMode::parse(&self.payment_mode)
                .ok_or_else(|| corrupt("invoice.payment_mode", &self.payment_mode))?,
            channel: PaymentChannel::from(self.channel),
            unique_code: self.unique_code,
            external_payment_id: self.external_payment_id,
            issued_at: self.issued_at,
            due_at: self.due_at,
            received_at: self.received_at,
            paid_at: self.paid_at,
            period_starts_at: self.period_starts_at,
            period_ends_at: self.period_ends_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SplitRow {
    id: Uuid,
    invoice_id: Uuid,
    beneficiary: String,
    beneficiary_tenant_id: Option<Uuid>,
    amount: rust_decimal::Decimal,
}

impl SplitRow {
    fn into_split(self) -> BillingResult<RevenueSplit> {
        Ok(RevenueSplit {
            id: self.id,
            invoice_id: self.invoice_id,
            beneficiary: Beneficiary::parse(&self.beneficiary)
                .ok_or_else(|| corrupt("revenue_split.beneficiary", &self.beneficiary))?,
            beneficiary_tenant_id: self.beneficiary_tenant_id,
            amount: self.amount,
        })
    }
}

const TENANT_COLUMNS: &str = "id, name, role, status, billing_mode, billing_owner_id, parent_id, \
     trial_starts_at, trial_ends_at, active_until";

const SUBSCRIPTION_COLUMNS: &str = "id, tenant_id, plan_code, recurrence, period, price, \
     starts_at, ends_at, status, scope, source, created_at";

const INVOICE_COLUMNS: &str = "id, number, tenant_id, billing_owner_id, subscription_id, amount, \
     status, payment_mode, channel, unique_code, external_payment_id, issued_at, due_at, \
     received_at, paid_at, period_starts_at, period_ends_at";

// ============================================================================
// Store implementation
// ============================================================================

#[async_trait]
impl BillingStore for PgStore {
    async fn tenant(&self, id: Uuid) -> BillingResult<Option<Tenant>> {
        let row: Option<TenantRow> =
            sqlx::query_as(&format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db)?;
        row.map(TenantRow::into_tenant).transpose()
    }

    async fn insert_tenant(&self, tenant: &Tenant) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tenants
                (id, name, role, status, billing_mode, billing_owner_id, parent_id,
                 trial_starts_at, trial_ends_at, active_until, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW(), NOW())
            "#,
        )
        .bind(tenant.id)
        .bind(&tenant.name)
        .bind(tenant.role.as_str())
        .bind(tenant.status.as_str())
        .bind(tenant.billing_mode.as_str())
        .bind(tenant.billing_owner_id)
        .bind(tenant.parent_id)
        .bind(tenant.trial_starts_at)
        .bind(tenant.trial_ends_at)
        .bind(tenant.active_until)
        .execute(&self.pool)
        .await
        .map_err(db_write)?;
        Ok(())
    }

    async fn subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.map(SubscriptionRow::into_subscription).transpose()
    }

    async fn active_subscription(
        &self,
        tenant_id: Uuid,
        scope: CoverageScope,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE tenant_id = $1 AND scope = $2 AND status = 'active'
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(tenant_id)
        .bind(scope.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.map(SubscriptionRow::into_subscription).transpose()
    }

    async fn invoice(&self, id: Uuid) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> =
            sqlx::query_as(&format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db)?;
        row.map(InvoiceRow::into_invoice).transpose()
    }

    async fn invoice_by_number(&self, number: &str) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE number = $1"
        ))
        .bind(number)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.map(InvoiceRow::into_invoice).transpose()
    }

    async fn current_invoice(&self, tenant_id: Uuid) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            r#"
            SELECT {INVOICE_COLUMNS} FROM invoices
            WHERE tenant_id = $1 AND status IN ('unpaid', 'payment_received')
            ORDER BY issued_at DESC
            LIMIT 1
            "#
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.map(InvoiceRow::into_invoice).transpose()
    }

    async fn revenue_splits(&self, invoice_id: Uuid) -> BillingResult<Vec<RevenueSplit>> {
        let rows: Vec<SplitRow> = sqlx::query_as(
            r#"
            SELECT id, invoice_id, beneficiary, beneficiary_tenant_id, amount
            FROM revenue_splits
            WHERE invoice_id = $1
            ORDER BY beneficiary
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.into_iter().map(SplitRow::into_split).collect()
    }

    async fn create_purchase(
        &self,
        subscription: &Subscription,
        invoice: &Invoice,
        splits: &[RevenueSplit],
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (id, tenant_id, plan_code, recurrence, period, price, starts_at, ends_at,
                 status, scope, source, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.tenant_id)
        .bind(&subscription.plan_code)
        .bind(subscription.recurrence.as_str())
        .bind(subscription.period.map(|p| p.as_str()))
        .bind(subscription.price)
        .bind(subscription.starts_at)
        .bind(subscription.ends_at)
        .bind(subscription.status.as_str())
        .bind(subscription.scope.as_str())
        .bind(subscription.source.as_str())
        .bind(subscription.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_write)?;

        sqlx::query(
            r#"
            INSERT INTO invoices
                (id, number, tenant_id, billing_owner_id, subscription_id, amount, status,
                 payment_mode, channel, unique_code, external_payment_id, issued_at, due_at,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW(), NOW())
            "#,
        )
        .bind(invoice.id)
        .bind(&invoice.number)
        .bind(invoice.tenant_id)
        .bind(invoice.billing_owner_id)
        .bind(invoice.subscription_id)
        .bind(invoice.amount)
        .bind(invoice.status.as_str())
        .bind(invoice.payment_mode.as_str())
        .bind(invoice.channel.as_str())
        .bind(invoice.unique_code)
        .bind(&invoice.external_payment_id)
        .bind(invoice.issued_at)
        .bind(invoice.due_at)
        .execute(&mut *tx)
        .await
        .map_err(db_write)?;

        for split in splits {
            sqlx::query(
                r#"
                INSERT INTO revenue_splits
                    (id, invoice_id, beneficiary, beneficiary_tenant_id, amount, created_at)
                VALUES ($1, $2, $3, $4, $5, NOW())
                "#,
            )
            .bind(split.id)
            .bind(split.invoice_id)
            .bind(split.beneficiary.as_str())
            .bind(split.beneficiary_tenant_id)
            .bind(split.amount)
            .execute(&mut *tx)
            .await
            .map_err(db_write)?;
        }

        audit(
            &mut tx,
            "invoice",
            invoice.id,
            "purchase_created",
            &serde_json::json!({
                "number": invoice.number,
                "subscription_id": subscription.id,
                "tenant_id": invoice.tenant_id,
                "amount": invoice.amount,
            }),
        )
        .await?;

        tx.commit().await.map_err(db)
    }

    async fn bind_payment_reference(
        &self,
        invoice_id: Uuid,
        channel: &PaymentChannel,
        unique_code: Option<i32>,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET channel = $2, unique_code = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'unpaid'
            "#,
        )
        .bind(invoice_id)
        .bind(channel.as_str())
        .bind(unique_code)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_payment_received(
        &self,
        invoice_id: Uuid,
        external_id: &str,
        received_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        // Single guarded write: the status and external-id conditions make
        // this safe under concurrent and repeated delivery.
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET status = 'payment_received', external_payment_id = $2, received_at = $3,
                updated_at = NOW()
            WHERE id = $1 AND status = 'unpaid' AND external_payment_id IS NULL
            "#,
        )
        .bind(invoice_id)
        .bind(external_id)
        .bind(received_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    async fn apply_activation(&self, activation: &Activation) -> BillingResult<()> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        // Lock the invoice row and re-check: a racing confirmation that
        // committed first must turn into InvalidState, not a double apply.
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM invoices WHERE id = $1 FOR UPDATE")
                .bind(activation.invoice_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db)?;
        let status = status
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", activation.invoice_id)))?;
        let status =
            InvoiceStatus::parse(&status).ok_or_else(|| corrupt("invoice.status", &status))?;
        if !status.is_open() {
            return Err(BillingError::InvalidState(format!(
                "invoice {} is {status}",
                activation.invoice_id
            )));
        }

        sqlx::query(
            r#"
            UPDATE invoices
            SET status = 'paid', paid_at = $2, period_starts_at = $3, period_ends_at = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(activation.invoice_id)
        .bind(activation.paid_at)
        .bind(activation.starts_at)
        .bind(activation.ends_at)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        // Supersede before activating: the one-active-per-(tenant, scope)
        // unique index must never see both rows active.
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'expired', updated_at = NOW()
            WHERE tenant_id = $1 AND scope = $2 AND status = 'active' AND id != $3
            "#,
        )
        .bind(activation.tenant_id)
        .bind(activation.scope.as_str())
        .bind(activation.subscription_id)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        let updated = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'active', starts_at = $2, ends_at = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'unpaid'
            "#,
        )
        .bind(activation.subscription_id)
        .bind(activation.starts_at)
        .bind(activation.ends_at)
        .execute(&mut *tx)
        .await
        .map_err(db_write)?;
        if updated.rows_affected() == 0 {
            return Err(BillingError::InvalidState(format!(
                "subscription {} is no longer pending",
                activation.subscription_id
            )));
        }

        sqlx::query(
            r#"
            UPDATE tenants
            SET status = 'active', active_until = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(activation.tenant_id)
        .bind(activation.ends_at)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        audit(
            &mut tx,
            "invoice",
            activation.invoice_id,
            "payment_confirmed",
            &serde_json::json!({
                "subscription_id": activation.subscription_id,
                "tenant_id": activation.tenant_id,
                "starts_at": activation.starts_at.to_string(),
                "ends_at": activation.ends_at.map(|t| t.to_string()),
            }),
        )
        .await?;

        tx.commit().await.map_err(db)
    }

    async fn transition_invoice(
        &self,
        invoice_id: Uuid,
        to: InvoiceStatus,
    ) -> BillingResult<bool> {
        let allowed_from: Vec<String> = [
            InvoiceStatus::Draft,
            InvoiceStatus::Unpaid,
            InvoiceStatus::PaymentReceived,
        ]
        .iter()
        .filter(|from| from.can_transition_to(to))
        .map(|from| from.as_str().to_string())
        .collect();

        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(invoice_id)
        .bind(to.as_str())
        .bind(&allowed_from)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }
}

async fn audit(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    entity: &str,
    entity_id: Uuid,
    action: &str,
    detail: &serde_json::Value,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO billing_audit (id, entity, entity_id, action, detail, created_at)
        VALUES ($1, $2, $3, $4, $5, NOW())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(entity)
    .bind(entity_id)
    .bind(action)
    .bind(detail.to_string())
    .execute(&mut **tx)
    .await
    .map_err(db)?;
    Ok(())
}
