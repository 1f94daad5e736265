//! Tenant lookups for the billing core.
//!
//! Read-mostly: the only tenant write in this crate happens inside the
//! activation transaction. Purchase eligibility itself lives on
//! [`crate::model::Tenant::can_initiate_self_purchase`].

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::model::{CoverageScope, Invoice, Subscription, Tenant, TenantStatus};
use crate::store::BillingStore;

/// Billing-owner chains are one hop in practice (self or the paying
/// primary); anything deeper than this is a data fault.
const MAX_OWNER_HOPS: usize = 4;

pub struct TenantService {
    store: Arc<dyn BillingStore>,
}

/// Read-only aggregate for the administrative UI.
#[derive(Debug, Clone, Serialize)]
pub struct BillingStatus {
    pub tenant_id: Uuid,
    pub status: TenantStatus,
    pub effective_status: TenantStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub active_until: Option<OffsetDateTime>,
    pub active_subscription: Option<Subscription>,
    pub open_invoice: Option<Invoice>,
}

impl TenantService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn tenant(&self, id: Uuid) -> BillingResult<Tenant> {
        self.store
            .tenant(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("tenant {id}")))
    }

    /// Resolve the tenant that is actually charged by following
    /// `billing_owner_id` until it self-references.
    pub async fn billing_owner(&self, tenant: &Tenant) -> BillingResult<Tenant> {
        let mut current = tenant.clone();
        for _ in 0..MAX_OWNER_HOPS {
            if current.billing_owner_id == current.id {
                return Ok(current);
            }
            current = self.tenant(current.billing_owner_id).await?;
        }
        Err(BillingError::Validation(format!(
            "billing owner chain for tenant {} does not terminate",
            tenant.id
        )))
    }

    /// Point-in-time billing view: stored status, trial-aware effective
    /// status, the active subscription and the open invoice, if any.
    pub async fn billing_status(
        &self,
        id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<BillingStatus> {
        let tenant = self.tenant(id).await?;

        let active_subscription = match self
            .store
            .active_subscription(id, CoverageScope::Single)
            .await?
        {
            Some(s) => Some(s),
            None => {
                self.store
                    .active_subscription(id, CoverageScope::Hierarchy)
                    .await?
            }
        };
        let open_invoice = self.store.current_invoice(id).await?;

        Ok(BillingStatus {
            tenant_id: tenant.id,
            status: tenant.status,
            effective_status: tenant.effective_status(now),
            active_until: tenant.active_until,
            active_subscription,
            open_invoice,
        })
    }
}
