//! Application state

use sqlx::PgPool;
use std::sync::Arc;

use lingkar_billing::{BillingService, InvariantChecker};

use crate::auth::JwtManager;
use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub billing: Arc<BillingService>,
    /// On-demand consistency checks for the admin surface.
    pub invariants: Arc<InvariantChecker>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret);
        let billing = Arc::new(BillingService::postgres(
            pool.clone(),
            config.billing.clone(),
        ));
        let invariants = Arc::new(InvariantChecker::new(pool.clone()));

        Self {
            pool,
            config,
            jwt_manager,
            billing,
            invariants,
        }
    }
}
