//! API server configuration, loaded from the environment.

use anyhow::Context;
use lingkar_billing::BillingConfig;

/// Everything the API binary needs to start.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// HS256 secret for bearer tokens issued by the platform.
    pub jwt_secret: String,
    /// Shared secret for gateway webhook signatures.
    pub webhook_secret: String,
    pub db_max_connections: u32,
    pub allowed_origins: Vec<String>,
    pub billing: BillingConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = required("DATABASE_URL")?;
        let jwt_secret = required("JWT_SECRET")?;
        let webhook_secret = required("WEBHOOK_SECRET")?;

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let db_max_connections = match std::env::var("DB_MAX_CONNECTIONS") {
            Ok(v) => v
                .parse::<u32>()
                .context("DB_MAX_CONNECTIONS must be a positive integer")?,
            Err(_) => 10,
        };

        let allowed_origins: Vec<String> = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let billing = BillingConfig::from_env()?;

        Ok(Self {
            database_url,
            bind_address,
            jwt_secret,
            webhook_secret,
            db_max_connections,
            allowed_origins,
            billing,
        })
    }
}

fn required(name: &'static str) -> anyhow::Result<String> {
    let value = std::env::var(name).with_context(|| format!("{name} must be set"))?;
    if value.trim().is_empty() {
        anyhow::bail!("{name} must not be empty");
    }
    Ok(value)
}
