use std::collections::HashMap;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::ledger::models::Network;

/// Application settings, loaded from defaults overridden by the environment.
///
/// Environment keys use the `PAYGATE_` prefix and `__` as the nesting
/// separator, e.g. `PAYGATE_CHAIN__GATEWAY_URL`.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub payments: PaymentSettings,
    pub chain: ChainSettings,
    pub webhooks: WebhookSettings,
    pub jobs: JobSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaymentSettings {
    /// Base URL of the hosted checkout page
    pub base_url: String,
    pub max_amount: Decimal,
    pub default_expiry_minutes: i64,
    pub min_expiry_minutes: i64,
    pub max_expiry_minutes: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainSettings {
    pub gateway_url: String,
    pub gateway_api_key: Option<String>,
    /// Shared receiving wallet per network
    pub deposit_addresses: HashMap<Network, String>,
    /// Network payment requests are issued on
    pub payment_network: Network,
    /// Network merchant payouts are sent on
    pub payout_network: Network,
    pub confirmation_poll_secs: u64,
    pub confirmation_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookSettings {
    pub timeout_secs: u64,
    /// Shared secret for inbound chain-event webhooks
    pub inbound_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobSettings {
    pub expiry_sweep_secs: u64,
    pub pending_refresh_secs: u64,
    pub payout_reconcile_secs: u64,
    /// UTC hour settlement batches are cut (0-23)
    pub settlement_hour: u32,
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        let builder = config::Config::builder()
            .set_default("database_url", "postgresql://localhost/paygate")?
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("payments.base_url", "http://localhost:3000")?
            .set_default("payments.max_amount", "1000000")?
            .set_default("payments.default_expiry_minutes", 30)?
            .set_default("payments.min_expiry_minutes", 5)?
            .set_default("payments.max_expiry_minutes", 1440)?
            .set_default("chain.gateway_url", "http://localhost:8545")?
            .set_default("chain.payment_network", "polygon")?
            .set_default("chain.payout_network", "polygon")?
            .set_default("chain.confirmation_poll_secs", 15)?
            .set_default("chain.confirmation_timeout_secs", 1800)?
            .set_default("chain.deposit_addresses.polygon", "")?
            .set_default("webhooks.timeout_secs", 10)?
            .set_default("webhooks.inbound_secret", "")?
            .set_default("jobs.expiry_sweep_secs", 60)?
            .set_default("jobs.pending_refresh_secs", 60)?
            .set_default("jobs.payout_reconcile_secs", 300)?
            .set_default("jobs.settlement_hour", 2)?
            .set_override_option("database_url", std::env::var("DATABASE_URL").ok())?
            .set_override_option("bind_address", std::env::var("BIND_ADDRESS").ok())?
            .add_source(
                config::Environment::with_prefix("PAYGATE")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AppResult<()> {
        if self.payments.max_amount <= Decimal::ZERO {
            return Err(AppError::Config("payments.max_amount must be positive".into()));
        }
        if self.payments.min_expiry_minutes > self.payments.max_expiry_minutes {
            return Err(AppError::Config("expiry bounds are inverted".into()));
        }
        if self.jobs.settlement_hour > 23 {
            return Err(AppError::Config("jobs.settlement_hour must be 0-23".into()));
        }
        Ok(())
    }
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            max_amount: dec!(1_000_000),
            default_expiry_minutes: 30,
            min_expiry_minutes: 5,
            max_expiry_minutes: 1440,
        }
    }
}

impl ChainSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.confirmation_poll_secs)
    }

    pub fn watch_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn deposit_address(&self, network: Network) -> Option<&str> {
        self.deposit_addresses
            .get(&network)
            .map(String::as_str)
            .filter(|address| !address.is_empty())
    }
}
