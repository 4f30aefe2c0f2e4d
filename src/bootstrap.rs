use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::info;

use crate::{
    api::handler::AppState,
    chain::{ChainClient, HttpChainClient},
    config::Config,
    error::{AppError, AppResult},
    ledger::{LedgerRepository, LedgerStore},
    merchants::{MerchantDirectory, MerchantRepository},
    notify::{HttpWebhookTransport, Notifier},
    payments::{PaymentLedger, PaymentService},
    reconciliation::{ConfirmationTracker, TransactionMatcher},
    settlement::{PayoutExecutor, SettlementBatcher, SettlementScheduler},
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let pool = initialize_database(&config.database_url).await?;

    let store: Arc<dyn LedgerStore> = Arc::new(LedgerRepository::new(pool.clone()));
    let merchants: Arc<dyn MerchantDirectory> = Arc::new(MerchantRepository::new(pool.clone()));

    let chain: Arc<dyn ChainClient> = Arc::new(HttpChainClient::new(&config.chain)?);
    info!("✅ Chain gateway client configured: {}", config.chain.gateway_url);

    let payment_network = config.chain.payment_network;
    let deposit_address = config
        .chain
        .deposit_address(payment_network)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| {
            AppError::Config(format!("No deposit address configured for {}", payment_network))
        })?
        .to_string();
    info!("✅ Accepting payments on {} at {}", payment_network, deposit_address);

    let transport = Arc::new(HttpWebhookTransport::new(Duration::from_secs(
        config.webhooks.timeout_secs,
    ))?);
    let notifier = Arc::new(Notifier::new(store.clone(), merchants.clone(), transport));

    let ledger = Arc::new(PaymentLedger::new(
        store.clone(),
        merchants.clone(),
        config.payments.clone(),
        payment_network,
        deposit_address,
    ));
    let tracker = Arc::new(ConfirmationTracker::new(
        chain.clone(),
        config.chain.poll_interval(),
        config.chain.watch_timeout(),
    ));
    let matcher = Arc::new(TransactionMatcher::new(
        store.clone(),
        ledger.clone(),
        chain.clone(),
        tracker.clone(),
        notifier.clone(),
    ));
    let batcher = Arc::new(SettlementBatcher::new(
        store.clone(),
        merchants.clone(),
        config.chain.payout_network,
    ));
    let payouts = Arc::new(PayoutExecutor::new(
        store.clone(),
        merchants,
        chain,
        tracker,
        notifier.clone(),
    ));

    let service = Arc::new(PaymentService::new(
        store, ledger, matcher, batcher, payouts, notifier,
    ));

    let scheduler = SettlementScheduler::new(config.jobs.clone(), service.clone());
    let jobs = scheduler.start();
    info!(
        "✅ {} background jobs started (settlement at {:02}:00 UTC)",
        jobs.len(),
        config.jobs.settlement_hour
    );

    if config.webhooks.inbound_secret.is_empty() {
        tracing::warn!("⚠️  Inbound webhook secret not set - chain webhooks will be rejected");
    }

    Ok(AppState {
        pool,
        service,
        inbound_secret: Arc::new(config.webhooks.inbound_secret.clone()),
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(50)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 50 max connections");

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
