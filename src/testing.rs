//! Test doubles for the external collaborators.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Barrier, RwLock};
use uuid::Uuid;

use crate::chain::{ChainClient, ChainTransactionDetails, ChainTxStatus};
use crate::config::{ChainSettings, PaymentSettings};
use crate::error::{AppError, AppResult, ChainError};
use crate::ledger::memory::MemoryLedger;
use crate::ledger::models::{
    BatchOutcome, ChainTransaction, Currency, DeliveryStatus, Merchant, MerchantStatus, Network,
    NewPayment, NewTransaction, Payment, PaymentStatus, Settlement, SettlementSchedule,
    SettlementStatus, TransactionStatus, WebhookEventType,
};
use crate::ledger::{BatchPricer, LedgerStore};
use crate::merchants::MerchantDirectory;
use crate::notify::{Notifier, WebhookTransport};
use crate::payments::ledger::PaymentLedger;
use crate::payments::service::PaymentService;
use crate::reconciliation::matcher::TransactionMatcher;
use crate::reconciliation::tracker::ConfirmationTracker;
use crate::settlement::batcher::SettlementBatcher;
use crate::settlement::payout::PayoutExecutor;

pub const DEPOSIT_ADDRESS: &str = "0xDePoSiT000000000000000000000000000000001";

pub fn active_merchant(fee_rate: Option<Decimal>) -> Merchant {
    Merchant {
        id: Uuid::new_v4(),
        status: MerchantStatus::Active,
        fee_rate,
        settlement_address: Some("0xmerchant0000000000000000000000000000001".to_string()),
        settlement_schedule: SettlementSchedule::Daily,
        webhook_url: Some("https://merchant.example/webhooks".to_string()),
        webhook_secret: Some("whsec_test".to_string()),
    }
}

pub fn payment_settings() -> PaymentSettings {
    PaymentSettings {
        base_url: "https://pay.example".to_string(),
        ..PaymentSettings::default()
    }
}

pub fn chain_settings() -> ChainSettings {
    let mut deposit_addresses = HashMap::new();
    deposit_addresses.insert(Network::Polygon, DEPOSIT_ADDRESS.to_string());
    deposit_addresses.insert(Network::Ethereum, DEPOSIT_ADDRESS.to_string());

    ChainSettings {
        gateway_url: "http://gateway.test".to_string(),
        gateway_api_key: None,
        deposit_addresses,
        payment_network: Network::Polygon,
        payout_network: Network::Polygon,
        confirmation_poll_secs: 1,
        confirmation_timeout_secs: 5,
    }
}

#[derive(Default)]
pub struct MemoryMerchants {
    merchants: RwLock<HashMap<Uuid, Merchant>>,
}

impl MemoryMerchants {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, merchant: Merchant) {
        self.merchants.write().await.insert(merchant.id, merchant);
    }
}

#[async_trait]
impl MerchantDirectory for MemoryMerchants {
    async fn find_by_id(&self, merchant_id: Uuid) -> AppResult<Option<Merchant>> {
        Ok(self.merchants.read().await.get(&merchant_id).cloned())
    }

    async fn list_active_by_schedule(
        &self,
        schedule: SettlementSchedule,
    ) -> AppResult<Vec<Merchant>> {
        Ok(self
            .merchants
            .read()
            .await
            .values()
            .filter(|m| m.is_active() && m.settlement_schedule == schedule)
            .cloned()
            .collect())
    }
}

/// Chain client whose transactions and transfer results are set by the test
#[derive(Default)]
pub struct ScriptedChain {
    transactions: Mutex<HashMap<String, ChainTransactionDetails>>,
    transfers: Mutex<Vec<(String, Decimal, Network)>>,
    transfer_error: Mutex<Option<String>>,
    lookups: Mutex<usize>,
}

impl ScriptedChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, details: ChainTransactionDetails) {
        self.transactions.lock().insert(details.hash.clone(), details);
    }

    pub fn set_confirmations(&self, hash: &str, confirmations: u64) {
        if let Some(tx) = self.transactions.lock().get_mut(hash) {
            tx.confirmations = confirmations;
            if tx.status == ChainTxStatus::Pending && confirmations > 0 {
                tx.status = ChainTxStatus::Success;
            }
        }
    }

    pub fn set_status(&self, hash: &str, status: ChainTxStatus) {
        if let Some(tx) = self.transactions.lock().get_mut(hash) {
            tx.status = status;
        }
    }

    /// Make every following `send_transfer` fail as insufficient balance
    pub fn fail_transfers(&self, message: &str) {
        *self.transfer_error.lock() = Some(message.to_string());
    }

    pub fn transfers(&self) -> Vec<(String, Decimal, Network)> {
        self.transfers.lock().clone()
    }

    pub fn lookups(&self) -> usize {
        *self.lookups.lock()
    }
}

#[async_trait]
impl ChainClient for ScriptedChain {
    async fn get_transaction(
        &self,
        hash: &str,
        _network: Network,
    ) -> AppResult<Option<ChainTransactionDetails>> {
        *self.lookups.lock() += 1;
        Ok(self.transactions.lock().get(hash).cloned())
    }

    async fn send_transfer(
        &self,
        to_address: &str,
        amount: Decimal,
        network: Network,
    ) -> AppResult<String> {
        if self.transfer_error.lock().is_some() {
            return Err(ChainError::InsufficientBalance {
                network,
                amount: amount.to_string(),
            }
            .into());
        }

        let mut transfers = self.transfers.lock();
        transfers.push((to_address.to_string(), amount, network));
        let hash = format!("0xpayout{:04}", transfers.len());

        self.transactions.lock().insert(
            hash.clone(),
            ChainTransactionDetails {
                hash: hash.clone(),
                network,
                from: "0xtreasury".to_string(),
                to: to_address.to_string(),
                amount: network.to_base_units(amount)?,
                confirmations: 0,
                block_number: None,
                status: ChainTxStatus::Pending,
                memo: None,
            },
        );
        Ok(hash)
    }

    async fn current_block_height(&self, _network: Network) -> AppResult<u64> {
        Ok(1_000)
    }
}

/// Holds every `get_transaction` call at a barrier so concurrent callers
/// all pass their duplicate check before any of them records the hash
pub struct GatedChain {
    inner: Arc<ScriptedChain>,
    gate: Barrier,
}

impl GatedChain {
    pub fn new(inner: Arc<ScriptedChain>, callers: usize) -> Self {
        Self {
            inner,
            gate: Barrier::new(callers),
        }
    }
}

#[async_trait]
impl ChainClient for GatedChain {
    async fn get_transaction(
        &self,
        hash: &str,
        network: Network,
    ) -> AppResult<Option<ChainTransactionDetails>> {
        self.gate.wait().await;
        self.inner.get_transaction(hash, network).await
    }

    async fn send_transfer(
        &self,
        to_address: &str,
        amount: Decimal,
        network: Network,
    ) -> AppResult<String> {
        self.inner.send_transfer(to_address, amount, network).await
    }

    async fn current_block_height(&self, network: Network) -> AppResult<u64> {
        self.inner.current_block_height(network).await
    }
}

/// Incoming transfer to the shared deposit wallet
pub fn incoming(hash: &str, amount: Decimal, memo: Option<Uuid>, confirmations: u64) -> ChainTransactionDetails {
    let network = Network::Polygon;
    ChainTransactionDetails {
        hash: hash.to_string(),
        network,
        from: "0xpayer".to_string(),
        to: DEPOSIT_ADDRESS.to_lowercase(),
        amount: network.to_base_units(amount).unwrap_or_default(),
        confirmations,
        block_number: Some(900),
        status: if confirmations > 0 {
            ChainTxStatus::Success
        } else {
            ChainTxStatus::Pending
        },
        memo: memo.map(|id| id.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct RecordedPost {
    pub url: String,
    pub body: String,
    pub signature: String,
}

pub struct RecordingTransport {
    status: u16,
    posts: Mutex<Vec<RecordedPost>>,
}

impl RecordingTransport {
    pub fn responding(status: u16) -> Self {
        Self {
            status,
            posts: Mutex::new(Vec::new()),
        }
    }

    pub fn posts(&self) -> Vec<RecordedPost> {
        self.posts.lock().clone()
    }
}

#[async_trait]
impl WebhookTransport for RecordingTransport {
    async fn post(&self, url: &str, body: &str, signature: &str) -> AppResult<u16> {
        self.posts.lock().push(RecordedPost {
            url: url.to_string(),
            body: body.to_string(),
            signature: signature.to_string(),
        });
        Ok(self.status)
    }
}

/// Memory ledger whose next `failures` payment completions fail as if the
/// database dropped the write
pub struct FlakyLedger {
    inner: Arc<MemoryLedger>,
    failures: Mutex<usize>,
}

impl FlakyLedger {
    pub fn failing_completions(inner: Arc<MemoryLedger>, failures: usize) -> Self {
        Self {
            inner,
            failures: Mutex::new(failures),
        }
    }
}

#[async_trait]
impl LedgerStore for FlakyLedger {
    async fn insert_payment(&self, payment: NewPayment) -> AppResult<Payment> {
        self.inner.insert_payment(payment).await
    }

    async fn get_payment(&self, payment_id: Uuid) -> AppResult<Option<Payment>> {
        self.inner.get_payment(payment_id).await
    }

    async fn set_checkout_details(
        &self,
        payment_id: Uuid,
        payment_url: &str,
        qr_code_data: &str,
    ) -> AppResult<()> {
        self.inner
            .set_checkout_details(payment_id, payment_url, qr_code_data)
            .await
    }

    async fn update_payment_status(
        &self,
        payment_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        if to == PaymentStatus::Completed {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(AppError::Internal("connection reset during commit".into()));
            }
        }
        self.inner.update_payment_status(payment_id, from, to, at).await
    }

    async fn expire_pending_payments(&self, now: DateTime<Utc>) -> AppResult<Vec<Payment>> {
        self.inner.expire_pending_payments(now).await
    }

    async fn list_payments_by_merchant(
        &self,
        merchant_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Payment>> {
        self.inner
            .list_payments_by_merchant(merchant_id, limit, offset)
            .await
    }

    async fn count_payments_by_merchant(&self, merchant_id: Uuid) -> AppResult<i64> {
        self.inner.count_payments_by_merchant(merchant_id).await
    }

    async fn find_transaction_by_hash(&self, hash: &str) -> AppResult<Option<ChainTransaction>> {
        self.inner.find_transaction_by_hash(hash).await
    }

    async fn insert_transaction(&self, tx: NewTransaction) -> AppResult<ChainTransaction> {
        self.inner.insert_transaction(tx).await
    }

    async fn update_transaction_confirmations(
        &self,
        hash: &str,
        confirmations: i64,
        status: TransactionStatus,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        self.inner
            .update_transaction_confirmations(hash, confirmations, status, at)
            .await
    }

    async fn list_pending_transactions(&self, limit: i64) -> AppResult<Vec<ChainTransaction>> {
        self.inner.list_pending_transactions(limit).await
    }

    async fn create_settlement_batch(
        &self,
        merchant_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        payout_network: Network,
        pricer: BatchPricer<'_>,
    ) -> AppResult<BatchOutcome> {
        self.inner
            .create_settlement_batch(merchant_id, period_start, period_end, payout_network, pricer)
            .await
    }

    async fn get_settlement(&self, settlement_id: Uuid) -> AppResult<Option<Settlement>> {
        self.inner.get_settlement(settlement_id).await
    }

    async fn settlement_payment_ids(&self, settlement_id: Uuid) -> AppResult<Vec<Uuid>> {
        self.inner.settlement_payment_ids(settlement_id).await
    }

    async fn update_settlement_status(
        &self,
        settlement_id: Uuid,
        from: SettlementStatus,
        to: SettlementStatus,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        self.inner
            .update_settlement_status(settlement_id, from, to, error_message, at)
            .await
    }

    async fn set_settlement_payout_hash(&self, settlement_id: Uuid, hash: &str) -> AppResult<()> {
        self.inner.set_settlement_payout_hash(settlement_id, hash).await
    }

    async fn list_settlements_by_status(
        &self,
        status: SettlementStatus,
    ) -> AppResult<Vec<Settlement>> {
        self.inner.list_settlements_by_status(status).await
    }

    async fn release_settlement_links(&self, settlement_id: Uuid) -> AppResult<u64> {
        self.inner.release_settlement_links(settlement_id).await
    }

    async fn insert_webhook_event(
        &self,
        merchant_id: Uuid,
        event_type: WebhookEventType,
        resource_id: Option<Uuid>,
        payload: &serde_json::Value,
    ) -> AppResult<Uuid> {
        self.inner
            .insert_webhook_event(merchant_id, event_type, resource_id, payload)
            .await
    }

    async fn finish_webhook_event(
        &self,
        event_id: Uuid,
        status: DeliveryStatus,
        response_code: Option<i32>,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        self.inner
            .finish_webhook_event(event_id, status, response_code, error_message, at)
            .await
    }
}

/// Every component wired over the in-memory doubles
pub struct Harness {
    pub store: Arc<MemoryLedger>,
    pub merchants: Arc<MemoryMerchants>,
    pub chain: Arc<ScriptedChain>,
    pub transport: Arc<RecordingTransport>,
    pub ledger: Arc<PaymentLedger>,
    pub tracker: Arc<ConfirmationTracker>,
    pub notifier: Arc<Notifier>,
    pub matcher: Arc<TransactionMatcher>,
    pub batcher: Arc<SettlementBatcher>,
    pub payouts: Arc<PayoutExecutor>,
    pub service: Arc<PaymentService>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryLedger::new());
        let merchants = Arc::new(MemoryMerchants::new());
        let chain = Arc::new(ScriptedChain::new());
        let transport = Arc::new(RecordingTransport::responding(200));

        let ledger = Arc::new(PaymentLedger::new(
            store.clone(),
            merchants.clone(),
            payment_settings(),
            Network::Polygon,
            DEPOSIT_ADDRESS.to_string(),
        ));
        let tracker = Arc::new(ConfirmationTracker::new(
            chain.clone(),
            std::time::Duration::from_millis(10),
            std::time::Duration::from_millis(200),
        ));
        let notifier = Arc::new(Notifier::new(
            store.clone(),
            merchants.clone(),
            transport.clone(),
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
            Network::Polygon,
        ));
        let payouts = Arc::new(PayoutExecutor::new(
            store.clone(),
            merchants.clone(),
            chain.clone(),
            tracker.clone(),
            notifier.clone(),
        ));
        let service = Arc::new(PaymentService::new(
            store.clone(),
            ledger.clone(),
            matcher.clone(),
            batcher.clone(),
            payouts.clone(),
            notifier.clone(),
        ));

        Self {
            store,
            merchants,
            chain,
            transport,
            ledger,
            tracker,
            notifier,
            matcher,
            batcher,
            payouts,
            service,
        }
    }

    pub async fn merchant(&self, fee_rate: Option<Decimal>) -> Merchant {
        let merchant = active_merchant(fee_rate);
        self.merchants.insert(merchant.clone()).await;
        merchant
    }

    /// A payment already paid and confirmed at `completed_at`
    pub async fn completed_payment(
        &self,
        merchant_id: Uuid,
        amount: Decimal,
        completed_at: DateTime<Utc>,
    ) -> Payment {
        let created_at = completed_at - Duration::minutes(5);
        let payment = Payment {
            id: Uuid::new_v4(),
            merchant_id,
            external_id: None,
            amount,
            currency: Currency::Usdc,
            network: Network::Polygon,
            status: PaymentStatus::Completed,
            deposit_address: DEPOSIT_ADDRESS.to_string(),
            payment_url: None,
            qr_code_data: None,
            description: None,
            customer_email: None,
            customer_phone: None,
            metadata: None,
            expires_at: created_at + Duration::minutes(30),
            created_at,
            updated_at: completed_at,
            completed_at: Some(completed_at),
            cancelled_at: None,
        };
        self.store.put_payment(payment.clone()).await;
        payment
    }
}
