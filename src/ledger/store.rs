use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::models::*;
use crate::error::AppResult;

/// Computes fee/net totals for a batch from its gross amount.
/// Runs inside the batch's atomic unit.
pub type BatchPricer<'a> = &'a (dyn Fn(Decimal) -> AppResult<BatchTotals> + Send + Sync);

/// Persistence contract for the reconciliation and settlement core.
///
/// Every status mutation is guarded by the caller's expected current status,
/// so a lost update is reported as `false` rather than silently overwritten.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ========== PAYMENTS ==========

    async fn insert_payment(&self, payment: NewPayment) -> AppResult<Payment>;

    async fn get_payment(&self, payment_id: Uuid) -> AppResult<Option<Payment>>;

    async fn set_checkout_details(
        &self,
        payment_id: Uuid,
        payment_url: &str,
        qr_code_data: &str,
    ) -> AppResult<()>;

    /// Move a payment from `from` to `to` only if it is still in `from`.
    /// Sets `completed_at` for completed and `cancelled_at` for the other terminal states.
    async fn update_payment_status(
        &self,
        payment_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Expire every pending payment whose expiry is at or before `now`,
    /// in one guarded pass. Returns the expired payments.
    async fn expire_pending_payments(&self, now: DateTime<Utc>) -> AppResult<Vec<Payment>>;

    /// One page of a merchant's payments, newest first
    async fn list_payments_by_merchant(
        &self,
        merchant_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Payment>>;

    async fn count_payments_by_merchant(&self, merchant_id: Uuid) -> AppResult<i64>;

    // ========== TRANSACTIONS ==========

    async fn find_transaction_by_hash(&self, hash: &str) -> AppResult<Option<ChainTransaction>>;

    /// Insert a transaction. Fails with a unique violation if the hash exists.
    async fn insert_transaction(&self, tx: NewTransaction) -> AppResult<ChainTransaction>;

    /// Update confirmation state of a transaction that is still pending
    async fn update_transaction_confirmations(
        &self,
        hash: &str,
        confirmations: i64,
        status: TransactionStatus,
        at: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Matched transactions still waiting for confirmation depth
    async fn list_pending_transactions(&self, limit: i64) -> AppResult<Vec<ChainTransaction>>;

    // ========== SETTLEMENTS ==========

    /// Select the merchant's completed, unlinked payments in [start, end),
    /// price them and write the settlement plus its payment links as one
    /// atomic unit. Concurrent calls never link the same payment twice.
    async fn create_settlement_batch(
        &self,
        merchant_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        payout_network: Network,
        pricer: BatchPricer<'_>,
    ) -> AppResult<BatchOutcome>;

    async fn get_settlement(&self, settlement_id: Uuid) -> AppResult<Option<Settlement>>;

    async fn settlement_payment_ids(&self, settlement_id: Uuid) -> AppResult<Vec<Uuid>>;

    /// Guarded settlement transition. Stamps `processed_at` on processing and
    /// `completed_at` on completed/failed, and records `error_message` if given.
    async fn update_settlement_status(
        &self,
        settlement_id: Uuid,
        from: SettlementStatus,
        to: SettlementStatus,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> AppResult<bool>;

    async fn set_settlement_payout_hash(&self, settlement_id: Uuid, hash: &str) -> AppResult<()>;

    async fn list_settlements_by_status(
        &self,
        status: SettlementStatus,
    ) -> AppResult<Vec<Settlement>>;

    /// Drop the payment links of a failed settlement so its payments
    /// become eligible again. Returns the number of links removed.
    async fn release_settlement_links(&self, settlement_id: Uuid) -> AppResult<u64>;

    // ========== WEBHOOK DELIVERIES ==========

    async fn insert_webhook_event(
        &self,
        merchant_id: Uuid,
        event_type: WebhookEventType,
        resource_id: Option<Uuid>,
        payload: &serde_json::Value,
    ) -> AppResult<Uuid>;

    async fn finish_webhook_event(
        &self,
        event_id: Uuid,
        status: DeliveryStatus,
        response_code: Option<i32>,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> AppResult<()>;
}
