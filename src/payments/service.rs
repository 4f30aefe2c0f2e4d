use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

use super::checkout;
use super::ledger::PaymentLedger;
use crate::error::AppResult;
use crate::ledger::models::{
    CreatePaymentRequest, Network, Payment, PaymentPage, SettlementSchedule, WebhookEventType,
};
use crate::ledger::LedgerStore;
use crate::notify::Notifier;
use crate::reconciliation::matcher::{IngestOutcome, TransactionMatcher};
use crate::settlement::batcher::{ScheduleReport, SettlementBatcher};
use crate::settlement::payout::PayoutExecutor;

/// Operations the HTTP layer and the schedulers drive
pub struct PaymentService {
    store: Arc<dyn LedgerStore>,
    ledger: Arc<PaymentLedger>,
    matcher: Arc<TransactionMatcher>,
    batcher: Arc<SettlementBatcher>,
    payouts: Arc<PayoutExecutor>,
    notifier: Arc<Notifier>,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        ledger: Arc<PaymentLedger>,
        matcher: Arc<TransactionMatcher>,
        batcher: Arc<SettlementBatcher>,
        payouts: Arc<PayoutExecutor>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            store,
            ledger,
            matcher,
            batcher,
            payouts,
            notifier,
        }
    }

    pub fn payouts(&self) -> &Arc<PayoutExecutor> {
        &self.payouts
    }

    pub fn matcher(&self) -> &Arc<TransactionMatcher> {
        &self.matcher
    }

    /// Create a payment and attach its checkout URL and QR payload
    pub async fn create_payment(
        &self,
        merchant_id: Uuid,
        request: CreatePaymentRequest,
    ) -> AppResult<Payment> {
        let mut payment = self.ledger.create(merchant_id, request).await?;

        let url = checkout::payment_url(&self.ledger.settings().base_url, &payment);
        let qr = checkout::qr_code_data(&payment)?;
        self.store.set_checkout_details(payment.id, &url, &qr).await?;

        payment.payment_url = Some(url);
        payment.qr_code_data = Some(qr);
        Ok(payment)
    }

    pub async fn get_payment_status(&self, payment_id: Uuid) -> AppResult<Payment> {
        self.ledger.get(payment_id).await
    }

    pub async fn list_payments(
        &self,
        merchant_id: Uuid,
        page: u32,
        limit: u32,
    ) -> AppResult<PaymentPage> {
        self.ledger.list_for_merchant(merchant_id, page, limit).await
    }

    pub async fn cancel_payment(&self, merchant_id: Uuid, payment_id: Uuid) -> AppResult<Payment> {
        let cancelled = self.ledger.cancel(merchant_id, payment_id).await?;
        if cancelled.applied {
            self.notify_payment(&cancelled.payment, WebhookEventType::PaymentCancelled);
        }
        Ok(cancelled.payment)
    }

    /// Ingest one observed transaction. A matched transfer still short of
    /// confirmation depth is watched in the background.
    #[instrument(skip(self))]
    pub async fn ingest_transaction(&self, hash: &str, network: Network) -> AppResult<IngestOutcome> {
        let outcome = self.matcher.ingest(hash, network).await?;
        if let IngestOutcome::AwaitingConfirmations { .. } = outcome {
            self.matcher.spawn_watch(hash.to_string(), network);
        }
        Ok(outcome)
    }

    pub async fn sweep_expired_payments(&self) -> AppResult<usize> {
        let expired = self.ledger.sweep_expired(Utc::now()).await?;
        for payment in &expired {
            self.notify_payment(payment, WebhookEventType::PaymentExpired);
        }
        Ok(expired.len())
    }

    /// Batch every merchant on `schedule` for the period that closed at or
    /// before `now`, then dispatch each new batch's payout
    pub async fn run_settlement_schedule(
        &self,
        schedule: SettlementSchedule,
        now: DateTime<Utc>,
    ) -> AppResult<ScheduleReport> {
        let report = self.batcher.run_schedule(schedule, now).await?;

        for settlement in &report.created {
            // Failures are persisted on the batch by the executor
            if let Err(e) = self.payouts.run_payout(settlement.id).await {
                error!("Payout for settlement {} not dispatched: {}", settlement.id, e);
            }
        }

        info!(
            "✓ {} settlement run: {} batches, {} idle, {} skipped, {} errors",
            schedule,
            report.created.len(),
            report.nothing_to_settle,
            report.skipped,
            report.errors
        );
        Ok(report)
    }

    fn notify_payment(&self, payment: &Payment, event: WebhookEventType) {
        let data = serde_json::json!({ "payment": payment });
        self.notifier
            .notify_in_background(payment.merchant_id, event, Some(payment.id), data);
    }
}
