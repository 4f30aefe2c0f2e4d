use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::*;
use super::store::{BatchPricer, LedgerStore};
use crate::error::{AppError, AppResult};

#[derive(Default)]
struct MemoryState {
    payments: HashMap<Uuid, Payment>,
    transactions: HashMap<String, ChainTransaction>,
    settlements: HashMap<Uuid, Settlement>,
    /// payment_id -> settlement_id
    links: HashMap<Uuid, Uuid>,
    webhook_events: Vec<WebhookEvent>,
}

/// In-memory ledger used by unit tests. One lock guards the whole state so
/// every operation is atomic with respect to the others.
#[derive(Default)]
pub struct MemoryLedger {
    state: RwLock<MemoryState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a payment directly in any status
    pub async fn put_payment(&self, payment: Payment) {
        self.state.write().await.payments.insert(payment.id, payment);
    }

    pub async fn webhook_events(&self) -> Vec<WebhookEvent> {
        self.state.read().await.webhook_events.clone()
    }

    pub async fn settlement_for_payment(&self, payment_id: Uuid) -> Option<Uuid> {
        self.state.read().await.links.get(&payment_id).copied()
    }

    pub async fn transaction_count(&self) -> usize {
        self.state.read().await.transactions.len()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn insert_payment(&self, new: NewPayment) -> AppResult<Payment> {
        let mut state = self.state.write().await;
        if state.payments.contains_key(&new.id) {
            return Err(AppError::Conflict(format!("Payment {} exists", new.id)));
        }

        let payment = Payment {
            id: new.id,
            merchant_id: new.merchant_id,
            external_id: new.external_id,
            amount: new.amount,
            currency: new.currency,
            network: new.network,
            status: PaymentStatus::Pending,
            deposit_address: new.deposit_address,
            payment_url: None,
            qr_code_data: None,
            description: new.description,
            customer_email: new.customer_email,
            customer_phone: new.customer_phone,
            metadata: new.metadata,
            expires_at: new.expires_at,
            created_at: new.created_at,
            updated_at: new.created_at,
            completed_at: None,
            cancelled_at: None,
        };
        state.payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn get_payment(&self, payment_id: Uuid) -> AppResult<Option<Payment>> {
        Ok(self.state.read().await.payments.get(&payment_id).cloned())
    }

    async fn set_checkout_details(
        &self,
        payment_id: Uuid,
        payment_url: &str,
        qr_code_data: &str,
    ) -> AppResult<()> {
        let mut state = self.state.write().await;
        if let Some(payment) = state.payments.get_mut(&payment_id) {
            payment.payment_url = Some(payment_url.to_string());
            payment.qr_code_data = Some(qr_code_data.to_string());
        }
        Ok(())
    }

    async fn update_payment_status(
        &self,
        payment_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut state = self.state.write().await;
        let Some(payment) = state.payments.get_mut(&payment_id) else {
            return Ok(false);
        };
        if payment.status != from {
            return Ok(false);
        }

        payment.status = to;
        payment.updated_at = at;
        match to {
            PaymentStatus::Completed => payment.completed_at = Some(at),
            PaymentStatus::Cancelled | PaymentStatus::Expired | PaymentStatus::Failed => {
                payment.cancelled_at = Some(at)
            }
            _ => {}
        }
        Ok(true)
    }

    async fn expire_pending_payments(&self, now: DateTime<Utc>) -> AppResult<Vec<Payment>> {
        let mut state = self.state.write().await;
        let mut expired = Vec::new();
        for payment in state.payments.values_mut() {
            if payment.status == PaymentStatus::Pending && payment.is_expired_at(now) {
                payment.status = PaymentStatus::Expired;
                payment.updated_at = now;
                payment.cancelled_at = Some(now);
                expired.push(payment.clone());
            }
        }
        Ok(expired)
    }

    async fn list_payments_by_merchant(
        &self,
        merchant_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Payment>> {
        let state = self.state.read().await;
        let mut payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.merchant_id == merchant_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(payments
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count_payments_by_merchant(&self, merchant_id: Uuid) -> AppResult<i64> {
        let state = self.state.read().await;
        Ok(state
            .payments
            .values()
            .filter(|p| p.merchant_id == merchant_id)
            .count() as i64)
    }

    async fn find_transaction_by_hash(&self, hash: &str) -> AppResult<Option<ChainTransaction>> {
        Ok(self.state.read().await.transactions.get(hash).cloned())
    }

    async fn insert_transaction(&self, new: NewTransaction) -> AppResult<ChainTransaction> {
        let mut state = self.state.write().await;
        if state.transactions.contains_key(&new.transaction_hash) {
            return Err(AppError::Conflict(format!(
                "Transaction {} exists",
                new.transaction_hash
            )));
        }

        let now = Utc::now();
        let tx = ChainTransaction {
            id: Uuid::new_v4(),
            transaction_hash: new.transaction_hash,
            network: new.network,
            payment_id: new.payment_id,
            from_address: new.from_address,
            to_address: new.to_address,
            amount: new.amount,
            block_number: new.block_number,
            confirmation_count: new.confirmation_count,
            status: new.status,
            created_at: now,
            confirmed_at: (new.status == TransactionStatus::Confirmed).then_some(now),
            failed_at: (new.status == TransactionStatus::Failed).then_some(now),
        };
        state
            .transactions
            .insert(tx.transaction_hash.clone(), tx.clone());
        Ok(tx)
    }

    async fn update_transaction_confirmations(
        &self,
        hash: &str,
        confirmations: i64,
        status: TransactionStatus,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut state = self.state.write().await;
        let Some(tx) = state.transactions.get_mut(hash) else {
            return Ok(false);
        };
        if tx.status != TransactionStatus::Pending {
            return Ok(false);
        }

        tx.confirmation_count = confirmations;
        tx.status = status;
        match status {
            TransactionStatus::Confirmed => tx.confirmed_at = Some(at),
            TransactionStatus::Failed => tx.failed_at = Some(at),
            TransactionStatus::Pending => {}
        }
        Ok(true)
    }

    async fn list_pending_transactions(&self, limit: i64) -> AppResult<Vec<ChainTransaction>> {
        let state = self.state.read().await;
        let mut pending: Vec<_> = state
            .transactions
            .values()
            .filter(|tx| tx.status == TransactionStatus::Pending && tx.payment_id.is_some())
            .cloned()
            .collect();
        pending.sort_by_key(|tx| tx.created_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn create_settlement_batch(
        &self,
        merchant_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        payout_network: Network,
        pricer: BatchPricer<'_>,
    ) -> AppResult<BatchOutcome> {
        let mut state = self.state.write().await;

        let eligible: Vec<(Uuid, Decimal)> = state
            .payments
            .values()
            .filter(|p| {
                p.merchant_id == merchant_id
                    && p.status == PaymentStatus::Completed
                    && p
                        .completed_at
                        .map(|at| at >= period_start && at < period_end)
                        .unwrap_or(false)
                    && !state.links.contains_key(&p.id)
            })
            .map(|p| (p.id, p.amount))
            .collect();

        if eligible.is_empty() {
            return Ok(BatchOutcome::NothingToSettle);
        }

        let gross: Decimal = eligible.iter().map(|(_, amount)| *amount).sum();
        let totals = pricer(gross)?;
        if totals.net_amount <= Decimal::ZERO {
            return Ok(BatchOutcome::NonPositiveNet {
                gross_amount: totals.gross_amount,
                net_amount: totals.net_amount,
            });
        }

        let settlement = Settlement {
            id: Uuid::new_v4(),
            merchant_id,
            period_start,
            period_end,
            gross_amount: totals.gross_amount,
            fee_amount: totals.fee_amount,
            net_amount: totals.net_amount,
            transaction_count: eligible.len() as i32,
            status: SettlementStatus::Pending,
            payout_network,
            payout_hash: None,
            error_message: None,
            created_at: Utc::now(),
            processed_at: None,
            completed_at: None,
        };

        for (payment_id, _) in &eligible {
            state.links.insert(*payment_id, settlement.id);
        }
        state.settlements.insert(settlement.id, settlement.clone());
        Ok(BatchOutcome::Created(settlement))
    }

    async fn get_settlement(&self, settlement_id: Uuid) -> AppResult<Option<Settlement>> {
        Ok(self.state.read().await.settlements.get(&settlement_id).cloned())
    }

    async fn settlement_payment_ids(&self, settlement_id: Uuid) -> AppResult<Vec<Uuid>> {
        let state = self.state.read().await;
        Ok(state
            .links
            .iter()
            .filter(|(_, s)| **s == settlement_id)
            .map(|(p, _)| *p)
            .collect())
    }

    async fn update_settlement_status(
        &self,
        settlement_id: Uuid,
        from: SettlementStatus,
        to: SettlementStatus,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut state = self.state.write().await;
        let Some(settlement) = state.settlements.get_mut(&settlement_id) else {
            return Ok(false);
        };
        if settlement.status != from {
            return Ok(false);
        }

        settlement.status = to;
        match to {
            SettlementStatus::Processing => settlement.processed_at = Some(at),
            SettlementStatus::Completed | SettlementStatus::Failed => {
                settlement.completed_at = Some(at)
            }
            SettlementStatus::Pending => {}
        }
        if let Some(message) = error_message {
            settlement.error_message = Some(message.to_string());
        }
        Ok(true)
    }

    async fn set_settlement_payout_hash(&self, settlement_id: Uuid, hash: &str) -> AppResult<()> {
        let mut state = self.state.write().await;
        if let Some(settlement) = state.settlements.get_mut(&settlement_id) {
            settlement.payout_hash = Some(hash.to_string());
        }
        Ok(())
    }

    async fn list_settlements_by_status(
        &self,
        status: SettlementStatus,
    ) -> AppResult<Vec<Settlement>> {
        let state = self.state.read().await;
        let mut settlements: Vec<_> = state
            .settlements
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        settlements.sort_by_key(|s| s.created_at);
        Ok(settlements)
    }

    async fn release_settlement_links(&self, settlement_id: Uuid) -> AppResult<u64> {
        let mut state = self.state.write().await;
        let failed = state
            .settlements
            .get(&settlement_id)
            .map(|s| s.status == SettlementStatus::Failed)
            .unwrap_or(false);
        if !failed {
            return Ok(0);
        }

        let before = state.links.len();
        state.links.retain(|_, s| *s != settlement_id);
        Ok((before - state.links.len()) as u64)
    }

    async fn insert_webhook_event(
        &self,
        merchant_id: Uuid,
        event_type: WebhookEventType,
        resource_id: Option<Uuid>,
        payload: &serde_json::Value,
    ) -> AppResult<Uuid> {
        let mut state = self.state.write().await;
        let id = Uuid::new_v4();
        state.webhook_events.push(WebhookEvent {
            id,
            merchant_id,
            event_type: event_type.as_str().to_string(),
            resource_id,
            payload: payload.clone(),
            status: DeliveryStatus::Pending,
            response_code: None,
            error_message: None,
            created_at: Utc::now(),
            delivered_at: None,
        });
        Ok(id)
    }

    async fn finish_webhook_event(
        &self,
        event_id: Uuid,
        status: DeliveryStatus,
        response_code: Option<i32>,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut state = self.state.write().await;
        if let Some(event) = state
            .webhook_events
            .iter_mut()
            .find(|e| e.id == event_id && e.status == DeliveryStatus::Pending)
        {
            event.status = status;
            event.response_code = response_code;
            event.error_message = error_message.map(str::to_string);
            if status == DeliveryStatus::Delivered {
                event.delivered_at = Some(at);
            }
        }
        Ok(())
    }
}
