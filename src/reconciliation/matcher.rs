use chrono::Utc;
use futures::StreamExt;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::tracker::{Confirmation, ConfirmationTracker, WatchOutcome};
use crate::chain::{ChainClient, ChainTransactionDetails};
use crate::error::{AppError, AppResult, ErrorKind, ReconciliationError};
use crate::ledger::models::{
    ChainTransaction, Network, NewTransaction, Payment, PaymentStatus, TransactionStatus,
    WebhookEventType,
};
use crate::ledger::LedgerStore;
use crate::notify::Notifier;
use crate::payments::ledger::PaymentLedger;

/// What one ingest (or re-check) of a transaction hash did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Hash already recorded; nothing done
    Duplicate,
    /// No payment claims this transfer; recorded unlinked
    Unmatched,
    /// Underpaid; recorded unlinked, payment untouched
    Insufficient {
        payment_id: Uuid,
        expected: Decimal,
        received: Decimal,
    },
    /// Payment no longer accepts funds (expired, cancelled, already paid)
    NotPayable {
        payment_id: Uuid,
        status: PaymentStatus,
    },
    AwaitingConfirmations {
        payment_id: Uuid,
        confirmations: u64,
        required: u64,
    },
    Completed {
        payment_id: Uuid,
    },
    Failed {
        payment_id: Uuid,
    },
}

/// Turns observed chain transfers into payment progress, once per hash.
///
/// Matching: the transfer memo must carry the payment id, the recipient
/// must be that payment's deposit address and the network must agree.
pub struct TransactionMatcher {
    store: Arc<dyn LedgerStore>,
    ledger: Arc<PaymentLedger>,
    chain: Arc<dyn ChainClient>,
    tracker: Arc<ConfirmationTracker>,
    notifier: Arc<Notifier>,
}

impl TransactionMatcher {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        ledger: Arc<PaymentLedger>,
        chain: Arc<dyn ChainClient>,
        tracker: Arc<ConfirmationTracker>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            store,
            ledger,
            chain,
            tracker,
            notifier,
        }
    }

    async fn match_payment(&self, details: &ChainTransactionDetails) -> AppResult<Option<Payment>> {
        let Some(payment_id) = details
            .memo
            .as_deref()
            .and_then(|memo| Uuid::parse_str(memo.trim()).ok())
        else {
            return Ok(None);
        };

        let Some(payment) = self.store.get_payment(payment_id).await? else {
            return Ok(None);
        };

        if payment.network != details.network
            || !payment.deposit_address.eq_ignore_ascii_case(&details.to)
        {
            warn!(
                "Transaction {} names payment {} but pays {} on {}",
                details.hash, payment_id, details.to, details.network
            );
            return Ok(None);
        }

        Ok(Some(payment))
    }

    #[instrument(skip(self))]
    pub async fn ingest(&self, hash: &str, network: Network) -> AppResult<IngestOutcome> {
        if self.store.find_transaction_by_hash(hash).await?.is_some() {
            info!("Transaction {} already ingested", hash);
            return Ok(IngestOutcome::Duplicate);
        }

        let details = self
            .chain
            .get_transaction(hash, network)
            .await?
            .ok_or_else(|| ReconciliationError::TransactionNotFound {
                hash: hash.to_string(),
                network,
            })?;

        let observation = self.tracker.classify(&details);
        let now = Utc::now();

        let (linked, outcome) = match self.match_payment(&details).await? {
            None => (None, IngestOutcome::Unmatched),
            Some(payment) if details.amount < network.to_base_units(payment.amount)? => (
                None,
                IngestOutcome::Insufficient {
                    payment_id: payment.id,
                    expected: payment.amount,
                    received: details.amount_decimal()?,
                },
            ),
            Some(payment)
                if payment.status != PaymentStatus::Pending || payment.is_expired_at(now) =>
            {
                (
                    None,
                    IngestOutcome::NotPayable {
                        payment_id: payment.id,
                        status: payment.status,
                    },
                )
            }
            Some(payment) => (Some(payment.id), IngestOutcome::Unmatched),
        };

        let record = NewTransaction {
            transaction_hash: details.hash.clone(),
            network,
            payment_id: linked,
            from_address: details.from.clone(),
            to_address: details.to.clone(),
            amount: details.amount_decimal()?,
            block_number: details.block_number.map(|b| b as i64),
            confirmation_count: details.confirmations as i64,
            // Stays pending until the payment has caught up with the chain
            status: TransactionStatus::Pending,
        };

        match self.store.insert_transaction(record).await {
            Ok(_) => {}
            Err(e) if e.is_unique_violation() => {
                info!("Transaction {} ingested concurrently", hash);
                return Ok(IngestOutcome::Duplicate);
            }
            Err(e) => return Err(e),
        }

        let Some(payment_id) = linked else {
            warn!("Transaction {} recorded without payment: {:?}", hash, outcome);
            return Ok(outcome);
        };

        info!(payment_id = %payment_id, "🔗 Transaction {} matched", hash);
        self.apply_and_record(hash, payment_id, observation, details.confirmations as i64)
            .await
    }

    /// Apply an observation to the payment, then close out the transaction.
    /// If the payment write fails the transaction stays pending, so the
    /// refresh loop retries it.
    async fn apply_and_record(
        &self,
        hash: &str,
        payment_id: Uuid,
        observation: Confirmation,
        confirmations: i64,
    ) -> AppResult<IngestOutcome> {
        let outcome = match self.apply(payment_id, observation).await {
            // Payment left the expected status between the match and the transition
            Err(e) if e.kind() == ErrorKind::StateConflict => {
                let current = self.ledger.get(payment_id).await?;
                warn!(payment_id = %payment_id, "Matched payment is now {}", current.status);
                IngestOutcome::NotPayable {
                    payment_id,
                    status: current.status,
                }
            }
            other => other?,
        };

        let status = observation.transaction_status();
        if status != TransactionStatus::Pending {
            self.store
                .update_transaction_confirmations(hash, confirmations, status, Utc::now())
                .await?;
        }
        Ok(outcome)
    }

    /// Advance the payment according to its transaction's confirmation state
    async fn apply(&self, payment_id: Uuid, observation: Confirmation) -> AppResult<IngestOutcome> {
        match observation {
            Confirmation::Pending {
                confirmations,
                required,
            } => {
                self.ledger
                    .transition(payment_id, PaymentStatus::Processing)
                    .await?;
                Ok(IngestOutcome::AwaitingConfirmations {
                    payment_id,
                    confirmations,
                    required,
                })
            }
            Confirmation::Confirmed { .. } => {
                let payment = self.ledger.get(payment_id).await?;
                if payment.status == PaymentStatus::Pending {
                    self.ledger
                        .transition(payment_id, PaymentStatus::Processing)
                        .await?;
                }

                let done = self
                    .ledger
                    .transition(payment_id, PaymentStatus::Completed)
                    .await?;
                if done.applied {
                    info!(payment_id = %payment_id, "✅ Payment completed");
                    self.notify(&done.payment, WebhookEventType::PaymentCompleted);
                }
                Ok(IngestOutcome::Completed { payment_id })
            }
            Confirmation::Failed => {
                let failed = self
                    .ledger
                    .transition(payment_id, PaymentStatus::Failed)
                    .await?;
                if failed.applied {
                    warn!(payment_id = %payment_id, "Payment failed on chain");
                    self.notify(&failed.payment, WebhookEventType::PaymentFailed);
                }
                Ok(IngestOutcome::Failed { payment_id })
            }
        }
    }

    fn notify(&self, payment: &Payment, event: WebhookEventType) {
        let data = serde_json::json!({ "payment": payment });
        self.notifier
            .notify_in_background(payment.merchant_id, event, Some(payment.id), data);
    }

    /// Re-check a recorded, still-pending matched transaction
    pub async fn advance(&self, tx: &ChainTransaction) -> AppResult<IngestOutcome> {
        let Some(payment_id) = tx.payment_id else {
            return Ok(IngestOutcome::Unmatched);
        };
        if tx.status.is_terminal() {
            return Ok(IngestOutcome::Duplicate);
        }

        let observation = match self
            .tracker
            .check_once(&tx.transaction_hash, tx.network)
            .await
        {
            Ok(observation) => observation,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Transaction {} no longer visible on {}", tx.transaction_hash, tx.network);
                return Ok(IngestOutcome::AwaitingConfirmations {
                    payment_id,
                    confirmations: tx.confirmation_count.max(0) as u64,
                    required: self.chain.required_confirmations(tx.network),
                });
            }
            Err(e) => return Err(e),
        };

        let count = match observation {
            Confirmation::Failed => tx.confirmation_count,
            other => other.confirmations() as i64,
        };
        let updated = self
            .store
            .update_transaction_confirmations(
                &tx.transaction_hash,
                count,
                TransactionStatus::Pending,
                Utc::now(),
            )
            .await?;

        if !updated {
            return Ok(IngestOutcome::Duplicate);
        }

        self.apply_and_record(&tx.transaction_hash, payment_id, observation, count)
            .await
    }

    pub async fn advance_hash(&self, hash: &str) -> AppResult<IngestOutcome> {
        let tx = self
            .store
            .find_transaction_by_hash(hash)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Transaction {}", hash)))?;
        self.advance(&tx).await
    }

    /// Watch a below-depth transaction in the background and advance its
    /// payment once it resolves. A timeout leaves it for the refresh loop.
    pub fn spawn_watch(self: &Arc<Self>, hash: String, network: Network) {
        let matcher = Arc::clone(self);
        tokio::spawn(async move {
            match matcher.tracker.watch(&hash, network).await {
                WatchOutcome::TimedOut { .. } => {}
                _ => {
                    if let Err(e) = matcher.advance_hash(&hash).await {
                        error!("Failed to advance transaction {}: {:?}", hash, e);
                    }
                }
            }
        });
    }

    /// Re-check every recorded pending matched transaction. Returns how many
    /// reached a terminal status.
    pub async fn refresh_pending(&self, limit: i64, concurrency: usize) -> AppResult<usize> {
        let pending = self.store.list_pending_transactions(limit).await?;
        let resolved = AtomicUsize::new(0);

        futures::stream::iter(pending)
            .for_each_concurrent(concurrency, |tx| {
                let resolved = &resolved;
                async move {
                    match self.advance(&tx).await {
                        Ok(IngestOutcome::Completed { .. }) | Ok(IngestOutcome::Failed { .. }) => {
                            resolved.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(_) => {}
                        Err(e) => error!(
                            "Refresh of transaction {} failed: {:?}",
                            tx.transaction_hash, e
                        ),
                    }
                }
            })
            .await;

        Ok(resolved.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        incoming, payment_settings, FlakyLedger, GatedChain, Harness, DEPOSIT_ADDRESS,
    };
    use chrono::Duration;
    use rust_decimal_macros::dec;

    async fn pending_payment(h: &Harness, amount: Decimal) -> Payment {
        let merchant = h.merchant(None).await;
        h.ledger
            .create(
                merchant.id,
                crate::ledger::models::CreatePaymentRequest {
                    amount,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_confirmed_transfer_completes_payment() {
        let h = Harness::new();
        let payment = pending_payment(&h, dec!(25)).await;
        h.chain.put(incoming("0xa1", dec!(25), Some(payment.id), 10));

        let outcome = h.matcher.ingest("0xa1", Network::Polygon).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Completed { payment_id: payment.id });

        let paid = h.ledger.get(payment.id).await.unwrap();
        assert_eq!(paid.status, PaymentStatus::Completed);
        assert!(paid.completed_at.is_some());

        let tx = h.store.find_transaction_by_hash("0xa1").await.unwrap().unwrap();
        assert_eq!(tx.payment_id, Some(payment.id));
        assert_eq!(tx.status, TransactionStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_overpayment_still_completes() {
        let h = Harness::new();
        let payment = pending_payment(&h, dec!(25)).await;
        h.chain.put(incoming("0xover", dec!(26.5), Some(payment.id), 10));

        let outcome = h.matcher.ingest("0xover", Network::Polygon).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Completed { payment_id: payment.id });
    }

    #[tokio::test]
    async fn test_duplicate_ingest_is_noop() {
        let h = Harness::new();
        let payment = pending_payment(&h, dec!(25)).await;
        h.chain.put(incoming("0xdup", dec!(25), Some(payment.id), 12));

        h.matcher.ingest("0xdup", Network::Polygon).await.unwrap();
        let again = h.matcher.ingest("0xdup", Network::Polygon).await.unwrap();
        assert_eq!(again, IngestOutcome::Duplicate);
        assert_eq!(h.store.transaction_count().await, 1);
        // Known hashes never reach the chain
        assert_eq!(h.chain.lookups(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let completions = h
            .store
            .webhook_events()
            .await
            .into_iter()
            .filter(|e| e.event_type == "payment.completed")
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_concurrent_ingest_records_once() {
        let h = Harness::new();
        let payment = pending_payment(&h, dec!(40)).await;
        h.chain.put(incoming("0xrace", dec!(40), Some(payment.id), 12));

        // Both callers get past the hash lookup before either inserts
        let gated = Arc::new(GatedChain::new(h.chain.clone(), 2));
        let matcher = TransactionMatcher::new(
            h.store.clone(),
            h.ledger.clone(),
            gated,
            h.tracker.clone(),
            h.notifier.clone(),
        );

        let (a, b) = tokio::join!(
            matcher.ingest("0xrace", Network::Polygon),
            matcher.ingest("0xrace", Network::Polygon)
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(h.chain.lookups(), 2);
        assert_eq!(
            outcomes.iter().filter(|o| **o == IngestOutcome::Duplicate).count(),
            1
        );
        assert!(outcomes.contains(&IngestOutcome::Completed { payment_id: payment.id }));
        assert_eq!(h.store.transaction_count().await, 1);
        assert_eq!(
            h.ledger.get(payment.id).await.unwrap().status,
            PaymentStatus::Completed
        );

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let completed = h
            .store
            .webhook_events()
            .await
            .into_iter()
            .filter(|e| e.event_type == "payment.completed")
            .count();
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn test_failed_completion_write_is_retried_by_refresh() {
        let h = Harness::new();
        let flaky: Arc<dyn LedgerStore> =
            Arc::new(FlakyLedger::failing_completions(h.store.clone(), 1));
        let ledger = Arc::new(PaymentLedger::new(
            flaky.clone(),
            h.merchants.clone(),
            payment_settings(),
            Network::Polygon,
            DEPOSIT_ADDRESS.to_string(),
        ));
        let matcher = TransactionMatcher::new(
            flaky,
            ledger.clone(),
            h.chain.clone(),
            h.tracker.clone(),
            h.notifier.clone(),
        );

        let merchant = h.merchant(None).await;
        let payment = ledger
            .create(
                merchant.id,
                crate::ledger::models::CreatePaymentRequest {
                    amount: dec!(25),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        h.chain.put(incoming("0xflaky", dec!(25), Some(payment.id), 12));

        assert!(matcher.ingest("0xflaky", Network::Polygon).await.is_err());
        assert_eq!(
            ledger.get(payment.id).await.unwrap().status,
            PaymentStatus::Processing
        );
        let tx = h.store.find_transaction_by_hash("0xflaky").await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);

        // A redelivered webhook sees the recorded hash
        assert_eq!(
            matcher.ingest("0xflaky", Network::Polygon).await.unwrap(),
            IngestOutcome::Duplicate
        );

        assert_eq!(matcher.refresh_pending(10, 2).await.unwrap(), 1);
        let paid = ledger.get(payment.id).await.unwrap();
        assert_eq!(paid.status, PaymentStatus::Completed);
        assert!(paid.completed_at.is_some());
        let tx = h.store.find_transaction_by_hash("0xflaky").await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Confirmed);

        // Nothing left for the next pass
        assert_eq!(matcher.refresh_pending(10, 2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_below_depth_waits_then_advances() {
        let h = Harness::new();
        let payment = pending_payment(&h, dec!(25)).await;
        h.chain.put(incoming("0xslow", dec!(25), Some(payment.id), 4));

        let outcome = h.matcher.ingest("0xslow", Network::Polygon).await.unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::AwaitingConfirmations {
                payment_id: payment.id,
                confirmations: 4,
                required: 10
            }
        );
        assert_eq!(
            h.ledger.get(payment.id).await.unwrap().status,
            PaymentStatus::Processing
        );

        // Still short: stays processing
        h.chain.set_confirmations("0xslow", 7);
        assert_eq!(h.matcher.refresh_pending(10, 2).await.unwrap(), 0);
        let tx = h.store.find_transaction_by_hash("0xslow").await.unwrap().unwrap();
        assert_eq!(tx.confirmation_count, 7);

        h.chain.set_confirmations("0xslow", 10);
        assert_eq!(h.matcher.refresh_pending(10, 2).await.unwrap(), 1);
        assert_eq!(
            h.ledger.get(payment.id).await.unwrap().status,
            PaymentStatus::Completed
        );
        assert!(h.store.list_pending_transactions(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spawned_watch_completes_payment() {
        let h = Harness::new();
        let payment = pending_payment(&h, dec!(25)).await;
        h.chain.put(incoming("0xwatch", dec!(25), Some(payment.id), 1));

        h.matcher.ingest("0xwatch", Network::Polygon).await.unwrap();
        h.matcher.spawn_watch("0xwatch".to_string(), Network::Polygon);
        h.chain.set_confirmations("0xwatch", 11);

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(
            h.ledger.get(payment.id).await.unwrap().status,
            PaymentStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_underpayment_recorded_unlinked() {
        let h = Harness::new();
        let payment = pending_payment(&h, dec!(25)).await;
        h.chain.put(incoming("0xshort", dec!(24.99), Some(payment.id), 12));

        let outcome = h.matcher.ingest("0xshort", Network::Polygon).await.unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Insufficient {
                payment_id: payment.id,
                expected: dec!(25),
                received: dec!(24.99)
            }
        );
        assert_eq!(h.ledger.get(payment.id).await.unwrap().status, PaymentStatus::Pending);

        let tx = h.store.find_transaction_by_hash("0xshort").await.unwrap().unwrap();
        assert!(tx.payment_id.is_none());
    }

    #[tokio::test]
    async fn test_unmatched_transfers() {
        let h = Harness::new();
        let payment = pending_payment(&h, dec!(25)).await;

        // No memo
        h.chain.put(incoming("0xnomemo", dec!(25), None, 12));
        // Unknown payment id
        h.chain.put(incoming("0xunknown", dec!(25), Some(Uuid::new_v4()), 12));
        // Right memo, wrong recipient
        let mut elsewhere = incoming("0xelsewhere", dec!(25), Some(payment.id), 12);
        elsewhere.to = "0xsomeoneelse".to_string();
        h.chain.put(elsewhere);

        for hash in ["0xnomemo", "0xunknown", "0xelsewhere"] {
            let outcome = h.matcher.ingest(hash, Network::Polygon).await.unwrap();
            assert_eq!(outcome, IngestOutcome::Unmatched, "{}", hash);
            let tx = h.store.find_transaction_by_hash(hash).await.unwrap().unwrap();
            assert!(tx.payment_id.is_none());
        }
        assert_eq!(h.ledger.get(payment.id).await.unwrap().status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_late_payment_past_expiry_untouched() {
        let h = Harness::new();
        let mut payment = pending_payment(&h, dec!(25)).await;

        // Past expiry but not yet swept
        payment.expires_at = Utc::now() - Duration::minutes(1);
        h.store.put_payment(payment.clone()).await;
        h.chain.put(incoming("0xlate", dec!(25), Some(payment.id), 12));

        let outcome = h.matcher.ingest("0xlate", Network::Polygon).await.unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::NotPayable {
                payment_id: payment.id,
                status: PaymentStatus::Pending
            }
        );
        let after = h.ledger.get(payment.id).await.unwrap();
        assert_eq!(after.status, PaymentStatus::Pending);
        assert!(after.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_payment_not_payable() {
        let h = Harness::new();
        let payment = pending_payment(&h, dec!(25)).await;
        h.ledger.cancel(payment.merchant_id, payment.id).await.unwrap();
        h.chain.put(incoming("0xc", dec!(25), Some(payment.id), 12));

        let outcome = h.matcher.ingest("0xc", Network::Polygon).await.unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::NotPayable {
                payment_id: payment.id,
                status: PaymentStatus::Cancelled
            }
        );
    }

    #[tokio::test]
    async fn test_chain_failure_fails_payment() {
        let h = Harness::new();
        let payment = pending_payment(&h, dec!(25)).await;
        h.chain.put(incoming("0xbad", dec!(25), Some(payment.id), 2));

        h.matcher.ingest("0xbad", Network::Polygon).await.unwrap();
        h.chain.set_status("0xbad", crate::chain::ChainTxStatus::Failed);

        let outcome = h.matcher.advance_hash("0xbad").await.unwrap();
        assert_eq!(outcome, IngestOutcome::Failed { payment_id: payment.id });
        assert_eq!(h.ledger.get(payment.id).await.unwrap().status, PaymentStatus::Failed);

        let tx = h.store.find_transaction_by_hash("0xbad").await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn test_hash_unknown_to_chain() {
        let h = Harness::new();
        let err = h.matcher.ingest("0xmissing", Network::Polygon).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Reconciliation(ReconciliationError::TransactionNotFound { .. })
        ));
        assert_eq!(h.store.transaction_count().await, 0);

        let err = h.matcher.advance_hash("0xmissing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
