use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::chain::ChainClient;
use crate::error::{AppError, AppResult, ErrorKind, PaymentError, SettlementError};
use crate::ledger::models::{Settlement, SettlementStatus, WebhookEventType};
use crate::ledger::LedgerStore;
use crate::merchants::MerchantDirectory;
use crate::notify::Notifier;
use crate::reconciliation::tracker::{Confirmation, ConfirmationTracker, WatchOutcome};

/// Sends settlement payouts and follows them to completion
pub struct PayoutExecutor {
    store: Arc<dyn LedgerStore>,
    merchants: Arc<dyn MerchantDirectory>,
    chain: Arc<dyn ChainClient>,
    tracker: Arc<ConfirmationTracker>,
    notifier: Arc<Notifier>,
}

impl PayoutExecutor {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        merchants: Arc<dyn MerchantDirectory>,
        chain: Arc<dyn ChainClient>,
        tracker: Arc<ConfirmationTracker>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            store,
            merchants,
            chain,
            tracker,
            notifier,
        }
    }

    async fn get(&self, settlement_id: Uuid) -> AppResult<Settlement> {
        self.store
            .get_settlement(settlement_id)
            .await?
            .ok_or_else(|| SettlementError::NotFound(settlement_id).into())
    }

    /// Guarded status change. A lost race surfaces as an invalid transition
    /// from whatever status won.
    async fn move_to(
        &self,
        settlement: &Settlement,
        to: SettlementStatus,
        error_message: Option<&str>,
    ) -> AppResult<Settlement> {
        if !settlement.status.can_transition_to(to) {
            return Err(SettlementError::InvalidTransition {
                id: settlement.id,
                from: settlement.status,
                to,
            }
            .into());
        }

        let updated = self
            .store
            .update_settlement_status(settlement.id, settlement.status, to, error_message, Utc::now())
            .await?;
        let current = self.get(settlement.id).await?;
        if !updated {
            return Err(SettlementError::InvalidTransition {
                id: settlement.id,
                from: current.status,
                to,
            }
            .into());
        }

        info!(settlement_id = %settlement.id, "Settlement {} -> {}", settlement.status, to);
        Ok(current)
    }

    async fn fail(&self, settlement: &Settlement, message: &str) -> AppResult<Settlement> {
        let failed = self
            .move_to(settlement, SettlementStatus::Failed, Some(message))
            .await?;
        error!(
            settlement_id = %settlement.id,
            "❌ Settlement failed: {}", message
        );
        self.notify(&failed, WebhookEventType::SettlementFailed);
        Ok(failed)
    }

    fn notify(&self, settlement: &Settlement, event: WebhookEventType) {
        let data = serde_json::json!({ "settlement": settlement });
        self.notifier.notify_in_background(
            settlement.merchant_id,
            event,
            Some(settlement.id),
            data,
        );
    }

    /// Move a pending batch to processing and dispatch its net amount to the
    /// merchant's settlement address. Records the payout hash on success;
    /// a dispatch failure marks the batch failed with the error.
    #[instrument(skip(self))]
    pub async fn execute_payout(&self, settlement_id: Uuid) -> AppResult<Settlement> {
        let settlement = self.get(settlement_id).await?;
        if settlement.status != SettlementStatus::Pending {
            return Err(SettlementError::InvalidTransition {
                id: settlement_id,
                from: settlement.status,
                to: SettlementStatus::Processing,
            }
            .into());
        }

        let merchant = self
            .merchants
            .find_by_id(settlement.merchant_id)
            .await?
            .ok_or(PaymentError::MerchantNotFound(settlement.merchant_id))?;

        let Some(address) = merchant.settlement_address.filter(|a| !a.is_empty()) else {
            self.fail(&settlement, "merchant has no settlement address")
                .await?;
            return Err(SettlementError::NoSettlementAddress(settlement.merchant_id).into());
        };

        let processing = self
            .move_to(&settlement, SettlementStatus::Processing, None)
            .await?;

        match self
            .chain
            .send_transfer(&address, processing.net_amount, processing.payout_network)
            .await
        {
            Ok(hash) => {
                self.store
                    .set_settlement_payout_hash(settlement_id, &hash)
                    .await?;
                info!(
                    settlement_id = %settlement_id,
                    "💸 Payout of {} sent to {}: {}",
                    processing.net_amount,
                    address,
                    hash
                );
                self.get(settlement_id).await
            }
            Err(e) => {
                let message = e.to_string();
                self.fail(&processing, &message).await?;
                Err(SettlementError::PayoutFailed {
                    id: settlement_id,
                    message,
                }
                .into())
            }
        }
    }

    /// Watch a dispatched payout until it confirms, fails, or the watch times out.
    /// A timeout leaves the batch processing for `reconcile_processing_payouts`.
    pub async fn monitor_payout(&self, settlement_id: Uuid) -> AppResult<Settlement> {
        let settlement = self.get(settlement_id).await?;
        let Some(hash) = settlement.payout_hash.clone() else {
            return Err(AppError::Conflict(format!(
                "Settlement {} has no payout transaction",
                settlement_id
            )));
        };

        match self.tracker.watch(&hash, settlement.payout_network).await {
            WatchOutcome::Confirmed { .. } => self.complete(&settlement).await,
            WatchOutcome::Failed => {
                self.fail(&settlement, "payout transaction failed on chain")
                    .await
            }
            WatchOutcome::TimedOut { confirmations } => {
                warn!(
                    settlement_id = %settlement_id,
                    "Payout {} unconfirmed after watch ({} confirmations)", hash, confirmations
                );
                Ok(settlement)
            }
        }
    }

    async fn complete(&self, settlement: &Settlement) -> AppResult<Settlement> {
        let completed = self
            .move_to(settlement, SettlementStatus::Completed, None)
            .await?;
        info!(settlement_id = %settlement.id, "✅ Settlement completed");
        self.notify(&completed, WebhookEventType::SettlementCompleted);
        Ok(completed)
    }

    /// Dispatch now, then monitor in the background
    pub async fn run_payout(self: &Arc<Self>, settlement_id: Uuid) -> AppResult<Settlement> {
        let dispatched = self.execute_payout(settlement_id).await?;

        let executor = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = executor.monitor_payout(settlement_id).await {
                error!("Monitoring payout {} failed: {:?}", settlement_id, e);
            }
        });

        Ok(dispatched)
    }

    /// One confirmation check for every processing batch with a payout hash.
    /// Returns how many reached completed or failed.
    pub async fn reconcile_processing_payouts(&self) -> AppResult<usize> {
        let processing = self
            .store
            .list_settlements_by_status(SettlementStatus::Processing)
            .await?;
        let mut resolved = 0;

        for settlement in processing {
            let Some(hash) = settlement.payout_hash.as_deref() else {
                // Dispatch outcome unknown; needs an operator
                warn!(
                    settlement_id = %settlement.id,
                    "Processing settlement has no payout hash"
                );
                continue;
            };

            let result = match self
                .tracker
                .check_once(hash, settlement.payout_network)
                .await
            {
                Ok(Confirmation::Confirmed { .. }) => self.complete(&settlement).await.map(|_| true),
                Ok(Confirmation::Failed) => self
                    .fail(&settlement, "payout transaction failed on chain")
                    .await
                    .map(|_| true),
                Ok(Confirmation::Pending { .. }) => Ok(false),
                Err(e) => Err(e),
            };

            match result {
                Ok(true) => resolved += 1,
                Ok(false) => {}
                Err(e) if e.kind() == ErrorKind::StateConflict => {}
                Err(e) => error!(
                    settlement_id = %settlement.id,
                    "Payout reconciliation failed: {:?}", e
                ),
            }
        }

        Ok(resolved)
    }

    /// Operator recovery for a failed batch: drop its payment links so the
    /// payments are picked up by the next batch run. The batch itself stays failed.
    pub async fn release_failed_batch(&self, settlement_id: Uuid) -> AppResult<u64> {
        let settlement = self.get(settlement_id).await?;
        if settlement.status != SettlementStatus::Failed {
            return Err(AppError::Conflict(format!(
                "Settlement {} is {}; only failed batches can be released",
                settlement_id, settlement.status
            )));
        }

        let released = self.store.release_settlement_links(settlement_id).await?;
        info!(
            settlement_id = %settlement_id,
            "♻️  Released {} payments from failed settlement", released
        );
        Ok(released)
    }
}
