use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, ChainTransactionDetails, ChainTxStatus};
use crate::error::{AppResult, ReconciliationError};
use crate::ledger::models::{Network, TransactionStatus};

/// Confirmation state of a chain transaction at one observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Pending { confirmations: u64, required: u64 },
    Confirmed { confirmations: u64 },
    Failed,
}

impl Confirmation {
    pub fn transaction_status(&self) -> TransactionStatus {
        match self {
            Confirmation::Pending { .. } => TransactionStatus::Pending,
            Confirmation::Confirmed { .. } => TransactionStatus::Confirmed,
            Confirmation::Failed => TransactionStatus::Failed,
        }
    }

    pub fn confirmations(&self) -> u64 {
        match self {
            Confirmation::Pending { confirmations, .. } => *confirmations,
            Confirmation::Confirmed { confirmations } => *confirmations,
            Confirmation::Failed => 0,
        }
    }
}

/// Outcome of a bounded watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Confirmed { confirmations: u64 },
    Failed,
    /// Still below depth when the watch ran out; try again later
    TimedOut { confirmations: u64 },
}

/// Tracks chain transactions until they reach the network's confirmation depth
pub struct ConfirmationTracker {
    chain: Arc<dyn ChainClient>,
    poll_interval: Duration,
    timeout: Duration,
}

impl ConfirmationTracker {
    pub fn new(chain: Arc<dyn ChainClient>, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            chain,
            poll_interval,
            timeout,
        }
    }

    /// Classify an observation against the network's required depth
    pub fn classify(&self, details: &ChainTransactionDetails) -> Confirmation {
        let required = self.chain.required_confirmations(details.network);
        match details.status {
            ChainTxStatus::Failed => Confirmation::Failed,
            _ if details.confirmations >= required => Confirmation::Confirmed {
                confirmations: details.confirmations,
            },
            _ => Confirmation::Pending {
                confirmations: details.confirmations,
                required,
            },
        }
    }

    /// One observation. Errors with `TransactionNotFound` if the chain lost the hash.
    pub async fn check_once(&self, hash: &str, network: Network) -> AppResult<Confirmation> {
        let details = self
            .chain
            .get_transaction(hash, network)
            .await?
            .ok_or_else(|| ReconciliationError::TransactionNotFound {
                hash: hash.to_string(),
                network,
            })?;

        Ok(self.classify(&details))
    }

    /// Poll until the transaction is confirmed or failed, or the timeout elapses.
    /// Chain errors while polling are logged and polled through.
    pub async fn watch(&self, hash: &str, network: Network) -> WatchOutcome {
        let mut last_seen = 0;

        let polling = async {
            loop {
                match self.check_once(hash, network).await {
                    Ok(Confirmation::Confirmed { confirmations }) => {
                        return WatchOutcome::Confirmed { confirmations }
                    }
                    Ok(Confirmation::Failed) => return WatchOutcome::Failed,
                    Ok(Confirmation::Pending {
                        confirmations,
                        required,
                    }) => {
                        last_seen = confirmations;
                        debug!("⏳ {} at {}/{} confirmations", hash, confirmations, required);
                    }
                    Err(e) => warn!("Confirmation check for {} failed: {}", hash, e),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        let result = tokio::time::timeout(self.timeout, polling).await;
        match result {
            Ok(outcome) => {
                info!("🔗 Watch of {} on {} resolved: {:?}", hash, network, outcome);
                outcome
            }
            Err(_) => {
                info!(
                    "Watch of {} timed out after {:?}; left pending",
                    hash, self.timeout
                );
                WatchOutcome::TimedOut {
                    confirmations: last_seen,
                }
            }
        }
    }
}
