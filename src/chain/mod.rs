use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::config::ChainSettings;
use crate::error::{AppResult, ChainError};
use crate::ledger::models::Network;

/// Chain-reported execution status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainTxStatus {
    Pending,
    Success,
    Failed,
}

/// A token transfer as reported by the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransactionDetails {
    pub hash: String,
    pub network: Network,
    pub from: String,
    pub to: String,
    /// Token smallest units (USDC has 6 decimals)
    pub amount: u128,
    pub confirmations: u64,
    pub block_number: Option<u64>,
    pub status: ChainTxStatus,
    /// Reference attached to the transfer; carries the payment id
    pub memo: Option<String>,
}

impl ChainTransactionDetails {
    pub fn amount_decimal(&self) -> AppResult<Decimal> {
        self.network.from_base_units(self.amount)
    }
}

/// Chain client collaborator. Stateless: every call carries what it needs.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// `Ok(None)` when the chain has no such hash
    async fn get_transaction(
        &self,
        hash: &str,
        network: Network,
    ) -> AppResult<Option<ChainTransactionDetails>>;

    /// Transfer `amount` of the stablecoin and return the transaction hash
    async fn send_transfer(
        &self,
        to_address: &str,
        amount: Decimal,
        network: Network,
    ) -> AppResult<String>;

    async fn current_block_height(&self, network: Network) -> AppResult<u64>;

    fn required_confirmations(&self, network: Network) -> u64 {
        network.required_confirmations()
    }
}

/// HTTP client for the chain gateway service that fronts the node RPCs and
/// the treasury signer.
pub struct HttpChainClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GatewayTransaction {
    hash: String,
    from: String,
    to: String,
    amount: String,
    confirmations: u64,
    block_number: Option<u64>,
    status: ChainTxStatus,
    memo: Option<String>,
}

#[derive(Debug, Serialize)]
struct TransferRequest<'a> {
    to: &'a str,
    amount: String,
    token: &'static str,
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    hash: String,
}

#[derive(Debug, Deserialize)]
struct BlockResponse {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct GatewayError {
    code: Option<String>,
    message: Option<String>,
}

impl HttpChainClient {
    pub fn new(settings: &ChainSettings) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: settings.gateway_url.trim_end_matches('/').to_string(),
            api_key: settings.gateway_api_key.clone(),
        })
    }

    fn url(&self, network: Network, path: &str) -> String {
        format!("{}/v1/{}/{}", self.base_url, network.as_str(), path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("X-Api-Key", key),
            None => request,
        }
    }

    async fn gateway_error(network: Network, response: reqwest::Response) -> ChainError {
        let status = response.status();
        let body = response.json::<GatewayError>().await.ok();
        let message = body
            .as_ref()
            .and_then(|b| b.message.clone())
            .unwrap_or_else(|| status.to_string());

        ChainError::Gateway { network, message }
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    #[instrument(skip(self))]
    async fn get_transaction(
        &self,
        hash: &str,
        network: Network,
    ) -> AppResult<Option<ChainTransactionDetails>> {
        let url = self.url(network, &format!("transactions/{}", hash));
        let response = self.authorize(self.client.get(&url)).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Transaction {} not found on {}", hash, network);
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::gateway_error(network, response).await.into());
        }

        let tx: GatewayTransaction = response.json().await?;
        let amount = tx.amount.parse::<u128>().map_err(|_| {
            ChainError::InvalidResponse(format!("Invalid amount '{}' for {}", tx.amount, tx.hash))
        })?;

        Ok(Some(ChainTransactionDetails {
            hash: tx.hash,
            network,
            from: tx.from,
            to: tx.to,
            amount,
            confirmations: tx.confirmations,
            block_number: tx.block_number,
            status: tx.status,
            memo: tx.memo,
        }))
    }

    #[instrument(skip(self))]
    async fn send_transfer(
        &self,
        to_address: &str,
        amount: Decimal,
        network: Network,
    ) -> AppResult<String> {
        let request = TransferRequest {
            to: to_address,
            amount: network.to_base_units(amount)?.to_string(),
            token: "USDC",
        };

        let url = self.url(network, "transfers");
        let response = self
            .authorize(self.client.post(&url))
            .json(&request)
            .send()
            .await?;

        if response.status() == StatusCode::PAYMENT_REQUIRED {
            return Err(ChainError::InsufficientBalance {
                network,
                amount: amount.to_string(),
            }
            .into());
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.json::<GatewayError>().await.ok();
            if body.as_ref().and_then(|b| b.code.as_deref()) == Some("insufficient_balance") {
                return Err(ChainError::InsufficientBalance {
                    network,
                    amount: amount.to_string(),
                }
                .into());
            }
            let message = body
                .and_then(|b| b.message)
                .unwrap_or_else(|| status.to_string());
            return Err(ChainError::Gateway { network, message }.into());
        }

        let transfer: TransferResponse = response.json().await?;
        info!("💸 Transfer of {} USDC to {} sent: {}", amount, to_address, transfer.hash);
        Ok(transfer.hash)
    }

    async fn current_block_height(&self, network: Network) -> AppResult<u64> {
        let url = self.url(network, "blocks/latest");
        let response = self.authorize(self.client.get(&url)).send().await?;

        if !response.status().is_success() {
            return Err(Self::gateway_error(network, response).await.into());
        }

        let block: BlockResponse = response.json().await?;
        Ok(block.number)
    }
}
