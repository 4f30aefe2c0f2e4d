use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Serialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::ledger::models::{DeliveryStatus, WebhookEventType};
use crate::ledger::LedgerStore;
use crate::merchants::MerchantDirectory;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
const USER_AGENT: &str = "paygate-webhook/1.0";

/// Hex HMAC-SHA256 of `body` under `secret`
pub fn sign_payload(secret: &str, body: &[u8]) -> AppResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Internal(format!("HMAC key error: {}", e)))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex HMAC-SHA256 signature
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Notification transport collaborator
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// POST the signed body and return the HTTP status code
    async fn post(&self, url: &str, body: &str, signature: &str) -> AppResult<u16>;
}

pub struct HttpWebhookTransport {
    client: Client,
}

impl HttpWebhookTransport {
    pub fn new(timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    async fn post(&self, url: &str, body: &str, signature: &str) -> AppResult<u16> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body.to_string())
            .send()
            .await?;

        Ok(response.status().as_u16())
    }
}

/// Envelope delivered to the merchant endpoint
#[derive(Debug, Serialize)]
pub struct WebhookEnvelope<'a> {
    pub event: WebhookEventType,
    pub data: &'a serde_json::Value,
    pub merchant_id: Uuid,
    pub timestamp: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Merchant has no webhook URL
    Skipped,
    Delivered,
    Failed,
}

/// Delivers signed webhook notifications. One attempt per event, no retry.
pub struct Notifier {
    ledger: Arc<dyn LedgerStore>,
    merchants: Arc<dyn MerchantDirectory>,
    transport: Arc<dyn WebhookTransport>,
}

impl Notifier {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        merchants: Arc<dyn MerchantDirectory>,
        transport: Arc<dyn WebhookTransport>,
    ) -> Self {
        Self {
            ledger,
            merchants,
            transport,
        }
    }

    pub async fn notify(
        &self,
        merchant_id: Uuid,
        event_type: WebhookEventType,
        resource_id: Option<Uuid>,
        data: serde_json::Value,
    ) -> AppResult<DeliveryOutcome> {
        let Some(merchant) = self.merchants.find_by_id(merchant_id).await? else {
            warn!("Webhook {} dropped: merchant {} not found", event_type, merchant_id);
            return Ok(DeliveryOutcome::Skipped);
        };

        let Some(url) = merchant.webhook_url.filter(|u| !u.is_empty()) else {
            debug!("Merchant {} has no webhook URL, skipping {}", merchant_id, event_type);
            return Ok(DeliveryOutcome::Skipped);
        };

        let envelope = WebhookEnvelope {
            event: event_type,
            data: &data,
            merchant_id,
            timestamp: Utc::now(),
        };
        let body = serde_json::to_string(&envelope)?;

        let event_id = self
            .ledger
            .insert_webhook_event(merchant_id, event_type, resource_id, &data)
            .await?;

        let Some(secret) = merchant.webhook_secret.filter(|s| !s.is_empty()) else {
            warn!("Merchant {} has no webhook secret, {} not sent", merchant_id, event_type);
            self.ledger
                .finish_webhook_event(
                    event_id,
                    DeliveryStatus::Failed,
                    None,
                    Some("missing webhook secret"),
                    Utc::now(),
                )
                .await?;
            return Ok(DeliveryOutcome::Failed);
        };

        let signature = sign_payload(&secret, body.as_bytes())?;

        let (status, code, failure) = match self.transport.post(&url, &body, &signature).await {
            Ok(code) if (200..300).contains(&code) => (DeliveryStatus::Delivered, Some(code), None),
            Ok(code) => (
                DeliveryStatus::Failed,
                Some(code),
                Some(format!("HTTP {}", code)),
            ),
            Err(e) => (DeliveryStatus::Failed, None, Some(e.to_string())),
        };

        self.ledger
            .finish_webhook_event(
                event_id,
                status,
                code.map(i32::from),
                failure.as_deref(),
                Utc::now(),
            )
            .await?;

        if status == DeliveryStatus::Delivered {
            info!("📨 Webhook {} delivered to merchant {}", event_type, merchant_id);
            Ok(DeliveryOutcome::Delivered)
        } else {
            error!(
                "Webhook {} delivery failed for merchant {}: {}",
                event_type,
                merchant_id,
                failure.unwrap_or_default()
            );
            Ok(DeliveryOutcome::Failed)
        }
    }

    /// Fire-and-forget delivery; failures end in the delivery record and the log
    pub fn notify_in_background(
        self: &Arc<Self>,
        merchant_id: Uuid,
        event_type: WebhookEventType,
        resource_id: Option<Uuid>,
        data: serde_json::Value,
    ) {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = notifier
                .notify(merchant_id, event_type, resource_id, data)
                .await
            {
                error!("Webhook {} for merchant {} errored: {:?}", event_type, merchant_id, e);
            }
        });
    }
}
