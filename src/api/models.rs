use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::ledger::models::*;

// ========== REQUEST MODELS ==========

/// Body of POST /merchants/:merchant_id/payments
#[derive(Debug, Deserialize, Validate)]
pub struct CreatePaymentBody {
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Currency,
    #[validate(length(min = 1, max = 255))]
    pub external_id: Option<String>,
    /// Minutes until expiry
    pub expires_in: Option<i64>,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
    #[validate(email)]
    pub customer_email: Option<String>,
    #[validate(length(min = 5, max = 32))]
    pub customer_phone: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl From<CreatePaymentBody> for CreatePaymentRequest {
    fn from(body: CreatePaymentBody) -> Self {
        Self {
            amount: body.amount,
            currency: body.currency,
            external_id: body.external_id,
            expires_in: body.expires_in,
            description: body.description,
            customer_email: body.customer_email,
            customer_phone: body.customer_phone,
            metadata: body.metadata,
        }
    }
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    50
}

/// Query of GET /merchants/:merchant_id/payments
#[derive(Debug, Deserialize, Validate)]
pub struct ListPaymentsQuery {
    #[serde(default = "default_page")]
    #[validate(range(min = 1))]
    pub page: u32,
    #[serde(default = "default_page_size")]
    #[validate(range(min = 1, max = 100))]
    pub limit: u32,
}

/// Transfer notification pushed by the chain gateway
#[derive(Debug, Deserialize, Validate)]
pub struct ChainWebhookPayload {
    pub network: Network,
    #[validate(length(min = 10, max = 128))]
    pub transaction_hash: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct FeeEstimateRequest {
    #[validate(length(min = 1, max = 100))]
    pub amounts: Vec<Decimal>,
    pub fee_rate: Option<Decimal>,
}

/// Run validator derives and flatten field errors into one message
pub fn validated<T: Validate>(value: T) -> AppResult<T> {
    value.validate().map_err(|e| {
        let errors = e
            .field_errors()
            .into_iter()
            .map(|(field, errors)| {
                let codes: Vec<String> = errors
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| e.code.to_string())
                    })
                    .collect();
                format!("{}: {}", field, codes.join(", "))
            })
            .collect::<Vec<String>>()
            .join("; ");
        AppError::InvalidInput(format!("Validation failed: {}", errors))
    })?;
    Ok(value)
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub payment_id: Uuid,
    pub merchant_id: Uuid,
    pub external_id: Option<String>,
    pub amount: String,
    pub currency: String,
    pub network: String,
    pub status: PaymentStatus,
    pub deposit_address: String,
    /// Reference the payer must attach to the transfer
    pub memo: String,
    pub payment_url: Option<String>,
    pub qr_code_data: Option<String>,
    pub description: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl From<Payment> for PaymentResponse {
    fn from(payment: Payment) -> Self {
        Self {
            memo: payment.memo(),
            payment_id: payment.id,
            merchant_id: payment.merchant_id,
            external_id: payment.external_id,
            amount: payment.amount.to_string(),
            currency: payment.currency.to_string(),
            network: payment.network.to_string(),
            status: payment.status,
            deposit_address: payment.deposit_address,
            payment_url: payment.payment_url,
            qr_code_data: payment.qr_code_data,
            description: payment.description,
            expires_at: payment.expires_at,
            created_at: payment.created_at,
            completed_at: payment.completed_at,
            cancelled_at: payment.cancelled_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: i64,
    pub total_pages: i64,
}

#[derive(Debug, Serialize)]
pub struct PaymentListResponse {
    pub payments: Vec<PaymentResponse>,
    pub pagination: Pagination,
}

impl From<PaymentPage> for PaymentListResponse {
    fn from(page: PaymentPage) -> Self {
        let pagination = Pagination {
            page: page.page,
            limit: page.limit,
            total: page.total,
            total_pages: page.total_pages(),
        };
        Self {
            payments: page.payments.into_iter().map(PaymentResponse::from).collect(),
            pagination,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    pub expired: usize,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub settlement_id: Uuid,
    pub released_payments: u64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: bool,
    pub timestamp: DateTime<Utc>,
}
