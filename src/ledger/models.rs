use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::Type;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Chain network a stablecoin transfer lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "network_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Ethereum,
    Polygon,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Network {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ethereum" => Ok(Network::Ethereum),
            "polygon" => Ok(Network::Polygon),
            other => Err(AppError::InvalidInput(format!("Unsupported network: {}", other))),
        }
    }
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Ethereum => "ethereum",
            Network::Polygon => "polygon",
        }
    }

    /// Blocks on top of a transaction before it is treated as final.
    /// Polygon needs more because its blocks are faster and reorg deeper.
    pub fn required_confirmations(&self) -> u64 {
        match self {
            Network::Ethereum => 3,
            Network::Polygon => 10,
        }
    }

    /// Decimal precision of the USDC token contract
    pub fn token_decimals(&self) -> u32 {
        6
    }

    /// Convert a currency amount into the token's smallest unit
    pub fn to_base_units(&self, amount: Decimal) -> AppResult<u128> {
        let scale = Decimal::from(10u64.pow(self.token_decimals()));
        amount
            .checked_mul(scale)
            .and_then(|units| units.trunc().to_u128())
            .ok_or_else(|| AppError::InvalidInput(format!("Amount out of range: {}", amount)))
    }

    /// Convert smallest token units back into a currency amount
    pub fn from_base_units(&self, units: u128) -> AppResult<Decimal> {
        let units = i128::try_from(units)
            .map_err(|_| AppError::InvalidInput(format!("Amount out of range: {}", units)))?;
        Ok(Decimal::try_from_i128_with_scale(units, self.token_decimals())?.normalize())
    }
}

/// Currencies a payment can be denominated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type, Default)]
#[sqlx(type_name = "currency_code", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    #[default]
    Usdc,
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Currency::Usdc => write!(f, "USDC"),
        }
    }
}

/// Payment status state machine
///
/// pending -> processing -> completed
/// pending -> cancelled | expired
/// pending | processing -> failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Cancelled,
    Expired,
    Failed,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Expired => "expired",
            PaymentStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed
                | PaymentStatus::Cancelled
                | PaymentStatus::Expired
                | PaymentStatus::Failed
        )
    }

    pub fn can_transition_to(&self, to: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Pending, Expired)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }
}

/// Payment entity - one request for funds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub external_id: Option<String>,

    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: Currency,
    pub network: Network,
    pub status: PaymentStatus,

    /// Receiving wallet; the payment id travels as the transfer memo
    pub deposit_address: String,
    pub payment_url: Option<String>,
    pub qr_code_data: Option<String>,

    pub description: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub metadata: Option<serde_json::Value>,

    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Payment id as carried in the on-chain memo
    pub fn memo(&self) -> String {
        self.id.to_string()
    }
}

/// Fields the ledger persists for a new payment
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub external_id: Option<String>,
    pub amount: Decimal,
    pub currency: Currency,
    pub network: Network,
    pub deposit_address: String,
    pub description: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Merchant request to open a payment
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreatePaymentRequest {
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Currency,
    pub external_id: Option<String>,
    /// Minutes until expiry
    pub expires_in: Option<i64>,
    pub description: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// One page of a merchant's payments, newest first
#[derive(Debug, Clone)]
pub struct PaymentPage {
    pub payments: Vec<Payment>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

impl PaymentPage {
    pub fn total_pages(&self) -> i64 {
        let limit = i64::from(self.limit.max(1));
        (self.total + limit - 1) / limit
    }
}

/// Chain transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

/// Observed chain transfer, keyed by its globally unique hash
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub id: Uuid,
    pub transaction_hash: String,
    pub network: Network,
    pub payment_id: Option<Uuid>,
    pub from_address: String,
    pub to_address: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub block_number: Option<i64>,
    pub confirmation_count: i64,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub transaction_hash: String,
    pub network: Network,
    pub payment_id: Option<Uuid>,
    pub from_address: String,
    pub to_address: String,
    pub amount: Decimal,
    pub block_number: Option<i64>,
    pub confirmation_count: i64,
    pub status: TransactionStatus,
}

/// Settlement batch status
///
/// pending -> processing -> completed
/// pending | processing -> failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "settlement_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SettlementStatus::Pending => "pending",
            SettlementStatus::Processing => "processing",
            SettlementStatus::Completed => "completed",
            SettlementStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl SettlementStatus {
    pub fn can_transition_to(&self, to: SettlementStatus) -> bool {
        use SettlementStatus::*;
        matches!(
            (self, to),
            (Pending, Processing) | (Pending, Failed) | (Processing, Completed) | (Processing, Failed)
        )
    }
}

/// Settlement entity - one payout cycle for one merchant over [period_start, period_end)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,

    #[serde(with = "rust_decimal::serde::float")]
    pub gross_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub fee_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub net_amount: Decimal,
    pub transaction_count: i32,

    pub status: SettlementStatus,
    pub payout_network: Network,
    pub payout_hash: Option<String>,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Totals computed for a batch before it is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchTotals {
    pub gross_amount: Decimal,
    pub fee_amount: Decimal,
    pub net_amount: Decimal,
}

/// Result of one atomic batch-creation attempt
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Created(Settlement),
    NothingToSettle,
    NonPositiveNet { gross_amount: Decimal, net_amount: Decimal },
}

/// Merchant settlement cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "settlement_schedule", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SettlementSchedule {
    Daily,
    Weekly,
    Monthly,
}

impl fmt::Display for SettlementSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SettlementSchedule::Daily => "daily",
            SettlementSchedule::Weekly => "weekly",
            SettlementSchedule::Monthly => "monthly",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for SettlementSchedule {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(SettlementSchedule::Daily),
            "weekly" => Ok(SettlementSchedule::Weekly),
            "monthly" => Ok(SettlementSchedule::Monthly),
            other => Err(AppError::InvalidInput(format!("Invalid settlement period: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "merchant_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MerchantStatus {
    PendingVerification,
    Active,
    Suspended,
    Closed,
}

/// Merchant as read from the merchant directory. Never mutated here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Merchant {
    pub id: Uuid,
    pub status: MerchantStatus,
    /// None means the system default rate applies
    pub fee_rate: Option<Decimal>,
    pub settlement_address: Option<String>,
    pub settlement_schedule: SettlementSchedule,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

impl Merchant {
    pub fn is_active(&self) -> bool {
        self.status == MerchantStatus::Active
    }
}

/// Outbound webhook event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEventType {
    #[serde(rename = "payment.completed")]
    PaymentCompleted,
    #[serde(rename = "payment.expired")]
    PaymentExpired,
    #[serde(rename = "payment.cancelled")]
    PaymentCancelled,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "settlement.completed")]
    SettlementCompleted,
    #[serde(rename = "settlement.failed")]
    SettlementFailed,
}

impl WebhookEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventType::PaymentCompleted => "payment.completed",
            WebhookEventType::PaymentExpired => "payment.expired",
            WebhookEventType::PaymentCancelled => "payment.cancelled",
            WebhookEventType::PaymentFailed => "payment.failed",
            WebhookEventType::SettlementCompleted => "settlement.completed",
            WebhookEventType::SettlementFailed => "settlement.failed",
        }
    }

    /// Event fired when a payment lands in `status`, if any
    pub fn for_payment_status(status: PaymentStatus) -> Option<Self> {
        match status {
            PaymentStatus::Completed => Some(WebhookEventType::PaymentCompleted),
            PaymentStatus::Expired => Some(WebhookEventType::PaymentExpired),
            PaymentStatus::Cancelled => Some(WebhookEventType::PaymentCancelled),
            PaymentStatus::Failed => Some(WebhookEventType::PaymentFailed),
            PaymentStatus::Pending | PaymentStatus::Processing => None,
        }
    }
}

impl fmt::Display for WebhookEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "delivery_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

/// One recorded webhook delivery attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub event_type: String,
    pub resource_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub status: DeliveryStatus,
    pub response_code: Option<i32>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Compute expiry from an optional `expires_in` (minutes), bounded by policy
pub fn expiry_for(
    created_at: DateTime<Utc>,
    expires_in: Option<i64>,
    default_minutes: i64,
    min_minutes: i64,
    max_minutes: i64,
) -> Option<DateTime<Utc>> {
    let minutes = expires_in.unwrap_or(default_minutes);
    if minutes < min_minutes || minutes > max_minutes {
        return None;
    }
    Some(created_at + Duration::minutes(minutes))
}
