use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::models::{Network, PaymentStatus, SettlementStatus};

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),

    #[error("Reconciliation error: {0}")]
    Reconciliation(#[from] ReconciliationError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("External error: {0}")]
    ExternalError(String),
}

/// Payment ledger errors
#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Payment not found: {0}")]
    NotFound(Uuid),

    #[error("Merchant not found: {0}")]
    MerchantNotFound(Uuid),

    #[error("Merchant {0} is not active")]
    MerchantNotActive(Uuid),

    #[error("Invalid amount {amount}: must be > 0 and <= {ceiling}")]
    InvalidAmount { amount: String, ceiling: String },

    #[error("Invalid expiry: {minutes} minutes (allowed {min}-{max})")]
    InvalidExpiry { minutes: i64, min: i64, max: i64 },

    #[error("Invalid fee rate: {0}")]
    InvalidFeeRate(String),

    #[error("Invalid transition for payment {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
    },
}

/// Transaction matching / confirmation errors
#[derive(Error, Debug)]
pub enum ReconciliationError {
    #[error("Transaction {hash} not found on {network}")]
    TransactionNotFound { hash: String, network: Network },
}

/// Settlement batching / payout errors
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Settlement not found: {0}")]
    NotFound(Uuid),

    #[error("Merchant {0} has no settlement address")]
    NoSettlementAddress(Uuid),

    #[error("Invalid settlement transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: SettlementStatus,
        to: SettlementStatus,
    },

    #[error("Payout dispatch failed for settlement {id}: {message}")]
    PayoutFailed { id: Uuid, message: String },
}

/// Chain client errors
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Insufficient balance on {network} for transfer of {amount}")]
    InsufficientBalance { network: Network, amount: String },

    #[error("Chain gateway error on {network}: {message}")]
    Gateway { network: Network, message: String },

    #[error("Invalid chain response: {0}")]
    InvalidResponse(String),
}

/// Failure classes used to decide how a caller reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input. Surfaced, never retried.
    Validation,
    /// Unknown payment/settlement/merchant. Surfaced, never retried.
    NotFound,
    /// Illegal transition or already-processed key.
    StateConflict,
    /// Chain client or notification transport failure. Left for the next trigger.
    External,
    Internal,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Payment(PaymentError::NotFound(_))
            | AppError::Payment(PaymentError::MerchantNotFound(_))
            | AppError::Settlement(SettlementError::NotFound(_))
            | AppError::Reconciliation(ReconciliationError::TransactionNotFound { .. })
            | AppError::NotFound(_) => ErrorKind::NotFound,

            AppError::Payment(PaymentError::MerchantNotActive(_))
            | AppError::Payment(PaymentError::InvalidAmount { .. })
            | AppError::Payment(PaymentError::InvalidExpiry { .. })
            | AppError::Payment(PaymentError::InvalidFeeRate(_))
            | AppError::Settlement(SettlementError::NoSettlementAddress(_))
            | AppError::InvalidInput(_)
            | AppError::Unauthorized => ErrorKind::Validation,

            AppError::Payment(PaymentError::InvalidTransition { .. })
            | AppError::Settlement(SettlementError::InvalidTransition { .. })
            | AppError::Conflict(_) => ErrorKind::StateConflict,

            AppError::Chain(_)
            | AppError::Settlement(SettlementError::PayoutFailed { .. })
            | AppError::ExternalError(_) => ErrorKind::External,

            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// True when the database rejected a write on a unique constraint
    pub fn is_unique_violation(&self) -> bool {
        match self {
            AppError::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            AppError::Conflict(_) => true,
            _ => false,
        }
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, details) = match &self {
            AppError::Payment(PaymentError::NotFound(id)) => (
                StatusCode::NOT_FOUND,
                "PAYMENT_NOT_FOUND",
                Some(serde_json::json!({ "payment_id": id })),
            ),
            AppError::Payment(PaymentError::MerchantNotFound(_)) => {
                (StatusCode::NOT_FOUND, "MERCHANT_NOT_FOUND", None)
            }
            AppError::Payment(PaymentError::MerchantNotActive(_)) => {
                (StatusCode::FORBIDDEN, "MERCHANT_NOT_ACTIVE", None)
            }
            AppError::Payment(PaymentError::InvalidAmount { amount, ceiling }) => (
                StatusCode::BAD_REQUEST,
                "INVALID_AMOUNT",
                Some(serde_json::json!({ "amount": amount, "ceiling": ceiling })),
            ),
            AppError::Payment(PaymentError::InvalidExpiry { .. }) => {
                (StatusCode::BAD_REQUEST, "INVALID_EXPIRY", None)
            }
            AppError::Payment(PaymentError::InvalidFeeRate(_)) => {
                (StatusCode::BAD_REQUEST, "INVALID_FEE_RATE", None)
            }
            AppError::Payment(PaymentError::InvalidTransition { from, to, .. }) => (
                StatusCode::CONFLICT,
                "INVALID_TRANSITION",
                Some(serde_json::json!({ "from": from, "to": to })),
            ),
            AppError::Reconciliation(ReconciliationError::TransactionNotFound { .. }) => {
                (StatusCode::NOT_FOUND, "TRANSACTION_NOT_FOUND", None)
            }
            AppError::Settlement(SettlementError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "SETTLEMENT_NOT_FOUND", None)
            }
            AppError::Settlement(SettlementError::NoSettlementAddress(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "NO_SETTLEMENT_ADDRESS", None)
            }
            AppError::Settlement(SettlementError::InvalidTransition { from, to, .. }) => (
                StatusCode::CONFLICT,
                "INVALID_SETTLEMENT_TRANSITION",
                Some(serde_json::json!({ "from": from, "to": to })),
            ),
            AppError::Settlement(SettlementError::PayoutFailed { .. }) | AppError::Chain(_) => {
                (StatusCode::BAD_GATEWAY, "CHAIN_ERROR", None)
            }
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", None),
            AppError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT", None),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT", None),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", None),
            AppError::ExternalError(_) => (StatusCode::BAD_GATEWAY, "EXTERNAL_ERROR", None),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", None),
            AppError::Config(_) | AppError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", None)
            }
        };

        // Internal failures never leak their message
        let message = match self.kind() {
            ErrorKind::Internal => "An internal error occurred".to_string(),
            _ => self.to_string(),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::InvalidInput(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::ExternalError(format!("HTTP request error: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Internal(format!("Serialization error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
