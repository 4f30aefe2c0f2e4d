use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::error::{AppResult, PaymentError};
use crate::ledger::models::BatchTotals;

/// System-wide fee rate when a merchant has none set (1.5%)
pub const DEFAULT_FEE_RATE: Decimal = dec!(0.015);
/// Minimum fee charged per computation ($0.30)
pub const MINIMUM_FEE: Decimal = dec!(0.30);
/// Highest fee rate a merchant may carry (5%)
pub const MAX_FEE_RATE: Decimal = dec!(0.05);

const VISA_FEE_RATE: Decimal = dec!(0.029);
const MASTERCARD_FEE_RATE: Decimal = dec!(0.031);

/// Fee/net split of a gross amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeBreakdown {
    #[serde(with = "rust_decimal::serde::float")]
    pub gross_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub fee_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub net_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub fee_rate: Decimal,
}

impl From<FeeBreakdown> for BatchTotals {
    fn from(fee: FeeBreakdown) -> Self {
        BatchTotals {
            gross_amount: fee.gross_amount,
            fee_amount: fee.fee_amount,
            net_amount: fee.net_amount,
        }
    }
}

fn round_cents(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Split `gross` into fee and net.
///
/// fee = max(gross * rate, MINIMUM_FEE), net = gross - fee. Intermediate math
/// keeps full precision; only the returned amounts are rounded to cents.
pub fn compute_fee(gross: Decimal, fee_rate: Option<Decimal>) -> AppResult<FeeBreakdown> {
    let rate = fee_rate.unwrap_or(DEFAULT_FEE_RATE);
    if rate < Decimal::ZERO || rate > MAX_FEE_RATE {
        return Err(PaymentError::InvalidFeeRate(rate.to_string()).into());
    }

    let fee = round_cents((gross * rate).max(MINIMUM_FEE));
    let net = round_cents(gross - fee);

    Ok(FeeBreakdown {
        gross_amount: gross,
        fee_amount: fee,
        net_amount: net,
        fee_rate: rate,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Savings {
    #[serde(with = "rust_decimal::serde::float")]
    pub crypto_fee: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub visa_fee: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub mastercard_fee: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub vs_visa: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub vs_mastercard: Decimal,
}

/// Display-only comparison against flat card processor rates
pub fn calculate_savings(amount: Decimal, fee_rate: Option<Decimal>) -> Savings {
    let rate = fee_rate.unwrap_or(DEFAULT_FEE_RATE);
    let crypto_fee = amount * rate;
    let visa_fee = amount * VISA_FEE_RATE;
    let mastercard_fee = amount * MASTERCARD_FEE_RATE;

    Savings {
        crypto_fee: round_cents(crypto_fee),
        visa_fee: round_cents(visa_fee),
        mastercard_fee: round_cents(mastercard_fee),
        vs_visa: round_cents(visa_fee - crypto_fee),
        vs_mastercard: round_cents(mastercard_fee - crypto_fee),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeEstimate {
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub fee: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub net: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub savings_vs_visa: Decimal,
}

pub fn fee_estimates(amounts: &[Decimal], fee_rate: Option<Decimal>) -> AppResult<Vec<FeeEstimate>> {
    amounts
        .iter()
        .map(|&amount| {
            let fee = compute_fee(amount, fee_rate)?;
            let savings = calculate_savings(amount, fee_rate);
            Ok(FeeEstimate {
                amount,
                fee: fee.fee_amount,
                net: fee.net_amount,
                savings_vs_visa: savings.vs_visa,
            })
        })
        .collect()
}
