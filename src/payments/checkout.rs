use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;

use crate::error::AppResult;
use crate::ledger::models::Payment;

/// Payload a wallet scans to pay. The payment id must travel as the transfer memo.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QrPayload<'a> {
    address: &'a str,
    amount: String,
    currency: String,
    payment_id: String,
    network: &'static str,
}

pub fn payment_url(base_url: &str, payment: &Payment) -> String {
    format!("{}/pay/{}", base_url.trim_end_matches('/'), payment.id)
}

/// Base64-encoded JSON QR payload for a payment
pub fn qr_code_data(payment: &Payment) -> AppResult<String> {
    let payload = QrPayload {
        address: &payment.deposit_address,
        amount: payment.amount.normalize().to_string(),
        currency: payment.currency.to_string(),
        payment_id: payment.memo(),
        network: payment.network.as_str(),
    };
    Ok(STANDARD.encode(serde_json::to_vec(&payload)?))
}
