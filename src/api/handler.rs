use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::*;
use crate::{
    error::{AppError, AppResult},
    fees::{self, FeeEstimate},
    ledger::models::{Settlement, SettlementSchedule},
    notify::verify_signature,
    payments::PaymentService,
    reconciliation::IngestOutcome,
    settlement::batcher::ScheduleReport,
};

/// Header carrying the gateway's HMAC over the raw webhook body
pub const CHAIN_SIGNATURE_HEADER: &str = "x-signature";

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub service: Arc<PaymentService>,
    pub inbound_secret: Arc<String>,
}

/// Create a payment for a merchant
/// POST /merchants/:merchant_id/payments
pub async fn create_payment(
    State(state): State<AppState>,
    Path(merchant_id): Path<Uuid>,
    Json(body): Json<CreatePaymentBody>,
) -> AppResult<Json<PaymentResponse>> {
    let body = validated(body)?;
    info!("🧾 Creating payment of {} for merchant {}", body.amount, merchant_id);

    let payment = state
        .service
        .create_payment(merchant_id, body.into())
        .await?;
    Ok(Json(payment.into()))
}

/// GET /merchants/:merchant_id/payments?page=&limit=
pub async fn list_payments(
    State(state): State<AppState>,
    Path(merchant_id): Path<Uuid>,
    Query(query): Query<ListPaymentsQuery>,
) -> AppResult<Json<PaymentListResponse>> {
    let query = validated(query)?;
    let page = state
        .service
        .list_payments(merchant_id, query.page, query.limit)
        .await?;
    Ok(Json(page.into()))
}

/// GET /payments/:payment_id
pub async fn get_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> AppResult<Json<PaymentResponse>> {
    let payment = state.service.get_payment_status(payment_id).await?;
    Ok(Json(payment.into()))
}

/// POST /merchants/:merchant_id/payments/:payment_id/cancel
pub async fn cancel_payment(
    State(state): State<AppState>,
    Path((merchant_id, payment_id)): Path<(Uuid, Uuid)>,
) -> AppResult<Json<PaymentResponse>> {
    info!("Cancelling payment {} for merchant {}", payment_id, merchant_id);
    let payment = state.service.cancel_payment(merchant_id, payment_id).await?;
    Ok(Json(payment.into()))
}

/// Check the gateway signature over the exact request body
pub fn authenticate_chain_webhook(secret: &str, headers: &HeaderMap, body: &[u8]) -> AppResult<()> {
    if secret.is_empty() {
        warn!("Chain webhook rejected: no inbound secret configured");
        return Err(AppError::Unauthorized);
    }

    let signature = headers
        .get(CHAIN_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthorized)?;

    if !verify_signature(secret, body, signature) {
        warn!("Chain webhook rejected: bad signature");
        return Err(AppError::Unauthorized);
    }
    Ok(())
}

/// Inbound transfer notification from the chain gateway
/// POST /webhook/chain
pub async fn chain_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<IngestOutcome>> {
    authenticate_chain_webhook(&state.inbound_secret, &headers, &body)?;

    let payload: ChainWebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| AppError::InvalidInput(format!("Invalid webhook payload: {}", e)))?;
    let payload = validated(payload)?;
    info!(
        "🔔 Received chain webhook - Network: {}, TX: {}",
        payload.network, payload.transaction_hash
    );

    let outcome = state
        .service
        .ingest_transaction(&payload.transaction_hash, payload.network)
        .await?;
    Ok(Json(outcome))
}

/// POST /admin/settlements/run/:schedule
pub async fn run_settlement_schedule(
    State(state): State<AppState>,
    Path(schedule): Path<String>,
) -> AppResult<Json<ScheduleReport>> {
    let schedule: SettlementSchedule = schedule.parse()?;
    info!("🔄 Manual {} settlement run", schedule);
    let report = state
        .service
        .run_settlement_schedule(schedule, Utc::now())
        .await?;
    Ok(Json(report))
}

/// POST /admin/settlements/:settlement_id/execute
pub async fn execute_payout(
    State(state): State<AppState>,
    Path(settlement_id): Path<Uuid>,
) -> AppResult<Json<Settlement>> {
    let settlement = state.service.payouts().run_payout(settlement_id).await?;
    Ok(Json(settlement))
}

/// Re-open a failed batch's payments for the next run
/// POST /admin/settlements/:settlement_id/release
pub async fn release_failed_batch(
    State(state): State<AppState>,
    Path(settlement_id): Path<Uuid>,
) -> AppResult<Json<ReleaseResponse>> {
    let released_payments = state
        .service
        .payouts()
        .release_failed_batch(settlement_id)
        .await?;
    Ok(Json(ReleaseResponse {
        settlement_id,
        released_payments,
    }))
}

/// POST /admin/payments/sweep
pub async fn sweep_expired(State(state): State<AppState>) -> AppResult<Json<SweepResponse>> {
    let expired = state.service.sweep_expired_payments().await?;
    Ok(Json(SweepResponse { expired }))
}

/// POST /fees/estimate
pub async fn estimate_fees(
    Json(request): Json<FeeEstimateRequest>,
) -> AppResult<Json<Vec<FeeEstimate>>> {
    let request = validated(request)?;
    Ok(Json(fees::fee_estimates(&request.amounts, request.fee_rate)?))
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    let database = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();

    Ok(Json(HealthResponse {
        status: if database { "healthy" } else { "degraded" }.to_string(),
        database,
        timestamp: Utc::now(),
    }))
}
