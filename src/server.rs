use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::api::handler::{
    cancel_payment, chain_webhook, create_payment, estimate_fees, execute_payout, get_payment,
    health_check, list_payments, release_failed_batch, run_settlement_schedule, sweep_expired,
    AppState,
};

pub fn create_app(state: AppState) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Payments
                .route("/merchants/:merchant_id/payments", post(create_payment).get(list_payments))
                .route(
                    "/merchants/:merchant_id/payments/:payment_id/cancel",
                    post(cancel_payment),
                )
                .route("/payments/:payment_id", get(get_payment))
                .route("/fees/estimate", post(estimate_fees))
                // Chain gateway push
                .route("/webhook/chain", post(chain_webhook))
                // Operator endpoints
                .route("/admin/payments/sweep", post(sweep_expired))
                .route("/admin/settlements/run/:schedule", post(run_settlement_schedule))
                .route("/admin/settlements/:settlement_id/execute", post(execute_payout))
                .route(
                    "/admin/settlements/:settlement_id/release",
                    post(release_failed_batch),
                ),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
