//! HTTP API: Axum server for the wallet and bet endpoints.
//!
//! CORS is open for the presentation layer; identity is taken from the
//! gateway-supplied `x-user-id` header (see `routes::VerifiedUser`).

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderName, Method},
    routing::{get, post},
    Router,
};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

pub use routes::{ApiState, AppState};

/// Bind the API port and serve in a background task.
pub async fn spawn_api(state: AppState, port: u16) -> Result<JoinHandle<()>> {
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API port {port}"))?;
    info!(port, "API server listening on http://localhost:{port}");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server error");
        }
    }))
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(routes::USER_HEADER),
            HeaderName::from_static(routes::IDEMPOTENCY_HEADER),
        ]);

    Router::new()
        // Wallet
        .route("/api/wallet/balance", get(routes::get_balance))
        .route("/api/wallet/history", get(routes::get_history))
        .route("/api/wallet/statement", get(routes::get_statement))
        .route("/api/wallet/withdrawals", post(routes::request_withdrawal))
        // Bets
        .route("/api/bets", get(routes::list_bets).post(routes::place_bet))
        .route("/api/bets/stats", get(routes::bet_stats))
        .route("/api/bets/:bet_id/cancel", post(routes::cancel_bet))
        // Collaborator callbacks
        .route("/api/payments/deposits", post(routes::confirm_deposit))
        .route(
            "/api/payments/withdrawals/:reference_id",
            post(routes::confirm_withdrawal),
        )
        .route("/api/settlements", post(routes::enqueue_settlement))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
