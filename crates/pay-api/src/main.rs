//! # pay-gateway
//!
//! Payment gateway server for Stripe and PayPal.
//!
//! ## Usage
//!
//! ```bash
//! # Set environment variables
//! export STRIPE_SECRET_KEY=sk_test_...
//! export STRIPE_WEBHOOK_SECRET=whsec_...
//! export PAYPAL_CLIENT_ID=...
//! export PAYPAL_CLIENT_SECRET=...
//! export PAYPAL_WEBHOOK_ID=...
//!
//! # Run the server (LOG_FORMAT=json for structured logs)
//! pay-gateway
//! ```

use chrono::Utc;
use pay_api::{routes, state::AppState};
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with((!json_logs).then(|| fmt::layer()))
        .with(json_logs.then(|| fmt::layer().json()))
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // Print banner
    print_banner();

    // Initialize application state
    let state = AppState::new()?;

    let addr = state.config.socket_addr()?;
    let is_prod = state.config.is_production();

    info!("Environment: {}", state.config.environment);
    for provider in state.engine.provider_statuses() {
        info!(
            "Payment provider: {} (configured: {}, webhook: {})",
            provider.name, provider.configured, provider.webhook_path
        );
    }

    spawn_event_purge(
        Arc::clone(&state.engine),
        state.config.gateway.purge_interval(),
    );

    // Create router
    let app = routes::create_router(state);

    // Start server
    info!("Payment gateway starting on http://{}", addr);

    if !is_prod {
        info!("Health: http://{}/health", addr);
        info!("Payments: POST http://{}/api/v1/{{provider}}/payments", addr);
        info!("Webhooks: POST http://{}/webhooks/{{provider}}", addr);
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Payment gateway stopped");
    Ok(())
}

/// Periodically drop processed webhook ids older than the retention window
fn spawn_event_purge(
    engine: Arc<pay_core::ReconciliationEngine>,
    every: std::time::Duration,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            match engine.purge_processed_events(Utc::now()) {
                Ok(0) => {}
                Ok(purged) => info!("Purged {} processed webhook events", purged),
                Err(e) => error!("Failed to purge processed events: {}", e),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn print_banner() {
    println!(
        r#"
  pay-gateway
  ━━━━━━━━━━━━━━━━━━━━━━━
  Stripe + PayPal reconciliation
  Version: {}

"#,
        env!("CARGO_PKG_VERSION")
    );
}
