//! # Routes
//!
//! Axum router configuration for the payment gateway.

use crate::handlers;
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Create the main application router
///
/// Routes:
/// - API:
///   - POST /api/v1/{provider}/payments - Create payment
///   - GET  /api/v1/{provider}/payments/{id} - Sync payment from provider
///   - POST /api/v1/{provider}/payments/{id}/capture - Capture payment
///   - POST /api/v1/{provider}/payments/{id}/refund - Refund payment
///   - POST /api/v1/{provider}/subscriptions - Create subscription
///   - POST /api/v1/{provider}/subscriptions/{id}/cancel - Cancel subscription
///   - POST /api/v1/{provider}/customers - Create customer
///   - GET  /api/v1/statistics - Ledger statistics
///
/// - Webhooks:
///   - POST /webhooks/{provider} - Provider webhook (raw body)
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/statistics", get(handlers::statistics))
        // Payments
        .route("/{provider}/payments", post(handlers::create_payment))
        .route(
            "/{provider}/payments/{payment_id}",
            get(handlers::get_payment),
        )
        .route(
            "/{provider}/payments/{payment_id}/capture",
            post(handlers::capture_payment),
        )
        .route(
            "/{provider}/payments/{payment_id}/refund",
            post(handlers::refund_payment),
        )
        // Subscriptions
        .route(
            "/{provider}/subscriptions",
            post(handlers::create_subscription),
        )
        .route(
            "/{provider}/subscriptions/{subscription_id}/cancel",
            post(handlers::cancel_subscription),
        )
        // Customers
        .route("/{provider}/customers", post(handlers::create_customer))
        .layer(cors);

    // Webhook routes (no CORS, must accept raw body)
    let webhook_routes = Router::new().route("/{provider}", post(handlers::webhook));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api_routes)
        .nest("/webhooks", webhook_routes)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
