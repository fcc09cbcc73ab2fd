//! # pay-api
//!
//! HTTP API layer for the payment gateway.
//!
//! This crate provides:
//! - Axum-based HTTP server
//! - REST endpoints for payments, subscriptions and customers, per provider
//! - Webhook intake that verifies and reconciles provider events
//!
//! ## Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/health` | Health check and provider status |
//! | GET | `/api/v1/statistics` | Ledger statistics |
//! | POST | `/api/v1/{provider}/payments` | Create payment |
//! | GET | `/api/v1/{provider}/payments/{id}` | Sync payment from provider |
//! | POST | `/api/v1/{provider}/payments/{id}/capture` | Capture payment |
//! | POST | `/api/v1/{provider}/payments/{id}/refund` | Refund payment |
//! | POST | `/api/v1/{provider}/subscriptions` | Create subscription |
//! | POST | `/api/v1/{provider}/subscriptions/{id}/cancel` | Cancel subscription |
//! | POST | `/api/v1/{provider}/customers` | Create customer |
//! | POST | `/webhooks/{provider}` | Provider webhook |
//!
//! `{provider}` is `stripe` or `paypal`.

pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::{AppConfig, AppState};
