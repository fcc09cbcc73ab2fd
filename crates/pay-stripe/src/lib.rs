//! # pay-stripe
//!
//! Card/ACH payments through Stripe.
//!
//! `StripeProvider` implements `pay_core::PaymentProvider` on top of the
//! PaymentIntents, Refunds, Subscriptions and Customers APIs, and verifies
//! `Stripe-Signature` headers on inbound webhooks.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pay_core::{CreatePaymentRequest, Currency, PaymentProvider};
//! use pay_stripe::StripeProvider;
//! use rust_decimal::Decimal;
//!
//! let stripe = StripeProvider::from_env()?;
//!
//! let request = CreatePaymentRequest::new(Decimal::new(4999, 2), Currency::new("USD")?)
//!     .authorize_only();
//! let payment = stripe.create_payment(&request).await?;
//! let captured = stripe.capture_payment(&payment.provider_payment_id).await?;
//! ```
//!
//! ## Webhooks
//!
//! Register the event types in [`STRIPE_EVENTS`] on the dashboard endpoint and
//! route the raw body plus headers to `ReconciliationEngine::handle_webhook`.
//! The body must not be re-serialized before verification.

pub mod client;
pub mod config;
mod types;
pub mod webhook;

// Re-exports
pub use client::StripeProvider;
pub use config::StripeConfig;
pub use webhook::STRIPE_EVENTS;
