//! # pay-paypal
//!
//! Wallet/redirect payments through PayPal.
//!
//! `PayPalProvider` implements `pay_core::PaymentProvider`:
//! - payments are Orders the payer approves at the returned approval link
//! - refunds resolve the order's capture before calling the Payments API
//! - subscriptions use Billing plans, whose price and cadence are looked up
//! - webhooks are verified remotely by PayPal
//!
//! PayPal has no customer API; `create_customer` returns `Unsupported`.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pay_core::{CreatePaymentRequest, Currency, PaymentProvider};
//! use pay_paypal::PayPalProvider;
//! use rust_decimal::Decimal;
//!
//! let paypal = PayPalProvider::from_env()?;
//!
//! let mut request = CreatePaymentRequest::new(Decimal::new(2500, 2), Currency::new("EUR")?);
//! request.return_url = Some("https://shop.example/paypal/return".into());
//! let order = paypal.create_payment(&request).await?;
//! // send the payer to order.approval_url, then capture
//! ```

pub mod client;
pub mod config;
mod token;
mod types;
pub mod webhook;

// Re-exports
pub use client::{PayPalProvider, CAPTURE_NOT_FOUND};
pub use config::{PayPalConfig, PayPalMode};
pub use webhook::PAYPAL_EVENTS;
