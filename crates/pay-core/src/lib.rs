//! # pay-core
//!
//! Core types and traits for the payment gateway.
//!
//! This crate provides:
//! - `PaymentProvider` trait and `ProviderRegistry` for payment processors
//! - `money` codec between decimal amounts and provider wire formats
//! - `PaymentRecord` / `SubscriptionRecord` and their status machines
//! - `Ledger` trait with an in-memory implementation
//! - `ReconciliationEngine` applying provider results and webhooks to the ledger
//! - `PaymentError` for typed error handling
//!
//! ## Example
//!
//! ```rust,ignore
//! use pay_core::{
//!     CreatePaymentRequest, Currency, InMemoryLedger, ProviderName, ProviderRegistry,
//!     ReconciliationEngine,
//! };
//! use rust_decimal::Decimal;
//! use std::sync::Arc;
//!
//! let registry = ProviderRegistry::new().with_provider(Arc::new(stripe));
//! let engine = ReconciliationEngine::new(registry, Arc::new(InMemoryLedger::new()))?;
//!
//! let request = CreatePaymentRequest::new(Decimal::new(4999, 2), Currency::new("USD")?);
//! let payment = engine.create_payment(ProviderName::Stripe, &request).await?;
//!
//! // later, from the webhook route
//! let receipt = engine.handle_webhook(ProviderName::Stripe, &body, &headers).await?;
//! ```

pub mod engine;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod money;
pub mod payment;
pub mod provider;
pub mod subscription;
pub mod webhook;

// Re-exports for convenience
pub use engine::{
    EngineConfig, GatewayStatistics, ProviderStatus, ReconciliationEngine, RefundOutcome,
    RefundPaymentRequest, DEFAULT_EVENT_RETENTION_DAYS,
};
pub use error::{PaymentError, PaymentResult};
pub use ledger::{InMemoryLedger, Ledger, LedgerKey, ProcessedEvent};
pub use money::Currency;
pub use payment::{
    CaptureResult, PaymentRecord, PaymentSnapshot, PaymentStatus, RefundResult, RefundStatus,
};
pub use provider::{
    BoxedPaymentProvider, CreateCustomerRequest, CreatePaymentRequest,
    CreateSubscriptionRequest, Customer, PaymentProvider, ProviderName, ProviderRegistry,
    RefundRequest,
};
pub use subscription::{
    BillingInterval, SubscriptionRecord, SubscriptionSnapshot, SubscriptionStatus,
};
pub use webhook::{
    EventTable, EventTableEntry, RefundSnapshot, ResourceKind, ResourceSnapshot, WebhookEffect,
    WebhookEvent, WebhookHeaders, WebhookOutcome, WebhookReceipt,
};
