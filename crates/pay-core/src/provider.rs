//! # Payment Provider Trait
//!
//! One contract over every payment processor. Each processor implements
//! `PaymentProvider`; the engine holds them in a `ProviderRegistry` keyed by
//! the closed `ProviderName` enum.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  PaymentProvider (trait)                    │
//! │  ├── create_payment() / capture_payment() / refund_payment()│
//! │  ├── get_payment()                                          │
//! │  ├── create_subscription() / cancel_subscription()          │
//! │  ├── create_customer()                                      │
//! │  ├── verify_webhook() / parse_resource() / event_table()    │
//! │  └── name() / is_configured()                               │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!                ┌───────────┴───────────┐
//!        ┌───────┴───────┐       ┌───────┴───────┐
//!        │StripeProvider │       │PayPalProvider │
//!        └───────────────┘       └───────────────┘
//! ```
//!
//! Providers are stateless with respect to the ledger: they return
//! normalized results and never write records themselves.

use crate::error::{PaymentError, PaymentResult};
use crate::money::Currency;
use crate::payment::{CaptureResult, PaymentSnapshot, RefundResult};
use crate::subscription::SubscriptionSnapshot;
use crate::webhook::{EventTableEntry, ResourceKind, ResourceSnapshot, WebhookEvent, WebhookHeaders};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

/// Supported payment processors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    /// Card/ACH processor
    Stripe,
    /// Wallet/redirect processor
    PayPal,
}

impl ProviderName {
    pub const ALL: [ProviderName; 2] = [ProviderName::Stripe, ProviderName::PayPal];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Stripe => "stripe",
            ProviderName::PayPal => "paypal",
        }
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stripe" => Ok(ProviderName::Stripe),
            "paypal" => Ok(ProviderName::PayPal),
            other => Err(PaymentError::InvalidRequest(format!(
                "unknown payment provider: {other}"
            ))),
        }
    }
}

/// Request to create a one-off payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePaymentRequest {
    /// Amount in major units (`49.99`)
    pub amount: Decimal,
    pub currency: Currency,
    /// Provider-scoped customer reference
    #[serde(default)]
    pub customer: Option<String>,
    /// Capture immediately instead of authorizing only
    #[serde(default = "default_capture")]
    pub capture: bool,
    #[serde(default)]
    pub description: Option<String>,
    /// Echoed back by the provider for correlation
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Where redirect-style providers send the payer after approval
    #[serde(default)]
    pub return_url: Option<String>,
    #[serde(default)]
    pub cancel_url: Option<String>,
    /// Forwarded to the provider so client-side retries are safe
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn default_capture() -> bool {
    true
}

impl CreatePaymentRequest {
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Self {
            amount,
            currency,
            customer: None,
            capture: true,
            description: None,
            metadata: HashMap::new(),
            return_url: None,
            cancel_url: None,
            idempotency_key: None,
        }
    }

    /// Authorize only; capture later
    pub fn authorize_only(mut self) -> Self {
        self.capture = false;
        self
    }

    pub fn with_customer(mut self, customer: impl Into<String>) -> Self {
        self.customer = Some(customer.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Reject amounts no provider would accept
    pub fn validate(&self) -> PaymentResult<()> {
        if self.amount <= Decimal::ZERO {
            return Err(PaymentError::InvalidRequest(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }
        Ok(())
    }
}

/// Request to refund a captured payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub provider_payment_id: String,
    /// Partial amount in major units; `None` refunds whatever remains
    pub amount: Option<Decimal>,
    /// Currency of the original payment
    pub currency: Currency,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Request to start a subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub customer: String,
    pub plan_id: String,
    #[serde(default)]
    pub trial_period_days: Option<u32>,
    #[serde(default)]
    pub trial_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub billing_cycle_anchor: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub return_url: Option<String>,
    #[serde(default)]
    pub cancel_url: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl CreateSubscriptionRequest {
    pub fn new(customer: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            customer: customer.into(),
            plan_id: plan_id.into(),
            trial_period_days: None,
            trial_end: None,
            billing_cycle_anchor: None,
            metadata: HashMap::new(),
            return_url: None,
            cancel_url: None,
            idempotency_key: None,
        }
    }
}

/// Request to register a customer with a provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateCustomerRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A provider-side customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub provider: ProviderName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Core trait for payment processor clients.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Which processor this is (for routing and logging)
    fn name(&self) -> ProviderName;

    /// True when credentials are present. Never performs I/O.
    fn is_configured(&self) -> bool;

    /// Create a payment and return the provider's view of it
    async fn create_payment(&self, request: &CreatePaymentRequest)
        -> PaymentResult<PaymentSnapshot>;

    /// Capture an authorized or approved payment
    async fn capture_payment(&self, provider_payment_id: &str) -> PaymentResult<CaptureResult>;

    /// Refund all or part of a captured payment
    async fn refund_payment(&self, request: &RefundRequest) -> PaymentResult<RefundResult>;

    /// Fetch the current state of a payment
    async fn get_payment(&self, provider_payment_id: &str) -> PaymentResult<PaymentSnapshot>;

    /// Start a subscription
    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> PaymentResult<SubscriptionSnapshot>;

    /// Cancel a subscription immediately
    async fn cancel_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> PaymentResult<SubscriptionSnapshot>;

    /// Register a customer
    async fn create_customer(&self, request: &CreateCustomerRequest) -> PaymentResult<Customer>;

    /// Establish that a webhook body came from the provider and parse its envelope.
    ///
    /// `payload` must be the raw request bytes exactly as received.
    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &WebhookHeaders,
    ) -> PaymentResult<WebhookEvent>;

    /// Normalize a verified event's resource object
    fn parse_resource(
        &self,
        kind: ResourceKind,
        resource: &serde_json::Value,
    ) -> PaymentResult<ResourceSnapshot>;

    /// Event types this provider emits that the engine acts on
    fn event_table(&self) -> &'static [EventTableEntry];

    /// Path of the inbound webhook route for this provider
    fn webhook_path(&self) -> String {
        format!("/webhooks/{}", self.name())
    }
}

/// Type alias for a shared provider (dynamic dispatch)
pub type BoxedPaymentProvider = Arc<dyn PaymentProvider>;

/// Providers available to the engine, built once at startup
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderName, BoxedPaymentProvider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any earlier one with the same name
    pub fn register(&mut self, provider: BoxedPaymentProvider) {
        self.providers.insert(provider.name(), provider);
    }

    /// Register with builder pattern
    pub fn with_provider(mut self, provider: BoxedPaymentProvider) -> Self {
        self.register(provider);
        self
    }

    /// Get a provider that is registered and configured.
    ///
    /// Fails fast with `Configuration` so no network call is attempted.
    pub fn get(&self, name: ProviderName) -> PaymentResult<&BoxedPaymentProvider> {
        let provider = self.providers.get(&name).ok_or_else(|| {
            PaymentError::Configuration(format!("provider {name} is not registered"))
        })?;
        if !provider.is_configured() {
            return Err(PaymentError::Configuration(format!(
                "provider {name} is not configured"
            )));
        }
        Ok(provider)
    }

    /// All registered providers, configured or not
    pub fn iter(&self) -> impl Iterator<Item = &BoxedPaymentProvider> {
        self.providers.values()
    }

    /// Names of registered providers, sorted
    pub fn providers(&self) -> Vec<ProviderName> {
        let mut names: Vec<_> = self.providers.keys().copied().collect();
        names.sort();
        names
    }

    /// Check if a provider is registered
    pub fn has_provider(&self, name: ProviderName) -> bool {
        self.providers.contains_key(&name)
    }
}
