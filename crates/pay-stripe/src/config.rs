//! # Stripe Configuration
//!
//! Configuration management for the Stripe provider.
//! Secrets are loaded from environment variables and never logged.

use pay_core::{PaymentError, PaymentResult};
use secrecy::{ExposeSecret, SecretString};
use std::env;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://api.stripe.com";
pub const DEFAULT_API_VERSION: &str = "2024-12-18.acacia";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum age of a webhook signature timestamp, in seconds
pub const DEFAULT_SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Nested objects fetched together with a new subscription
pub const DEFAULT_SUBSCRIPTION_EXPAND: &[&str] = &["latest_invoice.payment_intent"];

/// Stripe API configuration
#[derive(Debug)]
pub struct StripeConfig {
    /// Secret API key (sk_test_... or sk_live_...)
    pub secret_key: Option<SecretString>,

    /// Webhook signing secret (whsec_...)
    pub webhook_secret: Option<SecretString>,

    /// API base URL (for testing/mocking)
    pub api_base_url: String,

    /// API version sent as `Stripe-Version`
    pub api_version: String,

    /// Timeout for ordinary API calls
    pub request_timeout: Duration,

    /// Timeout for subscription creation, which expands nested objects
    pub subscription_timeout: Duration,

    /// `expand[]` paths requested when creating a subscription
    pub subscription_expand: Vec<String>,

    /// Allowed clock skew for webhook signatures
    pub signature_tolerance_secs: i64,
}

impl StripeConfig {
    /// Load configuration from environment variables.
    ///
    /// Env vars:
    /// - `STRIPE_SECRET_KEY` (optional; without it the provider is unconfigured)
    /// - `STRIPE_WEBHOOK_SECRET` (optional; required to accept webhooks)
    /// - `STRIPE_API_BASE_URL` (optional override)
    ///
    /// Keys that are present but malformed are rejected.
    pub fn from_env() -> PaymentResult<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let secret_key = non_empty_var("STRIPE_SECRET_KEY");
        let webhook_secret = non_empty_var("STRIPE_WEBHOOK_SECRET");

        if let Some(ref key) = secret_key {
            if !key.starts_with("sk_test_") && !key.starts_with("sk_live_") {
                return Err(PaymentError::Configuration(
                    "STRIPE_SECRET_KEY must start with sk_test_ or sk_live_".to_string(),
                ));
            }
        }

        if let Some(ref secret) = webhook_secret {
            if !secret.starts_with("whsec_") {
                return Err(PaymentError::Configuration(
                    "STRIPE_WEBHOOK_SECRET must start with whsec_".to_string(),
                ));
            }
        }

        let mut config = Self::unconfigured();
        config.secret_key = secret_key.map(SecretString::from);
        config.webhook_secret = webhook_secret.map(SecretString::from);
        if let Some(url) = non_empty_var("STRIPE_API_BASE_URL") {
            config.api_base_url = url;
        }
        Ok(config)
    }

    /// Create config with explicit values (for testing)
    pub fn new(secret_key: impl Into<String>, webhook_secret: impl Into<String>) -> Self {
        let mut config = Self::unconfigured();
        config.secret_key = Some(SecretString::from(secret_key.into()));
        config.webhook_secret = Some(SecretString::from(webhook_secret.into()));
        config
    }

    /// Config without credentials; the provider will report itself unconfigured
    pub fn unconfigured() -> Self {
        Self {
            secret_key: None,
            webhook_secret: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            subscription_timeout: DEFAULT_SUBSCRIPTION_TIMEOUT,
            subscription_expand: DEFAULT_SUBSCRIPTION_EXPAND
                .iter()
                .map(|s| s.to_string())
                .collect(),
            signature_tolerance_secs: DEFAULT_SIGNATURE_TOLERANCE_SECS,
        }
    }

    /// True when an API key is present
    pub fn has_credentials(&self) -> bool {
        self.secret_key.is_some()
    }

    /// Check if using test keys
    pub fn is_test_mode(&self) -> bool {
        self.secret_key
            .as_ref()
            .is_some_and(|k| k.expose_secret().starts_with("sk_test_"))
    }

    /// Check if using live keys
    pub fn is_live_mode(&self) -> bool {
        self.secret_key
            .as_ref()
            .is_some_and(|k| k.expose_secret().starts_with("sk_live_"))
    }

    /// Get authorization header value
    pub fn auth_header(&self) -> PaymentResult<String> {
        let key = self.secret_key.as_ref().ok_or_else(|| {
            PaymentError::Configuration("STRIPE_SECRET_KEY not set".to_string())
        })?;
        Ok(format!("Bearer {}", key.expose_secret()))
    }

    /// Builder: set custom API base URL (for testing)
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    /// Builder: override request timeouts
    pub fn with_timeouts(mut self, request: Duration, subscription: Duration) -> Self {
        self.request_timeout = request;
        self.subscription_timeout = subscription;
        self
    }

    /// Builder: replace the subscription expand list
    pub fn with_subscription_expand<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscription_expand = paths.into_iter().map(Into::into).collect();
        self
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}
