//! # PayPal Configuration
//!
//! Client credentials, webhook id and environment selection, loaded from
//! environment variables. The client secret is never logged.

use pay_core::{PaymentError, PaymentResult};
use secrecy::SecretString;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const SANDBOX_API_BASE_URL: &str = "https://api-m.sandbox.paypal.com";
pub const LIVE_API_BASE_URL: &str = "https://api-m.paypal.com";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Tokens this close to expiry are refreshed before use
pub const DEFAULT_TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Which PayPal environment to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayPalMode {
    #[default]
    Sandbox,
    Live,
}

impl PayPalMode {
    pub fn api_base_url(self) -> &'static str {
        match self {
            PayPalMode::Sandbox => SANDBOX_API_BASE_URL,
            PayPalMode::Live => LIVE_API_BASE_URL,
        }
    }
}

impl FromStr for PayPalMode {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sandbox" => Ok(PayPalMode::Sandbox),
            "live" | "production" => Ok(PayPalMode::Live),
            other => Err(PaymentError::Configuration(format!(
                "PAYPAL_MODE must be sandbox or live, got {other:?}"
            ))),
        }
    }
}

/// PayPal API configuration
#[derive(Debug)]
pub struct PayPalConfig {
    /// REST app client id
    pub client_id: Option<String>,

    /// REST app secret
    pub client_secret: Option<SecretString>,

    /// Id of the webhook registered for this app, required for verification
    pub webhook_id: Option<String>,

    pub mode: PayPalMode,

    /// API base URL; defaults to the one for `mode`
    pub api_base_url: String,

    pub request_timeout: Duration,

    pub token_refresh_margin: Duration,
}

impl PayPalConfig {
    /// Load configuration from environment variables.
    ///
    /// Env vars:
    /// - `PAYPAL_CLIENT_ID` / `PAYPAL_CLIENT_SECRET` (optional, but only together)
    /// - `PAYPAL_WEBHOOK_ID` (optional; required to accept webhooks)
    /// - `PAYPAL_MODE` (`sandbox` (default) or `live`)
    /// - `PAYPAL_API_BASE_URL` (optional override)
    pub fn from_env() -> PaymentResult<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let client_id = non_empty_var("PAYPAL_CLIENT_ID");
        let client_secret = non_empty_var("PAYPAL_CLIENT_SECRET");

        if client_id.is_some() != client_secret.is_some() {
            return Err(PaymentError::Configuration(
                "PAYPAL_CLIENT_ID and PAYPAL_CLIENT_SECRET must be set together".to_string(),
            ));
        }

        let mode = match non_empty_var("PAYPAL_MODE") {
            Some(raw) => raw.parse()?,
            None => PayPalMode::default(),
        };

        let mut config = Self::unconfigured(mode);
        config.client_id = client_id;
        config.client_secret = client_secret.map(SecretString::from);
        config.webhook_id = non_empty_var("PAYPAL_WEBHOOK_ID");
        if let Some(url) = non_empty_var("PAYPAL_API_BASE_URL") {
            config.api_base_url = url;
        }
        Ok(config)
    }

    /// Create sandbox config with explicit credentials (for testing)
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        let mut config = Self::unconfigured(PayPalMode::Sandbox);
        config.client_id = Some(client_id.into());
        config.client_secret = Some(SecretString::from(client_secret.into()));
        config
    }

    /// Config without credentials; the provider will report itself unconfigured
    pub fn unconfigured(mode: PayPalMode) -> Self {
        Self {
            client_id: None,
            client_secret: None,
            webhook_id: None,
            mode,
            api_base_url: mode.api_base_url().to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            token_refresh_margin: DEFAULT_TOKEN_REFRESH_MARGIN,
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some()
    }

    pub fn is_live(&self) -> bool {
        self.mode == PayPalMode::Live
    }

    /// Builder: set webhook id
    pub fn with_webhook_id(mut self, webhook_id: impl Into<String>) -> Self {
        self.webhook_id = Some(webhook_id.into());
        self
    }

    /// Builder: set custom API base URL (for testing)
    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    /// Builder: override the request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}
