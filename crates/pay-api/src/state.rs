//! # Application State
//!
//! Shared state for the Axum application: the reconciliation engine and the
//! server configuration. Providers and the ledger are wired here, once.

use pay_core::{EngineConfig, InMemoryLedger, ProviderRegistry, ReconciliationEngine};
use pay_paypal::{PayPalConfig, PayPalProvider};
use pay_stripe::{StripeConfig, StripeProvider};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Default interval between processed-event purges
pub const DEFAULT_PURGE_INTERVAL_SECS: u64 = 3600;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Environment (development, staging, production)
    pub environment: String,
    /// Tunables from `config/gateway.toml`
    pub gateway: GatewayFileConfig,
}

/// Contents of `config/gateway.toml`; every key is optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayFileConfig {
    pub engine: EngineConfig,
    pub purge_interval_secs: Option<u64>,
    pub stripe: StripeFileConfig,
    pub paypal: PayPalFileConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StripeFileConfig {
    pub request_timeout_secs: Option<u64>,
    pub subscription_timeout_secs: Option<u64>,
    pub subscription_expand: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PayPalFileConfig {
    pub request_timeout_secs: Option<u64>,
}

impl GatewayFileConfig {
    /// Intervals and timeouts must be non-zero
    pub fn validate(&self) -> anyhow::Result<()> {
        let durations = [
            ("purge_interval_secs", self.purge_interval_secs),
            ("stripe.request_timeout_secs", self.stripe.request_timeout_secs),
            ("stripe.subscription_timeout_secs", self.stripe.subscription_timeout_secs),
            ("paypal.request_timeout_secs", self.paypal.request_timeout_secs),
        ];
        for (key, value) in durations {
            if value == Some(0) {
                anyhow::bail!("{} must be greater than zero", key);
            }
        }
        Ok(())
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(
            self.purge_interval_secs
                .unwrap_or(DEFAULT_PURGE_INTERVAL_SECS),
        )
    }

    fn apply_to_stripe(&self, mut config: StripeConfig) -> StripeConfig {
        let request = self
            .stripe
            .request_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(config.request_timeout);
        let subscription = self
            .stripe
            .subscription_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(config.subscription_timeout);
        config = config.with_timeouts(request, subscription);
        if let Some(ref expand) = self.stripe.subscription_expand {
            config = config.with_subscription_expand(expand.iter().cloned());
        }
        config
    }

    fn apply_to_paypal(&self, config: PayPalConfig) -> PayPalConfig {
        match self.paypal.request_timeout_secs {
            Some(secs) => config.with_request_timeout(Duration::from_secs(secs)),
            None => config,
        }
    }
}

impl AppConfig {
    /// Load from environment variables and the optional gateway config file
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            environment: std::env::var("ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string()),
            gateway: load_gateway_config()?,
        })
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid socket address {}:{}: {}", self.host, self.port, e))
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconciliationEngine>,
    /// Application config
    pub config: AppConfig,
}

impl AppState {
    /// Build providers from the environment and wire them into a new engine
    pub fn new() -> anyhow::Result<Self> {
        let config = AppConfig::from_env()?;

        let stripe_config = StripeConfig::from_env()
            .map_err(|e| anyhow::anyhow!("Failed to configure Stripe: {}", e))?;
        let stripe_config = config.gateway.apply_to_stripe(stripe_config);

        let paypal_config = PayPalConfig::from_env()
            .map_err(|e| anyhow::anyhow!("Failed to configure PayPal: {}", e))?;
        let paypal_config = config.gateway.apply_to_paypal(paypal_config);

        if stripe_config.is_live_mode() && !config.is_production() {
            tracing::warn!("Stripe live keys in use outside production");
        }
        if paypal_config.is_live() && !config.is_production() {
            tracing::warn!("PayPal live mode in use outside production");
        }

        let registry = ProviderRegistry::new()
            .with_provider(Arc::new(
                StripeProvider::new(stripe_config)
                    .map_err(|e| anyhow::anyhow!("Failed to initialize Stripe: {}", e))?,
            ))
            .with_provider(Arc::new(
                PayPalProvider::new(paypal_config)
                    .map_err(|e| anyhow::anyhow!("Failed to initialize PayPal: {}", e))?,
            ));

        let engine = ReconciliationEngine::with_config(
            registry,
            Arc::new(InMemoryLedger::new()),
            config.gateway.engine.clone(),
        )
        .map_err(|e| anyhow::anyhow!("Failed to build reconciliation engine: {}", e))?;

        Ok(Self::with_engine(Arc::new(engine), config))
    }

    /// State around an already built engine
    pub fn with_engine(engine: Arc<ReconciliationEngine>, config: AppConfig) -> Self {
        Self { engine, config }
    }
}

/// Load gateway tunables from config/gateway.toml, if present
fn load_gateway_config() -> anyhow::Result<GatewayFileConfig> {
    let config_paths = [
        "config/gateway.toml",
        "../config/gateway.toml",
        "../../config/gateway.toml",
    ];

    for path in config_paths {
        if let Ok(content) = std::fs::read_to_string(path) {
            let config: GatewayFileConfig = toml::from_str(&content)
                .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path, e))?;
            config
                .validate()
                .map_err(|e| anyhow::anyhow!("Invalid {}: {}", path, e))?;
            tracing::info!("Loaded gateway config from {}", path);
            return Ok(config);
        }
    }

    tracing::warn!("No gateway config found, using defaults");
    Ok(GatewayFileConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_addr() {
        let config = AppConfig {
            host: "0.0.0.0".to_string(),
            port: 3000,
            environment: "test".to_string(),
            gateway: GatewayFileConfig::default(),
        };

        assert_eq!(config.socket_addr().unwrap().to_string(), "0.0.0.0:3000");
        assert!(!config.is_production());
    }

    #[test]
    fn test_bad_host_is_an_error() {
        let config = AppConfig {
            host: "not a host".to_string(),
            port: 3000,
            environment: "test".to_string(),
            gateway: GatewayFileConfig::default(),
        };
        assert!(config.socket_addr().is_err());
    }

    #[test]
    fn test_gateway_file_parsing() {
        let parsed: GatewayFileConfig = toml::from_str(
            r#"
            purge_interval_secs = 600

            [engine]
            event_retention_days = 7

            [stripe]
            request_timeout_secs = 10
            subscription_expand = ["latest_invoice.payment_intent", "pending_setup_intent"]

            [paypal]
            request_timeout_secs = 20
            "#,
        )
        .unwrap();

        assert_eq!(parsed.engine.event_retention_days, 7);
        assert_eq!(parsed.purge_interval(), Duration::from_secs(600));

        let stripe = parsed.apply_to_stripe(StripeConfig::unconfigured());
        assert_eq!(stripe.request_timeout, Duration::from_secs(10));
        assert_eq!(stripe.subscription_timeout, Duration::from_secs(60));
        assert_eq!(stripe.subscription_expand.len(), 2);

        let paypal = parsed.apply_to_paypal(PayPalConfig::new("id", "secret"));
        assert_eq!(paypal.request_timeout, Duration::from_secs(20));
    }

    #[test]
    fn test_zero_durations_are_rejected() {
        for body in [
            "purge_interval_secs = 0",
            "[stripe]\nrequest_timeout_secs = 0",
            "[stripe]\nsubscription_timeout_secs = 0",
            "[paypal]\nrequest_timeout_secs = 0",
        ] {
            let parsed: GatewayFileConfig = toml::from_str(body).unwrap();
            let err = parsed.validate().unwrap_err();
            assert!(err.to_string().contains("greater than zero"), "{body}");
        }

        let parsed: GatewayFileConfig = toml::from_str("purge_interval_secs = 1").unwrap();
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_empty_gateway_file_uses_defaults() {
        let parsed: GatewayFileConfig = toml::from_str("").unwrap();
        assert_eq!(parsed.engine.event_retention_days, pay_core::DEFAULT_EVENT_RETENTION_DAYS);
        assert_eq!(
            parsed.purge_interval(),
            Duration::from_secs(DEFAULT_PURGE_INTERVAL_SECS)
        );
    }
}
