//! # Payment Error Types
//!
//! Typed error handling for the payment gateway.
//! Every provider call, ledger mutation and webhook ingestion returns
//! `Result<T, PaymentError>`. Provider errors travel through the engine to the
//! caller untouched.

use crate::provider::ProviderName;
use thiserror::Error;

/// Core error type for all gateway operations
#[derive(Debug, Error)]
pub enum PaymentError {
    /// Provider not registered or missing credentials. Raised before any network call.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid request data (bad amount, bad currency code, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The provider rejected the request (4xx validation or 5xx failure)
    #[error("Provider error [{provider}]: {message}")]
    Provider {
        provider: ProviderName,
        /// Provider-specific error code, when one was returned
        code: Option<String>,
        message: String,
        /// HTTP status returned by the provider, if any
        status: Option<u16>,
    },

    /// Network failure or timeout talking to the provider
    #[error("Transport error [{provider}]: {message}")]
    Transport {
        provider: ProviderName,
        message: String,
        timeout: bool,
    },

    /// Webhook authenticity could not be established
    #[error("Webhook signature invalid: {0}")]
    SignatureInvalid(String),

    /// Webhook was authentic but its payload could not be understood
    #[error("Webhook payload malformed: {0}")]
    PayloadMalformed(String),

    /// The provider reported a status we have no canonical mapping for
    #[error("Unknown status from {provider}: {status}")]
    UnknownStatus {
        provider: ProviderName,
        status: String,
    },

    /// A ledger mutation would violate an invariant; the stored state is unchanged
    #[error("Ledger conflict: {0}")]
    LedgerConflict(String),

    /// Ledger row not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The provider has no equivalent of this operation
    #[error("{operation} is not supported by {provider}")]
    Unsupported {
        provider: ProviderName,
        operation: &'static str,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PaymentError {
    /// Build a provider error without code or status
    pub fn provider(provider: ProviderName, message: impl Into<String>) -> Self {
        PaymentError::Provider {
            provider,
            code: None,
            message: message.into(),
            status: None,
        }
    }

    /// Build a transport error
    pub fn transport(provider: ProviderName, message: impl Into<String>, timeout: bool) -> Self {
        PaymentError::Transport {
            provider,
            message: message.into(),
            timeout,
        }
    }

    /// Returns true if this error is transient and the caller may retry
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::Transport { .. } => true,
            PaymentError::Provider { status, .. } => {
                matches!(status, Some(s) if *s >= 500 || *s == 429)
            }
            _ => false,
        }
    }

    /// Returns the HTTP status code appropriate for this error
    pub fn status_code(&self) -> u16 {
        match self {
            PaymentError::Configuration(_) => 503,
            PaymentError::InvalidRequest(_) => 400,
            PaymentError::Provider { status, .. } => match status {
                Some(s) if (400..500).contains(s) && *s != 429 => 422,
                _ => 502,
            },
            PaymentError::Transport { timeout: true, .. } => 504,
            PaymentError::Transport { .. } => 503,
            PaymentError::SignatureInvalid(_) => 401,
            PaymentError::PayloadMalformed(_) => 400,
            PaymentError::UnknownStatus { .. } => 502,
            PaymentError::LedgerConflict(_) => 409,
            PaymentError::NotFound(_) => 404,
            PaymentError::Unsupported { .. } => 501,
            PaymentError::Serialization(_) => 500,
        }
    }
}

impl From<serde_json::Error> for PaymentError {
    fn from(err: serde_json::Error) -> Self {
        PaymentError::Serialization(err.to_string())
    }
}

/// Result type alias for payment operations
pub type PaymentResult<T> = Result<T, PaymentError>;
