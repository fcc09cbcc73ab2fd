//! OAuth2 access token cache.
//!
//! Readers share a `RwLock`; a refresh is serialized by a separate async
//! mutex and re-checks the cache once it holds the lock, so a burst of
//! callers that all find the token stale trigger a single fetch.

use chrono::{DateTime, Utc};
use pay_core::PaymentResult;
use secrecy::{ExposeSecret, SecretString};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

struct CachedToken {
    value: SecretString,
    expires_at: DateTime<Utc>,
}

/// A token as returned by the token endpoint
pub(crate) struct FetchedToken {
    pub value: String,
    pub expires_in_secs: i64,
}

pub(crate) struct TokenCache {
    current: RwLock<Option<CachedToken>>,
    refresh: Mutex<()>,
    margin: chrono::Duration,
}

impl TokenCache {
    pub fn new(margin: Duration) -> Self {
        Self {
            current: RwLock::new(None),
            refresh: Mutex::new(()),
            margin: chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::seconds(60)),
        }
    }

    async fn fresh(&self) -> Option<String> {
        let current = self.current.read().await;
        current
            .as_ref()
            .filter(|t| t.expires_at - self.margin > Utc::now())
            .map(|t| t.value.expose_secret().to_string())
    }

    /// Return a token that is not within the margin of expiry, fetching one if needed
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> PaymentResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PaymentResult<FetchedToken>>,
    {
        if let Some(token) = self.fresh().await {
            return Ok(token);
        }

        let _refreshing = self.refresh.lock().await;
        if let Some(token) = self.fresh().await {
            return Ok(token);
        }

        let fetched = fetch().await?;
        debug!(expires_in = fetched.expires_in_secs, "Fetched PayPal access token");

        let expires_at = Utc::now() + chrono::Duration::seconds(fetched.expires_in_secs);
        *self.current.write().await = Some(CachedToken {
            value: SecretString::from(fetched.value.clone()),
            expires_at,
        });
        Ok(fetched.value)
    }

    /// Forget the cached token (after the API rejected it)
    pub async fn invalidate(&self) {
        *self.current.write().await = None;
    }
}
