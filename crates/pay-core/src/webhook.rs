//! # Webhook Types
//!
//! Verified event envelopes, the closed set of effects the engine applies, and
//! the per-provider tables that map raw event types onto those effects.

use crate::error::{PaymentError, PaymentResult};
use crate::money::Currency;
use crate::payment::{PaymentSnapshot, RefundStatus};
use crate::provider::ProviderName;
use crate::subscription::SubscriptionSnapshot;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Inbound webhook headers, names normalized to lower case
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookHeaders {
    headers: BTreeMap<String, String>,
}

impl WebhookHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn with(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Case-insensitive lookup
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Lookup that fails with `SignatureInvalid` when the header is absent
    pub fn require(&self, name: &str) -> PaymentResult<&str> {
        self.get(name)
            .ok_or_else(|| PaymentError::SignatureInvalid(format!("missing {name} header")))
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for WebhookHeaders {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = WebhookHeaders::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// A verified webhook envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Provider-issued event id, the idempotency key
    pub event_id: String,
    /// Raw provider event type (`payment_intent.succeeded`)
    pub event_type: String,
    pub provider: ProviderName,
    /// Resource object the event describes, as sent
    pub resource: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

/// Canonical effects a webhook may have on the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEffect {
    PaymentSucceeded,
    PaymentFailed,
    PaymentCanceled,
    PaymentRequiresAction,
    PaymentAuthorized,
    PaymentRefunded,
    SubscriptionActivated,
    SubscriptionUpdated,
    SubscriptionPeriodRenewed,
    SubscriptionPastDue,
    SubscriptionPaused,
    SubscriptionResumed,
    SubscriptionCanceled,
    SubscriptionExpired,
}

impl WebhookEffect {
    /// Which normalized resource this effect needs
    pub fn resource_kind(self) -> ResourceKind {
        match self {
            WebhookEffect::PaymentSucceeded
            | WebhookEffect::PaymentFailed
            | WebhookEffect::PaymentCanceled
            | WebhookEffect::PaymentRequiresAction
            | WebhookEffect::PaymentAuthorized => ResourceKind::Payment,
            WebhookEffect::PaymentRefunded => ResourceKind::Refund,
            WebhookEffect::SubscriptionActivated
            | WebhookEffect::SubscriptionUpdated
            | WebhookEffect::SubscriptionPeriodRenewed
            | WebhookEffect::SubscriptionPastDue
            | WebhookEffect::SubscriptionPaused
            | WebhookEffect::SubscriptionResumed
            | WebhookEffect::SubscriptionCanceled
            | WebhookEffect::SubscriptionExpired => ResourceKind::Subscription,
        }
    }
}

/// Shape of the resource an effect operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Payment,
    Refund,
    Subscription,
}

/// A refund reported by a webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundSnapshot {
    pub provider_payment_id: String,
    /// Provider refund id, used to avoid counting the same refund twice
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund_id: Option<String>,
    pub status: RefundStatus,
    /// Amount of this refund
    pub amount: Decimal,
    pub currency: Currency,
    /// Cumulative refunded total on the payment, when the provider reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_refunded: Option<Decimal>,
}

/// Normalized resource carried by a webhook
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSnapshot {
    Payment(PaymentSnapshot),
    Refund(RefundSnapshot),
    Subscription(SubscriptionSnapshot),
}

impl ResourceSnapshot {
    /// Provider id of the ledger row this resource belongs to
    pub fn external_id(&self) -> &str {
        match self {
            ResourceSnapshot::Payment(p) => &p.provider_payment_id,
            ResourceSnapshot::Refund(r) => &r.provider_payment_id,
            ResourceSnapshot::Subscription(s) => &s.provider_subscription_id,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSnapshot::Payment(_) => ResourceKind::Payment,
            ResourceSnapshot::Refund(_) => ResourceKind::Refund,
            ResourceSnapshot::Subscription(_) => ResourceKind::Subscription,
        }
    }
}

/// One row of a provider's event table
pub type EventTableEntry = (&'static str, WebhookEffect);

/// Validated mapping from raw event type to effect for one provider.
///
/// Event types missing from the table are the only legal unmapped case;
/// the engine acknowledges and ignores them.
#[derive(Debug, Clone)]
pub struct EventTable {
    provider: ProviderName,
    effects: HashMap<&'static str, WebhookEffect>,
}

impl EventTable {
    /// Build and validate a table. Blank or duplicate event types are rejected.
    pub fn from_entries(provider: ProviderName, entries: &[EventTableEntry]) -> PaymentResult<Self> {
        if entries.is_empty() {
            return Err(PaymentError::Configuration(format!(
                "{provider} has an empty webhook event table"
            )));
        }

        let mut effects = HashMap::with_capacity(entries.len());
        for (event_type, effect) in entries {
            if event_type.trim().is_empty() || event_type.trim() != *event_type {
                return Err(PaymentError::Configuration(format!(
                    "{provider} event table has a malformed event type {event_type:?}"
                )));
            }
            if effects.insert(*event_type, *effect).is_some() {
                return Err(PaymentError::Configuration(format!(
                    "{provider} event table maps {event_type} more than once"
                )));
            }
        }

        Ok(Self { provider, effects })
    }

    pub fn provider(&self) -> ProviderName {
        self.provider
    }

    pub fn lookup(&self, event_type: &str) -> Option<WebhookEffect> {
        self.effects.get(event_type).copied()
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Event types to enable in the provider's dashboard, sorted
    pub fn event_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.effects.keys().copied().collect();
        types.sort_unstable();
        types
    }
}

/// What happened to an inbound webhook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// The effect was applied to the ledger
    Applied,
    /// This event id was processed before; nothing changed
    Duplicate,
    /// Event type is not in the provider's table
    Ignored,
    /// The transition is not allowed from the stored state (out-of-order delivery)
    Stale,
    /// No ledger row for the referenced resource; logged, not inserted
    Orphaned,
}

/// Result of webhook ingestion, returned to the HTTP layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookReceipt {
    pub provider: ProviderName,
    pub event_id: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<WebhookEffect>,
    pub outcome: WebhookOutcome,
}
