//! # Ledger
//!
//! Local record of payments, subscriptions and processed webhook event ids.
//! Nothing here performs network I/O; every provider call happens in the
//! engine before the ledger is touched.

use crate::error::{PaymentError, PaymentResult};
use crate::payment::{PaymentRecord, PaymentStatus};
use crate::provider::ProviderName;
use crate::subscription::SubscriptionRecord;
use crate::webhook::WebhookOutcome;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// External key of a ledger row: the provider plus its id for the resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerKey {
    pub provider: ProviderName,
    pub external_id: String,
}

impl LedgerKey {
    pub fn new(provider: ProviderName, external_id: impl Into<String>) -> Self {
        Self {
            provider,
            external_id: external_id.into(),
        }
    }
}

impl std::fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider, self.external_id)
    }
}

/// A webhook event id that has been applied (or deliberately skipped)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub provider: ProviderName,
    pub event_id: String,
    pub event_type: String,
    pub outcome: WebhookOutcome,
    pub processed_at: DateTime<Utc>,
}

/// Storage contract for the reconciliation engine.
///
/// Implementations must make each method atomic with respect to the others.
pub trait Ledger: Send + Sync {
    /// Create the row, or merge into the existing row with the same external key
    fn upsert_payment(&self, record: PaymentRecord) -> PaymentResult<PaymentRecord>;

    /// Create the row, or merge into the existing row with the same external key
    fn upsert_subscription(&self, record: SubscriptionRecord)
        -> PaymentResult<SubscriptionRecord>;

    fn payment(&self, id: Uuid) -> PaymentResult<Option<PaymentRecord>>;

    fn subscription(&self, id: Uuid) -> PaymentResult<Option<SubscriptionRecord>>;

    fn find_payment(
        &self,
        provider: ProviderName,
        provider_payment_id: &str,
    ) -> PaymentResult<Option<PaymentRecord>>;

    fn find_subscription(
        &self,
        provider: ProviderName,
        provider_subscription_id: &str,
    ) -> PaymentResult<Option<SubscriptionRecord>>;

    /// Atomically add a refund to `refunded_amount`.
    ///
    /// Returns the row and whether anything changed. A `refund_id` already
    /// counted on the row makes this a no-op. Rejects with `LedgerConflict`
    /// when the payment is not refundable or the total would exceed `amount`.
    fn add_refund_delta(
        &self,
        provider: ProviderName,
        provider_payment_id: &str,
        amount: Decimal,
        refund_id: Option<&str>,
    ) -> PaymentResult<(PaymentRecord, bool)>;

    fn is_event_processed(&self, provider: ProviderName, event_id: &str) -> PaymentResult<bool>;

    /// Remember an event id. Returns false if it was already recorded.
    fn record_event(&self, event: ProcessedEvent) -> PaymentResult<bool>;

    /// Forget event ids processed before `cutoff`; returns how many were dropped
    fn purge_events_before(&self, cutoff: DateTime<Utc>) -> PaymentResult<usize>;

    fn payments(&self) -> PaymentResult<Vec<PaymentRecord>>;

    fn subscriptions(&self) -> PaymentResult<Vec<SubscriptionRecord>>;

    fn processed_event_count(&self) -> PaymentResult<usize>;
}

#[derive(Default)]
struct LedgerState {
    payments: HashMap<Uuid, PaymentRecord>,
    payment_keys: HashMap<LedgerKey, Uuid>,
    subscriptions: HashMap<Uuid, SubscriptionRecord>,
    subscription_keys: HashMap<LedgerKey, Uuid>,
    events: HashMap<(ProviderName, String), ProcessedEvent>,
}

/// Process-local ledger. Suitable for tests and single-instance deployments.
#[derive(Default)]
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> PaymentResult<RwLockReadGuard<'_, LedgerState>> {
        self.state
            .read()
            .map_err(|_| PaymentError::LedgerConflict("ledger lock poisoned".into()))
    }

    fn write(&self) -> PaymentResult<RwLockWriteGuard<'_, LedgerState>> {
        self.state
            .write()
            .map_err(|_| PaymentError::LedgerConflict("ledger lock poisoned".into()))
    }
}

impl Ledger for InMemoryLedger {
    fn upsert_payment(&self, record: PaymentRecord) -> PaymentResult<PaymentRecord> {
        record.validate()?;
        let key = LedgerKey::new(record.provider, record.provider_payment_id.clone());
        let mut state = self.write()?;

        if let Some(id) = state.payment_keys.get(&key).copied() {
            let existing = state
                .payments
                .get_mut(&id)
                .ok_or_else(|| PaymentError::LedgerConflict(format!("dangling key {key}")))?;
            existing.merge_from(&record)?;
            return Ok(existing.clone());
        }

        state.payment_keys.insert(key, record.id);
        state.payments.insert(record.id, record.clone());
        Ok(record)
    }

    fn upsert_subscription(
        &self,
        record: SubscriptionRecord,
    ) -> PaymentResult<SubscriptionRecord> {
        record.validate()?;
        let key = LedgerKey::new(record.provider, record.provider_subscription_id.clone());
        let mut state = self.write()?;

        if let Some(id) = state.subscription_keys.get(&key).copied() {
            let existing = state
                .subscriptions
                .get_mut(&id)
                .ok_or_else(|| PaymentError::LedgerConflict(format!("dangling key {key}")))?;
            existing.merge_from(&record)?;
            return Ok(existing.clone());
        }

        state.subscription_keys.insert(key, record.id);
        state.subscriptions.insert(record.id, record.clone());
        Ok(record)
    }

    fn payment(&self, id: Uuid) -> PaymentResult<Option<PaymentRecord>> {
        Ok(self.read()?.payments.get(&id).cloned())
    }

    fn subscription(&self, id: Uuid) -> PaymentResult<Option<SubscriptionRecord>> {
        Ok(self.read()?.subscriptions.get(&id).cloned())
    }

    fn find_payment(
        &self,
        provider: ProviderName,
        provider_payment_id: &str,
    ) -> PaymentResult<Option<PaymentRecord>> {
        let state = self.read()?;
        Ok(state
            .payment_keys
            .get(&LedgerKey::new(provider, provider_payment_id))
            .and_then(|id| state.payments.get(id))
            .cloned())
    }

    fn find_subscription(
        &self,
        provider: ProviderName,
        provider_subscription_id: &str,
    ) -> PaymentResult<Option<SubscriptionRecord>> {
        let state = self.read()?;
        Ok(state
            .subscription_keys
            .get(&LedgerKey::new(provider, provider_subscription_id))
            .and_then(|id| state.subscriptions.get(id))
            .cloned())
    }

    fn add_refund_delta(
        &self,
        provider: ProviderName,
        provider_payment_id: &str,
        amount: Decimal,
        refund_id: Option<&str>,
    ) -> PaymentResult<(PaymentRecord, bool)> {
        let key = LedgerKey::new(provider, provider_payment_id);
        if amount <= Decimal::ZERO {
            return Err(PaymentError::InvalidRequest(format!(
                "refund delta for {key} must be positive, got {amount}"
            )));
        }

        let mut state = self.write()?;
        let id = state
            .payment_keys
            .get(&key)
            .copied()
            .ok_or_else(|| PaymentError::NotFound(format!("payment {key}")))?;
        let row = state
            .payments
            .get_mut(&id)
            .ok_or_else(|| PaymentError::LedgerConflict(format!("dangling key {key}")))?;

        if let Some(refund_id) = refund_id {
            if row.refund_ids.contains(refund_id) {
                return Ok((row.clone(), false));
            }
        }

        if !row.status.is_refundable() {
            return Err(PaymentError::LedgerConflict(format!(
                "payment {key} is {} and cannot be refunded",
                row.status
            )));
        }

        let total = row.refunded_amount + amount;
        if total > row.amount {
            return Err(PaymentError::LedgerConflict(format!(
                "refund of {amount} on {key} would bring refunded total to {total}, above {}",
                row.amount
            )));
        }

        row.refunded_amount = total;
        row.status = if total == row.amount {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::PartiallyRefunded
        };
        if let Some(refund_id) = refund_id {
            row.refund_ids.insert(refund_id.to_string());
        }
        row.updated_at = Utc::now();

        Ok((row.clone(), true))
    }

    fn is_event_processed(&self, provider: ProviderName, event_id: &str) -> PaymentResult<bool> {
        Ok(self
            .read()?
            .events
            .contains_key(&(provider, event_id.to_string())))
    }

    fn record_event(&self, event: ProcessedEvent) -> PaymentResult<bool> {
        let mut state = self.write()?;
        let key = (event.provider, event.event_id.clone());
        if state.events.contains_key(&key) {
            return Ok(false);
        }
        state.events.insert(key, event);
        Ok(true)
    }

    fn purge_events_before(&self, cutoff: DateTime<Utc>) -> PaymentResult<usize> {
        let mut state = self.write()?;
        let before = state.events.len();
        state.events.retain(|_, event| event.processed_at >= cutoff);
        Ok(before - state.events.len())
    }

    fn payments(&self) -> PaymentResult<Vec<PaymentRecord>> {
        let mut rows: Vec<_> = self.read()?.payments.values().cloned().collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    fn subscriptions(&self) -> PaymentResult<Vec<SubscriptionRecord>> {
        let mut rows: Vec<_> = self.read()?.subscriptions.values().cloned().collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    fn processed_event_count(&self) -> PaymentResult<usize> {
        Ok(self.read()?.events.len())
    }
}
