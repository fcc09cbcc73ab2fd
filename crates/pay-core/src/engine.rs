//! # Reconciliation Engine
//!
//! Routes caller operations to the right provider, persists what comes back,
//! and applies verified webhooks to the ledger exactly once per event id.
//!
//! Provider calls always happen before the ledger is touched. A failed call
//! returns the provider's error untouched and leaves the ledger as it was.

use crate::error::{PaymentError, PaymentResult};
use crate::ledger::{Ledger, LedgerKey, ProcessedEvent};
use crate::locks::KeyLocks;
use crate::money::Currency;
use crate::payment::{PaymentRecord, PaymentSnapshot, PaymentStatus, RefundResult};
use crate::provider::{
    BoxedPaymentProvider, CreateCustomerRequest, CreatePaymentRequest, CreateSubscriptionRequest,
    Customer, ProviderName, ProviderRegistry, RefundRequest,
};
use crate::subscription::{SubscriptionRecord, SubscriptionSnapshot, SubscriptionStatus};
use crate::webhook::{
    EventTable, RefundSnapshot, ResourceSnapshot, WebhookEffect, WebhookEvent, WebhookHeaders,
    WebhookOutcome, WebhookReceipt,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Default retention for processed webhook event ids
pub const DEFAULT_EVENT_RETENTION_DAYS: u32 = 30;

/// Engine tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long processed event ids are remembered for dedup
    #[serde(default = "default_retention_days")]
    pub event_retention_days: u32,
}

fn default_retention_days() -> u32 {
    DEFAULT_EVENT_RETENTION_DAYS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_retention_days: DEFAULT_EVENT_RETENTION_DAYS,
        }
    }
}

impl EngineConfig {
    pub fn retention(&self) -> Duration {
        Duration::days(i64::from(self.event_retention_days))
    }
}

/// Refund call input at the engine level; the currency comes from the ledger
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefundPaymentRequest {
    /// Partial amount; `None` refunds whatever remains
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Result of a refund: the provider's answer and the updated ledger row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundOutcome {
    pub refund: RefundResult,
    pub payment: PaymentRecord,
}

/// Whether a provider is registered and has credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub name: ProviderName,
    pub configured: bool,
    pub webhook_path: String,
}

/// Aggregate view of the ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayStatistics {
    pub payments_total: usize,
    pub payments_by_status: BTreeMap<PaymentStatus, usize>,
    /// Amount captured per currency (includes later-refunded payments)
    pub captured_volume: BTreeMap<Currency, Decimal>,
    pub refunded_volume: BTreeMap<Currency, Decimal>,
    pub subscriptions_total: usize,
    pub subscriptions_by_status: BTreeMap<SubscriptionStatus, usize>,
    /// Trialing, active or past due
    pub active_subscriptions: usize,
    pub processed_events: usize,
    pub providers: Vec<ProviderStatus>,
}

/// Orchestrates providers and the ledger.
///
/// Built once at startup with explicit dependencies and shared via `Arc`.
pub struct ReconciliationEngine {
    registry: ProviderRegistry,
    ledger: Arc<dyn Ledger>,
    tables: HashMap<ProviderName, EventTable>,
    locks: KeyLocks,
    config: EngineConfig,
}

impl ReconciliationEngine {
    /// Build an engine with default settings
    pub fn new(registry: ProviderRegistry, ledger: Arc<dyn Ledger>) -> PaymentResult<Self> {
        Self::with_config(registry, ledger, EngineConfig::default())
    }

    /// Build an engine, validating every registered provider's event table
    pub fn with_config(
        registry: ProviderRegistry,
        ledger: Arc<dyn Ledger>,
        config: EngineConfig,
    ) -> PaymentResult<Self> {
        let mut tables = HashMap::new();
        for provider in registry.iter() {
            let table = EventTable::from_entries(provider.name(), provider.event_table())?;
            debug!(
                provider = %provider.name(),
                events = table.len(),
                "Webhook event table loaded"
            );
            tables.insert(provider.name(), table);
        }

        Ok(Self {
            registry,
            ledger,
            tables,
            locks: KeyLocks::new(),
            config,
        })
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn provider(&self, name: ProviderName) -> PaymentResult<&BoxedPaymentProvider> {
        self.registry.get(name)
    }

    // -------------------------------------------------------------------------
    // Payments
    // -------------------------------------------------------------------------

    /// Create a payment at the provider and record it, whatever its status
    #[instrument(skip(self, request), fields(currency = %request.currency))]
    pub async fn create_payment(
        &self,
        provider: ProviderName,
        request: &CreatePaymentRequest,
    ) -> PaymentResult<PaymentRecord> {
        request.validate()?;
        let client = self.provider(provider)?;

        let snapshot = client.create_payment(request).await?;
        let mut record = PaymentRecord::from_snapshot(provider, snapshot);
        if record.customer_reference.is_none() {
            record.customer_reference = request.customer.clone();
        }
        for (key, value) in &request.metadata {
            record
                .metadata
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }

        let key = LedgerKey::new(provider, record.provider_payment_id.clone());
        let _guard = self.locks.lock(&key).await;
        let record = self.ledger.upsert_payment(record)?;

        info!(
            payment = %key,
            status = %record.status,
            amount = %record.amount,
            "Payment created"
        );
        Ok(record)
    }

    /// Capture a known, capturable payment
    #[instrument(skip(self))]
    pub async fn capture_payment(
        &self,
        provider: ProviderName,
        provider_payment_id: &str,
    ) -> PaymentResult<PaymentRecord> {
        let client = self.provider(provider)?;
        let key = LedgerKey::new(provider, provider_payment_id);
        let _guard = self.locks.lock(&key).await;

        let row = self.require_payment(&key)?;
        if !row.status.is_capturable() {
            return Err(PaymentError::LedgerConflict(format!(
                "payment {key} is {} and cannot be captured",
                row.status
            )));
        }

        let captured = client.capture_payment(provider_payment_id).await?;
        if captured.currency != row.currency {
            warn!(
                payment = %key,
                expected = %row.currency,
                got = %captured.currency,
                "Capture reported in a different currency"
            );
        }

        let mut updated = row.clone();
        updated.status = captured.status;
        let record = self.ledger.upsert_payment(updated)?;

        info!(payment = %key, status = %record.status, "Payment captured");
        Ok(record)
    }

    /// Refund all or part of a captured payment.
    ///
    /// The remaining refundable amount is checked locally before the provider
    /// is called, and again atomically when the refund is recorded.
    #[instrument(skip(self, request))]
    pub async fn refund_payment(
        &self,
        provider: ProviderName,
        provider_payment_id: &str,
        request: &RefundPaymentRequest,
    ) -> PaymentResult<RefundOutcome> {
        let client = self.provider(provider)?;
        let key = LedgerKey::new(provider, provider_payment_id);
        let _guard = self.locks.lock(&key).await;

        let row = self.require_payment(&key)?;
        if !row.status.is_refundable() {
            return Err(PaymentError::LedgerConflict(format!(
                "payment {key} is {} and has nothing to refund",
                row.status
            )));
        }

        let remaining = row.remaining_refundable();
        let requested = request.amount.unwrap_or(remaining);
        if requested <= Decimal::ZERO {
            return Err(PaymentError::InvalidRequest(format!(
                "refund amount must be positive, got {requested}"
            )));
        }
        if requested > remaining {
            return Err(PaymentError::LedgerConflict(format!(
                "refund of {requested} on {key} exceeds remaining {remaining}"
            )));
        }

        let refund = client
            .refund_payment(&RefundRequest {
                provider_payment_id: provider_payment_id.to_string(),
                amount: request.amount,
                currency: row.currency.clone(),
                idempotency_key: request.idempotency_key.clone(),
            })
            .await?;

        let payment = if refund.status.counts_against_payment() {
            let (payment, _) = self.ledger.add_refund_delta(
                provider,
                provider_payment_id,
                refund.amount,
                Some(refund.refund_id.as_str()),
            )?;
            payment
        } else {
            warn!(
                payment = %key,
                refund_id = %refund.refund_id,
                status = ?refund.status,
                "Refund did not go through; ledger unchanged"
            );
            row
        };

        info!(
            payment = %key,
            refund_id = %refund.refund_id,
            refunded = %payment.refunded_amount,
            "Payment refunded"
        );
        Ok(RefundOutcome { refund, payment })
    }

    /// Pull the provider's current view of a payment into the ledger
    #[instrument(skip(self))]
    pub async fn sync_payment(
        &self,
        provider: ProviderName,
        provider_payment_id: &str,
    ) -> PaymentResult<PaymentRecord> {
        let client = self.provider(provider)?;
        let key = LedgerKey::new(provider, provider_payment_id);
        let _guard = self.locks.lock(&key).await;

        let snapshot = client.get_payment(provider_payment_id).await?;
        let record = self
            .ledger
            .upsert_payment(PaymentRecord::from_snapshot(provider, snapshot))?;

        debug!(payment = %key, status = %record.status, "Payment synced");
        Ok(record)
    }

    // -------------------------------------------------------------------------
    // Subscriptions & customers
    // -------------------------------------------------------------------------

    #[instrument(skip(self, request), fields(plan = %request.plan_id))]
    pub async fn create_subscription(
        &self,
        provider: ProviderName,
        request: &CreateSubscriptionRequest,
    ) -> PaymentResult<SubscriptionRecord> {
        if request.plan_id.trim().is_empty() {
            return Err(PaymentError::InvalidRequest("plan_id is required".into()));
        }
        let client = self.provider(provider)?;

        let snapshot = client.create_subscription(request).await?;
        let mut record = SubscriptionRecord::from_snapshot(provider, &request.plan_id, snapshot)?;
        if record.customer_reference.is_none() && !request.customer.is_empty() {
            record.customer_reference = Some(request.customer.clone());
        }

        let key = LedgerKey::new(provider, record.provider_subscription_id.clone());
        let _guard = self.locks.lock(&key).await;
        let record = self.ledger.upsert_subscription(record)?;

        info!(subscription = %key, status = %record.status, "Subscription created");
        Ok(record)
    }

    /// Cancel a subscription. Canceling an already canceled one is a no-op.
    #[instrument(skip(self))]
    pub async fn cancel_subscription(
        &self,
        provider: ProviderName,
        provider_subscription_id: &str,
    ) -> PaymentResult<SubscriptionRecord> {
        let client = self.provider(provider)?;
        let key = LedgerKey::new(provider, provider_subscription_id);
        let _guard = self.locks.lock(&key).await;

        let row = self
            .ledger
            .find_subscription(provider, provider_subscription_id)?
            .ok_or_else(|| PaymentError::NotFound(format!("subscription {key}")))?;
        if row.status == SubscriptionStatus::Canceled {
            return Ok(row);
        }
        if !row.status.can_transition_to(SubscriptionStatus::Canceled) {
            return Err(PaymentError::LedgerConflict(format!(
                "subscription {key} is {} and cannot be canceled",
                row.status
            )));
        }

        let snapshot = client.cancel_subscription(provider_subscription_id).await?;

        let mut updated = row.clone();
        updated.absorb(&snapshot);
        updated.status = snapshot.status.unwrap_or(SubscriptionStatus::Canceled);
        if updated.status.is_terminal() && updated.canceled_at.is_none() {
            updated.canceled_at = Some(Utc::now());
        }
        let record = self.ledger.upsert_subscription(updated)?;

        info!(subscription = %key, status = %record.status, "Subscription canceled");
        Ok(record)
    }

    /// Register a customer. Nothing is written to the ledger.
    pub async fn create_customer(
        &self,
        provider: ProviderName,
        request: &CreateCustomerRequest,
    ) -> PaymentResult<Customer> {
        let customer = self.provider(provider)?.create_customer(request).await?;
        info!(provider = %provider, customer = %customer.id, "Customer created");
        Ok(customer)
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    pub fn payment(&self, id: Uuid) -> PaymentResult<Option<PaymentRecord>> {
        self.ledger.payment(id)
    }

    pub fn subscription(&self, id: Uuid) -> PaymentResult<Option<SubscriptionRecord>> {
        self.ledger.subscription(id)
    }

    pub fn find_payment(
        &self,
        provider: ProviderName,
        provider_payment_id: &str,
    ) -> PaymentResult<Option<PaymentRecord>> {
        self.ledger.find_payment(provider, provider_payment_id)
    }

    pub fn find_subscription(
        &self,
        provider: ProviderName,
        provider_subscription_id: &str,
    ) -> PaymentResult<Option<SubscriptionRecord>> {
        self.ledger
            .find_subscription(provider, provider_subscription_id)
    }

    fn require_payment(&self, key: &LedgerKey) -> PaymentResult<PaymentRecord> {
        self.ledger
            .find_payment(key.provider, &key.external_id)?
            .ok_or_else(|| PaymentError::NotFound(format!("payment {key}")))
    }

    // -------------------------------------------------------------------------
    // Webhooks
    // -------------------------------------------------------------------------

    /// Verify, classify and apply an inbound webhook.
    ///
    /// `body` must be the raw request bytes. Errors mean nothing was recorded,
    /// so the provider's redelivery will be processed again.
    #[instrument(skip(self, body, headers), fields(bytes = body.len()))]
    pub async fn handle_webhook(
        &self,
        provider: ProviderName,
        body: &[u8],
        headers: &WebhookHeaders,
    ) -> PaymentResult<WebhookReceipt> {
        let client = self.provider(provider)?;
        let event = client.verify_webhook(body, headers).await?;

        let table = self.tables.get(&provider).ok_or_else(|| {
            PaymentError::Configuration(format!("no event table for {provider}"))
        })?;

        let Some(effect) = table.lookup(&event.event_type) else {
            debug!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "Ignoring unmapped webhook event"
            );
            return Ok(receipt(provider, &event, None, WebhookOutcome::Ignored));
        };

        if self.ledger.is_event_processed(provider, &event.event_id)? {
            debug!(event_id = %event.event_id, "Duplicate webhook delivery");
            return Ok(receipt(provider, &event, Some(effect), WebhookOutcome::Duplicate));
        }

        let resource = client.parse_resource(effect.resource_kind(), &event.resource)?;
        let key = LedgerKey::new(provider, resource.external_id());
        let _guard = self.locks.lock(&key).await;

        // another delivery of the same event may have won the lock
        if self.ledger.is_event_processed(provider, &event.event_id)? {
            debug!(event_id = %event.event_id, "Duplicate webhook delivery");
            return Ok(receipt(provider, &event, Some(effect), WebhookOutcome::Duplicate));
        }

        let outcome = match &resource {
            ResourceSnapshot::Payment(snapshot) => {
                self.apply_payment_effect(&key, effect, snapshot)?
            }
            ResourceSnapshot::Refund(refund) => self.apply_refund(&key, refund)?,
            ResourceSnapshot::Subscription(snapshot) => {
                self.apply_subscription_effect(&key, effect, snapshot, event.occurred_at)?
            }
        };

        self.ledger.record_event(ProcessedEvent {
            provider,
            event_id: event.event_id.clone(),
            event_type: event.event_type.clone(),
            outcome,
            processed_at: Utc::now(),
        })?;

        match outcome {
            WebhookOutcome::Orphaned => warn!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                resource = %key,
                "Webhook references a resource missing from the ledger"
            ),
            WebhookOutcome::Stale => info!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                resource = %key,
                "Out-of-order webhook left ledger unchanged"
            ),
            _ => info!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                resource = %key,
                outcome = ?outcome,
                "Webhook processed"
            ),
        }

        Ok(receipt(provider, &event, Some(effect), outcome))
    }

    fn apply_payment_effect(
        &self,
        key: &LedgerKey,
        effect: WebhookEffect,
        snapshot: &PaymentSnapshot,
    ) -> PaymentResult<WebhookOutcome> {
        let Some(row) = self.ledger.find_payment(key.provider, &key.external_id)? else {
            return Ok(WebhookOutcome::Orphaned);
        };

        let target = match effect {
            WebhookEffect::PaymentSucceeded => PaymentStatus::Captured,
            WebhookEffect::PaymentFailed => PaymentStatus::Failed,
            WebhookEffect::PaymentCanceled => PaymentStatus::Canceled,
            WebhookEffect::PaymentRequiresAction => PaymentStatus::RequiresAction,
            WebhookEffect::PaymentAuthorized => PaymentStatus::Authorized,
            _ => snapshot.status,
        };
        if !row.status.can_transition_to(target) {
            return Ok(WebhookOutcome::Stale);
        }

        let mut incoming = PaymentRecord::from_snapshot(key.provider, snapshot.clone());
        incoming.status = target;
        self.ledger.upsert_payment(incoming)?;
        Ok(WebhookOutcome::Applied)
    }

    fn apply_refund(&self, key: &LedgerKey, refund: &RefundSnapshot) -> PaymentResult<WebhookOutcome> {
        let Some(row) = self.ledger.find_payment(key.provider, &key.external_id)? else {
            return Ok(WebhookOutcome::Orphaned);
        };

        if !refund.status.counts_against_payment() {
            return Ok(WebhookOutcome::Ignored);
        }
        if refund.currency != row.currency {
            return Err(PaymentError::PayloadMalformed(format!(
                "refund on {key} is in {} but the payment is in {}",
                refund.currency, row.currency
            )));
        }

        let known_id = refund
            .refund_id
            .as_deref()
            .filter(|id| row.refund_ids.contains(*id));

        // a cumulative total decides on its own; refund ids only guard single amounts
        let (delta, refund_id) = match refund.total_refunded {
            Some(total) => {
                let fresh_id = refund.refund_id.as_deref().filter(|_| known_id.is_none());
                (total - row.refunded_amount, fresh_id)
            }
            None if known_id.is_some() => return Ok(WebhookOutcome::Duplicate),
            None => (refund.amount, refund.refund_id.as_deref()),
        };
        if delta <= Decimal::ZERO {
            return Ok(WebhookOutcome::Duplicate);
        }

        self.ledger
            .add_refund_delta(key.provider, &key.external_id, delta, refund_id)?;
        Ok(WebhookOutcome::Applied)
    }

    fn apply_subscription_effect(
        &self,
        key: &LedgerKey,
        effect: WebhookEffect,
        snapshot: &SubscriptionSnapshot,
        occurred_at: DateTime<Utc>,
    ) -> PaymentResult<WebhookOutcome> {
        let Some(row) = self
            .ledger
            .find_subscription(key.provider, &key.external_id)?
        else {
            return Ok(WebhookOutcome::Orphaned);
        };

        let target = match effect {
            WebhookEffect::SubscriptionActivated => match snapshot.status {
                Some(SubscriptionStatus::Trialing) => SubscriptionStatus::Trialing,
                _ => SubscriptionStatus::Active,
            },
            WebhookEffect::SubscriptionPeriodRenewed => snapshot.status.unwrap_or(
                if row.status == SubscriptionStatus::Trialing {
                    SubscriptionStatus::Trialing
                } else {
                    SubscriptionStatus::Active
                },
            ),
            WebhookEffect::SubscriptionPastDue => SubscriptionStatus::PastDue,
            WebhookEffect::SubscriptionPaused => SubscriptionStatus::Paused,
            WebhookEffect::SubscriptionResumed => SubscriptionStatus::Active,
            WebhookEffect::SubscriptionCanceled => SubscriptionStatus::Canceled,
            WebhookEffect::SubscriptionExpired => SubscriptionStatus::Expired,
            _ => snapshot.status.unwrap_or(row.status),
        };
        if !row.status.can_transition_to(target) {
            return Ok(WebhookOutcome::Stale);
        }

        let mut updated = row.clone();
        updated.absorb(snapshot);
        updated.status = target;
        if !target.is_terminal() {
            updated.canceled_at = None;
        } else if target == SubscriptionStatus::Canceled && updated.canceled_at.is_none() {
            updated.canceled_at = Some(occurred_at);
        }
        self.ledger.upsert_subscription(updated)?;
        Ok(WebhookOutcome::Applied)
    }

    // -------------------------------------------------------------------------
    // Maintenance & reporting
    // -------------------------------------------------------------------------

    /// Forget processed event ids older than the retention window
    pub fn purge_processed_events(&self, now: DateTime<Utc>) -> PaymentResult<usize> {
        let cutoff = now - self.config.retention();
        let purged = self.ledger.purge_events_before(cutoff)?;
        if purged > 0 {
            info!(purged, cutoff = %cutoff, "Purged processed webhook events");
        }
        Ok(purged)
    }

    /// Registered providers and whether they can be used
    pub fn provider_statuses(&self) -> Vec<ProviderStatus> {
        let mut statuses: Vec<_> = self
            .registry
            .iter()
            .map(|p| ProviderStatus {
                name: p.name(),
                configured: p.is_configured(),
                webhook_path: p.webhook_path(),
            })
            .collect();
        statuses.sort_by_key(|s| s.name);
        statuses
    }

    pub fn statistics(&self) -> PaymentResult<GatewayStatistics> {
        let mut stats = GatewayStatistics::default();

        for payment in self.ledger.payments()? {
            stats.payments_total += 1;
            *stats.payments_by_status.entry(payment.status).or_default() += 1;
            if matches!(
                payment.status,
                PaymentStatus::Captured | PaymentStatus::PartiallyRefunded | PaymentStatus::Refunded
            ) {
                *stats
                    .captured_volume
                    .entry(payment.currency.clone())
                    .or_default() += payment.amount;
            }
            if payment.refunded_amount > Decimal::ZERO {
                *stats
                    .refunded_volume
                    .entry(payment.currency.clone())
                    .or_default() += payment.refunded_amount;
            }
        }

        for subscription in self.ledger.subscriptions()? {
            stats.subscriptions_total += 1;
            *stats
                .subscriptions_by_status
                .entry(subscription.status)
                .or_default() += 1;
            if subscription.status.is_live() {
                stats.active_subscriptions += 1;
            }
        }

        stats.processed_events = self.ledger.processed_event_count()?;
        stats.providers = self.provider_statuses();
        Ok(stats)
    }
}

fn receipt(
    provider: ProviderName,
    event: &WebhookEvent,
    effect: Option<WebhookEffect>,
    outcome: WebhookOutcome,
) -> WebhookReceipt {
    WebhookReceipt {
        provider,
        event_id: event.event_id.clone(),
        event_type: event.event_type.clone(),
        effect,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::payment::{CaptureResult, RefundStatus};
    use crate::provider::PaymentProvider;
    use crate::webhook::{EventTableEntry, ResourceKind};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const MOCK_EVENTS: &[EventTableEntry] = &[
        ("payment.succeeded", WebhookEffect::PaymentSucceeded),
        ("payment.canceled", WebhookEffect::PaymentCanceled),
        ("payment.refunded", WebhookEffect::PaymentRefunded),
        ("subscription.activated", WebhookEffect::SubscriptionActivated),
        ("subscription.paused", WebhookEffect::SubscriptionPaused),
        ("subscription.canceled", WebhookEffect::SubscriptionCanceled),
    ];

    const BROKEN_EVENTS: &[EventTableEntry] = &[
        ("payment.succeeded", WebhookEffect::PaymentSucceeded),
        ("payment.succeeded", WebhookEffect::PaymentFailed),
    ];

    /// Scripted provider: canonical JSON in, canonical JSON out
    struct MockProvider {
        configured: bool,
        table: &'static [EventTableEntry],
        create_status: PaymentStatus,
        capture_timeout: AtomicBool,
        payments_created: AtomicUsize,
        refunds_issued: AtomicUsize,
        calls: AtomicUsize,
    }

    impl MockProvider {
        fn new() -> Self {
            Self {
                configured: true,
                table: MOCK_EVENTS,
                create_status: PaymentStatus::RequiresAction,
                capture_timeout: AtomicBool::new(false),
                payments_created: AtomicUsize::new(0),
                refunds_issued: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }

        fn usd() -> Currency {
            Currency::new("USD").unwrap()
        }
    }

    #[async_trait]
    impl PaymentProvider for MockProvider {
        fn name(&self) -> ProviderName {
            ProviderName::Stripe
        }

        fn is_configured(&self) -> bool {
            self.configured
        }

        async fn create_payment(
            &self,
            request: &CreatePaymentRequest,
        ) -> PaymentResult<PaymentSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let n = self.payments_created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(PaymentSnapshot {
                provider_payment_id: format!("pay_{n}"),
                status: self.create_status,
                amount: request.amount,
                currency: request.currency.clone(),
                amount_refunded: None,
                customer_reference: None,
                metadata: HashMap::new(),
                approval_url: None,
            })
        }

        async fn capture_payment(&self, _id: &str) -> PaymentResult<CaptureResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.capture_timeout.load(Ordering::SeqCst) {
                return Err(PaymentError::transport(
                    ProviderName::Stripe,
                    "operation timed out",
                    true,
                ));
            }
            Ok(CaptureResult {
                status: PaymentStatus::Captured,
                captured_amount: Decimal::new(4999, 2),
                currency: Self::usd(),
                capture_id: None,
            })
        }

        async fn refund_payment(&self, request: &RefundRequest) -> PaymentResult<RefundResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let n = self.refunds_issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(RefundResult {
                refund_id: format!("re_{n}"),
                status: RefundStatus::Succeeded,
                amount: request.amount.unwrap_or(Decimal::new(4999, 2)),
                currency: request.currency.clone(),
            })
        }

        async fn get_payment(&self, id: &str) -> PaymentResult<PaymentSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PaymentSnapshot {
                provider_payment_id: id.to_string(),
                status: PaymentStatus::Captured,
                amount: Decimal::new(4999, 2),
                currency: Self::usd(),
                amount_refunded: Some(Decimal::ZERO),
                customer_reference: None,
                metadata: HashMap::new(),
                approval_url: None,
            })
        }

        async fn create_subscription(
            &self,
            request: &CreateSubscriptionRequest,
        ) -> PaymentResult<SubscriptionSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SubscriptionSnapshot {
                provider_subscription_id: "sub_1".into(),
                status: Some(SubscriptionStatus::Incomplete),
                customer_reference: Some(request.customer.clone()),
                ..Default::default()
            })
        }

        async fn cancel_subscription(&self, id: &str) -> PaymentResult<SubscriptionSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SubscriptionSnapshot {
                provider_subscription_id: id.to_string(),
                status: Some(SubscriptionStatus::Canceled),
                ..Default::default()
            })
        }

        async fn create_customer(&self, request: &CreateCustomerRequest) -> PaymentResult<Customer> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Customer {
                id: "cus_1".into(),
                provider: ProviderName::Stripe,
                email: request.email.clone(),
                name: request.name.clone(),
                metadata: request.metadata.clone(),
            })
        }

        async fn verify_webhook(
            &self,
            payload: &[u8],
            headers: &WebhookHeaders,
        ) -> PaymentResult<WebhookEvent> {
            if headers.require("x-mock-signature")? != "valid" {
                return Err(PaymentError::SignatureInvalid("bad mock signature".into()));
            }
            let envelope: serde_json::Value = serde_json::from_slice(payload)
                .map_err(|e| PaymentError::PayloadMalformed(e.to_string()))?;
            Ok(WebhookEvent {
                event_id: envelope["id"].as_str().unwrap_or_default().to_string(),
                event_type: envelope["type"].as_str().unwrap_or_default().to_string(),
                provider: ProviderName::Stripe,
                resource: envelope["data"].clone(),
                occurred_at: Utc::now(),
            })
        }

        fn parse_resource(
            &self,
            kind: ResourceKind,
            resource: &serde_json::Value,
        ) -> PaymentResult<ResourceSnapshot> {
            let malformed = |e: serde_json::Error| PaymentError::PayloadMalformed(e.to_string());
            Ok(match kind {
                ResourceKind::Payment => ResourceSnapshot::Payment(
                    serde_json::from_value(resource.clone()).map_err(malformed)?,
                ),
                ResourceKind::Refund => ResourceSnapshot::Refund(
                    serde_json::from_value(resource.clone()).map_err(malformed)?,
                ),
                ResourceKind::Subscription => ResourceSnapshot::Subscription(
                    serde_json::from_value(resource.clone()).map_err(malformed)?,
                ),
            })
        }

        fn event_table(&self) -> &'static [EventTableEntry] {
            self.table
        }
    }

    struct Harness {
        engine: Arc<ReconciliationEngine>,
        ledger: Arc<InMemoryLedger>,
        mock: Arc<MockProvider>,
    }

    fn harness(mock: MockProvider) -> Harness {
        let ledger = Arc::new(InMemoryLedger::new());
        let mock = Arc::new(mock);
        let registry = ProviderRegistry::new().with_provider(mock.clone());
        let engine = ReconciliationEngine::new(registry, ledger.clone()).unwrap();
        Harness {
            engine: Arc::new(engine),
            ledger,
            mock,
        }
    }

    fn signed() -> WebhookHeaders {
        WebhookHeaders::new().with("X-Mock-Signature", "valid")
    }

    fn body(id: &str, event_type: &str, data: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json!({ "id": id, "type": event_type, "data": data })).unwrap()
    }

    fn seed_captured(ledger: &InMemoryLedger, id: &str, amount: Decimal) -> PaymentRecord {
        ledger
            .upsert_payment(PaymentRecord::from_snapshot(
                ProviderName::Stripe,
                PaymentSnapshot {
                    provider_payment_id: id.into(),
                    status: PaymentStatus::Captured,
                    amount,
                    currency: MockProvider::usd(),
                    amount_refunded: None,
                    customer_reference: None,
                    metadata: HashMap::new(),
                    approval_url: None,
                },
            ))
            .unwrap()
    }

    fn refund_event(id: &str, refund_id: &str, amount: &str, total: Option<&str>) -> Vec<u8> {
        let mut data = json!({
            "provider_payment_id": "pay_1",
            "refund_id": refund_id,
            "status": "succeeded",
            "amount": amount,
            "currency": "USD",
        });
        if let Some(total) = total {
            data["total_refunded"] = json!(total);
        }
        body(id, "payment.refunded", data)
    }

    #[tokio::test]
    async fn test_create_then_capture() {
        let h = harness(MockProvider::new());
        let request = CreatePaymentRequest::new(Decimal::new(4999, 2), MockProvider::usd())
            .with_metadata("order", "o-1");

        let created = h
            .engine
            .create_payment(ProviderName::Stripe, &request)
            .await
            .unwrap();
        assert_eq!(created.provider_payment_id, "pay_1");
        assert_eq!(created.status, PaymentStatus::RequiresAction);
        assert_eq!(created.metadata.get("order").map(String::as_str), Some("o-1"));

        let captured = h
            .engine
            .capture_payment(ProviderName::Stripe, "pay_1")
            .await
            .unwrap();
        assert_eq!(captured.id, created.id);
        assert_eq!(captured.status, PaymentStatus::Captured);
        assert_eq!(captured.refunded_amount, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_capture_timeout_leaves_ledger_untouched() {
        let h = harness(MockProvider::new());
        h.engine
            .create_payment(
                ProviderName::Stripe,
                &CreatePaymentRequest::new(Decimal::new(4999, 2), MockProvider::usd()),
            )
            .await
            .unwrap();
        h.mock.capture_timeout.store(true, Ordering::SeqCst);

        let err = h
            .engine
            .capture_payment(ProviderName::Stripe, "pay_1")
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Transport { timeout: true, .. }));
        assert!(err.is_retryable());

        let row = h.engine.find_payment(ProviderName::Stripe, "pay_1").unwrap().unwrap();
        assert_eq!(row.status, PaymentStatus::RequiresAction);
    }

    #[tokio::test]
    async fn test_capture_rejects_settled_payment_without_calling_provider() {
        let h = harness(MockProvider::new());
        seed_captured(&h.ledger, "pay_1", Decimal::new(1000, 2));

        let err = h
            .engine
            .capture_payment(ProviderName::Stripe, "pay_1")
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::LedgerConflict(_)));
        assert_eq!(h.mock.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refund_over_remaining_is_rejected_locally() {
        let h = harness(MockProvider::new());
        seed_captured(&h.ledger, "pay_1", Decimal::new(1000, 2));

        let err = h
            .engine
            .refund_payment(
                ProviderName::Stripe,
                "pay_1",
                &RefundPaymentRequest {
                    amount: Some(Decimal::new(1001, 2)),
                    idempotency_key: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::LedgerConflict(_)));
        assert_eq!(h.mock.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_duplicate_refund_webhook_applies_once() {
        let h = harness(MockProvider::new());
        seed_captured(&h.ledger, "pay_1", Decimal::new(5000, 2));
        let delivery = refund_event("evt_1", "re_1", "10.00", Some("10.00"));

        let first = h
            .engine
            .handle_webhook(ProviderName::Stripe, &delivery, &signed())
            .await
            .unwrap();
        let second = h
            .engine
            .handle_webhook(ProviderName::Stripe, &delivery, &signed())
            .await
            .unwrap();

        assert_eq!(first.outcome, WebhookOutcome::Applied);
        assert_eq!(second.outcome, WebhookOutcome::Duplicate);
        let row = h.engine.find_payment(ProviderName::Stripe, "pay_1").unwrap().unwrap();
        assert_eq!(row.refunded_amount, Decimal::new(1000, 2));
        assert_eq!(row.status, PaymentStatus::PartiallyRefunded);
    }

    #[tokio::test]
    async fn test_refund_seen_by_call_and_webhook_counts_once() {
        let h = harness(MockProvider::new());
        seed_captured(&h.ledger, "pay_1", Decimal::new(5000, 2));

        let outcome = h
            .engine
            .refund_payment(
                ProviderName::Stripe,
                "pay_1",
                &RefundPaymentRequest {
                    amount: Some(Decimal::new(1000, 2)),
                    idempotency_key: Some("refund-1".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.refund.refund_id, "re_1");

        // same refund announced later under a new event id
        let receipt = h
            .engine
            .handle_webhook(
                ProviderName::Stripe,
                &refund_event("evt_2", "re_1", "10.00", None),
                &signed(),
            )
            .await
            .unwrap();
        assert_eq!(receipt.outcome, WebhookOutcome::Duplicate);

        let row = h.engine.find_payment(ProviderName::Stripe, "pay_1").unwrap().unwrap();
        assert_eq!(row.refunded_amount, Decimal::new(1000, 2));
    }

    #[tokio::test]
    async fn test_running_total_recovers_refund_missed_by_id() {
        let h = harness(MockProvider::new());
        seed_captured(&h.ledger, "pay_1", Decimal::new(5000, 2));

        h.engine
            .refund_payment(
                ProviderName::Stripe,
                "pay_1",
                &RefundPaymentRequest {
                    amount: Some(Decimal::new(1000, 2)),
                    idempotency_key: None,
                },
            )
            .await
            .unwrap();

        // an earlier dashboard refund arrives late, then the API refund with the new total
        let dashboard = h
            .engine
            .handle_webhook(
                ProviderName::Stripe,
                &refund_event("evt_a", "re_dash", "5.00", Some("5.00")),
                &signed(),
            )
            .await
            .unwrap();
        let api = h
            .engine
            .handle_webhook(
                ProviderName::Stripe,
                &refund_event("evt_b", "re_1", "10.00", Some("15.00")),
                &signed(),
            )
            .await
            .unwrap();

        assert_eq!(dashboard.outcome, WebhookOutcome::Duplicate);
        assert_eq!(api.outcome, WebhookOutcome::Applied);
        let row = h.engine.find_payment(ProviderName::Stripe, "pay_1").unwrap().unwrap();
        assert_eq!(row.refunded_amount, Decimal::new(1500, 2));
        assert_eq!(row.status, PaymentStatus::PartiallyRefunded);

        // redelivering the total changes nothing
        let again = h
            .engine
            .handle_webhook(
                ProviderName::Stripe,
                &refund_event("evt_c", "re_1", "10.00", Some("15.00")),
                &signed(),
            )
            .await
            .unwrap();
        assert_eq!(again.outcome, WebhookOutcome::Duplicate);
        let row = h.engine.find_payment(ProviderName::Stripe, "pay_1").unwrap().unwrap();
        assert_eq!(row.refunded_amount, Decimal::new(1500, 2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_redeliveries_apply_once() {
        let h = harness(MockProvider::new());
        seed_captured(&h.ledger, "pay_1", Decimal::new(5000, 2));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let engine = Arc::clone(&h.engine);
                tokio::spawn(async move {
                    engine
                        .handle_webhook(
                            ProviderName::Stripe,
                            &refund_event("evt_1", "re_1", "10.00", None),
                            &signed(),
                        )
                        .await
                        .unwrap()
                        .outcome
                })
            })
            .collect();

        let mut applied = 0;
        for task in tasks {
            if task.await.unwrap() == WebhookOutcome::Applied {
                applied += 1;
            }
        }

        assert_eq!(applied, 1);
        let row = h.engine.find_payment(ProviderName::Stripe, "pay_1").unwrap().unwrap();
        assert_eq!(row.refunded_amount, Decimal::new(1000, 2));
    }

    #[tokio::test]
    async fn test_orphan_webhook_is_recorded_not_inserted() {
        let h = harness(MockProvider::new());
        let delivery = body(
            "evt_9",
            "payment.succeeded",
            json!({
                "provider_payment_id": "pay_unknown",
                "status": "captured",
                "amount": "5.00",
                "currency": "USD",
            }),
        );

        let receipt = h
            .engine
            .handle_webhook(ProviderName::Stripe, &delivery, &signed())
            .await
            .unwrap();

        assert_eq!(receipt.outcome, WebhookOutcome::Orphaned);
        assert!(h.ledger.payments().unwrap().is_empty());
        assert!(h.ledger.is_event_processed(ProviderName::Stripe, "evt_9").unwrap());
    }

    #[tokio::test]
    async fn test_out_of_order_cancel_is_stale() {
        let h = harness(MockProvider::new());
        seed_captured(&h.ledger, "pay_1", Decimal::new(5000, 2));
        let delivery = body(
            "evt_3",
            "payment.canceled",
            json!({
                "provider_payment_id": "pay_1",
                "status": "canceled",
                "amount": "50.00",
                "currency": "USD",
            }),
        );

        let receipt = h
            .engine
            .handle_webhook(ProviderName::Stripe, &delivery, &signed())
            .await
            .unwrap();

        assert_eq!(receipt.outcome, WebhookOutcome::Stale);
        let row = h.engine.find_payment(ProviderName::Stripe, "pay_1").unwrap().unwrap();
        assert_eq!(row.status, PaymentStatus::Captured);
    }

    #[tokio::test]
    async fn test_unmapped_event_is_ignored() {
        let h = harness(MockProvider::new());
        let receipt = h
            .engine
            .handle_webhook(
                ProviderName::Stripe,
                &body("evt_4", "customer.created", json!({})),
                &signed(),
            )
            .await
            .unwrap();

        assert_eq!(receipt.outcome, WebhookOutcome::Ignored);
        assert_eq!(receipt.effect, None);
    }

    #[tokio::test]
    async fn test_bad_signature_mutates_nothing() {
        let h = harness(MockProvider::new());
        seed_captured(&h.ledger, "pay_1", Decimal::new(5000, 2));

        let err = h
            .engine
            .handle_webhook(
                ProviderName::Stripe,
                &refund_event("evt_1", "re_1", "10.00", None),
                &WebhookHeaders::new().with("x-mock-signature", "forged"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PaymentError::SignatureInvalid(_)));
        assert_eq!(h.ledger.processed_event_count().unwrap(), 0);
        let row = h.engine.find_payment(ProviderName::Stripe, "pay_1").unwrap().unwrap();
        assert_eq!(row.refunded_amount, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_unconfigured_provider_fails_fast() {
        let mut mock = MockProvider::new();
        mock.configured = false;
        let h = harness(mock);

        let err = h
            .engine
            .create_payment(
                ProviderName::Stripe,
                &CreatePaymentRequest::new(Decimal::ONE, MockProvider::usd()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Configuration(_)));

        let err = h
            .engine
            .create_payment(
                ProviderName::PayPal,
                &CreatePaymentRequest::new(Decimal::ONE, MockProvider::usd()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Configuration(_)));
        assert_eq!(h.mock.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_duplicate_event_table_is_rejected_at_build() {
        let mut mock = MockProvider::new();
        mock.table = BROKEN_EVENTS;
        let registry = ProviderRegistry::new().with_provider(Arc::new(mock));

        let result = ReconciliationEngine::new(registry, Arc::new(InMemoryLedger::new()));
        assert!(matches!(result, Err(PaymentError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_subscription_lifecycle() {
        let h = harness(MockProvider::new());
        let created = h
            .engine
            .create_subscription(
                ProviderName::Stripe,
                &CreateSubscriptionRequest::new("cus_1", "price_basic"),
            )
            .await
            .unwrap();
        assert_eq!(created.status, SubscriptionStatus::Incomplete);
        assert_eq!(created.plan_id, "price_basic");

        let receipt = h
            .engine
            .handle_webhook(
                ProviderName::Stripe,
                &body(
                    "evt_s1",
                    "subscription.activated",
                    json!({ "provider_subscription_id": "sub_1", "status": "active" }),
                ),
                &signed(),
            )
            .await
            .unwrap();
        assert_eq!(receipt.outcome, WebhookOutcome::Applied);

        let canceled = h
            .engine
            .cancel_subscription(ProviderName::Stripe, "sub_1")
            .await
            .unwrap();
        assert_eq!(canceled.id, created.id);
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);
        assert!(canceled.canceled_at.is_some());

        // a late activation cannot revive it
        let receipt = h
            .engine
            .handle_webhook(
                ProviderName::Stripe,
                &body(
                    "evt_s2",
                    "subscription.activated",
                    json!({ "provider_subscription_id": "sub_1" }),
                ),
                &signed(),
            )
            .await
            .unwrap();
        assert_eq!(receipt.outcome, WebhookOutcome::Stale);
    }

    async fn paused_subscription(h: &Harness) {
        h.engine
            .create_subscription(
                ProviderName::Stripe,
                &CreateSubscriptionRequest::new("cus_1", "price_basic"),
            )
            .await
            .unwrap();
        for (id, event_type) in [
            ("evt_p1", "subscription.activated"),
            ("evt_p2", "subscription.paused"),
        ] {
            let receipt = h
                .engine
                .handle_webhook(
                    ProviderName::Stripe,
                    &body(id, event_type, json!({ "provider_subscription_id": "sub_1" })),
                    &signed(),
                )
                .await
                .unwrap();
            assert_eq!(receipt.outcome, WebhookOutcome::Applied);
        }
    }

    #[tokio::test]
    async fn test_paused_subscription_can_be_canceled() {
        // by webhook
        let h = harness(MockProvider::new());
        paused_subscription(&h).await;
        let receipt = h
            .engine
            .handle_webhook(
                ProviderName::Stripe,
                &body(
                    "evt_p3",
                    "subscription.canceled",
                    json!({ "provider_subscription_id": "sub_1" }),
                ),
                &signed(),
            )
            .await
            .unwrap();
        assert_eq!(receipt.outcome, WebhookOutcome::Applied);
        let row = h
            .engine
            .find_subscription(ProviderName::Stripe, "sub_1")
            .unwrap()
            .unwrap();
        assert_eq!(row.status, SubscriptionStatus::Canceled);
        assert!(row.canceled_at.is_some());

        // by API call
        let h = harness(MockProvider::new());
        paused_subscription(&h).await;
        let canceled = h
            .engine
            .cancel_subscription(ProviderName::Stripe, "sub_1")
            .await
            .unwrap();
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn test_purge_respects_retention() {
        let h = harness(MockProvider::new());
        let now = Utc::now();
        for (id, age) in [("evt_old", 45), ("evt_new", 2)] {
            h.ledger
                .record_event(ProcessedEvent {
                    provider: ProviderName::Stripe,
                    event_id: id.into(),
                    event_type: "payment.succeeded".into(),
                    outcome: WebhookOutcome::Applied,
                    processed_at: now - Duration::days(age),
                })
                .unwrap();
        }

        assert_eq!(h.engine.purge_processed_events(now).unwrap(), 1);
        assert!(h.ledger.is_event_processed(ProviderName::Stripe, "evt_new").unwrap());
    }

    #[tokio::test]
    async fn test_statistics() {
        let h = harness(MockProvider::new());
        seed_captured(&h.ledger, "pay_seed", Decimal::new(5000, 2));
        h.ledger
            .add_refund_delta(ProviderName::Stripe, "pay_seed", Decimal::new(1000, 2), None)
            .unwrap();
        h.engine
            .create_payment(
                ProviderName::Stripe,
                &CreatePaymentRequest::new(Decimal::new(2000, 2), MockProvider::usd()),
            )
            .await
            .unwrap();

        let stats = h.engine.statistics().unwrap();
        let usd = MockProvider::usd();
        assert_eq!(stats.payments_total, 2);
        assert_eq!(stats.payments_by_status[&PaymentStatus::PartiallyRefunded], 1);
        assert_eq!(stats.payments_by_status[&PaymentStatus::RequiresAction], 1);
        assert_eq!(stats.captured_volume[&usd], Decimal::new(5000, 2));
        assert_eq!(stats.refunded_volume[&usd], Decimal::new(1000, 2));
        assert_eq!(stats.providers.len(), 1);
        assert!(stats.providers[0].configured);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["payments_by_status"]["partially_refunded"], 1);
    }
}
