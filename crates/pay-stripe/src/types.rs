//! # Stripe API Types
//!
//! Wire shapes shared by API responses and webhook `data.object` payloads,
//! plus their conversion into the canonical snapshots. Amounts arrive in
//! minor units and leave through the money codec.

use chrono::{DateTime, Utc};
use pay_core::money::{from_minor_units, Currency};
use pay_core::{
    BillingInterval, CaptureResult, Customer, PaymentError, PaymentResult, PaymentSnapshot,
    PaymentStatus, ProviderName, RefundResult, RefundSnapshot, RefundStatus,
    SubscriptionSnapshot, SubscriptionStatus,
};
use serde::Deserialize;
use std::collections::HashMap;

const STRIPE: ProviderName = ProviderName::Stripe;

/// A field Stripe returns either as an id or, when expanded, as the object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum Expandable<T> {
    Id(String),
    Object(Box<T>),
}

impl<T> Expandable<T> {
    pub(crate) fn object(&self) -> Option<&T> {
        match self {
            Expandable::Object(obj) => Some(obj.as_ref()),
            Expandable::Id(_) => None,
        }
    }
}

impl<T: HasId> Expandable<T> {
    pub(crate) fn id(&self) -> &str {
        match self {
            Expandable::Id(id) => id.as_str(),
            Expandable::Object(obj) => obj.id(),
        }
    }
}

pub(crate) trait HasId {
    fn id(&self) -> &str;
}

#[derive(Debug, Deserialize)]
pub(crate) struct List<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IdOnly {
    pub id: String,
}

impl HasId for IdOnly {
    fn id(&self) -> &str {
        &self.id
    }
}

// =============================================================================
// Payments
// =============================================================================

#[derive(Debug, Deserialize)]
pub(crate) struct StripePaymentIntent {
    pub id: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub amount_received: Option<i64>,
    #[serde(default)]
    pub customer: Option<Expandable<IdOnly>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub latest_charge: Option<Expandable<StripeCharge>>,
    #[serde(default)]
    pub next_action: Option<StripeNextAction>,
}

impl HasId for StripePaymentIntent {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct StripeNextAction {
    #[serde(default)]
    pub redirect_to_url: Option<StripeRedirect>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StripeRedirect {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StripeCharge {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub amount_refunded: i64,
    pub currency: String,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub refunds: Option<List<StripeRefund>>,
}

impl HasId for StripeCharge {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct StripeRefund {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub payment_intent: Option<String>,
    /// Creation time, used to pick the newest refund on a charge
    #[serde(default)]
    pub created: i64,
}

/// Map a PaymentIntent status to the canonical one
pub(crate) fn payment_status(raw: &str) -> PaymentResult<PaymentStatus> {
    match raw {
        "requires_payment_method" | "requires_confirmation" | "processing" => {
            Ok(PaymentStatus::Pending)
        }
        "requires_action" => Ok(PaymentStatus::RequiresAction),
        "requires_capture" => Ok(PaymentStatus::Authorized),
        "succeeded" => Ok(PaymentStatus::Captured),
        "canceled" => Ok(PaymentStatus::Canceled),
        other => Err(PaymentError::UnknownStatus {
            provider: STRIPE,
            status: other.to_string(),
        }),
    }
}

pub(crate) fn refund_status(raw: Option<&str>) -> PaymentResult<RefundStatus> {
    let raw = raw.ok_or_else(|| PaymentError::PayloadMalformed("refund has no status".into()))?;
    match raw {
        "pending" | "requires_action" => Ok(RefundStatus::Pending),
        "succeeded" => Ok(RefundStatus::Succeeded),
        "failed" => Ok(RefundStatus::Failed),
        "canceled" => Ok(RefundStatus::Canceled),
        other => Err(PaymentError::UnknownStatus {
            provider: STRIPE,
            status: other.to_string(),
        }),
    }
}

pub(crate) fn currency(raw: &str) -> PaymentResult<Currency> {
    Currency::new(raw).map_err(|_| {
        PaymentError::provider(STRIPE, format!("unrecognized currency {raw:?}"))
    })
}

impl StripePaymentIntent {
    pub(crate) fn into_snapshot(self) -> PaymentResult<PaymentSnapshot> {
        let currency = currency(&self.currency)?;
        let mut status = payment_status(&self.status)?;

        let amount_refunded = self
            .latest_charge
            .as_ref()
            .and_then(Expandable::object)
            .map(|charge| charge.amount_refunded);
        if let (PaymentStatus::Captured, Some(refunded)) = (status, amount_refunded) {
            if refunded > 0 {
                status = if refunded >= self.amount {
                    PaymentStatus::Refunded
                } else {
                    PaymentStatus::PartiallyRefunded
                };
            }
        }

        Ok(PaymentSnapshot {
            provider_payment_id: self.id,
            status,
            amount: from_minor_units(self.amount, &currency),
            amount_refunded: amount_refunded.map(|r| from_minor_units(r, &currency)),
            customer_reference: self.customer.as_ref().map(|c| c.id().to_string()),
            metadata: self.metadata,
            approval_url: self
                .next_action
                .and_then(|a| a.redirect_to_url)
                .and_then(|r| r.url),
            currency,
        })
    }

    pub(crate) fn into_capture_result(self) -> PaymentResult<CaptureResult> {
        let currency = currency(&self.currency)?;
        let capture_id = self
            .latest_charge
            .as_ref()
            .map(|charge| charge.id().to_string());
        Ok(CaptureResult {
            status: payment_status(&self.status)?,
            captured_amount: from_minor_units(
                self.amount_received.unwrap_or(self.amount),
                &currency,
            ),
            currency,
            capture_id,
        })
    }
}

impl StripeRefund {
    pub(crate) fn into_result(self) -> PaymentResult<RefundResult> {
        let currency = currency(&self.currency)?;
        Ok(RefundResult {
            status: refund_status(self.status.as_deref())?,
            amount: from_minor_units(self.amount, &currency),
            refund_id: self.id,
            currency,
        })
    }

    pub(crate) fn into_snapshot(self) -> PaymentResult<RefundSnapshot> {
        let payment_intent = self.payment_intent.clone().ok_or_else(|| {
            PaymentError::PayloadMalformed(format!("refund {} has no payment_intent", self.id))
        })?;
        let result = self.into_result()?;
        Ok(RefundSnapshot {
            provider_payment_id: payment_intent,
            refund_id: Some(result.refund_id),
            status: result.status,
            amount: result.amount,
            currency: result.currency,
            total_refunded: None,
        })
    }
}

impl StripeCharge {
    /// A `charge.refunded` payload: the newest refund plus the cumulative total
    pub(crate) fn into_refund_snapshot(self) -> PaymentResult<RefundSnapshot> {
        let payment_intent = self.payment_intent.ok_or_else(|| {
            PaymentError::PayloadMalformed(format!("charge {} has no payment_intent", self.id))
        })?;
        let currency = currency(&self.currency)?;
        let total = from_minor_units(self.amount_refunded, &currency);

        let latest = self
            .refunds
            .and_then(|list| list.data.into_iter().max_by_key(|r| r.created));

        Ok(match latest {
            Some(refund) => RefundSnapshot {
                provider_payment_id: payment_intent,
                status: refund_status(refund.status.as_deref())?,
                amount: from_minor_units(refund.amount, &currency),
                refund_id: Some(refund.id),
                currency,
                total_refunded: Some(total),
            },
            None => RefundSnapshot {
                provider_payment_id: payment_intent,
                refund_id: None,
                status: RefundStatus::Succeeded,
                amount: total,
                currency,
                total_refunded: Some(total),
            },
        })
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

#[derive(Debug, Deserialize)]
pub(crate) struct StripeSubscription {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub customer: Option<Expandable<IdOnly>>,
    #[serde(default)]
    pub items: Option<List<StripeSubscriptionItem>>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub latest_invoice: Option<Expandable<StripeInvoice>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StripeSubscriptionItem {
    pub price: StripePrice,
    /// Newer API versions report billing periods per item
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StripePrice {
    pub id: String,
    #[serde(default)]
    pub unit_amount: Option<i64>,
    pub currency: String,
    #[serde(default)]
    pub recurring: Option<StripeRecurring>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StripeRecurring {
    pub interval: String,
    #[serde(default)]
    pub interval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StripeInvoice {
    pub id: String,
    #[serde(default)]
    pub subscription: Option<Expandable<IdOnly>>,
    #[serde(default)]
    pub parent: Option<StripeInvoiceParent>,
    #[serde(default)]
    pub payment_intent: Option<Expandable<StripePaymentIntentSecret>>,
    #[serde(default)]
    pub lines: Option<List<StripeInvoiceLine>>,
}

impl HasId for StripeInvoice {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct StripeInvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<StripeSubscriptionDetails>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StripeSubscriptionDetails {
    #[serde(default)]
    pub subscription: Option<String>,
}

/// The slice of an expanded PaymentIntent a new subscription needs
#[derive(Debug, Deserialize)]
pub(crate) struct StripePaymentIntentSecret {
    pub id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl HasId for StripePaymentIntentSecret {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct StripeInvoiceLine {
    #[serde(default)]
    pub period: Option<StripePeriod>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StripePeriod {
    pub start: i64,
    pub end: i64,
}

pub(crate) fn subscription_status(raw: &str) -> PaymentResult<SubscriptionStatus> {
    match raw {
        "incomplete" => Ok(SubscriptionStatus::Incomplete),
        "incomplete_expired" => Ok(SubscriptionStatus::Expired),
        "trialing" => Ok(SubscriptionStatus::Trialing),
        "active" => Ok(SubscriptionStatus::Active),
        "past_due" | "unpaid" => Ok(SubscriptionStatus::PastDue),
        "paused" => Ok(SubscriptionStatus::Paused),
        "canceled" => Ok(SubscriptionStatus::Canceled),
        other => Err(PaymentError::UnknownStatus {
            provider: STRIPE,
            status: other.to_string(),
        }),
    }
}

pub(crate) fn timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

impl StripeSubscription {
    pub(crate) fn into_snapshot(self) -> PaymentResult<SubscriptionSnapshot> {
        let status = subscription_status(&self.status)?;
        let item = self.items.and_then(|items| items.data.into_iter().next());

        let (plan_id, amount, currency, interval, interval_count) = match &item {
            Some(item) => {
                let currency = currency(&item.price.currency)?;
                (
                    Some(item.price.id.clone()),
                    item.price
                        .unit_amount
                        .map(|a| from_minor_units(a, &currency)),
                    Some(currency),
                    item.price
                        .recurring
                        .as_ref()
                        .and_then(|r| BillingInterval::parse(&r.interval)),
                    item.price.recurring.as_ref().and_then(|r| r.interval_count),
                )
            }
            None => (None, None, None, None, None),
        };

        let period_start = self
            .current_period_start
            .or_else(|| item.as_ref().and_then(|i| i.current_period_start));
        let period_end = self
            .current_period_end
            .or_else(|| item.as_ref().and_then(|i| i.current_period_end));

        let client_secret = self
            .latest_invoice
            .as_ref()
            .and_then(Expandable::object)
            .and_then(|invoice| invoice.payment_intent.as_ref())
            .and_then(Expandable::object)
            .and_then(|intent| intent.client_secret.clone());

        Ok(SubscriptionSnapshot {
            provider_subscription_id: self.id,
            status: Some(status),
            plan_id,
            customer_reference: self.customer.as_ref().map(|c| c.id().to_string()),
            amount,
            currency,
            interval,
            interval_count,
            trial_end: timestamp(self.trial_end),
            current_period_start: timestamp(period_start),
            current_period_end: timestamp(period_end),
            canceled_at: timestamp(self.canceled_at),
            client_secret,
            approval_url: None,
            metadata: self.metadata,
        })
    }
}

impl StripeInvoice {
    /// An invoice event only knows which subscription it bills and the period
    pub(crate) fn into_subscription_snapshot(self) -> PaymentResult<SubscriptionSnapshot> {
        let subscription_id = self
            .subscription
            .as_ref()
            .map(|s| s.id().to_string())
            .or_else(|| {
                self.parent
                    .and_then(|p| p.subscription_details)
                    .and_then(|d| d.subscription)
            })
            .ok_or_else(|| {
                PaymentError::PayloadMalformed(format!(
                    "invoice {} is not tied to a subscription",
                    self.id
                ))
            })?;

        let period = self
            .lines
            .and_then(|lines| lines.data.into_iter().find_map(|line| line.period));

        Ok(SubscriptionSnapshot {
            provider_subscription_id: subscription_id,
            current_period_start: period.as_ref().and_then(|p| DateTime::from_timestamp(p.start, 0)),
            current_period_end: period.as_ref().and_then(|p| DateTime::from_timestamp(p.end, 0)),
            ..Default::default()
        })
    }
}

// =============================================================================
// Customers, errors, events
// =============================================================================

#[derive(Debug, Deserialize)]
pub(crate) struct StripeCustomer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl From<StripeCustomer> for Customer {
    fn from(customer: StripeCustomer) -> Self {
        Customer {
            id: customer.id,
            provider: STRIPE,
            email: customer.email,
            name: customer.name,
            metadata: customer.metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct StripeErrorResponse {
    pub error: StripeError,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StripeError {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, rename = "type")]
    pub error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: StripeEventData,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StripeEventData {
    pub object: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use serde_json::json;

    #[test]
    fn test_payment_status_mapping() {
        assert_eq!(payment_status("requires_action").unwrap(), PaymentStatus::RequiresAction);
        assert_eq!(payment_status("requires_capture").unwrap(), PaymentStatus::Authorized);
        assert_eq!(payment_status("succeeded").unwrap(), PaymentStatus::Captured);
        assert!(matches!(
            payment_status("teleported"),
            Err(PaymentError::UnknownStatus { .. })
        ));
    }

    #[test]
    fn test_subscription_status_mapping() {
        assert_eq!(subscription_status("unpaid").unwrap(), SubscriptionStatus::PastDue);
        assert_eq!(
            subscription_status("incomplete_expired").unwrap(),
            SubscriptionStatus::Expired
        );
        assert!(subscription_status("frozen").is_err());
    }

    #[test]
    fn test_intent_with_expanded_refunded_charge() {
        let intent: StripePaymentIntent = serde_json::from_value(json!({
            "id": "pi_1",
            "status": "succeeded",
            "amount": 4999,
            "currency": "usd",
            "customer": "cus_1",
            "latest_charge": { "id": "ch_1", "amount": 4999, "amount_refunded": 1000, "currency": "usd" }
        }))
        .unwrap();

        let snapshot = intent.into_snapshot().unwrap();
        assert_eq!(snapshot.status, PaymentStatus::PartiallyRefunded);
        assert_eq!(snapshot.amount, Decimal::new(4999, 2));
        assert_eq!(snapshot.amount_refunded, Some(Decimal::new(1000, 2)));
        assert_eq!(snapshot.customer_reference.as_deref(), Some("cus_1"));
        assert_eq!(snapshot.currency.code(), "USD");
    }

    #[test]
    fn test_zero_decimal_intent() {
        let intent: StripePaymentIntent = serde_json::from_value(json!({
            "id": "pi_jpy",
            "status": "requires_capture",
            "amount": 500,
            "currency": "jpy",
            "latest_charge": "ch_9"
        }))
        .unwrap();

        let snapshot = intent.into_snapshot().unwrap();
        assert_eq!(snapshot.amount, Decimal::from(500));
        assert_eq!(snapshot.status, PaymentStatus::Authorized);
        assert_eq!(snapshot.amount_refunded, None);
    }

    #[test]
    fn test_refund_without_status_is_malformed() {
        let refund: StripeRefund = serde_json::from_value(json!({
            "id": "re_1",
            "amount": 1000,
            "currency": "usd",
            "payment_intent": "pi_1",
            "created": 100
        }))
        .unwrap();
        assert!(matches!(
            refund.into_result(),
            Err(PaymentError::PayloadMalformed(_))
        ));
        assert!(matches!(
            refund_status(Some("reversed")),
            Err(PaymentError::UnknownStatus { .. })
        ));
    }

    #[test]
    fn test_charge_refunded_picks_newest_refund() {
        let charge: StripeCharge = serde_json::from_value(json!({
            "id": "ch_1",
            "amount": 5000,
            "amount_refunded": 1500,
            "currency": "usd",
            "payment_intent": "pi_1",
            "refunds": { "data": [
                { "id": "re_1", "amount": 1000, "currency": "usd", "status": "succeeded", "created": 100 },
                { "id": "re_2", "amount": 500, "currency": "usd", "status": "succeeded", "created": 200 }
            ]}
        }))
        .unwrap();

        let refund = charge.into_refund_snapshot().unwrap();
        assert_eq!(refund.provider_payment_id, "pi_1");
        assert_eq!(refund.refund_id.as_deref(), Some("re_2"));
        assert_eq!(refund.amount, Decimal::new(500, 2));
        assert_eq!(refund.total_refunded, Some(Decimal::new(1500, 2)));
    }

    #[test]
    fn test_subscription_with_expanded_invoice() {
        let sub: StripeSubscription = serde_json::from_value(json!({
            "id": "sub_1",
            "status": "incomplete",
            "customer": "cus_1",
            "items": { "data": [{
                "price": {
                    "id": "price_basic",
                    "unit_amount": 1500,
                    "currency": "eur",
                    "recurring": { "interval": "month", "interval_count": 1 }
                },
                "current_period_start": 1700000000,
                "current_period_end": 1702592000
            }]},
            "latest_invoice": {
                "id": "in_1",
                "payment_intent": { "id": "pi_1", "client_secret": "pi_1_secret_abc" }
            }
        }))
        .unwrap();

        let snapshot = sub.into_snapshot().unwrap();
        assert_eq!(snapshot.status, Some(SubscriptionStatus::Incomplete));
        assert_eq!(snapshot.plan_id.as_deref(), Some("price_basic"));
        assert_eq!(snapshot.amount, Some(Decimal::new(1500, 2)));
        assert_eq!(snapshot.interval, Some(BillingInterval::Month));
        assert_eq!(snapshot.client_secret.as_deref(), Some("pi_1_secret_abc"));
        assert!(snapshot.current_period_end > snapshot.current_period_start);
    }

    #[test]
    fn test_invoice_without_subscription_is_malformed() {
        let invoice: StripeInvoice =
            serde_json::from_value(json!({ "id": "in_1" })).unwrap();
        assert!(matches!(
            invoice.into_subscription_snapshot(),
            Err(PaymentError::PayloadMalformed(_))
        ));
    }
}
