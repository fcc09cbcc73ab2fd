//! # Stripe Webhook Handling
//!
//! Signature verification over the raw request body, the table of event
//! types the engine acts on, and normalization of `data.object`.
//!
//! Stripe signs `"{t}.{raw body}"` with HMAC-SHA256 and sends
//! `Stripe-Signature: t=<unix>,v1=<hex>[,v1=<hex>...]`. More than one `v1`
//! appears while a signing secret is being rolled.

use crate::types::{StripeCharge, StripeEvent, StripeInvoice, StripePaymentIntent, StripeRefund, StripeSubscription};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use pay_core::{
    EventTableEntry, PaymentError, PaymentResult, ProviderName, ResourceKind, ResourceSnapshot,
    WebhookEffect, WebhookEvent,
};
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Event types to enable on the Stripe webhook endpoint, and what each means
pub const STRIPE_EVENTS: &[EventTableEntry] = &[
    ("payment_intent.succeeded", WebhookEffect::PaymentSucceeded),
    ("payment_intent.payment_failed", WebhookEffect::PaymentFailed),
    ("payment_intent.canceled", WebhookEffect::PaymentCanceled),
    ("payment_intent.requires_action", WebhookEffect::PaymentRequiresAction),
    ("payment_intent.amount_capturable_updated", WebhookEffect::PaymentAuthorized),
    ("charge.refunded", WebhookEffect::PaymentRefunded),
    ("customer.subscription.created", WebhookEffect::SubscriptionUpdated),
    ("customer.subscription.updated", WebhookEffect::SubscriptionUpdated),
    ("customer.subscription.paused", WebhookEffect::SubscriptionPaused),
    ("customer.subscription.resumed", WebhookEffect::SubscriptionResumed),
    ("customer.subscription.deleted", WebhookEffect::SubscriptionCanceled),
    ("invoice.paid", WebhookEffect::SubscriptionPeriodRenewed),
    ("invoice.payment_failed", WebhookEffect::SubscriptionPastDue),
];

// =============================================================================
// Signature Verification
// =============================================================================

#[derive(Debug)]
struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<String>,
}

fn parse_signature_header(header: &str) -> PaymentResult<SignatureHeader> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => {
                timestamp = value.parse().ok();
            }
            "v1" => {
                signatures.push(value.to_string());
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        PaymentError::SignatureInvalid("Missing timestamp in signature".to_string())
    })?;

    if signatures.is_empty() {
        return Err(PaymentError::SignatureInvalid(
            "No v1 signature found".to_string(),
        ));
    }

    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

/// HMAC-SHA256 of `"{timestamp}." ++ payload`, hex encoded
pub(crate) fn compute_signature(secret: &[u8], timestamp: i64, payload: &[u8]) -> PaymentResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| PaymentError::Configuration(format!("invalid webhook secret: {e}")))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Check a `Stripe-Signature` header against the raw payload at time `now`.
///
/// Rejects timestamps more than `tolerance_secs` away from `now` in either
/// direction, then accepts if any `v1` signature matches.
pub fn verify_signature(
    secret: &[u8],
    payload: &[u8],
    header: &str,
    tolerance_secs: i64,
    now: DateTime<Utc>,
) -> PaymentResult<()> {
    let parsed = parse_signature_header(header)?;

    if (now.timestamp() - parsed.timestamp).abs() > tolerance_secs {
        return Err(PaymentError::SignatureInvalid(
            "Timestamp outside tolerance".to_string(),
        ));
    }

    let expected = compute_signature(secret, parsed.timestamp, payload)?;
    let valid = parsed
        .signatures
        .iter()
        .any(|sig| constant_time_compare(sig, &expected));

    if !valid {
        return Err(PaymentError::SignatureInvalid(
            "Signature mismatch".to_string(),
        ));
    }
    Ok(())
}

/// Parse a verified payload into the canonical envelope
pub fn parse_event(payload: &[u8]) -> PaymentResult<WebhookEvent> {
    let event: StripeEvent = serde_json::from_slice(payload).map_err(|e| {
        PaymentError::PayloadMalformed(format!("Failed to parse webhook: {e}"))
    })?;

    debug!("Verified Stripe webhook: type={}", event.event_type);

    Ok(WebhookEvent {
        occurred_at: DateTime::from_timestamp(event.created, 0).unwrap_or_else(Utc::now),
        event_id: event.id,
        event_type: event.event_type,
        provider: ProviderName::Stripe,
        resource: event.data.object,
    })
}

// =============================================================================
// Resource Normalization
// =============================================================================

fn decode<T: serde::de::DeserializeOwned>(resource: &serde_json::Value) -> PaymentResult<T> {
    serde_json::from_value(resource.clone())
        .map_err(|e| PaymentError::PayloadMalformed(format!("Unexpected Stripe object: {e}")))
}

fn object_kind(resource: &serde_json::Value) -> &str {
    resource
        .get("object")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
}

/// Normalize a webhook `data.object` for the given resource kind
pub fn parse_resource(
    kind: ResourceKind,
    resource: &serde_json::Value,
) -> PaymentResult<ResourceSnapshot> {
    match (kind, object_kind(resource)) {
        (ResourceKind::Payment, _) => Ok(ResourceSnapshot::Payment(
            decode::<StripePaymentIntent>(resource)?.into_snapshot()?,
        )),
        (ResourceKind::Refund, "refund") => Ok(ResourceSnapshot::Refund(
            decode::<StripeRefund>(resource)?.into_snapshot()?,
        )),
        (ResourceKind::Refund, _) => Ok(ResourceSnapshot::Refund(
            decode::<StripeCharge>(resource)?.into_refund_snapshot()?,
        )),
        (ResourceKind::Subscription, "invoice") => Ok(ResourceSnapshot::Subscription(
            decode::<StripeInvoice>(resource)?.into_subscription_snapshot()?,
        )),
        (ResourceKind::Subscription, _) => Ok(ResourceSnapshot::Subscription(
            decode::<StripeSubscription>(resource)?.into_snapshot()?,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pay_core::{EventTable, PaymentStatus, SubscriptionStatus};
    use rust_decimal::Decimal;
    use serde_json::json;

    const SECRET: &[u8] = b"whsec_test";

    fn sign(payload: &[u8], at: DateTime<Utc>) -> String {
        let sig = compute_signature(SECRET, at.timestamp(), payload).unwrap();
        format!("t={},v1={}", at.timestamp(), sig)
    }

    #[test]
    fn test_parse_signature_header() {
        let header = "t=1234567890,v1=abc123,v1=def456,v0=legacy";
        let parsed = parse_signature_header(header).unwrap();

        assert_eq!(parsed.timestamp, 1234567890);
        assert_eq!(parsed.signatures, vec!["abc123", "def456"]);
    }

    #[test]
    fn test_header_without_signature_is_rejected() {
        assert!(matches!(
            parse_signature_header("t=1234567890"),
            Err(PaymentError::SignatureInvalid(_))
        ));
        assert!(parse_signature_header("v1=abc").is_err());
    }

    #[test]
    fn test_valid_signature() {
        let payload = br#"{"id":"evt_1","type":"charge.refunded"}"#;
        let now = Utc::now();
        assert!(verify_signature(SECRET, payload, &sign(payload, now), 300, now).is_ok());
    }

    #[test]
    fn test_any_v1_may_match() {
        let payload = br#"{"id":"evt_1"}"#;
        let now = Utc::now();
        let good = compute_signature(SECRET, now.timestamp(), payload).unwrap();
        let header = format!("t={},v1={},v1={}", now.timestamp(), "0".repeat(64), good);
        assert!(verify_signature(SECRET, payload, &header, 300, now).is_ok());
    }

    #[test]
    fn test_stale_and_future_timestamps_are_rejected() {
        let payload = br#"{"id":"evt_1"}"#;
        let now = Utc::now();

        let old = sign(payload, now - Duration::seconds(301));
        assert!(verify_signature(SECRET, payload, &old, 300, now).is_err());

        let future = sign(payload, now + Duration::seconds(301));
        assert!(verify_signature(SECRET, payload, &future, 300, now).is_err());

        let edge = sign(payload, now - Duration::seconds(300));
        assert!(verify_signature(SECRET, payload, &edge, 300, now).is_ok());
    }

    #[test]
    fn test_reserialized_body_fails() {
        // whitespace differs from what was signed
        let signed_body = br#"{"id": "evt_1", "type": "charge.refunded"}"#;
        let reserialized = br#"{"id":"evt_1","type":"charge.refunded"}"#;
        let now = Utc::now();
        let header = sign(signed_body, now);

        assert!(matches!(
            verify_signature(SECRET, reserialized, &header, 300, now),
            Err(PaymentError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc123", "abc123"));
        assert!(!constant_time_compare("abc123", "abc124"));
        assert!(!constant_time_compare("abc", "abcd"));
    }

    #[test]
    fn test_event_table_is_valid() {
        let table = EventTable::from_entries(ProviderName::Stripe, STRIPE_EVENTS).unwrap();
        assert_eq!(
            table.lookup("invoice.paid"),
            Some(WebhookEffect::SubscriptionPeriodRenewed)
        );
        assert_eq!(table.lookup("checkout.session.completed"), None);
    }

    #[test]
    fn test_parse_event_envelope() {
        let payload = serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "created": 1700000000,
            "data": { "object": { "id": "pi_1", "object": "payment_intent" } }
        }))
        .unwrap();

        let event = parse_event(&payload).unwrap();
        assert_eq!(event.event_id, "evt_1");
        assert_eq!(event.provider, ProviderName::Stripe);
        assert_eq!(event.occurred_at.timestamp(), 1700000000);
        assert_eq!(event.resource["id"], "pi_1");
    }

    #[test]
    fn test_parse_event_rejects_garbage() {
        assert!(matches!(
            parse_event(b"not json"),
            Err(PaymentError::PayloadMalformed(_))
        ));
    }

    #[test]
    fn test_parse_payment_resource() {
        let resource = json!({
            "id": "pi_1",
            "object": "payment_intent",
            "status": "succeeded",
            "amount": 4999,
            "currency": "usd"
        });
        let ResourceSnapshot::Payment(payment) =
            parse_resource(ResourceKind::Payment, &resource).unwrap()
        else {
            panic!("expected a payment");
        };
        assert_eq!(payment.status, PaymentStatus::Captured);
        assert_eq!(payment.amount, Decimal::new(4999, 2));
    }

    #[test]
    fn test_unknown_status_fails_loudly() {
        let resource = json!({
            "id": "pi_1",
            "object": "payment_intent",
            "status": "mystery",
            "amount": 100,
            "currency": "usd"
        });
        assert!(matches!(
            parse_resource(ResourceKind::Payment, &resource),
            Err(PaymentError::UnknownStatus { .. })
        ));
    }

    #[test]
    fn test_parse_charge_refund_without_list() {
        let resource = json!({
            "id": "ch_1",
            "object": "charge",
            "amount": 5000,
            "amount_refunded": 1000,
            "currency": "usd",
            "payment_intent": "pi_1"
        });
        let ResourceSnapshot::Refund(refund) =
            parse_resource(ResourceKind::Refund, &resource).unwrap()
        else {
            panic!("expected a refund");
        };
        assert_eq!(refund.refund_id, None);
        assert_eq!(refund.total_refunded, Some(Decimal::new(1000, 2)));
    }

    #[test]
    fn test_parse_invoice_as_subscription() {
        let resource = json!({
            "id": "in_1",
            "object": "invoice",
            "subscription": "sub_1",
            "lines": { "data": [{ "period": { "start": 1700000000, "end": 1702592000 } }] }
        });
        let snapshot = parse_resource(ResourceKind::Subscription, &resource).unwrap();
        assert_eq!(snapshot.external_id(), "sub_1");
    }

    #[test]
    fn test_parse_deleted_subscription() {
        let resource = json!({
            "id": "sub_1",
            "object": "subscription",
            "status": "canceled",
            "canceled_at": 1700000000
        });
        let ResourceSnapshot::Subscription(sub) =
            parse_resource(ResourceKind::Subscription, &resource).unwrap()
        else {
            panic!("expected a subscription");
        };
        assert_eq!(sub.status, Some(SubscriptionStatus::Canceled));
        assert!(sub.canceled_at.is_some());
    }
}
