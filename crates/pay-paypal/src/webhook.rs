//! # PayPal Webhook Handling
//!
//! PayPal signs webhooks with a certificate chain; rather than validating it
//! locally the provider forwards the transmission headers and the event to
//! `POST /v1/notifications/verify-webhook-signature` and trusts
//! `verification_status == "SUCCESS"`.

use crate::types::{
    PayPalEvent, PayPalOrder, PayPalPaymentObject, PayPalRefund, PayPalSale, PayPalSubscription,
    VerifySignatureBody,
};
use chrono::Utc;
use pay_core::{
    EventTableEntry, PaymentError, PaymentResult, ProviderName, ResourceKind, ResourceSnapshot,
    WebhookEffect, WebhookEvent, WebhookHeaders,
};
use serde_json::value::RawValue;

pub const TRANSMISSION_ID_HEADER: &str = "paypal-transmission-id";
pub const TRANSMISSION_TIME_HEADER: &str = "paypal-transmission-time";
pub const TRANSMISSION_SIG_HEADER: &str = "paypal-transmission-sig";
pub const CERT_URL_HEADER: &str = "paypal-cert-url";
pub const AUTH_ALGO_HEADER: &str = "paypal-auth-algo";

/// Event types to subscribe the PayPal webhook to, and what each means
pub const PAYPAL_EVENTS: &[EventTableEntry] = &[
    ("CHECKOUT.ORDER.APPROVED", WebhookEffect::PaymentAuthorized),
    ("PAYMENT.AUTHORIZATION.CREATED", WebhookEffect::PaymentAuthorized),
    ("PAYMENT.AUTHORIZATION.VOIDED", WebhookEffect::PaymentCanceled),
    ("PAYMENT.CAPTURE.COMPLETED", WebhookEffect::PaymentSucceeded),
    ("PAYMENT.CAPTURE.DENIED", WebhookEffect::PaymentFailed),
    ("PAYMENT.CAPTURE.DECLINED", WebhookEffect::PaymentFailed),
    ("PAYMENT.CAPTURE.REFUNDED", WebhookEffect::PaymentRefunded),
    ("BILLING.SUBSCRIPTION.ACTIVATED", WebhookEffect::SubscriptionActivated),
    ("BILLING.SUBSCRIPTION.UPDATED", WebhookEffect::SubscriptionUpdated),
    ("BILLING.SUBSCRIPTION.SUSPENDED", WebhookEffect::SubscriptionPaused),
    ("BILLING.SUBSCRIPTION.RE-ACTIVATED", WebhookEffect::SubscriptionResumed),
    ("BILLING.SUBSCRIPTION.CANCELLED", WebhookEffect::SubscriptionCanceled),
    ("BILLING.SUBSCRIPTION.EXPIRED", WebhookEffect::SubscriptionExpired),
    ("BILLING.SUBSCRIPTION.PAYMENT.FAILED", WebhookEffect::SubscriptionPastDue),
    ("PAYMENT.SALE.COMPLETED", WebhookEffect::SubscriptionPeriodRenewed),
];

/// Transmission headers PayPal attaches to every delivery
#[derive(Debug)]
pub(crate) struct Transmission<'a> {
    pub id: &'a str,
    pub time: &'a str,
    pub sig: &'a str,
    pub cert_url: &'a str,
    pub auth_algo: &'a str,
}

impl<'a> Transmission<'a> {
    pub fn from_headers(headers: &'a WebhookHeaders) -> PaymentResult<Self> {
        Ok(Self {
            id: headers.require(TRANSMISSION_ID_HEADER)?,
            time: headers.require(TRANSMISSION_TIME_HEADER)?,
            sig: headers.require(TRANSMISSION_SIG_HEADER)?,
            cert_url: headers.require(CERT_URL_HEADER)?,
            auth_algo: headers.require(AUTH_ALGO_HEADER)?,
        })
    }

    pub fn verification_body(
        &self,
        webhook_id: &'a str,
        event: &'a RawValue,
    ) -> VerifySignatureBody<'a> {
        VerifySignatureBody {
            auth_algo: self.auth_algo,
            cert_url: self.cert_url,
            transmission_id: self.id,
            transmission_sig: self.sig,
            transmission_time: self.time,
            webhook_id,
            webhook_event: event,
        }
    }
}

/// Check the payload is JSON without re-encoding it; the verify call forwards it verbatim
pub(crate) fn decode_payload(payload: &[u8]) -> PaymentResult<&RawValue> {
    serde_json::from_slice(payload)
        .map_err(|e| PaymentError::PayloadMalformed(format!("Failed to parse webhook: {e}")))
}

pub(crate) fn parse_event(event: &RawValue) -> PaymentResult<WebhookEvent> {
    let event: PayPalEvent = serde_json::from_str(event.get())
        .map_err(|e| PaymentError::PayloadMalformed(format!("Unexpected PayPal event: {e}")))?;

    Ok(WebhookEvent {
        occurred_at: event.create_time.unwrap_or_else(Utc::now),
        event_id: event.id,
        event_type: event.event_type,
        provider: ProviderName::PayPal,
        resource: event.resource,
    })
}

fn decode<T: serde::de::DeserializeOwned>(resource: &serde_json::Value) -> PaymentResult<T> {
    serde_json::from_value(resource.clone())
        .map_err(|e| PaymentError::PayloadMalformed(format!("Unexpected PayPal resource: {e}")))
}

/// Normalize a verified event's `resource` for the given kind
pub fn parse_resource(
    kind: ResourceKind,
    resource: &serde_json::Value,
) -> PaymentResult<ResourceSnapshot> {
    let has = |field: &str| resource.get(field).is_some();

    match kind {
        ResourceKind::Payment if has("purchase_units") || has("intent") => Ok(
            ResourceSnapshot::Payment(decode::<PayPalOrder>(resource)?.into_snapshot()?),
        ),
        ResourceKind::Payment => Ok(ResourceSnapshot::Payment(
            decode::<PayPalPaymentObject>(resource)?.into_snapshot()?,
        )),
        ResourceKind::Refund => Ok(ResourceSnapshot::Refund(
            decode::<PayPalRefund>(resource)?.into_snapshot()?,
        )),
        ResourceKind::Subscription if has("billing_agreement_id") => Ok(
            ResourceSnapshot::Subscription(decode::<PayPalSale>(resource)?.into_subscription_snapshot()?),
        ),
        ResourceKind::Subscription => Ok(ResourceSnapshot::Subscription(
            decode::<PayPalSubscription>(resource)?.into_snapshot(None)?,
        )),
    }
}
