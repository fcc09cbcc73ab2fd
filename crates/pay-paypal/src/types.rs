//! PayPal REST API wire types and their normalization into `pay_core` types.
//!
//! PayPal amounts are decimal strings (`"49.99"`, `"500"` for JPY) and
//! statuses are SCREAMING_CASE.

use chrono::{DateTime, Utc};
use pay_core::money::{parse_decimal_string, to_decimal_string, Currency};
use pay_core::{
    BillingInterval, CaptureResult, PaymentError, PaymentResult, PaymentSnapshot, PaymentStatus,
    ProviderName, RefundResult, RefundSnapshot, RefundStatus, SubscriptionSnapshot,
    SubscriptionStatus,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

const PAYPAL: ProviderName = ProviderName::PayPal;

// =============================================================================
// Shared
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PayPalMoney {
    pub currency_code: String,
    pub value: String,
}

impl PayPalMoney {
    pub fn from_decimal(amount: Decimal, currency: &Currency) -> Self {
        Self {
            currency_code: currency.code().to_string(),
            value: to_decimal_string(amount, currency),
        }
    }

    pub fn parse(&self) -> PaymentResult<(Decimal, Currency)> {
        let currency = Currency::new(&self.currency_code).map_err(|_| {
            PaymentError::provider(
                PAYPAL,
                format!("unrecognized currency {:?}", self.currency_code),
            )
        })?;
        let amount = parse_decimal_string(&self.value, &currency)?;
        Ok((amount, currency))
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct PayPalLink {
    pub href: String,
    pub rel: String,
}

fn approval_link(links: &[PayPalLink]) -> Option<String> {
    links
        .iter()
        .find(|l| l.rel == "approve" || l.rel == "payer-action")
        .map(|l| l.href.clone())
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SupplementaryData {
    #[serde(default)]
    pub related_ids: Option<RelatedIds>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RelatedIds {
    #[serde(default)]
    pub order_id: Option<String>,
}

fn related_order_id(data: &Option<SupplementaryData>) -> Option<String> {
    data.as_ref()
        .and_then(|d| d.related_ids.as_ref())
        .and_then(|r| r.order_id.clone())
}

#[derive(Debug, Deserialize)]
pub(crate) struct PayPalTokenResponse {
    pub access_token: String,
    pub expires_in: i64,
}

/// Error body returned by the REST API
#[derive(Debug, Deserialize)]
pub(crate) struct PayPalErrorResponse {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Vec<PayPalErrorDetail>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PayPalErrorDetail {
    #[serde(default)]
    pub issue: Option<String>,
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Debug, Serialize)]
pub(crate) struct CreateOrderBody {
    pub intent: &'static str,
    pub purchase_units: Vec<PurchaseUnitRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_context: Option<ApplicationContext>,
}

#[derive(Debug, Serialize)]
pub(crate) struct PurchaseUnitRequest {
    pub amount: PayPalMoney,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ApplicationContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_url: Option<String>,
}

impl ApplicationContext {
    pub fn from_urls(return_url: &Option<String>, cancel_url: &Option<String>) -> Option<Self> {
        if return_url.is_none() && cancel_url.is_none() {
            return None;
        }
        Some(Self {
            return_url: return_url.clone(),
            cancel_url: cancel_url.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct PayPalOrder {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub purchase_units: Vec<PurchaseUnit>,
    #[serde(default)]
    pub links: Vec<PayPalLink>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PurchaseUnit {
    #[serde(default)]
    pub amount: Option<PayPalMoney>,
    #[serde(default)]
    pub custom_id: Option<String>,
    #[serde(default)]
    pub payments: Option<PurchaseUnitPayments>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PurchaseUnitPayments {
    #[serde(default)]
    pub captures: Vec<PayPalPaymentObject>,
    #[serde(default)]
    pub authorizations: Vec<PayPalPaymentObject>,
    #[serde(default)]
    pub refunds: Vec<PayPalRefund>,
}

/// A capture or an authorization; both carry the order id in `supplementary_data`
#[derive(Debug, Deserialize)]
pub(crate) struct PayPalPaymentObject {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub amount: Option<PayPalMoney>,
    #[serde(default)]
    pub supplementary_data: Option<SupplementaryData>,
}

pub(crate) fn order_status(raw: &str) -> PaymentResult<PaymentStatus> {
    match raw {
        "CREATED" | "SAVED" | "PAYER_ACTION_REQUIRED" => Ok(PaymentStatus::RequiresAction),
        "APPROVED" => Ok(PaymentStatus::Authorized),
        "COMPLETED" => Ok(PaymentStatus::Captured),
        "VOIDED" => Ok(PaymentStatus::Canceled),
        other => Err(PaymentError::UnknownStatus {
            provider: PAYPAL,
            status: other.to_string(),
        }),
    }
}

/// Status of a capture or authorization object
pub(crate) fn payment_object_status(raw: &str) -> PaymentResult<PaymentStatus> {
    match raw {
        "PENDING" => Ok(PaymentStatus::Pending),
        "CREATED" => Ok(PaymentStatus::Authorized),
        "COMPLETED" | "CAPTURED" | "PARTIALLY_CAPTURED" => Ok(PaymentStatus::Captured),
        "PARTIALLY_REFUNDED" => Ok(PaymentStatus::PartiallyRefunded),
        "REFUNDED" => Ok(PaymentStatus::Refunded),
        "DECLINED" | "DENIED" | "FAILED" => Ok(PaymentStatus::Failed),
        "VOIDED" | "EXPIRED" => Ok(PaymentStatus::Canceled),
        other => Err(PaymentError::UnknownStatus {
            provider: PAYPAL,
            status: other.to_string(),
        }),
    }
}

pub(crate) fn refund_status(raw: &str) -> PaymentResult<RefundStatus> {
    match raw {
        "PENDING" => Ok(RefundStatus::Pending),
        "COMPLETED" => Ok(RefundStatus::Succeeded),
        "FAILED" => Ok(RefundStatus::Failed),
        "CANCELLED" => Ok(RefundStatus::Canceled),
        other => Err(PaymentError::UnknownStatus {
            provider: PAYPAL,
            status: other.to_string(),
        }),
    }
}

impl PayPalOrder {
    pub fn is_authorize_intent(&self) -> bool {
        self.intent.as_deref() == Some("AUTHORIZE")
    }

    fn payments(&self) -> impl DoubleEndedIterator<Item = &PurchaseUnitPayments> {
        self.purchase_units.iter().filter_map(|u| u.payments.as_ref())
    }

    /// The capture a refund should be issued against
    pub fn refundable_capture_id(&self) -> Option<&str> {
        let captures: Vec<_> = self.payments().flat_map(|p| p.captures.iter()).collect();
        captures
            .iter()
            .find(|c| c.status == "COMPLETED" || c.status == "PARTIALLY_REFUNDED")
            .or_else(|| captures.first())
            .map(|c| c.id.as_str())
    }

    /// Latest authorization not yet voided or expired
    pub fn open_authorization_id(&self) -> Option<&str> {
        self.payments()
            .flat_map(|p| p.authorizations.iter())
            .rev()
            .find(|a| a.status == "CREATED" || a.status == "PENDING")
            .map(|a| a.id.as_str())
    }

    fn completed_status(&self) -> PaymentResult<PaymentStatus> {
        if let Some(capture) = self.payments().flat_map(|p| p.captures.iter()).last() {
            return payment_object_status(&capture.status);
        }
        if let Some(auth) = self.payments().flat_map(|p| p.authorizations.iter()).last() {
            return payment_object_status(&auth.status);
        }
        Ok(PaymentStatus::Captured)
    }

    pub fn into_snapshot(self) -> PaymentResult<PaymentSnapshot> {
        let mut status = order_status(&self.status)?;
        if status == PaymentStatus::Captured {
            status = self.completed_status()?;
        }

        let unit = self.purchase_units.first().ok_or_else(|| {
            PaymentError::provider(PAYPAL, format!("order {} has no purchase units", self.id))
        })?;
        let (amount, currency) = unit
            .amount
            .as_ref()
            .or_else(|| {
                self.payments()
                    .flat_map(|p| p.captures.iter())
                    .find_map(|c| c.amount.as_ref())
            })
            .ok_or_else(|| {
                PaymentError::provider(PAYPAL, format!("order {} has no amount", self.id))
            })?
            .parse()?;

        let mut refunded = Decimal::ZERO;
        for refund in self.payments().flat_map(|p| p.refunds.iter()) {
            if refund.status == "COMPLETED" {
                if let Some(money) = &refund.amount {
                    refunded += money.parse()?.0;
                }
            }
        }

        Ok(PaymentSnapshot {
            approval_url: approval_link(&self.links),
            customer_reference: unit.custom_id.clone(),
            provider_payment_id: self.id,
            status,
            amount,
            currency,
            amount_refunded: (refunded > Decimal::ZERO).then_some(refunded),
            metadata: Default::default(),
        })
    }

    /// Capture result from the response of `POST /v2/checkout/orders/{id}/capture`
    pub fn into_capture_result(self) -> PaymentResult<CaptureResult> {
        let capture = self
            .purchase_units
            .into_iter()
            .filter_map(|u| u.payments)
            .flat_map(|p| p.captures)
            .last()
            .ok_or_else(|| {
                PaymentError::provider(PAYPAL, format!("order {} returned no capture", self.id))
            })?;
        capture.into_capture_result()
    }
}

impl PayPalPaymentObject {
    pub fn into_capture_result(self) -> PaymentResult<CaptureResult> {
        let (captured_amount, currency) = self
            .amount
            .as_ref()
            .ok_or_else(|| {
                PaymentError::provider(PAYPAL, format!("capture {} has no amount", self.id))
            })?
            .parse()?;
        Ok(CaptureResult {
            status: payment_object_status(&self.status)?,
            captured_amount,
            currency,
            capture_id: Some(self.id),
        })
    }

    /// A capture/authorization webhook resource, keyed by its order
    pub fn into_snapshot(self) -> PaymentResult<PaymentSnapshot> {
        let order_id = related_order_id(&self.supplementary_data).ok_or_else(|| {
            PaymentError::PayloadMalformed(format!(
                "payment object {} has no related order id",
                self.id
            ))
        })?;
        let (amount, currency) = self
            .amount
            .as_ref()
            .ok_or_else(|| {
                PaymentError::PayloadMalformed(format!("payment object {} has no amount", self.id))
            })?
            .parse()?;

        Ok(PaymentSnapshot {
            provider_payment_id: order_id,
            status: payment_object_status(&self.status)?,
            amount,
            currency,
            amount_refunded: None,
            customer_reference: None,
            metadata: Default::default(),
            approval_url: None,
        })
    }
}

// =============================================================================
// Refunds
// =============================================================================

#[derive(Debug, Serialize)]
pub(crate) struct RefundBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<PayPalMoney>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PayPalRefund {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub amount: Option<PayPalMoney>,
    #[serde(default)]
    pub seller_payable_breakdown: Option<SellerPayableBreakdown>,
    #[serde(default)]
    pub supplementary_data: Option<SupplementaryData>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SellerPayableBreakdown {
    #[serde(default)]
    pub total_refunded_amount: Option<PayPalMoney>,
}

impl PayPalRefund {
    pub fn into_result(self) -> PaymentResult<RefundResult> {
        let (amount, currency) = self
            .amount
            .as_ref()
            .ok_or_else(|| {
                PaymentError::provider(PAYPAL, format!("refund {} has no amount", self.id))
            })?
            .parse()?;
        Ok(RefundResult {
            status: refund_status(&self.status)?,
            refund_id: self.id,
            amount,
            currency,
        })
    }

    /// A `PAYMENT.CAPTURE.REFUNDED` resource
    pub fn into_snapshot(self) -> PaymentResult<RefundSnapshot> {
        let order_id = related_order_id(&self.supplementary_data).ok_or_else(|| {
            PaymentError::PayloadMalformed(format!("refund {} has no related order id", self.id))
        })?;
        let total_refunded = self
            .seller_payable_breakdown
            .as_ref()
            .and_then(|b| b.total_refunded_amount.as_ref())
            .map(|m| m.parse().map(|(amount, _)| amount))
            .transpose()?;

        let result = self.into_result()?;
        Ok(RefundSnapshot {
            provider_payment_id: order_id,
            refund_id: Some(result.refund_id),
            status: result.status,
            amount: result.amount,
            currency: result.currency,
            total_refunded,
        })
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

#[derive(Debug, Serialize)]
pub(crate) struct CreateSubscriptionBody {
    pub plan_id: String,
    pub custom_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_context: Option<ApplicationContext>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PayPalPlan {
    pub id: String,
    #[serde(default)]
    pub billing_cycles: Vec<BillingCycle>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BillingCycle {
    pub tenure_type: String,
    pub frequency: Frequency,
    #[serde(default)]
    pub pricing_scheme: Option<PricingScheme>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Frequency {
    pub interval_unit: String,
    #[serde(default)]
    pub interval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PricingScheme {
    #[serde(default)]
    pub fixed_price: Option<PayPalMoney>,
}

/// Price and cadence of a plan's regular billing cycle
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PlanTerms {
    pub amount: Option<Decimal>,
    pub currency: Option<Currency>,
    pub interval: Option<BillingInterval>,
    pub interval_count: Option<u32>,
}

impl PayPalPlan {
    pub fn regular_terms(&self) -> PaymentResult<PlanTerms> {
        let cycle = self
            .billing_cycles
            .iter()
            .find(|c| c.tenure_type == "REGULAR")
            .ok_or_else(|| {
                PaymentError::provider(PAYPAL, format!("plan {} has no regular cycle", self.id))
            })?;

        let price = cycle
            .pricing_scheme
            .as_ref()
            .and_then(|p| p.fixed_price.as_ref())
            .map(PayPalMoney::parse)
            .transpose()?;

        Ok(PlanTerms {
            amount: price.as_ref().map(|(amount, _)| *amount),
            currency: price.map(|(_, currency)| currency),
            interval: BillingInterval::parse(&cycle.frequency.interval_unit),
            interval_count: cycle.frequency.interval_count,
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct PayPalSubscription {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub custom_id: Option<String>,
    #[serde(default)]
    pub status_update_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub billing_info: Option<BillingInfo>,
    #[serde(default)]
    pub links: Vec<PayPalLink>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BillingInfo {
    #[serde(default)]
    pub next_billing_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_payment: Option<LastPayment>,
    #[serde(default)]
    pub cycle_executions: Vec<CycleExecution>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LastPayment {
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CycleExecution {
    pub tenure_type: String,
    #[serde(default)]
    pub cycles_remaining: Option<u32>,
}

pub(crate) fn subscription_status(raw: &str) -> PaymentResult<SubscriptionStatus> {
    match raw {
        "APPROVAL_PENDING" | "APPROVED" => Ok(SubscriptionStatus::Incomplete),
        "ACTIVE" => Ok(SubscriptionStatus::Active),
        "SUSPENDED" => Ok(SubscriptionStatus::Paused),
        "CANCELLED" => Ok(SubscriptionStatus::Canceled),
        "EXPIRED" => Ok(SubscriptionStatus::Expired),
        other => Err(PaymentError::UnknownStatus {
            provider: PAYPAL,
            status: other.to_string(),
        }),
    }
}

impl PayPalSubscription {
    fn in_trial(&self) -> bool {
        self.billing_info.as_ref().is_some_and(|info| {
            info.cycle_executions
                .iter()
                .any(|c| c.tenure_type == "TRIAL" && c.cycles_remaining.unwrap_or(0) > 0)
        })
    }

    pub fn into_snapshot(self, terms: Option<PlanTerms>) -> PaymentResult<SubscriptionSnapshot> {
        let mut status = subscription_status(&self.status)?;
        if status == SubscriptionStatus::Active && self.in_trial() {
            status = SubscriptionStatus::Trialing;
        }

        let canceled_at = match status {
            SubscriptionStatus::Canceled => self.status_update_time,
            _ => None,
        };
        let (period_start, period_end) = self
            .billing_info
            .as_ref()
            .map(|info| {
                (
                    info.last_payment.as_ref().and_then(|p| p.time),
                    info.next_billing_time,
                )
            })
            .unwrap_or_default();
        let trial_end = if status == SubscriptionStatus::Trialing {
            period_end
        } else {
            None
        };
        let terms = terms.unwrap_or(PlanTerms {
            amount: None,
            currency: None,
            interval: None,
            interval_count: None,
        });

        Ok(SubscriptionSnapshot {
            approval_url: approval_link(&self.links),
            provider_subscription_id: self.id,
            status: Some(status),
            plan_id: self.plan_id,
            customer_reference: self.custom_id,
            amount: terms.amount,
            currency: terms.currency,
            interval: terms.interval,
            interval_count: terms.interval_count,
            trial_end,
            current_period_start: period_start,
            current_period_end: period_end,
            canceled_at,
            client_secret: None,
            metadata: Default::default(),
        })
    }
}

/// A `PAYMENT.SALE.COMPLETED` resource: one recurring charge of a subscription
#[derive(Debug, Deserialize)]
pub(crate) struct PayPalSale {
    pub id: String,
    #[serde(default)]
    pub billing_agreement_id: Option<String>,
    #[serde(default)]
    pub create_time: Option<DateTime<Utc>>,
}

impl PayPalSale {
    pub fn into_subscription_snapshot(self) -> PaymentResult<SubscriptionSnapshot> {
        let subscription_id = self.billing_agreement_id.ok_or_else(|| {
            PaymentError::PayloadMalformed(format!(
                "sale {} is not tied to a subscription",
                self.id
            ))
        })?;
        Ok(SubscriptionSnapshot {
            provider_subscription_id: subscription_id,
            current_period_start: self.create_time,
            ..Default::default()
        })
    }
}

// =============================================================================
// Webhooks
// =============================================================================

#[derive(Debug, Deserialize)]
pub(crate) struct PayPalEvent {
    pub id: String,
    pub event_type: String,
    #[serde(default)]
    pub create_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resource: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub(crate) struct VerifySignatureBody<'a> {
    pub auth_algo: &'a str,
    pub cert_url: &'a str,
    pub transmission_id: &'a str,
    pub transmission_sig: &'a str,
    pub transmission_time: &'a str,
    pub webhook_id: &'a str,
    /// The delivery exactly as received; PayPal signed these bytes
    pub webhook_event: &'a RawValue,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VerifySignatureResponse {
    pub verification_status: String,
}
