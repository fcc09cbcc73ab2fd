//! # Subscription Types
//!
//! Recurring billing agreements: status machine, ledger record and the
//! normalized snapshot providers return.

use crate::error::{PaymentError, PaymentResult};
use crate::money::Currency;
use crate::provider::ProviderName;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Canonical subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Trialing,
    Active,
    PastDue,
    Paused,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    /// Whether the ledger may move a subscription from `self` to `next`.
    pub fn can_transition_to(self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;

        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (Incomplete, Trialing | Active | Canceled | Expired)
                | (Trialing, Active | PastDue | Canceled)
                | (Active, PastDue | Paused | Canceled)
                | (PastDue, Active | Canceled | Expired)
                | (Paused, Active | Canceled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SubscriptionStatus::Canceled | SubscriptionStatus::Expired)
    }

    /// Counts as a live, billable subscription
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trialing | SubscriptionStatus::Active | SubscriptionStatus::PastDue
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing interval unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Day,
    Week,
    Month,
    Year,
}

impl BillingInterval {
    /// Parse the unit names both providers use (`month`, `MONTH`)
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "day" => Some(BillingInterval::Day),
            "week" => Some(BillingInterval::Week),
            "month" => Some(BillingInterval::Month),
            "year" => Some(BillingInterval::Year),
            _ => None,
        }
    }
}

/// Normalized view of a subscription as reported by a provider.
///
/// Webhook resources often carry only part of the picture (an invoice knows
/// the billing period but not the plan), so most fields are optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub provider_subscription_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SubscriptionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<Currency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<BillingInterval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_period_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canceled_at: Option<DateTime<Utc>>,
    /// Client secret of the first invoice's payment, for additional authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// A recurring billing agreement, as stored in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub provider: ProviderName,
    pub provider_subscription_id: String,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<Currency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<BillingInterval>,
    pub interval_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_period_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canceled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_url: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    /// Build a fresh ledger row from a creation response.
    ///
    /// `plan_id` falls back to the requested plan when the provider omits it.
    pub fn from_snapshot(
        provider: ProviderName,
        requested_plan: &str,
        snapshot: SubscriptionSnapshot,
    ) -> PaymentResult<Self> {
        let status = snapshot.status.ok_or_else(|| {
            PaymentError::provider(
                provider,
                format!(
                    "subscription {} returned without a status",
                    snapshot.provider_subscription_id
                ),
            )
        })?;
        let now = Utc::now();
        let record = Self {
            id: Uuid::new_v4(),
            provider,
            provider_subscription_id: snapshot.provider_subscription_id,
            plan_id: snapshot
                .plan_id
                .unwrap_or_else(|| requested_plan.to_string()),
            status,
            customer_reference: snapshot.customer_reference,
            amount: snapshot.amount,
            currency: snapshot.currency,
            interval: snapshot.interval,
            interval_count: snapshot.interval_count.unwrap_or(1),
            trial_end: snapshot.trial_end,
            current_period_start: snapshot.current_period_start,
            current_period_end: snapshot.current_period_end,
            canceled_at: snapshot.canceled_at,
            client_secret: snapshot.client_secret,
            approval_url: snapshot.approval_url,
            metadata: snapshot.metadata,
            created_at: now,
            updated_at: now,
        };
        record.validate()?;
        Ok(record)
    }

    /// Check the record-level invariants
    pub fn validate(&self) -> PaymentResult<()> {
        if self.canceled_at.is_some() && !self.status.is_terminal() {
            return Err(PaymentError::LedgerConflict(format!(
                "{}:{} has canceled_at but status {}",
                self.provider, self.provider_subscription_id, self.status
            )));
        }
        if let (Some(start), Some(end)) = (self.current_period_start, self.current_period_end) {
            if end < start {
                return Err(PaymentError::LedgerConflict(format!(
                    "{}:{} period ends ({end}) before it starts ({start})",
                    self.provider, self.provider_subscription_id
                )));
            }
        }
        Ok(())
    }

    /// Fold the fields a provider snapshot carries into this row.
    ///
    /// The status is left alone; callers decide it through the state machine.
    pub fn absorb(&mut self, snapshot: &SubscriptionSnapshot) {
        if let Some(plan) = &snapshot.plan_id {
            self.plan_id = plan.clone();
        }
        if snapshot.customer_reference.is_some() {
            self.customer_reference = snapshot.customer_reference.clone();
        }
        if snapshot.amount.is_some() {
            self.amount = snapshot.amount;
        }
        if snapshot.currency.is_some() {
            self.currency = snapshot.currency.clone();
        }
        if snapshot.interval.is_some() {
            self.interval = snapshot.interval;
        }
        if let Some(count) = snapshot.interval_count {
            self.interval_count = count;
        }
        if snapshot.trial_end.is_some() {
            self.trial_end = snapshot.trial_end;
        }
        if snapshot.current_period_start.is_some() {
            self.current_period_start = snapshot.current_period_start;
        }
        if snapshot.current_period_end.is_some() {
            self.current_period_end = snapshot.current_period_end;
        }
        if snapshot.canceled_at.is_some() {
            self.canceled_at = snapshot.canceled_at;
        }
        self.metadata.extend(
            snapshot
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }

    /// Merge a newer view of the same subscription into this row.
    pub fn merge_from(&mut self, incoming: &SubscriptionRecord) -> PaymentResult<()> {
        if incoming.provider != self.provider
            || incoming.provider_subscription_id != self.provider_subscription_id
        {
            return Err(PaymentError::LedgerConflict(format!(
                "cannot merge {}:{} into {}:{}",
                incoming.provider,
                incoming.provider_subscription_id,
                self.provider,
                self.provider_subscription_id
            )));
        }

        let mut merged = self.clone();
        if self.status.can_transition_to(incoming.status) {
            merged.status = incoming.status;
        } else {
            tracing::debug!(
                key = %format!("{}:{}", self.provider, self.provider_subscription_id),
                from = %self.status,
                to = %incoming.status,
                "Ignoring status regression during merge"
            );
        }
        merged.plan_id = incoming.plan_id.clone();
        merged.customer_reference = incoming
            .customer_reference
            .clone()
            .or(merged.customer_reference);
        merged.amount = incoming.amount.or(merged.amount);
        merged.currency = incoming.currency.clone().or(merged.currency);
        merged.interval = incoming.interval.or(merged.interval);
        merged.interval_count = incoming.interval_count;
        merged.trial_end = incoming.trial_end.or(merged.trial_end);
        merged.current_period_start = incoming.current_period_start.or(merged.current_period_start);
        merged.current_period_end = incoming.current_period_end.or(merged.current_period_end);
        merged.canceled_at = incoming.canceled_at.or(merged.canceled_at);
        merged.client_secret = incoming.client_secret.clone().or(merged.client_secret);
        merged.approval_url = incoming.approval_url.clone().or(merged.approval_url);
        merged.metadata.extend(
            incoming
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        merged.updated_at = Utc::now();

        merged.validate()?;
        *self = merged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn created(status: SubscriptionStatus) -> SubscriptionRecord {
        SubscriptionRecord::from_snapshot(
            ProviderName::Stripe,
            "price_basic",
            SubscriptionSnapshot {
                provider_subscription_id: "sub_1".into(),
                status: Some(status),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_subscription_transitions() {
        use SubscriptionStatus::*;
        assert!(Incomplete.can_transition_to(Active));
        assert!(Incomplete.can_transition_to(Trialing));
        assert!(Active.can_transition_to(PastDue));
        assert!(PastDue.can_transition_to(Active));
        assert!(PastDue.can_transition_to(Expired));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(!Paused.can_transition_to(PastDue));
        assert!(Paused.can_transition_to(Canceled));
        assert!(!Paused.can_transition_to(Trialing));
        assert!(!Canceled.can_transition_to(Active));
        assert!(!Expired.can_transition_to(Active));
    }

    #[test]
    fn test_plan_falls_back_to_request() {
        let record = created(SubscriptionStatus::Incomplete);
        assert_eq!(record.plan_id, "price_basic");
        assert_eq!(record.interval_count, 1);
    }

    #[test]
    fn test_missing_status_is_rejected() {
        let result = SubscriptionRecord::from_snapshot(
            ProviderName::PayPal,
            "P-1",
            SubscriptionSnapshot {
                provider_subscription_id: "I-1".into(),
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_canceled_at_requires_terminal_status() {
        let mut record = created(SubscriptionStatus::Active);
        record.canceled_at = Some(Utc::now());
        assert!(matches!(
            record.validate(),
            Err(PaymentError::LedgerConflict(_))
        ));
        record.status = SubscriptionStatus::Canceled;
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_period_order_is_enforced() {
        let mut row = created(SubscriptionStatus::Active);
        let mut incoming = row.clone();
        let now = Utc::now();
        incoming.current_period_start = Some(now);
        incoming.current_period_end = Some(now - Duration::days(1));

        assert!(row.merge_from(&incoming).is_err());
        assert!(row.current_period_start.is_none());
    }

    #[test]
    fn test_absorb_keeps_status() {
        let mut row = created(SubscriptionStatus::Active);
        let start = Utc::now();
        row.absorb(&SubscriptionSnapshot {
            provider_subscription_id: "sub_1".into(),
            status: Some(SubscriptionStatus::Canceled),
            current_period_start: Some(start),
            current_period_end: Some(start + Duration::days(30)),
            ..Default::default()
        });
        assert_eq!(row.status, SubscriptionStatus::Active);
        assert_eq!(row.current_period_start, Some(start));
    }
}
