//! # Payment Types
//!
//! Canonical payment status machine, the ledger's `PaymentRecord`, and the
//! normalized shapes provider clients return.

use crate::error::{PaymentError, PaymentResult};
use crate::money::Currency;
use crate::provider::ProviderName;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Canonical payment status shared by every provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    RequiresAction,
    Authorized,
    Captured,
    PartiallyRefunded,
    Refunded,
    Failed,
    Canceled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::RequiresAction => "requires_action",
            PaymentStatus::Authorized => "authorized",
            PaymentStatus::Captured => "captured",
            PaymentStatus::PartiallyRefunded => "partially_refunded",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Canceled => "canceled",
        }
    }

    /// Whether the ledger may move a payment from `self` to `next`.
    ///
    /// Once money has been captured the only way forward is a refund.
    /// `failed` may still become `captured` when a retried attempt succeeds.
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;

        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (Pending, RequiresAction | Authorized | Captured | Failed | Canceled)
                | (RequiresAction, Pending | Authorized | Captured | Failed | Canceled)
                | (Authorized, Captured | Failed | Canceled)
                | (Captured, PartiallyRefunded | Refunded)
                | (PartiallyRefunded, Refunded)
                | (Failed, Captured)
        )
    }

    /// A capture call makes sense from here
    pub fn is_capturable(self) -> bool {
        matches!(
            self,
            PaymentStatus::Pending | PaymentStatus::RequiresAction | PaymentStatus::Authorized
        )
    }

    /// Money has settled and some of it can still be returned
    pub fn is_refundable(self) -> bool {
        matches!(self, PaymentStatus::Captured | PaymentStatus::PartiallyRefunded)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PaymentStatus::Refunded | PaymentStatus::Failed | PaymentStatus::Canceled
        )
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single refund at the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Succeeded,
    Failed,
    Canceled,
}

impl RefundStatus {
    /// Whether the refunded money should count against the payment
    pub fn counts_against_payment(self) -> bool {
        matches!(self, RefundStatus::Pending | RefundStatus::Succeeded)
    }
}

/// Normalized view of a payment as reported by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSnapshot {
    pub provider_payment_id: String,
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub currency: Currency,
    /// Cumulative refunded amount, when the provider reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_refunded: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_reference: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Where the payer must go to approve (redirect-style providers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_url: Option<String>,
}

/// Result of a capture call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureResult {
    pub status: PaymentStatus,
    pub captured_amount: Decimal,
    pub currency: Currency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_id: Option<String>,
}

/// Result of a refund call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundResult {
    pub refund_id: String,
    pub status: RefundStatus,
    pub amount: Decimal,
    pub currency: Currency,
}

/// One attempted or completed charge, as stored in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub provider: ProviderName,
    pub provider_payment_id: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: PaymentStatus,
    pub refunded_amount: Decimal,
    /// Provider refund ids already counted in `refunded_amount`
    #[serde(default)]
    pub refund_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_reference: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRecord {
    /// Build a fresh ledger row from what the provider returned on creation
    pub fn from_snapshot(provider: ProviderName, snapshot: PaymentSnapshot) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            provider,
            provider_payment_id: snapshot.provider_payment_id,
            amount: snapshot.amount,
            currency: snapshot.currency,
            status: snapshot.status,
            refunded_amount: snapshot.amount_refunded.unwrap_or(Decimal::ZERO),
            refund_ids: BTreeSet::new(),
            customer_reference: snapshot.customer_reference,
            metadata: snapshot.metadata,
            approval_url: snapshot.approval_url,
            created_at: now,
            updated_at: now,
        }
    }

    /// Amount that can still be refunded
    pub fn remaining_refundable(&self) -> Decimal {
        self.amount - self.refunded_amount
    }

    /// Check the record-level invariants
    pub fn validate(&self) -> PaymentResult<()> {
        if self.refunded_amount < Decimal::ZERO {
            return Err(PaymentError::LedgerConflict(format!(
                "{}:{} refunded amount is negative",
                self.provider, self.provider_payment_id
            )));
        }
        if self.refunded_amount > self.amount {
            return Err(PaymentError::LedgerConflict(format!(
                "{}:{} refunded {} exceeds amount {}",
                self.provider, self.provider_payment_id, self.refunded_amount, self.amount
            )));
        }
        Ok(())
    }

    /// Merge a newer view of the same payment into this row.
    ///
    /// Identity (`id`, external key, `created_at`) never changes. Statuses only
    /// move along allowed transitions, and `refunded_amount` never decreases.
    pub fn merge_from(&mut self, incoming: &PaymentRecord) -> PaymentResult<()> {
        if incoming.provider != self.provider
            || incoming.provider_payment_id != self.provider_payment_id
        {
            return Err(PaymentError::LedgerConflict(format!(
                "cannot merge {}:{} into {}:{}",
                incoming.provider,
                incoming.provider_payment_id,
                self.provider,
                self.provider_payment_id
            )));
        }
        if incoming.currency != self.currency {
            return Err(PaymentError::LedgerConflict(format!(
                "{}:{} currency changed from {} to {}",
                self.provider, self.provider_payment_id, self.currency, incoming.currency
            )));
        }

        let mut merged = self.clone();
        if self.status.can_transition_to(incoming.status) {
            merged.status = incoming.status;
        } else {
            tracing::debug!(
                key = %format!("{}:{}", self.provider, self.provider_payment_id),
                from = %self.status,
                to = %incoming.status,
                "Ignoring status regression during merge"
            );
        }
        merged.amount = incoming.amount;
        merged.refunded_amount = self.refunded_amount.max(incoming.refunded_amount);
        merged
            .refund_ids
            .extend(incoming.refund_ids.iter().cloned());
        if incoming.customer_reference.is_some() {
            merged.customer_reference = incoming.customer_reference.clone();
        }
        merged.metadata.extend(
            incoming
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        if incoming.approval_url.is_some() {
            merged.approval_url = incoming.approval_url.clone();
        }
        merged.updated_at = Utc::now();

        merged.validate()?;
        *self = merged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(status: PaymentStatus) -> PaymentSnapshot {
        PaymentSnapshot {
            provider_payment_id: "pay_1".into(),
            status,
            amount: Decimal::new(4999, 2),
            currency: Currency::new("USD").unwrap(),
            amount_refunded: None,
            customer_reference: Some("cus_1".into()),
            metadata: HashMap::from([("order".to_string(), "o-42".to_string())]),
            approval_url: None,
        }
    }

    #[test]
    fn test_forward_transitions() {
        use PaymentStatus::*;
        assert!(Pending.can_transition_to(RequiresAction));
        assert!(RequiresAction.can_transition_to(Captured));
        assert!(Authorized.can_transition_to(Captured));
        assert!(Captured.can_transition_to(PartiallyRefunded));
        assert!(PartiallyRefunded.can_transition_to(Refunded));
        assert!(Authorized.can_transition_to(Canceled));
    }

    #[test]
    fn test_captured_cannot_be_canceled_or_failed() {
        use PaymentStatus::*;
        assert!(!Captured.can_transition_to(Canceled));
        assert!(!Captured.can_transition_to(Failed));
        assert!(!Refunded.can_transition_to(Canceled));
        assert!(!Refunded.can_transition_to(Captured));
        assert!(!Canceled.can_transition_to(Captured));
    }

    #[test]
    fn test_merge_keeps_identity_and_refunds() {
        let mut row = PaymentRecord::from_snapshot(ProviderName::Stripe, snapshot(PaymentStatus::Captured));
        row.refunded_amount = Decimal::new(1000, 2);
        let id = row.id;
        let created = row.created_at;

        // provider still reports the intent as succeeded after a refund
        let incoming = PaymentRecord::from_snapshot(ProviderName::Stripe, snapshot(PaymentStatus::Captured));
        row.status = PaymentStatus::PartiallyRefunded;
        row.merge_from(&incoming).unwrap();

        assert_eq!(row.id, id);
        assert_eq!(row.created_at, created);
        assert_eq!(row.status, PaymentStatus::PartiallyRefunded);
        assert_eq!(row.refunded_amount, Decimal::new(1000, 2));
    }

    #[test]
    fn test_merge_rejects_refund_over_amount() {
        let mut row = PaymentRecord::from_snapshot(ProviderName::Stripe, snapshot(PaymentStatus::Captured));
        let mut incoming = row.clone();
        incoming.refunded_amount = Decimal::new(5000, 2);

        assert!(matches!(
            row.merge_from(&incoming),
            Err(PaymentError::LedgerConflict(_))
        ));
        assert_eq!(row.refunded_amount, Decimal::ZERO);
    }

    #[test]
    fn test_merge_rejects_other_key() {
        let mut row = PaymentRecord::from_snapshot(ProviderName::Stripe, snapshot(PaymentStatus::Pending));
        let incoming = PaymentRecord::from_snapshot(ProviderName::PayPal, snapshot(PaymentStatus::Pending));
        assert!(row.merge_from(&incoming).is_err());
    }
}
