//! # Money Codec
//!
//! Converts between a provider's wire representation of an amount and the
//! currency-agnostic `Decimal` the ledger stores.
//!
//! - Card providers take integer minor units (`4999` for 49.99 USD, `500` for
//!   500 JPY).
//! - Wallet providers take decimal strings (`"49.99"`, `"500"`).
//!
//! Every amount crossing a provider boundary goes through exactly one of these
//! functions on the way out and one on the way in. Nothing outside a provider
//! client ever holds minor units.

use crate::error::{PaymentError, PaymentResult};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Currencies whose minor unit equals the major unit.
pub const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "BIF", "CLP", "DJF", "GNF", "JPY", "KMF", "KRW", "MGA", "PYG", "RWF", "UGX", "VND", "VUV",
    "XAF", "XOF", "XPF",
];

/// ISO 4217 currency code, always stored upper-case
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    /// Parse a three-letter code, case-insensitively
    pub fn new(code: &str) -> PaymentResult<Self> {
        let code = code.trim();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(PaymentError::InvalidRequest(format!(
                "invalid currency code: {code:?}"
            )));
        }
        Ok(Self(code.to_ascii_uppercase()))
    }

    /// Upper-case ISO code (`"USD"`)
    pub fn code(&self) -> &str {
        &self.0
    }

    /// Lower-case code, the form card providers expect on the wire
    pub fn lowercase(&self) -> String {
        self.0.to_ascii_lowercase()
    }

    /// True for currencies without a subdivision
    pub fn is_zero_decimal(&self) -> bool {
        ZERO_DECIMAL_CURRENCIES.contains(&self.0.as_str())
    }

    /// Number of decimal places used on the wire
    pub fn decimal_places(&self) -> u32 {
        if self.is_zero_decimal() {
            0
        } else {
            2
        }
    }
}

impl FromStr for Currency {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Currency::new(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = PaymentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Currency::new(&value)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Round to the currency's wire precision, half away from zero.
fn round_for(amount: Decimal, currency: &Currency) -> Decimal {
    amount.round_dp_with_strategy(currency.decimal_places(), RoundingStrategy::MidpointAwayFromZero)
}

/// Convert a major-unit amount to integer minor units.
///
/// `49.99 USD -> 4999`, `500 JPY -> 500`, `0.005 USD -> 1`.
pub fn to_minor_units(amount: Decimal, currency: &Currency) -> PaymentResult<i64> {
    let scaled = if currency.is_zero_decimal() {
        amount
    } else {
        amount.checked_mul(Decimal::ONE_HUNDRED).ok_or_else(|| {
            PaymentError::InvalidRequest(format!("amount {amount} {currency} overflows"))
        })?
    };

    scaled
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| {
            PaymentError::InvalidRequest(format!(
                "amount {amount} {currency} does not fit in minor units"
            ))
        })
}

/// Convert integer minor units back to a major-unit amount.
pub fn from_minor_units(amount: i64, currency: &Currency) -> Decimal {
    if currency.is_zero_decimal() {
        Decimal::from(amount)
    } else {
        Decimal::new(amount, 2)
    }
}

/// Render an amount as the fixed-precision decimal string wallet providers expect.
///
/// `49.9 USD -> "49.90"`, `500 JPY -> "500"`.
pub fn to_decimal_string(amount: Decimal, currency: &Currency) -> String {
    let mut rounded = round_for(amount, currency);
    rounded.rescale(currency.decimal_places());
    rounded.to_string()
}

/// Parse a provider decimal string into an amount.
pub fn parse_decimal_string(value: &str, currency: &Currency) -> PaymentResult<Decimal> {
    let parsed = Decimal::from_str(value.trim()).map_err(|e| {
        PaymentError::Serialization(format!("invalid amount {value:?} for {currency}: {e}"))
    })?;
    Ok(round_for(parsed, currency).normalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn usd() -> Currency {
        Currency::new("usd").unwrap()
    }

    fn jpy() -> Currency {
        Currency::new("JPY").unwrap()
    }

    #[test]
    fn test_currency_parsing() {
        assert_eq!(usd().code(), "USD");
        assert_eq!(usd().lowercase(), "usd");
        assert!(jpy().is_zero_decimal());
        assert!(!usd().is_zero_decimal());
        assert!(Currency::new("US").is_err());
        assert!(Currency::new("U1D").is_err());
    }

    #[test]
    fn test_to_minor_units() {
        assert_eq!(to_minor_units(dec("49.99"), &usd()).unwrap(), 4999);
        assert_eq!(to_minor_units(dec("10"), &usd()).unwrap(), 1000);
        assert_eq!(to_minor_units(dec("500"), &jpy()).unwrap(), 500);
    }

    #[test]
    fn test_rounding_is_half_away_from_zero() {
        assert_eq!(to_minor_units(dec("0.005"), &usd()).unwrap(), 1);
        assert_eq!(to_minor_units(dec("0.004"), &usd()).unwrap(), 0);
        assert_eq!(to_minor_units(dec("-0.005"), &usd()).unwrap(), -1);
        assert_eq!(to_minor_units(dec("2.5"), &jpy()).unwrap(), 3);
    }

    #[test]
    fn test_from_minor_units() {
        assert_eq!(from_minor_units(4999, &usd()), dec("49.99"));
        assert_eq!(from_minor_units(500, &jpy()), dec("500"));
        assert_eq!(from_minor_units(0, &usd()), Decimal::ZERO);
    }

    #[test]
    fn test_overflow_is_rejected() {
        assert!(to_minor_units(Decimal::MAX, &usd()).is_err());
    }

    #[test]
    fn test_decimal_strings() {
        assert_eq!(to_decimal_string(dec("49.9"), &usd()), "49.90");
        assert_eq!(to_decimal_string(dec("500"), &jpy()), "500");
        assert_eq!(parse_decimal_string("10.00", &usd()).unwrap(), dec("10"));
        assert_eq!(parse_decimal_string("500", &jpy()).unwrap(), dec("500"));
        assert!(parse_decimal_string("ten", &usd()).is_err());
    }

    fn two_decimal_currency() -> impl Strategy<Value = Currency> {
        prop::sample::select(vec!["USD", "EUR", "GBP", "CAD", "CHF", "MXN", "BRL"])
            .prop_map(|c| Currency::new(c).unwrap())
    }

    fn zero_decimal_currency() -> impl Strategy<Value = Currency> {
        prop::sample::select(ZERO_DECIMAL_CURRENCIES.to_vec())
            .prop_map(|c| Currency::new(c).unwrap())
    }

    proptest! {
        #[test]
        fn prop_two_decimal_round_trip(cents in -1_000_000_000_000i64..1_000_000_000_000i64, currency in two_decimal_currency()) {
            let amount = Decimal::new(cents, 2);
            let minor = to_minor_units(amount, &currency).unwrap();
            prop_assert_eq!(minor, cents);
            prop_assert_eq!(from_minor_units(minor, &currency), amount);
        }

        #[test]
        fn prop_zero_decimal_round_trip(units in -1_000_000_000_000i64..1_000_000_000_000i64, currency in zero_decimal_currency()) {
            let amount = Decimal::from(units);
            let minor = to_minor_units(amount, &currency).unwrap();
            prop_assert_eq!(minor, units);
            prop_assert_eq!(from_minor_units(minor, &currency), amount);
        }

        #[test]
        fn prop_decimal_string_round_trip(cents in 0i64..1_000_000_000i64, currency in two_decimal_currency()) {
            let amount = Decimal::new(cents, 2);
            let wire = to_decimal_string(amount, &currency);
            prop_assert_eq!(parse_decimal_string(&wire, &currency).unwrap(), amount);
        }
    }
}
