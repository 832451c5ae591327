//! Value Objects for the tipjar domain
//!
//! Immutable, validated domain primitives.
//! All value objects enforce invariants at construction time.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Domain errors for value object validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// Currency must be a three letter ISO code
    #[error("Invalid currency: {0}")]
    InvalidCurrency(String),

    /// Interval must be `month` or `year`
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    /// Amount violates a sign or range rule
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Quantity must be at least one
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Fee percent must be within 0..=100
    #[error("Invalid fee percent: {0}")]
    InvalidFeePercent(String),

    /// Unknown enum tag (party kind, payment method kind, ...)
    #[error("Invalid kind: {0}")]
    InvalidKind(String),

    /// Invalid state transition
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
}

// =============================================================================
// Currency
// =============================================================================

/// ISO 4217 currency code, stored upper-case.
///
/// # Invariants
/// - Exactly three ASCII letters
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    /// Create a new Currency with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidCurrency` for anything but three letters
    pub fn new(code: &str) -> Result<Self, DomainError> {
        let code = code.trim();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(DomainError::InvalidCurrency(format!(
                "expected a three letter code, got '{}'",
                code
            )));
        }
        Ok(Self(code.to_ascii_uppercase()))
    }

    /// US dollars
    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    /// Get the code as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Currency {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Interval
// =============================================================================

/// Recurrence interval of an order or subscription.
///
/// Only `month` and `year` exist; anything else is rejected at parse time,
/// never coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    /// Charged every month
    Month,
    /// Charged every year
    Year,
}

impl Interval {
    /// Number of calendar months in one interval
    pub fn months(&self) -> u32 {
        match self {
            Interval::Month => 1,
            Interval::Year => 12,
        }
    }

    /// Wire name (`month` / `year`)
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Month => "month",
            Interval::Year => "year",
        }
    }
}

impl FromStr for Interval {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "month" => Ok(Interval::Month),
            "year" => Ok(Interval::Year),
            other => Err(DomainError::InvalidInterval(format!(
                "interval should be null, month or year, got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// FeePercent
// =============================================================================

/// A percentage in the inclusive range 0..=100 (5 means 5%).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeePercent(Decimal);

impl FeePercent {
    /// Create a new FeePercent with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidFeePercent` outside 0..=100
    pub fn new(value: Decimal) -> Result<Self, DomainError> {
        if value < Decimal::ZERO || value > Decimal::ONE_HUNDRED {
            return Err(DomainError::InvalidFeePercent(format!(
                "{} is outside 0..=100",
                value
            )));
        }
        Ok(Self(value))
    }

    /// 0%
    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    /// Whole percentage, capped at 100
    pub fn from_percent(percent: u8) -> Self {
        Self(Decimal::from(percent.min(100)))
    }

    /// Get the underlying Decimal value
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for FeePercent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

// =============================================================================
// Kinds
// =============================================================================

/// Kind of party taking part in an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyKind {
    /// An individual user
    User,
    /// A company or group paying on behalf of its members
    Organization,
    /// A collective receiving contributions
    Collective,
    /// An event run by a collective
    Event,
}

impl PartyKind {
    /// Storage tag
    pub fn as_str(&self) -> &'static str {
        match self {
            PartyKind::User => "user",
            PartyKind::Organization => "organization",
            PartyKind::Collective => "collective",
            PartyKind::Event => "event",
        }
    }
}

impl FromStr for PartyKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(PartyKind::User),
            "organization" => Ok(PartyKind::Organization),
            "collective" => Ok(PartyKind::Collective),
            "event" => Ok(PartyKind::Event),
            other => Err(DomainError::InvalidKind(format!("party kind '{}'", other))),
        }
    }
}

/// Payment method variants. Each variant maps to exactly one gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodKind {
    /// Credit card charged through the card processor
    Card,
    /// Bank transfer, settled asynchronously
    BankTransfer,
    /// Prepaid / gift card backed by a local balance
    Prepaid,
    /// Cryptocurrency payment, settled asynchronously
    Crypto,
    /// Funds added manually by a host admin
    Manual,
}

impl PaymentMethodKind {
    /// Storage tag
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethodKind::Card => "card",
            PaymentMethodKind::BankTransfer => "bank_transfer",
            PaymentMethodKind::Prepaid => "prepaid",
            PaymentMethodKind::Crypto => "crypto",
            PaymentMethodKind::Manual => "manual",
        }
    }

    /// All variants, in registry order
    pub fn all() -> [PaymentMethodKind; 5] {
        [
            PaymentMethodKind::Card,
            PaymentMethodKind::BankTransfer,
            PaymentMethodKind::Prepaid,
            PaymentMethodKind::Crypto,
            PaymentMethodKind::Manual,
        ]
    }
}

impl FromStr for PaymentMethodKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "card" => Ok(PaymentMethodKind::Card),
            "bank_transfer" => Ok(PaymentMethodKind::BankTransfer),
            "prepaid" => Ok(PaymentMethodKind::Prepaid),
            "crypto" => Ok(PaymentMethodKind::Crypto),
            "manual" => Ok(PaymentMethodKind::Manual),
            other => Err(DomainError::InvalidKind(format!("payment method kind '{}'", other))),
        }
    }
}

impl fmt::Display for PaymentMethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side of a double-entry pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionKind {
    /// Money in, from the owner's perspective
    Credit,
    /// Money out, from the owner's perspective
    Debit,
}

impl TransactionKind {
    /// Storage tag
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Credit => "CREDIT",
            TransactionKind::Debit => "DEBIT",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREDIT" => Ok(TransactionKind::Credit),
            "DEBIT" => Ok(TransactionKind::Debit),
            other => Err(DomainError::InvalidKind(format!("transaction kind '{}'", other))),
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_currency_normalizes_case() {
        let currency = Currency::new("eur").unwrap();
        assert_eq!(currency.as_str(), "EUR");
    }

    #[test]
    fn test_currency_rejects_bad_codes() {
        assert!(Currency::new("EURO").is_err());
        assert!(Currency::new("U$D").is_err());
        assert!(Currency::new("").is_err());
    }

    #[test]
    fn test_currency_serde_validates() {
        let parsed: Result<Currency, _> = serde_json::from_str("\"usd\"");
        assert_eq!(parsed.unwrap(), Currency::usd());

        let invalid: Result<Currency, _> = serde_json::from_str("\"dollars\"");
        assert!(invalid.is_err());
    }

    #[test]
    fn test_interval_parsing_is_strict() {
        assert_eq!("month".parse::<Interval>().unwrap(), Interval::Month);
        assert_eq!("year".parse::<Interval>().unwrap(), Interval::Year);
        assert!("monthly".parse::<Interval>().is_err());
        assert!("Month".parse::<Interval>().is_err());
        assert!("week".parse::<Interval>().is_err());
    }

    #[test]
    fn test_interval_months() {
        assert_eq!(Interval::Month.months(), 1);
        assert_eq!(Interval::Year.months(), 12);
    }

    #[test]
    fn test_fee_percent_bounds() {
        assert!(FeePercent::new(dec!(0)).is_ok());
        assert!(FeePercent::new(dec!(100)).is_ok());
        assert!(FeePercent::new(dec!(-1)).is_err());
        assert!(FeePercent::new(dec!(100.5)).is_err());
        assert_eq!(FeePercent::from_percent(5).as_decimal(), dec!(5));
        assert_eq!(FeePercent::from_percent(250).as_decimal(), dec!(100));
    }

    #[test]
    fn test_payment_method_kind_roundtrip_tags() {
        for kind in PaymentMethodKind::all() {
            assert_eq!(kind.as_str().parse::<PaymentMethodKind>().unwrap(), kind);
        }
        assert!("paypal".parse::<PaymentMethodKind>().is_err());
    }
}
