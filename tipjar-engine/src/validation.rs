//! Order validation rules.
//!
//! Each rule is a pure step returning a result; the executor runs them in a
//! fixed order and stops at the first failure.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use tipjar_domain::{Currency, Interval, Tier};

use crate::error::{EngineError, EngineResult};

/// Default minimum for a paid order, in minor units ($0.50).
pub const DEFAULT_MIN_CHARGE_AMOUNT: i64 = 50;

/// Amount, currency and interval an order will be created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmountPlan {
    pub total_amount: i64,
    pub currency: Currency,
    pub interval: Option<Interval>,
    pub payment_required: bool,
}

/// Resolve the order amount from the tier and the requested amount.
///
/// A tier with a fixed amount and no presets dictates `amount * quantity`;
/// otherwise the requested amount is used. Currency follows the tier, then
/// the collective.
pub fn plan_amount(
    tier: Option<&Tier>,
    requested_amount: Option<i64>,
    quantity: u32,
    requested_interval: Option<Interval>,
    collective_currency: &Currency,
) -> EngineResult<AmountPlan> {
    if quantity == 0 {
        return Err(EngineError::InvalidInput("quantity must be at least 1".to_string()));
    }
    if let Some(amount) = requested_amount {
        if amount < 0 {
            return Err(EngineError::InvalidInput(format!(
                "total amount must not be negative, got {}",
                amount
            )));
        }
    }

    let (total_amount, currency, interval, tier_amount) = match tier {
        Some(tier) if tier.amount > 0 && !tier.has_presets => {
            let total = tier.amount.checked_mul(i64::from(quantity)).ok_or_else(|| {
                EngineError::Arithmetic(format!("{} x {} overflows", tier.amount, quantity))
            })?;
            (total, tier.currency.clone(), requested_interval.or(tier.interval), tier.amount)
        },
        Some(tier) => (
            requested_amount.unwrap_or(0),
            tier.currency.clone(),
            requested_interval.or(tier.interval),
            tier.amount,
        ),
        None => (
            requested_amount.unwrap_or(0),
            collective_currency.clone(),
            requested_interval,
            0,
        ),
    };

    Ok(AmountPlan {
        total_amount,
        currency,
        interval,
        payment_required: total_amount > 0 || tier_amount > 0,
    })
}

/// Validate a payment: amount present and at least `min_amount`.
pub fn validate_payment(total_amount: i64, min_amount: i64) -> EngineResult<()> {
    if total_amount <= 0 {
        return Err(EngineError::InvalidInput("payment amount missing".to_string()));
    }
    if total_amount < min_amount {
        return Err(EngineError::InvalidInput(format!(
            "payment amount must be at least {} minor units, got {}",
            min_amount, total_amount
        )));
    }
    Ok(())
}

/// Check the per-order quantity limit of a tier.
pub fn check_quantity_per_user(tier: &Tier, quantity: u32) -> EngineResult<()> {
    match tier.max_quantity_per_user {
        Some(max) if quantity > max => Err(EngineError::InvalidInput(format!(
            "you can buy up to {} units of '{}', requested {}",
            max, tier.name, quantity
        ))),
        _ => Ok(()),
    }
}

/// Description used when the caller did not provide one.
pub fn default_description(
    interval: Option<Interval>,
    collective_name: &str,
    tier_name: Option<&str>,
) -> String {
    let prefix = match interval {
        Some(Interval::Month) => "Monthly donation",
        Some(Interval::Year) => "Yearly donation",
        None => "Donation",
    };
    match tier_name {
        Some(tier) => format!("{} to {} ({})", prefix, collective_name, tier),
        None => format!("{} to {}", prefix, collective_name),
    }
}

/// Amount a matching fund adds on top of `total_amount`.
pub fn matching_amount(total_amount: i64, multiplier: Decimal) -> EngineResult<i64> {
    if multiplier <= Decimal::ZERO {
        return Err(EngineError::InvalidInput(format!(
            "matching multiplier must be positive, got {}",
            multiplier
        )));
    }
    (Decimal::from(total_amount) * multiplier)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| EngineError::Arithmetic("matching amount overflows".to_string()))
}

/// Description of the derived matching order.
pub fn matching_description(multiplier: Decimal, from_name: &str) -> String {
    format!("Matching {}x {}'s donation", multiplier.normalize(), from_name)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn tier(amount: i64) -> Tier {
        Tier::new(Uuid::now_v7(), "Backer", amount, Currency::new("EUR").unwrap())
    }

    #[test]
    fn test_fixed_tier_dictates_amount_and_currency() {
        let tier = tier(1000);
        let plan = plan_amount(Some(&tier), Some(1), 3, None, &Currency::usd()).unwrap();

        assert_eq!(plan.total_amount, 3000);
        assert_eq!(plan.currency.as_str(), "EUR");
        assert!(plan.payment_required);
    }

    #[test]
    fn test_presets_tier_uses_requested_amount() {
        let mut tier = tier(1000);
        tier.has_presets = true;
        tier.interval = Some(Interval::Month);

        let plan = plan_amount(Some(&tier), Some(2500), 1, None, &Currency::usd()).unwrap();
        assert_eq!(plan.total_amount, 2500);
        assert_eq!(plan.interval, Some(Interval::Month));
    }

    #[test]
    fn test_free_order_without_tier() {
        let plan = plan_amount(None, None, 1, None, &Currency::usd()).unwrap();
        assert_eq!(plan.total_amount, 0);
        assert!(!plan.payment_required);
        assert_eq!(plan.currency, Currency::usd());
    }

    #[test]
    fn test_negative_amount_rejected() {
        assert!(plan_amount(None, Some(-5), 1, None, &Currency::usd()).is_err());
    }

    #[test]
    fn test_validate_payment_minimum() {
        assert!(validate_payment(50, DEFAULT_MIN_CHARGE_AMOUNT).is_ok());
        assert!(validate_payment(49, DEFAULT_MIN_CHARGE_AMOUNT).is_err());
        assert!(validate_payment(0, DEFAULT_MIN_CHARGE_AMOUNT).is_err());
    }

    #[test]
    fn test_quantity_per_user() {
        let mut tier = tier(1000);
        tier.max_quantity_per_user = Some(2);
        assert!(check_quantity_per_user(&tier, 2).is_ok());
        assert!(check_quantity_per_user(&tier, 3).is_err());
    }

    #[test]
    fn test_default_descriptions() {
        assert_eq!(
            default_description(Some(Interval::Month), "WWCode", Some("Sponsor")),
            "Monthly donation to WWCode (Sponsor)"
        );
        assert_eq!(default_description(None, "WWCode", None), "Donation to WWCode");
    }

    #[test]
    fn test_matching_amount() {
        assert_eq!(matching_amount(1000, dec!(2)).unwrap(), 2000);
        assert_eq!(matching_amount(1001, dec!(0.5)).unwrap(), 501);
        assert!(matching_amount(1000, dec!(0)).is_err());
        assert_eq!(matching_description(dec!(2.0), "Xavier"), "Matching 2x Xavier's donation");
    }
}
