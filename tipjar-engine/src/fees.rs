//! Fee calculator.
//!
//! Pure functions turning a processor settlement record into fee amounts,
//! plus the host fee, fx rate and net amount arithmetic used by the ledger.
//!
//! All amounts are integers in minor units. Percentages are `FeePercent`
//! values where 5 means 5%.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use tipjar_domain::{Currency, FeeBreakdown, FeePercent};

use crate::error::{EngineError, EngineResult};

// =============================================================================
// Settlement
// =============================================================================

/// One itemized fee line of a settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeDetail {
    /// Signed amount as reported by the processor (refunds report negatives)
    pub amount: i64,
    /// Processor tag, e.g. `stripe_fee` or `application_fee`
    pub kind: String,
}

impl FeeDetail {
    /// Create a fee line
    pub fn new(kind: &str, amount: i64) -> Self {
        Self { amount, kind: kind.to_string() }
    }
}

/// The processor's record of money movement for a charge or refund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    /// Processor-assigned identifier
    pub id: String,
    /// Gross amount; refunds report a negative value
    pub amount: Option<i64>,
    pub currency: Currency,
    pub fee_details: Vec<FeeDetail>,
}

/// Classification of a fee line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeKind {
    /// Kept by the payment processor
    Processor,
    /// Kept by the platform (application fee)
    Platform,
}

/// Classify a processor fee tag.
pub fn classify_fee(kind: &str) -> Option<FeeKind> {
    match kind {
        "stripe_fee" | "processor_fee" | "payment_processor_fee" => Some(FeeKind::Processor),
        "application_fee" | "platform_fee" => Some(FeeKind::Platform),
        _ => None,
    }
}

/// Fees extracted from a settlement, as non-negative magnitudes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorFees {
    pub processor_fee: i64,
    pub platform_fee: i64,
}

/// Extract processor and platform fees from a settlement.
///
/// # Errors
///
/// `MalformedSettlement` when the gross amount is missing or a fee line
/// has a tag that is neither a processor nor a platform fee.
pub fn extract_fees(settlement: &Settlement) -> EngineResult<ProcessorFees> {
    if settlement.amount.is_none() {
        return Err(EngineError::MalformedSettlement(format!(
            "settlement {} has no gross amount",
            settlement.id
        )));
    }

    let mut fees = ProcessorFees::default();
    for detail in &settlement.fee_details {
        let magnitude = detail.amount.checked_abs().ok_or_else(|| {
            EngineError::MalformedSettlement(format!("fee amount {} overflows", detail.amount))
        })?;

        let total = match classify_fee(&detail.kind) {
            Some(FeeKind::Processor) => &mut fees.processor_fee,
            Some(FeeKind::Platform) => &mut fees.platform_fee,
            None => {
                return Err(EngineError::MalformedSettlement(format!(
                    "settlement {} has unclassifiable fee '{}'",
                    settlement.id, detail.kind
                )))
            },
        };
        *total = total.checked_add(magnitude).ok_or_else(|| {
            EngineError::MalformedSettlement(format!(
                "settlement {} fee total overflows at '{}'",
                settlement.id, detail.kind
            ))
        })?;
    }

    Ok(fees)
}

// =============================================================================
// Arithmetic
// =============================================================================

fn to_minor_units(value: Decimal, what: &str) -> EngineResult<i64> {
    value
        .to_i64()
        .ok_or_else(|| EngineError::Arithmetic(format!("{} {} does not fit in i64", what, value)))
}

/// Host fee: `floor(amount_in_host_currency * percent / 100)`.
pub fn host_fee(amount_in_host_currency: i64, percent: FeePercent) -> EngineResult<i64> {
    let fee = Decimal::from(amount_in_host_currency) * percent.as_decimal() / Decimal::ONE_HUNDRED;
    to_minor_units(fee.floor(), "host fee")
}

/// Percentage of an amount, rounded half away from zero.
///
/// Used for platform (application) fees requested from the processor.
pub fn percent_of(amount: i64, percent: FeePercent) -> EngineResult<i64> {
    let fee = Decimal::from(amount) * percent.as_decimal() / Decimal::ONE_HUNDRED;
    to_minor_units(
        fee.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero),
        "percentage fee",
    )
}

/// Rate converting host currency into the order currency.
///
/// # Errors
///
/// `MalformedSettlement` when the settlement amount is zero.
pub fn fx_rate(order_amount: i64, settlement_amount: i64) -> EngineResult<Decimal> {
    if settlement_amount == 0 {
        return Err(EngineError::MalformedSettlement(
            "settlement amount is zero, fx rate is undefined".to_string(),
        ));
    }
    Ok(Decimal::from(order_amount) / Decimal::from(settlement_amount))
}

/// `round((amount_in_host_currency - fees) * fx_rate)`, half away from zero.
pub fn net_amount(
    amount_in_host_currency: i64,
    fees: &FeeBreakdown,
    fx_rate: Decimal,
) -> EngineResult<i64> {
    let gross = Decimal::from(amount_in_host_currency) - Decimal::from(fees.total());
    let net = gross
        .checked_mul(fx_rate)
        .ok_or_else(|| EngineError::Arithmetic("net amount overflows".to_string()))?;
    to_minor_units(
        net.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero),
        "net amount",
    )
}

// =============================================================================
// Tests
// =============================================================================
