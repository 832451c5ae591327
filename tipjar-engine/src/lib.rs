//! tipjar Engine Layer
//!
//! Pure decision logic, deterministic, no I/O.
//!
//! # Components
//!
//! - **Fees**: settlement fee extraction, host fee, fx rate, net amount
//! - **Billing**: subscription date and retry-count arithmetic
//! - **Validation**: ordered order-creation rules

#![warn(clippy::all)]

pub mod billing;
pub mod error;
pub mod fees;
pub mod validation;

pub use billing::{
    next_billing_dates, next_charge_retry_count, parse_interval, BillingDates, BillingPolicy,
    SubscriptionEvent,
};
pub use error::{EngineError, EngineResult};
pub use fees::{
    classify_fee, extract_fees, fx_rate, host_fee, net_amount, percent_of, FeeDetail, FeeKind,
    ProcessorFees, Settlement,
};
pub use validation::{
    check_quantity_per_user, default_description, matching_amount, matching_description,
    plan_amount, validate_payment, AmountPlan, DEFAULT_MIN_CHARGE_AMOUNT,
};
