//! tipjar Payment Processor Connectors
//!
//! Adapters for payment processor APIs.
//! Normalizes processor-specific responses to settlement records.

#![warn(clippy::all)]

// Public modules
pub mod stripe_rest;

// Re-exports
pub use stripe_rest::{
    StripeBalanceTransaction, StripeCharge, StripeFeeDetail, StripeRefund, StripeRestClient,
    StripeRestError,
};
