//! Execution layer port definitions.
//!
//! Ports define the interfaces for external payment processors.
//! Adapters implement these ports for specific services (Stripe, stub, etc.).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tipjar_domain::Currency;
use tipjar_engine::Settlement;

use crate::error::ExecError;

// =============================================================================
// Payment Processor Port
// =============================================================================

/// Port for an external card processor.
///
/// Implementations:
/// - `StubProcessor` - For testing (deterministic fees, injectable failures)
/// - `StripeRestClient` - Stripe-style REST API (tipjar-connectors)
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Charge a payment source.
    ///
    /// The processor must treat `request.idempotency_key` as unique: a
    /// repeated key returns the original charge instead of charging again.
    ///
    /// # Errors
    ///
    /// - `Gateway` when the processor declines
    /// - `Timeout` when the outcome is unknown; reconcile with `find_charge`
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, ExecError>;

    /// Look up a charge by the idempotency key it was created with.
    async fn find_charge(&self, idempotency_key: &str) -> Result<Option<ChargeReceipt>, ExecError>;

    /// Refund a charge in full.
    async fn refund(&self, charge_id: &str, idempotency_key: &str)
        -> Result<RefundReceipt, ExecError>;

    /// Fetch the settlement record (gross, currency, itemized fees).
    async fn settlement(&self, settlement_id: &str) -> Result<Settlement, ExecError>;

    /// Check if the processor is reachable.
    async fn health_check(&self) -> Result<(), ExecError>;
}

/// A charge to send to the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRequest {
    /// Deterministic key; the same order/purpose/amount always maps to it
    pub idempotency_key: String,
    /// Amount in minor units
    pub amount: i64,
    pub currency: Currency,
    /// Processor token of the payment source
    pub source_token: String,
    pub description: String,
    /// Platform share collected by the processor
    pub application_fee: i64,
}

/// Processor confirmation of a charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeReceipt {
    /// Processor-assigned charge ID
    pub charge_id: String,
    /// Settlement record of the charge
    pub settlement_id: String,
    pub amount: i64,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
}

/// Processor confirmation of a refund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub refund_id: String,
    pub charge_id: String,
    /// Settlement record of the refund (negative gross)
    pub settlement_id: String,
    pub amount: i64,
}
