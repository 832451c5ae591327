//! Ledger Types

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tipjar_domain::{
    Currency, FeeBreakdown, OrderId, PartyId, PaymentMethodId, Transaction, TransactionGroupId,
    TransactionId,
};

/// One side's view of an economic event, from which both rows are derived.
///
/// A non-negative `amount` is the CREDIT of `collective_id`. A negative
/// `amount` debits `collective_id`; the CREDIT then lands on
/// `from_collective_id`. Either way the fees travel with the CREDIT row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoubleEntrySpec {
    pub collective_id: PartyId,
    pub from_collective_id: PartyId,
    pub host_collective_id: Option<PartyId>,
    pub amount: i64,
    pub currency: Currency,
    pub amount_in_host_currency: i64,
    pub host_currency: Currency,
    pub host_currency_fx_rate: Decimal,
    pub fees: FeeBreakdown,
    pub order_id: Option<OrderId>,
    pub payment_method_id: Option<PaymentMethodId>,
    pub created_by: Option<PartyId>,
    /// Generated when absent
    pub group_id: Option<TransactionGroupId>,
    pub description: String,
    pub data: serde_json::Value,
}

/// The two rows of one economic event, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerPair {
    pub debit: Transaction,
    pub credit: Transaction,
}

impl LedgerPair {
    /// Shared group id
    pub fn group_id(&self) -> TransactionGroupId {
        self.credit.group_id
    }
}

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The spec cannot produce a balanced pair (negative fees, fees above gross, ...)
    #[error("Invalid ledger entry: {0}")]
    InvalidEntry(String),

    /// Transaction was already refunded or is itself a refund
    #[error("Transaction {0} is already refunded")]
    AlreadyRefunded(TransactionId),

    /// Group does not contain the expected CREDIT/DEBIT pair
    #[error("Transaction group {group_id} is incomplete: {reason}")]
    IncompleteGroup {
        group_id: TransactionGroupId,
        reason: String,
    },

    /// Fee arithmetic failed
    #[error("Fee calculation error: {0}")]
    Engine(#[from] tipjar_engine::EngineError),

    /// Persistence failed; nothing was written
    #[error("Store error: {0}")]
    Store(#[from] tipjar_store::StoreError),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T>;
