//! Ledger Module
//!
//! The double-entry transaction ledger:
//! - Every economic event is written as a DEBIT/CREDIT pair sharing a group id
//! - The DEBIT is derived from the CREDIT; fees live on the CREDIT only
//! - Charges settle their order in the same atomic write
//! - Renewals advance their subscription in the same atomic write
//! - Refunds write a new pair and cross-link the four rows atomically
//!
//! No other crate builds transaction rows.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tipjar_ledger::Ledger;
//! use tipjar_store::MemoryStore;
//!
//! # async fn example(tx: tipjar_domain::Transaction) -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = Ledger::new(Arc::new(MemoryStore::new()));
//!
//! // Processor did not refund its fee: the host absorbs it
//! let refund = ledger.create_refund(&tx, 0, serde_json::json!({})).await?;
//! println!("refund group {}", refund.group_id());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod append;
pub mod query;
pub mod refund;
pub mod types;

pub use append::{build_pair, create_double_entry, record_charge, record_renewal};
pub use query::{balance, find_by_id, find_by_order, find_group};
pub use refund::{collective_row, create_refund, redistribute_fees, refund_spec};
pub use types::{DoubleEntrySpec, LedgerError, LedgerPair, LedgerResult};

use std::sync::Arc;
use tipjar_domain::{OrderId, PartyId, Transaction, TransactionGroupId, TransactionId};
use tipjar_store::{Reschedule, SettleOrder, Store};

/// The ledger over a store.
pub struct Ledger<S: Store> {
    store: Arc<S>,
}

impl<S: Store> Clone for Ledger<S> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone() }
    }
}

impl<S: Store> Ledger<S> {
    /// Create a ledger writing to `store`
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Persist both rows of `spec` atomically
    pub async fn create_double_entry(&self, spec: &DoubleEntrySpec) -> LedgerResult<LedgerPair> {
        append::create_double_entry(self.store.as_ref(), spec).await
    }

    /// Persist a charge and settle its order atomically
    pub async fn record_charge(
        &self,
        spec: &DoubleEntrySpec,
        settle: SettleOrder,
    ) -> LedgerResult<LedgerPair> {
        append::record_charge(self.store.as_ref(), spec, settle).await
    }

    /// Persist a renewal and advance its subscription atomically
    pub async fn record_renewal(
        &self,
        spec: &DoubleEntrySpec,
        reschedule: Reschedule,
    ) -> LedgerResult<LedgerPair> {
        append::record_renewal(self.store.as_ref(), spec, reschedule).await
    }

    /// Refund `transaction`'s group
    pub async fn create_refund(
        &self,
        transaction: &Transaction,
        refunded_processor_fee: i64,
        data: serde_json::Value,
    ) -> LedgerResult<LedgerPair> {
        refund::create_refund(self.store.as_ref(), transaction, refunded_processor_fee, data).await
    }

    /// The CREDIT row of `transaction`'s group
    pub async fn collective_row(&self, transaction: &Transaction) -> LedgerResult<Transaction> {
        refund::collective_row(self.store.as_ref(), transaction).await
    }

    pub async fn find_group(&self, group_id: TransactionGroupId) -> LedgerResult<Vec<Transaction>> {
        query::find_group(self.store.as_ref(), group_id).await
    }

    pub async fn find_by_order(&self, order_id: OrderId) -> LedgerResult<Vec<Transaction>> {
        query::find_by_order(self.store.as_ref(), order_id).await
    }

    pub async fn find_by_id(&self, id: TransactionId) -> LedgerResult<Option<Transaction>> {
        query::find_by_id(self.store.as_ref(), id).await
    }

    /// Net balance of a party's ledger
    pub async fn balance(&self, party_id: PartyId) -> LedgerResult<i64> {
        query::balance(self.store.as_ref(), party_id).await
    }
}
