//! Refunds
//!
//! A refund reverses the collective-ledger row of a group with a new pair
//! and cross-links the four rows in the same atomic write.

use crate::append::append_spec;
use crate::types::{DoubleEntrySpec, LedgerError, LedgerPair, Result};
use tipjar_domain::{FeeBreakdown, Transaction};
use tipjar_store::{AppendOptions, Store};
use tracing::info;

/// Fees carried by a refund.
///
/// When the processor kept its fee (`refunded_processor_fee == 0`) the host
/// absorbs it, so the payer still gets the full amount back.
pub fn redistribute_fees(original: FeeBreakdown, refunded_processor_fee: i64) -> FeeBreakdown {
    if refunded_processor_fee == 0 {
        FeeBreakdown {
            host_fee: original.host_fee + original.processor_fee,
            platform_fee: original.platform_fee,
            processor_fee: 0,
        }
    } else {
        original
    }
}

/// Spec of the refund pair for a collective-ledger CREDIT row.
pub fn refund_spec(
    credit: &Transaction,
    refunded_processor_fee: i64,
    data: serde_json::Value,
) -> Result<DoubleEntrySpec> {
    if !credit.is_credit() {
        return Err(LedgerError::InvalidEntry(format!(
            "refund spec needs the CREDIT row, got {} {}",
            credit.kind.as_str(),
            credit.id
        )));
    }

    Ok(DoubleEntrySpec {
        collective_id: credit.collective_id,
        from_collective_id: credit.from_collective_id,
        host_collective_id: credit.host_collective_id,
        amount: -credit.amount,
        currency: credit.currency.clone(),
        amount_in_host_currency: -credit.amount_in_host_currency,
        host_currency: credit.host_currency.clone(),
        host_currency_fx_rate: credit.host_currency_fx_rate,
        fees: redistribute_fees(credit.fees(), refunded_processor_fee),
        order_id: credit.order_id,
        payment_method_id: credit.payment_method_id,
        created_by: credit.created_by,
        group_id: None,
        description: format!("Refund of \"{}\"", credit.description),
        data,
    })
}

/// The CREDIT row of `transaction`'s group.
pub async fn collective_row<S: Store + ?Sized>(
    store: &S,
    transaction: &Transaction,
) -> Result<Transaction> {
    if transaction.is_credit() {
        return Ok(transaction.clone());
    }
    let group = store.transactions().find_by_group(transaction.group_id).await?;
    group.into_iter().find(|t| t.is_credit()).ok_or_else(|| LedgerError::IncompleteGroup {
        group_id: transaction.group_id,
        reason: "no CREDIT row".to_string(),
    })
}

/// Write the refund pair for `transaction` and link the quartet.
///
/// # Errors
/// - `AlreadyRefunded` if the group was refunded (checked again atomically
///   by the store)
/// - `InvalidEntry` if the redistributed fees would go negative
pub async fn create_refund<S: Store + ?Sized>(
    store: &S,
    transaction: &Transaction,
    refunded_processor_fee: i64,
    data: serde_json::Value,
) -> Result<LedgerPair> {
    let credit = collective_row(store, transaction).await?;
    if credit.is_refund_linked() {
        return Err(LedgerError::AlreadyRefunded(credit.id));
    }

    let spec = refund_spec(&credit, refunded_processor_fee, data)?;
    let options = AppendOptions { refund_of: Some(credit.group_id), ..AppendOptions::default() };
    let pair = append_spec(store, &spec, options).await.map_err(|e| match e {
        LedgerError::Store(tipjar_store::StoreError::AlreadyRefunded(id)) => {
            LedgerError::AlreadyRefunded(id)
        },
        other => other,
    })?;

    info!(
        refunded_group = %credit.group_id,
        refund_group = %pair.group_id(),
        amount = pair.credit.amount,
        processor_fee_refunded = refunded_processor_fee != 0,
        "Refund recorded"
    );

    Ok(pair)
}

// =============================================================================
// Tests
// =============================================================================
