//! Double-entry Appending
//!
//! The CREDIT row is built from the spec and the DEBIT row is derived from
//! it mechanically, so the two sides cannot drift apart.

use crate::types::{DoubleEntrySpec, LedgerError, LedgerPair, Result};
use chrono::{DateTime, Utc};
use tipjar_domain::{Transaction, TransactionKind};
use tipjar_engine::net_amount;
use tipjar_store::{AppendOptions, Reschedule, SettleOrder, Store};
use tracing::{debug, info};
use uuid::Uuid;

/// Build the DEBIT and CREDIT rows for a spec (DEBIT first).
///
/// # Errors
/// - `InvalidEntry` if a fee is negative, fees exceed the gross amount, or
///   `amount` and `amount_in_host_currency` disagree in sign
pub fn build_pair(spec: &DoubleEntrySpec, now: DateTime<Utc>) -> Result<(Transaction, Transaction)> {
    if spec.fees.has_negative() {
        return Err(LedgerError::InvalidEntry(format!(
            "fees must not be negative: {:?}",
            spec.fees
        )));
    }
    if spec.amount.signum() * spec.amount_in_host_currency.signum() < 0 {
        return Err(LedgerError::InvalidEntry(format!(
            "amount {} and amount in host currency {} disagree in sign",
            spec.amount, spec.amount_in_host_currency
        )));
    }

    let gross = spec.amount.checked_abs().ok_or_else(|| {
        LedgerError::InvalidEntry(format!("amount {} overflows", spec.amount))
    })?;
    let gross_in_host = spec.amount_in_host_currency.checked_abs().ok_or_else(|| {
        LedgerError::InvalidEntry(format!(
            "amount in host currency {} overflows",
            spec.amount_in_host_currency
        ))
    })?;
    if spec.fees.total() > gross_in_host {
        return Err(LedgerError::InvalidEntry(format!(
            "fees {} exceed the gross amount {}",
            spec.fees.total(),
            gross_in_host
        )));
    }

    // Whoever receives the money owns the CREDIT
    let (owner, counterparty) = if spec.amount >= 0 {
        (spec.collective_id, spec.from_collective_id)
    } else {
        (spec.from_collective_id, spec.collective_id)
    };

    let group_id = spec.group_id.unwrap_or_else(Uuid::now_v7);
    let net = net_amount(gross_in_host, &spec.fees, spec.host_currency_fx_rate)?;

    let credit = Transaction {
        id: Uuid::now_v7(),
        seq: 0,
        kind: TransactionKind::Credit,
        collective_id: owner,
        from_collective_id: counterparty,
        host_collective_id: spec.host_collective_id,
        amount: gross,
        currency: spec.currency.clone(),
        amount_in_host_currency: gross_in_host,
        host_currency: spec.host_currency.clone(),
        host_currency_fx_rate: spec.host_currency_fx_rate,
        host_fee_in_host_currency: Some(spec.fees.host_fee),
        platform_fee_in_host_currency: Some(spec.fees.platform_fee),
        payment_processor_fee_in_host_currency: Some(spec.fees.processor_fee),
        net_amount_in_collective_currency: net,
        order_id: spec.order_id,
        payment_method_id: spec.payment_method_id,
        created_by: spec.created_by,
        group_id,
        refund_id: None,
        description: spec.description.clone(),
        data: spec.data.clone(),
        created_at: now,
    };

    let debit = Transaction {
        id: Uuid::now_v7(),
        kind: TransactionKind::Debit,
        collective_id: counterparty,
        from_collective_id: owner,
        amount: -credit.amount,
        amount_in_host_currency: -credit.amount_in_host_currency,
        host_fee_in_host_currency: None,
        platform_fee_in_host_currency: None,
        payment_processor_fee_in_host_currency: None,
        net_amount_in_collective_currency: -net,
        ..credit.clone()
    };

    Ok((debit, credit))
}

/// Append a pair built from `spec` with extra atomic work.
pub(crate) async fn append_spec<S: Store + ?Sized>(
    store: &S,
    spec: &DoubleEntrySpec,
    options: AppendOptions,
) -> Result<LedgerPair> {
    let (debit, credit) = build_pair(spec, Utc::now())?;
    let (debit, credit) = store.transactions().append_pair(&debit, &credit, options).await?;

    debug!(
        group_id = %credit.group_id,
        collective_id = %credit.collective_id,
        amount = credit.amount,
        net = credit.net_amount_in_collective_currency,
        "Double entry written"
    );

    Ok(LedgerPair { debit, credit })
}

/// Persist both rows of `spec` atomically.
pub async fn create_double_entry<S: Store + ?Sized>(
    store: &S,
    spec: &DoubleEntrySpec,
) -> Result<LedgerPair> {
    append_spec(store, spec, AppendOptions::default()).await
}

/// Persist a charge and settle its order in the same atomic step.
///
/// # Errors
/// - `Store(AlreadyProcessed)` if the order was settled concurrently; no
///   rows are written in that case
pub async fn record_charge<S: Store + ?Sized>(
    store: &S,
    spec: &DoubleEntrySpec,
    settle: SettleOrder,
) -> Result<LedgerPair> {
    let pair = append_spec(
        store,
        spec,
        AppendOptions { settle_order: Some(settle), ..AppendOptions::default() },
    )
    .await?;

    info!(
        order_id = %settle.order_id,
        group_id = %pair.group_id(),
        amount = pair.credit.amount,
        "Charge recorded, order processed"
    );

    Ok(pair)
}

/// Persist a renewal charge and advance its subscription in the same atomic
/// step.
///
/// # Errors
/// - `Store(StaleSubscription)` if the period was billed concurrently; no
///   rows are written in that case
pub async fn record_renewal<S: Store + ?Sized>(
    store: &S,
    spec: &DoubleEntrySpec,
    reschedule: Reschedule,
) -> Result<LedgerPair> {
    let pair = append_spec(
        store,
        spec,
        AppendOptions { reschedule: Some(reschedule), ..AppendOptions::default() },
    )
    .await?;

    info!(
        subscription_id = %reschedule.subscription_id,
        group_id = %pair.group_id(),
        next_period_start = %reschedule.next_period_start,
        "Renewal recorded"
    );

    Ok(pair)
}

// =============================================================================
// Tests
// =============================================================================
