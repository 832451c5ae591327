//! Ledger Queries

use crate::types::Result;
use tipjar_domain::{OrderId, PartyId, Transaction, TransactionGroupId, TransactionId};
use tipjar_store::Store;

/// All rows of a group, ordered by creation
pub async fn find_group<S: Store + ?Sized>(
    store: &S,
    group_id: TransactionGroupId,
) -> Result<Vec<Transaction>> {
    let mut rows = store.transactions().find_by_group(group_id).await?;
    rows.sort_by_key(|t| t.seq);
    Ok(rows)
}

/// All rows linked to an order, ordered by creation
pub async fn find_by_order<S: Store + ?Sized>(
    store: &S,
    order_id: OrderId,
) -> Result<Vec<Transaction>> {
    let mut rows = store.transactions().find_by_order(order_id).await?;
    rows.sort_by_key(|t| t.seq);
    Ok(rows)
}

/// Find a single row
pub async fn find_by_id<S: Store + ?Sized>(
    store: &S,
    id: TransactionId,
) -> Result<Option<Transaction>> {
    Ok(store.transactions().find_by_id(id).await?)
}

/// Sum of net amounts on a party's ledger, in its currency
pub async fn balance<S: Store + ?Sized>(store: &S, party_id: PartyId) -> Result<i64> {
    let rows = store.transactions().find_by_collective(party_id).await?;
    Ok(rows.iter().map(|t| t.net_amount_in_collective_currency).sum())
}
