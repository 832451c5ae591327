//! Refund flows through the daemon's executor.
//!
//! Run with: `cargo test -p tipjard --test refund_flow`

use std::sync::Arc;

use tipjar_exec::{Caller, ErrorKind, OrderRequest, SourceParty, StubProcessor};
use tipjar_store::MemoryStore;
use tipjar_testkit::Fixture;
use tipjard::{Config, Daemon};

async fn charged(stub: StubProcessor) -> (Fixture, Daemon<MemoryStore>, tipjar_domain::Transaction) {
    let fx = Fixture::new().await.unwrap();
    let daemon = Daemon::new(Config::test(), fx.store.clone(), Arc::new(stub)).unwrap();

    let mut request = OrderRequest::new(fx.collective.id, SourceParty::Existing(fx.user.id));
    request.total_amount = Some(5000);
    request.payment_method_id = Some(fx.card.id);
    let outcome = daemon.executor().create_order(&Caller::user(fx.user.id), request).await.unwrap();
    let credit = outcome.transaction.unwrap();

    (fx, daemon, credit)
}

#[tokio::test]
async fn test_refund_links_both_groups_and_zeroes_balances() {
    let (fx, daemon, credit) = charged(StubProcessor::new()).await;
    let ledger = daemon.executor().ledger();

    let refund = daemon.executor().refund_transaction(&Caller::user(fx.user.id), credit.id).await.unwrap();

    assert_eq!(refund.refund_credit.group_id, refund.refund_debit.group_id);
    assert_ne!(refund.refund_credit.group_id, credit.group_id);

    for row in ledger.find_group(credit.group_id).await.unwrap() {
        let linked = row.refund_id.expect("original row must point at its refund");
        assert!(linked == refund.refund_credit.id || linked == refund.refund_debit.id);
    }
    assert!(refund.refund_credit.refund_id.is_some());
    assert!(refund.refund_debit.refund_id.is_some());

    assert_eq!(ledger.balance(fx.collective.id).await.unwrap(), 0);
    assert_eq!(ledger.balance(fx.user.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_refund_with_returned_processor_fee() {
    let (fx, daemon, credit) = charged(StubProcessor::new().with_refunded_processor_fee(true)).await;

    let refund = daemon.executor().refund_transaction(&Caller::user(fx.user.id), credit.id).await.unwrap();

    assert_eq!(refund.refunded_processor_fee, 175);
    assert_eq!(refund.refund_credit.payment_processor_fee_in_host_currency, Some(175));
    assert_eq!(refund.refund_credit.host_fee_in_host_currency, Some(500));
}

#[tokio::test]
async fn test_refund_by_collective_admin() {
    let (fx, daemon, credit) = charged(StubProcessor::new()).await;
    let admin = fx.add_user("Ada", "ada@example.com").await.unwrap();

    let caller = Caller::user(admin.id).with_admin_of(fx.collective.id);
    assert!(daemon.executor().refund_transaction(&caller, credit.id).await.is_ok());

    let err = daemon.executor().refund_transaction(&caller, credit.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationFailed);
}
