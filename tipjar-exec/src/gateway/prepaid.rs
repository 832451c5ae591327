//! Prepaid card gateway: spends a balance held in the store.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info};

use tipjar_domain::{FeeBreakdown, PaymentMethodKind, Transaction};
use tipjar_engine::{host_fee, percent_of};
use tipjar_ledger::Ledger;
use tipjar_store::{Store, StoreError};

use crate::error::{ExecError, ExecResult};
use crate::gateway::{ChargeContext, PaymentGateway, RefundResult};

/// Gateway for `prepaid` payment methods.
pub struct PrepaidGateway<S: Store> {
    store: Arc<S>,
    ledger: Ledger<S>,
}

impl<S: Store> PrepaidGateway<S> {
    pub fn new(store: Arc<S>, ledger: Ledger<S>) -> Self {
        Self { store, ledger }
    }
}

#[async_trait]
impl<S: Store + 'static> PaymentGateway for PrepaidGateway<S> {
    fn kind(&self) -> PaymentMethodKind {
        PaymentMethodKind::Prepaid
    }

    async fn process_order(&self, ctx: &ChargeContext) -> ExecResult<Option<Transaction>> {
        let amount = ctx.amount();
        let payment_method_id = ctx.payment_method.id;

        let remaining = self
            .store
            .payment_methods()
            .debit_balance(payment_method_id, amount)
            .await
            .map_err(|e| match e {
                StoreError::InsufficientBalance { balance, requested, .. } => ExecError::Gateway(
                    format!("prepaid balance {} is below {}", balance, requested),
                ),
                other => ExecError::Store(other),
            })?;

        let fees = FeeBreakdown {
            host_fee: host_fee(amount, ctx.fees.host_fee_percent)?,
            platform_fee: percent_of(amount, ctx.fees.platform_fee_percent)?,
            processor_fee: 0,
        };
        let spec = ctx.charge_spec(
            amount,
            ctx.order.currency.clone(),
            Decimal::ONE,
            fees,
            serde_json::json!({ "balance_after": remaining }),
        );

        match ctx.record(&self.ledger, &spec).await {
            Ok(pair) => {
                info!(order_id = %ctx.order.id, amount, remaining, "Prepaid charge recorded");
                Ok(Some(pair.credit))
            },
            Err(e) => {
                if let Err(restore) =
                    self.store.payment_methods().credit_balance(payment_method_id, amount).await
                {
                    error!(
                        %payment_method_id,
                        amount,
                        error = %restore,
                        "Failed to restore prepaid balance after ledger failure"
                    );
                }
                Err(e)
            },
        }
    }

    async fn refund_transaction(&self, transaction: &Transaction) -> ExecResult<RefundResult> {
        let credit = self.ledger.collective_row(transaction).await?;
        let payment_method_id = credit.payment_method_id.ok_or_else(|| {
            ExecError::Validation(format!("transaction {} has no payment method", credit.id))
        })?;

        self.store.payment_methods().credit_balance(payment_method_id, credit.amount).await?;

        match self.ledger.create_refund(&credit, 0, serde_json::json!({})).await {
            Ok(pair) => {
                info!(transaction_id = %credit.id, amount = credit.amount, "Prepaid refund recorded");
                Ok(RefundResult::from((pair, 0)))
            },
            Err(e) => {
                if let Err(restore) = self
                    .store
                    .payment_methods()
                    .debit_balance(payment_method_id, credit.amount)
                    .await
                {
                    error!(
                        %payment_method_id,
                        error = %restore,
                        "Failed to take back prepaid refund after ledger failure"
                    );
                }
                Err(e.into())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ChargePurpose, FeePlan};
    use tipjar_domain::{Currency, FeePercent, Order, Party, PaymentMethod};
    use tipjar_store::MemoryStore;

    async fn setup(balance: i64) -> (Arc<MemoryStore>, PrepaidGateway<MemoryStore>, ChargeContext) {
        let store = Arc::new(MemoryStore::new());
        let host = Party::new_organization("Host", Currency::usd());
        let collective =
            Party::new_collective("Collective", Currency::usd(), host.id, FeePercent::zero());
        let user = Party::new_user("Alice", "alice@example.com");

        let mut card =
            PaymentMethod::new(PaymentMethodKind::Prepaid, user.id, "gift_1", Currency::usd());
        card.balance = Some(balance);
        store.payment_methods().insert(&card).await.unwrap();

        let mut order =
            Order::new(user.id, collective.id, user.id, 1000, Currency::usd(), 1).unwrap();
        order.payment_method_id = Some(card.id);
        store.orders().insert(&order, None).await.unwrap();

        let ctx = ChargeContext {
            order,
            payment_method: card,
            collective,
            host: Some(host),
            fees: FeePlan {
                host_fee_percent: FeePercent::zero(),
                platform_fee_percent: FeePercent::zero(),
            },
            purpose: ChargePurpose::Initial,
            settle_order: true,
            reschedule: None,
            created_by: user.id,
        };
        let gateway = PrepaidGateway::new(store.clone(), Ledger::new(store.clone()));
        (store, gateway, ctx)
    }

    #[tokio::test]
    async fn test_charge_spends_balance() {
        let (store, gateway, ctx) = setup(1500).await;

        let credit = gateway.process_order(&ctx).await.unwrap().unwrap();
        assert_eq!(credit.net_amount_in_collective_currency, 1000);

        let card = store.payment_methods().find_by_id(ctx.payment_method.id).await.unwrap();
        assert_eq!(card.unwrap().balance, Some(500));
    }

    #[tokio::test]
    async fn test_insufficient_balance_is_gateway_error() {
        let (store, gateway, ctx) = setup(999).await;

        let result = gateway.process_order(&ctx).await;
        assert!(matches!(result, Err(ExecError::Gateway(_))));
        assert_eq!(store.transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_refund_restores_balance() {
        let (store, gateway, ctx) = setup(1000).await;
        let credit = gateway.process_order(&ctx).await.unwrap().unwrap();

        let refund = gateway.refund_transaction(&credit).await.unwrap();
        assert_eq!(refund.refunded_processor_fee, 0);

        let card = store.payment_methods().find_by_id(ctx.payment_method.id).await.unwrap();
        assert_eq!(card.unwrap().balance, Some(1000));
    }
}
