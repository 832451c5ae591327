//! Manual gateway: funds added by a host admin, no processor involved.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::info;

use tipjar_domain::{FeeBreakdown, PaymentMethodKind, Transaction};
use tipjar_engine::{host_fee, percent_of};
use tipjar_ledger::Ledger;
use tipjar_store::Store;

use crate::error::ExecResult;
use crate::gateway::{ChargeContext, PaymentGateway, RefundResult};

/// Gateway for `manual` payment methods and orders without one.
pub struct ManualGateway<S: Store> {
    ledger: Ledger<S>,
}

impl<S: Store> ManualGateway<S> {
    pub fn new(ledger: Ledger<S>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl<S: Store + 'static> PaymentGateway for ManualGateway<S> {
    fn kind(&self) -> PaymentMethodKind {
        PaymentMethodKind::Manual
    }

    async fn process_order(&self, ctx: &ChargeContext) -> ExecResult<Option<Transaction>> {
        let amount = ctx.amount();
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
            serde_json::json!({ "added_by": ctx.created_by }),
        );

        let pair = ctx.record(&self.ledger, &spec).await?;
        info!(order_id = %ctx.order.id, amount, "Manual funds recorded");
        Ok(Some(pair.credit))
    }

    async fn refund_transaction(&self, transaction: &Transaction) -> ExecResult<RefundResult> {
        let credit = self.ledger.collective_row(transaction).await?;
        let pair = self.ledger.create_refund(&credit, 0, serde_json::json!({})).await?;
        info!(transaction_id = %credit.id, "Manual refund recorded");
        Ok(RefundResult::from((pair, 0)))
    }
}
