//! Card gateway: charges through the external processor.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

use tipjar_domain::{FeeBreakdown, PaymentMethodKind, Transaction};
use tipjar_engine::{extract_fees, fx_rate, host_fee, percent_of, EngineError};
use tipjar_ledger::Ledger;
use tipjar_store::Store;

use crate::error::{ExecError, ExecResult};
use crate::gateway::{data_str, ChargeContext, PaymentGateway, RefundResult};
use crate::idempotency::{charge_idempotency_key, refund_idempotency_key};
use crate::ports::{ChargeReceipt, ChargeRequest, PaymentProcessor};

/// Gateway for `card` payment methods.
pub struct CardGateway<S: Store> {
    ledger: Ledger<S>,
    processor: Arc<dyn PaymentProcessor>,
}

impl<S: Store> CardGateway<S> {
    /// Create a card gateway over `processor`.
    pub fn new(ledger: Ledger<S>, processor: Arc<dyn PaymentProcessor>) -> Self {
        Self { ledger, processor }
    }

    /// Charge, reconciling a timeout against the processor.
    ///
    /// A charge is never re-issued after a timeout: the processor is asked
    /// whether the idempotency key went through.
    async fn charge(&self, request: &ChargeRequest) -> ExecResult<ChargeReceipt> {
        match self.processor.charge(request).await {
            Ok(receipt) => Ok(receipt),
            Err(ExecError::Timeout(reason)) => {
                warn!(
                    key = %request.idempotency_key,
                    %reason,
                    "Charge timed out, reconciling with processor"
                );
                match self.processor.find_charge(&request.idempotency_key).await? {
                    Some(receipt) => {
                        info!(charge_id = %receipt.charge_id, "Timed out charge found at processor");
                        Ok(receipt)
                    },
                    None => Err(ExecError::Gateway(format!(
                        "charge timed out and was not created ({})",
                        reason
                    ))),
                }
            },
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<S: Store + 'static> PaymentGateway for CardGateway<S> {
    fn kind(&self) -> PaymentMethodKind {
        PaymentMethodKind::Card
    }

    async fn process_order(&self, ctx: &ChargeContext) -> ExecResult<Option<Transaction>> {
        let order = &ctx.order;
        let idempotency_key = charge_idempotency_key(order.id, &ctx.purpose, ctx.amount());
        let request = ChargeRequest {
            idempotency_key: idempotency_key.clone(),
            amount: ctx.amount(),
            currency: order.currency.clone(),
            source_token: ctx.payment_method.token.clone(),
            description: order.description.clone(),
            application_fee: percent_of(ctx.amount(), ctx.fees.platform_fee_percent)?,
        };

        let receipt = self.charge(&request).await?;
        let settlement = self.processor.settlement(&receipt.settlement_id).await?;

        let processor_fees = extract_fees(&settlement)?;
        let amount_in_host_currency = settlement.amount.ok_or_else(|| {
            EngineError::MalformedSettlement(format!("settlement {} has no gross", settlement.id))
        })?;
        let fees = FeeBreakdown {
            host_fee: host_fee(amount_in_host_currency, ctx.fees.host_fee_percent)?,
            platform_fee: processor_fees.platform_fee,
            processor_fee: processor_fees.processor_fee,
        };

        let spec = ctx.charge_spec(
            amount_in_host_currency,
            settlement.currency.clone(),
            fx_rate(order.total_amount, amount_in_host_currency)?,
            fees,
            serde_json::json!({
                "charge_id": receipt.charge_id,
                "settlement_id": receipt.settlement_id,
                "idempotency_key": idempotency_key,
            }),
        );

        let pair = ctx.record(&self.ledger, &spec).await.map_err(|e| {
            // Money moved at the processor but the ledger refused it
            error!(
                order_id = %order.id,
                charge_id = %receipt.charge_id,
                error = %e,
                "Charge succeeded but ledger write failed"
            );
            e
        })?;

        info!(
            order_id = %order.id,
            charge_id = %receipt.charge_id,
            amount = ctx.amount(),
            purpose = %ctx.purpose.tag(),
            "Card charge recorded"
        );
        Ok(Some(pair.credit))
    }

    async fn refund_transaction(&self, transaction: &Transaction) -> ExecResult<RefundResult> {
        let credit = self.ledger.collective_row(transaction).await?;
        let charge_id = data_str(&credit, "charge_id")?;

        let receipt = self
            .processor
            .refund(charge_id, &refund_idempotency_key(credit.group_id))
            .await?;
        let settlement = self.processor.settlement(&receipt.settlement_id).await?;
        let refunded_processor_fee = extract_fees(&settlement)?.processor_fee;

        let pair = self
            .ledger
            .create_refund(
                &credit,
                refunded_processor_fee,
                serde_json::json!({
                    "refund_id": receipt.refund_id,
                    "charge_id": receipt.charge_id,
                    "settlement_id": receipt.settlement_id,
                }),
            )
            .await?;

        info!(
            transaction_id = %credit.id,
            refund_id = %receipt.refund_id,
            refunded_processor_fee,
            "Card refund recorded"
        );
        Ok(RefundResult::from((pair, refunded_processor_fee)))
    }
}
