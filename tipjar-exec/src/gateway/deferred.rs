//! Bank transfer and cryptocurrency gateways.
//!
//! Both settle asynchronously: charging only acknowledges the order, the
//! ledger pair is written once the funds arrive.

use async_trait::async_trait;
use tracing::info;

use tipjar_domain::{PaymentMethodKind, Transaction};

use crate::error::{ExecError, ExecResult};
use crate::gateway::{ChargeContext, PaymentGateway, RefundResult};

/// Gateway for variants settled outside the request.
pub struct DeferredGateway {
    kind: PaymentMethodKind,
}

impl DeferredGateway {
    /// Bank transfer gateway
    pub fn bank_transfer() -> Self {
        Self { kind: PaymentMethodKind::BankTransfer }
    }

    /// Cryptocurrency gateway
    pub fn crypto() -> Self {
        Self { kind: PaymentMethodKind::Crypto }
    }
}

#[async_trait]
impl PaymentGateway for DeferredGateway {
    fn kind(&self) -> PaymentMethodKind {
        self.kind
    }

    async fn process_order(&self, ctx: &ChargeContext) -> ExecResult<Option<Transaction>> {
        info!(
            order_id = %ctx.order.id,
            kind = %self.kind,
            amount = ctx.amount(),
            "Awaiting asynchronous settlement"
        );
        Ok(None)
    }

    async fn refund_transaction(&self, transaction: &Transaction) -> ExecResult<RefundResult> {
        Err(ExecError::Unsupported(format!(
            "{} payments cannot be refunded (transaction {})",
            self.kind, transaction.id
        )))
    }
}
