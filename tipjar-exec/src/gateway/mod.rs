//! Payment gateways.
//!
//! One gateway per payment method variant, resolved through an enum-keyed
//! registry built at startup. Gateways are the only writers of charge and
//! refund pairs, through the ledger.

mod card;
mod deferred;
mod manual;
mod prepaid;

pub use card::CardGateway;
pub use deferred::DeferredGateway;
pub use manual::ManualGateway;
pub use prepaid::PrepaidGateway;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use tipjar_domain::{
    Currency, FeeBreakdown, FeePercent, Order, Party, PartyId, PaymentMethod, PaymentMethodKind,
    Transaction,
};
use tipjar_ledger::{DoubleEntrySpec, Ledger, LedgerPair};
use tipjar_store::{Reschedule, SettleOrder, Store};

use crate::error::{ExecError, ExecResult};
use crate::ports::PaymentProcessor;

// =============================================================================
// Charge Context
// =============================================================================

/// Why a charge is made; part of its idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargePurpose {
    /// First charge of an order
    Initial,
    /// Matching fund charge derived from an order
    Matching,
    /// Subscription renewal for the period starting at the given date
    Renewal(DateTime<Utc>),
}

impl ChargePurpose {
    /// Stable tag
    pub fn tag(&self) -> String {
        match self {
            ChargePurpose::Initial => "initial".to_string(),
            ChargePurpose::Matching => "matching".to_string(),
            ChargePurpose::Renewal(period) => format!("renewal:{}", period.timestamp()),
        }
    }
}

/// Fee percentages applied to a charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePlan {
    pub host_fee_percent: FeePercent,
    pub platform_fee_percent: FeePercent,
}

/// Everything a gateway needs to charge an order.
#[derive(Debug, Clone)]
pub struct ChargeContext {
    /// Order being charged (derived for matching charges)
    pub order: Order,
    pub payment_method: PaymentMethod,
    /// Receiving collective
    pub collective: Party,
    /// Its fiscal host, if any
    pub host: Option<Party>,
    pub fees: FeePlan,
    pub purpose: ChargePurpose,
    /// Set the order's `processed_at` atomically with the ledger write
    pub settle_order: bool,
    /// Advance a subscription atomically with the ledger write
    pub reschedule: Option<Reschedule>,
    pub created_by: PartyId,
}

impl ChargeContext {
    /// Amount to charge, in minor units
    pub fn amount(&self) -> i64 {
        self.order.total_amount
    }

    /// Ledger spec for this charge with the given settlement figures
    pub(crate) fn charge_spec(
        &self,
        amount_in_host_currency: i64,
        host_currency: Currency,
        host_currency_fx_rate: rust_decimal::Decimal,
        fees: FeeBreakdown,
        data: serde_json::Value,
    ) -> DoubleEntrySpec {
        DoubleEntrySpec {
            collective_id: self.order.collective_id,
            from_collective_id: self.order.from_collective_id,
            host_collective_id: self.host.as_ref().map(|h| h.id),
            amount: self.order.total_amount,
            currency: self.order.currency.clone(),
            amount_in_host_currency,
            host_currency,
            host_currency_fx_rate,
            fees,
            order_id: Some(self.order.id),
            payment_method_id: Some(self.payment_method.id),
            created_by: Some(self.created_by),
            group_id: None,
            description: self.order.description.clone(),
            data,
        }
    }

    /// Write the charge pair with the order settlement or subscription
    /// advance it carries
    pub(crate) async fn record<S: Store>(
        &self,
        ledger: &Ledger<S>,
        spec: &DoubleEntrySpec,
    ) -> ExecResult<LedgerPair> {
        let pair = match (self.settle_order, self.reschedule) {
            (true, _) => {
                let settle = SettleOrder { order_id: self.order.id, processed_at: Utc::now() };
                ledger.record_charge(spec, settle).await?
            },
            (false, Some(reschedule)) => ledger.record_renewal(spec, reschedule).await?,
            (false, None) => ledger.create_double_entry(spec).await?,
        };
        Ok(pair)
    }
}

/// The pair written by a refund.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundResult {
    pub refund_credit: Transaction,
    pub refund_debit: Transaction,
    /// Processor fee given back by the processor (0 if kept)
    pub refunded_processor_fee: i64,
}

impl From<(LedgerPair, i64)> for RefundResult {
    fn from((pair, refunded_processor_fee): (LedgerPair, i64)) -> Self {
        Self {
            refund_credit: pair.credit,
            refund_debit: pair.debit,
            refunded_processor_fee,
        }
    }
}

// =============================================================================
// Gateway Trait
// =============================================================================

/// Capability interface of a payment method variant.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Variant served by this gateway
    fn kind(&self) -> PaymentMethodKind;

    /// Charge the order and write its ledger pair.
    ///
    /// Returns `None` when settlement is asynchronous; that is not a failure.
    async fn process_order(&self, ctx: &ChargeContext) -> ExecResult<Option<Transaction>>;

    /// Reverse a transaction at the processor and write the refund pair.
    async fn refund_transaction(&self, transaction: &Transaction) -> ExecResult<RefundResult>;
}

// =============================================================================
// Registry
// =============================================================================

/// Gateways keyed by payment method variant.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<PaymentMethodKind, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every variant: card through `processor`, the others local.
    pub fn standard<S: Store + 'static>(
        store: Arc<S>,
        ledger: Ledger<S>,
        processor: Arc<dyn PaymentProcessor>,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CardGateway::new(ledger.clone(), processor)));
        registry.register(Arc::new(DeferredGateway::bank_transfer()));
        registry.register(Arc::new(DeferredGateway::crypto()));
        registry.register(Arc::new(PrepaidGateway::new(store, ledger.clone())));
        registry.register(Arc::new(ManualGateway::new(ledger)));
        registry
    }

    /// Add or replace the gateway of its variant.
    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>) {
        self.gateways.insert(gateway.kind(), gateway);
    }

    /// Gateway of a variant.
    pub fn get(&self, kind: PaymentMethodKind) -> ExecResult<Arc<dyn PaymentGateway>> {
        self.gateways
            .get(&kind)
            .cloned()
            .ok_or_else(|| ExecError::Unsupported(format!("no gateway registered for {}", kind)))
    }

    /// Registered variants.
    pub fn kinds(&self) -> Vec<PaymentMethodKind> {
        PaymentMethodKind::all()
            .into_iter()
            .filter(|k| self.gateways.contains_key(k))
            .collect()
    }
}

/// Processor metadata field of a ledger row.
pub(crate) fn data_str<'a>(transaction: &'a Transaction, field: &str) -> ExecResult<&'a str> {
    transaction.data.get(field).and_then(|v| v.as_str()).ok_or_else(|| {
        ExecError::Validation(format!(
            "transaction {} has no processor {} to refund",
            transaction.id, field
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubProcessor;
    use tipjar_store::MemoryStore;

    #[test]
    fn test_standard_registry_covers_every_kind() {
        let store = Arc::new(MemoryStore::new());
        let registry = GatewayRegistry::standard(
            store.clone(),
            Ledger::new(store),
            Arc::new(StubProcessor::new()),
        );

        assert_eq!(registry.kinds().len(), PaymentMethodKind::all().len());
        for kind in PaymentMethodKind::all() {
            assert_eq!(registry.get(kind).unwrap().kind(), kind);
        }
    }

    #[test]
    fn test_missing_gateway_is_unsupported() {
        let registry = GatewayRegistry::new();
        assert!(matches!(registry.get(PaymentMethodKind::Card), Err(ExecError::Unsupported(_))));
    }
}
