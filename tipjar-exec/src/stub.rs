//! Stub implementations for testing.
//!
//! Simulates a card processor without making real API calls: fees follow a
//! fixed schedule (2.9% + 30), settlements are kept in memory and failures
//! or timeouts can be injected.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tipjar_engine::{FeeDetail, Settlement};

use crate::error::ExecError;
use crate::ports::{ChargeReceipt, ChargeRequest, PaymentProcessor, RefundReceipt};

/// Source token the stub always declines.
pub const DECLINED_TOKEN: &str = "tok_chargeDeclined";

/// Where an injected timeout happens relative to the charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedTimeout {
    /// The charge never reached the processor
    BeforeCharge,
    /// The charge went through but the response was lost
    AfterCharge,
}

#[derive(Default)]
struct StubState {
    charges: HashMap<String, ChargeReceipt>,
    settlements: HashMap<String, Settlement>,
    refunds: HashMap<String, RefundReceipt>,
    counter: u64,
    fail_next: bool,
    timeout_next: Option<SimulatedTimeout>,
    charge_count: u64,
}

impl StubState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{}_stub_{}", prefix, self.counter)
    }

    fn take_failure(&mut self) -> bool {
        std::mem::take(&mut self.fail_next)
    }
}

/// Stub processor for testing.
pub struct StubProcessor {
    state: Mutex<StubState>,
    /// Percentage part of the processing fee (0.029 = 2.9%)
    fee_rate: Decimal,
    /// Fixed part of the processing fee, in minor units
    fee_fixed: i64,
    /// Whether refunds give the processing fee back
    refund_processor_fee: bool,
}

impl StubProcessor {
    /// Create a stub charging 2.9% + 30 that keeps its fee on refunds.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StubState::default()),
            fee_rate: Decimal::new(29, 3),
            fee_fixed: 30,
            refund_processor_fee: false,
        }
    }

    /// Configure whether refunds return the processing fee.
    pub fn with_refunded_processor_fee(mut self, refund: bool) -> Self {
        self.refund_processor_fee = refund;
        self
    }

    fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configure the next call to fail with a decline.
    pub fn set_fail_next(&self, fail: bool) {
        self.state().fail_next = fail;
    }

    /// Configure the next charge to time out.
    pub fn set_timeout_next(&self, timeout: Option<SimulatedTimeout>) {
        self.state().timeout_next = timeout;
    }

    /// Number of charges actually created.
    pub fn charge_count(&self) -> u64 {
        self.state().charge_count
    }

    /// Processing fee for an amount.
    pub fn processing_fee(&self, amount: i64) -> i64 {
        let variable = (Decimal::from(amount) * self.fee_rate)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .unwrap_or(0);
        variable + self.fee_fixed
    }

    fn create_charge(&self, state: &mut StubState, request: &ChargeRequest) -> ChargeReceipt {
        let charge_id = state.next_id("ch");
        let settlement_id = state.next_id("txn");

        let mut fee_details = vec![FeeDetail::new("stripe_fee", self.processing_fee(request.amount))];
        if request.application_fee > 0 {
            fee_details.push(FeeDetail::new("application_fee", request.application_fee));
        }
        state.settlements.insert(
            settlement_id.clone(),
            Settlement {
                id: settlement_id.clone(),
                amount: Some(request.amount),
                currency: request.currency.clone(),
                fee_details,
            },
        );

        let receipt = ChargeReceipt {
            charge_id,
            settlement_id,
            amount: request.amount,
            currency: request.currency.clone(),
            created_at: Utc::now(),
        };
        state.charges.insert(request.idempotency_key.clone(), receipt.clone());
        state.charge_count += 1;
        receipt
    }
}

impl Default for StubProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentProcessor for StubProcessor {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, ExecError> {
        let mut state = self.state();

        // Idempotent replay
        if let Some(existing) = state.charges.get(&request.idempotency_key) {
            tracing::debug!(key = %request.idempotency_key, "Stub: replaying charge");
            return Ok(existing.clone());
        }

        if state.take_failure() || request.source_token == DECLINED_TOKEN {
            return Err(ExecError::Gateway("Simulated card decline".to_string()));
        }

        match state.timeout_next.take() {
            Some(SimulatedTimeout::BeforeCharge) => {
                Err(ExecError::Timeout("Simulated timeout before charge".to_string()))
            },
            Some(SimulatedTimeout::AfterCharge) => {
                self.create_charge(&mut state, request);
                Err(ExecError::Timeout("Simulated timeout after charge".to_string()))
            },
            None => Ok(self.create_charge(&mut state, request)),
        }
    }

    async fn find_charge(&self, idempotency_key: &str) -> Result<Option<ChargeReceipt>, ExecError> {
        Ok(self.state().charges.get(idempotency_key).cloned())
    }

    async fn refund(
        &self,
        charge_id: &str,
        idempotency_key: &str,
    ) -> Result<RefundReceipt, ExecError> {
        let mut state = self.state();

        if let Some(existing) = state.refunds.get(idempotency_key) {
            return Ok(existing.clone());
        }
        if state.take_failure() {
            return Err(ExecError::Gateway("Simulated refund failure".to_string()));
        }

        let charge = state
            .charges
            .values()
            .find(|c| c.charge_id == charge_id)
            .cloned()
            .ok_or_else(|| ExecError::Gateway(format!("No such charge: {}", charge_id)))?;

        let fee_details = if self.refund_processor_fee {
            vec![FeeDetail::new("stripe_fee", -self.processing_fee(charge.amount))]
        } else {
            Vec::new()
        };

        let refund_id = state.next_id("re");
        let settlement_id = state.next_id("txn");
        state.settlements.insert(
            settlement_id.clone(),
            Settlement {
                id: settlement_id.clone(),
                amount: Some(-charge.amount),
                currency: charge.currency.clone(),
                fee_details,
            },
        );

        let receipt = RefundReceipt {
            refund_id,
            charge_id: charge.charge_id,
            settlement_id,
            amount: charge.amount,
        };
        state.refunds.insert(idempotency_key.to_string(), receipt.clone());
        Ok(receipt)
    }

    async fn settlement(&self, settlement_id: &str) -> Result<Settlement, ExecError> {
        self.state()
            .settlements
            .get(settlement_id)
            .cloned()
            .ok_or_else(|| ExecError::Gateway(format!("No such settlement: {}", settlement_id)))
    }

    async fn health_check(&self) -> Result<(), ExecError> {
        if self.state().take_failure() {
            return Err(ExecError::Gateway("Simulated health check failure".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tipjar_domain::Currency;
    use tipjar_engine::extract_fees;

    fn request(key: &str, amount: i64) -> ChargeRequest {
        ChargeRequest {
            idempotency_key: key.to_string(),
            amount,
            currency: Currency::usd(),
            source_token: "tok_visa".to_string(),
            description: "Donation".to_string(),
            application_fee: 250,
        }
    }

    #[tokio::test]
    async fn test_charge_settlement_fees() {
        let stub = StubProcessor::new();
        let receipt = stub.charge(&request("k1", 5000)).await.unwrap();
        let settlement = stub.settlement(&receipt.settlement_id).await.unwrap();

        let fees = extract_fees(&settlement).unwrap();
        assert_eq!(fees.processor_fee, 175);
        assert_eq!(fees.platform_fee, 250);
    }

    #[tokio::test]
    async fn test_same_key_charges_once() {
        let stub = StubProcessor::new();
        let first = stub.charge(&request("k1", 5000)).await.unwrap();
        let second = stub.charge(&request("k1", 5000)).await.unwrap();

        assert_eq!(first.charge_id, second.charge_id);
        assert_eq!(stub.charge_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_after_charge_is_findable() {
        let stub = StubProcessor::new();
        stub.set_timeout_next(Some(SimulatedTimeout::AfterCharge));

        let result = stub.charge(&request("k1", 5000)).await;
        assert!(matches!(result, Err(ExecError::Timeout(_))));
        assert!(stub.find_charge("k1").await.unwrap().is_some());

        stub.set_timeout_next(Some(SimulatedTimeout::BeforeCharge));
        assert!(stub.charge(&request("k2", 5000)).await.is_err());
        assert!(stub.find_charge("k2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refund_settlement_reports_fee_when_refunded() {
        let stub = StubProcessor::new().with_refunded_processor_fee(true);
        let charge = stub.charge(&request("k1", 5000)).await.unwrap();
        let refund = stub.refund(&charge.charge_id, "r1").await.unwrap();
        let settlement = stub.settlement(&refund.settlement_id).await.unwrap();

        assert_eq!(settlement.amount, Some(-5000));
        assert_eq!(extract_fees(&settlement).unwrap().processor_fee, 175);

        let kept = StubProcessor::new();
        let charge = kept.charge(&request("k1", 5000)).await.unwrap();
        let refund = kept.refund(&charge.charge_id, "r1").await.unwrap();
        let settlement = kept.settlement(&refund.settlement_id).await.unwrap();
        assert_eq!(extract_fees(&settlement).unwrap().processor_fee, 0);
    }

    #[tokio::test]
    async fn test_fail_next_declines_once() {
        let stub = StubProcessor::new();
        stub.set_fail_next(true);
        assert!(matches!(stub.charge(&request("k1", 5000)).await, Err(ExecError::Gateway(_))));
        assert!(stub.charge(&request("k1", 5000)).await.is_ok());

        let mut declined = request("k2", 5000);
        declined.source_token = DECLINED_TOKEN.to_string();
        assert!(stub.charge(&declined).await.is_err());
        assert_eq!(stub.charge_count(), 1);
    }
}
