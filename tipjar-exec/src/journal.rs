//! Charge journal for idempotent execution.
//!
//! The charge journal ensures that each charge of an order is attempted by
//! at most one caller at a time and never again once it succeeded.
//!
//! # Flow
//!
//! 1. Claim the attempt (before calling the processor)
//! 2. Execute the charge
//! 3. Complete the attempt (with outcome)
//!
//! A failed or deferred attempt may be claimed again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use tipjar_domain::{OrderId, TransactionId};

use crate::error::{ExecError, ExecResult};
use crate::gateway::ChargePurpose;

// =============================================================================
// Attempt Types
// =============================================================================

/// One charge attempt for an order and purpose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeAttempt {
    pub order_id: OrderId,
    pub purpose: ChargePurpose,
    pub status: AttemptStatus,
    /// Number of times this charge was claimed
    pub attempts: u32,
    pub claimed_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<AttemptOutcome>,
}

impl ChargeAttempt {
    /// Whether a new claim must be rejected
    pub fn blocks_retry(&self) -> bool {
        matches!(self.status, AttemptStatus::Executing | AttemptStatus::Succeeded)
    }
}

/// Status of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptStatus {
    /// Processor call in flight
    Executing,
    /// Ledger pair written
    Succeeded,
    /// Settlement will happen asynchronously
    Deferred,
    /// Charge failed; retry allowed
    Failed,
}

/// Outcome recorded when an attempt completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    /// CREDIT row written for the charge
    Succeeded(TransactionId),
    /// No transaction yet
    Deferred,
    /// Error message
    Failed(String),
}

impl AttemptOutcome {
    fn status(&self) -> AttemptStatus {
        match self {
            AttemptOutcome::Succeeded(_) => AttemptStatus::Succeeded,
            AttemptOutcome::Deferred => AttemptStatus::Deferred,
            AttemptOutcome::Failed(_) => AttemptStatus::Failed,
        }
    }
}

// =============================================================================
// Charge Journal
// =============================================================================

type AttemptKey = (OrderId, String);

/// Journal of charge attempts keyed by order and purpose.
///
/// Kept in memory: the durable guard against double settlement is the
/// order's `processed_at`, checked atomically by the ledger.
pub struct ChargeJournal {
    attempts: RwLock<HashMap<AttemptKey, ChargeAttempt>>,
}

impl ChargeJournal {
    /// Create a new charge journal.
    pub fn new() -> Self {
        Self {
            attempts: RwLock::new(HashMap::new()),
        }
    }

    /// Claim a charge before calling the processor.
    ///
    /// Returns `AlreadyProcessed` if the same charge is executing or succeeded.
    pub fn claim(&self, order_id: OrderId, purpose: &ChargePurpose) -> ExecResult<()> {
        let mut attempts = self.attempts.write().map_err(|e| {
            ExecError::ChargeJournal(format!("Failed to acquire write lock: {}", e))
        })?;

        let key = (order_id, purpose.tag());
        let now = Utc::now();
        match attempts.get_mut(&key) {
            Some(attempt) if attempt.blocks_retry() => Err(ExecError::AlreadyProcessed(format!(
                "{} charge of order {} is {:?}",
                purpose.tag(),
                order_id,
                attempt.status
            ))),
            Some(attempt) => {
                attempt.status = AttemptStatus::Executing;
                attempt.attempts += 1;
                attempt.claimed_at = now;
                attempt.completed_at = None;
                attempt.outcome = None;
                Ok(())
            },
            None => {
                attempts.insert(
                    key,
                    ChargeAttempt {
                        order_id,
                        purpose: purpose.clone(),
                        status: AttemptStatus::Executing,
                        attempts: 1,
                        claimed_at: now,
                        completed_at: None,
                        outcome: None,
                    },
                );
                Ok(())
            },
        }
    }

    /// Get the current attempt state.
    pub fn get(&self, order_id: OrderId, purpose: &ChargePurpose) -> ExecResult<Option<ChargeAttempt>> {
        let attempts = self.attempts.read().map_err(|e| {
            ExecError::ChargeJournal(format!("Failed to acquire read lock: {}", e))
        })?;

        Ok(attempts.get(&(order_id, purpose.tag())).cloned())
    }

    /// Complete a claimed attempt with its outcome.
    pub fn complete(
        &self,
        order_id: OrderId,
        purpose: &ChargePurpose,
        outcome: AttemptOutcome,
    ) -> ExecResult<()> {
        let mut attempts = self.attempts.write().map_err(|e| {
            ExecError::ChargeJournal(format!("Failed to acquire write lock: {}", e))
        })?;

        let attempt = attempts.get_mut(&(order_id, purpose.tag())).ok_or_else(|| {
            ExecError::ChargeJournal(format!(
                "No {} attempt claimed for order {}",
                purpose.tag(),
                order_id
            ))
        })?;

        attempt.status = outcome.status();
        attempt.completed_at = Some(Utc::now());
        attempt.outcome = Some(outcome);
        Ok(())
    }

    /// Attempts still executing (for monitoring after a restart).
    pub fn executing(&self) -> ExecResult<Vec<ChargeAttempt>> {
        let attempts = self.attempts.read().map_err(|e| {
            ExecError::ChargeJournal(format!("Failed to acquire read lock: {}", e))
        })?;

        Ok(attempts
            .values()
            .filter(|a| a.status == AttemptStatus::Executing)
            .cloned()
            .collect())
    }
}

impl Default for ChargeJournal {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_claim_and_complete() {
        let journal = ChargeJournal::new();
        let order_id = Uuid::now_v7();

        journal.claim(order_id, &ChargePurpose::Initial).unwrap();
        assert_eq!(journal.executing().unwrap().len(), 1);

        let tx_id = Uuid::now_v7();
        journal
            .complete(order_id, &ChargePurpose::Initial, AttemptOutcome::Succeeded(tx_id))
            .unwrap();

        let attempt = journal.get(order_id, &ChargePurpose::Initial).unwrap().unwrap();
        assert_eq!(attempt.status, AttemptStatus::Succeeded);
        assert_eq!(attempt.outcome, Some(AttemptOutcome::Succeeded(tx_id)));
        assert!(journal.executing().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_claim_rejected() {
        let journal = ChargeJournal::new();
        let order_id = Uuid::now_v7();

        journal.claim(order_id, &ChargePurpose::Initial).unwrap();
        let second = journal.claim(order_id, &ChargePurpose::Initial);
        assert!(matches!(second, Err(ExecError::AlreadyProcessed(_))));

        // A different purpose is a different charge
        journal.claim(order_id, &ChargePurpose::Matching).unwrap();
    }

    #[test]
    fn test_failed_attempt_can_be_retried() {
        let journal = ChargeJournal::new();
        let order_id = Uuid::now_v7();

        journal.claim(order_id, &ChargePurpose::Initial).unwrap();
        journal
            .complete(order_id, &ChargePurpose::Initial, AttemptOutcome::Failed("declined".into()))
            .unwrap();

        journal.claim(order_id, &ChargePurpose::Initial).unwrap();
        let attempt = journal.get(order_id, &ChargePurpose::Initial).unwrap().unwrap();
        assert_eq!(attempt.attempts, 2);
        assert_eq!(attempt.status, AttemptStatus::Executing);
    }

    #[test]
    fn test_succeeded_attempt_blocks_retry() {
        let journal = ChargeJournal::new();
        let order_id = Uuid::now_v7();

        journal.claim(order_id, &ChargePurpose::Initial).unwrap();
        journal
            .complete(order_id, &ChargePurpose::Initial, AttemptOutcome::Succeeded(Uuid::now_v7()))
            .unwrap();

        assert!(journal.claim(order_id, &ChargePurpose::Initial).is_err());
    }

    #[test]
    fn test_complete_without_claim_fails() {
        let journal = ChargeJournal::new();
        let result =
            journal.complete(Uuid::now_v7(), &ChargePurpose::Initial, AttemptOutcome::Deferred);
        assert!(matches!(result, Err(ExecError::ChargeJournal(_))));
    }
}
