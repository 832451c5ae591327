//! Renewal biller: charges subscriptions whose next charge is due.
//!
//! Each renewal writes a new ledger pair linked to the subscription's order
//! and advances the subscription past the billed period in the same write.
//! The order itself was settled by its first charge and is left untouched.
//! Schedule writes touch only dates and the retry count, so a cancellation
//! racing a renewal is never undone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use tipjar_domain::{Subscription, SubscriptionId, TransactionId};
use tipjar_engine::{next_billing_dates, next_charge_retry_count, SubscriptionEvent};
use tipjar_store::{Reschedule, Store};

use crate::error::{ErrorKind, ExecError, ExecResult};
use crate::executor::OrderExecutor;
use crate::gateway::ChargePurpose;
use crate::journal::AttemptOutcome;

/// Summary of one renewal pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalReport {
    /// Subscriptions found due
    pub due: usize,
    /// CREDIT rows written
    pub charged: Vec<TransactionId>,
    /// Renewals settling asynchronously
    pub deferred: usize,
    /// Renewals that failed
    pub failed: usize,
    /// Subscriptions whose retries exceeded the maximum
    pub past_due: Vec<SubscriptionId>,
}

/// Periodic job charging due subscriptions through their order's gateway.
pub struct RenewalBiller<S: Store> {
    executor: Arc<OrderExecutor<S>>,
}

impl<S: Store + 'static> RenewalBiller<S> {
    pub fn new(executor: Arc<OrderExecutor<S>>) -> Self {
        Self { executor }
    }

    /// Charge every active subscription due at `now`.
    ///
    /// A failing subscription never stops the pass; only listing the due
    /// subscriptions can fail.
    pub async fn run_once(&self, now: DateTime<Utc>) -> ExecResult<RenewalReport> {
        let due = self.executor.store.subscriptions().find_due(now).await?;
        let mut report = RenewalReport { due: due.len(), ..RenewalReport::default() };

        for subscription in due {
            let subscription_id = subscription.id;
            if let Err(e) = self.renew(subscription, now, &mut report).await {
                error!(%subscription_id, error = %e, "Renewal could not be recorded");
                report.failed += 1;
            }
        }

        if report.due > 0 {
            info!(
                due = report.due,
                charged = report.charged.len(),
                deferred = report.deferred,
                failed = report.failed,
                past_due = report.past_due.len(),
                "Renewal pass complete"
            );
        }
        Ok(report)
    }

    async fn renew(
        &self,
        listed: Subscription,
        now: DateTime<Utc>,
        report: &mut RenewalReport,
    ) -> ExecResult<()> {
        let executor = &self.executor;

        // The listing may be stale by the time this subscription's turn comes
        let subscription = match executor.store.subscriptions().find_by_id(listed.id).await? {
            Some(current)
                if current.is_active
                    && current.next_period_start == listed.next_period_start
                    && current.next_charge_date <= now =>
            {
                current
            },
            _ => {
                debug!(subscription_id = %listed.id, "Renewal no longer due");
                return Ok(());
            },
        };

        let purpose = ChargePurpose::Renewal(subscription.next_period_start);
        let order_id = subscription.order_id;

        match executor.journal.claim(order_id, &purpose) {
            Ok(()) => {},
            Err(ExecError::AlreadyProcessed(reason)) => {
                debug!(subscription_id = %subscription.id, %reason, "Renewal already handled");
                return Ok(());
            },
            Err(e) => return Err(e),
        }

        let result = match self.reschedule(&subscription, SubscriptionEvent::Success, now) {
            Ok(advance) => {
                let charged = self.charge(&subscription, purpose.clone(), advance).await;
                charged.map(|tx| (tx, advance))
            },
            Err(e) => Err(e),
        };

        // Schedule still to write; a recorded charge advanced it with its pair
        let (pending, outcome) = match result {
            Ok((Some(tx), _)) => {
                report.charged.push(tx.id);
                (None, AttemptOutcome::Succeeded(tx.id))
            },
            Ok((None, advance)) => {
                report.deferred += 1;
                (Some(Ok(advance)), AttemptOutcome::Deferred)
            },
            Err(e) if e.kind() == ErrorKind::AlreadyProcessed => {
                error!(
                    subscription_id = %subscription.id,
                    %order_id,
                    period = %subscription.next_period_start,
                    error = %e,
                    "Renewal charged for a period already billed; reconcile by idempotency key"
                );
                report.failed += 1;
                (None, AttemptOutcome::Failed(e.to_string()))
            },
            Err(e) => {
                warn!(
                    subscription_id = %subscription.id,
                    %order_id,
                    error = %e,
                    retry = subscription.charge_retry_count + 1,
                    "Renewal charge failed"
                );
                report.failed += 1;
                let retry = self.reschedule(&subscription, SubscriptionEvent::Failure, now);
                (Some(retry), AttemptOutcome::Failed(e.to_string()))
            },
        };

        let written = match pending {
            Some(Ok(reschedule)) => executor
                .store
                .subscriptions()
                .reschedule(&reschedule)
                .await
                .map(Some)
                .map_err(ExecError::from),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        };
        let rescheduled = match written {
            Ok(rescheduled) => rescheduled,
            Err(e) => {
                // Leave the attempt retryable; the schedule never moved
                let failed = AttemptOutcome::Failed(e.to_string());
                executor.journal.complete(order_id, &purpose, failed)?;
                return Err(e);
            },
        };
        executor.journal.complete(order_id, &purpose, outcome)?;

        if let Some(subscription) = rescheduled {
            if subscription.charge_retry_count > executor.config.billing.max_retries {
                warn!(
                    subscription_id = %subscription.id,
                    retries = subscription.charge_retry_count,
                    "Subscription is past due"
                );
                report.past_due.push(subscription.id);
            }
            debug!(
                subscription_id = %subscription.id,
                next_charge_date = %subscription.next_charge_date,
                "Subscription rescheduled"
            );
        }
        Ok(())
    }

    /// Schedule following `event` for the period `subscription` is at.
    fn reschedule(
        &self,
        subscription: &Subscription,
        event: SubscriptionEvent,
        now: DateTime<Utc>,
    ) -> ExecResult<Reschedule> {
        let dates = next_billing_dates(
            event,
            subscription.interval,
            Some(subscription.into()),
            now,
            &self.executor.config.billing,
        )?;
        Ok(Reschedule {
            subscription_id: subscription.id,
            expected_period_start: subscription.next_period_start,
            next_charge_date: dates.next_charge_date,
            next_period_start: dates.next_period_start,
            charge_retry_count: next_charge_retry_count(event, subscription.charge_retry_count),
        })
    }

    /// Charge one period; a recorded charge applies `advance` atomically
    /// with its ledger pair.
    async fn charge(
        &self,
        subscription: &Subscription,
        purpose: ChargePurpose,
        advance: Reschedule,
    ) -> ExecResult<Option<tipjar_domain::Transaction>> {
        let executor = &self.executor;
        let mut order = executor.find_order(subscription.order_id).await?;
        order.total_amount = subscription.amount;

        let mut ctx = executor.charge_context(&order, purpose, false).await?;
        ctx.reschedule = Some(advance);
        let gateway = executor.registry.get(ctx.payment_method.kind)?;
        gateway.process_order(&ctx).await
    }
}
