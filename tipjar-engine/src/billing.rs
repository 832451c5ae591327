//! Subscription billing calculator.
//!
//! Pure date and retry-count arithmetic for recurring orders. "Now" is
//! always passed in so every function is deterministic.
//!
//! # Events
//!
//! - `New`: first charge happens immediately through the initiating order
//! - `Updated`: payment method replaced after past-due retries; the next
//!   charge is realigned on the original period boundary
//! - `Success`: a renewal went through; the period advances
//! - `Failure`: a renewal failed; the next attempt is pushed back

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use tipjar_domain::{Interval, Subscription};

use crate::error::{EngineError, EngineResult};

/// Billing lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionEvent {
    New,
    Updated,
    Success,
    Failure,
}

/// The two dates driving renewals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingDates {
    pub next_charge_date: DateTime<Utc>,
    pub next_period_start: DateTime<Utc>,
}

impl From<&Subscription> for BillingDates {
    fn from(subscription: &Subscription) -> Self {
        Self {
            next_charge_date: subscription.next_charge_date,
            next_period_start: subscription.next_period_start,
        }
    }
}

/// Retry policy for failed renewals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPolicy {
    /// Delay before retrying a failed renewal
    pub retry_delay: Duration,
    /// Retries after which a subscription is reported as past due
    pub max_retries: u32,
}

impl Default for BillingPolicy {
    fn default() -> Self {
        Self {
            retry_delay: Duration::days(2),
            max_retries: 3,
        }
    }
}

/// Parse an optional interval tag; anything but `month`/`year` is rejected.
pub fn parse_interval(interval: Option<&str>) -> EngineResult<Option<Interval>> {
    match interval {
        None => Ok(None),
        Some(tag) => Ok(Some(tag.parse::<Interval>()?)),
    }
}

fn add_interval(date: DateTime<Utc>, interval: Interval) -> EngineResult<DateTime<Utc>> {
    date.checked_add_months(Months::new(interval.months()))
        .ok_or_else(|| EngineError::Arithmetic(format!("cannot add {} to {}", interval, date)))
}

/// Compute the next charge date and period start.
///
/// `previous` is the subscription's current dates; it is ignored for `New`
/// and treated as starting now when absent.
pub fn next_billing_dates(
    event: SubscriptionEvent,
    interval: Interval,
    previous: Option<BillingDates>,
    now: DateTime<Utc>,
    policy: &BillingPolicy,
) -> EngineResult<BillingDates> {
    // No history: the current period starts now
    let previous = previous.unwrap_or(BillingDates { next_charge_date: now, next_period_start: now });

    match event {
        SubscriptionEvent::New => Ok(BillingDates { next_charge_date: now, next_period_start: now }),
        SubscriptionEvent::Updated => {
            // Walk from the original boundary so failed retries don't drift the cycle
            let mut next = previous.next_period_start;
            while next <= now {
                next = add_interval(next, interval)?;
            }
            Ok(BillingDates { next_charge_date: next, next_period_start: next })
        },
        SubscriptionEvent::Success => {
            let next = add_interval(previous.next_period_start, interval)?;
            Ok(BillingDates { next_charge_date: next, next_period_start: next })
        },
        SubscriptionEvent::Failure => {
            let base = previous.next_charge_date.max(now);
            Ok(BillingDates {
                next_charge_date: base + policy.retry_delay,
                next_period_start: previous.next_period_start,
            })
        },
    }
}

/// Compute the charge retry count after `event`.
pub fn next_charge_retry_count(event: SubscriptionEvent, current: u32) -> u32 {
    match event {
        SubscriptionEvent::Failure => current.saturating_add(1),
        SubscriptionEvent::New | SubscriptionEvent::Updated | SubscriptionEvent::Success => 0,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_new_subscription_charges_now() {
        let now = at(2024, 3, 15);
        let dates = next_billing_dates(
            SubscriptionEvent::New,
            Interval::Month,
            None,
            now,
            &BillingPolicy::default(),
        )
        .unwrap();

        assert_eq!(dates.next_charge_date, now);
        assert_eq!(dates.next_period_start, now);
        assert_eq!(next_charge_retry_count(SubscriptionEvent::New, 4), 0);
    }

    #[test]
    fn test_updated_after_three_retries_realigns_on_period_boundary() {
        let policy = BillingPolicy::default();
        let period_start = at(2024, 1, 10);
        // Three failed retries, two days apart
        let previous = BillingDates {
            next_charge_date: at(2024, 1, 16),
            next_period_start: period_start,
        };
        let now = at(2024, 3, 20);

        let dates =
            next_billing_dates(SubscriptionEvent::Updated, Interval::Month, Some(previous), now, &policy)
                .unwrap();

        assert!(dates.next_charge_date > now);
        assert_eq!(dates.next_charge_date, at(2024, 4, 10));
        assert_eq!(dates.next_period_start, at(2024, 4, 10));
        assert_eq!(next_charge_retry_count(SubscriptionEvent::Updated, 3), 0);
    }

    #[test]
    fn test_updated_on_boundary_moves_strictly_forward() {
        let now = at(2024, 2, 10);
        let previous = BillingDates { next_charge_date: now, next_period_start: now };

        let dates = next_billing_dates(
            SubscriptionEvent::Updated,
            Interval::Month,
            Some(previous),
            now,
            &BillingPolicy::default(),
        )
        .unwrap();

        assert_eq!(dates.next_charge_date, at(2024, 3, 10));
    }

    #[test]
    fn test_yearly_update() {
        let previous = BillingDates {
            next_charge_date: at(2022, 6, 3),
            next_period_start: at(2022, 6, 1),
        };
        let dates = next_billing_dates(
            SubscriptionEvent::Updated,
            Interval::Year,
            Some(previous),
            at(2024, 1, 1),
            &BillingPolicy::default(),
        )
        .unwrap();

        assert_eq!(dates.next_charge_date, at(2024, 6, 1));
    }

    #[test]
    fn test_success_advances_one_period() {
        let previous = BillingDates {
            next_charge_date: at(2024, 1, 31),
            next_period_start: at(2024, 1, 31),
        };
        let dates = next_billing_dates(
            SubscriptionEvent::Success,
            Interval::Month,
            Some(previous),
            at(2024, 1, 31),
            &BillingPolicy::default(),
        )
        .unwrap();

        // chrono clamps to the last day of February
        assert_eq!(dates.next_period_start, at(2024, 2, 29));
        assert_eq!(dates.next_charge_date, at(2024, 2, 29));
        assert_eq!(next_charge_retry_count(SubscriptionEvent::Success, 2), 0);
    }

    #[test]
    fn test_failure_pushes_charge_date_strictly_forward() {
        let policy = BillingPolicy::default();
        let previous = BillingDates {
            next_charge_date: at(2024, 5, 1),
            next_period_start: at(2024, 5, 1),
        };

        // Runner late by a week: retry counts from now
        let late = next_billing_dates(
            SubscriptionEvent::Failure,
            Interval::Month,
            Some(previous),
            at(2024, 5, 8),
            &policy,
        )
        .unwrap();
        assert_eq!(late.next_charge_date, at(2024, 5, 10));
        assert_eq!(late.next_period_start, at(2024, 5, 1));

        // Runner early: retry counts from the scheduled date
        let early = next_billing_dates(
            SubscriptionEvent::Failure,
            Interval::Month,
            Some(previous),
            at(2024, 4, 30),
            &policy,
        )
        .unwrap();
        assert!(early.next_charge_date > previous.next_charge_date);

        assert_eq!(next_charge_retry_count(SubscriptionEvent::Failure, 2), 3);
    }

    #[test]
    fn test_parse_interval_rejects_unknown_values() {
        assert_eq!(parse_interval(None).unwrap(), None);
        assert_eq!(parse_interval(Some("year")).unwrap(), Some(Interval::Year));
        assert!(matches!(
            parse_interval(Some("weekly")),
            Err(EngineError::Domain(_))
        ));
    }
}
