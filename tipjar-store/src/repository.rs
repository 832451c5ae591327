//! Repository trait definitions (Ports)
//!
//! These traits define the storage interface for the domain.
//! Implementations can be PostgreSQL, in-memory, or mock for testing.
//!
//! Check-then-write sequences shared by concurrent callers (tier capacity,
//! order settlement, refund cross-links) are single repository calls so each
//! implementation can run them under one lock or one SQL transaction.

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tipjar_domain::{
    Order, OrderId, Party, PartyId, PaymentMethod, PaymentMethodId, Subscription, SubscriptionId,
    Tier, TierCapacity, TierId, Transaction, TransactionGroupId, TransactionId,
};

/// Repository for Party entities
#[async_trait]
pub trait PartyRepository: Send + Sync {
    /// Insert a new party
    async fn insert(&self, party: &Party) -> Result<(), StoreError>;

    /// Find a party by ID
    async fn find_by_id(&self, id: PartyId) -> Result<Option<Party>, StoreError>;

    /// Find an individual user by (case-insensitive) email
    async fn find_user_by_email(&self, email: &str) -> Result<Option<Party>, StoreError>;
}

/// Repository for Tier entities
#[async_trait]
pub trait TierRepository: Send + Sync {
    /// Insert a new tier
    async fn insert(&self, tier: &Tier) -> Result<(), StoreError>;

    /// Find a tier by ID
    async fn find_by_id(&self, id: TierId) -> Result<Option<Tier>, StoreError>;
}

/// Repository for PaymentMethod entities
#[async_trait]
pub trait PaymentMethodRepository: Send + Sync {
    /// Insert a new payment method
    async fn insert(&self, payment_method: &PaymentMethod) -> Result<(), StoreError>;

    /// Find a payment method by ID
    async fn find_by_id(&self, id: PaymentMethodId) -> Result<Option<PaymentMethod>, StoreError>;

    /// Atomically take `amount` from a prepaid balance; returns the new balance
    async fn debit_balance(&self, id: PaymentMethodId, amount: i64) -> Result<i64, StoreError>;

    /// Atomically give `amount` back to a prepaid balance; returns the new balance
    async fn credit_balance(&self, id: PaymentMethodId, amount: i64) -> Result<i64, StoreError>;
}

/// Repository for Order entities
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Insert an order, reserving tier capacity in the same atomic step.
    ///
    /// Fails with `CapacityExceeded` when live orders (pending or processed)
    /// plus this one exceed `capacity.max_quantity`.
    async fn insert(&self, order: &Order, capacity: Option<TierCapacity>)
        -> Result<(), StoreError>;

    /// Find an order by ID
    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, StoreError>;

    /// Units of a tier held by live orders
    async fn reserved_quantity(&self, tier_id: TierId) -> Result<u64, StoreError>;

    /// Prepare an order for an execution attempt.
    ///
    /// Fails with `AlreadyProcessed` when settled. An order in `error`
    /// re-reserves its capacity and goes back to `pending`.
    async fn claim_for_execution(
        &self,
        id: OrderId,
        capacity: Option<TierCapacity>,
    ) -> Result<Order, StoreError>;

    /// Record a failed execution attempt (releases tier capacity)
    async fn mark_failed(&self, id: OrderId) -> Result<(), StoreError>;

    /// Link the order to its subscription
    async fn set_subscription(
        &self,
        id: OrderId,
        subscription_id: SubscriptionId,
    ) -> Result<(), StoreError>;

    /// Switch the payment method used for future charges
    async fn set_payment_method(
        &self,
        id: OrderId,
        payment_method_id: PaymentMethodId,
    ) -> Result<(), StoreError>;
}

/// Repository for Subscription entities
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// Insert a new subscription
    async fn insert(&self, subscription: &Subscription) -> Result<(), StoreError>;

    /// Find a subscription by ID
    async fn find_by_id(&self, id: SubscriptionId) -> Result<Option<Subscription>, StoreError>;

    /// Persist the mutable fields (dates, retry count, activation)
    async fn save(&self, subscription: &Subscription) -> Result<(), StoreError>;

    /// Apply a new billing schedule in one atomic step.
    ///
    /// Only the dates and the retry count are written; activation is left
    /// as stored.
    ///
    /// # Errors
    /// - `StaleSubscription` if `next_period_start` no longer equals
    ///   `reschedule.expected_period_start`
    async fn reschedule(&self, reschedule: &Reschedule) -> Result<Subscription, StoreError>;

    /// Deactivate a subscription in one atomic step (terminal).
    ///
    /// # Errors
    /// - `InvalidState` if it was already deactivated
    async fn deactivate(
        &self,
        id: SubscriptionId,
        at: DateTime<Utc>,
    ) -> Result<Subscription, StoreError>;

    /// Active subscriptions whose next charge is due at `now`
    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>, StoreError>;
}

/// Settle an order in the same atomic step as a ledger write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleOrder {
    /// Order to settle
    pub order_id: OrderId,
    /// Settlement time
    pub processed_at: DateTime<Utc>,
}

/// New billing schedule of a subscription, guarded by the period it was
/// computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reschedule {
    pub subscription_id: SubscriptionId,
    /// `next_period_start` the schedule was computed from
    pub expected_period_start: DateTime<Utc>,
    pub next_charge_date: DateTime<Utc>,
    pub next_period_start: DateTime<Utc>,
    pub charge_retry_count: u32,
}

impl Reschedule {
    /// Check the guard against the stored row and apply the schedule.
    pub fn apply(&self, subscription: &mut Subscription) -> Result<(), StoreError> {
        if subscription.next_period_start != self.expected_period_start {
            return Err(StoreError::StaleSubscription {
                subscription_id: subscription.id,
                expected_period_start: self.expected_period_start,
            });
        }
        subscription.next_charge_date = self.next_charge_date;
        subscription.next_period_start = self.next_period_start;
        subscription.charge_retry_count = self.charge_retry_count;
        Ok(())
    }
}

/// Extra work performed atomically with a ledger pair insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOptions {
    /// Set the order's `processed_at`; fails with `AlreadyProcessed` if set
    pub settle_order: Option<SettleOrder>,
    /// Cross-link the new pair with this refunded group
    pub refund_of: Option<TransactionGroupId>,
    /// Advance a subscription past the period this pair pays for; fails
    /// with `StaleSubscription` if that period was already billed
    pub reschedule: Option<Reschedule>,
}

/// Repository for Transaction entities (append-only)
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Append a DEBIT/CREDIT pair, debit first.
    ///
    /// Assigns `seq` to both rows and returns them as stored. Either both
    /// rows, the settlement and the refund links are written, or nothing is.
    async fn append_pair(
        &self,
        debit: &Transaction,
        credit: &Transaction,
        options: AppendOptions,
    ) -> Result<(Transaction, Transaction), StoreError>;

    /// Find a transaction by ID
    async fn find_by_id(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError>;

    /// All rows of a group, in creation order
    async fn find_by_group(
        &self,
        group_id: TransactionGroupId,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// All rows linked to an order, in creation order
    async fn find_by_order(&self, order_id: OrderId) -> Result<Vec<Transaction>, StoreError>;

    /// All rows owned by a party, in creation order
    async fn find_by_collective(&self, collective_id: PartyId)
        -> Result<Vec<Transaction>, StoreError>;
}

/// Combined store interface
#[async_trait]
pub trait Store: Send + Sync {
    /// Get party repository
    fn parties(&self) -> &dyn PartyRepository;

    /// Get tier repository
    fn tiers(&self) -> &dyn TierRepository;

    /// Get payment method repository
    fn payment_methods(&self) -> &dyn PaymentMethodRepository;

    /// Get order repository
    fn orders(&self) -> &dyn OrderRepository;

    /// Get subscription repository
    fn subscriptions(&self) -> &dyn SubscriptionRepository;

    /// Get transaction repository
    fn transactions(&self) -> &dyn TransactionRepository;
}

/// Refund cross-links for a quartet ordered by creation.
///
/// `tr1`↔`tr4` and `tr2`↔`tr3`: each row points at the row of the same
/// owner on the other side of the refund.
pub fn refund_links(quartet: &[Transaction]) -> Result<[(TransactionId, TransactionId); 4], StoreError> {
    match quartet {
        [tr1, tr2, tr3, tr4] => Ok([
            (tr1.id, tr4.id),
            (tr2.id, tr3.id),
            (tr3.id, tr2.id),
            (tr4.id, tr1.id),
        ]),
        _ => Err(StoreError::invalid_state(format!(
            "refund linking needs exactly 4 transactions, got {}",
            quartet.len()
        ))),
    }
}
