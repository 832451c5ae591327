//! In-memory store implementation
//!
//! Used for testing and development without a database.
//! Thread-safe using RwLock for concurrent access.
//!
//! Multi-table operations take their locks in a fixed order
//! (orders before transactions) and never hold a lock across an `.await`.

use crate::error::StoreError;
use crate::repository::{
    refund_links, AppendOptions, OrderRepository, PartyRepository, PaymentMethodRepository,
    Reschedule, Store, SubscriptionRepository, TierRepository, TransactionRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{PoisonError, RwLock};
use tipjar_domain::{
    Order, OrderId, OrderStatus, Party, PartyId, PartyKind, PaymentMethod, PaymentMethodId,
    Subscription, SubscriptionId, Tier, TierCapacity, TierId, Transaction, TransactionGroupId,
    TransactionId,
};
use tracing::debug;

/// In-memory store for testing
pub struct MemoryStore {
    parties: RwLock<HashMap<PartyId, Party>>,
    tiers: RwLock<HashMap<TierId, Tier>>,
    payment_methods: RwLock<HashMap<PaymentMethodId, PaymentMethod>>,
    orders: RwLock<HashMap<OrderId, Order>>,
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    transactions: RwLock<Vec<Transaction>>,
    transaction_seq: AtomicI64,
}

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Database("memory store lock poisoned".to_string())
}

impl MemoryStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            parties: RwLock::new(HashMap::new()),
            tiers: RwLock::new(HashMap::new()),
            payment_methods: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            transactions: RwLock::new(Vec::new()),
            transaction_seq: AtomicI64::new(0),
        }
    }

    /// Get the number of orders
    pub fn order_count(&self) -> usize {
        self.orders.read().map(|o| o.len()).unwrap_or(0)
    }

    /// IDs of all orders, oldest first
    pub fn order_ids(&self) -> Vec<OrderId> {
        let Ok(orders) = self.orders.read() else {
            return Vec::new();
        };
        let mut all: Vec<&Order> = orders.values().collect();
        all.sort_by_key(|o| (o.created_at, o.id));
        all.into_iter().map(|o| o.id).collect()
    }

    /// Get the number of ledger rows
    pub fn transaction_count(&self) -> usize {
        self.transactions.read().map(|t| t.len()).unwrap_or(0)
    }

    /// Clear all data (useful for test setup)
    pub fn clear(&self) -> Result<(), StoreError> {
        self.parties.write().map_err(poisoned)?.clear();
        self.tiers.write().map_err(poisoned)?.clear();
        self.payment_methods.write().map_err(poisoned)?.clear();
        self.orders.write().map_err(poisoned)?.clear();
        self.subscriptions.write().map_err(poisoned)?.clear();
        self.transactions.write().map_err(poisoned)?.clear();
        self.transaction_seq.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Units held by live orders of a tier, optionally ignoring one order
    fn reserved(orders: &HashMap<OrderId, Order>, tier_id: TierId, except: Option<OrderId>) -> u64 {
        orders
            .values()
            .filter(|o| o.tier_id == Some(tier_id))
            .filter(|o| o.status.reserves_capacity())
            .filter(|o| Some(o.id) != except)
            .map(|o| u64::from(o.quantity))
            .sum()
    }

    fn check_capacity(
        orders: &HashMap<OrderId, Order>,
        capacity: TierCapacity,
        requested: u32,
        except: Option<OrderId>,
    ) -> Result<(), StoreError> {
        let remaining = capacity.remaining(Self::reserved(orders, capacity.tier_id, except));
        if u64::from(requested) > remaining {
            return Err(StoreError::CapacityExceeded {
                tier_id: capacity.tier_id,
                requested,
                remaining,
            });
        }
        Ok(())
    }

    fn with_order<T>(
        &self,
        id: OrderId,
        f: impl FnOnce(&mut Order) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut orders = self.orders.write().map_err(poisoned)?;
        let order = orders
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("order", id.to_string()))?;
        f(order)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Party Repository Implementation
// =============================================================================

#[async_trait]
impl PartyRepository for MemoryStore {
    async fn insert(&self, party: &Party) -> Result<(), StoreError> {
        let mut parties = self.parties.write().map_err(poisoned)?;
        if parties.contains_key(&party.id) {
            return Err(StoreError::duplicate("party", party.id.to_string()));
        }
        if let Some(email) = &party.email {
            let taken = parties
                .values()
                .any(|p| p.kind == PartyKind::User && p.email.as_deref() == Some(email.as_str()));
            if taken {
                return Err(StoreError::duplicate("user", email.clone()));
            }
        }
        parties.insert(party.id, party.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: PartyId) -> Result<Option<Party>, StoreError> {
        let parties = self.parties.read().map_err(poisoned)?;
        Ok(parties.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<Party>, StoreError> {
        let email = email.trim().to_lowercase();
        let parties = self.parties.read().map_err(poisoned)?;
        Ok(parties
            .values()
            .find(|p| p.kind == PartyKind::User && p.email.as_deref() == Some(email.as_str()))
            .cloned())
    }
}

// =============================================================================
// Tier Repository Implementation
// =============================================================================

#[async_trait]
impl TierRepository for MemoryStore {
    async fn insert(&self, tier: &Tier) -> Result<(), StoreError> {
        let mut tiers = self.tiers.write().map_err(poisoned)?;
        if tiers.contains_key(&tier.id) {
            return Err(StoreError::duplicate("tier", tier.id.to_string()));
        }
        tiers.insert(tier.id, tier.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: TierId) -> Result<Option<Tier>, StoreError> {
        let tiers = self.tiers.read().map_err(poisoned)?;
        Ok(tiers.get(&id).cloned())
    }
}

// =============================================================================
// Payment Method Repository Implementation
// =============================================================================

#[async_trait]
impl PaymentMethodRepository for MemoryStore {
    async fn insert(&self, payment_method: &PaymentMethod) -> Result<(), StoreError> {
        let mut methods = self.payment_methods.write().map_err(poisoned)?;
        if methods.contains_key(&payment_method.id) {
            return Err(StoreError::duplicate("payment_method", payment_method.id.to_string()));
        }
        methods.insert(payment_method.id, payment_method.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: PaymentMethodId) -> Result<Option<PaymentMethod>, StoreError> {
        let methods = self.payment_methods.read().map_err(poisoned)?;
        Ok(methods.get(&id).cloned())
    }

    async fn debit_balance(&self, id: PaymentMethodId, amount: i64) -> Result<i64, StoreError> {
        let mut methods = self.payment_methods.write().map_err(poisoned)?;
        let method = methods
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("payment_method", id.to_string()))?;
        let balance = method.balance.ok_or_else(|| {
            StoreError::invalid_state(format!("payment method {} has no balance", id))
        })?;
        if balance < amount {
            return Err(StoreError::InsufficientBalance {
                payment_method_id: id,
                balance,
                requested: amount,
            });
        }
        method.balance = Some(balance - amount);
        Ok(balance - amount)
    }

    async fn credit_balance(&self, id: PaymentMethodId, amount: i64) -> Result<i64, StoreError> {
        let mut methods = self.payment_methods.write().map_err(poisoned)?;
        let method = methods
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("payment_method", id.to_string()))?;
        let balance = method.balance.ok_or_else(|| {
            StoreError::invalid_state(format!("payment method {} has no balance", id))
        })?;
        method.balance = Some(balance + amount);
        Ok(balance + amount)
    }
}

// =============================================================================
// Order Repository Implementation
// =============================================================================

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn insert(
        &self,
        order: &Order,
        capacity: Option<TierCapacity>,
    ) -> Result<(), StoreError> {
        let mut orders = self.orders.write().map_err(poisoned)?;
        if orders.contains_key(&order.id) {
            return Err(StoreError::duplicate("order", order.id.to_string()));
        }
        if let Some(capacity) = capacity {
            Self::check_capacity(&orders, capacity, order.quantity, None)?;
        }
        orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let orders = self.orders.read().map_err(poisoned)?;
        Ok(orders.get(&id).cloned())
    }

    async fn reserved_quantity(&self, tier_id: TierId) -> Result<u64, StoreError> {
        let orders = self.orders.read().map_err(poisoned)?;
        Ok(Self::reserved(&orders, tier_id, None))
    }

    async fn claim_for_execution(
        &self,
        id: OrderId,
        capacity: Option<TierCapacity>,
    ) -> Result<Order, StoreError> {
        let mut orders = self.orders.write().map_err(poisoned)?;
        let order = orders
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("order", id.to_string()))?;

        if let Some(processed_at) = order.processed_at {
            return Err(StoreError::AlreadyProcessed { order_id: id, processed_at });
        }
        if order.status == OrderStatus::Error {
            if let Some(capacity) = capacity {
                Self::check_capacity(&orders, capacity, order.quantity, Some(id))?;
            }
        }

        let mut claimed = order;
        claimed.status = OrderStatus::Pending;
        orders.insert(id, claimed.clone());
        Ok(claimed)
    }

    async fn mark_failed(&self, id: OrderId) -> Result<(), StoreError> {
        self.with_order(id, |order| {
            if order.processed_at.is_some() {
                return Err(StoreError::invalid_state(format!(
                    "order {} is processed and cannot fail",
                    order.id
                )));
            }
            order.status = OrderStatus::Error;
            Ok(())
        })
    }

    async fn set_subscription(
        &self,
        id: OrderId,
        subscription_id: SubscriptionId,
    ) -> Result<(), StoreError> {
        self.with_order(id, |order| {
            order.subscription_id = Some(subscription_id);
            Ok(())
        })
    }

    async fn set_payment_method(
        &self,
        id: OrderId,
        payment_method_id: PaymentMethodId,
    ) -> Result<(), StoreError> {
        self.with_order(id, |order| {
            order.payment_method_id = Some(payment_method_id);
            Ok(())
        })
    }
}

// =============================================================================
// Subscription Repository Implementation
// =============================================================================

#[async_trait]
impl SubscriptionRepository for MemoryStore {
    async fn insert(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let mut subscriptions = self.subscriptions.write().map_err(poisoned)?;
        if subscriptions.contains_key(&subscription.id) {
            return Err(StoreError::duplicate("subscription", subscription.id.to_string()));
        }
        subscriptions.insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        let subscriptions = self.subscriptions.read().map_err(poisoned)?;
        Ok(subscriptions.get(&id).cloned())
    }

    async fn save(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let mut subscriptions = self.subscriptions.write().map_err(poisoned)?;
        if !subscriptions.contains_key(&subscription.id) {
            return Err(StoreError::not_found("subscription", subscription.id.to_string()));
        }
        subscriptions.insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn reschedule(&self, reschedule: &Reschedule) -> Result<Subscription, StoreError> {
        let mut subscriptions = self.subscriptions.write().map_err(poisoned)?;
        let subscription = subscriptions.get_mut(&reschedule.subscription_id).ok_or_else(|| {
            StoreError::not_found("subscription", reschedule.subscription_id.to_string())
        })?;
        reschedule.apply(subscription)?;
        Ok(subscription.clone())
    }

    async fn deactivate(
        &self,
        id: SubscriptionId,
        at: DateTime<Utc>,
    ) -> Result<Subscription, StoreError> {
        let mut subscriptions = self.subscriptions.write().map_err(poisoned)?;
        let subscription = subscriptions
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("subscription", id.to_string()))?;
        subscription.deactivate(at).map_err(|e| StoreError::invalid_state(e.to_string()))?;
        Ok(subscription.clone())
    }

    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>, StoreError> {
        let subscriptions = self.subscriptions.read().map_err(poisoned)?;
        let mut due: Vec<Subscription> = subscriptions
            .values()
            .filter(|s| s.is_active && s.next_charge_date <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_charge_date);
        Ok(due)
    }
}

// =============================================================================
// Transaction Repository Implementation
// =============================================================================

#[async_trait]
impl TransactionRepository for MemoryStore {
    async fn append_pair(
        &self,
        debit: &Transaction,
        credit: &Transaction,
        options: AppendOptions,
    ) -> Result<(Transaction, Transaction), StoreError> {
        // Lock order: orders, subscriptions, then transactions
        let mut orders = match options.settle_order {
            Some(_) => Some(self.orders.write().map_err(poisoned)?),
            None => None,
        };
        let mut subscriptions = match options.reschedule {
            Some(_) => Some(self.subscriptions.write().map_err(poisoned)?),
            None => None,
        };
        let mut transactions = self.transactions.write().map_err(poisoned)?;

        // Validate everything before mutating anything
        if let (Some(settle), Some(orders)) = (options.settle_order, orders.as_ref()) {
            let order = orders
                .get(&settle.order_id)
                .ok_or_else(|| StoreError::not_found("order", settle.order_id.to_string()))?;
            if let Some(processed_at) = order.processed_at {
                return Err(StoreError::AlreadyProcessed { order_id: order.id, processed_at });
            }
        }

        let rescheduled = match (options.reschedule, subscriptions.as_ref()) {
            (Some(reschedule), Some(subscriptions)) => {
                let mut subscription = subscriptions
                    .get(&reschedule.subscription_id)
                    .cloned()
                    .ok_or_else(|| {
                        StoreError::not_found("subscription", reschedule.subscription_id.to_string())
                    })?;
                reschedule.apply(&mut subscription)?;
                Some(subscription)
            },
            _ => None,
        };

        if transactions.iter().any(|t| t.id == debit.id || t.id == credit.id) {
            return Err(StoreError::duplicate("transaction", credit.id.to_string()));
        }

        let originals: Vec<Transaction> = match options.refund_of {
            Some(group_id) => {
                let originals: Vec<Transaction> =
                    transactions.iter().filter(|t| t.group_id == group_id).cloned().collect();
                if let Some(linked) = originals.iter().find(|t| t.refund_id.is_some()) {
                    return Err(StoreError::AlreadyRefunded(linked.id));
                }
                originals
            },
            None => Vec::new(),
        };

        let mut debit = debit.clone();
        let mut credit = credit.clone();
        debit.seq = self.transaction_seq.fetch_add(1, Ordering::SeqCst) + 1;
        credit.seq = self.transaction_seq.fetch_add(1, Ordering::SeqCst) + 1;

        let links = if options.refund_of.is_some() {
            let mut quartet = originals;
            quartet.push(debit.clone());
            quartet.push(credit.clone());
            quartet.sort_by_key(|t| t.seq);
            Some(refund_links(&quartet)?)
        } else {
            None
        };

        // Commit
        transactions.push(debit);
        transactions.push(credit);

        if let Some(links) = links {
            for (id, refund_id) in links {
                if let Some(row) = transactions.iter_mut().find(|t| t.id == id) {
                    row.refund_id = Some(refund_id);
                }
            }
        }

        if let (Some(settle), Some(orders)) = (options.settle_order, orders.as_mut()) {
            if let Some(order) = orders.get_mut(&settle.order_id) {
                order.mark_processed(settle.processed_at)?;
            }
        }

        if let (Some(subscription), Some(subscriptions)) = (rescheduled, subscriptions.as_mut()) {
            subscriptions.insert(subscription.id, subscription);
        }

        let len = transactions.len();
        let stored_debit = transactions[len - 2].clone();
        let stored_credit = transactions[len - 1].clone();
        debug!(
            group_id = %stored_credit.group_id,
            debit_seq = stored_debit.seq,
            credit_seq = stored_credit.seq,
            "Ledger pair appended"
        );
        Ok((stored_debit, stored_credit))
    }

    async fn find_by_id(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        let transactions = self.transactions.read().map_err(poisoned)?;
        Ok(transactions.iter().find(|t| t.id == id).cloned())
    }

    async fn find_by_group(
        &self,
        group_id: TransactionGroupId,
    ) -> Result<Vec<Transaction>, StoreError> {
        let transactions = self.transactions.read().map_err(poisoned)?;
        Ok(transactions.iter().filter(|t| t.group_id == group_id).cloned().collect())
    }

    async fn find_by_order(&self, order_id: OrderId) -> Result<Vec<Transaction>, StoreError> {
        let transactions = self.transactions.read().map_err(poisoned)?;
        Ok(transactions.iter().filter(|t| t.order_id == Some(order_id)).cloned().collect())
    }

    async fn find_by_collective(
        &self,
        collective_id: PartyId,
    ) -> Result<Vec<Transaction>, StoreError> {
        let transactions = self.transactions.read().map_err(poisoned)?;
        Ok(transactions.iter().filter(|t| t.collective_id == collective_id).cloned().collect())
    }
}

// =============================================================================
// Combined Store Implementation
// =============================================================================

#[async_trait]
impl Store for MemoryStore {
    fn parties(&self) -> &dyn PartyRepository {
        self
    }

    fn tiers(&self) -> &dyn TierRepository {
        self
    }

    fn payment_methods(&self) -> &dyn PaymentMethodRepository {
        self
    }

    fn orders(&self) -> &dyn OrderRepository {
        self
    }

    fn subscriptions(&self) -> &dyn SubscriptionRepository {
        self
    }

    fn transactions(&self) -> &dyn TransactionRepository {
        self
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::SettleOrder;
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use tipjar_domain::{Currency, TransactionKind};
    use uuid::Uuid;

    fn create_test_order(tier_id: Option<TierId>, quantity: u32) -> Order {
        let mut order = Order::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            1000 * i64::from(quantity),
            Currency::usd(),
            quantity,
        )
        .unwrap();
        order.tier_id = tier_id;
        order
    }

    fn create_test_row(kind: TransactionKind, group_id: TransactionGroupId, amount: i64) -> Transaction {
        Transaction {
            id: Uuid::now_v7(),
            seq: 0,
            kind,
            collective_id: Uuid::now_v7(),
            from_collective_id: Uuid::now_v7(),
            host_collective_id: None,
            amount,
            currency: Currency::usd(),
            amount_in_host_currency: amount,
            host_currency: Currency::usd(),
            host_currency_fx_rate: Decimal::ONE,
            host_fee_in_host_currency: None,
            platform_fee_in_host_currency: None,
            payment_processor_fee_in_host_currency: None,
            net_amount_in_collective_currency: amount,
            order_id: None,
            payment_method_id: None,
            created_by: None,
            group_id,
            refund_id: None,
            description: "test".to_string(),
            data: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    fn create_test_pair() -> (Transaction, Transaction) {
        let group_id = Uuid::now_v7();
        (
            create_test_row(TransactionKind::Debit, group_id, -1000),
            create_test_row(TransactionKind::Credit, group_id, 1000),
        )
    }

    // Party Repository Tests
    #[tokio::test]
    async fn test_find_user_by_email_is_case_insensitive() {
        let store = MemoryStore::new();
        let user = Party::new_user("Xavier", "xavier@example.com");
        PartyRepository::insert(&store, &user).await.unwrap();

        let found = store.find_user_by_email("Xavier@Example.com").await.unwrap();
        assert_eq!(found.map(|p| p.id), Some(user.id));

        let duplicate = Party::new_user("Other", "XAVIER@example.com");
        assert!(matches!(
            PartyRepository::insert(&store, &duplicate).await,
            Err(StoreError::Duplicate { .. })
        ));
    }

    // Order Repository Tests
    #[tokio::test]
    async fn test_insert_reserves_capacity() {
        let store = MemoryStore::new();
        let tier_id = Uuid::now_v7();
        let capacity = TierCapacity { tier_id, max_quantity: 3 };

        OrderRepository::insert(&store, &create_test_order(Some(tier_id), 2), Some(capacity))
            .await
            .unwrap();
        assert_eq!(store.reserved_quantity(tier_id).await.unwrap(), 2);

        let result =
            OrderRepository::insert(&store, &create_test_order(Some(tier_id), 2), Some(capacity))
                .await;
        assert!(matches!(
            result,
            Err(StoreError::CapacityExceeded { requested: 2, remaining: 1, .. })
        ));

        OrderRepository::insert(&store, &create_test_order(Some(tier_id), 1), Some(capacity))
            .await
            .unwrap();
        assert_eq!(store.order_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_of_last_unit() {
        let store = Arc::new(MemoryStore::new());
        let tier_id = Uuid::now_v7();
        let capacity = TierCapacity { tier_id, max_quantity: 1 };

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    let order = create_test_order(Some(tier_id), 1);
                    OrderRepository::insert(store.as_ref(), &order, Some(capacity)).await
                })
            })
            .collect();

        let mut successes = 0;
        let mut exceeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => successes += 1,
                Err(StoreError::CapacityExceeded { .. }) => exceeded += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(exceeded, 1);
    }

    #[tokio::test]
    async fn test_failed_order_releases_and_reclaims_capacity() {
        let store = MemoryStore::new();
        let tier_id = Uuid::now_v7();
        let capacity = TierCapacity { tier_id, max_quantity: 1 };
        let first = create_test_order(Some(tier_id), 1);

        OrderRepository::insert(&store, &first, Some(capacity)).await.unwrap();
        store.mark_failed(first.id).await.unwrap();
        assert_eq!(store.reserved_quantity(tier_id).await.unwrap(), 0);

        // Someone else takes the unit
        let second = create_test_order(Some(tier_id), 1);
        OrderRepository::insert(&store, &second, Some(capacity)).await.unwrap();

        let retry = store.claim_for_execution(first.id, Some(capacity)).await;
        assert!(matches!(retry, Err(StoreError::CapacityExceeded { .. })));
    }

    #[tokio::test]
    async fn test_claim_rejects_processed_order() {
        let store = MemoryStore::new();
        let mut order = create_test_order(None, 1);
        order.mark_processed(Utc::now()).unwrap();
        OrderRepository::insert(&store, &order, None).await.unwrap();

        let result = store.claim_for_execution(order.id, None).await;
        assert!(matches!(result, Err(StoreError::AlreadyProcessed { .. })));
    }

    // Transaction Repository Tests
    #[tokio::test]
    async fn test_append_pair_assigns_sequence_debit_first() {
        let store = MemoryStore::new();
        let (debit, credit) = create_test_pair();

        let (debit, credit) =
            store.append_pair(&debit, &credit, AppendOptions::default()).await.unwrap();
        assert!(debit.seq < credit.seq);

        let group = store.find_by_group(credit.group_id).await.unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(group[0].id, debit.id);
    }

    #[tokio::test]
    async fn test_append_pair_settles_order_once() {
        let store = MemoryStore::new();
        let order = create_test_order(None, 1);
        OrderRepository::insert(&store, &order, None).await.unwrap();
        let settle = AppendOptions {
            settle_order: Some(SettleOrder { order_id: order.id, processed_at: Utc::now() }),
            ..AppendOptions::default()
        };

        let (debit, credit) = create_test_pair();
        store.append_pair(&debit, &credit, settle).await.unwrap();

        let (debit, credit) = create_test_pair();
        let result = store.append_pair(&debit, &credit, settle).await;
        assert!(matches!(result, Err(StoreError::AlreadyProcessed { .. })));

        // Nothing from the rejected pair is visible
        assert_eq!(store.transaction_count(), 2);
        let stored = OrderRepository::find_by_id(&store, order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Processed);
    }

    #[tokio::test]
    async fn test_append_refund_pair_links_quartet() {
        let store = MemoryStore::new();
        let (debit, credit) = create_test_pair();
        let (tr1, tr2) = store.append_pair(&debit, &credit, AppendOptions::default()).await.unwrap();

        let refund_group = Uuid::now_v7();
        let refund_debit = create_test_row(TransactionKind::Debit, refund_group, -1000);
        let refund_credit = create_test_row(TransactionKind::Credit, refund_group, 1000);
        let options = AppendOptions { refund_of: Some(tr1.group_id), ..AppendOptions::default() };
        let (tr3, tr4) = store.append_pair(&refund_debit, &refund_credit, options).await.unwrap();

        let get = |id| {
            let store = &store;
            async move { TransactionRepository::find_by_id(store, id).await.unwrap().unwrap() }
        };
        assert_eq!(get(tr1.id).await.refund_id, Some(tr4.id));
        assert_eq!(get(tr2.id).await.refund_id, Some(tr3.id));
        assert_eq!(get(tr3.id).await.refund_id, Some(tr2.id));
        assert_eq!(get(tr4.id).await.refund_id, Some(tr1.id));

        // A second refund of the same group is rejected atomically
        let again = store
            .append_pair(
                &create_test_row(TransactionKind::Debit, Uuid::now_v7(), -1000),
                &create_test_row(TransactionKind::Credit, Uuid::now_v7(), 1000),
                options,
            )
            .await;
        assert!(matches!(again, Err(StoreError::AlreadyRefunded(_))));
        assert_eq!(store.transaction_count(), 4);
    }

    #[tokio::test]
    async fn test_prepaid_balance_debit() {
        let store = MemoryStore::new();
        let owner = Party::new_organization("Gift Co", Currency::usd());
        let mut card = PaymentMethod::new(
            tipjar_domain::PaymentMethodKind::Prepaid,
            owner.id,
            "gift",
            Currency::usd(),
        );
        card.balance = Some(1000);
        PaymentMethodRepository::insert(&store, &card).await.unwrap();

        assert_eq!(store.debit_balance(card.id, 600).await.unwrap(), 400);
        assert!(matches!(
            store.debit_balance(card.id, 600).await,
            Err(StoreError::InsufficientBalance { balance: 400, .. })
        ));
        assert_eq!(store.credit_balance(card.id, 600).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_find_due_subscriptions() {
        let store = MemoryStore::new();
        let mut order = create_test_order(None, 1);
        order.interval = Some(tipjar_domain::Interval::Month);
        let now = Utc::now();

        let mut due = Subscription::for_order(&order, now - chrono::Duration::hours(1), now).unwrap();
        due.activate(now).unwrap();
        let mut later = Subscription::for_order(&order, now + chrono::Duration::days(3), now).unwrap();
        later.activate(now).unwrap();
        let inactive = Subscription::for_order(&order, now - chrono::Duration::days(1), now).unwrap();

        for s in [&due, &later, &inactive] {
            SubscriptionRepository::insert(&store, s).await.unwrap();
        }

        let found = store.find_due(now).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
    }

    async fn insert_active_subscription(store: &MemoryStore) -> Subscription {
        let mut order = create_test_order(None, 1);
        order.interval = Some(tipjar_domain::Interval::Month);
        let now = Utc::now();
        let mut subscription = Subscription::for_order(&order, now, now).unwrap();
        subscription.activate(now).unwrap();
        SubscriptionRepository::insert(store, &subscription).await.unwrap();
        subscription
    }

    fn next_month(subscription: &Subscription) -> Reschedule {
        let next = subscription.next_period_start + chrono::Duration::days(30);
        Reschedule {
            subscription_id: subscription.id,
            expected_period_start: subscription.next_period_start,
            next_charge_date: next,
            next_period_start: next,
            charge_retry_count: 0,
        }
    }

    #[tokio::test]
    async fn test_stale_reschedule_is_rejected() {
        let store = MemoryStore::new();
        let subscription = insert_active_subscription(&store).await;
        let reschedule = next_month(&subscription);

        let moved = store.reschedule(&reschedule).await.unwrap();
        assert_eq!(moved.next_period_start, reschedule.next_period_start);

        // Same period a second time
        let result = store.reschedule(&reschedule).await;
        assert!(matches!(result, Err(StoreError::StaleSubscription { .. })));
    }

    #[tokio::test]
    async fn test_reschedule_keeps_concurrent_deactivation() {
        let store = MemoryStore::new();
        let subscription = insert_active_subscription(&store).await;

        store.deactivate(subscription.id, Utc::now()).await.unwrap();
        let moved = store.reschedule(&next_month(&subscription)).await.unwrap();

        assert!(!moved.is_active);
        assert!(moved.deactivated_at.is_some());
        assert!(matches!(
            store.deactivate(subscription.id, Utc::now()).await,
            Err(StoreError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_renewal_pair_advances_subscription_once() {
        let store = MemoryStore::new();
        let subscription = insert_active_subscription(&store).await;
        let options =
            AppendOptions { reschedule: Some(next_month(&subscription)), ..AppendOptions::default() };

        let (debit, credit) = create_test_pair();
        store.append_pair(&debit, &credit, options).await.unwrap();
        let stored = SubscriptionRepository::find_by_id(&store, subscription.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.next_period_start, next_month(&subscription).next_period_start);

        // A second pair for the same period leaves no trace
        let (debit, credit) = create_test_pair();
        let result = store.append_pair(&debit, &credit, options).await;
        assert!(matches!(result, Err(StoreError::StaleSubscription { .. })));
        assert_eq!(store.transaction_count(), 2);
    }
}
