//! Domain Entities for tipjar
//!
//! Core business entities with lifecycle management.
//! Amounts are integers in minor currency units (cents).

use crate::value_objects::{
    Currency, DomainError, FeePercent, Interval, PartyKind, PaymentMethodKind, TransactionKind,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier for a Party (user, organization, collective, event)
pub type PartyId = Uuid;

/// Unique identifier for a Tier
pub type TierId = Uuid;

/// Unique identifier for a PaymentMethod
pub type PaymentMethodId = Uuid;

/// Unique identifier for an Order
pub type OrderId = Uuid;

/// Unique identifier for a Subscription
pub type SubscriptionId = Uuid;

/// Unique identifier for a Transaction
pub type TransactionId = Uuid;

/// Correlates the CREDIT and DEBIT rows of one economic event
pub type TransactionGroupId = Uuid;

// =============================================================================
// Party
// =============================================================================

/// Someone who sends or receives money.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Party {
    pub id: PartyId,
    pub kind: PartyKind,
    pub name: String,
    pub slug: String,
    pub is_active: bool,
    /// Fiscal host holding the money of a collective
    pub host_id: Option<PartyId>,
    pub currency: Currency,
    /// Share of each contribution kept by the host
    pub host_fee_percent: FeePercent,
    /// Only set for individual users
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Party {
    fn new(kind: PartyKind, name: &str, currency: Currency) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            name: name.to_string(),
            slug: slugify(name),
            is_active: true,
            host_id: None,
            currency,
            host_fee_percent: FeePercent::zero(),
            email: None,
            created_at: Utc::now(),
        }
    }

    /// Create an individual user identified by email
    pub fn new_user(name: &str, email: &str) -> Self {
        let mut party = Self::new(PartyKind::User, name, Currency::usd());
        party.email = Some(email.trim().to_lowercase());
        party
    }

    /// Create an organization (also used for fiscal hosts)
    pub fn new_organization(name: &str, currency: Currency) -> Self {
        Self::new(PartyKind::Organization, name, currency)
    }

    /// Create a collective hosted by `host_id`
    pub fn new_collective(
        name: &str,
        currency: Currency,
        host_id: PartyId,
        host_fee_percent: FeePercent,
    ) -> Self {
        let mut party = Self::new(PartyKind::Collective, name, currency);
        party.host_id = Some(host_id);
        party.host_fee_percent = host_fee_percent;
        party
    }
}

/// Lower-case, dash separated slug
fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

// =============================================================================
// Tier
// =============================================================================

/// A priced participation level, optionally limited in quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub id: TierId,
    pub collective_id: PartyId,
    pub name: String,
    /// Fixed unit price; 0 for free or pay-what-you-want tiers
    pub amount: i64,
    pub currency: Currency,
    pub interval: Option<Interval>,
    /// Total units available across all orders
    pub max_quantity: Option<u32>,
    /// Units a single order may take
    pub max_quantity_per_user: Option<u32>,
    /// Presets let the contributor choose the amount
    pub has_presets: bool,
    pub created_at: DateTime<Utc>,
}

impl Tier {
    /// Create an unlimited tier with a fixed amount
    pub fn new(collective_id: PartyId, name: &str, amount: i64, currency: Currency) -> Self {
        Self {
            id: Uuid::now_v7(),
            collective_id,
            name: name.to_string(),
            amount,
            currency,
            interval: None,
            max_quantity: None,
            max_quantity_per_user: None,
            has_presets: false,
            created_at: Utc::now(),
        }
    }

    /// Capacity constraint to enforce when reserving units of this tier
    pub fn capacity(&self) -> Option<TierCapacity> {
        self.max_quantity.map(|max_quantity| TierCapacity {
            tier_id: self.id,
            max_quantity,
        })
    }
}

/// Capacity limit checked atomically with the order insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCapacity {
    pub tier_id: TierId,
    pub max_quantity: u32,
}

impl TierCapacity {
    /// Units left given `reserved` units already held by live orders
    pub fn remaining(&self, reserved: u64) -> u64 {
        u64::from(self.max_quantity).saturating_sub(reserved)
    }
}

// =============================================================================
// PaymentMethod
// =============================================================================

/// A way of paying, owned by a party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: PaymentMethodId,
    pub kind: PaymentMethodKind,
    pub owner_id: PartyId,
    /// Processor token (card source, wallet address, ...)
    pub token: String,
    pub currency: Currency,
    /// Remaining balance for prepaid cards
    pub balance: Option<i64>,
    /// Match multiplier; set only on matching funds
    pub matching: Option<Decimal>,
    /// Matching funds may be limited to one collective
    pub limited_to_collective_id: Option<PartyId>,
    pub created_at: DateTime<Utc>,
}

impl PaymentMethod {
    /// Create a payment method of `kind` owned by `owner_id`
    pub fn new(kind: PaymentMethodKind, owner_id: PartyId, token: &str, currency: Currency) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            owner_id,
            token: token.to_string(),
            currency,
            balance: None,
            matching: None,
            limited_to_collective_id: None,
            created_at: Utc::now(),
        }
    }

    /// Whether this method multiplies other contributions
    pub fn is_matching_fund(&self) -> bool {
        self.matching.is_some()
    }

    /// Whether a matching fund may be used for `collective_id`
    pub fn can_match(&self, collective_id: PartyId) -> bool {
        self.is_matching_fund()
            && self
                .limited_to_collective_id
                .map(|id| id == collective_id)
                .unwrap_or(true)
    }
}

// =============================================================================
// Order
// =============================================================================

/// Persisted order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created, not settled yet (also async settlements in flight)
    Pending,
    /// Settled; `processed_at` is set
    Processed,
    /// Last execution attempt failed; may be retried
    Error,
}

impl OrderStatus {
    /// Storage tag
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processed => "processed",
            OrderStatus::Error => "error",
        }
    }

    /// Whether the order holds tier capacity
    pub fn reserves_capacity(&self) -> bool {
        !matches!(self, OrderStatus::Error)
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "processed" => Ok(OrderStatus::Processed),
            "error" => Ok(OrderStatus::Error),
            other => Err(DomainError::InvalidKind(format!("order status '{}'", other))),
        }
    }
}

/// A request to move money from `from_collective_id` to `collective_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    /// Source party (who pays)
    pub from_collective_id: PartyId,
    /// Destination party (who receives)
    pub collective_id: PartyId,
    /// User who placed the order
    pub created_by: PartyId,
    pub total_amount: i64,
    pub currency: Currency,
    pub interval: Option<Interval>,
    pub quantity: u32,
    pub tier_id: Option<TierId>,
    pub payment_method_id: Option<PaymentMethodId>,
    pub matching_fund_id: Option<PaymentMethodId>,
    pub referral_id: Option<PartyId>,
    pub subscription_id: Option<SubscriptionId>,
    pub description: String,
    pub status: OrderStatus,
    /// Set once, on first settlement
    pub processed_at: Option<DateTime<Utc>>,
    /// Privileged override of the collective's host fee
    pub host_fee_percent: Option<FeePercent>,
    /// Privileged override of the platform fee
    pub platform_fee_percent: Option<FeePercent>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Create a pending order
    ///
    /// # Errors
    /// Returns `DomainError` if the amount is negative or quantity is zero
    pub fn new(
        from_collective_id: PartyId,
        collective_id: PartyId,
        created_by: PartyId,
        total_amount: i64,
        currency: Currency,
        quantity: u32,
    ) -> Result<Self, DomainError> {
        if total_amount < 0 {
            return Err(DomainError::InvalidAmount(format!(
                "total amount must not be negative, got {}",
                total_amount
            )));
        }
        if quantity == 0 {
            return Err(DomainError::InvalidQuantity("quantity must be at least 1".to_string()));
        }

        Ok(Self {
            id: Uuid::now_v7(),
            from_collective_id,
            collective_id,
            created_by,
            total_amount,
            currency,
            interval: None,
            quantity,
            tier_id: None,
            payment_method_id: None,
            matching_fund_id: None,
            referral_id: None,
            subscription_id: None,
            description: String::new(),
            status: OrderStatus::Pending,
            processed_at: None,
            host_fee_percent: None,
            platform_fee_percent: None,
            created_at: Utc::now(),
        })
    }

    /// Whether a charge is needed to settle this order
    pub fn payment_required(&self) -> bool {
        self.total_amount > 0
    }

    /// Whether the order has been settled
    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    /// Settle the order (set-once)
    ///
    /// # Errors
    /// Returns `DomainError::InvalidStateTransition` if already processed
    pub fn mark_processed(&mut self, at: DateTime<Utc>) -> Result<(), DomainError> {
        if let Some(processed_at) = self.processed_at {
            return Err(DomainError::InvalidStateTransition(format!(
                "order {} was already processed at {}",
                self.id, processed_at
            )));
        }
        self.processed_at = Some(at);
        self.status = OrderStatus::Processed;
        Ok(())
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Recurring-billing state of an order with an interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub order_id: OrderId,
    pub amount: i64,
    pub currency: Currency,
    pub interval: Interval,
    pub is_active: bool,
    pub next_charge_date: DateTime<Utc>,
    pub next_period_start: DateTime<Utc>,
    pub charge_retry_count: u32,
    pub activated_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Create an inactive subscription for `order`
    ///
    /// # Errors
    /// Returns `DomainError::InvalidInterval` if the order is not recurring
    pub fn for_order(
        order: &Order,
        next_charge_date: DateTime<Utc>,
        next_period_start: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let interval = order.interval.ok_or_else(|| {
            DomainError::InvalidInterval(format!("order {} has no interval", order.id))
        })?;

        Ok(Self {
            id: Uuid::now_v7(),
            order_id: order.id,
            amount: order.total_amount,
            currency: order.currency.clone(),
            interval,
            is_active: false,
            next_charge_date,
            next_period_start,
            charge_retry_count: 0,
            activated_at: None,
            deactivated_at: None,
            created_at: Utc::now(),
        })
    }

    /// Activate after the first charge materialized
    ///
    /// # Errors
    /// Deactivation is terminal: a deactivated subscription cannot come back
    pub fn activate(&mut self, at: DateTime<Utc>) -> Result<(), DomainError> {
        if self.deactivated_at.is_some() {
            return Err(DomainError::InvalidStateTransition(format!(
                "subscription {} was deactivated and cannot be reactivated",
                self.id
            )));
        }
        if !self.is_active {
            self.is_active = true;
            self.activated_at = Some(at);
        }
        Ok(())
    }

    /// Deactivate (terminal)
    ///
    /// # Errors
    /// Returns `DomainError::InvalidStateTransition` if already deactivated
    pub fn deactivate(&mut self, at: DateTime<Utc>) -> Result<(), DomainError> {
        if self.deactivated_at.is_some() {
            return Err(DomainError::InvalidStateTransition(format!(
                "subscription {} is already canceled",
                self.id
            )));
        }
        self.is_active = false;
        self.deactivated_at = Some(at);
        Ok(())
    }

    /// Whether the last renewal attempts failed
    pub fn is_past_due(&self) -> bool {
        self.charge_retry_count > 0
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// Fees attributed to the CREDIT side, in host currency minor units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub host_fee: i64,
    pub platform_fee: i64,
    pub processor_fee: i64,
}

impl FeeBreakdown {
    /// Sum of all fees
    pub fn total(&self) -> i64 {
        self.host_fee + self.platform_fee + self.processor_fee
    }

    /// Whether any fee is negative
    pub fn has_negative(&self) -> bool {
        self.host_fee < 0 || self.platform_fee < 0 || self.processor_fee < 0
    }
}

/// An immutable ledger line. Always written in CREDIT/DEBIT pairs.
///
/// Only `refund_id` may change after insert, and only once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    /// Store-assigned creation sequence; orders rows within a group
    pub seq: i64,
    pub kind: TransactionKind,
    /// Ledger this row belongs to
    pub collective_id: PartyId,
    /// Other side of the movement
    pub from_collective_id: PartyId,
    pub host_collective_id: Option<PartyId>,
    pub amount: i64,
    pub currency: Currency,
    pub amount_in_host_currency: i64,
    pub host_currency: Currency,
    pub host_currency_fx_rate: Decimal,
    /// Fee columns are `None` on DEBIT rows
    pub host_fee_in_host_currency: Option<i64>,
    pub platform_fee_in_host_currency: Option<i64>,
    pub payment_processor_fee_in_host_currency: Option<i64>,
    pub net_amount_in_collective_currency: i64,
    pub order_id: Option<OrderId>,
    pub payment_method_id: Option<PaymentMethodId>,
    pub created_by: Option<PartyId>,
    pub group_id: TransactionGroupId,
    pub refund_id: Option<TransactionId>,
    pub description: String,
    /// Processor metadata (charge id, settlement id, ...)
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Whether this row is the CREDIT side
    pub fn is_credit(&self) -> bool {
        matches!(self.kind, TransactionKind::Credit)
    }

    /// Fee columns as a breakdown (missing columns count as zero)
    pub fn fees(&self) -> FeeBreakdown {
        FeeBreakdown {
            host_fee: self.host_fee_in_host_currency.unwrap_or(0),
            platform_fee: self.platform_fee_in_host_currency.unwrap_or(0),
            processor_fee: self.payment_processor_fee_in_host_currency.unwrap_or(0),
        }
    }

    /// Whether this row was refunded or is a refund
    pub fn is_refund_linked(&self) -> bool {
        self.refund_id.is_some()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn create_test_order() -> Order {
        Order::new(Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7(), 5000, Currency::usd(), 1)
            .unwrap()
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Web Pack  2018!"), "web-pack-2018");
        assert_eq!(slugify("  Open Source "), "open-source");
    }

    #[test]
    fn test_order_rejects_negative_amount_and_zero_quantity() {
        let id = Uuid::now_v7();
        assert!(Order::new(id, id, id, -1, Currency::usd(), 1).is_err());
        assert!(Order::new(id, id, id, 100, Currency::usd(), 0).is_err());
    }

    #[test]
    fn test_order_processed_at_is_set_once() {
        let mut order = create_test_order();
        let first = Utc::now();

        order.mark_processed(first).unwrap();
        assert_eq!(order.status, OrderStatus::Processed);

        assert!(order.mark_processed(Utc::now()).is_err());
        assert_eq!(order.processed_at, Some(first));
    }

    #[test]
    fn test_free_order_requires_no_payment() {
        let id = Uuid::now_v7();
        let order = Order::new(id, id, id, 0, Currency::usd(), 1).unwrap();
        assert!(!order.payment_required());
        assert!(create_test_order().payment_required());
    }

    #[test]
    fn test_subscription_requires_interval() {
        let order = create_test_order();
        let now = Utc::now();
        assert!(Subscription::for_order(&order, now, now).is_err());
    }

    #[test]
    fn test_subscription_deactivation_is_terminal() {
        let mut order = create_test_order();
        order.interval = Some(Interval::Month);
        let now = Utc::now();

        let mut subscription = Subscription::for_order(&order, now, now).unwrap();
        assert!(!subscription.is_active);

        subscription.activate(now).unwrap();
        assert!(subscription.is_active);

        subscription.deactivate(now).unwrap();
        assert!(!subscription.is_active);
        assert!(subscription.activate(now).is_err());
        assert!(subscription.deactivate(now).is_err());
    }

    #[test]
    fn test_tier_capacity_remaining() {
        let mut tier = Tier::new(Uuid::now_v7(), "Backer", 1000, Currency::usd());
        assert!(tier.capacity().is_none());

        tier.max_quantity = Some(10);
        let capacity = tier.capacity().unwrap();
        assert_eq!(capacity.remaining(7), 3);
        assert_eq!(capacity.remaining(12), 0);
    }

    #[test]
    fn test_matching_fund_eligibility() {
        let collective = Uuid::now_v7();
        let mut fund = PaymentMethod::new(
            PaymentMethodKind::Card,
            Uuid::now_v7(),
            "tok_fund",
            Currency::usd(),
        );
        assert!(!fund.can_match(collective));

        fund.matching = Some(dec!(2));
        assert!(fund.can_match(collective));

        fund.limited_to_collective_id = Some(Uuid::now_v7());
        assert!(!fund.can_match(collective));
    }

    #[test]
    fn test_fee_breakdown_total() {
        let fees = FeeBreakdown { host_fee: 500, platform_fee: 250, processor_fee: 175 };
        assert_eq!(fees.total(), 925);
        assert!(!fees.has_negative());
    }
}
