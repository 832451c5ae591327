//! PostgreSQL store implementation.
//!
//! Check-then-write operations run inside one SQL transaction and lock the
//! row that serializes them with `FOR UPDATE`: `tiers` for capacity, `orders`
//! for settlement, `subscriptions` for schedule changes and the refunded
//! `transactions` for refund links.
//!
//! This module uses dynamic queries (sqlx::query) instead of compile-time
//! checked macros (sqlx::query!) to allow compilation without DATABASE_URL.

use crate::error::StoreError;
use crate::repository::{
    refund_links, AppendOptions, OrderRepository, PartyRepository, PaymentMethodRepository,
    Reschedule, Store, SubscriptionRepository, TierRepository, TransactionRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};
use std::sync::Arc;
use tipjar_domain::{
    Currency, FeePercent, Order, OrderId, OrderStatus, Party, PartyId, PaymentMethod,
    PaymentMethodId, Subscription, SubscriptionId, Tier, TierCapacity, TierId, Transaction,
    TransactionGroupId, TransactionId,
};
use tracing::debug;

/// PostgreSQL-backed store.
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    /// Create a store over an existing pool.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying pool (for testing).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// =============================================================================
// Row mapping
// =============================================================================

const PARTY_COLUMNS: &str =
    "id, kind, name, slug, is_active, host_id, currency, host_fee_percent, email, created_at";

const TIER_COLUMNS: &str = "id, collective_id, name, amount, currency, interval, max_quantity, \
     max_quantity_per_user, has_presets, created_at";

const PAYMENT_METHOD_COLUMNS: &str = "id, kind, owner_id, token, currency, balance, matching, \
     limited_to_collective_id, created_at";

const ORDER_COLUMNS: &str = "id, from_collective_id, collective_id, created_by, total_amount, \
     currency, interval, quantity, tier_id, payment_method_id, matching_fund_id, referral_id, \
     subscription_id, description, status, processed_at, host_fee_percent, platform_fee_percent, \
     created_at";

const SUBSCRIPTION_COLUMNS: &str = "id, order_id, amount, currency, interval, is_active, \
     next_charge_date, next_period_start, charge_retry_count, activated_at, deactivated_at, \
     created_at";

const TRANSACTION_COLUMNS: &str = "id, seq, kind, collective_id, from_collective_id, \
     host_collective_id, amount, currency, amount_in_host_currency, host_currency, \
     host_currency_fx_rate, host_fee_in_host_currency, platform_fee_in_host_currency, \
     payment_processor_fee_in_host_currency, net_amount_in_collective_currency, order_id, \
     payment_method_id, created_by, group_id, refund_id, description, data, created_at";

fn currency(row: &PgRow, column: &str) -> Result<Currency, StoreError> {
    let code: String = row.try_get(column)?;
    Ok(Currency::new(&code)?)
}

fn fee_percent(value: Option<Decimal>) -> Result<Option<FeePercent>, StoreError> {
    Ok(value.map(FeePercent::new).transpose()?)
}

fn interval(row: &PgRow) -> Result<Option<tipjar_domain::Interval>, StoreError> {
    let value: Option<String> = row.try_get("interval")?;
    Ok(value.map(|s| s.parse()).transpose()?)
}

fn to_u32(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::Serialization(format!("negative {}: {}", column, value)))
}

fn to_i32(value: u32, column: &str) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::Serialization(format!("{} out of range: {}", column, value)))
}

fn parse_party(row: &PgRow) -> Result<Party, StoreError> {
    let kind: String = row.try_get("kind")?;
    let host_fee: Decimal = row.try_get("host_fee_percent")?;
    Ok(Party {
        id: row.try_get("id")?,
        kind: kind.parse()?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        is_active: row.try_get("is_active")?,
        host_id: row.try_get("host_id")?,
        currency: currency(row, "currency")?,
        host_fee_percent: FeePercent::new(host_fee)?,
        email: row.try_get("email")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_tier(row: &PgRow) -> Result<Tier, StoreError> {
    let max_quantity: Option<i32> = row.try_get("max_quantity")?;
    let per_user: Option<i32> = row.try_get("max_quantity_per_user")?;
    Ok(Tier {
        id: row.try_get("id")?,
        collective_id: row.try_get("collective_id")?,
        name: row.try_get("name")?,
        amount: row.try_get("amount")?,
        currency: currency(row, "currency")?,
        interval: interval(row)?,
        max_quantity: max_quantity.map(|v| to_u32(v, "max_quantity")).transpose()?,
        max_quantity_per_user: per_user.map(|v| to_u32(v, "max_quantity_per_user")).transpose()?,
        has_presets: row.try_get("has_presets")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_payment_method(row: &PgRow) -> Result<PaymentMethod, StoreError> {
    let kind: String = row.try_get("kind")?;
    Ok(PaymentMethod {
        id: row.try_get("id")?,
        kind: kind.parse()?,
        owner_id: row.try_get("owner_id")?,
        token: row.try_get("token")?,
        currency: currency(row, "currency")?,
        balance: row.try_get("balance")?,
        matching: row.try_get("matching")?,
        limited_to_collective_id: row.try_get("limited_to_collective_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_order(row: &PgRow) -> Result<Order, StoreError> {
    let status: String = row.try_get("status")?;
    let quantity: i32 = row.try_get("quantity")?;
    Ok(Order {
        id: row.try_get("id")?,
        from_collective_id: row.try_get("from_collective_id")?,
        collective_id: row.try_get("collective_id")?,
        created_by: row.try_get("created_by")?,
        total_amount: row.try_get("total_amount")?,
        currency: currency(row, "currency")?,
        interval: interval(row)?,
        quantity: to_u32(quantity, "quantity")?,
        tier_id: row.try_get("tier_id")?,
        payment_method_id: row.try_get("payment_method_id")?,
        matching_fund_id: row.try_get("matching_fund_id")?,
        referral_id: row.try_get("referral_id")?,
        subscription_id: row.try_get("subscription_id")?,
        description: row.try_get("description")?,
        status: status.parse::<OrderStatus>()?,
        processed_at: row.try_get("processed_at")?,
        host_fee_percent: fee_percent(row.try_get("host_fee_percent")?)?,
        platform_fee_percent: fee_percent(row.try_get("platform_fee_percent")?)?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_subscription(row: &PgRow) -> Result<Subscription, StoreError> {
    let interval: String = row.try_get("interval")?;
    let retries: i32 = row.try_get("charge_retry_count")?;
    Ok(Subscription {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        amount: row.try_get("amount")?,
        currency: currency(row, "currency")?,
        interval: interval.parse()?,
        is_active: row.try_get("is_active")?,
        next_charge_date: row.try_get("next_charge_date")?,
        next_period_start: row.try_get("next_period_start")?,
        charge_retry_count: to_u32(retries, "charge_retry_count")?,
        activated_at: row.try_get("activated_at")?,
        deactivated_at: row.try_get("deactivated_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_transaction(row: &PgRow) -> Result<Transaction, StoreError> {
    let kind: String = row.try_get("kind")?;
    Ok(Transaction {
        id: row.try_get("id")?,
        seq: row.try_get("seq")?,
        kind: kind.parse()?,
        collective_id: row.try_get("collective_id")?,
        from_collective_id: row.try_get("from_collective_id")?,
        host_collective_id: row.try_get("host_collective_id")?,
        amount: row.try_get("amount")?,
        currency: currency(row, "currency")?,
        amount_in_host_currency: row.try_get("amount_in_host_currency")?,
        host_currency: currency(row, "host_currency")?,
        host_currency_fx_rate: row.try_get("host_currency_fx_rate")?,
        host_fee_in_host_currency: row.try_get("host_fee_in_host_currency")?,
        platform_fee_in_host_currency: row.try_get("platform_fee_in_host_currency")?,
        payment_processor_fee_in_host_currency: row
            .try_get("payment_processor_fee_in_host_currency")?,
        net_amount_in_collective_currency: row.try_get("net_amount_in_collective_currency")?,
        order_id: row.try_get("order_id")?,
        payment_method_id: row.try_get("payment_method_id")?,
        created_by: row.try_get("created_by")?,
        group_id: row.try_get("group_id")?,
        refund_id: row.try_get("refund_id")?,
        description: row.try_get("description")?,
        data: row.try_get("data")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Lock a subscription row and apply `reschedule` to it.
async fn reschedule_in(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    reschedule: &Reschedule,
) -> Result<Subscription, StoreError> {
    let mut subscription = lock_subscription(tx, reschedule.subscription_id).await?;
    reschedule.apply(&mut subscription)?;

    sqlx::query(
        "UPDATE subscriptions SET next_charge_date = $2, next_period_start = $3, \
         charge_retry_count = $4 WHERE id = $1",
    )
    .bind(subscription.id)
    .bind(subscription.next_charge_date)
    .bind(subscription.next_period_start)
    .bind(to_i32(subscription.charge_retry_count, "charge_retry_count")?)
    .execute(&mut **tx)
    .await?;
    Ok(subscription)
}

async fn lock_subscription(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    id: SubscriptionId,
) -> Result<Subscription, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM subscriptions WHERE id = $1 FOR UPDATE",
        SUBSCRIPTION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| StoreError::not_found("subscription", id.to_string()))?;
    parse_subscription(&row)
}

/// Lock the tier row and check that `requested` more units fit.
async fn check_capacity(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    capacity: TierCapacity,
    requested: u32,
    except: Option<OrderId>,
) -> Result<(), StoreError> {
    sqlx::query("SELECT id FROM tiers WHERE id = $1 FOR UPDATE")
        .bind(capacity.tier_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| StoreError::not_found("tier", capacity.tier_id.to_string()))?;

    let reserved: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(quantity), 0)::BIGINT
        FROM orders
        WHERE tier_id = $1
          AND status <> 'error'
          AND ($2::UUID IS NULL OR id <> $2)
        "#,
    )
    .bind(capacity.tier_id)
    .bind(except)
    .fetch_one(&mut **tx)
    .await?;

    let remaining = capacity.remaining(u64::try_from(reserved).unwrap_or(0));
    if u64::from(requested) > remaining {
        return Err(StoreError::CapacityExceeded {
            tier_id: capacity.tier_id,
            requested,
            remaining,
        });
    }
    Ok(())
}

async fn insert_transaction(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    row: &Transaction,
) -> Result<Transaction, StoreError> {
    let seq: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO transactions (
            id, kind, collective_id, from_collective_id, host_collective_id,
            amount, currency, amount_in_host_currency, host_currency, host_currency_fx_rate,
            host_fee_in_host_currency, platform_fee_in_host_currency,
            payment_processor_fee_in_host_currency, net_amount_in_collective_currency,
            order_id, payment_method_id, created_by, group_id, refund_id,
            description, data, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21, $22)
        RETURNING seq
        "#,
    )
    .bind(row.id)
    .bind(row.kind.as_str())
    .bind(row.collective_id)
    .bind(row.from_collective_id)
    .bind(row.host_collective_id)
    .bind(row.amount)
    .bind(row.currency.as_str())
    .bind(row.amount_in_host_currency)
    .bind(row.host_currency.as_str())
    .bind(row.host_currency_fx_rate)
    .bind(row.host_fee_in_host_currency)
    .bind(row.platform_fee_in_host_currency)
    .bind(row.payment_processor_fee_in_host_currency)
    .bind(row.net_amount_in_collective_currency)
    .bind(row.order_id)
    .bind(row.payment_method_id)
    .bind(row.created_by)
    .bind(row.group_id)
    .bind(row.refund_id)
    .bind(&row.description)
    .bind(&row.data)
    .bind(row.created_at)
    .fetch_one(&mut **tx)
    .await?;

    let mut stored = row.clone();
    stored.seq = seq;
    Ok(stored)
}

// =============================================================================
// Party Repository Implementation
// =============================================================================

#[async_trait]
impl PartyRepository for PgStore {
    async fn insert(&self, party: &Party) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO parties (id, kind, name, slug, is_active, host_id, currency,
                                 host_fee_percent, email, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(party.id)
        .bind(party.kind.as_str())
        .bind(&party.name)
        .bind(&party.slug)
        .bind(party.is_active)
        .bind(party.host_id)
        .bind(party.currency.as_str())
        .bind(party.host_fee_percent.as_decimal())
        .bind(&party.email)
        .bind(party.created_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: PartyId) -> Result<Option<Party>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM parties WHERE id = $1", PARTY_COLUMNS))
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        row.as_ref().map(parse_party).transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<Party>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM parties WHERE kind = 'user' AND lower(email) = lower($1)",
            PARTY_COLUMNS
        ))
        .bind(email.trim())
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.as_ref().map(parse_party).transpose()
    }
}

// =============================================================================
// Tier Repository Implementation
// =============================================================================

#[async_trait]
impl TierRepository for PgStore {
    async fn insert(&self, tier: &Tier) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tiers (id, collective_id, name, amount, currency, interval, max_quantity,
                               max_quantity_per_user, has_presets, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(tier.id)
        .bind(tier.collective_id)
        .bind(&tier.name)
        .bind(tier.amount)
        .bind(tier.currency.as_str())
        .bind(tier.interval.map(|i| i.as_str()))
        .bind(tier.max_quantity.map(|v| to_i32(v, "max_quantity")).transpose()?)
        .bind(tier.max_quantity_per_user.map(|v| to_i32(v, "max_quantity_per_user")).transpose()?)
        .bind(tier.has_presets)
        .bind(tier.created_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: TierId) -> Result<Option<Tier>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM tiers WHERE id = $1", TIER_COLUMNS))
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        row.as_ref().map(parse_tier).transpose()
    }
}

// =============================================================================
// Payment Method Repository Implementation
// =============================================================================

#[async_trait]
impl PaymentMethodRepository for PgStore {
    async fn insert(&self, payment_method: &PaymentMethod) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO payment_methods (id, kind, owner_id, token, currency, balance, matching,
                                         limited_to_collective_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(payment_method.id)
        .bind(payment_method.kind.as_str())
        .bind(payment_method.owner_id)
        .bind(&payment_method.token)
        .bind(payment_method.currency.as_str())
        .bind(payment_method.balance)
        .bind(payment_method.matching)
        .bind(payment_method.limited_to_collective_id)
        .bind(payment_method.created_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: PaymentMethodId) -> Result<Option<PaymentMethod>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM payment_methods WHERE id = $1",
            PAYMENT_METHOD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.as_ref().map(parse_payment_method).transpose()
    }

    async fn debit_balance(&self, id: PaymentMethodId, amount: i64) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM payment_methods WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::not_found("payment_method", id.to_string()))?;
        let balance = balance.ok_or_else(|| {
            StoreError::invalid_state(format!("payment method {} has no balance", id))
        })?;
        if balance < amount {
            return Err(StoreError::InsufficientBalance {
                payment_method_id: id,
                balance,
                requested: amount,
            });
        }

        let updated: i64 = sqlx::query_scalar(
            "UPDATE payment_methods SET balance = balance - $2 WHERE id = $1 RETURNING balance",
        )
        .bind(id)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn credit_balance(&self, id: PaymentMethodId, amount: i64) -> Result<i64, StoreError> {
        let updated: Option<Option<i64>> = sqlx::query_scalar(
            "UPDATE payment_methods SET balance = balance + $2 WHERE id = $1 RETURNING balance",
        )
        .bind(id)
        .bind(amount)
        .fetch_optional(self.pool.as_ref())
        .await?;

        match updated {
            None => Err(StoreError::not_found("payment_method", id.to_string())),
            Some(None) => Err(StoreError::invalid_state(format!(
                "payment method {} has no balance",
                id
            ))),
            Some(Some(balance)) => Ok(balance),
        }
    }
}

// =============================================================================
// Order Repository Implementation
// =============================================================================

#[async_trait]
impl OrderRepository for PgStore {
    async fn insert(
        &self,
        order: &Order,
        capacity: Option<TierCapacity>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(capacity) = capacity {
            check_capacity(&mut tx, capacity, order.quantity, None).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO orders (
                id, from_collective_id, collective_id, created_by, total_amount, currency,
                interval, quantity, tier_id, payment_method_id, matching_fund_id, referral_id,
                subscription_id, description, status, processed_at, host_fee_percent,
                platform_fee_percent, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19)
            "#,
        )
        .bind(order.id)
        .bind(order.from_collective_id)
        .bind(order.collective_id)
        .bind(order.created_by)
        .bind(order.total_amount)
        .bind(order.currency.as_str())
        .bind(order.interval.map(|i| i.as_str()))
        .bind(to_i32(order.quantity, "quantity")?)
        .bind(order.tier_id)
        .bind(order.payment_method_id)
        .bind(order.matching_fund_id)
        .bind(order.referral_id)
        .bind(order.subscription_id)
        .bind(&order.description)
        .bind(order.status.as_str())
        .bind(order.processed_at)
        .bind(order.host_fee_percent.map(|p| p.as_decimal()))
        .bind(order.platform_fee_percent.map(|p| p.as_decimal()))
        .bind(order.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS))
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        row.as_ref().map(parse_order).transpose()
    }

    async fn reserved_quantity(&self, tier_id: TierId) -> Result<u64, StoreError> {
        let reserved: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(quantity), 0)::BIGINT FROM orders \
             WHERE tier_id = $1 AND status <> 'error'",
        )
        .bind(tier_id)
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(u64::try_from(reserved).unwrap_or(0))
    }

    async fn claim_for_execution(
        &self,
        id: OrderId,
        capacity: Option<TierCapacity>,
    ) -> Result<Order, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM orders WHERE id = $1 FOR UPDATE",
            ORDER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::not_found("order", id.to_string()))?;
        let mut order = parse_order(&row)?;

        if let Some(processed_at) = order.processed_at {
            return Err(StoreError::AlreadyProcessed { order_id: id, processed_at });
        }
        if order.status == OrderStatus::Error {
            if let Some(capacity) = capacity {
                check_capacity(&mut tx, capacity, order.quantity, Some(id)).await?;
            }
            sqlx::query("UPDATE orders SET status = 'pending' WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            order.status = OrderStatus::Pending;
        }

        tx.commit().await?;
        Ok(order)
    }

    async fn mark_failed(&self, id: OrderId) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE orders SET status = 'error' WHERE id = $1 AND processed_at IS NULL",
        )
        .bind(id)
        .execute(self.pool.as_ref())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::invalid_state(format!(
                "order {} is missing or processed and cannot fail",
                id
            )));
        }
        Ok(())
    }

    async fn set_subscription(
        &self,
        id: OrderId,
        subscription_id: SubscriptionId,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE orders SET subscription_id = $2 WHERE id = $1")
            .bind(id)
            .bind(subscription_id)
            .execute(self.pool.as_ref())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("order", id.to_string()));
        }
        Ok(())
    }

    async fn set_payment_method(
        &self,
        id: OrderId,
        payment_method_id: PaymentMethodId,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE orders SET payment_method_id = $2 WHERE id = $1")
            .bind(id)
            .bind(payment_method_id)
            .execute(self.pool.as_ref())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("order", id.to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Subscription Repository Implementation
// =============================================================================

#[async_trait]
impl SubscriptionRepository for PgStore {
    async fn insert(&self, subscription: &Subscription) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, order_id, amount, currency, interval, is_active, next_charge_date,
                next_period_start, charge_retry_count, activated_at, deactivated_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.order_id)
        .bind(subscription.amount)
        .bind(subscription.currency.as_str())
        .bind(subscription.interval.as_str())
        .bind(subscription.is_active)
        .bind(subscription.next_charge_date)
        .bind(subscription.next_period_start)
        .bind(to_i32(subscription.charge_retry_count, "charge_retry_count")?)
        .bind(subscription.activated_at)
        .bind(subscription.deactivated_at)
        .bind(subscription.created_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.as_ref().map(parse_subscription).transpose()
    }

    async fn save(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET is_active = $2,
                next_charge_date = $3,
                next_period_start = $4,
                charge_retry_count = $5,
                activated_at = $6,
                deactivated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.is_active)
        .bind(subscription.next_charge_date)
        .bind(subscription.next_period_start)
        .bind(to_i32(subscription.charge_retry_count, "charge_retry_count")?)
        .bind(subscription.activated_at)
        .bind(subscription.deactivated_at)
        .execute(self.pool.as_ref())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("subscription", subscription.id.to_string()));
        }
        Ok(())
    }

    async fn reschedule(&self, reschedule: &Reschedule) -> Result<Subscription, StoreError> {
        let mut tx = self.pool.begin().await?;
        let subscription = reschedule_in(&mut tx, reschedule).await?;
        tx.commit().await?;
        Ok(subscription)
    }

    async fn deactivate(
        &self,
        id: SubscriptionId,
        at: DateTime<Utc>,
    ) -> Result<Subscription, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut subscription = lock_subscription(&mut tx, id).await?;
        subscription.deactivate(at).map_err(|e| StoreError::invalid_state(e.to_string()))?;

        sqlx::query("UPDATE subscriptions SET is_active = FALSE, deactivated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(subscription)
    }

    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE is_active AND next_charge_date <= $1 \
             ORDER BY next_charge_date ASC",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(now)
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.iter().map(parse_subscription).collect()
    }
}

// =============================================================================
// Transaction Repository Implementation
// =============================================================================

#[async_trait]
impl TransactionRepository for PgStore {
    async fn append_pair(
        &self,
        debit: &Transaction,
        credit: &Transaction,
        options: AppendOptions,
    ) -> Result<(Transaction, Transaction), StoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(settle) = options.settle_order {
            let processed_at: Option<DateTime<Utc>> = sqlx::query_scalar(
                "SELECT processed_at FROM orders WHERE id = $1 FOR UPDATE",
            )
            .bind(settle.order_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("order", settle.order_id.to_string()))?;
            if let Some(processed_at) = processed_at {
                return Err(StoreError::AlreadyProcessed { order_id: settle.order_id, processed_at });
            }
        }

        if let Some(reschedule) = options.reschedule {
            reschedule_in(&mut tx, &reschedule).await?;
        }

        let originals = match options.refund_of {
            Some(group_id) => {
                let rows = sqlx::query(&format!(
                    "SELECT {} FROM transactions WHERE group_id = $1 ORDER BY seq FOR UPDATE",
                    TRANSACTION_COLUMNS
                ))
                .bind(group_id)
                .fetch_all(&mut *tx)
                .await?;
                let originals = rows.iter().map(parse_transaction).collect::<Result<Vec<_>, _>>()?;
                if let Some(linked) = originals.iter().find(|t| t.refund_id.is_some()) {
                    return Err(StoreError::AlreadyRefunded(linked.id));
                }
                originals
            },
            None => Vec::new(),
        };

        let stored_debit = insert_transaction(&mut tx, debit).await?;
        let stored_credit = insert_transaction(&mut tx, credit).await?;

        let (stored_debit, stored_credit) = if options.refund_of.is_some() {
            let mut quartet = originals;
            quartet.push(stored_debit.clone());
            quartet.push(stored_credit.clone());
            quartet.sort_by_key(|t| t.seq);

            for (id, refund_id) in refund_links(&quartet)? {
                sqlx::query("UPDATE transactions SET refund_id = $2 WHERE id = $1")
                    .bind(id)
                    .bind(refund_id)
                    .execute(&mut *tx)
                    .await?;
            }

            let linked = |row: Transaction| -> Transaction {
                let refund_id = quartet
                    .iter()
                    .position(|t| t.id == row.id)
                    .and_then(|i| quartet.get(3 - i))
                    .map(|t| t.id);
                Transaction { refund_id, ..row }
            };
            (linked(stored_debit), linked(stored_credit))
        } else {
            (stored_debit, stored_credit)
        };

        if let Some(settle) = options.settle_order {
            sqlx::query("UPDATE orders SET processed_at = $2, status = 'processed' WHERE id = $1")
                .bind(settle.order_id)
                .bind(settle.processed_at)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        debug!(
            group_id = %stored_credit.group_id,
            debit_seq = stored_debit.seq,
            credit_seq = stored_credit.seq,
            "Ledger pair appended"
        );
        Ok((stored_debit, stored_credit))
    }

    async fn find_by_id(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.as_ref().map(parse_transaction).transpose()
    }

    async fn find_by_group(
        &self,
        group_id: TransactionGroupId,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE group_id = $1 ORDER BY seq",
            TRANSACTION_COLUMNS
        ))
        .bind(group_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.iter().map(parse_transaction).collect()
    }

    async fn find_by_order(&self, order_id: OrderId) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE order_id = $1 ORDER BY seq",
            TRANSACTION_COLUMNS
        ))
        .bind(order_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.iter().map(parse_transaction).collect()
    }

    async fn find_by_collective(
        &self,
        collective_id: PartyId,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE collective_id = $1 ORDER BY seq",
            TRANSACTION_COLUMNS
        ))
        .bind(collective_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.iter().map(parse_transaction).collect()
    }
}

// =============================================================================
// Combined Store Implementation
// =============================================================================

#[async_trait]
impl Store for PgStore {
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
    use tipjar_domain::TransactionKind;
    use uuid::Uuid;

    async fn seed_parties(store: &PgStore) -> (Party, Party) {
        let host = Party::new_organization("Open Host", Currency::usd());
        PartyRepository::insert(store, &host).await.unwrap();
        let collective = Party::new_collective(
            "WWCode",
            Currency::usd(),
            host.id,
            FeePercent::new(Decimal::TEN).unwrap(),
        );
        PartyRepository::insert(store, &collective).await.unwrap();
        (host, collective)
    }

    fn row(kind: TransactionKind, group_id: Uuid, owner: Uuid, other: Uuid, amount: i64) -> Transaction {
        Transaction {
            id: Uuid::now_v7(),
            seq: 0,
            kind,
            collective_id: owner,
            from_collective_id: other,
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
            data: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_capacity_enforced_in_transaction(pool: PgPool) {
        let store = PgStore::new(Arc::new(pool));
        let (host, collective) = seed_parties(&store).await;
        let mut tier = Tier::new(collective.id, "Ticket", 1000, Currency::usd());
        tier.max_quantity = Some(1);
        TierRepository::insert(&store, &tier).await.unwrap();

        let order = |qty| {
            let mut o = Order::new(host.id, collective.id, host.id, 1000, Currency::usd(), qty)
                .unwrap();
            o.tier_id = Some(tier.id);
            o.description = "Ticket".to_string();
            o
        };

        OrderRepository::insert(&store, &order(1), tier.capacity()).await.unwrap();
        let result = OrderRepository::insert(&store, &order(1), tier.capacity()).await;
        assert!(matches!(result, Err(StoreError::CapacityExceeded { remaining: 0, .. })));
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_append_pair_settles_and_links_refund(pool: PgPool) {
        let store = PgStore::new(Arc::new(pool));
        let (host, collective) = seed_parties(&store).await;
        let mut order =
            Order::new(host.id, collective.id, host.id, 1000, Currency::usd(), 1).unwrap();
        order.description = "Donation".to_string();
        OrderRepository::insert(&store, &order, None).await.unwrap();

        let group = Uuid::now_v7();
        let settle = AppendOptions {
            settle_order: Some(SettleOrder { order_id: order.id, processed_at: Utc::now() }),
            ..AppendOptions::default()
        };
        let (tr1, tr2) = store
            .append_pair(
                &row(TransactionKind::Debit, group, host.id, collective.id, -1000),
                &row(TransactionKind::Credit, group, collective.id, host.id, 1000),
                settle,
            )
            .await
            .unwrap();
        assert!(tr1.seq < tr2.seq);

        let again = store
            .append_pair(
                &row(TransactionKind::Debit, Uuid::now_v7(), host.id, collective.id, -1000),
                &row(TransactionKind::Credit, Uuid::now_v7(), collective.id, host.id, 1000),
                settle,
            )
            .await;
        assert!(matches!(again, Err(StoreError::AlreadyProcessed { .. })));

        let refund_group = Uuid::now_v7();
        let (tr3, tr4) = store
            .append_pair(
                &row(TransactionKind::Debit, refund_group, collective.id, host.id, -1000),
                &row(TransactionKind::Credit, refund_group, host.id, collective.id, 1000),
                AppendOptions { refund_of: Some(group), ..AppendOptions::default() },
            )
            .await
            .unwrap();
        assert_eq!(tr3.refund_id, Some(tr2.id));
        assert_eq!(tr4.refund_id, Some(tr1.id));

        let original = store.find_by_group(group).await.unwrap();
        assert_eq!(original[0].refund_id, Some(tr4.id));
        assert_eq!(original[1].refund_id, Some(tr3.id));
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_renewal_pair_is_guarded_by_period(pool: PgPool) {
        let store = PgStore::new(Arc::new(pool));
        let (host, collective) = seed_parties(&store).await;
        let mut order =
            Order::new(host.id, collective.id, host.id, 1000, Currency::usd(), 1).unwrap();
        order.interval = Some(tipjar_domain::Interval::Month);
        OrderRepository::insert(&store, &order, None).await.unwrap();

        // Postgres keeps microseconds
        let now = chrono::SubsecRound::trunc_subsecs(Utc::now(), 6);
        let mut subscription = Subscription::for_order(&order, now, now).unwrap();
        subscription.activate(now).unwrap();
        SubscriptionRepository::insert(&store, &subscription).await.unwrap();

        let next = now + chrono::Duration::days(30);
        let reschedule = Reschedule {
            subscription_id: subscription.id,
            expected_period_start: subscription.next_period_start,
            next_charge_date: next,
            next_period_start: next,
            charge_retry_count: 0,
        };
        let options = AppendOptions { reschedule: Some(reschedule), ..AppendOptions::default() };

        // Cancellation between read and write is kept
        store.deactivate(subscription.id, now).await.unwrap();

        let group = Uuid::now_v7();
        store
            .append_pair(
                &row(TransactionKind::Debit, group, host.id, collective.id, -1000),
                &row(TransactionKind::Credit, group, collective.id, host.id, 1000),
                options,
            )
            .await
            .unwrap();

        let again = Uuid::now_v7();
        let result = store
            .append_pair(
                &row(TransactionKind::Debit, again, host.id, collective.id, -1000),
                &row(TransactionKind::Credit, again, collective.id, host.id, 1000),
                options,
            )
            .await;
        assert!(matches!(result, Err(StoreError::StaleSubscription { .. })));
        assert!(store.find_by_group(again).await.unwrap().is_empty());

        let stored =
            SubscriptionRepository::find_by_id(&store, subscription.id).await.unwrap().unwrap();
        assert_eq!(stored.next_period_start, next);
        assert!(!stored.is_active);
        assert!(stored.deactivated_at.is_some());
    }
}
