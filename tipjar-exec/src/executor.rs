//! Order Executor: validates, persists and settles orders.
//!
//! The executor is the bridge between the pure engine rules and the
//! gateways (I/O). It ensures one charge per order via the charge journal
//! and the order's `processed_at`, which the ledger sets atomically with
//! the charge pair.
//!
//! # Flow
//!
//! ```text
//! OrderRequest → validation steps → insert (capacity reserved)
//!              → FREE: processed at creation
//!              → PAYMENT_PENDING: Charge Journal → Gateway → Ledger → PROCESSED
//!                                 └→ matching fund charge (independent)
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use tipjar_domain::{
    Currency, FeePercent, Interval, Order, OrderId, Party, PartyId, PaymentMethod,
    PaymentMethodId, PaymentMethodKind, Subscription, Tier, TierId, Transaction, TransactionId,
};
use tipjar_engine::{
    check_quantity_per_user, default_description, matching_amount, matching_description,
    next_billing_dates, next_charge_retry_count, parse_interval, plan_amount, validate_payment,
    BillingPolicy, SubscriptionEvent, DEFAULT_MIN_CHARGE_AMOUNT,
};
use tipjar_ledger::Ledger;
use tipjar_store::{Store, StoreError};

use crate::error::{ErrorKind, ExecError, ExecResult};
use crate::gateway::{ChargeContext, ChargePurpose, FeePlan, GatewayRegistry, RefundResult};
use crate::journal::{AttemptOutcome, ChargeJournal};
use crate::ports::PaymentProcessor;

// =============================================================================
// Caller & Request
// =============================================================================

/// Identity and capabilities asserted by the caller boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    /// Logged-in user; `None` for guest contributions
    pub user_id: Option<PartyId>,
    /// Platform operator
    pub is_root: bool,
    /// Parties the user administers
    pub admin_of: HashSet<PartyId>,
}

impl Caller {
    /// A guest without an account
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// A logged-in user
    pub fn user(user_id: PartyId) -> Self {
        Self { user_id: Some(user_id), ..Self::default() }
    }

    /// A platform operator
    pub fn root(user_id: PartyId) -> Self {
        Self { user_id: Some(user_id), is_root: true, ..Self::default() }
    }

    /// Grant admin rights over `party_id`
    pub fn with_admin_of(mut self, party_id: PartyId) -> Self {
        self.admin_of.insert(party_id);
        self
    }

    /// Whether the caller may act for `party_id`
    pub fn is_admin_of(&self, party_id: PartyId) -> bool {
        self.is_root || self.user_id == Some(party_id) || self.admin_of.contains(&party_id)
    }
}

/// Who pays for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceParty {
    /// A party the caller administers
    Existing(PartyId),
    /// An individual, looked up by email or created
    User { name: String, email: String },
    /// A new organization created by the caller
    Organization { name: String },
}

/// Order creation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub collective_id: PartyId,
    pub from: SourceParty,
    pub tier_id: Option<TierId>,
    pub quantity: u32,
    /// Ignored when the tier dictates the amount
    pub total_amount: Option<i64>,
    /// `month` or `year`
    pub interval: Option<String>,
    pub payment_method_id: Option<PaymentMethodId>,
    pub matching_fund_id: Option<PaymentMethodId>,
    pub referral_id: Option<PartyId>,
    pub description: Option<String>,
    /// Requires admin of the destination's host
    pub host_fee_percent: Option<FeePercent>,
    /// Requires root
    pub platform_fee_percent: Option<FeePercent>,
}

impl OrderRequest {
    /// One unit from `from` to `collective_id`, no tier, no amount
    pub fn new(collective_id: PartyId, from: SourceParty) -> Self {
        Self {
            collective_id,
            from,
            tier_id: None,
            quantity: 1,
            total_amount: None,
            interval: None,
            payment_method_id: None,
            matching_fund_id: None,
            referral_id: None,
            description: None,
            host_fee_percent: None,
            platform_fee_percent: None,
        }
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// What happened to the matching fund charge of an order.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchingOutcome {
    /// No eligible matching fund, or the primary charge did not materialize
    NotRequested,
    /// Matching CREDIT written
    Matched(Transaction),
    /// Matching charge settles asynchronously
    Deferred,
    /// Matching charge failed; the primary charge stands
    Failed { kind: ErrorKind, message: String },
}

/// Materialized view returned to the caller.
#[derive(Debug, Clone)]
pub struct OrderOutcome {
    pub order: Order,
    /// CREDIT of the primary charge; `None` for free or asynchronous orders
    pub transaction: Option<Transaction>,
    pub subscription: Option<Subscription>,
    pub matching: MatchingOutcome,
}

// =============================================================================
// Executor
// =============================================================================

/// Executor settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Smallest amount a paid order may have, in minor units
    pub min_charge_amount: i64,
    /// Platform fee when the order carries no override
    pub platform_fee_percent: FeePercent,
    pub billing: BillingPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            min_charge_amount: DEFAULT_MIN_CHARGE_AMOUNT,
            platform_fee_percent: FeePercent::from_percent(5),
            billing: BillingPolicy::default(),
        }
    }
}

/// Validated inputs of an order, before anything is written.
struct ValidatedOrder {
    collective: Party,
    tier: Option<Tier>,
    total_amount: i64,
    currency: Currency,
    interval: Option<Interval>,
    payment_required: bool,
    payment_method: Option<PaymentMethod>,
    source: ResolvedSource,
    matching_fund_id: Option<PaymentMethodId>,
}

/// Source party after lookup; new parties are only inserted once every
/// validation step passed.
enum ResolvedSource {
    Found(Party),
    Create(Party),
}

/// Executes orders with at-most-once charge guarantees.
///
/// The executor:
/// 1. Validates the request (ordered steps, first failure wins)
/// 2. Inserts the order, reserving tier capacity atomically
/// 3. Claims the charge in the journal
/// 4. Charges through the gateway of the payment method variant
/// 5. Activates the subscription and runs the matching fund charge
pub struct OrderExecutor<S: Store> {
    pub(crate) store: Arc<S>,
    pub(crate) ledger: Ledger<S>,
    pub(crate) registry: GatewayRegistry,
    pub(crate) journal: Arc<ChargeJournal>,
    pub(crate) config: ExecutorConfig,
}

impl<S: Store + 'static> OrderExecutor<S> {
    /// Create a new executor.
    pub fn new(
        store: Arc<S>,
        registry: GatewayRegistry,
        journal: Arc<ChargeJournal>,
        config: ExecutorConfig,
    ) -> Self {
        let ledger = Ledger::new(store.clone());
        Self { store, ledger, registry, journal, config }
    }

    /// Executor with the standard gateways, card charges going to `processor`.
    pub fn standard(
        store: Arc<S>,
        processor: Arc<dyn PaymentProcessor>,
        config: ExecutorConfig,
    ) -> Self {
        let ledger = Ledger::new(store.clone());
        let registry = GatewayRegistry::standard(store.clone(), ledger.clone(), processor);
        Self::new(store, registry, Arc::new(ChargeJournal::new()), config)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn ledger(&self) -> &Ledger<S> {
        &self.ledger
    }

    pub fn journal(&self) -> &Arc<ChargeJournal> {
        &self.journal
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    // =========================================================================
    // Order creation
    // =========================================================================

    /// Validate, persist and (when paid) execute an order.
    ///
    /// Validation failures write nothing. Gateway failures leave the order
    /// in `error`, retryable through [`execute_order`](Self::execute_order).
    pub async fn create_order(
        &self,
        caller: &Caller,
        request: OrderRequest,
    ) -> ExecResult<OrderOutcome> {
        let validated = self.validate(caller, &request).await?;

        let source = match validated.source {
            ResolvedSource::Create(party) => {
                self.store.parties().insert(&party).await?;
                info!(party_id = %party.id, kind = %party.kind.as_str(), "Source party created");
                party
            },
            ResolvedSource::Found(party) => party,
        };
        let created_by = match (&request.from, caller.user_id) {
            (SourceParty::User { .. }, None) => source.id,
            (_, Some(user_id)) => user_id,
            (_, None) => return Err(ExecError::Unauthorized("You need to be logged in".into())),
        };

        let mut order = Order::new(
            source.id,
            validated.collective.id,
            created_by,
            validated.total_amount,
            validated.currency,
            request.quantity,
        )?;
        order.interval = validated.interval;
        order.tier_id = validated.tier.as_ref().map(|t| t.id);
        order.payment_method_id = validated.payment_method.as_ref().map(|pm| pm.id);
        order.matching_fund_id = validated.matching_fund_id;
        order.referral_id = request.referral_id;
        order.host_fee_percent = request.host_fee_percent;
        order.platform_fee_percent = request.platform_fee_percent;
        order.description = request.description.clone().unwrap_or_else(|| {
            default_description(
                order.interval,
                &validated.collective.name,
                validated.tier.as_ref().map(|t| t.name.as_str()),
            )
        });
        if !validated.payment_required {
            order.mark_processed(Utc::now())?;
        }

        let capacity = validated.tier.as_ref().and_then(Tier::capacity);
        self.store.orders().insert(&order, capacity).await.map_err(capacity_error)?;

        info!(
            order_id = %order.id,
            collective_id = %order.collective_id,
            from_collective_id = %order.from_collective_id,
            amount = order.total_amount,
            payment_required = validated.payment_required,
            "Order created"
        );

        if validated.payment_required {
            self.execute_order(order.id).await
        } else {
            Ok(OrderOutcome {
                order,
                transaction: None,
                subscription: None,
                matching: MatchingOutcome::NotRequested,
            })
        }
    }

    /// Ordered validation steps; nothing is written here.
    async fn validate(&self, caller: &Caller, request: &OrderRequest) -> ExecResult<ValidatedOrder> {
        // 1. Privileged fields
        if request.platform_fee_percent.is_some() && !caller.is_root {
            return Err(ExecError::Forbidden(
                "Only a root user can set the platform fee".to_string(),
            ));
        }

        // 2. Destination
        let collective = self
            .store
            .parties()
            .find_by_id(request.collective_id)
            .await?
            .ok_or_else(|| ExecError::not_found("collective", request.collective_id))?;
        if request.host_fee_percent.is_some()
            && !collective.host_id.map(|h| caller.is_admin_of(h)).unwrap_or(false)
        {
            return Err(ExecError::Forbidden(
                "Only an admin of the host can set the host fee".to_string(),
            ));
        }
        if !collective.is_active {
            return Err(ExecError::Validation(format!(
                "This collective is not active and cannot receive contributions: {}",
                collective.slug
            )));
        }
        if request.from == SourceParty::Existing(collective.id) {
            return Err(ExecError::Validation(
                "Orders cannot be created for a collective by that same collective".to_string(),
            ));
        }

        // 3. Tier
        let tier = match request.tier_id {
            Some(tier_id) => {
                let tier = self
                    .store
                    .tiers()
                    .find_by_id(tier_id)
                    .await?
                    .filter(|t| t.collective_id == collective.id)
                    .ok_or_else(|| ExecError::not_found("tier", tier_id))?;
                Some(tier)
            },
            None => None,
        };

        // 4. Amount and interval
        let interval = parse_interval(request.interval.as_deref())?;
        let plan = plan_amount(
            tier.as_ref(),
            request.total_amount,
            request.quantity,
            interval,
            &collective.currency,
        )?;
        if plan.payment_required {
            validate_payment(plan.total_amount, self.config.min_charge_amount)?;
        }

        // 5. Payment method
        let payment_method = if plan.payment_required {
            let id = request.payment_method_id.ok_or_else(|| {
                ExecError::Validation("This order requires a payment method".to_string())
            })?;
            let payment_method = self
                .store
                .payment_methods()
                .find_by_id(id)
                .await?
                .ok_or_else(|| ExecError::not_found("payment method", id))?;
            if !caller.is_admin_of(payment_method.owner_id) {
                return Err(ExecError::Forbidden(
                    "You don't have sufficient permissions to access this payment method"
                        .to_string(),
                ));
            }
            Some(payment_method)
        } else {
            None
        };

        // 6. Quantity per user
        if let Some(tier) = &tier {
            check_quantity_per_user(tier, request.quantity)?;
        }

        // 7. Source party
        let source = self.resolve_source(caller, &collective, &request.from).await?;

        // 8. Matching fund
        let matching_fund_id = match request.matching_fund_id {
            Some(fund_id) => {
                let fund = self
                    .store
                    .payment_methods()
                    .find_by_id(fund_id)
                    .await?
                    .ok_or_else(|| ExecError::not_found("matching fund", fund_id))?;
                if fund.can_match(collective.id) {
                    Some(fund.id)
                } else {
                    debug!(%fund_id, collective_id = %collective.id, "Matching fund not eligible, ignored");
                    None
                }
            },
            None => None,
        };

        Ok(ValidatedOrder {
            collective,
            tier,
            total_amount: plan.total_amount,
            currency: plan.currency,
            interval: plan.interval,
            payment_required: plan.payment_required,
            payment_method,
            source,
            matching_fund_id,
        })
    }

    async fn resolve_source(
        &self,
        caller: &Caller,
        collective: &Party,
        from: &SourceParty,
    ) -> ExecResult<ResolvedSource> {
        match from {
            SourceParty::Existing(id) => {
                if caller.user_id.is_none() {
                    return Err(ExecError::Unauthorized(
                        "You need to be logged in to create an order for an existing account"
                            .to_string(),
                    ));
                }
                let party = self
                    .store
                    .parties()
                    .find_by_id(*id)
                    .await?
                    .ok_or_else(|| ExecError::not_found("from collective", id))?;
                let host_admin = collective.host_id.map(|h| caller.is_admin_of(h)).unwrap_or(false);
                if !caller.is_admin_of(party.id) && !host_admin {
                    return Err(ExecError::Forbidden(format!(
                        "You don't have sufficient permissions to create an order on behalf of {}",
                        party.name
                    )));
                }
                Ok(ResolvedSource::Found(party))
            },
            SourceParty::User { name, email } => {
                if email.trim().is_empty() {
                    return Err(ExecError::Validation("An email is required".to_string()));
                }
                match self.store.parties().find_user_by_email(email).await? {
                    Some(user) => Ok(ResolvedSource::Found(user)),
                    None => Ok(ResolvedSource::Create(Party::new_user(name, email))),
                }
            },
            SourceParty::Organization { name } => {
                if caller.user_id.is_none() {
                    return Err(ExecError::Unauthorized(
                        "You need to be logged in to create an organization".to_string(),
                    ));
                }
                Ok(ResolvedSource::Create(Party::new_organization(
                    name,
                    collective.currency.clone(),
                )))
            },
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Charge a pending (or previously failed) order.
    ///
    /// Fails with `AlreadyProcessed` on a settled order or while another
    /// execution of the same order is in flight.
    pub async fn execute_order(&self, order_id: OrderId) -> ExecResult<OrderOutcome> {
        let order = self.find_order(order_id).await?;
        let capacity = match order.tier_id {
            Some(tier_id) => self.store.tiers().find_by_id(tier_id).await?.and_then(|t| t.capacity()),
            None => None,
        };

        let order = self
            .store
            .orders()
            .claim_for_execution(order_id, capacity)
            .await
            .map_err(|e| match e {
                StoreError::AlreadyProcessed { order_id, processed_at } => ExecError::AlreadyProcessed(
                    format!("order {} was processed at {}", order_id, processed_at),
                ),
                other => capacity_error(other),
            })?;
        self.journal.claim(order.id, &ChargePurpose::Initial)?;

        match self.charge_primary(order).await {
            Ok(outcome) => {
                let journal_outcome = match &outcome.transaction {
                    Some(tx) => AttemptOutcome::Succeeded(tx.id),
                    None => AttemptOutcome::Deferred,
                };
                self.journal.complete(order_id, &ChargePurpose::Initial, journal_outcome)?;
                Ok(outcome)
            },
            Err(e) => {
                error!(%order_id, error = %e, kind = %e.kind().as_str(), "Order execution failed");
                self.journal.complete(
                    order_id,
                    &ChargePurpose::Initial,
                    AttemptOutcome::Failed(e.to_string()),
                )?;
                if let Err(mark) = self.store.orders().mark_failed(order_id).await {
                    warn!(%order_id, error = %mark, "Failed to mark order as failed");
                }
                Err(e)
            },
        }
    }

    async fn charge_primary(&self, order: Order) -> ExecResult<OrderOutcome> {
        let now = Utc::now();
        let mut order = order;

        // Subscription exists before the first charge attempt
        let mut subscription = match (order.interval, order.subscription_id) {
            (Some(_), Some(subscription_id)) => {
                self.store.subscriptions().find_by_id(subscription_id).await?
            },
            (Some(interval), None) => {
                let dates = next_billing_dates(
                    SubscriptionEvent::New,
                    interval,
                    None,
                    now,
                    &self.config.billing,
                )?;
                let subscription =
                    Subscription::for_order(&order, dates.next_charge_date, dates.next_period_start)?;
                self.store.subscriptions().insert(&subscription).await?;
                self.store.orders().set_subscription(order.id, subscription.id).await?;
                order.subscription_id = Some(subscription.id);
                debug!(order_id = %order.id, subscription_id = %subscription.id, "Subscription created");
                Some(subscription)
            },
            (None, _) => None,
        };

        let ctx = self.charge_context(&order, ChargePurpose::Initial, true).await?;
        let gateway = self.registry.get(ctx.payment_method.kind)?;
        let transaction = gateway.process_order(&ctx).await?;

        if let (Some(tx), Some(subscription)) = (&transaction, subscription.as_mut()) {
            let paid_at = tx.created_at;
            subscription.activate(paid_at)?;
            let dates = next_billing_dates(
                SubscriptionEvent::Success,
                subscription.interval,
                Some((&*subscription).into()),
                paid_at,
                &self.config.billing,
            )?;
            subscription.next_charge_date = dates.next_charge_date;
            subscription.next_period_start = dates.next_period_start;
            subscription.charge_retry_count =
                next_charge_retry_count(SubscriptionEvent::Success, subscription.charge_retry_count);
            self.store.subscriptions().save(subscription).await?;
            info!(
                subscription_id = %subscription.id,
                next_charge_date = %subscription.next_charge_date,
                "Subscription activated"
            );
        }

        let matching = match (&transaction, order.matching_fund_id) {
            (Some(_), Some(fund_id)) => self.charge_matching(&ctx, fund_id).await,
            _ => MatchingOutcome::NotRequested,
        };

        match &transaction {
            Some(tx) => info!(order_id = %order.id, transaction_id = %tx.id, "Order processed"),
            None => info!(order_id = %order.id, "Order awaiting settlement"),
        }

        Ok(OrderOutcome {
            order: self.find_order(order.id).await?,
            transaction,
            subscription,
            matching,
        })
    }

    /// Charge the matching fund; never fails the primary charge.
    async fn charge_matching(
        &self,
        primary: &ChargeContext,
        fund_id: PaymentMethodId,
    ) -> MatchingOutcome {
        let order_id = primary.order.id;
        if let Err(e) = self.journal.claim(order_id, &ChargePurpose::Matching) {
            return matching_failed(order_id, e);
        }

        let result = self.try_charge_matching(primary, fund_id).await;
        let (outcome, journal_outcome) = match result {
            Ok(Some(tx)) => {
                info!(%order_id, transaction_id = %tx.id, "Matching fund charged");
                let id = tx.id;
                (MatchingOutcome::Matched(tx), AttemptOutcome::Succeeded(id))
            },
            Ok(None) => (MatchingOutcome::Deferred, AttemptOutcome::Deferred),
            Err(e) => {
                let message = e.to_string();
                (matching_failed(order_id, e), AttemptOutcome::Failed(message))
            },
        };
        if let Err(e) = self.journal.complete(order_id, &ChargePurpose::Matching, journal_outcome) {
            warn!(%order_id, error = %e, "Failed to record matching attempt");
        }
        outcome
    }

    async fn try_charge_matching(
        &self,
        primary: &ChargeContext,
        fund_id: PaymentMethodId,
    ) -> ExecResult<Option<Transaction>> {
        let fund = self
            .store
            .payment_methods()
            .find_by_id(fund_id)
            .await?
            .ok_or_else(|| ExecError::not_found("matching fund", fund_id))?;
        let multiplier = fund.matching.ok_or_else(|| {
            ExecError::Validation(format!("payment method {} is not a matching fund", fund.id))
        })?;
        let from = self
            .store
            .parties()
            .find_by_id(primary.order.from_collective_id)
            .await?
            .ok_or_else(|| ExecError::not_found("from collective", primary.order.from_collective_id))?;

        // Derived order: same id and destination, paid by the fund's owner
        let mut order = primary.order.clone();
        order.from_collective_id = fund.owner_id;
        order.total_amount = matching_amount(primary.order.total_amount, multiplier)?;
        order.payment_method_id = Some(fund.id);
        order.matching_fund_id = None;
        order.interval = None;
        order.description = matching_description(multiplier, &from.name);

        // Routed through the primary order's gateway variant
        let gateway = self.registry.get(primary.payment_method.kind)?;
        let ctx = ChargeContext {
            order,
            payment_method: fund,
            purpose: ChargePurpose::Matching,
            settle_order: false,
            reschedule: None,
            ..primary.clone()
        };
        gateway.process_order(&ctx).await
    }

    /// Everything a gateway needs to charge `order`.
    pub(crate) async fn charge_context(
        &self,
        order: &Order,
        purpose: ChargePurpose,
        settle_order: bool,
    ) -> ExecResult<ChargeContext> {
        let collective = self
            .store
            .parties()
            .find_by_id(order.collective_id)
            .await?
            .ok_or_else(|| ExecError::not_found("collective", order.collective_id))?;
        let host = match collective.host_id {
            Some(host_id) => self.store.parties().find_by_id(host_id).await?,
            None => None,
        };
        let payment_method_id = order.payment_method_id.ok_or_else(|| {
            ExecError::Validation(format!("order {} has no payment method", order.id))
        })?;
        let payment_method = self
            .store
            .payment_methods()
            .find_by_id(payment_method_id)
            .await?
            .ok_or_else(|| ExecError::not_found("payment method", payment_method_id))?;

        let fees = FeePlan {
            host_fee_percent: order.host_fee_percent.unwrap_or(collective.host_fee_percent),
            platform_fee_percent: order
                .platform_fee_percent
                .unwrap_or(self.config.platform_fee_percent),
        };

        Ok(ChargeContext {
            order: order.clone(),
            payment_method,
            collective,
            host,
            fees,
            purpose,
            settle_order,
            reschedule: None,
            created_by: order.created_by,
        })
    }

    pub(crate) async fn find_order(&self, order_id: OrderId) -> ExecResult<Order> {
        self.store
            .orders()
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| ExecError::not_found("order", order_id))
    }

    // =========================================================================
    // Refunds
    // =========================================================================

    /// Refund the group of `transaction_id` through its gateway.
    ///
    /// The caller must have created the transaction or administer the
    /// credited collective or its host.
    pub async fn refund_transaction(
        &self,
        caller: &Caller,
        transaction_id: TransactionId,
    ) -> ExecResult<RefundResult> {
        let transaction = self
            .ledger
            .find_by_id(transaction_id)
            .await?
            .ok_or_else(|| ExecError::not_found("transaction", transaction_id))?;
        let credit = self.ledger.collective_row(&transaction).await?;

        let is_creator = caller.user_id.is_some() && caller.user_id == credit.created_by;
        let is_admin = caller.is_admin_of(credit.collective_id)
            || credit.host_collective_id.map(|h| caller.is_admin_of(h)).unwrap_or(false);
        if !is_creator && !is_admin {
            return Err(ExecError::Unauthorized("Not an admin neither owner".to_string()));
        }
        if credit.is_refund_linked() {
            return Err(ExecError::Validation(format!(
                "transaction {} was already refunded",
                credit.id
            )));
        }

        let kind = match credit.payment_method_id {
            Some(id) => self
                .store
                .payment_methods()
                .find_by_id(id)
                .await?
                .map(|pm| pm.kind)
                .unwrap_or(PaymentMethodKind::Manual),
            None => PaymentMethodKind::Manual,
        };

        let result = self.registry.get(kind)?.refund_transaction(&credit).await?;
        info!(
            transaction_id = %credit.id,
            refund_group_id = %result.refund_credit.group_id,
            %kind,
            "Transaction refunded"
        );
        Ok(result)
    }
}

fn capacity_error(error: StoreError) -> ExecError {
    match error {
        StoreError::CapacityExceeded { tier_id, requested, remaining } => {
            ExecError::CapacityExceeded(format!(
                "tier {} has {} units left, {} requested",
                tier_id, remaining, requested
            ))
        },
        other => ExecError::Store(other),
    }
}

fn matching_failed(order_id: OrderId, error: ExecError) -> MatchingOutcome {
    warn!(%order_id, error = %error, "Matching fund charge failed, primary charge kept");
    MatchingOutcome::Failed { kind: error.kind(), message: error.to_string() }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::{SimulatedTimeout, StubProcessor, DECLINED_TOKEN};
    use rust_decimal_macros::dec;
    use tipjar_domain::{Currency, OrderStatus};
    use tipjar_store::MemoryStore;
    use tipjar_testkit::Fixture;

    struct Harness {
        fx: Fixture,
        stub: Arc<StubProcessor>,
        executor: Arc<OrderExecutor<MemoryStore>>,
    }

    async fn harness() -> Harness {
        let fx = Fixture::new().await.unwrap();
        let stub = Arc::new(StubProcessor::new());
        let executor = Arc::new(OrderExecutor::standard(
            fx.store.clone(),
            stub.clone(),
            ExecutorConfig::default(),
        ));
        Harness { fx, stub, executor }
    }

    fn card_order(fx: &Fixture, amount: i64) -> OrderRequest {
        let mut request = OrderRequest::new(fx.collective.id, SourceParty::Existing(fx.user.id));
        request.total_amount = Some(amount);
        request.payment_method_id = Some(fx.card.id);
        request
    }

    #[tokio::test]
    async fn test_paid_order_is_charged_and_processed() {
        let h = harness().await;
        let caller = Caller::user(h.fx.user.id);

        let outcome = h.executor.create_order(&caller, card_order(&h.fx, 5000)).await.unwrap();

        assert!(outcome.order.is_processed());
        assert_eq!(outcome.order.status, OrderStatus::Processed);
        let credit = outcome.transaction.unwrap();
        assert_eq!(credit.amount, 5000);
        assert_eq!(credit.payment_processor_fee_in_host_currency, Some(175));
        assert_eq!(credit.platform_fee_in_host_currency, Some(250));
        assert_eq!(credit.host_fee_in_host_currency, Some(500));
        assert_eq!(credit.net_amount_in_collective_currency, 4075);
        assert_eq!(h.fx.store.transaction_count(), 2);
        assert_eq!(h.stub.charge_count(), 1);
    }

    #[tokio::test]
    async fn test_second_execution_is_already_processed() {
        let h = harness().await;
        let caller = Caller::user(h.fx.user.id);
        let outcome = h.executor.create_order(&caller, card_order(&h.fx, 5000)).await.unwrap();

        let err = h.executor.execute_order(outcome.order.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyProcessed);
        assert_eq!(h.stub.charge_count(), 1);
        assert_eq!(h.fx.store.transaction_count(), 2);
    }

    #[tokio::test]
    async fn test_free_order_is_processed_at_creation() {
        let h = harness().await;
        let tier = h.fx.add_tier("Free ticket", 0, Some(10)).await.unwrap();
        let mut request = OrderRequest::new(
            h.fx.collective.id,
            SourceParty::User { name: "Guest".into(), email: "guest@example.com".into() },
        );
        request.tier_id = Some(tier.id);

        let outcome = h.executor.create_order(&Caller::anonymous(), request).await.unwrap();

        assert!(outcome.order.is_processed());
        assert!(outcome.transaction.is_none());
        assert_eq!(h.fx.store.transaction_count(), 0);
        let guest = h.fx.store.parties().find_user_by_email("guest@example.com").await.unwrap();
        assert_eq!(guest.unwrap().id, outcome.order.from_collective_id);
    }

    #[tokio::test]
    async fn test_validation_failure_writes_nothing() {
        let h = harness().await;
        let caller = Caller::anonymous();
        let mut request = OrderRequest::new(
            h.fx.collective.id,
            SourceParty::User { name: "New".into(), email: "new@example.com".into() },
        );
        request.total_amount = Some(20);
        request.payment_method_id = Some(h.fx.card.id);

        let err = h.executor.create_order(&caller, request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        assert_eq!(h.fx.store.order_count(), 0);
        assert!(h.fx.store.parties().find_user_by_email("new@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_interval_is_rejected() {
        let h = harness().await;
        let mut request = card_order(&h.fx, 5000);
        request.interval = Some("week".to_string());

        let err = h.executor.create_order(&Caller::user(h.fx.user.id), request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }

    #[tokio::test]
    async fn test_privileged_fields_require_permission() {
        let h = harness().await;
        let caller = Caller::user(h.fx.user.id);

        let mut request = card_order(&h.fx, 5000);
        request.platform_fee_percent = Some(FeePercent::zero());
        let err = h.executor.create_order(&caller, request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let mut request = card_order(&h.fx, 5000);
        request.host_fee_percent = Some(FeePercent::zero());
        let err = h.executor.create_order(&caller, request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let mut request = card_order(&h.fx, 5000);
        request.host_fee_percent = Some(FeePercent::zero());
        let host_admin = Caller::user(h.fx.user.id).with_admin_of(h.fx.host.id);
        let outcome = h.executor.create_order(&host_admin, request).await.unwrap();
        assert_eq!(outcome.transaction.unwrap().host_fee_in_host_currency, Some(0));
    }

    #[tokio::test]
    async fn test_foreign_payment_method_is_forbidden() {
        let h = harness().await;
        let other = h.fx.add_user("Bob", "bob@example.com").await.unwrap();

        let err = h
            .executor
            .create_order(&Caller::user(other.id), {
                let mut request = card_order(&h.fx, 5000);
                request.from = SourceParty::Existing(other.id);
                request
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_tier_dictates_amount() {
        let h = harness().await;
        let tier = h.fx.add_tier("Backer", 1000, None).await.unwrap();
        let mut request = card_order(&h.fx, 1);
        request.tier_id = Some(tier.id);
        request.quantity = 3;

        let outcome = h.executor.create_order(&Caller::user(h.fx.user.id), request).await.unwrap();
        assert_eq!(outcome.order.total_amount, 3000);
        assert_eq!(outcome.order.description, "Donation to Webpack (Backer)");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_orders_for_last_unit() {
        let h = harness().await;
        let tier = h.fx.add_tier("Sponsor", 1000, Some(1)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let executor = h.executor.clone();
            let mut request = card_order(&h.fx, 1000);
            request.tier_id = Some(tier.id);
            let caller = Caller::user(h.fx.user.id);
            handles.push(tokio::spawn(async move { executor.create_order(&caller, request).await }));
        }

        let mut succeeded = 0;
        let mut sold_out = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(e) => {
                    assert_eq!(e.kind(), ErrorKind::CapacityExceeded);
                    sold_out += 1;
                },
            }
        }
        assert_eq!((succeeded, sold_out), (1, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_retries_of_declined_order_charge_once() {
        let h = harness().await;
        h.stub.set_fail_next(true);
        let caller = Caller::user(h.fx.user.id);
        h.executor.create_order(&caller, card_order(&h.fx, 5000)).await.unwrap_err();
        let order_id = first_order_id(&h);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let executor = h.executor.clone();
                tokio::spawn(async move { executor.execute_order(order_id).await })
            })
            .collect();

        let mut succeeded = 0;
        let mut already_processed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(e) => {
                    assert_eq!(e.kind(), ErrorKind::AlreadyProcessed, "{}", e);
                    already_processed += 1;
                },
            }
        }
        assert_eq!((succeeded, already_processed), (1, 7));
        assert_eq!(h.stub.charge_count(), 1);
        assert_eq!(h.fx.store.transaction_count(), 2);

        let order = h.fx.store.orders().find_by_id(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Processed);
    }

    #[tokio::test]
    async fn test_declined_charge_leaves_order_retryable() {
        let h = harness().await;
        h.stub.set_fail_next(true);

        let err = h
            .executor
            .create_order(&Caller::user(h.fx.user.id), card_order(&h.fx, 5000))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GatewayError);

        let orders = h.fx.store.order_count();
        assert_eq!(orders, 1);
        assert_eq!(h.fx.store.transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_after_charge_is_reconciled_once() {
        let h = harness().await;
        h.stub.set_timeout_next(Some(SimulatedTimeout::AfterCharge));

        let outcome = h
            .executor
            .create_order(&Caller::user(h.fx.user.id), card_order(&h.fx, 5000))
            .await
            .unwrap();

        assert!(outcome.order.is_processed());
        assert_eq!(h.stub.charge_count(), 1);
        assert_eq!(h.fx.store.transaction_count(), 2);
    }

    #[tokio::test]
    async fn test_timeout_before_charge_can_be_retried() {
        let h = harness().await;
        h.stub.set_timeout_next(Some(SimulatedTimeout::BeforeCharge));

        let caller = Caller::user(h.fx.user.id);
        let err = h.executor.create_order(&caller, card_order(&h.fx, 5000)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GatewayError);
        assert_eq!(h.stub.charge_count(), 0);
        assert!(h.executor.journal().executing().unwrap().is_empty());

        let order = h.fx.store.orders().find_by_id(first_order_id(&h)).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Error);
        assert!(order.processed_at.is_none());

        let outcome = h.executor.execute_order(order.id).await.unwrap();
        assert!(outcome.order.is_processed());
        assert_eq!(h.stub.charge_count(), 1);
        assert_eq!(h.fx.store.transaction_count(), 2);
    }

    fn first_order_id(h: &Harness) -> OrderId {
        h.fx.store.order_ids()[0]
    }

    #[tokio::test]
    async fn test_monthly_order_activates_subscription() {
        let h = harness().await;
        let mut request = card_order(&h.fx, 1000);
        request.interval = Some("month".to_string());

        let outcome = h.executor.create_order(&Caller::user(h.fx.user.id), request).await.unwrap();

        let subscription = outcome.subscription.unwrap();
        assert!(subscription.is_active);
        assert_eq!(outcome.order.subscription_id, Some(subscription.id));
        assert!(subscription.next_charge_date > Utc::now());
        assert_eq!(subscription.charge_retry_count, 0);
    }

    #[tokio::test]
    async fn test_failed_first_charge_keeps_subscription_inactive() {
        let h = harness().await;
        h.stub.set_fail_next(true);
        let mut request = card_order(&h.fx, 1000);
        request.interval = Some("month".to_string());

        assert!(h.executor.create_order(&Caller::user(h.fx.user.id), request).await.is_err());

        let order = h.fx.store.orders().find_by_id(first_order_id(&h)).await.unwrap().unwrap();
        let subscription_id = order.subscription_id.unwrap();
        let subscription =
            h.fx.store.subscriptions().find_by_id(subscription_id).await.unwrap().unwrap();
        assert!(!subscription.is_active);
    }

    #[tokio::test]
    async fn test_matching_fund_doubles_contribution() {
        let h = harness().await;
        let sponsor = h.fx.add_organization("Sponsor Inc").await.unwrap();
        let fund = h.fx.add_matching_fund(sponsor.id, dec!(2)).await.unwrap();
        let mut request = card_order(&h.fx, 1000);
        request.matching_fund_id = Some(fund.id);

        let outcome = h.executor.create_order(&Caller::user(h.fx.user.id), request).await.unwrap();

        match outcome.matching {
            MatchingOutcome::Matched(tx) => {
                assert_eq!(tx.amount, 2000);
                assert_eq!(tx.from_collective_id, sponsor.id);
                assert_eq!(tx.order_id, Some(outcome.order.id));
                assert_eq!(tx.description, "Matching 2x Xavier's donation");
            },
            other => panic!("expected a matched charge, got {:?}", other),
        }
        assert_eq!(h.fx.store.transaction_count(), 4);
    }

    #[tokio::test]
    async fn test_failed_matching_keeps_primary_charge() {
        let h = harness().await;
        let sponsor = h.fx.add_organization("Sponsor Inc").await.unwrap();
        let mut fund = PaymentMethod::new(
            PaymentMethodKind::Card,
            sponsor.id,
            DECLINED_TOKEN,
            Currency::usd(),
        );
        fund.matching = Some(dec!(2));
        h.fx.store.payment_methods().insert(&fund).await.unwrap();
        let mut request = card_order(&h.fx, 1000);
        request.matching_fund_id = Some(fund.id);

        let outcome = h.executor.create_order(&Caller::user(h.fx.user.id), request).await.unwrap();

        assert!(outcome.order.is_processed());
        assert!(outcome.transaction.is_some());
        assert!(matches!(
            outcome.matching,
            MatchingOutcome::Failed { kind: ErrorKind::GatewayError, .. }
        ));
        assert_eq!(h.fx.store.transaction_count(), 2);
    }

    #[tokio::test]
    async fn test_ineligible_matching_fund_is_ignored() {
        let h = harness().await;
        let mut request = card_order(&h.fx, 1000);
        request.matching_fund_id = Some(h.fx.card.id);

        let outcome = h.executor.create_order(&Caller::user(h.fx.user.id), request).await.unwrap();
        assert_eq!(outcome.order.matching_fund_id, None);
        assert_eq!(outcome.matching, MatchingOutcome::NotRequested);
    }

    #[tokio::test]
    async fn test_bank_transfer_awaits_settlement() {
        let h = harness().await;
        let transfer = h
            .fx
            .add_payment_method(h.fx.user.id, PaymentMethodKind::BankTransfer)
            .await
            .unwrap();
        let mut request = card_order(&h.fx, 5000);
        request.payment_method_id = Some(transfer.id);

        let outcome = h.executor.create_order(&Caller::user(h.fx.user.id), request).await.unwrap();
        assert!(outcome.transaction.is_none());
        assert!(!outcome.order.is_processed());
        assert_eq!(outcome.order.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_refund_redistributes_kept_processor_fee() {
        let h = harness().await;
        let caller = Caller::user(h.fx.user.id);
        let outcome = h.executor.create_order(&caller, card_order(&h.fx, 5000)).await.unwrap();
        let credit = outcome.transaction.unwrap();

        let refund = h.executor.refund_transaction(&caller, credit.id).await.unwrap();

        assert_eq!(refund.refunded_processor_fee, 0);
        assert_eq!(refund.refund_credit.amount, 5000);
        assert_eq!(refund.refund_credit.platform_fee_in_host_currency, Some(250));
        assert_eq!(refund.refund_credit.host_fee_in_host_currency, Some(675));
        assert_eq!(refund.refund_credit.payment_processor_fee_in_host_currency, Some(0));
        assert_eq!(h.executor.ledger().balance(h.fx.collective.id).await.unwrap(), 0);
        assert_eq!(h.executor.ledger().balance(h.fx.user.id).await.unwrap(), 0);

        let err = h.executor.refund_transaction(&caller, credit.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }

    #[tokio::test]
    async fn test_refund_requires_owner_or_admin() {
        let h = harness().await;
        let outcome = h
            .executor
            .create_order(&Caller::user(h.fx.user.id), card_order(&h.fx, 5000))
            .await
            .unwrap();
        let credit = outcome.transaction.unwrap();
        let stranger = h.fx.add_user("Eve", "eve@example.com").await.unwrap();

        let err = h.executor.refund_transaction(&Caller::user(stranger.id), credit.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);

        let host_admin = Caller::user(stranger.id).with_admin_of(h.fx.host.id);
        assert!(h.executor.refund_transaction(&host_admin, credit.id).await.is_ok());
    }
}
