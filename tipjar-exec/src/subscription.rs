//! Subscription management: cancel and payment method replacement.

use chrono::Utc;
use tracing::info;

use tipjar_domain::{OrderId, PaymentMethodId, Subscription};
use tipjar_engine::{next_billing_dates, next_charge_retry_count, SubscriptionEvent};
use tipjar_store::{Reschedule, Store, StoreError};

use crate::error::{ExecError, ExecResult};
use crate::executor::{Caller, OrderExecutor};

impl<S: Store + 'static> OrderExecutor<S> {
    /// Deactivate the subscription of an order (terminal).
    pub async fn cancel_subscription(
        &self,
        caller: &Caller,
        order_id: OrderId,
    ) -> ExecResult<Subscription> {
        let subscription = self.active_subscription(caller, order_id, "cancel").await?;
        // A concurrent cancel may win between the read and the write
        let subscription = self
            .store
            .subscriptions()
            .deactivate(subscription.id, Utc::now())
            .await
            .map_err(|e| match e {
                StoreError::InvalidState { message } => ExecError::Validation(message),
                other => other.into(),
            })?;

        info!(%order_id, subscription_id = %subscription.id, "Subscription canceled");
        Ok(subscription)
    }

    /// Switch future charges of an order to another payment method.
    ///
    /// A past-due subscription gets its next charge date recomputed from its
    /// original period boundary and its retry count reset.
    pub async fn update_subscription(
        &self,
        caller: &Caller,
        order_id: OrderId,
        payment_method_id: PaymentMethodId,
    ) -> ExecResult<Subscription> {
        let mut subscription = self.active_subscription(caller, order_id, "update").await?;

        let payment_method = self
            .store
            .payment_methods()
            .find_by_id(payment_method_id)
            .await?
            .ok_or_else(|| ExecError::not_found("payment method", payment_method_id))?;
        if !caller.is_admin_of(payment_method.owner_id) {
            return Err(ExecError::Forbidden(
                "You don't have sufficient permissions to access this payment method".to_string(),
            ));
        }

        if subscription.is_past_due() {
            let dates = next_billing_dates(
                SubscriptionEvent::Updated,
                subscription.interval,
                Some((&subscription).into()),
                Utc::now(),
                &self.config.billing,
            )?;
            let reschedule = Reschedule {
                subscription_id: subscription.id,
                expected_period_start: subscription.next_period_start,
                next_charge_date: dates.next_charge_date,
                next_period_start: dates.next_period_start,
                charge_retry_count: next_charge_retry_count(
                    SubscriptionEvent::Updated,
                    subscription.charge_retry_count,
                ),
            };
            subscription = self.store.subscriptions().reschedule(&reschedule).await?;
        }

        self.store.orders().set_payment_method(order_id, payment_method.id).await?;

        info!(
            %order_id,
            subscription_id = %subscription.id,
            %payment_method_id,
            next_charge_date = %subscription.next_charge_date,
            "Subscription payment method updated"
        );
        Ok(subscription)
    }

    async fn active_subscription(
        &self,
        caller: &Caller,
        order_id: OrderId,
        action: &str,
    ) -> ExecResult<Subscription> {
        let order = self.find_order(order_id).await?;
        if !caller.is_admin_of(order.from_collective_id) {
            return Err(ExecError::Unauthorized(format!(
                "You don't have permission to {} this subscription",
                action
            )));
        }

        let subscription_id = order
            .subscription_id
            .ok_or_else(|| ExecError::not_found("subscription", order_id))?;
        let subscription = self
            .store
            .subscriptions()
            .find_by_id(subscription_id)
            .await?
            .ok_or_else(|| ExecError::not_found("subscription", subscription_id))?;

        if !subscription.is_active {
            return Err(ExecError::Validation(format!(
                "Subscription must be active to {} it",
                action
            )));
        }
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    use tipjar_domain::PaymentMethodKind;
    use tipjar_store::MemoryStore;
    use tipjar_testkit::Fixture;

    use crate::error::ErrorKind;
    use crate::executor::{ExecutorConfig, OrderRequest, SourceParty};
    use crate::stub::StubProcessor;

    async fn monthly_order() -> (Fixture, OrderExecutor<MemoryStore>, OrderId) {
        let fx = Fixture::new().await.unwrap();
        let executor = OrderExecutor::standard(
            fx.store.clone(),
            Arc::new(StubProcessor::new()),
            ExecutorConfig::default(),
        );
        let mut request = OrderRequest::new(fx.collective.id, SourceParty::Existing(fx.user.id));
        request.total_amount = Some(1000);
        request.interval = Some("month".to_string());
        request.payment_method_id = Some(fx.card.id);

        let outcome = executor.create_order(&Caller::user(fx.user.id), request).await.unwrap();
        let order_id = outcome.order.id;
        (fx, executor, order_id)
    }

    #[tokio::test]
    async fn test_cancel_is_terminal() {
        let (fx, executor, order_id) = monthly_order().await;
        let caller = Caller::user(fx.user.id);

        let canceled = executor.cancel_subscription(&caller, order_id).await.unwrap();
        assert!(!canceled.is_active);
        assert!(canceled.deactivated_at.is_some());

        let err = executor.cancel_subscription(&caller, order_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }

    #[tokio::test]
    async fn test_cancel_requires_admin_of_source() {
        let (fx, executor, order_id) = monthly_order().await;
        let stranger = fx.add_user("Eve", "eve@example.com").await.unwrap();

        let err = executor.cancel_subscription(&Caller::user(stranger.id), order_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_update_recomputes_past_due_dates() {
        let (fx, executor, order_id) = monthly_order().await;
        let caller = Caller::user(fx.user.id);

        // Three failed renewals starting two months ago
        let order = fx.store.orders().find_by_id(order_id).await.unwrap().unwrap();
        let subscription_id = order.subscription_id.unwrap();
        let mut subscription =
            fx.store.subscriptions().find_by_id(subscription_id).await.unwrap().unwrap();
        let boundary = Utc::now() - Duration::days(61);
        subscription.next_period_start = boundary;
        subscription.next_charge_date = boundary + Duration::days(6);
        subscription.charge_retry_count = 3;
        fx.store.subscriptions().save(&subscription).await.unwrap();

        let new_card = fx.add_payment_method(fx.user.id, PaymentMethodKind::Card).await.unwrap();
        let updated = executor.update_subscription(&caller, order_id, new_card.id).await.unwrap();

        assert!(updated.next_charge_date > Utc::now());
        assert!(updated.next_charge_date <= Utc::now() + Duration::days(31));
        assert_eq!(updated.next_period_start, updated.next_charge_date);
        assert_eq!(updated.charge_retry_count, 0);

        let order = fx.store.orders().find_by_id(order_id).await.unwrap().unwrap();
        assert_eq!(order.payment_method_id, Some(new_card.id));
    }

    #[tokio::test]
    async fn test_update_keeps_dates_when_current() {
        let (fx, executor, order_id) = monthly_order().await;
        let caller = Caller::user(fx.user.id);
        let before = fx
            .store
            .subscriptions()
            .find_by_id(
                fx.store.orders().find_by_id(order_id).await.unwrap().unwrap().subscription_id.unwrap(),
            )
            .await
            .unwrap()
            .unwrap();

        let new_card = fx.add_payment_method(fx.user.id, PaymentMethodKind::Card).await.unwrap();
        let updated = executor.update_subscription(&caller, order_id, new_card.id).await.unwrap();

        assert_eq!(updated.next_charge_date, before.next_charge_date);
    }

    #[tokio::test]
    async fn test_update_rejects_foreign_payment_method() {
        let (fx, executor, order_id) = monthly_order().await;
        let other = fx.add_user("Bob", "bob@example.com").await.unwrap();
        let foreign = fx.add_payment_method(other.id, PaymentMethodKind::Card).await.unwrap();

        let err = executor
            .update_subscription(&Caller::user(fx.user.id), order_id, foreign.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_canceled_subscription_cannot_be_updated() {
        let (fx, executor, order_id) = monthly_order().await;
        let caller = Caller::user(fx.user.id);
        executor.cancel_subscription(&caller, order_id).await.unwrap();

        let err = executor.update_subscription(&caller, order_id, fx.card.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }
}
