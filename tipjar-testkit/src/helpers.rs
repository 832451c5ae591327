//! Fixture builders for store seeding.

use rust_decimal::Decimal;
use std::sync::Arc;

use tipjar_domain::{Currency, FeePercent, Party, PartyId, PaymentMethod, PaymentMethodKind, Tier};
use tipjar_store::{MemoryStore, Store};

use crate::Result;

/// Parties and payment method every scenario starts from.
#[derive(Debug, Clone)]
pub struct Seed {
    /// Fiscal host (organization)
    pub host: Party,
    /// Collective hosted with a 10% host fee
    pub collective: Party,
    /// Contributor
    pub user: Party,
    /// Contributor's card (`tok_visa`)
    pub card: PaymentMethod,
}

/// Seed the standard host, collective, user and card into `store`.
pub async fn seed<S: Store + ?Sized>(store: &S) -> Result<Seed> {
    let host = Party::new_organization("Open Source Collective", Currency::usd());
    store.parties().insert(&host).await?;

    let collective = Party::new_collective(
        "Webpack",
        Currency::usd(),
        host.id,
        FeePercent::from_percent(10),
    );
    store.parties().insert(&collective).await?;

    let user = add_user(store, "Xavier", "xavier@example.com").await?;
    let card = add_payment_method(store, user.id, PaymentMethodKind::Card).await?;

    Ok(Seed { host, collective, user, card })
}

/// Insert a tier of `collective_id`; `max_quantity` limits its capacity.
pub async fn add_tier<S: Store + ?Sized>(
    store: &S,
    collective_id: PartyId,
    name: &str,
    amount: i64,
    max_quantity: Option<u32>,
) -> Result<Tier> {
    let mut tier = Tier::new(collective_id, name, amount, Currency::usd());
    tier.max_quantity = max_quantity;
    store.tiers().insert(&tier).await?;
    Ok(tier)
}

pub async fn add_user<S: Store + ?Sized>(store: &S, name: &str, email: &str) -> Result<Party> {
    let user = Party::new_user(name, email);
    store.parties().insert(&user).await?;
    Ok(user)
}

pub async fn add_organization<S: Store + ?Sized>(store: &S, name: &str) -> Result<Party> {
    let organization = Party::new_organization(name, Currency::usd());
    store.parties().insert(&organization).await?;
    Ok(organization)
}

/// Insert a payment method of `kind` owned by `owner_id`.
pub async fn add_payment_method<S: Store + ?Sized>(
    store: &S,
    owner_id: PartyId,
    kind: PaymentMethodKind,
) -> Result<PaymentMethod> {
    let token = match kind {
        PaymentMethodKind::Card => "tok_visa",
        PaymentMethodKind::BankTransfer => "iban_test",
        PaymentMethodKind::Prepaid => "gift_test",
        PaymentMethodKind::Crypto => "wallet_test",
        PaymentMethodKind::Manual => "manual",
    };
    let mut payment_method = PaymentMethod::new(kind, owner_id, token, Currency::usd());
    if kind == PaymentMethodKind::Prepaid {
        payment_method.balance = Some(0);
    }
    store.payment_methods().insert(&payment_method).await?;
    Ok(payment_method)
}

/// Insert a prepaid card holding `balance`.
pub async fn add_prepaid<S: Store + ?Sized>(
    store: &S,
    owner_id: PartyId,
    balance: i64,
) -> Result<PaymentMethod> {
    let mut card = PaymentMethod::new(PaymentMethodKind::Prepaid, owner_id, "gift_test", Currency::usd());
    card.balance = Some(balance);
    store.payment_methods().insert(&card).await?;
    Ok(card)
}

/// Insert a card matching fund multiplying contributions by `multiplier`.
pub async fn add_matching_fund<S: Store + ?Sized>(
    store: &S,
    owner_id: PartyId,
    multiplier: Decimal,
) -> Result<PaymentMethod> {
    let mut fund = PaymentMethod::new(PaymentMethodKind::Card, owner_id, "tok_visa", Currency::usd());
    fund.matching = Some(multiplier);
    store.payment_methods().insert(&fund).await?;
    Ok(fund)
}

// =============================================================================
// In-memory fixture
// =============================================================================

/// A seeded `MemoryStore`.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub host: Party,
    pub collective: Party,
    pub user: Party,
    pub card: PaymentMethod,
}

impl Fixture {
    /// Fresh store with the standard seed.
    pub async fn new() -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let Seed { host, collective, user, card } = seed(store.as_ref()).await?;
        Ok(Self { store, host, collective, user, card })
    }

    /// Tier of the seeded collective
    pub async fn add_tier(&self, name: &str, amount: i64, max_quantity: Option<u32>) -> Result<Tier> {
        add_tier(self.store.as_ref(), self.collective.id, name, amount, max_quantity).await
    }

    pub async fn add_user(&self, name: &str, email: &str) -> Result<Party> {
        add_user(self.store.as_ref(), name, email).await
    }

    pub async fn add_organization(&self, name: &str) -> Result<Party> {
        add_organization(self.store.as_ref(), name).await
    }

    pub async fn add_payment_method(
        &self,
        owner_id: PartyId,
        kind: PaymentMethodKind,
    ) -> Result<PaymentMethod> {
        add_payment_method(self.store.as_ref(), owner_id, kind).await
    }

    pub async fn add_prepaid(&self, owner_id: PartyId, balance: i64) -> Result<PaymentMethod> {
        add_prepaid(self.store.as_ref(), owner_id, balance).await
    }

    pub async fn add_matching_fund(
        &self,
        owner_id: PartyId,
        multiplier: Decimal,
    ) -> Result<PaymentMethod> {
        add_matching_fund(self.store.as_ref(), owner_id, multiplier).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixture_seeds_hosted_collective() {
        let fx = Fixture::new().await.unwrap();

        assert_eq!(fx.collective.host_id, Some(fx.host.id));
        assert_eq!(fx.card.owner_id, fx.user.id);
        let found = fx.store.parties().find_user_by_email("XAVIER@example.com").await.unwrap();
        assert_eq!(found.map(|p| p.id), Some(fx.user.id));
    }

    #[tokio::test]
    async fn test_limited_tier() {
        let fx = Fixture::new().await.unwrap();
        let tier = fx.add_tier("Sponsor", 10000, Some(5)).await.unwrap();

        let stored = fx.store.tiers().find_by_id(tier.id).await.unwrap().unwrap();
        assert_eq!(stored.capacity().map(|c| c.max_quantity), Some(5));
    }
}
