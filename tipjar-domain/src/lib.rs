//! tipjar Domain Layer
//!
//! Pure domain logic with zero I/O dependencies.
//! Contains entities, value objects, and domain rules for orders,
//! subscriptions and the double-entry ledger.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Public modules
#[allow(missing_docs)]
pub mod entities;
pub mod value_objects;

// Re-export commonly used types
pub use entities::{
    FeeBreakdown, Order, OrderId, OrderStatus, Party, PartyId, PaymentMethod, PaymentMethodId,
    Subscription, SubscriptionId, Tier, TierCapacity, TierId, Transaction, TransactionGroupId,
    TransactionId,
};
pub use value_objects::{
    Currency, DomainError, FeePercent, Interval, PartyKind, PaymentMethodKind, TransactionKind,
};
