//! tipjar Storage Layer
//!
//! Provides persistence for parties, tiers, payment methods, orders,
//! subscriptions and the transaction ledger.
//!
//! # Architecture
//!
//! - **Repository traits**: Define the storage interface (ports)
//! - **In-memory store**: Fast implementation for testing
//! - **PostgreSQL store**: Production implementation (feature `postgres`)
//!
//! # Usage
//!
//! ```rust
//! use tipjar_store::{MemoryStore, Store};
//! use tipjar_domain::{Currency, Party};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new();
//!
//!     let host = Party::new_organization("Open Host", Currency::usd());
//!     store.parties().insert(&host).await.unwrap();
//!
//!     let found = store.parties().find_by_id(host.id).await.unwrap();
//!     assert_eq!(found.map(|p| p.name), Some("Open Host".to_string()));
//! }
//! ```

#![warn(clippy::all)]

// Modules
mod error;
mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod repository;

// Re-exports
pub use error::StoreError;
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;
pub use repository::{
    refund_links, AppendOptions, OrderRepository, PartyRepository, PaymentMethodRepository,
    Reschedule, SettleOrder, Store, SubscriptionRepository, TierRepository, TransactionRepository,
};
