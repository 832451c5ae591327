//! tipjar Daemon Library
//!
//! Runtime orchestrator for the contribution ledger.
//!
//! # Architecture
//!
//! ```text
//! Config → Daemon → Order Executor → Gateways → Processor
//!             │            └→ Ledger → Store
//!             └→ Renewal Worker (interval) → Renewal Biller
//! ```
//!
//! # Components
//!
//! - **Daemon**: Main runtime orchestrator
//! - **Renewal Worker**: Charges due subscriptions on an interval
//! - **Config**: Environment-based configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use tipjard::{Config, Daemon};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let daemon = Daemon::new_stub(config).expect("Invalid config");
//!     daemon.run().await.expect("Daemon error");
//! }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod daemon;
pub mod error;
pub mod renewal_worker;

#[cfg(feature = "postgres")]
pub mod db;

// Re-exports for convenience
pub use config::{BillingConfig, Config, Environment, OrderConfig};
pub use daemon::Daemon;
pub use error::{DaemonError, DaemonResult};
pub use renewal_worker::RenewalWorker;
