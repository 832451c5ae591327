//! tipjar Execution Layer
//!
//! Order execution with at-most-once charges.
//!
//! # Architecture
//!
//! ```text
//! OrderRequest → Executor → Charge Journal → Gateway → Processor
//!                                               └→ Ledger (pair + processed_at)
//! ```
//!
//! # Components
//!
//! - **Ports**: the external card processor interface
//! - **Gateways**: one per payment method variant, resolved by an enum-keyed registry
//! - **Charge Journal**: claims a charge before the processor is called
//! - **Executor**: validation pipeline, order state machine, matching funds, refunds
//! - **Billing**: renewal of due subscriptions
//! - **Stub**: deterministic processor for development and tests
//!
//! # Example
//!
//! ```rust,ignore
//! use tipjar_exec::{Caller, ExecutorConfig, OrderExecutor, OrderRequest, SourceParty, StubProcessor};
//! use tipjar_store::MemoryStore;
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let executor = OrderExecutor::standard(store, Arc::new(StubProcessor::new()), ExecutorConfig::default());
//!
//! let mut request = OrderRequest::new(collective_id, SourceParty::Existing(user_id));
//! request.total_amount = Some(5000);
//! request.payment_method_id = Some(card_id);
//! let outcome = executor.create_order(&Caller::user(user_id), request).await?;
//! ```

#![warn(clippy::all)]

pub mod billing;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod idempotency;
pub mod journal;
pub mod ports;
pub mod stub;
pub mod subscription;

// Re-exports for convenience
pub use billing::{RenewalBiller, RenewalReport};
pub use error::{ErrorKind, ErrorReport, ExecError, ExecResult};
pub use executor::{
    Caller, ExecutorConfig, MatchingOutcome, OrderExecutor, OrderOutcome, OrderRequest,
    SourceParty,
};
pub use gateway::{
    CardGateway, ChargeContext, ChargePurpose, DeferredGateway, FeePlan, GatewayRegistry,
    ManualGateway, PaymentGateway, PrepaidGateway, RefundResult,
};
pub use idempotency::{charge_idempotency_key, refund_idempotency_key};
pub use journal::{AttemptOutcome, AttemptStatus, ChargeAttempt, ChargeJournal};
pub use ports::{ChargeReceipt, ChargeRequest, PaymentProcessor, RefundReceipt};
pub use stub::{SimulatedTimeout, StubProcessor, DECLINED_TOKEN};
