//! Execution layer error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tipjar_engine::EngineError;
use tipjar_ledger::LedgerError;
use tipjar_store::StoreError;

/// Errors that can occur during order execution.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Input is malformed or violates a policy; nothing was written
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Referenced entity does not exist
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity (collective, tier, payment method, ...)
        entity: &'static str,
        /// Requested ID
        id: String,
    },

    /// Caller is not allowed to act on this resource
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Caller may not set a privileged field or use a resource
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Tier has no room left
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Order (or charge attempt) already settled or in flight
    #[error("Already processed: {0}")]
    AlreadyProcessed(String),

    /// Processor rejected the charge or refund
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Processor did not answer in time; outcome unknown until reconciled
    #[error("Gateway timeout: {0}")]
    Timeout(String),

    /// Payment method variant cannot perform this operation
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Charge journal error
    #[error("Charge journal error: {0}")]
    ChargeJournal(String),

    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] tipjar_domain::DomainError),

    /// Engine error
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ExecError {
    /// Create a not found error
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }

    /// Taxonomy kind reported to callers
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::Validation(_) | ExecError::Unsupported(_) | ExecError::Domain(_) => {
                ErrorKind::ValidationFailed
            },
            ExecError::NotFound { .. } => ErrorKind::NotFound,
            ExecError::Unauthorized(_) => ErrorKind::Unauthorized,
            ExecError::Forbidden(_) => ErrorKind::Forbidden,
            ExecError::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            ExecError::AlreadyProcessed(_) => ErrorKind::AlreadyProcessed,
            ExecError::Gateway(_) | ExecError::Timeout(_) => ErrorKind::GatewayError,
            ExecError::Engine(e) => engine_kind(e),
            ExecError::Store(e) => store_kind(e),
            ExecError::Ledger(e) => match e {
                LedgerError::AlreadyRefunded(_) => ErrorKind::ValidationFailed,
                LedgerError::Engine(EngineError::MalformedSettlement(_)) => {
                    ErrorKind::MalformedSettlement
                },
                LedgerError::Store(
                    StoreError::AlreadyProcessed { .. } | StoreError::StaleSubscription { .. },
                ) => ErrorKind::AlreadyProcessed,
                _ => ErrorKind::LedgerWriteFailed,
            },
            ExecError::ChargeJournal(_) | ExecError::Config(_) => ErrorKind::Internal,
        }
    }
}

fn engine_kind(error: &EngineError) -> ErrorKind {
    match error {
        EngineError::MalformedSettlement(_) => ErrorKind::MalformedSettlement,
        EngineError::InvalidInput(_) | EngineError::Domain(_) => ErrorKind::ValidationFailed,
        EngineError::Arithmetic(_) => ErrorKind::Internal,
    }
}

fn store_kind(error: &StoreError) -> ErrorKind {
    match error {
        StoreError::NotFound { .. } => ErrorKind::NotFound,
        StoreError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
        StoreError::AlreadyProcessed { .. } | StoreError::StaleSubscription { .. } => {
            ErrorKind::AlreadyProcessed
        },
        StoreError::AlreadyRefunded(_) | StoreError::Duplicate { .. } => {
            ErrorKind::ValidationFailed
        },
        StoreError::InsufficientBalance { .. } => ErrorKind::GatewayError,
        _ => ErrorKind::Internal,
    }
}

/// Failure taxonomy exposed at the caller boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationFailed,
    NotFound,
    Unauthorized,
    Forbidden,
    CapacityExceeded,
    AlreadyProcessed,
    GatewayError,
    LedgerWriteFailed,
    MalformedSettlement,
    Internal,
}

impl ErrorKind {
    /// Stable tag
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationFailed => "VALIDATION_FAILED",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::CapacityExceeded => "CAPACITY_EXCEEDED",
            ErrorKind::AlreadyProcessed => "ALREADY_PROCESSED",
            ErrorKind::GatewayError => "GATEWAY_ERROR",
            ErrorKind::LedgerWriteFailed => "LEDGER_WRITE_FAILED",
            ErrorKind::MalformedSettlement => "MALFORMED_SETTLEMENT",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

/// Structured failure returned to callers: `{kind, message}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ExecError> for ErrorReport {
    fn from(error: &ExecError) -> Self {
        Self { kind: error.kind(), message: error.to_string() }
    }
}

/// Result type for execution operations.
pub type ExecResult<T> = Result<T, ExecError>;
