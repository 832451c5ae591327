//! Engine error types.

use thiserror::Error;

use tipjar_domain::DomainError;

/// Errors raised by the pure calculators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Settlement record is missing its gross amount or has unclassifiable fees
    #[error("Malformed settlement: {0}")]
    MalformedSettlement(String),

    /// Input violates a validation rule
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Arithmetic left the representable range
    #[error("Arithmetic error: {0}")]
    Arithmetic(String),

    /// Domain error passthrough
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
