//! Storage layer errors

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in the storage layer
#[derive(Debug, Error)]
pub enum StoreError {
    /// Entity not found
    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound {
        /// Type of entity (party, order, transaction, ...)
        entity_type: String,
        /// Entity ID
        id: String,
    },

    /// Duplicate entity (idempotency violation)
    #[error("Duplicate entity: {entity_type} with id {id}")]
    Duplicate {
        /// Type of entity
        entity_type: String,
        /// Entity ID
        id: String,
    },

    /// Tier has no room left for the requested quantity
    #[error("Tier {tier_id} capacity exceeded: requested {requested}, remaining {remaining}")]
    CapacityExceeded {
        /// Tier being reserved
        tier_id: Uuid,
        /// Units requested
        requested: u32,
        /// Units still available
        remaining: u64,
    },

    /// Order already settled
    #[error("Order {order_id} already processed at {processed_at}")]
    AlreadyProcessed {
        /// Order ID
        order_id: Uuid,
        /// When it was settled
        processed_at: DateTime<Utc>,
    },

    /// Transaction already linked to a refund
    #[error("Transaction {0} is already refunded")]
    AlreadyRefunded(Uuid),

    /// Subscription schedule moved since it was read
    #[error("Subscription {subscription_id} is no longer at period {expected_period_start}")]
    StaleSubscription {
        /// Subscription ID
        subscription_id: Uuid,
        /// Period the writer expected
        expected_period_start: DateTime<Utc>,
    },

    /// Prepaid balance too low
    #[error("Insufficient balance on payment method {payment_method_id}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        /// Payment method ID
        payment_method_id: Uuid,
        /// Current balance
        balance: i64,
        /// Amount requested
        requested: i64,
    },

    /// Invalid state transition
    #[error("Invalid state transition: {message}")]
    InvalidState {
        /// Description of the invalid transition
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Domain error passthrough
    #[error("Domain error: {0}")]
    Domain(#[from] tipjar_domain::DomainError),
}

impl StoreError {
    /// Create a not found error
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Create a duplicate error
    pub fn duplicate(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Duplicate {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState { message: message.into() }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound {
                entity_type: "unknown".to_string(),
                id: "unknown".to_string(),
            },
            sqlx::Error::Database(db_err) => {
                // Check for unique constraint violation
                if db_err.code().map(|c| c == "23505").unwrap_or(false) {
                    StoreError::Duplicate {
                        entity_type: "unknown".to_string(),
                        id: db_err.constraint().unwrap_or("unknown").to_string(),
                    }
                } else {
                    StoreError::Database(db_err.to_string())
                }
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Connection(err.to_string())
            },
            _ => StoreError::Database(err.to_string()),
        }
    }
}
