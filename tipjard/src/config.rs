//! Daemon configuration.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::error::{DaemonError, DaemonResult};
use chrono::Duration;
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

use tipjar_domain::FeePercent;
use tipjar_engine::BillingPolicy;
use tipjar_exec::ExecutorConfig;

// =============================================================================
// Configuration
// =============================================================================

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Order execution configuration
    pub orders: OrderConfig,

    /// Renewal worker configuration
    pub billing: BillingConfig,

    /// PostgreSQL connection string (in-memory store when absent)
    pub database_url: Option<String>,

    /// Card processor secret key (stub processor when absent)
    pub stripe_secret_key: Option<String>,

    /// Environment (test, development, production)
    pub environment: Environment,
}

/// Order execution configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderConfig {
    /// Smallest paid amount in minor units
    pub min_charge_amount: i64,
    /// Default platform fee (5 = 5%)
    pub platform_fee_percent: Decimal,
}

/// Renewal worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingConfig {
    /// Seconds between renewal passes
    pub interval_secs: u64,
    /// Days before a failed renewal is retried
    pub retry_delay_days: i64,
    /// Retries before a subscription is reported past due
    pub max_charge_retries: u32,
}

/// Environment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Test environment (uses stubs)
    Test,
    /// Development environment
    Development,
    /// Production environment
    Production,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> DaemonResult<Self> {
        // Load .env file if present (ignore errors)
        let _ = dotenvy::dotenv();

        let environment = Self::load_environment()?;
        let orders = Self::load_order_config()?;
        let billing = Self::load_billing_config()?;

        Ok(Self {
            orders,
            billing,
            database_url: Self::load_optional("TIPJAR_DATABASE_URL"),
            stripe_secret_key: Self::load_optional("TIPJAR_STRIPE_SECRET_KEY"),
            environment,
        })
    }

    /// Create test configuration.
    pub fn test() -> Self {
        Self {
            billing: BillingConfig {
                interval_secs: 1,
                ..BillingConfig::default()
            },
            environment: Environment::Test,
            ..Self::default()
        }
    }

    /// Settings handed to the order executor.
    pub fn executor_config(&self) -> DaemonResult<ExecutorConfig> {
        let platform_fee_percent = FeePercent::new(self.orders.platform_fee_percent)
            .map_err(|e| DaemonError::Config(format!("Invalid TIPJAR_PLATFORM_FEE_PERCENT: {}", e)))?;

        Ok(ExecutorConfig {
            min_charge_amount: self.orders.min_charge_amount,
            platform_fee_percent,
            billing: BillingPolicy {
                retry_delay: Duration::days(self.billing.retry_delay_days),
                max_retries: self.billing.max_charge_retries,
            },
        })
    }

    fn load_environment() -> DaemonResult<Environment> {
        let env_str = env::var("TIPJAR_ENV").unwrap_or_else(|_| "development".to_string());

        match env_str.to_lowercase().as_str() {
            "test" => Ok(Environment::Test),
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(DaemonError::Config(format!(
                "Invalid TIPJAR_ENV: {}. Expected: test, development, production",
                other
            ))),
        }
    }

    fn load_order_config() -> DaemonResult<OrderConfig> {
        let defaults = OrderConfig::default();

        Ok(OrderConfig {
            min_charge_amount: Self::load_parsed_env(
                "TIPJAR_MIN_CHARGE_AMOUNT",
                defaults.min_charge_amount,
            )?,
            platform_fee_percent: Self::load_decimal_env(
                "TIPJAR_PLATFORM_FEE_PERCENT",
                defaults.platform_fee_percent,
            )?,
        })
    }

    fn load_billing_config() -> DaemonResult<BillingConfig> {
        let defaults = BillingConfig::default();

        let interval_secs =
            Self::load_parsed_env("TIPJAR_BILLING_INTERVAL_SECS", defaults.interval_secs)?;
        if interval_secs == 0 {
            return Err(DaemonError::Config(
                "TIPJAR_BILLING_INTERVAL_SECS must be positive".to_string(),
            ));
        }

        Ok(BillingConfig {
            interval_secs,
            retry_delay_days: Self::load_parsed_env(
                "TIPJAR_RETRY_DELAY_DAYS",
                defaults.retry_delay_days,
            )?,
            max_charge_retries: Self::load_parsed_env(
                "TIPJAR_MAX_CHARGE_RETRIES",
                defaults.max_charge_retries,
            )?,
        })
    }

    fn load_optional(key: &str) -> Option<String> {
        env::var(key).ok().filter(|val| !val.trim().is_empty())
    }

    fn load_parsed_env<T: FromStr>(key: &str, default: T) -> DaemonResult<T> {
        match env::var(key) {
            Ok(val) => val
                .trim()
                .parse::<T>()
                .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
            Err(_) => Ok(default),
        }
    }

    fn load_decimal_env(key: &str, default: Decimal) -> DaemonResult<Decimal> {
        match env::var(key) {
            Ok(val) => Decimal::from_str(val.trim())
                .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
            Err(_) => Ok(default),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            orders: OrderConfig::default(),
            billing: BillingConfig::default(),
            database_url: None,
            stripe_secret_key: None,
            environment: Environment::Development,
        }
    }
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            min_charge_amount: 50,
            platform_fee_percent: Decimal::new(5, 0), // 5%
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            retry_delay_days: 2,
            max_charge_retries: 3,
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Test => write!(f, "test"),
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
