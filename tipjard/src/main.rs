//! tipjar Daemon
//!
//! Runtime orchestrator for order execution and subscription renewals.
//!
//! # Usage
//!
//! ```bash
//! # Start with default configuration (in-memory store, stub processor)
//! cargo run -p tipjard
//!
//! # Start against PostgreSQL
//! TIPJAR_DATABASE_URL=postgres://localhost/tipjar cargo run -p tipjard --features postgres
//!
//! # Database maintenance
//! cargo run -p tipjard --features postgres -- db migrate
//! ```
//!
//! # Environment Variables
//!
//! - `TIPJAR_ENV`: Environment (test, development, production)
//! - `TIPJAR_MIN_CHARGE_AMOUNT`: Smallest paid amount in cents (default: 50)
//! - `TIPJAR_PLATFORM_FEE_PERCENT`: Default platform fee (default: 5)
//! - `TIPJAR_RETRY_DELAY_DAYS`: Delay before retrying a failed renewal (default: 2)
//! - `TIPJAR_MAX_CHARGE_RETRIES`: Retries before past due (default: 3)
//! - `TIPJAR_BILLING_INTERVAL_SECS`: Seconds between renewal passes (default: 3600)
//! - `TIPJAR_DATABASE_URL`: PostgreSQL connection string (optional)
//! - `TIPJAR_STRIPE_SECRET_KEY`: Card processor key (optional)
//! - `TIPJAR_LOG_FORMAT`: `json` for JSON logs

use std::sync::Arc;

use tipjar_connectors::StripeRestClient;
use tipjar_exec::{PaymentProcessor, StubProcessor};
use tipjar_store::Store;
use tipjard::{Config, Daemon, DaemonError, Environment};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::from_default_env().add_directive("tipjard=info".parse()?);
    let json = std::env::var("TIPJAR_LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    if json {
        tracing_subscriber::registry().with(fmt::layer().json()).with(filter).init();
    } else {
        tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
    }

    // Load configuration
    let config = Config::from_env()?;

    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("db") {
        return run_db(args, &config).await;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        billing_interval_secs = config.billing.interval_secs,
        "tipjar daemon"
    );

    let processor = build_processor(&config).await?;

    #[cfg(feature = "postgres")]
    {
        if let Some(url) = config.database_url.clone() {
            let pool = sqlx::PgPool::connect(&url).await?;
            let store = Arc::new(tipjar_store::PgStore::new(Arc::new(pool)));
            return run(config, store, processor).await;
        }
    }

    if cfg!(not(feature = "postgres")) && config.database_url.is_some() {
        warn!("TIPJAR_DATABASE_URL is set but the postgres feature is disabled");
    }
    run(config, Arc::new(tipjar_store::MemoryStore::new()), processor).await
}

async fn run<S: Store + 'static>(
    config: Config,
    store: Arc<S>,
    processor: Arc<dyn PaymentProcessor>,
) -> anyhow::Result<()> {
    let daemon = Daemon::new(config, store, processor)?;
    daemon.run().await?;
    Ok(())
}

/// Card processor from configuration; production requires a real key.
async fn build_processor(config: &Config) -> anyhow::Result<Arc<dyn PaymentProcessor>> {
    match &config.stripe_secret_key {
        Some(key) => {
            let client = StripeRestClient::new(key.clone());
            if let Err(e) = client.ping().await {
                warn!(error = %e, "Card processor unreachable at startup");
            }
            Ok(Arc::new(client))
        },
        None if config.environment == Environment::Production => Err(DaemonError::Config(
            "TIPJAR_STRIPE_SECRET_KEY is required in production".to_string(),
        )
        .into()),
        None => {
            warn!("No card processor key configured, using stub processor");
            Ok(Arc::new(StubProcessor::new()))
        },
    }
}

#[cfg(feature = "postgres")]
async fn run_db(args: Vec<String>, config: &Config) -> anyhow::Result<()> {
    tipjard::db::run_db_command(args, config.database_url.as_deref()).await
}

#[cfg(not(feature = "postgres"))]
async fn run_db(_args: Vec<String>, _config: &Config) -> anyhow::Result<()> {
    Err(anyhow::anyhow!("db commands require the postgres feature"))
}
