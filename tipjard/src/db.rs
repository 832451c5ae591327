//! Database CLI subcommands for tipjard.
//!
//! Provides `db migrate`, `db status`, and `db init` commands.

use anyhow::{anyhow, Result};
use tracing::info;

use tipjar_db::{migrate, seed_host, status};

/// Run database CLI subcommands.
///
/// Supported commands:
/// - `tipjard db migrate` - Run pending migrations
/// - `tipjard db status` - Report pending migrations and missing tables
/// - `tipjard db init [--host-name NAME] [--currency CODE]` - Seed the fiscal host
pub async fn run_db_command(args: Vec<String>, database_url: Option<&str>) -> Result<()> {
    if args.len() < 3 {
        return Err(anyhow!("Usage: tipjard db <migrate|status|init> [options]"));
    }

    let database_url = database_url.ok_or_else(|| {
        anyhow!("TIPJAR_DATABASE_URL environment variable is required for db commands")
    })?;

    let pool = sqlx::PgPool::connect(database_url).await?;

    match args[2].as_str() {
        "migrate" => {
            migrate(&pool).await?;
        },
        "status" => {
            let status = status(&pool).await?;
            if !status.is_ready() {
                return Err(anyhow!(
                    "Schema not ready: {} pending, {} failed, {} tables missing",
                    status.pending.len(),
                    status.failed.len(),
                    status.missing_tables.len()
                ));
            }
        },
        "init" => {
            let mut host_name = "Open Source Collective".to_string();
            let mut currency = "USD".to_string();

            // Parse optional arguments
            let mut i = 3;
            while i < args.len() {
                match args[i].as_str() {
                    "--host-name" => {
                        host_name = args
                            .get(i + 1)
                            .cloned()
                            .ok_or_else(|| anyhow!("--host-name requires a value"))?;
                        i += 2;
                    },
                    "--currency" => {
                        currency = args
                            .get(i + 1)
                            .cloned()
                            .ok_or_else(|| anyhow!("--currency requires a value"))?;
                        i += 2;
                    },
                    _ => {
                        return Err(anyhow!("Unknown option: {}", args[i]));
                    },
                }
            }

            let host_id = seed_host(&pool, &host_name, &currency).await?;
            info!("Initialized: host_id={}", host_id);
        },
        _ => {
            return Err(anyhow!("Unknown db command: {}. Use migrate, status, or init", args[2]));
        },
    }

    Ok(())
}
