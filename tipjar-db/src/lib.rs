//! Database lifecycle management for tipjar.
//!
//! Runs the workspace migrations, reports how far a database is from the
//! schema the stores expect, and seeds the platform host.

mod init;

pub use init::seed_host;

use sqlx::migrate::Migrator;
use sqlx::{PgPool, Row};
use tracing::{info, warn};

/// Result type for DB operations.
pub type Result<T> = std::result::Result<T, anyhow::Error>;

static MIGRATOR: Migrator = sqlx::migrate!("../migrations");

/// Tables read and written by `PgStore`.
pub const LEDGER_TABLES: [&str; 6] =
    ["parties", "tiers", "payment_methods", "subscriptions", "orders", "transactions"];

/// Run all pending migrations. Safe to run repeatedly.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    info!(known = MIGRATOR.iter().count(), "Running database migrations");
    MIGRATOR.run(pool).await?;
    info!("Migrations completed");
    Ok(())
}

/// A migration shipped with this build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownMigration {
    pub version: i64,
    pub description: String,
}

/// A row of `_sqlx_migrations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedMigration {
    pub version: i64,
    pub success: bool,
}

/// How a database compares to the schema this build expects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaStatus {
    /// Successfully applied versions
    pub applied: Vec<i64>,
    /// Shipped migrations not yet applied
    pub pending: Vec<KnownMigration>,
    /// Versions recorded as failed
    pub failed: Vec<i64>,
    /// Applied versions this build does not ship
    pub unknown: Vec<i64>,
    /// Ledger tables absent from the current schema
    pub missing_tables: Vec<&'static str>,
}

impl SchemaStatus {
    /// Compare shipped migrations and ledger tables with what the database has.
    pub fn compare(
        known: &[KnownMigration],
        applied: &[AppliedMigration],
        tables: &[String],
    ) -> Self {
        let is_applied = |version: i64| applied.iter().any(|a| a.version == version && a.success);

        Self {
            applied: applied.iter().filter(|a| a.success).map(|a| a.version).collect(),
            pending: known.iter().filter(|m| !is_applied(m.version)).cloned().collect(),
            failed: applied.iter().filter(|a| !a.success).map(|a| a.version).collect(),
            unknown: applied
                .iter()
                .filter(|a| !known.iter().any(|m| m.version == a.version))
                .map(|a| a.version)
                .collect(),
            missing_tables: LEDGER_TABLES
                .iter()
                .copied()
                .filter(|table| !tables.iter().any(|t| t == table))
                .collect(),
        }
    }

    /// Every migration applied and every ledger table present.
    pub fn is_ready(&self) -> bool {
        self.pending.is_empty() && self.failed.is_empty() && self.missing_tables.is_empty()
    }
}

fn known_migrations() -> Vec<KnownMigration> {
    MIGRATOR
        .iter()
        .filter(|m| !m.migration_type.is_down_migration())
        .map(|m| KnownMigration { version: m.version, description: m.description.to_string() })
        .collect()
}

/// Check connectivity and report the schema status of `pool`'s database.
pub async fn status(pool: &PgPool) -> Result<SchemaStatus> {
    let alive: i32 = sqlx::query_scalar("SELECT 1").fetch_one(pool).await?;
    if alive != 1 {
        return Err(anyhow::anyhow!("Database connectivity check failed"));
    }
    info!("Database connectivity: OK");

    let has_history: bool =
        sqlx::query_scalar("SELECT to_regclass('_sqlx_migrations') IS NOT NULL")
            .fetch_one(pool)
            .await?;
    let applied = if has_history {
        sqlx::query("SELECT version, success FROM _sqlx_migrations ORDER BY version")
            .fetch_all(pool)
            .await?
            .iter()
            .map(|row| {
                Ok(AppliedMigration {
                    version: row.try_get("version")?,
                    success: row.try_get("success")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?
    } else {
        Vec::new()
    };

    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT table_name::TEXT FROM information_schema.tables \
         WHERE table_schema = current_schema()",
    )
    .fetch_all(pool)
    .await?;

    let status = SchemaStatus::compare(&known_migrations(), &applied, &tables);
    log_status(&status);
    Ok(status)
}

fn log_status(status: &SchemaStatus) {
    info!(applied = status.applied.len(), latest = ?status.applied.last(), "Applied migrations");
    for migration in &status.pending {
        warn!(
            version = migration.version,
            description = %migration.description,
            "Pending migration"
        );
    }
    for version in &status.failed {
        warn!(version, "Migration recorded as failed");
    }
    if !status.unknown.is_empty() {
        warn!(versions = ?status.unknown, "Database has migrations this build does not ship");
    }
    if !status.missing_tables.is_empty() {
        warn!(tables = ?status.missing_tables, "Ledger tables missing (run `tipjard db migrate`)");
    }
    if status.is_ready() {
        info!("Schema is up to date");
    }
}
