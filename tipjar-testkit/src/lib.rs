//! Test helpers for tipjar.
//!
//! Seeds a store with a fiscal host, a hosted collective, a contributor and
//! their card, and provides builders for tiers, parties and payment methods.

mod helpers;

pub use helpers::{
    add_matching_fund, add_organization, add_payment_method, add_prepaid, add_tier, add_user,
    seed, Fixture, Seed,
};

use anyhow::Result;
use sqlx::PgPool;

/// Setup a clean test database by running migrations.
///
/// Convenience function for tests that need a fresh schema.
/// Note: migrations are located at the workspace root.
pub async fn setup_test_db(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../migrations").run(pool).await?;
    Ok(())
}
