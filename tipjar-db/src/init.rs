//! Minimal data initialization for tipjar.
//!
//! Seeds the platform's fiscal host so collectives can be attached to it.

use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use super::Result;

/// Slug of a party name (lowercase, dash separated).
fn slugify(name: &str) -> String {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

/// Ensure a fiscal host organization named `name` exists.
///
/// Returns the id of the existing host when one with the same slug is found.
/// Safe to run on every startup.
pub async fn seed_host(pool: &PgPool, name: &str, currency: &str) -> Result<Uuid> {
    let slug = slugify(name);
    let mut tx = pool.begin().await?;

    let existing = sqlx::query(
        r#"
        SELECT id FROM parties
        WHERE kind = 'organization' AND slug = $1
        LIMIT 1
        "#,
    )
    .bind(&slug)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(row) = existing {
        let id: Uuid = row.get("id");
        info!("Host already exists: id={}, slug={}", id, slug);
        tx.commit().await?;
        return Ok(id);
    }

    let id = Uuid::now_v7();
    info!("Creating host: id={}, slug={}", id, slug);

    sqlx::query(
        r#"
        INSERT INTO parties (id, kind, name, slug, is_active, currency, host_fee_percent, created_at)
        VALUES ($1, 'organization', $2, $3, TRUE, $4, 0, NOW())
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(&slug)
    .bind(currency.to_ascii_uppercase())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!("Host seeded successfully");
    Ok(id)
}
