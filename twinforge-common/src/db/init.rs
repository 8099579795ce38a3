//! Database initialization
//!
//! Opens (or creates) the SQLite database, applies the idempotent schema and
//! seeds the reference archetype table on first run.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL allows concurrent readers with one writer
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_schema(&pool).await?;

    let seeded = super::seed::seed_reference_archetypes(&pool).await?;
    if seeded > 0 {
        info!(count = seeded, "Seeded reference archetypes");
    }

    Ok(pool)
}

/// Open a private in-memory database with schema and reference data
///
/// Limited to one connection: every SQLite `:memory:` connection is its own
/// database.
pub async fn open_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    create_schema(&pool).await?;
    super::seed::seed_reference_archetypes(&pool).await?;
    Ok(pool)
}

/// Create all tables (idempotent - safe to call multiple times)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_settings_table(pool).await?;
    create_archetypes_table(pool).await?;
    create_body_scans_table(pool).await?;
    create_user_profile_table(pool).await?;
    Ok(())
}

async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_archetypes_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS morph_archetypes (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            gender TEXT NOT NULL CHECK (gender IN ('masculine', 'feminine')),
            obesity TEXT NOT NULL,
            muscularity TEXT NOT NULL,
            level TEXT NOT NULL,
            morphotype TEXT NOT NULL,
            bmi REAL,
            morph_values TEXT NOT NULL DEFAULT '{}',
            limb_masses TEXT NOT NULL DEFAULT '{}',
            measurements TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_morph_archetypes_gender ON morph_archetypes(gender)")
        .execute(pool)
        .await?;
    Ok(())
}

async fn create_body_scans_table(pool: &SqlitePool) -> Result<()> {
    // Rows are written once at commit and never updated
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS body_scans (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            resolved_gender TEXT NOT NULL,
            declared_height_cm REAL,
            declared_weight_kg REAL,
            estimated_bmi REAL,
            raw_measurements TEXT,
            semantic_profile TEXT,
            envelope TEXT,
            final_shape_params TEXT NOT NULL,
            final_limb_masses TEXT NOT NULL,
            skin_tone TEXT,
            model_id TEXT,
            vocabulary_version TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_body_scans_user ON body_scans(user_id, created_at)")
        .execute(pool)
        .await?;
    Ok(())
}

async fn create_user_profile_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_profile (
            user_id TEXT PRIMARY KEY,
            gender TEXT,
            height_cm REAL,
            weight_kg REAL,
            preferences TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}
