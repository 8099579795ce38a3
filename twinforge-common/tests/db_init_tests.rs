//! Database initialization and reference seeding

use sqlx::Row;
use tempfile::TempDir;
use twinforge_common::db::{bundled_archetypes, init_database, open_in_memory, seed_reference_archetypes};

async fn count(pool: &sqlx::SqlitePool, table: &str) -> i64 {
    sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
        .get("n")
}

#[tokio::test]
async fn test_database_created_with_schema_and_seed() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("nested").join("twinforge.db");

    let pool = init_database(&db_path).await.unwrap();
    assert!(db_path.exists());

    for table in ["settings", "morph_archetypes", "body_scans", "user_profile"] {
        let exists: Option<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_optional(&pool)
                .await
                .unwrap();
        assert!(exists.is_some(), "table {} missing", table);
    }

    let expected = bundled_archetypes().unwrap().len() as i64;
    assert_eq!(count(&pool, "morph_archetypes").await, expected);

    let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode").fetch_one(&pool).await.unwrap();
    assert_eq!(mode.to_lowercase(), "wal");
}

#[tokio::test]
async fn test_reopen_does_not_reseed() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("twinforge.db");

    let first = init_database(&db_path).await.unwrap();
    let seeded = count(&first, "morph_archetypes").await;
    first.close().await;

    let second = init_database(&db_path).await.unwrap();
    assert_eq!(count(&second, "morph_archetypes").await, seeded);
    assert_eq!(seed_reference_archetypes(&second).await.unwrap(), 0);
}

#[tokio::test]
async fn test_in_memory_databases_are_isolated() {
    let a = open_in_memory().await.unwrap();
    let b = open_in_memory().await.unwrap();

    sqlx::query("INSERT INTO settings (key, value) VALUES ('k', 'v')")
        .execute(&a)
        .await
        .unwrap();
    assert_eq!(count(&a, "settings").await, 1);
    assert_eq!(count(&b, "settings").await, 0);
}

#[test]
fn test_bundled_archetypes_cover_both_genders() {
    let archetypes = bundled_archetypes().unwrap();
    for gender in [twinforge_common::Gender::Masculine, twinforge_common::Gender::Feminine] {
        let n = archetypes.iter().filter(|a| a.gender == gender).count();
        assert!(n >= 5, "{} has only {} archetypes", gender, n);
    }
    assert!(archetypes
        .iter()
        .all(|a| a.morph_values.keys().all(|k| twinforge_common::morph::is_shape_key(k))));
}
