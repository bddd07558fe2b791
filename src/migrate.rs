use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            source_type TEXT NOT NULL,
            jurisdiction_country TEXT,
            jurisdiction_state TEXT,
            reliability_tier INTEGER NOT NULL DEFAULT 3,
            search_query TEXT,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Canonical laws. law_key is deliberately not unique: concurrent writers
    // may both insert, and merge_duplicate_laws collapses them afterwards.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS laws (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            law_key TEXT NOT NULL,
            canonical_title TEXT NOT NULL,
            jurisdiction_country TEXT NOT NULL,
            jurisdiction_state TEXT,
            stage TEXT NOT NULL,
            age_bracket TEXT NOT NULL,
            summary TEXT NOT NULL DEFAULT '',
            impact_score INTEGER NOT NULL DEFAULT 1,
            likelihood_score INTEGER NOT NULL DEFAULT 1,
            confidence_score INTEGER NOT NULL DEFAULT 1,
            composite_score INTEGER NOT NULL DEFAULT 1,
            latest_source_url TEXT,
            latest_published_at INTEGER,
            latest_captured_at INTEGER,
            update_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS regulation_events (
            id TEXT PRIMARY KEY,
            source_id TEXT,
            source_url TEXT NOT NULL,
            title TEXT NOT NULL,
            summary TEXT NOT NULL DEFAULT '',
            raw_content TEXT NOT NULL DEFAULT '',
            business_impact TEXT NOT NULL DEFAULT '',
            jurisdiction_country TEXT NOT NULL,
            jurisdiction_state TEXT,
            stage TEXT NOT NULL,
            age_bracket TEXT NOT NULL,
            is_under16 INTEGER NOT NULL DEFAULT 0,
            impact_score INTEGER NOT NULL,
            likelihood_score INTEGER NOT NULL,
            confidence_score INTEGER NOT NULL,
            composite_score INTEGER NOT NULL,
            affected_products TEXT NOT NULL DEFAULT '[]',
            reliability_tier INTEGER NOT NULL DEFAULT 3,
            status TEXT NOT NULL,
            analysis_method TEXT NOT NULL DEFAULT 'heuristic',
            published_at INTEGER,
            law_id INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(source_url, jurisdiction_country, title),
            FOREIGN KEY (source_id) REFERENCES sources(id),
            FOREIGN KEY (law_id) REFERENCES laws(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS law_updates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            law_id INTEGER NOT NULL,
            update_key TEXT NOT NULL UNIQUE,
            event_id TEXT,
            title TEXT NOT NULL,
            stage TEXT NOT NULL,
            age_bracket TEXT NOT NULL,
            summary TEXT NOT NULL DEFAULT '',
            source_url TEXT,
            impact_score INTEGER NOT NULL,
            likelihood_score INTEGER NOT NULL,
            confidence_score INTEGER NOT NULL,
            composite_score INTEGER NOT NULL,
            published_at INTEGER,
            captured_at INTEGER NOT NULL,
            FOREIGN KEY (law_id) REFERENCES laws(id),
            FOREIGN KEY (event_id) REFERENCES regulation_events(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feedback (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT NOT NULL,
            rating INTEGER,
            comment TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (event_id) REFERENCES regulation_events(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_laws_law_key ON laws(law_key)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_law_updates_law_id ON law_updates(law_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_law_id ON regulation_events(law_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_events_created_at ON regulation_events(created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_feedback_event_id ON feedback(event_id)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("m.sqlite")).await.unwrap();
        apply(&pool).await.unwrap();
        apply(&pool).await.unwrap();

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN \
             ('sources','laws','regulation_events','law_updates','feedback')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 5);
    }
}
