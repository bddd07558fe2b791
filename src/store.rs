//! Regulation event persistence.
//!
//! Events are identified by the natural key `(source_url,
//! jurisdiction_country, title)`, enforced by a unique index. Writers follow
//! an optimistic pattern: look up the natural key, write, and if the unique
//! index still fires (a concurrent writer got there first) re-resolve the
//! conflicting row and update it instead.
//!
//! Cleanup and backfill rewrite title and jurisdiction in place without
//! changing `id`. A later write of the original key therefore also checks
//! for a row under its computed id, and updates that row under its stored
//! key.

use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{SqliteConnection, SqlitePool};

use crate::models::{AnalyzedItem, Source};

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic event id: `sha256(url|country|title)`.
pub fn event_id(url: &str, country: &str, title: &str) -> String {
    sha256_hex(&format!("{}|{}|{}", url, country, title))
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(e) if e.is_unique_violation())
}

/// Stored status of an event after a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    New,
    StatusChanged,
    Unchanged,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::New => "new",
            EventStatus::StatusChanged => "status_changed",
            EventStatus::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: String,
    pub is_new: bool,
    pub status_changed: bool,
}

/// Upsert the source registry so events can reference it.
pub async fn upsert_sources(pool: &SqlitePool, sources: &[Source]) -> Result<()> {
    let now = Utc::now().timestamp();
    let mut tx = pool.begin().await?;
    for source in sources {
        sqlx::query(
            r#"
            INSERT INTO sources (id, name, url, source_type, jurisdiction_country, jurisdiction_state, reliability_tier, search_query, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                url = excluded.url,
                source_type = excluded.source_type,
                jurisdiction_country = excluded.jurisdiction_country,
                jurisdiction_state = excluded.jurisdiction_state,
                reliability_tier = excluded.reliability_tier,
                search_query = excluded.search_query,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&source.id)
        .bind(&source.name)
        .bind(&source.url)
        .bind(source.source_type.as_str())
        .bind(&source.jurisdiction_country)
        .bind(&source.jurisdiction_state)
        .bind(source.reliability_tier as i64)
        .bind(&source.search_query)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// `(id, stage)` of the event stored under a natural key.
pub async fn find_by_natural_key(
    conn: &mut SqliteConnection,
    source_url: &str,
    country: &str,
    title: &str,
) -> Result<Option<(String, String)>> {
    let row: Option<(String, String)> = sqlx::query_as(
        "SELECT id, stage FROM regulation_events WHERE source_url = ? AND jurisdiction_country = ? AND title = ?",
    )
    .bind(source_url)
    .bind(country)
    .bind(title)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

/// Natural key and stage of the event stored under `id`.
struct StoredKey {
    stage: String,
    source_url: String,
    country: String,
    state: Option<String>,
    title: String,
}

async fn find_by_id(conn: &mut SqliteConnection, id: &str) -> Result<Option<StoredKey>> {
    let row: Option<(String, String, String, Option<String>, String)> = sqlx::query_as(
        "SELECT stage, source_url, jurisdiction_country, jurisdiction_state, title FROM regulation_events WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(|(stage, source_url, country, state, title)| StoredKey {
        stage,
        source_url,
        country,
        state,
        title,
    }))
}

async fn write_event(
    conn: &mut SqliteConnection,
    id: &str,
    item: &AnalyzedItem,
    status: EventStatus,
) -> std::result::Result<(), sqlx::Error> {
    let now = Utc::now().timestamp();
    let products = serde_json::to_string(&item.products).unwrap_or_else(|_| "[]".to_string());
    sqlx::query(
        r#"
        INSERT INTO regulation_events (
            id, source_id, source_url, title, summary, raw_content, business_impact,
            jurisdiction_country, jurisdiction_state, stage, age_bracket, is_under16,
            impact_score, likelihood_score, confidence_score, composite_score,
            affected_products, reliability_tier, status, analysis_method, published_at,
            created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            source_id = excluded.source_id,
            source_url = excluded.source_url,
            title = excluded.title,
            summary = excluded.summary,
            raw_content = excluded.raw_content,
            business_impact = excluded.business_impact,
            jurisdiction_country = excluded.jurisdiction_country,
            jurisdiction_state = excluded.jurisdiction_state,
            stage = excluded.stage,
            age_bracket = excluded.age_bracket,
            is_under16 = excluded.is_under16,
            impact_score = excluded.impact_score,
            likelihood_score = excluded.likelihood_score,
            confidence_score = excluded.confidence_score,
            composite_score = excluded.composite_score,
            affected_products = excluded.affected_products,
            reliability_tier = excluded.reliability_tier,
            status = excluded.status,
            analysis_method = excluded.analysis_method,
            published_at = COALESCE(excluded.published_at, regulation_events.published_at),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(id)
    .bind(&item.item.source_id)
    .bind(&item.item.url)
    .bind(&item.item.title)
    .bind(&item.summary)
    .bind(&item.item.content)
    .bind(&item.business_impact)
    .bind(&item.jurisdiction.country)
    .bind(&item.jurisdiction.state)
    .bind(item.stage.as_str())
    .bind(item.age_bracket.as_str())
    .bind(item.is_under16)
    .bind(item.scores.impact)
    .bind(item.scores.likelihood)
    .bind(item.scores.confidence)
    .bind(item.scores.composite)
    .bind(products)
    .bind(item.reliability_tier as i64)
    .bind(status.as_str())
    .bind(item.method.as_str())
    .bind(item.published_at_ts())
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn classify(existing: &Option<(String, String)>, item: &AnalyzedItem) -> EventStatus {
    match existing {
        None => EventStatus::New,
        Some((_, stage)) if stage != item.stage.as_str() => EventStatus::StatusChanged,
        Some(_) => EventStatus::Unchanged,
    }
}

/// Insert or update one analyzed item. `created_at` is never rewritten.
pub async fn upsert_event(conn: &mut SqliteConnection, item: &AnalyzedItem) -> Result<UpsertOutcome> {
    let url = &item.item.url;
    let country = &item.jurisdiction.country;
    let title = &item.item.title;

    let existing = find_by_natural_key(conn, url, country, title).await?;
    if existing.is_none() {
        let id = event_id(url, country, title);
        if let Some(stored) = find_by_id(conn, &id).await? {
            // Cleanup or backfill re-keyed this row in place; its stored key wins.
            let status = classify(&Some((id.clone(), stored.stage)), item);
            let mut rekeyed = item.clone();
            rekeyed.item.url = stored.source_url;
            rekeyed.item.title = stored.title;
            rekeyed.jurisdiction.country = stored.country;
            rekeyed.jurisdiction.state = stored.state;
            write_event(conn, &id, &rekeyed, status)
                .await
                .context("updating re-keyed event")?;
            return Ok(UpsertOutcome {
                id,
                is_new: false,
                status_changed: status == EventStatus::StatusChanged,
            });
        }
    }
    let status = classify(&existing, item);
    let id = existing
        .as_ref()
        .map(|(id, _)| id.clone())
        .unwrap_or_else(|| event_id(url, country, title));

    match write_event(conn, &id, item, status).await {
        Ok(()) => Ok(UpsertOutcome {
            id,
            is_new: status == EventStatus::New,
            status_changed: status == EventStatus::StatusChanged,
        }),
        Err(e) if is_unique_violation(&e) => {
            // Another writer stored this natural key under a different id.
            let existing = find_by_natural_key(conn, url, country, title)
                .await?
                .context("unique violation but no conflicting event found")?;
            let status = classify(&Some(existing.clone()), item);
            write_event(conn, &existing.0, item, status)
                .await
                .context("rewriting conflicting event")?;
            Ok(UpsertOutcome {
                id: existing.0,
                is_new: false,
                status_changed: status == EventStatus::StatusChanged,
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Fold `loser` into `survivor`: re-parent dependents, keep the earliest
/// creation time and any law link, then delete `loser`.
pub async fn merge_event_rows(
    conn: &mut SqliteConnection,
    loser: &str,
    survivor: &str,
) -> Result<()> {
    sqlx::query("UPDATE feedback SET event_id = ? WHERE event_id = ?")
        .bind(survivor)
        .bind(loser)
        .execute(&mut *conn)
        .await?;
    sqlx::query("UPDATE law_updates SET event_id = ? WHERE event_id = ?")
        .bind(survivor)
        .bind(loser)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        r#"
        UPDATE regulation_events SET
            law_id = COALESCE(law_id, (SELECT law_id FROM regulation_events WHERE id = ?1)),
            created_at = MIN(created_at, COALESCE((SELECT created_at FROM regulation_events WHERE id = ?1), created_at))
        WHERE id = ?2
        "#,
    )
    .bind(loser)
    .bind(survivor)
    .execute(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM regulation_events WHERE id = ?")
        .bind(loser)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::db;
    use crate::migrate;
    use crate::models::{
        AgeBracket, AnalysisMethod, CrawledItem, Jurisdiction, RiskScores, SourceType, Stage,
    };
    use tempfile::TempDir;

    pub async fn test_pool(tmp: &TempDir) -> SqlitePool {
        let pool = db::connect_path(&tmp.path().join("test.sqlite")).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        upsert_sources(&pool, &[test_source()]).await.unwrap();
        pool
    }

    pub fn test_source() -> Source {
        Source {
            id: "src".into(),
            name: "Test source".into(),
            url: "https://example.gov/feed".into(),
            source_type: SourceType::Rss,
            jurisdiction_country: Some("United States".into()),
            jurisdiction_state: None,
            reliability_tier: 4,
            search_query: None,
        }
    }

    pub fn analyzed(url: &str, title: &str, stage: Stage) -> AnalyzedItem {
        AnalyzedItem {
            item: CrawledItem {
                url: url.into(),
                title: title.into(),
                content: "Body text about age verification.".into(),
                published_at: None,
                source_id: "src".into(),
            },
            is_relevant: true,
            jurisdiction: Jurisdiction {
                country: "United States".into(),
                state: None,
            },
            stage,
            age_bracket: AgeBracket::Both,
            scores: RiskScores {
                impact: 3,
                likelihood: 2,
                confidence: 2,
                composite: 3,
            },
            products: vec!["Instagram".into()],
            summary: "Summary.".into(),
            business_impact: "Impact.".into(),
            is_under16: true,
            reliability_tier: 4,
            method: AnalysisMethod::Heuristic,
            analyzed_at: Utc::now(),
        }
    }
}
