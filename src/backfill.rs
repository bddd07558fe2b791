//! Re-resolve jurisdiction and re-score risk for every stored event.
//!
//! Rows are rewritten only when a recomputed value differs from what is
//! stored. Impact never drops below its stored value, since the stored value
//! may carry the classifier's judgment.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::info;

use crate::heuristics::{normalize_age_bracket, normalize_stage};
use crate::jurisdiction::{
    hostname, is_unknown_country, resolve_canonical_jurisdiction, JurisdictionSignals,
};
use crate::models::{Jurisdiction, RiskScores, Source};
use crate::risk::{
    composite_score, derive_scores, has_severe_risk, CompositeSignals, ScoreInput,
    HIGH_RISK_THRESHOLD, MAX_SCORE, MIN_SCORE,
};
use crate::store::{find_by_natural_key, is_unique_violation, merge_event_rows};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillResult {
    pub scanned: usize,
    pub updated: usize,
    pub risk_updated: usize,
    pub jurisdiction_updated: usize,
    pub merged: usize,
    pub unknown_before: usize,
    pub unknown_after: usize,
    pub high_risk_before: usize,
    pub high_risk_after: usize,
}

type HostJurisdiction = (Option<String>, Option<String>);

/// Hostname → configured jurisdiction, for rows whose source is gone.
fn host_map(sources: &[Source]) -> HashMap<String, HostJurisdiction> {
    sources
        .iter()
        .filter(|s| s.jurisdiction_country.is_some())
        .filter_map(|s| {
            hostname(&s.url).map(|host| {
                (
                    host,
                    (s.jurisdiction_country.clone(), s.jurisdiction_state.clone()),
                )
            })
        })
        .collect()
}

fn is_high_risk(composite: i64) -> bool {
    composite >= HIGH_RISK_THRESHOLD
}

fn rescore(stored: RiskScores, stage: &str, age_bracket: &str, text: &str) -> RiskScores {
    // Rows stored below the relevance gate keep their floor scores.
    if stored == RiskScores::FLOOR {
        return stored;
    }
    let stage = normalize_stage(stage);
    let age_bracket = normalize_age_bracket(age_bracket);
    let derived = derive_scores(&ScoreInput {
        is_relevant: true,
        stage,
        age_bracket,
        text,
        impact: serde_json::Value::Null,
        confidence: json!(stored.confidence),
    });
    let impact = stored.impact.clamp(MIN_SCORE, MAX_SCORE).max(derived.impact);
    let composite = composite_score(
        impact,
        derived.likelihood,
        &CompositeSignals {
            severe: has_severe_risk(text),
            stage,
            age_bracket,
        },
    );
    RiskScores {
        impact,
        likelihood: derived.likelihood,
        confidence: derived.confidence,
        composite,
    }
}

/// Re-apply jurisdiction resolution and risk scoring across the store, in
/// one transaction.
pub async fn backfill_risk_and_jurisdiction(
    pool: &SqlitePool,
    sources: &[Source],
) -> Result<BackfillResult> {
    let hosts = host_map(sources);
    let mut tx = pool.begin().await?;

    let rows = sqlx::query(
        r#"
        SELECT e.id, e.source_url, e.title, e.raw_content, e.jurisdiction_country,
               e.jurisdiction_state, e.stage, e.age_bracket, e.impact_score,
               e.likelihood_score, e.confidence_score, e.composite_score,
               s.jurisdiction_country AS source_country,
               s.jurisdiction_state AS source_state
        FROM regulation_events e
        LEFT JOIN sources s ON s.id = e.source_id
        ORDER BY e.created_at ASC, e.id ASC
        "#,
    )
    .fetch_all(&mut *tx)
    .await?;

    let mut result = BackfillResult::default();
    let now = Utc::now().timestamp();

    for row in &rows {
        result.scanned += 1;
        let id: String = row.get("id");
        let source_url: String = row.get("source_url");
        let title: String = row.get("title");
        let raw_content: String = row.get("raw_content");
        let stage: String = row.get("stage");
        let age_bracket: String = row.get("age_bracket");
        let stored_jurisdiction = Jurisdiction {
            country: row.get("jurisdiction_country"),
            state: row.get("jurisdiction_state"),
        };
        let stored_scores = RiskScores {
            impact: row.get("impact_score"),
            likelihood: row.get("likelihood_score"),
            confidence: row.get("confidence_score"),
            composite: row.get("composite_score"),
        };

        let linked: HostJurisdiction = (row.get("source_country"), row.get("source_state"));
        let (source_country, source_state) = if linked.0.is_some() {
            linked
        } else {
            hostname(&source_url)
                .and_then(|host| hosts.get(&host).cloned())
                .unwrap_or_default()
        };

        let text = format!("{}\n{}", title, raw_content);
        let jurisdiction = resolve_canonical_jurisdiction(&JurisdictionSignals {
            hint_country: Some(stored_jurisdiction.country.as_str()),
            hint_state: stored_jurisdiction.state.as_deref(),
            text: &text,
            source_country: source_country.as_deref(),
            source_state: source_state.as_deref(),
            url: &source_url,
        });
        let scores = rescore(stored_scores, &stage, &age_bracket, &text);

        if is_unknown_country(Some(stored_jurisdiction.country.as_str())) {
            result.unknown_before += 1;
        }
        if is_unknown_country(Some(jurisdiction.country.as_str())) {
            result.unknown_after += 1;
        }
        if is_high_risk(stored_scores.composite) {
            result.high_risk_before += 1;
        }
        if is_high_risk(scores.composite) {
            result.high_risk_after += 1;
        }

        let jurisdiction_changed = jurisdiction != stored_jurisdiction;
        let risk_changed = scores != stored_scores;
        if !jurisdiction_changed && !risk_changed {
            continue;
        }

        let write = sqlx::query(
            r#"
            UPDATE regulation_events SET
                jurisdiction_country = ?, jurisdiction_state = ?,
                impact_score = ?, likelihood_score = ?, confidence_score = ?, composite_score = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&jurisdiction.country)
        .bind(&jurisdiction.state)
        .bind(scores.impact)
        .bind(scores.likelihood)
        .bind(scores.confidence)
        .bind(scores.composite)
        .bind(now)
        .bind(&id)
        .execute(&mut *tx)
        .await;

        match write {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                // Re-resolving the country made this row collide with one
                // already stored under the corrected key.
                let survivor =
                    find_by_natural_key(&mut tx, &source_url, &jurisdiction.country, &title)
                        .await?
                        .context("unique violation but no conflicting event found")?;
                merge_event_rows(&mut tx, &id, &survivor.0).await?;
                result.merged += 1;
            }
            Err(e) => return Err(e).with_context(|| format!("backfilling event {}", id)),
        }

        result.updated += 1;
        if jurisdiction_changed {
            result.jurisdiction_updated += 1;
        }
        if risk_changed {
            result.risk_updated += 1;
        }
    }

    tx.commit().await?;
    info!(
        scanned = result.scanned,
        updated = result.updated,
        unknown_before = result.unknown_before,
        unknown_after = result.unknown_after,
        high_risk_before = result.high_risk_before,
        high_risk_after = result.high_risk_after,
        "backfill complete"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SourceType, Stage};
    use crate::store::test_support::{analyzed, test_pool};
    use crate::store::upsert_event;
    use tempfile::TempDir;

    #[test]
    fn test_rescore_keeps_floor_rows() {
        assert_eq!(
            rescore(RiskScores::FLOOR, "enacted", "both", "mandatory age verification"),
            RiskScores::FLOOR
        );
    }

    #[test]
    fn test_rescore_never_lowers_impact() {
        let stored = RiskScores {
            impact: 5,
            likelihood: 2,
            confidence: 3,
            composite: 4,
        };
        let scores = rescore(stored, "proposed", "16-18", "a consultation");
        assert_eq!(scores.impact, 5);
        assert_eq!(scores.confidence, 3);
    }

    #[tokio::test]
    async fn test_backfill_resolves_unknown_from_host_map() {
        let tmp = TempDir::new().unwrap();
        let pool = test_pool(&tmp).await;

        let mut item = analyzed(
            "https://www.esafety.gov.au/newsroom/1",
            "Platforms told to act",
            Stage::Proposed,
        );
        item.jurisdiction.country = "Unknown".into();
        item.item.content = "Platforms were told to act.".into();
        item.item.source_id = "src".into();
        {
            let mut conn = pool.acquire().await.unwrap();
            upsert_event(&mut conn, &item).await.unwrap();
            // Orphan the row from its source so only the host map can help.
            sqlx::query("UPDATE regulation_events SET source_id = NULL")
                .execute(&mut *conn)
                .await
                .unwrap();
        }

        let registry = vec![Source {
            id: "esafety".into(),
            name: "eSafety".into(),
            url: "https://www.esafety.gov.au/newsroom".into(),
            source_type: SourceType::Html,
            jurisdiction_country: Some("Australia".into()),
            jurisdiction_state: None,
            reliability_tier: 5,
            search_query: None,
        }];

        let result = backfill_risk_and_jurisdiction(&pool, &registry).await.unwrap();
        assert_eq!(result.scanned, 1);
        assert_eq!(result.unknown_before, 1);
        assert_eq!(result.unknown_after, 0);
        assert_eq!(result.jurisdiction_updated, 1);

        let country: String =
            sqlx::query_scalar("SELECT jurisdiction_country FROM regulation_events")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(country, "Australia");

        let again = backfill_risk_and_jurisdiction(&pool, &registry).await.unwrap();
        assert_eq!(again.updated, 0);
    }

    #[tokio::test]
    async fn test_backfill_raises_severe_late_stage_risk() {
        let tmp = TempDir::new().unwrap();
        let pool = test_pool(&tmp).await;
        let mut item = analyzed("https://x.gov/2", "Social media law enacted", Stage::Enacted);
        item.item.content =
            "The law requires mandatory age verification and sets a fine for each breach.".into();
        item.scores = RiskScores {
            impact: 2,
            likelihood: 2,
            confidence: 2,
            composite: 2,
        };
        {
            let mut conn = pool.acquire().await.unwrap();
            upsert_event(&mut conn, &item).await.unwrap();
        }

        let result = backfill_risk_and_jurisdiction(&pool, &[]).await.unwrap();
        assert_eq!(result.risk_updated, 1);
        assert_eq!(result.high_risk_before, 0);
        assert_eq!(result.high_risk_after, 1);

        let composite: i64 = sqlx::query_scalar("SELECT composite_score FROM regulation_events")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(composite, 5);
    }
}
