//! Canonical law identity.
//!
//! Every regulation event is an observation of some law at some point in its
//! lifecycle. Observations are folded into one `laws` row per law key plus an
//! append-only, content-addressed history in `law_updates`. The law row caches
//! a snapshot of its most recent update.
//!
//! # Law keys
//!
//! ```text
//! {country}|{state}|{sha256(country|state|canonical title)[..20]}
//! ```
//!
//! The canonical title is the cleaned title with jurisdiction and lifecycle
//! words removed, so "US Federal Youth Privacy Modernization Proposal" and
//! "US Federal Youth Privacy Modernization Enacted Update" share a key.

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::sync::LazyLock;
use tracing::{debug, info};

use crate::cleaner::{clean_text, generate_summary_from_content, is_garbage_text};
use crate::heuristics::{normalize_age_bracket, normalize_stage};
use crate::jurisdiction::{resolve_canonical_jurisdiction, JurisdictionSignals};
use crate::models::{AgeBracket, AnalyzedItem, Jurisdiction, RiskScores, Stage};
use crate::risk::{MAX_SCORE, MIN_SCORE};
use crate::store::sha256_hex;

const MIN_SIGNIFICANT_WORDS: usize = 3;
const LAW_KEY_HASH_CHARS: usize = 20;

const DOTTED_US: &str = r"(?i)\bu\.s\.(a\.)?";

const JURISDICTION_NOISE: &str = r"(?i)\b(usa|us|united states( of america)?|federal|national|nationwide|state of|statewide|uk|united kingdom|eu|european union|european)\b";

const LIFECYCLE_NOISE: &str = r"(?i)\b(proposals?|proposed|proposes|introduced|introduces|enacted|enacts|effective|takes effect|in force|passed|passes|amended|amendments?|withdrawn|rejected|signed( into law)?|committee( review)?|updates?|updated|final rule|draft|new|latest|announced|announces)\b";

static NOISE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [DOTTED_US, JURISDICTION_NOISE, LIFECYCLE_NOISE, r"[:|()\[\]\u{2013}\u{2014}]|\s-\s"]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
});

const STOPWORDS: &[&str] = &["the", "and", "for", "with", "from", "into", "its", "their"];

fn remove_literal(text: &str, literal: &str) -> String {
    match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(literal))) {
        Ok(re) => re.replace_all(text, " ").into_owned(),
        Err(_) => text.to_string(),
    }
}

fn title_case(word: &str) -> String {
    let letters = word.chars().filter(|c| c.is_alphabetic()).count();
    if letters > 1 && word.chars().all(|c| !c.is_lowercase()) {
        return word.to_string();
    }
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn significant_words(text: &str) -> usize {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| w.chars().count() >= 3 && !STOPWORDS.contains(&w.as_str()))
        .count()
}

/// Stable, human-readable law name for a title.
///
/// Removes jurisdiction and lifecycle words (plus the resolved country and
/// state names), then title-cases. Falls back to the cleaned title when
/// fewer than three significant words survive.
pub fn extract_canonical_title(title: &str, jurisdiction: &Jurisdiction) -> String {
    let cleaned = clean_text(title);
    let mut text = cleaned.clone();
    for re in NOISE.iter() {
        text = re.replace_all(&text, " ").into_owned();
    }
    text = remove_literal(&text, &jurisdiction.country);
    if let Some(state) = &jurisdiction.state {
        text = remove_literal(&text, state);
    }

    let canonical = text
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| matches!(c, ',' | ';' | '.' | '-')))
        .filter(|w| !w.is_empty())
        .map(title_case)
        .collect::<Vec<_>>()
        .join(" ");

    if significant_words(&canonical) < MIN_SIGNIFICANT_WORDS {
        cleaned
    } else {
        canonical
    }
}

pub fn law_key(jurisdiction: &Jurisdiction, canonical_title: &str) -> String {
    let country = jurisdiction.country.as_str();
    let state = jurisdiction.state.as_deref().unwrap_or("");
    let digest = sha256_hex(&format!(
        "{}|{}|{}",
        country,
        state,
        canonical_title.to_lowercase()
    ));
    format!("{}|{}|{}", country, state, &digest[..LAW_KEY_HASH_CHARS])
}

/// One observation of a law, before normalization.
#[derive(Debug, Clone)]
pub struct LawObservation {
    pub event_id: Option<String>,
    pub title: String,
    pub summary: String,
    /// Extra text used only for jurisdiction inference and summary fallback.
    pub content: String,
    pub source_url: Option<String>,
    pub country: Option<String>,
    pub state: Option<String>,
    pub stage: String,
    pub age_bracket: String,
    pub scores: RiskScores,
    pub published_at: Option<i64>,
    pub captured_at: i64,
}

impl LawObservation {
    pub fn from_item(item: &AnalyzedItem, event_id: &str) -> Self {
        Self {
            event_id: Some(event_id.to_string()),
            title: item.item.title.clone(),
            summary: item.summary.clone(),
            content: item.item.content.clone(),
            source_url: Some(item.item.url.clone()),
            country: Some(item.jurisdiction.country.clone()),
            state: item.jurisdiction.state.clone(),
            stage: item.stage.as_str().to_string(),
            age_bracket: item.age_bracket.as_str().to_string(),
            scores: item.scores,
            published_at: item.published_at_ts(),
            captured_at: item.analyzed_at.timestamp(),
        }
    }
}

struct NormalizedObservation {
    title: String,
    summary: String,
    jurisdiction: Jurisdiction,
    stage: Stage,
    age_bracket: AgeBracket,
    scores: RiskScores,
    canonical_title: String,
    law_key: String,
}

fn clamp_scores(scores: RiskScores) -> RiskScores {
    RiskScores {
        impact: scores.impact.clamp(MIN_SCORE, MAX_SCORE),
        likelihood: scores.likelihood.clamp(MIN_SCORE, MAX_SCORE),
        confidence: scores.confidence.clamp(MIN_SCORE, MAX_SCORE),
        composite: scores.composite.clamp(MIN_SCORE, MAX_SCORE),
    }
}

fn normalize(obs: &LawObservation) -> NormalizedObservation {
    let title = clean_text(&obs.title);
    let jurisdiction = resolve_canonical_jurisdiction(&JurisdictionSignals {
        hint_country: obs.country.as_deref(),
        hint_state: obs.state.as_deref(),
        text: &format!("{} {}", title, obs.content),
        url: obs.source_url.as_deref().unwrap_or(""),
        ..Default::default()
    });
    let summary = clean_text(&obs.summary);
    let summary = if summary.is_empty() || is_garbage_text(&summary) {
        generate_summary_from_content(&title, &obs.content, &jurisdiction.country)
    } else {
        summary
    };
    let canonical_title = extract_canonical_title(&title, &jurisdiction);
    let law_key = law_key(&jurisdiction, &canonical_title);
    NormalizedObservation {
        title,
        summary,
        stage: normalize_stage(&obs.stage),
        age_bracket: normalize_age_bracket(&obs.age_bracket),
        scores: clamp_scores(obs.scores),
        jurisdiction,
        canonical_title,
        law_key,
    }
}

fn update_key(norm: &NormalizedObservation, obs: &LawObservation) -> String {
    sha256_hex(&format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        norm.law_key,
        norm.canonical_title,
        norm.title,
        norm.stage.as_str(),
        norm.age_bracket.as_str(),
        norm.summary,
        obs.source_url.as_deref().unwrap_or(""),
        obs.published_at.map(|t| t.to_string()).unwrap_or_default(),
        norm.scores.impact,
        norm.scores.likelihood,
        norm.scores.confidence,
        norm.scores.composite,
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LawUpsert {
    pub law_id: i64,
    pub law_key: String,
    pub inserted_law: bool,
    pub inserted_update: bool,
}

async fn find_law(conn: &mut SqliteConnection, key: &str) -> Result<Option<i64>> {
    let id: Option<i64> =
        sqlx::query_scalar("SELECT id FROM laws WHERE law_key = ? ORDER BY id LIMIT 1")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(id)
}

/// Record one observation: create the law if needed, append the update if
/// its content is new, and refresh the law's snapshot when anything changed.
pub async fn upsert_law_with_update(
    conn: &mut SqliteConnection,
    obs: &LawObservation,
) -> Result<LawUpsert> {
    let norm = normalize(obs);
    let now = Utc::now().timestamp();

    let (law_id, inserted_law) = match find_law(conn, &norm.law_key).await? {
        Some(id) => (id, false),
        None => {
            let result = sqlx::query(
                r#"
                INSERT INTO laws (
                    law_key, canonical_title, jurisdiction_country, jurisdiction_state,
                    stage, age_bracket, summary, impact_score, likelihood_score,
                    confidence_score, composite_score, latest_source_url,
                    latest_published_at, latest_captured_at, update_count, created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
                "#,
            )
            .bind(&norm.law_key)
            .bind(&norm.canonical_title)
            .bind(&norm.jurisdiction.country)
            .bind(&norm.jurisdiction.state)
            .bind(norm.stage.as_str())
            .bind(norm.age_bracket.as_str())
            .bind(&norm.summary)
            .bind(norm.scores.impact)
            .bind(norm.scores.likelihood)
            .bind(norm.scores.confidence)
            .bind(norm.scores.composite)
            .bind(&obs.source_url)
            .bind(obs.published_at)
            .bind(obs.captured_at)
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await
            .context("inserting law")?;
            (result.last_insert_rowid(), true)
        }
    };

    let inserted_update = sqlx::query(
        r#"
        INSERT INTO law_updates (
            law_id, update_key, event_id, title, stage, age_bracket, summary, source_url,
            impact_score, likelihood_score, confidence_score, composite_score,
            published_at, captured_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(update_key) DO NOTHING
        "#,
    )
    .bind(law_id)
    .bind(update_key(&norm, obs))
    .bind(&obs.event_id)
    .bind(&norm.title)
    .bind(norm.stage.as_str())
    .bind(norm.age_bracket.as_str())
    .bind(&norm.summary)
    .bind(&obs.source_url)
    .bind(norm.scores.impact)
    .bind(norm.scores.likelihood)
    .bind(norm.scores.confidence)
    .bind(norm.scores.composite)
    .bind(obs.published_at)
    .bind(obs.captured_at)
    .execute(&mut *conn)
    .await
    .context("inserting law update")?
    .rows_affected()
        > 0;

    if inserted_law || inserted_update {
        refresh_law_snapshot(conn, law_id).await?;
    }

    Ok(LawUpsert {
        law_id,
        law_key: norm.law_key,
        inserted_law,
        inserted_update,
    })
}

/// Copy the most recent update onto the law row and recount updates.
///
/// Most recent means newest `published_at`, then newest `captured_at`, then
/// highest id.
pub async fn refresh_law_snapshot(conn: &mut SqliteConnection, law_id: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE laws SET
            stage = u.stage,
            age_bracket = u.age_bracket,
            summary = u.summary,
            impact_score = u.impact_score,
            likelihood_score = u.likelihood_score,
            confidence_score = u.confidence_score,
            composite_score = u.composite_score,
            latest_source_url = u.source_url,
            latest_published_at = u.published_at,
            latest_captured_at = u.captured_at,
            update_count = (SELECT COUNT(*) FROM law_updates WHERE law_id = ?1),
            updated_at = ?2
        FROM (
            SELECT * FROM law_updates
            WHERE law_id = ?1
            ORDER BY COALESCE(published_at, 0) DESC, captured_at DESC, id DESC
            LIMIT 1
        ) AS u
        WHERE laws.id = ?1
        "#,
    )
    .bind(law_id)
    .bind(Utc::now().timestamp())
    .execute(&mut *conn)
    .await
    .context("refreshing law snapshot")?;
    Ok(())
}

pub async fn link_event(conn: &mut SqliteConnection, event_id: &str, law_id: i64) -> Result<()> {
    sqlx::query("UPDATE regulation_events SET law_id = ? WHERE id = ?")
        .bind(law_id)
        .bind(event_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Collapse laws sharing a key into one survivor each. Returns the number
/// of law rows deleted.
///
/// The survivor has the most updates, then the most recent snapshot, then
/// the lowest id.
pub async fn merge_duplicate_laws(conn: &mut SqliteConnection) -> Result<usize> {
    let keys: Vec<String> =
        sqlx::query_scalar("SELECT law_key FROM laws GROUP BY law_key HAVING COUNT(*) > 1")
            .fetch_all(&mut *conn)
            .await?;

    let mut merged = 0;
    for key in keys {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT l.id FROM laws l
            WHERE l.law_key = ?
            ORDER BY (SELECT COUNT(*) FROM law_updates u WHERE u.law_id = l.id) DESC,
                     COALESCE(l.latest_published_at, 0) DESC,
                     COALESCE(l.latest_captured_at, 0) DESC,
                     l.id ASC
            "#,
        )
        .bind(&key)
        .fetch_all(&mut *conn)
        .await?;

        let Some((&survivor, losers)) = ids.split_first() else {
            continue;
        };
        for &loser in losers {
            sqlx::query("UPDATE law_updates SET law_id = ? WHERE law_id = ?")
                .bind(survivor)
                .bind(loser)
                .execute(&mut *conn)
                .await?;
            sqlx::query("UPDATE regulation_events SET law_id = ? WHERE law_id = ?")
                .bind(survivor)
                .bind(loser)
                .execute(&mut *conn)
                .await?;
            sqlx::query("DELETE FROM laws WHERE id = ?")
                .bind(loser)
                .execute(&mut *conn)
                .await?;
            merged += 1;
        }
        refresh_law_snapshot(conn, survivor).await?;
        debug!(law_key = %key, survivor, removed = losers.len(), "merged duplicate laws");
    }
    Ok(merged)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LawSyncResult {
    pub scanned: usize,
    pub inserted_laws: usize,
    pub inserted_updates: usize,
    pub linked_events: usize,
    pub merged_duplicates: usize,
}

fn observation_from_row(row: &SqliteRow) -> LawObservation {
    LawObservation {
        event_id: Some(row.get("id")),
        title: row.get("title"),
        summary: row.get("summary"),
        content: row.get("raw_content"),
        source_url: Some(row.get("source_url")),
        country: Some(row.get("jurisdiction_country")),
        state: row.get("jurisdiction_state"),
        stage: row.get("stage"),
        age_bracket: row.get("age_bracket"),
        scores: RiskScores {
            impact: row.get("impact_score"),
            likelihood: row.get("likelihood_score"),
            confidence: row.get("confidence_score"),
            composite: row.get("composite_score"),
        },
        published_at: row.get("published_at"),
        captured_at: row.get("created_at"),
    }
}

/// Replay every stored event, oldest first, into the law tables, link each
/// event to its law, then merge duplicates. Runs in one transaction.
pub async fn sync_laws_from_events(pool: &SqlitePool) -> Result<LawSyncResult> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query(
        r#"
        SELECT id, source_url, title, summary, raw_content, jurisdiction_country,
               jurisdiction_state, stage, age_bracket, impact_score, likelihood_score,
               confidence_score, composite_score, published_at, created_at
        FROM regulation_events
        ORDER BY COALESCE(published_at, created_at) ASC, created_at ASC, id ASC
        "#,
    )
    .fetch_all(&mut *tx)
    .await?;

    let mut result = LawSyncResult::default();
    for row in rows {
        result.scanned += 1;
        let obs = observation_from_row(&row);
        let event_id: String = row.get("id");
        let upsert = upsert_law_with_update(&mut tx, &obs)
            .await
            .with_context(|| format!("syncing event {}", event_id))?;
        if upsert.inserted_law {
            result.inserted_laws += 1;
        }
        if upsert.inserted_update {
            result.inserted_updates += 1;
        }
        link_event(&mut tx, &event_id, upsert.law_id).await?;
        result.linked_events += 1;
    }

    result.merged_duplicates = merge_duplicate_laws(&mut tx).await?;
    tx.commit().await?;

    info!(
        scanned = result.scanned,
        inserted_laws = result.inserted_laws,
        inserted_updates = result.inserted_updates,
        merged = result.merged_duplicates,
        "law sync complete"
    );
    Ok(result)
}
