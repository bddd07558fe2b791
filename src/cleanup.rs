//! Batch re-cleaning of stored events.
//!
//! Applies the current [`crate::cleaner`] rules to every stored row in one
//! transaction. Cleaning a title can make two rows converge on the same
//! natural key; the unique index then rejects the update and the row being
//! cleaned is folded into the one already holding that key.

use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::cleaner::{clean_text, generate_summary_from_content, is_garbage_text, is_under16_related};
use crate::heuristics::{detect_age_bracket, normalize_age_bracket};
use crate::models::AgeBracket;
use crate::store::{find_by_natural_key, is_unique_violation, merge_event_rows};

#[derive(Debug, Clone, Default)]
pub struct CleanupResult {
    pub cleaned: usize,
    pub merged: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct CleanedFields {
    title: String,
    summary: String,
    business_impact: String,
    age_bracket: String,
    is_under16: bool,
}

struct StoredEvent {
    id: String,
    source_url: String,
    country: String,
    raw_content: String,
    fields: CleanedFields,
}

fn recompute(event: &StoredEvent) -> CleanedFields {
    let current = &event.fields;
    let title = match clean_text(&current.title) {
        t if t.is_empty() => current.title.clone(),
        t => t,
    };

    let summary = clean_text(&current.summary);
    let summary = if is_garbage_text(&current.summary) || is_garbage_text(&summary) {
        generate_summary_from_content(&title, &event.raw_content, &event.country)
    } else {
        summary
    };

    let impact = clean_text(&current.business_impact);
    let business_impact = if impact.is_empty() || is_garbage_text(&impact) {
        String::new()
    } else {
        impact
    };

    let text = format!("{} {} {}", title, summary, clean_text(&event.raw_content));
    let age_bracket = match normalize_age_bracket(&current.age_bracket) {
        AgeBracket::Unknown => detect_age_bracket(&text),
        bracket => bracket,
    };
    let is_under16 = age_bracket.includes_under16() || is_under16_related(&text);

    CleanedFields {
        title,
        summary,
        business_impact,
        age_bracket: age_bracket.as_str().to_string(),
        is_under16,
    }
}

async fn write_fields(
    conn: &mut SqliteConnection,
    id: &str,
    fields: &CleanedFields,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE regulation_events SET
            title = ?, summary = ?, business_impact = ?, age_bracket = ?, is_under16 = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&fields.title)
    .bind(&fields.summary)
    .bind(&fields.business_impact)
    .bind(&fields.age_bracket)
    .bind(fields.is_under16)
    .bind(Utc::now().timestamp())
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

enum RowOutcome {
    Unchanged,
    Cleaned,
    Merged,
}

async fn clean_row(conn: &mut SqliteConnection, event: &StoredEvent) -> Result<RowOutcome> {
    let fields = recompute(event);
    if fields == event.fields {
        return Ok(RowOutcome::Unchanged);
    }
    match write_fields(conn, &event.id, &fields).await {
        Ok(()) => Ok(RowOutcome::Cleaned),
        Err(e) if is_unique_violation(&e) => {
            let survivor =
                find_by_natural_key(conn, &event.source_url, &event.country, &fields.title)
                    .await?;
            match survivor {
                Some((survivor_id, _)) if survivor_id != event.id => {
                    merge_event_rows(conn, &event.id, &survivor_id).await?;
                    debug!(loser = %event.id, survivor = %survivor_id, "merged converging events");
                    Ok(RowOutcome::Merged)
                }
                _ => Err(e.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Re-clean every stored event. Per-row failures are collected, not fatal.
pub async fn run_data_cleanup(pool: &SqlitePool) -> Result<CleanupResult> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query(
        r#"
        SELECT id, source_url, title, summary, raw_content, business_impact,
               jurisdiction_country, age_bracket, is_under16
        FROM regulation_events
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .fetch_all(&mut *tx)
    .await?;

    let events: Vec<StoredEvent> = rows
        .iter()
        .map(|row| StoredEvent {
            id: row.get("id"),
            source_url: row.get("source_url"),
            country: row.get("jurisdiction_country"),
            raw_content: row.get("raw_content"),
            fields: CleanedFields {
                title: row.get("title"),
                summary: row.get("summary"),
                business_impact: row.get("business_impact"),
                age_bracket: row.get("age_bracket"),
                is_under16: row.get("is_under16"),
            },
        })
        .collect();

    let mut result = CleanupResult::default();
    for event in &events {
        match clean_row(&mut tx, event).await {
            Ok(RowOutcome::Unchanged) => {}
            Ok(RowOutcome::Cleaned) => result.cleaned += 1,
            Ok(RowOutcome::Merged) => result.merged += 1,
            Err(e) => {
                warn!(event = %event.id, error = %e, "cleanup failed for event");
                result.errors.push(format!("{}: {:#}", event.id, e));
            }
        }
    }

    tx.commit().await?;
    info!(
        scanned = events.len(),
        cleaned = result.cleaned,
        merged = result.merged,
        errors = result.errors.len(),
        "data cleanup complete"
    );
    Ok(result)
}
