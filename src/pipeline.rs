//! Crawl → analyze → persist orchestration.
//!
//! A run has two phases:
//!
//! 1. **Crawl.** Generic sources are crawled in fixed-size concurrent
//!    batches; one source failing never affects the others. Search-API
//!    sources follow, strictly one at a time with a delay between queries.
//!    The combined output is deduplicated per source.
//! 2. **Analyze.** Every crawled item goes into one shared queue. A fixed
//!    pool of workers pulls the next index from an atomic cursor, so each
//!    item is claimed by exactly one worker. Each worker analyzes, cleans,
//!    applies the relevance gate and the cross-run dedup key, then persists
//!    the event and links it to its canonical law in one transaction.
//!
//! Per-source and per-item failures are collected into
//! [`PipelineResult::errors`]; only failures outside any item (opening the
//! store, upserting the source registry) abort the run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use sqlx::{Connection, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::analyzer::Analyzer;
use crate::cleaner::polish;
use crate::config::Config;
use crate::crawl::{dedup_crawled, HttpCrawler, SourceCrawler};
use crate::db;
use crate::laws::{link_event, upsert_law_with_update, LawObservation};
use crate::migrate;
use crate::models::{AnalyzedItem, CrawledItem, Source, SourceType};
use crate::progress::{NoProgress, PipelineProgressEvent, ProgressReporter};
use crate::store::{sha256_hex, upsert_event, upsert_sources};

/// Aggregate outcome of one run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub run_id: String,
    pub sources_processed: usize,
    pub items_crawled: usize,
    pub items_analyzed: usize,
    pub items_saved: usize,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Post-analysis identity of an item within a run.
///
/// Resolved jurisdiction plus the normalized title; the URL stands in for an
/// empty title and a content hash for an empty URL.
pub fn run_dedup_key(item: &AnalyzedItem) -> String {
    let title = normalize_title(&item.item.title);
    let url: String = item
        .item
        .url
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    let anchor = if !title.is_empty() {
        format!("title:{}", title)
    } else if !url.is_empty() {
        format!("url:{}", url)
    } else {
        format!("hash:{}", sha256_hex(&item.item.content.to_lowercase()))
    };
    format!(
        "{}|{}|{}",
        item.jurisdiction.country,
        item.jurisdiction.state.as_deref().unwrap_or(""),
        anchor
    )
}

/// State shared by the analysis workers of one run.
struct AnalysisQueue {
    pool: SqlitePool,
    analyzer: Arc<Analyzer>,
    progress: Arc<dyn ProgressReporter>,
    sources: HashMap<String, Source>,
    items: Vec<CrawledItem>,
    cursor: AtomicUsize,
    analyzed: AtomicUsize,
    saved: AtomicUsize,
    seen: Mutex<HashSet<String>>,
    errors: Mutex<Vec<String>>,
    /// SQLite admits one writer. A deferred transaction that upgrades to a
    /// write lock while another worker holds it fails with SQLITE_BUSY
    /// instead of waiting, so workers take turns here to persist.
    write_gate: tokio::sync::Mutex<()>,
    save_irrelevant: bool,
}

impl AnalysisQueue {
    fn record_error(&self, message: String) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(message);
        }
    }

    /// Pull items until the queue is drained.
    async fn work(&self) {
        loop {
            let index = self.cursor.fetch_add(1, Ordering::SeqCst);
            let Some(item) = self.items.get(index) else {
                break;
            };
            if let Err(e) = self.process(item).await {
                warn!(url = %item.url, error = %e, "item failed");
                self.record_error(format!("item {}: {:#}", item.url, e));
            }
        }
    }

    fn claim_key(&self, key: String) -> bool {
        self.seen.lock().map(|mut seen| seen.insert(key)).unwrap_or(false)
    }

    async fn process(&self, item: &CrawledItem) -> Result<()> {
        let source = self
            .sources
            .get(&item.source_id)
            .with_context(|| format!("unknown source id '{}'", item.source_id))?;

        let mut analyzed = self.analyzer.analyze(item, source).await;
        let n = self.analyzed.fetch_add(1, Ordering::SeqCst) + 1;
        let total = self.items.len();
        if n % 10 == 0 || n == total {
            self.progress.report(PipelineProgressEvent::Analyzing {
                n: n as u64,
                total: total as u64,
            });
        }

        polish(&mut analyzed);
        if !analyzed.is_relevant && !self.save_irrelevant {
            debug!(url = %item.url, "not relevant, skipped");
            return Ok(());
        }
        if !self.claim_key(run_dedup_key(&analyzed)) {
            debug!(url = %item.url, "duplicate within run, skipped");
            return Ok(());
        }

        self.persist(&analyzed).await
    }

    async fn persist(&self, item: &AnalyzedItem) -> Result<()> {
        let _writer = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        let outcome = upsert_event(&mut tx, item).await.context("saving event")?;

        // The law link runs in a savepoint so its failure leaves the event saved.
        let linked = async {
            let mut savepoint = Connection::begin(&mut *tx).await?;
            let law =
                upsert_law_with_update(&mut savepoint, &LawObservation::from_item(item, &outcome.id))
                    .await?;
            link_event(&mut savepoint, &outcome.id, law.law_id).await?;
            savepoint.commit().await?;
            Ok::<_, anyhow::Error>(law)
        }
        .await;

        tx.commit().await.context("committing event")?;
        self.saved.fetch_add(1, Ordering::SeqCst);

        match linked {
            Ok(law) => debug!(
                event = %outcome.id,
                law_key = %law.law_key,
                is_new = outcome.is_new,
                status_changed = outcome.status_changed,
                "event saved"
            ),
            Err(e) => {
                warn!(event = %outcome.id, error = %e, "law link failed");
                self.record_error(format!("law link {}: {:#}", item.item.url, e));
            }
        }
        Ok(())
    }
}

/// One configured pipeline: store, crawler, analyzer and progress sink.
pub struct Pipeline {
    config: Arc<Config>,
    pool: SqlitePool,
    crawler: Arc<dyn SourceCrawler>,
    analyzer: Arc<Analyzer>,
    progress: Arc<dyn ProgressReporter>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        pool: SqlitePool,
        crawler: Arc<dyn SourceCrawler>,
        analyzer: Arc<Analyzer>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            pool,
            crawler,
            analyzer,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn analyzer(&self) -> &Analyzer {
        &self.analyzer
    }

    /// Crawl, analyze and persist the selected sources (all when `None`).
    pub async fn run(&self, source_ids: Option<&[String]>) -> Result<PipelineResult> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("pipeline", run_id = %run_id);
        self.run_inner(run_id.clone(), source_ids)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: String,
        source_ids: Option<&[String]>,
    ) -> Result<PipelineResult> {
        let started_at = Utc::now();
        let sources = self.config.select_sources(source_ids)?;
        upsert_sources(&self.pool, &sources)
            .await
            .context("upserting source registry")?;

        info!(sources = sources.len(), "crawl phase starting");
        let mut errors = Vec::new();
        let (items, sources_processed) = self.crawl_all(&sources, &mut errors).await;
        let items_crawled = items.len();

        info!(items = items_crawled, "analysis phase starting");
        let queue = Arc::new(AnalysisQueue {
            pool: self.pool.clone(),
            analyzer: Arc::clone(&self.analyzer),
            progress: Arc::clone(&self.progress),
            sources: sources.iter().map(|s| (s.id.clone(), s.clone())).collect(),
            items,
            cursor: AtomicUsize::new(0),
            analyzed: AtomicUsize::new(0),
            saved: AtomicUsize::new(0),
            seen: Mutex::new(HashSet::new()),
            errors: Mutex::new(Vec::new()),
            write_gate: tokio::sync::Mutex::new(()),
            save_irrelevant: self.config.analysis.save_irrelevant,
        });

        let workers = self
            .config
            .analysis
            .effective_concurrency()
            .min(items_crawled);
        let mut set = JoinSet::new();
        for _ in 0..workers {
            let queue = Arc::clone(&queue);
            set.spawn(async move { queue.work().await }.in_current_span());
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                errors.push(format!("analysis worker aborted: {}", e));
            }
        }

        if let Ok(mut item_errors) = queue.errors.lock() {
            errors.append(&mut item_errors);
        }

        let result = PipelineResult {
            run_id,
            sources_processed,
            items_crawled,
            items_analyzed: queue.analyzed.load(Ordering::SeqCst),
            items_saved: queue.saved.load(Ordering::SeqCst),
            errors,
            started_at,
            completed_at: Utc::now(),
        };
        info!(
            sources = result.sources_processed,
            crawled = result.items_crawled,
            analyzed = result.items_analyzed,
            saved = result.items_saved,
            errors = result.errors.len(),
            "pipeline run complete"
        );
        Ok(result)
    }

    fn record_crawl(
        &self,
        source: &Source,
        outcome: Result<Vec<CrawledItem>>,
        items: &mut Vec<CrawledItem>,
        errors: &mut Vec<String>,
        progress: (usize, usize),
    ) {
        let count = match outcome {
            Ok(found) if found.is_empty() => {
                warn!(source = %source.id, "crawl returned no items");
                errors.push(format!("source {}: no items found", source.id));
                0
            }
            Ok(found) => {
                debug!(source = %source.id, items = found.len(), "crawled");
                let count = found.len();
                items.extend(found);
                count
            }
            Err(e) => {
                warn!(source = %source.id, error = %e, "crawl failed");
                errors.push(format!("source {}: {:#}", source.id, e));
                0
            }
        };
        self.progress.report(PipelineProgressEvent::Crawled {
            source: source.id.clone(),
            items: count as u64,
            n: progress.0 as u64,
            total: progress.1 as u64,
        });
    }

    /// Phase 1. Returns the deduplicated items and the number of sources
    /// attempted.
    async fn crawl_all(
        &self,
        sources: &[Source],
        errors: &mut Vec<String>,
    ) -> (Vec<CrawledItem>, usize) {
        let (search, generic): (Vec<&Source>, Vec<&Source>) = sources
            .iter()
            .partition(|s| s.source_type == SourceType::SearchApi);

        let total = sources.len();
        let mut done = 0;
        let mut items = Vec::new();

        for batch in generic.chunks(self.config.crawl.concurrency.max(1)) {
            let outcomes = join_all(batch.iter().map(|source| {
                let crawler = Arc::clone(&self.crawler);
                async move { crawler.crawl(source).await }
            }))
            .await;
            for (source, outcome) in batch.iter().zip(outcomes) {
                done += 1;
                self.record_crawl(source, outcome, &mut items, errors, (done, total));
            }
        }

        let delay = Duration::from_millis(self.config.search_api.inter_query_delay_ms);
        for (i, source) in search.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(delay).await;
            }
            let outcome = self.crawler.crawl(source).await;
            done += 1;
            self.record_crawl(source, outcome, &mut items, errors, (done, total));
        }

        let before = items.len();
        let items = dedup_crawled(items);
        if items.len() < before {
            debug!(dropped = before - items.len(), "crawl-level duplicates dropped");
        }
        (items, done)
    }
}

/// Open the configured store and run the pipeline over HTTP sources.
pub async fn run_pipeline(
    config: &Config,
    source_ids: Option<&[String]>,
    progress: Arc<dyn ProgressReporter>,
) -> Result<PipelineResult> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    let crawler: Arc<dyn SourceCrawler> = Arc::new(HttpCrawler::new(config)?);
    let analyzer = Arc::new(Analyzer::new(&config.analysis)?);
    let pipeline =
        Pipeline::new(config.clone(), pool.clone(), crawler, analyzer).with_progress(progress);
    let result = pipeline.run(source_ids).await;
    pool.close().await;
    result
}

/// CLI entry point: run and print the summary.
pub async fn run_and_report(
    config: &Config,
    source_ids: Option<&[String]>,
    progress: Arc<dyn ProgressReporter>,
) -> Result<()> {
    let result = run_pipeline(config, source_ids, progress).await?;
    println!("run {}", result.run_id);
    println!("  sources processed: {}", result.sources_processed);
    println!("  items crawled: {}", result.items_crawled);
    println!("  items analyzed: {}", result.items_analyzed);
    println!("  items saved: {}", result.items_saved);
    println!(
        "  duration: {}s",
        (result.completed_at - result.started_at).num_seconds()
    );
    if result.errors.is_empty() {
        println!("ok");
    } else {
        println!("  errors: {}", result.errors.len());
        for error in &result.errors {
            println!("    {}", error);
        }
        println!("partial");
    }
    Ok(())
}
