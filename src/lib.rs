//! # regwatch
//!
//! Tracks regulatory developments that affect online services used by
//! minors: bills, enacted laws, regulator guidance and the news around them.
//!
//! regwatch crawls a static registry of sources (RSS/Atom feeds, HTML pages
//! and a social search API), classifies each item with an LLM endpoint or a
//! heuristic fallback, resolves its jurisdiction and risk, cleans scraped
//! noise, and stores deduplicated events in SQLite. Events are folded into
//! canonical laws with an append-only update history.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────┐
//! │  Crawlers   │──▶│   Analyzer   │──▶│ Clean+Dedup  │──▶│  SQLite  │
//! │ RSS/HTML/API│   │ LLM|heuristic│   │ jurisdiction │   │ events   │
//! └─────────────┘   └──────────────┘   │ risk scoring │   │ laws     │
//!                                      └──────────────┘   └────┬─────┘
//!                                                              │
//!                              backfill · cleanup · sync-laws ◀┘
//! ```
//!
//! ## Entry points
//!
//! - [`pipeline::run_pipeline`] crawls, analyzes and persists one run.
//! - [`backfill::backfill_risk_and_jurisdiction`] re-resolves stored rows.
//! - [`cleanup::run_data_cleanup`] re-cleans stored text.
//! - [`laws::sync_laws_from_events`] rebuilds canonical laws.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`fetch`] | HTTP GET with timeout and retry |
//! | [`connector_feed`] | RSS/Atom crawler |
//! | [`connector_html`] | HTML page crawler |
//! | [`connector_search`] | Search-API crawler |
//! | [`crawl`] | Source dispatch and crawl-level dedup |
//! | [`heuristics`] | Fallback classifier rules |
//! | [`analyzer`] | LLM classification |
//! | [`jurisdiction`] | Country and state resolution |
//! | [`risk`] | Risk scoring |
//! | [`cleaner`] | Text cleaning and garbage detection |
//! | [`cleanup`] | Batch re-cleaning |
//! | [`store`] | Event persistence |
//! | [`laws`] | Canonical laws |
//! | [`pipeline`] | Run orchestration |
//! | [`backfill`] | Jurisdiction and risk backfill |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod analyzer;
pub mod backfill;
pub mod cleaner;
pub mod cleanup;
pub mod config;
pub mod connector_feed;
pub mod connector_html;
pub mod connector_search;
pub mod crawl;
pub mod db;
pub mod fetch;
pub mod heuristics;
pub mod jurisdiction;
pub mod laws;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod risk;
pub mod sources;
pub mod store;
