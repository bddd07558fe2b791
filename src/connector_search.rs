//! Search-API connector.
//!
//! Runs one recent-search query per source (single page, up to
//! `max_results` posts), joins each post to its author via the `includes`
//! block, and dedupes by post id.
//!
//! # Retry Strategy
//!
//! - HTTP 429, 408 and 5xx, network errors and timeouts → retry
//! - Any other status → fail immediately
//! - Wait = max(exponential backoff, server-provided delay), where backoff
//!   is `base × 2^(attempt−1)` capped at `max_backoff_ms`, and the server
//!   delay comes from `retry-after` or `x-rate-limit-reset` capped at
//!   `max_server_wait_secs`

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, AUTHORIZATION, RETRY_AFTER};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cleaner::clean_text;
use crate::config::SearchApiConfig;
use crate::connector_feed::{parse_date, truncate_chars};
use crate::models::{CrawledItem, Source};

const RATE_LIMIT_RESET: &str = "x-rate-limit-reset";
const TITLE_PREVIEW_CHARS: usize = 100;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("search API token is not configured")]
    MissingToken,
    #[error("source {0} has no search_query")]
    MissingQuery(String),
    #[error("search API request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("search API request timed out after {0:?}")]
    Timeout(Duration),
    #[error("search API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("search API response could not be parsed: {0}")]
    Parse(#[from] serde_json::Error),
}

impl SearchError {
    pub fn is_retriable(&self) -> bool {
        match self {
            // Builder, redirect and decode failures repeat identically on retry.
            SearchError::Network(e) => {
                e.is_connect() || e.is_timeout() || e.is_request() || e.is_body()
            }
            SearchError::Timeout(_) => true,
            SearchError::Status { status, .. } => is_retriable_status(*status),
            _ => false,
        }
    }
}

pub fn is_retriable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<Post>,
    #[serde(default)]
    includes: Option<Includes>,
}

#[derive(Debug, Deserialize)]
struct Post {
    id: String,
    text: String,
    #[serde(default)]
    author_id: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Includes {
    #[serde(default)]
    users: Vec<Author>,
}

#[derive(Debug, Deserialize)]
struct Author {
    id: String,
    #[serde(default)]
    name: String,
    username: String,
}

/// Exponential backoff for `attempt` (1-based), capped.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
    base.saturating_mul(factor).min(max)
}

/// Delay requested by the server via `retry-after` (seconds or HTTP date)
/// or `x-rate-limit-reset` (unix seconds).
pub fn server_delay(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    if let Some(raw) = headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()) {
        let raw = raw.trim();
        if let Ok(secs) = raw.parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
        if let Ok(at) = DateTime::parse_from_rfc2822(raw) {
            let secs = (at.with_timezone(&Utc) - now).num_seconds().max(0) as u64;
            return Some(Duration::from_secs(secs));
        }
    }
    let reset = headers
        .get(RATE_LIMIT_RESET)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())?;
    Some(Duration::from_secs((reset - now.timestamp()).max(0) as u64))
}

pub struct SearchApiClient {
    client: reqwest::Client,
    config: SearchApiConfig,
    max_content_chars: usize,
}

impl SearchApiClient {
    pub fn new(client: reqwest::Client, config: &SearchApiConfig, max_content_chars: usize) -> Self {
        Self {
            client,
            config: config.clone(),
            max_content_chars,
        }
    }

    fn retry_wait(&self, attempt: u32, headers: Option<&HeaderMap>) -> Duration {
        let backoff = backoff_delay(
            attempt,
            Duration::from_millis(self.config.base_backoff_ms),
            Duration::from_millis(self.config.max_backoff_ms),
        );
        let server = headers
            .and_then(|h| server_delay(h, Utc::now()))
            .map(|d| d.min(Duration::from_secs(self.config.max_server_wait_secs)))
            .unwrap_or_default();
        backoff.max(server)
    }

    async fn request_once(
        &self,
        query: &str,
        token: &str,
    ) -> Result<SearchResponse, (SearchError, Option<HeaderMap>)> {
        let max_results = self.config.max_results.to_string();
        let send = self
            .client
            .get(&self.config.base_url)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .query(&[
                ("query", query),
                ("max_results", max_results.as_str()),
                ("tweet.fields", "created_at,author_id"),
                ("expansions", "author_id"),
                ("user.fields", "name,username"),
            ])
            .send();
        let timeout = Duration::from_secs(self.config.timeout_secs);

        let response = match tokio::time::timeout(timeout, send).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => return Err((SearchError::Network(e), None)),
            Err(_) => return Err((SearchError::Timeout(timeout), None)),
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = match tokio::time::timeout(timeout, response.text()).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => return Err((SearchError::Network(e), Some(headers))),
            Err(_) => return Err((SearchError::Timeout(timeout), Some(headers))),
        };
        if !status.is_success() {
            return Err((
                SearchError::Status {
                    status: status.as_u16(),
                    body,
                },
                Some(headers),
            ));
        }
        serde_json::from_str(&body).map_err(|e| (SearchError::Parse(e), None))
    }

    async fn search(&self, query: &str) -> Result<SearchResponse, SearchError> {
        let token = self
            .config
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(SearchError::MissingToken)?;
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.request_once(query, token).await {
                Ok(response) => return Ok(response),
                Err((e, headers)) if e.is_retriable() && attempt < max_attempts => {
                    let wait = self.retry_wait(attempt, headers.as_ref());
                    warn!(attempt, error = %e, wait_ms = wait.as_millis() as u64, "search API call failed, retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err((e, _)) => return Err(e),
            }
        }
    }

    fn status_url(&self, username: &str, id: &str) -> String {
        self.config
            .status_url_template
            .replace("{username}", username)
            .replace("{id}", id)
    }

    fn to_items(&self, response: SearchResponse, source: &Source) -> Vec<CrawledItem> {
        let authors: HashMap<String, Author> = response
            .includes
            .unwrap_or_default()
            .users
            .into_iter()
            .map(|u| (u.id.clone(), u))
            .collect();

        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for post in response.data {
            if !seen.insert(post.id.clone()) {
                continue;
            }
            let author = post.author_id.as_ref().and_then(|id| authors.get(id));
            let username = author.map(|a| a.username.as_str()).unwrap_or("i");
            let display = author
                .map(|a| {
                    if a.name.is_empty() {
                        format!("@{}", a.username)
                    } else {
                        format!("{} (@{})", a.name, a.username)
                    }
                })
                .unwrap_or_else(|| source.name.clone());

            let text = clean_text(&post.text);
            items.push(CrawledItem {
                url: self.status_url(username, &post.id),
                title: format!("{}: {}", display, truncate_chars(&text, TITLE_PREVIEW_CHARS)),
                content: truncate_chars(&text, self.max_content_chars),
                published_at: post.created_at.as_deref().and_then(parse_date),
                source_id: source.id.clone(),
            });
        }
        items
    }

    /// Run the source's query and return its posts as crawled items.
    pub async fn crawl(&self, source: &Source) -> Result<Vec<CrawledItem>, SearchError> {
        let query = source
            .search_query
            .as_deref()
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| SearchError::MissingQuery(source.id.clone()))?;
        let response = self.search(query).await?;
        let items = self.to_items(response, source);
        debug!(source = %source.id, items = items.len(), "search API results");
        Ok(items)
    }
}
