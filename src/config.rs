//! TOML configuration parsing and validation.
//!
//! All tunables (timeouts, retry counts, concurrency limits) and the static
//! source registry live in one file. Credentials are never read by the
//! components themselves: [`load_config`] resolves them once from the
//! environment variables the file names and stores them on the [`Config`].
//!
//! ```toml
//! [db]
//! path = "./data/regwatch.sqlite"
//!
//! [analysis]
//! provider = "openai"
//! model = "gpt-4o-mini"
//!
//! [[sources]]
//! id = "ftc-press"
//! name = "FTC press releases"
//! url = "https://www.ftc.gov/feeds/press-release.xml"
//! type = "rss"
//! jurisdiction_country = "United States"
//! reliability_tier = 5
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::models::{Source, SourceType};

/// Hard cap on analysis workers regardless of configuration.
pub const MAX_ANALYSIS_CONCURRENCY: usize = 20;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub search_api: SearchApiConfig,
    #[serde(default)]
    pub sources: Vec<Source>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlConfig {
    #[serde(default = "default_crawl_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_crawl_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_crawl_max_attempts")]
    pub max_attempts: u32,
    /// Linear backoff step: attempt N waits `N × backoff_step_ms`.
    #[serde(default = "default_crawl_backoff_step_ms")]
    pub backoff_step_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_max_items_per_feed")]
    pub max_items_per_feed: usize,
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            concurrency: default_crawl_concurrency(),
            timeout_secs: default_crawl_timeout_secs(),
            max_attempts: default_crawl_max_attempts(),
            backoff_step_ms: default_crawl_backoff_step_ms(),
            user_agent: default_user_agent(),
            max_items_per_feed: default_max_items_per_feed(),
            max_content_chars: default_max_content_chars(),
        }
    }
}

fn default_crawl_concurrency() -> usize {
    10
}
fn default_crawl_timeout_secs() -> u64 {
    20
}
fn default_crawl_max_attempts() -> u32 {
    3
}
fn default_crawl_backoff_step_ms() -> u64 {
    2000
}
fn default_user_agent() -> String {
    format!("regwatch/{}", env!("CARGO_PKG_VERSION"))
}
fn default_max_items_per_feed() -> usize {
    10
}
fn default_max_content_chars() -> usize {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Resolved from `api_key_env` by [`load_config`].
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(default = "default_analysis_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_analysis_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_analysis_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_analysis_backoff_step_ms")]
    pub backoff_step_ms: u64,
    #[serde(default)]
    pub save_irrelevant: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            endpoint: None,
            model: None,
            api_key_env: default_api_key_env(),
            api_key: None,
            concurrency: default_analysis_concurrency(),
            timeout_secs: default_analysis_timeout_secs(),
            max_attempts: default_analysis_max_attempts(),
            backoff_step_ms: default_analysis_backoff_step_ms(),
            save_irrelevant: false,
        }
    }
}

impl AnalysisConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Configured worker count, clamped to `1..=MAX_ANALYSIS_CONCURRENCY`.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_ANALYSIS_CONCURRENCY)
    }

    /// Endpoint override, or the provider's public endpoint.
    pub fn resolved_endpoint(&self) -> &str {
        match (&self.endpoint, self.provider.as_str()) {
            (Some(url), _) => url,
            (None, "anthropic") => "https://api.anthropic.com/v1/messages",
            (None, _) => "https://api.openai.com/v1/chat/completions",
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_api_key_env() -> String {
    "CLASSIFIER_API_KEY".to_string()
}
fn default_analysis_concurrency() -> usize {
    12
}
fn default_analysis_timeout_secs() -> u64 {
    30
}
fn default_analysis_max_attempts() -> u32 {
    3
}
fn default_analysis_backoff_step_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchApiConfig {
    #[serde(default = "default_search_base_url")]
    pub base_url: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Resolved from `token_env` by [`load_config`].
    #[serde(skip)]
    pub token: Option<String>,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    #[serde(default = "default_search_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_max_server_wait_secs")]
    pub max_server_wait_secs: u64,
    #[serde(default = "default_inter_query_delay_ms")]
    pub inter_query_delay_ms: u64,
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
    /// `{username}` and `{id}` are substituted per result.
    #[serde(default = "default_status_url_template")]
    pub status_url_template: String,
}

impl Default for SearchApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_search_base_url(),
            token_env: default_token_env(),
            token: None,
            max_results: default_max_results(),
            max_attempts: default_search_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_server_wait_secs: default_max_server_wait_secs(),
            inter_query_delay_ms: default_inter_query_delay_ms(),
            timeout_secs: default_search_timeout_secs(),
            status_url_template: default_status_url_template(),
        }
    }
}

fn default_search_base_url() -> String {
    "https://api.x.com/2/tweets/search/recent".to_string()
}
fn default_token_env() -> String {
    "SEARCH_API_BEARER_TOKEN".to_string()
}
fn default_max_results() -> u32 {
    100
}
fn default_search_max_attempts() -> u32 {
    4
}
fn default_base_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_max_server_wait_secs() -> u64 {
    900
}
fn default_inter_query_delay_ms() -> u64 {
    1500
}
fn default_search_timeout_secs() -> u64 {
    20
}
fn default_status_url_template() -> String {
    "https://x.com/{username}/status/{id}".to_string()
}

impl Config {
    /// Minimal configuration pointing at a database file, everything else
    /// at defaults.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            crawl: CrawlConfig::default(),
            analysis: AnalysisConfig::default(),
            search_api: SearchApiConfig::default(),
            sources: Vec::new(),
        }
    }

    /// Sources matching `ids`, or every source when `ids` is `None`.
    pub fn select_sources(&self, ids: Option<&[String]>) -> Result<Vec<Source>> {
        let Some(ids) = ids else {
            return Ok(self.sources.clone());
        };
        let mut selected = Vec::with_capacity(ids.len());
        for id in ids {
            match self.sources.iter().find(|s| &s.id == id) {
                Some(source) => selected.push(source.clone()),
                None => bail!("Unknown source id: '{}'", id),
            }
        }
        Ok(selected)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;

    config.analysis.api_key = std::env::var(&config.analysis.api_key_env).ok();
    config.search_api.token = std::env::var(&config.search_api.token_env).ok();

    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.crawl.concurrency == 0 {
        bail!("crawl.concurrency must be >= 1");
    }
    if config.crawl.max_attempts == 0 {
        bail!("crawl.max_attempts must be >= 1");
    }
    if config.crawl.max_items_per_feed == 0 {
        bail!("crawl.max_items_per_feed must be >= 1");
    }
    if config.analysis.concurrency == 0 {
        bail!("analysis.concurrency must be >= 1");
    }

    match config.analysis.provider.as_str() {
        "disabled" | "openai" | "anthropic" => {}
        other => bail!(
            "Unknown analysis provider: '{}'. Must be disabled, openai, or anthropic.",
            other
        ),
    }
    if config.analysis.is_enabled() && config.analysis.model.is_none() {
        bail!(
            "analysis.model must be specified when provider is '{}'",
            config.analysis.provider
        );
    }

    if !(10..=100).contains(&config.search_api.max_results) {
        bail!("search_api.max_results must be in [10, 100]");
    }
    if config.search_api.max_attempts == 0 {
        bail!("search_api.max_attempts must be >= 1");
    }

    let mut seen = HashSet::new();
    for source in &config.sources {
        if !seen.insert(source.id.as_str()) {
            bail!("Duplicate source id: '{}'", source.id);
        }
        if !(1..=5).contains(&source.reliability_tier) {
            bail!(
                "sources.{}: reliability_tier must be in [1, 5]",
                source.id
            );
        }
        if source.source_type == SourceType::SearchApi
            && source.search_query.as_deref().map_or(true, |q| q.trim().is_empty())
        {
            bail!("sources.{}: search_api sources need a search_query", source.id);
        }
    }

    Ok(())
}
