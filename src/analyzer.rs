//! Hybrid LLM / heuristic classifier.
//!
//! [`Analyzer::analyze`] never fails. When the classification endpoint is
//! configured it is tried first; any failure (transport, HTTP status,
//! unparseable output) falls back to [`crate::heuristics`]. Both paths then
//! converge on the same finalization: stage and age normalization,
//! jurisdiction resolution, and risk scoring.
//!
//! An authentication failure (HTTP 401/403) trips a latch owned by the
//! analyzer instance. Once tripped, every later call goes straight to the
//! heuristic path without touching the network, until
//! [`Analyzer::reset_auth_latch`] is called.
//!
//! # Retry Strategy
//!
//! - Network error, timeout, HTTP 429 or 5xx → retry with linear backoff
//! - HTTP 401/403 → trip the latch, no retry
//! - Other statuses and malformed output → no retry

use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cleaner::{generate_summary_from_content, is_under16_related};
use crate::config::AnalysisConfig;
use crate::connector_feed::truncate_chars;
use crate::heuristics::{self, normalize_age_bracket, normalize_stage};
use crate::jurisdiction::{resolve_canonical_jurisdiction, JurisdictionSignals};
use crate::models::{AnalysisMethod, AnalyzedItem, CrawledItem, Source};
use crate::risk::{derive_scores, ScoreInput};

const PROMPT_CONTENT_CHARS: usize = 4000;
const ANTHROPIC_VERSION: &str = "2023-06-01";

const SYSTEM_PROMPT: &str = "You classify regulatory news about online safety for minors. \
Reply with one JSON object and nothing else, with keys: \
is_relevant (bool: does this concern regulation of social media, online platforms or apps with respect to users under 18), \
jurisdiction_country (string or null), jurisdiction_state (string or null, US states only), \
stage (one of proposed, introduced, committee_review, passed, amended, enacted, effective, withdrawn, rejected), \
age_bracket (one of 13-15, 16-18, both, unknown), \
impact_score (integer 1-5), confidence_score (integer 1-5), \
affected_products (array of product names), summary (two sentences), business_impact (one sentence).";

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("classifier is disabled")]
    Disabled,
    #[error("classifier rejected credentials (HTTP {0})")]
    Auth(u16),
    #[error("classifier request failed: {0}")]
    Transient(String),
    #[error("classifier returned HTTP {0}")]
    Rejected(u16),
    #[error("classifier response malformed: {0}")]
    Malformed(String),
}

impl ClassifyError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, ClassifyError::Transient(_))
    }
}

/// Provider-independent classification before finalization.
#[derive(Debug, Clone)]
pub struct Draft {
    pub is_relevant: bool,
    pub country_hint: Option<String>,
    pub state_hint: Option<String>,
    pub stage: String,
    pub age_bracket: String,
    pub impact: Value,
    pub confidence: Value,
    pub products: Vec<String>,
    pub summary: String,
    pub business_impact: String,
    pub method: AnalysisMethod,
}

impl Draft {
    pub fn heuristic(item: &CrawledItem) -> Self {
        let verdict = heuristics::classify(&item.title, &item.content);
        Self {
            is_relevant: verdict.is_relevant,
            country_hint: None,
            state_hint: None,
            stage: verdict.stage.as_str().to_string(),
            age_bracket: verdict.age_bracket.as_str().to_string(),
            impact: Value::Null,
            confidence: Value::Null,
            products: verdict.products,
            summary: String::new(),
            business_impact: String::new(),
            method: AnalysisMethod::Heuristic,
        }
    }
}

/// Slice out the first balanced JSON object, ignoring code fences and any
/// prose around it. Braces inside strings are not counted.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end().trim_end_matches("```"))
        .unwrap_or(trimmed);

    let start = unfenced.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in unfenced[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&unfenced[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn string_field(obj: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .filter_map(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty() && s != "null")
}

fn bool_field(obj: &Value, key: &str) -> Option<bool> {
    match obj.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

/// Parse raw model output into a [`Draft`].
pub fn parse_classification(raw: &str) -> Result<Draft, ClassifyError> {
    let object = extract_json_object(raw)
        .ok_or_else(|| ClassifyError::Malformed("no JSON object in output".into()))?;
    let value: Value =
        serde_json::from_str(object).map_err(|e| ClassifyError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(ClassifyError::Malformed("output is not an object".into()));
    }
    let is_relevant = bool_field(&value, "is_relevant")
        .ok_or_else(|| ClassifyError::Malformed("missing is_relevant".into()))?;

    let mut products: Vec<String> = Vec::new();
    let raw_products = value
        .get("affected_products")
        .or_else(|| value.get("products"))
        .and_then(|v| v.as_array());
    for p in raw_products.into_iter().flatten().filter_map(|p| p.as_str()) {
        let p = p.trim();
        if !p.is_empty() && !products.iter().any(|existing| existing.eq_ignore_ascii_case(p)) {
            products.push(p.to_string());
        }
    }

    Ok(Draft {
        is_relevant,
        country_hint: string_field(&value, &["jurisdiction_country", "country"]),
        state_hint: string_field(&value, &["jurisdiction_state", "state"]),
        stage: string_field(&value, &["stage"]).unwrap_or_default(),
        age_bracket: string_field(&value, &["age_bracket"]).unwrap_or_default(),
        impact: value
            .get("impact_score")
            .or_else(|| value.get("impact"))
            .cloned()
            .unwrap_or(Value::Null),
        confidence: value
            .get("confidence_score")
            .or_else(|| value.get("confidence"))
            .cloned()
            .unwrap_or(Value::Null),
        products,
        summary: string_field(&value, &["summary"]).unwrap_or_default(),
        business_impact: string_field(&value, &["business_impact"]).unwrap_or_default(),
        method: AnalysisMethod::Llm,
    })
}

/// Shared last step of both classification paths.
pub fn finalize(draft: Draft, item: &CrawledItem, source: &Source) -> AnalyzedItem {
    let text = format!("{}\n{}", item.title, item.content);
    let stage = if draft.stage.is_empty() {
        heuristics::detect_stage(&text)
    } else {
        normalize_stage(&draft.stage)
    };
    let age_bracket = if draft.age_bracket.is_empty() {
        heuristics::detect_age_bracket(&text)
    } else {
        normalize_age_bracket(&draft.age_bracket)
    };

    let jurisdiction = resolve_canonical_jurisdiction(&JurisdictionSignals {
        hint_country: draft.country_hint.as_deref(),
        hint_state: draft.state_hint.as_deref(),
        text: &text,
        source_country: source.jurisdiction_country.as_deref(),
        source_state: source.jurisdiction_state.as_deref(),
        url: &item.url,
    });

    let scores = derive_scores(&ScoreInput {
        is_relevant: draft.is_relevant,
        stage,
        age_bracket,
        text: &text,
        impact: draft.impact,
        confidence: draft.confidence,
    });

    let summary = if draft.summary.is_empty() {
        generate_summary_from_content(&item.title, &item.content, &jurisdiction.country)
    } else {
        draft.summary
    };

    let business_impact = if !draft.business_impact.is_empty() || !draft.is_relevant {
        draft.business_impact
    } else {
        let affected = if draft.products.is_empty() {
            "online services".to_string()
        } else {
            draft.products.join(", ")
        };
        format!(
            "May require changes to {} for minors in {} ({}).",
            affected, jurisdiction.country, stage
        )
    };

    AnalyzedItem {
        is_relevant: draft.is_relevant,
        stage,
        age_bracket,
        scores,
        products: draft.products,
        summary,
        business_impact,
        is_under16: age_bracket.includes_under16() || is_under16_related(&text),
        reliability_tier: source.reliability_tier,
        method: draft.method,
        analyzed_at: Utc::now(),
        jurisdiction,
        item: item.clone(),
    }
}

/// Classifier client plus its authentication latch.
pub struct Analyzer {
    client: reqwest::Client,
    config: AnalysisConfig,
    enabled: bool,
    auth_failed: AtomicBool,
}

impl Analyzer {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let has_key = config.api_key.as_deref().is_some_and(|k| !k.is_empty());
        if config.is_enabled() && !has_key {
            warn!(
                provider = %config.provider,
                env = %config.api_key_env,
                "classifier API key not set, using heuristics only"
            );
        }
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            config: config.clone(),
            enabled: config.is_enabled() && has_key,
            auth_failed: AtomicBool::new(false),
        })
    }

    /// Whether calls skip the endpoint entirely.
    pub fn is_disabled(&self) -> bool {
        !self.enabled || self.auth_failed.load(Ordering::Relaxed)
    }

    pub fn auth_latched(&self) -> bool {
        self.auth_failed.load(Ordering::Relaxed)
    }

    /// Re-enable the endpoint after credentials have been fixed.
    pub fn reset_auth_latch(&self) {
        self.auth_failed.store(false, Ordering::Relaxed);
    }

    /// Classify one item. Never fails; falls back to heuristics.
    pub async fn analyze(&self, item: &CrawledItem, source: &Source) -> AnalyzedItem {
        let draft = if self.is_disabled() {
            Draft::heuristic(item)
        } else {
            match self.classify(item, source).await {
                Ok(draft) => draft,
                Err(e) => {
                    debug!(url = %item.url, error = %e, "classifier unavailable, using heuristics");
                    Draft::heuristic(item)
                }
            }
        };
        finalize(draft, item, source)
    }

    fn user_prompt(item: &CrawledItem, source: &Source) -> String {
        format!(
            "Title: {}\nURL: {}\nSource: {} ({})\nContent:\n{}",
            item.title,
            item.url,
            source.name,
            source.jurisdiction_country.as_deref().unwrap_or("unspecified"),
            truncate_chars(&item.content, PROMPT_CONTENT_CHARS)
        )
    }

    fn request_body(&self, prompt: &str) -> Value {
        let model = self.config.model.as_deref().unwrap_or_default();
        match self.config.provider.as_str() {
            "anthropic" => json!({
                "model": model,
                "max_tokens": 1024,
                "system": SYSTEM_PROMPT,
                "messages": [{"role": "user", "content": prompt}],
            }),
            _ => json!({
                "model": model,
                "temperature": 0,
                "response_format": {"type": "json_object"},
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": prompt},
                ],
            }),
        }
    }

    fn response_text(&self, body: &Value) -> Option<String> {
        match self.config.provider.as_str() {
            "anthropic" => {
                let parts: Vec<&str> = body
                    .get("content")?
                    .as_array()?
                    .iter()
                    .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect();
                (!parts.is_empty()).then(|| parts.join(""))
            }
            _ => body
                .get("choices")?
                .get(0)?
                .get("message")?
                .get("content")?
                .as_str()
                .map(|s| s.to_string()),
        }
    }

    async fn request_once(&self, body: &Value) -> Result<String, ClassifyError> {
        let key = self.config.api_key.as_deref().unwrap_or_default();
        let mut request = self
            .client
            .post(self.config.resolved_endpoint())
            .header("Content-Type", "application/json")
            .json(body);
        request = match self.config.provider.as_str() {
            "anthropic" => request
                .header("x-api-key", key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            _ => request.header("Authorization", format!("Bearer {}", key)),
        };

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let call = async {
            let response = request
                .send()
                .await
                .map_err(|e| ClassifyError::Transient(e.to_string()))?;
            let status = response.status().as_u16();
            match status {
                401 | 403 => return Err(ClassifyError::Auth(status)),
                429 | 500..=599 => return Err(ClassifyError::Transient(format!("HTTP {}", status))),
                s if !(200..300).contains(&s) => return Err(ClassifyError::Rejected(s)),
                _ => {}
            }
            let json: Value = response
                .json()
                .await
                .map_err(|e| ClassifyError::Malformed(e.to_string()))?;
            self.response_text(&json)
                .ok_or_else(|| ClassifyError::Malformed("no message content".into()))
        };
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ClassifyError::Transient(format!(
                "timed out after {:?}",
                timeout
            ))),
        }
    }

    /// Call the endpoint with retries and parse its output.
    pub async fn classify(&self, item: &CrawledItem, source: &Source) -> Result<Draft, ClassifyError> {
        let body = self.request_body(&Self::user_prompt(item, source));
        let max_attempts = self.config.max_attempts.max(1);
        let step = Duration::from_millis(self.config.backoff_step_ms);
        let mut attempt = 1;
        loop {
            if self.is_disabled() {
                return Err(ClassifyError::Disabled);
            }
            match self.request_once(&body).await {
                Ok(text) => return parse_classification(&text),
                Err(ClassifyError::Auth(status)) => {
                    if !self.auth_failed.swap(true, Ordering::Relaxed) {
                        warn!(status, "classifier authentication failed, falling back to heuristics for this process");
                    }
                    return Err(ClassifyError::Auth(status));
                }
                Err(e) if e.is_retriable() && attempt < max_attempts => {
                    warn!(url = %item.url, attempt, error = %e, "classifier call failed, retrying");
                    tokio::time::sleep(step * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgeBracket, SourceType, Stage};

    fn source() -> Source {
        Source {
            id: "tx-leg".into(),
            name: "Texas Legislature".into(),
            url: "https://capitol.texas.gov/rss".into(),
            source_type: SourceType::Rss,
            jurisdiction_country: Some("United States".into()),
            jurisdiction_state: Some("Texas".into()),
            reliability_tier: 5,
            search_query: None,
        }
    }

    fn item(title: &str, content: &str) -> CrawledItem {
        CrawledItem {
            url: "https://capitol.texas.gov/bill/1".into(),
            title: title.into(),
            content: content.into(),
            published_at: None,
            source_id: "tx-leg".into(),
        }
    }

    #[test]
    fn test_extract_json_object_variants() {
        assert_eq!(extract_json_object(r#"{"a":1}"#), Some(r#"{"a":1}"#));
        assert_eq!(
            extract_json_object("```json\n{\"a\": {\"b\": 2}}\n```"),
            Some("{\"a\": {\"b\": 2}}")
        );
        assert_eq!(
            extract_json_object(r#"Sure! {"s": "brace } in string \" quote"} trailing {"x":1}"#),
            Some(r#"{"s": "brace } in string \" quote"}"#)
        );
        assert_eq!(extract_json_object("no json here"), None);
        assert_eq!(extract_json_object("{\"unterminated\": 1"), None);
    }

    #[test]
    fn test_parse_classification() {
        let draft = parse_classification(
            r#"Here you go: {"is_relevant": "yes", "jurisdiction_country": "USA",
               "stage": "Signed into law", "age_bracket": "under 16", "impact_score": "4",
               "affected_products": ["Instagram", "instagram", " "], "summary": "S"}"#,
        )
        .unwrap();
        assert!(draft.is_relevant);
        assert_eq!(draft.country_hint.as_deref(), Some("USA"));
        assert_eq!(draft.products, vec!["Instagram"]);
        assert_eq!(draft.method, AnalysisMethod::Llm);

        assert!(matches!(
            parse_classification("{\"stage\": \"enacted\"}"),
            Err(ClassifyError::Malformed(_))
        ));
        assert!(matches!(
            parse_classification("[1, 2]"),
            Err(ClassifyError::Malformed(_))
        ));
    }

    #[test]
    fn test_finalize_llm_draft_normalizes() {
        let draft = parse_classification(
            r#"{"is_relevant": true, "jurisdiction_country": "U.S.A.", "jurisdiction_state": "CA",
                "stage": "In Force", "age_bracket": "13–15", "impact_score": 9, "confidence_score": "3"}"#,
        )
        .unwrap();
        let analyzed = finalize(draft, &item("Bill", "Rules for platforms"), &source());
        assert_eq!(analyzed.stage, Stage::Effective);
        assert_eq!(analyzed.age_bracket, AgeBracket::ThirteenToFifteen);
        assert_eq!(analyzed.jurisdiction.country, "United States");
        assert_eq!(analyzed.jurisdiction.state.as_deref(), Some("California"));
        assert_eq!(analyzed.scores.impact, 5);
        assert_eq!(analyzed.scores.confidence, 3);
        assert_eq!(analyzed.reliability_tier, 5);
        assert!(analyzed.is_under16);
    }

    #[tokio::test]
    async fn test_disabled_analyzer_uses_heuristics() {
        let analyzer = Analyzer::new(&AnalysisConfig::default()).unwrap();
        assert!(analyzer.is_disabled());
        let analyzed = analyzer
            .analyze(
                &item(
                    "Governor signs social media law",
                    "The bill was enacted and requires mandatory age verification; platforms face a fine of $10,000 per violation.",
                ),
                &source(),
            )
            .await;
        assert_eq!(analyzed.method, AnalysisMethod::Heuristic);
        assert!(analyzed.is_relevant);
        assert_eq!(analyzed.stage, Stage::Enacted);
        assert_eq!(analyzed.scores.composite, 5);
        assert_eq!(analyzed.jurisdiction.country, "United States");
        assert_eq!(analyzed.jurisdiction.state.as_deref(), Some("Texas"));
        assert!(!analyzed.summary.is_empty());
    }

    #[tokio::test]
    async fn test_irrelevant_item_floors_scores() {
        let analyzer = Analyzer::new(&AnalysisConfig::default()).unwrap();
        let analyzed = analyzer
            .analyze(
                &item("Budget hearing", "The finance ministry set interest rates."),
                &source(),
            )
            .await;
        assert!(!analyzed.is_relevant);
        assert_eq!(analyzed.scores, crate::models::RiskScores::FLOOR);
        assert!(analyzed.business_impact.is_empty());
    }

    #[test]
    fn test_latch_reset() {
        let mut config = AnalysisConfig::default();
        config.provider = "openai".into();
        config.model = Some("m".into());
        config.api_key = Some("k".into());
        let analyzer = Analyzer::new(&config).unwrap();
        assert!(!analyzer.is_disabled());
        analyzer.auth_failed.store(true, Ordering::Relaxed);
        assert!(analyzer.is_disabled());
        analyzer.reset_auth_latch();
        assert!(!analyzer.is_disabled());
    }
}
