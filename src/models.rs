//! Core data models used throughout regwatch.
//!
//! These types represent the sources, crawled items, and classified items
//! that flow through the crawl → analyze → persist pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol a source is crawled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// RSS 2.0 or Atom feed.
    Rss,
    /// A single HTML (or PDF) page.
    Html,
    /// Paginated search API query.
    SearchApi,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Rss => "rss",
            SourceType::Html => "html",
            SourceType::SearchApi => "search_api",
        }
    }
}

/// Static catalog entry for a crawled source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    #[serde(default)]
    pub jurisdiction_country: Option<String>,
    #[serde(default)]
    pub jurisdiction_state: Option<String>,
    /// Trust ranking, 1 (lowest) to 5 (highest).
    #[serde(default = "default_reliability_tier")]
    pub reliability_tier: u8,
    #[serde(default)]
    pub search_query: Option<String>,
}

fn default_reliability_tier() -> u8 {
    3
}

/// One article or post produced by a crawler. Never persisted directly.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawledItem {
    pub url: String,
    pub title: String,
    pub content: String,
    pub published_at: Option<DateTime<Utc>>,
    pub source_id: String,
}

/// Lifecycle stage of a regulation.
///
/// Declaration order is lifecycle order; heuristic detection uses its own
/// evaluation order (see [`crate::heuristics`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Proposed,
    Introduced,
    CommitteeReview,
    Passed,
    Amended,
    Enacted,
    Effective,
    Withdrawn,
    Rejected,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Proposed,
        Stage::Introduced,
        Stage::CommitteeReview,
        Stage::Passed,
        Stage::Amended,
        Stage::Enacted,
        Stage::Effective,
        Stage::Withdrawn,
        Stage::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Proposed => "proposed",
            Stage::Introduced => "introduced",
            Stage::CommitteeReview => "committee_review",
            Stage::Passed => "passed",
            Stage::Amended => "amended",
            Stage::Enacted => "enacted",
            Stage::Effective => "effective",
            Stage::Withdrawn => "withdrawn",
            Stage::Rejected => "rejected",
        }
    }

    /// Exact parse of the canonical string form.
    pub fn parse(s: &str) -> Option<Stage> {
        Stage::ALL.into_iter().find(|stage| stage.as_str() == s)
    }

    /// Enacted or in force.
    pub fn is_late(&self) -> bool {
        matches!(self, Stage::Enacted | Stage::Effective)
    }

    pub fn is_terminal_negative(&self) -> bool {
        matches!(self, Stage::Withdrawn | Stage::Rejected)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which minors a regulation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgeBracket {
    #[serde(rename = "13-15")]
    ThirteenToFifteen,
    #[serde(rename = "16-18")]
    SixteenToEighteen,
    #[serde(rename = "both")]
    Both,
    #[serde(rename = "unknown")]
    Unknown,
}

impl AgeBracket {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgeBracket::ThirteenToFifteen => "13-15",
            AgeBracket::SixteenToEighteen => "16-18",
            AgeBracket::Both => "both",
            AgeBracket::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<AgeBracket> {
        match s {
            "13-15" => Some(AgeBracket::ThirteenToFifteen),
            "16-18" => Some(AgeBracket::SixteenToEighteen),
            "both" => Some(AgeBracket::Both),
            "unknown" => Some(AgeBracket::Unknown),
            _ => None,
        }
    }

    /// True for brackets that include under-16s.
    pub fn includes_under16(&self) -> bool {
        matches!(self, AgeBracket::ThirteenToFifteen | AgeBracket::Both)
    }
}

impl fmt::Display for AgeBracket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved jurisdiction. `state` is only ever set for the United States.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jurisdiction {
    pub country: String,
    pub state: Option<String>,
}

/// The four derived scores, each an integer in `[1, 5]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskScores {
    pub impact: i64,
    pub likelihood: i64,
    pub confidence: i64,
    pub composite: i64,
}

impl RiskScores {
    /// Scores assigned to non-relevant items.
    pub const FLOOR: RiskScores = RiskScores {
        impact: 1,
        likelihood: 1,
        confidence: 1,
        composite: 1,
    };
}

/// How an item was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisMethod {
    Llm,
    Heuristic,
}

impl AnalysisMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMethod::Llm => "llm",
            AnalysisMethod::Heuristic => "heuristic",
        }
    }
}

/// A crawled item plus its classification.
#[derive(Debug, Clone)]
pub struct AnalyzedItem {
    pub item: CrawledItem,
    pub is_relevant: bool,
    pub jurisdiction: Jurisdiction,
    pub stage: Stage,
    pub age_bracket: AgeBracket,
    pub scores: RiskScores,
    pub products: Vec<String>,
    pub summary: String,
    pub business_impact: String,
    pub is_under16: bool,
    pub reliability_tier: u8,
    pub method: AnalysisMethod,
    pub analyzed_at: DateTime<Utc>,
}

impl AnalyzedItem {
    /// Publication time as unix seconds, as stored.
    pub fn published_at_ts(&self) -> Option<i64> {
        self.item.published_at.map(|t| t.timestamp())
    }
}
