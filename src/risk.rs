//! Risk scoring.
//!
//! Turns a classified item into four integer scores in `[1, 5]`: impact,
//! likelihood, confidence, and a composite urgency score. Keyword floors
//! make sure that bans, fines and mandatory age verification never score
//! as low-urgency regardless of what the classifier said.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::models::{AgeBracket, RiskScores, Stage};

pub const MIN_SCORE: i64 = 1;
pub const MAX_SCORE: i64 = 5;
pub const DEFAULT_IMPACT: i64 = 2;
pub const DEFAULT_CONFIDENCE: i64 = 2;

/// Composite score at or above which an item counts as high risk.
pub const HIGH_RISK_THRESHOLD: i64 = 4;

const SEVERE_PATTERNS: &[&str] = &[
    r"\bban(s|ned|ning)?\b",
    r"\bprohibit(s|ed|ing|ion)?\b",
    r"\bmandatory age verification\b",
    r"\bcriminal(ly)?\b",
    r"\bfines?\b",
    r"\bpenalt(y|ies)\b",
    r"\b(jail|imprisonment)\b",
    r"\benforcement action\b",
];

const MODERATE_PATTERNS: &[&str] = &[
    r"\bage (verification|assurance|estimation)\b",
    r"\bparental (consent|controls?)\b",
    r"\bdesign code\b",
    r"\bduty of care\b",
    r"\brestrict(s|ed|ion|ions)?\b",
    r"\bdefault settings\b",
    r"\bdata minimi[sz]ation\b",
    r"\brisk assessments?\b",
    r"\btransparency reports?\b",
    r"\baudits?\b",
];

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| Regex::new(&format!("(?i){}", p)).ok())
        .collect()
}

static SEVERE: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(SEVERE_PATTERNS));
static MODERATE: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(MODERATE_PATTERNS));

pub fn has_severe_risk(text: &str) -> bool {
    SEVERE.iter().any(|re| re.is_match(text))
}

pub fn has_moderate_risk(text: &str) -> bool {
    MODERATE.iter().any(|re| re.is_match(text))
}

/// Round and clamp a raw score to `[1, 5]`.
///
/// Numbers and numeric strings are accepted; anything else (including NaN
/// and infinities) yields `fallback`, itself clamped.
pub fn clamp_score(raw: &Value, fallback: i64) -> i64 {
    let parsed = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) => clamp_f64(v, fallback),
        None => fallback.clamp(MIN_SCORE, MAX_SCORE),
    }
}

pub fn clamp_f64(raw: f64, fallback: i64) -> i64 {
    if !raw.is_finite() {
        return fallback.clamp(MIN_SCORE, MAX_SCORE);
    }
    (raw.round() as i64).clamp(MIN_SCORE, MAX_SCORE)
}

/// Baseline likelihood of a regulation taking effect, by stage.
pub fn baseline_likelihood(stage: Stage) -> i64 {
    match stage {
        Stage::Proposed | Stage::Introduced => 2,
        Stage::CommitteeReview | Stage::Passed | Stage::Amended => 3,
        Stage::Enacted | Stage::Effective => 4,
        Stage::Withdrawn | Stage::Rejected => 1,
    }
}

/// Signals that can raise the composite score above the impact/likelihood
/// average.
#[derive(Debug, Clone, Copy)]
pub struct CompositeSignals {
    pub severe: bool,
    pub stage: Stage,
    pub age_bracket: AgeBracket,
}

pub fn composite_score(impact: i64, likelihood: i64, signals: &CompositeSignals) -> i64 {
    let mut composite = clamp_f64((impact + likelihood) as f64 / 2.0, MIN_SCORE);
    let late = signals.stage.is_late();
    if signals.severe && late {
        composite = composite.max(5);
    }
    if signals.severe || (late && signals.age_bracket.includes_under16()) {
        composite = composite.max(4);
    }
    composite.clamp(MIN_SCORE, MAX_SCORE)
}

/// Everything the engine needs to score one item.
#[derive(Debug, Clone)]
pub struct ScoreInput<'a> {
    pub is_relevant: bool,
    pub stage: Stage,
    pub age_bracket: AgeBracket,
    pub text: &'a str,
    /// Classifier-provided impact, `Value::Null` when absent.
    pub impact: Value,
    /// Classifier-provided confidence, `Value::Null` when absent.
    pub confidence: Value,
}

pub fn derive_scores(input: &ScoreInput<'_>) -> RiskScores {
    if !input.is_relevant {
        return RiskScores::FLOOR;
    }

    let severe = has_severe_risk(input.text);
    let moderate = has_moderate_risk(input.text);

    let mut likelihood = baseline_likelihood(input.stage);
    let mut impact = clamp_score(&input.impact, DEFAULT_IMPACT);
    if input.age_bracket.includes_under16() {
        impact = (impact + 1).min(MAX_SCORE);
    }
    if moderate {
        impact = impact.max(3);
    }
    if severe {
        impact = impact.max(4);
        likelihood = likelihood.max(4);
    }

    let composite = composite_score(
        impact,
        likelihood,
        &CompositeSignals {
            severe,
            stage: input.stage,
            age_bracket: input.age_bracket,
        },
    );

    RiskScores {
        impact: clamp_f64(impact as f64, DEFAULT_IMPACT),
        likelihood: clamp_f64(likelihood as f64, MIN_SCORE),
        confidence: clamp_score(&input.confidence, DEFAULT_CONFIDENCE),
        composite,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(text: &str, stage: Stage, age: AgeBracket) -> ScoreInput<'_> {
        ScoreInput {
            is_relevant: true,
            stage,
            age_bracket: age,
            text,
            impact: Value::Null,
            confidence: Value::Null,
        }
    }

    #[test]
    fn test_clamp_score_arbitrary_inputs() {
        let raws = [
            json!(0),
            json!(-42),
            json!(3.4999),
            json!(3.5),
            json!(1e12),
            json!("4"),
            json!(" 2.6 "),
            json!("high"),
            json!(null),
            json!(true),
            json!([5]),
            json!({"score": 5}),
        ];
        for raw in &raws {
            let s = clamp_score(raw, 3);
            assert!((1..=5).contains(&s), "{:?} -> {}", raw, s);
        }
        assert_eq!(clamp_score(&json!(3.5), 1), 4);
        assert_eq!(clamp_score(&json!("2.6"), 1), 3);
        assert_eq!(clamp_score(&json!("high"), 3), 3);
        assert_eq!(clamp_score(&json!(99), 1), 5);
        assert_eq!(clamp_score(&json!(null), 42), 5);
    }

    #[test]
    fn test_clamp_f64_non_finite() {
        assert_eq!(clamp_f64(f64::NAN, 2), 2);
        assert_eq!(clamp_f64(f64::INFINITY, 2), 2);
        assert_eq!(clamp_f64(f64::NEG_INFINITY, -7), 1);
    }

    #[test]
    fn test_non_relevant_items_floor() {
        let mut i = input("A total ban with fines", Stage::Enacted, AgeBracket::Both);
        i.is_relevant = false;
        i.impact = json!(5);
        assert_eq!(derive_scores(&i), RiskScores::FLOOR);
    }

    #[test]
    fn test_baseline_by_stage() {
        let s = derive_scores(&input("Consultation opens", Stage::Proposed, AgeBracket::Unknown));
        assert_eq!(s.likelihood, 2);
        assert_eq!(s.impact, DEFAULT_IMPACT);
        assert_eq!(s.composite, 2);

        let s = derive_scores(&input("Bill dropped", Stage::Withdrawn, AgeBracket::Unknown));
        assert_eq!(s.likelihood, 1);
    }

    #[test]
    fn test_under16_bracket_bumps_impact() {
        let s = derive_scores(&input("New rules", Stage::Proposed, AgeBracket::ThirteenToFifteen));
        assert_eq!(s.impact, DEFAULT_IMPACT + 1);
        let s = derive_scores(&input("New rules", Stage::Proposed, AgeBracket::SixteenToEighteen));
        assert_eq!(s.impact, DEFAULT_IMPACT);
    }

    #[test]
    fn test_moderate_keyword_floors_impact() {
        let s = derive_scores(&input(
            "Parental consent required for new accounts",
            Stage::Proposed,
            AgeBracket::Unknown,
        ));
        assert_eq!(s.impact, 3);
    }

    #[test]
    fn test_severe_keyword_floors() {
        let s = derive_scores(&input(
            "Platforms face a ban for under-16 users",
            Stage::Proposed,
            AgeBracket::Unknown,
        ));
        assert_eq!(s.impact, 4);
        assert_eq!(s.likelihood, 4);
        assert_eq!(s.composite, 4);
    }

    #[test]
    fn test_severe_and_late_stage_is_max() {
        let text = "Law enacted: mandatory age verification, with a fine of up to $50,000 per violation";
        let s = derive_scores(&input(text, Stage::Enacted, AgeBracket::Unknown));
        assert_eq!(s.composite, 5);
    }

    #[test]
    fn test_late_stage_under16_floor() {
        let s = derive_scores(&input("Rules adopted", Stage::Effective, AgeBracket::Both));
        assert!(s.composite >= 4);
    }

    #[test]
    fn test_confidence_passes_through_with_clamp() {
        let mut i = input("New rules", Stage::Proposed, AgeBracket::Unknown);
        i.confidence = json!(7);
        assert_eq!(derive_scores(&i).confidence, 5);
        i.confidence = json!("0.2");
        assert_eq!(derive_scores(&i).confidence, 1);
    }

    #[test]
    fn test_scores_always_in_range() {
        let texts = ["", "ban", "audit", "criminal penalties and parental consent"];
        let raws = [json!(-10), json!(10), json!("x"), json!(null), json!(2.5)];
        for stage in Stage::ALL {
            for age in [
                AgeBracket::ThirteenToFifteen,
                AgeBracket::SixteenToEighteen,
                AgeBracket::Both,
                AgeBracket::Unknown,
            ] {
                for text in texts {
                    for raw in &raws {
                        let mut i = input(text, stage, age);
                        i.impact = raw.clone();
                        i.confidence = raw.clone();
                        let s = derive_scores(&i);
                        for v in [s.impact, s.likelihood, s.confidence, s.composite] {
                            assert!((1..=5).contains(&v));
                        }
                    }
                }
            }
        }
    }
}
