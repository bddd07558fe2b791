//! Deterministic fallback classifier.
//!
//! Used whenever the classification endpoint is disabled, unreachable, or
//! returns something unparseable. Every decision is an ordered table of
//! `(outcome, pattern)` rules evaluated top to bottom; the first hit wins.
//! Keeping the tables as data makes precedence explicit: for stages,
//! withdrawal and rejection are checked before enactment so that
//! "bill enacted last year was withdrawn" classifies as withdrawn.

use regex::Regex;
use std::sync::LazyLock;

use crate::models::{AgeBracket, Stage};
use crate::risk;

/// Stage rules in evaluation order.
const STAGE_RULES: &[(Stage, &str)] = &[
    (
        Stage::Withdrawn,
        r"\b(withdr[ae]wn?|withdraws|shelved|scrapped|abandon(s|ed)|pulled the bill)\b",
    ),
    (
        Stage::Rejected,
        r"\b(reject(s|ed)|veto(es|ed)|voted down|defeated|struck down|fail(s|ed) to pass)\b",
    ),
    (
        Stage::Effective,
        r"\b(takes effect|took effect|goes into effect|went into effect|comes? into (force|effect)|came into (force|effect)|in force|now in effect|effective (date|from|on|immediately))\b",
    ),
    (
        Stage::Enacted,
        r"\b(enact(s|ed|ment)|signed into law|signs? .{0,40}into law|royal assent|becomes law|became law|gazetted)\b",
    ),
    (
        Stage::Passed,
        r"\b(passe[sd]|approved by (the )?(senate|house|parliament|assembly|legislature)|third reading|final vote)\b",
    ),
    (Stage::Amended, r"\b(amend(s|ed|ment|ments)?)\b"),
    (
        Stage::CommitteeReview,
        r"\b(committees?|hearings?|markup|second reading|scrutiny)\b",
    ),
    (
        Stage::Introduced,
        r"\b(introduc(e|es|ed|tion)|filed|tabled|first reading|sponsor(s|ed)?)\b",
    ),
    (
        Stage::Proposed,
        r"\b(propos(e|es|ed|al|als)|draft|consultation|plans? to|considering|calls? for)\b",
    ),
];

/// Explicit signals for the younger bracket (anything under 16).
const UNDER16_PATTERNS: &[&str] = &[
    r"\b(under|below|younger than)[ -]?(13|14|15|16)s?\b",
    r"\bu-?16\b",
    r"\b(13|14|15)[ -]?(years?[ -]olds?|years? of age|yo)\b",
    r"\bages? 13 ?(-|–|to) ?15\b",
    r"\b13 ?(-|–) ?15\b",
];

/// Explicit signals for the older bracket.
const OLDER_MINOR_PATTERNS: &[&str] = &[
    r"\b(16|17) ?(-|–|to|and|or) ?18\b",
    r"\b(under|below)[ -]?18s?\b",
    r"\b(16|17)[ -]?(years?[ -]olds?|years? of age)\b",
    r"\bteen(s|agers?|age)?\b",
    r"\byouths?\b",
    r"\badolescen(ts?|ce)\b",
];

/// Generic minor language without an explicit age.
const GENERIC_MINOR_PATTERNS: &[&str] = &[
    r"\bminors?\b",
    r"\bchild(ren|ren's)?\b",
    r"\bkids?\b",
    r"\byoung (people|users|persons)\b",
];

/// Tracked products and the keywords that indicate them.
const PRODUCT_RULES: &[(&str, &str)] = &[
    ("Instagram", r"\binstagram\b"),
    ("Facebook", r"\bfacebook\b"),
    ("WhatsApp", r"\bwhats ?app\b"),
    ("Messenger", r"\bmessenger\b"),
    ("Threads", r"\b(threads app|meta threads|threads\.net)\b"),
    (
        "Meta Quest",
        r"\b(meta quest|quest (2|3|pro)|virtual reality|vr headsets?)\b",
    ),
    (
        "Meta AI",
        r"\b(meta ai|ai (chatbots?|companions?)|chatbots?)\b",
    ),
];

const PLATFORM_PATTERN: &str = r"\b(online platforms?|digital platforms?|video[- ]sharing platforms?|social networks?|social networking|online services?|app stores?|(mobile|messaging|social) apps?|meta platforms|tiktok|snapchat|youtube|twitter|discord|roblox)\b";
const SOCIAL_MEDIA_PATTERN: &str = r"\bsocial[ -]media\b";

fn ci(pattern: &str) -> Option<Regex> {
    Regex::new(&format!("(?i){}", pattern)).ok()
}

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| ci(p)).collect()
}

static STAGES: LazyLock<Vec<(Stage, Regex)>> = LazyLock::new(|| {
    STAGE_RULES
        .iter()
        .filter_map(|(stage, p)| ci(p).map(|re| (*stage, re)))
        .collect()
});
static UNDER16: LazyLock<Vec<Regex>> = LazyLock::new(|| compile_all(UNDER16_PATTERNS));
static OLDER_MINOR: LazyLock<Vec<Regex>> = LazyLock::new(|| compile_all(OLDER_MINOR_PATTERNS));
static GENERIC_MINOR: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile_all(GENERIC_MINOR_PATTERNS));
static PRODUCTS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    PRODUCT_RULES
        .iter()
        .filter_map(|(name, p)| ci(p).map(|re| (*name, re)))
        .collect()
});
static PLATFORM: LazyLock<Option<Regex>> = LazyLock::new(|| ci(PLATFORM_PATTERN));
static SOCIAL_MEDIA: LazyLock<Option<Regex>> = LazyLock::new(|| ci(SOCIAL_MEDIA_PATTERN));

fn any_match(rules: &[Regex], text: &str) -> bool {
    rules.iter().any(|re| re.is_match(text))
}

/// First matching stage in rule order; `Proposed` when nothing matches.
pub fn detect_stage(text: &str) -> Stage {
    STAGES
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(stage, _)| *stage)
        .unwrap_or(Stage::Proposed)
}

pub fn detect_age_bracket(text: &str) -> AgeBracket {
    let young = any_match(&UNDER16, text);
    let older = any_match(&OLDER_MINOR, text);
    match (young, older) {
        (true, true) => AgeBracket::Both,
        (true, false) => AgeBracket::ThirteenToFifteen,
        (false, true) => AgeBracket::SixteenToEighteen,
        (false, false) if any_match(&GENERIC_MINOR, text) => AgeBracket::Both,
        (false, false) => AgeBracket::Unknown,
    }
}

/// Tracked products mentioned in `text`, in table order, without duplicates.
pub fn detect_products(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for (name, re) in PRODUCTS.iter() {
        if re.is_match(text) && !found.iter().any(|p| p == name) {
            found.push((*name).to_string());
        }
    }
    found
}

pub fn mentions_platform(text: &str) -> bool {
    PLATFORM.as_ref().is_some_and(|re| re.is_match(text))
}

pub fn mentions_social_media(text: &str) -> bool {
    SOCIAL_MEDIA.as_ref().is_some_and(|re| re.is_match(text))
}

/// Result of running the fallback classifier over one item.
#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicVerdict {
    pub is_relevant: bool,
    pub stage: Stage,
    pub age_bracket: AgeBracket,
    pub products: Vec<String>,
}

pub fn classify(title: &str, content: &str) -> HeuristicVerdict {
    let text = format!("{}\n{}", title, content);
    let stage = detect_stage(&text);
    let age_bracket = detect_age_bracket(&text);
    let products = detect_products(&text);

    let is_relevant = mentions_platform(&text)
        || mentions_social_media(&text)
        || risk::has_moderate_risk(&text)
        || risk::has_severe_risk(&text)
        || age_bracket != AgeBracket::Unknown
        || !products.is_empty();

    HeuristicVerdict {
        is_relevant,
        stage,
        age_bracket,
        products,
    }
}

/// Ordered substring remaps for free-text stage labels.
const STAGE_ALIASES: &[(&str, Stage)] = &[
    ("withdr", Stage::Withdrawn),
    ("reject", Stage::Rejected),
    ("veto", Stage::Rejected),
    ("fail", Stage::Rejected),
    ("in force", Stage::Effective),
    ("in_force", Stage::Effective),
    ("effect", Stage::Effective),
    ("enact", Stage::Enacted),
    ("signed", Stage::Enacted),
    ("law", Stage::Enacted),
    ("committee", Stage::CommitteeReview),
    ("review", Stage::CommitteeReview),
    ("hearing", Stage::CommitteeReview),
    ("pass", Stage::Passed),
    ("amend", Stage::Amended),
    ("introduc", Stage::Introduced),
    ("filed", Stage::Introduced),
    ("propos", Stage::Proposed),
    ("draft", Stage::Proposed),
    ("consult", Stage::Proposed),
];

/// Map a free-text stage label (e.g. from the classifier) onto [`Stage`].
pub fn normalize_stage(raw: &str) -> Stage {
    let lowered = raw.trim().to_lowercase();
    let snake: String = lowered
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if let Some(stage) = Stage::parse(&snake) {
        return stage;
    }
    STAGE_ALIASES
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, stage)| *stage)
        .unwrap_or_else(|| detect_stage(&lowered))
}

/// Map a free-text age label onto [`AgeBracket`].
pub fn normalize_age_bracket(raw: &str) -> AgeBracket {
    let lowered = raw.trim().to_lowercase().replace('–', "-");
    let compact: String = lowered.chars().filter(|c| !c.is_whitespace()).collect();
    if let Some(bracket) = AgeBracket::parse(&compact) {
        return bracket;
    }
    match compact.as_str() {
        "13to15" | "under16" | "u16" | "under-16" | "13-16" => AgeBracket::ThirteenToFifteen,
        "16to18" | "16-17" | "under18" | "16+" => AgeBracket::SixteenToEighteen,
        "all" | "allminors" | "13-18" | "under13-18" | "minors" => AgeBracket::Both,
        "" | "none" | "n/a" | "na" | "null" => AgeBracket::Unknown,
        _ => detect_age_bracket(&lowered),
    }
}
