//! Text sanitization and garbage detection.
//!
//! Scraped pages routinely leak analytics loaders, consent-banner stubs and
//! CSS into extracted text. This module turns such text back into prose,
//! decides whether a string is still noise, and regenerates summaries from
//! raw content when it is. It is used inline by the pipeline (before every
//! write) and in batch by [`crate::cleanup`].

use regex::{Captures, Regex};
use std::sync::LazyLock;

use crate::models::AnalyzedItem;

const SUMMARY_BUDGET_CHARS: usize = 400;
const MIN_SENTENCE_CHARS: usize = 30;
const DENSITY_WINDOW_CHARS: usize = 200;

fn re(pattern: &str) -> Option<Regex> {
    Regex::new(pattern).ok()
}

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| re(p)).collect()
}

// ============ clean_text ============

/// Script and analytics boilerplate, removed before any tag stripping.
const BOILERPLATE_PATTERNS: &[&str] = &[
    r"(?is)<script\b.*?</script\s*>",
    r"(?is)<noscript\b.*?</noscript\s*>",
    r"(?s)<!--.*?-->",
    r"(?is)\(function\s*\(\s*w\s*,\s*d\s*,\s*s\s*,\s*l\s*,\s*i\s*\)\s*\{.*?\}\s*\)\s*\([^)]*\)\s*;?",
    r"(?i)window\.dataLayer\s*=\s*window\.dataLayer\s*\|\|\s*\[\s*\]\s*;?",
    r"(?i)function\s+gtag\s*\(\s*\)\s*\{[^}]*\}\s*;?",
    r"(?i)\bgtag\s*\((?:[^()]|\([^()]*\))*\)\s*;?",
    r"(?i)\bdataLayer\.push\s*\((?:[^()]|\([^()]*\))*\)\s*;?",
    r"(?i)\bfbq\s*\((?:[^()]|\([^()]*\))*\)\s*;?",
    r"(?i)\b(we use cookies|this (web)?site uses cookies)[^.]*\.",
    r"(?i)\baccept (all )?cookies\b",
    r"(?i)\bskip to (main )?content\b",
];

/// Markup and styling, removed after the boilerplate pass.
const MARKUP_PATTERNS: &[(&str, &str)] = &[
    (r"(?is)<style\b.*?</style\s*>", " "),
    (r"(?is)<nav\b.*?</nav\s*>", " "),
    (r"(?is)<footer\b.*?</footer\s*>", " "),
    (r"(?is)<header\b.*?</header\s*>", " "),
    (r#"(?i)\sstyle\s*=\s*("[^"]*"|'[^']*')"#, ""),
    (
        r"(?i)(?:[.#][A-Za-z][\w-]*|\b(?:body|html|div|span|p|a|img|ul|li)\b)\s*\{[^{}]*\}",
        " ",
    ),
    (r"!\[[^\]]*\]\([^)]*\)", " "),
    (r"\[([^\]]*)\]\([^)]*\)", "$1"),
    (r"</?[A-Za-z!][^<>]*>", " "),
];

static BOILERPLATE: LazyLock<Vec<Regex>> = LazyLock::new(|| compile_all(BOILERPLATE_PATTERNS));
static MARKUP: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    MARKUP_PATTERNS
        .iter()
        .filter_map(|(p, rep)| re(p).map(|r| (r, *rep)))
        .collect()
});
static ENTITY: LazyLock<Option<Regex>> =
    LazyLock::new(|| re(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});"));
static WHITESPACE: LazyLock<Option<Regex>> = LazyLock::new(|| re(r"\s+"));

const NAMED_ENTITIES: &[(&str, &str)] = &[
    ("amp", "&"),
    ("lt", "<"),
    ("gt", ">"),
    ("quot", "\""),
    ("apos", "'"),
    ("nbsp", " "),
    ("ndash", "–"),
    ("mdash", "—"),
    ("hellip", "…"),
    ("lsquo", "‘"),
    ("rsquo", "’"),
    ("ldquo", "“"),
    ("rdquo", "”"),
    ("copy", "©"),
    ("reg", "®"),
    ("trade", "™"),
    ("euro", "€"),
    ("pound", "£"),
];

const LEADING_ARTIFACTS: &[char] = &[
    '|', '-', '–', '—', ':', ';', ',', '.', '•', '·', '>', '*', '#', '»', '/',
];

fn decode_entity(caps: &Captures<'_>) -> String {
    let whole = &caps[0];
    let body = &caps[1];
    let decoded = if let Some(hex) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
        u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
    } else if let Some(dec) = body.strip_prefix('#') {
        dec.parse::<u32>().ok().and_then(char::from_u32)
    } else {
        return NAMED_ENTITIES
            .iter()
            .find(|(name, _)| *name == body)
            .map(|(_, v)| (*v).to_string())
            .unwrap_or_else(|| whole.to_string());
    };
    decoded
        .map(|c| c.to_string())
        .unwrap_or_else(|| whole.to_string())
}

fn clean_once(input: &str) -> String {
    let mut text = input.to_string();
    for rule in BOILERPLATE.iter() {
        text = rule.replace_all(&text, " ").into_owned();
    }
    for (rule, replacement) in MARKUP.iter() {
        text = rule.replace_all(&text, *replacement).into_owned();
    }
    if let Some(entity) = ENTITY.as_ref() {
        text = entity.replace_all(&text, decode_entity).into_owned();
    }
    if let Some(ws) = WHITESPACE.as_ref() {
        text = ws.replace_all(&text, " ").into_owned();
    }
    text.trim()
        .trim_start_matches(|c: char| c.is_whitespace() || LEADING_ARTIFACTS.contains(&c))
        .trim()
        .to_string()
}

/// Strip boilerplate, markup and entities, then collapse whitespace.
///
/// Passes are repeated until the output stops changing, so cleaning an
/// already-clean string returns it unchanged. Every pass that changes the
/// text also shortens it, which bounds the loop by the input length.
pub fn clean_text(input: &str) -> String {
    let mut current = clean_once(input);
    for _ in 0..input.len() {
        let next = clean_once(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

// ============ is_garbage_text ============

/// Substrings that make a string garbage on their own.
const EGREGIOUS_MARKERS: &[&str] = &[
    "googletagmanager",
    "gtag(",
    "window.datalayer",
    "datalayer.push",
    "\"@context\"",
    "application/ld+json",
    "__next_data__",
    "onetrust",
    "cookielaw.org",
    "fbq(",
    "_satellite",
    "adsbygoogle",
];

/// Ordered `(name, pattern)` rules; any single hit is sufficient.
const GARBAGE_RULES: &[(&str, &str)] = &[
    ("js_function", r"\bfunction\s*\w*\s*\([^)]*\)\s*\{"),
    ("js_declaration", r"\b(var|let|const)\s+[A-Za-z_$][\w$]*\s*="),
    ("arrow_function", r"=>\s*\{"),
    ("css_rule", r"[\w-]+\s*\{\s*[\w-]+\s*:\s*[^;{}]+;"),
    ("json_blob", r#"^\s*[\[{]\s*""#),
    (
        "html_markup",
        r"(?i)<\s*/?\s*(div|span|script|style|iframe|meta|link|noscript)\b",
    ),
    (
        "cookie_banner",
        r"(?i)\b(accept (all )?cookies|cookie (settings|preferences)|we use cookies)\b",
    ),
    (
        "javascript_required",
        r"(?i)\b((enable|turn on) javascript|javascript (is )?(required|disabled))\b",
    ),
    (
        "browser_notice",
        r"(?i)\byour browser (is )?(not supported|out of date|outdated)\b",
    ),
    (
        "error_page",
        r"(?i)\b(access denied|403 forbidden|404 not found|page not found)\b",
    ),
    (
        "bot_challenge",
        r"(?i)\b(captcha|verify you are (a )?human|checking your browser)\b",
    ),
    ("bare_url", r"^\s*https?://\S+\s*$"),
];

const SPECIAL_CHARS: &[char] = &[
    '{', '}', '[', ']', '(', ')', ';', '=', '<', '>', '|', '\\', '/', '$', '_', '*', '&', '^',
    '%', '#', '@', '~', '`',
];

static GARBAGE: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    GARBAGE_RULES
        .iter()
        .filter_map(|(name, p)| re(p).map(|r| (*name, r)))
        .collect()
});

/// Name of the first garbage rule that matches, if any.
pub fn garbage_rule(text: &str) -> Option<&'static str> {
    GARBAGE
        .iter()
        .find(|(_, rule)| rule.is_match(text))
        .map(|(name, _)| *name)
}

fn is_real_word(token: &str) -> bool {
    let word = token.trim_matches(|c: char| !c.is_alphanumeric());
    let len = word.chars().count();
    (2..=20).contains(&len)
        && word.chars().all(|c| c.is_alphabetic() || c == '\'' || c == '-')
        && word
            .chars()
            .any(|c| matches!(c.to_ascii_lowercase(), 'a' | 'e' | 'i' | 'o' | 'u' | 'y'))
}

fn low_word_density(text: &str) -> bool {
    let window: String = text.chars().take(DENSITY_WINDOW_CHARS).collect();
    let tokens: Vec<&str> = window.split_whitespace().collect();
    if tokens.len() < 5 {
        return false;
    }
    let real = tokens.iter().filter(|t| is_real_word(t)).count();
    (real as f64) / (tokens.len() as f64) < 0.4
}

fn high_special_ratio(text: &str) -> bool {
    let letters = text.chars().filter(|c| c.is_alphabetic()).count();
    let specials = text.chars().filter(|c| SPECIAL_CHARS.contains(c)).count();
    if letters == 0 {
        return specials > 0;
    }
    (specials as f64) / (letters as f64) > 0.25
}

/// Whether `text` is scraped noise rather than prose.
pub fn is_garbage_text(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lowered = trimmed.to_lowercase();
    if EGREGIOUS_MARKERS.iter().any(|m| lowered.contains(m)) {
        return true;
    }
    if garbage_rule(trimmed).is_some() {
        return true;
    }
    low_word_density(trimmed) || high_special_ratio(trimmed)
}

// ============ summaries ============

struct CannedSummary {
    trigger: &'static str,
    /// Only fire when topical online context co-occurs.
    needs_online_context: bool,
    summary: &'static str,
}

const CANNED_SUMMARIES: &[CannedSummary] = &[
    CannedSummary {
        trigger: r"(?i)\b(coppa|children'?s online privacy protection)\b",
        needs_online_context: false,
        summary: "Update on the Children's Online Privacy Protection Act (COPPA), which limits how online services collect and use personal data from children under 13.",
    },
    CannedSummary {
        trigger: r"(?i)\b(kosa|kids online safety act)\b",
        needs_online_context: false,
        summary: "Update on the Kids Online Safety Act (KOSA), which would impose a duty of care and default safety settings on platforms used by minors.",
    },
    CannedSummary {
        trigger: r"(?i)\bonline safety act\b",
        needs_online_context: false,
        summary: "Update on Online Safety Act obligations, including risk assessments and child-safety duties for user-to-user and search services.",
    },
    CannedSummary {
        trigger: r"(?i)\bage[ -]appropriate design code\b",
        needs_online_context: false,
        summary: "Update on an age-appropriate design code requiring high-privacy defaults and data minimisation for services likely to be accessed by children.",
    },
    CannedSummary {
        trigger: r"(?i)\bdigital services act\b|(?-i:\bDSA\b)",
        needs_online_context: false,
        summary: "Update on Digital Services Act obligations for online platforms, including protections for minors and restrictions on profiling-based advertising.",
    },
    CannedSummary {
        trigger: r"(?i)\bsocial media (minimum age|age limits?|ban)\b",
        needs_online_context: false,
        summary: "Update on a proposed or enacted minimum age for social media accounts, with age verification obligations for platforms.",
    },
    CannedSummary {
        trigger: r"(?i)\bunder[ -]?16s?\b",
        needs_online_context: true,
        summary: "Update on measures restricting online services for users under 16, including account and age-assurance requirements.",
    },
];

const ONLINE_CONTEXT: &str =
    r"(?i)\b(social media|online|internet|platforms?|apps?|digital|accounts?)\b";
const SPORTS_CONTEXT: &str = r"(?i)\b(football|soccer|rugby|cricket|hockey|basketball|netball|squad|tournament|championship|league|fixtures?|matches|cup|coach(es)?|goals?)\b";

static CANNED: LazyLock<Vec<(Regex, &'static CannedSummary)>> = LazyLock::new(|| {
    CANNED_SUMMARIES
        .iter()
        .filter_map(|c| re(c.trigger).map(|r| (r, c)))
        .collect()
});
static ONLINE: LazyLock<Option<Regex>> = LazyLock::new(|| re(ONLINE_CONTEXT));
static SPORTS: LazyLock<Option<Regex>> = LazyLock::new(|| re(SPORTS_CONTEXT));

fn has_online_context(text: &str) -> bool {
    ONLINE.as_ref().is_some_and(|r| r.is_match(text))
}

fn has_sports_context(text: &str) -> bool {
    SPORTS.as_ref().is_some_and(|r| r.is_match(text))
}

fn canned_summary(text: &str) -> Option<&'static str> {
    CANNED
        .iter()
        .find(|(trigger, canned)| {
            trigger.is_match(text) && (!canned.needs_online_context || has_online_context(text))
        })
        .map(|(_, canned)| canned.summary)
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some(&(next_i, next)) = chars.peek() {
                if next.is_whitespace() {
                    sentences.push(text[start..next_i].trim());
                    start = next_i;
                }
            } else {
                sentences.push(text[start..i + c.len_utf8()].trim());
                start = text.len();
            }
        }
    }
    if start < text.len() {
        sentences.push(text[start..].trim());
    }
    sentences.into_iter().filter(|s| !s.is_empty()).collect()
}

const NON_PROSE_FRAGMENTS: &[&str] = &["{", "}", "=>", "();", "http://", "https://", "cookie"];

fn is_summary_sentence(sentence: &str) -> bool {
    let lowered = sentence.to_lowercase();
    sentence.chars().count() >= MIN_SENTENCE_CHARS
        && !NON_PROSE_FRAGMENTS.iter().any(|f| lowered.contains(f))
        && !is_garbage_text(sentence)
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", cut.trim_end())
}

fn leading_sentences(content: &str) -> Option<String> {
    let cleaned = clean_text(content);
    let mut summary = String::new();
    for sentence in split_sentences(&cleaned)
        .into_iter()
        .filter(|s| is_summary_sentence(s))
    {
        let needed = if summary.is_empty() {
            sentence.chars().count()
        } else {
            summary.chars().count() + 1 + sentence.chars().count()
        };
        if summary.is_empty() {
            summary = truncate_chars(sentence, SUMMARY_BUDGET_CHARS);
        } else if needed <= SUMMARY_BUDGET_CHARS {
            summary.push(' ');
            summary.push_str(sentence);
        } else {
            break;
        }
    }
    (!summary.is_empty()).then_some(summary)
}

/// Build a readable summary from an item's own text.
///
/// Tries the canned table, then the leading prose sentences of `content`,
/// then a generic template naming the title and jurisdiction.
pub fn generate_summary_from_content(title: &str, content: &str, jurisdiction: &str) -> String {
    let title = clean_text(title);
    let combined = format!("{} {}", title, clean_text(content));
    if let Some(canned) = canned_summary(&combined) {
        return canned.to_string();
    }
    if let Some(sentences) = leading_sentences(content) {
        return sentences;
    }
    if title.is_empty() {
        format!(
            "Regulatory development in {}. See the source for details.",
            jurisdiction
        )
    } else {
        format!(
            "{} ({}). See the source for details.",
            truncate_chars(&title, 200),
            jurisdiction
        )
    }
}

// ============ is_under16_related ============

const UNDER16_SIGNALS: &[&str] = &[
    r"(?i)\bunder[ -]?(13|14|15|16)s?\b",
    r"(?i)\bu-?16\b",
    r"(?i)\b(13|14|15)[ -]years?[ -]olds?\b",
    r"(?i)\b(child|children|kids?|minors?|teens?|teenagers?|young people|youth)\b",
    r"(?i)\bage (verification|assurance|estimation)\b",
    r"(?i)\bparental (consent|controls?)\b",
    r"(?i)\b(coppa|kosa)\b",
    r"(?i)\bage[ -]appropriate design\b",
    r"(?i)\bsocial media (ban|minimum age|age limits?)\b",
];

static UNDER16: LazyLock<Vec<Regex>> = LazyLock::new(|| compile_all(UNDER16_SIGNALS));

/// Whether text concerns under-16s online.
///
/// Sports coverage ("under-16 squad") is suppressed unless online context
/// co-occurs; the suppressor is checked before any topical signal.
pub fn is_under16_related(text: &str) -> bool {
    if has_sports_context(text) && !has_online_context(text) {
        return false;
    }
    UNDER16.iter().any(|r| r.is_match(text))
}

// ============ inline use ============

/// Clean an analyzed item's text fields in place before it is persisted.
pub fn polish(item: &mut AnalyzedItem) {
    let title = clean_text(&item.item.title);
    if !title.is_empty() {
        item.item.title = title;
    }

    let summary = clean_text(&item.summary);
    item.summary = if is_garbage_text(&summary) {
        generate_summary_from_content(
            &item.item.title,
            &item.item.content,
            &item.jurisdiction.country,
        )
    } else {
        summary
    };

    let impact = clean_text(&item.business_impact);
    item.business_impact = if is_garbage_text(&impact) {
        String::new()
    } else {
        impact
    };

    let text = format!("{} {} {}", item.item.title, item.summary, item.item.content);
    item.is_under16 = item.age_bracket.includes_under16() || is_under16_related(&text);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_text_strips_markup_and_entities() {
        let raw = "<div style=\"color:red\"><p>Kids&nbsp;&amp; teens</p><script>var a = 1;</script> &#8220;safe&#x201D;</div>";
        assert_eq!(clean_text(raw), "Kids & teens “safe”");
    }

    #[test]
    fn test_clean_text_markdown_links() {
        let raw = "See ![logo](x.png) the [FTC notice](https://ftc.gov/x) today";
        assert_eq!(clean_text(raw), "See the FTC notice today");
    }

    #[test]
    fn test_clean_text_boilerplate_and_leading_punctuation() {
        let raw = " | — Skip to main content window.dataLayer = window.dataLayer || []; gtag('js', new Date()); Senate passes bill";
        assert_eq!(clean_text(raw), "Senate passes bill");
    }

    #[test]
    fn test_clean_text_is_idempotent() {
        let samples = [
            "plain sentence.",
            "&amp;lt;b&amp;gt;nested&amp;lt;/b&amp;gt; entities",
            "<nav>menu</nav><header>h</header> body <footer>f</footer>",
            "  :: leading junk",
            "<style>.x{color:red}</style>.cls { margin: 0; } text",
        ];
        for s in samples {
            let once = clean_text(s);
            assert_eq!(clean_text(&once), once, "{:?}", s);
        }
    }

    #[test]
    fn test_deeply_nested_entities_fully_decoded() {
        let raw = "Rule &amp;amp;amp;amp;amp;amp;lt;b&amp;gt; notice";
        let once = clean_text(raw);
        assert_eq!(once, "Rule notice");
        assert_eq!(clean_text(&once), once);
    }

    #[test]
    fn test_comparison_signs_are_not_tags() {
        assert_eq!(clean_text("3 < 5 and 6 > 4"), "3 < 5 and 6 > 4");
        assert_eq!(clean_text("3 &lt; 5 and 6 &gt; 4"), "3 < 5 and 6 > 4");
        assert_eq!(clean_text("<!DOCTYPE html><p>Ages 13 to 15</p>"), "Ages 13 to 15");
    }

    #[test]
    fn test_egregious_markers_are_garbage() {
        for marker in [
            "Some prose then googletagmanager.com/gtm.js loaded",
            "The regulator said gtag('config') in a sentence",
            "{\"@context\": \"https://schema.org\"}",
            "OneTrust banner text with normal words in it",
        ] {
            assert!(is_garbage_text(marker), "{}", marker);
        }
    }

    #[test]
    fn test_garbage_rules() {
        assert_eq!(garbage_rule("function init(a) { return a; }"), Some("js_function"));
        assert_eq!(garbage_rule("const x = 5"), Some("js_declaration"));
        assert_eq!(
            garbage_rule("Please enable JavaScript to continue"),
            Some("javascript_required")
        );
        assert_eq!(garbage_rule("https://example.com/page"), Some("bare_url"));
        assert_eq!(garbage_rule("The Senate passed the bill today."), None);
    }

    #[test]
    fn test_density_heuristics() {
        assert!(is_garbage_text("a1b2 x9 0x0f 77 ## $$ q9 z8 12:30"));
        assert!(is_garbage_text("((([[[{{{}}}]]])))=;=;"));
        assert!(is_garbage_text("   "));
        assert!(!is_garbage_text(
            "The Children's Online Privacy Protection Act (COPPA) limits data collection from children."
        ));
    }

    #[test]
    fn test_summary_canned_table() {
        let s = generate_summary_from_content(
            "FTC updates rule",
            "The Children's Online Privacy Protection Act amendments were finalized.",
            "United States",
        );
        assert!(s.contains("COPPA"));
    }

    #[test]
    fn test_summary_under16_sports_guard() {
        let sports = generate_summary_from_content(
            "Under-16 squad named",
            "The under 16 squad plays its first league fixture on Saturday against the county side.",
            "United Kingdom",
        );
        assert!(!sports.contains("users under 16"));
        assert!(sports.starts_with("The under 16 squad plays"));

        let online = generate_summary_from_content(
            "Under-16s and social media",
            "Ministers want to stop under 16s opening social media accounts.",
            "Australia",
        );
        assert!(online.contains("under 16"));
    }

    #[test]
    fn test_summary_leading_sentences_skip_code() {
        let content = "var x = 1; function f() {}. The state legislature advanced a bill on platform design for young users. It now moves to the governor.";
        let s = generate_summary_from_content("Bill advances", content, "United States");
        assert!(s.starts_with("The state legislature advanced a bill"));
        assert!(!s.contains("var x"));
        assert!(s.chars().count() <= SUMMARY_BUDGET_CHARS);
    }

    #[test]
    fn test_summary_generic_template() {
        let s = generate_summary_from_content("Short note", "ok.", "France");
        assert_eq!(s, "Short note (France). See the source for details.");
    }

    #[test]
    fn test_is_under16_related() {
        assert!(is_under16_related("Ban on social media accounts for under-16s"));
        assert!(is_under16_related("Parental consent for app downloads"));
        assert!(!is_under16_related("Under-16 football squad wins the cup"));
        assert!(is_under16_related(
            "Football league launches online safety rules for under-16 players' accounts"
        ));
        assert!(!is_under16_related("Quarterly budget statement"));
    }
}
