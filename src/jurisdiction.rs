//! Jurisdiction resolution.
//!
//! Pure functions shared by the analyzer, the law engine and the backfill
//! job. Country names are canonicalized through one ordered alias table;
//! the first alias that matches wins.
//!
//! # Precedence
//!
//! [`resolve_canonical_jurisdiction`] picks the country from the first signal
//! that yields one:
//!
//! 1. explicit hint (e.g. the classifier's answer)
//! 2. country named in the item text
//! 3. the source's configured jurisdiction
//! 4. the URL's government domain or country TLD
//! 5. the literal `"Unknown"`
//!
//! A sub-national state is only kept for the United States.

use regex::Regex;
use std::sync::LazyLock;

use crate::models::Jurisdiction;

pub const UNKNOWN_COUNTRY: &str = "Unknown";
pub const UNITED_STATES: &str = "United States";

/// Inputs that resolve to "no jurisdiction".
const SENTINELS: &[&str] = &[
    "", "n/a", "n a", "na", "none", "null", "nil", "unknown", "unspecified", "tbd", "-", "?",
    "global", "international", "worldwide", "various", "multiple", "other",
];

#[derive(Clone, Copy, PartialEq, Eq)]
enum AliasKind {
    /// Matched case-insensitively in free text.
    Name,
    /// Matched case-sensitively in free text ("US" but not "us").
    Acronym,
}

struct CountryAlias {
    alias: &'static str,
    country: &'static str,
    kind: AliasKind,
}

const fn name(alias: &'static str, country: &'static str) -> CountryAlias {
    CountryAlias {
        alias,
        country,
        kind: AliasKind::Name,
    }
}

const fn acronym(alias: &'static str, country: &'static str) -> CountryAlias {
    CountryAlias {
        alias,
        country,
        kind: AliasKind::Acronym,
    }
}

/// Ordered alias table: country name variants, institutions, acronyms and
/// regional groupings.
const COUNTRY_ALIASES: &[CountryAlias] = &[
    name("united states of america", UNITED_STATES),
    name("united states", UNITED_STATES),
    acronym("U.S.A.", UNITED_STATES),
    acronym("USA", UNITED_STATES),
    acronym("U.S.", UNITED_STATES),
    acronym("US", UNITED_STATES),
    name("congress", UNITED_STATES),
    name("federal trade commission", UNITED_STATES),
    acronym("FTC", UNITED_STATES),
    name("white house", UNITED_STATES),
    name("united kingdom", "United Kingdom"),
    name("great britain", "United Kingdom"),
    name("britain", "United Kingdom"),
    name("england", "United Kingdom"),
    name("scotland", "United Kingdom"),
    acronym("U.K.", "United Kingdom"),
    acronym("UK", "United Kingdom"),
    name("ofcom", "United Kingdom"),
    name("house of commons", "United Kingdom"),
    name("house of lords", "United Kingdom"),
    name("information commissioner's office", "United Kingdom"),
    name("european union", "European Union"),
    name("european commission", "European Union"),
    name("european parliament", "European Union"),
    name("council of the eu", "European Union"),
    name("digital services act", "European Union"),
    acronym("E.U.", "European Union"),
    acronym("EU", "European Union"),
    name("europe", "European Union"),
    name("australia", "Australia"),
    name("esafety commissioner", "Australia"),
    name("esafety", "Australia"),
    name("canada", "Canada"),
    acronym("CRTC", "Canada"),
    name("france", "France"),
    name("arcom", "France"),
    acronym("CNIL", "France"),
    name("germany", "Germany"),
    name("bundestag", "Germany"),
    name("ireland", "Ireland"),
    name("coimisiún na meán", "Ireland"),
    name("coimisiun na mean", "Ireland"),
    name("brazil", "Brazil"),
    name("brasil", "Brazil"),
    acronym("ANPD", "Brazil"),
    name("india", "India"),
    acronym("MeitY", "India"),
    name("japan", "Japan"),
    name("south korea", "South Korea"),
    name("republic of korea", "South Korea"),
    name("singapore", "Singapore"),
    name("new zealand", "New Zealand"),
    name("spain", "Spain"),
    name("italy", "Italy"),
    name("netherlands", "Netherlands"),
    name("norway", "Norway"),
    name("denmark", "Denmark"),
    name("greece", "Greece"),
    name("indonesia", "Indonesia"),
    name("malaysia", "Malaysia"),
    name("china", "China"),
];

/// (name, postal code). "West Virginia" precedes "Virginia" so the longer
/// name wins in text.
const US_STATES: &[(&str, &str)] = &[
    ("California", "CA"),
    ("Texas", "TX"),
    ("Florida", "FL"),
    ("Utah", "UT"),
    ("New York", "NY"),
    ("Arkansas", "AR"),
    ("Louisiana", "LA"),
    ("West Virginia", "WV"),
    ("Virginia", "VA"),
    ("Tennessee", "TN"),
    ("Georgia", "GA"),
    ("Mississippi", "MS"),
    ("Ohio", "OH"),
    ("Montana", "MT"),
    ("Maryland", "MD"),
    ("Connecticut", "CT"),
    ("Minnesota", "MN"),
    ("Nebraska", "NE"),
    ("Vermont", "VT"),
    ("Illinois", "IL"),
    ("New Jersey", "NJ"),
    ("Colorado", "CO"),
];

/// Government and country domains, most specific first.
const DOMAIN_COUNTRIES: &[(&str, &str)] = &[
    ("congress.gov", UNITED_STATES),
    ("ftc.gov", UNITED_STATES),
    ("senate.gov", UNITED_STATES),
    ("house.gov", UNITED_STATES),
    ("whitehouse.gov", UNITED_STATES),
    ("gov.uk", "United Kingdom"),
    ("parliament.uk", "United Kingdom"),
    ("ofcom.org.uk", "United Kingdom"),
    ("ico.org.uk", "United Kingdom"),
    ("europa.eu", "European Union"),
    ("gov.au", "Australia"),
    ("gc.ca", "Canada"),
    ("canada.ca", "Canada"),
    ("gouv.fr", "France"),
    ("bund.de", "Germany"),
    ("bundestag.de", "Germany"),
    ("gov.ie", "Ireland"),
    ("oireachtas.ie", "Ireland"),
    ("gov.br", "Brazil"),
    ("gov.in", "India"),
    ("nic.in", "India"),
    ("go.jp", "Japan"),
    ("go.kr", "South Korea"),
    ("gov.sg", "Singapore"),
    ("govt.nz", "New Zealand"),
    ("gov", UNITED_STATES),
    ("mil", UNITED_STATES),
    ("uk", "United Kingdom"),
    ("eu", "European Union"),
    ("au", "Australia"),
    ("ca", "Canada"),
    ("fr", "France"),
    ("de", "Germany"),
    ("ie", "Ireland"),
    ("br", "Brazil"),
    ("in", "India"),
    ("jp", "Japan"),
    ("kr", "South Korea"),
    ("sg", "Singapore"),
    ("nz", "New Zealand"),
    ("es", "Spain"),
    ("it", "Italy"),
    ("nl", "Netherlands"),
    ("no", "Norway"),
    ("dk", "Denmark"),
];

const STATE_DOMAINS: &[(&str, &str)] = &[
    ("ca.gov", "California"),
    ("texas.gov", "Texas"),
    ("utah.gov", "Utah"),
    ("ny.gov", "New York"),
    ("nysenate.gov", "New York"),
    ("flsenate.gov", "Florida"),
    ("myflorida.com", "Florida"),
    ("arkleg.state.ar.us", "Arkansas"),
    ("legis.la.gov", "Louisiana"),
    ("virginia.gov", "Virginia"),
];

static TEXT_ALIASES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    COUNTRY_ALIASES
        .iter()
        .filter_map(|a| {
            let escaped = regex::escape(a.alias);
            let pattern = match a.kind {
                AliasKind::Name => format!(r"(?i)(?:^|[^\p{{L}}\p{{N}}]){}(?:$|[^\p{{L}}\p{{N}}])", escaped),
                AliasKind::Acronym => format!(r"(?:^|[^A-Za-z0-9]){}(?:$|[^A-Za-z0-9])", escaped),
            };
            Regex::new(&pattern).ok().map(|re| (re, a.country))
        })
        .collect()
});

static TEXT_STATES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    US_STATES
        .iter()
        .filter_map(|(state, _)| {
            let pattern = format!(r"(?i)\b{}\b", regex::escape(state));
            Regex::new(&pattern).ok().map(|re| (re, *state))
        })
        .collect()
});

/// Lowercase, drop periods and apostrophes, turn other punctuation into
/// spaces, collapse whitespace.
fn normalize_key(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        if c == '.' || c == '\'' || c == '’' {
            continue;
        }
        if c.is_alphanumeric() {
            out.push(c);
        } else {
            out.push(' ');
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_sentinel(raw: &str) -> bool {
    let trimmed = raw.trim().to_lowercase();
    SENTINELS.contains(&trimmed.as_str()) || SENTINELS.contains(&normalize_key(raw).as_str())
}

/// Canonical country name for `raw`, or `None` for blank/sentinel input.
///
/// Unmatched non-empty input passes through verbatim (trimmed).
pub fn canonicalize_country(raw: &str) -> Option<String> {
    if is_sentinel(raw) {
        return None;
    }
    let key = normalize_key(raw);
    if key.is_empty() {
        return None;
    }

    if let Some(alias) = COUNTRY_ALIASES
        .iter()
        .find(|a| normalize_key(a.alias) == key)
    {
        return Some(alias.country.to_string());
    }

    // Canonical names are their own alias.
    if let Some(alias) = COUNTRY_ALIASES
        .iter()
        .find(|a| normalize_key(a.country) == key)
    {
        return Some(alias.country.to_string());
    }

    Some(raw.trim().to_string())
}

/// True when `country` is absent, a sentinel, or the literal "Unknown".
pub fn is_unknown_country(country: Option<&str>) -> bool {
    match country {
        None => true,
        Some(c) => is_sentinel(c) || c.trim().eq_ignore_ascii_case(UNKNOWN_COUNTRY),
    }
}

/// First country (in alias-table order) mentioned in `text`.
pub fn infer_country_from_text(text: &str) -> Option<&'static str> {
    if text.trim().is_empty() {
        return None;
    }
    TEXT_ALIASES
        .iter()
        .find(|(re, _)| re.is_match(text))
        .map(|(_, country)| *country)
}

fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url.trim())
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_lowercase()))
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{}", domain))
}

/// Country implied by a URL's government domain or country TLD.
pub fn infer_country_from_url(url: &str) -> Option<&'static str> {
    let host = host_of(url)?;
    DOMAIN_COUNTRIES
        .iter()
        .find(|(domain, _)| host_matches(&host, domain))
        .map(|(_, country)| *country)
}

/// US state implied by a state government domain.
pub fn infer_state_from_url(url: &str) -> Option<&'static str> {
    let host = host_of(url)?;
    STATE_DOMAINS
        .iter()
        .find(|(domain, _)| host_matches(&host, domain))
        .map(|(_, state)| *state)
}

/// Lowercased host without a leading `www.`.
pub fn hostname(url: &str) -> Option<String> {
    host_of(url)
}

/// Canonical US state name from a name or postal code.
pub fn canonicalize_state(raw: &str) -> Option<&'static str> {
    if is_sentinel(raw) {
        return None;
    }
    let key = normalize_key(raw);
    US_STATES
        .iter()
        .find(|(state, code)| normalize_key(state) == key || code.eq_ignore_ascii_case(&key))
        .map(|(state, _)| *state)
}

pub fn infer_state_from_text(text: &str) -> Option<&'static str> {
    TEXT_STATES
        .iter()
        .find(|(re, _)| re.is_match(text))
        .map(|(_, state)| *state)
}

/// Every signal available for one item.
#[derive(Debug, Clone, Copy, Default)]
pub struct JurisdictionSignals<'a> {
    pub hint_country: Option<&'a str>,
    pub hint_state: Option<&'a str>,
    pub text: &'a str,
    pub source_country: Option<&'a str>,
    pub source_state: Option<&'a str>,
    pub url: &'a str,
}

pub fn resolve_canonical_jurisdiction(signals: &JurisdictionSignals<'_>) -> Jurisdiction {
    let country = signals
        .hint_country
        .and_then(canonicalize_country)
        .or_else(|| infer_country_from_text(signals.text).map(str::to_string))
        .or_else(|| signals.source_country.and_then(canonicalize_country))
        .or_else(|| infer_country_from_url(signals.url).map(str::to_string))
        .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string());

    let state = if country == UNITED_STATES {
        signals
            .hint_state
            .and_then(canonicalize_state)
            .or_else(|| infer_state_from_text(signals.text))
            .or_else(|| signals.source_state.and_then(canonicalize_state))
            .or_else(|| infer_state_from_url(signals.url))
            .map(str::to_string)
    } else {
        None
    };

    Jurisdiction { country, state }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_us_aliases() {
        for raw in ["U.S.A.", "usa", "US", "united states", "congress", "ftc", "FTC "] {
            assert_eq!(
                canonicalize_country(raw).as_deref(),
                Some(UNITED_STATES),
                "alias {:?}",
                raw
            );
        }
    }

    #[test]
    fn test_sentinels_resolve_to_none() {
        for raw in ["", "   ", "n/a", "N/A", "unknown", "Unknown", "none", "global"] {
            assert_eq!(canonicalize_country(raw), None, "sentinel {:?}", raw);
        }
    }

    #[test]
    fn test_unmatched_passes_through() {
        assert_eq!(canonicalize_country(" Freedonia ").as_deref(), Some("Freedonia"));
    }

    #[test]
    fn test_regional_grouping() {
        assert_eq!(canonicalize_country("E.U.").as_deref(), Some("European Union"));
        assert_eq!(canonicalize_country("Europe").as_deref(), Some("European Union"));
        assert_eq!(canonicalize_country("Ofcom").as_deref(), Some("United Kingdom"));
    }

    #[test]
    fn test_text_inference_respects_acronym_case() {
        assert_eq!(infer_country_from_text("Let us know what you think"), None);
        assert_eq!(
            infer_country_from_text("The US Senate advanced the bill"),
            Some(UNITED_STATES)
        );
        assert_eq!(
            infer_country_from_text("Australia's eSafety regulator"),
            Some("Australia")
        );
    }

    #[test]
    fn test_url_inference() {
        assert_eq!(
            infer_country_from_url("https://www.congress.gov/bill/118th"),
            Some(UNITED_STATES)
        );
        assert_eq!(
            infer_country_from_url("https://www.gov.uk/government/news/x"),
            Some("United Kingdom")
        );
        assert_eq!(infer_country_from_url("https://example.com/a"), None);
        assert_eq!(infer_country_from_url("not a url"), None);
        assert_eq!(
            infer_state_from_url("https://leginfo.legislature.ca.gov/faces/bill"),
            Some("California")
        );
    }

    #[test]
    fn test_precedence_hint_over_text() {
        let j = resolve_canonical_jurisdiction(&JurisdictionSignals {
            hint_country: Some("UK"),
            text: "Australia moves on social media",
            source_country: Some("Canada"),
            url: "https://www.congress.gov/x",
            ..Default::default()
        });
        assert_eq!(j.country, "United Kingdom");
    }

    #[test]
    fn test_precedence_text_over_source() {
        let j = resolve_canonical_jurisdiction(&JurisdictionSignals {
            hint_country: Some("unknown"),
            text: "Australia moves on social media",
            source_country: Some("Canada"),
            url: "https://www.congress.gov/x",
            ..Default::default()
        });
        assert_eq!(j.country, "Australia");
    }

    #[test]
    fn test_precedence_source_over_url() {
        let j = resolve_canonical_jurisdiction(&JurisdictionSignals {
            text: "A regulator published new guidance",
            source_country: Some("Canada"),
            url: "https://www.congress.gov/x",
            ..Default::default()
        });
        assert_eq!(j.country, "Canada");
    }

    #[test]
    fn test_precedence_url_over_unknown() {
        let j = resolve_canonical_jurisdiction(&JurisdictionSignals {
            text: "A regulator published new guidance",
            url: "https://www.congress.gov/x",
            ..Default::default()
        });
        assert_eq!(j.country, UNITED_STATES);

        let j = resolve_canonical_jurisdiction(&JurisdictionSignals {
            text: "A regulator published new guidance",
            url: "https://example.com/x",
            ..Default::default()
        });
        assert_eq!(j.country, UNKNOWN_COUNTRY);
    }

    #[test]
    fn test_state_only_for_united_states() {
        let j = resolve_canonical_jurisdiction(&JurisdictionSignals {
            hint_country: Some("USA"),
            text: "Utah lawmakers approve app store age checks",
            ..Default::default()
        });
        assert_eq!(j.state.as_deref(), Some("Utah"));

        let j = resolve_canonical_jurisdiction(&JurisdictionSignals {
            hint_country: Some("Canada"),
            hint_state: Some("TX"),
            text: "Texas-style rules proposed in Canada",
            ..Default::default()
        });
        assert_eq!(j.country, "Canada");
        assert_eq!(j.state, None);
    }

    #[test]
    fn test_state_postal_code_hint() {
        assert_eq!(canonicalize_state("tx"), Some("Texas"));
        assert_eq!(canonicalize_state("West Virginia"), Some("West Virginia"));
        assert_eq!(canonicalize_state("n/a"), None);
    }

    #[test]
    fn test_is_unknown_country() {
        assert!(is_unknown_country(None));
        assert!(is_unknown_country(Some("Unknown")));
        assert!(is_unknown_country(Some("")));
        assert!(!is_unknown_country(Some("France")));
    }
}
