use anyhow::Result;

use crate::config::Config;
use crate::jurisdiction::UNKNOWN_COUNTRY;
use crate::models::SourceType;

pub fn list_sources(config: &Config) -> Result<()> {
    if config.sources.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }

    println!(
        "{:<20} {:<11} {:<4} {:<24} URL",
        "SOURCE", "TYPE", "TIER", "JURISDICTION"
    );
    for source in &config.sources {
        let country = source
            .jurisdiction_country
            .as_deref()
            .unwrap_or(UNKNOWN_COUNTRY);
        let jurisdiction = match &source.jurisdiction_state {
            Some(state) => format!("{}, {}", state, country),
            None => country.to_string(),
        };
        let target = match (&source.search_query, source.source_type) {
            (Some(query), SourceType::SearchApi) => format!("query: {}", query),
            _ => source.url.clone(),
        };
        println!(
            "{:<20} {:<11} {:<4} {:<24} {}",
            source.id,
            source.source_type.as_str(),
            source.reliability_tier,
            jurisdiction,
            target
        );
    }

    let search_sources = config
        .sources
        .iter()
        .filter(|s| s.source_type == SourceType::SearchApi)
        .count();
    if search_sources > 0 && config.search_api.token.is_none() {
        println!(
            "warning: {} search_api source(s) configured but ${} is not set",
            search_sources, config.search_api.token_env
        );
    }

    Ok(())
}
