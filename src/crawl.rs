//! Source-type dispatch and crawl-level deduplication.
//!
//! [`SourceCrawler`] is the seam between the pipeline and the network:
//! [`HttpCrawler`] dispatches each source to its protocol connector, and
//! tests substitute their own implementation.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;

use crate::config::{Config, CrawlConfig};
use crate::connector_feed::crawl_feed;
use crate::connector_html::crawl_html;
use crate::connector_search::SearchApiClient;
use crate::models::{CrawledItem, Source, SourceType};
use crate::store::sha256_hex;

/// Produces crawled items for one source.
#[async_trait]
pub trait SourceCrawler: Send + Sync {
    async fn crawl(&self, source: &Source) -> Result<Vec<CrawledItem>>;
}

/// Crawls sources over HTTP according to their [`SourceType`].
pub struct HttpCrawler {
    client: reqwest::Client,
    crawl: CrawlConfig,
    search: SearchApiClient,
}

impl HttpCrawler {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.crawl.user_agent)
            .build()?;
        let search = SearchApiClient::new(
            client.clone(),
            &config.search_api,
            config.crawl.max_content_chars,
        );
        Ok(Self {
            client,
            crawl: config.crawl.clone(),
            search,
        })
    }
}

#[async_trait]
impl SourceCrawler for HttpCrawler {
    async fn crawl(&self, source: &Source) -> Result<Vec<CrawledItem>> {
        match source.source_type {
            SourceType::Rss => crawl_feed(&self.client, source, &self.crawl).await,
            SourceType::Html => crawl_html(&self.client, source, &self.crawl).await,
            SourceType::SearchApi => Ok(self.search.crawl(source).await?),
        }
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Pre-analysis identity of an item within its source.
///
/// The normalized URL when there is one, otherwise a hash of the
/// normalized content. Always scoped by source id.
pub fn crawl_dedup_key(item: &CrawledItem) -> String {
    let url: String = item
        .url
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    if !url.is_empty() {
        return format!("{}|url:{}", item.source_id, url);
    }
    let content = collapse_whitespace(&item.content).to_lowercase();
    format!("{}|hash:{}", item.source_id, sha256_hex(&content))
}

/// Drop later duplicates, keeping first-seen order.
pub fn dedup_crawled(items: Vec<CrawledItem>) -> Vec<CrawledItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(crawl_dedup_key(item)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(source: &str, url: &str, content: &str) -> CrawledItem {
        CrawledItem {
            url: url.into(),
            title: "t".into(),
            content: content.into(),
            published_at: None,
            source_id: source.into(),
        }
    }

    #[test]
    fn test_urls_differing_by_case_and_whitespace_collapse() {
        let items = vec![
            item("ftc", "https://FTC.gov/News/1", "a"),
            item("ftc", " https://ftc.gov/news/1 ", "b"),
        ];
        let deduped = dedup_crawled(items);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].content, "a");
    }

    #[test]
    fn test_scoped_per_source() {
        let items = vec![
            item("ftc", "https://ftc.gov/news/1", "a"),
            item("ofcom", "https://ftc.gov/news/1", "a"),
        ];
        assert_eq!(dedup_crawled(items).len(), 2);
    }

    #[test]
    fn test_content_hash_when_url_empty() {
        let items = vec![
            item("x", "", "Age   Verification\nrules"),
            item("x", "", "age verification rules"),
            item("x", "", "something else"),
        ];
        assert_eq!(dedup_crawled(items).len(), 2);
    }
}
