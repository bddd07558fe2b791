//! HTML page connector.
//!
//! A source of type `html` is one page producing one item. Two extraction
//! strategies run side by side, a DOM walk that renders markdown and a plain
//! tag strip, and the longer cleaned result wins. Thin pages (under
//! [`THIN_PAGE_CHARS`]) are padded with meta/og descriptions and a
//! synthesized source header. PDFs are never parsed; they produce a
//! metadata-only stub.

use anyhow::{Context, Result};
use scraper::{ElementRef, Html, Node, Selector};
use tracing::debug;

use crate::cleaner::clean_text;
use crate::config::CrawlConfig;
use crate::connector_feed::{parse_date, truncate_chars};
use crate::fetch::{fetch_with_retry, FetchPolicy};
use crate::jurisdiction::UNKNOWN_COUNTRY;
use crate::models::{CrawledItem, Source};

pub const THIN_PAGE_CHARS: usize = 200;

const SKIPPED_TAGS: &[&str] = &[
    "script", "style", "noscript", "nav", "footer", "header", "svg", "iframe", "form",
    "template", "head",
];
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "main", "blockquote", "ul", "ol", "table", "tr",
];

pub fn is_pdf(url: &str, content_type: Option<&str>) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.to_ascii_lowercase().ends_with(".pdf")
        || content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("application/pdf"))
}

fn source_label(source: &Source) -> String {
    let country = source
        .jurisdiction_country
        .as_deref()
        .unwrap_or(UNKNOWN_COUNTRY);
    match source.jurisdiction_state.as_deref() {
        Some(state) => format!("{}, {}", state, country),
        None => country.to_string(),
    }
}

fn source_header(source: &Source, url: &str) -> String {
    format!("Source: {} ({}): {}", source.name, source_label(source), url)
}

/// Metadata-only item for a PDF document.
pub fn pdf_stub(source: &Source, url: &str) -> CrawledItem {
    let file_name = url
        .split(['?', '#'])
        .next()
        .and_then(|p| p.rsplit('/').next())
        .filter(|s| !s.is_empty())
        .unwrap_or("document.pdf");
    CrawledItem {
        url: url.to_string(),
        title: format!("{}: {}", source.name, file_name),
        content: format!(
            "PDF document published by {}. {}",
            source.name,
            source_header(source, url)
        ),
        published_at: None,
        source_id: source.id.clone(),
    }
}

fn select_first_text(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    let element = document.select(&selector).next()?;
    let text = clean_text(&element.text().collect::<String>());
    (!text.is_empty()).then_some(text)
}

fn meta_content(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    let value = document
        .select(&selector)
        .filter_map(|m| m.value().attr("content"))
        .map(clean_text)
        .find(|s| !s.is_empty())?;
    Some(value)
}

fn render_markdown(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) => {
                let name = el.name();
                if SKIPPED_TAGS.contains(&name) {
                    continue;
                }
                let Some(child_ref) = ElementRef::wrap(child) else {
                    continue;
                };
                match name {
                    "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                        out.push_str("\n\n# ");
                        render_markdown(child_ref, out);
                        out.push_str("\n\n");
                    }
                    "li" => {
                        out.push_str("\n- ");
                        render_markdown(child_ref, out);
                    }
                    "br" => out.push('\n'),
                    "a" => {
                        let mut inner = String::new();
                        render_markdown(child_ref, &mut inner);
                        match el.attr("href") {
                            Some(href) if !inner.trim().is_empty() => {
                                out.push_str(&format!("[{}]({})", inner.trim(), href))
                            }
                            _ => out.push_str(&inner),
                        }
                    }
                    _ if BLOCK_TAGS.contains(&name) => {
                        out.push_str("\n\n");
                        render_markdown(child_ref, out);
                        out.push_str("\n\n");
                    }
                    _ => render_markdown(child_ref, out),
                }
            }
            _ => {}
        }
    }
}

/// DOM walk from `<body>` rendered as markdown, then cleaned.
pub fn markdown_strategy(document: &Html) -> String {
    let root = Selector::parse("body")
        .ok()
        .and_then(|s| document.select(&s).next())
        .unwrap_or_else(|| document.root_element());
    let mut out = String::new();
    render_markdown(root, &mut out);
    clean_text(&out)
}

/// Regex tag strip over the raw document.
pub fn tag_strip_strategy(html: &str) -> String {
    clean_text(html)
}

/// Turn one fetched HTML document into a crawled item.
pub fn extract_page(html: &str, source: &Source, url: &str, max_chars: usize) -> CrawledItem {
    let document = Html::parse_document(html);

    let markdown = markdown_strategy(&document);
    let stripped = tag_strip_strategy(html);
    let mut text = if markdown.chars().count() >= stripped.chars().count() {
        markdown
    } else {
        stripped
    };

    if text.chars().count() < THIN_PAGE_CHARS {
        let mut parts = vec![text];
        for selector in [
            r#"meta[name="description"]"#,
            r#"meta[property="og:title"]"#,
            r#"meta[property="og:description"]"#,
        ] {
            if let Some(meta) = meta_content(&document, selector) {
                if !parts.iter().any(|p| p.contains(&meta)) {
                    parts.push(meta);
                }
            }
        }
        parts.push(source_header(source, url));
        text = parts
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
    }

    let title = select_first_text(&document, "title")
        .or_else(|| meta_content(&document, r#"meta[property="og:title"]"#))
        .or_else(|| select_first_text(&document, "h1"))
        .unwrap_or_else(|| source.name.clone());

    let published_at = meta_content(&document, r#"meta[property="article:published_time"]"#)
        .and_then(|raw| parse_date(&raw));

    CrawledItem {
        url: url.to_string(),
        title,
        content: truncate_chars(&text, max_chars),
        published_at,
        source_id: source.id.clone(),
    }
}

/// Fetch one HTML source; PDFs short-circuit to a stub.
pub async fn crawl_html(
    client: &reqwest::Client,
    source: &Source,
    config: &CrawlConfig,
) -> Result<Vec<CrawledItem>> {
    if is_pdf(&source.url, None) {
        return Ok(vec![pdf_stub(source, &source.url)]);
    }
    let page = fetch_with_retry(client, &source.url, &FetchPolicy::from_config(config))
        .await
        .with_context(|| format!("fetching page {}", source.url))?;
    if is_pdf(&page.final_url, page.content_type.as_deref()) {
        return Ok(vec![pdf_stub(source, &source.url)]);
    }
    let item = extract_page(&page.body, source, &source.url, config.max_content_chars);
    debug!(source = %source.id, chars = item.content.chars().count(), "page extracted");
    Ok(vec![item])
}
