//! RSS 2.0 / Atom feed connector.
//!
//! One streaming parser handles both shapes (`channel/item` and
//! `feed/entry`). Items keep document order and are capped per feed; bodies
//! are cleaned and truncated. Dates are parsed best-effort: an unparseable
//! date leaves `published_at` empty rather than failing the item.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, warn};

use crate::cleaner::clean_text;
use crate::config::CrawlConfig;
use crate::fetch::{fetch_with_retry, FetchPolicy};
use crate::models::{CrawledItem, Source};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Link,
    Guid,
    Description,
    Content,
    Published,
}

#[derive(Debug, Default)]
struct Entry {
    title: String,
    link: String,
    guid: String,
    description: String,
    content: String,
    published: String,
}

impl Entry {
    fn buffer(&mut self, field: Field) -> &mut String {
        match field {
            Field::Title => &mut self.title,
            Field::Link => &mut self.link,
            Field::Guid => &mut self.guid,
            Field::Description => &mut self.description,
            Field::Content => &mut self.content,
            Field::Published => &mut self.published,
        }
    }

    fn into_item(self, source_id: &str, max_chars: usize) -> Option<CrawledItem> {
        let title = clean_text(&self.title);
        let link = if !self.link.trim().is_empty() {
            self.link.trim().to_string()
        } else if self.guid.trim().starts_with("http") {
            self.guid.trim().to_string()
        } else {
            String::new()
        };
        let body = if self.content.trim().is_empty() {
            &self.description
        } else {
            &self.content
        };
        let content = truncate_chars(&clean_text(body), max_chars);
        if title.is_empty() && content.is_empty() {
            return None;
        }
        Some(CrawledItem {
            url: link,
            title,
            content,
            published_at: parse_date(&self.published),
            source_id: source_id.to_string(),
        })
    }
}

fn field_for(local_name: &[u8]) -> Option<Field> {
    match local_name {
        b"title" => Some(Field::Title),
        b"link" => Some(Field::Link),
        b"guid" | b"id" => Some(Field::Guid),
        b"description" | b"summary" => Some(Field::Description),
        b"encoded" | b"content" => Some(Field::Content),
        b"pubDate" | b"published" | b"updated" | b"date" => Some(Field::Published),
        _ => None,
    }
}

/// Atom `<link href=".." rel="alternate"/>`; other rels are ignored.
fn atom_href(e: &BytesStart<'_>) -> Option<String> {
    let mut href = None;
    let mut rel_ok = true;
    for attr in e.attributes().flatten() {
        match attr.key.local_name().as_ref() {
            b"href" => href = attr.unescape_value().ok().map(|v| v.into_owned()),
            b"rel" => {
                rel_ok = attr
                    .unescape_value()
                    .map(|v| v == "alternate")
                    .unwrap_or(false)
            }
            _ => {}
        }
    }
    href.filter(|_| rel_ok)
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Best-effort date parsing: RFC 2822, RFC 3339, then a bare `YYYY-MM-DD`.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Parse an RSS or Atom document into at most `max_items` items.
pub fn parse_feed(
    xml: &str,
    source: &Source,
    max_items: usize,
    max_chars: usize,
) -> Result<Vec<CrawledItem>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut items = Vec::new();
    let mut current: Option<Entry> = None;
    let mut field: Option<(Field, Vec<u8>)> = None;
    let mut buf = Vec::new();

    loop {
        if items.len() >= max_items {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name().as_ref().to_vec();
                if name == b"item" || name == b"entry" {
                    current = Some(Entry::default());
                    field = None;
                } else if let Some(entry) = current.as_mut() {
                    if field.is_none() {
                        if name == b"link" {
                            if let Some(href) = atom_href(&e) {
                                if entry.link.is_empty() {
                                    entry.link = href;
                                }
                            }
                        }
                        field = field_for(&name).map(|f| (f, name));
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                if let Some(entry) = current.as_mut() {
                    if e.local_name().as_ref() == b"link" && entry.link.is_empty() {
                        if let Some(href) = atom_href(&e) {
                            entry.link = href;
                        }
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(entry), Some((f, _))) = (current.as_mut(), field.as_ref()) {
                    let text = match t.unescape() {
                        Ok(s) => s.into_owned(),
                        // unknown HTML entities are left for the cleaner
                        Err(_) => String::from_utf8_lossy(&t).into_owned(),
                    };
                    let target = entry.buffer(*f);
                    if !target.is_empty() {
                        target.push(' ');
                    }
                    target.push_str(&text);
                }
            }
            Ok(Event::CData(c)) => {
                if let (Some(entry), Some((f, _))) = (current.as_mut(), field.as_ref()) {
                    let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                    let target = entry.buffer(*f);
                    if !target.is_empty() {
                        target.push(' ');
                    }
                    target.push_str(&text);
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                if name == b"item" || name == b"entry" {
                    if let Some(entry) = current.take() {
                        if let Some(item) = entry.into_item(&source.id, max_chars) {
                            items.push(item);
                        }
                    }
                    field = None;
                } else if field.as_ref().is_some_and(|(_, tag)| tag.as_slice() == name) {
                    field = None;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                if items.is_empty() {
                    bail!("malformed feed at byte {}: {}", reader.buffer_position(), e);
                }
                warn!(source = %source.id, error = %e, "feed truncated by parse error");
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(items)
}

/// Fetch and parse one feed source.
pub async fn crawl_feed(
    client: &reqwest::Client,
    source: &Source,
    config: &CrawlConfig,
) -> Result<Vec<CrawledItem>> {
    let page = fetch_with_retry(client, &source.url, &FetchPolicy::from_config(config))
        .await
        .with_context(|| format!("fetching feed {}", source.url))?;
    let items = parse_feed(
        &page.body,
        source,
        config.max_items_per_feed,
        config.max_content_chars,
    )
    .with_context(|| format!("parsing feed {}", source.url))?;
    debug!(source = %source.id, items = items.len(), "feed parsed");
    Ok(items)
}
