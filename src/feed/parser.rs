use anyhow::Result;
use chrono::{DateTime, Utc};
use feed_rs::parser;
use sha2::{Digest, Sha256};

use super::Enclosure;

/// One item of a parsed feed, before it is attributed to a configured feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedItem {
    pub guid: String,
    pub title: String,
    pub link: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub enclosures: Vec<Enclosure>,
}

/// Parse RSS/Atom bytes into items.
///
/// Enclosures come from two places: RSS `<enclosure>` elements (surfaced by
/// feed-rs as media content) and Atom `<link rel="enclosure">` elements. A
/// missing length is kept as an empty string so the filter can report it.
pub fn parse_feed(bytes: &[u8]) -> Result<Vec<ParsedItem>> {
    let feed = parser::parse(bytes)?;

    let items = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry
                .links
                .iter()
                .find(|l| l.rel.as_deref() != Some("enclosure"))
                .map(|l| l.href.clone());
            let published = entry.published.or(entry.updated);
            let title = entry
                .title
                .map(|t| t.content)
                .unwrap_or_else(|| "Untitled".to_string());

            let mut enclosures: Vec<Enclosure> = entry
                .media
                .iter()
                .flat_map(|m| m.content.iter())
                .filter_map(|c| {
                    c.url.as_ref().map(|url| Enclosure {
                        url: url.to_string(),
                        mime_type: c
                            .content_type
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_default(),
                        length: c.size.map(|s| s.to_string()).unwrap_or_default(),
                    })
                })
                .collect();

            for l in entry
                .links
                .iter()
                .filter(|l| l.rel.as_deref() == Some("enclosure"))
            {
                if enclosures.iter().any(|e| e.url == l.href) {
                    continue;
                }
                enclosures.push(Enclosure {
                    url: l.href.clone(),
                    mime_type: l.media_type.clone().unwrap_or_default(),
                    length: l.length.map(|s| s.to_string()).unwrap_or_default(),
                });
            }

            let existing_id = if entry.id.is_empty() {
                None
            } else {
                Some(entry.id.as_str())
            };
            let guid = generate_guid(
                existing_id,
                link.as_deref(),
                &title,
                published.map(|p| p.timestamp()),
            );

            ParsedItem {
                guid,
                title,
                link,
                published,
                enclosures,
            }
        })
        .collect();

    Ok(items)
}

/// Use the feed's own id when present, otherwise hash `url|title|published`
/// so the same item keeps the same key across polls.
fn generate_guid(
    existing: Option<&str>,
    url: Option<&str>,
    title: &str,
    published: Option<i64>,
) -> String {
    if let Some(guid) = existing {
        let trimmed = guid.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        url.unwrap_or(""),
        title,
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}
