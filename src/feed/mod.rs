//! Feed retrieval and the entry model seen by the filter and cache layers.
//!
//! - [`parser`] - RSS/Atom parsing using the `feed-rs` crate
//! - [`fetcher`] - HTTP retrieval with retry logic and a body size limit
//!
//! A [`FeedEntry`] is a parsed item attributed to one configured feed. Its
//! identity for de-duplication is the `(feed_name, guid)` pair: the same GUID
//! reached through two configured aliases is two distinct entries.

mod fetcher;
mod parser;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use fetcher::{FeedSource, FetchError, HttpFeedSource};
pub use parser::{parse_feed, ParsedItem};

/// MIME type of a `.torrent` enclosure.
pub const TORRENT_MIME: &str = "application/x-bittorrent";

/// A resource attached to an entry.
///
/// `length` is the declared size exactly as it appeared in the feed. It is
/// parsed by the filter, which skips values that are not unsigned integers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enclosure {
    pub url: String,
    pub mime_type: String,
    pub length: String,
}

impl Enclosure {
    /// Convenience constructor with a numeric size.
    pub fn sized(url: impl Into<String>, mime_type: impl Into<String>, size: u64) -> Self {
        Self {
            url: url.into(),
            mime_type: mime_type.into(),
            length: size.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    /// Name of the configured feed this entry was polled under.
    pub feed_name: String,
    pub title: String,
    pub guid: String,
    pub link: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub enclosures: Vec<Enclosure>,
}

impl FeedEntry {
    pub fn new(feed_name: &str, item: ParsedItem) -> Self {
        Self {
            feed_name: feed_name.to_owned(),
            title: item.title,
            guid: item.guid,
            link: item.link,
            published_at: item.published,
            enclosures: item.enclosures,
        }
    }

    /// URL of the first `application/x-bittorrent` enclosure.
    pub fn torrent_url(&self) -> Option<&str> {
        self.enclosures
            .iter()
            .find(|e| e.mime_type.eq_ignore_ascii_case(TORRENT_MIME))
            .map(|e| e.url.as_str())
    }
}
