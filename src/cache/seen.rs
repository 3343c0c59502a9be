use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::feed::FeedEntry;

/// Proof that an entry was already handed to the download engine (or
/// deliberately skipped). Never mutated once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenRecord {
    #[serde(rename = "Feed")]
    pub feed: String,
    #[serde(rename = "Published", default, deserialize_with = "zero_time_as_none")]
    pub published: Option<DateTime<Utc>>,
    #[serde(rename = "AddTime")]
    pub added: DateTime<Utc>,
    #[serde(rename = "GUID")]
    pub guid: String,
    #[serde(rename = "Complete", default)]
    pub complete: bool,
}

impl SeenRecord {
    pub fn for_entry(entry: &FeedEntry, now: DateTime<Utc>) -> Self {
        Self {
            feed: entry.feed_name.clone(),
            published: entry.published_at,
            added: now,
            guid: entry.guid.clone(),
            complete: false,
        }
    }
}

/// Cache files written by older tools store a missing publish date as the
/// zero timestamp `0001-01-01T00:00:00Z`.
fn zero_time_as_none<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<DateTime<Utc>>::deserialize(deserializer)?;
    Ok(value.filter(|dt| dt.year() > 1))
}

/// Which timestamp the retention window is measured from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionAnchor {
    /// Time the record was added to the cache.
    #[default]
    Added,
    /// Publish time of the entry, falling back to the add time when unknown.
    Published,
}

/// How long seen records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub window: Duration,
    pub anchor: RetentionAnchor,
}

impl RetentionPolicy {
    pub fn days(days: u32, anchor: RetentionAnchor) -> Self {
        Self {
            window: Duration::days(i64::from(days)),
            anchor,
        }
    }
}

/// Ordered list of [`SeenRecord`]s with a dirty flag.
///
/// No internal locking: the single poll worker owns it.
#[derive(Debug, Clone, Default)]
pub struct SeenCache {
    records: Vec<SeenRecord>,
    dirty: bool,
}

impl SeenCache {
    pub(crate) fn from_records(records: Vec<SeenRecord>) -> Self {
        Self {
            records,
            dirty: false,
        }
    }

    pub fn records(&self) -> &[SeenRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// True if a record for `(feed, guid)` exists, complete or not.
    pub fn exists(&self, feed: &str, guid: &str) -> bool {
        self.records
            .iter()
            .any(|r| r.guid == guid && r.feed == feed)
    }

    /// Append a record. Duplicates are not merged; callers check
    /// [`exists`](Self::exists) first.
    pub fn add_item(&mut self, record: SeenRecord) {
        tracing::debug!(feed = %record.feed, guid = %record.guid, "Recording seen entry");
        self.records.push(record);
        self.dirty = true;
    }

    /// Drop every record whose age has reached the retention window.
    ///
    /// Survivors keep their relative order. Returns the number removed.
    pub fn evict(&mut self, policy: RetentionPolicy, now: DateTime<Utc>) -> usize {
        let before = self.records.len();

        self.records.retain(|r| {
            let anchor = match policy.anchor {
                RetentionAnchor::Added => r.added,
                RetentionAnchor::Published => r.published.unwrap_or(r.added),
            };
            let keep = now.signed_duration_since(anchor) < policy.window;
            if !keep {
                tracing::debug!(feed = %r.feed, guid = %r.guid, "Evicting seen entry");
            }
            keep
        });

        let removed = before - self.records.len();
        if removed > 0 {
            tracing::info!(removed, remaining = self.records.len(), "Evicted expired seen entries");
            self.dirty = true;
        }
        removed
    }
}
