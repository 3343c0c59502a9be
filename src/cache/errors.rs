use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

/// Default hold-down after a failed dispatch, in hours.
pub const DEFAULT_HOLD_DOWN_HOURS: i64 = 1;

/// Hold-down table: entry key to expiry (unix seconds).
///
/// An entry whose dispatch failed is not retried before its expiry. Records
/// are never swept; an expired record is simply ignored and overwritten on
/// the next failure.
#[derive(Debug, Clone)]
pub struct ErrorCache {
    entries: BTreeMap<String, i64>,
    hold_down: Duration,
    dirty: bool,
}

impl Default for ErrorCache {
    fn default() -> Self {
        Self::from_entries(BTreeMap::new())
    }
}

impl ErrorCache {
    pub(crate) fn from_entries(entries: BTreeMap<String, i64>) -> Self {
        Self {
            entries,
            hold_down: Duration::hours(DEFAULT_HOLD_DOWN_HOURS),
            dirty: false,
        }
    }

    pub(crate) fn entries(&self) -> &BTreeMap<String, i64> {
        &self.entries
    }

    pub fn hold_down(&self) -> Duration {
        self.hold_down
    }

    pub fn set_hold_down(&mut self, hold_down: Duration) {
        self.hold_down = hold_down;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// True when `key` has no record or its hold-down has passed.
    pub fn is_new(&self, key: &str, now: DateTime<Utc>) -> bool {
        match self.entries.get(key) {
            None => true,
            Some(&expiry) => expiry < now.timestamp(),
        }
    }

    /// Start (or restart) the hold-down for `key`.
    pub fn record_failure(&mut self, key: &str, now: DateTime<Utc>) {
        let expiry = now
            .checked_add_signed(self.hold_down)
            .map_or(i64::MAX, |t| t.timestamp());
        tracing::debug!(key = %key, expiry, "Holding down failed entry");
        self.entries.insert(key.to_owned(), expiry);
        self.dirty = true;
    }
}
