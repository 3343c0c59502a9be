//! Per-feed matching policy.
//!
//! A [`FeedRule`] decides whether a [`FeedEntry`] qualifies for download:
//!
//! 1. any exclude pattern matching the title rejects it,
//! 2. the summed size of all enclosures must sit inside `min_size..=max_size`
//!    (0 or unset means unbounded on that side),
//! 3. any include pattern matching the title accepts it,
//! 4. everything else is rejected.
//!
//! Patterns are compiled the first time the rule is used and then reused for
//! the lifetime of the rule. A pattern that fails to compile is logged once
//! and never matches; the remaining patterns keep working.
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

use crate::feed::FeedEntry;
use crate::util::ByteSize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeedRule {
    /// Include patterns, matched against the entry title.
    pub regexp: Vec<String>,
    /// Exclude patterns, checked before `regexp`.
    pub exclude: Vec<String>,
    pub min_size: Option<ByteSize>,
    pub max_size: Option<ByteSize>,
    /// Informational tags; not part of the match decision.
    pub categories: Vec<String>,

    #[serde(skip)]
    compiled: OnceLock<CompiledPatterns>,
}

/// Compiled include/exclude lists. `None` marks a pattern that failed to
/// compile and therefore never matches.
#[derive(Debug, Clone)]
struct CompiledPatterns {
    include: Vec<Option<Regex>>,
    exclude: Vec<Option<Regex>>,
}

impl FeedRule {
    pub fn new(include: &[&str], exclude: &[&str]) -> Self {
        Self {
            regexp: include.iter().map(|s| s.to_string()).collect(),
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_size_bounds(mut self, min: Option<u64>, max: Option<u64>) -> Self {
        self.min_size = min.map(ByteSize);
        self.max_size = max.map(ByteSize);
        self
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category)
    }

    fn min_bytes(&self) -> u64 {
        self.min_size.map_or(0, ByteSize::as_u64)
    }

    fn max_bytes(&self) -> u64 {
        self.max_size.map_or(0, ByteSize::as_u64)
    }

    fn patterns(&self) -> &CompiledPatterns {
        self.compiled.get_or_init(|| CompiledPatterns {
            include: compile_all(&self.regexp, "include"),
            exclude: compile_all(&self.exclude, "exclude"),
        })
    }

    /// Number of patterns that failed to compile.
    pub fn invalid_pattern_count(&self) -> usize {
        let p = self.patterns();
        p.include
            .iter()
            .chain(p.exclude.iter())
            .filter(|r| r.is_none())
            .count()
    }

    /// Decide whether `entry` should be acted on.
    pub fn matches(&self, entry: &FeedEntry) -> bool {
        let patterns = self.patterns();

        if any_match(&patterns.exclude, &entry.title) {
            tracing::debug!(title = %entry.title, "Excluded by pattern");
            return false;
        }

        let total = total_size(entry);

        let min = self.min_bytes();
        if min > 0 && total < min {
            tracing::debug!(title = %entry.title, size = total, min, "Too small");
            return false;
        }

        let max = self.max_bytes();
        if max > 0 && total > max {
            tracing::debug!(title = %entry.title, size = total, max, "Too large");
            return false;
        }

        any_match(&patterns.include, &entry.title)
    }
}

fn compile_all(sources: &[String], kind: &'static str) -> Vec<Option<Regex>> {
    sources
        .iter()
        .map(|src| match Regex::new(src) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::error!(pattern = %src, kind, error = %e, "Unable to compile pattern, disabling it");
                None
            }
        })
        .collect()
}

fn any_match(patterns: &[Option<Regex>], title: &str) -> bool {
    patterns.iter().flatten().any(|re| re.is_match(title))
}

/// Sum of every enclosure's declared length, skipping unparsable values.
pub fn total_size(entry: &FeedEntry) -> u64 {
    entry.enclosures.iter().fold(0u64, |acc, e| {
        match e.length.trim().parse::<u64>() {
            Ok(size) => acc.saturating_add(size),
            Err(err) => {
                tracing::warn!(
                    title = %entry.title,
                    length = %e.length,
                    error = %err,
                    "Unable to parse enclosure length"
                );
                acc
            }
        }
    })
}
