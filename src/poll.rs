//! One pass over every configured feed.
//!
//! For each feed: fetch (once per URL per cycle), filter, consult the caches,
//! act on the entry according to the [`RunMode`], and record the result. The
//! pass ends with retention eviction and a cache flush.
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::cache::{CacheError, CacheFile, SeenRecord};
use crate::config::{Config, FeedConfig};
use crate::feed::{FeedEntry, FeedSource, FetchError, ParsedItem};
use crate::prompt::{PromptChoice, Prompter};
use crate::transmission::{AddOutcome, DownloadClient, RpcError};
use crate::util::sanitize_filename;

/// What to do with entries that match and are new.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Submit to the download engine.
    #[default]
    Torrent,
    /// Save the `.torrent` file into `dir`.
    Download { dir: PathBuf },
    /// Record as seen without acting.
    Skip,
    /// Log matches only; nothing is recorded.
    NoAction,
    /// Ask a [`Prompter`] for every entry. Downloads go to `dir`.
    Interactive { dir: PathBuf },
}

/// Outcome of consulting the caches for one matching entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// New and not held down.
    Dispatch,
    /// Already recorded as seen; never act on it again.
    SkipPersist,
    /// A recent dispatch failed; retry after the hold-down.
    SkipTransient,
}

/// Pure cache consultation for an entry that passed the filter.
pub fn decide(entry: &FeedEntry, cache: &CacheFile, now: DateTime<Utc>) -> Decision {
    if cache.exists(&entry.feed_name, &entry.guid) {
        Decision::SkipPersist
    } else if !cache.errors().is_new(&entry.guid, now) {
        Decision::SkipTransient
    } else {
        Decision::Dispatch
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOptions {
    pub mode: RunMode,
    /// Restrict the pass to these feed aliases. Empty means all.
    pub feeds: Vec<String>,
}

/// Counters of one pass, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub feeds_checked: usize,
    pub feeds_failed: usize,
    pub matched: usize,
    pub dispatched: usize,
    pub duplicates: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub already_seen: usize,
    pub held_down: usize,
    pub failed: usize,
    pub evicted: usize,
    pub flushed: bool,
    pub quit: bool,
}

/// Collaborators of a pass.
pub struct CycleContext<'a> {
    pub config: &'a Config,
    pub cache: &'a mut CacheFile,
    pub source: &'a dyn FeedSource,
    pub client: &'a dyn DownloadClient,
    /// Required by [`RunMode::Interactive`].
    pub prompter: Option<&'a dyn Prompter>,
}

#[derive(Debug, Error)]
enum DispatchError {
    #[error("no application/x-bittorrent enclosure")]
    NoTorrentUrl,
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Prompt failed: {0}")]
    Prompt(std::io::Error),
}

/// Action picked for a single entry.
enum Action {
    Torrent,
    Download(PathBuf),
    Skip,
    Ignore,
    Quit,
}

/// Run one pass. Only a failure to persist the cache is returned; everything
/// else is logged and counted.
pub async fn run_cycle(
    ctx: &mut CycleContext<'_>,
    options: &CycleOptions,
    now: DateTime<Utc>,
) -> Result<CycleReport, CacheError> {
    let config = ctx.config;
    let mut report = CycleReport::default();
    ctx.cache.errors_mut().set_hold_down(config.hold_down());

    for name in &options.feeds {
        if !config.feeds.contains_key(name) {
            tracing::warn!(feed = %name, "Requested feed is not configured");
        }
    }

    // (url, accept_invalid_certs) -> items; None marks a failed fetch
    let mut fetched: HashMap<(&str, bool), Option<Vec<ParsedItem>>> = HashMap::new();

    'feeds: for (name, feed) in &config.feeds {
        if !options.feeds.is_empty() && !options.feeds.iter().any(|f| f == name) {
            continue;
        }

        let key = (feed.url.as_str(), feed.no_validate_cert);
        if !fetched.contains_key(&key) {
            let result = match ctx.source.fetch_feed(&feed.url, feed.no_validate_cert).await {
                Ok(items) => Some(items),
                Err(e) => {
                    tracing::warn!(feed = %name, url = %feed.url, error = %e, "Unable to fetch feed");
                    None
                }
            };
            fetched.insert(key, result);
        }
        let Some(items) = fetched.get(&key).and_then(Option::as_ref) else {
            report.feeds_failed += 1;
            continue;
        };
        report.feeds_checked += 1;

        for item in items {
            let entry = FeedEntry::new(name, item.clone());
            if !feed.rule.matches(&entry) {
                continue;
            }
            report.matched += 1;

            match decide(&entry, &*ctx.cache, now) {
                Decision::SkipPersist => {
                    tracing::debug!(feed = %name, title = %entry.title, "Skipping due to cache hit");
                    report.already_seen += 1;
                    continue;
                }
                Decision::SkipTransient => {
                    tracing::debug!(feed = %name, title = %entry.title, "Skipping held-down entry");
                    report.held_down += 1;
                    continue;
                }
                Decision::Dispatch => {}
            }

            let action = match choose_action(&*ctx, &options.mode, &entry).await {
                Ok(action) => action,
                Err(e) => {
                    tracing::error!(error = %e, "Unable to read selection, stopping");
                    report.quit = true;
                    break 'feeds;
                }
            };

            match action {
                Action::Quit => {
                    report.quit = true;
                    break 'feeds;
                }
                Action::Ignore => {}
                Action::Skip => {
                    ctx.cache.add_item(SeenRecord::for_entry(&entry, now));
                    report.skipped += 1;
                }
                Action::Torrent => {
                    match torrent(ctx.client, feed, &entry).await {
                        Ok(AddOutcome::Added { .. }) => {
                            tracing::info!(feed = %name, title = %entry.title, "Torrenting");
                            report.dispatched += 1;
                            ctx.cache.add_item(SeenRecord::for_entry(&entry, now));
                        }
                        Ok(AddOutcome::Duplicate) => {
                            tracing::warn!(feed = %name, title = %entry.title, "Skipping duplicate torrent");
                            report.duplicates += 1;
                            ctx.cache.add_item(SeenRecord::for_entry(&entry, now));
                        }
                        Err(e) => {
                            tracing::error!(feed = %name, title = %entry.title, error = %e, "Unable to torrent");
                            report.failed += 1;
                            ctx.cache.errors_mut().record_failure(&entry.guid, now);
                        }
                    }
                }
                Action::Download(dir) => match download(ctx.source, feed, &entry, &dir).await {
                    Ok(path) => {
                        tracing::info!(feed = %name, path = %path.display(), "Downloaded torrent file");
                        report.downloaded += 1;
                        ctx.cache.add_item(SeenRecord::for_entry(&entry, now));
                    }
                    Err(e) => {
                        tracing::error!(feed = %name, title = %entry.title, error = %e, "Unable to download");
                        report.failed += 1;
                        ctx.cache.errors_mut().record_failure(&entry.guid, now);
                    }
                },
            }
        }
    }

    report.evicted = ctx.cache.evict(config.retention(), now);
    report.flushed = ctx.cache.flush()?;

    tracing::info!(
        feeds = report.feeds_checked,
        failed_feeds = report.feeds_failed,
        matched = report.matched,
        dispatched = report.dispatched,
        downloaded = report.downloaded,
        failed = report.failed,
        "Cycle complete"
    );
    Ok(report)
}

async fn choose_action(
    ctx: &CycleContext<'_>,
    mode: &RunMode,
    entry: &FeedEntry,
) -> Result<Action, DispatchError> {
    Ok(match mode {
        RunMode::Torrent => Action::Torrent,
        RunMode::Download { dir } => Action::Download(dir.clone()),
        RunMode::Skip => Action::Skip,
        RunMode::NoAction => {
            tracing::info!(feed = %entry.feed_name, title = %entry.title, "Match");
            Action::Ignore
        }
        RunMode::Interactive { dir } => {
            let Some(prompter) = ctx.prompter else {
                tracing::warn!("Interactive mode without a prompter, taking no action");
                return Ok(Action::Ignore);
            };
            match prompter.choose(entry).await.map_err(DispatchError::Prompt)? {
                PromptChoice::Torrent => Action::Torrent,
                PromptChoice::Download => Action::Download(dir.clone()),
                PromptChoice::Skip => Action::Skip,
                PromptChoice::SkipOnce => Action::Ignore,
                PromptChoice::Quit => Action::Quit,
            }
        }
    })
}

async fn torrent(
    client: &dyn DownloadClient,
    feed: &FeedConfig,
    entry: &FeedEntry,
) -> Result<AddOutcome, DispatchError> {
    let url = entry.torrent_url().ok_or(DispatchError::NoTorrentUrl)?;
    Ok(client.add_torrent(url, feed.download_path.as_deref()).await?)
}

async fn download(
    source: &dyn FeedSource,
    feed: &FeedConfig,
    entry: &FeedEntry,
    dir: &Path,
) -> Result<PathBuf, DispatchError> {
    let url = entry.torrent_url().ok_or(DispatchError::NoTorrentUrl)?;
    let bytes = source.fetch_torrent(url, feed.no_validate_cert).await?;

    let path = dir.join(format!("{}.torrent", sanitize_filename(&entry.title)));
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|source| DispatchError::Write {
            path: path.clone(),
            source,
        })?;
    Ok(path)
}
