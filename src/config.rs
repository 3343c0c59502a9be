//! Configuration file parser.
//!
//! Looked up at `~/.rss2transmission/config.toml`,
//! `~/.config/rss2transmission/config.toml`, then
//! `/etc/rss2transmission/config.toml` unless a path is given explicitly.
//! Every key has a default; unknown keys are accepted but logged as likely
//! typos.
//!
//! The running process shares its configuration through a [`ConfigHandle`]:
//! a reload swaps in a whole new [`Config`] and readers keep the snapshot
//! they took until they ask for a new one.
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use crate::cache::{RetentionAnchor, RetentionPolicy};
use crate::filter::FeedRule;
use crate::util::{expand_home, parse_duration, validate_feed_url};
use crate::vpn::RotationSettings;

/// Longest accepted `error_hold_down_hours` (one year).
pub const MAX_HOLD_DOWN_HOURS: u32 = 24 * 365;

/// Longest accepted `gluetun.rotate` interval, in days.
pub const MAX_ROTATE_DAYS: i64 = 365;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("No config file found (searched: {})", format_paths(.0))]
    NotFound(Vec<PathBuf>),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// Configuration Structs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path of the seen/error cache file. A leading `~` is expanded.
    pub seen_file: String,

    /// Days a seen record is kept.
    pub seen_cache_days: u32,

    /// Hours a failed entry is held down before it is retried.
    pub error_hold_down_hours: u32,

    pub retention_anchor: RetentionAnchor,

    pub transmission: TransmissionConfig,

    pub gluetun: GluetunConfig,

    /// Feeds by alias. Sorted, so cycles visit them in a stable order.
    pub feeds: BTreeMap<String, FeedConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seen_file: "~/.config/rss2transmission/seen.json".to_string(),
            seen_cache_days: 30,
            error_hold_down_hours: 1,
            retention_anchor: RetentionAnchor::default(),
            transmission: TransmissionConfig::default(),
            gluetun: GluetunConfig::default(),
            feeds: BTreeMap::new(),
        }
    }
}

/// Connection settings of the Transmission RPC endpoint.
///
/// Debug output masks `password`.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct TransmissionConfig {
    pub host: String,
    pub port: u16,
    pub https: bool,
    pub path: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for TransmissionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9091,
            https: false,
            path: "/transmission/rpc".to_string(),
            username: Some("admin".to_string()),
            password: Some("admin".to_string()),
        }
    }
}

impl std::fmt::Debug for TransmissionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmissionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("https", &self.https)
            .field("path", &self.path)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Gluetun control server. An empty host disables tunnel rotation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GluetunConfig {
    pub host: String,
    pub port: u16,
    pub https: bool,
    /// Rotation interval such as `"12h"` or `"1d"`. Empty disables.
    pub rotate: String,
    /// Rotate after this many consecutive closed-port reports. 0 disables.
    pub rotate_failure: u32,
}

impl Default for GluetunConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8000,
            https: false,
            rotate: String::new(),
            rotate_failure: 3,
        }
    }
}

impl GluetunConfig {
    pub fn is_enabled(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0
    }

    pub fn rotation_settings(&self) -> Result<RotationSettings, ConfigError> {
        let interval = if self.rotate.trim().is_empty() {
            chrono::Duration::zero()
        } else {
            let std = parse_duration(&self.rotate).map_err(|e| ConfigError::InvalidValue {
                key: "gluetun.rotate".into(),
                reason: e.to_string(),
            })?;
            chrono::Duration::from_std(std)
                .ok()
                .filter(|d| *d <= chrono::Duration::days(MAX_ROTATE_DAYS))
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "gluetun.rotate".into(),
                    reason: format!("must not exceed {MAX_ROTATE_DAYS} days"),
                })?
        };
        Ok(RotationSettings {
            interval,
            failure_threshold: self.rotate_failure,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub url: String,
    /// Destination directory passed to the download engine.
    pub download_path: Option<String>,
    /// Accept invalid TLS certificates when fetching this feed.
    pub no_validate_cert: bool,
    #[serde(flatten)]
    pub rule: FeedRule,
}

// ============================================================================
// Loading
// ============================================================================

const TOP_LEVEL_KEYS: &[&str] = &[
    "seen_file",
    "seen_cache_days",
    "error_hold_down_hours",
    "retention_anchor",
    "transmission",
    "gluetun",
    "feeds",
];

const FEED_KEYS: &[&str] = &[
    "url",
    "download_path",
    "no_validate_cert",
    "regexp",
    "exclude",
    "min_size",
    "max_size",
    "categories",
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Candidate locations, in search order.
    pub fn search_paths() -> Vec<PathBuf> {
        vec![
            expand_home("~/.rss2transmission/config.toml"),
            expand_home("~/.config/rss2transmission/config.toml"),
            PathBuf::from("/etc/rss2transmission/config.toml"),
        ]
    }

    /// Resolve the config path: `explicit` if given, else the first existing
    /// search path.
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        let candidates = Self::search_paths();
        candidates
            .iter()
            .find(|p| p.is_file())
            .cloned()
            .ok_or(ConfigError::NotFound(candidates))
    }

    /// Load and validate a TOML file.
    ///
    /// - Missing file → `Err(ConfigError::Io)`
    /// - Empty file → defaults (no feeds)
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let meta = std::fs::metadata(path)?;
        if meta.len() > Self::MAX_FILE_SIZE {
            return Err(ConfigError::TooLarge(format!(
                "Config file is {} bytes (max {} bytes)",
                meta.len(),
                Self::MAX_FILE_SIZE
            )));
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        tracing::info!(
            path = %path.display(),
            feeds = config.feeds.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            tracing::debug!("Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, feed) in &self.feeds {
            validate_feed_url(&feed.url).map_err(|e| ConfigError::InvalidValue {
                key: format!("feeds.{name}.url"),
                reason: e.to_string(),
            })?;
            if let (Some(min), Some(max)) = (feed.rule.min_size, feed.rule.max_size) {
                if min.as_u64() > 0 && max.as_u64() > 0 && min.as_u64() > max.as_u64() {
                    return Err(ConfigError::InvalidValue {
                        key: format!("feeds.{name}.min_size"),
                        reason: format!("{min} is larger than max_size {max}"),
                    });
                }
            }
            let invalid = feed.rule.invalid_pattern_count();
            if invalid > 0 {
                tracing::warn!(feed = %name, invalid, "Feed has patterns that will never match");
            }
        }
        if self.error_hold_down_hours > MAX_HOLD_DOWN_HOURS {
            return Err(ConfigError::InvalidValue {
                key: "error_hold_down_hours".into(),
                reason: format!("must not exceed {MAX_HOLD_DOWN_HOURS}"),
            });
        }
        self.gluetun.rotation_settings()?;
        Ok(())
    }

    pub fn seen_path(&self) -> PathBuf {
        expand_home(&self.seen_file)
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy::days(self.seen_cache_days, self.retention_anchor)
    }

    pub fn hold_down(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.error_hold_down_hours))
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    for key in raw.keys() {
        if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
        }
    }

    let Some(toml::Value::Table(feeds)) = raw.get("feeds") else {
        return;
    };
    for (name, feed) in feeds {
        if let toml::Value::Table(table) = feed {
            for key in table.keys() {
                if !FEED_KEYS.contains(&key.as_str()) {
                    tracing::warn!(feed = %name, key = %key, "Unknown feed key in config file, ignoring");
                }
            }
        }
    }
}

// ============================================================================
// Live configuration
// ============================================================================

/// Shared, reloadable configuration.
///
/// Readers call [`snapshot`](Self::snapshot) once per unit of work and use
/// only that snapshot; a reload replaces the pointer, never the contents.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    path: PathBuf,
    current: Arc<Mutex<Arc<Config>>>,
}

impl ConfigHandle {
    pub fn new(path: PathBuf, config: Config) -> Self {
        Self {
            path,
            current: Arc::new(Mutex::new(Arc::new(config))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<Config> {
        let guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub fn replace(&self, config: Config) {
        let mut guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(config);
    }

    /// Re-read the file. On error the current snapshot stays active.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let config = Config::load(&self.path)?;
        self.replace(config);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
