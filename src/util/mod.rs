//! Utility functions for common operations.
//!
//! - **Units**: human-readable byte sizes (`"700MB"`) and durations (`"1d"`)
//! - **Text**: turning entry titles into safe file names
//! - **URLs**: feed URL validation and peer endpoint construction

mod text;
mod units;
mod url_validator;

use std::path::PathBuf;

pub use text::sanitize_filename;
pub use units::{parse_duration, parse_size, ByteSize, UnitParseError};
pub use url_validator::{endpoint_url, validate_feed_url, UrlValidationError};

/// Expand a leading `~` to `$HOME`.
///
/// Paths without a leading tilde, or when `HOME` is unset, are returned as-is.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            let rest = rest.trim_start_matches('/');
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
