use thiserror::Error;
use url::Url;

/// Errors that can occur while validating or building URLs.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host: {0}")]
    MissingHost(String),
}

/// Validates a configured feed URL.
///
/// Only `http` and `https` are accepted. Private and loopback hosts are
/// allowed: indexers and feed proxies commonly live on the same LAN as the
/// download client.
pub fn validate_feed_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(UrlValidationError::MissingHost(url_str.to_owned()));
    }

    Ok(url)
}

/// Builds the base URL of an HTTP peer from its host/port/scheme settings.
///
/// `path` may be empty; otherwise it is joined with exactly one slash.
pub fn endpoint_url(https: bool, host: &str, port: u16, path: &str) -> Result<Url, UrlValidationError> {
    let scheme = if https { "https" } else { "http" };
    let path = path.trim_start_matches('/');
    let raw = format!("{scheme}://{}:{port}/{path}", host.trim());
    let url = Url::parse(&raw)?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(UrlValidationError::MissingHost(raw));
    }
    Ok(url)
}
