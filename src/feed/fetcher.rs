use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;

use super::parser::{parse_feed, ParsedItem};

const MAX_RETRIES: u32 = 3;
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const MAX_TORRENT_SIZE: usize = 10 * 1024 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur while retrieving a feed or a torrent file.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the 30-second timeout
    #[error("Request timed out")]
    Timeout,
    /// Feed XML could not be parsed as RSS or Atom
    #[error("Parse error: {0}")]
    Parse(String),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// The feed-fetch peer as seen by the poll cycle.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Retrieve and parse the feed at `url`.
    async fn fetch_feed(
        &self,
        url: &str,
        accept_invalid_certs: bool,
    ) -> Result<Vec<ParsedItem>, FetchError>;

    /// Retrieve the raw bytes of a `.torrent` file.
    async fn fetch_torrent(
        &self,
        url: &str,
        accept_invalid_certs: bool,
    ) -> Result<Vec<u8>, FetchError>;
}

/// [`FeedSource`] over HTTP(S).
///
/// Holds two clients: the default one validates certificates, the second is
/// used for feeds configured with `no_validate_cert`.
pub struct HttpFeedSource {
    client: reqwest::Client,
    insecure_client: reqwest::Client,
    retry_base: Duration,
}

impl HttpFeedSource {
    pub fn new() -> Result<Self, FetchError> {
        let user_agent = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()?;
        let insecure_client = reqwest::Client::builder()
            .user_agent(user_agent)
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self {
            client,
            insecure_client,
            retry_base: Duration::from_secs(1),
        })
    }

    /// Base delay of the exponential backoff used for 429/5xx responses.
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    fn client_for(&self, accept_invalid_certs: bool) -> &reqwest::Client {
        if accept_invalid_certs {
            &self.insecure_client
        } else {
            &self.client
        }
    }

    async fn get_with_retry(
        &self,
        url: &str,
        accept_invalid_certs: bool,
        limit: usize,
    ) -> Result<Vec<u8>, FetchError> {
        let client = self.client_for(accept_invalid_certs);
        let mut retry_count = 0;

        loop {
            let response = tokio::time::timeout(REQUEST_TIMEOUT, client.get(url).send())
                .await
                .map_err(|_| FetchError::Timeout)?
                .map_err(FetchError::Network)?;

            let status = response.status();
            let retryable =
                status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error();

            if retryable {
                if retry_count >= MAX_RETRIES {
                    return Err(if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        FetchError::RateLimited(MAX_RETRIES)
                    } else {
                        FetchError::HttpStatus(status.as_u16())
                    });
                }

                let delay = self.retry_base * 2u32.pow(retry_count);
                tracing::warn!(
                    url = %url,
                    status = %status,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Transient HTTP error, retrying after delay"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            // 4xx errors fail immediately
            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }

            match read_limited_bytes(response, limit).await {
                Ok(bytes) => return Ok(bytes),
                Err(FetchError::IncompleteResponse { expected, received })
                    if retry_count < MAX_RETRIES =>
                {
                    let delay = self.retry_base * 2u32.pow(retry_count);
                    tracing::debug!(
                        url = %url,
                        expected = expected,
                        received = received,
                        attempt = retry_count + 1,
                        "Retrying incomplete download"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch_feed(
        &self,
        url: &str,
        accept_invalid_certs: bool,
    ) -> Result<Vec<ParsedItem>, FetchError> {
        let bytes = self
            .get_with_retry(url, accept_invalid_certs, MAX_FEED_SIZE)
            .await?;
        let items = parse_feed(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;
        tracing::debug!(url = %url, items = items.len(), "Fetched feed");
        Ok(items)
    }

    async fn fetch_torrent(
        &self,
        url: &str,
        accept_invalid_certs: bool,
    ) -> Result<Vec<u8>, FetchError> {
        self.get_with_retry(url, accept_invalid_certs, MAX_TORRENT_SIZE)
            .await
    }
}

/// Collect a body of at most `limit` bytes.
///
/// A body shorter than its declared `Content-Length` is an error, not a
/// partial success: a truncated `.torrent` still gets written to disk or
/// handed to Transmission, which then rejects it as corrupt. Returning
/// [`FetchError::IncompleteResponse`] lets `get_with_retry` fetch it again.
async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let declared = response.content_length();
    if declared.is_some_and(|len| len > limit as u64) {
        return Err(FetchError::ResponseTooLarge);
    }

    let mut body = Vec::with_capacity(declared.map_or(0, |len| len as usize));
    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if body.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        body.extend_from_slice(&chunk);
    }

    match declared {
        Some(expected) if (body.len() as u64) < expected => Err(FetchError::IncompleteResponse {
            expected,
            received: body.len(),
        }),
        _ => Ok(body),
    }
}
