//! Transmission JSON-RPC client.
//!
//! Every request is a `POST` of `{"method": ..., "arguments": {...}}` to the
//! RPC endpoint. The daemon answers the first request of a session with
//! `409 Conflict` and an `X-Transmission-Session-Id` header; the client keeps
//! that id and replays the request once.
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use url::Url;

use crate::config::TransmissionConfig;
use crate::util::{endpoint_url, UrlValidationError};
use crate::vpn::PeerPortClient;

const SESSION_HEADER: &str = "X-Transmission-Session-Id";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid RPC endpoint: {0}")]
    Endpoint(#[from] UrlValidationError),

    #[error("HTTP error: status {0}")]
    HttpStatus(u16),

    #[error("Authentication rejected by Transmission")]
    Unauthorized,

    #[error("Session handshake failed: 409 without a session id")]
    Handshake,

    #[error("Request timed out")]
    Timeout,

    /// The daemon answered with a `result` other than "success".
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl RpcError {
    /// True when the request never produced a definitive answer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcError::Network(_) | RpcError::Timeout | RpcError::HttpStatus(500..=599)
        )
    }
}

/// Result of submitting a torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Added { id: Option<i64>, name: Option<String> },
    /// The daemon already has this torrent.
    Duplicate,
}

/// The download engine as seen by the poll cycle.
#[async_trait]
pub trait DownloadClient: Send + Sync {
    /// Submit a torrent reference (URL or magnet link).
    async fn add_torrent(
        &self,
        filename: &str,
        download_dir: Option<&str>,
    ) -> Result<AddOutcome, RpcError>;
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct TorrentRef {
    id: Option<i64>,
    name: Option<String>,
}

pub struct TransmissionClient {
    client: reqwest::Client,
    endpoint: Url,
    username: Option<String>,
    password: Option<SecretString>,
    session_id: RwLock<Option<String>>,
}

impl std::fmt::Debug for TransmissionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmissionClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl TransmissionClient {
    pub fn new(config: &TransmissionConfig) -> Result<Self, RpcError> {
        let endpoint = endpoint_url(config.https, &config.host, config.port, &config.path)?;
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            endpoint,
            username: config.username.clone().filter(|u| !u.is_empty()),
            password: config.password.clone().map(SecretString::from),
            session_id: RwLock::new(None),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, RpcError> {
        let mut request = self.client.post(self.endpoint.clone()).json(body);
        if let Some(user) = &self.username {
            let password = self.password.as_ref().map(|p| p.expose_secret().to_owned());
            request = request.basic_auth(user, password);
        }
        if let Some(id) = self.session_id.read().await.as_deref() {
            request = request.header(SESSION_HEADER, id);
        }
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                RpcError::Timeout
            } else {
                RpcError::Network(e)
            }
        })
    }

    /// Run one RPC method and return its `arguments` object.
    async fn call(&self, method: &str, arguments: Value) -> Result<Value, RpcError> {
        let body = json!({ "method": method, "arguments": arguments });

        let mut response = self.send(&body).await?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            let id = response
                .headers()
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
                .ok_or(RpcError::Handshake)?;
            tracing::debug!("Refreshed Transmission session id");
            *self.session_id.write().await = Some(id);
            response = self.send(&body).await?;
        }

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RpcError::Unauthorized);
        }
        if status == reqwest::StatusCode::CONFLICT {
            return Err(RpcError::Handshake);
        }
        if !status.is_success() {
            return Err(RpcError::HttpStatus(status.as_u16()));
        }

        let parsed: RpcResponse = response
            .json()
            .await
            .map_err(|e| RpcError::Decode(e.to_string()))?;
        if parsed.result != "success" {
            return Err(RpcError::Rpc(parsed.result));
        }
        Ok(parsed.arguments)
    }
}

#[async_trait]
impl DownloadClient for TransmissionClient {
    async fn add_torrent(
        &self,
        filename: &str,
        download_dir: Option<&str>,
    ) -> Result<AddOutcome, RpcError> {
        let mut args = json!({ "filename": filename });
        if let Some(dir) = download_dir.filter(|d| !d.is_empty()) {
            args["download-dir"] = Value::String(dir.to_owned());
        }

        let arguments = match self.call("torrent-add", args).await {
            Ok(a) => a,
            Err(RpcError::Rpc(msg)) if msg.contains("duplicate torrent") => {
                return Ok(AddOutcome::Duplicate);
            }
            Err(e) => return Err(e),
        };

        if arguments.get("torrent-duplicate").is_some() {
            return Ok(AddOutcome::Duplicate);
        }
        match arguments.get("torrent-added") {
            Some(added) => {
                let torrent: TorrentRef = serde_json::from_value(added.clone())
                    .map_err(|e| RpcError::Decode(e.to_string()))?;
                Ok(AddOutcome::Added {
                    id: torrent.id,
                    name: torrent.name,
                })
            }
            None => Err(RpcError::Decode(
                "torrent-add response has neither torrent-added nor torrent-duplicate".into(),
            )),
        }
    }
}

#[async_trait]
impl PeerPortClient for TransmissionClient {
    async fn port_test(&self) -> Result<bool, RpcError> {
        let arguments = self.call("port-test", json!({})).await?;
        arguments
            .get("port-is-open")
            .and_then(Value::as_bool)
            .ok_or_else(|| RpcError::Decode("port-test response lacks port-is-open".into()))
    }

    async fn set_peer_port(&self, port: u16) -> Result<(), RpcError> {
        self.call("session-set", json!({ "peer-port": port })).await?;
        tracing::info!(port, "Updated Transmission peer port");
        Ok(())
    }
}
