use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::{TunnelSidecar, TunnelStatus};
use crate::config::GluetunConfig;
use crate::util::{endpoint_url, UrlValidationError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_ROUTE: &str = "v1/openvpn/status";
const PORT_ROUTE: &str = "v1/openvpn/portforwarded";

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid Gluetun endpoint: {0}")]
    Endpoint(#[from] UrlValidationError),

    #[error("HTTP error: status {0}")]
    HttpStatus(u16),

    #[error("Unsupported tunnel status: {0:?}")]
    UnsupportedStatus(String),

    #[error("Unexpected response: {0}")]
    Decode(String),
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
}

#[derive(Debug, Deserialize)]
struct PortBody {
    port: u16,
}

/// Client for the Gluetun control server.
#[derive(Debug, Clone)]
pub struct GluetunClient {
    client: reqwest::Client,
    base: Url,
}

impl GluetunClient {
    pub fn new(config: &GluetunConfig) -> Result<Self, SidecarError> {
        let base = endpoint_url(config.https, &config.host, config.port, "/")?;
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, base })
    }

    fn route(&self, route: &str) -> Result<Url, SidecarError> {
        self.base
            .join(route)
            .map_err(|e| SidecarError::Endpoint(UrlValidationError::InvalidUrl(e)))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, route: &str) -> Result<T, SidecarError> {
        let response = self.client.get(self.route(route)?).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SidecarError::HttpStatus(status.as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| SidecarError::Decode(e.to_string()))
    }
}

#[async_trait]
impl TunnelSidecar for GluetunClient {
    async fn status(&self) -> Result<TunnelStatus, SidecarError> {
        let body: StatusBody = self.get_json(STATUS_ROUTE).await?;
        match body.status.as_str() {
            "running" => Ok(TunnelStatus::Running),
            "stopped" => Ok(TunnelStatus::Stopped),
            _ => Err(SidecarError::UnsupportedStatus(body.status)),
        }
    }

    async fn forwarded_port(&self) -> Result<u16, SidecarError> {
        let body: PortBody = self.get_json(PORT_ROUTE).await?;
        Ok(body.port)
    }

    async fn request_restart(&self) -> Result<(), SidecarError> {
        let response = self
            .client
            .put(self.route(STATUS_ROUTE)?)
            .json(&json!({ "status": "stopped" }))
            .send()
            .await?;
        // The tunnel restarts on its own; the answer carries nothing we act on.
        tracing::debug!(status = %response.status(), "Requested tunnel restart");
        Ok(())
    }
}
