//! Control-plane HTTP client.
//!
//! One instance per registered server. Every call carries the device API
//! key and is bounded by a hard deadline so a wedged control plane can
//! never stall a reconciler. 401 and 404 are surfaced as their own variants
//! because the caller reacts to them structurally: 401 reloads credentials,
//! 404 un-roots the server.

use std::net::IpAddr;
use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::model::{Device, Vpn};
use crate::registry::Server;

/// Deadline for every control-plane request.
pub const HTTP_DEADLINE: Duration = Duration::from_secs(15);
/// Connection establishment (including the TLS handshake) deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("device not found")]
    NotFound,
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Result of a conditional status fetch.
pub enum FetchOutcome {
    /// 304: the cached body is still authoritative.
    NotModified,
    /// 200: new body and the ETag to present next time.
    Updated { body: Vec<u8>, etag: String },
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    server: String,
    device_id: String,
    api_key: String,
}

impl ApiClient {
    pub fn new(server: &str, device_id: &str, api_key: &str, source: Option<IpAddr>) -> Self {
        let mut builder = reqwest::Client::builder()
            .timeout(HTTP_DEADLINE)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(Config::user_agent());
        // Plain-http servers are local test rigs; binding the source address
        // only matters for real deployments.
        if !server.starts_with("http:") {
            if let Some(addr) = source {
                builder = builder.local_address(addr);
            }
        }
        let http = builder.build().expect("failed to build HTTP client");
        Self {
            http,
            server: server.trim_end_matches('/').to_string(),
            device_id: device_id.to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// Client for a registered server, using its cached Device credentials.
    pub fn for_server(config: &Config, server: &Server) -> Self {
        let device = server.config().device.unwrap_or_default();
        let source = config.source.as_deref().and_then(|s| s.parse().ok());
        Self::new(&device.server, &device.id, &device.api_key, source)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("X-API-KEY", &self.api_key)
            .header("Content-Type", "application/json")
    }

    /// Conditional fetch of the device's authoritative Message.
    pub async fn fetch_status(&self, etag: &str) -> Result<FetchOutcome, ApiError> {
        let url = format!("{}/api/v1.0/device/{}/status", self.server, self.device_id);
        debug!(%url, "GET");
        let resp = self
            .request(reqwest::Method::GET, &url)
            .header("If-None-Match", etag)
            .send()
            .await?;

        match resp.status() {
            StatusCode::NOT_MODIFIED => Ok(FetchOutcome::NotModified),
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
            StatusCode::NOT_FOUND => Err(ApiError::NotFound),
            StatusCode::OK => {
                let new_etag = resp
                    .headers()
                    .get("ETag")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                if new_etag != etag {
                    info!(old = %etag, new = %new_etag, "etag changed");
                }
                let body = resp.bytes().await?.to_vec();
                Ok(FetchOutcome::Updated {
                    body,
                    etag: new_etag,
                })
            }
            status => {
                warn!(%status, %url, "unexpected response");
                Err(ApiError::Status(status))
            }
        }
    }

    pub async fn get_device(&self) -> Result<Device, ApiError> {
        let url = format!("{}/api/v1.0/device/{}", self.server, self.device_id);
        debug!(%url, "GET");
        let resp = self.request(reqwest::Method::GET, &url).send().await?;
        match resp.status() {
            StatusCode::OK => Ok(resp.json().await?),
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
            StatusCode::NOT_FOUND => Err(ApiError::NotFound),
            status => Err(ApiError::Status(status)),
        }
    }

    pub async fn update_device(&self, device: &Device) -> Result<(), ApiError> {
        let url = format!("{}/api/v1.0/device/{}", self.server, device.id);
        info!(%url, "PATCH device");
        let resp = self
            .request(reqwest::Method::PATCH, &url)
            .json(device)
            .send()
            .await?;
        self.expect_ok(resp).await
    }

    pub async fn update_vpn(&self, vpn: &Vpn) -> Result<(), ApiError> {
        let url = format!("{}/api/v1.0/vpn/{}", self.server, vpn.id);
        info!(%url, vpn = %vpn.name, "PATCH vpn");
        let resp = self
            .request(reqwest::Method::PATCH, &url)
            .json(vpn)
            .send()
            .await?;
        self.expect_ok(resp).await
    }

    pub async fn delete_vpn(&self, id: &str) -> Result<(), ApiError> {
        let url = format!("{}/api/v1.0/vpn/{}", self.server, id);
        info!(%url, "DELETE vpn");
        let resp = self.request(reqwest::Method::DELETE, &url).send().await?;
        self.expect_ok(resp).await
    }

    async fn expect_ok(&self, resp: reqwest::Response) -> Result<(), ApiError> {
        match resp.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
            StatusCode::NOT_FOUND => Err(ApiError::NotFound),
            status => {
                let body = resp.text().await.unwrap_or_default();
                warn!(%status, %body, "request failed");
                Err(ApiError::Status(status))
            }
        }
    }
}
