//! REST collaborator for the cloud backend.
//!
//! Only the calls the device lifecycle depends on are modelled:
//!
//! | Call | Endpoint |
//! |------|----------|
//! | account info | `GET /v1/account` |
//! | device record | `GET /v1/devices/{id}` |
//! | shadow patch | `PATCH /v1/devices/{id}/state` |
//! | onboarding | `POST /v1/devices` (CSV body, octet-stream) |
//! | trust anchor | `GET {root_ca_url}` |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use trackersim_core::config::endpoints;
use trackersim_core::CloudConfig;

/// Tag attached to every onboarded simulator device.
pub const ONBOARDING_TAG: &str = "simulator";

/// Longest error body kept in a [`CloudError::Status`].
const MAX_ERROR_BODY: usize = 300;

/// Result type for cloud calls.
pub type CloudResult<T> = Result<T, CloudError>;

/// Error type for REST calls.
#[derive(Debug, Error)]
pub enum CloudError {
    /// Non-success HTTP status
    #[error("{method} {path} -> HTTP {status}: {body}")]
    Status {
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    /// Network or protocol failure
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The response body did not have the expected shape
    #[error("Invalid response from {path}: {reason}")]
    Decode { path: String, reason: String },
}

impl CloudError {
    /// HTTP status for status errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            Self::Decode { .. } => None,
        }
    }

    /// The device already exists on the backend.
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(StatusCode::CONFLICT.as_u16())
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND.as_u16())
    }
}

/// Account metadata.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    #[serde(default)]
    pub mqtt_endpoint: Option<String>,
    #[serde(default)]
    pub mqtt_topic_prefix: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub team: Option<TeamInfo>,
    #[serde(default)]
    pub plan: Option<PlanInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamInfo {
    #[serde(default)]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanInfo {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

impl AccountInfo {
    /// Broker host, falling back to the public endpoint.
    pub fn mqtt_host(&self) -> &str {
        non_empty(self.mqtt_endpoint.as_deref()).unwrap_or(endpoints::MQTT_HOST)
    }

    /// Topic prefix without a trailing slash.
    pub fn topic_prefix(&self) -> &str {
        self.mqtt_topic_prefix
            .as_deref()
            .unwrap_or_default()
            .trim_end_matches('/')
    }

    /// Best-effort tenant id, for logging only.
    ///
    /// Precedence: `teamId`, `tenantId`, `team.tenantId`, then the tenant
    /// segment of the topic prefix (`prod/{tenant}/`).
    pub fn tenant_id(&self) -> Option<String> {
        non_empty(self.team_id.as_deref())
            .or_else(|| non_empty(self.tenant_id.as_deref()))
            .or_else(|| non_empty(self.team.as_ref().and_then(|t| t.tenant_id.as_deref())))
            .map(str::to_string)
            .or_else(|| {
                let segments: Vec<&str> = self
                    .topic_prefix()
                    .split('/')
                    .filter(|s| !s.is_empty())
                    .collect();
                match segments.as_slice() {
                    [_, tenant, ..] => Some((*tenant).to_string()),
                    [only] => Some((*only).to_string()),
                    [] => None,
                }
            })
    }
}

/// Device record as returned by `GET /v1/devices/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub state: DeviceShadowState,
    #[serde(default)]
    pub firmware: Value,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceShadowState {
    #[serde(default)]
    pub desired: DesiredState,
    #[serde(default)]
    pub reported: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub pairing: Pairing,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pairing {
    #[serde(default)]
    pub topics: PairingTopics,
}

/// Topic assignments the backend writes into the shadow after onboarding.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PairingTopics {
    #[serde(default)]
    pub d2c: Option<String>,
    #[serde(default)]
    pub c2d: Option<String>,
}

impl DeviceRecord {
    /// Both assigned topics, if the shadow carries them.
    pub fn assigned_topics(&self) -> Option<(String, String)> {
        let topics = &self.state.desired.pairing.topics;
        let d2c = non_empty(topics.d2c.as_deref())?;
        let c2d = non_empty(topics.c2d.as_deref())?;
        Some((d2c.to_string(), c2d.to_string()))
    }
}

/// REST calls the device lifecycle depends on.
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn get_account(&self) -> CloudResult<AccountInfo>;

    async fn get_device(&self, device_id: &str) -> CloudResult<DeviceRecord>;

    async fn update_device_state(&self, device_id: &str, state: &Value) -> CloudResult<()>;

    /// Register a device by uploading its certificate.
    async fn onboard_device(&self, device_id: &str, cert_pem: &str) -> CloudResult<()>;

    /// Download the trust anchor from its well-known location.
    async fn fetch_root_ca(&self) -> CloudResult<Vec<u8>>;
}

/// Build the onboarding CSV line: `deviceId,[subType],tags,[fwTypes],"certPem"`.
pub fn onboarding_line(device_id: &str, tag: &str, cert_pem: &str) -> String {
    format!("{},,{},,\"{}\n\"", device_id, tag, cert_pem.trim())
}

/// reqwest-backed client.
pub struct NrfCloudClient {
    client: Client,
    api_host: String,
    api_key: String,
    root_ca_url: String,
}

impl NrfCloudClient {
    pub fn new(
        api_host: impl Into<String>,
        api_key: impl Into<String>,
        root_ca_url: impl Into<String>,
    ) -> CloudResult<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            api_host: api_host.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            root_ca_url: root_ca_url.into(),
        })
    }

    pub fn from_config(config: &CloudConfig) -> CloudResult<Self> {
        Self::new(&config.api_host, &config.api_key, &config.root_ca_url)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_host, path)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> CloudResult<reqwest::Response> {
        let mut request = self
            .client
            .request(method.clone(), self.url(path))
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }
        debug!(method = %method, path = %path, "Cloud API request");
        check_status(method.as_str(), path, request.send().await?).await
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
    ) -> CloudResult<T> {
        let response = self.send(method, path, None).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| CloudError::Decode {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }
}

async fn check_status(
    method: &str,
    path: &str,
    response: reqwest::Response,
) -> CloudResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    warn!(method = %method, path = %path, status = status.as_u16(), "Cloud API error");
    Err(CloudError::Status {
        method: method.to_string(),
        path: path.to_string(),
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl CloudApi for NrfCloudClient {
    async fn get_account(&self) -> CloudResult<AccountInfo> {
        self.send_json(Method::GET, "/v1/account").await
    }

    async fn get_device(&self, device_id: &str) -> CloudResult<DeviceRecord> {
        self.send_json(Method::GET, &format!("/v1/devices/{}", device_id))
            .await
    }

    async fn update_device_state(&self, device_id: &str, state: &Value) -> CloudResult<()> {
        self.send(
            Method::PATCH,
            &format!("/v1/devices/{}/state", device_id),
            Some(state),
        )
        .await?;
        Ok(())
    }

    async fn onboard_device(&self, device_id: &str, cert_pem: &str) -> CloudResult<()> {
        let path = "/v1/devices";
        let line = onboarding_line(device_id, ONBOARDING_TAG, cert_pem);
        debug!(device_id = %device_id, "Uploading device certificate");
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(line)
            .send()
            .await?;
        check_status("POST", path, response).await?;
        Ok(())
    }

    async fn fetch_root_ca(&self) -> CloudResult<Vec<u8>> {
        let response = self.client.get(&self.root_ca_url).send().await?;
        let response = check_status("GET", &self.root_ca_url, response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
