//! Transport addressing and its per-device cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cloud::{CloudApi, CloudResult};

/// Broker host and the two topics a device uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default)]
    pub mqtt_host: String,
    #[serde(default)]
    pub topic_d2c: String,
    #[serde(default)]
    pub topic_c2d: String,
}

impl ConnectionInfo {
    /// Both topics are present.
    pub fn is_valid(&self) -> bool {
        !self.topic_d2c.trim().is_empty() && !self.topic_c2d.trim().is_empty()
    }

    /// Topics built from the account prefix when the shadow has none yet.
    pub fn fallback(mqtt_host: &str, prefix: &str, device_id: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self {
            mqtt_host: mqtt_host.to_string(),
            topic_d2c: format!("{}/m/d/{}/d2c", prefix, device_id),
            topic_c2d: format!("{}/m/d/{}/+/r", prefix, device_id),
        }
    }
}

/// Where a resolved [`ConnectionInfo`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoSource {
    Cache,
    /// Topics assigned in the device shadow
    Shadow,
    /// Topics constructed from the account prefix
    Fallback,
}

/// JSON cache file `{dir}/{device_id}.mqtt_info.json`.
#[derive(Debug, Clone)]
pub struct ConnectionInfoCache {
    path: PathBuf,
}

impl ConnectionInfoCache {
    pub fn new(dir: impl AsRef<Path>, device_id: &str) -> Self {
        Self {
            path: dir.as_ref().join(format!("{}.mqtt_info.json", device_id)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load a valid cached entry. Missing, unreadable or incomplete files
    /// all count as a miss.
    pub async fn load(&self) -> Option<ConnectionInfo> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read connection cache");
                return None;
            }
        };
        match serde_json::from_str::<ConnectionInfo>(&content) {
            Ok(info) if info.is_valid() => Some(info),
            Ok(_) => {
                debug!(path = %self.path.display(), "Cached connection info is incomplete");
                None
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring corrupt connection cache");
                None
            }
        }
    }

    pub async fn save(&self, info: &ConnectionInfo) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(info).map_err(std::io::Error::other)?;
        tokio::fs::write(&self.path, json).await
    }
}

/// Cache-first resolution of a device's transport addressing.
pub struct ConnectionInfoResolver {
    cloud: Arc<dyn CloudApi>,
    cache: ConnectionInfoCache,
    device_id: String,
}

impl ConnectionInfoResolver {
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        cache: ConnectionInfoCache,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            cloud,
            cache,
            device_id: device_id.into(),
        }
    }

    pub fn cache(&self) -> &ConnectionInfoCache {
        &self.cache
    }

    pub async fn resolve(&self) -> CloudResult<(ConnectionInfo, InfoSource)> {
        if let Some(info) = self.cache.load().await {
            debug!(device_id = %self.device_id, "Using cached connection info");
            return Ok((info, InfoSource::Cache));
        }

        info!(device_id = %self.device_id, "Fetching connection info from the cloud");
        let account = self.cloud.get_account().await?;
        match account.tenant_id() {
            Some(tenant) => info!(tenant_id = %tenant, "Resolved account tenant"),
            None => debug!("Account tenant id unavailable"),
        }

        let device = self.cloud.get_device(&self.device_id).await?;
        let (info, source) = match device.assigned_topics() {
            Some((d2c, c2d)) => (
                ConnectionInfo {
                    mqtt_host: account.mqtt_host().to_string(),
                    topic_d2c: d2c,
                    topic_c2d: c2d,
                },
                InfoSource::Shadow,
            ),
            None => {
                info!("Topics not in device shadow, using fallback");
                (
                    ConnectionInfo::fallback(
                        account.mqtt_host(),
                        account.topic_prefix(),
                        &self.device_id,
                    ),
                    InfoSource::Fallback,
                )
            }
        };

        info!(
            host = %info.mqtt_host,
            d2c = %info.topic_d2c,
            c2d = %info.topic_c2d,
            "Resolved connection info"
        );
        if let Err(e) = self.cache.save(&info).await {
            warn!(
                path = %self.cache.path().display(),
                error = %e,
                "Failed to write connection cache"
            );
        }
        Ok((info, source))
    }
}
