//! A single simulator run.
//!
//! [`SessionContext`] carries the configuration and the external
//! collaborators; [`DeviceSession`] wires the components together and owns
//! the shared running flag for the lifetime of the run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use trackersim_core::config::timing;
use trackersim_core::{AlertData, ShadowConfig, ShadowConfigStore, SimulatorConfig};

use crate::certs::{CertificateGenerator, CertificateStore, OpensslGenerator};
use crate::cloud::{CloudApi, CloudError, NrfCloudClient};
use crate::connection::{
    ConnectError, ConnectMode, ConnectionCoordinator, CoordinatorSettings, Publisher,
};
use crate::connection_info::{ConnectionInfoCache, ConnectionInfoResolver};
use crate::diagnostics::{DeviceLookup, DiagnosticReport, HoldResult, SubscribeProbe};
use crate::generators::{default_route, TemperatureModel};
use crate::provisioning::{ProvisionError, ProvisionOutcome, ProvisioningManager};
use crate::router::MessageRouter;
use crate::telemetry::{TelemetryProducer, TelemetryScheduler};
use crate::transport::{MqttConnector, TransportConnector};

/// Alert sent once the session is running.
pub const STARTUP_ALERT: (i64, i64, &str) = (1, 0, "Device simulator started");

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Connection failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("Cloud client error: {0}")]
    Cloud(#[from] CloudError),

    #[error("Device {0} has no certificates; run provisioning first")]
    NotProvisioned(String),
}

/// Configuration plus the external collaborators of one run.
#[derive(Clone)]
pub struct SessionContext {
    pub config: SimulatorConfig,
    pub cloud: Arc<dyn CloudApi>,
    pub generator: Arc<dyn CertificateGenerator>,
    pub connector: Arc<dyn TransportConnector>,
}

impl SessionContext {
    /// Production collaborators: REST over reqwest, openssl, MQTT.
    pub fn from_config(config: SimulatorConfig) -> SessionResult<Self> {
        let cloud = NrfCloudClient::from_config(&config.cloud)?;
        Ok(Self {
            config,
            cloud: Arc::new(cloud),
            generator: Arc::new(OpensslGenerator::new()),
            connector: Arc::new(MqttConnector::new()),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.config.cloud.device_id
    }
}

/// All components of one run.
pub struct DeviceSession {
    ctx: SessionContext,
    certs: CertificateStore,
    shadow: Arc<ShadowConfigStore>,
    coordinator: Arc<ConnectionCoordinator>,
    router: Arc<MessageRouter>,
    producer: Arc<TelemetryProducer>,
    scheduler: TelemetryScheduler,
    running: Arc<AtomicBool>,
}

impl DeviceSession {
    pub fn new(ctx: SessionContext) -> Self {
        let config = &ctx.config;
        let device_id = config.cloud.device_id.clone();
        let certs = CertificateStore::new(&config.cloud.certs_dir, &device_id);

        let shadow = Arc::new(ShadowConfigStore::new(ShadowConfig::new(
            config.simulation.location_interval_seconds,
            false,
        )));

        let resolver = ConnectionInfoResolver::new(
            ctx.cloud.clone(),
            ConnectionInfoCache::new(&config.cloud.certs_dir, &device_id),
            &device_id,
        );
        let coordinator = Arc::new(ConnectionCoordinator::new(
            certs.clone(),
            resolver,
            ctx.connector.clone(),
            shadow.clone(),
            CoordinatorSettings::from_config(config),
        ));
        let publisher: Arc<dyn Publisher> = coordinator.clone();

        let router = Arc::new(MessageRouter::new(
            &device_id,
            shadow.clone(),
            publisher.clone(),
        ));
        let producer = Arc::new(TelemetryProducer::new(
            publisher,
            shadow.clone(),
            default_route(),
            TemperatureModel::new(
                config.simulation.temperature_base,
                config.simulation.temperature_variation,
            ),
        ));

        let running = Arc::new(AtomicBool::new(false));
        let scheduler = TelemetryScheduler::new(
            producer.clone(),
            running.clone(),
            Duration::from_secs(config.simulation.temperature_interval_seconds),
        );

        Self {
            ctx,
            certs,
            shadow,
            coordinator,
            router,
            producer,
            scheduler,
            running,
        }
    }

    pub fn device_id(&self) -> &str {
        self.ctx.device_id()
    }

    pub fn shadow(&self) -> &Arc<ShadowConfigStore> {
        &self.shadow
    }

    pub fn coordinator(&self) -> &Arc<ConnectionCoordinator> {
        &self.coordinator
    }

    pub fn producer(&self) -> &Arc<TelemetryProducer> {
        &self.producer
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Run provisioning alone.
    pub async fn provision(&self) -> SessionResult<ProvisionOutcome> {
        let manager = ProvisioningManager::new(
            self.certs.clone(),
            self.ctx.cloud.clone(),
            self.ctx.generator.clone(),
        );
        Ok(manager.ensure_provisioned().await?)
    }

    /// Provision if needed, connect, then start telemetry.
    pub async fn start(&self) -> SessionResult<()> {
        if !self.certs.exists() {
            self.provision().await?;
        }

        self.coordinator
            .connect(ConnectMode::Normal, self.router.clone())
            .await?;

        self.running.store(true, Ordering::SeqCst);
        info!(device_id = %self.device_id(), "Simulator running");

        let (kind, value, description) = STARTUP_ALERT;
        self.producer
            .send_alert(AlertData::new(kind, value, Some(description)))
            .await;
        self.scheduler.start();
        Ok(())
    }

    /// Stop the producers, then close the connection.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.scheduler.stop().await;
        self.coordinator.shutdown().await;
        info!(device_id = %self.device_id(), "Simulator stopped");
    }

    /// Run the three diagnostic probes and close the connection.
    pub async fn diagnose(&self) -> SessionResult<DiagnosticReport> {
        let device_id = self.device_id().to_string();

        info!("Step 1: checking device status on the cloud");
        let lookup = match self.ctx.cloud.get_device(&device_id).await {
            Ok(record) => {
                info!(tags = ?record.tags, "Device found");
                DeviceLookup::Found {
                    tags: record.tags,
                    firmware: record.firmware,
                }
            }
            Err(e) if e.is_not_found() => {
                warn!(device_id = %device_id, "Device not found on the cloud");
                DeviceLookup::NotFound
            }
            Err(e) => {
                warn!(error = %e, "Device lookup failed");
                DeviceLookup::Error {
                    message: e.to_string(),
                }
            }
        };
        let mut report = DiagnosticReport::new(&device_id, lookup);

        if !self.certs.exists() {
            return Err(SessionError::NotProvisioned(device_id));
        }

        info!("Step 2: connecting without subscribing");
        if let Err(e) = self
            .coordinator
            .connect(ConnectMode::Diagnostic, self.router.clone())
            .await
        {
            warn!(error = %e, "Diagnostic connect failed");
            report.connect_error = Some(e.to_string());
            self.coordinator.shutdown().await;
            return Ok(report);
        }

        let hold_secs = timing::DIAG_HOLD.as_secs();
        let mut hold = HoldResult::Stable { secs: hold_secs };
        for second in 1..=hold_secs {
            tokio::time::sleep(timing::POLL_INTERVAL).await;
            let connected = self.coordinator.is_connected();
            info!(second, connected, "Holding connection");
            if !connected {
                warn!("Connection dropped without any subscribe or publish");
                hold = HoldResult::Dropped { after_secs: second };
                break;
            }
        }
        report.hold = Some(hold);

        if matches!(hold, HoldResult::Stable { .. }) {
            info!("Step 3: subscribing to the command topic");
            let subscribed = self.coordinator.subscribe_commands().await;
            tokio::time::sleep(timing::DIAG_SUBSCRIBE_SETTLE).await;
            let connected_after = self.coordinator.is_connected();
            info!(subscribed, connected_after, "Subscribe probe finished");
            report.subscribe = Some(SubscribeProbe {
                subscribed,
                connected_after,
            });
        }

        self.coordinator.shutdown().await;
        info!(verdict = report.verdict(), "Diagnostics complete");
        Ok(report)
    }
}
