//! Connection coordinator.
//!
//! Owns the transport session and the connection state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!      ^              |             |
//!      +--------------+-------------+   (rejection, timeout, drop)
//!
//! any state -> Closed                    (explicit shutdown)
//! Connecting -> Failed                   (transport could not be opened)
//! ```
//!
//! Transport events arrive on a channel and are dispatched by a single task,
//! so the state has exactly one writer besides `connect` and `shutdown`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use trackersim_core::config::timing;
use trackersim_core::{DeviceSnapshot, Envelope, ShadowConfigStore, SimulatorConfig};

use crate::certs::{CertError, CertificateStore};
use crate::cloud::CloudError;
use crate::connection_info::{ConnectionInfo, ConnectionInfoResolver};
use crate::router::InboundHandler;
use crate::transport::{
    ConnectFailure, Transport, TransportConnector, TransportError, TransportEvent,
    TransportOptions,
};

/// Connection state. Only the coordinator mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The transport could not be opened at all
    Failed,
    /// Shut down; terminal
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Failed, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Failed)
                | (Connected, Disconnected)
                | (Disconnected | Connecting | Connected | Failed, Closed)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Connect variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Subscribe and publish the startup snapshot after connecting
    Normal,
    /// Hold a bare connection: no subscribe, no snapshot
    Diagnostic,
}

/// Result type for connect.
pub type ConnectResult<T> = Result<T, ConnectError>;

/// Connect failures. All of them are fatal to the session.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Cannot connect without identity material: {0}")]
    MissingIdentity(#[from] CertError),

    #[error("Failed to resolve connection info: {0}")]
    Resolve(#[from] CloudError),

    #[error("Failed to open transport: {0}")]
    Transport(#[from] TransportError),

    #[error("Connection refused: {0}")]
    Rejected(ConnectFailure),

    #[error("Not connected after {0:?}")]
    Timeout(Duration),

    #[error("Coordinator is closed")]
    Closed,
}

/// Outbound side of the connection, as seen by producers.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Publish on the device-to-cloud topic. Never errors: returns whether
    /// the message was accepted by the transport.
    async fn publish(&self, message: &Envelope) -> bool;
}

/// Timing and reporting parameters for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub transport: TransportOptions,
    pub connect_timeout: Duration,
    pub settle_delay: Duration,
    pub app_version: String,
}

impl CoordinatorSettings {
    pub fn from_config(config: &SimulatorConfig) -> Self {
        Self {
            transport: TransportOptions::from(&config.mqtt),
            connect_timeout: config.mqtt.connect_timeout(),
            settle_delay: config.mqtt.settle_delay(),
            app_version: config.simulation.app_version.clone(),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&SimulatorConfig::new("", "device"))
    }
}

/// Owns one transport session and its state machine.
pub struct ConnectionCoordinator {
    certs: CertificateStore,
    resolver: ConnectionInfoResolver,
    connector: Arc<dyn TransportConnector>,
    shadow: Arc<ShadowConfigStore>,
    settings: CoordinatorSettings,
    state: RwLock<ConnectionState>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    info: RwLock<Option<ConnectionInfo>>,
    last_failure: RwLock<Option<ConnectFailure>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    drops: AtomicU64,
}

impl ConnectionCoordinator {
    pub fn new(
        certs: CertificateStore,
        resolver: ConnectionInfoResolver,
        connector: Arc<dyn TransportConnector>,
        shadow: Arc<ShadowConfigStore>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            certs,
            resolver,
            connector,
            shadow,
            settings,
            state: RwLock::new(ConnectionState::Disconnected),
            transport: RwLock::new(None),
            info: RwLock::new(None),
            last_failure: RwLock::new(None),
            dispatcher: Mutex::new(None),
            drops: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Connection info resolved by the last `connect`.
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.info.read().clone()
    }

    /// Most recent broker refusal, cleared by a successful ConnAck.
    pub fn last_failure(&self) -> Option<ConnectFailure> {
        *self.last_failure.read()
    }

    /// Unexpected disconnects seen since construction.
    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.write();
        if *state == next {
            return true;
        }
        if !state.can_transition_to(next) {
            debug!(from = %*state, to = %next, "Ignoring illegal state transition");
            return false;
        }
        debug!(from = %*state, to = %next, "Connection state changed");
        *state = next;
        true
    }

    /// Open the transport and wait for the handshake.
    ///
    /// Returns once the broker accepted the connection, or with an error
    /// when identity material is missing, addressing cannot be resolved,
    /// the transport cannot be opened, or the timeout budget runs out.
    /// Inbound messages are handed to `inbound`.
    pub async fn connect(
        self: &Arc<Self>,
        mode: ConnectMode,
        inbound: Arc<dyn InboundHandler>,
    ) -> ConnectResult<()> {
        let identity = self.certs.load_identity()?;

        match self.state() {
            ConnectionState::Closed => return Err(ConnectError::Closed),
            ConnectionState::Connected => return Ok(()),
            _ => {}
        }
        self.transition(ConnectionState::Connecting);
        *self.last_failure.write() = None;

        let info = match self.resolver.resolve().await {
            Ok((info, source)) => {
                debug!(source = ?source, "Connection info resolved");
                info
            }
            Err(e) => {
                self.transition(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };
        *self.info.write() = Some(info.clone());

        let session = match self
            .connector
            .open(&identity, &info, &self.settings.transport)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Failed to open transport");
                self.transition(ConnectionState::Failed);
                return Err(e.into());
            }
        };
        *self.transport.write() = Some(session.transport);

        let handle = tokio::spawn(dispatch_events(
            Arc::downgrade(self),
            session.events,
            inbound,
            mode,
        ));
        if let Some(previous) = self.dispatcher.lock().replace(handle) {
            previous.abort();
        }

        if let Err(e) = self.wait_connected().await {
            // a late ConnAck must not revive a connect that already failed
            self.stop_dispatcher();
            self.close_transport().await;
            if self.state() != ConnectionState::Closed {
                self.transition(ConnectionState::Disconnected);
            }
            return Err(e);
        }

        info!(device_id = %identity.device_id, host = %info.mqtt_host, "Connected");

        if mode == ConnectMode::Normal {
            tokio::time::sleep(self.settings.settle_delay).await;
            self.publish_snapshot().await;
        }
        Ok(())
    }

    async fn wait_connected(&self) -> ConnectResult<()> {
        let budget = self.settings.connect_timeout;
        let mut waited = Duration::ZERO;
        loop {
            match self.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => return Err(ConnectError::Closed),
                _ => {}
            }
            if waited >= budget {
                return Err(match self.last_failure() {
                    Some(failure) => ConnectError::Rejected(failure),
                    None => ConnectError::Timeout(budget),
                });
            }
            let step = timing::POLL_INTERVAL.min(budget - waited);
            tokio::time::sleep(step).await;
            waited += step;
        }
    }

    /// Publish the one-shot device-info snapshot. Best effort.
    pub async fn publish_snapshot(&self) -> bool {
        let snapshot = DeviceSnapshot::new(&self.settings.app_version, self.shadow.snapshot());
        let delivered = self.publish(&Envelope::device_info(&snapshot)).await;
        if delivered {
            info!("Device info published");
        } else {
            warn!("Device info snapshot not delivered");
        }
        delivered
    }

    /// Subscribe to the resolved cloud-to-device topic pattern.
    pub async fn subscribe_commands(&self) -> bool {
        let transport = self.transport.read().clone();
        let topic = self.info.read().as_ref().map(|i| i.topic_c2d.clone());
        let (Some(transport), Some(topic)) = (transport, topic) else {
            warn!("Cannot subscribe: no open transport");
            return false;
        };
        match transport.subscribe(&topic).await {
            Ok(()) => {
                info!(topic = %topic, "Subscribed to command topic");
                true
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Subscribe failed");
                false
            }
        }
    }

    async fn on_connack(&self, code: u8, mode: ConnectMode) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        match ConnectFailure::from_code(code) {
            None => {
                *self.last_failure.write() = None;
                if self.state() != ConnectionState::Connecting {
                    self.transition(ConnectionState::Connecting);
                }
                self.transition(ConnectionState::Connected);
                info!("Broker accepted connection");
                if mode == ConnectMode::Normal {
                    self.subscribe_commands().await;
                }
            }
            Some(failure) => {
                error!(code, reason = %failure, "Connection refused by broker");
                *self.last_failure.write() = Some(failure);
                self.transition(ConnectionState::Disconnected);
            }
        }
    }

    fn on_disconnect(&self, reason: Option<String>) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        match reason {
            Some(reason) => {
                self.drops.fetch_add(1, Ordering::Relaxed);
                warn!(reason = %reason, "Unexpected disconnect; transport will reconnect");
            }
            None => debug!("Transport disconnected"),
        }
        self.transition(ConnectionState::Disconnected);
    }

    fn stop_dispatcher(&self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }

    async fn close_transport(&self) {
        let transport = self.transport.write().take();
        if let Some(transport) = transport {
            if let Err(e) = transport.disconnect().await {
                debug!(error = %e, "Transport disconnect failed");
            }
        }
    }

    /// Stop the session. Terminal.
    pub async fn shutdown(&self) {
        if self.state() == ConnectionState::Closed || !self.transition(ConnectionState::Closed) {
            return;
        }
        self.stop_dispatcher();
        self.close_transport().await;
        info!("Connection closed");
    }
}

#[async_trait]
impl Publisher for ConnectionCoordinator {
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    async fn publish(&self, message: &Envelope) -> bool {
        if !self.is_connected() {
            debug!(app_id = %message.app_id, "Not connected, dropping message");
            return false;
        }
        let transport = self.transport.read().clone();
        let topic = self.info.read().as_ref().map(|i| i.topic_d2c.clone());
        let (Some(transport), Some(topic)) = (transport, topic) else {
            return false;
        };

        let payload = match message.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(app_id = %message.app_id, error = %e, "Failed to encode message");
                return false;
            }
        };

        match transport.publish(&topic, payload).await {
            Ok(()) => {
                debug!(app_id = %message.app_id, topic = %topic, "Published");
                true
            }
            Err(e) => {
                warn!(app_id = %message.app_id, error = %e, "Publish failed, message dropped");
                false
            }
        }
    }
}

async fn dispatch_events(
    coordinator: Weak<ConnectionCoordinator>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    inbound: Arc<dyn InboundHandler>,
    mode: ConnectMode,
) {
    while let Some(event) = events.recv().await {
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        match event {
            TransportEvent::ConnAck { code } => coordinator.on_connack(code, mode).await,
            TransportEvent::Disconnected { reason } => coordinator.on_disconnect(reason),
            TransportEvent::Message { topic, payload } => {
                inbound.on_message(&topic, &payload).await
            }
        }
    }
    debug!("Transport event stream ended");
}
