//! Publish/subscribe transport.
//!
//! The coordinator only sees the [`Transport`] and [`TransportConnector`]
//! traits and a channel of [`TransportEvent`]s. The MQTT implementation
//! drives the rumqttc event loop in a background task, reconnecting with
//! bounded exponential backoff, and reports refusals as a ConnAck event
//! carrying the broker's reason code.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, TlsConfiguration,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use trackersim_core::MqttSettings;

use crate::certs::{CertError, DeviceIdentity};
use crate::connection_info::ConnectionInfo;

/// Grace period for the driver to flush a disconnect before it is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to load identity material: {0}")]
    Identity(#[from] CertError),

    #[error("Transport client error: {0}")]
    Client(String),

    #[error("Transport is closed")]
    Closed,
}

impl From<rumqttc::ClientError> for TransportError {
    fn from(e: rumqttc::ClientError) -> Self {
        Self::Client(e.to_string())
    }
}

/// Named reason for a rejected connect handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    ProtocolVersion,
    BadClientId,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
    /// Code outside the known range
    Other(u8),
}

impl ConnectFailure {
    /// Map a ConnAck reason code. Code 0 is success and maps to `None`.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => None,
            1 => Some(Self::ProtocolVersion),
            2 => Some(Self::BadClientId),
            3 => Some(Self::ServerUnavailable),
            4 => Some(Self::BadCredentials),
            5 => Some(Self::NotAuthorized),
            other => Some(Self::Other(other)),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::ProtocolVersion => 1,
            Self::BadClientId => 2,
            Self::ServerUnavailable => 3,
            Self::BadCredentials => 4,
            Self::NotAuthorized => 5,
            Self::Other(code) => *code,
        }
    }
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolVersion => f.write_str("incorrect protocol version"),
            Self::BadClientId => f.write_str("invalid client identifier"),
            Self::ServerUnavailable => f.write_str("server unavailable"),
            Self::BadCredentials => f.write_str("bad username or password"),
            Self::NotAuthorized => f.write_str("not authorized"),
            Self::Other(code) => write!(f, "unknown reason code {}", code),
        }
    }
}

/// Events delivered from the transport to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connect acknowledgement; 0 is success
    ConnAck { code: u8 },
    /// Session dropped; `None` for a requested disconnect
    Disconnected { reason: Option<String> },
    Message { topic: String, payload: Vec<u8> },
}

/// An open transport session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand a message to the transport with at-least-once QoS. Returns an
    /// error instead of queueing when the transport cannot accept it.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> TransportResult<()>;

    async fn subscribe(&self, topic: &str) -> TransportResult<()>;

    async fn disconnect(&self) -> TransportResult<()>;
}

/// A transport plus the stream of its events.
pub struct TransportSession {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transport sessions.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(
        &self,
        identity: &DeviceIdentity,
        info: &ConnectionInfo,
        options: &TransportOptions,
    ) -> TransportResult<TransportSession>;
}

/// Session parameters.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub port: u16,
    pub keep_alive: Duration,
    pub reconnect_min_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl From<&MqttSettings> for TransportOptions {
    fn from(settings: &MqttSettings) -> Self {
        Self {
            port: settings.port,
            keep_alive: settings.keep_alive(),
            reconnect_min_delay: settings.reconnect_min_delay(),
            reconnect_max_delay: settings.reconnect_max_delay(),
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::from(&MqttSettings::default())
    }
}

/// Exponential backoff bounded by a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// The delay to wait now; doubles the next one up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Connector for MQTT over mutual TLS.
#[derive(Debug, Clone, Default)]
pub struct MqttConnector;

impl MqttConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportConnector for MqttConnector {
    async fn open(
        &self,
        identity: &DeviceIdentity,
        info: &ConnectionInfo,
        options: &TransportOptions,
    ) -> TransportResult<TransportSession> {
        let material = identity.load_material().await?;

        let mut mqtt_options =
            MqttOptions::new(&identity.device_id, &info.mqtt_host, options.port);
        mqtt_options.set_keep_alive(options.keep_alive);
        mqtt_options.set_clean_session(true);
        mqtt_options.set_transport(rumqttc::Transport::Tls(TlsConfiguration::Simple {
            ca: material.ca,
            alpn: None,
            client_auth: Some((material.cert, material.key)),
        }));

        let (client, eventloop) = AsyncClient::new(mqtt_options, 10);
        let (event_tx, events) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));

        info!(
            host = %info.mqtt_host,
            port = options.port,
            client_id = %identity.device_id,
            "Opening MQTT session"
        );

        let driver = tokio::spawn(drive_event_loop(
            eventloop,
            event_tx,
            running.clone(),
            Backoff::new(options.reconnect_min_delay, options.reconnect_max_delay),
        ));

        let transport = MqttTransport {
            client,
            running,
            driver: Mutex::new(Some(driver)),
        };
        Ok(TransportSession {
            transport: Arc::new(transport),
            events,
        })
    }
}

/// rumqttc-backed transport.
pub struct MqttTransport {
    client: AsyncClient,
    running: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> TransportResult<()> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> TransportResult<()> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "Disconnect request not queued");
        }

        let driver = self.driver.lock().take();
        if let Some(mut handle) = driver {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                debug!("MQTT driver did not stop in time, aborting");
                handle.abort();
            }
        }
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
    }
}

fn return_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<TransportEvent>,
    running: Arc<AtomicBool>,
    mut backoff: Backoff,
) {
    let mut connected = false;

    // Runs until the requested disconnect is flushed or the connection fails
    // after shutdown.
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let code = return_code(ack.code);
                if code == 0 {
                    connected = true;
                    backoff.reset();
                }
                let _ = events.send(TransportEvent::ConnAck { code });
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let _ = events.send(TransportEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                });
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                connected = false;
                let _ = events.send(TransportEvent::Disconnected {
                    reason: Some("broker closed the session".to_string()),
                });
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                let _ = events.send(TransportEvent::Disconnected { reason: None });
                break;
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                let code = return_code(code);
                let _ = events.send(TransportEvent::ConnAck { code });
                let delay = backoff.next_delay();
                warn!(code, retry_in = ?delay, "Broker refused connection");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                if connected {
                    connected = false;
                    let _ = events.send(TransportEvent::Disconnected {
                        reason: Some(e.to_string()),
                    });
                }
                let delay = backoff.next_delay();
                warn!(error = %e, retry_in = ?delay, "MQTT connection error");
                tokio::time::sleep(delay).await;
            }
        }
    }

    debug!("MQTT event loop stopped");
}
