//! TrackerSim device lifecycle
//!
//! Takes a simulated tracker from unregistered to connected and reporting:
//! - **provisioning**: trust anchor download, key/certificate generation and
//!   registration with the cloud backend
//! - **connection**: the connection state machine over a pub/sub transport
//! - **router**: cloud-to-device command handling
//! - **telemetry**: location, counter and temperature producers on timers
//! - **session**: wires everything together for one run
//!
//! The REST client, certificate tool and transport sit behind traits
//! ([`CloudApi`], [`CertificateGenerator`], [`TransportConnector`]) so the
//! lifecycle can be exercised without a network.

pub mod certs;
pub mod cloud;
pub mod connection;
pub mod connection_info;
pub mod diagnostics;
pub mod generators;
pub mod provisioning;
pub mod router;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use certs::{
    CertError, CertResult, CertificateGenerator, CertificateStore, DeviceIdentity,
    OpensslGenerator,
};
pub use cloud::{AccountInfo, CloudApi, CloudError, CloudResult, DeviceRecord, NrfCloudClient};
pub use connection::{
    ConnectError, ConnectMode, ConnectionCoordinator, ConnectionState, CoordinatorSettings,
    Publisher,
};
pub use connection_info::{ConnectionInfo, ConnectionInfoCache, ConnectionInfoResolver, InfoSource};
pub use diagnostics::{DeviceLookup, DiagnosticReport, HoldResult, SubscribeProbe};
pub use provisioning::{ProvisionError, ProvisionOutcome, ProvisioningManager};
pub use router::{InboundHandler, MessageRouter, ModemCommands, RouteOutcome};
pub use session::{DeviceSession, SessionContext, SessionError, SessionResult};
pub use telemetry::{RouteCursor, TelemetryProducer, TelemetryScheduler};
pub use transport::{
    ConnectFailure, MqttConnector, Transport, TransportConnector, TransportError, TransportEvent,
    TransportOptions, TransportSession,
};
