//! TrackerSim core types
//!
//! Shared vocabulary for the tracker simulator:
//! - **config**: TOML configuration model, defaults and validation
//! - **message**: the `{appId, messageType, ts, data}` wire envelope
//! - **shadow**: the cloud-controlled device configuration and its store

pub mod config;
pub mod message;
pub mod shadow;

pub use config::{
    CloudConfig, ConfigError, ConfigResult, MqttSettings, SimulationConfig, SimulatorConfig,
};
pub use message::{
    now_ms, AlertData, AppId, DeviceSnapshot, Envelope, GnssFix, MessageType, NetworkInfo,
    SimInfo,
};
pub use shadow::{ShadowConfig, ShadowConfigStore, ShadowField, ShadowUpdate};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
