//! Connection diagnostics report.
//!
//! Diagnostics separate certificate/policy problems (the bare connection
//! drops) from topic-permission problems (the connection only drops once
//! the device subscribes).

use serde::Serialize;
use serde_json::Value;

/// Step 1: REST lookup of the device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeviceLookup {
    Found { tags: Vec<String>, firmware: Value },
    NotFound,
    Error { message: String },
}

/// Step 2: holding a connection without subscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum HoldResult {
    Stable { secs: u64 },
    Dropped { after_secs: u64 },
}

/// Step 3: subscribing to the command topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubscribeProbe {
    pub subscribed: bool,
    pub connected_after: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticReport {
    pub device_id: String,
    pub lookup: DeviceLookup,
    /// Set when the bare connect failed
    pub connect_error: Option<String>,
    pub hold: Option<HoldResult>,
    pub subscribe: Option<SubscribeProbe>,
}

impl DiagnosticReport {
    pub fn new(device_id: impl Into<String>, lookup: DeviceLookup) -> Self {
        Self {
            device_id: device_id.into(),
            lookup,
            connect_error: None,
            hold: None,
            subscribe: None,
        }
    }

    /// Every probe that ran passed.
    pub fn healthy(&self) -> bool {
        matches!(self.lookup, DeviceLookup::Found { .. })
            && self.connect_error.is_none()
            && matches!(self.hold, Some(HoldResult::Stable { .. }))
            && matches!(
                self.subscribe,
                Some(SubscribeProbe {
                    subscribed: true,
                    connected_after: true
                })
            )
    }

    /// Operator-facing interpretation of the results.
    pub fn verdict(&self) -> &'static str {
        if self.connect_error.is_some() {
            return "Connection failed; check the certificates and the broker endpoint";
        }
        if matches!(self.lookup, DeviceLookup::NotFound) {
            return "Device not found on the cloud; it may need to be re-provisioned";
        }
        match (self.hold, self.subscribe) {
            (Some(HoldResult::Dropped { .. }), _) => {
                "Connection dropped without any subscribe or publish; \
                 likely a certificate or IoT policy issue"
            }
            (Some(HoldResult::Stable { .. }), Some(probe)) if !probe.connected_after => {
                "Connection dropped after subscribing; likely a topic permission issue"
            }
            (Some(HoldResult::Stable { .. }), Some(_)) => "Connection and subscribe look healthy",
            _ => "Diagnostics incomplete",
        }
    }
}
