//! Device shadow configuration.
//!
//! The two fields are independent, so each one lives in its own atomic and
//! is replaced as a whole. Readers never see a half-written value and no
//! lock is held across a telemetry tick.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Wire names accepted for the reporting interval.
const INTERVAL_KEYS: [&str; 2] = ["locationInterval", "reportingIntervalSeconds"];
/// Wire names accepted for the counter toggle.
const COUNTER_KEYS: [&str; 2] = ["counterEnable", "counterFeatureEnabled"];

/// Snapshot of the shadow configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowConfig {
    #[serde(rename = "counterEnable")]
    pub counter_enabled: bool,
    #[serde(rename = "locationInterval")]
    pub location_interval_secs: u64,
}

impl ShadowConfig {
    pub fn new(location_interval_secs: u64, counter_enabled: bool) -> Self {
        Self {
            counter_enabled,
            location_interval_secs,
        }
    }
}

/// Shadow field identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowField {
    LocationInterval,
    CounterEnabled,
}

/// Result of merging a config update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowUpdate {
    /// Fields that were written, in application order
    pub applied: Vec<ShadowField>,
    /// Full configuration after the merge
    pub config: ShadowConfig,
}

impl ShadowUpdate {
    pub fn changed(&self) -> bool {
        !self.applied.is_empty()
    }
}

/// Shared, lock-free shadow configuration.
#[derive(Debug)]
pub struct ShadowConfigStore {
    location_interval_secs: AtomicU64,
    counter_enabled: AtomicBool,
}

impl ShadowConfigStore {
    pub fn new(initial: ShadowConfig) -> Self {
        Self {
            location_interval_secs: AtomicU64::new(initial.location_interval_secs.max(1)),
            counter_enabled: AtomicBool::new(initial.counter_enabled),
        }
    }

    pub fn snapshot(&self) -> ShadowConfig {
        ShadowConfig {
            counter_enabled: self.counter_enabled(),
            location_interval_secs: self.location_interval_secs(),
        }
    }

    pub fn location_interval_secs(&self) -> u64 {
        self.location_interval_secs.load(Ordering::Acquire)
    }

    pub fn location_interval(&self) -> Duration {
        Duration::from_secs(self.location_interval_secs())
    }

    pub fn counter_enabled(&self) -> bool {
        self.counter_enabled.load(Ordering::Acquire)
    }

    /// Set the interval. Zero is rejected.
    pub fn set_location_interval(&self, secs: u64) -> bool {
        if secs == 0 {
            return false;
        }
        self.location_interval_secs.store(secs, Ordering::Release);
        true
    }

    pub fn set_counter_enabled(&self, enabled: bool) {
        self.counter_enabled.store(enabled, Ordering::Release);
    }

    /// Merge a partial config object. Unknown keys and values that cannot
    /// be coerced are ignored; each recognised field is applied on its own.
    pub fn apply_update(&self, fields: &Map<String, Value>) -> ShadowUpdate {
        let mut applied = Vec::new();

        match first_valid(fields, &COUNTER_KEYS, Value::as_bool) {
            Some(enabled) => {
                self.set_counter_enabled(enabled);
                tracing::info!(counter_enabled = enabled, "Shadow counterEnable updated");
                applied.push(ShadowField::CounterEnabled);
            }
            None => warn_invalid(fields, &COUNTER_KEYS, "Ignoring non-boolean counterEnable"),
        }

        match first_valid(fields, &INTERVAL_KEYS, coerce_interval) {
            Some(secs) if self.set_location_interval(secs) => {
                tracing::info!(interval_secs = secs, "Shadow locationInterval updated");
                applied.push(ShadowField::LocationInterval);
            }
            _ => warn_invalid(fields, &INTERVAL_KEYS, "Ignoring invalid locationInterval"),
        }

        for key in fields.keys() {
            if !INTERVAL_KEYS.contains(&key.as_str()) && !COUNTER_KEYS.contains(&key.as_str()) {
                tracing::debug!(field = %key, "Ignoring unrecognised config field");
            }
        }

        let update = ShadowUpdate {
            applied,
            config: self.snapshot(),
        };
        if update.changed() {
            tracing::info!(
                counter_enabled = update.config.counter_enabled,
                interval_secs = update.config.location_interval_secs,
                "Shadow config updated"
            );
        }
        update
    }
}

/// The first key, in preference order, whose value converts.
fn first_valid<T>(
    fields: &Map<String, Value>,
    keys: &[&str],
    convert: impl Fn(&Value) -> Option<T>,
) -> Option<T> {
    keys.iter()
        .filter_map(|k| fields.get(*k))
        .find_map(convert)
}

fn warn_invalid(fields: &Map<String, Value>, keys: &[&str], message: &str) {
    for key in keys {
        if let Some(value) = fields.get(*key) {
            tracing::warn!(field = %key, value = %value, "{}", message);
        }
    }
}

/// Coerce a JSON value to a positive whole number of seconds.
fn coerce_interval(value: &Value) -> Option<u64> {
    let secs = match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 1.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }?;
    (secs > 0).then_some(secs)
}
