//! Telemetry producers and the periodic scheduler.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use trackersim_core::config::timing;
use trackersim_core::{AlertData, Envelope, ShadowConfigStore};

use crate::connection::Publisher;
use crate::generators::{jittered_fix, RoutePoint, TemperatureModel};

/// Cyclic index into a route.
#[derive(Debug, Clone)]
pub struct RouteCursor {
    route: Vec<RoutePoint>,
    index: usize,
}

impl RouteCursor {
    /// An empty route is replaced by a single origin point so the cursor
    /// always has a current position.
    pub fn new(route: Vec<RoutePoint>) -> Self {
        let route = if route.is_empty() {
            vec![RoutePoint { lat: 0.0, lon: 0.0 }]
        } else {
            route
        };
        Self { route, index: 0 }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.route.len()
    }

    pub fn is_empty(&self) -> bool {
        self.route.is_empty()
    }

    pub fn current(&self) -> RoutePoint {
        self.route[self.index]
    }

    /// Move one position forward, wrapping at the end.
    pub fn advance(&mut self) {
        self.index = (self.index + 1) % self.route.len();
    }
}

/// One-shot telemetry sends shared by the scheduler and the operator loop.
pub struct TelemetryProducer {
    publisher: Arc<dyn Publisher>,
    shadow: Arc<ShadowConfigStore>,
    cursor: Mutex<RouteCursor>,
    counter: AtomicU64,
    temperature: TemperatureModel,
}

impl TelemetryProducer {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        shadow: Arc<ShadowConfigStore>,
        route: Vec<RoutePoint>,
        temperature: TemperatureModel,
    ) -> Self {
        Self {
            publisher,
            shadow,
            cursor: Mutex::new(RouteCursor::new(route)),
            counter: AtomicU64::new(0),
            temperature,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.publisher.is_connected()
    }

    pub fn shadow(&self) -> &ShadowConfigStore {
        &self.shadow
    }

    /// `(index, route length)`
    pub fn route_position(&self) -> (usize, usize) {
        let cursor = self.cursor.lock();
        (cursor.index(), cursor.len())
    }

    /// Next counter value to be sent.
    pub fn counter_value(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Publish the current route position with jitter and advance the
    /// cursor. The cursor advances whether or not the publish succeeds.
    pub async fn send_location(&self) -> bool {
        let (fix, index) = {
            let mut cursor = self.cursor.lock();
            let index = cursor.index();
            let fix = jittered_fix(&mut rand::thread_rng(), cursor.current());
            cursor.advance();
            (fix, index)
        };
        let delivered = self.publisher.publish(&Envelope::gnss(&fix)).await;
        if delivered {
            info!(lat = fix.lat, lon = fix.lon, acc = fix.acc, index, "GNSS sent");
        }
        delivered
    }

    /// Publish the counter. The value is reserved before sending so
    /// concurrent senders never share one, and handed back if the send fails
    /// and nobody reserved a later value meanwhile.
    pub async fn send_counter(&self) -> bool {
        let value = self.counter.fetch_add(1, Ordering::AcqRel);
        let delivered = self.publisher.publish(&Envelope::counter(value)).await;
        if delivered {
            info!(value, "COUNT sent");
        } else {
            let _ = self.counter.compare_exchange(
                value + 1,
                value,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        delivered
    }

    pub async fn send_temperature(&self) -> bool {
        let celsius = self.temperature.sample_now();
        let delivered = self.publisher.publish(&Envelope::temperature(celsius)).await;
        if delivered {
            info!(celsius, "TEMP sent");
        }
        delivered
    }

    pub async fn send_alert(&self, alert: AlertData) -> bool {
        let delivered = self.publisher.publish(&Envelope::alert(&alert)).await;
        if delivered {
            info!(
                kind = alert.kind,
                value = alert.value,
                description = ?alert.description,
                "ALERT sent"
            );
        }
        delivered
    }

    /// One location tick: the fix, then the counter if enabled.
    pub async fn location_tick(&self) {
        self.send_location().await;
        if self.shadow.counter_enabled() {
            self.send_counter().await;
        }
    }
}

/// Sleep for `duration` in one-second steps. Returns `false` as soon as
/// `running` is cleared.
pub async fn sleep_while_running(duration: Duration, running: &AtomicBool) -> bool {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if !running.load(Ordering::Relaxed) {
            return false;
        }
        let step = timing::POLL_INTERVAL.min(remaining);
        tokio::time::sleep(step).await;
        remaining -= step;
    }
    running.load(Ordering::Relaxed)
}

/// Runs the location and temperature loops.
pub struct TelemetryScheduler {
    producer: Arc<TelemetryProducer>,
    running: Arc<AtomicBool>,
    temperature_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TelemetryScheduler {
    pub fn new(
        producer: Arc<TelemetryProducer>,
        running: Arc<AtomicBool>,
        temperature_interval: Duration,
    ) -> Self {
        Self {
            producer,
            running,
            temperature_interval,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(tokio::spawn(location_loop(
            self.producer.clone(),
            self.running.clone(),
        )));
        tasks.push(tokio::spawn(temperature_loop(
            self.producer.clone(),
            self.running.clone(),
            self.temperature_interval,
        )));
        info!(
            location_interval_secs = self.producer.shadow().location_interval_secs(),
            temperature_interval_secs = self.temperature_interval.as_secs(),
            "Telemetry scheduler started"
        );
    }

    /// Clear the running flag and wait for both loops to exit.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        debug!("Telemetry scheduler stopped");
    }
}

async fn location_loop(producer: Arc<TelemetryProducer>, running: Arc<AtomicBool>) {
    if !sleep_while_running(timing::LOCATION_WARMUP, &running).await {
        return;
    }
    while running.load(Ordering::Relaxed) {
        if producer.is_connected() {
            producer.location_tick().await;
        }
        // read fresh every cycle so shadow updates apply at the next boundary
        let interval = producer.shadow().location_interval();
        if !sleep_while_running(interval, &running).await {
            break;
        }
    }
}

async fn temperature_loop(
    producer: Arc<TelemetryProducer>,
    running: Arc<AtomicBool>,
    interval: Duration,
) {
    if !sleep_while_running(timing::TEMPERATURE_WARMUP, &running).await {
        return;
    }
    while running.load(Ordering::Relaxed) {
        if producer.is_connected() {
            producer.send_temperature().await;
        }
        if !sleep_while_running(interval, &running).await {
            break;
        }
    }
}
