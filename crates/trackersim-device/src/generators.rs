//! Route and temperature generators.

use std::f64::consts::PI;

use chrono::Timelike;
use rand::Rng;

use trackersim_core::message::round_to;
use trackersim_core::GnssFix;

/// Standard deviation of the position jitter, in degrees.
pub const POSITION_JITTER_DEG: f64 = 0.0001;
/// Reported accuracy range, in meters.
pub const ACCURACY_RANGE_M: (f64, f64) = (3.0, 15.0);
/// Standard deviation of the temperature noise.
pub const TEMPERATURE_NOISE: f64 = 0.5;
/// Interpolated points inserted between consecutive waypoints.
pub const STEPS_BETWEEN: usize = 3;

/// A named point on the route.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waypoint {
    pub name: &'static str,
    pub lat: f64,
    pub lon: f64,
}

const fn wp(name: &'static str, lat: f64, lon: f64) -> Waypoint {
    Waypoint { name, lat, lon }
}

/// Walking loop around central Tokyo, ending where it starts.
pub const TOKYO_ROUTE: [Waypoint; 20] = [
    wp("Tokyo Station", 35.6812, 139.7671),
    wp("Imperial Palace", 35.6852, 139.7528),
    wp("Kudanshita", 35.6938, 139.7510),
    wp("Iidabashi", 35.7020, 139.7450),
    wp("Korakuen", 35.7078, 139.7509),
    wp("Ochanomizu", 35.6994, 139.7633),
    wp("Akihabara", 35.6984, 139.7731),
    wp("Ueno Park", 35.7146, 139.7734),
    wp("Asakusa", 35.7148, 139.7967),
    wp("Skytree", 35.7101, 139.8107),
    wp("Ryogoku", 35.6962, 139.7939),
    wp("Kiyosumi Garden", 35.6812, 139.7975),
    wp("Tsukiji", 35.6654, 139.7707),
    wp("Ginza", 35.6717, 139.7645),
    wp("Hibiya Park", 35.6735, 139.7568),
    wp("Tokyo Tower", 35.6586, 139.7454),
    wp("Roppongi", 35.6627, 139.7312),
    wp("Akasaka", 35.6765, 139.7376),
    wp("Yotsuya", 35.6860, 139.7301),
    wp("Back to Tokyo Station", 35.6812, 139.7671),
];

/// A route position as `(lat, lon)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutePoint {
    pub lat: f64,
    pub lon: f64,
}

/// Densify `waypoints` with `steps` linearly interpolated points after
/// each one. The last interpolated point of a segment lands on the next
/// waypoint.
pub fn build_route(waypoints: &[Waypoint], steps: usize) -> Vec<RoutePoint> {
    let mut route = Vec::with_capacity(waypoints.len() * (steps + 1));
    for pair in waypoints.windows(2) {
        let (from, to) = (pair[0], pair[1]);
        route.push(RoutePoint {
            lat: from.lat,
            lon: from.lon,
        });
        for i in 1..=steps {
            let ratio = i as f64 / steps as f64;
            route.push(RoutePoint {
                lat: from.lat + (to.lat - from.lat) * ratio,
                lon: from.lon + (to.lon - from.lon) * ratio,
            });
        }
    }
    if let Some(last) = waypoints.last() {
        route.push(RoutePoint {
            lat: last.lat,
            lon: last.lon,
        });
    }
    route
}

/// The default densified Tokyo loop.
pub fn default_route() -> Vec<RoutePoint> {
    build_route(&TOKYO_ROUTE, STEPS_BETWEEN)
}

/// Sample N(mean, std_dev) with the Box-Muller transform.
pub fn gaussian<R: Rng + ?Sized>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    // gen::<f64>() is in [0, 1); shift to (0, 1] so ln() stays finite
    let u1 = 1.0 - rng.gen::<f64>();
    let u2 = rng.gen::<f64>();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
    mean + std_dev * z
}

/// Jittered fix for a route point.
pub fn jittered_fix<R: Rng + ?Sized>(rng: &mut R, point: RoutePoint) -> GnssFix {
    let lat = point.lat + gaussian(rng, 0.0, POSITION_JITTER_DEG);
    let lon = point.lon + gaussian(rng, 0.0, POSITION_JITTER_DEG);
    let acc = rng.gen_range(ACCURACY_RANGE_M.0..=ACCURACY_RANGE_M.1);
    GnssFix::new(lat, lon, acc)
}

/// Diurnal temperature: `base + variation * sin((hour - 6) * pi / 12)` plus noise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureModel {
    pub base: f64,
    pub variation: f64,
}

impl TemperatureModel {
    pub fn new(base: f64, variation: f64) -> Self {
        Self { base, variation }
    }

    /// Noise-free value for an hour of the day.
    pub fn diurnal(&self, hour: u32) -> f64 {
        self.base + self.variation * ((hour as f64 - 6.0) * PI / 12.0).sin()
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, hour: u32) -> f64 {
        round_to(
            self.diurnal(hour) + gaussian(rng, 0.0, TEMPERATURE_NOISE),
            1,
        )
    }

    /// Sample for the current local hour.
    pub fn sample_now(&self) -> f64 {
        let hour = chrono::Local::now().hour();
        self.sample(&mut rand::thread_rng(), hour)
    }
}
