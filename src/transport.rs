//! Transport mode classification over a sliding window of samples.
//!
//! The detector is stateful: it owns the last `window_size` samples of one tracking
//! session. Call [`TransportModeDetector::reset`] whenever tracking starts or stops,
//! and never share one detector between sessions.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::error::{ensure_non_negative, ensure_ordered, ensure_positive, ConfigError};
use crate::geo_utils::haversine_distance;
use crate::{GpsPoint, LocationSample, TransportMode};

/// Thresholds for transport mode classification.
///
/// Speeds are km/h, variance is (km/h)², altitude is meters.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TransportConfig {
    /// Samples in the sliding window
    pub window_size: usize,
    /// Average speed at or above which travel is by plane
    pub plane_min_speed_kmh: f64,
    /// Altitude swing across the window at or above which travel is by plane
    pub plane_min_altitude_swing_m: f64,
    /// Train average speed range (inclusive)
    pub train_min_speed_kmh: f64,
    pub train_max_speed_kmh: f64,
    /// Trains must be steadier than this
    pub train_max_variance: f64,
    /// Car range is (car_min, car_max]
    pub car_min_speed_kmh: f64,
    pub car_max_speed_kmh: f64,
    /// Bike range is (walk_max, bike_max]
    pub bike_max_speed_kmh: f64,
    /// Walking is at or below this average speed
    pub walk_max_speed_kmh: f64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            window_size: 5,
            plane_min_speed_kmh: 200.0,
            plane_min_altitude_swing_m: 1000.0,
            train_min_speed_kmh: 40.0,
            train_max_speed_kmh: 200.0,
            train_max_variance: 100.0,
            car_min_speed_kmh: 25.0,
            car_max_speed_kmh: 120.0,
            bike_max_speed_kmh: 25.0,
            walk_max_speed_kmh: 7.0,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size < 2 {
            return Err(ConfigError::WindowTooSmall(self.window_size));
        }
        ensure_positive("transport.plane_min_speed_kmh", self.plane_min_speed_kmh)?;
        ensure_positive("transport.plane_min_altitude_swing_m", self.plane_min_altitude_swing_m)?;
        ensure_non_negative("transport.train_max_variance", self.train_max_variance)?;
        ensure_non_negative("transport.walk_max_speed_kmh", self.walk_max_speed_kmh)?;
        ensure_ordered("transport.train speed range", self.train_min_speed_kmh, self.train_max_speed_kmh)?;
        ensure_ordered("transport.car speed range", self.car_min_speed_kmh, self.car_max_speed_kmh)?;
        ensure_ordered("transport.bike speed range", self.walk_max_speed_kmh, self.bike_max_speed_kmh)
    }
}

/// Speed and altitude features of one full window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub average_speed_kmh: f64,
    pub max_speed_kmh: f64,
    /// Population variance of the pairwise speeds, (km/h)²
    pub speed_variance: f64,
    /// max - min altitude, when at least two samples carried one
    pub altitude_swing_m: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct WindowSample {
    timestamp: DateTime<Utc>,
    point: GpsPoint,
    altitude: Option<f64>,
}

/// Sliding-window transport classifier.
///
/// # Example
/// ```
/// use chrono::{Duration, TimeZone, Utc};
/// use travel_history::{LocationSample, TransportConfig, TransportMode, TransportModeDetector};
///
/// let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
/// let mut detector = TransportModeDetector::new(TransportConfig::default());
///
/// // ~1.1 m/s walking pace, one fix per minute
/// let mut last = None;
/// for i in 0..5 {
///     let s = LocationSample::new(format!("s{i}"), "u", t0 + Duration::minutes(i), 50.0 + i as f64 * 0.0006, 8.0);
///     last = detector.detect_transport_mode(&s);
/// }
/// assert_eq!(last, Some(TransportMode::Walk));
/// ```
#[derive(Debug, Clone)]
pub struct TransportModeDetector {
    config: TransportConfig,
    window: VecDeque<WindowSample>,
}

impl TransportModeDetector {
    pub fn new(config: TransportConfig) -> Self {
        let capacity = config.window_size.max(2);
        Self {
            config,
            window: VecDeque::with_capacity(capacity),
        }
    }

    /// Push a sample and classify the current window.
    ///
    /// Returns `None` ("insufficient data") until the window holds `window_size`
    /// samples, then a classification for every subsequent call.
    pub fn detect_transport_mode(&mut self, sample: &LocationSample) -> Option<TransportMode> {
        let window_size = self.config.window_size.max(2);
        if self.window.len() == window_size {
            self.window.pop_front();
        }
        self.window.push_back(WindowSample {
            timestamp: sample.timestamp,
            point: sample.point(),
            altitude: sample.altitude,
        });

        if self.window.len() < window_size {
            return None;
        }

        Some(match self.window_stats() {
            Some(stats) => classify(&stats, &self.config),
            None => TransportMode::Unknown,
        })
    }

    /// Forget every buffered sample.
    pub fn reset(&mut self) {
        self.window.clear();
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Features of the current window; `None` when no pair has a positive time delta.
    pub fn window_stats(&self) -> Option<WindowStats> {
        let speeds: Vec<f64> = self
            .window
            .iter()
            .zip(self.window.iter().skip(1))
            .filter_map(|(a, b)| pair_speed_kmh(&a.point, a.timestamp, &b.point, b.timestamp))
            .collect();

        if speeds.is_empty() {
            return None;
        }

        let n = speeds.len() as f64;
        let average = speeds.iter().sum::<f64>() / n;
        let max = speeds.iter().copied().fold(0.0, f64::max);
        let variance = speeds.iter().map(|s| (s - average).powi(2)).sum::<f64>() / n;

        let altitudes: Vec<f64> = self
            .window
            .iter()
            .filter_map(|s| s.altitude)
            .filter(|a| a.is_finite())
            .collect();
        let altitude_swing_m = if altitudes.len() >= 2 {
            let lo = altitudes.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = altitudes.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            Some(hi - lo)
        } else {
            None
        };

        Some(WindowStats {
            average_speed_kmh: average,
            max_speed_kmh: max,
            speed_variance: variance,
            altitude_swing_m,
        })
    }
}

/// Speed between two fixes in km/h; `None` when time does not move forward.
pub(crate) fn pair_speed_kmh(
    a: &GpsPoint,
    a_time: DateTime<Utc>,
    b: &GpsPoint,
    b_time: DateTime<Utc>,
) -> Option<f64> {
    let elapsed_ms = (b_time - a_time).num_milliseconds();
    if elapsed_ms <= 0 {
        return None;
    }
    let meters = haversine_distance(a, b);
    Some(meters / (elapsed_ms as f64 / 1000.0) * 3.6)
}

/// Classify window features; overlapping categories are checked first.
pub fn classify(stats: &WindowStats, config: &TransportConfig) -> TransportMode {
    let avg = stats.average_speed_kmh;

    let altitude_jump = stats
        .altitude_swing_m
        .is_some_and(|swing| swing >= config.plane_min_altitude_swing_m);
    if avg >= config.plane_min_speed_kmh || altitude_jump {
        return TransportMode::Plane;
    }

    // Train before car: the ranges overlap and steadiness separates rail from traffic
    if avg >= config.train_min_speed_kmh
        && avg <= config.train_max_speed_kmh
        && stats.speed_variance < config.train_max_variance
    {
        return TransportMode::Train;
    }

    if avg > config.car_min_speed_kmh && avg <= config.car_max_speed_kmh {
        return TransportMode::Car;
    }

    if avg > config.walk_max_speed_kmh && avg <= config.bike_max_speed_kmh {
        return TransportMode::Bike;
    }

    if avg <= config.walk_max_speed_kmh {
        return TransportMode::Walk;
    }

    TransportMode::Unknown
}
