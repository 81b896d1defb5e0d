//! # Travel History
//!
//! Turns raw, noisy GPS samples into a semantic travel history.
//!
//! This library provides:
//! - Place visit detection using greedy spatio-temporal clustering
//! - Transport mode classification from speed and altitude patterns
//! - Route segments between visits with Douglas-Peucker simplification
//! - Home location estimation from visit history
//! - Multi-day trip segmentation relative to home
//! - A spatial read-through cache around a pluggable reverse geocoder
//!
//! ## Features
//!
//! - **`serde`** - Serialize entities and load configuration from JSON
//! - **`parallel`** - Process many users in parallel with rayon
//! - **`http`** - Nominatim-compatible HTTP reverse geocoder
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use travel_history::{LocationSample, PipelineConfig, TravelPipeline};
//!
//! let start = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
//!
//! // Fifteen minutes standing still in central London
//! let samples: Vec<LocationSample> = (0..16)
//!     .map(|i| {
//!         LocationSample::new(
//!             format!("s{i}"),
//!             "user-1",
//!             start + chrono::Duration::minutes(i),
//!             51.5074,
//!             -0.1278,
//!         )
//!     })
//!     .collect();
//!
//! let pipeline = TravelPipeline::new(PipelineConfig::default()).unwrap();
//! let history = pipeline.process_user("user-1", &samples, start + chrono::Duration::hours(1));
//!
//! assert_eq!(history.visits.len(), 1);
//! assert!(history.segments.is_empty());
//! ```

use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

pub mod clock;
pub mod error;
pub mod geo_utils;
pub mod geocoding;
pub mod home;
pub mod pipeline;
pub mod segments;
pub mod transport;
pub mod trips;
pub mod visits;

// HTTP module for remote reverse geocoding
#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::{GeocodeError, GeocoderConfig, NominatimGeocoder};

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ConfigError;
pub use geocoding::{CacheConfig, CachingGeocoder, GeocodingCache, ReverseGeocoder};
pub use home::{HomeConfig, HomeLocation, HomeLocationDetector};
pub use pipeline::{PipelineConfig, TravelHistory, TravelPipeline};
pub use segments::{simplify_path, RouteSegmentBuilder, SegmentConfig};
pub use transport::{TransportConfig, TransportModeDetector};
pub use trips::{NoHomePolicy, TripBoundaryDetector, TripConfig, TripDetector, TripRun};
pub use visits::{PlaceVisitDetector, VisitConfig};

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use travel_history::GpsPoint;
/// let point = GpsPoint::new(51.5074, -0.1278); // London
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Axis-aligned lat/lng rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Whether the box wraps past the antimeridian (`min_lng > max_lng`).
    pub fn crosses_antimeridian(&self) -> bool {
        self.min_lng > self.max_lng
    }

    /// Whether the point lies inside the rectangle (edges inclusive).
    pub fn contains(&self, point: &GpsPoint) -> bool {
        let in_lat = point.latitude >= self.min_lat && point.latitude <= self.max_lat;
        let in_lng = if self.crosses_antimeridian() {
            point.longitude >= self.min_lng || point.longitude <= self.max_lng
        } else {
            point.longitude >= self.min_lng && point.longitude <= self.max_lng
        };
        in_lat && in_lng
    }

    /// The box as one or two non-wrapping `[min_lng, min_lat], [max_lng, max_lat]` corner
    /// pairs, split at the antimeridian when it crosses it.
    pub fn lng_lat_rects(&self) -> Vec<([f64; 2], [f64; 2])> {
        if self.crosses_antimeridian() {
            vec![
                ([self.min_lng, self.min_lat], [180.0, self.max_lat]),
                ([-180.0, self.min_lat], [self.max_lng, self.max_lat]),
            ]
        } else {
            vec![([self.min_lng, self.min_lat], [self.max_lng, self.max_lat])]
        }
    }
}

/// Where a location sample came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum SampleSource {
    Gps,
    Network,
    Fused,
    #[default]
    Unknown,
}

/// A single raw location fix as recorded by the upstream tracker.
///
/// Samples are read-only input; nothing in this crate mutates them.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LocationSample {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters
    pub accuracy: f64,
    /// Speed reported by the device (m/s)
    pub speed: Option<f64>,
    /// Bearing in degrees from north
    pub bearing: Option<f64>,
    /// Altitude above sea level in meters
    pub altitude: Option<f64>,
    pub source: SampleSource,
    pub user_id: String,
    pub device_id: String,
}

impl LocationSample {
    /// Create a sample with only the required fields set.
    ///
    /// Accuracy defaults to 0, optional readings to `None`, and the device id is empty.
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            id: id.into(),
            timestamp,
            latitude,
            longitude,
            accuracy: 0.0,
            speed: None,
            bearing: None,
            altitude: None,
            source: SampleSource::Unknown,
            user_id: user_id.into(),
            device_id: String::new(),
        }
    }

    /// Set the altitude reading.
    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = Some(altitude);
        self
    }

    /// The sample's coordinate.
    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }

    /// Check if the sample has usable coordinates.
    pub fn is_valid(&self) -> bool {
        self.point().is_valid()
    }
}

/// Reverse-geocoded description of a coordinate.
///
/// Every descriptive field is optional; providers fill in what they know.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GeocodedLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub formatted_address: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    /// ISO 3166-1 alpha-2 code, upper case
    pub country_code: Option<String>,
    pub country_name: Option<String>,
    pub postal_code: Option<String>,
    /// Point-of-interest name, when the coordinate resolves to one
    pub poi_name: Option<String>,
    pub street: Option<String>,
    pub street_number: Option<String>,
}

impl GeocodedLocation {
    /// Create a location with only coordinates set.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude, ..Default::default() }
    }

    /// The location's coordinate.
    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

/// A detected dwell period at a roughly fixed location.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PlaceVisit {
    /// Deterministic id derived from start time and quantized centroid
    pub id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Centroid latitude (arithmetic mean of member samples)
    pub latitude: f64,
    /// Centroid longitude (arithmetic mean of member samples)
    pub longitude: f64,
    /// Geocoded description; `None` when the geocoder had no answer
    pub place: Option<GeocodedLocation>,
    /// Ids of the samples clustered into this visit, in time order
    pub sample_ids: Vec<String>,
}

impl PlaceVisit {
    /// The visit's centroid.
    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }

    /// Dwell time in whole seconds.
    pub fn duration_secs(&self) -> i64 {
        (self.end_time - self.start_time).num_seconds()
    }

    /// Country code of the geocoded place, if any.
    pub fn country_code(&self) -> Option<&str> {
        self.place.as_ref().and_then(|p| p.country_code.as_deref())
    }
}

/// Inferred travel mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum TransportMode {
    Walk,
    Bike,
    Car,
    Train,
    Plane,
    Unknown,
}

impl TransportMode {
    /// Stable upper-case tag, e.g. `"CAR"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Walk => "WALK",
            TransportMode::Bike => "BIKE",
            TransportMode::Car => "CAR",
            TransportMode::Train => "TRAIN",
            TransportMode::Plane => "PLANE",
            TransportMode::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The simplified path and travel statistics connecting two place visits.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RouteSegment {
    pub id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Douglas-Peucker simplified path
    pub path: Vec<GpsPoint>,
    /// Distance over the full-resolution samples (meters)
    pub distance_meters: f64,
    pub transport_mode: TransportMode,
    /// Number of raw samples the segment was built from
    pub sample_count: u32,
    pub duration_secs: i64,
    /// Distance divided by duration; 0 when the duration is zero
    pub average_speed_kmh: f64,
    /// Fastest consecutive-sample speed
    pub max_speed_kmh: f64,
    /// Visit the segment departs from
    pub from_visit_id: Option<String>,
    /// Visit the segment arrives at
    pub to_visit_id: Option<String>,
}

/// A time-bounded, possibly multi-day run of visits away from home.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Trip {
    pub id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    /// `None` while the trip is ongoing
    pub end_time: Option<DateTime<Utc>>,
    /// Most frequent country code among the trip's visits
    pub primary_country: Option<String>,
    pub is_ongoing: bool,
    pub visit_ids: Vec<String>,
    pub segment_ids: Vec<String>,
    /// Distinct country codes in first-seen order
    pub countries: Vec<String>,
    /// Sum of the trip's route segment distances (meters)
    pub distance_meters: f64,
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Samples with usable coordinates, stably sorted by timestamp.
pub(crate) fn sorted_valid_samples(samples: &[LocationSample]) -> Vec<&LocationSample> {
    let mut ordered: Vec<&LocationSample> = samples.iter().filter(|s| s.is_valid()).collect();

    let dropped = samples.len() - ordered.len();
    if dropped > 0 {
        log::warn!("[travel_history] Dropped {} samples with invalid coordinates", dropped);
    }

    ordered.sort_by_key(|s| s.timestamp);
    ordered
}

/// Collection length as a `u32` count, saturating at `u32::MAX`.
#[inline]
pub(crate) fn saturating_count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

// ============================================================================
// Deterministic Ids
// ============================================================================

// Fixed namespace for all v5 ids produced by this crate.
const ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f3c_2a1e_9b4d_5e70_8a21_c4d9_e0f1_7b35);

/// Quantize a coordinate to a 1e-5 degree grid (~1.1 m) for stable hashing.
#[inline]
pub(crate) fn quantize_coord(value: f64) -> i64 {
    (value * 1e5).round() as i64
}

pub(crate) fn visit_id(user_id: &str, start: &DateTime<Utc>, center: &GpsPoint) -> String {
    let key = format!(
        "visit:{}:{}:{}:{}",
        user_id,
        start.timestamp_millis(),
        quantize_coord(center.latitude),
        quantize_coord(center.longitude),
    );
    Uuid::new_v5(&ID_NAMESPACE, key.as_bytes()).to_string()
}

pub(crate) fn segment_id(user_id: &str, start: &DateTime<Utc>, end: &DateTime<Utc>) -> String {
    let key = format!(
        "segment:{}:{}:{}",
        user_id,
        start.timestamp_millis(),
        end.timestamp_millis(),
    );
    Uuid::new_v5(&ID_NAMESPACE, key.as_bytes()).to_string()
}

pub(crate) fn trip_id(user_id: &str, start: &DateTime<Utc>, run_index: usize) -> String {
    let key = format!("trip:{}:{}:{}", user_id, start.timestamp_millis(), run_index);
    Uuid::new_v5(&ID_NAMESPACE, key.as_bytes()).to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(51.5074, -0.1278).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, 181.0).is_valid());
        assert!(!GpsPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_bounds_contains_and_rects() {
        let bounds = Bounds { min_lat: 1.0, max_lat: 3.0, min_lng: -1.0, max_lng: 2.0 };
        assert!(bounds.contains(&GpsPoint::new(2.0, 0.0)));
        assert!(!bounds.contains(&GpsPoint::new(4.0, 0.0)));
        assert_eq!(bounds.lng_lat_rects(), vec![([-1.0, 1.0], [2.0, 3.0])]);

        let wrapped = Bounds { min_lat: -1.0, max_lat: 1.0, min_lng: 179.5, max_lng: -179.5 };
        assert!(wrapped.crosses_antimeridian());
        assert!(wrapped.contains(&GpsPoint::new(0.0, 179.9)));
        assert!(wrapped.contains(&GpsPoint::new(0.0, -179.9)));
        assert!(!wrapped.contains(&GpsPoint::new(0.0, 0.0)));
        assert_eq!(
            wrapped.lng_lat_rects(),
            vec![([179.5, -1.0], [180.0, 1.0]), ([-180.0, -1.0], [-179.5, 1.0])]
        );
    }

    #[test]
    fn test_visit_id_stable_under_roundoff() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let a = visit_id("u", &start, &GpsPoint::new(51.500001, -0.120001));
        let b = visit_id("u", &start, &GpsPoint::new(51.500001 + 1e-12, -0.120001 - 1e-12));
        assert_eq!(a, b);

        let moved = visit_id("u", &start, &GpsPoint::new(51.50002, -0.120001));
        assert_ne!(a, moved);
        assert_ne!(a, visit_id("v", &start, &GpsPoint::new(51.500001, -0.120001)));
    }

    #[test]
    fn test_saturating_count() {
        assert_eq!(saturating_count(0), 0);
        assert_eq!(saturating_count(7), 7);
        assert_eq!(saturating_count(u32::MAX as usize), u32::MAX);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(saturating_count(u32::MAX as usize + 1), u32::MAX);
    }

    #[test]
    fn test_ids_differ_by_kind() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_ne!(segment_id("u", &t, &t), trip_id("u", &t, 0));
        assert_eq!(trip_id("u", &t, 1), trip_id("u", &t, 1));
        assert_ne!(trip_id("u", &t, 1), trip_id("v", &t, 1));
    }

    #[test]
    fn test_transport_mode_display() {
        assert_eq!(TransportMode::Car.to_string(), "CAR");
        assert_eq!(TransportMode::Unknown.as_str(), "UNKNOWN");
    }
}
