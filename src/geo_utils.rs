//! # Geographic Utilities
//!
//! Core geographic computation utilities shared by every detector in the crate.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two GPS points |
//! | [`polyline_length`] | Total length of a GPS track in meters |
//! | [`bounding_box`] | Lat/lng rectangle approximating a radius around a point |
//! | [`compute_center`] | Arithmetic-mean centroid of a set of points |
//! | [`project_to_plane`] | Local equirectangular projection to meters |
//!
//! ## Example
//!
//! ```rust
//! use travel_history::{GpsPoint, geo_utils};
//!
//! let track = vec![
//!     GpsPoint::new(51.5074, -0.1278),  // London
//!     GpsPoint::new(51.5080, -0.1290),
//!     GpsPoint::new(51.5090, -0.1300),
//! ];
//!
//! let length = geo_utils::polyline_length(&track);
//! assert!(length > geo_utils::haversine_distance(&track[0], &track[2]) - 1e-6);
//!
//! let bounds = geo_utils::bounding_box(&track[0], 500.0);
//! assert!(bounds.contains(&track[1]));
//! ```
//!
//! ## Algorithm Notes
//!
//! ### Haversine Formula
//!
//! Distances use the haversine formula on a sphere of radius 6,371,000 m. This is accurate
//! to within ~0.3% of the WGS84 ellipsoid, which is far below GPS noise at visit scale.
//!
//! Reference: [Haversine formula (Wikipedia)](https://en.wikipedia.org/wiki/Haversine_formula)
//!
//! ### Bounding Boxes
//!
//! [`bounding_box`] is a pre-filter only. Callers must confirm candidates with
//! [`haversine_distance`] before trusting them.

use crate::{Bounds, GpsPoint};

/// Spherical Earth radius used for all distance computations (meters).
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Length of one degree of latitude on the reference sphere (meters).
pub const METERS_PER_DEGREE_LAT: f64 = EARTH_RADIUS_METERS * std::f64::consts::PI / 180.0;

// Below this cos(latitude) the longitude span of a bounding box is clamped to the full range.
const MIN_COS_LAT: f64 = 1e-6;

// =============================================================================
// Distance Functions
// =============================================================================

/// Calculate the great-circle distance between two GPS points using the Haversine formula.
///
/// Returns the distance in meters along the surface of a sphere of radius
/// [`EARTH_RADIUS_METERS`]. Non-finite input propagates as NaN; validate points with
/// [`GpsPoint::is_valid`] first.
///
/// Written out rather than using `geo::Haversine`, whose radius is fixed at the IUGG mean
/// of 6,371,008.8 m.
///
/// # Example
///
/// ```rust
/// use travel_history::{GpsPoint, geo_utils};
///
/// let london = GpsPoint::new(51.5074, -0.1278);
/// let paris = GpsPoint::new(48.8566, 2.3522);
///
/// let distance = geo_utils::haversine_distance(&london, &paris);
/// assert!((distance - 343_560.0).abs() < 1000.0); // ~344 km
/// ```
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let lat1 = p1.latitude.to_radians();
    let lat2 = p2.latitude.to_radians();
    let dlat = (p2.latitude - p1.latitude).to_radians();
    let dlng = (p2.longitude - p1.longitude).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().clamp(0.0, 1.0).asin();

    EARTH_RADIUS_METERS * c
}

/// Calculate the total length of a polyline (GPS track) in meters.
///
/// Sums the haversine distance between consecutive points. Empty or single-point
/// tracks return 0.0.
pub fn polyline_length(points: &[GpsPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }

    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

// =============================================================================
// Bounding Box Functions
// =============================================================================

/// Compute a lat/lng rectangle approximating a circle of `radius_meters` around `center`.
///
/// The longitude half-width is scaled by `1 / cos(latitude)` to account for meridian
/// convergence. Latitudes are clamped to [-90, 90]; when the box would cover a pole the
/// longitude range widens to the full [-180, 180].
///
/// A box reaching past the antimeridian wraps around: its `min_lng` is then greater than
/// its `max_lng` (see [`Bounds::crosses_antimeridian`]).
///
/// # Example
///
/// ```rust
/// use travel_history::{GpsPoint, geo_utils};
///
/// let center = GpsPoint::new(60.0, 10.0);
/// let bounds = geo_utils::bounding_box(&center, 1000.0);
///
/// // At 60°N a degree of longitude is half as long as at the equator
/// let lat_span = bounds.max_lat - bounds.min_lat;
/// let lng_span = bounds.max_lng - bounds.min_lng;
/// assert!((lng_span / lat_span - 2.0).abs() < 0.01);
/// ```
pub fn bounding_box(center: &GpsPoint, radius_meters: f64) -> Bounds {
    let radius = radius_meters.max(0.0);
    let lat_delta = radius / METERS_PER_DEGREE_LAT;

    let min_lat = (center.latitude - lat_delta).max(-90.0);
    let max_lat = (center.latitude + lat_delta).min(90.0);

    let cos_lat = center.latitude.to_radians().cos();
    let touches_pole = max_lat >= 90.0 || min_lat <= -90.0;

    let lng_delta = if cos_lat < MIN_COS_LAT { 180.0 } else { lat_delta / cos_lat };

    let (min_lng, max_lng) = if touches_pole || lng_delta >= 180.0 {
        (-180.0, 180.0)
    } else {
        (
            wrap_longitude(center.longitude - lng_delta),
            wrap_longitude(center.longitude + lng_delta),
        )
    };

    Bounds { min_lat, max_lat, min_lng, max_lng }
}

fn wrap_longitude(longitude: f64) -> f64 {
    if longitude < -180.0 {
        longitude + 360.0
    } else if longitude > 180.0 {
        longitude - 360.0
    } else {
        longitude
    }
}

// =============================================================================
// Center/Centroid Functions
// =============================================================================

/// Compute the arithmetic-mean centroid of a set of points.
///
/// Suitable for visit-scale clusters. Sets that straddle the antimeridian
/// (180°/-180° longitude) produce a meaningless longitude.
///
/// Returns `None` for empty input.
pub fn compute_center(points: &[GpsPoint]) -> Option<GpsPoint> {
    if points.is_empty() {
        return None;
    }

    let sum_lat: f64 = points.iter().map(|p| p.latitude).sum();
    let sum_lng: f64 = points.iter().map(|p| p.longitude).sum();
    let n = points.len() as f64;

    Some(GpsPoint::new(sum_lat / n, sum_lng / n))
}

// =============================================================================
// Projection
// =============================================================================

/// Project a point onto a local equirectangular plane anchored at `origin`.
///
/// Returns `(x, y)` in meters east/north of the origin. Accurate for the tens of
/// kilometers a route segment spans; not meant for continental distances.
#[inline]
pub fn project_to_plane(origin: &GpsPoint, point: &GpsPoint) -> (f64, f64) {
    let cos_lat = origin.latitude.to_radians().cos();
    let x = (point.longitude - origin.longitude) * METERS_PER_DEGREE_LAT * cos_lat;
    let y = (point.latitude - origin.latitude) * METERS_PER_DEGREE_LAT;
    (x, y)
}

// =============================================================================
// Unit Tests
// =============================================================================
