//! Reverse geocoding with a spatial-proximity cache.
//!
//! [`ReverseGeocoder`] is the capability boundary: implementations either return a
//! [`GeocodedLocation`] or `None`, and never surface errors to the pipeline.
//!
//! [`GeocodingCache`] stores previous answers in an R-tree keyed by coordinate and
//! answers "anything cached within N meters of here?". It never calls out to a
//! provider itself; [`CachingGeocoder`] layers the read-through behaviour on top.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use log::debug;
use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::clock::{Clock, SystemClock};
use crate::error::{ensure_at_most, ensure_non_negative, ensure_positive, ConfigError};
use crate::geo_utils::{bounding_box, haversine_distance};
use crate::{GeocodedLocation, GpsPoint};

/// Turns a coordinate into a human-readable place.
///
/// Implementations must not panic or block indefinitely: failures, timeouts and
/// "nothing here" all map to `None`. Remote providers are expected to enforce their
/// own per-lookup timeout (see `NominatimGeocoder` behind the `http` feature).
pub trait ReverseGeocoder: Send + Sync {
    fn reverse_geocode(&self, latitude: f64, longitude: f64) -> Option<GeocodedLocation>;
}

impl<G: ReverseGeocoder + ?Sized> ReverseGeocoder for Arc<G> {
    fn reverse_geocode(&self, latitude: f64, longitude: f64) -> Option<GeocodedLocation> {
        (**self).reverse_geocode(latitude, longitude)
    }
}

impl<G: ReverseGeocoder + ?Sized> ReverseGeocoder for Box<G> {
    fn reverse_geocode(&self, latitude: f64, longitude: f64) -> Option<GeocodedLocation> {
        (**self).reverse_geocode(latitude, longitude)
    }
}

/// Configuration for the read-through geocoding cache.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CacheConfig {
    /// A cached answer within this distance of a query is reused (meters)
    pub lookup_radius_meters: f64,
    /// How long a provider answer stays valid (seconds)
    pub ttl_secs: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lookup_radius_meters: 100.0,
            ttl_secs: 30 * 24 * 3600, // 30 days
        }
    }
}

/// Longest accepted cache TTL: 100 years.
pub const MAX_TTL_SECS: i64 = 100 * 365 * 24 * 3600;

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive("cache.lookup_radius_meters", self.lookup_radius_meters)?;
        ensure_non_negative("cache.ttl_secs", self.ttl_secs as f64)?;
        ensure_at_most("cache.ttl_secs", self.ttl_secs as f64, MAX_TTL_SECS as f64)
    }
}

// =============================================================================
// Cache Rows
// =============================================================================

/// A cached geocoding answer.
#[derive(Debug, Clone)]
struct CacheEntry {
    latitude: f64,
    longitude: f64,
    location: GeocodedLocation,
    cached_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

impl RTreeObject for CacheEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.longitude, self.latitude])
    }
}

impl PointDistance for CacheEntry {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dlng = self.longitude - point[0];
        let dlat = self.latitude - point[1];
        dlng * dlng + dlat * dlat
    }
}

// =============================================================================
// GeocodingCache
// =============================================================================

/// Spatial cache of reverse-geocoding answers with per-row expiry.
///
/// Rows are keyed by their exact coordinate pair. Expired rows are invisible to
/// [`get`](Self::get) and [`count`](Self::count) but stay in memory until
/// [`clear_expired`](Self::clear_expired) runs.
pub struct GeocodingCache {
    tree: RTree<CacheEntry>,
    clock: Arc<dyn Clock>,
}

impl Default for GeocodingCache {
    fn default() -> Self {
        Self::new()
    }
}

impl GeocodingCache {
    /// Create an empty cache on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty cache reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { tree: RTree::new(), clock }
    }

    /// Nearest live cached location within `radius_meters` of the query, if any.
    ///
    /// Candidates come from a bounding-box query on the R-tree (split in two at the
    /// antimeridian), then are checked against the exact haversine distance.
    pub fn get(&self, latitude: f64, longitude: f64, radius_meters: f64) -> Option<GeocodedLocation> {
        let query = GpsPoint::new(latitude, longitude);
        if !query.is_valid() {
            return None;
        }

        let now = self.clock.now();
        let bounds = bounding_box(&query, radius_meters);
        let envelopes: Vec<AABB<[f64; 2]>> = bounds
            .lng_lat_rects()
            .into_iter()
            .map(|(lower, upper)| AABB::from_corners(lower, upper))
            .collect();

        envelopes
            .iter()
            .flat_map(|envelope| self.tree.locate_in_envelope(envelope))
            .filter(|entry| entry.is_live(now))
            .map(|entry| (entry, haversine_distance(&query, &entry.location.point())))
            .filter(|(_, dist)| *dist <= radius_meters)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(entry, _)| entry.location.clone())
    }

    /// Insert or replace the row at the location's exact coordinate.
    pub fn put(&mut self, location: GeocodedLocation, ttl_secs: i64) {
        let key = [location.longitude, location.latitude];
        while self.tree.remove_at_point(&key).is_some() {}

        let cached_at = self.clock.now();
        let entry = CacheEntry {
            latitude: location.latitude,
            longitude: location.longitude,
            location,
            cached_at,
            expires_at: expiry(cached_at, ttl_secs),
        };
        debug!(
            "[GeocodingCache] Cached ({:.5}, {:.5}) until {}",
            entry.latitude, entry.longitude, entry.expires_at
        );
        self.tree.insert(entry);
    }

    /// Drop expired rows. Returns how many were removed.
    pub fn clear_expired(&mut self) -> usize {
        let now = self.clock.now();
        let before = self.tree.size();
        let live: Vec<CacheEntry> = self
            .tree
            .iter()
            .filter(|entry| entry.is_live(now))
            .cloned()
            .collect();
        self.tree = RTree::bulk_load(live);
        before - self.tree.size()
    }

    /// Drop every row.
    pub fn clear(&mut self) {
        self.tree = RTree::new();
    }

    /// Number of live rows.
    pub fn count(&self) -> usize {
        let now = self.clock.now();
        self.tree.iter().filter(|entry| entry.is_live(now)).count()
    }

    /// When the row at this exact coordinate was cached, if it is still live.
    pub fn cached_at(&self, latitude: f64, longitude: f64) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.tree
            .locate_all_at_point(&[longitude, latitude])
            .find(|entry| entry.is_live(now))
            .map(|entry| entry.cached_at)
    }
}

/// `cached_at + ttl_secs`, saturating at the latest representable time.
fn expiry(cached_at: DateTime<Utc>, ttl_secs: i64) -> DateTime<Utc> {
    Duration::try_seconds(ttl_secs.max(0))
        .and_then(|ttl| cached_at.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// =============================================================================
// Read-through Wrapper
// =============================================================================

/// A [`ReverseGeocoder`] that consults a [`GeocodingCache`] before its provider.
///
/// Provider answers are cached at the queried coordinate, so repeated lookups
/// near the same place are served locally. Provider misses are not cached.
///
/// # Example
/// ```
/// use travel_history::{CacheConfig, CachingGeocoder, GeocodedLocation, GeocodingCache, ReverseGeocoder};
///
/// struct Everywhere;
/// impl ReverseGeocoder for Everywhere {
///     fn reverse_geocode(&self, lat: f64, lng: f64) -> Option<GeocodedLocation> {
///         let mut loc = GeocodedLocation::new(lat, lng);
///         loc.country_code = Some("GB".to_string());
///         Some(loc)
///     }
/// }
///
/// let geocoder = CachingGeocoder::new(Everywhere, GeocodingCache::new(), CacheConfig::default());
/// assert!(geocoder.reverse_geocode(51.5, -0.12).is_some());
/// assert_eq!(geocoder.cache().count(), 1);
/// ```
pub struct CachingGeocoder<G> {
    inner: G,
    cache: Mutex<GeocodingCache>,
    config: CacheConfig,
}

impl<G: ReverseGeocoder> CachingGeocoder<G> {
    pub fn new(inner: G, cache: GeocodingCache, config: CacheConfig) -> Self {
        Self {
            inner,
            cache: Mutex::new(cache),
            config,
        }
    }

    /// Lock the underlying cache for maintenance (clearing, counting).
    pub fn cache(&self) -> MutexGuard<'_, GeocodingCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }
}

impl<G: ReverseGeocoder> ReverseGeocoder for CachingGeocoder<G> {
    fn reverse_geocode(&self, latitude: f64, longitude: f64) -> Option<GeocodedLocation> {
        let cached = self
            .cache()
            .get(latitude, longitude, self.config.lookup_radius_meters);
        if let Some(hit) = cached {
            debug!("[CachingGeocoder] Cache hit near ({:.5}, {:.5})", latitude, longitude);
            return Some(hit);
        }

        // The provider call happens without holding the lock
        let mut fresh = self.inner.reverse_geocode(latitude, longitude)?;
        fresh.latitude = latitude;
        fresh.longitude = longitude;

        self.cache().put(fresh.clone(), self.config.ttl_secs);
        Some(fresh)
    }
}
