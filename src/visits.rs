//! # Place Visit Detection
//!
//! Groups one user's samples into dwell periods with a single greedy pass.
//!
//! ## Algorithm
//! 1. Sort samples by time and drop any with invalid coordinates
//! 2. Walk in time order; a sample within `spatial_threshold_meters` of the LAST sample
//!    added to the open cluster joins it, otherwise the cluster closes and a new one starts
//! 3. Discard clusters spanning less than `min_duration_secs`
//! 4. Centroid = arithmetic mean of member coordinates
//! 5. Enrich via the reverse geocoder at the centroid (absence is fine)
//! 6. Deterministic id from user, start time and quantized centroid
//!
//! Comparing against the last point rather than a centroid means a slow drift of many
//! short steps can stretch one visit well past the threshold.
//!
//! Clustering is purely spatial and sequential: a night spent in one place stays one
//! visit regardless of calendar-day boundaries.

use log::{debug, info};

use crate::error::{ensure_non_negative, ensure_positive, ConfigError};
use crate::geo_utils::{compute_center, haversine_distance};
use crate::geocoding::ReverseGeocoder;
use crate::{sorted_valid_samples, visit_id, GpsPoint, LocationSample, PlaceVisit};

/// Configuration for place visit detection
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct VisitConfig {
    /// Maximum distance from the previous cluster member to join a cluster (meters)
    pub spatial_threshold_meters: f64,
    /// Minimum time span for a cluster to count as a visit (seconds)
    pub min_duration_secs: i64,
}

impl Default for VisitConfig {
    fn default() -> Self {
        Self {
            spatial_threshold_meters: 100.0,
            min_duration_secs: 10 * 60,
        }
    }
}

impl VisitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive("visits.spatial_threshold_meters", self.spatial_threshold_meters)?;
        ensure_non_negative("visits.min_duration_secs", self.min_duration_secs as f64)
    }
}

/// Detects place visits from a user's location samples.
///
/// The open cluster only lives for the duration of one [`detect`](Self::detect) call,
/// so a detector can be reused across runs but is never shared mid-run.
///
/// # Example
/// ```
/// use chrono::{Duration, TimeZone, Utc};
/// use travel_history::{LocationSample, PlaceVisitDetector, VisitConfig};
///
/// let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
/// let samples: Vec<LocationSample> = (0..12)
///     .map(|i| LocationSample::new(format!("s{i}"), "u", t0 + Duration::minutes(i), 52.52, 13.405))
///     .collect();
///
/// let visits = PlaceVisitDetector::new(VisitConfig::default()).detect("u", &samples);
/// assert_eq!(visits.len(), 1);
/// assert_eq!(visits[0].duration_secs(), 11 * 60);
/// ```
pub struct PlaceVisitDetector<'a> {
    config: VisitConfig,
    geocoder: Option<&'a dyn ReverseGeocoder>,
}

impl<'a> PlaceVisitDetector<'a> {
    pub fn new(config: VisitConfig) -> Self {
        Self { config, geocoder: None }
    }

    /// Enrich detected visits through `geocoder`.
    pub fn with_geocoder(mut self, geocoder: &'a dyn ReverseGeocoder) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn config(&self) -> &VisitConfig {
        &self.config
    }

    /// Detect visits in `samples`, which must all belong to `user_id`.
    ///
    /// Input order does not matter; samples are sorted by timestamp first.
    pub fn detect(&self, user_id: &str, samples: &[LocationSample]) -> Vec<PlaceVisit> {
        let ordered = sorted_valid_samples(samples);
        if ordered.is_empty() {
            return Vec::new();
        }

        let clusters = self.cluster(&ordered);
        let cluster_count = clusters.len();

        let visits: Vec<PlaceVisit> = clusters
            .into_iter()
            .filter(|cluster| cluster_span_secs(cluster) >= self.config.min_duration_secs)
            .filter_map(|cluster| self.build_visit(user_id, &cluster))
            .collect();

        info!(
            "[PlaceVisitDetector] {} samples -> {} clusters -> {} visits for {}",
            ordered.len(),
            cluster_count,
            visits.len(),
            user_id
        );

        visits
    }

    /// Greedy sequential clustering against the last point added.
    fn cluster<'s>(&self, ordered: &[&'s LocationSample]) -> Vec<Vec<&'s LocationSample>> {
        let mut clusters = Vec::new();
        let mut current: Vec<&LocationSample> = Vec::new();

        for &sample in ordered {
            let joins = current.last().is_some_and(|last| {
                haversine_distance(&last.point(), &sample.point()) <= self.config.spatial_threshold_meters
            });

            if !joins && !current.is_empty() {
                clusters.push(std::mem::take(&mut current));
            }
            current.push(sample);
        }

        if !current.is_empty() {
            clusters.push(current);
        }

        clusters
    }

    fn build_visit(&self, user_id: &str, cluster: &[&LocationSample]) -> Option<PlaceVisit> {
        let first = cluster.first()?;
        let last = cluster.last()?;

        let points: Vec<GpsPoint> = cluster.iter().map(|s| s.point()).collect();
        let center = compute_center(&points)?;

        let place = self
            .geocoder
            .and_then(|g| g.reverse_geocode(center.latitude, center.longitude));
        if self.geocoder.is_some() && place.is_none() {
            debug!(
                "[PlaceVisitDetector] No geocode for visit at ({:.5}, {:.5})",
                center.latitude, center.longitude
            );
        }

        Some(PlaceVisit {
            id: visit_id(user_id, &first.timestamp, &center),
            user_id: user_id.to_string(),
            start_time: first.timestamp,
            end_time: last.timestamp,
            latitude: center.latitude,
            longitude: center.longitude,
            place,
            sample_ids: cluster.iter().map(|s| s.id.clone()).collect(),
        })
    }
}

fn cluster_span_secs(cluster: &[&LocationSample]) -> i64 {
    match (cluster.first(), cluster.last()) {
        (Some(first), Some(last)) => (last.timestamp - first.timestamp).num_seconds(),
        _ => 0,
    }
}
