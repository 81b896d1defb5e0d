//! # Route Segments
//!
//! Builds the [`RouteSegment`] connecting two consecutive place visits.
//!
//! ## Algorithm
//! 1. Distance = sum of haversine legs over the FULL-resolution samples
//! 2. Path = Douglas-Peucker simplification (ε in meters) for storage and rendering
//! 3. Transport tag = majority vote over a fresh sliding-window detector
//! 4. Start/end from the first/last sample
//!
//! The simplified path is never used for distance: cutting corners undercounts.

use std::collections::HashMap;

use geo::{Coord, LineString, SimplifyIdx};
use log::debug;

use crate::error::{ensure_positive, ConfigError};
use crate::geo_utils::{polyline_length, project_to_plane};
use crate::transport::{pair_speed_kmh, TransportConfig, TransportModeDetector};
use crate::{
    saturating_count, segment_id, sorted_valid_samples, GpsPoint, LocationSample, PlaceVisit,
    RouteSegment, TransportMode,
};

/// Configuration for route segment building
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SegmentConfig {
    /// Douglas-Peucker tolerance (meters)
    pub simplification_tolerance_meters: f64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            simplification_tolerance_meters: 50.0,
        }
    }
}

impl SegmentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive(
            "segments.simplification_tolerance_meters",
            self.simplification_tolerance_meters,
        )
    }
}

/// Simplify a path with Douglas-Peucker using a tolerance in meters.
///
/// Points are projected onto a local plane anchored at the first point, so the
/// tolerance means the same thing at every latitude. The returned points are the
/// original coordinates at the kept indices; first and last are always kept.
///
/// Simplifying an already simplified path with the same tolerance returns it unchanged.
///
/// # Example
/// ```
/// use travel_history::{GpsPoint, simplify_path};
///
/// // A straight line with a 1 m wobble in the middle
/// let path = vec![
///     GpsPoint::new(0.0, 0.0),
///     GpsPoint::new(0.00001, 0.001),
///     GpsPoint::new(0.0, 0.002),
/// ];
/// let simplified = simplify_path(&path, 50.0);
/// assert_eq!(simplified, vec![path[0], path[2]]);
/// assert_eq!(simplify_path(&simplified, 50.0), simplified);
/// ```
pub fn simplify_path(points: &[GpsPoint], epsilon_meters: f64) -> Vec<GpsPoint> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let origin = points[0];
    let coords: Vec<Coord> = points
        .iter()
        .map(|p| {
            let (x, y) = project_to_plane(&origin, p);
            Coord { x, y }
        })
        .collect();

    LineString::new(coords)
        .simplify_idx(&epsilon_meters)
        .into_iter()
        .map(|i| points[i])
        .collect()
}

/// Builds route segments from the samples between visits.
///
/// Each call uses its own transport detector, so segments never leak window state
/// into one another.
pub struct RouteSegmentBuilder {
    config: SegmentConfig,
    transport: TransportConfig,
}

impl RouteSegmentBuilder {
    pub fn new(config: SegmentConfig, transport: TransportConfig) -> Self {
        Self { config, transport }
    }

    /// Build a segment from samples already known to lie between two visits.
    ///
    /// Returns `None` for fewer than two usable samples: there is nothing to connect.
    pub fn build(&self, user_id: &str, samples: &[LocationSample]) -> Option<RouteSegment> {
        let ordered = sorted_valid_samples(samples);
        self.build_ordered(user_id, &ordered)
    }

    /// [`build`](Self::build) over samples already validated and sorted by time.
    fn build_ordered(&self, user_id: &str, ordered: &[&LocationSample]) -> Option<RouteSegment> {
        if ordered.len() < 2 {
            return None;
        }

        let first = ordered.first()?;
        let last = ordered.last()?;

        let points: Vec<GpsPoint> = ordered.iter().map(|s| s.point()).collect();
        let distance_meters = polyline_length(&points);
        let path = simplify_path(&points, self.config.simplification_tolerance_meters);
        let transport_mode = self.dominant_mode(ordered);

        let duration_secs = (last.timestamp - first.timestamp).num_seconds();
        let average_speed_kmh = if duration_secs > 0 {
            distance_meters / duration_secs as f64 * 3.6
        } else {
            0.0
        };
        let max_speed_kmh = ordered
            .windows(2)
            .filter_map(|w| pair_speed_kmh(&w[0].point(), w[0].timestamp, &w[1].point(), w[1].timestamp))
            .fold(0.0, f64::max);

        debug!(
            "[RouteSegmentBuilder] {} samples -> {} path points, {:.0}m, {}",
            ordered.len(),
            path.len(),
            distance_meters,
            transport_mode
        );

        Some(RouteSegment {
            id: segment_id(user_id, &first.timestamp, &last.timestamp),
            user_id: user_id.to_string(),
            start_time: first.timestamp,
            end_time: last.timestamp,
            path,
            distance_meters,
            transport_mode,
            sample_count: saturating_count(ordered.len()),
            duration_secs,
            average_speed_kmh,
            max_speed_kmh,
            from_visit_id: None,
            to_visit_id: None,
        })
    }

    /// Build the segment between two consecutive visits.
    ///
    /// Only samples strictly after `from.end_time` and strictly before `to.start_time`
    /// are used. The segment is linked to both visits.
    pub fn build_between(
        &self,
        user_id: &str,
        samples: &[LocationSample],
        from: &PlaceVisit,
        to: &PlaceVisit,
    ) -> Option<RouteSegment> {
        let ordered = sorted_valid_samples(samples);
        self.build_between_ordered(user_id, &ordered, from, to)
    }

    /// [`build_between`](Self::build_between) over samples already validated and sorted
    /// by time. The window is found by binary search.
    pub(crate) fn build_between_ordered(
        &self,
        user_id: &str,
        ordered: &[&LocationSample],
        from: &PlaceVisit,
        to: &PlaceVisit,
    ) -> Option<RouteSegment> {
        let lo = ordered.partition_point(|s| s.timestamp <= from.end_time);
        let hi = ordered.partition_point(|s| s.timestamp < to.start_time).max(lo);

        let mut segment = self.build_ordered(user_id, &ordered[lo..hi])?;
        segment.from_visit_id = Some(from.id.clone());
        segment.to_visit_id = Some(to.id.clone());
        Some(segment)
    }

    /// Most frequent classification across the segment's windows.
    ///
    /// `Unknown` only wins when nothing else was classified. On a tie the mode that
    /// reached the winning count first is kept.
    fn dominant_mode(&self, ordered: &[&LocationSample]) -> TransportMode {
        let mut detector = TransportModeDetector::new(self.transport.clone());
        let mut counts: HashMap<TransportMode, usize> = HashMap::new();
        let mut best: Option<(TransportMode, usize)> = None;

        for sample in ordered {
            let Some(mode) = detector.detect_transport_mode(sample) else {
                continue;
            };
            if mode == TransportMode::Unknown {
                continue;
            }

            let count = counts.entry(mode).or_insert(0);
            *count += 1;
            if best.map_or(true, |(_, c)| *count > c) {
                best = Some((mode, *count));
            }
        }

        best.map_or(TransportMode::Unknown, |(mode, _)| mode)
    }
}
