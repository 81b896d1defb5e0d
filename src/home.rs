//! Home location estimation from visit history.
//!
//! Visits are grouped into places: a visit joins the first place whose anchor (its
//! first visit's center) lies within `same_place_radius_meters`, otherwise it founds
//! a new place. Each place is scored
//!
//! ```text
//! score = dwell_hours * dwell_weight_per_hour + visit_count * visit_weight
//! ```
//!
//! and the highest score wins. Ties go to the place founded first.

use log::debug;

use crate::error::{ensure_non_negative, ensure_positive, ConfigError};
use crate::geo_utils::haversine_distance;
use crate::{saturating_count, GpsPoint, PlaceVisit};

/// Configuration for home detection
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct HomeConfig {
    /// Fewer visits than this in the whole history yields no estimate
    pub min_visit_count: usize,
    /// Visits within this distance of a place's anchor count as the same place (meters)
    pub same_place_radius_meters: f64,
    /// Score contributed by each hour of dwell time
    pub dwell_weight_per_hour: f64,
    /// Score contributed by each separate visit
    pub visit_weight: f64,
}

impl Default for HomeConfig {
    fn default() -> Self {
        Self {
            min_visit_count: 3,
            same_place_radius_meters: 200.0,
            dwell_weight_per_hour: 1.0,
            visit_weight: 1.0,
        }
    }
}

impl HomeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive("home.same_place_radius_meters", self.same_place_radius_meters)?;
        ensure_non_negative("home.dwell_weight_per_hour", self.dwell_weight_per_hour)?;
        ensure_non_negative("home.visit_weight", self.visit_weight)
    }
}

/// The estimated home of a user.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HomeLocation {
    /// Dwell-weighted mean of the member visit centers
    pub latitude: f64,
    pub longitude: f64,
    pub visit_count: u32,
    pub total_dwell_secs: i64,
    pub score: f64,
}

impl HomeLocation {
    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

#[derive(Debug)]
struct PlaceCluster<'a> {
    anchor: GpsPoint,
    visits: Vec<&'a PlaceVisit>,
}

impl PlaceCluster<'_> {
    fn dwell_secs(&self) -> i64 {
        self.visits.iter().map(|v| v.duration_secs().max(0)).sum()
    }

    fn score(&self, config: &HomeConfig) -> f64 {
        let hours = self.dwell_secs() as f64 / 3600.0;
        hours * config.dwell_weight_per_hour + self.visits.len() as f64 * config.visit_weight
    }

    fn representative(&self) -> GpsPoint {
        let total: f64 = self.visits.iter().map(|v| v.duration_secs().max(0) as f64).sum();
        let n = self.visits.len() as f64;

        let (lat, lng) = self.visits.iter().fold((0.0, 0.0), |(lat, lng), v| {
            let weight = if total > 0.0 {
                v.duration_secs().max(0) as f64 / total
            } else {
                1.0 / n
            };
            (lat + v.latitude * weight, lng + v.longitude * weight)
        });

        GpsPoint::new(lat, lng)
    }
}

/// Picks the most lived-in place from a user's visits.
pub struct HomeLocationDetector {
    config: HomeConfig,
}

impl HomeLocationDetector {
    pub fn new(config: HomeConfig) -> Self {
        Self { config }
    }

    /// Estimate home, or `None` when the history is too thin.
    pub fn detect(&self, visits: &[PlaceVisit]) -> Option<HomeLocation> {
        if visits.is_empty() || visits.len() < self.config.min_visit_count {
            debug!(
                "[HomeLocationDetector] {} visits, need {}",
                visits.len(),
                self.config.min_visit_count
            );
            return None;
        }

        let mut ordered: Vec<&PlaceVisit> = visits.iter().collect();
        ordered.sort_by_key(|v| v.start_time);

        let clusters = self.group(&ordered);

        let mut best: Option<(&PlaceCluster, f64)> = None;
        for cluster in &clusters {
            let score = cluster.score(&self.config);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((cluster, score));
            }
        }

        let (cluster, score) = best?;
        let center = cluster.representative();

        debug!(
            "[HomeLocationDetector] {} places, home at ({:.5}, {:.5}) with score {:.1}",
            clusters.len(),
            center.latitude,
            center.longitude,
            score
        );

        Some(HomeLocation {
            latitude: center.latitude,
            longitude: center.longitude,
            visit_count: saturating_count(cluster.visits.len()),
            total_dwell_secs: cluster.dwell_secs(),
            score,
        })
    }

    fn group<'a>(&self, ordered: &[&'a PlaceVisit]) -> Vec<PlaceCluster<'a>> {
        let mut clusters: Vec<PlaceCluster<'a>> = Vec::new();

        for &visit in ordered {
            let center = visit.center();
            let existing = clusters.iter_mut().find(|c| {
                haversine_distance(&c.anchor, &center) <= self.config.same_place_radius_meters
            });

            match existing {
                Some(cluster) => cluster.visits.push(visit),
                None => clusters.push(PlaceCluster {
                    anchor: center,
                    visits: vec![visit],
                }),
            }
        }

        clusters
    }
}
