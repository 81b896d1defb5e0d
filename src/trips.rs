//! # Trip Detection
//!
//! Segments a user's visit history into trips away from home.
//!
//! ## Algorithm
//! 1. A visit is "away" when it lies more than `min_home_distance_meters` from home.
//!    Without a known home, [`NoHomePolicy`] decides.
//! 2. Consecutive away visits form one run while the gap between one visit's end and
//!    the next visit's start stays within `max_gap_secs`. A visit at home ends the run.
//!    Runs may span any number of calendar days.
//! 3. Each run becomes a [`Trip`]: deterministic id, most frequent country, and the
//!    route segments that belong to it.
//! 4. Only the last run can be ongoing, and only when nobody came home after it and its
//!    last visit ended within `ongoing_recency_secs` of now.
//!
//! The recency rule is a heuristic: a trip with sparse fixes (flight mode, dead battery)
//! can be closed early.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::error::{ensure_non_negative, ensure_positive, ConfigError};
use crate::geo_utils::haversine_distance;
use crate::home::HomeLocation;
use crate::{trip_id, PlaceVisit, RouteSegment, Trip};

/// What to do when no home location is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum NoHomePolicy {
    /// Every visit is a trip candidate
    #[default]
    AllAway,
    /// No trips are produced
    NoTrips,
}

/// Configuration for trip detection
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TripConfig {
    /// Visits farther than this from home are away (meters)
    pub min_home_distance_meters: f64,
    /// Largest allowed gap between consecutive visits of one trip (seconds)
    pub max_gap_secs: i64,
    /// The last trip is ongoing if it ended less than this long ago (seconds)
    pub ongoing_recency_secs: i64,
    pub no_home_policy: NoHomePolicy,
}

impl Default for TripConfig {
    fn default() -> Self {
        Self {
            min_home_distance_meters: 50_000.0,
            max_gap_secs: 36 * 3600,
            ongoing_recency_secs: 24 * 3600,
            no_home_policy: NoHomePolicy::AllAway,
        }
    }
}

impl TripConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive("trips.min_home_distance_meters", self.min_home_distance_meters)?;
        ensure_non_negative("trips.max_gap_secs", self.max_gap_secs as f64)?;
        ensure_non_negative("trips.ongoing_recency_secs", self.ongoing_recency_secs as f64)
    }
}

/// A contiguous run of away visits.
#[derive(Debug, Clone, PartialEq)]
pub struct TripRun {
    /// Indices into the visit slice given to the detector, in time order
    pub visit_indices: Vec<usize>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// A visit at home follows the run
    pub closed_by_return: bool,
}

/// Finds runs of away visits.
pub struct TripBoundaryDetector {
    config: TripConfig,
}

impl TripBoundaryDetector {
    pub fn new(config: TripConfig) -> Self {
        Self { config }
    }

    /// Whether a visit counts as away from `home`.
    pub fn is_away(&self, visit: &PlaceVisit, home: Option<&HomeLocation>) -> bool {
        match home {
            Some(home) => haversine_distance(&home.point(), &visit.center()) > self.config.min_home_distance_meters,
            None => self.config.no_home_policy == NoHomePolicy::AllAway,
        }
    }

    /// Split `visits` into runs. Input order does not matter.
    pub fn detect(&self, visits: &[PlaceVisit], home: Option<&HomeLocation>) -> Vec<TripRun> {
        let mut order: Vec<usize> = (0..visits.len()).collect();
        order.sort_by_key(|&i| visits[i].start_time);

        let mut runs = Vec::new();
        let mut current: Vec<usize> = Vec::new();

        for i in order {
            let visit = &visits[i];

            if !self.is_away(visit, home) {
                if let Some(run) = close_run(visits, &mut current, true) {
                    runs.push(run);
                }
                continue;
            }

            let too_far_apart = current.last().is_some_and(|&prev| {
                (visit.start_time - visits[prev].end_time).num_seconds() > self.config.max_gap_secs
            });
            if too_far_apart {
                if let Some(run) = close_run(visits, &mut current, false) {
                    runs.push(run);
                }
            }

            current.push(i);
        }

        if let Some(run) = close_run(visits, &mut current, false) {
            runs.push(run);
        }

        runs
    }
}

fn close_run(visits: &[PlaceVisit], current: &mut Vec<usize>, closed_by_return: bool) -> Option<TripRun> {
    if current.is_empty() {
        return None;
    }
    let visit_indices = std::mem::take(current);
    let start_time = visits[visit_indices[0]].start_time;
    let end_time = visit_indices
        .iter()
        .map(|&i| visits[i].end_time)
        .max()
        .unwrap_or(start_time);

    Some(TripRun {
        visit_indices,
        start_time,
        end_time,
        closed_by_return,
    })
}

/// Builds [`Trip`]s from visit history.
///
/// # Example
/// ```
/// use chrono::{Duration, TimeZone, Utc};
/// use travel_history::{PlaceVisit, TripConfig, TripDetector};
///
/// let t0 = Utc.with_ymd_and_hms(2024, 8, 1, 10, 0, 0).unwrap();
/// let visit = PlaceVisit {
///     id: "v1".into(),
///     user_id: "u".into(),
///     start_time: t0,
///     end_time: t0 + Duration::hours(3),
///     latitude: 41.39,
///     longitude: 2.17,
///     place: None,
///     sample_ids: vec![],
/// };
///
/// // No home known: every visit is a candidate
/// let trips = TripDetector::new(TripConfig::default())
///     .detect("u", &[visit], &[], None, t0 + Duration::days(7));
/// assert_eq!(trips.len(), 1);
/// assert!(!trips[0].is_ongoing);
/// ```
pub struct TripDetector {
    config: TripConfig,
    boundaries: TripBoundaryDetector,
}

impl TripDetector {
    pub fn new(config: TripConfig) -> Self {
        Self {
            boundaries: TripBoundaryDetector::new(config.clone()),
            config,
        }
    }

    /// Detect runs and build trips in one step.
    pub fn detect(
        &self,
        user_id: &str,
        visits: &[PlaceVisit],
        segments: &[RouteSegment],
        home: Option<&HomeLocation>,
        now: DateTime<Utc>,
    ) -> Vec<Trip> {
        let runs = self.boundaries.detect(visits, home);
        let trips = self.build_trips(user_id, visits, &runs, segments, now);

        info!(
            "[TripDetector] {} visits -> {} trips for {} (home known: {})",
            visits.len(),
            trips.len(),
            user_id,
            home.is_some()
        );

        trips
    }

    /// Turn runs from [`TripBoundaryDetector::detect`] into trips.
    pub fn build_trips(
        &self,
        user_id: &str,
        visits: &[PlaceVisit],
        runs: &[TripRun],
        segments: &[RouteSegment],
        now: DateTime<Utc>,
    ) -> Vec<Trip> {
        let last_index = runs.len().checked_sub(1);
        let owners = assign_segments(visits, runs, segments);

        runs.iter()
            .enumerate()
            .map(|(index, run)| {
                let is_last = Some(index) == last_index;
                let own_segments: Vec<&RouteSegment> = segments
                    .iter()
                    .zip(&owners)
                    .filter(|(_, owner)| **owner == Some(index))
                    .map(|(segment, _)| segment)
                    .collect();
                self.build_trip(user_id, visits, run, index, is_last, &own_segments, now)
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn build_trip(
        &self,
        user_id: &str,
        visits: &[PlaceVisit],
        run: &TripRun,
        index: usize,
        is_last: bool,
        trip_segments: &[&RouteSegment],
        now: DateTime<Utc>,
    ) -> Trip {
        let members: Vec<&PlaceVisit> = run.visit_indices.iter().map(|&i| &visits[i]).collect();
        let visit_ids: Vec<String> = members.iter().map(|v| v.id.clone()).collect();

        let (primary_country, countries) = country_summary(&members);

        let recent = (now - run.end_time).num_seconds() <= self.config.ongoing_recency_secs;
        let is_ongoing = is_last && !run.closed_by_return && recent;

        debug!(
            "[TripDetector] Trip #{} {} -> {} ({} visits, ongoing: {})",
            index,
            run.start_time,
            run.end_time,
            members.len(),
            is_ongoing
        );

        Trip {
            id: trip_id(user_id, &run.start_time, index),
            user_id: user_id.to_string(),
            start_time: run.start_time,
            end_time: (!is_ongoing).then_some(run.end_time),
            primary_country,
            is_ongoing,
            visit_ids,
            segment_ids: trip_segments.iter().map(|s| s.id.clone()).collect(),
            countries,
            distance_meters: trip_segments.iter().map(|s| s.distance_meters).sum(),
        }
    }
}

/// The run (by index) each segment counts toward, if any.
///
/// A segment goes to the run holding its destination visit, else the run holding its
/// origin visit, else the first run whose time span contains it. Each segment is
/// therefore counted in at most one trip.
fn assign_segments(
    visits: &[PlaceVisit],
    runs: &[TripRun],
    segments: &[RouteSegment],
) -> Vec<Option<usize>> {
    let run_of_visit: HashMap<&str, usize> = runs
        .iter()
        .enumerate()
        .flat_map(|(index, run)| run.visit_indices.iter().map(move |&i| (visits[i].id.as_str(), index)))
        .collect();

    segments
        .iter()
        .map(|segment| {
            let linked = |id: &Option<String>| id.as_deref().and_then(|id| run_of_visit.get(id).copied());

            linked(&segment.to_visit_id)
                .or_else(|| linked(&segment.from_visit_id))
                .or_else(|| {
                    runs.iter().position(|run| {
                        segment.start_time >= run.start_time && segment.end_time <= run.end_time
                    })
                })
        })
        .collect()
}

/// Most frequent country (ties to the first seen) and distinct countries in order.
fn country_summary(members: &[&PlaceVisit]) -> (Option<String>, Vec<String>) {
    let mut countries: Vec<String> = Vec::new();
    let mut counts: HashMap<&str, usize> = HashMap::new();

    for code in members.iter().filter_map(|v| v.country_code()) {
        let count = counts.entry(code).or_insert(0);
        *count += 1;
        if *count == 1 {
            countries.push(code.to_string());
        }
    }

    let mut primary: Option<(&str, usize)> = None;
    for code in &countries {
        let count = counts.get(code.as_str()).copied().unwrap_or(0);
        if primary.map_or(true, |(_, best)| count > best) {
            primary = Some((code.as_str(), count));
        }
    }

    (primary.map(|(code, _)| code.to_string()), countries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GeocodedLocation, TransportMode};
    use chrono::{Duration, TimeZone};

    const HOME_LAT: f64 = 52.52;
    const HOME_LNG: f64 = 13.405;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, day, hour, 0, 0).unwrap()
    }

    fn home() -> HomeLocation {
        HomeLocation {
            latitude: HOME_LAT,
            longitude: HOME_LNG,
            visit_count: 10,
            total_dwell_secs: 100 * 3600,
            score: 110.0,
        }
    }

    fn visit(id: &str, start: DateTime<Utc>, hours: i64, lat: f64, lng: f64, country: Option<&str>) -> PlaceVisit {
        PlaceVisit {
            id: id.to_string(),
            user_id: "u".to_string(),
            start_time: start,
            end_time: start + Duration::hours(hours),
            latitude: lat,
            longitude: lng,
            place: country.map(|c| {
                let mut loc = GeocodedLocation::new(lat, lng);
                loc.country_code = Some(c.to_string());
                loc
            }),
            sample_ids: Vec::new(),
        }
    }

    fn at_home(id: &str, start: DateTime<Utc>, hours: i64) -> PlaceVisit {
        visit(id, start, hours, HOME_LAT, HOME_LNG, Some("DE"))
    }

    fn segment(id: &str, start: DateTime<Utc>, end: DateTime<Utc>, meters: f64) -> RouteSegment {
        RouteSegment {
            id: id.to_string(),
            user_id: "u".to_string(),
            start_time: start,
            end_time: end,
            path: Vec::new(),
            distance_meters: meters,
            transport_mode: TransportMode::Car,
            sample_count: 2,
            duration_secs: (end - start).num_seconds(),
            average_speed_kmh: 0.0,
            max_speed_kmh: 0.0,
            from_visit_id: None,
            to_visit_id: None,
        }
    }

    /// Prague for two nights, then Vienna, each gap under 36 h.
    fn three_day_trip() -> Vec<PlaceVisit> {
        vec![
            at_home("h1", at(1, 8), 2),
            visit("p1", at(2, 12), 10, 50.0755, 14.4378, Some("CZ")),
            visit("p2", at(3, 9), 6, 50.0870, 14.4208, Some("CZ")),
            visit("w1", at(4, 10), 8, 48.2082, 16.3738, Some("AT")),
            at_home("h2", at(5, 18), 12),
        ]
    }

    #[test]
    fn test_multi_day_run_is_one_trip() {
        let visits = three_day_trip();
        let h = home();
        let trips = TripDetector::new(TripConfig::default()).detect("u", &visits, &[], Some(&h), at(10, 0));

        assert_eq!(trips.len(), 1);
        let trip = &trips[0];
        assert_eq!(trip.start_time, at(2, 12));
        assert_eq!(trip.end_time, Some(at(4, 18)));
        assert_eq!(trip.visit_ids, vec!["p1", "p2", "w1"]);
        assert_eq!(trip.primary_country.as_deref(), Some("CZ"));
        assert_eq!(trip.countries, vec!["CZ", "AT"]);
        assert!(!trip.is_ongoing);
    }

    #[test]
    fn test_large_gap_splits_runs() {
        let visits = vec![
            visit("a", at(1, 10), 4, 48.85, 2.35, Some("FR")),
            // 3 days later: beyond the 36 h gap
            visit("b", at(4, 14), 4, 48.86, 2.35, Some("FR")),
        ];
        let h = home();
        let runs = TripBoundaryDetector::new(TripConfig::default()).detect(&visits, Some(&h));
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].visit_indices, vec![0]);
        assert!(!runs[0].closed_by_return);
    }

    #[test]
    fn test_home_visit_breaks_run() {
        let visits = vec![
            visit("a", at(1, 10), 4, 48.85, 2.35, None),
            at_home("h", at(1, 20), 8),
            visit("b", at(2, 10), 4, 48.85, 2.35, None),
        ];
        let h = home();
        let runs = TripBoundaryDetector::new(TripConfig::default()).detect(&visits, Some(&h));
        assert_eq!(runs.len(), 2);
        assert!(runs[0].closed_by_return);
    }

    #[test]
    fn test_nearby_visits_are_not_away() {
        // ~11 km from home
        let visits = vec![visit("near", at(1, 10), 4, 52.62, 13.405, Some("DE"))];
        let h = home();
        let trips = TripDetector::new(TripConfig::default()).detect("u", &visits, &[], Some(&h), at(2, 0));
        assert!(trips.is_empty());
    }

    #[test]
    fn test_unsorted_input() {
        let mut visits = three_day_trip();
        visits.reverse();
        let h = home();
        let runs = TripBoundaryDetector::new(TripConfig::default()).detect(&visits, Some(&h));
        assert_eq!(runs.len(), 1);
        let ids: Vec<&str> = runs[0].visit_indices.iter().map(|&i| visits[i].id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p2", "w1"]);
    }

    #[test]
    fn test_recent_last_run_is_ongoing() {
        let visits = vec![
            visit("a", at(1, 10), 4, 48.85, 2.35, Some("FR")),
            visit("b", at(2, 10), 4, 43.30, 5.37, Some("FR")),
        ];
        let h = home();
        let trips = TripDetector::new(TripConfig::default()).detect("u", &visits, &[], Some(&h), at(3, 0));
        assert_eq!(trips.len(), 1);
        assert!(trips[0].is_ongoing);
        assert_eq!(trips[0].end_time, None);
    }

    #[test]
    fn test_stale_last_run_is_closed() {
        let visits = vec![visit("a", at(1, 10), 4, 48.85, 2.35, Some("FR"))];
        let h = home();
        // Ended at 14:00 on day 1, now is 2 days later
        let trips = TripDetector::new(TripConfig::default()).detect("u", &visits, &[], Some(&h), at(3, 14));
        assert!(!trips[0].is_ongoing);
        assert_eq!(trips[0].end_time, Some(at(1, 14)));
    }

    #[test]
    fn test_return_home_closes_recent_trip() {
        let visits = vec![
            visit("a", at(1, 10), 4, 48.85, 2.35, Some("FR")),
            at_home("h", at(1, 20), 2),
        ];
        let h = home();
        let trips = TripDetector::new(TripConfig::default()).detect("u", &visits, &[], Some(&h), at(1, 23));
        assert!(!trips[0].is_ongoing);
    }

    #[test]
    fn test_no_home_policy() {
        let visits = vec![at_home("h", at(1, 8), 2)];
        let all = TripDetector::new(TripConfig::default()).detect("u", &visits, &[], None, at(5, 0));
        assert_eq!(all.len(), 1);

        let config = TripConfig {
            no_home_policy: NoHomePolicy::NoTrips,
            ..Default::default()
        };
        assert!(TripDetector::new(config).detect("u", &visits, &[], None, at(5, 0)).is_empty());
    }

    #[test]
    fn test_segments_attached_by_link_and_time() {
        let visits = three_day_trip();
        let mut outbound = segment("out", at(1, 10), at(2, 11), 280_000.0);
        outbound.to_visit_id = Some("p1".to_string());
        let inside = segment("in", at(3, 16), at(4, 9), 330_000.0);
        let unrelated = segment("other", at(6, 8), at(6, 9), 5_000.0);

        let h = home();
        let trips = TripDetector::new(TripConfig::default()).detect(
            "u",
            &visits,
            &[outbound, inside, unrelated],
            Some(&h),
            at(10, 0),
        );
        assert_eq!(trips[0].segment_ids, vec!["out", "in"]);
        assert!((trips[0].distance_meters - 610_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_connecting_segment_counted_once() {
        // Two runs split by a gap longer than 36 h, no home known
        let visits = vec![
            visit("a", at(1, 10), 4, 48.85, 2.35, Some("FR")),
            visit("b", at(4, 10), 4, 45.76, 4.83, Some("FR")),
        ];
        let mut link = segment("a-b", at(1, 14), at(4, 10), 390_000.0);
        link.from_visit_id = Some("a".to_string());
        link.to_visit_id = Some("b".to_string());
        let mut onward = segment("b-x", at(4, 14), at(4, 16), 20_000.0);
        onward.from_visit_id = Some("b".to_string());

        let trips = TripDetector::new(TripConfig::default()).detect(
            "u",
            &visits,
            &[link, onward],
            None,
            at(10, 0),
        );
        assert_eq!(trips.len(), 2);
        assert!(trips[0].segment_ids.is_empty());
        assert_eq!(trips[0].distance_meters, 0.0);
        assert_eq!(trips[1].segment_ids, vec!["a-b", "b-x"]);

        let total: f64 = trips.iter().map(|t| t.distance_meters).sum();
        assert!((total - 410_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_trip_ids_deterministic() {
        let visits = three_day_trip();
        let h = home();
        let detector = TripDetector::new(TripConfig::default());
        let a = detector.detect("u", &visits, &[], Some(&h), at(10, 0));
        let b = detector.detect("u", &visits, &[], Some(&h), at(10, 0));
        assert_eq!(a[0].id, b[0].id);
    }

    #[test]
    fn test_country_tie_goes_to_first_seen() {
        let a = visit("a", at(1, 0), 1, 0.0, 0.0, Some("ES"));
        let b = visit("b", at(1, 2), 1, 0.0, 0.0, Some("PT"));
        let c = visit("c", at(1, 4), 1, 0.0, 0.0, None);
        let (primary, all) = country_summary(&[&a, &b, &c]);
        assert_eq!(primary.as_deref(), Some("ES"));
        assert_eq!(all, vec!["ES", "PT"]);
        assert_eq!(country_summary(&[&c]), (None, Vec::new()));
    }
}
