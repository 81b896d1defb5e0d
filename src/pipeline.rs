//! # Travel Pipeline
//!
//! Runs the detectors in order for one user:
//!
//! ```text
//! samples -> visits -> segments between consecutive visits -> home -> trips
//! ```
//!
//! Each run recomputes everything from the samples it is given. Detectors are built
//! fresh per run, so a pipeline can be shared across threads and re-run after a crash
//! with the same ids coming out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::info;

use crate::error::ConfigError;
use crate::geocoding::{CacheConfig, CachingGeocoder, GeocodingCache, ReverseGeocoder};
use crate::home::{HomeConfig, HomeLocation, HomeLocationDetector};
use crate::segments::{RouteSegmentBuilder, SegmentConfig};
use crate::transport::TransportConfig;
use crate::trips::{TripConfig, TripDetector};
use crate::visits::{PlaceVisitDetector, VisitConfig};
use crate::{sorted_valid_samples, LocationSample, PlaceVisit, RouteSegment, Trip};

/// Configuration for every stage of the pipeline.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PipelineConfig {
    pub visits: VisitConfig,
    pub transport: TransportConfig,
    pub segments: SegmentConfig,
    pub home: HomeConfig,
    pub trips: TripConfig,
    pub cache: CacheConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.visits.validate()?;
        self.transport.validate()?;
        self.segments.validate()?;
        self.home.validate()?;
        self.trips.validate()?;
        self.cache.validate()
    }

    /// Parse and validate a JSON config. Missing fields keep their defaults.
    ///
    /// ```
    /// use travel_history::PipelineConfig;
    ///
    /// let config = PipelineConfig::from_json_str(r#"{"visits": {"min_duration_secs": 300}}"#).unwrap();
    /// assert_eq!(config.visits.min_duration_secs, 300);
    /// assert_eq!(config.visits.spatial_threshold_meters, 100.0);
    /// ```
    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Everything derived for one user in one run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TravelHistory {
    pub user_id: String,
    pub visits: Vec<PlaceVisit>,
    pub segments: Vec<RouteSegment>,
    pub home: Option<HomeLocation>,
    pub trips: Vec<Trip>,
}

/// Batch pipeline from raw samples to a [`TravelHistory`].
pub struct TravelPipeline {
    config: PipelineConfig,
    geocoder: Option<Arc<dyn ReverseGeocoder>>,
}

impl TravelPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, geocoder: None })
    }

    /// Enrich visits through `geocoder`, behind a fresh spatial cache.
    pub fn with_geocoder<G: ReverseGeocoder + 'static>(self, geocoder: G) -> Self {
        let cached =
            CachingGeocoder::new(geocoder, GeocodingCache::new(), self.config.cache.clone());
        self.with_shared_geocoder(Arc::new(cached))
    }

    /// Use `geocoder` as given. Callers that keep their own cache across runs pass it here.
    pub fn with_shared_geocoder(mut self, geocoder: Arc<dyn ReverseGeocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Build the travel history of `user_id`. Samples of other users are ignored.
    pub fn process_user(
        &self,
        user_id: &str,
        samples: &[LocationSample],
        now: DateTime<Utc>,
    ) -> TravelHistory {
        let mine: Vec<LocationSample> = samples
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        // Validated and time-ordered once; every later stage sees clean input.
        let own: Vec<LocationSample> = sorted_valid_samples(&mine).into_iter().cloned().collect();
        let ordered: Vec<&LocationSample> = own.iter().collect();

        let mut detector = PlaceVisitDetector::new(self.config.visits.clone());
        if let Some(geocoder) = self.geocoder.as_deref() {
            detector = detector.with_geocoder(geocoder);
        }
        let visits = detector.detect(user_id, &own);

        let builder =
            RouteSegmentBuilder::new(self.config.segments.clone(), self.config.transport.clone());
        let segments: Vec<RouteSegment> = visits
            .windows(2)
            .filter_map(|pair| {
                builder.build_between_ordered(user_id, &ordered, &pair[0], &pair[1])
            })
            .collect();

        let home = HomeLocationDetector::new(self.config.home.clone()).detect(&visits);
        let trips = TripDetector::new(self.config.trips.clone()).detect(
            user_id,
            &visits,
            &segments,
            home.as_ref(),
            now,
        );

        info!(
            "[TravelPipeline] {}: {} samples -> {} visits, {} segments, {} trips, home {}",
            user_id,
            own.len(),
            visits.len(),
            segments.len(),
            trips.len(),
            if home.is_some() { "found" } else { "unknown" }
        );

        TravelHistory {
            user_id: user_id.to_string(),
            visits,
            segments,
            home,
            trips,
        }
    }

    /// Process many users. Results are ordered by user id.
    pub fn process_batch(
        &self,
        samples_by_user: &HashMap<String, Vec<LocationSample>>,
        now: DateTime<Utc>,
    ) -> Vec<TravelHistory> {
        let start = Instant::now();

        let mut users: Vec<(&String, &Vec<LocationSample>)> = samples_by_user.iter().collect();
        users.sort_by(|a, b| a.0.cmp(b.0));

        #[cfg(feature = "parallel")]
        let histories: Vec<TravelHistory> = {
            use rayon::prelude::*;
            users
                .par_iter()
                .map(|(user_id, samples)| self.process_user(user_id, samples, now))
                .collect()
        };

        #[cfg(not(feature = "parallel"))]
        let histories: Vec<TravelHistory> = users
            .iter()
            .map(|(user_id, samples)| self.process_user(user_id, samples, now))
            .collect();

        info!(
            "[TravelPipeline] Batch of {} users in {:?}",
            histories.len(),
            start.elapsed()
        );

        histories
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::{haversine_distance, METERS_PER_DEGREE_LAT};
    use crate::{GeocodedLocation, TransportMode};
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const A_LAT: f64 = 47.3769;
    const A_LNG: f64 = 8.5417;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, 8, 0, 0).unwrap()
    }

    fn sample(user: &str, i: usize, time: DateTime<Utc>, lat: f64, lng: f64) -> LocationSample {
        LocationSample::new(format!("{user}-{i}"), user, time, lat, lng)
    }

    /// Samples every minute at one spot, `minutes` long, starting at `start`.
    fn dwell(
        user: &str,
        first_index: usize,
        start: DateTime<Utc>,
        minutes: i64,
        lat: f64,
        lng: f64,
    ) -> Vec<LocationSample> {
        (0..=minutes)
            .map(|m| sample(user, first_index + m as usize, start + Duration::minutes(m), lat, lng))
            .collect()
    }

    /// 20 min at A, ~40 km north by car at 30 s fixes (stop-and-go 45/75 km/h), 30 min at B.
    fn commute(user: &str) -> Vec<LocationSample> {
        let mut samples = dwell(user, 0, t0(), 20, A_LAT, A_LNG);
        let depart = t0() + Duration::minutes(20);

        let mut lat = A_LAT;
        for k in 1..=80 {
            let meters = if k % 2 == 1 { 375.0 } else { 625.0 };
            lat += meters / METERS_PER_DEGREE_LAT;
            samples.push(sample(user, 100 + k, depart + Duration::seconds(30 * k as i64), lat, A_LNG));
        }

        let arrive = depart + Duration::minutes(40);
        samples.extend(dwell(user, 200, arrive + Duration::minutes(1), 29, lat, A_LNG));
        samples
    }

    fn pipeline() -> TravelPipeline {
        TravelPipeline::new(PipelineConfig::default()).unwrap()
    }

    #[test]
    fn test_commute_scenario() {
        let history = pipeline().process_user("u", &commute("u"), t0() + Duration::hours(2));

        assert_eq!(history.visits.len(), 2);
        let a = &history.visits[0];
        let b = &history.visits[1];
        assert!(a.duration_secs() >= 600);
        assert!(haversine_distance(&a.center(), &crate::GpsPoint::new(A_LAT, A_LNG)) < 1.0);
        assert!(b.duration_secs() >= 30 * 60);

        assert_eq!(history.segments.len(), 1);
        let segment = &history.segments[0];
        assert_eq!(segment.transport_mode, TransportMode::Car);
        assert!((segment.distance_meters - 40_000.0).abs() < 2_000.0);
        assert_eq!(segment.from_visit_id.as_deref(), Some(a.id.as_str()));
        assert_eq!(segment.to_visit_id.as_deref(), Some(b.id.as_str()));
        assert!(segment.path.len() < segment.sample_count as usize);

        // Two visits are not enough history for a home
        assert!(history.home.is_none());
        assert_eq!(history.trips.len(), 1);
        assert!(history.trips[0].is_ongoing);
    }

    #[test]
    fn test_unordered_input_matches_ordered() {
        let samples = commute("u");
        let mut shuffled: Vec<LocationSample> = samples.iter().rev().cloned().collect();
        shuffled.push(sample("u", 999, t0() + Duration::minutes(20), f64::NAN, A_LNG));

        let now = t0() + Duration::hours(2);
        let expected = pipeline().process_user("u", &samples, now);
        let actual = pipeline().process_user("u", &shuffled, now);
        assert_eq!(actual.visits, expected.visits);
        assert_eq!(actual.segments, expected.segments);
        assert_eq!(actual.trips, expected.trips);
    }

    #[test]
    fn test_overnight_stay_is_one_visit() {
        let evening = Utc.with_ymd_and_hms(2024, 4, 2, 20, 0, 0).unwrap();
        let morning = evening + Duration::hours(12);

        let mut samples = dwell("u", 0, evening, 120, A_LAT, A_LNG);
        // ~50 m away after ten silent hours
        samples.extend(dwell("u", 500, morning, 60, A_LAT + 0.00045, A_LNG));

        let history = pipeline().process_user("u", &samples, morning + Duration::hours(2));
        assert_eq!(history.visits.len(), 1);
        assert_eq!(history.visits[0].start_time, evening);
        assert_eq!(history.visits[0].end_time, morning + Duration::hours(1));
        assert!(history.segments.is_empty());
    }

    #[test]
    fn test_segments_never_shorter_than_straight_line() {
        // Zig-zag between two stops
        let mut samples = dwell("u", 0, t0(), 15, A_LAT, A_LNG);
        let depart = t0() + Duration::minutes(15);
        for k in 1..=30 {
            let lng = A_LNG + if k % 2 == 0 { 0.004 } else { -0.004 };
            let lat = A_LAT + k as f64 * 0.003;
            samples.push(sample("u", 100 + k, depart + Duration::seconds(40 * k as i64), lat, lng));
        }
        let stop = depart + Duration::seconds(40 * 31);
        samples.extend(dwell("u", 200, stop, 15, A_LAT + 0.093, A_LNG));

        let history = pipeline().process_user("u", &samples, stop + Duration::hours(1));
        assert!(!history.segments.is_empty());
        for segment in &history.segments {
            let first = segment.path.first().unwrap();
            let last = segment.path.last().unwrap();
            assert!(segment.distance_meters >= haversine_distance(first, last));
        }
    }

    #[test]
    fn test_rerun_is_identical() {
        let samples = commute("u");
        let now = t0() + Duration::hours(2);

        let first = pipeline().process_user("u", &samples, now);
        let second = pipeline().process_user("u", &samples, now);
        assert_eq!(first, second);

        // Input order does not matter
        let mut shuffled = samples.clone();
        shuffled.reverse();
        shuffled.swap(3, 70);
        assert_eq!(pipeline().process_user("u", &shuffled, now), first);
    }

    #[test]
    fn test_users_are_isolated() {
        let mut mixed = commute("alice");
        mixed.extend(dwell("bob", 0, t0(), 30, 40.4168, -3.7038));

        let alice = pipeline().process_user("alice", &mixed, t0() + Duration::hours(2));
        assert_eq!(alice.visits.len(), 2);
        assert!(alice.visits.iter().all(|v| v.user_id == "alice"));
        assert!(alice.visits.iter().all(|v| v.latitude > 47.0));

        let bob = pipeline().process_user("bob", &mixed, t0() + Duration::hours(2));
        assert_eq!(bob.visits.len(), 1);
        assert!(bob.segments.is_empty());
    }

    #[test]
    fn test_batch_sorted_by_user() {
        let mut by_user = HashMap::new();
        by_user.insert("zoe".to_string(), dwell("zoe", 0, t0(), 30, 40.4168, -3.7038));
        by_user.insert("adam".to_string(), commute("adam"));
        by_user.insert("mia".to_string(), Vec::new());

        let histories = pipeline().process_batch(&by_user, t0() + Duration::hours(2));
        let users: Vec<&str> = histories.iter().map(|h| h.user_id.as_str()).collect();
        assert_eq!(users, vec!["adam", "mia", "zoe"]);
        assert_eq!(histories[0].visits.len(), 2);
        assert!(histories[1].visits.is_empty());
        assert_eq!(histories[2].visits.len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PipelineConfig::default();
        config.visits.spatial_threshold_meters = 0.0;
        assert!(matches!(
            TravelPipeline::new(config),
            Err(ConfigError::NonPositive { .. })
        ));

        let mut config = PipelineConfig::default();
        config.cache.ttl_secs = 10_000_000_000_000;
        assert!(matches!(
            TravelPipeline::new(config),
            Err(ConfigError::TooLarge { .. })
        ));
    }

    struct CountingGeocoder {
        calls: AtomicUsize,
    }

    impl ReverseGeocoder for CountingGeocoder {
        fn reverse_geocode(&self, latitude: f64, longitude: f64) -> Option<GeocodedLocation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut location = GeocodedLocation::new(latitude, longitude);
            location.country_code = Some("CH".to_string());
            Some(location)
        }
    }

    #[test]
    fn test_geocoder_enriches_visits_and_trips() {
        let geocoder = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
        });
        let pipeline = pipeline().with_shared_geocoder(geocoder.clone());

        let history = pipeline.process_user("u", &commute("u"), t0() + Duration::hours(2));
        assert!(history.visits.iter().all(|v| v.country_code() == Some("CH")));
        assert_eq!(history.trips[0].primary_country.as_deref(), Some("CH"));
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cached_geocoder_reused_across_runs() {
        let inner = Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
        });
        let pipeline = pipeline().with_geocoder(inner.clone());

        pipeline.process_user("u", &commute("u"), t0() + Duration::hours(2));
        pipeline.process_user("u", &commute("u"), t0() + Duration::hours(2));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_config_from_json() {
        let config = PipelineConfig::from_json_str(
            r#"{"trips": {"max_gap_secs": 7200, "no_home_policy": "no_trips"}, "cache": {"ttl_secs": 60}}"#,
        )
        .unwrap();
        assert_eq!(config.trips.max_gap_secs, 7200);
        assert_eq!(config.trips.no_home_policy, crate::NoHomePolicy::NoTrips);
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.home.min_visit_count, 3);

        assert!(matches!(
            PipelineConfig::from_json_str(r#"{"transport": {"window_size": 1}}"#),
            Err(ConfigError::WindowTooSmall(1))
        ));
        assert!(matches!(
            PipelineConfig::from_json_str("not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
