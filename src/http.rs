//! Nominatim-compatible HTTP reverse geocoder.
//!
//! - Dispatch rate limiting (spaces out request starts; public Nominatim allows 1 req/s)
//! - Per-lookup timeout
//! - Retry with exponential backoff on 429 and transport errors
//!
//! The geocoder owns a small tokio runtime so it can serve the synchronous
//! [`ReverseGeocoder`] contract. Do not call it from inside another async runtime.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Mutex;

use crate::geocoding::ReverseGeocoder;
use crate::GeocodedLocation;

/// Connection settings for [`NominatimGeocoder`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct GeocoderConfig {
    /// Server root; `/reverse` is appended
    pub base_url: String,
    /// Nominatim rejects requests without an identifying user agent
    pub user_agent: String,
    /// Upper bound for one lookup including retries (seconds)
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Minimum spacing between request starts (milliseconds)
    pub dispatch_interval_ms: u64,
    /// Preferred result language, sent as `accept-language`
    pub language: Option<String>,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            user_agent: concat!("travel-history/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 10,
            max_retries: 3,
            dispatch_interval_ms: 1000,
            language: None,
        }
    }
}

/// Why a remote lookup produced nothing.
///
/// Only visible through [`NominatimGeocoder::lookup`]; the [`ReverseGeocoder`] impl
/// logs it and returns `None`.
#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("failed to start runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("HTTP {0}")]
    Status(StatusCode),

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("no result: {0}")]
    NotFound(String),

    #[error("gave up after {0} retries")]
    RetriesExhausted(u32),
}

/// Dispatch rate limiter - spaces out when requests START.
///
/// Each caller reserves the next free slot, `interval` after the previous one, and
/// sleeps outside the lock until it arrives.
struct DispatchRateLimiter {
    interval: Duration,
    next_dispatch: Mutex<Instant>,
    dispatched_count: AtomicU32,
    consecutive_429s: AtomicU32,
}

impl DispatchRateLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_dispatch: Mutex::new(Instant::now()),
            dispatched_count: AtomicU32::new(0),
            consecutive_429s: AtomicU32::new(0),
        }
    }

    async fn wait_for_dispatch_slot(&self) -> u32 {
        let (wait_duration, dispatch_num) = {
            let mut next = self.next_dispatch.lock().await;
            let now = Instant::now();
            let dispatch_at = if *next > now { *next } else { now };
            *next = dispatch_at + self.interval;

            let num = self.dispatched_count.fetch_add(1, Ordering::Relaxed) + 1;
            (dispatch_at.saturating_duration_since(now), num)
        };

        if wait_duration > Duration::from_millis(5) {
            debug!("[Dispatch #{}] Waiting {:?} for slot", dispatch_num, wait_duration);
            tokio::time::sleep(wait_duration).await;
        }

        dispatch_num
    }

    fn record_success(&self) {
        self.consecutive_429s.store(0, Ordering::Relaxed);
    }

    fn record_429(&self) -> Duration {
        let count = self.consecutive_429s.fetch_add(1, Ordering::Relaxed) + 1;
        // 1s, 2s, 4s, 8s max
        let backoff = Duration::from_millis(500 * (1 << count.min(4)));
        warn!(
            "[DispatchRateLimiter] Got 429! Consecutive: {}, backing off {:?}",
            count, backoff
        );
        backoff
    }
}

/// Body of a Nominatim `/reverse?format=jsonv2` response.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReverseResponse {
    display_name: Option<String>,
    name: Option<String>,
    address: Option<Address>,
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Address {
    house_number: Option<String>,
    road: Option<String>,
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    hamlet: Option<String>,
    municipality: Option<String>,
    state: Option<String>,
    region: Option<String>,
    postcode: Option<String>,
    country: Option<String>,
    country_code: Option<String>,
}

/// Decode a reverse response into a location at the queried coordinate.
fn parse_response(latitude: f64, longitude: f64, body: &[u8]) -> Result<GeocodedLocation, GeocodeError> {
    let data: ReverseResponse = serde_json::from_slice(body)?;
    if let Some(error) = data.error {
        return Err(GeocodeError::NotFound(error));
    }

    let address = data.address.unwrap_or_default();
    let non_empty = |value: Option<String>| value.filter(|s| !s.trim().is_empty());

    Ok(GeocodedLocation {
        latitude,
        longitude,
        formatted_address: non_empty(data.display_name),
        city: non_empty(
            address
                .city
                .or(address.town)
                .or(address.village)
                .or(address.hamlet)
                .or(address.municipality),
        ),
        region: non_empty(address.state.or(address.region)),
        country_code: non_empty(address.country_code).map(|c| c.to_uppercase()),
        country_name: non_empty(address.country),
        postal_code: non_empty(address.postcode),
        poi_name: non_empty(data.name),
        street: non_empty(address.road),
        street_number: non_empty(address.house_number),
    })
}

/// Reverse geocoder backed by a Nominatim-compatible server.
///
/// Wrap it in a [`CachingGeocoder`](crate::CachingGeocoder) (or hand it to
/// [`TravelPipeline::with_geocoder`](crate::TravelPipeline::with_geocoder)) so repeated
/// visits to the same place do not hit the server.
pub struct NominatimGeocoder {
    client: Client,
    config: GeocoderConfig,
    rate_limiter: DispatchRateLimiter,
    runtime: Runtime,
}

impl NominatimGeocoder {
    pub fn new(config: GeocoderConfig) -> Result<Self, GeocodeError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_idle_timeout(Duration::from_secs(60))
            .build()
            .map_err(GeocodeError::Client)?;

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("nominatim")
            .enable_all()
            .build()?;

        info!(
            "[NominatimGeocoder] Using {} (dispatch interval {}ms, timeout {}s)",
            config.base_url, config.dispatch_interval_ms, config.timeout_secs
        );

        Ok(Self {
            client,
            rate_limiter: DispatchRateLimiter::new(Duration::from_millis(config.dispatch_interval_ms)),
            config,
            runtime,
        })
    }

    pub fn config(&self) -> &GeocoderConfig {
        &self.config
    }

    /// Look up one coordinate, bounded by the configured timeout.
    pub async fn lookup(&self, latitude: f64, longitude: f64) -> Result<GeocodedLocation, GeocodeError> {
        let limit = Duration::from_secs(self.config.timeout_secs);
        tokio::time::timeout(limit, self.fetch(latitude, longitude))
            .await
            .map_err(|_| GeocodeError::Timeout(limit))?
    }

    async fn fetch(&self, latitude: f64, longitude: f64) -> Result<GeocodedLocation, GeocodeError> {
        let url = format!("{}/reverse", self.config.base_url.trim_end_matches('/'));
        let mut query = vec![
            ("format", "jsonv2".to_string()),
            ("lat", latitude.to_string()),
            ("lon", longitude.to_string()),
            ("addressdetails", "1".to_string()),
        ];
        if let Some(language) = &self.config.language {
            query.push(("accept-language", language.clone()));
        }

        let mut retries = 0;
        let req_start = Instant::now();

        loop {
            let dispatch_num = self.rate_limiter.wait_for_dispatch_slot().await;
            let response = self.client.get(&url).query(&query).send().await;

            match response {
                Ok(resp) => {
                    let status = resp.status();

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        retries += 1;
                        if retries > self.config.max_retries {
                            return Err(GeocodeError::RetriesExhausted(self.config.max_retries));
                        }
                        let wait = self.rate_limiter.record_429();
                        tokio::time::sleep(wait).await;
                        continue;
                    }

                    self.rate_limiter.record_success();

                    if !status.is_success() {
                        return Err(GeocodeError::Status(status));
                    }

                    let bytes = resp.bytes().await.map_err(GeocodeError::Request)?;
                    let location = parse_response(latitude, longitude, &bytes)?;

                    debug!(
                        "[NominatimGeocoder #{}] ({:.5}, {:.5}) -> {:?} in {:?}",
                        dispatch_num,
                        latitude,
                        longitude,
                        location.city,
                        req_start.elapsed()
                    );
                    return Ok(location);
                }
                Err(e) => {
                    retries += 1;
                    if retries > self.config.max_retries {
                        return Err(GeocodeError::Request(e));
                    }

                    let wait = Duration::from_millis(200 * (1 << retries.min(5)));
                    warn!(
                        "[NominatimGeocoder #{}] Error: {}, retry {} after {:?}",
                        dispatch_num, e, retries, wait
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

impl ReverseGeocoder for NominatimGeocoder {
    fn reverse_geocode(&self, latitude: f64, longitude: f64) -> Option<GeocodedLocation> {
        match self.runtime.block_on(self.lookup(latitude, longitude)) {
            Ok(location) => Some(location),
            Err(e) => {
                warn!(
                    "[NominatimGeocoder] ({:.5}, {:.5}) failed: {}",
                    latitude, longitude, e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BERLIN: &str = r#"{
        "place_id": 132477093,
        "lat": "52.5170365",
        "lon": "13.3888599",
        "category": "tourism",
        "name": "Brandenburger Tor",
        "display_name": "Brandenburger Tor, Pariser Platz, Mitte, Berlin, 10117, Deutschland",
        "address": {
            "tourism": "Brandenburger Tor",
            "house_number": "1",
            "road": "Pariser Platz",
            "suburb": "Mitte",
            "city": "Berlin",
            "state": "Berlin",
            "postcode": "10117",
            "country": "Deutschland",
            "country_code": "de"
        }
    }"#;

    #[tokio::test]
    async fn test_dispatch_rate_limiter() {
        let limiter = DispatchRateLimiter::new(Duration::from_millis(50));

        // First request should not wait
        let start = Instant::now();
        assert_eq!(limiter.wait_for_dispatch_slot().await, 1);
        assert!(start.elapsed() < Duration::from_millis(10));

        // Second request should wait ~50ms
        let start2 = Instant::now();
        assert_eq!(limiter.wait_for_dispatch_slot().await, 2);
        let elapsed = start2.elapsed();
        assert!(elapsed >= Duration::from_millis(40), "Expected ~50ms wait, got {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(150), "Expected ~50ms wait, got {:?}", elapsed);
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let limiter = DispatchRateLimiter::new(Duration::ZERO);
        assert_eq!(limiter.record_429(), Duration::from_secs(1));
        assert_eq!(limiter.record_429(), Duration::from_secs(2));
        limiter.record_success();
        assert_eq!(limiter.record_429(), Duration::from_secs(1));
    }

    #[test]
    fn test_parse_full_address() {
        let location = parse_response(52.5163, 13.3777, BERLIN.as_bytes()).unwrap();
        assert_eq!(location.latitude, 52.5163);
        assert_eq!(location.city.as_deref(), Some("Berlin"));
        assert_eq!(location.region.as_deref(), Some("Berlin"));
        assert_eq!(location.country_code.as_deref(), Some("DE"));
        assert_eq!(location.country_name.as_deref(), Some("Deutschland"));
        assert_eq!(location.postal_code.as_deref(), Some("10117"));
        assert_eq!(location.poi_name.as_deref(), Some("Brandenburger Tor"));
        assert_eq!(location.street.as_deref(), Some("Pariser Platz"));
        assert_eq!(location.street_number.as_deref(), Some("1"));
    }

    #[test]
    fn test_parse_village_fallback_and_blank_name() {
        let body = r#"{"name": "", "address": {"village": "Hallstatt", "country_code": "at"}}"#;
        let location = parse_response(47.56, 13.65, body.as_bytes()).unwrap();
        assert_eq!(location.city.as_deref(), Some("Hallstatt"));
        assert_eq!(location.country_code.as_deref(), Some("AT"));
        assert!(location.poi_name.is_none());
        assert!(location.formatted_address.is_none());
    }

    #[test]
    fn test_parse_errors() {
        let body = r#"{"error": "Unable to geocode"}"#;
        assert!(matches!(
            parse_response(0.0, -140.0, body.as_bytes()),
            Err(GeocodeError::NotFound(msg)) if msg == "Unable to geocode"
        ));
        assert!(matches!(
            parse_response(0.0, 0.0, b"<html>"),
            Err(GeocodeError::Decode(_))
        ));
    }

    #[test]
    fn test_unreachable_server_yields_none() {
        let geocoder = NominatimGeocoder::new(GeocoderConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout_secs: 2,
            max_retries: 0,
            dispatch_interval_ms: 0,
            ..Default::default()
        })
        .unwrap();
        assert!(geocoder.reverse_geocode(52.52, 13.405).is_none());
    }
}
