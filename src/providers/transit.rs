//! Transit data provider.
//!
//! `TransitProvider` is the seam between the refresh orchestration and the
//! outside world; `TransitClient` is the production implementation against
//! a GTFS-flavored REST API. Raw wire records are tolerant of the feed's
//! quirks (numeric ids, mixed timestamp formats) and convert per-record:
//! one malformed entry is skipped and counted, never fatal for the batch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::warn;
use uuid::Uuid;

use crate::config::TrackerConfig;
use crate::models::{Coordinates, Route, RouteType, Station, StopTime, Trip, Vehicle};
use crate::sync::{ApiRequestLog, ApiRequestSender};

/// Maximum concurrent requests to the upstream API.
const MAX_CONCURRENT_REQUESTS: usize = 10;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },
}

impl ProviderError {
    /// Whether a retry on the next refresh cycle could plausibly succeed.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Parse(_) => false,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

/// Source of transit data. The orchestrator is generic over this, so tests
/// substitute a scripted implementation.
pub trait TransitProvider {
    fn fetch_vehicles(&self) -> impl Future<Output = Result<Vec<Vehicle>, ProviderError>> + Send;
    fn fetch_stations(&self) -> impl Future<Output = Result<Vec<Station>, ProviderError>> + Send;
    fn fetch_routes(&self) -> impl Future<Output = Result<Vec<Route>, ProviderError>> + Send;
    fn fetch_trips(&self) -> impl Future<Output = Result<Vec<Trip>, ProviderError>> + Send;
    fn fetch_stop_times(&self) -> impl Future<Output = Result<Vec<StopTime>, ProviderError>> + Send;
}

/// HTTP client for the transit API, with a concurrency cap and per-request
/// diagnostics broadcast.
pub struct TransitClient {
    client: Client,
    base_url: String,
    agency_id: String,
    api_key: String,
    rate_limiter: Arc<Semaphore>,
    diagnostics_tx: ApiRequestSender,
}

impl TransitClient {
    pub fn new(
        config: &TrackerConfig,
        diagnostics_tx: ApiRequestSender,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            agency_id: config.agency_id.clone(),
            api_key: config.api_key.clone(),
            rate_limiter: Arc::new(Semaphore::new(MAX_CONCURRENT_REQUESTS)),
            diagnostics_tx,
        })
    }

    /// Send a diagnostics log entry. Send errors only mean no one is
    /// listening.
    fn log_request(&self, log: ApiRequestLog) {
        let _ = self.diagnostics_tx.send(log);
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ProviderError> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| ProviderError::Network(format!("Rate limiter closed: {}", e)))?;

        let start = Instant::now();
        let request_id = Uuid::new_v4().to_string();

        let mut params = HashMap::new();
        params.insert("agency_id".to_string(), self.agency_id.clone());

        let url = format!(
            "{}/{}?agency_id={}",
            self.base_url,
            endpoint,
            urlencoding::encode(&self.agency_id)
        );

        let response = match self
            .client
            .get(&url)
            .header("X-API-KEY", &self.api_key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                self.log_request(ApiRequestLog {
                    id: request_id,
                    timestamp: Utc::now().to_rfc3339(),
                    method: "GET".to_string(),
                    endpoint: endpoint.to_string(),
                    params: Some(params),
                    duration_ms: start.elapsed().as_millis() as u64,
                    status: 0,
                    response_size: None,
                    error: Some(e.to_string()),
                });
                return Err(ProviderError::Network(e.to_string()));
            }
        };

        let status = response.status().as_u16();

        if !response.status().is_success() {
            self.log_request(ApiRequestLog {
                id: request_id,
                timestamp: Utc::now().to_rfc3339(),
                method: "GET".to_string(),
                endpoint: endpoint.to_string(),
                params: Some(params),
                duration_ms: start.elapsed().as_millis() as u64,
                status,
                response_size: None,
                error: Some(format!("HTTP error: {}", status)),
            });
            return Err(ProviderError::Api {
                status,
                message: format!("HTTP error: {}", status),
            });
        }

        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                self.log_request(ApiRequestLog {
                    id: request_id,
                    timestamp: Utc::now().to_rfc3339(),
                    method: "GET".to_string(),
                    endpoint: endpoint.to_string(),
                    params: Some(params),
                    duration_ms: start.elapsed().as_millis() as u64,
                    status,
                    response_size: None,
                    error: Some(format!("Failed to read body: {}", e)),
                });
                return Err(ProviderError::Network(e.to_string()));
            }
        };

        let response_size = body.len();
        let result: Result<T, _> = serde_json::from_str(&body);

        match &result {
            Ok(_) => {
                self.log_request(ApiRequestLog {
                    id: request_id,
                    timestamp: Utc::now().to_rfc3339(),
                    method: "GET".to_string(),
                    endpoint: endpoint.to_string(),
                    params: Some(params),
                    duration_ms: start.elapsed().as_millis() as u64,
                    status,
                    response_size: Some(response_size),
                    error: None,
                });
            }
            Err(e) => {
                warn!(
                    endpoint = %endpoint,
                    error = %e,
                    body = truncate_on_char_boundary(&body, 500),
                    "Failed to parse API response"
                );
                self.log_request(ApiRequestLog {
                    id: request_id,
                    timestamp: Utc::now().to_rfc3339(),
                    method: "GET".to_string(),
                    endpoint: endpoint.to_string(),
                    params: Some(params),
                    duration_ms: start.elapsed().as_millis() as u64,
                    status,
                    response_size: Some(response_size),
                    error: Some(format!("Parse error: {}", e)),
                });
            }
        }

        result.map_err(|e| ProviderError::Parse(e.to_string()))
    }
}

impl TransitProvider for TransitClient {
    async fn fetch_vehicles(&self) -> Result<Vec<Vehicle>, ProviderError> {
        let raw: Vec<RawVehicle> = self.get_json("vehicles").await?;
        Ok(convert_records(raw, "vehicles", convert_vehicle))
    }

    async fn fetch_stations(&self) -> Result<Vec<Station>, ProviderError> {
        let raw: Vec<RawStop> = self.get_json("stops").await?;
        Ok(convert_records(raw, "stops", convert_stop))
    }

    async fn fetch_routes(&self) -> Result<Vec<Route>, ProviderError> {
        let raw: Vec<RawRoute> = self.get_json("routes").await?;
        Ok(convert_records(raw, "routes", convert_route))
    }

    async fn fetch_trips(&self) -> Result<Vec<Trip>, ProviderError> {
        let raw: Vec<RawTrip> = self.get_json("trips").await?;
        Ok(convert_records(raw, "trips", convert_trip))
    }

    async fn fetch_stop_times(&self) -> Result<Vec<StopTime>, ProviderError> {
        let raw: Vec<RawStopTime> = self.get_json("stop_times").await?;
        Ok(convert_records(raw, "stop_times", convert_stop_time))
    }
}

/// Feed timestamps arrive either as epoch seconds or an ISO 8601 string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Epoch(i64),
    Iso(String),
}

impl RawTimestamp {
    fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Epoch(secs) => Utc.timestamp_opt(*secs, 0).single(),
            Self::Iso(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

/// GTFS stop times arrive either as seconds since midnight or "HH:MM:SS"
/// (hours may exceed 24 for post-midnight service).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawGtfsTime {
    Seconds(i32),
    Text(String),
}

impl RawGtfsTime {
    fn to_seconds(&self) -> Option<i32> {
        match self {
            Self::Seconds(secs) => Some(*secs),
            Self::Text(text) => {
                let mut parts = text.split(':');
                let hours: i32 = parts.next()?.parse().ok()?;
                let minutes: i32 = parts.next()?.parse().ok()?;
                let seconds: i32 = parts.next()?.parse().ok()?;
                if parts.next().is_some() || !(0..60).contains(&minutes) || !(0..60).contains(&seconds) {
                    return None;
                }
                Some(hours * 3600 + minutes * 60 + seconds)
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawVehicle {
    pub id: i64,
    pub label: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timestamp: Option<RawTimestamp>,
    pub speed: Option<f64>,
    pub bearing: Option<f64>,
    pub route_id: Option<i64>,
    pub trip_id: Option<String>,
    pub wheelchair_accessible: Option<String>,
    pub bike_accessible: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawStop {
    pub stop_id: i64,
    pub stop_name: Option<String>,
    pub stop_lat: Option<f64>,
    pub stop_lon: Option<f64>,
    #[serde(default)]
    pub route_ids: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRoute {
    pub route_id: i64,
    pub agency_id: Option<i64>,
    pub route_short_name: Option<String>,
    pub route_long_name: Option<String>,
    pub route_type: Option<i32>,
    pub route_color: Option<String>,
    pub route_text_color: Option<String>,
    pub route_desc: Option<String>,
    pub route_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTrip {
    pub trip_id: String,
    pub route_id: i64,
    pub trip_headsign: Option<String>,
    pub direction_id: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawStopTime {
    pub trip_id: String,
    pub stop_id: i64,
    pub arrival_time: Option<RawGtfsTime>,
    pub departure_time: Option<RawGtfsTime>,
    pub stop_sequence: u32,
    pub pickup_type: Option<i32>,
    pub drop_off_type: Option<i32>,
}

/// Convert a batch tolerantly: malformed records are dropped with a single
/// summary warning rather than failing the fetch.
fn convert_records<R, T>(
    raw: Vec<R>,
    kind: &str,
    convert: impl Fn(R) -> Option<T>,
) -> Vec<T> {
    let total = raw.len();
    let converted: Vec<T> = raw.into_iter().filter_map(convert).collect();
    let dropped = total - converted.len();
    if dropped > 0 {
        warn!(kind = %kind, dropped, total, "Dropped malformed records");
    }
    converted
}

fn convert_vehicle(raw: RawVehicle) -> Option<Vehicle> {
    let latitude = raw.latitude?;
    let longitude = raw.longitude?;
    let route_id = raw.route_id?;
    let timestamp = raw.timestamp.as_ref().and_then(RawTimestamp::to_utc)?;
    Some(Vehicle {
        id: raw.id.to_string(),
        route_id: route_id.to_string(),
        trip_id: raw.trip_id,
        label: raw.label.unwrap_or_else(|| raw.id.to_string()),
        position: Coordinates::new(latitude, longitude),
        timestamp,
        speed: raw.speed,
        bearing: raw.bearing,
        is_wheelchair_accessible: raw
            .wheelchair_accessible
            .as_deref()
            .map(|v| v == "WHEELCHAIR_ACCESSIBLE")
            .unwrap_or(false),
        is_bike_accessible: raw
            .bike_accessible
            .as_deref()
            .map(|v| v == "BIKE_ACCESSIBLE")
            .unwrap_or(false),
    })
}

fn convert_stop(raw: RawStop) -> Option<Station> {
    let latitude = raw.stop_lat?;
    let longitude = raw.stop_lon?;
    Some(Station {
        id: raw.stop_id.to_string(),
        name: raw.stop_name.unwrap_or_else(|| raw.stop_id.to_string()),
        coordinates: Coordinates::new(latitude, longitude),
        is_favorite: false,
        route_ids: raw
            .route_ids
            .map(|ids| ids.into_iter().map(|id| id.to_string()).collect()),
    })
}

fn convert_route(raw: RawRoute) -> Option<Route> {
    Some(Route {
        id: raw.route_id.to_string(),
        agency_id: raw.agency_id.map(|id| id.to_string()).unwrap_or_default(),
        route_name: raw
            .route_short_name
            .unwrap_or_else(|| raw.route_id.to_string()),
        route_desc: raw.route_long_name.or(raw.route_desc).unwrap_or_default(),
        route_type: RouteType::from_gtfs_code(raw.route_type.unwrap_or(3)),
        color: raw.route_color,
        text_color: raw.route_text_color,
        url: raw.route_url,
    })
}

fn convert_trip(raw: RawTrip) -> Option<Trip> {
    Some(Trip {
        id: raw.trip_id,
        route_id: raw.route_id.to_string(),
        headsign: raw.trip_headsign,
        direction_id: raw.direction_id,
    })
}

/// Cut a string to at most `max` bytes without splitting a multi-byte
/// character.
fn truncate_on_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn convert_stop_time(raw: RawStopTime) -> Option<StopTime> {
    Some(StopTime {
        trip_id: raw.trip_id,
        stop_id: raw.stop_id.to_string(),
        arrival_time: raw.arrival_time.as_ref().and_then(RawGtfsTime::to_seconds),
        departure_time: raw
            .departure_time
            .as_ref()
            .and_then(RawGtfsTime::to_seconds),
        sequence: raw.stop_sequence,
        pickup: raw.pickup_type.unwrap_or(0) == 0,
        drop_off: raw.drop_off_type.unwrap_or(0) == 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vehicle_conversion() {
        let raw: Vec<RawVehicle> = serde_json::from_str(
            r#"[
                {"id": 1201, "label": "CJ-N-123", "latitude": 46.7712, "longitude": 23.6236,
                 "timestamp": "2026-08-29T10:15:00Z", "speed": 8.3, "route_id": 24,
                 "trip_id": "24_0_1", "wheelchair_accessible": "WHEELCHAIR_ACCESSIBLE",
                 "bike_accessible": "BIKE_INACCESSIBLE"},
                {"id": 1202, "latitude": null, "longitude": 23.6, "route_id": 24,
                 "timestamp": 1787004900}
            ]"#,
        )
        .unwrap();
        let vehicles = convert_records(raw, "vehicles", convert_vehicle);

        // The record without a latitude is dropped
        assert_eq!(vehicles.len(), 1);
        let v = &vehicles[0];
        assert_eq!(v.id, "1201");
        assert_eq!(v.route_id, "24");
        assert_eq!(v.trip_id.as_deref(), Some("24_0_1"));
        assert!(v.is_wheelchair_accessible);
        assert!(!v.is_bike_accessible);
    }

    #[test]
    fn test_epoch_timestamp_accepted() {
        let raw = RawVehicle {
            id: 7,
            label: None,
            latitude: Some(46.77),
            longitude: Some(23.62),
            timestamp: Some(RawTimestamp::Epoch(1_787_004_900)),
            speed: None,
            bearing: None,
            route_id: Some(24),
            trip_id: None,
            wheelchair_accessible: None,
            bike_accessible: None,
        };
        let v = convert_vehicle(raw).unwrap();
        assert_eq!(v.label, "7");
        assert_eq!(v.timestamp.timestamp(), 1_787_004_900);
    }

    #[test]
    fn test_gtfs_time_parsing() {
        assert_eq!(RawGtfsTime::Seconds(28800).to_seconds(), Some(28800));
        assert_eq!(
            RawGtfsTime::Text("08:00:00".into()).to_seconds(),
            Some(28800)
        );
        // Post-midnight service keeps running past hour 24
        assert_eq!(
            RawGtfsTime::Text("25:10:30".into()).to_seconds(),
            Some(25 * 3600 + 10 * 60 + 30)
        );
        assert_eq!(RawGtfsTime::Text("08:00".into()).to_seconds(), None);
        assert_eq!(RawGtfsTime::Text("08:61:00".into()).to_seconds(), None);
    }

    #[test]
    fn test_truncate_never_splits_multibyte_chars() {
        assert_eq!(truncate_on_char_boundary("short", 500), "short");
        // "ț" is two bytes, occupying indices 3..5; a cut at 4 lands inside it
        let name = "Piața Unirii";
        assert_eq!(truncate_on_char_boundary(name, 5), "Pia\u{21b}");
        assert_eq!(truncate_on_char_boundary(name, 4), "Pia");
        assert_eq!(truncate_on_char_boundary(name, name.len()), name);
    }

    #[test]
    fn test_route_conversion_defaults() {
        let raw = RawRoute {
            route_id: 24,
            agency_id: Some(2),
            route_short_name: None,
            route_long_name: Some("Piața Unirii - Gara CFR".into()),
            route_type: Some(11),
            route_color: Some("#E91E63".into()),
            route_text_color: None,
            route_desc: None,
            route_url: None,
        };
        let route = convert_route(raw).unwrap();
        assert_eq!(route.route_name, "24");
        assert_eq!(route.route_type, RouteType::Trolleybus);
        assert_eq!(route.route_desc, "Piața Unirii - Gara CFR");
    }

    #[test]
    fn test_stop_time_conversion() {
        let raw = RawStopTime {
            trip_id: "24_0_1".into(),
            stop_id: 101,
            arrival_time: Some(RawGtfsTime::Text("08:05:00".into())),
            departure_time: None,
            stop_sequence: 3,
            pickup_type: Some(0),
            drop_off_type: Some(1),
        };
        let st = convert_stop_time(raw).unwrap();
        assert_eq!(st.stop_id, "101");
        assert_eq!(st.arrival_time, Some(8 * 3600 + 300));
        assert!(st.departure_time.is_none());
        assert!(st.pickup);
        assert!(!st.drop_off);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::Network("timeout".into()).retryable());
        assert!(!ProviderError::Parse("bad json".into()).retryable());
        assert!(ProviderError::Api {
            status: 503,
            message: "unavailable".into()
        }
        .retryable());
        assert!(!ProviderError::Api {
            status: 404,
            message: "not found".into()
        }
        .retryable());
    }
}
