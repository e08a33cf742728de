//! Background refresh orchestration.
//!
//! Owns the in-memory data cache and the periodic refresh timers. Each data
//! kind (vehicles, stations, routes, schedule) refreshes under its own
//! in-flight guard; a tick that lands while the previous fetch for its kind
//! is still running is skipped, not queued. Failed fetches keep the
//! previous data and mark the snapshot as served from cache. Grouping runs
//! only over inputs written by a single cycle token; partial results from
//! an older cycle can never overwrite a newer one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::models::{
    Coordinates, Route, Station, StationVehicleGroup, StationWithRoutes, StopTime, Trip, Vehicle,
};
use crate::providers::{ProviderError, TransitProvider};
use crate::services::pipeline::{group_vehicles, PipelineOptions};
use crate::services::stations::{select_stations, SelectionCriteria};
use crate::services::transform::{transform_vehicles, TransformContext};

/// API request log entry for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ApiRequestLog {
    /// Unique request ID
    pub id: String,
    /// Timestamp when request was made
    pub timestamp: String,
    /// HTTP method (GET, POST)
    pub method: String,
    /// API endpoint called
    pub endpoint: String,
    /// Request parameters
    pub params: Option<HashMap<String, String>>,
    /// Duration of request in milliseconds
    pub duration_ms: u64,
    /// HTTP status code
    pub status: u16,
    /// Response size in bytes
    pub response_size: Option<usize>,
    /// Error message if request failed
    pub error: Option<String>,
}

/// Sender for API request diagnostics
pub type ApiRequestSender = broadcast::Sender<ApiRequestLog>;

/// Last refresh failure, kept for display alongside cached data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorDescriptor {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
    pub timestamp: String,
}

impl ErrorDescriptor {
    fn from_provider(kind: &str, error: &ProviderError) -> Self {
        Self {
            kind: kind.to_string(),
            message: error.to_string(),
            retryable: error.retryable(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// What a single refresh call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Fetched and the data changed.
    Updated,
    /// Fetched but identical to the cached data.
    Unchanged,
    /// A fetch for this kind was already in flight, or shutdown started.
    Skipped,
    /// The fetch failed; previous data is retained.
    Failed,
}

impl RefreshOutcome {
    fn fetched(self) -> bool {
        matches!(self, Self::Updated | Self::Unchanged)
    }

    fn combine(self, other: Self) -> Self {
        match (self, other) {
            (Self::Failed, _) | (_, Self::Failed) => Self::Failed,
            (Self::Updated, _) | (_, Self::Updated) => Self::Updated,
            (Self::Unchanged, _) | (_, Self::Unchanged) => Self::Unchanged,
            _ => Self::Skipped,
        }
    }
}

/// One dataset in the cache. The version only advances when the content
/// actually changes, so regrouping can be gated on it.
#[derive(Debug, Clone)]
struct CachedData<T> {
    data: Vec<T>,
    fetched_at: DateTime<Utc>,
    version: u64,
    cycle: u64,
}

#[derive(Default)]
struct DataCache {
    vehicles: Option<CachedData<Vehicle>>,
    stations: Option<CachedData<Station>>,
    routes: Option<CachedData<Route>>,
    trips: Option<CachedData<Trip>>,
    stop_times: Option<CachedData<StopTime>>,
}

/// Replace a dataset unless a newer cycle already wrote it. Returns whether
/// the content changed.
fn store_dataset<T: PartialEq>(
    slot: &mut Option<CachedData<T>>,
    data: Vec<T>,
    cycle: u64,
    now: DateTime<Utc>,
) -> bool {
    if let Some(existing) = slot {
        if existing.cycle > cycle {
            debug!(
                stored_cycle = existing.cycle,
                stale_cycle = cycle,
                "Discarding fetch result from an older cycle"
            );
            return false;
        }
    }
    let changed = slot.as_ref().map(|c| c.data != data).unwrap_or(true);
    let version = match slot.as_ref() {
        Some(c) if changed => c.version + 1,
        Some(c) => c.version,
        None => 1,
    };
    *slot = Some(CachedData {
        data,
        fetched_at: now,
        version,
        cycle,
    });
    changed
}

/// Result of one grouping pass, published for consumers.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerSnapshot {
    pub closest_station: Option<StationWithRoutes>,
    pub second_station: Option<StationWithRoutes>,
    pub groups: Vec<StationVehicleGroup>,
    pub generated_at: DateTime<Utc>,
    /// True when the last refresh failed and this snapshot still reflects
    /// earlier data.
    pub used_cached_data: bool,
}

/// Versions of everything a grouping pass depends on. When it matches the
/// previous pass, regrouping is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    vehicles: u64,
    stations: u64,
    routes: u64,
    trips: u64,
    stop_times: u64,
    location: u64,
}

/// Drives periodic refreshes and publishes snapshots.
pub struct RefreshOrchestrator<P: TransitProvider> {
    provider: Arc<P>,
    config: TrackerConfig,
    cache: RwLock<DataCache>,
    snapshot: RwLock<Option<TrackerSnapshot>>,
    last_fingerprint: RwLock<Option<Fingerprint>>,
    user_location: RwLock<Option<Coordinates>>,
    location_revision: AtomicU64,
    /// Monotonic token handed to each fetch; an older token never
    /// overwrites data written by a newer one.
    cycle: AtomicU64,
    vehicles_in_flight: AtomicBool,
    stations_in_flight: AtomicBool,
    routes_in_flight: AtomicBool,
    schedule_in_flight: AtomicBool,
    shutdown: AtomicBool,
    using_cached_data: AtomicBool,
    last_attempt: RwLock<Option<DateTime<Utc>>>,
    last_success: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<ErrorDescriptor>>,
    timers: Mutex<HashMap<&'static str, JoinHandle<()>>>,
}

impl<P: TransitProvider + Send + Sync + 'static> RefreshOrchestrator<P> {
    pub fn new(provider: P, config: TrackerConfig) -> Self {
        Self {
            provider: Arc::new(provider),
            config,
            cache: RwLock::new(DataCache::default()),
            snapshot: RwLock::new(None),
            last_fingerprint: RwLock::new(None),
            user_location: RwLock::new(None),
            location_revision: AtomicU64::new(0),
            cycle: AtomicU64::new(0),
            vehicles_in_flight: AtomicBool::new(false),
            stations_in_flight: AtomicBool::new(false),
            routes_in_flight: AtomicBool::new(false),
            schedule_in_flight: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            using_cached_data: AtomicBool::new(false),
            last_attempt: RwLock::new(None),
            last_success: RwLock::new(None),
            last_error: RwLock::new(None),
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Latest published snapshot. `None` until the first successful
    /// grouping pass, distinct from a snapshot with no groups.
    pub async fn snapshot(&self) -> Option<TrackerSnapshot> {
        self.snapshot.read().await.clone()
    }

    pub async fn last_error(&self) -> Option<ErrorDescriptor> {
        self.last_error.read().await.clone()
    }

    /// When the most recent successful fetch completed, for staleness
    /// display.
    pub async fn last_success(&self) -> Option<DateTime<Utc>> {
        *self.last_success.read().await
    }

    /// When the most recent fetch was attempted, successful or not.
    pub async fn last_attempt(&self) -> Option<DateTime<Utc>> {
        *self.last_attempt.read().await
    }

    pub fn is_using_cached_data(&self) -> bool {
        self.using_cached_data.load(Ordering::SeqCst)
    }

    /// Update the user's position and regroup against the existing cache.
    pub async fn set_user_location(&self, location: Option<Coordinates>) {
        *self.user_location.write().await = location;
        self.location_revision.fetch_add(1, Ordering::SeqCst);
        self.rebuild_snapshot().await;
    }

    fn next_cycle(&self) -> u64 {
        self.cycle.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Missing credentials short-circuit every refresh to an empty result
    /// without touching the network.
    fn unconfigured(&self) -> bool {
        if self.config.has_credentials() {
            false
        } else {
            debug!("Agency id or API key not configured, skipping fetch");
            true
        }
    }

    /// Take the in-flight guard for one data kind. Returns false when a
    /// fetch for that kind is still running or shutdown has started.
    fn acquire(&self, flag: &AtomicBool) -> bool {
        !self.shutdown.load(Ordering::SeqCst)
            && flag
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    /// Refresh everything at once under a single cycle token, then regroup
    /// exactly once when all inputs have resolved. `force` regroups even
    /// when no input changed.
    pub async fn refresh_all(&self, force: bool) -> RefreshOutcome {
        if self.unconfigured() {
            return RefreshOutcome::Skipped;
        }
        let cycle = self.next_cycle();
        *self.last_attempt.write().await = Some(Utc::now());

        let (vehicles, stations, routes, schedule) = tokio::join!(
            self.run_vehicles(cycle),
            self.run_stations(cycle),
            self.run_routes(cycle),
            self.run_schedule(cycle),
        );

        let outcome = vehicles
            .combine(stations)
            .combine(routes)
            .combine(schedule);
        if vehicles.fetched() && stations.fetched() && routes.fetched() && schedule.fetched() {
            self.mark_success().await;
        }
        if force {
            *self.last_fingerprint.write().await = None;
        }
        self.rebuild_snapshot().await;
        outcome
    }

    /// Refresh real-time vehicle positions.
    pub async fn refresh_vehicles(&self) -> RefreshOutcome {
        if self.unconfigured() {
            return RefreshOutcome::Skipped;
        }
        let cycle = self.next_cycle();
        *self.last_attempt.write().await = Some(Utc::now());
        let outcome = self.run_vehicles(cycle).await;
        self.finish(outcome).await
    }

    pub async fn refresh_stations(&self) -> RefreshOutcome {
        if self.unconfigured() {
            return RefreshOutcome::Skipped;
        }
        let cycle = self.next_cycle();
        *self.last_attempt.write().await = Some(Utc::now());
        let outcome = self.run_stations(cycle).await;
        self.finish(outcome).await
    }

    pub async fn refresh_routes(&self) -> RefreshOutcome {
        if self.unconfigured() {
            return RefreshOutcome::Skipped;
        }
        let cycle = self.next_cycle();
        *self.last_attempt.write().await = Some(Utc::now());
        let outcome = self.run_routes(cycle).await;
        self.finish(outcome).await
    }

    /// Refresh the schedule: trips and stop-times together.
    pub async fn refresh_schedule(&self) -> RefreshOutcome {
        if self.unconfigured() {
            return RefreshOutcome::Skipped;
        }
        let cycle = self.next_cycle();
        *self.last_attempt.write().await = Some(Utc::now());
        let outcome = self.run_schedule(cycle).await;
        self.finish(outcome).await
    }

    async fn finish(&self, outcome: RefreshOutcome) -> RefreshOutcome {
        if outcome.fetched() {
            self.mark_success().await;
            self.rebuild_snapshot().await;
        }
        outcome
    }

    async fn run_vehicles(&self, cycle: u64) -> RefreshOutcome {
        if !self.acquire(&self.vehicles_in_flight) {
            debug!("Vehicle refresh already in flight, skipping tick");
            return RefreshOutcome::Skipped;
        }
        let result = self.provider.fetch_vehicles().await;
        self.vehicles_in_flight.store(false, Ordering::SeqCst);
        if self.shutdown.load(Ordering::SeqCst) {
            return RefreshOutcome::Skipped;
        }

        match result {
            Ok(vehicles) => {
                info!(count = vehicles.len(), cycle, "Fetched vehicles");
                let mut cache = self.cache.write().await;
                if store_dataset(&mut cache.vehicles, vehicles, cycle, Utc::now()) {
                    RefreshOutcome::Updated
                } else {
                    RefreshOutcome::Unchanged
                }
            }
            Err(e) => {
                self.mark_failure("vehicles", &e).await;
                RefreshOutcome::Failed
            }
        }
    }

    async fn run_stations(&self, cycle: u64) -> RefreshOutcome {
        if !self.acquire(&self.stations_in_flight) {
            debug!("Station refresh already in flight, skipping tick");
            return RefreshOutcome::Skipped;
        }
        let result = self.provider.fetch_stations().await;
        self.stations_in_flight.store(false, Ordering::SeqCst);
        if self.shutdown.load(Ordering::SeqCst) {
            return RefreshOutcome::Skipped;
        }

        match result {
            Ok(stations) => {
                info!(count = stations.len(), cycle, "Fetched stations");
                let mut cache = self.cache.write().await;
                if store_dataset(&mut cache.stations, stations, cycle, Utc::now()) {
                    RefreshOutcome::Updated
                } else {
                    RefreshOutcome::Unchanged
                }
            }
            Err(e) => {
                self.mark_failure("stations", &e).await;
                RefreshOutcome::Failed
            }
        }
    }

    async fn run_routes(&self, cycle: u64) -> RefreshOutcome {
        if !self.acquire(&self.routes_in_flight) {
            debug!("Route refresh already in flight, skipping tick");
            return RefreshOutcome::Skipped;
        }
        let result = self.provider.fetch_routes().await;
        self.routes_in_flight.store(false, Ordering::SeqCst);
        if self.shutdown.load(Ordering::SeqCst) {
            return RefreshOutcome::Skipped;
        }

        match result {
            Ok(routes) => {
                info!(count = routes.len(), cycle, "Fetched routes");
                let mut cache = self.cache.write().await;
                if store_dataset(&mut cache.routes, routes, cycle, Utc::now()) {
                    RefreshOutcome::Updated
                } else {
                    RefreshOutcome::Unchanged
                }
            }
            Err(e) => {
                self.mark_failure("routes", &e).await;
                RefreshOutcome::Failed
            }
        }
    }

    async fn run_schedule(&self, cycle: u64) -> RefreshOutcome {
        if !self.acquire(&self.schedule_in_flight) {
            debug!("Schedule refresh already in flight, skipping tick");
            return RefreshOutcome::Skipped;
        }
        let result = futures::try_join!(
            self.provider.fetch_trips(),
            self.provider.fetch_stop_times(),
        );
        self.schedule_in_flight.store(false, Ordering::SeqCst);
        if self.shutdown.load(Ordering::SeqCst) {
            return RefreshOutcome::Skipped;
        }

        match result {
            Ok((trips, stop_times)) => {
                info!(
                    trips = trips.len(),
                    stop_times = stop_times.len(),
                    cycle,
                    "Fetched schedule"
                );
                let now = Utc::now();
                let mut cache = self.cache.write().await;
                let a = store_dataset(&mut cache.trips, trips, cycle, now);
                let b = store_dataset(&mut cache.stop_times, stop_times, cycle, now);
                if a || b {
                    RefreshOutcome::Updated
                } else {
                    RefreshOutcome::Unchanged
                }
            }
            Err(e) => {
                self.mark_failure("schedule", &e).await;
                RefreshOutcome::Failed
            }
        }
    }

    async fn mark_success(&self) {
        *self.last_success.write().await = Some(Utc::now());
        *self.last_error.write().await = None;
        self.using_cached_data.store(false, Ordering::SeqCst);
    }

    async fn mark_failure(&self, kind: &str, error: &ProviderError) {
        warn!(kind = %kind, error = %error, "Refresh failed, keeping existing data");
        *self.last_error.write().await = Some(ErrorDescriptor::from_provider(kind, error));
        let has_cache = self.cache.read().await.vehicles.is_some();
        self.using_cached_data.store(has_cache, Ordering::SeqCst);
        if has_cache {
            let mut snapshot = self.snapshot.write().await;
            if let Some(s) = snapshot.as_mut() {
                s.used_cached_data = true;
            }
        }
    }

    /// Regroup the cache into a fresh snapshot, unless nothing the grouping
    /// depends on has changed since the last pass.
    async fn rebuild_snapshot(&self) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let cache = self.cache.read().await;
        let (Some(vehicles), Some(stations)) = (&cache.vehicles, &cache.stations) else {
            return;
        };

        let user_location = *self.user_location.read().await;
        let fingerprint = Fingerprint {
            vehicles: vehicles.version,
            stations: stations.version,
            routes: cache.routes.as_ref().map(|c| c.version).unwrap_or(0),
            trips: cache.trips.as_ref().map(|c| c.version).unwrap_or(0),
            stop_times: cache.stop_times.as_ref().map(|c| c.version).unwrap_or(0),
            location: self.location_revision.load(Ordering::SeqCst),
        };
        if *self.last_fingerprint.read().await == Some(fingerprint) {
            debug!("Snapshot inputs unchanged, skipping regroup");
            return;
        }

        let empty_routes: Vec<Route> = Vec::new();
        let empty_trips: Vec<Trip> = Vec::new();
        let empty_stop_times: Vec<StopTime> = Vec::new();
        let routes = cache
            .routes
            .as_ref()
            .map(|c| c.data.as_slice())
            .unwrap_or(&empty_routes);
        let trips = cache
            .trips
            .as_ref()
            .map(|c| c.data.as_slice())
            .unwrap_or(&empty_trips);
        let stop_times = cache
            .stop_times
            .as_ref()
            .map(|c| c.data.as_slice())
            .unwrap_or(&empty_stop_times);

        let selection = select_stations(&SelectionCriteria {
            user_location: user_location.as_ref(),
            stations: &stations.data,
            trips,
            stop_times,
            max_search_radius_m: self.config.selection.max_search_radius_m,
            nearby_station_threshold_m: self.config.selection.second_stop_radius_m,
        });

        let targets: Vec<StationWithRoutes> = selection.selected().cloned().collect();
        let now = Utc::now();
        let data = transform_vehicles(&TransformContext {
            selection: &self.config.selection,
            favorites: &self.config.favorites,
            user_location: user_location.as_ref(),
            target_stations: &targets,
            vehicles: &vehicles.data,
            routes,
            stop_times,
            stations: &stations.data,
            now,
        });

        let options = PipelineOptions {
            max_vehicles_per_station: self.config.selection.max_vehicles_per_station,
            show_all_vehicles_per_route: self.config.selection.show_all_vehicles_per_route,
            sort_by_priority: true,
        };
        let groups = group_vehicles(&data, &options);
        drop(cache);

        info!(
            groups = groups.len(),
            vehicles = data.display_data.len(),
            "Rebuilt snapshot"
        );
        *self.snapshot.write().await = Some(TrackerSnapshot {
            closest_station: selection.closest_station,
            second_station: selection.second_station,
            groups,
            generated_at: now,
            used_cached_data: self.is_using_cached_data(),
        });
        *self.last_fingerprint.write().await = Some(fingerprint);
    }

    /// Start the periodic refresh timers. Already-running timers are left
    /// alone, so calling this twice is harmless.
    pub async fn start_auto_refresh(self: &Arc<Self>) {
        info!("Starting refresh timers");

        // Initial full fetch so the first snapshot does not wait an interval
        self.refresh_all(false).await;

        let mut timers = self.timers.lock().await;

        if !timers.contains_key("vehicles-live") {
            let orchestrator = self.clone();
            let secs = self.config.refresh.vehicles_interval_secs;
            timers.insert(
                "vehicles-live",
                tokio::spawn(async move {
                    let mut interval =
                        tokio::time::interval(tokio::time::Duration::from_secs(secs));
                    // Skip the first tick which fires immediately (we already fetched above)
                    interval.tick().await;
                    loop {
                        interval.tick().await;
                        orchestrator.refresh_vehicles().await;
                    }
                }),
            );
        }

        if !timers.contains_key("static") {
            let orchestrator = self.clone();
            let secs = self.config.refresh.static_interval_secs;
            timers.insert(
                "static",
                tokio::spawn(async move {
                    let mut interval =
                        tokio::time::interval(tokio::time::Duration::from_secs(secs));
                    interval.tick().await;
                    loop {
                        interval.tick().await;
                        orchestrator.refresh_stations().await;
                        orchestrator.refresh_routes().await;
                    }
                }),
            );
        }

        if !timers.contains_key("vehicles-schedule") {
            let orchestrator = self.clone();
            let secs = self.config.refresh.schedule_interval_secs;
            timers.insert(
                "vehicles-schedule",
                tokio::spawn(async move {
                    let mut interval =
                        tokio::time::interval(tokio::time::Duration::from_secs(secs));
                    interval.tick().await;
                    loop {
                        interval.tick().await;
                        orchestrator.refresh_schedule().await;
                    }
                }),
            );
        }
    }

    /// Stop one named timer. Stopping a timer that is not running is a
    /// no-op.
    pub async fn stop_timer(&self, name: &str) {
        if let Some(handle) = self.timers.lock().await.remove(name) {
            handle.abort();
            debug!(timer = %name, "Stopped refresh timer");
        }
    }

    /// Stop all refresh timers. Fetches already in flight run to
    /// completion; stopping when nothing runs is a no-op.
    pub async fn stop_auto_refresh(&self) {
        let mut timers = self.timers.lock().await;
        for (name, handle) in timers.drain() {
            handle.abort();
            debug!(timer = %name, "Stopped refresh timer");
        }
    }

    pub async fn running_timers(&self) -> Vec<&'static str> {
        self.timers.lock().await.keys().copied().collect()
    }

    /// Stop all timers and discard results from fetches still in flight.
    pub async fn shutdown(&self) {
        info!("Shutting down refresh orchestration");
        self.shutdown.store(true, Ordering::SeqCst);
        self.stop_auto_refresh().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RouteType;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn station(id: &str, lat: f64, lon: f64, routes: &[&str]) -> Station {
        Station {
            id: id.into(),
            name: format!("Station {id}"),
            coordinates: Coordinates::new(lat, lon),
            is_favorite: false,
            route_ids: Some(routes.iter().map(|r| r.to_string()).collect()),
        }
    }

    fn vehicle(id: &str, route_id: &str, lat: f64, lon: f64) -> Vehicle {
        Vehicle {
            id: id.into(),
            route_id: route_id.into(),
            trip_id: None,
            label: format!("Vehicle {id}"),
            position: Coordinates::new(lat, lon),
            timestamp: Utc::now(),
            speed: Some(8.0),
            bearing: None,
            is_wheelchair_accessible: false,
            is_bike_accessible: false,
        }
    }

    fn route(id: &str) -> Route {
        Route {
            id: id.into(),
            agency_id: "2".into(),
            route_name: id.into(),
            route_desc: String::new(),
            route_type: RouteType::Bus,
            color: None,
            text_color: None,
            url: None,
        }
    }

    /// Scripted provider: fixed data, optional failure, optional blocking
    /// gate for in-flight tests.
    struct MockProvider {
        vehicles: Vec<Vehicle>,
        stations: Vec<Station>,
        routes: Vec<Route>,
        fail_vehicles: AtomicBool,
        vehicle_fetches: AtomicUsize,
        other_fetches: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl MockProvider {
        fn new() -> Self {
            Self {
                vehicles: vec![vehicle("v1", "24", 46.7718, 23.6236)],
                stations: vec![
                    station("s1", 46.7717, 23.6236, &["24"]),
                    station("s2", 46.7723, 23.6236, &["24"]),
                ],
                routes: vec![route("24")],
                fail_vehicles: AtomicBool::new(false),
                vehicle_fetches: AtomicUsize::new(0),
                other_fetches: AtomicUsize::new(0),
                gate: None,
            }
        }
    }

    impl TransitProvider for MockProvider {
        async fn fetch_vehicles(&self) -> Result<Vec<Vehicle>, ProviderError> {
            self.vehicle_fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_vehicles.load(Ordering::SeqCst) {
                return Err(ProviderError::Network("connection refused".into()));
            }
            Ok(self.vehicles.clone())
        }

        async fn fetch_stations(&self) -> Result<Vec<Station>, ProviderError> {
            self.other_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.stations.clone())
        }

        async fn fetch_routes(&self) -> Result<Vec<Route>, ProviderError> {
            self.other_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.routes.clone())
        }

        async fn fetch_trips(&self) -> Result<Vec<Trip>, ProviderError> {
            self.other_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn fetch_stop_times(&self) -> Result<Vec<StopTime>, ProviderError> {
            self.other_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    fn test_config() -> TrackerConfig {
        TrackerConfig {
            agency_id: "2".into(),
            api_key: "secret".into(),
            ..TrackerConfig::default()
        }
    }

    fn orchestrator_with(provider: MockProvider) -> Arc<RefreshOrchestrator<MockProvider>> {
        Arc::new(RefreshOrchestrator::new(provider, test_config()))
    }

    #[tokio::test]
    async fn test_missing_credentials_skip_all_fetches() {
        let orch = Arc::new(RefreshOrchestrator::new(
            MockProvider::new(),
            TrackerConfig::default(),
        ));
        orch.set_user_location(Some(Coordinates::new(46.7712, 23.6236)))
            .await;

        assert_eq!(orch.refresh_all(false).await, RefreshOutcome::Skipped);
        assert_eq!(orch.refresh_vehicles().await, RefreshOutcome::Skipped);
        assert_eq!(orch.refresh_stations().await, RefreshOutcome::Skipped);
        assert_eq!(orch.refresh_schedule().await, RefreshOutcome::Skipped);

        // The provider was never touched and there is nothing to show
        assert_eq!(orch.provider.vehicle_fetches.load(Ordering::SeqCst), 0);
        assert_eq!(orch.provider.other_fetches.load(Ordering::SeqCst), 0);
        assert!(orch.snapshot().await.is_none());
        assert!(orch.last_error().await.is_none());
    }

    #[tokio::test]
    async fn test_refresh_all_populates_snapshot() {
        let orch = orchestrator_with(MockProvider::new());
        orch.set_user_location(Some(Coordinates::new(46.7712, 23.6236)))
            .await;

        assert!(orch.snapshot().await.is_none());
        assert_eq!(orch.refresh_all(false).await, RefreshOutcome::Updated);

        let snapshot = orch.snapshot().await.unwrap();
        assert!(snapshot.closest_station.is_some());
        assert_eq!(snapshot.groups.len(), 1);
        assert!(!snapshot.used_cached_data);
        assert!(orch.last_success().await.is_some());
        assert!(orch.last_attempt().await.is_some());
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_snapshot() {
        let orch = orchestrator_with(MockProvider::new());
        orch.set_user_location(Some(Coordinates::new(46.7712, 23.6236)))
            .await;
        orch.refresh_all(false).await;
        let before = orch.snapshot().await.unwrap();

        orch.provider.fail_vehicles.store(true, Ordering::SeqCst);
        assert_eq!(orch.refresh_vehicles().await, RefreshOutcome::Failed);

        let after = orch.snapshot().await.unwrap();
        assert_eq!(after.groups.len(), before.groups.len());
        assert!(after.used_cached_data);
        assert!(orch.is_using_cached_data());
        let error = orch.last_error().await.unwrap();
        assert_eq!(error.kind, "vehicles");
        assert!(error.retryable);
    }

    #[tokio::test]
    async fn test_recovery_clears_cached_flag() {
        let orch = orchestrator_with(MockProvider::new());
        orch.set_user_location(Some(Coordinates::new(46.7712, 23.6236)))
            .await;
        orch.refresh_all(false).await;

        orch.provider.fail_vehicles.store(true, Ordering::SeqCst);
        orch.refresh_vehicles().await;
        assert!(orch.is_using_cached_data());

        orch.provider.fail_vehicles.store(false, Ordering::SeqCst);
        orch.refresh_vehicles().await;
        assert!(!orch.is_using_cached_data());
        assert!(orch.last_error().await.is_none());
    }

    #[tokio::test]
    async fn test_in_flight_refresh_skips_tick() {
        let gate = Arc::new(Notify::new());
        let mut provider = MockProvider::new();
        provider.gate = Some(gate.clone());
        let orch = orchestrator_with(provider);

        let running = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.refresh_vehicles().await })
        };
        // Let the first refresh reach the provider and park on the gate
        while orch.provider.vehicle_fetches.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(orch.refresh_vehicles().await, RefreshOutcome::Skipped);
        assert_eq!(orch.provider.vehicle_fetches.load(Ordering::SeqCst), 1);

        gate.notify_one();
        let outcome = running.await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Updated);
    }

    #[tokio::test]
    async fn test_unchanged_data_skips_regroup() {
        let orch = orchestrator_with(MockProvider::new());
        orch.set_user_location(Some(Coordinates::new(46.7712, 23.6236)))
            .await;
        orch.refresh_all(false).await;
        let first = orch.snapshot().await.unwrap();

        // Identical data again: content versions stay put, no regroup
        assert_eq!(orch.refresh_vehicles().await, RefreshOutcome::Unchanged);
        let second = orch.snapshot().await.unwrap();
        assert_eq!(second.generated_at, first.generated_at);
    }

    #[tokio::test]
    async fn test_force_refresh_regroups_unchanged_data() {
        let orch = orchestrator_with(MockProvider::new());
        orch.set_user_location(Some(Coordinates::new(46.7712, 23.6236)))
            .await;
        orch.refresh_all(false).await;
        let first = orch.snapshot().await.unwrap();

        assert_eq!(orch.refresh_all(true).await, RefreshOutcome::Unchanged);
        let second = orch.snapshot().await.unwrap();
        assert!(second.generated_at > first.generated_at);
    }

    #[tokio::test]
    async fn test_location_change_triggers_regroup() {
        let orch = orchestrator_with(MockProvider::new());
        orch.set_user_location(Some(Coordinates::new(46.7712, 23.6236)))
            .await;
        orch.refresh_all(false).await;
        let first = orch.snapshot().await.unwrap();

        orch.set_user_location(Some(Coordinates::new(46.7724, 23.6236)))
            .await;
        let second = orch.snapshot().await.unwrap();
        assert_ne!(
            second.closest_station.as_ref().map(|s| s.station.id.clone()),
            first.closest_station.as_ref().map(|s| s.station.id.clone()),
        );
    }

    #[tokio::test]
    async fn test_timers_idempotent_and_stoppable() {
        let orch = orchestrator_with(MockProvider::new());
        orch.start_auto_refresh().await;
        orch.start_auto_refresh().await;

        let mut timers = orch.running_timers().await;
        timers.sort();
        assert_eq!(timers, vec!["static", "vehicles-live", "vehicles-schedule"]);

        orch.stop_timer("vehicles-live").await;
        assert_eq!(orch.running_timers().await.len(), 2);
        // Stopping an already-stopped timer is a no-op
        orch.stop_timer("vehicles-live").await;
        assert_eq!(orch.running_timers().await.len(), 2);

        orch.stop_auto_refresh().await;
        assert!(orch.running_timers().await.is_empty());
        orch.stop_auto_refresh().await;
    }

    #[tokio::test]
    async fn test_shutdown_discards_refreshes() {
        let orch = orchestrator_with(MockProvider::new());
        orch.set_user_location(Some(Coordinates::new(46.7712, 23.6236)))
            .await;
        orch.shutdown().await;

        assert_eq!(orch.refresh_all(false).await, RefreshOutcome::Skipped);
        assert_eq!(orch.refresh_vehicles().await, RefreshOutcome::Skipped);
        assert!(orch.snapshot().await.is_none());
    }
}
