use serde::Deserialize;
use std::path::Path;

use crate::models::Coordinates;

/// Top-level tracker configuration, loaded from YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Transit agency whose data is tracked. Required for any network fetch.
    #[serde(default)]
    pub agency_id: String,
    /// API key for the transit data provider. Required for any network fetch.
    #[serde(default)]
    pub api_key: String,
    /// Base URL of the transit data API.
    #[serde(default = "TrackerConfig::default_base_url")]
    pub base_url: String,
    /// Station search and grouping tunables.
    #[serde(default)]
    pub selection: SelectionConfig,
    /// Favorite-route filtering.
    #[serde(default)]
    pub favorites: FavoritesConfig,
    /// Fallback locations used when geolocation is unavailable.
    #[serde(default)]
    pub locations: LocationConfig,
    /// Auto-refresh scheduling.
    #[serde(default)]
    pub refresh: RefreshConfig,
}

/// Tunables for station selection and per-station vehicle display.
///
/// The nearby-station threshold and snap radius are environment-tuned
/// values, so they are configuration rather than hard-coded constants.
#[derive(Debug, Clone, Deserialize)]
pub struct SelectionConfig {
    /// Maximum distance from the user to a candidate station, meters.
    #[serde(default = "SelectionConfig::default_max_search_radius_m")]
    pub max_search_radius_m: f64,
    /// Maximum distance between the closest station and a second station
    /// for the pair to be shown together, meters.
    #[serde(default = "SelectionConfig::default_second_stop_radius_m")]
    pub second_stop_radius_m: f64,
    /// Radius within which a vehicle counts as "at" a station, meters.
    #[serde(default = "SelectionConfig::default_station_snap_radius_m")]
    pub station_snap_radius_m: f64,
    /// Maximum vehicles shown per station.
    #[serde(default = "SelectionConfig::default_max_vehicles_per_station")]
    pub max_vehicles_per_station: usize,
    /// Show every vehicle per route instead of deduplicating to the best one.
    #[serde(default)]
    pub show_all_vehicles_per_route: bool,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            max_search_radius_m: Self::default_max_search_radius_m(),
            second_stop_radius_m: Self::default_second_stop_radius_m(),
            station_snap_radius_m: Self::default_station_snap_radius_m(),
            max_vehicles_per_station: Self::default_max_vehicles_per_station(),
            show_all_vehicles_per_route: false,
        }
    }
}

impl SelectionConfig {
    fn default_max_search_radius_m() -> f64 {
        5000.0
    }
    fn default_second_stop_radius_m() -> f64 {
        200.0
    }
    fn default_station_snap_radius_m() -> f64 {
        150.0
    }
    fn default_max_vehicles_per_station() -> usize {
        5
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FavoritesConfig {
    /// When true, only vehicles on favorite routes are shown.
    #[serde(default)]
    pub filter_by_favorites: bool,
    #[serde(default)]
    pub favorite_route_ids: Vec<String>,
}

/// Fallback locations, tried in order home → work → default when the user
/// has no live geolocation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocationConfig {
    #[serde(default)]
    pub home: Option<Coordinates>,
    #[serde(default)]
    pub work: Option<Coordinates>,
    #[serde(default)]
    pub default: Option<Coordinates>,
}

impl LocationConfig {
    /// First configured fallback location, if any.
    pub fn fallback(&self) -> Option<Coordinates> {
        self.home.or(self.work).or(self.default)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Interval between live vehicle refreshes, seconds (default: 30).
    #[serde(default = "RefreshConfig::default_vehicles_interval_secs")]
    pub vehicles_interval_secs: u64,
    /// Interval between station/route refreshes, seconds (default: 300).
    #[serde(default = "RefreshConfig::default_static_interval_secs")]
    pub static_interval_secs: u64,
    /// Interval between schedule (trips + stop-times) refreshes, seconds
    /// (default: 3600; schedule data changes rarely).
    #[serde(default = "RefreshConfig::default_schedule_interval_secs")]
    pub schedule_interval_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            vehicles_interval_secs: Self::default_vehicles_interval_secs(),
            static_interval_secs: Self::default_static_interval_secs(),
            schedule_interval_secs: Self::default_schedule_interval_secs(),
        }
    }
}

impl RefreshConfig {
    fn default_vehicles_interval_secs() -> u64 {
        30
    }
    fn default_static_interval_secs() -> u64 {
        300
    }
    fn default_schedule_interval_secs() -> u64 {
        3600
    }
}

impl TrackerConfig {
    fn default_base_url() -> String {
        "https://api.tranzy.ai/v1/opendata".to_string()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Whether agency id and API key are both present. The pipeline treats a
    /// missing credential as "not configured yet", not as an error.
    pub fn has_credentials(&self) -> bool {
        !self.agency_id.trim().is_empty() && !self.api_key.trim().is_empty()
    }

    /// Credential check for call sites that must fail loudly (e.g. the
    /// provider client constructor).
    pub fn require_credentials(&self) -> Result<(), ConfigError> {
        if self.has_credentials() {
            Ok(())
        } else {
            Err(ConfigError::MissingCredentials)
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            agency_id: String::new(),
            api_key: String::new(),
            base_url: Self::default_base_url(),
            selection: SelectionConfig::default(),
            favorites: FavoritesConfig::default(),
            locations: LocationConfig::default(),
            refresh: RefreshConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("Missing agency_id or api_key")]
    MissingCredentials,
}
