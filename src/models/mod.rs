pub mod vehicle;

use serde::{Deserialize, Serialize};

pub use vehicle::{
    EnhancedVehicle, StopSequenceEntry, TravelDirection, Vehicle, VehicleDisplayData,
};

/// A WGS84 coordinate pair, optionally with a GPS accuracy radius in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: None,
        }
    }
}

/// A transit station (GTFS stop), as returned by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: String,
    pub name: String,
    pub coordinates: Coordinates,
    #[serde(default)]
    pub is_favorite: bool,
    /// Routes known to serve this station, when the provider supplies them.
    /// When absent, associations are derived from stop-times and trips.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_ids: Option<Vec<String>>,
}

/// Mode of transport, mapped from the GTFS `route_type` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteType {
    Bus,
    Trolleybus,
    Tram,
    Metro,
    Rail,
    Ferry,
    Other,
}

impl RouteType {
    /// Map a GTFS route_type code. Unknown codes fold into `Other`.
    pub fn from_gtfs_code(code: i32) -> Self {
        match code {
            0 => RouteType::Tram,
            1 => RouteType::Metro,
            2 => RouteType::Rail,
            3 => RouteType::Bus,
            4 => RouteType::Ferry,
            11 => RouteType::Trolleybus,
            _ => RouteType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RouteType::Bus => "bus",
            RouteType::Trolleybus => "trolleybus",
            RouteType::Tram => "tram",
            RouteType::Metro => "metro",
            RouteType::Rail => "rail",
            RouteType::Ferry => "ferry",
            RouteType::Other => "other",
        }
    }
}

/// A transit route (line).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub agency_id: String,
    /// Short display code, e.g. "42".
    pub route_name: String,
    /// Long descriptive name, e.g. "Piața Unirii - Gara CFR".
    #[serde(default)]
    pub route_desc: String,
    pub route_type: RouteType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A scheduled trip along a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub id: String,
    pub route_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headsign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction_id: Option<i32>,
}

/// One scheduled stop visit within a trip.
///
/// Arrival/departure are seconds since midnight (can exceed 86400 for trips
/// crossing midnight).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopTime {
    pub trip_id: String,
    pub stop_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrival_time: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub departure_time: Option<i32>,
    /// 1-based position within the trip.
    pub sequence: u32,
    #[serde(default = "default_true")]
    pub pickup: bool,
    #[serde(default = "default_true")]
    pub drop_off: bool,
}

fn default_true() -> bool {
    true
}

/// A station annotated with its distance from the user, in meters.
/// Recomputed whenever the user location or station list changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationWithDistance {
    pub station: Station,
    pub distance: f64,
}

/// Where a station's route associations came from, resolved once per
/// station per refresh cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "source", content = "route_ids")]
pub enum RouteSource {
    /// The provider supplied explicit route ids on the station record.
    Explicit(Vec<String>),
    /// Derived by joining stop-times to trips to routes.
    Derived(Vec<String>),
    /// No association found anywhere.
    None,
}

impl RouteSource {
    pub fn route_ids(&self) -> &[String] {
        match self {
            RouteSource::Explicit(ids) | RouteSource::Derived(ids) => ids,
            RouteSource::None => &[],
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, RouteSource::None)
    }
}

/// A selected station together with its resolved route associations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationWithRoutes {
    pub station: Station,
    pub distance: f64,
    pub routes: RouteSource,
}

/// Per-route aggregate shown alongside a station's vehicle list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteSummary {
    pub route_id: String,
    pub route_name: String,
    pub vehicle_count: usize,
}

/// Display-ready output of the full pipeline: one nearby station with its
/// ranked, capped vehicle list. Stations without vehicles are never emitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationVehicleGroup {
    pub station: StationWithDistance,
    pub vehicles: Vec<EnhancedVehicle>,
    /// All routes with live vehicles mapped to this station, counted before
    /// per-route deduplication.
    pub all_routes: Vec<RouteSummary>,
}
