use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Coordinates, RouteType};

/// A live vehicle position as delivered by the transit provider.
///
/// Ephemeral: refreshed roughly every 30 seconds and never persisted beyond
/// the in-memory cache of the current refresh cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: String,
    pub route_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<String>,
    #[serde(default)]
    pub label: String,
    pub position: Coordinates,
    pub timestamp: DateTime<Utc>,
    /// Speed in meters per second, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Heading in degrees, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f64>,
    #[serde(default)]
    pub is_wheelchair_accessible: bool,
    #[serde(default)]
    pub is_bike_accessible: bool,
}

/// Display-ready vehicle record: the raw vehicle joined with its route.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleDisplayData {
    pub vehicle_id: String,
    pub route_id: String,
    /// Short route code, e.g. "24". Falls back to the route id when the
    /// route lookup has no entry.
    pub route_name: String,
    pub route_desc: String,
    pub route_type: Option<RouteType>,
    pub color: Option<String>,
    pub label: String,
    pub position: Coordinates,
    pub timestamp: DateTime<Utc>,
    pub is_wheelchair_accessible: bool,
    pub is_bike_accessible: bool,
}

/// Classified movement of a vehicle relative to a target station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TravelDirection {
    Arriving,
    Departing,
    AtStation,
    Unknown,
}

/// One stop in a trip's ordered sequence, annotated relative to the vehicle
/// and its target station.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopSequenceEntry {
    pub stop_id: String,
    pub stop_name: String,
    pub sequence: u32,
    pub is_current: bool,
    pub is_destination: bool,
}

/// A display record enriched with direction analysis. Built fresh each
/// transformation pass and replaced wholesale, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnhancedVehicle {
    pub display: VehicleDisplayData,
    pub route_id: String,
    pub minutes_away: u32,
    pub estimated_arrival: DateTime<Utc>,
    pub direction: TravelDirection,
    pub stop_sequence: Option<Vec<StopSequenceEntry>>,
}
