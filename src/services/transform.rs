//! Vehicle transformation service.
//!
//! Takes a raw vehicle feed plus the selected target stations and produces
//! the per-vehicle maps the display layer consumes: station assignment,
//! direction analysis, and display data. One bad vehicle record never fails
//! the whole pass; it is skipped and counted.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{FavoritesConfig, SelectionConfig};
use crate::geo::{distance_meters, validate_coordinates};
use crate::models::{
    Coordinates, EnhancedVehicle, Route, Station, StationWithDistance, StationWithRoutes,
    StopTime, Vehicle, VehicleDisplayData,
};
use crate::services::direction::{analyze_direction, DirectionAnalysis};

/// Everything one transformation pass reads. Borrowed from the refresh
/// cache; the pass itself owns nothing and mutates nothing.
pub struct TransformContext<'a> {
    pub selection: &'a SelectionConfig,
    pub favorites: &'a FavoritesConfig,
    pub user_location: Option<&'a Coordinates>,
    /// Selected target stations, at most two.
    pub target_stations: &'a [StationWithRoutes],
    pub vehicles: &'a [Vehicle],
    pub routes: &'a [Route],
    pub stop_times: &'a [StopTime],
    pub stations: &'a [Station],
    pub now: DateTime<Utc>,
}

/// Output of one transformation pass, keyed by station id and vehicle id.
///
/// An empty value (all maps empty) means the pass ran with nothing to show;
/// callers that need "never ran yet" track that separately.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformedVehicleData {
    /// Station id → vehicle ids assigned to it.
    pub vehicles_by_station: HashMap<String, Vec<String>>,
    /// Station id → station record with distance from the user.
    pub station_info: HashMap<String, StationWithDistance>,
    /// Vehicle id → direction analysis against its assigned station.
    pub directions: HashMap<String, DirectionAnalysis>,
    /// Vehicle id → display-ready fields.
    pub display_data: HashMap<String, VehicleDisplayData>,
    pub generated_at: DateTime<Utc>,
}

impl TransformedVehicleData {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            vehicles_by_station: HashMap::new(),
            station_info: HashMap::new(),
            directions: HashMap::new(),
            display_data: HashMap::new(),
            generated_at: now,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.display_data.is_empty()
    }

    /// Assemble the enhanced vehicles assigned to one station, ready for
    /// the display pipeline. Order follows the assignment order.
    pub fn enhanced_for_station(&self, station_id: &str) -> Vec<EnhancedVehicle> {
        let Some(vehicle_ids) = self.vehicles_by_station.get(station_id) else {
            return Vec::new();
        };
        vehicle_ids
            .iter()
            .filter_map(|id| {
                let display = self.display_data.get(id)?.clone();
                let analysis = self.directions.get(id)?;
                Some(EnhancedVehicle {
                    route_id: display.route_id.clone(),
                    minutes_away: analysis.estimated_minutes,
                    estimated_arrival: self.generated_at
                        + Duration::minutes(i64::from(analysis.estimated_minutes)),
                    direction: analysis.direction,
                    stop_sequence: analysis.stop_sequence.clone(),
                    display,
                })
            })
            .collect()
    }
}

/// Run one transformation pass over the vehicle feed.
///
/// Without a user location or target stations there is nothing to transform
/// and the result is empty. Otherwise every vehicle is filtered for
/// relevance, assigned to its nearest target station, and analyzed against
/// that station.
pub fn transform_vehicles(ctx: &TransformContext) -> TransformedVehicleData {
    if ctx.user_location.is_none() || ctx.target_stations.is_empty() {
        debug!("Transformation skipped: no user location or target stations");
        return TransformedVehicleData::empty(ctx.now);
    }

    let routes_by_id: HashMap<&str, &Route> =
        ctx.routes.iter().map(|r| (r.id.as_str(), r)).collect();
    let stations_by_id: HashMap<&str, &Station> =
        ctx.stations.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut stops_by_trip: HashMap<&str, Vec<StopTime>> = HashMap::new();
    for st in ctx.stop_times {
        stops_by_trip
            .entry(st.trip_id.as_str())
            .or_default()
            .push(st.clone());
    }
    for stops in stops_by_trip.values_mut() {
        stops.sort_by_key(|st| st.sequence);
    }

    // Relevance: the union of the target stations' route ids. An empty
    // union (no route data at all) disables the filter rather than hiding
    // every vehicle.
    let relevant_routes: HashSet<&str> = ctx
        .target_stations
        .iter()
        .flat_map(|s| s.routes.route_ids())
        .map(String::as_str)
        .collect();

    let favorite_routes: HashSet<&str> = ctx
        .favorites
        .favorite_route_ids
        .iter()
        .map(String::as_str)
        .collect();

    let mut result = TransformedVehicleData::empty(ctx.now);
    for target in ctx.target_stations {
        result.vehicles_by_station.insert(target.station.id.clone(), Vec::new());
        result.station_info.insert(
            target.station.id.clone(),
            StationWithDistance {
                station: target.station.clone(),
                distance: target.distance,
            },
        );
    }

    let mut skipped = 0usize;
    for vehicle in ctx.vehicles {
        if !validate_coordinates(&vehicle.position) {
            warn!(
                vehicle_id = %vehicle.id,
                latitude = vehicle.position.latitude,
                longitude = vehicle.position.longitude,
                "Skipping vehicle with invalid coordinates"
            );
            skipped += 1;
            continue;
        }
        if !relevant_routes.is_empty() && !relevant_routes.contains(vehicle.route_id.as_str()) {
            continue;
        }
        if ctx.favorites.filter_by_favorites
            && !favorite_routes.contains(vehicle.route_id.as_str())
        {
            continue;
        }

        // Assign the vehicle to its nearest target station.
        let mut nearest: Option<(&StationWithRoutes, f64)> = None;
        for target in ctx.target_stations {
            let Ok(dist) = distance_meters(&vehicle.position, &target.station.coordinates) else {
                continue;
            };
            if nearest.map_or(true, |(_, d)| dist < d) {
                nearest = Some((target, dist));
            }
        }
        let Some((target, _)) = nearest else {
            skipped += 1;
            continue;
        };

        let trip_stops: &[StopTime] = vehicle
            .trip_id
            .as_deref()
            .and_then(|id| stops_by_trip.get(id))
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        let analysis = analyze_direction(
            vehicle,
            trip_stops,
            &stations_by_id,
            &target.station,
            ctx.selection.station_snap_radius_m,
        );

        let display = build_display_data(vehicle, routes_by_id.get(vehicle.route_id.as_str()));

        result
            .vehicles_by_station
            .entry(target.station.id.clone())
            .or_default()
            .push(vehicle.id.clone());
        result.directions.insert(vehicle.id.clone(), analysis);
        result.display_data.insert(vehicle.id.clone(), display);
    }

    if skipped > 0 {
        debug!(skipped, total = ctx.vehicles.len(), "Skipped unusable vehicle records");
    }
    result
}

fn build_display_data(vehicle: &Vehicle, route: Option<&&Route>) -> VehicleDisplayData {
    VehicleDisplayData {
        vehicle_id: vehicle.id.clone(),
        route_id: vehicle.route_id.clone(),
        route_name: route
            .map(|r| r.route_name.clone())
            .unwrap_or_else(|| vehicle.route_id.clone()),
        route_desc: route.map(|r| r.route_desc.clone()).unwrap_or_default(),
        route_type: route.map(|r| r.route_type),
        color: route.and_then(|r| r.color.clone()),
        label: vehicle.label.clone(),
        position: vehicle.position,
        timestamp: vehicle.timestamp,
        is_wheelchair_accessible: vehicle.is_wheelchair_accessible,
        is_bike_accessible: vehicle.is_bike_accessible,
    }
}
