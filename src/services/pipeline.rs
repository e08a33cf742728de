//! Display pipeline: ordering, deduplication, and capping of the vehicles
//! shown per station.
//!
//! Pure functions over already-transformed data. Sorting is stable, so
//! equal-priority vehicles keep their feed order and repeated passes over
//! the same input produce the same output.

use std::collections::HashSet;

use crate::models::{EnhancedVehicle, RouteSummary, StationVehicleGroup, TravelDirection};
use crate::services::transform::TransformedVehicleData;

/// Tunables for the display pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Hard cap on vehicles shown per station.
    pub max_vehicles_per_station: usize,
    /// When true, show every vehicle per route instead of only the best one.
    pub show_all_vehicles_per_route: bool,
    /// When false, vehicles keep their feed order instead of priority order.
    pub sort_by_priority: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_vehicles_per_station: 5,
            show_all_vehicles_per_route: false,
            sort_by_priority: true,
        }
    }
}

/// Sort, deduplicate, and cap one station's vehicle list.
///
/// Priority puts at-station and imminent arrivals first, then arrivals by
/// minutes, then everything else by minutes. When all vehicles share a
/// single route, per-route deduplication is skipped so the rider sees the
/// next few vehicles on that route rather than just one.
pub fn process_vehicles(
    vehicles: &[EnhancedVehicle],
    options: &PipelineOptions,
) -> Vec<EnhancedVehicle> {
    let mut sorted: Vec<EnhancedVehicle> = vehicles.to_vec();
    if options.sort_by_priority {
        sorted.sort_by(|a, b| {
            priority_rank(a)
                .cmp(&priority_rank(b))
                .then(a.minutes_away.cmp(&b.minutes_away))
        });
    }

    let distinct_routes: HashSet<&str> = sorted.iter().map(|v| v.route_id.as_str()).collect();
    let single_route = distinct_routes.len() <= 1;

    if single_route || options.show_all_vehicles_per_route {
        sorted.truncate(options.max_vehicles_per_station);
        return sorted;
    }

    // One vehicle per route, best first, then the cap.
    let mut seen_routes: HashSet<&str> = HashSet::new();
    let mut deduped: Vec<EnhancedVehicle> = Vec::new();
    for vehicle in &sorted {
        if seen_routes.insert(vehicle.route_id.as_str()) {
            deduped.push(vehicle.clone());
            if deduped.len() == options.max_vehicles_per_station {
                break;
            }
        }
    }
    deduped
}

/// Build per-station display groups from a transformation pass.
///
/// Route summaries count vehicles before deduplication, so a route with
/// several assigned vehicles still reports its true count even when only
/// one survives the pipeline. Stations with no vehicles are dropped;
/// surviving groups are ordered by distance from the user.
pub fn group_vehicles(
    data: &TransformedVehicleData,
    options: &PipelineOptions,
) -> Vec<StationVehicleGroup> {
    let mut groups: Vec<StationVehicleGroup> = Vec::new();
    for (station_id, info) in &data.station_info {
        let enhanced = data.enhanced_for_station(station_id);
        if enhanced.is_empty() {
            continue;
        }

        let all_routes = summarize_routes(&enhanced);
        let vehicles = process_vehicles(&enhanced, options);
        groups.push(StationVehicleGroup {
            station: info.clone(),
            vehicles,
            all_routes,
        });
    }

    // Station id breaks distance ties so the order is stable across runs
    groups.sort_by(|a, b| {
        a.station
            .distance
            .partial_cmp(&b.station.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.station.station.id.cmp(&b.station.station.id))
    });
    groups
}

fn priority_rank(vehicle: &EnhancedVehicle) -> u8 {
    match vehicle.direction {
        TravelDirection::AtStation => 0,
        TravelDirection::Arriving if vehicle.minutes_away == 0 => 0,
        TravelDirection::Arriving => 1,
        _ => 2,
    }
}

fn summarize_routes(vehicles: &[EnhancedVehicle]) -> Vec<RouteSummary> {
    let mut summaries: Vec<RouteSummary> = Vec::new();
    for vehicle in vehicles {
        match summaries
            .iter_mut()
            .find(|s| s.route_id == vehicle.route_id)
        {
            Some(summary) => summary.vehicle_count += 1,
            None => summaries.push(RouteSummary {
                route_id: vehicle.route_id.clone(),
                route_name: vehicle.display.route_name.clone(),
                vehicle_count: 1,
            }),
        }
    }
    summaries.sort_by(|a, b| a.route_name.cmp(&b.route_name));
    summaries
}
