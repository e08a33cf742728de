//! Station selection.
//!
//! Picks at most two nearby stations that actually have route service,
//! rejecting the rest with an explicit reason. The second station is chosen
//! by its distance from the *closest* station rather than from the user, so
//! that genuinely paired stops (two sides of the same intersection) group
//! together instead of pulling in an unrelated distant stop.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, warn};

use crate::geo::{distance_meters, validate_coordinates};
use crate::models::{Coordinates, RouteSource, Station, StationWithRoutes, StopTime, Trip};

/// Why a candidate station was not selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// No explicit route ids and nothing derivable from stop-times/trips.
    NoRoutes,
    /// Beyond the maximum search radius from the user.
    TooFar,
    /// Not close enough to the closest station to pair with it, or past
    /// the two-station display cap.
    ThresholdExceeded,
    /// Station coordinates failed validation.
    InvalidCoordinates,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedStation {
    pub station: Station,
    pub reason: RejectionReason,
}

/// Result of one selection pass. At most two non-null slots, always.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StationSelection {
    pub closest_station: Option<StationWithRoutes>,
    pub second_station: Option<StationWithRoutes>,
    pub rejected_stations: Vec<RejectedStation>,
}

impl StationSelection {
    /// The selected stations in distance order, for iteration.
    pub fn selected(&self) -> impl Iterator<Item = &StationWithRoutes> {
        self.closest_station
            .iter()
            .chain(self.second_station.iter())
    }
}

/// Inputs for one selection pass. All borrowed; the selector owns nothing
/// across cycles.
#[derive(Debug, Clone, Copy)]
pub struct SelectionCriteria<'a> {
    pub user_location: Option<&'a Coordinates>,
    pub stations: &'a [Station],
    pub trips: &'a [Trip],
    pub stop_times: &'a [StopTime],
    /// Maximum distance from the user to a candidate station, meters.
    pub max_search_radius_m: f64,
    /// Maximum closest-to-second station distance for pairing, meters.
    pub nearby_station_threshold_m: f64,
}

/// Resolve a station's route associations: explicit ids win, otherwise the
/// stop-times → trips → routes join, otherwise none.
pub fn resolve_route_source(
    station: &Station,
    trips_by_id: &HashMap<&str, &Trip>,
    stop_times_by_stop: &HashMap<&str, Vec<&StopTime>>,
) -> RouteSource {
    if let Some(ids) = &station.route_ids {
        if !ids.is_empty() {
            return RouteSource::Explicit(ids.clone());
        }
    }

    let Some(stop_times) = stop_times_by_stop.get(station.id.as_str()) else {
        return RouteSource::None;
    };

    // BTreeSet keeps the derived list deterministic across passes.
    let route_ids: BTreeSet<String> = stop_times
        .iter()
        .filter_map(|st| trips_by_id.get(st.trip_id.as_str()))
        .map(|trip| trip.route_id.clone())
        .collect();

    if route_ids.is_empty() {
        RouteSource::None
    } else {
        RouteSource::Derived(route_ids.into_iter().collect())
    }
}

/// Select at most two serviced stations near the user.
///
/// A `None` user location degrades to an empty selection. A malformed
/// station is rejected individually and never aborts the pass.
pub fn select_stations(criteria: &SelectionCriteria) -> StationSelection {
    let mut selection = StationSelection::default();

    let Some(user_location) = criteria.user_location else {
        debug!("No user location available, skipping station selection");
        return selection;
    };
    if !validate_coordinates(user_location) {
        warn!(
            latitude = user_location.latitude,
            longitude = user_location.longitude,
            "User location failed validation, skipping station selection"
        );
        return selection;
    }

    // Index trips and stop-times once per pass.
    let trips_by_id: HashMap<&str, &Trip> = criteria
        .trips
        .iter()
        .map(|t| (t.id.as_str(), t))
        .collect();
    let mut stop_times_by_stop: HashMap<&str, Vec<&StopTime>> = HashMap::new();
    for st in criteria.stop_times {
        stop_times_by_stop
            .entry(st.stop_id.as_str())
            .or_default()
            .push(st);
    }

    // Stage 1+2: route requirement, then distance filter.
    let mut candidates: Vec<(f64, &Station, RouteSource)> = Vec::new();
    for station in criteria.stations {
        let routes = resolve_route_source(station, &trips_by_id, &stop_times_by_stop);
        if routes.is_none() {
            selection.rejected_stations.push(RejectedStation {
                station: station.clone(),
                reason: RejectionReason::NoRoutes,
            });
            continue;
        }

        let distance = match distance_meters(user_location, &station.coordinates) {
            Ok(d) => d,
            Err(e) => {
                warn!(station_id = %station.id, error = %e, "Skipping station with invalid coordinates");
                selection.rejected_stations.push(RejectedStation {
                    station: station.clone(),
                    reason: RejectionReason::InvalidCoordinates,
                });
                continue;
            }
        };

        if distance > criteria.max_search_radius_m {
            selection.rejected_stations.push(RejectedStation {
                station: station.clone(),
                reason: RejectionReason::TooFar,
            });
            continue;
        }

        candidates.push((distance, station, routes));
    }

    // Stage 3: closest first. NaN cannot appear here (validated inputs),
    // but partial_cmp still gets a deterministic fallback.
    candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut iter = candidates.into_iter();
    let Some((closest_distance, closest, closest_routes)) = iter.next() else {
        debug!(
            rejected = selection.rejected_stations.len(),
            "No serviceable stations within search radius"
        );
        return selection;
    };

    selection.closest_station = Some(StationWithRoutes {
        station: closest.clone(),
        distance: closest_distance,
        routes: closest_routes,
    });

    // Stage 4+5: pair the next candidate that sits near the closest station;
    // everything else falls out of the two-station cap.
    let mut seen_ids: HashSet<&str> = HashSet::new();
    seen_ids.insert(closest.id.as_str());

    for (distance, station, routes) in iter {
        if !seen_ids.insert(station.id.as_str()) {
            continue; // duplicate station record
        }

        let pair_distance = match distance_meters(&closest.coordinates, &station.coordinates) {
            Ok(d) => d,
            Err(_) => f64::MAX,
        };

        if selection.second_station.is_none()
            && pair_distance <= criteria.nearby_station_threshold_m
        {
            selection.second_station = Some(StationWithRoutes {
                station: station.clone(),
                distance,
                routes,
            });
        } else {
            selection.rejected_stations.push(RejectedStation {
                station: station.clone(),
                reason: RejectionReason::ThresholdExceeded,
            });
        }
    }

    debug!(
        closest = %closest.id,
        second = selection
            .second_station
            .as_ref()
            .map(|s| s.station.id.as_str())
            .unwrap_or("-"),
        rejected = selection.rejected_stations.len(),
        "Station selection complete"
    );

    selection
}
