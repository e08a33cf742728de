//! Vehicle direction analysis.
//!
//! Classifies a single vehicle against a trip's ordered stop sequence:
//! is it at the target station, heading toward it, already past it, or is
//! there not enough data to tell. Pure and stateless — the same inputs
//! always produce the same result, and nothing is carried between vehicles
//! or refresh cycles.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::geo::distance_meters;
use crate::models::{Station, StopSequenceEntry, StopTime, TravelDirection, Vehicle};

/// Assumed speed (m/s) when a vehicle reports no usable speed and no
/// schedule data exists: 18 km/h, a typical urban surface-transit average.
/// Estimates built on it are best-effort and marked low-confidence.
const FALLBACK_SPEED_MPS: f64 = 5.0;

/// How much trust to place in the classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Schedule and position data available and in agreement.
    High,
    /// Only one usable data source (schedule or position/speed).
    Medium,
    /// Estimate built on assumed values.
    Low,
    Unknown,
}

/// Outcome of analyzing one vehicle against one target station.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectionAnalysis {
    pub direction: TravelDirection,
    /// Estimated minutes until the vehicle reaches the target station.
    /// Always ≥ 0; clamped for vehicles already past the target.
    pub estimated_minutes: u32,
    pub confidence: Confidence,
    /// The trip's ordered stops annotated with current/destination flags,
    /// when trip data is available.
    pub stop_sequence: Option<Vec<StopSequenceEntry>>,
}

impl DirectionAnalysis {
    fn unknown() -> Self {
        Self {
            direction: TravelDirection::Unknown,
            estimated_minutes: 0,
            confidence: Confidence::Unknown,
            stop_sequence: None,
        }
    }
}

/// Classify a vehicle's movement relative to `target_station`.
///
/// `trip_stops` is the vehicle's trip stop sequence ordered by `sequence`
/// (empty when the trip is unknown). `stations_by_id` supplies coordinates
/// and display names for stops; stops without a station record still appear
/// in the output sequence under their raw id.
pub fn analyze_direction(
    vehicle: &Vehicle,
    trip_stops: &[StopTime],
    stations_by_id: &HashMap<&str, &Station>,
    target_station: &Station,
    snap_radius_m: f64,
) -> DirectionAnalysis {
    let distance_to_target = distance_meters(&vehicle.position, &target_station.coordinates).ok();

    if trip_stops.is_empty() {
        // No trip data: fall back to a pure distance/speed estimate.
        return match distance_to_target {
            Some(distance) => {
                let (minutes, confidence) = estimate_minutes_from_distance(distance, vehicle.speed);
                DirectionAnalysis {
                    direction: TravelDirection::Unknown,
                    estimated_minutes: minutes,
                    confidence,
                    stop_sequence: None,
                }
            }
            None => DirectionAnalysis::unknown(),
        };
    }

    let Some(target_idx) = trip_stops
        .iter()
        .position(|st| st.stop_id == target_station.id)
    else {
        debug!(
            vehicle_id = %vehicle.id,
            station_id = %target_station.id,
            "Target station not on vehicle trip"
        );
        return match distance_to_target {
            Some(distance) => {
                let (minutes, confidence) = estimate_minutes_from_distance(distance, vehicle.speed);
                DirectionAnalysis {
                    direction: TravelDirection::Unknown,
                    estimated_minutes: minutes,
                    confidence,
                    stop_sequence: None,
                }
            }
            None => DirectionAnalysis::unknown(),
        };
    };

    // Locate the vehicle along the trip: nearest stop with known coordinates.
    let current_idx = nearest_stop_index(vehicle, trip_stops, stations_by_id);

    let sequence = build_stop_sequence(trip_stops, stations_by_id, current_idx, target_idx);

    let Some(current_idx) = current_idx else {
        // Trip known but no stop coordinates to position against.
        let (minutes, confidence) = match distance_to_target {
            Some(distance) => estimate_minutes_from_distance(distance, vehicle.speed),
            None => (0, Confidence::Unknown),
        };
        return DirectionAnalysis {
            direction: TravelDirection::Unknown,
            estimated_minutes: minutes,
            confidence,
            stop_sequence: Some(sequence),
        };
    };

    // At-station: physically within the snap radius and the target is the
    // vehicle's current or immediately-next scheduled stop.
    let snapped = distance_to_target.map(|d| d <= snap_radius_m).unwrap_or(false);
    if snapped && target_idx >= current_idx && target_idx - current_idx <= 1 {
        return DirectionAnalysis {
            direction: TravelDirection::AtStation,
            estimated_minutes: 0,
            confidence: Confidence::High,
            stop_sequence: Some(sequence),
        };
    }

    if target_idx < current_idx {
        // Already past the target. Minutes floor at zero by definition.
        return DirectionAnalysis {
            direction: TravelDirection::Departing,
            estimated_minutes: 0,
            confidence: Confidence::High,
            stop_sequence: Some(sequence),
        };
    }

    // Target ahead: prefer the schedule delta, fall back to distance/speed.
    let schedule_minutes =
        schedule_minutes_between(&trip_stops[current_idx], &trip_stops[target_idx]);
    let (estimated_minutes, confidence) = match schedule_minutes {
        Some(minutes) => (minutes, Confidence::High),
        None => match distance_to_target {
            Some(distance) => estimate_minutes_from_distance(distance, vehicle.speed),
            None => (0, Confidence::Unknown),
        },
    };

    DirectionAnalysis {
        direction: TravelDirection::Arriving,
        estimated_minutes,
        confidence,
        stop_sequence: Some(sequence),
    }
}

/// Index of the trip stop nearest to the vehicle, among stops with known
/// coordinates.
fn nearest_stop_index(
    vehicle: &Vehicle,
    trip_stops: &[StopTime],
    stations_by_id: &HashMap<&str, &Station>,
) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, st) in trip_stops.iter().enumerate() {
        let Some(station) = stations_by_id.get(st.stop_id.as_str()) else {
            continue;
        };
        let Ok(dist) = distance_meters(&vehicle.position, &station.coordinates) else {
            continue;
        };
        if best.map_or(true, |(_, d)| dist < d) {
            best = Some((idx, dist));
        }
    }
    best.map(|(idx, _)| idx)
}

/// Schedule-based minutes between two stops of the same trip, when both
/// carry usable times. Negative deltas clamp to zero.
fn schedule_minutes_between(current: &StopTime, target: &StopTime) -> Option<u32> {
    let depart = current.departure_time.or(current.arrival_time)?;
    let arrive = target.arrival_time.or(target.departure_time)?;
    let delta_secs = arrive - depart;
    Some((delta_secs.max(0) as u32) / 60)
}

/// Distance/speed estimate, minutes, floored at zero. Missing or zero speed
/// falls back to an assumed urban average and drops confidence to Low.
fn estimate_minutes_from_distance(distance_m: f64, speed_mps: Option<f64>) -> (u32, Confidence) {
    match speed_mps {
        Some(speed) if speed > 0.5 => {
            let minutes = (distance_m / speed / 60.0).floor().max(0.0) as u32;
            (minutes, Confidence::Medium)
        }
        _ => {
            let minutes = (distance_m / FALLBACK_SPEED_MPS / 60.0).floor().max(0.0) as u32;
            (minutes, Confidence::Low)
        }
    }
}

fn build_stop_sequence(
    trip_stops: &[StopTime],
    stations_by_id: &HashMap<&str, &Station>,
    current_idx: Option<usize>,
    target_idx: usize,
) -> Vec<StopSequenceEntry> {
    trip_stops
        .iter()
        .enumerate()
        .map(|(idx, st)| StopSequenceEntry {
            stop_id: st.stop_id.clone(),
            stop_name: stations_by_id
                .get(st.stop_id.as_str())
                .map(|s| s.name.clone())
                .unwrap_or_else(|| st.stop_id.clone()),
            sequence: st.sequence,
            is_current: current_idx == Some(idx),
            is_destination: idx == target_idx,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Coordinates;
    use chrono::Utc;

    fn vehicle(lat: f64, lon: f64, speed: Option<f64>) -> Vehicle {
        Vehicle {
            id: "v1".into(),
            route_id: "24".into(),
            trip_id: Some("t1".into()),
            label: "Bus 24".into(),
            position: Coordinates::new(lat, lon),
            timestamp: Utc::now(),
            speed,
            bearing: None,
            is_wheelchair_accessible: false,
            is_bike_accessible: false,
        }
    }

    fn station(id: &str, lat: f64, lon: f64) -> Station {
        Station {
            id: id.into(),
            name: format!("Station {id}"),
            coordinates: Coordinates::new(lat, lon),
            is_favorite: false,
            route_ids: None,
        }
    }

    fn stop_time(stop_id: &str, sequence: u32, arrival: Option<i32>) -> StopTime {
        StopTime {
            trip_id: "t1".into(),
            stop_id: stop_id.into(),
            arrival_time: arrival,
            departure_time: arrival,
            sequence,
            pickup: true,
            drop_off: true,
        }
    }

    // Three stops roughly 550m apart along a north-south line.
    fn fixture() -> (Vec<Station>, Vec<StopTime>) {
        let stations = vec![
            station("a", 46.7600, 23.6236),
            station("b", 46.7650, 23.6236),
            station("c", 46.7700, 23.6236),
        ];
        let stops = vec![
            stop_time("a", 1, Some(8 * 3600)),
            stop_time("b", 2, Some(8 * 3600 + 300)),
            stop_time("c", 3, Some(8 * 3600 + 600)),
        ];
        (stations, stops)
    }

    fn index(stations: &[Station]) -> HashMap<&str, &Station> {
        stations.iter().map(|s| (s.id.as_str(), s)).collect()
    }

    #[test]
    fn test_at_station_when_snapped_to_next_stop() {
        let (stations, stops) = fixture();
        let idx = index(&stations);
        // Vehicle within meters of stop "b", targeting "b"
        let v = vehicle(46.76501, 23.6236, Some(0.0));
        let analysis = analyze_direction(&v, &stops, &idx, &stations[1], 150.0);
        assert_eq!(analysis.direction, TravelDirection::AtStation);
        assert_eq!(analysis.estimated_minutes, 0);
        assert_eq!(analysis.confidence, Confidence::High);
    }

    #[test]
    fn test_arriving_with_schedule_minutes() {
        let (stations, stops) = fixture();
        let idx = index(&stations);
        // Vehicle at stop "a", targeting "c": schedule delta is 600s = 10min
        let v = vehicle(46.7600, 23.6236, Some(8.0));
        let analysis = analyze_direction(&v, &stops, &idx, &stations[2], 150.0);
        assert_eq!(analysis.direction, TravelDirection::Arriving);
        assert_eq!(analysis.estimated_minutes, 10);
        assert_eq!(analysis.confidence, Confidence::High);
    }

    #[test]
    fn test_departing_clamps_to_zero_minutes() {
        let (stations, stops) = fixture();
        let idx = index(&stations);
        // Vehicle at stop "c", targeting "a" (behind it)
        let v = vehicle(46.7700, 23.6236, Some(8.0));
        let analysis = analyze_direction(&v, &stops, &idx, &stations[0], 150.0);
        assert_eq!(analysis.direction, TravelDirection::Departing);
        assert_eq!(analysis.estimated_minutes, 0);
    }

    #[test]
    fn test_unknown_without_trip_data() {
        let (stations, _) = fixture();
        let idx = index(&stations);
        let v = vehicle(46.7600, 23.6236, Some(8.0));
        let analysis = analyze_direction(&v, &[], &idx, &stations[2], 150.0);
        assert_eq!(analysis.direction, TravelDirection::Unknown);
        assert!(analysis.stop_sequence.is_none());
        // Distance/speed estimate still produced: ~1.1km at 8 m/s ≈ 2min
        assert_eq!(analysis.confidence, Confidence::Medium);
        assert!(analysis.estimated_minutes >= 1 && analysis.estimated_minutes <= 3);
    }

    #[test]
    fn test_zero_speed_falls_back_to_assumed_speed() {
        let (stations, _) = fixture();
        let idx = index(&stations);
        let v = vehicle(46.7600, 23.6236, Some(0.0));
        let analysis = analyze_direction(&v, &[], &idx, &stations[2], 150.0);
        assert_eq!(analysis.confidence, Confidence::Low);
        // ~1.1km at 5 m/s ≈ 3.7min, floored
        assert!(analysis.estimated_minutes >= 2 && analysis.estimated_minutes <= 4);
    }

    #[test]
    fn test_arriving_without_schedule_uses_distance() {
        let (stations, mut stops) = fixture();
        for st in &mut stops {
            st.arrival_time = None;
            st.departure_time = None;
        }
        let idx = index(&stations);
        let v = vehicle(46.7600, 23.6236, Some(10.0));
        let analysis = analyze_direction(&v, &stops, &idx, &stations[2], 150.0);
        assert_eq!(analysis.direction, TravelDirection::Arriving);
        assert_eq!(analysis.confidence, Confidence::Medium);
    }

    #[test]
    fn test_stop_sequence_flags() {
        let (stations, stops) = fixture();
        let idx = index(&stations);
        let v = vehicle(46.7600, 23.6236, Some(8.0));
        let analysis = analyze_direction(&v, &stops, &idx, &stations[2], 150.0);

        let sequence = analysis.stop_sequence.unwrap();
        assert_eq!(sequence.len(), 3);
        assert!(sequence[0].is_current);
        assert!(!sequence[0].is_destination);
        assert!(!sequence[1].is_current);
        assert!(sequence[2].is_destination);
        assert_eq!(sequence[1].stop_name, "Station b");
        assert_eq!(sequence[0].sequence, 1);
    }

    #[test]
    fn test_target_not_on_trip_is_unknown() {
        let (stations, stops) = fixture();
        let idx = index(&stations);
        let elsewhere = station("x", 46.7800, 23.6236);
        let v = vehicle(46.7600, 23.6236, Some(8.0));
        let analysis = analyze_direction(&v, &stops, &idx, &elsewhere, 150.0);
        assert_eq!(analysis.direction, TravelDirection::Unknown);
    }

    #[test]
    fn test_invalid_vehicle_position_degrades() {
        let (stations, stops) = fixture();
        let idx = index(&stations);
        let v = vehicle(f64::NAN, 23.6236, Some(8.0));
        let analysis = analyze_direction(&v, &stops, &idx, &stations[2], 150.0);
        assert_eq!(analysis.direction, TravelDirection::Unknown);
        assert_eq!(analysis.estimated_minutes, 0);
    }

    #[test]
    fn test_pure_and_repeatable() {
        let (stations, stops) = fixture();
        let idx = index(&stations);
        let v = vehicle(46.7600, 23.6236, Some(8.0));
        let a = analyze_direction(&v, &stops, &idx, &stations[2], 150.0);
        let b = analyze_direction(&v, &stops, &idx, &stations[2], 150.0);
        assert_eq!(a, b);
    }
}
