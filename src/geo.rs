//! Coordinate validation and great-circle distance.
//!
//! Everything downstream (station selection, vehicle grouping, direction
//! analysis) measures distances through this module, so all callers see the
//! same Earth radius and the same validation rules.

use crate::models::Coordinates;
use thiserror::Error;

/// Mean Earth radius in meters, used consistently for all haversine math.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("invalid coordinates: lat={latitude}, lon={longitude}")]
    InvalidCoordinates { latitude: f64, longitude: f64 },
}

/// Check that a coordinate pair is finite and inside the closed
/// lat ∈ [-90, 90], lon ∈ [-180, 180] box. Pure predicate, never errors.
pub fn validate_coordinates(coords: &Coordinates) -> bool {
    coords.latitude.is_finite()
        && coords.longitude.is_finite()
        && (-90.0..=90.0).contains(&coords.latitude)
        && (-180.0..=180.0).contains(&coords.longitude)
}

/// Haversine distance in meters between two validated coordinate pairs.
///
/// Symmetric within floating-point tolerance and exactly zero for identical
/// points. Callers that cannot tolerate an error must validate first.
pub fn distance_meters(a: &Coordinates, b: &Coordinates) -> Result<f64, GeoError> {
    for c in [a, b] {
        if !validate_coordinates(c) {
            return Err(GeoError::InvalidCoordinates {
                latitude: c.latitude,
                longitude: c.longitude,
            });
        }
    }

    let lat1_rad = a.latitude.to_radians();
    let lat2_rad = b.latitude.to_radians();
    let delta_lat = (b.latitude - a.latitude).to_radians();
    let delta_lon = (b.longitude - a.longitude).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().asin();

    Ok(EARTH_RADIUS_M * c)
}
