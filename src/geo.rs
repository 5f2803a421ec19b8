//! Great-circle distance and zone containment.

use crate::error::{FieldError, FieldResult};
use crate::types::{Coord, Zone};

/// Mean earth radius used by the spherical approximation.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Reject NaN/infinite coordinates.
pub fn validate(coord: Coord) -> FieldResult<Coord> {
    if coord.lat.is_finite() && coord.lng.is_finite() {
        Ok(coord)
    } else {
        Err(FieldError::InvalidCoordinate {
            lat: coord.lat,
            lng: coord.lng,
        })
    }
}

/// Haversine distance in meters.
pub fn distance_meters(a: Coord, b: Coord) -> FieldResult<f64> {
    validate(a)?;
    validate(b)?;

    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    // Rounding can push h a hair past 1.0 for antipodal points.
    let c = 2.0 * h.clamp(0.0, 1.0).sqrt().asin();

    Ok(EARTH_RADIUS_METERS * c)
}

/// Whether `point` lies within the zone radius plus `buffer_meters`.
pub fn is_contained(point: Coord, zone: &Zone, buffer_meters: f64) -> FieldResult<bool> {
    let distance = distance_meters(point, zone.center)?;
    Ok(distance <= zone.radius_meters + buffer_meters)
}

/// Point `meters` due north of `origin`. Used for fixtures and the CLI.
pub fn offset_north(origin: Coord, meters: f64) -> Coord {
    let d_lat = (meters / EARTH_RADIUS_METERS).to_degrees();
    Coord::new(origin.lat + d_lat, origin.lng)
}
