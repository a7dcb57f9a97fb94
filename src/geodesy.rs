//! Flat-Earth helpers for the local tangent frame.
//!
//! Positions are kept in meters east/north of a reference point using an
//! equirectangular approximation, which is accurate to well under a meter
//! over the few kilometers a single track covers.

use crate::types::GeoPoint;

/// WGS-84 semi-major axis. Used for the projection, its inverse and haversine
/// so that fused positions and derived distances share one radius.
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Convert lat/lon to local meters (east, north) relative to `origin`.
pub fn latlon_to_meters(lat: f64, lon: f64, origin: GeoPoint) -> (f64, f64) {
    let d_lat = (lat - origin.lat).to_radians();
    let d_lon = (lon - origin.lon).to_radians();
    let x = EARTH_RADIUS_M * d_lon * origin.lat.to_radians().cos();
    let y = EARTH_RADIUS_M * d_lat;
    (x, y)
}

/// Inverse of [`latlon_to_meters`].
pub fn meters_to_latlon(x: f64, y: f64, origin: GeoPoint) -> GeoPoint {
    let d_lat = y / EARTH_RADIUS_M;
    let d_lon = x / (EARTH_RADIUS_M * origin.lat.to_radians().cos());
    GeoPoint {
        lat: origin.lat + d_lat.to_degrees(),
        lon: origin.lon + d_lon.to_degrees(),
    }
}

/// Great-circle distance in meters.
pub fn haversine_distance(a: GeoPoint, b: GeoPoint) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).max(0.0).sqrt());
    EARTH_RADIUS_M * c
}
