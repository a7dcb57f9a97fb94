pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

/// Horizontal specific force in the local tangent frame, bias already removed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccelData {
    pub timestamp: f64,
    /// East (m/s²)
    pub x: f64,
    /// North (m/s²)
    pub y: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GpsData {
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub fix: bool,
    /// NMEA GGA quality (0 = invalid, 1 = GPS, 2 = DGPS)
    pub fix_quality: u8,
    pub satellites: u8,
    pub hdop: f64,
    pub speed_knots: f64,
}

/// A geodetic coordinate in degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}
