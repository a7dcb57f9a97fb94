use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::gating::FixQuality;
use crate::sensor_fusion::SensorFusion;
use crate::types::GeoPoint;

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    pub accel_samples: u64,
    pub gps_fixes: u64,
    pub gps_rejected: u64,
    pub covariance_resets: u64,
    // Fused estimate (None until the first accepted fix)
    pub fused_lat: Option<f64>,
    pub fused_lon: Option<f64>,
    pub local_x: f64,
    pub local_y: f64,
    pub speed: f64,
    pub uncertainty_m: f64,
    // Last raw GPS
    pub last_hdop: Option<f64>,
    pub last_fix_quality: Option<FixQuality>,
    pub distance_to_target_m: Option<f64>,
}

impl LiveStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            ..Self::default()
        }
    }

    /// Status as of now for `fusion`, measuring range to `target` when given.
    pub fn from_fusion(
        fusion: &SensorFusion,
        uptime_seconds: u64,
        last_hdop: Option<f64>,
        target: Option<GeoPoint>,
    ) -> Self {
        let snap = fusion.snapshot();
        let fused = fusion.fused_position();

        Self {
            timestamp: current_timestamp(),
            uptime_seconds,
            accel_samples: snap.accel_samples,
            gps_fixes: snap.gps_fixes,
            gps_rejected: snap.gps_rejected,
            covariance_resets: snap.covariance_resets,
            fused_lat: fused.map(|p| p.lat),
            fused_lon: fused.map(|p| p.lon),
            local_x: snap.state.x,
            local_y: snap.state.y,
            speed: snap.ekf.speed,
            uncertainty_m: snap.ekf.uncertainty_m,
            last_hdop,
            last_fix_quality: snap.last_fix_quality,
            distance_to_target_m: target.and_then(|t| fusion.distance_to(t)),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
