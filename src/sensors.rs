//! Simulated sensor sources for the live tracker.
//!
//! Receiver parsing and IMU register access belong to the hardware drivers;
//! these tasks stand in for them and emit samples on a synthetic walk
//! (steady 1.4 m/s north, gentle east-west sway) so the whole pipeline can
//! run on a desk.

use log::{debug, info, warn};
use std::f64::consts::PI;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tokio::time::{interval, Duration};

use crate::geodesy::meters_to_latlon;
use crate::live_status::current_timestamp;
use crate::types::{AccelData, GeoPoint, GpsData};

pub const MOCK_ORIGIN: GeoPoint = GeoPoint {
    lat: -25.873067,
    lon: 28.204865,
};

const WALK_SPEED: f64 = 1.4; // m/s north
const SWAY_AMPLITUDE: f64 = 3.0; // m east
const SWAY_PERIOD: f64 = 20.0; // s

const MPS_TO_KNOTS: f64 = 1.943_844;

/// Ground-truth position (east, north) in meters after `t` seconds.
pub fn mock_truth(t: f64) -> (f64, f64) {
    let w = 2.0 * PI / SWAY_PERIOD;
    (SWAY_AMPLITUDE * (1.0 - (w * t).cos()), WALK_SPEED * t)
}

pub fn mock_accel_data(t: f64, timestamp: f64) -> AccelData {
    let w = 2.0 * PI / SWAY_PERIOD;
    // Small deterministic vibration on top of the true acceleration
    let vibration = 0.05 * (t * 2.0 * PI * 7.0).sin();
    AccelData {
        timestamp,
        x: SWAY_AMPLITUDE * w * w * (w * t).cos() + vibration,
        y: vibration * 0.5,
    }
}

pub fn mock_gps_data(t: f64, timestamp: f64) -> GpsData {
    let (east, north) = mock_truth(t);
    let jitter_e = 1.5 * (t * 0.7).sin() * (t * 1.3).cos();
    let jitter_n = 1.5 * (t * 0.9).cos() * (t * 0.4).sin();
    let reported = meters_to_latlon(east + jitter_e, north + jitter_n, MOCK_ORIGIN);
    let hdop = 1.2 + 1.1 * (t * 0.05).sin().abs() + 0.9 * (t * 0.31).sin().max(0.0);

    GpsData {
        timestamp,
        latitude: reported.lat,
        longitude: reported.lon,
        fix: true,
        fix_quality: 1,
        satellites: 9,
        hdop,
        speed_knots: WALK_SPEED * MPS_TO_KNOTS,
    }
}

pub async fn accel_loop(tx: Sender<AccelData>, rate_hz: f64, start: f64) {
    let mut interval = interval(Duration::from_secs_f64(1.0 / rate_hz));
    let mut sample_count = 0u64;

    loop {
        interval.tick().await;
        let now = current_timestamp();

        match tx.try_send(mock_accel_data(now - start, now)) {
            Ok(_) => {
                sample_count += 1;
                if sample_count % 500 == 0 {
                    debug!("[accel] {} samples", sample_count);
                }
            }
            Err(TrySendError::Closed(_)) => {
                info!("[accel] Channel closed after {} samples", sample_count);
                break;
            }
            Err(TrySendError::Full(_)) => {
                warn!("[accel] Channel full, dropping sample");
            }
        }
    }
}

pub async fn gps_loop(tx: Sender<GpsData>, rate_hz: f64, start: f64) {
    let mut interval = interval(Duration::from_secs_f64(1.0 / rate_hz));
    let mut sample_count = 0u64;

    loop {
        interval.tick().await;
        let now = current_timestamp();

        match tx.try_send(mock_gps_data(now - start, now)) {
            Ok(_) => {
                sample_count += 1;
                debug!("[gps] {} fixes", sample_count);
            }
            Err(TrySendError::Closed(_)) => {
                info!("[gps] Channel closed after {} fixes", sample_count);
                break;
            }
            Err(TrySendError::Full(_)) => {
                warn!("[gps] Channel full, dropping fix");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FusionConfig;
    use crate::geodesy::latlon_to_meters;
    use crate::sensor_fusion::SensorFusion;
    use tokio::sync::mpsc;

    #[test]
    fn test_truth_starts_at_origin() {
        assert_eq!(mock_truth(0.0), (0.0, 0.0));
    }

    #[test]
    fn test_gps_stays_near_truth() {
        for i in 0..100 {
            let t = i as f64 * 0.7;
            let gps = mock_gps_data(t, t);
            let (east, north) = latlon_to_meters(gps.latitude, gps.longitude, MOCK_ORIGIN);
            let (te, tn) = mock_truth(t);
            assert!((east - te).hypot(north - tn) < 2.2);
            assert!(gps.hdop > 0.0 && gps.hdop < 3.3);
        }
    }

    #[test]
    fn test_mock_walk_is_tracked() {
        let mut fusion = SensorFusion::new(FusionConfig::default());
        for step in 0..=6000u32 {
            let t = step as f64 * 0.01;
            fusion.feed_accel(&mock_accel_data(t, t));
            if step % 20 == 0 {
                fusion.feed_gps(&mock_gps_data(t, t));
            }
        }

        let fused = fusion.fused_position().unwrap();
        let origin = fusion.ekf().origin().unwrap();
        let (east, north) = latlon_to_meters(fused.lat, fused.lon, origin);
        let (te, tn) = mock_truth(60.0);
        assert!((east - te).hypot(north - tn) < 3.0);
    }

    #[tokio::test]
    async fn test_loops_stop_when_receiver_dropped() {
        let (tx, mut rx) = mpsc::channel::<AccelData>(4);
        let handle = tokio::spawn(accel_loop(tx, 200.0, current_timestamp()));

        let first = rx.recv().await.unwrap();
        assert!(first.timestamp > 0.0);
        drop(rx);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
