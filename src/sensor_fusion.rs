// sensor_fusion.rs: pure computation layer for the position tracker
//
// Everything in this module is independent of:
//   - tokio / async runtime
//   - sensor drivers
//   - File I/O and status reporting
//
// It takes sensor samples in, produces state estimates and events out, so the
// live binary and the replay tool run exactly the same fusion logic.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::FusionConfig;
use crate::error::FusionError;
use crate::filters::{EkfSnapshot, EkfState, FixOutcome, PositionEkf};
use crate::gating::{FixGate, FixQuality, GateReject};
use crate::geodesy::haversine_distance;
use crate::types::{AccelData, GeoPoint, GpsData};

/// Consecutive non-increasing accel timestamps before the clock re-primes
pub const CLOCK_RESYNC_REJECTS: u32 = 10;

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FusionEvent {
    /// Clock (re-)anchored; no predict until the next sample gives a dt
    ClockPrimed { timestamp: f64 },
    TimestampRejected { timestamp: f64, previous: f64 },
    DtClamped { dt: f64, limit: f64 },
    GpsRejected { reason: GateReject },
    OriginSet { lat: f64, lon: f64 },
    FixApplied { innovation_m: f64 },
    UpdateSkipped { det: f64 },
    CovarianceReset,
}

// ─── Fusion output snapshot ──────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FusionSnapshot {
    pub state: EkfState,
    pub ekf: EkfSnapshot,
    pub accel_samples: u64,
    pub gps_fixes: u64,
    pub gps_rejected: u64,
    pub dt_clamps: u64,
    pub clock_resyncs: u64,
    pub covariance_resets: u64,
    pub last_fix_quality: Option<FixQuality>,
    pub last_gps_timestamp: Option<f64>,
}

// ─── The main fusion struct ──────────────────────────────────────────────────

pub struct SensorFusion {
    config: FusionConfig,
    ekf: PositionEkf,
    gate: FixGate,

    // Timestamp bookkeeping
    last_accel_ts: Option<f64>,
    /// Anchor before the last clamped gap, cleared by the next good sample
    pre_gap_ts: Option<f64>,
    consecutive_rejects: u32,
    last_gps_ts: Option<f64>,
    last_fix_quality: Option<FixQuality>,

    // Counters
    accel_samples: u64,
    gps_fixes: u64,
    gps_rejected: u64,
    dt_clamps: u64,
    clock_resyncs: u64,
    covariance_resets: u64,
}

impl SensorFusion {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            ekf: PositionEkf::from_config(&config),
            gate: FixGate::from_config(&config),
            last_accel_ts: None,
            pre_gap_ts: None,
            consecutive_rejects: 0,
            last_gps_ts: None,
            last_fix_quality: None,
            accel_samples: 0,
            gps_fixes: 0,
            gps_rejected: 0,
            dt_clamps: 0,
            clock_resyncs: 0,
            covariance_resets: 0,
            config,
        }
    }

    // ── Sensor feeds ─────────────────────────────────────────────────────

    /// Feed accelerometer sample (primary high-rate tick).
    ///
    /// Non-finite timestamps never touch the clock. After a clamped gap the
    /// clock remembers the anchor it jumped from, so a sample that lands
    /// between the two re-primes the clock instead of being dropped. A run
    /// of `CLOCK_RESYNC_REJECTS` non-increasing samples re-primes it too.
    pub fn feed_accel(&mut self, accel: &AccelData) -> Vec<FusionEvent> {
        let mut events = Vec::new();
        self.accel_samples += 1;
        let ts = accel.timestamp;

        if !ts.is_finite() {
            events.push(FusionEvent::TimestampRejected {
                timestamp: ts,
                previous: self.last_accel_ts.unwrap_or(f64::NAN),
            });
            return events;
        }

        let prev_ts = match self.last_accel_ts {
            Some(prev) => prev,
            None => {
                self.prime_clock(ts, &mut events);
                return events;
            }
        };

        let mut dt = ts - prev_ts;
        if dt <= 0.0 {
            // Sample falls back before a clamped jump: the jump was the outlier
            if let Some(before_gap) = self.pre_gap_ts {
                if ts > before_gap {
                    warn!(
                        "Accel timestamp {:.3} after jump to {:.3}, re-priming clock",
                        ts, prev_ts
                    );
                    self.clock_resyncs += 1;
                    self.prime_clock(ts, &mut events);
                    return events;
                }
            }

            self.consecutive_rejects += 1;
            if self.consecutive_rejects >= CLOCK_RESYNC_REJECTS {
                warn!(
                    "{} accel samples behind {:.3}, re-priming clock at {:.3}",
                    self.consecutive_rejects, prev_ts, ts
                );
                self.clock_resyncs += 1;
                self.prime_clock(ts, &mut events);
                return events;
            }
            events.push(FusionEvent::TimestampRejected {
                timestamp: ts,
                previous: prev_ts,
            });
            return events;
        }

        self.consecutive_rejects = 0;
        self.pre_gap_ts = None;
        if dt > self.config.max_dt {
            warn!(
                "Accel gap of {:.3}s, clamping dt to {:.3}s",
                dt, self.config.max_dt
            );
            events.push(FusionEvent::DtClamped {
                dt,
                limit: self.config.max_dt,
            });
            dt = self.config.max_dt;
            self.dt_clamps += 1;
            self.pre_gap_ts = Some(prev_ts);
        }
        self.last_accel_ts = Some(ts);

        self.ekf.predict(accel.x, accel.y, dt);
        events
    }

    fn prime_clock(&mut self, timestamp: f64, events: &mut Vec<FusionEvent>) {
        self.last_accel_ts = Some(timestamp);
        self.pre_gap_ts = None;
        self.consecutive_rejects = 0;
        events.push(FusionEvent::ClockPrimed { timestamp });
    }

    /// Feed a GPS fix. Fixes that fail the gate never reach the filter.
    pub fn feed_gps(&mut self, gps: &GpsData) -> Vec<FusionEvent> {
        let mut events = Vec::new();
        self.gps_fixes += 1;
        self.last_gps_ts = Some(gps.timestamp);
        self.last_fix_quality = Some(FixQuality::classify(gps));

        if let Err(reason) = self.gate.check(gps) {
            self.gps_rejected += 1;
            warn!("GPS fix at t={:.2} rejected: {}", gps.timestamp, reason);
            events.push(FusionEvent::GpsRejected { reason });
            return events;
        }

        match self.ekf.update_fix(gps.latitude, gps.longitude) {
            Ok(FixOutcome::OriginSet(origin)) => {
                events.push(FusionEvent::OriginSet {
                    lat: origin.lat,
                    lon: origin.lon,
                });
            }
            Ok(FixOutcome::Applied { innovation }) => {
                events.push(FusionEvent::FixApplied {
                    innovation_m: innovation.0.hypot(innovation.1),
                });
            }
            Err(FusionError::SingularInnovation { det }) => {
                events.push(FusionEvent::UpdateSkipped { det });
                self.reset_covariance();
                events.push(FusionEvent::CovarianceReset);
            }
            Err(e) => warn!("GPS update failed: {}", e),
        }
        events
    }

    /// Restore initial covariance, keeping state and origin.
    pub fn reset_covariance(&mut self) {
        self.ekf.init_covariance();
        self.covariance_resets += 1;
        info!("Covariance reset to initial values");
    }

    // ── Consumers ────────────────────────────────────────────────────────

    pub fn state(&self) -> EkfState {
        self.ekf.state()
    }

    pub fn fused_position(&self) -> Option<GeoPoint> {
        self.ekf.fused_geodetic()
    }

    /// Meters from the fused position to `target`, None before the first fix.
    pub fn distance_to(&self, target: GeoPoint) -> Option<f64> {
        self.fused_position()
            .map(|here| haversine_distance(here, target))
    }

    pub fn ekf(&self) -> &PositionEkf {
        &self.ekf
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn snapshot(&self) -> FusionSnapshot {
        FusionSnapshot {
            state: self.ekf.state(),
            ekf: self.ekf.snapshot(),
            accel_samples: self.accel_samples,
            gps_fixes: self.gps_fixes,
            gps_rejected: self.gps_rejected,
            dt_clamps: self.dt_clamps,
            clock_resyncs: self.clock_resyncs,
            covariance_resets: self.covariance_resets,
            last_fix_quality: self.last_fix_quality,
            last_gps_timestamp: self.last_gps_ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const LAT0: f64 = -25.88387;
    const LON0: f64 = 28.22328;

    fn accel(timestamp: f64, x: f64, y: f64) -> AccelData {
        AccelData { timestamp, x, y }
    }

    fn gps(timestamp: f64, latitude: f64, longitude: f64) -> GpsData {
        GpsData {
            timestamp,
            latitude,
            longitude,
            fix: true,
            fix_quality: 1,
            satellites: 9,
            hdop: 1.1,
            speed_knots: 0.0,
        }
    }

    #[test]
    fn test_first_accel_only_primes_clock() {
        let mut fusion = SensorFusion::new(FusionConfig::default());
        let events = fusion.feed_accel(&accel(10.0, 1.0, 0.0));

        assert_eq!(events, vec![FusionEvent::ClockPrimed { timestamp: 10.0 }]);
        assert_eq!(fusion.ekf().predict_count(), 0);
    }

    #[test]
    fn test_accel_dt_from_timestamps() {
        let mut fusion = SensorFusion::new(FusionConfig::default());
        fusion.feed_accel(&accel(10.0, 0.0, 0.0));
        let events = fusion.feed_accel(&accel(10.25, 2.0, 0.0));

        assert!(events.is_empty());
        let s = fusion.state();
        assert_abs_diff_eq!(s.x, 0.5 * 2.0 * 0.25 * 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(s.vx, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_large_gap_is_clamped() {
        let mut fusion = SensorFusion::new(FusionConfig::default());
        fusion.feed_accel(&accel(0.0, 0.0, 0.0));
        let events = fusion.feed_accel(&accel(30.0, 1.0, 0.0));

        assert_eq!(
            events,
            vec![FusionEvent::DtClamped { dt: 30.0, limit: 0.5 }]
        );
        assert_abs_diff_eq!(fusion.state().vx, 0.5, epsilon = 1e-12);
        assert_eq!(fusion.snapshot().dt_clamps, 1);
    }

    #[test]
    fn test_out_of_order_accel_is_dropped() {
        let mut fusion = SensorFusion::new(FusionConfig::default());
        fusion.feed_accel(&accel(5.0, 0.0, 0.0));
        fusion.feed_accel(&accel(5.1, 1.0, 0.0));
        let state_before = fusion.state();

        let events = fusion.feed_accel(&accel(5.05, 1.0, 0.0));
        assert!(matches!(events[0], FusionEvent::TimestampRejected { .. }));
        let events = fusion.feed_accel(&accel(5.1, 1.0, 0.0));
        assert!(matches!(events[0], FusionEvent::TimestampRejected { .. }));
        assert_eq!(fusion.state(), state_before);

        // Clock still anchored at 5.1
        fusion.feed_accel(&accel(5.2, 0.0, 0.0));
        assert_eq!(fusion.ekf().predict_count(), 2);
    }

    #[test]
    fn test_future_timestamp_glitch_recovers() {
        let mut fusion = SensorFusion::new(FusionConfig::default());
        fusion.feed_accel(&accel(0.0, 0.0, 0.0));
        let events = fusion.feed_accel(&accel(1e9, 0.0, 0.0));
        assert!(matches!(events[0], FusionEvent::DtClamped { .. }));
        assert_eq!(fusion.ekf().predict_count(), 1);

        let events = fusion.feed_accel(&accel(0.01, 0.0, 0.0));
        assert_eq!(events, vec![FusionEvent::ClockPrimed { timestamp: 0.01 }]);

        for i in 2..=1000u32 {
            let events = fusion.feed_accel(&accel(i as f64 * 0.01, 0.0, 0.0));
            assert!(events.is_empty(), "sample {} gave {:?}", i, events);
        }
        assert_eq!(fusion.ekf().predict_count(), 1000);
        assert_eq!(fusion.snapshot().clock_resyncs, 1);
    }

    #[test]
    fn test_genuine_gap_keeps_clock() {
        let mut fusion = SensorFusion::new(FusionConfig::default());
        fusion.feed_accel(&accel(0.0, 0.0, 0.0));
        fusion.feed_accel(&accel(3.0, 0.0, 0.0));
        let events = fusion.feed_accel(&accel(3.02, 0.0, 0.0));

        assert!(events.is_empty());
        assert_eq!(fusion.ekf().predict_count(), 2);
        assert_eq!(fusion.snapshot().clock_resyncs, 0);
    }

    #[test]
    fn test_nan_timestamp_never_primes_clock() {
        let mut fusion = SensorFusion::new(FusionConfig::default());
        let events = fusion.feed_accel(&accel(f64::NAN, 0.0, 0.0));
        assert!(matches!(events[0], FusionEvent::TimestampRejected { .. }));

        let events = fusion.feed_accel(&accel(0.01, 0.0, 0.0));
        assert_eq!(events, vec![FusionEvent::ClockPrimed { timestamp: 0.01 }]);
        for i in 2..=100u32 {
            fusion.feed_accel(&accel(i as f64 * 0.01, 0.0, 0.0));
        }
        assert_eq!(fusion.ekf().predict_count(), 99);

        // Mid-session NaN is dropped without moving the clock
        let events = fusion.feed_accel(&accel(f64::INFINITY, 0.0, 0.0));
        assert!(matches!(events[0], FusionEvent::TimestampRejected { .. }));
        assert!(fusion.feed_accel(&accel(1.01, 0.0, 0.0)).is_empty());
        assert_eq!(fusion.ekf().predict_count(), 100);
    }

    #[test]
    fn test_clock_stepping_back_resyncs_after_run() {
        let mut fusion = SensorFusion::new(FusionConfig::default());
        fusion.feed_accel(&accel(100.0, 0.0, 0.0));
        fusion.feed_accel(&accel(100.02, 0.0, 0.0));

        for i in 0..20u32 {
            let ts = 50.0 + i as f64 * 0.02;
            let events = fusion.feed_accel(&accel(ts, 0.0, 0.0));
            if i + 1 < CLOCK_RESYNC_REJECTS {
                assert!(matches!(events[0], FusionEvent::TimestampRejected { .. }));
            } else if i + 1 == CLOCK_RESYNC_REJECTS {
                assert_eq!(events, vec![FusionEvent::ClockPrimed { timestamp: ts }]);
            } else {
                assert!(events.is_empty());
            }
        }
        assert_eq!(fusion.ekf().predict_count(), 11);
        assert_eq!(fusion.snapshot().clock_resyncs, 1);
    }

    #[test]
    fn test_gated_fix_does_not_set_origin() {
        let mut fusion = SensorFusion::new(FusionConfig::default());
        let bad = GpsData { hdop: 8.0, ..gps(1.0, LAT0, LON0) };

        let events = fusion.feed_gps(&bad);
        assert!(matches!(events[0], FusionEvent::GpsRejected { .. }));
        assert!(fusion.fused_position().is_none());
        assert_eq!(fusion.snapshot().gps_rejected, 1);
        assert_eq!(fusion.snapshot().last_fix_quality, Some(FixQuality::Low));
    }

    #[test]
    fn test_origin_then_fix_applied() {
        let mut fusion = SensorFusion::new(FusionConfig::default());

        let events = fusion.feed_gps(&gps(1.0, LAT0, LON0));
        assert_eq!(events, vec![FusionEvent::OriginSet { lat: LAT0, lon: LON0 }]);

        let events = fusion.feed_gps(&gps(1.2, LAT0 + 0.0001, LON0));
        match events.as_slice() {
            [FusionEvent::FixApplied { innovation_m }] => {
                assert_abs_diff_eq!(*innovation_m, 11.13, epsilon = 0.01)
            }
            other => panic!("unexpected events {:?}", other),
        }
        assert!(fusion.state().y > 0.0);
    }

    #[test]
    fn test_distance_to_target() {
        let mut fusion = SensorFusion::new(FusionConfig::default());
        let pin = GeoPoint::new(LAT0 + 0.001, LON0);
        assert!(fusion.distance_to(pin).is_none());

        fusion.feed_gps(&gps(1.0, LAT0, LON0));
        let d = fusion.distance_to(pin).unwrap();
        // 0.001° of latitude on the WGS-84 sphere
        assert_abs_diff_eq!(d, 111.32, epsilon = 0.01);
    }

    #[test]
    fn test_singular_update_resets_covariance() {
        let config = FusionConfig {
            initial_position_var: 0.0,
            gps_noise_var: 0.0,
            ..FusionConfig::default()
        };
        let mut fusion = SensorFusion::new(config);
        fusion.feed_gps(&gps(1.0, LAT0, LON0));

        let events = fusion.feed_gps(&gps(1.2, LAT0 + 0.0001, LON0));
        assert_eq!(
            events,
            vec![
                FusionEvent::UpdateSkipped { det: 0.0 },
                FusionEvent::CovarianceReset
            ]
        );
        assert_eq!(fusion.snapshot().covariance_resets, 1);
        assert_eq!(fusion.ekf().origin(), Some(GeoPoint::new(LAT0, LON0)));
    }

    #[test]
    fn test_walk_north_tracks_fixes() {
        let mut fusion = SensorFusion::new(FusionConfig::default());
        let speed = 1.4; // m/s walking pace
        let deg_per_m = 1.0 / (crate::geodesy::EARTH_RADIUS_M * 1f64.to_radians());

        fusion.feed_gps(&gps(0.0, LAT0, LON0));
        for step in 0..=3000u32 {
            let t = step as f64 * 0.01;
            fusion.feed_accel(&accel(t, 0.0, 0.0));
            if step > 0 && step % 20 == 0 {
                fusion.feed_gps(&gps(t, LAT0 + speed * t * deg_per_m, LON0));
            }
        }

        let s = fusion.state();
        assert_abs_diff_eq!(s.y, speed * 30.0, epsilon = 1.0);
        assert_abs_diff_eq!(s.vy, speed, epsilon = 0.2);
        assert_abs_diff_eq!(s.x, 0.0, epsilon = 1e-6);

        let snap = fusion.snapshot();
        assert_eq!(snap.accel_samples, 3001);
        assert_eq!(snap.gps_fixes, 151);
        assert_eq!(snap.ekf.gps_updates, 150);
    }
}
