//! 4-Dimensional Position/Velocity Extended Kalman Filter
//!
//! State Vector (4D):
//! [0-1]: Position (X = East, Y = North) in the local tangent plane (meters)
//! [2-3]: Velocity (Vx, Vy) in the local tangent plane (m/s)
//!
//! Predict is driven by horizontal acceleration at IMU rate, update by
//! GPS lat/lon fixes. The first fix only latches the tangent-plane origin.
//!
//! All matrices are fixed-size and live on the stack; neither predict nor
//! update allocates.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::FusionConfig;
use crate::error::{FusionError, Result};
use crate::geodesy::{latlon_to_meters, meters_to_latlon};
use crate::types::{
    GeoPoint, GpsPosNoise, GpsPosVec, JacobianGpsPos, KalmanGainGpsPos, StateMat4, StateVec4,
    STATE_DIM,
};

/// |det(S)| at or below this is treated as singular
const MIN_INNOVATION_DET: f64 = 1e-10;

/// Read-only copy of the filter state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EkfState {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EkfSnapshot {
    pub position_local: (f64, f64),
    pub velocity_vector: (f64, f64),
    pub speed: f64,
    /// None until the first fix latches the origin
    pub position: Option<GeoPoint>,
    pub origin: Option<GeoPoint>,
    pub uncertainty_m: f64,
    pub covariance_trace: f64,
    pub predict_count: u64,
    pub gps_updates: u64,
    pub skipped_updates: u64,
}

/// Result of a successful `update_fix`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FixOutcome {
    /// First fix: origin latched, state and covariance untouched
    OriginSet(GeoPoint),
    /// Measurement applied; innovation in local meters (east, north)
    Applied { innovation: (f64, f64) },
}

pub struct PositionEkf {
    /// State vector [4D]
    state: StateVec4,

    /// Covariance matrix [4x4]
    covariance: StateMat4,

    /// Value `init_covariance` restores
    initial_covariance: StateMat4,

    /// Process noise matrix [4x4]
    process_noise: StateMat4,

    /// GPS measurement noise [2x2]
    r_gps: GpsPosNoise,

    /// Origin for local frame, set once by the first fix
    origin: Option<GeoPoint>,

    /// Update counters
    predict_count: u64,
    gps_update_count: u64,
    skipped_update_count: u64,
}

impl Default for PositionEkf {
    fn default() -> Self {
        Self::from_config(&FusionConfig::default())
    }
}

impl PositionEkf {
    pub fn new(
        initial_position_var: f64,
        initial_velocity_var: f64,
        process_noise_pos: f64,
        process_noise_vel: f64,
        gps_noise_var: f64,
    ) -> Self {
        let initial_covariance = StateMat4::from_diagonal(&StateVec4::new(
            initial_position_var,
            initial_position_var,
            initial_velocity_var,
            initial_velocity_var,
        ));
        let process_noise = StateMat4::from_diagonal(&StateVec4::new(
            process_noise_pos,
            process_noise_pos,
            process_noise_vel,
            process_noise_vel,
        ));
        let r_gps = GpsPosNoise::from_diagonal(&GpsPosVec::new(gps_noise_var, gps_noise_var));

        Self {
            state: StateVec4::zeros(),
            covariance: initial_covariance,
            initial_covariance,
            process_noise,
            r_gps,
            origin: None,
            predict_count: 0,
            gps_update_count: 0,
            skipped_update_count: 0,
        }
    }

    pub fn from_config(config: &FusionConfig) -> Self {
        Self::new(
            config.initial_position_var,
            config.initial_velocity_var,
            config.process_noise_pos,
            config.process_noise_vel,
            config.gps_noise_var,
        )
    }

    /// Reset covariance to its initial value. The origin is kept so the
    /// local frame stays valid.
    pub fn init_covariance(&mut self) {
        self.covariance = self.initial_covariance;
    }

    #[rustfmt::skip]
    fn build_jacobian(dt: f64) -> StateMat4 {
        StateMat4::new(
            1.0, 0.0, dt,  0.0,
            0.0, 1.0, 0.0, dt,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        )
    }

    #[rustfmt::skip]
    fn gps_measurement_jacobian() -> JacobianGpsPos {
        JacobianGpsPos::new(
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
        )
    }

    /// Constant-acceleration process model. `dt` is used as given; bounding
    /// it is the caller's job.
    pub fn predict(&mut self, ax: f64, ay: f64, dt: f64) {
        let dt2 = dt * dt;
        let x = self.state;
        self.state = StateVec4::new(
            x[0] + x[2] * dt + 0.5 * ax * dt2,
            x[1] + x[3] * dt + 0.5 * ay * dt2,
            x[2] + ax * dt,
            x[3] + ay * dt,
        );

        let f = Self::build_jacobian(dt);
        self.covariance = f * self.covariance * f.transpose() + self.process_noise;

        self.predict_count += 1;
    }

    /// Fuse a GPS fix (degrees). The first call latches the origin.
    ///
    /// A singular innovation covariance skips the update and leaves state and
    /// covariance untouched.
    pub fn update_fix(&mut self, latitude: f64, longitude: f64) -> Result<FixOutcome> {
        let origin = match self.origin {
            Some(origin) => origin,
            None => {
                let origin = GeoPoint::new(latitude, longitude);
                self.origin = Some(origin);
                info!(
                    "Local frame origin set at ({:.7}, {:.7})",
                    origin.lat, origin.lon
                );
                return Ok(FixOutcome::OriginSet(origin));
            }
        };

        let (x_meas, y_meas) = latlon_to_meters(latitude, longitude, origin);
        let z_meas = GpsPosVec::new(x_meas, y_meas);
        let z_pred = Self::gps_measurement_jacobian() * self.state;
        let innovation = z_meas - z_pred;

        let p = self.covariance;
        let r = self.r_gps;

        // S = H·P·Hᵀ + R; H picks the top-left 2×2 block of P
        let s00 = p[(0, 0)] + r[(0, 0)];
        let s01 = p[(0, 1)] + r[(0, 1)];
        let s10 = p[(1, 0)] + r[(1, 0)];
        let s11 = p[(1, 1)] + r[(1, 1)];
        let det = s00 * s11 - s01 * s10;
        if !det.is_finite() || det.abs() <= MIN_INNOVATION_DET {
            self.skipped_update_count += 1;
            warn!("Singular innovation covariance (det = {:e}), skipping GPS update", det);
            return Err(FusionError::SingularInnovation { det });
        }
        let s_inv = GpsPosNoise::new(s11 / det, -s01 / det, -s10 / det, s00 / det);

        // K = P·Hᵀ·S⁻¹; only columns 0–1 of P contribute
        let mut k = KalmanGainGpsPos::zeros();
        for i in 0..STATE_DIM {
            k[(i, 0)] = p[(i, 0)] * s_inv[(0, 0)] + p[(i, 1)] * s_inv[(1, 0)];
            k[(i, 1)] = p[(i, 0)] * s_inv[(0, 1)] + p[(i, 1)] * s_inv[(1, 1)];
        }

        self.state += k * innovation;

        // P = (I − K·H)·P, reduced for H = [I₂ 0]:
        //   rows 0-1: (I₂ − K_top)·P[0..2, :]
        //   rows 2-3: P[i, :] − K_i·P[0..2, :]
        let mut p_new = StateMat4::zeros();
        for i in 0..STATE_DIM {
            let ikh0 = if i == 0 { 1.0 - k[(i, 0)] } else { -k[(i, 0)] };
            let ikh1 = if i == 1 { 1.0 - k[(i, 1)] } else { -k[(i, 1)] };
            for j in 0..STATE_DIM {
                p_new[(i, j)] = if i < 2 {
                    ikh0 * p[(0, j)] + ikh1 * p[(1, j)]
                } else {
                    ikh0 * p[(0, j)] + ikh1 * p[(1, j)] + p[(i, j)]
                };
            }
        }
        self.covariance = p_new;

        self.gps_update_count += 1;
        debug!(
            "GPS update: innovation=({:.2}, {:.2}) m, pos=({:.2}, {:.2})",
            innovation[0], innovation[1], self.state[0], self.state[1]
        );

        Ok(FixOutcome::Applied {
            innovation: (innovation[0], innovation[1]),
        })
    }

    pub fn state(&self) -> EkfState {
        EkfState {
            x: self.state[0],
            y: self.state[1],
            vx: self.state[2],
            vy: self.state[3],
        }
    }

    /// Best-estimate lat/lon, or None while no origin exists.
    pub fn fused_geodetic(&self) -> Option<GeoPoint> {
        self.origin
            .map(|origin| meters_to_latlon(self.state[0], self.state[1], origin))
    }

    pub fn origin(&self) -> Option<GeoPoint> {
        self.origin
    }

    pub fn covariance(&self) -> StateMat4 {
        self.covariance
    }

    pub fn covariance_trace(&self) -> f64 {
        self.covariance.trace()
    }

    /// 1σ horizontal position uncertainty (meters)
    pub fn position_uncertainty_m(&self) -> f64 {
        ((self.covariance[(0, 0)] + self.covariance[(1, 1)]) / 2.0).sqrt()
    }

    pub fn speed(&self) -> f64 {
        self.state[2].hypot(self.state[3])
    }

    pub fn predict_count(&self) -> u64 {
        self.predict_count
    }

    pub fn gps_update_count(&self) -> u64 {
        self.gps_update_count
    }

    pub fn snapshot(&self) -> EkfSnapshot {
        EkfSnapshot {
            position_local: (self.state[0], self.state[1]),
            velocity_vector: (self.state[2], self.state[3]),
            speed: self.speed(),
            position: self.fused_geodetic(),
            origin: self.origin,
            uncertainty_m: self.position_uncertainty_m(),
            covariance_trace: self.covariance_trace(),
            predict_count: self.predict_count,
            gps_updates: self.gps_update_count,
            skipped_updates: self.skipped_update_count,
        }
    }
}
