//! Linear algebra type system for the position filter
//!
//! Fixed-size, stack-allocated aliases so every matrix operation in the
//! filter has its dimensions checked at compile time.

use nalgebra::{SMatrix, SVector};

// ===== State Dimensions =====
pub const STATE_DIM: usize = 4; // (x, y, vx, vy)

// ===== Measurement Dimensions =====
pub const MEASURE_DIM_GPS_POS: usize = 2; // (east, north)

// ===== State Types =====
pub type StateVec4 = SVector<f64, STATE_DIM>;
pub type StateMat4 = SMatrix<f64, STATE_DIM, STATE_DIM>;

// Measurement types
pub type GpsPosVec = SVector<f64, MEASURE_DIM_GPS_POS>;
pub type GpsPosNoise = SMatrix<f64, MEASURE_DIM_GPS_POS, MEASURE_DIM_GPS_POS>;

// Kalman gain types
pub type KalmanGainGpsPos = SMatrix<f64, STATE_DIM, MEASURE_DIM_GPS_POS>; // 4×2

// Jacobian types
pub type JacobianGpsPos = SMatrix<f64, MEASURE_DIM_GPS_POS, STATE_DIM>; // 2×4
