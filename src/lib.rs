pub mod config;
pub mod error;
pub mod filters;
pub mod gating;
pub mod geodesy;
pub mod live_status;
pub mod sensor_fusion;
pub mod sensors;
pub mod types;
