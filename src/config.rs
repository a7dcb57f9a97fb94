use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{FusionError, Result};

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    // ── Filter construction ──
    /// Initial position variance (m²)
    pub initial_position_var: f64,
    /// Initial velocity variance ((m/s)²)
    pub initial_velocity_var: f64,
    pub process_noise_pos: f64,
    pub process_noise_vel: f64,
    /// GPS position variance (m²), ~2 m σ
    pub gps_noise_var: f64,

    // ── Predict timing ──
    /// Largest dt handed to predict; longer gaps are clamped (seconds)
    pub max_dt: f64,

    // ── GPS gating ──
    pub require_fix: bool,
    pub max_hdop: f64,
    pub min_satellites: u8,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            initial_position_var: 10.0,
            initial_velocity_var: 1.0,
            process_noise_pos: 0.1,
            process_noise_vel: 0.1,
            gps_noise_var: 4.0,
            max_dt: 0.5,
            require_fix: true,
            max_hdop: 3.0,
            min_satellites: 0,
        }
    }
}

impl FusionConfig {
    /// Load overrides from a JSON file; missing keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: FusionConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let variances = [
            ("initial_position_var", self.initial_position_var),
            ("initial_velocity_var", self.initial_velocity_var),
            ("process_noise_pos", self.process_noise_pos),
            ("process_noise_vel", self.process_noise_vel),
            ("gps_noise_var", self.gps_noise_var),
        ];
        for (name, value) in variances {
            if !value.is_finite() || value < 0.0 {
                return Err(FusionError::Config(format!(
                    "{name} must be a finite non-negative variance, got {value}"
                )));
            }
        }
        if !self.max_dt.is_finite() || self.max_dt <= 0.0 {
            return Err(FusionError::Config(format!(
                "max_dt must be positive, got {}",
                self.max_dt
            )));
        }
        if self.max_hdop.is_nan() || self.max_hdop <= 0.0 {
            return Err(FusionError::Config(format!(
                "max_hdop must be positive, got {}",
                self.max_hdop
            )));
        }
        Ok(())
    }
}
