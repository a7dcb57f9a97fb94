//! GPS fix quality classification and the update gate.
//!
//! The filter itself accepts any fix it is given; deciding whether a fix is
//! good enough to fuse happens here, before `update_fix` is called.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::FusionConfig;
use crate::types::GpsData;

/// HDOP at or below this counts as a high accuracy fix
pub const HIGH_ACCURACY_HDOP: f64 = 1.5;

/// NMEA GGA quality value for a differential fix
const DGPS_FIX_QUALITY: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixQuality {
    NoFix,
    Differential,
    High,
    Low,
}

impl FixQuality {
    pub fn classify(gps: &GpsData) -> Self {
        if !gps.fix {
            FixQuality::NoFix
        } else if gps.fix_quality == DGPS_FIX_QUALITY {
            FixQuality::Differential
        } else if gps.hdop <= HIGH_ACCURACY_HDOP {
            FixQuality::High
        } else {
            FixQuality::Low
        }
    }
}

/// Why a fix was kept away from the filter.
#[derive(Error, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum GateReject {
    #[error("no fix")]
    NoFix,

    #[error("HDOP {hdop:.1} outside (0, {limit:.1}]")]
    Hdop { hdop: f64, limit: f64 },

    #[error("{count} satellites, need {required}")]
    Satellites { count: u8, required: u8 },

    #[error("non-finite coordinates")]
    InvalidCoordinates,
}

#[derive(Clone, Debug)]
pub struct FixGate {
    require_fix: bool,
    max_hdop: f64,
    min_satellites: u8,
}

impl FixGate {
    pub fn new(require_fix: bool, max_hdop: f64, min_satellites: u8) -> Self {
        Self {
            require_fix,
            max_hdop,
            min_satellites,
        }
    }

    pub fn from_config(config: &FusionConfig) -> Self {
        Self::new(config.require_fix, config.max_hdop, config.min_satellites)
    }

    pub fn check(&self, gps: &GpsData) -> Result<(), GateReject> {
        if !gps.latitude.is_finite() || !gps.longitude.is_finite() {
            return Err(GateReject::InvalidCoordinates);
        }
        if self.require_fix && FixQuality::classify(gps) == FixQuality::NoFix {
            return Err(GateReject::NoFix);
        }
        // A receiver reports HDOP 0 (or 99.9) before it has a solution
        if !(gps.hdop > 0.0 && gps.hdop <= self.max_hdop) {
            return Err(GateReject::Hdop {
                hdop: gps.hdop,
                limit: self.max_hdop,
            });
        }
        if gps.satellites < self.min_satellites {
            return Err(GateReject::Satellites {
                count: gps.satellites,
                required: self.min_satellites,
            });
        }
        Ok(())
    }
}

impl Default for FixGate {
    fn default() -> Self {
        Self::from_config(&FusionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(hdop: f64) -> GpsData {
        GpsData {
            timestamp: 1.0,
            latitude: -25.873067,
            longitude: 28.204865,
            fix: true,
            fix_quality: 1,
            satellites: 8,
            hdop,
            speed_knots: 0.0,
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(FixQuality::classify(&fix(0.9)), FixQuality::High);
        assert_eq!(FixQuality::classify(&fix(1.5)), FixQuality::High);
        assert_eq!(FixQuality::classify(&fix(2.4)), FixQuality::Low);

        let dgps = GpsData { fix_quality: 2, ..fix(4.0) };
        assert_eq!(FixQuality::classify(&dgps), FixQuality::Differential);

        let lost = GpsData { fix: false, fix_quality: 2, ..fix(0.8) };
        assert_eq!(FixQuality::classify(&lost), FixQuality::NoFix);
    }

    #[test]
    fn test_gate_accepts_good_fix() {
        let gate = FixGate::default();
        assert!(gate.check(&fix(1.2)).is_ok());
        assert!(gate.check(&fix(3.0)).is_ok());
    }

    #[test]
    fn test_gate_rejects_high_and_zero_hdop() {
        let gate = FixGate::default();
        assert!(matches!(gate.check(&fix(3.1)), Err(GateReject::Hdop { .. })));
        assert!(matches!(gate.check(&fix(0.0)), Err(GateReject::Hdop { .. })));
        assert!(matches!(gate.check(&fix(f64::NAN)), Err(GateReject::Hdop { .. })));
    }

    #[test]
    fn test_gate_rejects_no_fix_unless_disabled() {
        let lost = GpsData { fix: false, ..fix(1.0) };
        assert_eq!(FixGate::default().check(&lost), Err(GateReject::NoFix));
        assert!(FixGate::new(false, 3.0, 0).check(&lost).is_ok());
    }

    #[test]
    fn test_gate_satellite_floor() {
        let gate = FixGate::new(true, 3.0, 6);
        let sparse = GpsData { satellites: 4, ..fix(1.0) };
        assert_eq!(
            gate.check(&sparse),
            Err(GateReject::Satellites { count: 4, required: 6 })
        );
    }

    #[test]
    fn test_gate_rejects_nan_coordinates() {
        let broken = GpsData { latitude: f64::NAN, ..fix(1.0) };
        assert_eq!(FixGate::default().check(&broken), Err(GateReject::InvalidCoordinates));
    }

    #[test]
    fn test_reject_display() {
        let reason = GateReject::Hdop { hdop: 4.3, limit: 3.0 };
        assert_eq!(reason.to_string(), "HDOP 4.3 outside (0, 3.0]");
    }

    #[test]
    fn test_reject_is_std_error() {
        let reasons: Vec<Box<dyn std::error::Error>> = vec![
            Box::new(GateReject::NoFix),
            Box::new(GateReject::Satellites { count: 3, required: 5 }),
            Box::new(GateReject::InvalidCoordinates),
        ];
        let messages: Vec<String> = reasons.iter().map(|e| e.to_string()).collect();
        assert_eq!(
            messages,
            vec!["no fix", "3 satellites, need 5", "non-finite coordinates"]
        );
    }
}
