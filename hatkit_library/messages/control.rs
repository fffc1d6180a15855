use serde::{Deserialize, Serialize};

use super::sensor::stamp_now;

/// Signed per-wheel command, each side in `[-1, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DifferentialDriveCommand {
    pub stamp_nanos: u64,
    pub left: f64,
    pub right: f64,
}

impl DifferentialDriveCommand {
    pub fn new(left: f64, right: f64) -> Self {
        Self {
            stamp_nanos: stamp_now(),
            left,
            right,
        }
    }

    pub fn stop() -> Self {
        Self::new(0.0, 0.0)
    }
}

/// PID gains with an integral clamp
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Anti-windup bound W on the integral term
    pub integral_limit: f64,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 0.08,
            ki: 0.0,
            kd: 0.02,
            integral_limit: 1.0,
        }
    }
}
