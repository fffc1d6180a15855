use serde::{Deserialize, Serialize};

/// Nanoseconds since the Unix epoch
pub fn stamp_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Distance reading from a rangefinder
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub stamp_nanos: u64,
    /// Distance in centimetres
    pub distance_cm: f64,
}

impl Range {
    pub fn new(distance_cm: f64) -> Self {
        Self {
            stamp_nanos: stamp_now(),
            distance_cm,
        }
    }
}

/// One IMU sample
///
/// Only the fields requested from the driver are populated.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Imu {
    pub stamp_nanos: u64,
    /// Acceleration in g
    pub accel: Option<[f64; 3]>,
    /// Angular rate in degrees per second
    pub gyro: Option<[f64; 3]>,
    /// Magnetic field in magnetometer counts
    pub mag: Option<[f64; 3]>,
    /// Die temperature in degrees Celsius
    pub temp_c: Option<f64>,
    /// The FIFO overflowed since the previous sample
    pub fifo_overflow: bool,
    /// The magnetometer reported a sensor overflow for this sample
    pub mag_overflow: bool,
}

impl Imu {
    /// Magnitude of the acceleration vector in g
    pub fn accel_magnitude(&self) -> Option<f64> {
        self.accel
            .map(|[x, y, z]| (x * x + y * y + z * z).sqrt())
    }
}

/// Environmental sensor reading
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Environment {
    pub stamp_nanos: u64,
    pub temperature_c: f64,
    pub pressure_pa: f64,
    /// Relative humidity in percent
    pub humidity_pct: f64,
}

/// Line sensor snapshot, one bit per channel (1 = line seen)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LineSample {
    pub stamp_nanos: u64,
    pub channels: [u8; 5],
}

impl LineSample {
    pub fn new(channels: [u8; 5]) -> Self {
        Self {
            stamp_nanos: stamp_now(),
            channels,
        }
    }

    pub fn active(&self) -> usize {
        self.channels.iter().filter(|&&c| c != 0).count()
    }
}

/// Wheel encoder state
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EncoderTicks {
    pub stamp_nanos: u64,
    pub ticks: u64,
    pub rpm: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accel_magnitude() {
        let imu = Imu {
            accel: Some([0.0, 0.6, 0.8]),
            ..Default::default()
        };
        assert!((imu.accel_magnitude().unwrap() - 1.0).abs() < 1e-12);
        assert_eq!(Imu::default().accel_magnitude(), None);
    }

    #[test]
    fn test_line_sample_active() {
        assert_eq!(LineSample::new([0, 1, 1, 0, 0]).active(), 2);
    }
}
