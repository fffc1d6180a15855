//! Servo drivers
//!
//! # Available Drivers
//!
//! - `Pca9685` - 16-channel PWM engine (any I2C backend)
//! - `ServoKit` - Positional servos on PCA9685 channels

mod pca9685;

pub use pca9685::{
    frequency_for, prescale_for, Channel, ChannelWrite, Pca9685, Pca9685Config, PwmTicks,
    CHANNEL_COUNT, DEFAULT_ADDRESS,
};

use hatkit_core::device::Device;
use hatkit_core::driver::DriverStatus;
use hatkit_core::error::{HatError, HatResult};

use crate::drivers::bus::SharedI2c;

/// Pulse range and travel of one servo model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServoProfile {
    /// Pulse width at 0 degrees
    pub min_pulse_us: f64,
    /// Pulse width at `actuation_range`
    pub max_pulse_us: f64,
    /// Full travel in degrees
    pub actuation_range: f64,
}

impl Default for ServoProfile {
    fn default() -> Self {
        Self {
            min_pulse_us: 750.0,
            max_pulse_us: 2250.0,
            actuation_range: 180.0,
        }
    }
}

impl ServoProfile {
    /// Pulse width for `angle`
    pub fn pulse_us(&self, angle: f64) -> HatResult<f64> {
        if !(0.0..=self.actuation_range).contains(&angle) {
            return Err(HatError::invalid_input(format!(
                "angle {} not in [0, {}]",
                angle, self.actuation_range
            )));
        }
        Ok(self.min_pulse_us + (self.max_pulse_us - self.min_pulse_us) * angle / self.actuation_range)
    }
}

/// Positional servos driven by a PCA9685
pub struct ServoKit {
    pca: Pca9685,
    profiles: [ServoProfile; CHANNEL_COUNT as usize],
    angles: [Option<f64>; CHANNEL_COUNT as usize],
}

impl ServoKit {
    pub fn new(config: Pca9685Config) -> Self {
        Self::from_engine(Pca9685::new(config))
    }

    pub fn with_bus(bus: SharedI2c, config: Pca9685Config) -> Self {
        Self::from_engine(Pca9685::with_bus(bus, config))
    }

    fn from_engine(pca: Pca9685) -> Self {
        Self {
            pca,
            profiles: [ServoProfile::default(); CHANNEL_COUNT as usize],
            angles: [None; CHANNEL_COUNT as usize],
        }
    }

    fn index(channel: u8) -> HatResult<usize> {
        if channel < CHANNEL_COUNT {
            Ok(channel as usize)
        } else {
            Err(HatError::invalid_input(format!("servo channel {} not in 0..16", channel)))
        }
    }

    pub fn set_profile(&mut self, channel: u8, profile: ServoProfile) -> HatResult<()> {
        self.profiles[Self::index(channel)?] = profile;
        Ok(())
    }

    /// Move a servo; the duty is computed against the engine's real frequency
    pub fn set_angle(&mut self, channel: u8, angle: f64) -> HatResult<()> {
        let idx = Self::index(channel)?;
        let pulse_us = self.profiles[idx].pulse_us(angle)?;
        let period_us = 1e6 / self.pca.frequency();
        self.pca.write(channel, (pulse_us / period_us).min(1.0))?;
        self.angles[idx] = Some(angle);
        Ok(())
    }

    /// Last commanded angle, `None` when released
    pub fn angle(&self, channel: u8) -> Option<f64> {
        Self::index(channel).ok().and_then(|i| self.angles[i])
    }

    /// Stop driving a servo so it can be moved by hand
    pub fn release(&mut self, channel: u8) -> HatResult<()> {
        let idx = Self::index(channel)?;
        self.pca.write(channel, 0.0)?;
        self.angles[idx] = None;
        Ok(())
    }

    pub fn engine(&mut self) -> &mut Pca9685 {
        &mut self.pca
    }
}

impl Device for ServoKit {
    fn name(&self) -> &str {
        "servo_kit"
    }

    fn start(&mut self) -> HatResult<()> {
        self.pca.start()
    }

    fn stop(&mut self) -> HatResult<()> {
        self.angles = [None; CHANNEL_COUNT as usize];
        self.pca.stop()
    }

    fn status(&self) -> DriverStatus {
        self.pca.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::bus::{shared_i2c, RegisterMap, SimulationI2cDriver};

    #[test]
    fn test_angle_to_pulse() {
        let profile = ServoProfile::default();
        assert_eq!(profile.pulse_us(0.0).unwrap(), 750.0);
        assert_eq!(profile.pulse_us(90.0).unwrap(), 1500.0);
        assert_eq!(profile.pulse_us(180.0).unwrap(), 2250.0);
        assert!(profile.pulse_us(181.0).is_err());
    }

    #[test]
    fn test_center_servo() {
        let chip = RegisterMap::new();
        let bus = shared_i2c(SimulationI2cDriver::new(1).with_device(DEFAULT_ADDRESS, chip.clone()));
        let mut kit = ServoKit::with_bus(bus, Pca9685Config::default());
        kit.start().unwrap();

        kit.set_angle(3, 90.0).unwrap();
        assert_eq!(kit.angle(3), Some(90.0));

        let ticks = kit.engine().read_ticks(3u8).unwrap();
        // 1.5 ms of a ~20 ms period
        let expected = 1500.0 / (1e6 / frequency_for(prescale_for(50.0))) * 4096.0;
        assert_eq!(ticks.active_ticks(), expected.round() as u16);

        kit.release(3).unwrap();
        assert_eq!(kit.angle(3), None);
        kit.stop().unwrap();
    }
}
