//! Two-channel DC motor controller (direction line + PWM magnitude)
//!
//! Each channel drives an H-bridge through one direction output and one
//! soft-PWM output. Commands are signed: the sign picks the direction, the
//! magnitude becomes the duty cycle.

use std::f64::consts::PI;

use hatkit_core::device::{Device, DeviceBase};
use hatkit_core::driver::{DriverStatus, InterfaceConfig};
use hatkit_core::error::{HatError, HatResult};

use crate::drivers::gpio::{Direction, SharedGpio};
use crate::drivers::GpioHandle;
use crate::messages::control::DifferentialDriveCommand;

#[derive(Debug, Clone)]
pub struct MotorChannel {
    pub direction_pin: String,
    pub pwm_pin: String,
    /// Swap forward/backward for a mirrored motor
    pub inverted: bool,
}

#[derive(Debug, Clone)]
pub struct MotorConfig {
    pub channels: [MotorChannel; 2],
    pub pwm_frequency_hz: f64,
    /// No-load speed at the rated voltage
    pub rated_rpm: f64,
    pub rated_voltage: f64,
    pub gpio: InterfaceConfig,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            channels: [
                MotorChannel {
                    direction_pin: "24".to_string(),
                    pwm_pin: "12".to_string(),
                    inverted: false,
                },
                MotorChannel {
                    direction_pin: "25".to_string(),
                    pwm_pin: "13".to_string(),
                    inverted: false,
                },
            ],
            pwm_frequency_hz: 1000.0,
            rated_rpm: 200.0,
            rated_voltage: 6.0,
            gpio: InterfaceConfig::default(),
        }
    }
}

impl MotorConfig {
    /// Back-EMF constant k = V / ω_max in V·s/rad
    pub fn velocity_constant(&self) -> f64 {
        self.rated_voltage / (2.0 * PI * self.rated_rpm / 60.0)
    }

    /// Duty cycle for a target speed
    pub fn duty_for_rpm(&self, rpm: f64) -> f64 {
        rpm / self.rated_rpm
    }
}

pub struct MotorController {
    base: DeviceBase<DifferentialDriveCommand>,
    config: MotorConfig,
    source: GpioHandle,
    gpio: Option<SharedGpio>,
}

impl MotorController {
    pub fn new(config: MotorConfig) -> Self {
        let source = GpioHandle::Owned(config.gpio.clone());
        Self::build(config, source)
    }

    pub fn with_gpio(gpio: SharedGpio, config: MotorConfig) -> Self {
        Self::build(config, GpioHandle::Borrowed(gpio))
    }

    fn build(config: MotorConfig, source: GpioHandle) -> Self {
        Self {
            base: DeviceBase::new("motor_controller"),
            config,
            source,
            gpio: None,
        }
    }

    pub fn config(&self) -> &MotorConfig {
        &self.config
    }

    /// Drive both channels
    ///
    /// With `rpm` false the values are signed duty cycles in `[-1, 1]`;
    /// with `rpm` true they are signed wheel speeds, converted through the
    /// rated speed. Magnitudes beyond full scale are clamped.
    pub fn write(&mut self, s1: f64, s2: f64, rpm: bool) -> HatResult<()> {
        let gpio = self
            .gpio
            .clone()
            .ok_or_else(|| HatError::driver("motor controller not started"))?;
        if !s1.is_finite() || !s2.is_finite() {
            return Err(HatError::invalid_input("motor command is not finite"));
        }
        let (s1, s2) = if rpm {
            (self.config.duty_for_rpm(s1), self.config.duty_for_rpm(s2))
        } else {
            (s1, s2)
        };
        let s1 = s1.clamp(-1.0, 1.0);
        let s2 = s2.clamp(-1.0, 1.0);

        {
            let mut gpio = gpio.lock();
            for (channel, speed) in self.config.channels.iter().zip([s1, s2]) {
                let forward = (speed >= 0.0) != channel.inverted;
                gpio.set_level(&channel.direction_pin, forward)?;
                gpio.write(&channel.pwm_pin, speed.abs())?;
            }
        }
        self.base.record(DifferentialDriveCommand::new(s1, s2));
        Ok(())
    }

    pub fn brake(&mut self) -> HatResult<()> {
        self.write(0.0, 0.0, false)
    }

    /// Last command sent, after conversion and clamping
    pub fn last_command(&self) -> Option<DifferentialDriveCommand> {
        self.base.buffer().latest()
    }

    fn configure(&self, gpio: &SharedGpio) -> HatResult<()> {
        let mut gpio = gpio.lock();
        for channel in &self.config.channels {
            gpio.configure(&channel.direction_pin, Direction::Output, None)?;
            gpio.configure(&channel.pwm_pin, Direction::Output, None)?;
            gpio.pwm_enable(&channel.pwm_pin, true)?;
            gpio.set_frequency(&channel.pwm_pin, self.config.pwm_frequency_hz)?;
            gpio.write(&channel.pwm_pin, 0.0)?;
        }
        Ok(())
    }
}

impl Device for MotorController {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn start(&mut self) -> HatResult<()> {
        if self.base.is_active() {
            return Ok(());
        }
        let gpio = self.source.acquire(&mut self.base, "gpio")?;
        if let Err(e) = self.configure(&gpio) {
            self.base.fail(&e);
            return Err(e);
        }
        self.gpio = Some(gpio);
        self.base.mark_ready();
        Ok(())
    }

    /// Brakes, then releases the PWM generators
    fn stop(&mut self) -> HatResult<()> {
        if let Some(gpio) = self.gpio.take() {
            let mut gpio = gpio.lock();
            for channel in &self.config.channels {
                let _ = gpio.write(&channel.pwm_pin, 0.0);
                let _ = gpio.pwm_enable(&channel.pwm_pin, false);
            }
        }
        self.base.release();
        Ok(())
    }

    fn status(&self) -> DriverStatus {
        self.base.status()
    }
}

impl Drop for MotorController {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::gpio::{shared_gpio, SimulationGpioDriver, SimulationGpioHandle};

    fn controller(config: MotorConfig) -> (MotorController, SimulationGpioHandle) {
        let driver = SimulationGpioDriver::new();
        let handle = driver.handle();
        let mut motors = MotorController::with_gpio(shared_gpio(driver), config);
        motors.start().unwrap();
        (motors, handle)
    }

    fn duty(handle: &SimulationGpioHandle, pin: &str) -> f64 {
        handle.pin_config(pin).unwrap().pwm.unwrap().duty
    }

    #[test]
    fn test_signed_duty() {
        let (mut motors, handle) = controller(MotorConfig::default());
        motors.write(0.5, -0.25, false).unwrap();
        assert_eq!(handle.level("24"), 1);
        assert_eq!(handle.level("25"), 0);
        assert_eq!(duty(&handle, "12"), 0.5);
        assert_eq!(duty(&handle, "13"), 0.25);

        motors.write(3.0, -3.0, false).unwrap();
        let last = motors.last_command().unwrap();
        assert_eq!((last.left, last.right), (1.0, -1.0));
        assert!(motors.write(f64::NAN, 0.0, false).is_err());
    }

    #[test]
    fn test_rpm_mode() {
        let (mut motors, handle) = controller(MotorConfig::default());
        motors.write(100.0, -50.0, true).unwrap();
        assert_eq!(duty(&handle, "12"), 0.5);
        assert_eq!(duty(&handle, "13"), 0.25);

        let k = motors.config().velocity_constant();
        assert!((k - 6.0 / (2.0 * PI * 200.0 / 60.0)).abs() < 1e-12);
    }

    #[test]
    fn test_inverted_channel() {
        let mut config = MotorConfig::default();
        config.channels[1].inverted = true;
        let (mut motors, handle) = controller(config);
        motors.write(0.3, 0.3, false).unwrap();
        assert_eq!(handle.level("24"), 1);
        assert_eq!(handle.level("25"), 0);
    }

    #[test]
    fn test_stop_releases_pwm() {
        let (mut motors, handle) = controller(MotorConfig::default());
        motors.write(0.8, 0.8, false).unwrap();
        motors.stop().unwrap();
        motors.stop().unwrap();
        assert!(!handle.pin_config("12").unwrap().pwm_enabled());
        assert!(motors.write(0.1, 0.1, false).is_err());
    }
}
