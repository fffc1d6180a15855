//! Trigger/echo ultrasonic rangefinder (HC-SR04 and similar)
//!
//! Works over any [`Gpio`] backend. The echo pulse is measured by polling
//! the echo pin against a [`Clock`], so tests can drive it with a
//! `VirtualClock` and a simulated pulse link.
//!
//! # Example
//!
//! ```rust,ignore
//! use hatkit_library::drivers::ultrasonic::{Ultrasonic, UltrasonicConfig};
//!
//! let mut sonar = Ultrasonic::new(UltrasonicConfig::default());
//! sonar.start()?;
//! println!("{:.1} cm", sonar.read()?);
//! ```

use std::sync::Arc;
use std::time::Duration;

use hatkit_core::clock::{Clock, SystemClock};
use hatkit_core::device::{Device, DeviceBase};
use hatkit_core::driver::{DriverStatus, InterfaceConfig};
use hatkit_core::error::{HatError, HatResult};

use crate::drivers::gpio::{Direction, SharedGpio};
use crate::drivers::GpioHandle;
use crate::messages::sensor::Range;

/// Speed of sound at 0 °C in m/s
pub const SPEED_OF_SOUND_0C: f64 = 331.3;

const TRIGGER_PULSE: Duration = Duration::from_micros(10);

/// Ultrasonic configuration
#[derive(Debug, Clone)]
pub struct UltrasonicConfig {
    pub trigger_pin: String,
    pub echo_pin: String,
    /// Sleep between echo polls
    pub poll_interval: Duration,
    /// How long to wait for the echo to rise after the trigger
    pub echo_start_timeout: Duration,
    /// Longest echo accepted (about 6.3 m round trip)
    pub echo_timeout: Duration,
    /// Measurement cycles before giving up
    pub attempts: u32,
    /// Speed of sound in m/s
    pub speed_of_sound: f64,
    pub gpio: InterfaceConfig,
}

impl Default for UltrasonicConfig {
    fn default() -> Self {
        Self {
            trigger_pin: "23".to_string(),
            echo_pin: "24".to_string(),
            poll_interval: Duration::from_micros(10),
            echo_start_timeout: Duration::from_millis(10),
            echo_timeout: Duration::from_millis(38),
            attempts: 10,
            speed_of_sound: SPEED_OF_SOUND_0C,
            gpio: InterfaceConfig::default(),
        }
    }
}

pub struct Ultrasonic {
    base: DeviceBase<Range>,
    config: UltrasonicConfig,
    source: GpioHandle,
    gpio: Option<SharedGpio>,
    clock: Arc<dyn Clock>,
}

impl Ultrasonic {
    pub fn new(config: UltrasonicConfig) -> Self {
        let source = GpioHandle::Owned(config.gpio.clone());
        Self::build(config, source)
    }

    /// Use a GPIO backend owned by someone else
    pub fn with_gpio(gpio: SharedGpio, config: UltrasonicConfig) -> Self {
        Self::build(config, GpioHandle::Borrowed(gpio))
    }

    fn build(config: UltrasonicConfig, source: GpioHandle) -> Self {
        Self {
            base: DeviceBase::new("ultrasonic"),
            config,
            source,
            gpio: None,
            clock: SystemClock::shared(),
        }
    }

    /// Replace the time source used for pulse timing
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Adjust the speed of sound for the air temperature
    /// Formula: v = 331.3 + 0.606 * T (T in Celsius)
    pub fn set_temperature(&mut self, celsius: f64) {
        self.config.speed_of_sound = SPEED_OF_SOUND_0C + 0.606 * celsius;
    }

    pub fn speed_of_sound(&self) -> f64 {
        self.config.speed_of_sound
    }

    pub fn latest(&self) -> Option<Range> {
        self.base.buffer().latest()
    }

    /// Measure the distance in centimetres
    ///
    /// Retries up to `attempts` trigger cycles, then fails with
    /// `DeviceOutOfRange`.
    pub fn read(&mut self) -> HatResult<f64> {
        let gpio = self
            .gpio
            .clone()
            .ok_or_else(|| HatError::driver("Ultrasonic not started"))?;

        for attempt in 0..self.config.attempts {
            if let Some(width) = self.measure(&gpio)? {
                let distance_cm = width.as_secs_f64() * self.config.speed_of_sound * 100.0 / 2.0;
                self.base.record(Range::new(distance_cm));
                return Ok(distance_cm);
            }
            log::debug!("ultrasonic: no echo on attempt {}", attempt + 1);
        }

        Err(HatError::DeviceOutOfRange(format!(
            "no echo from pin {} after {} attempts",
            self.config.echo_pin, self.config.attempts
        )))
    }

    /// One trigger cycle; `None` when the echo never rose or never fell
    fn measure(&self, gpio: &SharedGpio) -> HatResult<Option<Duration>> {
        let trigger = self.config.trigger_pin.as_str();
        let echo = self.config.echo_pin.as_str();

        gpio.lock().set_level(trigger, true)?;
        self.clock.sleep(TRIGGER_PULSE);
        gpio.lock().set_level(trigger, false)?;

        let wait_start = self.clock.now();
        while !gpio.lock().is_high(echo)? {
            if self.clock.now() - wait_start > self.config.echo_start_timeout {
                return Ok(None);
            }
            self.clock.sleep(self.config.poll_interval);
        }

        let echo_start = self.clock.now();
        while gpio.lock().is_high(echo)? {
            if self.clock.now() - echo_start > self.config.echo_timeout {
                return Ok(None);
            }
            self.clock.sleep(self.config.poll_interval);
        }
        Ok(Some(self.clock.now() - echo_start))
    }

    fn configure(&self, gpio: &SharedGpio) -> HatResult<()> {
        let mut gpio = gpio.lock();
        gpio.configure(&self.config.trigger_pin, Direction::Output, None)?;
        gpio.set_level(&self.config.trigger_pin, false)?;
        gpio.configure(&self.config.echo_pin, Direction::Input, None)
    }
}

impl Device for Ultrasonic {
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

    fn stop(&mut self) -> HatResult<()> {
        self.gpio = None;
        self.base.release();
        Ok(())
    }

    fn status(&self) -> DriverStatus {
        self.base.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::gpio::{shared_gpio, SimulationGpioDriver};
    use hatkit_core::clock::VirtualClock;

    #[test]
    fn test_temperature_compensation() {
        let mut sonar = Ultrasonic::new(UltrasonicConfig::default());
        assert_eq!(sonar.speed_of_sound(), 331.3);
        sonar.set_temperature(20.0);
        assert!((sonar.speed_of_sound() - 343.42).abs() < 1e-9);
    }

    #[test]
    fn test_read_before_start_fails() {
        let mut sonar = Ultrasonic::new(UltrasonicConfig::default());
        assert!(sonar.read().is_err());
    }

    #[test]
    fn test_no_echo_is_out_of_range() {
        let clock = Arc::new(VirtualClock::new());
        let gpio = shared_gpio(SimulationGpioDriver::with_clock(clock.clone()));
        let mut sonar =
            Ultrasonic::with_gpio(gpio, UltrasonicConfig::default()).with_clock(clock.clone());
        sonar.start().unwrap();

        let err = sonar.read().unwrap_err();
        assert!(matches!(err, HatError::DeviceOutOfRange(_)));
        // ten cycles of at least the echo start timeout each
        assert!(clock.now() >= Duration::from_millis(100));
        assert!(sonar.latest().is_none());
    }

    #[test]
    fn test_short_echo() {
        let clock = Arc::new(VirtualClock::new());
        let driver = SimulationGpioDriver::with_clock(clock.clone());
        driver
            .handle()
            .link_pulse("23", "24", Duration::ZERO, Duration::from_micros(1000));
        let config = UltrasonicConfig {
            poll_interval: Duration::from_micros(1),
            ..Default::default()
        };
        let mut sonar = Ultrasonic::with_gpio(shared_gpio(driver), config).with_clock(clock);
        sonar.start().unwrap();

        let cm = sonar.read().unwrap();
        assert!((cm - 16.565).abs() < 0.05, "{}", cm);
        assert_eq!(sonar.status(), DriverStatus::Running);
    }
}
