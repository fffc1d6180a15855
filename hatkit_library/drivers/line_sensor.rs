//! Five-channel line tracker with a calibration line
//!
//! The module reports one digital bit per channel. Its CAL input is
//! commanded with pulse trains (low 200 ms, high 200 ms each):
//!
//! | Pulses | Effect |
//! |--------|--------|
//! | 1 | start calibration (sweep the sensor over line and floor) |
//! | 2 | report a dark line on a bright floor |
//! | 3 | report a bright line on a dark floor |

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hatkit_core::clock::{Clock, SystemClock};
use hatkit_core::device::{Device, DeviceBase};
use hatkit_core::driver::{DriverStatus, InterfaceConfig};
use hatkit_core::error::{HatError, HatResult};

use crate::drivers::gpio::{Direction, SharedGpio};
use crate::drivers::GpioHandle;
use crate::messages::sensor::LineSample;

pub const CHANNELS: usize = 5;
pub const CAL_PULSE_LOW: Duration = Duration::from_millis(200);
pub const CAL_PULSE_HIGH: Duration = Duration::from_millis(200);

/// Which line colour the sensor reports as 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineMode {
    #[default]
    Dark,
    Bright,
}

impl LineMode {
    fn pulses(&self) -> u32 {
        match self {
            LineMode::Dark => 2,
            LineMode::Bright => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LineSensorConfig {
    /// Left to right
    pub pins: [String; CHANNELS],
    pub cal_pin: String,
    /// Level the module drives when a channel sees the line
    pub active_high: bool,
    pub gpio: InterfaceConfig,
}

impl Default for LineSensorConfig {
    fn default() -> Self {
        Self {
            pins: ["5", "6", "16", "20", "21"].map(String::from),
            cal_pin: "4".to_string(),
            active_high: true,
            gpio: InterfaceConfig::default(),
        }
    }
}

pub struct LineSensor {
    base: DeviceBase<LineSample>,
    config: LineSensorConfig,
    source: GpioHandle,
    gpio: Option<SharedGpio>,
    clock: Arc<dyn Clock>,
    mode: LineMode,
}

impl LineSensor {
    pub fn new(config: LineSensorConfig) -> Self {
        let source = GpioHandle::Owned(config.gpio.clone());
        Self::build(config, source)
    }

    pub fn with_gpio(gpio: SharedGpio, config: LineSensorConfig) -> Self {
        Self::build(config, GpioHandle::Borrowed(gpio))
    }

    fn build(config: LineSensorConfig, source: GpioHandle) -> Self {
        Self {
            base: DeviceBase::new("line_sensor"),
            config,
            source,
            gpio: None,
            clock: SystemClock::shared(),
            mode: LineMode::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn mode(&self) -> LineMode {
        self.mode
    }

    fn gpio(&self) -> HatResult<SharedGpio> {
        self.gpio
            .clone()
            .ok_or_else(|| HatError::driver("line sensor not started"))
    }

    /// Sample all five channels, left to right
    pub fn read(&mut self) -> HatResult<LineSample> {
        let gpio = self.gpio()?;
        let mut channels = [0u8; CHANNELS];
        {
            let mut gpio = gpio.lock();
            for (slot, pin) in channels.iter_mut().zip(self.config.pins.iter()) {
                let level = gpio.read(pin)?;
                *slot = if self.config.active_high { level } else { 1 - level };
            }
        }
        let sample = LineSample::new(channels);
        self.base.record(sample);
        Ok(sample)
    }

    pub fn latest(&self) -> Option<LineSample> {
        self.base.buffer().latest()
    }

    /// Send `count` calibration pulses
    pub fn pulse(&mut self, count: u32) -> HatResult<()> {
        let gpio = self.gpio()?;
        let cal = self.config.cal_pin.as_str();
        for _ in 0..count {
            gpio.lock().set_level(cal, false)?;
            self.clock.sleep(CAL_PULSE_LOW);
            gpio.lock().set_level(cal, true)?;
            self.clock.sleep(CAL_PULSE_HIGH);
        }
        Ok(())
    }

    /// Start the module's calibration sweep
    pub fn calibrate(&mut self) -> HatResult<()> {
        log::info!("line sensor: calibrating");
        self.pulse(1)
    }

    pub fn set_mode(&mut self, mode: LineMode) -> HatResult<()> {
        self.pulse(mode.pulses())?;
        self.mode = mode;
        log::info!("line sensor: {:?} line mode", mode);
        Ok(())
    }

    fn configure(&self, gpio: &SharedGpio) -> HatResult<()> {
        let mut gpio = gpio.lock();
        for pin in &self.config.pins {
            gpio.configure(pin, Direction::Input, None)?;
        }
        gpio.configure(&self.config.cal_pin, Direction::Output, None)?;
        // CAL idles high
        gpio.set_level(&self.config.cal_pin, true)
    }
}

impl Device for LineSensor {
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
    use crate::drivers::gpio::{shared_gpio, SimulationGpioDriver, SimulationGpioHandle};
    use hatkit_core::clock::VirtualClock;

    fn sensor() -> (LineSensor, SimulationGpioHandle, Arc<VirtualClock>) {
        let clock = Arc::new(VirtualClock::new());
        let driver = SimulationGpioDriver::with_clock(clock.clone());
        let handle = driver.handle();
        let mut sensor = LineSensor::with_gpio(shared_gpio(driver), LineSensorConfig::default())
            .with_clock(clock.clone());
        sensor.start().unwrap();
        (sensor, handle, clock)
    }

    #[test]
    fn test_read_channels_in_order() {
        let (mut sensor, handle, _) = sensor();
        handle.set_input_level("16", 1);
        handle.set_input_level("21", 1);
        let sample = sensor.read().unwrap();
        assert_eq!(sample.channels, [0, 0, 1, 0, 1]);
        assert_eq!(sensor.latest().unwrap().channels, sample.channels);
    }

    #[test]
    fn test_active_low_inverts() {
        let clock = Arc::new(VirtualClock::new());
        let driver = SimulationGpioDriver::with_clock(clock.clone());
        let handle = driver.handle();
        let config = LineSensorConfig {
            active_high: false,
            ..Default::default()
        };
        let mut sensor = LineSensor::with_gpio(shared_gpio(driver), config).with_clock(clock);
        sensor.start().unwrap();
        handle.set_input_level("5", 1);
        assert_eq!(sensor.read().unwrap().channels, [0, 1, 1, 1, 1]);
    }

    #[test]
    fn test_mode_pulse_trains() {
        let (mut sensor, handle, clock) = sensor();
        let cal_writes = |h: &SimulationGpioHandle| h.writes_to("4").len();
        let before = cal_writes(&handle);

        sensor.calibrate().unwrap();
        assert_eq!(cal_writes(&handle) - before, 2);
        assert_eq!(clock.now(), Duration::from_millis(400));

        sensor.set_mode(LineMode::Bright).unwrap();
        assert_eq!(cal_writes(&handle) - before, 2 + 6);
        assert_eq!(clock.now(), Duration::from_millis(400 + 1200));
        assert_eq!(sensor.mode(), LineMode::Bright);

        let lows = handle
            .writes_to("4")
            .iter()
            .filter(|w| w.value == 0.0)
            .count();
        assert_eq!(lows, 4);
        assert_eq!(handle.level("4"), 1);
    }
}
