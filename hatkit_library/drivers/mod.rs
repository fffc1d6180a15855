//! Bus backends and device drivers for hatkit
//!
//! # Architecture
//!
//! ```text
//! Nodes (hatkit_library/nodes/)
//!   │
//!   └── Device drivers (this module)
//!           │
//!           ├── factory (capability registry, backend selection)
//!           │
//!           └── Bus backends
//!               ├── Simulation backends (always available)
//!               └── Hardware backends (feature-gated)
//! ```
//!
//! # Available Driver Categories
//!
//! ## Buses
//! - `bus` - I2C and SPI masters
//! - `gpio` - Native GPIO with soft PWM, edge callbacks and debounce
//! - `expander` - MCP23017 port expander behind the GPIO contract
//! - `pwm` - Hardware PWM on the fixed pin pairs
//!
//! ## Sensors
//! - `ultrasonic` - Trigger/echo rangefinder
//! - `adc` - MCP3002 (SPI) and ADS7830 (I2C) converters
//! - `ir` - Analog IR rangefinder read through an ADC
//! - `imu` - ICM-20948 9-axis IMU
//! - `environment` - BME280 temperature/pressure/humidity
//! - `line_sensor` - 5-channel line tracker
//! - `encoder` - Wheel encoder
//! - `button` - Push button
//! - `camera` - Frame capture engines
//! - `audio` - PCM playback and capture engines
//!
//! ## Actuators
//! - `servo` - PCA9685 PWM engine and servo kit
//! - `motor` - Two-channel DC motor controller
//! - `led_strip` - WS2812 strip over SPI

pub mod factory;

// Buses
pub mod bus;
pub mod expander;
pub mod gpio;
pub mod pwm;

// Sensors
pub mod adc;
pub mod audio;
pub mod button;
pub mod camera;
pub mod encoder;
pub mod environment;
pub mod imu;
pub mod ir;
pub mod line_sensor;
pub mod ultrasonic;

// Actuators
pub mod led_strip;
pub mod motor;
pub mod servo;

use hatkit_core::device::{share, DeviceBase, Shared};
use hatkit_core::driver::InterfaceConfig;
use hatkit_core::error::HatResult;

use bus::{I2cBus, SharedI2c, SharedSpi, SpiBus};
use gpio::{Gpio, SharedGpio};

/// Where a device gets a bus from
///
/// An owned bus is opened through the [`factory`] on `start` and closed on
/// `stop`. A borrowed bus belongs to another device and is never closed by
/// the borrower.
pub enum BusHandle<T: ?Sized> {
    Owned(InterfaceConfig),
    Borrowed(Shared<T>),
}

impl<T: ?Sized> Clone for BusHandle<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Owned(config) => Self::Owned(config.clone()),
            Self::Borrowed(bus) => Self::Borrowed(bus.clone()),
        }
    }
}

impl<T: ?Sized> BusHandle<T> {
    pub fn is_borrowed(&self) -> bool {
        matches!(self, Self::Borrowed(_))
    }
}

impl<T: ?Sized> From<Shared<T>> for BusHandle<T> {
    fn from(bus: Shared<T>) -> Self {
        Self::Borrowed(bus)
    }
}

impl<T: ?Sized> From<InterfaceConfig> for BusHandle<T> {
    fn from(config: InterfaceConfig) -> Self {
        Self::Owned(config)
    }
}

impl BusHandle<dyn I2cBus> {
    /// Resolve to a live bus, registering it with `base` when owned
    pub fn acquire<O: Clone>(&self, base: &mut DeviceBase<O>, name: &str) -> HatResult<SharedI2c> {
        match self {
            Self::Owned(config) => {
                let bus = share(factory::open_i2c(config)?);
                base.interfaces_mut().register(name, bus.clone());
                Ok(bus)
            }
            Self::Borrowed(bus) => Ok(bus.clone()),
        }
    }
}

impl BusHandle<dyn SpiBus> {
    pub fn acquire<O: Clone>(&self, base: &mut DeviceBase<O>, name: &str) -> HatResult<SharedSpi> {
        match self {
            Self::Owned(config) => {
                let bus = share(factory::open_spi(config)?);
                base.interfaces_mut().register(name, bus.clone());
                Ok(bus)
            }
            Self::Borrowed(bus) => Ok(bus.clone()),
        }
    }
}

impl BusHandle<dyn Gpio> {
    pub fn acquire<O: Clone>(&self, base: &mut DeviceBase<O>, name: &str) -> HatResult<SharedGpio> {
        match self {
            Self::Owned(config) => {
                let gpio = share(factory::open_gpio(config)?);
                base.interfaces_mut().register(name, gpio.clone());
                Ok(gpio)
            }
            Self::Borrowed(gpio) => Ok(gpio.clone()),
        }
    }
}

pub type I2cHandle = BusHandle<dyn I2cBus>;
pub type SpiHandle = BusHandle<dyn SpiBus>;
pub type GpioHandle = BusHandle<dyn Gpio>;
