//! Environmental sensors
//!
//! Multi-quantity sensors expose one capability trait per quantity, so a
//! BME280 is usable wherever a [`Temperature`], [`Pressure`] or
//! [`Humidity`] source is expected.

mod bme280;

pub use bme280::{Bme280, Bme280Calibration, Bme280Config, Oversampling, BME280_CHIP_ID};

use hatkit_core::error::HatResult;

pub trait Temperature {
    /// Degrees Celsius
    fn temperature(&mut self) -> HatResult<f64>;
}

pub trait Pressure {
    /// Pascal
    fn pressure(&mut self) -> HatResult<f64>;
}

pub trait Humidity {
    /// Relative humidity in percent
    fn humidity(&mut self) -> HatResult<f64>;
}
