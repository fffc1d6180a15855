//! Analog-to-digital converters
//!
//! # Available Drivers
//!
//! - `Mcp3002` - 10-bit, 2-channel SPI ADC with a background averaging thread
//! - `Ads7830` - 8-bit, 8-channel I2C ADC
//!
//! ADCs are often read by several sensors at once (two IR rangefinders on
//! one converter). The application owns the converter and hands the others
//! a [`SharedAdc`]; only the owner starts and stops it.

mod ads7830;
mod mcp3002;

pub use ads7830::{Ads7830, Ads7830Config, Ads7830Model};
pub use mcp3002::{Mcp3002, Mcp3002Config};

use hatkit_core::device::{share, Device, Shared};
use hatkit_core::error::{HatError, HatResult};

/// One conversion result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdcReading {
    pub stamp_nanos: u64,
    pub channel: u8,
    pub raw: u16,
    pub voltage: f64,
}

/// Multi-channel analog input
pub trait Adc: Device + Send {
    fn channel_count(&self) -> u8;

    fn resolution_bits(&self) -> u8;

    fn reference_voltage(&self) -> f64;

    /// Raw conversion code of `channel`
    fn read_raw(&mut self, channel: u8) -> HatResult<u16>;

    /// Channel voltage, `raw / (2^bits - 1) * vref`
    fn read_voltage(&mut self, channel: u8) -> HatResult<f64> {
        let raw = self.read_raw(channel)?;
        let full_scale = f64::from((1u32 << self.resolution_bits()) - 1);
        Ok(f64::from(raw) / full_scale * self.reference_voltage())
    }
}

pub type SharedAdc = Shared<dyn Adc>;

/// Box and share a concrete converter
pub fn shared_adc<A: Adc + 'static>(adc: A) -> SharedAdc {
    let boxed: Box<dyn Adc> = Box::new(adc);
    share(boxed)
}

pub(crate) fn check_channel(channel: u8, count: u8) -> HatResult<()> {
    if channel < count {
        Ok(())
    } else {
        Err(HatError::invalid_input(format!(
            "ADC channel {} not in 0..{}",
            channel, count
        )))
    }
}
