//! ADS7830 8-bit, 8-channel I2C ADC

use std::sync::Arc;

use parking_lot::Mutex;

use hatkit_core::device::{Device, DeviceBase};
use hatkit_core::driver::{DriverStatus, InterfaceConfig};
use hatkit_core::error::{HatError, HatResult};

use super::{check_channel, Adc, AdcReading};
use crate::drivers::bus::{I2cDeviceModel, SharedI2c};
use crate::drivers::I2cHandle;
use crate::messages::sensor::stamp_now;

pub const DEFAULT_ADDRESS: u8 = 0x48;
const CHANNELS: u8 = 8;
/// Single-ended inputs, internal reference off, converter on
const CMD_SINGLE_ENDED: u8 = 0x84;

/// Command byte for a single-ended read of `channel`
///
/// The channel select bits are interleaved: C2 = ch bit 0, C1..C0 = ch bits 2..1.
pub fn command(channel: u8) -> u8 {
    CMD_SINGLE_ENDED | ((((channel << 2) | (channel >> 1)) & 0x07) << 4)
}

/// ADS7830 configuration
#[derive(Debug, Clone)]
pub struct Ads7830Config {
    pub address: u8,
    pub reference_voltage: f64,
    pub bus: InterfaceConfig,
}

impl Default for Ads7830Config {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            reference_voltage: 3.3,
            bus: InterfaceConfig::i2c(1, DEFAULT_ADDRESS),
        }
    }
}

pub struct Ads7830 {
    base: DeviceBase<AdcReading>,
    config: Ads7830Config,
    source: I2cHandle,
    bus: Option<SharedI2c>,
}

impl Ads7830 {
    pub fn new(config: Ads7830Config) -> Self {
        let source = I2cHandle::Owned(config.bus.clone());
        Self {
            base: DeviceBase::new("ads7830"),
            config,
            source,
            bus: None,
        }
    }

    pub fn with_bus(bus: SharedI2c, config: Ads7830Config) -> Self {
        Self {
            base: DeviceBase::new("ads7830"),
            config,
            source: I2cHandle::Borrowed(bus),
            bus: None,
        }
    }
}

impl Adc for Ads7830 {
    fn channel_count(&self) -> u8 {
        CHANNELS
    }

    fn resolution_bits(&self) -> u8 {
        8
    }

    fn reference_voltage(&self) -> f64 {
        self.config.reference_voltage
    }

    fn read_raw(&mut self, channel: u8) -> HatResult<u16> {
        check_channel(channel, CHANNELS)?;
        let bus = self
            .bus
            .as_ref()
            .ok_or_else(|| HatError::driver("ADS7830 not started"))?;
        let raw = u16::from(bus.lock().read_byte(self.config.address, command(channel))?);
        let voltage = f64::from(raw) / 255.0 * self.config.reference_voltage;
        self.base.record(AdcReading {
            stamp_nanos: stamp_now(),
            channel,
            raw,
            voltage,
        });
        Ok(raw)
    }
}

impl Device for Ads7830 {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn start(&mut self) -> HatResult<()> {
        if self.base.is_active() {
            return Ok(());
        }
        self.bus = Some(self.source.acquire(&mut self.base, "i2c")?);
        self.base.mark_ready();
        Ok(())
    }

    fn stop(&mut self) -> HatResult<()> {
        self.bus = None;
        self.base.release();
        Ok(())
    }

    fn status(&self) -> DriverStatus {
        self.base.status()
    }
}

/// ADS7830 model for the simulated I2C bus
#[derive(Clone, Default)]
pub struct Ads7830Model {
    inputs: Arc<Mutex<[u8; 8]>>,
}

impl Ads7830Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_input(&self, channel: u8, code: u8) {
        self.inputs.lock()[(channel & 0x07) as usize] = code;
    }
}

impl I2cDeviceModel for Ads7830Model {
    fn read(&mut self, command: u8, n: usize) -> HatResult<Vec<u8>> {
        let select = (command >> 4) & 0x07;
        // Undo the interleaving: ch = (C1C0 << 1) | C2
        let channel = ((select & 0x03) << 1) | (select >> 2);
        Ok(vec![self.inputs.lock()[channel as usize]; n])
    }

    fn write(&mut self, _reg: u8, _data: &[u8]) -> HatResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::bus::{shared_i2c, SimulationI2cDriver};

    #[test]
    fn test_command_bytes() {
        let expected = [0x84, 0xC4, 0x94, 0xD4, 0xA4, 0xE4, 0xB4, 0xF4];
        for (ch, want) in expected.iter().enumerate() {
            assert_eq!(command(ch as u8), *want, "channel {}", ch);
        }
    }

    #[test]
    fn test_read_every_channel() {
        let model = Ads7830Model::new();
        for ch in 0..8 {
            model.set_input(ch, ch * 30);
        }
        let bus = shared_i2c(SimulationI2cDriver::new(1).with_device(DEFAULT_ADDRESS, model));
        let mut adc = Ads7830::with_bus(bus, Ads7830Config::default());
        adc.start().unwrap();

        for ch in 0..8u8 {
            assert_eq!(adc.read_raw(ch).unwrap(), u16::from(ch * 30));
        }
        let volts = adc.read_voltage(7).unwrap();
        assert!((volts - 210.0 / 255.0 * 3.3).abs() < 1e-9);
        assert!(adc.read_raw(8).is_err());
    }
}
