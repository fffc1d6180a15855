//! Analog IR rangefinder (Sharp GP2Y0A21 and similar)
//!
//! The sensor outputs a voltage that falls off with distance roughly as a
//! power law, `d = coefficient * V^exponent`. It is read through a converter
//! channel; the converter is borrowed, so several rangefinders can share it.

use hatkit_core::device::{Device, DeviceBase};
use hatkit_core::driver::DriverStatus;
use hatkit_core::error::{HatError, HatResult};

use crate::drivers::adc::SharedAdc;
use crate::messages::sensor::Range;

/// IR rangefinder configuration
#[derive(Debug, Clone)]
pub struct IrConfig {
    pub channel: u8,
    pub coefficient: f64,
    pub exponent: f64,
    /// Below this the target is beyond the usable range
    pub min_voltage: f64,
}

impl Default for IrConfig {
    fn default() -> Self {
        // GP2Y0A21YK0F, 10-80 cm
        Self {
            channel: 0,
            coefficient: 27.86,
            exponent: -1.15,
            min_voltage: 0.4,
        }
    }
}

impl IrConfig {
    /// Distance in centimetres for an output voltage
    pub fn distance_cm(&self, voltage: f64) -> HatResult<f64> {
        if voltage < self.min_voltage {
            return Err(HatError::out_of_range(format!(
                "IR output {:.3} V below {:.3} V",
                voltage, self.min_voltage
            )));
        }
        Ok(self.coefficient * voltage.powf(self.exponent))
    }
}

pub struct IrRangefinder {
    base: DeviceBase<Range>,
    config: IrConfig,
    adc: SharedAdc,
}

impl IrRangefinder {
    pub fn new(adc: SharedAdc, config: IrConfig) -> Self {
        Self {
            base: DeviceBase::new("ir_rangefinder"),
            config,
            adc,
        }
    }

    /// Distance in centimetres
    pub fn read(&mut self) -> HatResult<f64> {
        if !self.base.is_active() {
            return Err(HatError::driver("IR rangefinder not started"));
        }
        let voltage = self.adc.lock().read_voltage(self.config.channel)?;
        let distance = self.config.distance_cm(voltage)?;
        self.base.record(Range::new(distance));
        Ok(distance)
    }

    pub fn latest(&self) -> Option<Range> {
        self.base.buffer().latest()
    }
}

impl Device for IrRangefinder {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn start(&mut self) -> HatResult<()> {
        if self.base.is_active() {
            return Ok(());
        }
        let channels = self.adc.lock().channel_count();
        if self.config.channel >= channels {
            let e = HatError::config(format!(
                "IR channel {} not available on a {}-channel converter",
                self.config.channel, channels
            ));
            self.base.fail(&e);
            return Err(e);
        }
        self.base.mark_ready();
        Ok(())
    }

    /// Leaves the converter running for its owner
    fn stop(&mut self) -> HatResult<()> {
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
    use crate::drivers::adc::{shared_adc, Adc, Ads7830, Ads7830Config, Ads7830Model};
    use crate::drivers::bus::{shared_i2c, SimulationI2cDriver};

    fn converter(codes: &[(u8, u8)]) -> SharedAdc {
        let model = Ads7830Model::new();
        for &(channel, code) in codes {
            model.set_input(channel, code);
        }
        let bus = shared_i2c(SimulationI2cDriver::new(1).with_device(0x48, model));
        let mut adc = Ads7830::with_bus(bus, Ads7830Config::default());
        adc.start().unwrap();
        shared_adc(adc)
    }

    #[test]
    fn test_power_law() {
        let config = IrConfig::default();
        assert!((config.distance_cm(1.0).unwrap() - 27.86).abs() < 1e-9);
        assert!(config.distance_cm(2.0).unwrap() < config.distance_cm(1.0).unwrap());
        assert!(matches!(
            config.distance_cm(0.1),
            Err(HatError::DeviceOutOfRange(_))
        ));
    }

    #[test]
    fn test_two_sensors_share_one_converter() {
        // 1.0 V ~ code 77 on a 3.3 V 8-bit converter
        let adc = converter(&[(0, 77), (1, 5)]);
        let mut left = IrRangefinder::new(adc.clone(), IrConfig::default());
        let mut right = IrRangefinder::new(
            adc.clone(),
            IrConfig {
                channel: 1,
                ..Default::default()
            },
        );
        left.start().unwrap();
        right.start().unwrap();

        let d = left.read().unwrap();
        assert!((d - 27.86).abs() < 0.5, "{}", d);
        assert!(right.read().is_err());

        left.stop().unwrap();
        right.stop().unwrap();
        // the converter stays usable for its owner
        assert!(adc.lock().read_raw(0).is_ok());
    }

    #[test]
    fn test_channel_checked_on_start() {
        let adc = converter(&[]);
        let mut ir = IrRangefinder::new(
            adc,
            IrConfig {
                channel: 9,
                ..Default::default()
            },
        );
        assert!(ir.start().is_err());
    }
}
