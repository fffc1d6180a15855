//! Bosch BME280 temperature / pressure / humidity sensor (I2C)
//!
//! Compensation uses the floating-point formulas from the datasheet
//! (section 8.1). The sensor runs in normal mode; every read is one burst of
//! the eight data registers so the three quantities come from the same
//! measurement cycle.

use std::time::Duration;

use hatkit_core::device::{Device, DeviceBase};
use hatkit_core::driver::{DriverStatus, InterfaceConfig};
use hatkit_core::error::{HatError, HatResult};

use super::{Humidity, Pressure, Temperature};
use crate::drivers::bus::SharedI2c;
use crate::drivers::I2cHandle;
use crate::messages::sensor::{stamp_now, Environment};

pub const BME280_CHIP_ID: u8 = 0x60;

pub(crate) const REG_CALIB_00: u8 = 0x88;
pub(crate) const REG_CHIP_ID: u8 = 0xD0;
pub(crate) const REG_RESET: u8 = 0xE0;
pub(crate) const REG_CALIB_26: u8 = 0xE1;
pub(crate) const REG_CTRL_HUM: u8 = 0xF2;
pub(crate) const REG_STATUS: u8 = 0xF3;
pub(crate) const REG_CTRL_MEAS: u8 = 0xF4;
pub(crate) const REG_CONFIG: u8 = 0xF5;
pub(crate) const REG_DATA: u8 = 0xF7;

const SOFT_RESET: u8 = 0xB6;
const STATUS_IM_UPDATE: u8 = 0x01;
const MODE_NORMAL: u8 = 0x03;

/// Oversampling setting, register encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Oversampling {
    Skip = 0,
    X1 = 1,
    X2 = 2,
    X4 = 3,
    X8 = 4,
    X16 = 5,
}

/// BME280 configuration
#[derive(Debug, Clone)]
pub struct Bme280Config {
    pub address: u8,
    pub temperature: Oversampling,
    pub pressure: Oversampling,
    pub humidity: Oversampling,
    /// IIR filter coefficient code (0 = off)
    pub filter: u8,
    /// Standby time code between normal-mode cycles (0 = 0.5 ms)
    pub standby: u8,
    pub bus: InterfaceConfig,
}

impl Default for Bme280Config {
    fn default() -> Self {
        Self {
            address: 0x76,
            temperature: Oversampling::X1,
            pressure: Oversampling::X1,
            humidity: Oversampling::X1,
            filter: 0,
            standby: 0,
            bus: InterfaceConfig::i2c(1, 0x76),
        }
    }
}

/// Factory trimming parameters
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Bme280Calibration {
    pub t1: u16,
    pub t2: i16,
    pub t3: i16,
    pub p1: u16,
    pub p2: i16,
    pub p3: i16,
    pub p4: i16,
    pub p5: i16,
    pub p6: i16,
    pub p7: i16,
    pub p8: i16,
    pub p9: i16,
    pub h1: u8,
    pub h2: i16,
    pub h3: u8,
    pub h4: i16,
    pub h5: i16,
    pub h6: i8,
}

fn le_u16(b: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([b[i], b[i + 1]])
}

fn le_i16(b: &[u8], i: usize) -> i16 {
    i16::from_le_bytes([b[i], b[i + 1]])
}

impl Bme280Calibration {
    /// Parse the 26 bytes at 0x88 and the 7 bytes at 0xE1
    pub fn parse(tp: &[u8], hum: &[u8]) -> HatResult<Self> {
        if tp.len() < 26 || hum.len() < 7 {
            return Err(HatError::bus(format!(
                "short BME280 calibration read ({} + {} bytes)",
                tp.len(),
                hum.len()
            )));
        }
        // H4 and H5 are 12-bit values sharing 0xE5
        let h4 = (i16::from(hum[3] as i8) << 4) | i16::from(hum[4] & 0x0F);
        let h5 = (i16::from(hum[5] as i8) << 4) | i16::from(hum[4] >> 4);
        Ok(Self {
            t1: le_u16(tp, 0),
            t2: le_i16(tp, 2),
            t3: le_i16(tp, 4),
            p1: le_u16(tp, 6),
            p2: le_i16(tp, 8),
            p3: le_i16(tp, 10),
            p4: le_i16(tp, 12),
            p5: le_i16(tp, 14),
            p6: le_i16(tp, 16),
            p7: le_i16(tp, 18),
            p8: le_i16(tp, 20),
            p9: le_i16(tp, 22),
            h1: tp[25],
            h2: le_i16(hum, 0),
            h3: hum[2],
            h4,
            h5,
            h6: hum[6] as i8,
        })
    }

    /// Returns (°C, t_fine)
    pub fn compensate_temperature(&self, adc_t: i32) -> (f64, f64) {
        let adc_t = f64::from(adc_t);
        let t1 = f64::from(self.t1);
        let var1 = (adc_t / 16384.0 - t1 / 1024.0) * f64::from(self.t2);
        let var2 = (adc_t / 131072.0 - t1 / 8192.0).powi(2) * f64::from(self.t3);
        let t_fine = var1 + var2;
        (t_fine / 5120.0, t_fine)
    }

    /// Pascal
    pub fn compensate_pressure(&self, adc_p: i32, t_fine: f64) -> f64 {
        let mut var1 = t_fine / 2.0 - 64000.0;
        let mut var2 = var1 * var1 * f64::from(self.p6) / 32768.0;
        var2 += var1 * f64::from(self.p5) * 2.0;
        var2 = var2 / 4.0 + f64::from(self.p4) * 65536.0;
        var1 = (f64::from(self.p3) * var1 * var1 / 524288.0 + f64::from(self.p2) * var1) / 524288.0;
        var1 = (1.0 + var1 / 32768.0) * f64::from(self.p1);
        if var1 == 0.0 {
            // avoid division by zero
            return 0.0;
        }
        let mut p = 1048576.0 - f64::from(adc_p);
        p = (p - var2 / 4096.0) * 6250.0 / var1;
        let var1 = f64::from(self.p9) * p * p / 2147483648.0;
        let var2 = p * f64::from(self.p8) / 32768.0;
        p + (var1 + var2 + f64::from(self.p7)) / 16.0
    }

    /// Percent relative humidity, clamped to [0, 100]
    pub fn compensate_humidity(&self, adc_h: i32, t_fine: f64) -> f64 {
        let h = t_fine - 76800.0;
        let h = (f64::from(adc_h)
            - (f64::from(self.h4) * 64.0 + f64::from(self.h5) / 16384.0 * h))
            * (f64::from(self.h2) / 65536.0
                * (1.0
                    + f64::from(self.h6) / 67108864.0
                        * h
                        * (1.0 + f64::from(self.h3) / 67108864.0 * h)));
        let h = h * (1.0 - f64::from(self.h1) * h / 524288.0);
        h.clamp(0.0, 100.0)
    }
}

/// Split the 8-byte burst from 0xF7 into (adc_p, adc_t, adc_h)
pub(crate) fn unpack(data: &[u8]) -> (i32, i32, i32) {
    let twenty = |i: usize| {
        (i32::from(data[i]) << 12) | (i32::from(data[i + 1]) << 4) | (i32::from(data[i + 2]) >> 4)
    };
    let adc_h = (i32::from(data[6]) << 8) | i32::from(data[7]);
    (twenty(0), twenty(3), adc_h)
}

pub struct Bme280 {
    base: DeviceBase<Environment>,
    config: Bme280Config,
    source: I2cHandle,
    bus: Option<SharedI2c>,
    calibration: Option<Bme280Calibration>,
}

impl Bme280 {
    pub fn new(config: Bme280Config) -> Self {
        let source = I2cHandle::Owned(config.bus.clone());
        Self::build(config, source)
    }

    pub fn with_bus(bus: SharedI2c, config: Bme280Config) -> Self {
        Self::build(config, I2cHandle::Borrowed(bus))
    }

    fn build(config: Bme280Config, source: I2cHandle) -> Self {
        Self {
            base: DeviceBase::new("bme280"),
            config,
            source,
            bus: None,
            calibration: None,
        }
    }

    pub fn calibration(&self) -> Option<Bme280Calibration> {
        self.calibration
    }

    /// One compensated measurement of all three quantities
    pub fn read(&mut self) -> HatResult<Environment> {
        let (bus, cal) = match (&self.bus, self.calibration) {
            (Some(bus), Some(cal)) => (bus.clone(), cal),
            _ => return Err(HatError::driver("BME280 not started")),
        };
        let data = bus.lock().read(self.config.address, REG_DATA, 8)?;
        if data.len() < 8 {
            return Err(HatError::bus("short BME280 data read"));
        }
        let (adc_p, adc_t, adc_h) = unpack(&data);
        let (temperature_c, t_fine) = cal.compensate_temperature(adc_t);
        let sample = Environment {
            stamp_nanos: stamp_now(),
            temperature_c,
            pressure_pa: cal.compensate_pressure(adc_p, t_fine),
            humidity_pct: cal.compensate_humidity(adc_h, t_fine),
        };
        self.base.record(sample);
        Ok(sample)
    }

    pub fn latest(&self) -> Option<Environment> {
        self.base.buffer().latest()
    }

    fn configure(&mut self, bus: &SharedI2c) -> HatResult<Bme280Calibration> {
        let addr = self.config.address;
        let mut bus = bus.lock();

        let id = bus.read_byte(addr, REG_CHIP_ID)?;
        if id != BME280_CHIP_ID {
            return Err(HatError::backend_init(
                "bme280",
                format!("unexpected chip id 0x{:02X}", id),
            ));
        }

        bus.write_byte(addr, REG_RESET, SOFT_RESET)?;
        std::thread::sleep(Duration::from_millis(2));
        let mut tries = 0;
        while bus.read_byte(addr, REG_STATUS)? & STATUS_IM_UPDATE != 0 {
            tries += 1;
            if tries > 10 {
                return Err(HatError::Timeout("BME280 NVM copy did not finish".into()));
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let tp = bus.read(addr, REG_CALIB_00, 26)?;
        let hum = bus.read(addr, REG_CALIB_26, 7)?;
        let calibration = Bme280Calibration::parse(&tp, &hum)?;

        // ctrl_hum only takes effect after a ctrl_meas write
        bus.write_byte(addr, REG_CTRL_HUM, self.config.humidity as u8)?;
        bus.write_byte(
            addr,
            REG_CONFIG,
            ((self.config.standby & 0x07) << 5) | ((self.config.filter & 0x07) << 2),
        )?;
        bus.write_byte(
            addr,
            REG_CTRL_MEAS,
            ((self.config.temperature as u8) << 5) | ((self.config.pressure as u8) << 2) | MODE_NORMAL,
        )?;
        Ok(calibration)
    }
}

impl Temperature for Bme280 {
    fn temperature(&mut self) -> HatResult<f64> {
        Ok(self.read()?.temperature_c)
    }
}

impl Pressure for Bme280 {
    fn pressure(&mut self) -> HatResult<f64> {
        Ok(self.read()?.pressure_pa)
    }
}

impl Humidity for Bme280 {
    fn humidity(&mut self) -> HatResult<f64> {
        Ok(self.read()?.humidity_pct)
    }
}

impl Device for Bme280 {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn start(&mut self) -> HatResult<()> {
        if self.base.is_active() {
            return Ok(());
        }
        let bus = self.source.acquire(&mut self.base, "i2c")?;
        match self.configure(&bus) {
            Ok(calibration) => {
                self.calibration = Some(calibration);
                self.bus = Some(bus);
                self.base.mark_ready();
                log::info!("BME280 at 0x{:02X} started", self.config.address);
                Ok(())
            }
            Err(e) => {
                self.base.fail(&e);
                Err(e)
            }
        }
    }

    fn stop(&mut self) -> HatResult<()> {
        if let Some(bus) = self.bus.take() {
            // back to sleep mode
            let _ = bus.lock().write_byte(self.config.address, REG_CTRL_MEAS, 0x00);
        }
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
    use crate::drivers::bus::{shared_i2c, RegisterMap, SimulationI2cDriver};

    /// Trimming values from the datasheet's worked example
    fn datasheet_calibration() -> Bme280Calibration {
        Bme280Calibration {
            t1: 27504,
            t2: 26435,
            t3: -1000,
            p1: 36477,
            p2: -10685,
            p3: 3024,
            p4: 2855,
            p5: 140,
            p6: -7,
            p7: 15500,
            p8: -14600,
            p9: 6000,
            ..Default::default()
        }
    }

    fn calibration_bytes(cal: &Bme280Calibration) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&cal.t1.to_le_bytes());
        for v in [cal.t2, cal.t3] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&cal.p1.to_le_bytes());
        for v in [cal.p2, cal.p3, cal.p4, cal.p5, cal.p6, cal.p7, cal.p8, cal.p9] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.push(0);
        out.push(cal.h1);
        out
    }

    #[test]
    fn test_datasheet_example() {
        let cal = datasheet_calibration();
        let (t, t_fine) = cal.compensate_temperature(519888);
        assert!((t - 25.08).abs() < 0.01, "{}", t);
        let p = cal.compensate_pressure(415148, t_fine);
        assert!((p - 100653.27).abs() < 1.0, "{}", p);
    }

    #[test]
    fn test_humidity_nibbles() {
        let tp = [0u8; 26];
        // H2 = 0x0170, H3 = 0, E4 = 0x14, E5 = 0x0A, E6 = 0x00, H6 = 0x1E
        let hum = [0x70, 0x01, 0x00, 0x14, 0x0A, 0x00, 0x1E];
        let cal = Bme280Calibration::parse(&tp, &hum).unwrap();
        assert_eq!(cal.h2, 0x170);
        assert_eq!(cal.h4, 0x14A);
        assert_eq!(cal.h5, 0x000);
        assert_eq!(cal.h6, 30);
        assert!(Bme280Calibration::parse(&tp[..10], &hum).is_err());
    }

    #[test]
    fn test_unpack_burst() {
        // adc_P = 415148 = 0x655AC, adc_T = 519888 = 0x7EED0
        let data = [0x65, 0x5A, 0xC0, 0x7E, 0xED, 0x00, 0x66, 0x77];
        assert_eq!(unpack(&data), (415148, 519888, 0x6677));
    }

    #[test]
    fn test_start_and_read() {
        let cal = datasheet_calibration();
        let regs = RegisterMap::with_registers(&[
            (REG_CHIP_ID, BME280_CHIP_ID),
            (0xF7, 0x65),
            (0xF8, 0x5A),
            (0xF9, 0xC0),
            (0xFA, 0x7E),
            (0xFB, 0xED),
            (0xFC, 0x00),
        ]);
        for (i, byte) in calibration_bytes(&cal).into_iter().enumerate() {
            regs.set(REG_CALIB_00 + i as u8, byte);
        }
        let bus = shared_i2c(SimulationI2cDriver::new(1).with_device(0x76, regs.clone()));

        let mut sensor = Bme280::with_bus(bus, Bme280Config::default());
        sensor.start().unwrap();
        assert_eq!(sensor.calibration().unwrap().p9, 6000);
        assert_eq!(regs.get(REG_CTRL_MEAS), 0x27);
        assert_eq!(regs.get(REG_CTRL_HUM), 0x01);

        assert!((sensor.temperature().unwrap() - 25.08).abs() < 0.01);
        assert!((sensor.pressure().unwrap() - 100653.27).abs() < 1.0);
        let h = sensor.humidity().unwrap();
        assert!((0.0..=100.0).contains(&h));

        sensor.stop().unwrap();
        assert_eq!(regs.get(REG_CTRL_MEAS), 0x00);
        assert!(sensor.read().is_err());
    }

    #[test]
    fn test_wrong_chip_id() {
        let bus = shared_i2c(SimulationI2cDriver::new(1).with_device(0x76, RegisterMap::new()));
        let mut sensor = Bme280::with_bus(bus, Bme280Config::default());
        assert!(matches!(sensor.start(), Err(HatError::BackendInit { .. })));
        assert!(sensor.status().is_error());
    }
}
