//! ICM-20948 9-axis IMU driver
//!
//! The register space is split into four 128-register banks selected
//! through REG_BANK_SEL. The AK09916 magnetometer sits behind the chip's
//! auxiliary I2C bus; with BYPASS_EN set it answers directly on the host
//! bus at 0x0C.

use std::time::Duration;

use hatkit_core::device::{Device, DeviceBase};
use hatkit_core::driver::{DriverStatus, InterfaceConfig};
use hatkit_core::error::{HatError, HatResult};

use crate::drivers::bus::SharedI2c;
use crate::drivers::I2cHandle;
use crate::messages::sensor::{stamp_now, Imu};

/// Address with AD0 low
pub const ICM20948_ADDRESS: u8 = 0x68;
/// Address with AD0 high
pub const ICM20948_ADDRESS_ALT: u8 = 0x69;
pub const AK09916_ADDRESS: u8 = 0x0C;
/// AK09916 sensitivity
pub const MAG_UT_PER_LSB: f64 = 0.15;

pub(crate) const REG_BANK_SEL: u8 = 0x7F;

// Bank 0
pub(crate) const WHO_AM_I: u8 = 0x00;
pub(crate) const USER_CTRL: u8 = 0x03;
pub(crate) const LP_CONFIG: u8 = 0x05;
pub(crate) const PWR_MGMT_1: u8 = 0x06;
pub(crate) const PWR_MGMT_2: u8 = 0x07;
pub(crate) const INT_PIN_CFG: u8 = 0x0F;
pub(crate) const INT_STATUS_2: u8 = 0x1B;
pub(crate) const ACCEL_XOUT_H: u8 = 0x2D;
pub(crate) const GYRO_XOUT_H: u8 = 0x33;
pub(crate) const TEMP_OUT_H: u8 = 0x39;

// Bank 2
pub(crate) const GYRO_CONFIG_1: u8 = 0x01;
pub(crate) const ACCEL_CONFIG: u8 = 0x14;

// AK09916
pub(crate) const AK_WIA2: u8 = 0x01;
pub(crate) const AK_ST1: u8 = 0x10;
pub(crate) const AK_HXL: u8 = 0x11;
pub(crate) const AK_CNTL2: u8 = 0x31;
pub(crate) const AK_CNTL3: u8 = 0x32;

pub(crate) const WHO_AM_I_VALUE: u8 = 0xEA;
pub(crate) const AK_DEVICE_ID: u8 = 0x09;

const DEVICE_RESET: u8 = 0x80;
const CLKSEL_AUTO: u8 = 0x01;
const BYPASS_EN: u8 = 0x02;
const AK_ST2_HOFL: u8 = 0x08;
/// Continuous measurement mode 4 (100 Hz)
const AK_MODE_CONT_100HZ: u8 = 0x08;
const AK_SOFT_RESET: u8 = 0x01;

const TEMP_SENSITIVITY: f64 = 333.87;
const TEMP_OFFSET_C: f64 = 21.0;

/// Accelerometer full scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccelScale {
    /// ±2g
    #[default]
    G2,
    /// ±4g
    G4,
    /// ±8g
    G8,
    /// ±16g
    G16,
}

impl AccelScale {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::G2,
            1 => Self::G4,
            2 => Self::G8,
            _ => Self::G16,
        }
    }

    /// Counts per g
    pub fn sensitivity(self) -> f64 {
        match self {
            Self::G2 => 16384.0,
            Self::G4 => 8192.0,
            Self::G8 => 4096.0,
            Self::G16 => 2048.0,
        }
    }
}

/// Gyroscope full scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GyroScale {
    /// ±250°/s
    #[default]
    Dps250,
    /// ±500°/s
    Dps500,
    /// ±1000°/s
    Dps1000,
    /// ±2000°/s
    Dps2000,
}

impl GyroScale {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::Dps250,
            1 => Self::Dps500,
            2 => Self::Dps1000,
            _ => Self::Dps2000,
        }
    }

    /// Counts per degree per second
    pub fn sensitivity(self) -> f64 {
        match self {
            Self::Dps250 => 131.0,
            Self::Dps500 => 65.5,
            Self::Dps1000 => 32.8,
            Self::Dps2000 => 16.4,
        }
    }
}

/// Sensor block selectable in [`Icm20948::read`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImuField {
    Accel,
    Gyro,
    Mag,
    Temp,
}

impl ImuField {
    pub const ALL: [ImuField; 4] = [ImuField::Accel, ImuField::Gyro, ImuField::Mag, ImuField::Temp];
}

/// ICM-20948 configuration
#[derive(Debug, Clone)]
pub struct Icm20948Config {
    pub address: u8,
    pub accel_scale: AccelScale,
    pub gyro_scale: GyroScale,
    /// Accelerometer low-pass setting (0-7)
    pub accel_dlpf: u8,
    /// Gyroscope low-pass setting (0-7)
    pub gyro_dlpf: u8,
    /// Bring up the magnetometer through I2C bypass
    pub magnetometer: bool,
    pub bus: InterfaceConfig,
}

impl Default for Icm20948Config {
    fn default() -> Self {
        Self {
            address: ICM20948_ADDRESS,
            accel_scale: AccelScale::default(),
            gyro_scale: GyroScale::default(),
            accel_dlpf: 1,
            gyro_dlpf: 1,
            magnetometer: true,
            bus: InterfaceConfig::i2c(1, ICM20948_ADDRESS),
        }
    }
}

fn be_triplet(bytes: &[u8]) -> HatResult<[i16; 3]> {
    if bytes.len() < 6 {
        return Err(HatError::bus(format!("short IMU read ({} bytes)", bytes.len())));
    }
    Ok([
        i16::from_be_bytes([bytes[0], bytes[1]]),
        i16::from_be_bytes([bytes[2], bytes[3]]),
        i16::from_be_bytes([bytes[4], bytes[5]]),
    ])
}

/// ICM-20948 9-axis IMU driver
pub struct Icm20948 {
    base: DeviceBase<Imu>,
    config: Icm20948Config,
    source: I2cHandle,
    bus: Option<SharedI2c>,
    /// Bank last written to REG_BANK_SEL
    bank: Option<u8>,
}

impl Icm20948 {
    pub fn new(config: Icm20948Config) -> Self {
        let source = I2cHandle::Owned(config.bus.clone());
        Self::build(config, source)
    }

    pub fn with_bus(bus: SharedI2c, config: Icm20948Config) -> Self {
        Self::build(config, I2cHandle::Borrowed(bus))
    }

    fn build(config: Icm20948Config, source: I2cHandle) -> Self {
        Self {
            base: DeviceBase::new("icm20948"),
            config,
            source,
            bus: None,
            bank: None,
        }
    }

    fn bus(&self) -> HatResult<SharedI2c> {
        self.bus
            .clone()
            .ok_or_else(|| HatError::driver("ICM-20948 not started"))
    }

    fn select_bank(&mut self, bank: u8) -> HatResult<()> {
        if self.bank == Some(bank) {
            return Ok(());
        }
        self.bus()?
            .lock()
            .write_byte(self.config.address, REG_BANK_SEL, (bank & 0x03) << 4)?;
        self.bank = Some(bank);
        Ok(())
    }

    /// Read `n` bytes from a banked register
    pub fn read_register(&mut self, bank: u8, reg: u8, n: usize) -> HatResult<Vec<u8>> {
        self.select_bank(bank)?;
        self.bus()?.lock().read(self.config.address, reg, n)
    }

    /// Write one banked register
    pub fn write_register(&mut self, bank: u8, reg: u8, value: u8) -> HatResult<()> {
        self.select_bank(bank)?;
        self.bus()?.lock().write_byte(self.config.address, reg, value)
    }

    fn configure(&mut self) -> HatResult<()> {
        self.bank = None;
        self.write_register(0, PWR_MGMT_1, DEVICE_RESET)?;
        std::thread::sleep(Duration::from_millis(10));
        // Reset puts the bank selector back to 0
        self.bank = None;

        let id = self.read_register(0, WHO_AM_I, 1)?;
        if id.first() != Some(&WHO_AM_I_VALUE) {
            return Err(HatError::driver(format!(
                "unexpected WHO_AM_I {:02x?} (expected 0x{:02x})",
                id, WHO_AM_I_VALUE
            )));
        }

        // Wake, low-power off, continuous sampling on every axis
        self.write_register(0, PWR_MGMT_1, CLKSEL_AUTO)?;
        std::thread::sleep(Duration::from_millis(1));
        self.write_register(0, LP_CONFIG, 0x00)?;
        self.write_register(0, PWR_MGMT_2, 0x00)?;

        let gyro = ((self.config.gyro_dlpf & 0x07) << 3) | (self.config.gyro_scale.bits() << 1) | 1;
        let accel =
            ((self.config.accel_dlpf & 0x07) << 3) | (self.config.accel_scale.bits() << 1) | 1;
        self.write_register(2, GYRO_CONFIG_1, gyro)?;
        self.write_register(2, ACCEL_CONFIG, accel)?;

        // Internal I2C master off, magnetometer reachable on the host bus
        self.write_register(0, USER_CTRL, 0x00)?;
        self.write_register(0, INT_PIN_CFG, BYPASS_EN)?;

        if self.config.magnetometer {
            self.configure_magnetometer()?;
        }
        Ok(())
    }

    fn configure_magnetometer(&mut self) -> HatResult<()> {
        let bus = self.bus()?;
        let mut bus = bus.lock();
        let id = bus.read_byte(AK09916_ADDRESS, AK_WIA2)?;
        if id != AK_DEVICE_ID {
            return Err(HatError::driver(format!(
                "unexpected AK09916 id 0x{:02x} (expected 0x{:02x})",
                id, AK_DEVICE_ID
            )));
        }
        bus.write_byte(AK09916_ADDRESS, AK_CNTL3, AK_SOFT_RESET)?;
        std::thread::sleep(Duration::from_millis(1));
        bus.write_byte(AK09916_ADDRESS, AK_CNTL2, AK_MODE_CONT_100HZ)?;
        Ok(())
    }

    /// Read the requested sensor blocks; unrequested fields stay `None`
    pub fn read(&mut self, fields: &[ImuField]) -> HatResult<Imu> {
        let mut sample = Imu {
            stamp_nanos: stamp_now(),
            ..Default::default()
        };

        let status = self.read_register(0, INT_STATUS_2, 1)?;
        if status.first().copied().unwrap_or(0) & 0x1F != 0 {
            log::warn!("ICM-20948 FIFO overflow");
            sample.fifo_overflow = true;
        }

        if fields.contains(&ImuField::Accel) {
            let raw = be_triplet(&self.read_register(0, ACCEL_XOUT_H, 6)?)?;
            let scale = self.config.accel_scale.sensitivity();
            sample.accel = Some(raw.map(|v| f64::from(v) / scale));
        }
        if fields.contains(&ImuField::Gyro) {
            let raw = be_triplet(&self.read_register(0, GYRO_XOUT_H, 6)?)?;
            let scale = self.config.gyro_scale.sensitivity();
            sample.gyro = Some(raw.map(|v| f64::from(v) / scale));
        }
        if fields.contains(&ImuField::Temp) {
            let bytes = self.read_register(0, TEMP_OUT_H, 2)?;
            if let [hi, lo] = bytes[..] {
                let raw = i16::from_be_bytes([hi, lo]);
                sample.temp_c = Some(f64::from(raw) / TEMP_SENSITIVITY + TEMP_OFFSET_C);
            }
        }
        if fields.contains(&ImuField::Mag) && self.config.magnetometer {
            let (mag, overflow) = self.read_magnetometer()?;
            sample.mag = Some(mag.map(f64::from));
            sample.mag_overflow = overflow;
        }

        self.base.record(sample);
        Ok(sample)
    }

    /// Read every sensor block
    pub fn read_all(&mut self) -> HatResult<Imu> {
        self.read(&ImuField::ALL)
    }

    /// Raw magnetometer counts and the HOFL flag
    fn read_magnetometer(&mut self) -> HatResult<([i16; 3], bool)> {
        let bus = self.bus()?;
        let mut bus = bus.lock();
        let st1 = bus.read_byte(AK09916_ADDRESS, AK_ST1)?;
        if st1 & 0x01 == 0 {
            log::debug!("AK09916 data not ready, reading previous sample");
        }
        // HXL..ST2; reading ST2 releases the data registers
        let bytes = bus.read(AK09916_ADDRESS, AK_HXL, 8)?;
        if bytes.len() < 8 {
            return Err(HatError::bus(format!("short AK09916 read ({} bytes)", bytes.len())));
        }
        let mag = [
            i16::from_le_bytes([bytes[0], bytes[1]]),
            i16::from_le_bytes([bytes[2], bytes[3]]),
            i16::from_le_bytes([bytes[4], bytes[5]]),
        ];
        let overflow = bytes[7] & AK_ST2_HOFL != 0;
        if overflow {
            log::warn!("AK09916 magnetic sensor overflow, sample kept as read");
        }
        Ok((mag, overflow))
    }

    pub fn config(&self) -> &Icm20948Config {
        &self.config
    }

    pub fn latest(&self) -> Option<Imu> {
        self.base.buffer().latest()
    }
}

impl Device for Icm20948 {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn start(&mut self) -> HatResult<()> {
        if self.base.is_active() {
            return Ok(());
        }
        self.bus = Some(self.source.acquire(&mut self.base, "i2c")?);
        match self.configure() {
            Ok(()) => {
                log::info!(
                    "ICM-20948 at 0x{:02x} ready ({:?}, {:?})",
                    self.config.address,
                    self.config.accel_scale,
                    self.config.gyro_scale
                );
                self.base.mark_ready();
                Ok(())
            }
            Err(e) => {
                self.bus = None;
                self.base.fail(&e);
                Err(e)
            }
        }
    }

    fn stop(&mut self) -> HatResult<()> {
        if self.bus.is_some() && self.config.magnetometer {
            // Power the magnetometer down
            if let Ok(bus) = self.bus() {
                let _ = bus.lock().write_byte(AK09916_ADDRESS, AK_CNTL2, 0x00);
            }
        }
        self.bus = None;
        self.bank = None;
        self.base.release();
        Ok(())
    }

    fn status(&self) -> DriverStatus {
        self.base.status()
    }
}

impl Drop for Icm20948 {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::bus::{shared_i2c, SimulationI2cDriver};
    use crate::drivers::imu::{Ak09916Model, Icm20948Model};

    fn imu(config: Icm20948Config) -> (Icm20948, Icm20948Model, Ak09916Model) {
        let chip = Icm20948Model::new();
        let mag = Ak09916Model::new();
        let bus = shared_i2c(
            SimulationI2cDriver::new(1)
                .with_device(ICM20948_ADDRESS, chip.clone())
                .with_device(AK09916_ADDRESS, mag.clone()),
        );
        let mut imu = Icm20948::with_bus(bus, config);
        imu.start().unwrap();
        (imu, chip, mag)
    }

    #[test]
    fn test_configuration_lands_in_bank_2() {
        let config = Icm20948Config {
            accel_scale: AccelScale::G8,
            gyro_scale: GyroScale::Dps1000,
            accel_dlpf: 3,
            ..Default::default()
        };
        let (_imu, chip, mag) = imu(config);
        assert_eq!(chip.register(2, ACCEL_CONFIG), (3 << 3) | (2 << 1) | 1);
        assert_eq!(chip.register(2, GYRO_CONFIG_1), (1 << 3) | (2 << 1) | 1);
        assert_eq!(chip.register(0, INT_PIN_CFG), BYPASS_EN);
        assert_eq!(chip.register(0, PWR_MGMT_1), CLKSEL_AUTO);
        assert_eq!(mag.register(AK_CNTL2), AK_MODE_CONT_100HZ);
    }

    #[test]
    fn test_read_subset() {
        let (mut imu, _chip, _mag) = imu(Icm20948Config::default());
        let sample = imu.read(&[ImuField::Gyro, ImuField::Temp]).unwrap();
        assert!(sample.accel.is_none());
        assert!(sample.mag.is_none());
        assert!(sample.gyro.is_some());
        let temp = sample.temp_c.unwrap();
        assert!((15.0..35.0).contains(&temp));
        assert_eq!(imu.latest(), Some(sample));
    }

    #[test]
    fn test_scaling_follows_full_scale() {
        let config = Icm20948Config {
            accel_scale: AccelScale::G16,
            ..Default::default()
        };
        let (mut imu, chip, _mag) = imu(config);
        chip.set_noise(0.0);
        chip.set_acceleration([0.5, -0.25, 1.0]);
        let accel = imu.read(&[ImuField::Accel]).unwrap().accel.unwrap();
        for (got, want) in accel.iter().zip([0.5, -0.25, 1.0]) {
            assert!((got - want).abs() < 1e-3, "{} != {}", got, want);
        }
    }

    #[test]
    fn test_mag_overflow_keeps_sample() {
        let (mut imu, _chip, mag) = imu(Icm20948Config::default());
        mag.set_field([120, -40, 300]);
        mag.set_overflow(true);
        let sample = imu.read(&[ImuField::Mag]).unwrap();
        assert_eq!(sample.mag, Some([120.0, -40.0, 300.0]));
        assert!(sample.mag_overflow);
    }

    #[test]
    fn test_fifo_overflow_reported() {
        let (mut imu, chip, _mag) = imu(Icm20948Config::default());
        chip.set_fifo_overflow(true);
        assert!(imu.read(&[ImuField::Accel]).unwrap().fifo_overflow);
    }

    #[test]
    fn test_wrong_chip_fails_start() {
        let bus = shared_i2c(
            SimulationI2cDriver::new(1).with_device(ICM20948_ADDRESS, Ak09916Model::new()),
        );
        let mut imu = Icm20948::with_bus(bus, Icm20948Config::default());
        assert!(imu.start().is_err());
        assert!(imu.status().is_error());
        imu.stop().unwrap();
        assert_eq!(imu.status(), DriverStatus::Shutdown);
    }
}
