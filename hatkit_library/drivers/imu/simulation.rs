//! Simulated ICM-20948 and AK09916 chips
//!
//! Both models plug into [`SimulationI2cDriver`](crate::drivers::bus::SimulationI2cDriver)
//! and keep a shared handle so tests can steer the physics after the bus
//! has been boxed.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use hatkit_core::error::HatResult;

use super::icm20948::{
    AccelScale, GyroScale, ACCEL_CONFIG, ACCEL_XOUT_H, AK_CNTL2, AK_CNTL3, AK_DEVICE_ID, AK_HXL,
    AK_ST1, AK_WIA2, GYRO_CONFIG_1, GYRO_XOUT_H, INT_STATUS_2, PWR_MGMT_1, REG_BANK_SEL, TEMP_OUT_H,
    WHO_AM_I, WHO_AM_I_VALUE,
};
use crate::drivers::bus::I2cDeviceModel;

struct ImuState {
    banks: [[u8; 128]; 4],
    bank: usize,
    accel_g: [f64; 3],
    gyro_dps: [f64; 3],
    temp_c: f64,
    noise: f64,
    fifo_overflow: bool,
    rng: StdRng,
}

impl ImuState {
    fn reset(&mut self) {
        self.banks = [[0; 128]; 4];
        self.banks[0][WHO_AM_I as usize] = WHO_AM_I_VALUE;
        // Sleep bit set after reset
        self.banks[0][PWR_MGMT_1 as usize] = 0x41;
        self.bank = 0;
    }

    fn jitter(&mut self, scale: f64) -> f64 {
        if self.noise == 0.0 {
            0.0
        } else {
            self.rng.gen_range(-self.noise..=self.noise) * scale
        }
    }

    fn counts(value: f64, sensitivity: f64) -> [u8; 2] {
        let raw = (value * sensitivity)
            .round()
            .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
        raw.to_be_bytes()
    }

    /// Refresh the bank 0 data registers from the physical state
    fn sample(&mut self) {
        let accel_scale = AccelScale::from_bits(self.banks[2][ACCEL_CONFIG as usize] >> 1);
        let gyro_scale = GyroScale::from_bits(self.banks[2][GYRO_CONFIG_1 as usize] >> 1);

        for axis in 0..3 {
            let a = self.accel_g[axis] + self.jitter(1.0);
            let g = self.gyro_dps[axis] + self.jitter(10.0);
            let [hi, lo] = Self::counts(a, accel_scale.sensitivity());
            self.banks[0][ACCEL_XOUT_H as usize + 2 * axis] = hi;
            self.banks[0][ACCEL_XOUT_H as usize + 2 * axis + 1] = lo;
            let [hi, lo] = Self::counts(g, gyro_scale.sensitivity());
            self.banks[0][GYRO_XOUT_H as usize + 2 * axis] = hi;
            self.banks[0][GYRO_XOUT_H as usize + 2 * axis + 1] = lo;
        }
        let [hi, lo] = Self::counts(self.temp_c - 21.0, 333.87);
        self.banks[0][TEMP_OUT_H as usize] = hi;
        self.banks[0][TEMP_OUT_H as usize + 1] = lo;
        self.banks[0][INT_STATUS_2 as usize] = u8::from(self.fifo_overflow);
    }
}

/// ICM-20948 register model at rest on a level surface
#[derive(Clone)]
pub struct Icm20948Model {
    inner: Arc<Mutex<ImuState>>,
}

impl Default for Icm20948Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Icm20948Model {
    pub fn new() -> Self {
        let mut state = ImuState {
            banks: [[0; 128]; 4],
            bank: 0,
            accel_g: [0.0, 0.0, 1.0],
            gyro_dps: [0.0; 3],
            temp_c: 25.0,
            noise: 0.01,
            fifo_overflow: false,
            rng: StdRng::seed_from_u64(0x2094_8000),
        };
        state.reset();
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn register(&self, bank: u8, reg: u8) -> u8 {
        self.inner.lock().banks[(bank & 0x03) as usize][(reg & 0x7F) as usize]
    }

    pub fn set_acceleration(&self, g: [f64; 3]) {
        self.inner.lock().accel_g = g;
    }

    pub fn set_rotation(&self, dps: [f64; 3]) {
        self.inner.lock().gyro_dps = dps;
    }

    pub fn set_temperature(&self, celsius: f64) {
        self.inner.lock().temp_c = celsius;
    }

    /// Peak uniform noise in g (gyro noise is ten times this in dps)
    pub fn set_noise(&self, amplitude: f64) {
        self.inner.lock().noise = amplitude.abs();
    }

    pub fn set_fifo_overflow(&self, overflow: bool) {
        self.inner.lock().fifo_overflow = overflow;
    }
}

impl I2cDeviceModel for Icm20948Model {
    fn read(&mut self, reg: u8, n: usize) -> HatResult<Vec<u8>> {
        let mut state = self.inner.lock();
        if reg == REG_BANK_SEL {
            return Ok(vec![(state.bank as u8) << 4; n]);
        }
        if state.bank == 0 {
            state.sample();
        }
        let bank = state.bank;
        let bytes = (0..n)
            .map(|i| state.banks[bank][(reg as usize + i) & 0x7F])
            .collect();
        // Interrupt status clears on read
        if bank == 0 && n > 0 && reg <= INT_STATUS_2 && usize::from(INT_STATUS_2) < usize::from(reg) + n {
            state.fifo_overflow = false;
        }
        Ok(bytes)
    }

    fn write(&mut self, reg: u8, data: &[u8]) -> HatResult<()> {
        let mut state = self.inner.lock();
        if reg == REG_BANK_SEL {
            if let Some(&value) = data.first() {
                state.bank = ((value >> 4) & 0x03) as usize;
            }
            return Ok(());
        }
        let bank = state.bank;
        if bank == 0 && reg == PWR_MGMT_1 && data.first().map_or(false, |v| v & 0x80 != 0) {
            state.reset();
            return Ok(());
        }
        for (i, &byte) in data.iter().enumerate() {
            state.banks[bank][(reg as usize + i) & 0x7F] = byte;
        }
        Ok(())
    }
}

struct MagState {
    registers: [u8; 256],
    field: [i16; 3],
    overflow: bool,
}

/// AK09916 magnetometer model
#[derive(Clone)]
pub struct Ak09916Model {
    inner: Arc<Mutex<MagState>>,
}

impl Default for Ak09916Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Ak09916Model {
    pub fn new() -> Self {
        let mut registers = [0u8; 256];
        registers[0x00] = 0x48;
        registers[AK_WIA2 as usize] = AK_DEVICE_ID;
        Self {
            inner: Arc::new(Mutex::new(MagState {
                registers,
                field: [150, -80, 320],
                overflow: false,
            })),
        }
    }

    pub fn register(&self, reg: u8) -> u8 {
        self.inner.lock().registers[reg as usize]
    }

    /// Field in raw counts
    pub fn set_field(&self, counts: [i16; 3]) {
        self.inner.lock().field = counts;
    }

    pub fn set_overflow(&self, overflow: bool) {
        self.inner.lock().overflow = overflow;
    }
}

impl I2cDeviceModel for Ak09916Model {
    fn read(&mut self, reg: u8, n: usize) -> HatResult<Vec<u8>> {
        let mut state = self.inner.lock();
        let measuring = state.registers[AK_CNTL2 as usize] != 0;
        state.registers[AK_ST1 as usize] = u8::from(measuring);
        let field = state.field;
        for (axis, value) in field.iter().enumerate() {
            let [lo, hi] = value.to_le_bytes();
            state.registers[AK_HXL as usize + 2 * axis] = lo;
            state.registers[AK_HXL as usize + 2 * axis + 1] = hi;
        }
        state.registers[0x18] = if state.overflow { 0x08 } else { 0x00 };
        Ok((0..n)
            .map(|i| state.registers[reg.wrapping_add(i as u8) as usize])
            .collect())
    }

    fn write(&mut self, reg: u8, data: &[u8]) -> HatResult<()> {
        let mut state = self.inner.lock();
        if reg == AK_CNTL3 && data.first().map_or(false, |v| v & 0x01 != 0) {
            state.registers[AK_CNTL2 as usize] = 0;
            return Ok(());
        }
        for (i, &byte) in data.iter().enumerate() {
            state.registers[reg.wrapping_add(i as u8) as usize] = byte;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bank_switching() {
        let mut model = Icm20948Model::new();
        model.write(REG_BANK_SEL, &[2 << 4]).unwrap();
        model.write(ACCEL_CONFIG, &[0x07]).unwrap();
        assert_eq!(model.register(2, ACCEL_CONFIG), 0x07);
        assert_eq!(model.register(0, ACCEL_CONFIG), 0x00);
        assert_eq!(model.read(REG_BANK_SEL, 1).unwrap(), vec![0x20]);
    }

    #[test]
    fn test_reset_restores_identity() {
        let mut model = Icm20948Model::new();
        model.write(PWR_MGMT_1, &[0x01]).unwrap();
        model.write(PWR_MGMT_1, &[0x80]).unwrap();
        assert_eq!(model.read(WHO_AM_I, 1).unwrap(), vec![WHO_AM_I_VALUE]);
        assert_eq!(model.register(0, PWR_MGMT_1), 0x41);
    }
}
