//! Bus drivers (I2C, SPI)
//!
//! Every bus backend implements a narrow capability trait on top of
//! [`Interface`]. Drivers hold buses as boxed trait objects so the backend
//! can be picked at runtime by the [`factory`](crate::drivers::factory).
//!
//! # Available Drivers
//!
//! ## I2C
//! - `SimulationI2cDriver` - Always available, register maps or custom device models
//! - `LinuxI2cDriver` - Linux i2c-dev interface (requires `i2c-hardware` feature)
//!
//! ## SPI
//! - `SimulationSpiDriver` - Always available, scripted responses
//! - `LinuxSpiDriver` - Linux spidev interface (requires `spi-hardware` feature)

mod simulation;

#[cfg(feature = "i2c-hardware")]
mod linux_i2c;

#[cfg(feature = "spi-hardware")]
mod linux_spi;

pub use simulation::{
    FaultInjector, I2cDeviceModel, RegisterMap, SimulationI2cDriver, SimulationSpiDriver, SpiLog,
};

#[cfg(feature = "i2c-hardware")]
pub use linux_i2c::{LinuxI2cConfig, LinuxI2cDriver};

#[cfg(feature = "spi-hardware")]
pub use linux_spi::{LinuxSpiConfig, LinuxSpiDriver};

use hatkit_core::device::{share, Interface, Shared};
use hatkit_core::error::{HatError, HatResult};

/// Largest block an SMBus-style transfer may move in one go
pub const MAX_I2C_BLOCK: usize = 32;

// ============================================================================
// I2C
// ============================================================================

/// Register-oriented I2C master
pub trait I2cBus: Interface {
    /// Read `n` bytes starting at `reg`. Requests above [`MAX_I2C_BLOCK`]
    /// are clamped.
    fn read(&mut self, addr: u8, reg: u8, n: usize) -> HatResult<Vec<u8>>;

    /// Write `data` starting at `reg`
    fn write(&mut self, addr: u8, reg: u8, data: &[u8]) -> HatResult<()>;

    /// Write `reg` plus `write` bytes, then repeated-start read `read_n` bytes
    fn combined(&mut self, addr: u8, reg: u8, write: &[u8], read_n: usize)
        -> HatResult<Vec<u8>>;

    fn read_byte(&mut self, addr: u8, reg: u8) -> HatResult<u8> {
        let bytes = self.read(addr, reg, 1)?;
        bytes
            .first()
            .copied()
            .ok_or_else(|| HatError::bus(format!("short read from 0x{:02x}:0x{:02x}", addr, reg)))
    }

    fn write_byte(&mut self, addr: u8, reg: u8, value: u8) -> HatResult<()> {
        self.write(addr, reg, &[value])
    }

    /// Read-modify-write of the bits selected by `mask`
    fn update_bits(&mut self, addr: u8, reg: u8, mask: u8, value: u8) -> HatResult<()> {
        let current = self.read_byte(addr, reg)?;
        let next = (current & !mask) | (value & mask);
        if next != current {
            self.write_byte(addr, reg, next)?;
        }
        Ok(())
    }
}

/// I2C bus shared between drivers or between a driver and its worker thread
pub type SharedI2c = Shared<dyn I2cBus>;

/// Box and share a concrete I2C backend
pub fn shared_i2c<B: I2cBus + 'static>(bus: B) -> SharedI2c {
    let boxed: Box<dyn I2cBus> = Box::new(bus);
    share(boxed)
}

// ============================================================================
// SPI
// ============================================================================

/// SPI line settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiSettings {
    /// SPI mode (0-3)
    pub mode: u8,
    pub lsb_first: bool,
    pub max_speed_hz: u32,
}

impl Default for SpiSettings {
    fn default() -> Self {
        Self {
            mode: 0,
            lsb_first: false,
            max_speed_hz: 1_000_000,
        }
    }
}

impl SpiSettings {
    pub fn validate(&self) -> HatResult<()> {
        if self.mode > 3 {
            return Err(HatError::config(format!("SPI mode {} not in 0..=3", self.mode)));
        }
        if self.max_speed_hz == 0 {
            return Err(HatError::config("SPI max_speed_hz must be positive"));
        }
        Ok(())
    }
}

/// Full-duplex SPI master bound to one chip select
pub trait SpiBus: Interface {
    fn read(&mut self, n: usize) -> HatResult<Vec<u8>>;

    fn write(&mut self, data: &[u8]) -> HatResult<()>;

    /// Clock `data` out while clocking the same number of bytes in
    fn transfer(&mut self, data: &[u8]) -> HatResult<Vec<u8>>;

    fn settings(&self) -> SpiSettings;

    fn apply_settings(&mut self, settings: SpiSettings) -> HatResult<()>;

    fn mode(&self) -> u8 {
        self.settings().mode
    }

    fn set_mode(&mut self, mode: u8) -> HatResult<()> {
        let settings = SpiSettings { mode, ..self.settings() };
        self.apply_settings(settings)
    }

    fn lsb_first(&self) -> bool {
        self.settings().lsb_first
    }

    fn set_lsb_first(&mut self, lsb_first: bool) -> HatResult<()> {
        let settings = SpiSettings { lsb_first, ..self.settings() };
        self.apply_settings(settings)
    }

    fn max_speed_hz(&self) -> u32 {
        self.settings().max_speed_hz
    }

    fn set_max_speed_hz(&mut self, max_speed_hz: u32) -> HatResult<()> {
        let settings = SpiSettings { max_speed_hz, ..self.settings() };
        self.apply_settings(settings)
    }
}

pub type SharedSpi = Shared<dyn SpiBus>;

/// Box and share a concrete SPI backend
pub fn shared_spi<B: SpiBus + 'static>(bus: B) -> SharedSpi {
    let boxed: Box<dyn SpiBus> = Box::new(bus);
    share(boxed)
}

// ============================================================================
// Helpers shared by backends
// ============================================================================

/// Clamp an I2C read length to [`MAX_I2C_BLOCK`]
pub(crate) fn clamp_read_len(addr: u8, reg: u8, n: usize) -> usize {
    if n > MAX_I2C_BLOCK {
        log::warn!(
            "I2C read of {} bytes at 0x{:02x}:0x{:02x} clamped to {}",
            n,
            addr,
            reg,
            MAX_I2C_BLOCK
        );
        MAX_I2C_BLOCK
    } else {
        n
    }
}

/// Run a bus transfer, retrying once on a transient failure
pub(crate) fn retry_once<T, F>(mut op: F) -> HatResult<T>
where
    F: FnMut() -> HatResult<T>,
{
    match op() {
        Err(e) if e.is_transient() => {
            log::debug!("Retrying bus transfer after: {}", e);
            op()
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_once_recovers_single_fault() {
        let mut calls = 0;
        let result = retry_once(|| {
            calls += 1;
            if calls == 1 {
                Err(HatError::bus("nack"))
            } else {
                Ok(7u8)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_retry_once_gives_up_after_second_fault() {
        let mut calls = 0;
        let result: HatResult<()> = retry_once(|| {
            calls += 1;
            Err(HatError::bus("nack"))
        });
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_non_transient_is_not_retried() {
        let mut calls = 0;
        let result: HatResult<()> = retry_once(|| {
            calls += 1;
            Err(HatError::config("bad"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_spi_settings_validation() {
        assert!(SpiSettings::default().validate().is_ok());
        let bad = SpiSettings { mode: 5, ..Default::default() };
        assert!(bad.validate().is_err());
    }
}
