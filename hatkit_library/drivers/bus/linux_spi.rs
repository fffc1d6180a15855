//! Linux SPI driver
//!
//! SPI master using the Linux spidev interface (`/dev/spidevP.D`).
//! Requires the `spi-hardware` feature.

use std::io::{Read, Write};
use std::path::Path;

use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};

use hatkit_core::device::Interface;
use hatkit_core::error::{HatError, HatResult};

use super::{SpiBus, SpiSettings};

/// Linux SPI driver configuration
#[derive(Debug, Clone)]
pub struct LinuxSpiConfig {
    pub port: u8,
    /// Chip select
    pub device: u8,
    pub settings: SpiSettings,
    /// Bits per word
    pub bits_per_word: u8,
}

impl Default for LinuxSpiConfig {
    fn default() -> Self {
        Self {
            port: 0,
            device: 0,
            settings: SpiSettings::default(),
            bits_per_word: 8,
        }
    }
}

impl LinuxSpiConfig {
    pub fn device_path(&self) -> String {
        format!("/dev/spidev{}.{}", self.port, self.device)
    }
}

/// Linux SPI driver using spidev
pub struct LinuxSpiDriver {
    config: LinuxSpiConfig,
    device: Option<Spidev>,
}

impl LinuxSpiDriver {
    pub fn open(config: LinuxSpiConfig) -> HatResult<Self> {
        config.settings.validate()?;
        let path = config.device_path();
        if !Path::new(&path).exists() {
            return Err(HatError::NotInstalledInterface(format!("spi ({} missing)", path)));
        }

        let spi = Spidev::open(&path)
            .map_err(|e| HatError::backend_init("spidev", format!("{}: {}", path, e)))?;

        let mut driver = Self {
            config,
            device: Some(spi),
        };
        let settings = driver.config.settings;
        driver.configure(settings)?;
        log::debug!("Opened SPI device {}", path);
        Ok(driver)
    }

    fn configure(&mut self, settings: SpiSettings) -> HatResult<()> {
        let mode = match settings.mode {
            0 => SpiModeFlags::SPI_MODE_0,
            1 => SpiModeFlags::SPI_MODE_1,
            2 => SpiModeFlags::SPI_MODE_2,
            _ => SpiModeFlags::SPI_MODE_3,
        };

        let options = SpidevOptions::new()
            .bits_per_word(self.config.bits_per_word)
            .max_speed_hz(settings.max_speed_hz)
            .lsb_first(settings.lsb_first)
            .mode(mode)
            .build();

        self.spi()?
            .configure(&options)
            .map_err(|e| HatError::config(format!("Failed to configure SPI: {}", e)))?;
        self.config.settings = settings;
        Ok(())
    }

    fn spi(&mut self) -> HatResult<&mut Spidev> {
        let path = self.config.device_path();
        self.device
            .as_mut()
            .ok_or_else(|| HatError::driver(format!("SPI device {} is closed", path)))
    }
}

impl Interface for LinuxSpiDriver {
    fn backend(&self) -> &str {
        "spidev"
    }

    fn close(&mut self) -> HatResult<()> {
        if self.device.take().is_some() {
            log::debug!("Closed SPI device {}", self.config.device_path());
        }
        Ok(())
    }
}

impl SpiBus for LinuxSpiDriver {
    fn read(&mut self, n: usize) -> HatResult<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.spi()?
            .read_exact(&mut buf)
            .map_err(|e| HatError::bus(format!("SPI read failed: {}", e)))?;
        Ok(buf)
    }

    fn write(&mut self, data: &[u8]) -> HatResult<()> {
        self.spi()?
            .write_all(data)
            .map_err(|e| HatError::bus(format!("SPI write failed: {}", e)))
    }

    fn transfer(&mut self, data: &[u8]) -> HatResult<Vec<u8>> {
        let mut rx = vec![0u8; data.len()];
        {
            let mut transfer = SpidevTransfer::read_write(data, &mut rx);
            self.spi()?
                .transfer(&mut transfer)
                .map_err(|e| HatError::bus(format!("SPI transfer failed: {}", e)))?;
        }
        Ok(rx)
    }

    fn settings(&self) -> SpiSettings {
        self.config.settings
    }

    fn apply_settings(&mut self, settings: SpiSettings) -> HatResult<()> {
        settings.validate()?;
        self.configure(settings)
    }
}
