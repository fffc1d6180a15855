//! MCP3002 10-bit, 2-channel SPI ADC
//!
//! A background thread samples both channels every `interval` and keeps the
//! last `samples` conversions per channel; reads return the window mean.
//! With the defaults (100 samples, 1 ms) a fresh converter needs ~100 ms
//! before its first reading, and readings lag the input by up to that much.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use hatkit_core::device::{Device, DeviceBase};
use hatkit_core::driver::{DriverStatus, InterfaceConfig};
use hatkit_core::error::{HatError, HatResult};
use hatkit_core::event::Event;

use super::{check_channel, Adc, AdcReading};
use crate::drivers::bus::SharedSpi;
use crate::drivers::SpiHandle;
use crate::messages::sensor::stamp_now;

const CHANNELS: u8 = 2;
/// Start bit, single-ended, MSB first
const CMD_BASE: u8 = 0x68;

/// Command byte for a single-ended read of `channel`
pub fn command(channel: u8) -> u8 {
    CMD_BASE | ((channel & 0x01) << 4)
}

/// 10-bit result from the two reply bytes
pub fn decode(rx: &[u8]) -> u16 {
    match rx {
        [hi, lo, ..] => (u16::from(hi & 0x03) << 8) | u16::from(*lo),
        _ => 0,
    }
}

/// MCP3002 configuration
#[derive(Debug, Clone)]
pub struct Mcp3002Config {
    pub reference_voltage: f64,
    /// Conversions averaged per reading; 1 reads the chip directly
    pub samples: usize,
    /// Averaging thread period
    pub interval: Duration,
    pub bus: InterfaceConfig,
}

impl Default for Mcp3002Config {
    fn default() -> Self {
        let mut bus = InterfaceConfig::spi(0, 0);
        bus.max_speed_hz = Some(1_000_000);
        Self {
            reference_voltage: 3.3,
            samples: 100,
            interval: Duration::from_millis(1),
            bus,
        }
    }
}

#[derive(Default)]
struct Windows {
    channels: [VecDeque<u16>; 2],
}

#[derive(Default)]
struct Averages {
    windows: Mutex<Windows>,
    filled: Condvar,
}

struct Sampler {
    run: Event,
    thread: JoinHandle<()>,
}

pub struct Mcp3002 {
    base: DeviceBase<AdcReading>,
    config: Mcp3002Config,
    source: SpiHandle,
    spi: Option<SharedSpi>,
    averages: Arc<Averages>,
    sampler: Option<Sampler>,
}

fn convert(spi: &SharedSpi, channel: u8) -> HatResult<u16> {
    let rx = spi.lock().transfer(&[command(channel), 0x00])?;
    Ok(decode(&rx))
}

impl Mcp3002 {
    pub fn new(config: Mcp3002Config) -> Self {
        let source = SpiHandle::Owned(config.bus.clone());
        Self::build(config, source)
    }

    pub fn with_bus(spi: SharedSpi, config: Mcp3002Config) -> Self {
        Self::build(config, SpiHandle::Borrowed(spi))
    }

    fn build(config: Mcp3002Config, source: SpiHandle) -> Self {
        Self {
            base: DeviceBase::new("mcp3002"),
            config,
            source,
            spi: None,
            averages: Arc::new(Averages::default()),
            sampler: None,
        }
    }

    fn start_sampler(&mut self, spi: SharedSpi) -> HatResult<()> {
        let run = Event::new();
        run.set();
        let flag = run.clone();
        let averages = Arc::clone(&self.averages);
        let samples = self.config.samples;
        let interval = self.config.interval;

        let thread = std::thread::Builder::new()
            .name("mcp3002-avg".to_string())
            .spawn(move || {
                while flag.is_set() {
                    for channel in 0..CHANNELS {
                        match convert(&spi, channel) {
                            Ok(raw) => {
                                let mut windows = averages.windows.lock();
                                let window = &mut windows.channels[channel as usize];
                                if window.len() >= samples {
                                    window.pop_front();
                                }
                                window.push_back(raw);
                            }
                            Err(e) => log::warn!("MCP3002 conversion failed: {}", e),
                        }
                    }
                    averages.filled.notify_all();
                    std::thread::sleep(interval);
                }
            })
            .map_err(|e| HatError::driver(format!("failed to spawn MCP3002 sampler: {}", e)))?;

        self.sampler = Some(Sampler { run, thread });
        Ok(())
    }

    fn stop_sampler(&mut self) {
        if let Some(sampler) = self.sampler.take() {
            sampler.run.clear();
            let _ = sampler.thread.join();
        }
        let mut windows = self.averages.windows.lock();
        for window in windows.channels.iter_mut() {
            window.clear();
        }
    }

    /// Mean of the channel's window, waiting for it to fill
    fn averaged(&self, channel: u8) -> HatResult<u16> {
        let samples = self.config.samples;
        // Generous bound: a full window plus scheduling slack
        let deadline = std::time::Instant::now()
            + self.config.interval * (samples as u32).saturating_mul(10)
            + Duration::from_secs(1);

        let mut windows = self.averages.windows.lock();
        loop {
            let window = &windows.channels[channel as usize];
            if window.len() >= samples {
                let sum: u32 = window.iter().map(|&v| u32::from(v)).sum();
                return Ok((f64::from(sum) / window.len() as f64).round() as u16);
            }
            if self
                .averages
                .filled
                .wait_until(&mut windows, deadline)
                .timed_out()
            {
                return Err(HatError::Timeout(format!(
                    "MCP3002 channel {} window not filled",
                    channel
                )));
            }
        }
    }
}

impl Adc for Mcp3002 {
    fn channel_count(&self) -> u8 {
        CHANNELS
    }

    fn resolution_bits(&self) -> u8 {
        10
    }

    fn reference_voltage(&self) -> f64 {
        self.config.reference_voltage
    }

    fn read_raw(&mut self, channel: u8) -> HatResult<u16> {
        check_channel(channel, CHANNELS)?;
        let spi = self
            .spi
            .clone()
            .ok_or_else(|| HatError::driver("MCP3002 not started"))?;
        let raw = if self.sampler.is_some() {
            self.averaged(channel)?
        } else {
            convert(&spi, channel)?
        };
        self.base.record(AdcReading {
            stamp_nanos: stamp_now(),
            channel,
            raw,
            voltage: f64::from(raw) / 1023.0 * self.config.reference_voltage,
        });
        Ok(raw)
    }
}

impl Device for Mcp3002 {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn start(&mut self) -> HatResult<()> {
        if self.base.is_active() {
            return Ok(());
        }
        let spi = self.source.acquire(&mut self.base, "spi")?;
        if self.config.samples > 1 {
            if let Err(e) = self.start_sampler(spi.clone()) {
                self.base.release();
                return Err(e);
            }
        }
        self.spi = Some(spi);
        self.base.mark_ready();
        Ok(())
    }

    fn stop(&mut self) -> HatResult<()> {
        self.stop_sampler();
        self.spi = None;
        self.base.release();
        Ok(())
    }

    fn status(&self) -> DriverStatus {
        self.base.status()
    }
}

impl Drop for Mcp3002 {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::bus::{shared_spi, SimulationSpiDriver};

    /// Channel 0 reads 512, channel 1 reads 1023
    fn chip() -> SimulationSpiDriver {
        SimulationSpiDriver::new(0, 0).with_responder(|tx| {
            let code: u16 = if tx[0] & 0x10 == 0 { 512 } else { 1023 };
            vec![((code >> 8) & 0x03) as u8, (code & 0xFF) as u8]
        })
    }

    #[test]
    fn test_command_and_decode() {
        assert_eq!(command(0), 0x68);
        assert_eq!(command(1), 0x78);
        assert_eq!(decode(&[0xFE, 0x34]), 0x234);
        assert_eq!(decode(&[0x01]), 0);
    }

    #[test]
    fn test_direct_read() {
        let config = Mcp3002Config {
            samples: 1,
            ..Default::default()
        };
        let mut adc = Mcp3002::with_bus(shared_spi(chip()), config);
        adc.start().unwrap();
        assert_eq!(adc.read_raw(0).unwrap(), 512);
        assert_eq!(adc.read_raw(1).unwrap(), 1023);
        assert!((adc.read_voltage(1).unwrap() - 3.3).abs() < 1e-9);
        assert!(adc.read_raw(2).is_err());
    }

    #[test]
    fn test_averaging_thread() {
        let config = Mcp3002Config {
            samples: 5,
            ..Default::default()
        };
        let mut adc = Mcp3002::with_bus(shared_spi(chip()), config);
        adc.start().unwrap();
        assert_eq!(adc.read_raw(0).unwrap(), 512);
        assert_eq!(adc.read_raw(1).unwrap(), 1023);
        adc.stop().unwrap();
        adc.stop().unwrap();
        assert!(adc.read_raw(0).is_err());
    }
}
