//! WS2812 LED strip driven from an SPI MOSI line
//!
//! At 2.4 MHz one SPI bit lasts ~417 ns, so every WS2812 data bit is sent
//! as three SPI bits: `110` for a one and `100` for a zero. Colours go out
//! in GRB order, followed by a low reset gap.

use serde::{Deserialize, Serialize};

use hatkit_core::device::{Device, DeviceBase};
use hatkit_core::driver::{DriverStatus, InterfaceConfig};
use hatkit_core::error::{HatError, HatResult};

use crate::drivers::bus::SharedSpi;
use crate::drivers::SpiHandle;

pub const SPI_FREQUENCY_HZ: u32 = 2_400_000;
const BIT_ONE: u32 = 0b110;
const BIT_ZERO: u32 = 0b100;
/// Low time after the last pixel, > 280 µs at 2.4 MHz
const RESET_BYTES: usize = 90;

/// 24-bit colour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const OFF: Rgb = Rgb { r: 0, g: 0, b: 0 };

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Scale every component by `brightness` in `[0, 1]`
    pub fn scaled(&self, brightness: f64) -> Self {
        let scale = |c: u8| (f64::from(c) * brightness).round().clamp(0.0, 255.0) as u8;
        Self::new(scale(self.r), scale(self.g), scale(self.b))
    }
}

impl From<u32> for Rgb {
    /// `0xRRGGBB`
    fn from(value: u32) -> Self {
        Self::new((value >> 16) as u8, (value >> 8) as u8, value as u8)
    }
}

/// Expand one colour byte into three SPI bytes, MSB first
pub fn encode_byte(byte: u8) -> [u8; 3] {
    let mut bits: u32 = 0;
    for i in (0..8).rev() {
        bits = (bits << 3) | if byte & (1 << i) != 0 { BIT_ONE } else { BIT_ZERO };
    }
    [(bits >> 16) as u8, (bits >> 8) as u8, bits as u8]
}

/// SPI frame for a whole strip, reset gap included
pub fn encode_frame(pixels: &[Rgb]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pixels.len() * 9 + RESET_BYTES);
    for pixel in pixels {
        for byte in [pixel.g, pixel.r, pixel.b] {
            frame.extend_from_slice(&encode_byte(byte));
        }
    }
    frame.resize(frame.len() + RESET_BYTES, 0);
    frame
}

#[derive(Debug, Clone)]
pub struct LedStripConfig {
    pub count: usize,
    /// Initial brightness in `[0, 1]`
    pub brightness: f64,
    pub spi: InterfaceConfig,
}

impl Default for LedStripConfig {
    fn default() -> Self {
        let mut spi = InterfaceConfig::spi(0, 0);
        spi.max_speed_hz = Some(SPI_FREQUENCY_HZ);
        Self {
            count: 8,
            brightness: 1.0,
            spi,
        }
    }
}

pub struct LedStrip {
    base: DeviceBase<Vec<Rgb>>,
    config: LedStripConfig,
    source: SpiHandle,
    spi: Option<SharedSpi>,
    pixels: Vec<Rgb>,
    brightness: f64,
}

impl LedStrip {
    pub fn new(config: LedStripConfig) -> Self {
        let source = SpiHandle::Owned(config.spi.clone());
        Self::build(config, source)
    }

    pub fn with_bus(spi: SharedSpi, config: LedStripConfig) -> Self {
        Self::build(config, SpiHandle::Borrowed(spi))
    }

    fn build(config: LedStripConfig, source: SpiHandle) -> Self {
        let pixels = vec![Rgb::OFF; config.count];
        let brightness = config.brightness.clamp(0.0, 1.0);
        Self {
            base: DeviceBase::new("led_strip"),
            config,
            source,
            spi: None,
            pixels,
            brightness,
        }
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn pixels(&self) -> &[Rgb] {
        &self.pixels
    }

    pub fn brightness(&self) -> f64 {
        self.brightness
    }

    /// Every pixel dark
    pub fn off(&mut self) -> HatResult<()> {
        self.mono(Rgb::OFF)
    }

    /// Every pixel the same colour
    pub fn mono(&mut self, color: Rgb) -> HatResult<()> {
        self.pixels.iter_mut().for_each(|p| *p = color);
        self.show()
    }

    /// Per-pixel colours; the pattern repeats if shorter than the strip
    pub fn customize(&mut self, pattern: &[Rgb]) -> HatResult<()> {
        if pattern.is_empty() {
            return Err(HatError::invalid_input("empty LED pattern"));
        }
        for (pixel, color) in self.pixels.iter_mut().zip(pattern.iter().cycle()) {
            *pixel = *color;
        }
        self.show()
    }

    /// Re-send the current pixels at a new brightness
    pub fn set_brightness(&mut self, brightness: f64) -> HatResult<()> {
        if !(0.0..=1.0).contains(&brightness) {
            return Err(HatError::invalid_input(format!(
                "brightness {} not in [0, 1]",
                brightness
            )));
        }
        self.brightness = brightness;
        self.show()
    }

    fn show(&mut self) -> HatResult<()> {
        let spi = self
            .spi
            .as_ref()
            .ok_or_else(|| HatError::driver("LED strip not started"))?;
        let scaled: Vec<Rgb> = self.pixels.iter().map(|p| p.scaled(self.brightness)).collect();
        spi.lock().write(&encode_frame(&scaled))?;
        self.base.record(scaled);
        Ok(())
    }
}

impl Device for LedStrip {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn start(&mut self) -> HatResult<()> {
        if self.base.is_active() {
            return Ok(());
        }
        let spi = self.source.acquire(&mut self.base, "spi")?;
        let configured = {
            let mut bus = spi.lock();
            bus.set_mode(0)
                .and_then(|_| bus.set_max_speed_hz(SPI_FREQUENCY_HZ))
        };
        if let Err(e) = configured {
            self.base.fail(&e);
            return Err(e);
        }
        self.spi = Some(spi);
        self.base.mark_ready();
        self.off()
    }

    fn stop(&mut self) -> HatResult<()> {
        if self.spi.is_some() {
            if let Err(e) = self.off() {
                log::warn!("LED strip: failed to blank on stop: {}", e);
            }
        }
        self.spi = None;
        self.base.release();
        Ok(())
    }

    fn status(&self) -> DriverStatus {
        self.base.status()
    }
}

impl Drop for LedStrip {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::bus::{shared_spi, SimulationSpiDriver, SpiLog};

    fn strip(count: usize) -> (LedStrip, SpiLog) {
        let driver = SimulationSpiDriver::new(0, 0);
        let log = driver.log();
        let config = LedStripConfig {
            count,
            ..Default::default()
        };
        let mut strip = LedStrip::with_bus(shared_spi(driver), config);
        strip.start().unwrap();
        (strip, log)
    }

    #[test]
    fn test_bit_expansion() {
        assert_eq!(encode_byte(0x00), [0x92, 0x49, 0x24]);
        assert_eq!(encode_byte(0xFF), [0xDB, 0x6D, 0xB6]);
        // 1000_0000 -> 110 100 100 100 100 100 100 100
        assert_eq!(encode_byte(0x80), [0xD2, 0x49, 0x24]);
    }

    #[test]
    fn test_grb_order_and_reset_gap() {
        let frame = encode_frame(&[Rgb::new(0xFF, 0x00, 0x80)]);
        assert_eq!(frame.len(), 9 + RESET_BYTES);
        assert_eq!(&frame[0..3], &encode_byte(0x00));
        assert_eq!(&frame[3..6], &encode_byte(0xFF));
        assert_eq!(&frame[6..9], &encode_byte(0x80));
        assert!(frame[9..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_mono_customize_brightness() {
        let (mut strip, log) = strip(4);
        assert_eq!(log.frames().len(), 1);

        strip.mono(Rgb::from(0x102030)).unwrap();
        assert!(strip.pixels().iter().all(|&p| p == Rgb::new(0x10, 0x20, 0x30)));

        let red = Rgb::new(200, 0, 0);
        let blue = Rgb::new(0, 0, 200);
        strip.customize(&[red, blue]).unwrap();
        assert_eq!(strip.pixels(), &[red, blue, red, blue]);
        assert!(strip.customize(&[]).is_err());

        strip.set_brightness(0.5).unwrap();
        let sent = log.last().unwrap();
        assert_eq!(&sent[3..6], &encode_byte(100));
        assert!(strip.set_brightness(1.5).is_err());

        strip.stop().unwrap();
        let blank = log.last().unwrap();
        assert!(blank[..36].chunks(3).all(|c| c == encode_byte(0)));
    }
}
