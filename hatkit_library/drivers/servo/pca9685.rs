//! PCA9685 16-channel PWM engine
//!
//! 25 MHz internal oscillator, 12-bit counter. Each channel has an ON and
//! an OFF tick; bit 12 of either forces the output fully on or fully off.

use std::time::Duration;

use hatkit_core::device::{Device, DeviceBase};
use hatkit_core::driver::{DriverStatus, InterfaceConfig};
use hatkit_core::error::{HatError, HatResult};

use crate::drivers::bus::SharedI2c;
use crate::drivers::I2cHandle;

pub const DEFAULT_ADDRESS: u8 = 0x40;
pub const CHANNEL_COUNT: u8 = 16;

pub(crate) const MODE1: u8 = 0x00;
pub(crate) const MODE2: u8 = 0x01;
pub(crate) const LED0_ON_L: u8 = 0x06;
pub(crate) const ALL_LED_ON_L: u8 = 0xFA;
pub(crate) const PRESCALE: u8 = 0xFE;

// MODE1 bits
const RESTART: u8 = 0x80;
const AUTO_INCREMENT: u8 = 0x20;
const SLEEP: u8 = 0x10;
const ALLCALL: u8 = 0x01;
// MODE2 bits
const OUTDRV: u8 = 0x04;

const OSCILLATOR_HZ: f64 = 25_000_000.0;
const COUNTER_TICKS: f64 = 4096.0;
const FULL_BIT: u16 = 0x1000;
const PRESCALE_MIN: u8 = 3;
const PRESCALE_MAX: u8 = 255;

/// Prescaler for `hz`, clamped to the chip's range (~24 Hz to ~1526 Hz)
pub fn prescale_for(hz: f64) -> u8 {
    let raw = (OSCILLATOR_HZ / (COUNTER_TICKS * hz)).round() - 1.0;
    if raw < f64::from(PRESCALE_MIN) || raw > f64::from(PRESCALE_MAX) {
        log::warn!(
            "PCA9685 frequency {} Hz out of range, prescaler {} clamped to [{}, {}]",
            hz,
            raw,
            PRESCALE_MIN,
            PRESCALE_MAX
        );
    }
    raw.clamp(f64::from(PRESCALE_MIN), f64::from(PRESCALE_MAX)) as u8
}

/// Output frequency produced by a prescaler value
pub fn frequency_for(prescale: u8) -> f64 {
    OSCILLATOR_HZ / (COUNTER_TICKS * (f64::from(prescale) + 1.0))
}

/// ON/OFF counter values of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PwmTicks {
    pub on: u16,
    pub off: u16,
}

impl PwmTicks {
    pub const FULL_OFF: PwmTicks = PwmTicks { on: 0, off: FULL_BIT };
    pub const FULL_ON: PwmTicks = PwmTicks { on: FULL_BIT, off: 0 };

    /// Encode `duty` in `[0, 1]` starting `delay` in `[0, 1)` into the period
    pub fn encode(duty: f64, delay: f64) -> HatResult<Self> {
        if !(0.0..=1.0).contains(&duty) {
            return Err(HatError::invalid_input(format!("duty {} not in [0, 1]", duty)));
        }
        if !(0.0..1.0).contains(&delay) {
            return Err(HatError::invalid_input(format!("delay {} not in [0, 1)", delay)));
        }
        if duty == 0.0 {
            return Ok(Self::FULL_OFF);
        }
        if duty == 1.0 {
            return Ok(Self::FULL_ON);
        }
        let on = ((delay * COUNTER_TICKS).round() as i64 - 1).max(0) as u16;
        let active = (duty * COUNTER_TICKS).round() as u16;
        // a full period of ticks needs the FULL_ON bit; on == off would mean zero
        if active >= 4096 {
            return Ok(Self::FULL_ON);
        }
        let off = (on + active) % 4096;
        Ok(Self { on, off })
    }

    /// Register bytes: ON_L, ON_H, OFF_L, OFF_H
    pub fn to_bytes(self) -> [u8; 4] {
        let [on_l, on_h] = self.on.to_le_bytes();
        let [off_l, off_h] = self.off.to_le_bytes();
        [on_l, on_h, off_l, off_h]
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self {
            on: u16::from_le_bytes([bytes[0], bytes[1]]),
            off: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }

    /// Number of counter ticks the output is high
    pub fn active_ticks(&self) -> u16 {
        if self.off & FULL_BIT != 0 {
            0
        } else if self.on & FULL_BIT != 0 {
            4096
        } else {
            (self.off + 4096 - self.on) % 4096
        }
    }
}

/// Target of a channel write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// One of the 16 outputs
    Index(u8),
    /// Every output at once through ALL_LED
    All,
}

impl Channel {
    fn register(self) -> HatResult<u8> {
        match self {
            Channel::All => Ok(ALL_LED_ON_L),
            Channel::Index(ch) if ch < CHANNEL_COUNT => Ok(LED0_ON_L + 4 * ch),
            Channel::Index(ch) => Err(HatError::invalid_input(format!(
                "PCA9685 channel {} not in 0..{}",
                ch, CHANNEL_COUNT
            ))),
        }
    }
}

impl From<u8> for Channel {
    fn from(ch: u8) -> Self {
        Channel::Index(ch)
    }
}

/// Last value written to a channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelWrite {
    pub channel: Channel,
    pub duty: f64,
    pub ticks: PwmTicks,
}

/// PCA9685 configuration
#[derive(Debug, Clone)]
pub struct Pca9685Config {
    /// I2C address (default: 0x40)
    pub address: u8,
    /// PWM frequency applied on start (typically 50 Hz for servos)
    pub frequency: f64,
    /// Bus opened on start when no bus is borrowed
    pub bus: InterfaceConfig,
}

impl Default for Pca9685Config {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            frequency: 50.0,
            bus: InterfaceConfig::i2c(1, DEFAULT_ADDRESS),
        }
    }
}

/// PCA9685 PWM engine
pub struct Pca9685 {
    base: DeviceBase<ChannelWrite>,
    config: Pca9685Config,
    source: I2cHandle,
    bus: Option<SharedI2c>,
    prescale: u8,
}

impl Pca9685 {
    /// Engine that opens its own bus from `config.bus`
    pub fn new(config: Pca9685Config) -> Self {
        let source = I2cHandle::Owned(config.bus.clone());
        Self::build(config, source)
    }

    /// Engine on a bus owned by someone else
    pub fn with_bus(bus: SharedI2c, config: Pca9685Config) -> Self {
        Self::build(config, I2cHandle::Borrowed(bus))
    }

    fn build(config: Pca9685Config, source: I2cHandle) -> Self {
        Self {
            base: DeviceBase::new("pca9685"),
            prescale: prescale_for(config.frequency),
            config,
            source,
            bus: None,
        }
    }

    fn bus(&self) -> HatResult<&SharedI2c> {
        self.bus
            .as_ref()
            .ok_or_else(|| HatError::driver("PCA9685 not started"))
    }

    /// Set the PWM frequency, returning the frequency actually produced
    pub fn set_frequency(&mut self, hz: f64) -> HatResult<f64> {
        if !(hz > 0.0 && hz.is_finite()) {
            return Err(HatError::invalid_input(format!("frequency {} Hz must be positive", hz)));
        }
        let prescale = prescale_for(hz);
        let address = self.config.address;
        {
            let mut bus = self.bus()?.lock();
            let old_mode = bus.read_byte(address, MODE1)?;
            // PRESCALE is only writable while the oscillator sleeps
            bus.write_byte(address, MODE1, (old_mode & 0x7F) | SLEEP)?;
            bus.write_byte(address, PRESCALE, prescale)?;
            bus.write_byte(address, MODE1, old_mode & 0x7F)?;
            std::thread::sleep(Duration::from_micros(500));
            bus.write_byte(address, MODE1, (old_mode & 0x7F) | RESTART)?;
        }
        self.prescale = prescale;
        let actual = frequency_for(prescale);
        log::debug!("PCA9685 prescaler {} ({:.2} Hz)", prescale, actual);
        Ok(actual)
    }

    /// Frequency produced by the current prescaler
    pub fn frequency(&self) -> f64 {
        frequency_for(self.prescale)
    }

    pub fn prescale(&self) -> u8 {
        self.prescale
    }

    /// Write a duty cycle with no phase delay
    pub fn write(&mut self, channel: impl Into<Channel>, duty: f64) -> HatResult<PwmTicks> {
        self.write_with_delay(channel, duty, 0.0)
    }

    /// Write a duty cycle whose active window starts `delay` into the period
    pub fn write_with_delay(
        &mut self,
        channel: impl Into<Channel>,
        duty: f64,
        delay: f64,
    ) -> HatResult<PwmTicks> {
        let channel = channel.into();
        let register = channel.register()?;
        let ticks = PwmTicks::encode(duty, delay)?;
        self.bus()?
            .lock()
            .write(self.config.address, register, &ticks.to_bytes())?;
        self.base.record(ChannelWrite {
            channel,
            duty,
            ticks,
        });
        Ok(ticks)
    }

    /// Write the same duty to several channels
    pub fn write_many(&mut self, channels: &[u8], duty: f64) -> HatResult<()> {
        for &ch in channels {
            self.write(ch, duty)?;
        }
        Ok(())
    }

    /// Read back a channel's counters
    pub fn read_ticks(&self, channel: impl Into<Channel>) -> HatResult<PwmTicks> {
        let register = channel.into().register()?;
        let bytes = self.bus()?.lock().read(self.config.address, register, 4)?;
        match bytes.as_slice() {
            &[a, b, c, d] => Ok(PwmTicks::from_bytes([a, b, c, d])),
            other => Err(HatError::bus(format!("short PCA9685 read ({} bytes)", other.len()))),
        }
    }

    /// Most recent channel writes, oldest first
    pub fn history(&self) -> Vec<ChannelWrite> {
        self.base.buffer().snapshot()
    }
}

impl Device for Pca9685 {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn start(&mut self) -> HatResult<()> {
        if self.base.is_active() {
            return Ok(());
        }
        let bus = self.source.acquire(&mut self.base, "i2c")?;
        self.bus = Some(bus);

        let result = (|| {
            let address = self.config.address;
            {
                let mut bus = self.bus()?.lock();
                bus.write_byte(address, MODE2, OUTDRV)?;
                bus.write_byte(address, MODE1, AUTO_INCREMENT | ALLCALL)?;
            }
            // Oscillator start-up
            std::thread::sleep(Duration::from_micros(500));
            self.set_frequency(self.config.frequency)
        })();

        match result {
            Ok(hz) => {
                log::info!(
                    "PCA9685 at 0x{:02x} running at {:.2} Hz",
                    self.config.address,
                    hz
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
        if self.bus.is_some() {
            for ch in 0..CHANNEL_COUNT {
                if let Err(e) = self.write(ch, 0.0) {
                    log::warn!("PCA9685: failed to zero channel {}: {}", ch, e);
                }
            }
        }
        self.bus = None;
        self.base.release();
        Ok(())
    }

    fn status(&self) -> DriverStatus {
        self.base.status()
    }
}

impl Drop for Pca9685 {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::bus::{shared_i2c, RegisterMap, SimulationI2cDriver};

    fn engine() -> (Pca9685, RegisterMap) {
        let chip = RegisterMap::new();
        let bus = shared_i2c(SimulationI2cDriver::new(1).with_device(DEFAULT_ADDRESS, chip.clone()));
        let mut pca = Pca9685::with_bus(bus, Pca9685Config::default());
        pca.start().unwrap();
        (pca, chip)
    }

    #[test]
    fn test_prescale_range() {
        assert_eq!(prescale_for(50.0), 121);
        assert_eq!(prescale_for(10.0), 255);
        assert_eq!(prescale_for(5000.0), 3);
        assert!((frequency_for(121) - 50.0).abs() < 0.5);
    }

    #[test]
    fn test_prescale_round_trip_monotone() {
        let mut last = 0.0;
        for hz in 24..=1526 {
            let hz = f64::from(hz);
            let actual = frequency_for(prescale_for(hz));
            assert!(actual >= last, "{} Hz went backwards", hz);
            last = actual;

            // One quantum is the step to the next faster prescaler
            let p = prescale_for(hz);
            let quantum = frequency_for(p - 1) - frequency_for(p);
            assert!((actual - hz).abs() <= quantum, "{} Hz -> {} Hz", hz, actual);
        }
    }

    #[test]
    fn test_encode_edges() {
        assert_eq!(PwmTicks::encode(0.0, 0.3).unwrap(), PwmTicks::FULL_OFF);
        assert_eq!(PwmTicks::encode(1.0, 0.3).unwrap(), PwmTicks::FULL_ON);
        assert_eq!(PwmTicks::encode(0.5, 0.0).unwrap(), PwmTicks { on: 0, off: 2048 });
        assert!(PwmTicks::encode(1.5, 0.0).is_err());
        assert!(PwmTicks::encode(0.5, 1.0).is_err());
    }

    #[test]
    fn test_encode_near_full_duty_stays_on() {
        for (duty, delay) in [(0.9999, 0.0), (0.99995, 0.5), (0.99988, 0.25)] {
            let ticks = PwmTicks::encode(duty, delay).unwrap();
            assert_eq!(ticks, PwmTicks::FULL_ON);
            assert_eq!(ticks.active_ticks(), 4096);
        }
        let ticks = PwmTicks::encode(0.9997, 0.0).unwrap();
        assert_eq!(ticks.active_ticks(), 4095);
    }

    #[test]
    fn test_active_ticks_match_duty() {
        for duty_step in 1..100 {
            let duty = f64::from(duty_step) / 100.0;
            for delay_step in 0..10 {
                let delay = f64::from(delay_step) / 10.0;
                let ticks = PwmTicks::encode(duty, delay).unwrap();
                assert_eq!(ticks.on & FULL_BIT, 0);
                assert_eq!(ticks.off & FULL_BIT, 0);
                assert_eq!(ticks.active_ticks(), (duty * 4096.0).round() as u16);
            }
        }
    }

    #[test]
    fn test_frequency_protocol() {
        let (mut pca, chip) = engine();
        chip.clear_writes();
        let hz = pca.set_frequency(60.0).unwrap();
        assert!((hz - 60.0).abs() < 1.0);

        let writes = chip.writes();
        let sequence: Vec<(u8, u8)> = writes.iter().map(|(r, d)| (*r, d[0])).collect();
        let mode = AUTO_INCREMENT | ALLCALL;
        assert_eq!(
            sequence,
            vec![
                (MODE1, mode | SLEEP),
                (PRESCALE, prescale_for(60.0)),
                (MODE1, mode),
                (MODE1, mode | RESTART),
            ]
        );
    }

    #[test]
    fn test_all_channels_register() {
        let (mut pca, chip) = engine();
        pca.write(Channel::All, 0.25).unwrap();
        assert_eq!(chip.get(ALL_LED_ON_L + 2), 0x00);
        assert_eq!(chip.get(ALL_LED_ON_L + 3), 0x04);
        assert!(pca.write(16, 0.5).is_err());
    }

    #[test]
    fn test_stop_turns_everything_off() {
        let (mut pca, chip) = engine();
        pca.write_many(&[0, 5, 15], 0.4).unwrap();
        pca.stop().unwrap();
        pca.stop().unwrap();
        for ch in 0..CHANNEL_COUNT {
            let reg = LED0_ON_L + 4 * ch;
            assert_eq!(chip.get(reg + 3), 0x10, "channel {} still on", ch);
        }
        assert_eq!(pca.status(), DriverStatus::Shutdown);
        assert!(pca.write(0, 0.5).is_err());
    }
}
