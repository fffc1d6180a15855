//! Single-channel wheel encoder
//!
//! Counts edges from a slotted disc or hall sensor on the GPIO backend's
//! event thread and derives wheel speed from the spacing of recent edges.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use hatkit_core::clock::{Clock, SystemClock};
use hatkit_core::device::{Device, DeviceBase};
use hatkit_core::driver::{DriverStatus, InterfaceConfig};
use hatkit_core::error::{HatError, HatResult};

use crate::drivers::gpio::{Direction, Edge, EdgeCallback, EdgeEvent, Pull, SharedGpio};
use crate::drivers::GpioHandle;
use crate::messages::sensor::{stamp_now, EncoderTicks};

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub pin: String,
    /// Counted edges per wheel revolution
    pub pulses_per_rev: u32,
    pub edge: Edge,
    pub debounce_ms: u64,
    /// Edges kept for the speed estimate
    pub window: usize,
    /// No edge for this long means the wheel stopped
    pub stall_timeout: Duration,
    pub gpio: InterfaceConfig,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            pin: "25".to_string(),
            pulses_per_rev: 20,
            edge: Edge::Rising,
            debounce_ms: 0,
            window: 10,
            stall_timeout: Duration::from_secs(1),
            gpio: InterfaceConfig::default(),
        }
    }
}

#[derive(Debug, Default)]
struct EncoderState {
    ticks: AtomicU64,
    window: usize,
    stamps: Mutex<VecDeque<Duration>>,
}

fn on_edge(event: &EdgeEvent, context: &(dyn Any + Send + Sync)) {
    let Some(state) = context.downcast_ref::<EncoderState>() else {
        return;
    };
    state.ticks.fetch_add(1, Ordering::AcqRel);
    let mut stamps = state.stamps.lock();
    if stamps.len() >= state.window {
        stamps.pop_front();
    }
    stamps.push_back(event.timestamp);
}

pub struct WheelEncoder {
    base: DeviceBase<EncoderTicks>,
    config: EncoderConfig,
    source: GpioHandle,
    gpio: Option<SharedGpio>,
    state: Arc<EncoderState>,
    clock: Arc<dyn Clock>,
}

impl WheelEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        let source = GpioHandle::Owned(config.gpio.clone());
        Self::build(config, source)
    }

    pub fn with_gpio(gpio: SharedGpio, config: EncoderConfig) -> Self {
        Self::build(config, GpioHandle::Borrowed(gpio))
    }

    fn build(config: EncoderConfig, source: GpioHandle) -> Self {
        let state = Arc::new(EncoderState {
            window: config.window.max(2),
            ..Default::default()
        });
        Self {
            base: DeviceBase::new("wheel_encoder"),
            config,
            source,
            gpio: None,
            state,
            clock: SystemClock::shared(),
        }
    }

    /// Must be the clock the GPIO backend stamps edges with
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ticks(&self) -> u64 {
        self.state.ticks.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.state.ticks.store(0, Ordering::Release);
        self.state.stamps.lock().clear();
    }

    /// Wheel speed from the edges in the window
    pub fn rpm(&self) -> f64 {
        let stamps = self.state.stamps.lock();
        let (Some(&first), Some(&last)) = (stamps.front(), stamps.back()) else {
            return 0.0;
        };
        if stamps.len() < 2 || self.clock.now().saturating_sub(last) > self.config.stall_timeout {
            return 0.0;
        }
        let span = (last - first).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        let revs = (stamps.len() - 1) as f64 / f64::from(self.config.pulses_per_rev);
        revs / span * 60.0
    }

    /// Snapshot of ticks and speed
    pub fn read(&mut self) -> HatResult<EncoderTicks> {
        if self.gpio.is_none() {
            return Err(HatError::driver("encoder not started"));
        }
        let sample = EncoderTicks {
            stamp_nanos: stamp_now(),
            ticks: self.ticks(),
            rpm: self.rpm(),
        };
        self.base.record(sample);
        Ok(sample)
    }

    fn configure(&self, gpio: &SharedGpio) -> HatResult<()> {
        let pin = self.config.pin.as_str();
        let mut gpio = gpio.lock();
        gpio.configure(pin, Direction::Input, Some(Pull::Up))?;
        gpio.set_debounce(pin, self.config.debounce_ms)?;
        gpio.set_edge(pin, Some(self.config.edge))?;
        gpio.on_event(pin, Some(EdgeCallback::new(on_edge, self.state.clone())))
    }
}

impl Device for WheelEncoder {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn start(&mut self) -> HatResult<()> {
        if self.base.is_active() {
            return Ok(());
        }
        let gpio = self.source.acquire(&mut self.base, "gpio")?;
        if let Err(e) = self.configure(&gpio) {
            self.base.fail(&e);
            return Err(e);
        }
        self.reset();
        self.gpio = Some(gpio);
        self.base.mark_ready();
        Ok(())
    }

    fn stop(&mut self) -> HatResult<()> {
        if let Some(gpio) = self.gpio.take() {
            let mut gpio = gpio.lock();
            let _ = gpio.on_event(&self.config.pin, None);
            let _ = gpio.set_edge(&self.config.pin, None);
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
    use crate::drivers::gpio::{shared_gpio, SimulationGpioDriver};
    use hatkit_core::clock::VirtualClock;
    use std::time::Instant;

    fn wait_for_ticks(encoder: &WheelEncoder, n: u64) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while encoder.ticks() < n && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_ticks_and_rpm() {
        let clock = Arc::new(VirtualClock::new());
        let driver = SimulationGpioDriver::with_clock(clock.clone());
        let handle = driver.handle();
        let mut encoder = WheelEncoder::with_gpio(shared_gpio(driver), EncoderConfig::default())
            .with_clock(clock.clone());
        encoder.start().unwrap();

        // 50 rising edges per second on a 20-slot disc is 150 rpm
        handle.set_input_level("25", 0);
        for _ in 0..10 {
            clock.advance(Duration::from_millis(10));
            handle.set_input_level("25", 1);
            clock.advance(Duration::from_millis(10));
            handle.set_input_level("25", 0);
        }
        wait_for_ticks(&encoder, 10);

        let sample = encoder.read().unwrap();
        assert_eq!(sample.ticks, 10);
        assert!((sample.rpm - 150.0).abs() < 1e-6, "{}", sample.rpm);

        clock.advance(Duration::from_secs(2));
        assert_eq!(encoder.rpm(), 0.0);
    }

    #[test]
    fn test_read_before_start() {
        let mut encoder = WheelEncoder::new(EncoderConfig::default());
        assert!(encoder.read().is_err());
        assert_eq!(encoder.rpm(), 0.0);
    }
}
