//! Push button on a GPIO input
//!
//! Edges are handled on the backend's event thread; the button keeps its
//! pressed state and a press counter in atomics the caller can poll.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hatkit_core::device::{Device, DeviceBase};
use hatkit_core::driver::{DriverStatus, InterfaceConfig};
use hatkit_core::error::{HatError, HatResult};
use hatkit_core::event::Event;

use crate::drivers::gpio::{Direction, Edge, EdgeCallback, EdgeEvent, Pull, SharedGpio};
use crate::drivers::GpioHandle;

#[derive(Debug, Clone)]
pub struct ButtonConfig {
    pub pin: String,
    /// Pressed pulls the line low (pull-up wiring)
    pub active_low: bool,
    pub debounce_ms: u64,
    pub gpio: InterfaceConfig,
}

impl Default for ButtonConfig {
    fn default() -> Self {
        Self {
            pin: "26".to_string(),
            active_low: true,
            debounce_ms: 50,
            gpio: InterfaceConfig::default(),
        }
    }
}

#[derive(Debug, Default)]
struct ButtonState {
    active_low: bool,
    pressed: AtomicBool,
    presses: AtomicU64,
    press_event: Event,
}

fn on_edge(event: &EdgeEvent, context: &(dyn Any + Send + Sync)) {
    let Some(state) = context.downcast_ref::<ButtonState>() else {
        return;
    };
    let pressed = event.rising != state.active_low;
    let was = state.pressed.swap(pressed, Ordering::AcqRel);
    if pressed && !was {
        state.presses.fetch_add(1, Ordering::AcqRel);
        state.press_event.set();
    }
}

pub struct Button {
    base: DeviceBase<bool>,
    config: ButtonConfig,
    source: GpioHandle,
    gpio: Option<SharedGpio>,
    state: Arc<ButtonState>,
}

impl Button {
    pub fn new(config: ButtonConfig) -> Self {
        let source = GpioHandle::Owned(config.gpio.clone());
        Self::build(config, source)
    }

    pub fn with_gpio(gpio: SharedGpio, config: ButtonConfig) -> Self {
        Self::build(config, GpioHandle::Borrowed(gpio))
    }

    fn build(config: ButtonConfig, source: GpioHandle) -> Self {
        let state = Arc::new(ButtonState {
            active_low: config.active_low,
            ..Default::default()
        });
        Self {
            base: DeviceBase::new("button"),
            config,
            source,
            gpio: None,
            state,
        }
    }

    /// Pressed state as last seen by the edge callback
    pub fn is_pressed(&self) -> bool {
        self.state.pressed.load(Ordering::Acquire)
    }

    /// Presses since start
    pub fn presses(&self) -> u64 {
        self.state.presses.load(Ordering::Acquire)
    }

    /// Sample the pin directly
    pub fn read(&mut self) -> HatResult<bool> {
        let gpio = self
            .gpio
            .clone()
            .ok_or_else(|| HatError::driver("button not started"))?;
        let high = gpio.lock().is_high(&self.config.pin)?;
        let pressed = high != self.config.active_low;
        self.base.record(pressed);
        Ok(pressed)
    }

    /// Block until the next press, or `timeout`
    pub fn wait_for_press(&self, timeout: Duration) -> bool {
        let pressed = self.state.press_event.wait_timeout(timeout);
        self.state.press_event.clear();
        pressed
    }

    fn configure(&self, gpio: &SharedGpio) -> HatResult<()> {
        let pin = self.config.pin.as_str();
        let pull = if self.config.active_low { Pull::Up } else { Pull::Down };
        let mut gpio = gpio.lock();
        gpio.configure(pin, Direction::Input, Some(pull))?;
        gpio.set_debounce(pin, self.config.debounce_ms)?;
        gpio.set_edge(pin, Some(Edge::Both))?;
        gpio.on_event(pin, Some(EdgeCallback::new(on_edge, self.state.clone())))
    }
}

impl Device for Button {
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
        self.state.presses.store(0, Ordering::Release);
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

    #[test]
    fn test_press_and_release() {
        let clock = Arc::new(VirtualClock::new());
        let driver = SimulationGpioDriver::with_clock(clock.clone());
        let handle = driver.handle();
        let mut button = Button::with_gpio(shared_gpio(driver), ButtonConfig::default());
        button.start().unwrap();
        assert!(!button.read().unwrap());

        clock.advance(Duration::from_millis(100));
        handle.set_input_level("26", 0);
        assert!(button.wait_for_press(Duration::from_secs(1)));
        assert!(button.is_pressed());
        assert!(button.read().unwrap());

        clock.advance(Duration::from_millis(100));
        handle.set_input_level("26", 1);
        clock.advance(Duration::from_millis(100));
        handle.set_input_level("26", 0);
        assert!(button.wait_for_press(Duration::from_secs(1)));
        assert_eq!(button.presses(), 2);

        button.stop().unwrap();
        button.stop().unwrap();
        assert!(button.read().is_err());
    }
}
