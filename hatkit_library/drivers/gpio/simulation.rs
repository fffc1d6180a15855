//! Simulation GPIO driver
//!
//! In-memory pin table with the same semantics as the native backend.
//! Test code drives inputs through a [`SimulationGpioHandle`], which stays
//! usable after the driver itself has been boxed into a device. Edge
//! callbacks run on a dedicated event thread, like rppal's interrupt thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;

use hatkit_core::clock::{Clock, SystemClock};
use hatkit_core::device::Interface;
use hatkit_core::error::{HatError, HatResult};

use super::{
    Direction, Edge, EdgeCallback, EdgeDispatch, EdgeEvent, Gpio, PinConfig, PinTable, Pull,
    WriteAction,
};

/// One recorded output write
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub pin: String,
    pub value: f64,
    pub at: Duration,
}

/// Echo-style link: a falling edge on `source` produces a high pulse on `target`
#[derive(Debug, Clone)]
struct PulseLink {
    source: String,
    target: String,
    delay: Duration,
    width: Duration,
}

#[derive(Default)]
struct SimState {
    pins: PinTable,
    levels: HashMap<String, u8>,
    links: Vec<PulseLink>,
    /// target pin -> (start, end) of the scheduled pulse
    pulses: HashMap<String, (Duration, Duration)>,
    writes: Vec<WriteRecord>,
    dispatch: EdgeDispatch,
    open: bool,
}

struct SimShared {
    state: Mutex<SimState>,
    clock: Arc<dyn Clock>,
    events: Mutex<Option<Sender<(EdgeCallback, EdgeEvent)>>>,
}

impl SimShared {
    fn deliver(&self, pending: Option<(EdgeCallback, EdgeEvent)>) {
        if let Some(pending) = pending {
            if let Some(tx) = self.events.lock().as_ref() {
                let _ = tx.send(pending);
            }
        }
    }
}

/// Simulation GPIO driver
pub struct SimulationGpioDriver {
    shared: Arc<SimShared>,
    event_thread: Option<JoinHandle<()>>,
}

impl SimulationGpioDriver {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// Use `clock` for edge timestamps, debounce windows and pulse links
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (tx, rx) = unbounded::<(EdgeCallback, EdgeEvent)>();
        let event_thread = std::thread::Builder::new()
            .name("sim-gpio-events".to_string())
            .spawn(move || {
                for (callback, event) in rx.iter() {
                    callback.invoke(&event);
                }
            })
            .ok();

        let state = SimState {
            open: true,
            ..Default::default()
        };
        Self {
            shared: Arc::new(SimShared {
                state: Mutex::new(state),
                clock,
                events: Mutex::new(Some(tx)),
            }),
            event_thread,
        }
    }

    pub fn handle(&self) -> SimulationGpioHandle {
        SimulationGpioHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn state(&self) -> HatResult<parking_lot::MutexGuard<'_, SimState>> {
        let state = self.shared.state.lock();
        if !state.open {
            return Err(HatError::driver("simulated GPIO is closed"));
        }
        Ok(state)
    }
}

impl Default for SimulationGpioDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SimulationGpioDriver {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Test-side view of a [`SimulationGpioDriver`]
#[derive(Clone)]
pub struct SimulationGpioHandle {
    shared: Arc<SimShared>,
}

impl SimulationGpioHandle {
    /// Drive an input level, generating an edge if it changed
    pub fn set_input_level(&self, pin: &str, level: u8) {
        let level = level.min(1);
        let now = self.shared.clock.now();
        let pending = {
            let mut state = self.shared.state.lock();
            let previous = state.levels.insert(pin.to_string(), level);
            let changed = previous.map(|p| p != level).unwrap_or(level == 1);
            if changed {
                state.dispatch.on_edge(pin, level == 1, now)
            } else {
                None
            }
        };
        self.shared.deliver(pending);
    }

    /// Schedule a `width` high pulse on `target` starting `delay` after
    /// every falling edge written to `source`
    pub fn link_pulse(&self, source: &str, target: &str, delay: Duration, width: Duration) {
        self.shared.state.lock().links.push(PulseLink {
            source: source.to_string(),
            target: target.to_string(),
            delay,
            width,
        });
    }

    pub fn level(&self, pin: &str) -> u8 {
        self.shared.state.lock().levels.get(pin).copied().unwrap_or(0)
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.shared.state.lock().writes.clone()
    }

    pub fn writes_to(&self, pin: &str) -> Vec<WriteRecord> {
        self.shared
            .state
            .lock()
            .writes
            .iter()
            .filter(|w| w.pin == pin)
            .cloned()
            .collect()
    }

    pub fn pin_config(&self, pin: &str) -> Option<PinConfig> {
        self.shared.state.lock().pins.get(pin).ok().cloned()
    }

    pub fn is_open(&self) -> bool {
        self.shared.state.lock().open
    }
}

impl Interface for SimulationGpioDriver {
    fn backend(&self) -> &str {
        "simulation"
    }

    fn close(&mut self) -> HatResult<()> {
        self.shared.state.lock().open = false;
        self.shared.events.lock().take();
        if let Some(thread) = self.event_thread.take() {
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
        Ok(())
    }
}

impl Gpio for SimulationGpioDriver {
    fn configure(&mut self, pin: &str, direction: Direction, pull: Option<Pull>) -> HatResult<()> {
        let mut state = self.state()?;
        state.pins.configure(pin, direction, pull);
        state.dispatch.clear(pin);
        let level = match (direction, pull) {
            (Direction::Input, Some(Pull::Up)) => 1,
            _ => 0,
        };
        state.levels.insert(pin.to_string(), level);
        Ok(())
    }

    fn write(&mut self, pin: &str, value: f64) -> HatResult<()> {
        let now = self.shared.clock.now();
        let mut state = self.state()?;
        let action = state.pins.resolve_write(pin, value)?;
        state.writes.push(WriteRecord {
            pin: pin.to_string(),
            value,
            at: now,
        });

        if let WriteAction::Level(level) = action {
            let previous = state.levels.insert(pin.to_string(), level);
            if previous == Some(1) && level == 0 {
                let triggered: Vec<PulseLink> = state
                    .links
                    .iter()
                    .filter(|l| l.source == pin)
                    .cloned()
                    .collect();
                for link in triggered {
                    let start = now + link.delay;
                    state.pulses.insert(link.target, (start, start + link.width));
                }
            }
        }
        Ok(())
    }

    fn read(&mut self, pin: &str) -> HatResult<u8> {
        let now = self.shared.clock.now();
        let state = self.state()?;
        state.pins.get(pin)?;
        if let Some(&(start, end)) = state.pulses.get(pin) {
            return Ok(u8::from(now >= start && now < end));
        }
        Ok(state.levels.get(pin).copied().unwrap_or(0))
    }

    fn pwm_enable(&mut self, pin: &str, enable: bool) -> HatResult<()> {
        let mut state = self.state()?;
        state.pins.set_pwm(pin, enable)?;
        if !enable {
            state.levels.insert(pin.to_string(), 0);
        }
        Ok(())
    }

    fn set_frequency(&mut self, pin: &str, hz: f64) -> HatResult<()> {
        self.state()?.pins.set_frequency(pin, hz).map(|_| ())
    }

    fn set_edge(&mut self, pin: &str, edge: Option<Edge>) -> HatResult<()> {
        let mut state = self.state()?;
        state.pins.input_mut(pin)?.edge = edge;
        state.dispatch.set_edge(pin, edge);
        Ok(())
    }

    fn set_debounce(&mut self, pin: &str, ms: u64) -> HatResult<()> {
        let mut state = self.state()?;
        state.pins.input_mut(pin)?.debounce_ms = ms;
        state.dispatch.set_debounce(pin, Duration::from_millis(ms));
        Ok(())
    }

    fn on_event(&mut self, pin: &str, callback: Option<EdgeCallback>) -> HatResult<()> {
        let mut state = self.state()?;
        state.pins.input_mut(pin)?.has_callback = callback.is_some();
        state.dispatch.set_callback(pin, callback);
        Ok(())
    }

    fn pin_config(&self, pin: &str) -> HatResult<PinConfig> {
        self.state()?.pins.get(pin).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::Sender;
    use hatkit_core::clock::VirtualClock;
    use std::any::Any;

    fn forward(event: &EdgeEvent, context: &(dyn Any + Send + Sync)) {
        if let Some(tx) = context.downcast_ref::<Mutex<Sender<EdgeEvent>>>() {
            let _ = tx.lock().send(event.clone());
        }
    }

    #[test]
    fn test_pwm_lifecycle() {
        let mut gpio = SimulationGpioDriver::new();
        gpio.configure("18", Direction::Output, None).unwrap();
        assert!(!gpio.pin_config("18").unwrap().pwm_enabled());

        gpio.pwm_enable("18", true).unwrap();
        gpio.write("18", 0.3).unwrap();
        gpio.set_frequency("18", 500.0).unwrap();
        let pwm = gpio.pin_config("18").unwrap().pwm.unwrap();
        assert_eq!(pwm.duty, 0.3);
        assert_eq!(pwm.frequency_hz, 500.0);

        gpio.pwm_enable("18", false).unwrap();
        gpio.write("18", 3.0).unwrap();
        assert_eq!(gpio.read("18").unwrap(), 1);
    }

    #[test]
    fn test_callbacks_run_on_event_thread() {
        let clock = Arc::new(VirtualClock::new());
        let mut gpio = SimulationGpioDriver::with_clock(clock.clone());
        let handle = gpio.handle();
        let (tx, rx) = crossbeam::channel::unbounded::<EdgeEvent>();

        gpio.configure("17", Direction::Input, Some(Pull::Down)).unwrap();
        gpio.set_edge("17", Some(Edge::Both)).unwrap();
        gpio.on_event("17", Some(EdgeCallback::new(forward, Arc::new(Mutex::new(tx)))))
            .unwrap();

        handle.set_input_level("17", 1);
        clock.advance(Duration::from_millis(3));
        handle.set_input_level("17", 0);

        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(first.rising);
        assert!(!second.rising);
        assert_eq!(second.timestamp, Duration::from_millis(3));
    }

    #[test]
    fn test_pulse_link() {
        let clock = Arc::new(VirtualClock::new());
        let mut gpio = SimulationGpioDriver::with_clock(clock.clone());
        gpio.handle().link_pulse(
            "23",
            "24",
            Duration::from_micros(100),
            Duration::from_millis(2),
        );
        gpio.configure("23", Direction::Output, None).unwrap();
        gpio.configure("24", Direction::Input, None).unwrap();

        gpio.write("23", 1.0).unwrap();
        gpio.write("23", 0.0).unwrap();
        assert_eq!(gpio.read("24").unwrap(), 0);
        clock.advance(Duration::from_micros(150));
        assert_eq!(gpio.read("24").unwrap(), 1);
        clock.advance(Duration::from_millis(2));
        assert_eq!(gpio.read("24").unwrap(), 0);
    }

    #[test]
    fn test_edge_on_output_is_rejected() {
        let mut gpio = SimulationGpioDriver::new();
        gpio.configure("22", Direction::Output, None).unwrap();
        assert!(gpio.set_edge("22", Some(Edge::Rising)).is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut gpio = SimulationGpioDriver::new();
        let handle = gpio.handle();
        gpio.close().unwrap();
        gpio.close().unwrap();
        assert!(!handle.is_open());
        assert!(gpio.read("1").is_err());
    }
}
