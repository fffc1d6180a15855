//! Raspberry Pi GPIO driver
//!
//! Native GPIO through rppal. Soft PWM uses rppal's software PWM thread;
//! edge callbacks are delivered on rppal's interrupt thread after passing
//! the shared debounce gate.
//! Requires the `gpio-hardware` feature.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rppal::gpio::{Gpio as RppalGpio, InputPin, Level, OutputPin, Trigger};

use hatkit_core::clock::{Clock, SystemClock};
use hatkit_core::device::Interface;
use hatkit_core::error::{HatError, HatResult};

use super::{
    parse_bcm, Direction, Edge, EdgeCallback, EdgeDispatch, Gpio, PinConfig, PinTable, Pull,
    WriteAction,
};

enum RppalPin {
    Input(InputPin),
    Output(OutputPin),
}

/// Raspberry Pi GPIO driver
pub struct RppalGpioDriver {
    gpio: Option<RppalGpio>,
    pins: HashMap<String, RppalPin>,
    table: PinTable,
    dispatch: Arc<Mutex<EdgeDispatch>>,
    clock: Arc<dyn Clock>,
}

fn gpio_error(pin: &str, e: rppal::gpio::Error) -> HatError {
    HatError::bus(format!("GPIO {}: {}", pin, e))
}

impl RppalGpioDriver {
    pub fn open() -> HatResult<Self> {
        let gpio = RppalGpio::new().map_err(|e| match e {
            rppal::gpio::Error::UnknownModel => {
                HatError::NotInstalledInterface("gpio (not a Raspberry Pi)".to_string())
            }
            other => HatError::backend_init("rppal", other.to_string()),
        })?;

        log::debug!("Opened rppal GPIO");
        Ok(Self {
            gpio: Some(gpio),
            pins: HashMap::new(),
            table: PinTable::new(),
            dispatch: Arc::new(Mutex::new(EdgeDispatch::new())),
            clock: SystemClock::shared(),
        })
    }

    fn gpio(&self) -> HatResult<&RppalGpio> {
        self.gpio
            .as_ref()
            .ok_or_else(|| HatError::driver("rppal GPIO is closed"))
    }

    fn output(&mut self, pin: &str) -> HatResult<&mut OutputPin> {
        match self.pins.get_mut(pin) {
            Some(RppalPin::Output(out)) => Ok(out),
            _ => Err(HatError::config(format!("pin '{}' is not an output", pin))),
        }
    }

    fn input(&mut self, pin: &str) -> HatResult<&mut InputPin> {
        match self.pins.get_mut(pin) {
            Some(RppalPin::Input(input)) => Ok(input),
            _ => Err(HatError::config(format!("pin '{}' is not an input", pin))),
        }
    }

    /// Reinstall (or clear) the rppal interrupt to match the armed edge
    fn sync_interrupt(&mut self, pin: &str) -> HatResult<()> {
        let edge = self.dispatch.lock().edge(pin);
        let dispatch = Arc::clone(&self.dispatch);
        let clock = Arc::clone(&self.clock);
        let name = pin.to_string();
        let input = self.input(pin)?;

        let trigger = match edge {
            None => {
                input.clear_async_interrupt().map_err(|e| gpio_error(pin, e))?;
                return Ok(());
            }
            Some(Edge::Rising) => Trigger::RisingEdge,
            Some(Edge::Falling) => Trigger::FallingEdge,
            Some(Edge::Both) => Trigger::Both,
        };

        input
            .set_async_interrupt(trigger, move |level: Level| {
                let pending = dispatch
                    .lock()
                    .on_edge(&name, level == Level::High, clock.now());
                if let Some((callback, event)) = pending {
                    callback.invoke(&event);
                }
            })
            .map_err(|e| gpio_error(pin, e))
    }
}

impl Interface for RppalGpioDriver {
    fn backend(&self) -> &str {
        "rppal"
    }

    fn close(&mut self) -> HatResult<()> {
        for (_, pin) in self.pins.drain() {
            if let RppalPin::Input(mut input) = pin {
                let _ = input.clear_async_interrupt();
            }
        }
        if self.gpio.take().is_some() {
            log::debug!("Closed rppal GPIO");
        }
        Ok(())
    }
}

impl Gpio for RppalGpioDriver {
    fn configure(&mut self, pin: &str, direction: Direction, pull: Option<Pull>) -> HatResult<()> {
        let bcm = parse_bcm(pin)?;
        // Release the old handle first so rppal lets us take the pin again
        self.pins.remove(pin);
        let raw = self.gpio()?.get(bcm).map_err(|e| gpio_error(pin, e))?;

        let handle = match direction {
            Direction::Output => RppalPin::Output(raw.into_output()),
            Direction::Input => RppalPin::Input(match pull {
                Some(Pull::Up) => raw.into_input_pullup(),
                Some(Pull::Down) => raw.into_input_pulldown(),
                _ => raw.into_input(),
            }),
        };
        self.pins.insert(pin.to_string(), handle);
        self.table.configure(pin, direction, pull);
        self.dispatch.lock().clear(pin);
        Ok(())
    }

    fn write(&mut self, pin: &str, value: f64) -> HatResult<()> {
        let action = self.table.resolve_write(pin, value)?;
        let frequency = self
            .table
            .get(pin)?
            .pwm
            .map(|p| p.frequency_hz)
            .unwrap_or_default();
        let out = self.output(pin)?;
        match action {
            WriteAction::Duty(duty) => out
                .set_pwm_frequency(frequency, duty)
                .map_err(|e| gpio_error(pin, e)),
            WriteAction::Level(1) => {
                out.set_high();
                Ok(())
            }
            WriteAction::Level(_) => {
                out.set_low();
                Ok(())
            }
        }
    }

    fn read(&mut self, pin: &str) -> HatResult<u8> {
        let level = match self.pins.get(pin) {
            Some(RppalPin::Input(input)) => input.read(),
            Some(RppalPin::Output(out)) => {
                if out.is_set_high() {
                    Level::High
                } else {
                    Level::Low
                }
            }
            None => return Err(HatError::config(format!("pin '{}' is not configured", pin))),
        };
        Ok(u8::from(level == Level::High))
    }

    fn pwm_enable(&mut self, pin: &str, enable: bool) -> HatResult<()> {
        let generator = self.table.set_pwm(pin, enable)?;
        let out = self.output(pin)?;
        match generator {
            Some(pwm) => out
                .set_pwm_frequency(pwm.frequency_hz, pwm.duty)
                .map_err(|e| gpio_error(pin, e)),
            None => {
                out.clear_pwm().map_err(|e| gpio_error(pin, e))?;
                out.set_low();
                Ok(())
            }
        }
    }

    fn set_frequency(&mut self, pin: &str, hz: f64) -> HatResult<()> {
        let pwm = self.table.set_frequency(pin, hz)?;
        self.output(pin)?
            .set_pwm_frequency(pwm.frequency_hz, pwm.duty)
            .map_err(|e| gpio_error(pin, e))
    }

    fn set_edge(&mut self, pin: &str, edge: Option<Edge>) -> HatResult<()> {
        self.table.input_mut(pin)?.edge = edge;
        self.dispatch.lock().set_edge(pin, edge);
        self.sync_interrupt(pin)
    }

    fn set_debounce(&mut self, pin: &str, ms: u64) -> HatResult<()> {
        self.table.input_mut(pin)?.debounce_ms = ms;
        self.dispatch
            .lock()
            .set_debounce(pin, Duration::from_millis(ms));
        Ok(())
    }

    fn on_event(&mut self, pin: &str, callback: Option<EdgeCallback>) -> HatResult<()> {
        self.table.input_mut(pin)?.has_callback = callback.is_some();
        self.dispatch.lock().set_callback(pin, callback);
        Ok(())
    }

    fn pin_config(&self, pin: &str) -> HatResult<PinConfig> {
        self.table.get(pin).cloned()
    }
}
