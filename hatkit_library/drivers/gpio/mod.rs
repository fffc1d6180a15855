//! GPIO drivers
//!
//! One capability trait, [`Gpio`], shared by the native backend, the
//! simulation backend and the MCP23017 port expander. Pins are addressed by
//! name: native backends accept BCM numbers (`"18"`, `"GPIO18"`), the
//! expander accepts `A_0`..`B_7`.
//!
//! # Available Drivers
//!
//! - `SimulationGpioDriver` - Always available, scripted inputs and pulse links
//! - `RppalGpioDriver` - Raspberry Pi GPIO via rppal (requires `gpio-hardware` feature)
//! - `Mcp23017Driver` - I2C port expander (see [`expander`](crate::drivers::expander))
//!
//! # Pin model
//!
//! A pin is either an input (optional pull, edge detection, debounce,
//! callback) or an output (optional soft PWM). Switching direction clears
//! the attributes of the other side.

mod debounce;
mod simulation;

#[cfg(feature = "gpio-hardware")]
mod rppal;

pub use debounce::{DebounceGate, DebounceState, EdgeDispatch};
pub use simulation::{SimulationGpioDriver, SimulationGpioHandle, WriteRecord};

#[cfg(feature = "gpio-hardware")]
pub use self::rppal::RppalGpioDriver;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hatkit_core::device::{share, Interface, Shared};
use hatkit_core::error::{HatError, HatResult};

/// Frequency a freshly enabled soft-PWM generator starts at
pub const SOFT_PWM_DEFAULT_HZ: f64 = 1.0;

/// Pin direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

/// Input bias
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pull {
    Up,
    Down,
    Float,
}

/// Edge selection for interrupts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    pub fn matches(&self, rising: bool) -> bool {
        match self {
            Edge::Rising => rising,
            Edge::Falling => !rising,
            Edge::Both => true,
        }
    }
}

/// Soft-PWM generator state of an output pin
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftPwm {
    pub frequency_hz: f64,
    pub duty: f64,
}

impl Default for SoftPwm {
    fn default() -> Self {
        Self {
            frequency_hz: SOFT_PWM_DEFAULT_HZ,
            duty: 0.0,
        }
    }
}

/// Current configuration of one pin
#[derive(Debug, Clone, PartialEq)]
pub struct PinConfig {
    pub direction: Direction,
    /// Inputs only
    pub pull: Option<Pull>,
    /// Outputs only
    pub pwm: Option<SoftPwm>,
    /// Inputs only
    pub edge: Option<Edge>,
    pub debounce_ms: u64,
    pub has_callback: bool,
}

impl PinConfig {
    pub fn input(pull: Option<Pull>) -> Self {
        Self {
            direction: Direction::Input,
            pull,
            pwm: None,
            edge: None,
            debounce_ms: 0,
            has_callback: false,
        }
    }

    pub fn output() -> Self {
        Self {
            direction: Direction::Output,
            pull: None,
            pwm: None,
            edge: None,
            debounce_ms: 0,
            has_callback: false,
        }
    }

    pub fn pwm_enabled(&self) -> bool {
        self.pwm.is_some()
    }

    pub fn is_input(&self) -> bool {
        self.direction == Direction::Input
    }
}

/// Edge notification handed to callbacks
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeEvent {
    pub pin: String,
    pub rising: bool,
    /// Clock time at detection
    pub timestamp: Duration,
}

/// Callback signature; the second argument is the registered context
pub type EdgeHandler = fn(&EdgeEvent, &(dyn Any + Send + Sync));

/// A `(handler, context)` pair attached to an input pin
///
/// Handlers run on the backend's event thread and must not block.
#[derive(Clone)]
pub struct EdgeCallback {
    handler: EdgeHandler,
    context: Arc<dyn Any + Send + Sync>,
}

impl EdgeCallback {
    pub fn new<C: Any + Send + Sync>(handler: EdgeHandler, context: Arc<C>) -> Self {
        Self { handler, context }
    }

    pub fn invoke(&self, event: &EdgeEvent) {
        (self.handler)(event, self.context.as_ref());
    }
}

impl std::fmt::Debug for EdgeCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeCallback").finish_non_exhaustive()
    }
}

/// GPIO capability
pub trait Gpio: Interface {
    /// (Re)configure a pin. Switching direction clears PWM on outputs and
    /// edge/callback on inputs.
    fn configure(&mut self, pin: &str, direction: Direction, pull: Option<Pull>) -> HatResult<()>;

    /// Drive an output. On a PWM pin `value` is the duty cycle in `[0, 1]`;
    /// otherwise it is clamped to a level of 0 or 1.
    fn write(&mut self, pin: &str, value: f64) -> HatResult<()>;

    /// Sample a pin level (0 or 1)
    fn read(&mut self, pin: &str) -> HatResult<u8>;

    /// Allocate (1 Hz, duty 0) or release the soft-PWM generator of an output
    fn pwm_enable(&mut self, pin: &str, enable: bool) -> HatResult<()>;

    fn set_frequency(&mut self, pin: &str, hz: f64) -> HatResult<()>;

    /// Arm (`Some`) or disarm (`None`) edge detection on an input
    fn set_edge(&mut self, pin: &str, edge: Option<Edge>) -> HatResult<()>;

    fn set_debounce(&mut self, pin: &str, ms: u64) -> HatResult<()>;

    /// Attach or detach the edge callback of an input
    fn on_event(&mut self, pin: &str, callback: Option<EdgeCallback>) -> HatResult<()>;

    fn pin_config(&self, pin: &str) -> HatResult<PinConfig>;

    fn set_level(&mut self, pin: &str, high: bool) -> HatResult<()> {
        self.write(pin, if high { 1.0 } else { 0.0 })
    }

    fn is_high(&mut self, pin: &str) -> HatResult<bool> {
        Ok(self.read(pin)? == 1)
    }
}

pub type SharedGpio = Shared<dyn Gpio>;

/// Box and share a concrete GPIO backend
pub fn shared_gpio<G: Gpio + 'static>(gpio: G) -> SharedGpio {
    let boxed: Box<dyn Gpio> = Box::new(gpio);
    share(boxed)
}

// ============================================================================
// Pin bookkeeping shared by backends
// ============================================================================

/// What a `write` call resolves to
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriteAction {
    Level(u8),
    Duty(f64),
}

/// Pin configuration table every backend keeps
#[derive(Debug, Default)]
pub struct PinTable {
    pins: HashMap<String, PinConfig>,
}

impl PinTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(&mut self, pin: &str, direction: Direction, pull: Option<Pull>) -> &PinConfig {
        let config = match direction {
            Direction::Input => PinConfig::input(pull.or(Some(Pull::Float))),
            Direction::Output => PinConfig::output(),
        };
        self.pins.insert(pin.to_string(), config);
        &self.pins[pin]
    }

    pub fn get(&self, pin: &str) -> HatResult<&PinConfig> {
        self.pins
            .get(pin)
            .ok_or_else(|| HatError::config(format!("pin '{}' is not configured", pin)))
    }

    pub fn get_mut(&mut self, pin: &str) -> HatResult<&mut PinConfig> {
        self.pins
            .get_mut(pin)
            .ok_or_else(|| HatError::config(format!("pin '{}' is not configured", pin)))
    }

    pub fn output_mut(&mut self, pin: &str) -> HatResult<&mut PinConfig> {
        let config = self.get_mut(pin)?;
        if config.is_input() {
            return Err(HatError::config(format!("pin '{}' is an input", pin)));
        }
        Ok(config)
    }

    pub fn input_mut(&mut self, pin: &str) -> HatResult<&mut PinConfig> {
        let config = self.get_mut(pin)?;
        if !config.is_input() {
            return Err(HatError::config(format!("pin '{}' is an output", pin)));
        }
        Ok(config)
    }

    /// Validate a write and update the stored duty cycle
    pub fn resolve_write(&mut self, pin: &str, value: f64) -> HatResult<WriteAction> {
        let config = self.output_mut(pin)?;
        match config.pwm.as_mut() {
            Some(pwm) => {
                if !(0.0..=1.0).contains(&value) {
                    return Err(HatError::invalid_input(format!(
                        "duty {} on pin '{}' not in [0, 1]",
                        value, pin
                    )));
                }
                pwm.duty = value;
                Ok(WriteAction::Duty(value))
            }
            None => Ok(WriteAction::Level(value.clamp(0.0, 1.0).round() as u8)),
        }
    }

    /// Toggle the soft-PWM generator; returns the new generator if enabled
    pub fn set_pwm(&mut self, pin: &str, enable: bool) -> HatResult<Option<SoftPwm>> {
        let config = self.output_mut(pin)?;
        config.pwm = if enable {
            Some(config.pwm.unwrap_or_default())
        } else {
            None
        };
        Ok(config.pwm)
    }

    pub fn set_frequency(&mut self, pin: &str, hz: f64) -> HatResult<SoftPwm> {
        if !(hz > 0.0) {
            return Err(HatError::invalid_input(format!("frequency {} Hz must be positive", hz)));
        }
        let config = self.output_mut(pin)?;
        let pwm = config
            .pwm
            .as_mut()
            .ok_or_else(|| HatError::config(format!("pin '{}' has no PWM generator", pin)))?;
        pwm.frequency_hz = hz;
        Ok(*pwm)
    }

    pub fn pins(&self) -> impl Iterator<Item = (&String, &PinConfig)> {
        self.pins.iter()
    }
}

/// Parse a native pin name (`"18"`, `"GPIO18"`, `"BCM18"`) into a BCM number
pub fn parse_bcm(pin: &str) -> HatResult<u8> {
    let digits = pin
        .trim()
        .trim_start_matches("GPIO")
        .trim_start_matches("BCM")
        .trim_start_matches("gpio");
    digits
        .parse::<u8>()
        .map_err(|_| HatError::config(format!("'{}' is not a BCM pin number", pin)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_pin_starts_without_pwm() {
        let mut table = PinTable::new();
        table.configure("18", Direction::Output, None);
        assert!(!table.get("18").unwrap().pwm_enabled());

        let pwm = table.set_pwm("18", true).unwrap().unwrap();
        assert_eq!(pwm, SoftPwm { frequency_hz: 1.0, duty: 0.0 });

        table.configure("18", Direction::Output, None);
        assert!(!table.get("18").unwrap().pwm_enabled());
    }

    #[test]
    fn test_direction_change_clears_attributes() {
        let mut table = PinTable::new();
        table.configure("5", Direction::Input, Some(Pull::Up));
        table.input_mut("5").unwrap().edge = Some(Edge::Rising);

        let config = table.configure("5", Direction::Output, None).clone();
        assert_eq!(config.pull, None);
        assert_eq!(config.edge, None);

        table.set_pwm("5", true).unwrap();
        let config = table.configure("5", Direction::Input, None).clone();
        assert!(!config.pwm_enabled());
        assert_eq!(config.pull, Some(Pull::Float));
    }

    #[test]
    fn test_resolve_write() {
        let mut table = PinTable::new();
        table.configure("4", Direction::Output, None);
        assert_eq!(table.resolve_write("4", 5.0).unwrap(), WriteAction::Level(1));
        assert_eq!(table.resolve_write("4", -2.0).unwrap(), WriteAction::Level(0));

        table.set_pwm("4", true).unwrap();
        assert_eq!(table.resolve_write("4", 0.25).unwrap(), WriteAction::Duty(0.25));
        assert!(table.resolve_write("4", 1.5).is_err());
        assert_eq!(table.get("4").unwrap().pwm.unwrap().duty, 0.25);

        table.configure("6", Direction::Input, None);
        assert!(table.resolve_write("6", 1.0).is_err());
    }

    #[test]
    fn test_set_frequency_requires_generator() {
        let mut table = PinTable::new();
        table.configure("12", Direction::Output, None);
        assert!(table.set_frequency("12", 100.0).is_err());
        table.set_pwm("12", true).unwrap();
        assert_eq!(table.set_frequency("12", 100.0).unwrap().frequency_hz, 100.0);
        assert!(table.set_frequency("12", 0.0).is_err());
    }

    #[test]
    fn test_parse_bcm() {
        assert_eq!(parse_bcm("18").unwrap(), 18);
        assert_eq!(parse_bcm("GPIO23").unwrap(), 23);
        assert_eq!(parse_bcm("BCM4").unwrap(), 4);
        assert!(parse_bcm("A_0").is_err());
    }

    #[test]
    fn test_edge_matching() {
        assert!(Edge::Rising.matches(true));
        assert!(!Edge::Rising.matches(false));
        assert!(Edge::Falling.matches(false));
        assert!(Edge::Both.matches(true) && Edge::Both.matches(false));
    }
}
