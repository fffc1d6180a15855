//! GPIO expanders
//!
//! Port expanders implement the same [`Gpio`](crate::drivers::gpio::Gpio)
//! contract as the native backend, so any driver that takes a GPIO can be
//! wired to expander pins instead.
//!
//! # Available Drivers
//!
//! - `Mcp23017Driver` - MCP23017 16-bit expander over I2C, with a polling
//!   interrupt thread
//! - `Mcp23017Model` - register-level model of the chip for the simulated I2C bus

mod mcp23017;

pub use mcp23017::{
    parse_expander_pin, Mcp23017Config, Mcp23017Driver, Mcp23017Model, Port, DEFAULT_ADDRESS,
};
