//! MCP23017 I2C GPIO expander
//!
//! Pins are named `A_0..A_7` and `B_0..B_7`. Every attribute is one bit in a
//! per-port register, updated with read-modify-write (IOCON.BANK = 0 layout,
//! port B register = port A register + 1).
//!
//! The chip's INT line is usually not wired to the host, so interrupts are
//! emulated: a poller thread reads INTF/INTCAP at ~100 Hz, runs flagged bits
//! through the debounce gates and invokes callbacks after releasing the bus.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use hatkit_core::clock::{Clock, SystemClock};
use hatkit_core::device::{share, Interface};
use hatkit_core::driver::InterfaceConfig;
use hatkit_core::error::{HatError, HatResult};
use hatkit_core::event::Event;

use crate::drivers::bus::{I2cDeviceModel, SharedI2c};
use crate::drivers::factory;
use crate::drivers::gpio::{
    Direction, Edge, EdgeCallback, EdgeDispatch, Gpio, PinConfig, PinTable, Pull, WriteAction,
};

pub const DEFAULT_ADDRESS: u8 = 0x20;

// Register map (IOCON.BANK = 0), port A addresses
const IODIR: u8 = 0x00;
const IPOL: u8 = 0x02;
const GPINTEN: u8 = 0x04;
const DEFVAL: u8 = 0x06;
const INTCON: u8 = 0x08;
const IOCON: u8 = 0x0A;
const GPPU: u8 = 0x0C;
const INTF: u8 = 0x0E;
const INTCAP: u8 = 0x10;
const GPIO: u8 = 0x12;
const OLAT: u8 = 0x14;

const REGISTER_COUNT: usize = 0x16;

/// Expander port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    A,
    B,
}

impl Port {
    fn offset(self) -> u8 {
        match self {
            Port::A => 0,
            Port::B => 1,
        }
    }

    fn reg(self, base: u8) -> u8 {
        base + self.offset()
    }
}

/// Parse `A_3` / `B_7` into port and bit
pub fn parse_expander_pin(pin: &str) -> HatResult<(Port, u8)> {
    let invalid = || HatError::config(format!("'{}' is not an expander pin (A_0..B_7)", pin));
    let (port, bit) = pin.trim().split_once('_').ok_or_else(invalid)?;
    let port = match port {
        "A" | "a" => Port::A,
        "B" | "b" => Port::B,
        _ => return Err(invalid()),
    };
    let bit: u8 = bit.parse().map_err(|_| invalid())?;
    if bit > 7 {
        return Err(invalid());
    }
    Ok((port, bit))
}

fn pin_name(port: usize, bit: u8) -> String {
    format!("{}_{}", if port == 0 { 'A' } else { 'B' }, bit)
}

/// MCP23017 configuration
#[derive(Debug, Clone)]
pub struct Mcp23017Config {
    /// I2C address (0x20-0x27)
    pub address: u8,
    /// Interrupt poll period
    pub poll_interval: Duration,
    /// Bus to open when the expander creates its own bus
    pub bus: InterfaceConfig,
}

impl Default for Mcp23017Config {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            poll_interval: Duration::from_millis(10),
            bus: InterfaceConfig::i2c(1, DEFAULT_ADDRESS),
        }
    }
}

struct Poller {
    run: Event,
    thread: JoinHandle<()>,
}

/// MCP23017 expander implementing [`Gpio`]
pub struct Mcp23017Driver {
    config: Mcp23017Config,
    bus: SharedI2c,
    owns_bus: bool,
    table: PinTable,
    events: Arc<Mutex<EdgeDispatch>>,
    /// Last captured level per port, shared with the poller
    levels: Arc<Mutex<[u8; 2]>>,
    poller: Option<Poller>,
    clock: Arc<dyn Clock>,
    open: bool,
}

impl Mcp23017Driver {
    /// Use an I2C bus owned by someone else
    pub fn new(bus: SharedI2c, config: Mcp23017Config) -> HatResult<Self> {
        Self::build(bus, false, config, SystemClock::shared())
    }

    /// Use a borrowed bus and a custom clock
    pub fn with_clock(
        bus: SharedI2c,
        config: Mcp23017Config,
        clock: Arc<dyn Clock>,
    ) -> HatResult<Self> {
        Self::build(bus, false, config, clock)
    }

    /// Open a dedicated I2C bus through the interface selector
    pub fn open(config: Mcp23017Config) -> HatResult<Self> {
        let bus = share(factory::open_i2c(&config.bus)?);
        Self::build(bus, true, config, SystemClock::shared())
    }

    /// Take ownership of `bus`; closing the expander closes it too
    pub fn owning(bus: SharedI2c, config: Mcp23017Config) -> HatResult<Self> {
        Self::build(bus, true, config, SystemClock::shared())
    }

    fn build(
        bus: SharedI2c,
        owns_bus: bool,
        config: Mcp23017Config,
        clock: Arc<dyn Clock>,
    ) -> HatResult<Self> {
        let address = config.address;
        let levels = {
            let mut i2c = bus.lock();
            // Sequential addressing, active-high INT, ports not mirrored
            i2c.write_byte(address, IOCON, 0x00)?;
            let gpio = i2c.read(address, GPIO, 2)?;
            [gpio.first().copied().unwrap_or(0), gpio.get(1).copied().unwrap_or(0)]
        };
        log::info!("MCP23017 ready at 0x{:02x}", address);

        Ok(Self {
            config,
            bus,
            owns_bus,
            table: PinTable::new(),
            events: Arc::new(Mutex::new(EdgeDispatch::new())),
            levels: Arc::new(Mutex::new(levels)),
            poller: None,
            clock,
            open: true,
        })
    }

    fn ensure_open(&self) -> HatResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(HatError::driver("MCP23017 is closed"))
        }
    }

    fn set_bit(&self, base: u8, port: Port, bit: u8, value: bool) -> HatResult<()> {
        let mask = 1 << bit;
        self.bus.lock().update_bits(
            self.config.address,
            port.reg(base),
            mask,
            if value { mask } else { 0 },
        )
    }

    /// Read one register (port A address; port B is `reg + 1`)
    pub fn read_register(&self, reg: u8) -> HatResult<u8> {
        self.bus.lock().read_byte(self.config.address, reg)
    }

    /// Invert the input polarity of a pin (IPOL)
    pub fn set_polarity(&mut self, pin: &str, inverted: bool) -> HatResult<()> {
        self.ensure_open()?;
        self.table.input_mut(pin)?;
        let (port, bit) = parse_expander_pin(pin)?;
        self.set_bit(IPOL, port, bit, inverted)
    }

    /// Compare against a fixed level (`Some`) instead of the previous pin
    /// value (`None`) when raising interrupts (INTCON/DEFVAL)
    pub fn set_compare(&mut self, pin: &str, default_level: Option<u8>) -> HatResult<()> {
        self.ensure_open()?;
        self.table.input_mut(pin)?;
        let (port, bit) = parse_expander_pin(pin)?;
        if let Some(level) = default_level {
            self.set_bit(DEFVAL, port, bit, level != 0)?;
        }
        self.set_bit(INTCON, port, bit, default_level.is_some())
    }

    fn start_poller(&mut self) {
        if self.poller.is_some() {
            return;
        }
        let run = Event::new();
        run.set();
        let context = PollContext {
            bus: Arc::clone(&self.bus),
            address: self.config.address,
            events: Arc::clone(&self.events),
            levels: Arc::clone(&self.levels),
            clock: Arc::clone(&self.clock),
            interval: self.config.poll_interval,
            run: run.clone(),
        };
        match std::thread::Builder::new()
            .name(format!("mcp23017-0x{:02x}", self.config.address))
            .spawn(move || context.run())
        {
            Ok(thread) => {
                log::debug!("MCP23017 interrupt poller started");
                self.poller = Some(Poller { run, thread });
            }
            Err(e) => log::error!("Failed to start MCP23017 poller: {}", e),
        }
    }

    fn stop_poller(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.run.clear();
            let _ = poller.thread.join();
            log::debug!("MCP23017 interrupt poller stopped");
        }
    }
}

impl Drop for Mcp23017Driver {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct PollContext {
    bus: SharedI2c,
    address: u8,
    events: Arc<Mutex<EdgeDispatch>>,
    levels: Arc<Mutex<[u8; 2]>>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    run: Event,
}

impl PollContext {
    fn run(self) {
        while self.run.is_set() {
            match self.poll_once() {
                Ok(edges) => self.dispatch(edges),
                Err(e) => log::warn!("MCP23017 0x{:02x} poll failed: {}", self.address, e),
            }
            self.clock.sleep(self.interval);
        }
    }

    /// Read INTF/INTCAP and return the pins whose level changed
    fn poll_once(&self) -> HatResult<Vec<(String, bool)>> {
        let (flags, captured) = {
            let mut bus = self.bus.lock();
            let flags = bus.read(self.address, INTF, 2)?;
            if flags.iter().all(|&f| f == 0) {
                return Ok(Vec::new());
            }
            // Reading INTCAP clears the interrupt
            let captured = bus.read(self.address, INTCAP, 2)?;
            (flags, captured)
        };

        let mut edges = Vec::new();
        let mut levels = self.levels.lock();
        for port in 0..2 {
            let flagged = flags.get(port).copied().unwrap_or(0);
            let capture = captured.get(port).copied().unwrap_or(0);
            for bit in 0..8u8 {
                let mask = 1 << bit;
                if flagged & mask == 0 {
                    continue;
                }
                let level = capture & mask != 0;
                let previous = levels[port] & mask != 0;
                if level != previous {
                    edges.push((pin_name(port, bit), level));
                }
                levels[port] = (levels[port] & !mask) | (capture & mask);
            }
        }
        Ok(edges)
    }

    fn dispatch(&self, edges: Vec<(String, bool)>) {
        if edges.is_empty() {
            return;
        }
        let now = self.clock.now();
        let ready: Vec<_> = {
            let mut events = self.events.lock();
            edges
                .iter()
                .filter_map(|(pin, rising)| events.on_edge(pin, *rising, now))
                .collect()
        };
        for (callback, event) in ready {
            callback.invoke(&event);
        }
    }
}

impl Interface for Mcp23017Driver {
    fn backend(&self) -> &str {
        "mcp23017"
    }

    fn close(&mut self) -> HatResult<()> {
        self.stop_poller();
        if !self.open {
            return Ok(());
        }
        self.open = false;
        if self.owns_bus {
            self.bus.lock().close()?;
        }
        log::debug!("MCP23017 0x{:02x} closed", self.config.address);
        Ok(())
    }
}

impl Gpio for Mcp23017Driver {
    fn configure(&mut self, pin: &str, direction: Direction, pull: Option<Pull>) -> HatResult<()> {
        self.ensure_open()?;
        let (port, bit) = parse_expander_pin(pin)?;
        if pull == Some(Pull::Down) {
            return Err(HatError::config("MCP23017 has no pull-down resistors"));
        }

        match direction {
            Direction::Output => {
                // No interrupts on outputs
                self.set_bit(GPINTEN, port, bit, false)?;
                self.set_bit(GPPU, port, bit, false)?;
                self.set_bit(IODIR, port, bit, false)?;
            }
            Direction::Input => {
                self.set_bit(IODIR, port, bit, true)?;
                self.set_bit(GPPU, port, bit, pull == Some(Pull::Up))?;
                self.set_bit(GPINTEN, port, bit, false)?;
            }
        }
        self.table.configure(pin, direction, pull);
        self.events.lock().clear(pin);
        Ok(())
    }

    fn write(&mut self, pin: &str, value: f64) -> HatResult<()> {
        self.ensure_open()?;
        let (port, bit) = parse_expander_pin(pin)?;
        match self.table.resolve_write(pin, value)? {
            WriteAction::Level(level) => self.set_bit(OLAT, port, bit, level == 1),
            WriteAction::Duty(_) => Err(HatError::config("MCP23017 has no PWM generator")),
        }
    }

    fn read(&mut self, pin: &str) -> HatResult<u8> {
        self.ensure_open()?;
        self.table.get(pin)?;
        let (port, bit) = parse_expander_pin(pin)?;
        let value = self.read_register(port.reg(GPIO))?;
        Ok((value >> bit) & 1)
    }

    fn pwm_enable(&mut self, pin: &str, enable: bool) -> HatResult<()> {
        self.ensure_open()?;
        self.table.output_mut(pin)?;
        if enable {
            return Err(HatError::config("MCP23017 has no PWM generator"));
        }
        Ok(())
    }

    fn set_frequency(&mut self, _pin: &str, _hz: f64) -> HatResult<()> {
        Err(HatError::config("MCP23017 has no PWM generator"))
    }

    fn set_edge(&mut self, pin: &str, edge: Option<Edge>) -> HatResult<()> {
        self.ensure_open()?;
        let (port, bit) = parse_expander_pin(pin)?;
        self.table.input_mut(pin)?.edge = edge;

        if edge.is_some() {
            let current = self.read_register(port.reg(GPIO))?;
            let mask = 1 << bit;
            let mut levels = self.levels.lock();
            let idx = port.offset() as usize;
            levels[idx] = (levels[idx] & !mask) | (current & mask);
        }
        self.set_bit(GPINTEN, port, bit, edge.is_some())?;
        self.events.lock().set_edge(pin, edge);

        if edge.is_some() {
            self.start_poller();
        }
        Ok(())
    }

    fn set_debounce(&mut self, pin: &str, ms: u64) -> HatResult<()> {
        self.ensure_open()?;
        self.table.input_mut(pin)?.debounce_ms = ms;
        self.events
            .lock()
            .set_debounce(pin, Duration::from_millis(ms));
        Ok(())
    }

    fn on_event(&mut self, pin: &str, callback: Option<EdgeCallback>) -> HatResult<()> {
        self.ensure_open()?;
        self.table.input_mut(pin)?.has_callback = callback.is_some();
        self.events.lock().set_callback(pin, callback);
        Ok(())
    }

    fn pin_config(&self, pin: &str) -> HatResult<PinConfig> {
        self.table.get(pin).cloned()
    }
}

// ============================================================================
// Simulated chip
// ============================================================================

struct ChipState {
    registers: [u8; REGISTER_COUNT],
    /// Externally driven pin levels per port
    inputs: [u8; 2],
}

/// Register-level MCP23017 model for [`SimulationI2cDriver`](crate::drivers::bus::SimulationI2cDriver)
///
/// Clones share state, so a test can keep one clone to drive input pins.
#[derive(Clone)]
pub struct Mcp23017Model {
    chip: Arc<Mutex<ChipState>>,
}

impl Default for Mcp23017Model {
    fn default() -> Self {
        let mut registers = [0u8; REGISTER_COUNT];
        // Power-on: every pin an input
        registers[IODIR as usize] = 0xFF;
        registers[(IODIR + 1) as usize] = 0xFF;
        Self {
            chip: Arc::new(Mutex::new(ChipState {
                registers,
                inputs: [0; 2],
            })),
        }
    }
}

impl Mcp23017Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, reg: u8) -> u8 {
        self.chip.lock().registers[reg as usize]
    }

    /// Bit of `base` (port A address) for a named pin
    pub fn bit(&self, base: u8, pin: &str) -> Option<bool> {
        let (port, bit) = parse_expander_pin(pin).ok()?;
        Some(self.register(port.reg(base)) >> bit & 1 == 1)
    }

    /// Drive an external pin level, latching an interrupt if enabled
    pub fn set_input(&self, pin: &str, level: u8) -> HatResult<()> {
        let (port, bit) = parse_expander_pin(pin)?;
        let p = port.offset() as usize;
        let mask = 1u8 << bit;
        let mut chip = self.chip.lock();

        let previous = chip.inputs[p] & mask != 0;
        let high = level != 0;
        if high {
            chip.inputs[p] |= mask;
        } else {
            chip.inputs[p] &= !mask;
        }

        let regs = &chip.registers;
        let is_input = regs[port.reg(IODIR) as usize] & mask != 0;
        let enabled = regs[port.reg(GPINTEN) as usize] & mask != 0;
        let against_default = regs[port.reg(INTCON) as usize] & mask != 0;
        let default_high = regs[port.reg(DEFVAL) as usize] & mask != 0;
        let fire = if against_default {
            high != default_high
        } else {
            high != previous
        };

        if is_input && enabled && fire && chip.registers[port.reg(INTF) as usize] == 0 {
            let gpio = Self::gpio_value(&chip, p);
            chip.registers[port.reg(INTF) as usize] = mask;
            chip.registers[port.reg(INTCAP) as usize] = gpio;
        }
        Ok(())
    }

    fn gpio_value(chip: &ChipState, port: usize) -> u8 {
        let iodir = chip.registers[IODIR as usize + port];
        let ipol = chip.registers[IPOL as usize + port];
        let olat = chip.registers[OLAT as usize + port];
        ((chip.inputs[port] ^ ipol) & iodir) | (olat & !iodir)
    }
}

impl I2cDeviceModel for Mcp23017Model {
    fn read(&mut self, reg: u8, n: usize) -> HatResult<Vec<u8>> {
        let mut chip = self.chip.lock();
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let r = reg as usize + i;
            if r >= REGISTER_COUNT {
                out.push(0);
                continue;
            }
            let port = r & 1;
            let value = match r as u8 & !1 {
                GPIO => {
                    chip.registers[INTF as usize + port] = 0;
                    Self::gpio_value(&chip, port)
                }
                INTCAP => {
                    let value = chip.registers[r];
                    chip.registers[INTF as usize + port] = 0;
                    value
                }
                _ => chip.registers[r],
            };
            out.push(value);
        }
        Ok(out)
    }

    fn write(&mut self, reg: u8, data: &[u8]) -> HatResult<()> {
        let mut chip = self.chip.lock();
        for (i, &byte) in data.iter().enumerate() {
            let r = reg as usize + i;
            if r >= REGISTER_COUNT {
                break;
            }
            match r as u8 & !1 {
                // INTF and INTCAP are read-only
                INTF | INTCAP => {}
                GPIO => chip.registers[OLAT as usize + (r & 1)] = byte,
                _ => chip.registers[r] = byte,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::bus::{shared_i2c, SimulationI2cDriver};

    fn expander() -> (Mcp23017Driver, Mcp23017Model) {
        let model = Mcp23017Model::new();
        let bus = shared_i2c(SimulationI2cDriver::new(1).with_device(DEFAULT_ADDRESS, model.clone()));
        let driver = Mcp23017Driver::new(bus, Mcp23017Config::default()).unwrap();
        (driver, model)
    }

    #[test]
    fn test_parse_pin_names() {
        assert_eq!(parse_expander_pin("A_0").unwrap(), (Port::A, 0));
        assert_eq!(parse_expander_pin("B_7").unwrap(), (Port::B, 7));
        assert!(parse_expander_pin("B_8").is_err());
        assert!(parse_expander_pin("C_1").is_err());
        assert!(parse_expander_pin("17").is_err());
    }

    #[test]
    fn test_register_round_trip_every_pin() {
        let (mut mcp, model) = expander();
        for port in ["A", "B"] {
            for bit in 0..8 {
                let pin = format!("{}_{}", port, bit);
                mcp.configure(&pin, Direction::Input, Some(Pull::Up)).unwrap();
                mcp.set_polarity(&pin, true).unwrap();
                mcp.set_compare(&pin, Some(1)).unwrap();

                assert_eq!(model.bit(IODIR, &pin), Some(true));
                assert_eq!(model.bit(GPPU, &pin), Some(true));
                assert_eq!(model.bit(IPOL, &pin), Some(true));
                assert_eq!(model.bit(INTCON, &pin), Some(true));
                assert_eq!(model.bit(DEFVAL, &pin), Some(true));
            }
        }
        assert_eq!(mcp.read_register(IODIR).unwrap(), 0xFF);
        assert_eq!(mcp.read_register(GPPU + 1).unwrap(), 0xFF);
        assert_eq!(mcp.read_register(IPOL).unwrap(), 0xFF);
        assert_eq!(mcp.read_register(INTCON + 1).unwrap(), 0xFF);

        mcp.configure("A_3", Direction::Output, None).unwrap();
        assert_eq!(mcp.read_register(IODIR).unwrap(), 0b1111_0111);
        assert_eq!(mcp.read_register(GPPU).unwrap(), 0b1111_0111);
    }

    #[test]
    fn test_output_write_sets_latch() {
        let (mut mcp, model) = expander();
        mcp.configure("B_2", Direction::Output, None).unwrap();
        mcp.write("B_2", 1.0).unwrap();
        assert_eq!(model.bit(OLAT, "B_2"), Some(true));
        assert_eq!(mcp.read("B_2").unwrap(), 1);
        mcp.write("B_2", 0.0).unwrap();
        assert_eq!(mcp.read("B_2").unwrap(), 0);
    }

    #[test]
    fn test_input_read_follows_pin() {
        let (mut mcp, model) = expander();
        mcp.configure("A_5", Direction::Input, None).unwrap();
        model.set_input("A_5", 1).unwrap();
        assert_eq!(mcp.read("A_5").unwrap(), 1);
    }

    #[test]
    fn test_interrupts_not_allowed_on_outputs() {
        let (mut mcp, model) = expander();
        mcp.configure("A_1", Direction::Input, None).unwrap();
        mcp.set_edge("A_1", Some(Edge::Rising)).unwrap();
        assert_eq!(model.bit(GPINTEN, "A_1"), Some(true));

        mcp.configure("A_1", Direction::Output, None).unwrap();
        assert_eq!(model.bit(GPINTEN, "A_1"), Some(false));
        assert!(mcp.set_edge("A_1", Some(Edge::Rising)).is_err());
        mcp.close().unwrap();
    }

    #[test]
    fn test_no_pwm_or_pull_down() {
        let (mut mcp, _model) = expander();
        assert!(mcp.configure("A_0", Direction::Input, Some(Pull::Down)).is_err());
        mcp.configure("A_0", Direction::Output, None).unwrap();
        assert!(mcp.pwm_enable("A_0", true).is_err());
        assert!(mcp.pwm_enable("A_0", false).is_ok());
        assert!(!mcp.pin_config("A_0").unwrap().pwm_enabled());
    }

    #[test]
    fn test_close_leaves_borrowed_bus_open() {
        let model = Mcp23017Model::new();
        let bus = shared_i2c(SimulationI2cDriver::new(1).with_device(DEFAULT_ADDRESS, model));
        let mut mcp = Mcp23017Driver::new(bus.clone(), Mcp23017Config::default()).unwrap();
        mcp.close().unwrap();
        mcp.close().unwrap();
        assert!(bus.lock().read_byte(DEFAULT_ADDRESS, IODIR).is_ok());
        assert!(mcp.read("A_0").is_err());
    }
}
