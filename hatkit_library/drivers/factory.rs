//! Interface Factory - Open bus backends from configuration
//!
//! Every bus capability (`gpio`, `i2c`, `spi`, `hpwm`) has a registry of
//! backends built from the compiled-in feature set. A config that names a
//! backend opens that backend directly; a config without one probes the
//! hardware backends in order and takes the first whose native prerequisite
//! is present. Simulation backends are never probed, only opened by name.
//!
//! # Example
//!
//! ```rust,ignore
//! use hatkit_core::driver::InterfaceConfig;
//! use hatkit_library::drivers::factory;
//!
//! let bus = factory::open_i2c(&InterfaceConfig::i2c(1, 0x40))?;
//! let pwm = factory::open_hpwm(&InterfaceConfig::hpwm(18))?;
//! ```

use std::fmt;

use hatkit_core::device::share;
use hatkit_core::driver::InterfaceConfig;
use hatkit_core::error::{HatError, HatResult};

use super::bus::{I2cBus, SimulationI2cDriver, SimulationSpiDriver, SpiBus, SpiSettings};
use super::expander::{Mcp23017Config, Mcp23017Driver, Mcp23017Model, DEFAULT_ADDRESS};
use super::gpio::{Gpio, SimulationGpioDriver};
use super::pwm::{HardwarePwm, SimulationPwmDriver, SysfsPwmConfig, SysfsPwmDriver};

#[cfg(feature = "i2c-hardware")]
use super::bus::{LinuxI2cConfig, LinuxI2cDriver};
#[cfg(feature = "spi-hardware")]
use super::bus::{LinuxSpiConfig, LinuxSpiDriver};
#[cfg(feature = "gpio-hardware")]
use super::gpio::RppalGpioDriver;

/// Bus capability names understood by [`init_interface`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Gpio,
    I2c,
    Spi,
    Hpwm,
}

impl Capability {
    pub fn parse(name: &str) -> HatResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "gpio" => Ok(Self::Gpio),
            "i2c" => Ok(Self::I2c),
            "spi" => Ok(Self::Spi),
            "hpwm" | "pwm" => Ok(Self::Hpwm),
            other => Err(HatError::UnsupportedInterface(format!(
                "unknown capability '{}' (expected gpio, i2c, spi or hpwm)",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gpio => "gpio",
            Self::I2c => "i2c",
            Self::Spi => "spi",
            Self::Hpwm => "hpwm",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any opened bus handle
pub enum AnyInterface {
    Gpio(Box<dyn Gpio>),
    I2c(Box<dyn I2cBus>),
    Spi(Box<dyn SpiBus>),
    Hpwm(Box<dyn HardwarePwm>),
}

impl AnyInterface {
    pub fn capability(&self) -> Capability {
        match self {
            Self::Gpio(_) => Capability::Gpio,
            Self::I2c(_) => Capability::I2c,
            Self::Spi(_) => Capability::Spi,
            Self::Hpwm(_) => Capability::Hpwm,
        }
    }

    pub fn backend(&self) -> &str {
        match self {
            Self::Gpio(g) => g.backend(),
            Self::I2c(b) => b.backend(),
            Self::Spi(b) => b.backend(),
            Self::Hpwm(p) => p.backend(),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

type Opener<T> = fn(&InterfaceConfig) -> HatResult<Box<T>>;

struct Backend<T: ?Sized> {
    id: &'static str,
    aliases: &'static [&'static str],
    /// Tried when the config names no backend
    probe: bool,
    open: Opener<T>,
}

impl<T: ?Sized> Backend<T> {
    fn hardware(id: &'static str, open: Opener<T>) -> Self {
        Self {
            id,
            aliases: &[],
            probe: true,
            open,
        }
    }

    fn named(id: &'static str, open: Opener<T>) -> Self {
        Self {
            id,
            aliases: &[],
            probe: false,
            open,
        }
    }

    fn simulation(open: Opener<T>) -> Self {
        Self {
            id: "simulation",
            aliases: &["sim"],
            probe: false,
            open,
        }
    }

    fn matches(&self, id: &str) -> bool {
        self.id == id || self.aliases.contains(&id)
    }
}

type GpioBackend = Backend<dyn Gpio>;
type I2cBackend = Backend<dyn I2cBus>;
type SpiBackend = Backend<dyn SpiBus>;
type PwmBackend = Backend<dyn HardwarePwm>;

fn gpio_backends() -> Vec<GpioBackend> {
    let mut list = Vec::new();
    #[cfg(feature = "gpio-hardware")]
    list.push(GpioBackend::hardware("rppal", open_rppal_gpio));
    list.push(GpioBackend::named("mcp23017", open_mcp23017));
    list.push(GpioBackend::simulation(open_simulation_gpio));
    list
}

fn i2c_backends() -> Vec<I2cBackend> {
    let mut list = Vec::new();
    #[cfg(feature = "i2c-hardware")]
    list.push(I2cBackend::hardware("linux", open_linux_i2c));
    list.push(I2cBackend::simulation(open_simulation_i2c));
    list
}

fn spi_backends() -> Vec<SpiBackend> {
    let mut list = Vec::new();
    #[cfg(feature = "spi-hardware")]
    list.push(SpiBackend::hardware("spidev", open_spidev));
    list.push(SpiBackend::simulation(open_simulation_spi));
    list
}

fn pwm_backends() -> Vec<PwmBackend> {
    vec![
        PwmBackend::hardware("sysfs", open_sysfs_pwm),
        PwmBackend::simulation(open_simulation_pwm),
    ]
}

/// Backend ids compiled in for a capability
pub fn available_backends(capability: &str) -> HatResult<Vec<&'static str>> {
    fn ids<T: ?Sized>(list: Vec<Backend<T>>) -> Vec<&'static str> {
        list.iter().map(|b| b.id).collect()
    }
    Ok(match Capability::parse(capability)? {
        Capability::Gpio => ids(gpio_backends()),
        Capability::I2c => ids(i2c_backends()),
        Capability::Spi => ids(spi_backends()),
        Capability::Hpwm => ids(pwm_backends()),
    })
}

/// Errors already in the selector's vocabulary pass through, anything else a
/// backend raised while opening is reported as `BackendInit`
fn as_init_error(id: &str, err: HatError) -> HatError {
    match err {
        HatError::BackendInit { .. }
        | HatError::NotInstalledInterface(_)
        | HatError::InvalidPwmPin { .. }
        | HatError::Config(_)
        | HatError::InvalidInput(_) => err,
        other => HatError::backend_init(id, other.to_string()),
    }
}

fn select<T: ?Sized>(
    capability: Capability,
    backends: Vec<Backend<T>>,
    config: &InterfaceConfig,
) -> HatResult<Box<T>> {
    config.validate()?;

    if let Some(id) = config.backend.as_deref() {
        let backend = backends.iter().find(|b| b.matches(id)).ok_or_else(|| {
            let known: Vec<_> = backends.iter().map(|b| b.id).collect();
            HatError::UnsupportedInterface(format!(
                "{} backend '{}' is not available. Available: {}",
                capability,
                id,
                known.join(", ")
            ))
        })?;
        let handle = (backend.open)(config).map_err(|e| as_init_error(backend.id, e))?;
        log::info!("Opened {} backend '{}'", capability, backend.id);
        return Ok(handle);
    }

    for backend in backends.iter().filter(|b| b.probe) {
        match (backend.open)(config) {
            Ok(handle) => {
                log::info!("Selected {} backend '{}'", capability, backend.id);
                return Ok(handle);
            }
            Err(e) if e.is_not_installed() => {
                log::debug!("{} backend '{}' unavailable: {}", capability, backend.id, e);
            }
            Err(e) => return Err(as_init_error(backend.id, e)),
        }
    }
    Err(HatError::NotInstalledInterface(capability.to_string()))
}

// ============================================================================
// Public entry points
// ============================================================================

pub fn open_gpio(config: &InterfaceConfig) -> HatResult<Box<dyn Gpio>> {
    select(Capability::Gpio, gpio_backends(), config)
}

pub fn open_i2c(config: &InterfaceConfig) -> HatResult<Box<dyn I2cBus>> {
    select(Capability::I2c, i2c_backends(), config)
}

pub fn open_spi(config: &InterfaceConfig) -> HatResult<Box<dyn SpiBus>> {
    select(Capability::Spi, spi_backends(), config)
}

pub fn open_hpwm(config: &InterfaceConfig) -> HatResult<Box<dyn HardwarePwm>> {
    select(Capability::Hpwm, pwm_backends(), config)
}

/// Open a bus by capability name
///
/// Unknown capabilities fail with `UnsupportedInterface`.
pub fn init_interface(capability: &str, config: &InterfaceConfig) -> HatResult<AnyInterface> {
    Ok(match Capability::parse(capability)? {
        Capability::Gpio => AnyInterface::Gpio(open_gpio(config)?),
        Capability::I2c => AnyInterface::I2c(open_i2c(config)?),
        Capability::Spi => AnyInterface::Spi(open_spi(config)?),
        Capability::Hpwm => AnyInterface::Hpwm(open_hpwm(config)?),
    })
}

// ============================================================================
// Backend openers
// ============================================================================

fn spi_settings(config: &InterfaceConfig) -> HatResult<SpiSettings> {
    let defaults = SpiSettings::default();
    let settings = SpiSettings {
        mode: config.mode.unwrap_or(defaults.mode),
        lsb_first: config.lsb_first.unwrap_or(defaults.lsb_first),
        max_speed_hz: config.max_speed_hz.unwrap_or(defaults.max_speed_hz),
    };
    settings.validate()?;
    Ok(settings)
}

fn open_simulation_gpio(_config: &InterfaceConfig) -> HatResult<Box<dyn Gpio>> {
    Ok(Box::new(SimulationGpioDriver::new()))
}

#[cfg(feature = "gpio-hardware")]
fn open_rppal_gpio(_config: &InterfaceConfig) -> HatResult<Box<dyn Gpio>> {
    Ok(Box::new(RppalGpioDriver::open()?))
}

/// The expander reaches its chip through an I2C bus of its own; the bus
/// backend is taken from the `bus_backend` option
fn open_mcp23017(config: &InterfaceConfig) -> HatResult<Box<dyn Gpio>> {
    let address = config.address.unwrap_or(DEFAULT_ADDRESS);
    let mut bus = InterfaceConfig::i2c(config.bus.unwrap_or(1), address);
    bus.backend = config.get_option("bus_backend");

    let mut expander = Mcp23017Config {
        address,
        bus,
        ..Default::default()
    };
    if let Some(ms) = config.get_option_i64("poll_interval_ms") {
        expander.poll_interval = std::time::Duration::from_millis(ms.max(1) as u64);
    }

    if expander.bus.is_simulation() {
        let sim = SimulationI2cDriver::new(expander.bus.bus.unwrap_or(1))
            .with_device(address, Mcp23017Model::new());
        let boxed: Box<dyn I2cBus> = Box::new(sim);
        return Ok(Box::new(Mcp23017Driver::owning(share(boxed), expander)?));
    }
    Ok(Box::new(Mcp23017Driver::open(expander)?))
}

fn open_simulation_i2c(config: &InterfaceConfig) -> HatResult<Box<dyn I2cBus>> {
    Ok(Box::new(SimulationI2cDriver::new(config.bus.unwrap_or(1))))
}

#[cfg(feature = "i2c-hardware")]
fn open_linux_i2c(config: &InterfaceConfig) -> HatResult<Box<dyn I2cBus>> {
    let driver = LinuxI2cDriver::open(LinuxI2cConfig {
        bus: config.bus.unwrap_or(1),
    })?;
    Ok(Box::new(driver))
}

fn open_simulation_spi(config: &InterfaceConfig) -> HatResult<Box<dyn SpiBus>> {
    let mut driver =
        SimulationSpiDriver::new(config.port.unwrap_or(0), config.device.unwrap_or(0));
    driver.apply_settings(spi_settings(config)?)?;
    Ok(Box::new(driver))
}

#[cfg(feature = "spi-hardware")]
fn open_spidev(config: &InterfaceConfig) -> HatResult<Box<dyn SpiBus>> {
    let driver = LinuxSpiDriver::open(LinuxSpiConfig {
        port: config.port.unwrap_or(0),
        device: config.device.unwrap_or(0),
        settings: spi_settings(config)?,
        ..Default::default()
    })?;
    Ok(Box::new(driver))
}

fn pwm_pin(config: &InterfaceConfig) -> HatResult<u8> {
    config
        .pin
        .ok_or_else(|| HatError::config("hpwm interface needs a 'pin'"))
}

/// Apply the optional frequency/duty/enable fields of a config
fn apply_pwm_options<P: HardwarePwm>(pwm: &mut P, config: &InterfaceConfig) -> HatResult<()> {
    if let Some(hz) = config.frequency {
        pwm.set_frequency(f64::from(hz))?;
    }
    if let Some(duty) = config.duty {
        pwm.set_duty(duty)?;
    }
    if let Some(enable) = config.enable {
        pwm.enable(enable)?;
    }
    Ok(())
}

fn open_sysfs_pwm(config: &InterfaceConfig) -> HatResult<Box<dyn HardwarePwm>> {
    let mut sysfs = SysfsPwmConfig {
        pin: pwm_pin(config)?,
        ..Default::default()
    };
    if let Some(root) = config.get_option("sysfs_root") {
        sysfs.root = root.into();
    }
    if let Some(chip) = config.get_option_i64("pwmchip") {
        sysfs.chip = chip.max(0) as u32;
    }
    let mut driver = SysfsPwmDriver::open(sysfs)?;
    apply_pwm_options(&mut driver, config)?;
    Ok(Box::new(driver))
}

fn open_simulation_pwm(config: &InterfaceConfig) -> HatResult<Box<dyn HardwarePwm>> {
    let mut driver = SimulationPwmDriver::open(pwm_pin(config)?)?;
    apply_pwm_options(&mut driver, config)?;
    Ok(Box::new(driver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatkit_core::device::Interface;

    #[test]
    fn test_unknown_capability() {
        let err = init_interface("can", &InterfaceConfig::default()).err().unwrap();
        assert!(matches!(err, HatError::UnsupportedInterface(_)));
        assert!(available_backends("uart").is_err());
    }

    #[test]
    fn test_unknown_backend_id() {
        let config = InterfaceConfig::with_backend("bitbang");
        let err = open_i2c(&config).err().unwrap();
        assert!(matches!(err, HatError::UnsupportedInterface(_)));
    }

    #[test]
    fn test_simulation_opened_by_name() {
        let mut config = InterfaceConfig::simulation();
        config.bus = Some(3);
        let bus = open_i2c(&config).unwrap();
        assert_eq!(bus.backend(), "simulation");

        let mut config = InterfaceConfig::with_backend("sim");
        config.mode = Some(3);
        let spi = init_interface("spi", &config).unwrap();
        assert_eq!(spi.capability(), Capability::Spi);
        match spi {
            AnyInterface::Spi(spi) => assert_eq!(spi.settings().mode, 3),
            _ => panic!("expected an SPI handle"),
        }
    }

    #[test]
    fn test_invalid_options_rejected_before_open() {
        let mut config = InterfaceConfig::simulation();
        config.mode = Some(7);
        assert!(matches!(open_spi(&config).err().unwrap(), HatError::Config(_)));
    }

    #[test]
    fn test_hpwm_needs_pin() {
        let err = open_hpwm(&InterfaceConfig::simulation()).err().unwrap();
        assert!(matches!(err, HatError::Config(_)));
    }

    #[cfg(not(feature = "gpio-hardware"))]
    #[test]
    fn test_probe_without_hardware_backends() {
        let err = open_gpio(&InterfaceConfig::default()).err().unwrap();
        assert!(err.is_not_installed());
    }

    #[test]
    fn test_simulated_expander_backend() {
        let mut config = InterfaceConfig::with_backend("mcp23017");
        config.address = Some(0x21);
        config
            .options
            .insert("bus_backend".to_string(), "simulation".into());

        let mut gpio = open_gpio(&config).unwrap();
        assert_eq!(gpio.backend(), "mcp23017");
        gpio.configure("A_1", crate::drivers::gpio::Direction::Output, None)
            .unwrap();
        gpio.write("A_1", 1.0).unwrap();
        gpio.close().unwrap();
    }
}
