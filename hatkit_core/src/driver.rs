//! Driver utilities for hatkit
//!
//! Lifecycle status shared by every driver, plus the typed configuration
//! surface used to select and open bus backends.
//!
//! # Example
//!
//! ```rust,ignore
//! use hatkit_core::driver::{BoardConfig, InterfaceConfig};
//!
//! let board = BoardConfig::from_file("hatkit.yaml")?;
//! let servo_bus = board.get_interface("servo_bus")?;
//! assert_eq!(servo_bus.address, Some(0x40));
//! ```

use crate::error::{HatError, HatResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Driver status for lifecycle tracking
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DriverStatus {
    /// Driver has not been initialized yet
    #[default]
    Uninitialized,
    /// Driver is ready to operate
    Ready,
    /// Driver is actively running/streaming
    Running,
    /// Driver encountered an error
    Error(String),
    /// Driver has been shut down
    Shutdown,
}

impl DriverStatus {
    /// True while the driver holds its resources and accepts requests
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl std::fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::Error(msg) => write!(f, "Error: {}", msg),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Driver category for classification (informational only)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCategory {
    /// Rangefinders, IMUs, environmental sensors, ADCs, cameras, microphones
    Sensor,
    /// Motors, servos, LED strips, speakers
    Actuator,
    /// GPIO, I2C, SPI, hardware PWM
    Bus,
    /// Buttons, touch inputs
    Input,
    /// Simulation backends
    Simulation,
}

impl std::fmt::Display for DriverCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sensor => write!(f, "Sensor"),
            Self::Actuator => write!(f, "Actuator"),
            Self::Bus => write!(f, "Bus"),
            Self::Input => write!(f, "Input"),
            Self::Simulation => write!(f, "Simulation"),
        }
    }
}

// ============================================================================
// Interface Configuration (YAML/TOML support)
// ============================================================================

/// Configuration for a single bus interface or device
///
/// Only the fields relevant to the selected capability are read; the rest
/// stay `None`.
///
/// # Example YAML
///
/// ```yaml
/// backend: linux
/// bus: 1
/// address: 0x40
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Backend identifier (e.g., "simulation", "linux", "rppal", "mcp23017").
    /// `None` lets the selector probe the installed backends in order.
    #[serde(default)]
    pub backend: Option<String>,

    /// Enable/disable the interface (default: true)
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// GPIO character device (e.g., "/dev/gpiochip0")
    #[serde(default)]
    pub chip: Option<String>,

    /// I2C bus number
    #[serde(default)]
    pub bus: Option<u8>,

    /// I2C device address
    #[serde(default)]
    pub address: Option<u8>,

    /// SPI port number
    #[serde(default)]
    pub port: Option<u8>,

    /// SPI chip-select / device number
    #[serde(default)]
    pub device: Option<u8>,

    /// SPI mode (0-3)
    #[serde(default)]
    pub mode: Option<u8>,

    /// SPI bit order
    #[serde(default)]
    pub lsb_first: Option<bool>,

    /// SPI clock in Hz
    #[serde(default)]
    pub max_speed_hz: Option<u32>,

    /// Hardware PWM pin
    #[serde(default)]
    pub pin: Option<u8>,

    /// PWM frequency in Hz
    #[serde(default)]
    pub frequency: Option<u32>,

    /// PWM duty cycle in [0, 1]
    #[serde(default)]
    pub duty: Option<f64>,

    /// PWM output enable
    #[serde(default)]
    pub enable: Option<bool>,

    /// Frame rate (camera) or sample rate (audio)
    #[serde(default)]
    pub framerate: Option<u32>,

    /// Image width (camera)
    #[serde(default)]
    pub width: Option<u32>,

    /// Image height (camera)
    #[serde(default)]
    pub height: Option<u32>,

    /// Image format (camera): "rgb", "jpg", ...
    #[serde(default)]
    pub format: Option<String>,

    /// Frames per batch read (camera)
    #[serde(default)]
    pub batch: Option<u32>,

    /// Audio device name (e.g., "default", "hw:1,0")
    #[serde(default)]
    pub dev_name: Option<String>,

    /// Audio channel count
    #[serde(default)]
    pub channels: Option<u16>,

    /// Mixer volume in [0, 100]
    #[serde(default)]
    pub volume: Option<u8>,

    /// Human-readable device name
    #[serde(default)]
    pub name: Option<String>,

    /// Additional backend-specific options
    #[serde(flatten)]
    pub options: HashMap<String, serde_yaml::Value>,
}

fn default_enabled() -> bool {
    true
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            backend: None,
            enabled: true,
            chip: None,
            bus: None,
            address: None,
            port: None,
            device: None,
            mode: None,
            lsb_first: None,
            max_speed_hz: None,
            pin: None,
            frequency: None,
            duty: None,
            enable: None,
            framerate: None,
            width: None,
            height: None,
            format: None,
            batch: None,
            dev_name: None,
            channels: None,
            volume: None,
            name: None,
            options: HashMap::new(),
        }
    }
}

impl InterfaceConfig {
    /// Create a config pinned to the simulation backend
    pub fn simulation() -> Self {
        Self::with_backend("simulation")
    }

    /// Create a config pinned to a specific backend id
    pub fn with_backend(backend: &str) -> Self {
        Self {
            backend: Some(backend.to_string()),
            ..Default::default()
        }
    }

    /// Create an I2C interface config
    pub fn i2c(bus: u8, address: u8) -> Self {
        Self {
            bus: Some(bus),
            address: Some(address),
            ..Default::default()
        }
    }

    /// Create an SPI interface config
    pub fn spi(port: u8, device: u8) -> Self {
        Self {
            port: Some(port),
            device: Some(device),
            ..Default::default()
        }
    }

    /// Create a hardware PWM interface config
    pub fn hpwm(pin: u8) -> Self {
        Self {
            pin: Some(pin),
            ..Default::default()
        }
    }

    /// Check if this is a simulation backend
    pub fn is_simulation(&self) -> bool {
        self.backend
            .as_deref()
            .map(|b| b == "simulation" || b.starts_with("sim"))
            .unwrap_or(false)
    }

    /// Validate option values against their enumerated ranges
    pub fn validate(&self) -> HatResult<()> {
        if let Some(mode) = self.mode {
            if mode > 3 {
                return Err(HatError::config(format!("SPI mode {} not in 0..=3", mode)));
            }
        }
        if let Some(duty) = self.duty {
            if !(0.0..=1.0).contains(&duty) {
                return Err(HatError::config(format!("duty {} not in [0, 1]", duty)));
            }
        }
        if let Some(volume) = self.volume {
            if volume > 100 {
                return Err(HatError::config(format!("volume {} not in [0, 100]", volume)));
            }
        }
        Ok(())
    }

    /// Get an option value as a string
    pub fn get_option(&self, key: &str) -> Option<String> {
        self.options.get(key).and_then(|v| match v {
            serde_yaml::Value::String(s) => Some(s.clone()),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            serde_yaml::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        })
    }

    /// Get an option value as i64
    pub fn get_option_i64(&self, key: &str) -> Option<i64> {
        self.options.get(key).and_then(|v| v.as_i64())
    }

    /// Get an option value as f64
    pub fn get_option_f64(&self, key: &str) -> Option<f64> {
        self.options.get(key).and_then(|v| v.as_f64())
    }

    /// Get an option value as bool
    pub fn get_option_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(|v| v.as_bool())
    }
}

/// Board description: the named interfaces of one robot
///
/// # Example YAML
///
/// ```yaml
/// interfaces:
///   servo_bus:
///     backend: linux
///     bus: 1
///     address: 64
///   adc:
///     backend: spidev
///     port: 0
///     device: 0
///     max_speed_hz: 1000000
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Map of interface name -> interface config
    pub interfaces: HashMap<String, InterfaceConfig>,
}

impl BoardConfig {
    /// Create a new empty config
    pub fn new() -> Self {
        Self::default()
    }

    /// Load config from a file (auto-detect format)
    pub fn from_file<P: AsRef<Path>>(path: P) -> HatResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| HatError::config(format!("Failed to read board config: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str());
        match extension {
            Some("toml") => Self::from_toml(&contents),
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            _ => Self::from_yaml(&contents).or_else(|_| Self::from_toml(&contents)),
        }
    }

    /// Parse config from YAML string
    pub fn from_yaml(contents: &str) -> HatResult<Self> {
        let config: Self = serde_yaml::from_str(contents)
            .map_err(|e| HatError::config(format!("Failed to parse board YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse config from TOML string
    pub fn from_toml(contents: &str) -> HatResult<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| HatError::config(format!("Failed to parse board TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> HatResult<()> {
        for (name, interface) in &self.interfaces {
            interface
                .validate()
                .map_err(|e| HatError::config(format!("interface '{}': {}", name, e)))?;
        }
        Ok(())
    }

    /// Get an interface config by name
    pub fn get_interface(&self, name: &str) -> HatResult<&InterfaceConfig> {
        self.interfaces
            .get(name)
            .ok_or_else(|| HatError::config(format!("Interface '{}' not found in config", name)))
    }

    /// Get an interface config by name, or a simulation config
    pub fn get_interface_or_default(&self, name: &str) -> InterfaceConfig {
        self.interfaces
            .get(name)
            .cloned()
            .unwrap_or_else(InterfaceConfig::simulation)
    }

    /// Add an interface config
    pub fn add_interface(&mut self, name: &str, config: InterfaceConfig) {
        self.interfaces.insert(name.to_string(), config);
    }

    /// Check if an interface is configured
    pub fn has_interface(&self, name: &str) -> bool {
        self.interfaces.contains_key(name)
    }

    /// Get all enabled interfaces
    pub fn enabled_interfaces(&self) -> Vec<(&str, &InterfaceConfig)> {
        self.interfaces
            .iter()
            .filter(|(_, c)| c.enabled)
            .map(|(n, c)| (n.as_str(), c))
            .collect()
    }

    /// Find and load config from standard search paths
    ///
    /// Search order:
    /// 1. ./hatkit.yaml, ./hatkit.yml or ./hatkit.toml
    /// 2. /etc/hatkit/hatkit.yaml or /etc/hatkit/hatkit.toml
    pub fn find_and_load() -> HatResult<Self> {
        let search_paths = [
            PathBuf::from("hatkit.yaml"),
            PathBuf::from("hatkit.yml"),
            PathBuf::from("hatkit.toml"),
            PathBuf::from("/etc/hatkit/hatkit.yaml"),
            PathBuf::from("/etc/hatkit/hatkit.toml"),
        ];

        for path in search_paths {
            if path.exists() {
                log::info!("Loading board config from {}", path.display());
                return Self::from_file(&path);
            }
        }

        Err(HatError::config(
            "No board config file found in standard locations",
        ))
    }

    /// Save config to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> HatResult<()> {
        let path = path.as_ref();
        let extension = path.extension().and_then(|s| s.to_str());

        let contents = match extension {
            Some("toml") => toml::to_string_pretty(self)?,
            _ => serde_yaml::to_string(self)?,
        };

        std::fs::write(path, contents)
            .map_err(|e| HatError::config(format!("Failed to write board config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_status_display() {
        assert_eq!(DriverStatus::Ready.to_string(), "Ready");
        assert_eq!(
            DriverStatus::Error("test".to_string()).to_string(),
            "Error: test"
        );
        assert!(DriverStatus::Running.is_active());
        assert!(!DriverStatus::Shutdown.is_active());
    }

    #[test]
    fn test_interface_config_constructors() {
        let config = InterfaceConfig::simulation();
        assert!(config.is_simulation());
        assert!(config.enabled);

        let i2c = InterfaceConfig::i2c(1, 0x40);
        assert_eq!(i2c.bus, Some(1));
        assert_eq!(i2c.address, Some(0x40));
        assert!(i2c.backend.is_none());
        assert!(!i2c.is_simulation());

        let spi = InterfaceConfig::spi(0, 1);
        assert_eq!(spi.port, Some(0));
        assert_eq!(spi.device, Some(1));
    }

    #[test]
    fn test_interface_config_validation() {
        let mut config = InterfaceConfig::spi(0, 0);
        config.mode = Some(4);
        assert!(config.validate().is_err());

        let mut config = InterfaceConfig::hpwm(18);
        config.duty = Some(1.5);
        assert!(config.validate().is_err());

        config.duty = Some(0.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_board_config_yaml() {
        let yaml = r#"
interfaces:
  servo_bus:
    backend: linux
    bus: 1
    address: 64
  adc:
    backend: spidev
    port: 0
    device: 0
    mode: 0
    max_speed_hz: 1000000
  speaker:
    dev_name: default
    channels: 2
    framerate: 44100
    volume: 80
    retries: 3
"#;
        let config = BoardConfig::from_yaml(yaml).unwrap();

        let servo = config.get_interface("servo_bus").unwrap();
        assert_eq!(servo.backend.as_deref(), Some("linux"));
        assert_eq!(servo.address, Some(64));

        let adc = config.get_interface("adc").unwrap();
        assert_eq!(adc.max_speed_hz, Some(1_000_000));

        let speaker = config.get_interface("speaker").unwrap();
        assert_eq!(speaker.channels, Some(2));
        assert_eq!(speaker.get_option_i64("retries"), Some(3));

        assert!(config.has_interface("adc"));
        assert!(!config.has_interface("camera"));
    }

    #[test]
    fn test_board_config_rejects_bad_volume() {
        let yaml = r#"
interfaces:
  speaker:
    volume: 180
"#;
        assert!(BoardConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_board_config_toml() {
        let toml = r#"
[interfaces.pwm]
backend = "sysfs"
pin = 18
frequency = 1000
duty = 0.25
"#;
        let config = BoardConfig::from_toml(toml).unwrap();
        let pwm = config.get_interface("pwm").unwrap();
        assert_eq!(pwm.pin, Some(18));
        assert_eq!(pwm.frequency, Some(1000));
    }

    #[test]
    fn test_board_config_default() {
        let config = BoardConfig::new();
        let default = config.get_interface_or_default("nonexistent");
        assert!(default.is_simulation());
    }

    #[test]
    fn test_enabled_interfaces() {
        let yaml = r#"
interfaces:
  active:
    backend: simulation
    enabled: true
  inactive:
    backend: simulation
    enabled: false
"#;
        let config = BoardConfig::from_yaml(yaml).unwrap();
        let enabled = config.enabled_interfaces();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].0, "active");
    }
}
