//! # hatkit library
//!
//! Bus backends, device drivers and controllers for single-board-computer
//! add-on boards.
//!
//! ## Structure
//!
//! ```text
//! hatkit_library/
//! ── drivers/        # Bus backends, backend selector, device drivers, media engines
//! ── messages/       # Observations and commands produced by devices
//! ── nodes/          # Controllers with background work (safe audio, camera, line follower)
//! ── bin/            # hatkit-audio-worker, the process side of the safe audio controllers
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hatkit_core::device::Device;
//! use hatkit_core::driver::InterfaceConfig;
//! use hatkit_library::{Pca9685, Pca9685Config};
//!
//! let mut pwm = Pca9685::new(Pca9685Config {
//!     bus: InterfaceConfig::i2c(1, 0x40),
//!     ..Default::default()
//! });
//! pwm.start()?;
//! pwm.set_frequency(50.0)?;
//! pwm.write(0, 0.5)?;
//! pwm.stop()?;
//! ```

pub mod drivers;
pub mod messages;
pub mod nodes;

// Re-export message types at the crate root for convenience
pub use messages::*;

// Bus backends
pub use drivers::bus::{
    shared_i2c, shared_spi, I2cBus, RegisterMap, SharedI2c, SharedSpi, SimulationI2cDriver,
    SimulationSpiDriver, SpiBus,
};
#[cfg(feature = "i2c-hardware")]
pub use drivers::bus::LinuxI2cDriver;
#[cfg(feature = "spi-hardware")]
pub use drivers::bus::LinuxSpiDriver;

// GPIO, expander, hardware PWM
pub use drivers::expander::{Mcp23017Config, Mcp23017Driver};
#[cfg(feature = "gpio-hardware")]
pub use drivers::gpio::RppalGpioDriver;
pub use drivers::gpio::{
    shared_gpio, Gpio, SharedGpio, SimulationGpioDriver, SimulationGpioHandle,
};
pub use drivers::pwm::{HardwarePwm, SimulationPwmDriver, SysfsPwmDriver};

// Backend selection
pub use drivers::factory::{
    init_interface, open_gpio, open_hpwm, open_i2c, open_spi, AnyInterface,
};

// Sensors
pub use drivers::adc::{Adc, Ads7830, Ads7830Config, Mcp3002, Mcp3002Config, SharedAdc};
pub use drivers::button::{Button, ButtonConfig};
pub use drivers::encoder::{EncoderConfig, WheelEncoder};
pub use drivers::environment::{Bme280, Bme280Config, Humidity, Pressure, Temperature};
pub use drivers::imu::{Icm20948, Icm20948Config};
pub use drivers::ir::{IrConfig, IrRangefinder};
pub use drivers::line_sensor::{LineMode, LineSensor, LineSensorConfig};
pub use drivers::ultrasonic::{Ultrasonic, UltrasonicConfig};

// Actuators
pub use drivers::led_strip::{LedStrip, LedStripConfig, Rgb};
pub use drivers::motor::{MotorConfig, MotorController};
pub use drivers::servo::{Pca9685, Pca9685Config, ServoKit};

// Media engines
#[cfg(feature = "alsa-backend")]
pub use drivers::audio::{AlsaCapture, AlsaPlayback};
pub use drivers::audio::{
    CaptureBackend, PcmFormat, PlaybackBackend, SimulationCapture, SimulationPlayback,
};
pub use drivers::camera::{CameraConfig, CaptureEngine, SimulationCameraEngine};
#[cfg(feature = "v4l2-backend")]
pub use drivers::camera::V4l2CameraEngine;

// Controllers
pub use nodes::{
    Camera, LineFollower, LineFollowerConfig, SafeAudioConfig, SafeMicrophone, SafeSpeaker,
    SystemSpeaker, SystemSpeakerConfig,
};
