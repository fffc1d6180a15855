//! # hatkit
//!
//! Drivers and controllers for the peripherals found on single-board
//! computer add-on boards: GPIO and port expanders, I2C/SPI sensors,
//! PWM engines, motors, cameras and sound cards.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hatkit::prelude::*;
//!
//! fn main() -> HatResult<()> {
//!     let mut sonar = Ultrasonic::new(UltrasonicConfig {
//!         gpio: InterfaceConfig::simulation(),
//!         ..Default::default()
//!     });
//!     sonar.start()?;
//!     if let Ok(cm) = sonar.read() {
//!         println!("{:.1} cm", cm);
//!     }
//!     sonar.stop()
//! }
//! ```
//!
//! ## Features
//!
//! - **Simulation backends** for every bus, always compiled
//! - **Hardware backends** behind cargo features (`gpio-hardware`,
//!   `i2c-hardware`, `spi-hardware`, `v4l2-backend`, `alsa-backend`)
//! - **Supervised audio** that restarts a wedged sound card worker

// Re-export core components
pub use hatkit_core::{self, *};

// Re-export the driver library with alias
pub use hatkit_library as library;

// Re-export serde at crate root for downstream config types
pub use serde;

// Re-export the logging facade the drivers log through
pub use log;

/// The hatkit prelude - lifecycle traits, configuration and the common devices
pub mod prelude {
    // ============================================
    // Core
    // ============================================
    pub use hatkit_core::buffer::ObservationBuffer;
    pub use hatkit_core::clock::{Clock, SystemClock, VirtualClock};
    pub use hatkit_core::device::Device;
    pub use hatkit_core::driver::{BoardConfig, DriverStatus, InterfaceConfig};
    pub use hatkit_core::error::{HatError, HatResult};
    pub use hatkit_core::event::Event;

    // ============================================
    // Buses
    // ============================================
    pub use hatkit_library::drivers::gpio::{Direction, Edge, Gpio, Pull};
    pub use hatkit_library::{I2cBus, SpiBus};

    // ============================================
    // Devices
    // ============================================
    pub use hatkit_library::{
        Bme280, Button, Icm20948, IrRangefinder, LedStrip, LineSensor, Mcp3002, MotorController,
        Pca9685, ServoKit, Ultrasonic, UltrasonicConfig, WheelEncoder,
    };

    // ============================================
    // Controllers
    // ============================================
    pub use hatkit_library::{
        Camera, LineFollower, SafeAudioConfig, SafeMicrophone, SafeSpeaker, SystemSpeaker,
    };

    // ============================================
    // Messages
    // ============================================
    pub use hatkit_library::messages::{
        AudioSource, DifferentialDriveCommand, Environment, ImageFrame, Imu, LineSample, Range,
    };
}
