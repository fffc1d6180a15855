//! # hatkit core
//!
//! Hardware-independent building blocks for the hatkit peripheral library:
//!
//! - **Errors**: one taxonomy for bus, driver and controller failures
//! - **Driver status & configuration**: lifecycle state and typed interface options
//! - **Observation buffer**: bounded drop-oldest history of readings
//! - **Device base**: identity, owned-interface registry, start/stop/restart
//! - **Clock & Event**: time sources and run/stop flags for background loops

pub mod buffer;
pub mod clock;
pub mod device;
pub mod driver;
pub mod error;
pub mod event;

pub use buffer::ObservationBuffer;
pub use clock::{Clock, SystemClock, VirtualClock};
pub use device::{share, Device, DeviceBase, Interface, InterfaceSet, Releasable, Shared};
pub use driver::{BoardConfig, DriverCategory, DriverStatus, InterfaceConfig};
pub use error::{HatError, HatResult};
pub use event::Event;
