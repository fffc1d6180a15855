//! Device base: identity, observation buffer, owned interfaces, lifecycle
//!
//! A device owns the bus handles it opened from `start` until `stop`.
//! Handles borrowed from another device (an ADC shared by two IR sensors,
//! an I2C bus shared with an expander) are never registered here, so only
//! their creator releases them.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{ObservationBuffer, DEFAULT_CAPACITY};
use crate::driver::DriverStatus;
use crate::error::{HatError, HatResult};

/// A handle to an opened bus resource
pub trait Interface: Send {
    /// Backend tag, e.g. "linux", "simulation", "mcp23017"
    fn backend(&self) -> &str;

    /// Release the underlying resource. Must be idempotent.
    fn close(&mut self) -> HatResult<()>;
}

/// Bus handle shared between a device and its worker threads
pub type Shared<T> = Arc<Mutex<Box<T>>>;

/// Wrap a boxed interface into a [`Shared`] handle
pub fn share<T: ?Sized>(inner: Box<T>) -> Shared<T> {
    Arc::new(Mutex::new(inner))
}

/// Something an [`InterfaceSet`] can release on stop
pub trait Releasable: Send + Sync {
    fn label(&self) -> String;
    fn release(&self) -> HatResult<()>;
}

impl<T> Releasable for Shared<T>
where
    T: Interface + ?Sized,
{
    fn label(&self) -> String {
        self.lock().backend().to_string()
    }

    fn release(&self) -> HatResult<()> {
        self.lock().close()
    }
}

/// Registry of the interfaces one device instance owns
#[derive(Default)]
pub struct InterfaceSet {
    entries: Vec<(String, Box<dyn Releasable>)>,
}

impl InterfaceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle this device created
    pub fn register<R: Releasable + 'static>(&mut self, name: &str, handle: R) {
        self.entries.push((name.to_string(), Box::new(handle)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Close every registered handle, newest first
    ///
    /// Errors are logged and swallowed; the set is empty afterwards.
    pub fn release_all(&mut self) {
        while let Some((name, handle)) = self.entries.pop() {
            if let Err(e) = handle.release() {
                log::warn!("Failed to release interface '{}' ({}): {}", name, handle.label(), e);
            } else {
                log::debug!("Released interface '{}' ({})", name, handle.label());
            }
        }
    }
}

impl std::fmt::Debug for InterfaceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceSet")
            .field("entries", &self.names())
            .finish()
    }
}

/// Lifecycle shared by every driver and controller
pub trait Device {
    fn name(&self) -> &str;

    /// Acquire resources and begin operation
    fn start(&mut self) -> HatResult<()>;

    /// Release resources. Idempotent, and safe after a failed `start`.
    fn stop(&mut self) -> HatResult<()>;

    fn status(&self) -> DriverStatus;

    fn restart(&mut self) -> HatResult<()> {
        self.stop()?;
        self.start()
    }
}

/// State every device embeds
#[derive(Debug)]
pub struct DeviceBase<T: Clone> {
    name: String,
    buffer: ObservationBuffer<T>,
    interfaces: InterfaceSet,
    status: DriverStatus,
}

impl<T: Clone> DeviceBase<T> {
    pub fn new(name: &str) -> Self {
        Self::with_capacity(name, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            buffer: ObservationBuffer::new(capacity),
            interfaces: InterfaceSet::new(),
            status: DriverStatus::Uninitialized,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffer(&self) -> &ObservationBuffer<T> {
        &self.buffer
    }

    pub fn interfaces_mut(&mut self) -> &mut InterfaceSet {
        &mut self.interfaces
    }

    pub fn status(&self) -> DriverStatus {
        self.status.clone()
    }

    pub fn set_status(&mut self, status: DriverStatus) {
        self.status = status;
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Store an observation and mark the device as running
    pub fn record(&mut self, observation: T) {
        self.buffer.append(observation);
        self.status = DriverStatus::Running;
    }

    pub fn mark_ready(&mut self) {
        log::debug!("{}: ready", self.name);
        self.status = DriverStatus::Ready;
    }

    /// Release every owned interface after a failed start, keeping the error
    pub fn fail(&mut self, error: &HatError) {
        log::warn!("{}: start failed: {}", self.name, error);
        self.interfaces.release_all();
        self.status = DriverStatus::Error(error.to_string());
    }

    /// Release every owned interface and mark the device shut down.
    /// Calling this twice is a no-op.
    pub fn release(&mut self) {
        if self.status == DriverStatus::Shutdown && self.interfaces.is_empty() {
            return;
        }
        self.interfaces.release_all();
        self.status = DriverStatus::Shutdown;
        log::debug!("{}: shut down", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBus {
        closes: Arc<AtomicUsize>,
        open: bool,
    }

    impl Interface for CountingBus {
        fn backend(&self) -> &str {
            "counting"
        }

        fn close(&mut self) -> HatResult<()> {
            if self.open {
                self.open = false;
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[test]
    fn test_release_closes_owned_interfaces_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let bus: Shared<dyn Interface> = share(Box::new(CountingBus {
            closes: closes.clone(),
            open: true,
        }) as Box<dyn Interface>);

        let mut base: DeviceBase<u32> = DeviceBase::new("probe");
        base.interfaces_mut().register("bus", bus.clone());
        base.mark_ready();
        base.record(3);
        assert_eq!(base.status(), DriverStatus::Running);

        base.release();
        base.release();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(base.status(), DriverStatus::Shutdown);
        assert_eq!(base.buffer().latest(), Some(3));
    }

    #[test]
    fn test_fail_keeps_error_status() {
        let mut base: DeviceBase<u8> = DeviceBase::new("broken");
        base.fail(&HatError::driver("no ack"));
        assert!(matches!(base.status(), DriverStatus::Error(_)));
        assert!(!base.is_active());
        base.release();
        assert_eq!(base.status(), DriverStatus::Shutdown);
    }

    #[test]
    fn test_release_without_start_is_safe() {
        let mut base: DeviceBase<()> = DeviceBase::with_capacity("never-started", 4);
        base.release();
        assert_eq!(base.status(), DriverStatus::Shutdown);
        assert_eq!(base.buffer().capacity(), 4);
    }
}
