//! Simulation bus drivers
//!
//! Provides simulated I2C and SPI masters for tests and off-target runs.
//! Devices behind the simulated I2C bus are [`I2cDeviceModel`]s; the
//! built-in [`RegisterMap`] behaves like a plain auto-incrementing register
//! file and keeps a shared handle so tests can inspect it after the bus has
//! been boxed away.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use hatkit_core::device::Interface;
use hatkit_core::error::{HatError, HatResult};

use super::{clamp_read_len, retry_once, I2cBus, SpiBus, SpiSettings};

/// Behaviour of one device on the simulated I2C bus
pub trait I2cDeviceModel: Send {
    fn read(&mut self, reg: u8, n: usize) -> HatResult<Vec<u8>>;

    fn write(&mut self, reg: u8, data: &[u8]) -> HatResult<()>;
}

/// Flat 256-register file with auto-increment
///
/// Clones share the same registers.
#[derive(Clone, Default)]
pub struct RegisterMap {
    inner: Arc<Mutex<RegisterFile>>,
}

struct RegisterFile {
    registers: [u8; 256],
    writes: Vec<(u8, Vec<u8>)>,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            registers: [0; 256],
            writes: Vec::new(),
        }
    }
}

impl RegisterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a map with initial register values
    pub fn with_registers(initial: &[(u8, u8)]) -> Self {
        let map = Self::new();
        for &(reg, value) in initial {
            map.set(reg, value);
        }
        map
    }

    pub fn get(&self, reg: u8) -> u8 {
        self.inner.lock().registers[reg as usize]
    }

    /// Set a register without recording a write
    pub fn set(&self, reg: u8, value: u8) {
        self.inner.lock().registers[reg as usize] = value;
    }

    /// Every write the bus master performed, in order
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.inner.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.inner.lock().writes.clear();
    }
}

impl I2cDeviceModel for RegisterMap {
    fn read(&mut self, reg: u8, n: usize) -> HatResult<Vec<u8>> {
        let file = self.inner.lock();
        Ok((0..n)
            .map(|i| file.registers[reg.wrapping_add(i as u8) as usize])
            .collect())
    }

    fn write(&mut self, reg: u8, data: &[u8]) -> HatResult<()> {
        let mut file = self.inner.lock();
        for (i, &byte) in data.iter().enumerate() {
            file.registers[reg.wrapping_add(i as u8) as usize] = byte;
        }
        file.writes.push((reg, data.to_vec()));
        Ok(())
    }
}

/// Handle for making the next transfers on a simulated bus fail
#[derive(Clone, Default)]
pub struct FaultInjector {
    pending: Arc<AtomicUsize>,
}

impl FaultInjector {
    /// Fail the next `count` transfers with a transient bus error
    pub fn fail_next(&self, count: usize) {
        self.pending.store(count, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Simulation I2C bus driver
pub struct SimulationI2cDriver {
    bus: u8,
    devices: HashMap<u8, Box<dyn I2cDeviceModel>>,
    faults: FaultInjector,
    open: bool,
}

impl SimulationI2cDriver {
    pub fn new(bus: u8) -> Self {
        Self {
            bus,
            devices: HashMap::new(),
            faults: FaultInjector::default(),
            open: true,
        }
    }

    /// Attach a device model at `addr`
    pub fn attach<M: I2cDeviceModel + 'static>(&mut self, addr: u8, model: M) {
        self.devices.insert(addr, Box::new(model));
    }

    /// Builder form of [`attach`](Self::attach)
    pub fn with_device<M: I2cDeviceModel + 'static>(mut self, addr: u8, model: M) -> Self {
        self.attach(addr, model);
        self
    }

    pub fn fault_injector(&self) -> FaultInjector {
        self.faults.clone()
    }

    pub fn bus_number(&self) -> u8 {
        self.bus
    }

    fn device(&mut self, addr: u8) -> HatResult<&mut Box<dyn I2cDeviceModel>> {
        if !self.open {
            return Err(HatError::driver(format!("I2C bus {} is closed", self.bus)));
        }
        if self.faults.take() {
            return Err(HatError::bus(format!("injected NACK from 0x{:02x}", addr)));
        }
        self.devices
            .get_mut(&addr)
            .ok_or_else(|| HatError::bus(format!("no ACK from 0x{:02x} on bus {}", addr, self.bus)))
    }
}

impl Default for SimulationI2cDriver {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Interface for SimulationI2cDriver {
    fn backend(&self) -> &str {
        "simulation"
    }

    fn close(&mut self) -> HatResult<()> {
        self.open = false;
        Ok(())
    }
}

impl I2cBus for SimulationI2cDriver {
    fn read(&mut self, addr: u8, reg: u8, n: usize) -> HatResult<Vec<u8>> {
        let n = clamp_read_len(addr, reg, n);
        retry_once(|| self.device(addr)?.read(reg, n))
    }

    fn write(&mut self, addr: u8, reg: u8, data: &[u8]) -> HatResult<()> {
        retry_once(|| self.device(addr)?.write(reg, data))
    }

    fn combined(&mut self, addr: u8, reg: u8, write: &[u8], read_n: usize) -> HatResult<Vec<u8>> {
        let read_n = clamp_read_len(addr, reg, read_n);
        retry_once(|| {
            let device = self.device(addr)?;
            if !write.is_empty() {
                device.write(reg, write)?;
            }
            device.read(reg, read_n)
        })
    }
}

// ============================================================================
// SPI
// ============================================================================

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// Shared record of every frame clocked out on a simulated SPI bus
#[derive(Clone, Default)]
pub struct SpiLog {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl SpiLog {
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().clone()
    }

    pub fn last(&self) -> Option<Vec<u8>> {
        self.frames.lock().last().cloned()
    }

    fn push(&self, frame: &[u8]) {
        self.frames.lock().push(frame.to_vec());
    }
}

/// Simulation SPI bus driver
///
/// Replies come from a responder closure if one is installed, otherwise from
/// queued responses, otherwise the bus reads back `0xFF`.
pub struct SimulationSpiDriver {
    port: u8,
    device: u8,
    settings: SpiSettings,
    responder: Option<Responder>,
    queued: VecDeque<Vec<u8>>,
    log: SpiLog,
    open: bool,
}

impl SimulationSpiDriver {
    pub fn new(port: u8, device: u8) -> Self {
        Self {
            port,
            device,
            settings: SpiSettings::default(),
            responder: None,
            queued: VecDeque::new(),
            log: SpiLog::default(),
            open: true,
        }
    }

    /// Compute each reply from the transmitted frame
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    pub fn queue_response(&mut self, response: Vec<u8>) {
        self.queued.push_back(response);
    }

    pub fn log(&self) -> SpiLog {
        self.log.clone()
    }

    fn exchange(&mut self, tx: &[u8]) -> HatResult<Vec<u8>> {
        if !self.open {
            return Err(HatError::driver(format!(
                "SPI {}.{} is closed",
                self.port, self.device
            )));
        }
        self.log.push(tx);
        let mut rx = if let Some(responder) = self.responder.as_mut() {
            responder(tx)
        } else if let Some(queued) = self.queued.pop_front() {
            queued
        } else {
            vec![0xFF; tx.len()]
        };
        rx.resize(tx.len(), 0xFF);
        Ok(rx)
    }
}

impl Interface for SimulationSpiDriver {
    fn backend(&self) -> &str {
        "simulation"
    }

    fn close(&mut self) -> HatResult<()> {
        self.open = false;
        Ok(())
    }
}

impl SpiBus for SimulationSpiDriver {
    fn read(&mut self, n: usize) -> HatResult<Vec<u8>> {
        self.exchange(&vec![0; n])
    }

    fn write(&mut self, data: &[u8]) -> HatResult<()> {
        self.exchange(data).map(|_| ())
    }

    fn transfer(&mut self, data: &[u8]) -> HatResult<Vec<u8>> {
        self.exchange(data)
    }

    fn settings(&self) -> SpiSettings {
        self.settings
    }

    fn apply_settings(&mut self, settings: SpiSettings) -> HatResult<()> {
        settings.validate()?;
        self.settings = settings;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_map_auto_increment() {
        let map = RegisterMap::with_registers(&[(0x10, 0xAA), (0x11, 0xBB)]);
        let mut bus = SimulationI2cDriver::new(1).with_device(0x40, map.clone());

        assert_eq!(bus.read(0x40, 0x10, 2).unwrap(), vec![0xAA, 0xBB]);
        bus.write(0x40, 0x20, &[1, 2, 3]).unwrap();
        assert_eq!(map.get(0x22), 3);
        assert_eq!(map.writes(), vec![(0x20, vec![1, 2, 3])]);
    }

    #[test]
    fn test_missing_device_is_transient() {
        let mut bus = SimulationI2cDriver::default();
        let err = bus.read_byte(0x50, 0).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_single_fault_is_retried() {
        let mut bus = SimulationI2cDriver::new(1).with_device(0x20, RegisterMap::new());
        let faults = bus.fault_injector();

        faults.fail_next(1);
        assert!(bus.write_byte(0x20, 0, 1).is_ok());

        faults.fail_next(2);
        assert!(bus.write_byte(0x20, 0, 1).unwrap_err().is_transient());
    }

    #[test]
    fn test_long_read_is_clamped() {
        let mut bus = SimulationI2cDriver::new(1).with_device(0x68, RegisterMap::new());
        assert_eq!(bus.read(0x68, 0, 40).unwrap().len(), 32);
    }

    #[test]
    fn test_update_bits() {
        let map = RegisterMap::with_registers(&[(0x00, 0b1010_0000)]);
        let mut bus = SimulationI2cDriver::new(1).with_device(0x20, map.clone());
        bus.update_bits(0x20, 0x00, 0b0000_0011, 0b0000_0001).unwrap();
        assert_eq!(map.get(0x00), 0b1010_0001);
    }

    #[test]
    fn test_closed_bus_rejects_transfers() {
        let mut bus = SimulationI2cDriver::new(1).with_device(0x20, RegisterMap::new());
        bus.close().unwrap();
        bus.close().unwrap();
        assert!(bus.read_byte(0x20, 0).is_err());
    }

    #[test]
    fn test_spi_responder_and_log() {
        let mut spi = SimulationSpiDriver::new(0, 0).with_responder(|tx| tx.iter().map(|b| !b).collect());
        let log = spi.log();
        assert_eq!(spi.transfer(&[0x0F, 0xF0]).unwrap(), vec![0xF0, 0x0F]);
        spi.write(&[1, 2]).unwrap();
        assert_eq!(log.frames().len(), 2);
        assert_eq!(log.last(), Some(vec![1, 2]));
    }

    #[test]
    fn test_spi_settings() {
        let mut spi = SimulationSpiDriver::new(0, 1);
        spi.set_mode(3).unwrap();
        spi.set_max_speed_hz(2_400_000).unwrap();
        assert_eq!(spi.mode(), 3);
        assert_eq!(spi.max_speed_hz(), 2_400_000);
        assert!(spi.set_mode(4).is_err());
        assert_eq!(spi.mode(), 3);
    }
}
