//! Linux I2C driver
//!
//! I2C master on the Linux i2c-dev interface (`/dev/i2c-N`).
//! Register reads go through one `I2C_RDWR` transaction so the register
//! pointer write and the data read share a repeated start.
//! Requires the `i2c-hardware` feature.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use hatkit_core::device::Interface;
use hatkit_core::error::{HatError, HatResult};

use super::{clamp_read_len, retry_once, I2cBus};

// I2C ioctl constants
const I2C_SLAVE: libc::c_ulong = 0x0703;
const I2C_RDWR: libc::c_ulong = 0x0707;
const I2C_M_RD: u16 = 0x0001;

#[repr(C)]
struct I2cMsg {
    addr: u16,
    flags: u16,
    len: u16,
    buf: *mut u8,
}

#[repr(C)]
struct I2cRdwrData {
    msgs: *mut I2cMsg,
    nmsgs: u32,
}

/// Linux I2C configuration
#[derive(Debug, Clone)]
pub struct LinuxI2cConfig {
    /// I2C bus number; the device node is `/dev/i2c-{bus}`
    pub bus: u8,
}

impl Default for LinuxI2cConfig {
    fn default() -> Self {
        Self { bus: 1 }
    }
}

impl LinuxI2cConfig {
    pub fn device_path(&self) -> String {
        format!("/dev/i2c-{}", self.bus)
    }
}

/// Linux I2C driver using i2c-dev
pub struct LinuxI2cDriver {
    config: LinuxI2cConfig,
    device: Option<File>,
    current_addr: Option<u8>,
}

impl LinuxI2cDriver {
    /// Open `/dev/i2c-{bus}`
    ///
    /// A missing device node means the kernel module is not loaded and is
    /// reported as [`HatError::NotInstalledInterface`].
    pub fn open(config: LinuxI2cConfig) -> HatResult<Self> {
        let path = config.device_path();
        if !Path::new(&path).exists() {
            return Err(HatError::NotInstalledInterface(format!("i2c ({} missing)", path)));
        }

        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| HatError::backend_init("linux-i2c", format!("{}: {}", path, e)))?;

        log::debug!("Opened I2C bus {}", path);
        Ok(Self {
            config,
            device: Some(device),
            current_addr: None,
        })
    }

    fn file(&mut self) -> HatResult<&mut File> {
        self.device
            .as_mut()
            .ok_or_else(|| HatError::driver(format!("I2C bus {} is closed", self.config.bus)))
    }

    /// Set the I2C slave address
    fn set_address(&mut self, addr: u8) -> HatResult<()> {
        if self.current_addr == Some(addr) {
            return Ok(());
        }

        let fd = self.file()?.as_raw_fd();
        let ret = unsafe { libc::ioctl(fd, I2C_SLAVE, addr as libc::c_ulong) };
        if ret < 0 {
            return Err(HatError::bus(format!(
                "Failed to set I2C address 0x{:02x}: {}",
                addr,
                std::io::Error::last_os_error()
            )));
        }

        self.current_addr = Some(addr);
        Ok(())
    }

    fn write_read(&mut self, addr: u8, out: &mut [u8], read_n: usize) -> HatResult<Vec<u8>> {
        let fd = self.file()?.as_raw_fd();
        let mut buf = vec![0u8; read_n];
        let mut msgs = [
            I2cMsg {
                addr: addr as u16,
                flags: 0,
                len: out.len() as u16,
                buf: out.as_mut_ptr(),
            },
            I2cMsg {
                addr: addr as u16,
                flags: I2C_M_RD,
                len: read_n as u16,
                buf: buf.as_mut_ptr(),
            },
        ];
        let mut data = I2cRdwrData {
            msgs: msgs.as_mut_ptr(),
            nmsgs: msgs.len() as u32,
        };

        let ret = unsafe { libc::ioctl(fd, I2C_RDWR, &mut data as *mut I2cRdwrData) };
        if ret < 0 {
            return Err(HatError::bus(format!(
                "I2C read from 0x{:02x} failed: {}",
                addr,
                std::io::Error::last_os_error()
            )));
        }
        Ok(buf)
    }

    fn write_frame(&mut self, addr: u8, reg: u8, data: &[u8]) -> HatResult<()> {
        self.set_address(addr)?;
        let mut frame = Vec::with_capacity(data.len() + 1);
        frame.push(reg);
        frame.extend_from_slice(data);
        self.file()?
            .write_all(&frame)
            .map_err(|e| HatError::bus(format!("I2C write to 0x{:02x} failed: {}", addr, e)))
    }
}

impl Interface for LinuxI2cDriver {
    fn backend(&self) -> &str {
        "linux"
    }

    fn close(&mut self) -> HatResult<()> {
        if self.device.take().is_some() {
            log::debug!("Closed I2C bus {}", self.config.device_path());
        }
        self.current_addr = None;
        Ok(())
    }
}

impl I2cBus for LinuxI2cDriver {
    fn read(&mut self, addr: u8, reg: u8, n: usize) -> HatResult<Vec<u8>> {
        let n = clamp_read_len(addr, reg, n);
        retry_once(|| self.write_read(addr, &mut [reg], n))
    }

    fn write(&mut self, addr: u8, reg: u8, data: &[u8]) -> HatResult<()> {
        retry_once(|| self.write_frame(addr, reg, data))
    }

    fn combined(&mut self, addr: u8, reg: u8, write: &[u8], read_n: usize) -> HatResult<Vec<u8>> {
        let read_n = clamp_read_len(addr, reg, read_n);
        let mut out = Vec::with_capacity(write.len() + 1);
        out.push(reg);
        out.extend_from_slice(write);
        retry_once(|| self.write_read(addr, &mut out.clone(), read_n))
    }
}
