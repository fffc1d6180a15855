//! Linux sysfs PWM driver
//!
//! Drives `/sys/class/pwm/pwmchipN/pwmM/{period,duty_cycle,enable}`.
//! Right after export the channel attributes are briefly root-only until
//! udev fixes their permissions, so attribute writes are retried with a
//! linear backoff.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hatkit_core::device::Interface;
use hatkit_core::error::{HatError, HatResult};

use super::{
    channel_of, check_duty, check_frequency, HardwarePwm, PinPairLock, PwmPinGuard,
};

/// Sysfs PWM configuration
#[derive(Debug, Clone)]
pub struct SysfsPwmConfig {
    pub pin: u8,
    /// sysfs class directory
    pub root: PathBuf,
    pub chip: u32,
    /// Attempts per attribute write
    pub attempts: u32,
    /// Backoff unit; attempt `n` waits `n * backoff`
    pub backoff: Duration,
}

impl Default for SysfsPwmConfig {
    fn default() -> Self {
        Self {
            pin: 18,
            root: PathBuf::from("/sys/class/pwm"),
            chip: 0,
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Sysfs PWM channel
pub struct SysfsPwmDriver {
    config: SysfsPwmConfig,
    guard: Option<PwmPinGuard>,
    period_ns: u64,
    duty: f64,
    enabled: bool,
}

impl SysfsPwmDriver {
    pub fn open(config: SysfsPwmConfig) -> HatResult<Self> {
        Self::with_lock(config, &PinPairLock::global())
    }

    pub fn with_lock(config: SysfsPwmConfig, lock: &Arc<PinPairLock>) -> HatResult<Self> {
        let chip_dir = config.root.join(format!("pwmchip{}", config.chip));
        if !chip_dir.exists() {
            return Err(HatError::NotInstalledInterface(format!(
                "hpwm ({} missing)",
                chip_dir.display()
            )));
        }
        let guard = lock.acquire(config.pin)?;

        let mut driver = Self {
            config,
            guard: Some(guard),
            period_ns: 0,
            duty: 0.0,
            enabled: false,
        };
        driver.export()?;
        driver.period_ns = driver.read_attr("period").unwrap_or(0);
        log::info!(
            "Hardware PWM on pin {} (pwmchip{}/pwm{})",
            driver.config.pin,
            driver.config.chip,
            channel_of(driver.config.pin)
        );
        Ok(driver)
    }

    fn chip_dir(&self) -> PathBuf {
        self.config.root.join(format!("pwmchip{}", self.config.chip))
    }

    fn channel_dir(&self) -> PathBuf {
        self.chip_dir().join(format!("pwm{}", channel_of(self.config.pin)))
    }

    fn export(&self) -> HatResult<()> {
        if self.channel_dir().exists() {
            return Ok(());
        }
        let channel = channel_of(self.config.pin).to_string();
        self.write_with_retry(self.chip_dir().join("export"), &channel)?;

        for attempt in 1..=self.config.attempts {
            if self.channel_dir().exists() {
                return Ok(());
            }
            std::thread::sleep(self.config.backoff * attempt);
        }
        Err(HatError::backend_init(
            "sysfs-pwm",
            format!("{} did not appear after export", self.channel_dir().display()),
        ))
    }

    fn write_with_retry(&self, path: PathBuf, value: &str) -> HatResult<()> {
        let mut attempt = 1;
        loop {
            match fs::write(&path, value) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::PermissionDenied && attempt < self.config.attempts => {
                    log::debug!(
                        "{} not writable yet (attempt {}), retrying",
                        path.display(),
                        attempt
                    );
                    std::thread::sleep(self.config.backoff * attempt);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(HatError::Io(std::io::Error::new(
                        e.kind(),
                        format!("{}: {}", path.display(), e),
                    )))
                }
            }
        }
    }

    fn write_attr(&self, name: &str, value: impl ToString) -> HatResult<()> {
        if self.guard.is_none() {
            return Err(HatError::driver(format!("PWM pin {} is closed", self.config.pin)));
        }
        self.write_with_retry(self.channel_dir().join(name), &value.to_string())
    }

    fn read_attr(&self, name: &str) -> HatResult<u64> {
        let raw = fs::read_to_string(self.channel_dir().join(name))?;
        raw.trim()
            .parse()
            .map_err(|_| HatError::driver(format!("unexpected {} value '{}'", name, raw.trim())))
    }

    fn duty_ns(&self, period_ns: u64) -> u64 {
        (self.duty * period_ns as f64).round() as u64
    }
}

impl Interface for SysfsPwmDriver {
    fn backend(&self) -> &str {
        "sysfs"
    }

    fn close(&mut self) -> HatResult<()> {
        if self.guard.is_none() {
            return Ok(());
        }
        if self.enabled {
            let _ = self.write_attr("enable", 0);
            self.enabled = false;
        }
        let channel = channel_of(self.config.pin).to_string();
        if let Err(e) = fs::write(self.chip_dir().join("unexport"), channel) {
            log::debug!("unexport of pin {} failed: {}", self.config.pin, e);
        }
        self.guard = None;
        Ok(())
    }
}

impl HardwarePwm for SysfsPwmDriver {
    fn pin(&self) -> u8 {
        self.config.pin
    }

    fn set_frequency(&mut self, hz: f64) -> HatResult<()> {
        check_frequency(hz)?;
        let period_ns = (1e9 / hz).round() as u64;
        let duty_ns = self.duty_ns(period_ns);

        // duty_cycle may never exceed period
        if duty_ns > self.period_ns {
            self.write_attr("period", period_ns)?;
            self.write_attr("duty_cycle", duty_ns)?;
        } else {
            self.write_attr("duty_cycle", duty_ns)?;
            self.write_attr("period", period_ns)?;
        }
        self.period_ns = period_ns;
        Ok(())
    }

    fn frequency(&self) -> f64 {
        if self.period_ns == 0 {
            0.0
        } else {
            1e9 / self.period_ns as f64
        }
    }

    fn set_duty(&mut self, duty: f64) -> HatResult<()> {
        check_duty(duty)?;
        self.duty = duty;
        self.write_attr("duty_cycle", self.duty_ns(self.period_ns))
    }

    fn duty(&self) -> f64 {
        self.duty
    }

    fn enable(&mut self, enable: bool) -> HatResult<()> {
        self.write_attr("enable", u8::from(enable))?;
        self.enabled = enable;
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs() -> (tempfile::TempDir, SysfsPwmConfig) {
        let root = tempfile::tempdir().unwrap();
        let chip = root.path().join("pwmchip0");
        fs::create_dir_all(chip.join("pwm0")).unwrap();
        fs::write(chip.join("export"), "").unwrap();
        fs::write(chip.join("unexport"), "").unwrap();
        for attr in ["period", "duty_cycle", "enable"] {
            fs::write(chip.join("pwm0").join(attr), "0").unwrap();
        }
        let config = SysfsPwmConfig {
            pin: 18,
            root: root.path().to_path_buf(),
            backoff: Duration::from_millis(1),
            ..Default::default()
        };
        (root, config)
    }

    fn attr(root: &tempfile::TempDir, name: &str) -> String {
        fs::read_to_string(root.path().join("pwmchip0/pwm0").join(name)).unwrap()
    }

    #[test]
    fn test_frequency_duty_enable() {
        let (root, config) = fake_sysfs();
        let lock = PinPairLock::new();
        let mut pwm = SysfsPwmDriver::with_lock(config, &lock).unwrap();

        pwm.set_frequency(1000.0).unwrap();
        pwm.set_duty(0.25).unwrap();
        pwm.enable(true).unwrap();

        assert_eq!(attr(&root, "period"), "1000000");
        assert_eq!(attr(&root, "duty_cycle"), "250000");
        assert_eq!(attr(&root, "enable"), "1");
        assert!((pwm.frequency() - 1000.0).abs() < 1e-9);

        // Duty fraction is kept across frequency changes
        pwm.set_frequency(50.0).unwrap();
        assert_eq!(attr(&root, "duty_cycle"), "5000000");

        pwm.close().unwrap();
        assert_eq!(attr(&root, "enable"), "0");
        assert_eq!(lock.active_pair(), None);
    }

    #[test]
    fn test_missing_chip_is_not_installed() {
        let root = tempfile::tempdir().unwrap();
        let config = SysfsPwmConfig {
            root: root.path().to_path_buf(),
            ..Default::default()
        };
        let err = SysfsPwmDriver::with_lock(config, &PinPairLock::new()).err().unwrap();
        assert!(err.is_not_installed());
    }

    #[test]
    fn test_export_waits_for_channel() {
        let root = tempfile::tempdir().unwrap();
        let chip = root.path().join("pwmchip0");
        fs::create_dir_all(&chip).unwrap();
        let config = SysfsPwmConfig {
            pin: 19,
            root: root.path().to_path_buf(),
            backoff: Duration::from_millis(1),
            ..Default::default()
        };
        let err = SysfsPwmDriver::with_lock(config, &PinPairLock::new()).err().unwrap();
        assert!(matches!(err, HatError::BackendInit { .. }));
        assert_eq!(fs::read_to_string(chip.join("export")).unwrap(), "1");
    }
}
