//! Simulation hardware PWM driver

use std::sync::Arc;

use hatkit_core::device::Interface;
use hatkit_core::error::{HatError, HatResult};

use super::{check_duty, check_frequency, HardwarePwm, PinPairLock, PwmPinGuard};

/// In-memory PWM channel that still honours the pin-pair lock
pub struct SimulationPwmDriver {
    pin: u8,
    guard: Option<PwmPinGuard>,
    frequency: f64,
    duty: f64,
    enabled: bool,
}

impl SimulationPwmDriver {
    /// Claim `pin` on the process-wide pair lock
    pub fn open(pin: u8) -> HatResult<Self> {
        Self::with_lock(pin, &PinPairLock::global())
    }

    pub fn with_lock(pin: u8, lock: &Arc<PinPairLock>) -> HatResult<Self> {
        let guard = lock.acquire(pin)?;
        Ok(Self {
            pin,
            guard: Some(guard),
            frequency: 1000.0,
            duty: 0.0,
            enabled: false,
        })
    }

    fn ensure_open(&self) -> HatResult<()> {
        if self.guard.is_some() {
            Ok(())
        } else {
            Err(HatError::driver(format!("PWM pin {} is closed", self.pin)))
        }
    }
}

impl Interface for SimulationPwmDriver {
    fn backend(&self) -> &str {
        "simulation"
    }

    fn close(&mut self) -> HatResult<()> {
        self.enabled = false;
        self.guard = None;
        Ok(())
    }
}

impl HardwarePwm for SimulationPwmDriver {
    fn pin(&self) -> u8 {
        self.pin
    }

    fn set_frequency(&mut self, hz: f64) -> HatResult<()> {
        self.ensure_open()?;
        check_frequency(hz)?;
        self.frequency = hz;
        Ok(())
    }

    fn frequency(&self) -> f64 {
        self.frequency
    }

    fn set_duty(&mut self, duty: f64) -> HatResult<()> {
        self.ensure_open()?;
        check_duty(duty)?;
        self.duty = duty;
        Ok(())
    }

    fn duty(&self) -> f64 {
        self.duty
    }

    fn enable(&mut self, enable: bool) -> HatResult<()> {
        self.ensure_open()?;
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

    #[test]
    fn test_close_releases_pair() {
        let lock = PinPairLock::new();
        let mut pwm = SimulationPwmDriver::with_lock(12, &lock).unwrap();
        pwm.set_frequency(50.0).unwrap();
        pwm.set_duty(0.075).unwrap();
        pwm.enable(true).unwrap();
        assert!(pwm.set_duty(1.2).is_err());
        assert!(SimulationPwmDriver::with_lock(18, &lock).is_err());

        pwm.close().unwrap();
        pwm.close().unwrap();
        assert!(!pwm.is_enabled());
        assert!(pwm.enable(true).is_err());
        assert!(SimulationPwmDriver::with_lock(18, &lock).is_ok());
    }
}
