//! Hardware PWM drivers
//!
//! Hardware PWM on this class of board exists only on fixed pin pairs, and
//! the PWM peripheral can be routed to one pair at a time. A process-wide
//! [`PinPairLock`] enforces that: the first pin opened selects its pair,
//! pins from any other pair are refused until every pin of the active pair
//! has been closed.
//!
//! # Available Drivers
//!
//! - `SimulationPwmDriver` - Always available, in-memory channel
//! - `SysfsPwmDriver` - Linux sysfs PWM (`/sys/class/pwm/pwmchipN`)

mod simulation;
mod sysfs;

pub use simulation::SimulationPwmDriver;
pub use sysfs::{SysfsPwmConfig, SysfsPwmDriver};

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use hatkit_core::device::{share, Interface, Shared};
use hatkit_core::error::{HatError, HatResult};

/// Pin pairs wired to the PWM peripheral
pub const PWM_PIN_PAIRS: [(u8, u8); 4] = [(12, 13), (18, 19), (40, 41), (52, 53)];

/// Index into [`PWM_PIN_PAIRS`] of the pair containing `pin`
pub fn pair_of(pin: u8) -> Option<usize> {
    PWM_PIN_PAIRS
        .iter()
        .position(|&(a, b)| a == pin || b == pin)
}

/// PWM channel a pin is routed to (even pin -> 0, odd pin -> 1)
pub fn channel_of(pin: u8) -> u8 {
    pin % 2
}

/// Hardware PWM capability
pub trait HardwarePwm: Interface {
    fn pin(&self) -> u8;

    fn set_frequency(&mut self, hz: f64) -> HatResult<()>;

    fn frequency(&self) -> f64;

    /// Duty cycle in `[0, 1]`
    fn set_duty(&mut self, duty: f64) -> HatResult<()>;

    fn duty(&self) -> f64;

    fn enable(&mut self, enable: bool) -> HatResult<()>;

    fn is_enabled(&self) -> bool;
}

pub type SharedPwm = Shared<dyn HardwarePwm>;

/// Box and share a concrete PWM backend
pub fn shared_pwm<P: HardwarePwm + 'static>(pwm: P) -> SharedPwm {
    let boxed: Box<dyn HardwarePwm> = Box::new(pwm);
    share(boxed)
}

pub(crate) fn check_duty(duty: f64) -> HatResult<()> {
    if (0.0..=1.0).contains(&duty) {
        Ok(())
    } else {
        Err(HatError::invalid_input(format!("duty {} not in [0, 1]", duty)))
    }
}

pub(crate) fn check_frequency(hz: f64) -> HatResult<()> {
    if hz > 0.0 && hz.is_finite() {
        Ok(())
    } else {
        Err(HatError::invalid_input(format!("frequency {} Hz must be positive", hz)))
    }
}

// ============================================================================
// Pin pair lock
// ============================================================================

#[derive(Debug, Default)]
struct PairState {
    pair: Option<usize>,
    held: Vec<u8>,
}

/// Tracks which PWM pin pair is active
#[derive(Debug, Default)]
pub struct PinPairLock {
    state: Mutex<PairState>,
}

static GLOBAL_PAIR_LOCK: OnceLock<Arc<PinPairLock>> = OnceLock::new();

impl PinPairLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The lock every backend uses unless given another
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_PAIR_LOCK.get_or_init(PinPairLock::new))
    }

    /// Claim `pin`, selecting its pair if none is active yet
    pub fn acquire(self: &Arc<Self>, pin: u8) -> HatResult<PwmPinGuard> {
        let pair = pair_of(pin).ok_or_else(|| {
            HatError::invalid_pwm_pin(pin, "not one of 12, 13, 18, 19, 40, 41, 52, 53")
        })?;

        let mut state = self.state.lock();
        match state.pair {
            Some(active) if active != pair => {
                let (a, b) = PWM_PIN_PAIRS[active];
                return Err(HatError::invalid_pwm_pin(
                    pin,
                    format!("pair ({}, {}) is already in use", a, b),
                ));
            }
            _ => {}
        }
        if state.held.contains(&pin) {
            return Err(HatError::invalid_pwm_pin(pin, "already open"));
        }

        state.pair = Some(pair);
        state.held.push(pin);
        Ok(PwmPinGuard {
            lock: Arc::clone(self),
            pin,
        })
    }

    pub fn active_pair(&self) -> Option<(u8, u8)> {
        self.state.lock().pair.map(|p| PWM_PIN_PAIRS[p])
    }

    fn release(&self, pin: u8) {
        let mut state = self.state.lock();
        state.held.retain(|&p| p != pin);
        if state.held.is_empty() {
            state.pair = None;
        }
    }
}

/// Claim on one PWM pin; dropping it releases the pin
#[derive(Debug)]
pub struct PwmPinGuard {
    lock: Arc<PinPairLock>,
    pin: u8,
}

impl PwmPinGuard {
    pub fn pin(&self) -> u8 {
        self.pin
    }
}

impl Drop for PwmPinGuard {
    fn drop(&mut self) {
        self.lock.release(self.pin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_pin_rejected() {
        let lock = PinPairLock::new();
        for pin in [0u8, 7, 14, 17, 20, 42, 54] {
            let err = lock.acquire(pin).unwrap_err();
            assert!(matches!(err, HatError::InvalidPwmPin { .. }));
        }
    }

    #[test]
    fn test_second_pair_rejected_until_released() {
        let lock = PinPairLock::new();
        let a = lock.acquire(18).unwrap();
        let b = lock.acquire(19).unwrap();
        assert_eq!(lock.active_pair(), Some((18, 19)));

        let err = lock.acquire(12).unwrap_err();
        assert!(matches!(err, HatError::InvalidPwmPin { pin: 12, .. }));

        drop(a);
        assert!(lock.acquire(13).is_err());
        drop(b);
        assert_eq!(lock.active_pair(), None);
        assert!(lock.acquire(13).is_ok());
    }

    #[test]
    fn test_same_pin_twice_rejected() {
        let lock = PinPairLock::new();
        let _guard = lock.acquire(40).unwrap();
        assert!(lock.acquire(40).is_err());
        assert!(lock.acquire(41).is_ok());
    }

    #[test]
    fn test_channel_mapping() {
        assert_eq!(channel_of(12), 0);
        assert_eq!(channel_of(13), 1);
        assert_eq!(channel_of(18), 0);
        assert_eq!(channel_of(53), 1);
        assert_eq!(pair_of(41), Some(2));
        assert_eq!(pair_of(5), None);
    }
}
