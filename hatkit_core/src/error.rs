//! Unified error handling for hatkit
//!
//! This module provides a single error type shared by every bus backend,
//! driver and controller, so that callers can classify failures without
//! knowing which backend produced them.

use thiserror::Error;

/// Main error type for hatkit operations
#[derive(Debug, Error)]
pub enum HatError {
    /// I/O related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (impossible pin pair, unsupported sample width, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The requested capability is not known to the interface registry
    #[error("Unsupported interface: {0}")]
    UnsupportedInterface(String),

    /// No backend for the capability could load its native prerequisite
    #[error("No usable backend installed for interface '{0}'")]
    NotInstalledInterface(String),

    /// A backend failed while opening its resource
    #[error("Backend '{backend}' failed to initialize: {message}")]
    BackendInit { backend: String, message: String },

    /// Hardware PWM pin outside the supported pairs, or from a second pair
    #[error("Invalid hardware PWM pin {pin}: {reason}")]
    InvalidPwmPin { pin: u8, reason: String },

    /// Transient bus failure (NACK, short read); recoverable at the caller
    #[error("Bus I/O error: {0}")]
    BusIo(String),

    /// The device produced a reading outside its measurable range
    #[error("Device out of range: {0}")]
    DeviceOutOfRange(String),

    /// A worker did not reply within its deadline
    #[error("Protocol timeout: {0}")]
    ProtocolTimeout(String),

    /// Unrecoverable failure after retries were exhausted
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Driver-related errors
    #[error("Driver error: {0}")]
    Driver(String),

    /// Invalid input/argument errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization/Deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Timeout errors outside the worker protocol
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Generic internal errors (use sparingly)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using HatError
pub type HatResult<T> = Result<T, HatError>;

impl From<serde_json::Error> for HatError {
    fn from(err: serde_json::Error) -> Self {
        HatError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for HatError {
    fn from(err: serde_yaml::Error) -> Self {
        HatError::Serialization(format!("YAML error: {}", err))
    }
}

impl From<toml::de::Error> for HatError {
    fn from(err: toml::de::Error) -> Self {
        HatError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for HatError {
    fn from(err: toml::ser::Error) -> Self {
        HatError::Serialization(format!("TOML serialization error: {}", err))
    }
}

impl<T> From<std::sync::PoisonError<T>> for HatError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        HatError::Internal("Lock poisoned".to_string())
    }
}

impl From<&str> for HatError {
    fn from(msg: &str) -> Self {
        HatError::Driver(msg.to_string())
    }
}

impl From<String> for HatError {
    fn from(msg: String) -> Self {
        HatError::Driver(msg)
    }
}

// Helper methods
impl HatError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(msg: S) -> Self {
        HatError::Config(msg.into())
    }

    /// Create a driver error
    pub fn driver<S: Into<String>>(msg: S) -> Self {
        HatError::Driver(msg.into())
    }

    /// Create a transient bus error
    pub fn bus<S: Into<String>>(msg: S) -> Self {
        HatError::BusIo(msg.into())
    }

    /// Create a backend initialization error
    pub fn backend_init<S: Into<String>, T: Into<String>>(backend: S, message: T) -> Self {
        HatError::BackendInit {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create an invalid PWM pin error
    pub fn invalid_pwm_pin<S: Into<String>>(pin: u8, reason: S) -> Self {
        HatError::InvalidPwmPin {
            pin,
            reason: reason.into(),
        }
    }

    /// Create an out-of-range error
    pub fn out_of_range<S: Into<String>>(msg: S) -> Self {
        HatError::DeviceOutOfRange(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        HatError::InvalidInput(msg.into())
    }

    /// Check if this is a transient bus error worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, HatError::BusIo(_))
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, HatError::Timeout(_) | HatError::ProtocolTimeout(_))
    }

    /// Check if a backend was simply not installed (used by the selector
    /// to move on to the next candidate)
    pub fn is_not_installed(&self) -> bool {
        matches!(self, HatError::NotInstalledInterface(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HatError::invalid_pwm_pin(7, "not a hardware PWM pin");
        assert_eq!(
            err.to_string(),
            "Invalid hardware PWM pin 7: not a hardware PWM pin"
        );

        let err = HatError::backend_init("rppal", "no /dev/gpiomem");
        assert_eq!(
            err.to_string(),
            "Backend 'rppal' failed to initialize: no /dev/gpiomem"
        );
    }

    #[test]
    fn test_classification() {
        assert!(HatError::bus("nack").is_transient());
        assert!(!HatError::driver("x").is_transient());
        assert!(HatError::ProtocolTimeout("write".into()).is_timeout());
        assert!(HatError::NotInstalledInterface("gpio".into()).is_not_installed());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: HatError = io.into();
        assert!(matches!(err, HatError::Io(_)));
    }
}
