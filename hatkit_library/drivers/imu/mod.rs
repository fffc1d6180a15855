//! IMU drivers
//!
//! # Available Drivers
//!
//! - `Icm20948` - TDK ICM-20948 9-axis IMU over any I2C backend
//! - `Icm20948Model` / `Ak09916Model` - Register-level chip models for the
//!   simulated I2C bus

mod icm20948;
mod simulation;

pub use icm20948::{
    AccelScale, GyroScale, Icm20948, Icm20948Config, ImuField, AK09916_ADDRESS,
    ICM20948_ADDRESS, ICM20948_ADDRESS_ALT, MAG_UT_PER_LSB,
};
pub use simulation::{Ak09916Model, Icm20948Model};
