// Message types produced and consumed by hatkit devices
//
// Messages are organized by domain:
// - Sensor: ranges, IMU samples, environment readings, line samples, encoder ticks
// - Control: motor commands and PID gains
// - Vision: camera frames
// - Audio: PCM buffers and WAV files
//
// All message types are re-exported at the crate root for convenience.

pub mod audio;
pub mod control;
pub mod sensor;
pub mod vision;

pub use audio::AudioSource;
pub use control::{DifferentialDriveCommand, PidConfig};
pub use sensor::{EncoderTicks, Environment, Imu, LineSample, Range};
pub use vision::{ImageFormat, ImageFrame};
