//! Active controllers built on the device drivers
//!
//! Nodes own background work: worker processes, capture threads and
//! control loops. Each one follows the same lifecycle as a driver
//! (`start`, `stop`, idempotent shutdown) through the `Device` trait.

pub mod camera;
pub mod line_follower;
pub mod safe_audio;
pub mod system_speaker;

pub use camera::Camera;
pub use line_follower::{ControlSample, LineController, LineFollower, LineFollowerConfig, Steering};
pub use safe_audio::{SafeAudioConfig, SafeMicrophone, SafeSpeaker, SafeState};
pub use system_speaker::{PlaybackReport, SystemSpeaker, SystemSpeakerConfig};
