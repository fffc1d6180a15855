//! Camera capture engines
//!
//! A [`CaptureEngine`] produces frames; it writes each frame's bytes into a
//! [`FrameSink`] and flushes once the frame is complete. The sink stamps the
//! frame at flush time, so timestamps mark when the bytes left the capture
//! library rather than when a caller asked for them.
//!
//! # Available Engines
//!
//! - `SimulationCameraEngine` - Always available, synthetic frames paced by a clock
//! - `V4l2CameraEngine` - Video4Linux2 mmap streaming (requires `v4l2-backend` feature)

mod simulation;

#[cfg(feature = "v4l2-backend")]
mod v4l2;

pub use simulation::SimulationCameraEngine;

#[cfg(feature = "v4l2-backend")]
pub use v4l2::V4l2CameraEngine;

use hatkit_core::buffer::ObservationBuffer;
use hatkit_core::device::{share, Interface, Shared};
use hatkit_core::driver::InterfaceConfig;
use hatkit_core::error::{HatError, HatResult};

use crate::messages::sensor::stamp_now;
use crate::messages::vision::{ImageFormat, ImageFrame};

/// Capture settings shared by every engine
#[derive(Debug, Clone, PartialEq)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub format: ImageFormat,
    /// Frames returned by one batch read
    pub batch: u32,
    /// Device node for kernel backends
    pub device_path: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            framerate: 30,
            format: ImageFormat::Rgb,
            batch: 1,
            device_path: "/dev/video0".to_string(),
        }
    }
}

impl CameraConfig {
    /// Read the camera fields of an interface config, defaults elsewhere
    pub fn from_interface(config: &InterfaceConfig) -> HatResult<Self> {
        let defaults = Self::default();
        let format = match config.format.as_deref() {
            Some(name) => ImageFormat::parse(name)?,
            None => defaults.format,
        };
        let camera = Self {
            width: config.width.unwrap_or(defaults.width),
            height: config.height.unwrap_or(defaults.height),
            framerate: config.framerate.unwrap_or(defaults.framerate),
            format,
            batch: config.batch.unwrap_or(defaults.batch),
            device_path: config
                .get_option("device_path")
                .unwrap_or(defaults.device_path),
        };
        camera.validate()?;
        Ok(camera)
    }

    pub fn validate(&self) -> HatResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(HatError::config(format!(
                "resolution {}x{} is empty",
                self.width, self.height
            )));
        }
        if self.framerate == 0 {
            return Err(HatError::config("camera framerate must be positive"));
        }
        if self.batch == 0 {
            return Err(HatError::config("camera batch must be at least 1"));
        }
        Ok(())
    }
}

/// Destination of captured bytes
pub trait FrameSink {
    /// Append bytes to the frame in progress
    fn write(&mut self, chunk: &[u8]);

    /// The frame in progress is complete
    fn flush(&mut self);
}

/// Frame producer
pub trait CaptureEngine: Interface {
    /// Apply resolution, rate and format; called before the first capture
    fn configure(&mut self, config: &CameraConfig) -> HatResult<()>;

    /// Capture exactly one frame into `sink`, blocking until it is available
    fn capture(&mut self, sink: &mut dyn FrameSink) -> HatResult<()>;
}

pub type SharedCaptureEngine = Shared<dyn CaptureEngine>;

/// Box and share a concrete engine
pub fn shared_engine<E: CaptureEngine + 'static>(engine: E) -> SharedCaptureEngine {
    let boxed: Box<dyn CaptureEngine> = Box::new(engine);
    share(boxed)
}

/// Sink that stamps frames on flush and appends them to an observation buffer
///
/// Raw frames whose size does not match the configured resolution are
/// dropped with a warning instead of being stored.
pub struct BufferSink {
    target: ObservationBuffer<ImageFrame>,
    width: u32,
    height: u32,
    format: ImageFormat,
    pending: Vec<u8>,
    sequence: u64,
    dropped: u64,
}

impl BufferSink {
    pub fn new(target: ObservationBuffer<ImageFrame>, config: &CameraConfig) -> Self {
        Self {
            target,
            width: config.width,
            height: config.height,
            format: config.format,
            pending: Vec::new(),
            sequence: 0,
            dropped: 0,
        }
    }

    /// Frames stored so far
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Frames rejected as malformed
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl FrameSink for BufferSink {
    fn write(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    fn flush(&mut self) {
        let stamp_nanos = stamp_now();
        let data = std::mem::take(&mut self.pending);
        if let Some(expected) = self.format.frame_size(self.width, self.height) {
            if data.len() != expected {
                self.dropped += 1;
                log::warn!(
                    "camera: dropping frame of {} bytes (expected {})",
                    data.len(),
                    expected
                );
                return;
            }
        }
        if data.is_empty() {
            self.dropped += 1;
            log::warn!("camera: dropping empty frame");
            return;
        }
        let frame = ImageFrame {
            stamp_nanos,
            sequence: self.sequence,
            width: self.width,
            height: self.height,
            format: self.format,
            data,
        };
        self.sequence += 1;
        if self.target.append(frame).is_some() {
            log::trace!("camera: observation buffer full, dropped oldest frame");
        }
    }
}

/// Open a capture engine named by `config.backend`
///
/// Without a backend id the kernel backend is used when compiled in.
pub fn open_engine(config: &InterfaceConfig) -> HatResult<Box<dyn CaptureEngine>> {
    let camera = CameraConfig::from_interface(config)?;
    let engine: Box<dyn CaptureEngine> = match config.backend.as_deref() {
        Some("simulation") | Some("sim") => Box::new(SimulationCameraEngine::new()),
        #[cfg(feature = "v4l2-backend")]
        Some("v4l2") | None => Box::new(V4l2CameraEngine::open(&camera.device_path)?),
        #[cfg(not(feature = "v4l2-backend"))]
        None => {
            return Err(HatError::NotInstalledInterface(
                "camera (build with the v4l2-backend feature)".to_string(),
            ))
        }
        Some(other) => {
            return Err(HatError::UnsupportedInterface(format!(
                "camera backend '{}'",
                other
            )))
        }
    };
    log::info!(
        "camera: opened '{}' backend ({}x{} @ {} fps)",
        engine.backend(),
        camera.width,
        camera.height,
        camera.framerate
    );
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb(width: u32, height: u32) -> CameraConfig {
        CameraConfig {
            width,
            height,
            ..Default::default()
        }
    }

    #[test]
    fn test_sink_stamps_and_sequences() {
        let buffer = ObservationBuffer::new(2);
        let mut sink = BufferSink::new(buffer.clone(), &rgb(2, 1));
        for i in 0..3u8 {
            sink.write(&[i; 3]);
            sink.write(&[i; 3]);
            sink.flush();
        }
        let frames = buffer.snapshot();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].sequence, 1);
        assert_eq!(frames[1].sequence, 2);
        assert!(frames[0].stamp_nanos <= frames[1].stamp_nanos);
        assert_eq!(frames[1].data, vec![2; 6]);
    }

    #[test]
    fn test_sink_drops_short_frames() {
        let buffer = ObservationBuffer::new(4);
        let mut sink = BufferSink::new(buffer.clone(), &rgb(2, 2));
        sink.write(&[0; 5]);
        sink.flush();
        assert_eq!(sink.dropped(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_config_from_interface() {
        let mut iface = InterfaceConfig::simulation();
        iface.width = Some(320);
        iface.height = Some(240);
        iface.format = Some("jpg".to_string());
        iface.batch = Some(5);
        let config = CameraConfig::from_interface(&iface).unwrap();
        assert_eq!(config.format, ImageFormat::Jpeg);
        assert_eq!((config.width, config.height, config.batch), (320, 240, 5));

        iface.framerate = Some(0);
        assert!(CameraConfig::from_interface(&iface).is_err());
    }

    #[test]
    fn test_open_engine_by_name() {
        assert_eq!(
            open_engine(&InterfaceConfig::simulation()).unwrap().backend(),
            "simulation"
        );
        assert!(matches!(
            open_engine(&InterfaceConfig::with_backend("picamera")),
            Err(HatError::UnsupportedInterface(_))
        ));
    }
}
