//! Video4Linux2 capture engine
//!
//! Memory-mapped streaming through the `v4l` crate. The stream is created
//! lazily on the first capture after `configure`, and dropped on close.
//! Requires the `v4l2-backend` feature.

use hatkit_core::device::Interface;
use hatkit_core::error::{HatError, HatResult};

use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::FourCC;

use super::{CameraConfig, CaptureEngine, FrameSink};
use crate::messages::vision::ImageFormat;

const STREAM_BUFFERS: u32 = 4;

fn fourcc(format: ImageFormat) -> FourCC {
    match format {
        ImageFormat::Rgb => FourCC::new(b"RGB3"),
        ImageFormat::Gray => FourCC::new(b"GREY"),
        ImageFormat::Yuyv => FourCC::new(b"YUYV"),
        ImageFormat::Jpeg => FourCC::new(b"MJPG"),
    }
}

pub struct V4l2CameraEngine {
    path: String,
    device: Option<v4l::Device>,
    stream: Option<Stream<'static>>,
}

impl V4l2CameraEngine {
    pub fn open(path: &str) -> HatResult<Self> {
        if !std::path::Path::new(path).exists() {
            return Err(HatError::NotInstalledInterface(format!("camera {}", path)));
        }
        let device = v4l::Device::with_path(path)
            .map_err(|e| HatError::backend_init("v4l2", format!("{}: {}", path, e)))?;
        Ok(Self {
            path: path.to_string(),
            device: Some(device),
            stream: None,
        })
    }

    fn device(&self) -> HatResult<&v4l::Device> {
        self.device
            .as_ref()
            .ok_or_else(|| HatError::driver(format!("camera {} is closed", self.path)))
    }
}

impl Interface for V4l2CameraEngine {
    fn backend(&self) -> &str {
        "v4l2"
    }

    fn close(&mut self) -> HatResult<()> {
        self.stream = None;
        self.device = None;
        Ok(())
    }
}

impl CaptureEngine for V4l2CameraEngine {
    fn configure(&mut self, config: &CameraConfig) -> HatResult<()> {
        config.validate()?;
        self.stream = None;
        let device = self.device()?;

        let mut fmt = device
            .format()
            .map_err(|e| HatError::driver(format!("Failed to get format: {}", e)))?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = fourcc(config.format);
        let applied = device
            .set_format(&fmt)
            .map_err(|e| HatError::driver(format!("Failed to set format: {}", e)))?;
        if applied.fourcc != fmt.fourcc
            || applied.width != config.width
            || applied.height != config.height
        {
            return Err(HatError::config(format!(
                "{} cannot capture {}x{} {:?} (driver offered {}x{} {})",
                self.path,
                config.width,
                config.height,
                config.format,
                applied.width,
                applied.height,
                applied.fourcc
            )));
        }

        device
            .set_params(&Parameters::with_fps(config.framerate))
            .map_err(|e| HatError::driver(format!("Failed to set frame rate: {}", e)))?;

        let stream = Stream::with_buffers(device, Type::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| HatError::backend_init("v4l2", format!("mmap stream: {}", e)))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn capture(&mut self, sink: &mut dyn FrameSink) -> HatResult<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| HatError::driver("V4L2 stream not configured"))?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| HatError::driver(format!("V4L2 dequeue failed: {}", e)))?;
        let used = (meta.bytesused as usize).min(buf.len());
        sink.write(&buf[..used]);
        sink.flush();
        Ok(())
    }
}
