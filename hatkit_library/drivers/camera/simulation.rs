//! Simulation camera engine
//!
//! Generates a moving gradient at the configured rate. JPEG mode emits a
//! minimal SOI/EOI-framed payload of varying length, enough for code that
//! only stores or forwards compressed frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hatkit_core::clock::{Clock, SystemClock};
use hatkit_core::device::Interface;
use hatkit_core::error::{HatError, HatResult};

use super::{CameraConfig, CaptureEngine, FrameSink};
use crate::messages::vision::ImageFormat;

pub struct SimulationCameraEngine {
    config: Option<CameraConfig>,
    clock: Arc<dyn Clock>,
    captured: Arc<AtomicU64>,
    open: bool,
}

impl SimulationCameraEngine {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// Pace frames against `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            config: None,
            clock,
            captured: Arc::new(AtomicU64::new(0)),
            open: true,
        }
    }

    /// Shared count of frames produced, readable after the engine is boxed
    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.captured)
    }

    fn pixel(format: ImageFormat, x: u32, y: u32, t: u8, out: &mut Vec<u8>) {
        match format {
            ImageFormat::Rgb => {
                out.extend_from_slice(&[(x as u8).wrapping_add(t), (y as u8).wrapping_add(t), t])
            }
            ImageFormat::Gray => out.push(((x + y) as u8).wrapping_add(t)),
            ImageFormat::Yuyv => out.extend_from_slice(&[((x + y) as u8).wrapping_add(t), 128]),
            ImageFormat::Jpeg => {}
        }
    }
}

impl Default for SimulationCameraEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Interface for SimulationCameraEngine {
    fn backend(&self) -> &str {
        "simulation"
    }

    fn close(&mut self) -> HatResult<()> {
        self.open = false;
        Ok(())
    }
}

impl CaptureEngine for SimulationCameraEngine {
    fn configure(&mut self, config: &CameraConfig) -> HatResult<()> {
        config.validate()?;
        self.config = Some(config.clone());
        Ok(())
    }

    fn capture(&mut self, sink: &mut dyn FrameSink) -> HatResult<()> {
        if !self.open {
            return Err(HatError::driver("simulated camera is closed"));
        }
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| HatError::driver("simulated camera not configured"))?;

        self.clock
            .sleep(Duration::from_secs_f64(1.0 / f64::from(config.framerate)));
        let n = self.captured.fetch_add(1, Ordering::AcqRel);
        let t = (n % 256) as u8;

        if config.format == ImageFormat::Jpeg {
            sink.write(&[0xFF, 0xD8]);
            sink.write(&vec![t; 64 + (n % 16) as usize]);
            sink.write(&[0xFF, 0xD9]);
        } else {
            let mut row = Vec::new();
            for y in 0..config.height {
                row.clear();
                for x in 0..config.width {
                    Self::pixel(config.format, x, y, t, &mut row);
                }
                sink.write(&row);
            }
        }
        sink.flush();
        Ok(())
    }
}
