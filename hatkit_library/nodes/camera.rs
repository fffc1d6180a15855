//! Camera controller: batch and continuous capture
//!
//! Continuous capture runs on one thread gated by an [`Event`]. Setting
//! the event lets the loop run; clearing it asks the loop to stop, and
//! the loop sets it again on its way out so `stop_continuous` can wait
//! for the exit. Frames land in the device's observation buffer, which
//! drops the oldest frame when full.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use hatkit_core::buffer::ObservationBuffer;
use hatkit_core::device::{share, Device, DeviceBase};
use hatkit_core::driver::{DriverStatus, InterfaceConfig};
use hatkit_core::error::{HatError, HatResult};
use hatkit_core::event::Event;

use crate::drivers::camera::{open_engine, BufferSink, CameraConfig, SharedCaptureEngine};
use crate::messages::vision::ImageFrame;

/// Consecutive capture failures that end continuous capture
const MAX_CAPTURE_ERRORS: u32 = 5;

enum EngineSource {
    Open(InterfaceConfig),
    Given(SharedCaptureEngine),
}

pub struct Camera {
    base: DeviceBase<ImageFrame>,
    config: CameraConfig,
    source: EngineSource,
    engine: Option<SharedCaptureEngine>,
    running: Event,
    worker: Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
}

impl Camera {
    /// Camera opened from an interface config on `start`
    pub fn new(interface: InterfaceConfig) -> HatResult<Self> {
        let config = CameraConfig::from_interface(&interface)?;
        let name = interface.name.clone().unwrap_or_else(|| "camera".to_string());
        Ok(Self::build(&name, config, EngineSource::Open(interface)))
    }

    /// Camera driving an engine created elsewhere; `stop` leaves it open
    pub fn with_engine(name: &str, config: CameraConfig, engine: SharedCaptureEngine) -> HatResult<Self> {
        config.validate()?;
        Ok(Self::build(name, config, EngineSource::Given(engine)))
    }

    fn build(name: &str, config: CameraConfig, source: EngineSource) -> Self {
        Self {
            base: DeviceBase::new(name),
            config,
            source,
            engine: None,
            running: Event::new(),
            worker: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    fn engine(&self) -> HatResult<SharedCaptureEngine> {
        self.engine
            .clone()
            .ok_or_else(|| HatError::driver(format!("{}: not started", self.base.name())))
    }

    pub fn is_continuous(&self) -> bool {
        self.worker.as_ref().map_or(false, |w| !w.is_finished())
    }

    /// Capture `config.batch` frames, blocking until all have arrived
    pub fn read(&mut self) -> HatResult<Vec<ImageFrame>> {
        self.read_batch(self.config.batch as usize)
    }

    /// Capture `count` frames, blocking until all have arrived
    pub fn read_batch(&mut self, count: usize) -> HatResult<Vec<ImageFrame>> {
        if self.is_continuous() {
            return Err(HatError::invalid_input(format!(
                "{}: batch read during continuous capture",
                self.base.name()
            )));
        }
        let engine = self.engine()?;
        let batch = ObservationBuffer::new(count.max(1));
        let mut sink = BufferSink::new(batch.clone(), &self.config);
        {
            let mut engine = engine.lock();
            while batch.len() < count {
                engine.capture(&mut sink)?;
            }
        }
        let frames = batch.snapshot();
        for frame in &frames {
            self.base.record(frame.clone());
        }
        Ok(frames)
    }

    /// Start filling the observation buffer on a capture thread
    pub fn start_continuous(&mut self) -> HatResult<()> {
        if self.is_continuous() {
            return Ok(());
        }
        if let Some(old) = self.worker.take() {
            let _ = old.join();
        }
        let engine = self.engine()?;
        let mut sink = BufferSink::new(self.base.buffer().clone(), &self.config);
        let running = self.running.clone();
        let dropped = Arc::clone(&self.dropped);
        let name = self.base.name().to_string();

        running.set();
        let worker = std::thread::Builder::new()
            .name(format!("{}-capture", name))
            .spawn(move || {
                let mut errors = 0;
                while running.is_set() {
                    match engine.lock().capture(&mut sink) {
                        Ok(()) => errors = 0,
                        Err(e) => {
                            errors += 1;
                            log::warn!(
                                "{}: capture failed ({}/{}): {}",
                                name,
                                errors,
                                MAX_CAPTURE_ERRORS,
                                e
                            );
                            if errors >= MAX_CAPTURE_ERRORS {
                                log::error!("{}: continuous capture aborted", name);
                                break;
                            }
                        }
                    }
                }
                dropped.fetch_add(sink.dropped(), Ordering::Relaxed);
                log::debug!("{}: capture loop exiting after {} frames", name, sink.sequence());
                running.set();
            })?;
        self.worker = Some(worker);
        self.base.set_status(DriverStatus::Running);
        log::info!("{}: continuous capture started", self.base.name());
        Ok(())
    }

    /// Stop the capture thread and wait for it to confirm
    pub fn stop_continuous(&mut self) -> HatResult<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        self.running.clear();
        let grace = Duration::from_secs_f64(2.0 / f64::from(self.config.framerate))
            + Duration::from_secs(1);
        if !worker.is_finished() && !self.running.wait_timeout(grace) {
            log::warn!("{}: capture thread did not confirm exit", self.base.name());
        }
        if worker.join().is_err() {
            log::error!("{}: capture thread panicked", self.base.name());
        }
        self.running.clear();
        if self.base.is_active() {
            self.base.mark_ready();
        }
        log::info!("{}: continuous capture stopped", self.base.name());
        Ok(())
    }

    pub fn latest(&self) -> Option<ImageFrame> {
        self.base.buffer().latest()
    }

    /// Buffered frames, oldest first
    pub fn frames(&self) -> Vec<ImageFrame> {
        self.base.buffer().snapshot()
    }

    /// Malformed frames discarded by finished capture loops
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Device for Camera {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn start(&mut self) -> HatResult<()> {
        if self.base.is_active() {
            return Ok(());
        }
        let engine = match &self.source {
            EngineSource::Open(interface) => {
                let engine = share(open_engine(interface)?);
                self.base.interfaces_mut().register("camera", engine.clone());
                engine
            }
            EngineSource::Given(engine) => engine.clone(),
        };
        let configured = engine.lock().configure(&self.config);
        if let Err(e) = configured {
            self.base.fail(&e);
            return Err(e);
        }
        self.engine = Some(engine);
        self.base.mark_ready();
        Ok(())
    }

    fn stop(&mut self) -> HatResult<()> {
        self.stop_continuous()?;
        self.engine = None;
        self.base.release();
        Ok(())
    }

    fn status(&self) -> DriverStatus {
        self.base.status()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        let _ = self.stop_continuous();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::camera::{shared_engine, SimulationCameraEngine};
    use crate::messages::vision::ImageFormat;

    fn small() -> CameraConfig {
        CameraConfig {
            width: 8,
            height: 4,
            framerate: 200,
            batch: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_batch_read() {
        let engine = SimulationCameraEngine::new();
        let counter = engine.counter();
        let mut camera = Camera::with_engine("cam", small(), shared_engine(engine)).unwrap();
        assert!(camera.read().is_err());
        camera.start().unwrap();

        let frames = camera.read().unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].data.len(), 8 * 4 * 3);
        assert!(frames.windows(2).all(|w| w[0].stamp_nanos <= w[1].stamp_nanos));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(camera.latest(), frames.last().cloned());
        camera.stop().unwrap();
    }

    #[test]
    fn test_continuous_capture_orders_frames() {
        let mut interface = InterfaceConfig::simulation();
        interface.width = Some(4);
        interface.height = Some(4);
        interface.framerate = Some(200);
        interface.format = Some("gray".to_string());
        let mut camera = Camera::new(interface).unwrap();
        camera.start().unwrap();

        camera.start_continuous().unwrap();
        assert!(camera.is_continuous());
        assert!(camera.read_batch(1).is_err());
        std::thread::sleep(Duration::from_millis(100));
        camera.stop_continuous().unwrap();
        assert!(!camera.is_continuous());

        let frames = camera.frames();
        assert!(frames.len() >= 2);
        assert!(frames.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert!(frames.iter().all(|f| f.format == ImageFormat::Gray));
        let captured = frames.len();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(camera.frames().len(), captured);

        camera.stop().unwrap();
        camera.stop().unwrap();
        assert_eq!(camera.status(), DriverStatus::Shutdown);
    }
}
