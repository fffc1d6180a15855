//! Playback through a supervised worker

use std::time::Duration;

use hatkit_core::device::Device;
use hatkit_core::driver::DriverStatus;
use hatkit_core::error::HatResult;

use super::protocol::{PlaybackSource, Request, Role};
use super::transport::WorkerTransport;
use super::{SafeAudioConfig, SafeState, WorkerHost};

/// Speaker whose engine lives in a restartable worker
///
/// # Example
///
/// ```rust,ignore
/// use hatkit_library::nodes::safe_audio::{SafeAudioConfig, SafeSpeaker};
///
/// let mut speaker = SafeSpeaker::new(SafeAudioConfig::simulation());
/// speaker.start()?;
/// speaker.write(std::path::Path::new("chime.wav"), 2)?;
/// speaker.stop()?;
/// ```
pub struct SafeSpeaker {
    host: WorkerHost,
}

impl SafeSpeaker {
    pub fn new(config: SafeAudioConfig) -> Self {
        Self {
            host: WorkerHost::new(Role::Playback, config),
        }
    }

    pub fn with_transport(config: SafeAudioConfig, transport: Box<dyn WorkerTransport>) -> Self {
        Self {
            host: WorkerHost::with_transport(Role::Playback, config, transport),
        }
    }

    /// Play `source` `times` times, blocking until it finishes
    ///
    /// The worker is restarted if it reports an error or does not finish
    /// within the clip length plus the configured margin; the error is
    /// still returned.
    pub fn write<S: Into<PlaybackSource>>(&mut self, source: S, times: u32) -> HatResult<()> {
        let source = source.into();
        let expected = source.duration()? * times;
        self.host
            .run(|id| Request::Write { id, source, times }, expected)
            .map(|_| ())
    }

    /// Start playback and return once the worker has accepted it
    pub fn async_write<S: Into<PlaybackSource>>(&mut self, source: S, times: u32) -> HatResult<()> {
        let source = source.into();
        self.host
            .run_async(|id| Request::AsyncWrite { id, source, times })
            .map(|_| ())
    }

    /// Wait for asynchronous playback; true once it has finished
    pub fn wait(&mut self, timeout: Duration) -> HatResult<bool> {
        self.host.wait(timeout)?;
        Ok(!self.host.is_busy())
    }

    pub fn is_playing(&mut self) -> bool {
        self.host.is_busy()
    }

    pub fn pause(&mut self, enable: bool) -> HatResult<()> {
        self.host.pause(enable)
    }

    /// Stop playback within one audio period
    pub fn cancel(&mut self) -> HatResult<()> {
        self.host.cancel()
    }

    pub fn state(&self) -> SafeState {
        self.host.state()
    }
}

impl Device for SafeSpeaker {
    fn name(&self) -> &str {
        self.host.name()
    }

    fn start(&mut self) -> HatResult<()> {
        self.host.start()
    }

    fn stop(&mut self) -> HatResult<()> {
        self.host.stop();
        Ok(())
    }

    fn status(&self) -> DriverStatus {
        self.host.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::audio::{
        PlaybackBackend, SimulationAudioHandle, SimulationPlayback, DEFAULT_PERIOD_FRAMES,
    };
    use crate::messages::audio::AudioSource;
    use crate::nodes::safe_audio::{EngineFactory, ThreadTransport};
    use hatkit_core::error::HatError;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn config() -> SafeAudioConfig {
        let mut config = SafeAudioConfig::simulation();
        config.interface.framerate = Some(8000);
        config.restart_backoff = Duration::from_millis(10);
        config.reply_margin = Duration::from_millis(300);
        config
    }

    fn clip(ms: u64) -> AudioSource {
        AudioSource::silence(1, 8000, 2, Duration::from_millis(ms)).unwrap()
    }

    /// Transport whose engines report back through shared handles
    fn tracked() -> (Box<dyn WorkerTransport>, Arc<Mutex<Vec<SimulationAudioHandle>>>) {
        let handles = Arc::new(Mutex::new(Vec::new()));
        let sink = handles.clone();
        let engines = EngineFactory::default().with_playback(move |_| {
            let engine = SimulationPlayback::new();
            sink.lock().push(engine.handle());
            Ok(Box::new(engine) as Box<dyn PlaybackBackend>)
        });
        (Box::new(ThreadTransport::new(engines)), handles)
    }

    #[test]
    fn test_write_blocks_until_played() {
        let (transport, handles) = tracked();
        let mut speaker = SafeSpeaker::with_transport(config(), transport);
        speaker.start().unwrap();
        assert_eq!(speaker.state(), SafeState::Idle);

        speaker.write(clip(100), 2).unwrap();
        assert_eq!(handles.lock()[0].frames(), 1600);
        assert_eq!(speaker.state(), SafeState::Idle);

        speaker.stop().unwrap();
        speaker.stop().unwrap();
        assert_eq!(speaker.status(), DriverStatus::Uninitialized);
        assert!(!handles.lock()[0].is_open());
    }

    #[test]
    fn test_pause_holds_playback() {
        let (transport, handles) = tracked();
        let mut speaker = SafeSpeaker::with_transport(config(), transport);
        speaker.start().unwrap();
        speaker.async_write(clip(300), 1).unwrap();
        speaker.pause(true).unwrap();
        assert_eq!(speaker.state(), SafeState::Paused);

        // a period already in flight may still land after the ack
        std::thread::sleep(Duration::from_millis(60));
        let held = handles.lock()[0].frames();
        assert!(held < 2400, "played {} frames while pausing", held);
        assert_eq!(held % DEFAULT_PERIOD_FRAMES as u64, 0);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(handles.lock()[0].frames(), held);

        speaker.pause(false).unwrap();
        assert!(speaker.wait(Duration::from_secs(2)).unwrap());
        assert_eq!(handles.lock()[0].frames(), 2400);
        speaker.stop().unwrap();
    }

    #[test]
    fn test_backend_error_restarts_worker() {
        let (transport, handles) = tracked();
        let mut speaker = SafeSpeaker::with_transport(config(), transport);
        speaker.start().unwrap();
        handles.lock()[0].inject_failures(1);

        assert!(matches!(speaker.write(clip(50), 1), Err(HatError::Driver(_))));
        assert_eq!(handles.lock().len(), 2);
        assert_eq!(speaker.state(), SafeState::Idle);
        speaker.write(clip(50), 1).unwrap();
        speaker.stop().unwrap();
    }

    #[test]
    fn test_second_async_is_rejected() {
        let mut speaker = SafeSpeaker::with_transport(config(), tracked().0);
        speaker.start().unwrap();
        speaker.async_write(clip(500), 1).unwrap();
        assert!(matches!(
            speaker.async_write(clip(500), 1),
            Err(HatError::InvalidInput(_))
        ));
        speaker.cancel().unwrap();
        assert!(!speaker.is_playing());
        speaker.stop().unwrap();
    }

    #[test]
    fn test_unavailable_engine_is_fatal() {
        let engines = EngineFactory::default()
            .with_playback(|_| Err(HatError::backend_init("alsa", "no card")));
        let mut speaker =
            SafeSpeaker::with_transport(config(), Box::new(ThreadTransport::new(engines)));
        assert!(matches!(speaker.start(), Err(HatError::Fatal(_))));
        assert!(matches!(speaker.status(), DriverStatus::Error(_)));
        assert!(matches!(speaker.write(clip(10), 1), Err(HatError::Fatal(_))));
        speaker.stop().unwrap();
    }
}
