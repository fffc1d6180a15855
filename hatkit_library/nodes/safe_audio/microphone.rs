//! Capture through a supervised worker

use std::time::Duration;

use hatkit_core::buffer::ObservationBuffer;
use hatkit_core::device::Device;
use hatkit_core::driver::DriverStatus;
use hatkit_core::error::{HatError, HatResult};

use super::protocol::{Reply, Request, Role};
use super::transport::WorkerTransport;
use super::{SafeAudioConfig, SafeState, WorkerHost};
use crate::messages::audio::AudioSource;

/// Recorded clips kept by default
const CLIP_CAPACITY: usize = 8;

/// Microphone whose engine lives in a restartable worker
///
/// Every finished recording is also kept in a small observation buffer.
pub struct SafeMicrophone {
    host: WorkerHost,
    clips: ObservationBuffer<AudioSource>,
}

impl SafeMicrophone {
    pub fn new(config: SafeAudioConfig) -> Self {
        Self {
            host: WorkerHost::new(Role::Capture, config),
            clips: ObservationBuffer::new(CLIP_CAPACITY),
        }
    }

    pub fn with_transport(config: SafeAudioConfig, transport: Box<dyn WorkerTransport>) -> Self {
        Self {
            host: WorkerHost::with_transport(Role::Capture, config, transport),
            clips: ObservationBuffer::new(CLIP_CAPACITY),
        }
    }

    fn keep(&self, reply: Reply) -> HatResult<AudioSource> {
        match reply {
            Reply::Ok {
                payload: Some(clip),
                ..
            } => {
                self.clips.append(clip.clone());
                Ok(clip)
            }
            other => Err(HatError::driver(format!(
                "{}: recording #{} returned no audio",
                self.host.name(),
                other.id()
            ))),
        }
    }

    /// Record for `duration`, blocking until the clip is complete
    pub fn record(&mut self, duration: Duration) -> HatResult<AudioSource> {
        let reply = self.host.run(|id| Request::Record { id, duration }, duration)?;
        self.keep(reply)
    }

    /// Start recording and return once the worker has accepted it
    pub fn async_record(&mut self, duration: Duration) -> HatResult<()> {
        self.host
            .run_async(|id| Request::AsyncRecord { id, duration })
            .map(|_| ())
    }

    /// Wait for an asynchronous recording; `None` while it is still running.
    /// A cancelled recording yields the audio captured before the cancel.
    pub fn wait(&mut self, timeout: Duration) -> HatResult<Option<AudioSource>> {
        match self.host.wait(timeout)? {
            Some(reply) => self.keep(reply).map(Some),
            None => Ok(None),
        }
    }

    pub fn is_recording(&mut self) -> bool {
        self.host.is_busy()
    }

    pub fn pause(&mut self, enable: bool) -> HatResult<()> {
        self.host.pause(enable)
    }

    pub fn cancel(&mut self) -> HatResult<()> {
        self.host.cancel()
    }

    /// Most recent finished recording
    pub fn latest(&self) -> Option<AudioSource> {
        self.clips.latest()
    }

    pub fn clips(&self) -> &ObservationBuffer<AudioSource> {
        &self.clips
    }

    pub fn state(&self) -> SafeState {
        self.host.state()
    }
}

impl Device for SafeMicrophone {
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

    fn microphone() -> SafeMicrophone {
        let mut config = SafeAudioConfig::simulation();
        config.interface.framerate = Some(8000);
        config.interface.channels = Some(1);
        config.interface.name = Some("mic".to_string());
        SafeMicrophone::new(config)
    }

    #[test]
    fn test_record_returns_requested_length() {
        let mut mic = microphone();
        mic.start().unwrap();
        let clip = mic.record(Duration::from_millis(200)).unwrap();
        assert_eq!(clip.frame_count(), 1600);
        assert_eq!(clip.sample_rate, 8000);
        assert_eq!(mic.latest(), Some(clip));
        assert_eq!(mic.name(), "mic");
        mic.stop().unwrap();
    }

    #[test]
    fn test_cancelled_async_record_keeps_partial_clip() {
        let mut mic = microphone();
        mic.start().unwrap();
        mic.async_record(Duration::from_secs(5)).unwrap();
        assert!(mic.is_recording());
        assert_eq!(mic.wait(Duration::from_millis(100)).unwrap(), None);

        mic.cancel().unwrap();
        assert!(!mic.is_recording());
        let partial = mic.wait(Duration::ZERO).unwrap().unwrap();
        assert!(partial.frame_count() > 0);
        assert!(partial.duration() < Duration::from_secs(1));
        assert_eq!(mic.clips().len(), 1);
        mic.stop().unwrap();
    }
}
