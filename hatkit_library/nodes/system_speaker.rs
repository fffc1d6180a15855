//! Direct playback on the system sound card
//!
//! Unlike [`SafeSpeaker`](super::safe_audio::SafeSpeaker), the engine runs in
//! the calling thread. Playback can still be paused or cancelled from
//! another thread through [`SystemSpeaker::control`].

use std::path::Path;
use std::process::{Command, Stdio};

use hatkit_core::device::{Device, DeviceBase};
use hatkit_core::driver::{DriverStatus, InterfaceConfig};
use hatkit_core::error::{HatError, HatResult};

use crate::drivers::audio::{self, AudioControl, PcmFormat, PlaybackBackend, StreamOutcome};
use crate::messages::audio::AudioSource;
use crate::messages::sensor::stamp_now;

/// Placeholder in TTS arguments replaced by the text to speak
pub const TEXT_PLACEHOLDER: &str = "{text}";

#[derive(Debug, Clone)]
pub struct SystemSpeakerConfig {
    /// `dev_name`, `channels`, `framerate`, `volume` and the backend id
    pub interface: InterfaceConfig,
    /// Program that writes a WAV file of the spoken text to stdout
    pub tts_command: String,
    /// Arguments; the text replaces `{text}`, or is appended if absent
    pub tts_args: Vec<String>,
}

impl Default for SystemSpeakerConfig {
    fn default() -> Self {
        Self {
            interface: InterfaceConfig::default(),
            tts_command: "espeak".to_string(),
            tts_args: vec!["--stdout".to_string()],
        }
    }
}

/// One finished playback
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackReport {
    pub stamp_nanos: u64,
    pub frames: usize,
    pub cancelled: bool,
}

pub struct SystemSpeaker {
    base: DeviceBase<PlaybackReport>,
    config: SystemSpeakerConfig,
    format: PcmFormat,
    engine: Option<Box<dyn PlaybackBackend>>,
    pending: Option<Box<dyn PlaybackBackend>>,
    control: AudioControl,
    volume: u8,
}

impl SystemSpeaker {
    pub fn new(config: SystemSpeakerConfig) -> Self {
        Self::build(config, None)
    }

    /// Speaker on an engine opened elsewhere
    pub fn with_engine(config: SystemSpeakerConfig, engine: Box<dyn PlaybackBackend>) -> Self {
        Self::build(config, Some(engine))
    }

    fn build(config: SystemSpeakerConfig, pending: Option<Box<dyn PlaybackBackend>>) -> Self {
        let name = config
            .interface
            .name
            .clone()
            .unwrap_or_else(|| "system_speaker".to_string());
        Self {
            base: DeviceBase::with_capacity(&name, 16),
            format: PcmFormat::from_interface(&config.interface),
            volume: config.interface.volume.unwrap_or(100),
            config,
            engine: None,
            pending,
            control: AudioControl::new(),
        }
    }

    /// Handle for pausing or cancelling playback from another thread
    pub fn control(&self) -> AudioControl {
        self.control.clone()
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    /// Mixer volume in percent, `0..=100`
    pub fn set_volume(&mut self, percent: u8) -> HatResult<()> {
        if percent > 100 {
            return Err(HatError::invalid_input(format!(
                "volume {} is outside 0..=100",
                percent
            )));
        }
        if let Some(engine) = self.engine.as_mut() {
            engine.set_volume(percent)?;
        }
        self.volume = percent;
        Ok(())
    }

    /// Play `source` `times` times, blocking until done or cancelled
    pub fn write(&mut self, source: &AudioSource, times: u32) -> HatResult<StreamOutcome> {
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| HatError::driver(format!("{}: not started", self.base.name())))?;
        self.control.reset();
        let outcome = audio::play(engine.as_mut(), source, times, &self.control)?;
        self.base.record(PlaybackReport {
            stamp_nanos: stamp_now(),
            frames: source.frame_count() * times as usize,
            cancelled: outcome == StreamOutcome::Cancelled,
        });
        Ok(outcome)
    }

    pub fn play_file<P: AsRef<Path>>(&mut self, path: P, times: u32) -> HatResult<StreamOutcome> {
        let source = AudioSource::load_wav(path)?;
        self.write(&source, times)
    }

    /// Speak `text` through the TTS program
    pub fn say(&mut self, text: &str) -> HatResult<StreamOutcome> {
        let speech = self.synthesize(text)?;
        self.write(&speech, 1)
    }

    /// Run the TTS program and parse the WAV it prints
    pub fn synthesize(&self, text: &str) -> HatResult<AudioSource> {
        let mut args: Vec<String> = self
            .config
            .tts_args
            .iter()
            .map(|arg| arg.replace(TEXT_PLACEHOLDER, text))
            .collect();
        if !self.config.tts_args.iter().any(|arg| arg.contains(TEXT_PLACEHOLDER)) {
            args.push(text.to_string());
        }
        log::debug!("{}: tts {} {:?}", self.base.name(), self.config.tts_command, args);

        let output = Command::new(&self.config.tts_command)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    HatError::NotInstalledInterface(format!("tts ({})", self.config.tts_command))
                }
                _ => HatError::Io(e),
            })?;
        if !output.status.success() {
            return Err(HatError::backend_init(
                "tts",
                format!(
                    "{} exited with {}: {}",
                    self.config.tts_command,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        AudioSource::from_wav_bytes(&output.stdout)
    }

    /// Save raw PCM in this speaker's format; the frame count in the
    /// header is `data.len() / (channels * sample_width)`
    pub fn save_to_wav<P: AsRef<Path>>(&self, data: &[u8], path: P) -> HatResult<AudioSource> {
        let source = AudioSource::new(
            self.format.channels,
            self.format.sample_rate,
            self.format.sample_width,
            data.to_vec(),
        )?;
        source.save_wav(path)?;
        Ok(source)
    }

    pub fn last_playback(&self) -> Option<PlaybackReport> {
        self.base.buffer().latest()
    }
}

impl Device for SystemSpeaker {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn start(&mut self) -> HatResult<()> {
        if self.engine.is_some() {
            return Ok(());
        }
        let mut engine = match self.pending.take() {
            Some(engine) => engine,
            None => audio::open_playback(&self.config.interface)?,
        };
        if let Err(e) = engine.set_volume(self.volume) {
            log::warn!("{}: volume not applied: {}", self.base.name(), e);
        }
        self.engine = Some(engine);
        self.base.mark_ready();
        Ok(())
    }

    fn stop(&mut self) -> HatResult<()> {
        self.control.cancel();
        if let Some(mut engine) = self.engine.take() {
            if let Err(e) = engine.close() {
                log::warn!("{}: close failed: {}", self.base.name(), e);
            }
        }
        self.base.release();
        Ok(())
    }

    fn status(&self) -> DriverStatus {
        self.base.status()
    }
}

impl Drop for SystemSpeaker {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::audio::SimulationPlayback;
    use hatkit_core::clock::VirtualClock;
    use std::sync::Arc;
    use std::time::Duration;

    fn speaker() -> (SystemSpeaker, crate::drivers::audio::SimulationAudioHandle) {
        let engine = SimulationPlayback::with_clock(Arc::new(VirtualClock::new()));
        let handle = engine.handle();
        let mut config = SystemSpeakerConfig::default();
        config.interface.framerate = Some(16000);
        config.interface.volume = Some(40);
        let mut speaker = SystemSpeaker::with_engine(config, Box::new(engine));
        speaker.start().unwrap();
        (speaker, handle)
    }

    #[test]
    fn test_volume() {
        let (mut speaker, handle) = speaker();
        assert_eq!(handle.volume(), 40);
        speaker.set_volume(75).unwrap();
        assert_eq!(handle.volume(), 75);
        assert!(speaker.set_volume(101).is_err());
        assert_eq!(speaker.volume(), 75);
    }

    #[test]
    fn test_write_reports_frames() {
        let (mut speaker, handle) = speaker();
        let clip = AudioSource::silence(1, 16000, 2, Duration::from_millis(100)).unwrap();
        assert_eq!(speaker.write(&clip, 3).unwrap(), StreamOutcome::Completed);
        assert_eq!(handle.frames(), 4800);
        assert_eq!(speaker.last_playback().unwrap().frames, 4800);
        speaker.stop().unwrap();
        assert!(!handle.is_open());
        assert!(speaker.write(&clip, 1).is_err());
    }

    #[test]
    fn test_save_to_wav_counts_payload_frames() {
        let (speaker, _) = speaker();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.wav");
        // 1000 mono 16-bit frames, well past one 256-frame period
        let saved = speaker.save_to_wav(&vec![0u8; 2000], &path).unwrap();
        assert_eq!(saved.frame_count(), 1000);
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.duration(), 1000);
    }

    #[test]
    fn test_say_plays_tts_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speech.wav");
        AudioSource::silence(1, 16000, 2, Duration::from_millis(50))
            .unwrap()
            .save_wav(&path)
            .unwrap();

        let (mut speaker, handle) = speaker();
        speaker.config.tts_command = "sh".to_string();
        speaker.config.tts_args = vec![
            "-c".to_string(),
            "cat \"$1\"".to_string(),
            "sh".to_string(),
            path.display().to_string(),
        ];
        speaker.say("hello").unwrap();
        assert_eq!(handle.frames(), 800);
    }

    #[test]
    fn test_missing_tts_program() {
        let (mut speaker, _) = speaker();
        speaker.config.tts_command = "/nonexistent/espeak".to_string();
        assert!(matches!(
            speaker.synthesize("hi"),
            Err(HatError::NotInstalledInterface(_))
        ));
    }
}
