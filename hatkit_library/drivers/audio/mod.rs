//! PCM playback and capture engines
//!
//! Engines move audio one period at a time. The helpers [`play`] and
//! [`record`] drive an engine and consult an [`AudioControl`] between
//! periods, so pause and cancel take effect within one period.

pub mod simulation;

#[cfg(feature = "alsa-backend")]
pub mod alsa;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hatkit_core::driver::InterfaceConfig;
use hatkit_core::error::{HatError, HatResult};
use hatkit_core::event::Event;

use crate::messages::audio::AudioSource;

pub use simulation::{SimulationAudioHandle, SimulationCapture, SimulationPlayback};

#[cfg(feature = "alsa-backend")]
pub use self::alsa::{AlsaCapture, AlsaPlayback};

/// Frames moved per engine call unless configured otherwise
pub const DEFAULT_PERIOD_FRAMES: usize = 256;

/// Shape of a PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmFormat {
    pub channels: u16,
    pub sample_rate: u32,
    /// Bytes per sample
    pub sample_width: u16,
    pub period_frames: usize,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            channels: 1,
            sample_rate: 16000,
            sample_width: 2,
            period_frames: DEFAULT_PERIOD_FRAMES,
        }
    }
}

impl PcmFormat {
    pub fn of(source: &AudioSource) -> Self {
        Self {
            channels: source.channels,
            sample_rate: source.sample_rate,
            sample_width: source.sample_width,
            period_frames: DEFAULT_PERIOD_FRAMES,
        }
    }

    pub fn frame_size(&self) -> usize {
        usize::from(self.channels) * usize::from(self.sample_width)
    }

    pub fn period_bytes(&self) -> usize {
        self.period_frames * self.frame_size()
    }

    /// Wall time of `frames` frames
    pub fn duration_of(&self, frames: usize) -> Duration {
        let nanos = frames as u64 * 1_000_000_000 / u64::from(self.sample_rate.max(1));
        Duration::from_nanos(nanos)
    }

    pub fn period_duration(&self) -> Duration {
        self.duration_of(self.period_frames)
    }

    /// Shape taken from audio interface options, with defaults
    pub fn from_interface(config: &InterfaceConfig) -> Self {
        let defaults = Self::default();
        Self {
            channels: config.channels.unwrap_or(defaults.channels),
            sample_rate: config.framerate.unwrap_or(defaults.sample_rate),
            sample_width: config
                .get_option_i64("sample_width")
                .map(|w| w as u16)
                .unwrap_or(defaults.sample_width),
            period_frames: config
                .get_option_i64("period_frames")
                .map(|p| p.max(1) as usize)
                .unwrap_or(defaults.period_frames),
        }
    }
}

/// Output side of a sound card
pub trait PlaybackBackend: Send {
    fn backend(&self) -> &str;

    /// Configure the stream for `format`
    fn prepare(&mut self, format: &PcmFormat) -> HatResult<()>;

    /// Queue one period of interleaved frames, blocking while the device is full
    fn write_period(&mut self, data: &[u8]) -> HatResult<()>;

    /// Wait for queued frames to finish playing
    fn drain(&mut self) -> HatResult<()>;

    /// Discard queued frames
    fn discard(&mut self) -> HatResult<()>;

    /// Mixer volume in percent
    fn set_volume(&mut self, percent: u8) -> HatResult<()>;

    fn close(&mut self) -> HatResult<()>;
}

/// Input side of a sound card
pub trait CaptureBackend: Send {
    fn backend(&self) -> &str;

    fn prepare(&mut self, format: &PcmFormat) -> HatResult<()>;

    /// Fill `buf` with one period, blocking until it is available.
    /// Returns the number of bytes written.
    fn read_period(&mut self, buf: &mut [u8]) -> HatResult<usize>;

    fn close(&mut self) -> HatResult<()>;
}

/// Pause/cancel flags shared between a stream loop and its owner
#[derive(Debug, Clone)]
pub struct AudioControl {
    cancelled: Arc<AtomicBool>,
    running: Event,
}

impl Default for AudioControl {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioControl {
    pub fn new() -> Self {
        let running = Event::new();
        running.set();
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            running,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // a paused loop has to wake up to notice
        self.running.set();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn pause(&self, enable: bool) {
        if enable {
            self.running.clear();
        } else {
            self.running.set();
        }
    }

    pub fn is_paused(&self) -> bool {
        !self.running.is_set()
    }

    /// Clear a previous cancel and pause before a new stream
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
        self.running.set();
    }

    /// Block while paused; returns false once cancelled
    fn proceed(&self) -> bool {
        while !self.running.wait_timeout(Duration::from_millis(50)) {
            if self.is_cancelled() {
                return false;
            }
        }
        !self.is_cancelled()
    }
}

/// How a stream loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
}

/// Play `source` `times` times, checking `control` between periods
pub fn play(
    backend: &mut dyn PlaybackBackend,
    source: &AudioSource,
    times: u32,
    control: &AudioControl,
) -> HatResult<StreamOutcome> {
    let format = PcmFormat::of(source);
    backend.prepare(&format)?;
    for _ in 0..times {
        for period in source.periods(format.period_frames) {
            if !control.proceed() {
                backend.discard()?;
                return Ok(StreamOutcome::Cancelled);
            }
            backend.write_period(period)?;
        }
    }
    backend.drain()?;
    Ok(StreamOutcome::Completed)
}

/// Record `duration` of audio in `format`, checking `control` between
/// periods. A cancelled recording returns what was captured so far.
pub fn record(
    backend: &mut dyn CaptureBackend,
    format: &PcmFormat,
    duration: Duration,
    control: &AudioControl,
) -> HatResult<(AudioSource, StreamOutcome)> {
    backend.prepare(format)?;
    let wanted = (duration.as_secs_f64() * f64::from(format.sample_rate)).round() as usize;
    let mut data = Vec::with_capacity(wanted * format.frame_size());
    let mut period = vec![0u8; format.period_bytes()];
    let mut outcome = StreamOutcome::Completed;

    while data.len() < wanted * format.frame_size() {
        if !control.proceed() {
            outcome = StreamOutcome::Cancelled;
            break;
        }
        let n = backend.read_period(&mut period)?;
        if n == 0 {
            return Err(HatError::bus(format!("{}: capture returned no data", backend.backend())));
        }
        data.extend_from_slice(&period[..n]);
    }
    // whole periods are read; trim to the requested length
    data.truncate(wanted * format.frame_size());
    let source = AudioSource::new(format.channels, format.sample_rate, format.sample_width, data)?;
    Ok((source, outcome))
}

/// Open a playback engine for an audio interface
pub fn open_playback(config: &InterfaceConfig) -> HatResult<Box<dyn PlaybackBackend>> {
    let backend: Box<dyn PlaybackBackend> = match config.backend.as_deref() {
        Some("simulation") | Some("sim") => Box::new(SimulationPlayback::new()),
        #[cfg(feature = "alsa-backend")]
        Some("alsa") | None => Box::new(AlsaPlayback::open(dev_name(config))?),
        #[cfg(not(feature = "alsa-backend"))]
        None => {
            return Err(HatError::NotInstalledInterface(
                "audio playback (build with the alsa-backend feature)".to_string(),
            ))
        }
        Some(other) => {
            return Err(HatError::UnsupportedInterface(format!(
                "audio backend '{}'",
                other
            )))
        }
    };
    log::info!("audio: opened '{}' playback on '{}'", backend.backend(), dev_name(config));
    Ok(backend)
}

/// Open a capture engine for an audio interface
pub fn open_capture(config: &InterfaceConfig) -> HatResult<Box<dyn CaptureBackend>> {
    let backend: Box<dyn CaptureBackend> = match config.backend.as_deref() {
        Some("simulation") | Some("sim") => Box::new(SimulationCapture::new()),
        #[cfg(feature = "alsa-backend")]
        Some("alsa") | None => Box::new(AlsaCapture::open(dev_name(config))?),
        #[cfg(not(feature = "alsa-backend"))]
        None => {
            return Err(HatError::NotInstalledInterface(
                "audio capture (build with the alsa-backend feature)".to_string(),
            ))
        }
        Some(other) => {
            return Err(HatError::UnsupportedInterface(format!(
                "audio backend '{}'",
                other
            )))
        }
    };
    log::info!("audio: opened '{}' capture on '{}'", backend.backend(), dev_name(config));
    Ok(backend)
}

/// ALSA device name, `default` when unset
pub fn dev_name(config: &InterfaceConfig) -> &str {
    config.dev_name.as_deref().unwrap_or("default")
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatkit_core::clock::{Clock, VirtualClock};

    fn tone(ms: u64) -> AudioSource {
        AudioSource::silence(1, 8000, 2, Duration::from_millis(ms)).unwrap()
    }

    #[test]
    fn test_play_counts_frames() {
        let clock = Arc::new(VirtualClock::new());
        let mut engine = SimulationPlayback::with_clock(clock.clone());
        let handle = engine.handle();
        let outcome = play(&mut engine, &tone(100), 2, &AudioControl::new()).unwrap();
        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(handle.frames(), 1600);
        assert_eq!(clock.now(), Duration::from_millis(200));
    }

    #[test]
    fn test_cancel_before_play() {
        let mut engine = SimulationPlayback::with_clock(Arc::new(VirtualClock::new()));
        let handle = engine.handle();
        let control = AudioControl::new();
        control.cancel();
        assert_eq!(play(&mut engine, &tone(100), 1, &control).unwrap(), StreamOutcome::Cancelled);
        assert_eq!(handle.frames(), 0);
        control.reset();
        assert!(!control.is_cancelled());
    }

    #[test]
    fn test_record_trims_to_duration() {
        let mut engine = SimulationCapture::with_clock(Arc::new(VirtualClock::new()));
        let format = PcmFormat {
            sample_rate: 8000,
            ..Default::default()
        };
        let (source, outcome) =
            record(&mut engine, &format, Duration::from_millis(250), &AudioControl::new()).unwrap();
        assert_eq!(outcome, StreamOutcome::Completed);
        assert_eq!(source.frame_count(), 2000);
    }

    #[test]
    fn test_format_from_interface() {
        let mut config = InterfaceConfig::with_backend("simulation");
        config.channels = Some(2);
        config.framerate = Some(44100);
        let format = PcmFormat::from_interface(&config);
        assert_eq!(format.channels, 2);
        assert_eq!(format.sample_rate, 44100);
        assert_eq!(format.period_bytes(), 256 * 4);
        assert!(open_capture(&config).is_ok());
        assert!(matches!(
            open_playback(&InterfaceConfig::with_backend("pulse")),
            Err(HatError::UnsupportedInterface(_))
        ));
    }
}
