//! Simulation sound card
//!
//! Playback consumes periods at the real (or virtual) sample rate and
//! counts them; capture synthesizes a 440 Hz tone. Both pace themselves
//! with a [`Clock`], so blocking behaviour matches a real device.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use hatkit_core::clock::{Clock, SystemClock};
use hatkit_core::error::{HatError, HatResult};

use super::{CaptureBackend, PcmFormat, PlaybackBackend};

const TONE_HZ: f64 = 440.0;
const TONE_AMPLITUDE: f64 = 0.25;

#[derive(Debug, Default)]
struct AudioState {
    frames: AtomicU64,
    volume: AtomicU8,
    failures: AtomicUsize,
    open: AtomicBool,
}

/// Test-side view of a simulation engine, valid after the engine is boxed
#[derive(Debug, Clone)]
pub struct SimulationAudioHandle {
    state: Arc<AudioState>,
}

impl SimulationAudioHandle {
    /// Frames played or captured so far
    pub fn frames(&self) -> u64 {
        self.state.frames.load(Ordering::SeqCst)
    }

    pub fn volume(&self) -> u8 {
        self.state.volume.load(Ordering::SeqCst)
    }

    /// Make the next `count` period transfers fail
    pub fn inject_failures(&self, count: usize) {
        self.state.failures.store(count, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.state
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn new_state() -> Arc<AudioState> {
    let state = AudioState {
        volume: AtomicU8::new(100),
        open: AtomicBool::new(true),
        ..Default::default()
    };
    Arc::new(state)
}

pub struct SimulationPlayback {
    format: Option<PcmFormat>,
    clock: Arc<dyn Clock>,
    handle: SimulationAudioHandle,
}

impl SimulationPlayback {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            format: None,
            clock,
            handle: SimulationAudioHandle { state: new_state() },
        }
    }

    pub fn handle(&self) -> SimulationAudioHandle {
        self.handle.clone()
    }
}

impl Default for SimulationPlayback {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackBackend for SimulationPlayback {
    fn backend(&self) -> &str {
        "simulation"
    }

    fn prepare(&mut self, format: &PcmFormat) -> HatResult<()> {
        if !self.handle.is_open() {
            return Err(HatError::driver("simulation playback is closed"));
        }
        self.format = Some(*format);
        Ok(())
    }

    fn write_period(&mut self, data: &[u8]) -> HatResult<()> {
        let format = self
            .format
            .ok_or_else(|| HatError::driver("playback written before prepare"))?;
        if self.handle.take_failure() {
            return Err(HatError::driver("simulated playback underrun"));
        }
        let frames = data.len() / format.frame_size().max(1);
        self.clock.sleep(format.duration_of(frames));
        self.handle.state.frames.fetch_add(frames as u64, Ordering::SeqCst);
        Ok(())
    }

    fn drain(&mut self) -> HatResult<()> {
        Ok(())
    }

    fn discard(&mut self) -> HatResult<()> {
        Ok(())
    }

    fn set_volume(&mut self, percent: u8) -> HatResult<()> {
        self.handle.state.volume.store(percent.min(100), Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> HatResult<()> {
        self.handle.state.open.store(false, Ordering::SeqCst);
        self.format = None;
        Ok(())
    }
}

pub struct SimulationCapture {
    format: Option<PcmFormat>,
    clock: Arc<dyn Clock>,
    handle: SimulationAudioHandle,
}

impl SimulationCapture {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            format: None,
            clock,
            handle: SimulationAudioHandle { state: new_state() },
        }
    }

    pub fn handle(&self) -> SimulationAudioHandle {
        self.handle.clone()
    }

    /// Little-endian sample of the tone at `frame`
    fn sample(format: &PcmFormat, frame: u64, out: &mut [u8]) {
        let t = frame as f64 / f64::from(format.sample_rate.max(1));
        let value = TONE_AMPLITUDE * (2.0 * std::f64::consts::PI * TONE_HZ * t).sin();
        match format.sample_width {
            1 => out[0] = (128.0 + value * 127.0).round() as u8,
            2 => out.copy_from_slice(&((value * f64::from(i16::MAX)) as i16).to_le_bytes()),
            3 => out.copy_from_slice(&((value * 8_388_607.0) as i32).to_le_bytes()[..3]),
            _ => out.copy_from_slice(&((value * f64::from(i32::MAX)) as i32).to_le_bytes()),
        }
    }
}

impl Default for SimulationCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for SimulationCapture {
    fn backend(&self) -> &str {
        "simulation"
    }

    fn prepare(&mut self, format: &PcmFormat) -> HatResult<()> {
        if !(1..=4).contains(&format.sample_width) {
            return Err(HatError::config(format!(
                "unsupported sample width of {} bytes",
                format.sample_width
            )));
        }
        if !self.handle.is_open() {
            return Err(HatError::driver("simulation capture is closed"));
        }
        self.format = Some(*format);
        Ok(())
    }

    fn read_period(&mut self, buf: &mut [u8]) -> HatResult<usize> {
        let format = self
            .format
            .ok_or_else(|| HatError::driver("capture read before prepare"))?;
        if self.handle.take_failure() {
            return Err(HatError::driver("simulated capture overrun"));
        }
        let width = usize::from(format.sample_width);
        let frame_size = format.frame_size();
        let frames = buf.len() / frame_size;
        let start = self.handle.frames();

        for (i, frame) in buf.chunks_exact_mut(frame_size).enumerate() {
            for sample in frame.chunks_exact_mut(width) {
                Self::sample(&format, start + i as u64, sample);
            }
        }
        self.clock.sleep(format.duration_of(frames));
        self.handle.state.frames.fetch_add(frames as u64, Ordering::SeqCst);
        Ok(frames * frame_size)
    }

    fn close(&mut self) -> HatResult<()> {
        self.handle.state.open.store(false, Ordering::SeqCst);
        self.format = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatkit_core::clock::VirtualClock;
    use std::time::Duration;

    #[test]
    fn test_injected_failure_is_consumed() {
        let clock = Arc::new(VirtualClock::new());
        let mut playback = SimulationPlayback::with_clock(clock.clone());
        let handle = playback.handle();
        playback.prepare(&PcmFormat::default()).unwrap();
        handle.inject_failures(1);
        assert!(playback.write_period(&[0; 512]).is_err());
        playback.write_period(&[0; 512]).unwrap();
        assert_eq!(handle.frames(), 256);
        assert_eq!(clock.now(), Duration::from_millis(16));
        playback.close().unwrap();
        assert!(playback.prepare(&PcmFormat::default()).is_err());
    }

    #[test]
    fn test_capture_tone_is_bounded() {
        let mut capture = SimulationCapture::with_clock(Arc::new(VirtualClock::new()));
        capture.prepare(&PcmFormat::default()).unwrap();
        let mut buf = vec![0u8; 512];
        assert_eq!(capture.read_period(&mut buf).unwrap(), 512);
        let peak = buf
            .chunks_exact(2)
            .map(|s| i16::from_le_bytes([s[0], s[1]]).unsigned_abs())
            .max()
            .unwrap();
        assert!(peak > 7000 && peak <= 8192, "peak {}", peak);
    }
}
