//! ALSA playback and capture
//!
//! Interleaved read/write access with period-sized transfers. Underruns and
//! overruns are recovered in place once; a second failure surfaces as a
//! bus error.

use alsa::mixer::{Mixer, SelemId};
use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};

use hatkit_core::error::{HatError, HatResult};

use super::{CaptureBackend, PcmFormat, PlaybackBackend};

/// Mixer controls tried in order when setting the volume
const MIXER_CONTROLS: [&str; 3] = ["Master", "PCM", "Speaker"];

fn alsa_error(what: &str, e: alsa::Error) -> HatError {
    HatError::bus(format!("alsa {}: {}", what, e))
}

fn sample_format(width: u16) -> HatResult<Format> {
    match width {
        1 => Ok(Format::U8),
        2 => Ok(Format::S16LE),
        3 => Ok(Format::S243LE),
        4 => Ok(Format::S32LE),
        w => Err(HatError::config(format!("unsupported sample width of {} bytes", w))),
    }
}

fn open_pcm(dev_name: &str, direction: Direction) -> HatResult<PCM> {
    PCM::new(dev_name, direction, false)
        .map_err(|e| HatError::backend_init("alsa", format!("open '{}': {}", dev_name, e)))
}

fn configure(pcm: &PCM, format: &PcmFormat) -> HatResult<()> {
    let hwp = HwParams::any(pcm).map_err(|e| alsa_error("hw params", e))?;
    hwp.set_channels(u32::from(format.channels))
        .map_err(|e| alsa_error("channels", e))?;
    hwp.set_rate(format.sample_rate, ValueOr::Nearest)
        .map_err(|e| alsa_error("rate", e))?;
    hwp.set_format(sample_format(format.sample_width)?)
        .map_err(|e| alsa_error("format", e))?;
    hwp.set_access(Access::RWInterleaved)
        .map_err(|e| alsa_error("access", e))?;
    hwp.set_period_size_near(format.period_frames as alsa::pcm::Frames, ValueOr::Nearest)
        .map_err(|e| alsa_error("period size", e))?;
    pcm.hw_params(&hwp).map_err(|e| alsa_error("apply hw params", e))?;
    Ok(())
}

pub struct AlsaPlayback {
    dev_name: String,
    pcm: Option<PCM>,
    frame_size: usize,
}

impl AlsaPlayback {
    pub fn open(dev_name: &str) -> HatResult<Self> {
        let pcm = open_pcm(dev_name, Direction::Playback)?;
        Ok(Self {
            dev_name: dev_name.to_string(),
            pcm: Some(pcm),
            frame_size: 0,
        })
    }

    fn pcm(&self) -> HatResult<&PCM> {
        self.pcm
            .as_ref()
            .ok_or_else(|| HatError::driver(format!("alsa playback '{}' is closed", self.dev_name)))
    }
}

impl PlaybackBackend for AlsaPlayback {
    fn backend(&self) -> &str {
        "alsa"
    }

    fn prepare(&mut self, format: &PcmFormat) -> HatResult<()> {
        configure(self.pcm()?, format)?;
        self.frame_size = format.frame_size();
        Ok(())
    }

    fn write_period(&mut self, data: &[u8]) -> HatResult<()> {
        let frame_size = self.frame_size.max(1);
        let pcm = self.pcm()?;
        let io = pcm.io_bytes();
        let mut offset = 0;
        let mut recovered = false;
        while offset < data.len() {
            match io.writei(&data[offset..]) {
                Ok(frames) => offset += frames * frame_size,
                Err(e) if !recovered => {
                    log::warn!("alsa playback '{}': {}, recovering", self.dev_name, e);
                    pcm.try_recover(e, true).map_err(|e| alsa_error("recover", e))?;
                    recovered = true;
                }
                Err(e) => return Err(alsa_error("write", e)),
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> HatResult<()> {
        self.pcm()?.drain().map_err(|e| alsa_error("drain", e))
    }

    fn discard(&mut self) -> HatResult<()> {
        let pcm = self.pcm()?;
        pcm.drop().map_err(|e| alsa_error("drop", e))?;
        pcm.prepare().map_err(|e| alsa_error("prepare", e))
    }

    fn set_volume(&mut self, percent: u8) -> HatResult<()> {
        let mixer = Mixer::new(&self.dev_name, false).map_err(|e| alsa_error("mixer", e))?;
        for control in MIXER_CONTROLS {
            if let Some(selem) = mixer.find_selem(&SelemId::new(control, 0)) {
                let (min, max) = selem.get_playback_volume_range();
                let value = min + (max - min) * i64::from(percent.min(100)) / 100;
                selem
                    .set_playback_volume_all(value)
                    .map_err(|e| alsa_error("volume", e))?;
                log::debug!("alsa: '{}' volume {}%", control, percent);
                return Ok(());
            }
        }
        Err(HatError::driver(format!(
            "alsa: no playback volume control on '{}'",
            self.dev_name
        )))
    }

    fn close(&mut self) -> HatResult<()> {
        if let Some(pcm) = self.pcm.take() {
            let _ = pcm.drop();
        }
        Ok(())
    }
}

pub struct AlsaCapture {
    dev_name: String,
    pcm: Option<PCM>,
    frame_size: usize,
}

impl AlsaCapture {
    pub fn open(dev_name: &str) -> HatResult<Self> {
        let pcm = open_pcm(dev_name, Direction::Capture)?;
        Ok(Self {
            dev_name: dev_name.to_string(),
            pcm: Some(pcm),
            frame_size: 0,
        })
    }
}

impl CaptureBackend for AlsaCapture {
    fn backend(&self) -> &str {
        "alsa"
    }

    fn prepare(&mut self, format: &PcmFormat) -> HatResult<()> {
        let pcm = self
            .pcm
            .as_ref()
            .ok_or_else(|| HatError::driver(format!("alsa capture '{}' is closed", self.dev_name)))?;
        configure(pcm, format)?;
        pcm.start().map_err(|e| alsa_error("start", e))?;
        self.frame_size = format.frame_size();
        Ok(())
    }

    fn read_period(&mut self, buf: &mut [u8]) -> HatResult<usize> {
        let pcm = self
            .pcm
            .as_ref()
            .ok_or_else(|| HatError::driver(format!("alsa capture '{}' is closed", self.dev_name)))?;
        let io = pcm.io_bytes();
        match io.readi(buf) {
            Ok(frames) => Ok(frames * self.frame_size),
            Err(e) => {
                log::warn!("alsa capture '{}': {}, recovering", self.dev_name, e);
                pcm.try_recover(e, true).map_err(|e| alsa_error("recover", e))?;
                io.readi(buf)
                    .map(|frames| frames * self.frame_size)
                    .map_err(|e| alsa_error("read", e))
            }
        }
    }

    fn close(&mut self) -> HatResult<()> {
        if let Some(pcm) = self.pcm.take() {
            let _ = pcm.drop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_formats() {
        assert_eq!(sample_format(2).unwrap(), Format::S16LE);
        assert_eq!(sample_format(3).unwrap(), Format::S243LE);
        assert!(sample_format(5).is_err());
    }
}
