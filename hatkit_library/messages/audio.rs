//! PCM audio buffers and WAV files
//!
//! Samples are kept as interleaved little-endian PCM bytes, the layout ALSA
//! reads and writes, with 1 to 4 bytes per sample. 8-bit samples are
//! unsigned as in WAV; wider samples are signed.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hatkit_core::error::{HatError, HatResult};

/// Interleaved PCM audio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSource {
    pub channels: u16,
    pub sample_rate: u32,
    /// Bytes per sample, 1 to 4
    pub sample_width: u16,
    pub data: Vec<u8>,
}

fn check_width(sample_width: u16) -> HatResult<()> {
    if (1..=4).contains(&sample_width) {
        Ok(())
    } else {
        Err(HatError::config(format!(
            "unsupported sample width of {} bytes",
            sample_width
        )))
    }
}

fn wav_error(path: &Path, e: hound::Error) -> HatError {
    match e {
        hound::Error::IoError(io) => HatError::Io(io),
        other => HatError::Serialization(format!("{}: {}", path.display(), other)),
    }
}

impl AudioSource {
    pub fn new(channels: u16, sample_rate: u32, sample_width: u16, data: Vec<u8>) -> HatResult<Self> {
        check_width(sample_width)?;
        if channels == 0 || sample_rate == 0 {
            return Err(HatError::config(format!(
                "invalid audio shape: {} channels at {} Hz",
                channels, sample_rate
            )));
        }
        let mut source = Self {
            channels,
            sample_rate,
            sample_width,
            data,
        };
        let whole = source.frame_count() * source.frame_size();
        if whole != source.data.len() {
            log::warn!(
                "audio: dropping {} trailing bytes of a partial frame",
                source.data.len() - whole
            );
            source.data.truncate(whole);
        }
        Ok(source)
    }

    /// Silence of the given length
    pub fn silence(channels: u16, sample_rate: u32, sample_width: u16, duration: Duration) -> HatResult<Self> {
        let frames = (duration.as_secs_f64() * f64::from(sample_rate)).round() as usize;
        // unsigned 8-bit PCM is centred on 128
        let fill = if sample_width == 1 { 0x80 } else { 0x00 };
        let size = frames * usize::from(channels) * usize::from(sample_width);
        Self::new(channels, sample_rate, sample_width, vec![fill; size])
    }

    /// Bytes per frame (one sample per channel)
    pub fn frame_size(&self) -> usize {
        usize::from(self.channels) * usize::from(self.sample_width)
    }

    pub fn frame_count(&self) -> usize {
        self.data.len() / self.frame_size().max(1)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.frame_count() as u64 * 1_000_000_000 / u64::from(self.sample_rate))
    }

    /// Period-sized byte slices; the last one may be shorter
    pub fn periods(&self, period_frames: usize) -> impl Iterator<Item = &[u8]> {
        self.data.chunks((period_frames.max(1)) * self.frame_size())
    }

    /// Read a PCM WAV file
    pub fn load_wav<P: AsRef<Path>>(path: P) -> HatResult<Self> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path).map_err(|e| wav_error(path, e))?;
        Self::decode(reader, path)
    }

    /// Parse an in-memory WAV file, e.g. the output of a TTS engine
    pub fn from_wav_bytes(bytes: &[u8]) -> HatResult<Self> {
        let origin = Path::new("<memory>");
        let reader =
            hound::WavReader::new(std::io::Cursor::new(bytes)).map_err(|e| wav_error(origin, e))?;
        Self::decode(reader, origin)
    }

    fn decode<R: Read>(mut reader: hound::WavReader<R>, origin: &Path) -> HatResult<Self> {
        let spec = reader.spec();
        if spec.sample_format != hound::SampleFormat::Int {
            return Err(HatError::config(format!(
                "{}: floating-point WAV is not supported",
                origin.display()
            )));
        }
        let width = spec.bits_per_sample.div_ceil(8);
        check_width(width)?;

        let mut data = Vec::with_capacity(reader.len() as usize * usize::from(width));
        if width == 1 {
            for sample in reader.samples::<i8>() {
                let sample = sample.map_err(|e| wav_error(origin, e))?;
                data.push((i16::from(sample) + 128) as u8);
            }
        } else {
            for sample in reader.samples::<i32>() {
                let sample = sample.map_err(|e| wav_error(origin, e))?;
                data.extend_from_slice(&sample.to_le_bytes()[..usize::from(width)]);
            }
        }
        Self::new(spec.channels, spec.sample_rate, width, data)
    }

    /// Length of a WAV file, read from its header only
    pub fn wav_duration<P: AsRef<Path>>(path: P) -> HatResult<Duration> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path).map_err(|e| wav_error(path, e))?;
        let rate = u64::from(reader.spec().sample_rate.max(1));
        Ok(Duration::from_nanos(u64::from(reader.duration()) * 1_000_000_000 / rate))
    }

    /// Write a PCM WAV file; the header frame count follows the payload
    pub fn save_wav<P: AsRef<Path>>(&self, path: P) -> HatResult<()> {
        let path = path.as_ref();
        let spec = hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: self.sample_width * 8,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).map_err(|e| wav_error(path, e))?;
        let width = usize::from(self.sample_width);
        let whole = self.frame_count() * self.frame_size();
        for sample in self.data[..whole].chunks_exact(width) {
            let result = match width {
                1 => writer.write_sample((i16::from(sample[0]) - 128) as i8),
                2 => writer.write_sample(i16::from_le_bytes([sample[0], sample[1]])),
                3 => {
                    // sign-extend 24-bit
                    let value = i32::from_le_bytes([sample[0], sample[1], sample[2], 0]) << 8 >> 8;
                    writer.write_sample(value)
                }
                _ => writer.write_sample(i32::from_le_bytes([
                    sample[0], sample[1], sample[2], sample[3],
                ])),
            };
            result.map_err(|e| wav_error(path, e))?;
        }
        writer.finalize().map_err(|e| wav_error(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape() {
        let src = AudioSource::new(2, 8000, 2, vec![0; 8001]).unwrap();
        assert_eq!(src.data.len(), 8000);
        assert_eq!(src.frame_count(), 2000);
        assert_eq!(src.duration(), Duration::from_millis(250));
        assert_eq!(src.periods(512).count(), 4);
        assert!(AudioSource::new(1, 8000, 5, vec![]).is_err());
        assert!(AudioSource::new(0, 8000, 2, vec![]).is_err());
    }

    #[test]
    fn test_wav_widths() {
        let dir = tempfile::tempdir().unwrap();
        for width in 1..=4u16 {
            let data: Vec<u8> = (0..(width as usize * 2 * 50)).map(|i| (i * 7) as u8).collect();
            let src = AudioSource::new(2, 16000, width, data).unwrap();
            let path = dir.path().join(format!("w{}.wav", width));
            src.save_wav(&path).unwrap();
            let back = AudioSource::load_wav(&path).unwrap();
            assert_eq!(AudioSource::wav_duration(&path).unwrap(), src.duration());
            assert_eq!(back, src, "width {}", width);
        }
    }

    #[test]
    fn test_wav_from_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let src = AudioSource::new(1, 22050, 2, vec![1, 2, 3, 4, 5, 6]).unwrap();
        src.save_wav(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(AudioSource::from_wav_bytes(&bytes).unwrap(), src);
        assert!(AudioSource::from_wav_bytes(b"RIFF").is_err());
    }

    #[test]
    fn test_silence_8bit_is_centred() {
        let src = AudioSource::silence(1, 1000, 1, Duration::from_millis(10)).unwrap();
        assert_eq!(src.data, vec![0x80; 10]);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            AudioSource::load_wav("/nonexistent/clip.wav"),
            Err(HatError::Io(_))
        ));
    }
}
