//! Messages exchanged between a safe audio host and its worker
//!
//! Every request carries an id; the worker answers each with exactly one
//! `Ok` or `Error` carrying the same id. Asynchronous requests get two
//! replies with the same id: the acknowledgement, then the completion.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hatkit_core::driver::InterfaceConfig;
use hatkit_core::error::HatResult;

use crate::messages::audio::AudioSource;

/// Which side of the sound card a worker drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Playback,
    Capture,
}

/// Audio to play: inline PCM, or a WAV file the worker loads itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackSource {
    Pcm(AudioSource),
    File(PathBuf),
}

impl From<AudioSource> for PlaybackSource {
    fn from(source: AudioSource) -> Self {
        Self::Pcm(source)
    }
}

impl From<PathBuf> for PlaybackSource {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

impl From<&Path> for PlaybackSource {
    fn from(path: &Path) -> Self {
        Self::File(path.to_path_buf())
    }
}

impl PlaybackSource {
    /// Length of one pass; reads only the header of a file
    pub fn duration(&self) -> HatResult<Duration> {
        match self {
            Self::Pcm(source) => Ok(source.duration()),
            Self::File(path) => AudioSource::wav_duration(path),
        }
    }

    pub fn load(self) -> HatResult<AudioSource> {
        match self {
            Self::Pcm(source) => Ok(source),
            Self::File(path) => AudioSource::load_wav(path),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    Init {
        id: u64,
        role: Role,
        config: InterfaceConfig,
    },
    Write {
        id: u64,
        source: PlaybackSource,
        times: u32,
    },
    AsyncWrite {
        id: u64,
        source: PlaybackSource,
        times: u32,
    },
    Record {
        id: u64,
        duration: Duration,
    },
    AsyncRecord {
        id: u64,
        duration: Duration,
    },
    Pause {
        id: u64,
        enable: bool,
    },
    Cancel {
        id: u64,
    },
    Stop {
        id: u64,
    },
}

impl Request {
    pub fn id(&self) -> u64 {
        match self {
            Self::Init { id, .. }
            | Self::Write { id, .. }
            | Self::AsyncWrite { id, .. }
            | Self::Record { id, .. }
            | Self::AsyncRecord { id, .. }
            | Self::Pause { id, .. }
            | Self::Cancel { id }
            | Self::Stop { id } => *id,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Write { .. } => "write",
            Self::AsyncWrite { .. } => "async_write",
            Self::Record { .. } => "record",
            Self::AsyncRecord { .. } => "async_record",
            Self::Pause { .. } => "pause",
            Self::Cancel { .. } => "cancel",
            Self::Stop { .. } => "stop",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    Ok {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<AudioSource>,
    },
    Error {
        id: u64,
        reason: String,
    },
}

impl Reply {
    pub fn ok(id: u64) -> Self {
        Self::Ok { id, payload: None }
    }

    pub fn error<S: Into<String>>(id: u64, reason: S) -> Self {
        Self::Error {
            id,
            reason: reason.into(),
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Self::Ok { id, .. } | Self::Error { id, .. } => *id,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_lines() {
        let request = Request::Record {
            id: 7,
            duration: Duration::from_millis(1500),
        };
        let line = serde_json::to_string(&request).unwrap();
        assert!(line.starts_with("{\"kind\":\"record\""));
        assert!(!line.contains('\n'));
        assert_eq!(serde_json::from_str::<Request>(&line).unwrap(), request);

        let reply: Reply = serde_json::from_str("{\"kind\":\"ok\",\"id\":3}").unwrap();
        assert_eq!(reply, Reply::ok(3));
        assert_eq!(Reply::error(4, "xrun").id(), 4);
    }

    #[test]
    fn test_file_source() {
        let source = PlaybackSource::File(PathBuf::from("/nonexistent/beep.wav"));
        assert!(source.load().is_err());
    }
}
