//! Worker side of the safe audio protocol
//!
//! The worker owns the sound card engine. Its request loop stays
//! responsive while a stream runs on a separate thread, so pause, cancel
//! and stop act within one audio period.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender};

use hatkit_core::device::{share, Shared};
use hatkit_core::driver::InterfaceConfig;
use hatkit_core::error::HatResult;

use super::protocol::{PlaybackSource, Reply, Request, Role};
use crate::drivers::audio::{
    self, AudioControl, CaptureBackend, PcmFormat, PlaybackBackend, StreamOutcome,
};

type PlaybackOpener = dyn Fn(&InterfaceConfig) -> HatResult<Box<dyn PlaybackBackend>> + Send + Sync;
type CaptureOpener = dyn Fn(&InterfaceConfig) -> HatResult<Box<dyn CaptureBackend>> + Send + Sync;

/// How a worker opens its engine on `Init`
#[derive(Clone)]
pub struct EngineFactory {
    playback: Arc<PlaybackOpener>,
    capture: Arc<CaptureOpener>,
}

impl Default for EngineFactory {
    /// Engines chosen by the interface's backend id
    fn default() -> Self {
        Self {
            playback: Arc::new(audio::open_playback),
            capture: Arc::new(audio::open_capture),
        }
    }
}

impl EngineFactory {
    pub fn with_playback<F>(mut self, open: F) -> Self
    where
        F: Fn(&InterfaceConfig) -> HatResult<Box<dyn PlaybackBackend>> + Send + Sync + 'static,
    {
        self.playback = Arc::new(open);
        self
    }

    pub fn with_capture<F>(mut self, open: F) -> Self
    where
        F: Fn(&InterfaceConfig) -> HatResult<Box<dyn CaptureBackend>> + Send + Sync + 'static,
    {
        self.capture = Arc::new(open);
        self
    }
}

enum Engine {
    Playback(Shared<dyn PlaybackBackend>),
    Capture(Shared<dyn CaptureBackend>),
}

impl Engine {
    fn close(&self) {
        let result = match self {
            Self::Playback(engine) => engine.lock().close(),
            Self::Capture(engine) => engine.lock().close(),
        };
        if let Err(e) = result {
            log::warn!("audio worker: close failed: {}", e);
        }
    }
}

struct Worker {
    replies: Sender<Reply>,
    engines: EngineFactory,
    engine: Option<Engine>,
    format: PcmFormat,
    control: AudioControl,
    job: Option<JoinHandle<()>>,
}

/// Serve requests until `Stop` or until the host hangs up
pub fn serve(requests: Receiver<Request>, replies: Sender<Reply>, engines: EngineFactory) {
    let mut worker = Worker {
        replies,
        engines,
        engine: None,
        format: PcmFormat::default(),
        control: AudioControl::new(),
        job: None,
    };
    log::debug!("audio worker: serving");
    for request in requests.iter() {
        log::debug!("audio worker: {} #{}", request.kind(), request.id());
        if !worker.handle(request) {
            return;
        }
    }
    log::info!("audio worker: host disconnected");
    worker.finish_job();
    worker.close_engine();
}

impl Worker {
    fn reply(&self, reply: Reply) {
        if self.replies.send(reply).is_err() {
            log::warn!("audio worker: reply dropped, host is gone");
        }
    }

    fn busy(&self) -> bool {
        self.job.as_ref().map_or(false, |job| !job.is_finished())
    }

    /// Cancel the running stream, if any, and wait for it to reply
    fn finish_job(&mut self) {
        if let Some(job) = self.job.take() {
            self.control.cancel();
            if job.join().is_err() {
                log::error!("audio worker: stream thread panicked");
            }
        }
        self.control.reset();
    }

    fn close_engine(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.close();
        }
    }

    fn handle(&mut self, request: Request) -> bool {
        match request {
            Request::Init { id, role, config } => {
                self.finish_job();
                self.close_engine();
                match self.open(role, &config) {
                    Ok(()) => self.reply(Reply::ok(id)),
                    Err(e) => self.reply(Reply::error(id, e.to_string())),
                }
            }
            Request::Write { id, source, times } => self.start_playback(id, source, times, false),
            Request::AsyncWrite { id, source, times } => {
                self.start_playback(id, source, times, true)
            }
            Request::Record { id, duration } => self.start_capture(id, duration, false),
            Request::AsyncRecord { id, duration } => self.start_capture(id, duration, true),
            Request::Pause { id, enable } => {
                self.control.pause(enable);
                self.reply(Reply::ok(id));
            }
            Request::Cancel { id } => {
                self.finish_job();
                self.reply(Reply::ok(id));
            }
            Request::Stop { id } => {
                self.finish_job();
                self.close_engine();
                self.reply(Reply::ok(id));
                log::info!("audio worker: stopped");
                return false;
            }
        }
        true
    }

    fn open(&mut self, role: Role, config: &InterfaceConfig) -> HatResult<()> {
        self.format = PcmFormat::from_interface(config);
        let engine = match role {
            Role::Playback => {
                let mut playback = (self.engines.playback)(config)?;
                if let Some(volume) = config.volume {
                    if let Err(e) = playback.set_volume(volume) {
                        log::warn!("audio worker: volume not applied: {}", e);
                    }
                }
                Engine::Playback(share(playback))
            }
            Role::Capture => Engine::Capture(share((self.engines.capture)(config)?)),
        };
        self.engine = Some(engine);
        Ok(())
    }

    fn prepare_job(&mut self, id: u64, acknowledge: bool) -> bool {
        if self.busy() {
            self.reply(Reply::error(id, "a stream is already running"));
            return false;
        }
        if let Some(job) = self.job.take() {
            let _ = job.join();
        }
        self.control.reset();
        if acknowledge {
            self.reply(Reply::ok(id));
        }
        true
    }

    fn start_playback(&mut self, id: u64, source: PlaybackSource, times: u32, acknowledge: bool) {
        let engine = match &self.engine {
            Some(Engine::Playback(engine)) => engine.clone(),
            _ => return self.reply(Reply::error(id, "no playback engine")),
        };
        if !self.prepare_job(id, acknowledge) {
            return;
        }
        let control = self.control.clone();
        let replies = self.replies.clone();
        self.spawn(move || {
            let result = source
                .load()
                .and_then(|clip| audio::play(&mut **engine.lock(), &clip, times, &control));
            let reply = match result {
                Ok(outcome) => {
                    log::debug!("audio worker: playback #{} {:?}", id, outcome);
                    Reply::ok(id)
                }
                Err(e) => Reply::error(id, e.to_string()),
            };
            let _ = replies.send(reply);
        });
    }

    fn start_capture(&mut self, id: u64, duration: std::time::Duration, acknowledge: bool) {
        let engine = match &self.engine {
            Some(Engine::Capture(engine)) => engine.clone(),
            _ => return self.reply(Reply::error(id, "no capture engine")),
        };
        if !self.prepare_job(id, acknowledge) {
            return;
        }
        let control = self.control.clone();
        let replies = self.replies.clone();
        let format = self.format;
        self.spawn(move || {
            let reply = match audio::record(&mut **engine.lock(), &format, duration, &control) {
                Ok((source, outcome)) => {
                    if outcome == StreamOutcome::Cancelled {
                        log::debug!("audio worker: recording #{} cancelled", id);
                    }
                    Reply::Ok {
                        id,
                        payload: Some(source),
                    }
                }
                Err(e) => Reply::error(id, e.to_string()),
            };
            let _ = replies.send(reply);
        });
    }

    fn spawn<F: FnOnce() + Send + 'static>(&mut self, job: F) {
        match std::thread::Builder::new()
            .name("hatkit-audio-stream".to_string())
            .spawn(job)
        {
            Ok(handle) => self.job = Some(handle),
            Err(e) => log::error!("audio worker: cannot spawn stream thread: {}", e),
        }
    }
}
