//! Safe audio controllers
//!
//! Some sound card drivers occasionally wedge inside a blocking PCM call.
//! [`SafeSpeaker`] and [`SafeMicrophone`] keep the engine in a worker (a
//! child process by default) and talk to it only through tagged request
//! and reply queues. When the worker errors or stops answering, the host
//! tears it down and launches a new one.
//!
//! # Host state machine
//!
//! ```text
//! Uninit -> Init -> Idle <-> Playing <-> Paused
//!                     ^         |          |
//!                     +---------+----------+   (completion, cancel)
//! ```
//!
//! Errors route through a restart back to `Idle`, or to `Failed` once the
//! restart cycles are exhausted.

pub mod microphone;
pub mod protocol;
pub mod speaker;
pub mod transport;
pub mod worker;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossbeam::channel::Receiver;

use hatkit_core::driver::{DriverStatus, InterfaceConfig};
use hatkit_core::error::{HatError, HatResult};

pub use microphone::SafeMicrophone;
pub use protocol::{PlaybackSource, Reply, Request, Role};
pub use speaker::SafeSpeaker;
pub use transport::{ProcessTransport, ThreadTransport, WorkerLink, WorkerTransport, WORKER_BINARY};
pub use worker::EngineFactory;

/// Replies kept for operations nobody is waiting on yet
const STASH_LIMIT: usize = 64;

#[derive(Debug, Clone)]
pub struct SafeAudioConfig {
    /// Sound card options: `dev_name`, `channels`, `framerate`, `volume`, `name`
    pub interface: InterfaceConfig,
    /// Worker executable; `None` runs the worker on a thread
    pub worker_path: Option<PathBuf>,
    /// Deadline for the worker's reply to `Init`
    pub init_timeout: Duration,
    /// Deadline for pause, cancel and asynchronous acknowledgements
    pub control_timeout: Duration,
    /// Slack added to the expected length of a blocking stream
    pub reply_margin: Duration,
    /// Deadline for the reply to `Stop` before the worker is killed
    pub stop_timeout: Duration,
    pub restart_backoff: Duration,
    /// Failed launch cycles before giving up with `Fatal`
    pub max_restart_cycles: u32,
}

impl Default for SafeAudioConfig {
    fn default() -> Self {
        Self {
            interface: InterfaceConfig::default(),
            worker_path: None,
            init_timeout: Duration::from_millis(500),
            control_timeout: Duration::from_millis(500),
            reply_margin: Duration::from_secs(1),
            stop_timeout: Duration::from_millis(600),
            restart_backoff: Duration::from_secs(3),
            max_restart_cycles: 3,
        }
    }
}

impl SafeAudioConfig {
    pub fn new(interface: InterfaceConfig) -> Self {
        Self {
            interface,
            ..Default::default()
        }
    }

    /// Simulation sound card on a worker thread
    pub fn simulation() -> Self {
        Self::new(InterfaceConfig::simulation())
    }

    pub fn name(&self) -> &str {
        self.interface.name.as_deref().unwrap_or("safe-audio")
    }

    fn transport(&self) -> Box<dyn WorkerTransport> {
        match &self.worker_path {
            Some(path) => Box::new(ProcessTransport::new(path.clone())),
            None => Box::new(ThreadTransport::default()),
        }
    }
}

/// Host-side state; `Playing` also covers recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafeState {
    Uninit,
    Init,
    Idle,
    Playing,
    Paused,
    Failed(String),
}

/// Take the reply for `id`, parking every other reply in `stash`
fn take_reply(
    replies: &Receiver<Reply>,
    stash: &mut VecDeque<Reply>,
    id: u64,
    timeout: Duration,
) -> Option<Reply> {
    if let Some(pos) = stash.iter().position(|r| r.id() == id) {
        return stash.remove(pos);
    }
    let deadline = Instant::now() + timeout;
    loop {
        match replies.recv_deadline(deadline) {
            Ok(reply) if reply.id() == id => return Some(reply),
            Ok(reply) => {
                if stash.len() >= STASH_LIMIT {
                    if let Some(old) = stash.pop_front() {
                        log::warn!("safe audio: dropping unclaimed reply #{}", old.id());
                    }
                }
                stash.push_back(reply);
            }
            Err(_) => return None,
        }
    }
}

/// Request/reply bookkeeping shared by the speaker and the microphone
pub struct WorkerHost {
    role: Role,
    config: SafeAudioConfig,
    transport: Box<dyn WorkerTransport>,
    link: Option<WorkerLink>,
    stash: VecDeque<Reply>,
    state: SafeState,
    restarting: bool,
    outstanding: Option<u64>,
    completed: Option<Reply>,
}

impl WorkerHost {
    pub fn new(role: Role, config: SafeAudioConfig) -> Self {
        let transport = config.transport();
        Self::with_transport(role, config, transport)
    }

    pub fn with_transport(role: Role, config: SafeAudioConfig, transport: Box<dyn WorkerTransport>) -> Self {
        Self {
            role,
            config,
            transport,
            link: None,
            stash: VecDeque::new(),
            state: SafeState::Uninit,
            restarting: false,
            outstanding: None,
            completed: None,
        }
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn config(&self) -> &SafeAudioConfig {
        &self.config
    }

    pub fn state(&self) -> SafeState {
        self.state.clone()
    }

    pub fn status(&self) -> DriverStatus {
        match &self.state {
            SafeState::Uninit => DriverStatus::Uninitialized,
            SafeState::Init | SafeState::Idle => DriverStatus::Ready,
            SafeState::Playing | SafeState::Paused => DriverStatus::Running,
            SafeState::Failed(reason) => DriverStatus::Error(reason.clone()),
        }
    }

    /// Random 64-bit request id, never one a reply may still arrive for
    fn id(&mut self) -> u64 {
        loop {
            let id = rand::random::<u64>();
            if self.outstanding != Some(id) && !self.stash.iter().any(|r| r.id() == id) {
                return id;
            }
        }
    }

    fn send(&self, request: Request) -> HatResult<()> {
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| HatError::driver(format!("{}: worker not started", self.name())))?;
        link.requests
            .send(request)
            .map_err(|_| HatError::driver(format!("{}: worker hung up", self.name())))
    }

    fn wait_reply(&mut self, id: u64, timeout: Duration) -> Option<Reply> {
        let link = self.link.as_ref()?;
        take_reply(&link.replies, &mut self.stash, id, timeout)
    }

    /// Launch the worker, retrying with backoff
    pub fn start(&mut self) -> HatResult<()> {
        match self.state {
            SafeState::Idle | SafeState::Playing | SafeState::Paused => return Ok(()),
            _ => {}
        }
        self.launch_cycles(false)
    }

    fn launch(&mut self) -> HatResult<()> {
        self.state = SafeState::Init;
        self.link = Some(self.transport.spawn()?);
        let id = self.id();
        self.send(Request::Init {
            id,
            role: self.role,
            config: self.config.interface.clone(),
        })?;
        match self.wait_reply(id, self.config.init_timeout) {
            Some(Reply::Ok { .. }) => {
                self.state = SafeState::Idle;
                log::info!("{}: worker ready ({})", self.name(), self.transport.kind());
                Ok(())
            }
            Some(Reply::Error { reason, .. }) => Err(HatError::backend_init("audio-worker", reason)),
            None => Err(HatError::ProtocolTimeout(format!(
                "{}: no reply to init within {:?}",
                self.name(),
                self.config.init_timeout
            ))),
        }
    }

    fn launch_cycles(&mut self, backoff_first: bool) -> HatResult<()> {
        let cycles = self.config.max_restart_cycles.max(1);
        let mut last = None;
        for cycle in 0..cycles {
            if cycle > 0 || backoff_first {
                std::thread::sleep(self.config.restart_backoff);
            }
            match self.launch() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!(
                        "{}: worker launch {}/{} failed: {}",
                        self.name(),
                        cycle + 1,
                        cycles,
                        e
                    );
                    self.teardown(true);
                    last = Some(e);
                }
            }
        }
        let reason = format!(
            "{}: worker failed {} launch cycles, last error: {}",
            self.name(),
            cycles,
            last.map(|e| e.to_string()).unwrap_or_default()
        );
        log::error!("{}", reason);
        self.state = SafeState::Failed(reason.clone());
        Err(HatError::Fatal(reason))
    }

    fn teardown(&mut self, kill: bool) {
        self.link = None;
        self.transport.terminate(kill);
        self.stash.clear();
        self.outstanding = None;
    }

    /// Replace the worker after `cause`; returns `cause` once a new worker
    /// is up, `Fatal` if none could be launched
    fn restart(&mut self, cause: HatError) -> HatError {
        if self.restarting {
            return cause;
        }
        self.restarting = true;
        log::warn!("{}: restarting worker after: {}", self.name(), cause);
        self.teardown(true);
        let result = self.launch_cycles(true);
        self.restarting = false;
        match result {
            Ok(()) => cause,
            Err(fatal) => fatal,
        }
    }

    /// Send `request` and wait for its reply; errors and timeouts restart
    /// the worker
    fn call(&mut self, request: Request, timeout: Duration) -> HatResult<Reply> {
        let id = request.id();
        let kind = request.kind();
        if let Err(e) = self.send(request) {
            return Err(self.restart(e));
        }
        match self.wait_reply(id, timeout) {
            Some(reply @ Reply::Ok { .. }) => Ok(reply),
            Some(Reply::Error { reason, .. }) => {
                Err(self.restart(HatError::driver(format!("{} #{}: {}", kind, id, reason))))
            }
            None => {
                log::warn!("{}: {} #{} timed out after {:?}", self.name(), kind, id, timeout);
                Err(self.restart(HatError::ProtocolTimeout(format!(
                    "{}: no reply to {} #{} within {:?}",
                    self.name(),
                    kind,
                    id,
                    timeout
                ))))
            }
        }
    }

    /// Pick up the completion of the running asynchronous operation, if
    /// it has arrived
    fn refresh(&mut self) {
        if let Some(id) = self.outstanding {
            if let Some(reply) = self.wait_reply(id, Duration::ZERO) {
                self.finish_async(reply);
            }
        }
    }

    fn finish_async(&mut self, reply: Reply) {
        self.outstanding = None;
        if matches!(self.state, SafeState::Playing | SafeState::Paused) {
            self.state = SafeState::Idle;
        }
        self.completed = Some(reply);
    }

    fn ensure_idle(&mut self) -> HatResult<()> {
        self.refresh();
        match &self.state {
            SafeState::Idle => Ok(()),
            SafeState::Playing | SafeState::Paused => Err(HatError::invalid_input(format!(
                "{}: an operation is already running",
                self.name()
            ))),
            SafeState::Failed(reason) => Err(HatError::Fatal(reason.clone())),
            SafeState::Uninit | SafeState::Init => {
                Err(HatError::driver(format!("{}: not started", self.name())))
            }
        }
    }

    /// Run a blocking stream request expected to last `expected`
    pub fn run(&mut self, make: impl FnOnce(u64) -> Request, expected: Duration) -> HatResult<Reply> {
        self.ensure_idle()?;
        let id = self.id();
        self.state = SafeState::Playing;
        let result = self.call(make(id), expected + self.config.reply_margin);
        if self.state == SafeState::Playing {
            self.state = SafeState::Idle;
        }
        result
    }

    /// Start an asynchronous stream request; its completion is collected
    /// by [`WorkerHost::wait`]
    pub fn run_async(&mut self, make: impl FnOnce(u64) -> Request) -> HatResult<u64> {
        self.ensure_idle()?;
        let id = self.id();
        self.completed = None;
        self.call(make(id), self.config.control_timeout)?;
        self.state = SafeState::Playing;
        self.outstanding = Some(id);
        Ok(id)
    }

    /// Wait up to `timeout` for the asynchronous operation to complete.
    /// Returns the completion reply, or `None` while it is still running.
    pub fn wait(&mut self, timeout: Duration) -> HatResult<Option<Reply>> {
        let Some(id) = self.outstanding else {
            return Ok(self.completed.take());
        };
        let Some(reply) = self.wait_reply(id, timeout) else {
            if !self.transport.is_alive() {
                let cause = HatError::driver(format!("{}: worker exited during #{}", self.name(), id));
                return Err(self.restart(cause));
            }
            return Ok(None);
        };
        self.finish_async(reply);
        match self.completed.take() {
            Some(Reply::Error { reason, .. }) => {
                Err(self.restart(HatError::driver(format!("async #{}: {}", id, reason))))
            }
            other => Ok(other),
        }
    }

    pub fn is_busy(&mut self) -> bool {
        self.refresh();
        matches!(self.state, SafeState::Playing | SafeState::Paused)
    }

    pub fn pause(&mut self, enable: bool) -> HatResult<()> {
        if self.link.is_none() {
            return Err(HatError::driver(format!("{}: not started", self.name())));
        }
        self.refresh();
        let id = self.id();
        self.call(Request::Pause { id, enable }, self.config.control_timeout)?;
        self.state = match (&self.state, enable) {
            (SafeState::Playing, true) => SafeState::Paused,
            (SafeState::Paused, false) => SafeState::Playing,
            (state, _) => state.clone(),
        };
        Ok(())
    }

    pub fn cancel(&mut self) -> HatResult<()> {
        if self.link.is_none() {
            return Ok(());
        }
        let id = self.id();
        self.call(Request::Cancel { id }, self.config.control_timeout)?;
        // the stream's own reply precedes the cancel acknowledgement
        self.refresh();
        if matches!(self.state, SafeState::Playing | SafeState::Paused) {
            self.state = SafeState::Idle;
        }
        Ok(())
    }

    /// Stop the worker, killing it if it does not answer in time. Never fails.
    pub fn stop(&mut self) {
        if self.link.is_some() {
            let id = self.id();
            let answered = self.send(Request::Stop { id }).is_ok()
                && matches!(
                    self.wait_reply(id, self.config.stop_timeout),
                    Some(Reply::Ok { .. })
                );
            if !answered {
                log::warn!("{}: worker did not stop in time, killing it", self.name());
            }
            self.teardown(!answered);
            log::info!("{}: stopped", self.name());
        } else {
            self.teardown(true);
        }
        self.completed = None;
        self.state = SafeState::Uninit;
    }
}

impl Drop for WorkerHost {
    fn drop(&mut self) {
        if self.link.is_some() {
            self.stop();
        }
    }
}
