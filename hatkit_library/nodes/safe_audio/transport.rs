//! Ways to run an audio worker
//!
//! [`ProcessTransport`] isolates the engine in a child process speaking
//! JSON lines on stdin/stdout, so a wedged driver can be killed outright.
//! [`ThreadTransport`] runs the same worker loop on a thread, for tests
//! and for hosts without the worker binary installed.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};

use hatkit_core::error::{HatError, HatResult};

use super::protocol::{Reply, Request};
use super::worker::{self, EngineFactory};

/// Name of the worker executable installed alongside the library
pub const WORKER_BINARY: &str = "hatkit-audio-worker";

/// Host ends of a live worker's queues
pub struct WorkerLink {
    pub requests: Sender<Request>,
    pub replies: Receiver<Reply>,
}

pub trait WorkerTransport: Send {
    fn kind(&self) -> &str;

    /// Launch a fresh worker. At most one worker per transport is alive.
    fn spawn(&mut self) -> HatResult<WorkerLink>;

    fn is_alive(&mut self) -> bool;

    /// Reap the worker; `kill` forces it down instead of waiting for it
    fn terminate(&mut self, kill: bool);
}

/// Worker loop on a thread of this process
pub struct ThreadTransport {
    engines: EngineFactory,
    handle: Option<JoinHandle<()>>,
}

impl ThreadTransport {
    pub fn new(engines: EngineFactory) -> Self {
        Self {
            engines,
            handle: None,
        }
    }
}

impl Default for ThreadTransport {
    fn default() -> Self {
        Self::new(EngineFactory::default())
    }
}

impl WorkerTransport for ThreadTransport {
    fn kind(&self) -> &str {
        "thread"
    }

    fn spawn(&mut self) -> HatResult<WorkerLink> {
        self.terminate(true);
        let (req_tx, req_rx) = unbounded();
        let (rep_tx, rep_rx) = unbounded();
        let engines = self.engines.clone();
        let handle = std::thread::Builder::new()
            .name("hatkit-audio-worker".to_string())
            .spawn(move || worker::serve(req_rx, rep_tx, engines))?;
        self.handle = Some(handle);
        Ok(WorkerLink {
            requests: req_tx,
            replies: rep_rx,
        })
    }

    fn is_alive(&mut self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    fn terminate(&mut self, kill: bool) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if kill && !handle.is_finished() {
            // a thread cannot be killed; it exits once its queue disconnects
            log::warn!("audio worker thread abandoned");
            return;
        }
        if handle.join().is_err() {
            log::error!("audio worker thread panicked");
        }
    }
}

/// Worker in a child process
pub struct ProcessTransport {
    program: PathBuf,
    args: Vec<String>,
    child: Option<Child>,
}

impl ProcessTransport {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            child: None,
        }
    }

    /// The worker binary next to the current executable, else on `PATH`
    pub fn locate() -> Self {
        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BINARY)))
            .filter(|path| path.exists());
        Self::new(sibling.unwrap_or_else(|| PathBuf::from(WORKER_BINARY)))
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }
}

fn pump_requests(mut stdin: impl Write, requests: Receiver<Request>) {
    for request in requests.iter() {
        let line = match serde_json::to_string(&request) {
            Ok(line) => line,
            Err(e) => {
                log::error!("audio worker: cannot encode {}: {}", request.kind(), e);
                continue;
            }
        };
        if writeln!(stdin, "{}", line).and_then(|_| stdin.flush()).is_err() {
            log::warn!("audio worker: stdin closed");
            return;
        }
    }
}

fn pump_replies(stdout: impl BufRead, replies: Sender<Reply>) {
    for line in stdout.lines() {
        let Ok(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Reply>(&line) {
            Ok(reply) => {
                if replies.send(reply).is_err() {
                    return;
                }
            }
            Err(e) => log::warn!("audio worker: unreadable reply ({}): {}", e, line),
        }
    }
    log::debug!("audio worker: stdout closed");
}

impl WorkerTransport for ProcessTransport {
    fn kind(&self) -> &str {
        "process"
    }

    fn spawn(&mut self) -> HatResult<WorkerLink> {
        self.terminate(true);
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                HatError::backend_init(
                    "audio-worker",
                    format!("cannot run {}: {}", self.program.display(), e),
                )
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(HatError::Internal("worker pipes missing".to_string()));
        };
        log::info!("audio worker: spawned pid {}", child.id());

        let (req_tx, req_rx) = unbounded();
        let (rep_tx, rep_rx) = unbounded();
        std::thread::Builder::new()
            .name("hatkit-worker-stdin".to_string())
            .spawn(move || pump_requests(stdin, req_rx))?;
        std::thread::Builder::new()
            .name("hatkit-worker-stdout".to_string())
            .spawn(move || pump_replies(BufReader::new(stdout), rep_tx))?;

        self.child = Some(child);
        Ok(WorkerLink {
            requests: req_tx,
            replies: rep_rx,
        })
    }

    fn is_alive(&mut self) -> bool {
        self.child
            .as_mut()
            .map_or(false, |child| matches!(child.try_wait(), Ok(None)))
    }

    fn terminate(&mut self, kill: bool) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if !kill {
            let deadline = Instant::now() + Duration::from_millis(200);
            while Instant::now() < deadline {
                if let Ok(Some(status)) = child.try_wait() {
                    log::debug!("audio worker: exited with {}", status);
                    return;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        log::warn!("audio worker: killing pid {}", child.id());
        if let Err(e) = child.kill() {
            log::debug!("audio worker: kill: {}", e);
        }
        let _ = child.wait();
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.terminate(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_worker_binary() {
        let mut transport = ProcessTransport::new("/nonexistent/hatkit-audio-worker");
        assert!(matches!(
            transport.spawn(),
            Err(HatError::BackendInit { .. })
        ));
        assert!(!transport.is_alive());
    }

    #[test]
    fn test_reply_pump_skips_garbage() {
        let input = "{\"kind\":\"ok\",\"id\":1}\nnot json\n\n{\"kind\":\"error\",\"id\":2,\"reason\":\"xrun\"}\n";
        let (tx, rx) = unbounded();
        pump_replies(input.as_bytes(), tx);
        let replies: Vec<Reply> = rx.try_iter().collect();
        assert_eq!(replies, vec![Reply::ok(1), Reply::error(2, "xrun")]);
    }

    #[test]
    fn test_thread_worker_exits_on_hangup() {
        let mut transport = ThreadTransport::default();
        let link = transport.spawn().unwrap();
        assert!(transport.is_alive());
        drop(link);
        std::thread::sleep(Duration::from_millis(50));
        transport.terminate(false);
        assert!(!transport.is_alive());
    }
}
