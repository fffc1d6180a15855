//! Out-of-process audio worker
//!
//! Speaks the safe-audio protocol as JSON lines: requests on stdin, replies
//! on stdout. Logs go to stderr so they never mix with replies.

use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::thread;

use clap::Parser;
use crossbeam::channel::{unbounded, Receiver, Sender};

use hatkit_library::nodes::safe_audio::protocol::{Reply, Request};
use hatkit_library::nodes::safe_audio::worker::{self, EngineFactory};

#[derive(Parser)]
#[command(name = "hatkit-audio-worker")]
#[command(about = "Audio engine host for hatkit safe speakers and microphones", long_about = None)]
struct Args {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn read_requests(requests: Sender<Request>) {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                log::trace!("request {} ({})", request.id(), request.kind());
                if requests.send(request).is_err() {
                    return;
                }
            }
            Err(e) => log::warn!("ignoring malformed request ({}): {}", e, line),
        }
    }
    log::debug!("stdin closed");
}

fn write_replies(replies: Receiver<Reply>) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for reply in replies.iter() {
        let line = serde_json::to_string(&reply).map_err(io::Error::from)?;
        writeln!(out, "{}", line)?;
        out.flush()?;
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let (request_tx, request_rx) = unbounded();
    let (reply_tx, reply_rx) = unbounded();

    let reader = thread::Builder::new()
        .name("worker-stdin".to_string())
        .spawn(move || read_requests(request_tx));
    if let Err(e) = reader {
        log::error!("cannot start stdin reader: {}", e);
        return ExitCode::FAILURE;
    }

    let writer = match thread::Builder::new()
        .name("worker-stdout".to_string())
        .spawn(move || write_replies(reply_rx))
    {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("cannot start stdout writer: {}", e);
            return ExitCode::FAILURE;
        }
    };

    log::info!("audio worker {} ready", std::process::id());
    worker::serve(request_rx, reply_tx, EngineFactory::default());

    // serve dropped its reply sender; the writer drains and exits
    match writer.join() {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            log::error!("stdout closed: {}", e);
            ExitCode::FAILURE
        }
        Err(_) => ExitCode::FAILURE,
    }
}
