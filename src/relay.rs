use crate::codec::FrameError;
use crate::host::MessageHost;
use crate::logger::LogWriter;
use crate::session::{SessionError, SessionStore};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const USAGE: &str = "\
devlog-host - Native messaging host for browser console logs

Usage:
  devlog-host <log-file-path> [log-levels...]

Arguments:
  log-file-path   Path to the log file
  log-levels      Space-separated list of log levels to capture
                  (e.g., log warn error). If not specified, all levels are captured.

With no arguments the host uses the active session started by `devlog start`.

The host reads length-prefixed JSON messages from stdin and writes formatted
logs to the log file. It runs until stdin is closed.
";

/// A stream that keeps failing at the transport level is dead, not noisy.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 16;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("no arguments provided and no active session found: {0}")]
    NoTarget(#[source] SessionError),
    #[error("failed to create logger for {path}: {source}")]
    OpenLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Where this host instance writes, and which levels it keeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub log_path: PathBuf,
    pub levels: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub received: u64,
    pub written: u64,
    pub filtered: u64,
    pub rejected: u64,
    pub write_failures: u64,
    pub ack_failures: u64,
}

/// Drop the caller-origin tokens browsers append when launching a host
/// (`chrome-extension://…/`, `moz-extension://…`, Chrome's `--parent-window=`).
pub fn filter_browser_args<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    args.into_iter()
        .map(Into::into)
        .filter(|arg| {
            !(arg.starts_with("chrome-extension://")
                || arg.starts_with("moz-extension://")
                || arg.starts_with("--parent-window="))
        })
        .collect()
}

/// Explicit `<log-path> [levels...]` wins; otherwise fall back to the
/// active session record.
pub fn resolve_target<S: SessionStore + ?Sized>(
    args: &[String],
    store: &S,
) -> Result<HostTarget, StartupError> {
    let (log_path, levels) = match args.split_first() {
        Some((path, levels)) => (PathBuf::from(path), levels.to_vec()),
        None => {
            let state = store.load().map_err(StartupError::NoTarget)?;
            (state.log_path, state.levels)
        }
    };

    Ok(HostTarget {
        log_path,
        levels: levels.iter().map(|level| level.to_lowercase()).collect(),
    })
}

pub fn open_writer(target: &HostTarget) -> Result<LogWriter, StartupError> {
    LogWriter::open(&target.log_path, &target.levels).map_err(|source| StartupError::OpenLog {
        path: target.log_path.clone(),
        source,
    })
}

/// Read, record, acknowledge, until the browser closes the stream.
///
/// Per-frame problems (bad frames, failed appends, failed acknowledgments)
/// are answered and logged but never end the loop.
pub fn serve<R: Read, W: Write>(host: &mut MessageHost<R, W>, writer: &LogWriter) -> RelayStats {
    let mut stats = RelayStats::default();
    let mut read_errors = 0;

    loop {
        let ack = match host.read_message() {
            Ok(None) => {
                debug!("input closed");
                break;
            }
            Ok(Some(msg)) => {
                read_errors = 0;
                stats.received += 1;
                match writer.write(&msg) {
                    Ok(true) => {
                        stats.written += 1;
                        (true, String::new())
                    }
                    Ok(false) => {
                        stats.filtered += 1;
                        (true, String::new())
                    }
                    Err(e) => {
                        stats.write_failures += 1;
                        error!(error = %e, "error writing log");
                        (false, format!("failed to write log: {}", e))
                    }
                }
            }
            Err(e) => {
                stats.rejected += 1;
                warn!(error = %e, "error reading message");
                if is_transport_error(&e) {
                    read_errors += 1;
                } else {
                    read_errors = 0;
                }
                (false, e.to_string())
            }
        };

        if let Err(e) = host.send_acknowledgment(ack.0, &ack.1) {
            stats.ack_failures += 1;
            warn!(error = %e, "error sending ack");
        }

        if read_errors >= MAX_CONSECUTIVE_READ_ERRORS {
            error!(
                read_errors,
                last_error = %ack.1,
                "stopping: input stream failed {} times in a row without delivering a frame",
                read_errors
            );
            break;
        }
    }

    stats
}

fn is_transport_error(e: &FrameError) -> bool {
    matches!(e, FrameError::ReadLength(_) | FrameError::ReadBody(_))
}

/// Full host lifecycle over stdin/stdout.
pub fn run_host<S: SessionStore + ?Sized>(
    args: Vec<String>,
    store: &S,
) -> Result<RelayStats, StartupError> {
    let args = filter_browser_args(args);
    let target = resolve_target(&args, store)?;
    let writer = open_writer(&target)?;
    info!(log = %target.log_path.display(), levels = ?target.levels, "host started");

    let mut host = MessageHost::stdio();
    let stats = serve(&mut host, &writer);
    info!(?stats, "host finished");
    Ok(stats)
}
