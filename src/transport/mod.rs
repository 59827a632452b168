//! Subprocess transport abstraction.
//!
//! The [`ProcessTransport`] trait is the only surface the session actor uses
//! to talk to the CLI process: raw bytes go in through [`write`], and stdout
//! chunks, stderr chunks, and the final exit come out of [`poll`] in the
//! order they happened. [`child::ChildProcessTransport`] is the tokio
//! implementation; tests substitute scripted in-memory transports.
//!
//! [`write`]: ProcessTransport::write
//! [`poll`]: ProcessTransport::poll

pub mod child;
pub mod spawner;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use crate::Result;

/// Output observed from the subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A chunk of stdout, cut at an arbitrary byte boundary.
    Stdout(Bytes),
    /// A chunk of stderr.
    Stderr(Bytes),
    /// The process is gone and stdout has been fully drained.
    Exited(ExitInfo),
}

/// How the subprocess ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal number, when killed by a signal.
    pub signal: Option<i32>,
    /// Whether the exit followed a `terminate` call.
    pub requested: bool,
    /// Last lines written to stderr, for diagnostics.
    pub stderr_tail: String,
}

impl ExitInfo {
    /// Clean exit with status code 0.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    /// Human-readable exit reason, with the stderr tail appended when the
    /// exit was abnormal.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut reason = match (self.code, self.signal) {
            (Some(code), _) => format!("process exited with code {code}"),
            (None, Some(signal)) => format!("process terminated by signal {signal}"),
            (None, None) => "process terminated by signal".to_owned(),
        };
        let tail = self.stderr_tail.trim();
        if !self.is_success() && !tail.is_empty() {
            reason.push_str(": ");
            reason.push_str(tail);
        }
        reason
    }
}

/// Bidirectional byte channel to a running CLI process.
///
/// All methods take `&mut self`; the session actor is the only owner.
pub trait ProcessTransport: Send {
    /// Write `bytes` to the process's stdin and flush.
    ///
    /// # Errors
    ///
    /// - [`AppError::Closed`](crate::AppError::Closed) once the process has
    ///   exited or stdin was closed by the other side.
    /// - [`AppError::TransportWrite`](crate::AppError::TransportWrite) for
    ///   any other I/O failure.
    fn write(&mut self, bytes: Bytes) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Wait for the next output event.
    ///
    /// Cancel-safe: dropping the future loses no output. Returns `None`
    /// after [`TransportEvent::Exited`] has been delivered and every source
    /// is drained.
    fn poll(&mut self) -> Pin<Box<dyn Future<Output = Option<TransportEvent>> + Send + '_>>;

    /// Stop the process: a polite signal first, a hard kill after the grace
    /// period. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns an error only if the process could not be signalled at all.
    fn terminate(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}
