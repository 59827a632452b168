//! Tokio-backed [`ProcessTransport`] over a real child process.
//!
//! Three background tasks serve one child:
//!
//! | Task        | Job                                                        |
//! |-------------|------------------------------------------------------------|
//! | stdout pump | forwards raw stdout chunks as [`TransportEvent::Stdout`]    |
//! | stderr pump | forwards stderr chunks and keeps a short tail for errors   |
//! | supervisor  | owns the [`Child`], handles termination, reports the exit  |
//!
//! The supervisor emits [`TransportEvent::Exited`] only after the stdout
//! pump finished, so the exit never overtakes buffered output.

use std::future::Future;
use std::io::ErrorKind;
use std::pin::Pin;
use std::process::ExitStatus;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{BytesCodec, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::spawner::LaunchSpec;
use crate::transport::{ExitInfo, ProcessTransport, TransportEvent};
use crate::{AppError, Result};

/// Capacity of the event channel between the pumps and the session.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Bytes of stderr retained for exit diagnostics.
const STDERR_TAIL_BYTES: usize = 4096;

/// A running CLI subprocess.
#[derive(Debug)]
pub struct ChildProcessTransport {
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    events: mpsc::Receiver<TransportEvent>,
    /// Fired by the supervisor once requested to stop.
    stop: CancellationToken,
    /// Fired by the supervisor once the child is reaped.
    exited: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
}

impl ChildProcessTransport {
    /// Launch the process described by `spec`.
    ///
    /// Returns as soon as the process is running; nothing here waits for
    /// output.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the executable cannot be started or its
    /// stdio cannot be captured.
    pub fn spawn(spec: &LaunchSpec) -> Result<Self> {
        let mut cmd = spec.build_command()?;
        let mut child = cmd.spawn().map_err(|err| {
            AppError::Spawn(format!("failed to launch '{}': {err}", spec.executable))
        })?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture stderr".into()))?;

        info!(
            pid,
            executable = %spec.executable,
            working_dir = %spec.working_dir.display(),
            "subprocess started"
        );

        let (tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let stop = CancellationToken::new();
        let exited = CancellationToken::new();

        let stdout_pump = tokio::spawn(pump_stdout(stdout, tx.clone()));
        let stderr_pump = tokio::spawn(pump_stderr(stderr, tx.clone()));
        let supervisor = tokio::spawn(supervise(Supervisor {
            child,
            pid,
            stdout_pump,
            stderr_pump,
            tx,
            stop: stop.clone(),
            exited: exited.clone(),
            grace: spec.terminate_grace,
        }));

        Ok(Self {
            pid,
            stdin: Some(stdin),
            events,
            stop,
            exited,
            supervisor: Some(supervisor),
        })
    }

    /// OS process id, if the process was still running at launch.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the child has been reaped.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }
}

impl ProcessTransport for ChildProcessTransport {
    fn write(&mut self, bytes: Bytes) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.exited.is_cancelled() {
                return Err(AppError::Closed("process has exited".into()));
            }
            let stdin = self
                .stdin
                .as_mut()
                .ok_or_else(|| AppError::Closed("stdin is closed".into()))?;

            let result = async {
                stdin.write_all(&bytes).await?;
                stdin.flush().await
            }
            .await;

            result.map_err(|err| {
                if err.kind() == ErrorKind::BrokenPipe {
                    self.stdin = None;
                    AppError::Closed(format!("stdin closed by process: {err}"))
                } else {
                    AppError::TransportWrite(err.to_string())
                }
            })
        })
    }

    fn poll(&mut self) -> Pin<Box<dyn Future<Output = Option<TransportEvent>> + Send + '_>> {
        Box::pin(self.events.recv())
    }

    fn terminate(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            // Closing stdin is the CLI's own cue to finish.
            self.stdin = None;
            self.stop.cancel();
            if self.supervisor.take().is_some() {
                self.exited.cancelled().await;
            }
            Ok(())
        })
    }
}

impl Drop for ChildProcessTransport {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

// ── Background tasks ─────────────────────────────────────────────────────────

async fn pump_stdout<R>(stdout: R, tx: mpsc::Sender<TransportEvent>)
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, BytesCodec::new());
    while let Some(chunk) = framed.next().await {
        match chunk {
            Ok(bytes) => {
                if tx.send(TransportEvent::Stdout(bytes.freeze())).await.is_err() {
                    debug!("stdout pump: receiver dropped, stopping");
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, "stdout pump: read failed, stopping");
                return;
            }
        }
    }
    debug!("stdout pump: EOF");
}

async fn pump_stderr<R>(stderr: R, tx: mpsc::Sender<TransportEvent>) -> String
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stderr, BytesCodec::new());
    let mut tail: Vec<u8> = Vec::new();
    let mut forwarding = true;

    while let Some(chunk) = framed.next().await {
        let Ok(bytes) = chunk else { break };
        debug!(stderr = %String::from_utf8_lossy(&bytes).trim_end(), "subprocess stderr");

        tail.extend_from_slice(&bytes);
        if tail.len() > STDERR_TAIL_BYTES {
            tail.drain(..tail.len() - STDERR_TAIL_BYTES);
        }

        if forwarding && tx.send(TransportEvent::Stderr(bytes.freeze())).await.is_err() {
            forwarding = false;
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

struct Supervisor {
    child: Child,
    pid: Option<u32>,
    stdout_pump: JoinHandle<()>,
    stderr_pump: JoinHandle<String>,
    tx: mpsc::Sender<TransportEvent>,
    stop: CancellationToken,
    exited: CancellationToken,
    grace: Duration,
}

async fn supervise(mut sup: Supervisor) {
    let (status, requested) = tokio::select! {
        status = sup.child.wait() => (status, false),
        () = sup.stop.cancelled() => (shutdown(&mut sup.child, sup.pid, sup.grace).await, true),
    };
    sup.exited.cancel();

    // A grandchild holding the pipes open must not stall the exit report.
    if tokio::time::timeout(sup.grace, &mut sup.stdout_pump)
        .await
        .is_err()
    {
        warn!(pid = sup.pid, "supervisor: stdout not drained in time, abandoning");
        sup.stdout_pump.abort();
    }
    let stderr_tail = match tokio::time::timeout(sup.grace, &mut sup.stderr_pump).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            sup.stderr_pump.abort();
            String::new()
        }
    };

    let info = match status {
        Ok(status) => exit_info(status, requested, stderr_tail),
        Err(err) => {
            warn!(pid = sup.pid, %err, "supervisor: error waiting for child");
            ExitInfo {
                requested,
                stderr_tail: format!("wait error: {err}"),
                ..ExitInfo::default()
            }
        }
    };

    info!(pid = sup.pid, reason = %info.describe(), requested, "subprocess exited");
    if sup.tx.send(TransportEvent::Exited(info)).await.is_err() {
        debug!(pid = sup.pid, "supervisor: receiver dropped before exit report");
    }
}

/// Polite termination followed by a hard kill after `grace`.
async fn shutdown(child: &mut Child, pid: Option<u32>, grace: Duration) -> std::io::Result<ExitStatus> {
    send_sigterm(child, pid);
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status;
    }
    warn!(pid, grace_ms = grace.as_millis(), "subprocess ignored SIGTERM, killing");
    child.kill().await?;
    child.wait().await
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(err) = signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(pid = raw, %err, "SIGTERM failed, falling back to kill");
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

fn exit_info(status: ExitStatus, requested: bool, stderr_tail: String) -> ExitInfo {
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
    #[cfg(not(unix))]
    let signal = None;

    ExitInfo {
        code: status.code(),
        signal,
        requested,
        stderr_tail,
    }
}
