//! Process backend - the privileged enforcement binary as a child process
//!
//! The binary is started with a fixed activation argument set and stopped in
//! two phases:
//!
//! ```text
//! stop(grace)
//!   │
//!   ├─ already exited? ──────────────────────────► AlreadyExited (no signal)
//!   │
//!   ├─ SIGTERM
//!   │
//!   ├─ wait() ───── exits within grace ─────────► Graceful
//!   │     │
//!   │     └──────── grace elapsed ──► SIGKILL ──► Killed
//! ```
//!
//! Shutdown latency is bounded by `grace + ε` while a cooperative binary still
//! gets a chance to deprogram its kernel hooks before it is killed.
//!
//! Two tasks run alongside the child. The exit watcher owns the `Child`, reaps
//! it and reports an exit that nobody asked for. The output forwarder drains
//! stdout for as long as the pipe is open; the binary must never see a closed
//! pipe while it is enforcing.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::parse_block_line;
use super::{Backend, BackendError};
use crate::metrics::Telemetry;

/// Arguments that switch the enforcement binary into blocking mode.
pub const ACTIVATION_ARGS: [&str; 2] = ["--enable-syscall-block", "--enable-network-block"];

/// How long to keep draining stdout after the child is gone.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause after a failed read before draining again.
const READ_RETRY_DELAY: Duration = Duration::from_millis(50);

/// How the child process ended during `terminate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The backend was never started (or already terminated)
    NotStarted,
    /// The child had exited on its own before any signal was sent
    AlreadyExited(ExitStatus),
    /// The child exited after SIGTERM within the grace period
    Graceful(ExitStatus),
    /// The grace period elapsed and SIGKILL was sent
    Killed,
    /// The child is gone but its exit status could not be collected
    Lost,
}

/// A running child, owned by its exit watcher task.
struct ChildHandle {
    pid: u32,
    /// Cancelled once termination is requested; exits before that are unexpected
    stopping: CancellationToken,
    kill: Option<oneshot::Sender<()>>,
    exit: JoinHandle<Option<ExitStatus>>,
}

/// Runs the enforcement binary as a supervised child process.
pub struct ProcessBackend {
    path: PathBuf,
    telemetry: Arc<Telemetry>,
    child: Option<ChildHandle>,
    pid: Option<u32>,
    output: Option<JoinHandle<()>>,
}

impl ProcessBackend {
    /// Create a backend for the binary at `path`. Nothing is spawned yet.
    pub fn new(path: impl Into<PathBuf>, telemetry: Arc<Telemetry>) -> Self {
        Self {
            path: path.into(),
            telemetry,
            child: None,
            pid: None,
            output: None,
        }
    }

    /// PID of the child, once started
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Spawn the enforcement binary and its watcher tasks.
    fn spawn(&mut self, scope: &CancellationToken) -> Result<(), BackendError> {
        let mut child = Command::new(&self.path)
            .args(ACTIVATION_ARGS)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BackendError::Spawn {
                path: self.path.clone(),
                source,
            })?;

        // Only None once the child has been reaped
        let Some(pid) = child.id() else {
            return Err(BackendError::Spawn {
                path: self.path.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "child was reaped before its PID was read",
                ),
            });
        };
        self.pid = Some(pid);

        if let Some(stdout) = child.stdout.take() {
            let telemetry = Arc::clone(&self.telemetry);
            self.output = Some(tokio::spawn(forward_output(stdout, telemetry)));
        }

        let stopping = scope.child_token();
        let (kill_tx, kill_rx) = oneshot::channel();
        let exit = tokio::spawn(watch_exit(
            child,
            kill_rx,
            stopping.clone(),
            Arc::clone(&self.telemetry),
        ));

        info!(
            pid,
            path = %self.path.display(),
            "L.O.C.K. kernel started with PID {}",
            pid
        );

        self.child = Some(ChildHandle {
            pid,
            stopping,
            kill: Some(kill_tx),
            exit,
        });
        Ok(())
    }

    /// Stop the child: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// Never fails; a failed SIGKILL is logged. The stdout forwarder is reaped
    /// before returning.
    pub async fn terminate(&mut self, grace: Duration) -> Termination {
        let Some(mut child) = self.child.take() else {
            return Termination::NotStarted;
        };
        child.stopping.cancel();

        let termination = terminate_child(&mut child, grace).await;

        if let Some(mut output) = self.output.take() {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut output)
                .await
                .is_err()
            {
                // A grandchild may still hold the pipe open
                output.abort();
            }
        }

        termination
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    fn kind(&self) -> &'static str {
        "process"
    }

    async fn start(&mut self, cancel: CancellationToken) -> Result<(), BackendError> {
        self.spawn(&cancel)
    }

    async fn stop(&mut self, grace_period: Duration) -> Result<(), BackendError> {
        let termination = self.terminate(grace_period).await;
        debug!(?termination, "process backend stopped");
        Ok(())
    }
}

impl std::fmt::Debug for ProcessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessBackend")
            .field("path", &self.path)
            .field("pid", &self.pid)
            .field("running", &self.child.is_some())
            .finish()
    }
}

/// Own the child until it exits, killing it on request.
///
/// A dropped `kill` sender counts as a request, so the child never outlives
/// its backend.
async fn watch_exit(
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    stopping: CancellationToken,
    telemetry: Arc<Telemetry>,
) -> Option<ExitStatus> {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill_rx => {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "failed to kill L.O.C.K. kernel");
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) => {
            if !stopping.is_cancelled() {
                error!(%status, "L.O.C.K. kernel exited while enforcing");
                telemetry.set_backend_running(false);
            }
            Some(status)
        }
        Err(e) => {
            warn!(error = %e, "failed to wait for L.O.C.K. kernel");
            None
        }
    }
}

async fn terminate_child(child: &mut ChildHandle, grace: Duration) -> Termination {
    let pid = child.pid;

    if child.exit.is_finished() {
        return match (&mut child.exit).await.ok().flatten() {
            Some(status) => {
                info!(%status, "L.O.C.K. kernel already exited");
                Termination::AlreadyExited(status)
            }
            None => Termination::Lost,
        };
    }

    // The watcher has not reaped the child, so the PID still belongs to it
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => debug!(pid, "sent SIGTERM"),
        Err(Errno::ESRCH) => {
            // Exited between the check and kill; let the watcher reap it
            match tokio::time::timeout(grace, &mut child.exit).await {
                Ok(Ok(Some(status))) => {
                    info!(%status, "L.O.C.K. kernel already exited");
                    return Termination::AlreadyExited(status);
                }
                Ok(_) => return Termination::Lost,
                Err(_) => warn!(pid, "PID gone but exit watcher still waiting"),
            }
        }
        Err(errno) => warn!(pid, error = %errno, "failed to send SIGTERM"),
    }

    match tokio::time::timeout(grace, &mut child.exit).await {
        Ok(Ok(Some(status))) => {
            info!(%status, "L.O.C.K. kernel stopped gracefully");
            return Termination::Graceful(status);
        }
        Ok(_) => return Termination::Lost,
        Err(_) => {
            let timeout = BackendError::TerminationTimeout(grace);
            warn!(pid, error = %timeout, "escalating to SIGKILL");
        }
    }

    if let Some(kill_tx) = child.kill.take() {
        let _ = kill_tx.send(());
    }
    match (&mut child.exit).await {
        Ok(Some(status)) => info!(pid, %status, "L.O.C.K. kernel killed"),
        Ok(None) => warn!(pid, "L.O.C.K. kernel killed, exit status unknown"),
        Err(e) => warn!(pid, error = %e, "exit watcher failed"),
    }
    Termination::Killed
}

/// Echo the child's stdout and count block reports.
///
/// Output is handled as raw bytes: lines are echoed unchanged and matched on a
/// lossy decode. Runs until the child closes its end of the pipe; read and
/// echo failures are logged and draining continues.
async fn forward_output(stdout: ChildStdout, telemetry: Arc<Telemetry>) {
    let mut reader = BufReader::new(stdout);
    let mut out = tokio::io::stdout();
    let mut line = Vec::new();
    let mut echo_failed = false;
    let mut read_failed = false;

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => {
                debug!("L.O.C.K. kernel closed stdout");
                break;
            }
            Ok(_) => {
                read_failed = false;

                let text = String::from_utf8_lossy(&line);
                if let Some(label) = parse_block_line(text.trim_end()) {
                    telemetry.record_blocked(label);
                }

                let echoed = match out.write_all(&line).await {
                    Ok(()) => out.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = echoed {
                    if !echo_failed {
                        debug!(error = %e, "failed to echo L.O.C.K. kernel output");
                        echo_failed = true;
                    }
                }
            }
            Err(e) => {
                if !read_failed {
                    warn!(error = %e, "failed to read L.O.C.K. kernel output");
                    read_failed = true;
                }
                tokio::time::sleep(READ_RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry() -> Arc<Telemetry> {
        Arc::new(Telemetry::new().unwrap())
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let mut backend = ProcessBackend::new("/nonexistent/lock-kernel", telemetry());

        let err = backend.start(CancellationToken::new()).await.unwrap_err();
        match err {
            BackendError::Spawn { path, source } => {
                assert_eq!(path, PathBuf::from("/nonexistent/lock-kernel"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("expected Spawn error, got {other:?}"),
        }
        assert!(backend.pid().is_none());
    }

    #[tokio::test]
    async fn test_terminate_before_start() {
        let mut backend = ProcessBackend::new("/bin/true", telemetry());
        assert_eq!(
            backend.terminate(Duration::from_secs(1)).await,
            Termination::NotStarted
        );
    }

    #[tokio::test]
    async fn test_exited_child_is_not_signalled() {
        let mut backend = ProcessBackend::new("/bin/true", telemetry());
        backend.start(CancellationToken::new()).await.unwrap();
        assert!(backend.pid().is_some());

        // Give /bin/true time to exit on its own
        tokio::time::sleep(Duration::from_millis(300)).await;

        match backend.terminate(Duration::from_secs(5)).await {
            Termination::AlreadyExited(status) => assert!(status.success()),
            other => panic!("expected AlreadyExited, got {other:?}"),
        }

        // Second terminate has nothing left to do
        assert_eq!(
            backend.terminate(Duration::from_secs(5)).await,
            Termination::NotStarted
        );
    }

    #[tokio::test]
    async fn test_unexpected_exit_clears_running_gauge() {
        let telemetry = telemetry();
        telemetry.set_backend_running(true);
        let mut backend = ProcessBackend::new("/bin/true", Arc::clone(&telemetry));
        backend.start(CancellationToken::new()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!telemetry.snapshot().backend_running);

        backend.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_after_cancel_is_expected() {
        let telemetry = telemetry();
        telemetry.set_backend_running(true);
        let scope = CancellationToken::new();
        scope.cancel();
        let mut backend = ProcessBackend::new("/bin/true", Arc::clone(&telemetry));
        backend.start(scope).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(telemetry.snapshot().backend_running);

        backend.stop(Duration::from_secs(1)).await.unwrap();
    }
}
