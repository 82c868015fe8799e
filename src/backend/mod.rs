//! Enforcement backends for L.O.C.K.
//!
//! A backend is whatever actually blocks syscalls. Two structurally different
//! kinds exist and both implement [`Backend`]:
//!
//! - **Process** ([`ProcessBackend`]): the privileged enforcement binary, run
//!   as a child process and terminated SIGTERM-first, SIGKILL on timeout.
//! - **Probe** ([`ProbeBackend`]): kprobe programs loaded from a compiled
//!   object and attached to syscall entry points.
//!
//! ```text
//!              ┌──────────────┐
//!              │  Supervisor  │  start() / stop(grace)
//!              └──────┬───────┘
//!                     │ Box<dyn Backend>
//!          ┌──────────┴───────────┐
//!          ▼                      ▼
//!   ProcessBackend          ProbeBackend<L>
//!   child process           collection + kprobe links
//!          │                      │
//!          └────► Telemetry::record_blocked(label) ◄────┘
//! ```
//!
//! The supervisor never inspects which kind it is driving.

pub mod events;
pub mod probe;
pub mod process;

#[cfg(feature = "ebpf")]
pub mod kernel;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{BackendKind, Config};
use crate::metrics::Telemetry;

pub use probe::{ProbeBackend, ProbeCollection, ProbeLoader, ProbeSpec, PROBES};
pub use process::{ProcessBackend, Termination, ACTIVATION_ARGS};

/// Time a backend gets to shut down cooperatively before being forced.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Lifecycle contract shared by every enforcement backend.
///
/// `start` and `stop` are only ever called serially by the supervisor, at
/// most once each per backend instance.
#[async_trait]
pub trait Backend: Send {
    /// Short name used in logs ("process", "probe").
    fn kind(&self) -> &'static str;

    /// Acquire backend resources and begin enforcing.
    ///
    /// Background work the backend spawns (event readers) must stop when
    /// `cancel` fires. On error no resource may remain acquired.
    async fn start(&mut self, cancel: CancellationToken) -> Result<(), BackendError>;

    /// Release every resource acquired by `start`, best effort.
    ///
    /// Must return within roughly `grace_period`. Errors are reported but
    /// the backend is considered stopped regardless.
    async fn stop(&mut self, grace_period: Duration) -> Result<(), BackendError>;
}

/// Build the backend selected by `config`.
///
/// Fails with `Unsupported` when the probe backend is requested from a build
/// without the `ebpf` feature.
pub fn from_config(
    config: &Config,
    telemetry: Arc<Telemetry>,
) -> Result<Box<dyn Backend>, BackendError> {
    match config.backend {
        BackendKind::Process => Ok(Box::new(ProcessBackend::new(
            config.kernel_path.clone(),
            telemetry,
        ))),
        BackendKind::Probe => probe_backend(config, telemetry),
    }
}

#[cfg(feature = "ebpf")]
fn probe_backend(
    config: &Config,
    telemetry: Arc<Telemetry>,
) -> Result<Box<dyn Backend>, BackendError> {
    Ok(Box::new(ProbeBackend::new(
        kernel::AyaLoader,
        config.probe_object.clone(),
        telemetry,
    )))
}

#[cfg(not(feature = "ebpf"))]
fn probe_backend(
    _config: &Config,
    _telemetry: Arc<Telemetry>,
) -> Result<Box<dyn Backend>, BackendError> {
    Err(BackendError::Unsupported(
        "probe backend requires building with --features ebpf".to_string(),
    ))
}

/// One attachment that could not be detached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachFailure {
    /// Syscall label of the attachment (e.g. "connect")
    pub syscall: &'static str,
    /// Kernel entry point the program was attached to
    pub entry_point: String,
    /// Reason reported by the kernel
    pub reason: String,
}

impl std::fmt::Display for DetachFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.syscall, self.entry_point, self.reason)
    }
}

/// Errors raised by backend lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The enforcement binary could not be spawned
    #[error("failed to start enforcement binary {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The probe object could not be loaded into the kernel
    #[error("failed to load probe object {}: {reason}", .path.display())]
    Load { path: PathBuf, reason: String },

    /// A required program is missing from the loaded collection
    #[error("program {program} not found in probe collection")]
    ProgramNotFound { program: String },

    /// The kernel refused to attach a program
    #[error("failed to attach {program} to {entry_point}: {reason}")]
    Attach {
        program: String,
        entry_point: String,
        reason: String,
    },

    /// One or more attachments could not be detached
    #[error("failed to detach {} probe(s): {}", .0.len(), join_failures(.0))]
    Detach(Vec<DetachFailure>),

    /// The backend did not exit within its grace period
    #[error("backend did not exit within {0:?}")]
    TerminationTimeout(Duration),

    /// The requested backend was not compiled in
    #[error("{0}")]
    Unsupported(String),
}

fn join_failures(failures: &[DetachFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
