//! lock-supervisor - lifecycle supervisor for the L.O.C.K. enforcement backend
//!
//! L.O.C.K. restricts a workload's ability to create processes and open
//! outbound connections. The blocking itself happens in an external artifact;
//! this crate starts it, watches it, stops it within a bounded time and
//! exposes what it reports as Prometheus metrics.
//!
//! # Modules
//!
//! - `supervisor` - Lifecycle state machine and uptime refresh
//! - `backend` - Process and kprobe enforcement backends
//! - `metrics` - Telemetry registry and HTTP exporter
//! - `config` - Launch configuration
//! - `tracing` - Logging and optional OTLP export
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use lock_supervisor::{ProcessBackend, Supervisor, Telemetry};
//! use tokio_util::sync::CancellationToken;
//!
//! let telemetry = Arc::new(Telemetry::new()?);
//! let supervisor = Supervisor::new(Arc::clone(&telemetry));
//!
//! let backend = ProcessBackend::new("/usr/local/bin/lock", Arc::clone(&telemetry));
//! supervisor.start(Box::new(backend), CancellationToken::new()).await?;
//! // ... wait for SIGINT / SIGTERM ...
//! supervisor.stop().await?;
//! ```

pub mod backend;
pub mod config;
pub mod metrics;
pub mod supervisor;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use backend::{Backend, BackendError, ProbeBackend, ProcessBackend, GRACE_PERIOD};
pub use metrics::{Telemetry, TelemetrySnapshot};
pub use supervisor::{Supervisor, SupervisorError, SupervisorState};
