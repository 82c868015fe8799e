//! Prometheus telemetry for the enforcement backend
//!
//! The [`Telemetry`] registry is the one piece of state shared between the
//! supervisor, the active backend's event path and the HTTP exporter. Each
//! instance owns its own `prometheus::Registry`, so the binary creates exactly
//! one at startup and hands out `Arc<Telemetry>` clones, while tests build an
//! isolated registry per case.
//!
//! ```text
//! backend event path ──record_blocked("clone")──┐
//!                                               ▼
//! supervisor tick ─────set_uptime(secs)────► Telemetry ──encode()──► GET /metrics
//!                                               │
//!                                               └──snapshot()──────► GET /api/snapshot
//! ```

pub mod server;

use std::collections::BTreeMap;

use prometheus::core::Collector;
use prometheus::{Encoder, Gauge, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

/// Counter of blocked syscalls, labelled by syscall type.
pub const BLOCKED_SYSCALLS_METRIC: &str = "lock_blocked_syscalls_total";

/// Seconds since the active backend was started.
pub const UPTIME_METRIC: &str = "lock_kernel_uptime_seconds";

/// 1 while a backend is running, 0 otherwise.
pub const BACKEND_RUNNING_METRIC: &str = "lock_backend_running";

/// Error type for registry construction
#[derive(Debug, thiserror::Error)]
#[error("failed to register metric: {0}")]
pub struct MetricsError(#[from] prometheus::Error);

/// Point-in-time read of all counters and gauges.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    /// Blocked-syscall counts by syscall label
    pub blocked: BTreeMap<String, u64>,
    /// Backend uptime in seconds (stale once the backend has stopped)
    pub uptime_seconds: f64,
    /// Whether a backend is currently running
    pub backend_running: bool,
}

/// Counters and gauges for the enforcement backend.
pub struct Telemetry {
    registry: Registry,
    blocked_syscalls: IntCounterVec,
    uptime: Gauge,
    backend_running: IntGauge,
}

impl Telemetry {
    /// Create a registry with all metrics registered and zeroed.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let blocked_syscalls = IntCounterVec::new(
            Opts::new(BLOCKED_SYSCALLS_METRIC, "Total number of blocked syscalls by type"),
            &["syscall"],
        )?;
        let uptime = Gauge::new(UPTIME_METRIC, "Time since kernel was started")?;
        let backend_running = IntGauge::new(
            BACKEND_RUNNING_METRIC,
            "Whether an enforcement backend is running (1) or not (0)",
        )?;

        registry.register(Box::new(blocked_syscalls.clone()))?;
        registry.register(Box::new(uptime.clone()))?;
        registry.register(Box::new(backend_running.clone()))?;

        Ok(Self {
            registry,
            blocked_syscalls,
            uptime,
            backend_running,
        })
    }

    /// Count one blocked syscall of the given type.
    ///
    /// This is the single entry point backends use to report enforcement
    /// events. Safe to call concurrently from any task or thread.
    pub fn record_blocked(&self, syscall: &str) {
        self.blocked_syscalls.with_label_values(&[syscall]).inc();
    }

    /// Set the uptime gauge (seconds since backend start).
    pub fn set_uptime(&self, seconds: f64) {
        self.uptime.set(seconds);
    }

    /// Mark whether a backend is currently running.
    pub fn set_backend_running(&self, running: bool) {
        self.backend_running.set(i64::from(running));
    }

    /// Read the current values of every metric.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let mut blocked = BTreeMap::new();

        for family in self.blocked_syscalls.collect() {
            for metric in family.get_metric() {
                let label = metric
                    .get_label()
                    .iter()
                    .find(|pair| pair.get_name() == "syscall")
                    .map(|pair| pair.get_value().to_string());

                if let Some(label) = label {
                    blocked.insert(label, metric.get_counter().get_value() as u64);
                }
            }
        }

        TelemetrySnapshot {
            blocked,
            uptime_seconds: self.uptime.get(),
            backend_running: self.backend_running.get() == 1,
        }
    }

    /// Encode every registered metric in the Prometheus text format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
