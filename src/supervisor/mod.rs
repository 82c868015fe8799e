//! Supervisor - drives one enforcement backend through its lifecycle
//!
//! The supervisor owns exactly one backend for the life of the process and is
//! the only caller of its `start`/`stop`. Lifecycle calls are serialized by an
//! async mutex and validated against the current [`SupervisorState`].
//!
//! While the backend is running, a background task refreshes the uptime gauge
//! once a second. That task is bound to a cancellation scope created at
//! `start` and cancelled at `stop`, so no timer outlives the backend.
//!
//! # Stop semantics
//!
//! `stop` is best effort and always terminal: backend errors are logged and the
//! supervisor still reaches `Stopped`. The backend gets `grace_period` to shut
//! down; if its own `stop` overruns `grace_period + STOP_DEADLINE_MARGIN` the
//! backend is dropped (releasing whatever it still holds) and the supervisor
//! lands in `Failed`.

mod state;

pub use state::SupervisorState;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendError, GRACE_PERIOD};
use crate::metrics::Telemetry;

/// Interval between uptime gauge refreshes.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Extra time a backend's `stop` gets beyond its grace period.
pub const STOP_DEADLINE_MARGIN: Duration = Duration::from_secs(2);

/// Errors returned by supervisor lifecycle calls
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The call is not valid in the current state
    #[error("cannot {operation} supervisor in state {state}")]
    InvalidState {
        operation: &'static str,
        state: SupervisorState,
    },

    /// The backend failed to start
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The backend's stop did not return in time and was abandoned
    #[error("backend stop exceeded its {0:?} deadline")]
    StopDeadline(Duration),
}

#[derive(Default)]
struct Lifecycle {
    backend: Option<Box<dyn Backend>>,
    scope: Option<CancellationToken>,
    refresh: Option<JoinHandle<()>>,
}

/// Supervises a single enforcement backend.
pub struct Supervisor {
    telemetry: Arc<Telemetry>,
    state: watch::Sender<SupervisorState>,
    lifecycle: Mutex<Lifecycle>,
    grace_period: Duration,
    refresh_interval: Duration,
}

impl Supervisor {
    /// Create an idle supervisor reporting into `telemetry`.
    pub fn new(telemetry: Arc<Telemetry>) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Self {
            telemetry,
            state,
            lifecycle: Mutex::new(Lifecycle::default()),
            grace_period: GRACE_PERIOD,
            refresh_interval: REFRESH_INTERVAL,
        }
    }

    /// Override the grace period given to the backend on stop.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Override the uptime refresh interval.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Current lifecycle state
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Watch lifecycle state changes
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SupervisorState) {
        let previous = self.state.send_replace(next);
        debug!(from = %previous, to = %next, "supervisor state changed");
    }

    /// Start `backend` and begin refreshing telemetry.
    ///
    /// Only valid from `Idle`. A backend error moves the supervisor to
    /// `Failed` and is returned as-is; there is no retry, since running
    /// without enforcement must never be tolerated silently.
    pub async fn start(
        &self,
        mut backend: Box<dyn Backend>,
        cancel: CancellationToken,
    ) -> Result<(), SupervisorError> {
        let mut lifecycle = self.lifecycle.lock().await;

        let current = self.state();
        if current != SupervisorState::Idle {
            return Err(SupervisorError::InvalidState {
                operation: "start",
                state: current,
            });
        }

        self.transition(SupervisorState::Starting);
        let kind = backend.kind();
        info!(backend = kind, "starting enforcement backend");

        let scope = cancel.child_token();
        if let Err(e) = backend.start(scope.clone()).await {
            scope.cancel();
            self.transition(SupervisorState::Failed);
            error!(backend = kind, error = %e, "enforcement backend failed to start");
            return Err(e.into());
        }

        let started_at = Instant::now();
        self.telemetry.set_uptime(0.0);
        self.telemetry.set_backend_running(true);

        lifecycle.backend = Some(backend);
        self.transition(SupervisorState::Running);

        // Spawned after the transition so the task observes Running
        lifecycle.refresh = Some(tokio::spawn(refresh_uptime(
            Arc::clone(&self.telemetry),
            started_at,
            self.refresh_interval,
            self.state.subscribe(),
            scope.clone(),
        )));
        lifecycle.scope = Some(scope);

        info!(backend = kind, "enforcement backend running");
        Ok(())
    }

    /// Stop the running backend.
    ///
    /// A no-op from `Idle`, `Stopped` and `Failed`, so repeated signals are
    /// harmless. Backend errors are logged, not returned.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let mut lifecycle = self.lifecycle.lock().await;

        let current = self.state();
        if current != SupervisorState::Running {
            debug!(state = %current, "stop ignored");
            return Ok(());
        }

        self.transition(SupervisorState::Stopping);

        if let Some(scope) = lifecycle.scope.take() {
            scope.cancel();
        }
        if let Some(refresh) = lifecycle.refresh.take() {
            if let Err(e) = refresh.await {
                warn!(error = %e, "uptime refresh task failed");
            }
        }

        self.telemetry.set_backend_running(false);

        let Some(mut backend) = lifecycle.backend.take() else {
            self.transition(SupervisorState::Stopped);
            return Ok(());
        };

        let kind = backend.kind();
        let deadline = self.grace_period + STOP_DEADLINE_MARGIN;
        info!(backend = kind, grace_period = ?self.grace_period, "stopping enforcement backend");

        let outcome = tokio::time::timeout(deadline, backend.stop(self.grace_period)).await;
        match outcome {
            Ok(Ok(())) => {
                info!(backend = kind, "enforcement backend stopped");
                self.transition(SupervisorState::Stopped);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(backend = kind, error = %e, "enforcement backend stopped with errors");
                self.transition(SupervisorState::Stopped);
                Ok(())
            }
            Err(_) => {
                error!(backend = kind, ?deadline, "enforcement backend did not stop in time, abandoning it");
                drop(backend);
                self.transition(SupervisorState::Failed);
                Err(SupervisorError::StopDeadline(deadline))
            }
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.state())
            .field("grace_period", &self.grace_period)
            .finish()
    }
}

/// Refresh the uptime gauge until cancelled or no longer `Running`.
async fn refresh_uptime(
    telemetry: Arc<Telemetry>,
    started_at: Instant,
    interval: Duration,
    mut state: watch::Receiver<SupervisorState>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() != SupervisorState::Running {
                    break;
                }
            }
            _ = ticker.tick() => {
                if *state.borrow() != SupervisorState::Running {
                    break;
                }
                telemetry.set_uptime(started_at.elapsed().as_secs_f64());
            }
        }
    }

    debug!("uptime refresh stopped");
}
