use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use lock_supervisor::backend;
use lock_supervisor::config::Config;
use lock_supervisor::metrics::server::{self, ExporterState};
use lock_supervisor::tracing::{init_tracing, shutdown_tracing};
use lock_supervisor::{Supervisor, Telemetry};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    if let Err(e) = init_tracing(
        "lock-supervisor",
        config.otlp_endpoint.as_deref(),
        config.log_format,
        config.verbose,
    ) {
        eprintln!("failed to initialize tracing: {e}");
        return ExitCode::FAILURE;
    }

    let code = match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    };

    shutdown_tracing();
    code
}

async fn run(config: Config) -> Result<()> {
    info!(
        backend = ?config.backend,
        artifact = %config.artifact_path().display(),
        metrics_addr = %config.metrics_addr(),
        "L.O.C.K. supervisor starting"
    );

    // SAFETY: geteuid has no preconditions
    if unsafe { libc::geteuid() } != 0 {
        warn!("not running as root, the enforcement backend will likely fail to start");
    }

    // 1. Install signal handlers before anything is spawned
    let mut signals = ShutdownSignals::install()?;

    // 2. Telemetry and supervisor
    let telemetry = Arc::new(Telemetry::new().context("failed to create telemetry registry")?);
    let supervisor = Supervisor::new(Arc::clone(&telemetry));
    let shutdown = CancellationToken::new();

    // 3. Start enforcement. Failure here is fatal.
    let enforcement = backend::from_config(&config, Arc::clone(&telemetry))
        .context("failed to build enforcement backend")?;
    supervisor
        .start(enforcement, shutdown.clone())
        .await
        .with_context(|| {
            format!(
                "failed to start enforcement from {}",
                config.artifact_path().display()
            )
        })?;

    // 4. Metrics exporter. Enforcement keeps running if it cannot bind.
    let addr = config.metrics_addr();
    let exporter_state = ExporterState {
        telemetry,
        supervisor: supervisor.subscribe(),
    };
    let exporter = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = server::serve(addr, exporter_state, shutdown).await {
                error!(%addr, error = %e, "metrics exporter unavailable");
            }
        }
    });

    // 5. Wait for SIGINT / SIGTERM
    let received = signals.recv().await;
    info!(signal = received, "shutdown requested");

    // 6. Tear down
    let stopped = supervisor.stop().await;
    shutdown.cancel();
    if let Err(e) = exporter.await {
        warn!(error = %e, "metrics exporter task failed");
    }

    stopped.context("enforcement backend did not stop cleanly")?;
    info!("L.O.C.K. supervisor exited");
    Ok(())
}

struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignals {
    fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?,
            terminate: signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}
