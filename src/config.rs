//! Launch configuration
//!
//! Read once at startup from command-line flags, falling back to `LOCK_*`
//! environment variables and then to the defaults below.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Default path of the enforcement binary
pub const DEFAULT_KERNEL_PATH: &str = "/usr/local/bin/lock";

/// Default path of the compiled probe object
pub const DEFAULT_PROBE_OBJECT: &str = "/usr/local/lib/lock/lock.bpf.o";

/// Default port for the Prometheus exporter
pub const DEFAULT_METRICS_PORT: u16 = 9090;

/// Which enforcement backend to supervise
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Privileged enforcement binary run as a child process
    Process,
    /// kprobe programs loaded from a compiled object (requires `ebpf` feature)
    Probe,
}

/// Console log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "lock-supervisor")]
#[command(about = "Starts and supervises the L.O.C.K. syscall-blocking backend")]
#[command(version)]
pub struct Config {
    /// Enforcement backend to run
    #[arg(long, env = "LOCK_BACKEND", value_enum, default_value = "process")]
    pub backend: BackendKind,

    /// Path to L.O.C.K. kernel binary
    #[arg(long = "kernel", env = "LOCK_KERNEL_PATH", default_value = DEFAULT_KERNEL_PATH)]
    pub kernel_path: PathBuf,

    /// Path to the compiled probe object
    #[arg(long, env = "LOCK_PROBE_OBJECT", default_value = DEFAULT_PROBE_OBJECT)]
    pub probe_object: PathBuf,

    /// Port for Prometheus metrics
    #[arg(
        long = "port",
        env = "LOCK_METRICS_PORT",
        default_value_t = DEFAULT_METRICS_PORT,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub metrics_port: u16,

    /// OTLP endpoint for trace export (disabled when unset)
    #[arg(long, env = "LOCK_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Console log format
    #[arg(long, env = "LOCK_LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    /// Address the metrics exporter listens on
    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.metrics_port))
    }

    /// Artifact the selected backend loads
    pub fn artifact_path(&self) -> &PathBuf {
        match self.backend {
            BackendKind::Process => &self.kernel_path,
            BackendKind::Probe => &self.probe_object,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["lock-supervisor"]).unwrap();

        assert_eq!(config.backend, BackendKind::Process);
        assert_eq!(config.kernel_path, PathBuf::from(DEFAULT_KERNEL_PATH));
        assert_eq!(config.probe_object, PathBuf::from(DEFAULT_PROBE_OBJECT));
        assert_eq!(config.metrics_port, 9090);
        assert!(config.otlp_endpoint.is_none());
        assert!(!config.verbose);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.metrics_addr().to_string(), "0.0.0.0:9090");
    }

    #[test]
    fn test_flags() {
        let config = Config::try_parse_from([
            "lock-supervisor",
            "--backend",
            "probe",
            "--probe-object",
            "/tmp/lock.o",
            "--port",
            "9100",
            "--log-format",
            "json",
            "-v",
        ])
        .unwrap();

        assert_eq!(config.backend, BackendKind::Probe);
        assert_eq!(config.artifact_path(), &PathBuf::from("/tmp/lock.o"));
        assert_eq!(config.metrics_port, 9100);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.verbose);
    }

    #[test]
    fn test_kernel_flag_selects_binary() {
        let config =
            Config::try_parse_from(["lock-supervisor", "--kernel", "/opt/lock/bin/lock"]).unwrap();
        assert_eq!(config.artifact_path(), &PathBuf::from("/opt/lock/bin/lock"));
    }

    #[test]
    fn test_rejects_invalid_port() {
        assert!(Config::try_parse_from(["lock-supervisor", "--port", "0"]).is_err());
        assert!(Config::try_parse_from(["lock-supervisor", "--port", "70000"]).is_err());
        assert!(Config::try_parse_from(["lock-supervisor", "--backend", "wasm"]).is_err());
    }
}
