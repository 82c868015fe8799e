//! Integration tests for the process backend
//!
//! Each test runs a small shell script from `tests/fixtures/` in place of the
//! enforcement binary.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lock_supervisor::backend::{Backend, ProcessBackend, Termination};
use lock_supervisor::Telemetry;
use tokio_util::sync::CancellationToken;

fn fixture(name: &str) -> PathBuf {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn started(name: &str) -> (ProcessBackend, Arc<Telemetry>) {
    let telemetry = Arc::new(Telemetry::new().unwrap());
    let mut backend = ProcessBackend::new(fixture(name), Arc::clone(&telemetry));
    backend.start(CancellationToken::new()).await.unwrap();
    assert!(backend.pid().is_some());

    // Let the shell install its traps before it is signalled
    tokio::time::sleep(Duration::from_millis(200)).await;
    (backend, telemetry)
}

#[tokio::test]
async fn test_cooperative_binary_stops_on_sigterm() {
    let (mut backend, _) = started("cooperative.sh").await;

    let begin = Instant::now();
    let termination = backend.terminate(Duration::from_secs(5)).await;

    assert!(
        matches!(termination, Termination::Graceful(_)),
        "expected graceful stop, got {termination:?}"
    );
    assert!(begin.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_sigterm_ignoring_binary_is_killed_after_grace() {
    let (mut backend, _) = started("ignore_term.sh").await;
    let grace = Duration::from_millis(300);

    let begin = Instant::now();
    let termination = backend.terminate(grace).await;
    let elapsed = begin.elapsed();

    assert!(
        matches!(termination, Termination::Killed),
        "expected SIGKILL escalation, got {termination:?}"
    );
    assert!(elapsed >= grace);
    assert!(elapsed < grace + Duration::from_secs(2));
}

#[tokio::test]
async fn test_block_reports_are_counted() {
    let (mut backend, telemetry) = started("reports_blocks.sh").await;

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let blocked = telemetry.snapshot().blocked;
        if blocked.get("clone") == Some(&2) && blocked.get("connect") == Some(&1) {
            break;
        }
        assert!(Instant::now() < deadline, "block reports not counted: {blocked:?}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    backend.stop(Duration::from_secs(5)).await.unwrap();

    // Non-report lines are echoed only
    let blocked = telemetry.snapshot().blocked;
    assert_eq!(blocked.len(), 2);
    assert_eq!(blocked.values().sum::<u64>(), 3);
}

#[tokio::test]
async fn test_non_utf8_output_keeps_binary_alive() {
    let (mut backend, telemetry) = started("binary_output.sh").await;

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let blocked = telemetry.snapshot().blocked;
        if blocked.get("connect") == Some(&20) {
            break;
        }
        assert!(Instant::now() < deadline, "reports after raw bytes lost: {blocked:?}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(telemetry.snapshot().blocked.get("clone"), Some(&1));

    // Still running: terminate has to signal it
    let termination = backend.terminate(Duration::from_secs(5)).await;
    assert!(
        matches!(termination, Termination::Graceful(_)),
        "expected a live binary, got {termination:?}"
    );
}

#[tokio::test]
async fn test_stop_twice_is_harmless() {
    let (mut backend, _) = started("cooperative.sh").await;

    backend.stop(Duration::from_secs(5)).await.unwrap();
    backend.stop(Duration::from_secs(5)).await.unwrap();

    assert!(matches!(
        backend.terminate(Duration::from_secs(1)).await,
        Termination::NotStarted
    ));
}
