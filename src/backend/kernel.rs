//! aya implementation of the probe collection
//!
//! Loads the compiled probe object, attaches its programs as kprobes and reads
//! [`BlockEvent`] records from the `EVENTS` perf array.
//!
//! Requirements:
//! - Linux kernel 5.8+ with CONFIG_BPF_SYSCALL=y and CONFIG_KPROBES=y
//! - CAP_BPF and CAP_PERFMON capabilities (or root)
//! - Compiled with `--features ebpf`

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use aya::maps::{AsyncPerfEventArray, MapData};
use aya::programs::kprobe::KProbeLinkId;
use aya::programs::{KProbe, ProgramError};
use aya::util::online_cpus;
use aya::Bpf;
use aya_log::BpfLogger;
use bytes::BytesMut;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::BlockEvent;
use super::probe::{AttachFailure, ProbeCollection, ProbeLoader};
use crate::metrics::Telemetry;

/// Name of the perf event array the probe programs report into
const EVENTS_MAP: &str = "EVENTS";

/// Pages per CPU for the perf buffer
const PERF_BUFFER_PAGES: usize = 64;

/// Pause after a failed perf read
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Consecutive failed reads after which a CPU's reader gives up
const MAX_READ_ERRORS: u32 = 10;

/// Counts consecutive failed perf reads for one CPU.
#[derive(Debug, Default)]
struct ReadErrorBudget {
    consecutive: u32,
}

impl ReadErrorBudget {
    fn succeeded(&mut self) {
        self.consecutive = 0;
    }

    /// Record a failure; true once the reader should stop.
    fn exhausted_by_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= MAX_READ_ERRORS
    }
}

/// Loads probe objects with aya.
#[derive(Debug, Default, Clone, Copy)]
pub struct AyaLoader;

impl ProbeLoader for AyaLoader {
    type Collection = AyaCollection;

    fn load(&self, object: &Path) -> Result<AyaCollection, String> {
        let mut bpf = Bpf::load_file(object).map_err(|e| e.to_string())?;

        // Programs log through aya-log; not every object carries the map
        let logger = match BpfLogger::init(&mut bpf) {
            Ok(logger) => Some(logger),
            Err(e) => {
                debug!(error = %e, "eBPF logger not initialized");
                None
            }
        };

        Ok(AyaCollection {
            bpf,
            _logger: logger,
            events: None,
            readers: Vec::new(),
        })
    }
}

/// A loaded probe object and its background event readers.
pub struct AyaCollection {
    bpf: Bpf,
    _logger: Option<BpfLogger>,
    events: Option<AsyncPerfEventArray<MapData>>,
    readers: Vec<JoinHandle<()>>,
}

impl AyaCollection {
    fn kprobe(&mut self, program: &str) -> Result<&mut KProbe, AttachFailure> {
        self.bpf
            .program_mut(program)
            .ok_or(AttachFailure::ProgramNotFound)?
            .try_into()
            .map_err(|e: ProgramError| AttachFailure::Refused(e.to_string()))
    }
}

impl ProbeCollection for AyaCollection {
    type Link = KProbeLinkId;

    fn attach_kprobe(
        &mut self,
        program: &str,
        entry_point: &str,
    ) -> Result<KProbeLinkId, AttachFailure> {
        let kprobe = self.kprobe(program)?;

        kprobe
            .load()
            .map_err(|e| AttachFailure::Refused(format!("load: {}", e)))?;

        kprobe
            .attach(entry_point, 0)
            .map_err(|e| AttachFailure::Refused(e.to_string()))
    }

    fn detach_kprobe(&mut self, program: &str, link: KProbeLinkId) -> Result<(), String> {
        let kprobe = self.kprobe(program).map_err(|failure| match failure {
            AttachFailure::ProgramNotFound => format!("program {} not found", program),
            AttachFailure::Refused(reason) => reason,
        })?;

        kprobe.detach(link).map_err(|e| e.to_string())
    }

    fn start_event_reader(
        &mut self,
        telemetry: Arc<Telemetry>,
        cancel: CancellationToken,
    ) -> Result<(), String> {
        let map = self
            .bpf
            .take_map(EVENTS_MAP)
            .ok_or_else(|| format!("{} map not found", EVENTS_MAP))?;
        let mut events = AsyncPerfEventArray::try_from(map).map_err(|e| e.to_string())?;

        let cpus = online_cpus().map_err(|e| format!("Failed to get online CPUs: {}", e))?;

        for cpu_id in cpus {
            let mut buf = events
                .open(cpu_id, Some(PERF_BUFFER_PAGES))
                .map_err(|e| format!("Failed to open perf buffer: {}", e))?;

            let telemetry = Arc::clone(&telemetry);
            let cancel = cancel.clone();

            self.readers.push(tokio::spawn(async move {
                let mut buffers = (0..10)
                    .map(|_| BytesMut::with_capacity(BlockEvent::SIZE))
                    .collect::<Vec<_>>();
                let mut read_errors = ReadErrorBudget::default();

                loop {
                    let events = tokio::select! {
                        _ = cancel.cancelled() => break,
                        events = buf.read_events(&mut buffers) => events,
                    };

                    let events = match events {
                        Ok(events) => {
                            read_errors.succeeded();
                            events
                        }
                        Err(e) => {
                            if read_errors.exhausted_by_failure() {
                                error!(cpu_id, error = %e, "block event reader giving up");
                                break;
                            }
                            warn!(cpu_id, error = %e, "error reading block events");
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(READ_RETRY_DELAY) => {}
                            }
                            continue;
                        }
                    };

                    if events.lost > 0 {
                        warn!(cpu_id, lost = events.lost, "block events lost");
                    }

                    for record in buffers.iter().take(events.read) {
                        if let Some(event) = BlockEvent::from_bytes(record) {
                            debug!(pid = event.pid, uid = event.uid, syscall = event.syscall, "syscall blocked");
                            telemetry.record_blocked(&event.label());
                        }
                    }
                }
            }));
        }

        self.events = Some(events);
        info!(readers = self.readers.len(), "block event readers started");
        Ok(())
    }
}

impl Drop for AyaCollection {
    fn drop(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_gives_up_after_consecutive_failures() {
        let mut budget = ReadErrorBudget::default();
        for _ in 1..MAX_READ_ERRORS {
            assert!(!budget.exhausted_by_failure());
        }
        assert!(budget.exhausted_by_failure());
    }

    #[test]
    fn test_successful_read_resets_failures() {
        let mut budget = ReadErrorBudget::default();
        for _ in 1..MAX_READ_ERRORS {
            budget.exhausted_by_failure();
        }
        budget.succeeded();
        assert!(!budget.exhausted_by_failure());
    }
}
