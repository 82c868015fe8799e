//! Probe backend - kprobe programs attached to syscall entry points
//!
//! The backend loads a compiled program collection and attaches one kprobe per
//! entry in [`PROBES`], in table order. Teardown runs in strict reverse order:
//!
//! ```text
//! start:  load(object) ─► attach clone ─► attach connect ─► event reader
//! stop:                   detach clone ◄─ detach connect ◄─ (cancelled)
//!         release collection ◄┘
//! ```
//!
//! A failed attach unwinds every attachment already made before the error is
//! returned, so a failed start never leaves a kernel hook behind. A failed
//! detach is recorded and the remaining detaches still run.
//!
//! The kernel side is reached only through [`ProbeLoader`] and
//! [`ProbeCollection`]; the aya implementation lives in `backend::kernel`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Backend, BackendError, DetachFailure};
use crate::metrics::Telemetry;

#[cfg(target_arch = "aarch64")]
const SYSCALL_SYMBOL_PREFIX: &str = "__arm64_";
#[cfg(not(target_arch = "aarch64"))]
const SYSCALL_SYMBOL_PREFIX: &str = "__x64_";

/// One monitored syscall: which program to attach, and where.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSpec {
    /// Telemetry label for the syscall
    pub syscall: &'static str,
    /// Program name inside the collection
    pub program: &'static str,
    /// Kernel function, without the architecture prefix
    pub function: &'static str,
}

impl ProbeSpec {
    /// Kernel symbol to attach to on this architecture
    pub fn entry_point(&self) -> String {
        format!("{}{}", SYSCALL_SYMBOL_PREFIX, self.function)
    }
}

/// Monitored syscalls, in attachment order.
pub static PROBES: [ProbeSpec; 2] = [
    ProbeSpec {
        syscall: "clone",
        program: "lock_clone",
        function: "sys_clone",
    },
    ProbeSpec {
        syscall: "connect",
        program: "lock_connect",
        function: "sys_connect",
    },
];

/// Why a single attach failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachFailure {
    /// No program with that name in the collection
    ProgramNotFound,
    /// The kernel refused the program or the attachment
    Refused(String),
}

/// A loaded program/map collection.
pub trait ProbeCollection: Send {
    /// Handle to one attachment, consumed by `detach_kprobe`
    type Link: Send;

    /// Resolve `program` and attach it as a kprobe on `entry_point`.
    fn attach_kprobe(&mut self, program: &str, entry_point: &str)
        -> Result<Self::Link, AttachFailure>;

    /// Detach a link previously returned by `attach_kprobe`.
    fn detach_kprobe(&mut self, program: &str, link: Self::Link) -> Result<(), String>;

    /// Start forwarding block events into `telemetry` until `cancel` fires.
    ///
    /// Collections without an event channel keep the default no-op.
    fn start_event_reader(
        &mut self,
        _telemetry: Arc<Telemetry>,
        _cancel: CancellationToken,
    ) -> Result<(), String> {
        Ok(())
    }
}

/// Loads a collection from a compiled object file.
pub trait ProbeLoader: Send {
    type Collection: ProbeCollection;

    fn load(&self, object: &Path) -> Result<Self::Collection, String>;
}

struct Attachment<K> {
    spec: &'static ProbeSpec,
    entry_point: String,
    link: K,
}

type LinkOf<L> = <<L as ProbeLoader>::Collection as ProbeCollection>::Link;

/// Enforces by attaching kprobe programs from a compiled collection.
pub struct ProbeBackend<L: ProbeLoader> {
    loader: L,
    object: PathBuf,
    telemetry: Arc<Telemetry>,
    collection: Option<L::Collection>,
    attachments: Vec<Attachment<LinkOf<L>>>,
}

impl<L: ProbeLoader> ProbeBackend<L> {
    pub fn new(loader: L, object: impl Into<PathBuf>, telemetry: Arc<Telemetry>) -> Self {
        Self {
            loader,
            object: object.into(),
            telemetry,
            collection: None,
            attachments: Vec::new(),
        }
    }

    /// Syscall labels currently attached, in attachment order
    pub fn attached(&self) -> Vec<&'static str> {
        self.attachments.iter().map(|a| a.spec.syscall).collect()
    }

    fn attach_all(
        collection: &mut L::Collection,
    ) -> Result<Vec<Attachment<LinkOf<L>>>, BackendError> {
        let mut attached = Vec::with_capacity(PROBES.len());

        for spec in PROBES.iter() {
            let entry_point = spec.entry_point();
            match collection.attach_kprobe(spec.program, &entry_point) {
                Ok(link) => {
                    info!(program = spec.program, %entry_point, "kprobe attached");
                    attached.push(Attachment {
                        spec,
                        entry_point,
                        link,
                    });
                }
                Err(failure) => {
                    let err = match failure {
                        AttachFailure::ProgramNotFound => BackendError::ProgramNotFound {
                            program: spec.program.to_string(),
                        },
                        AttachFailure::Refused(reason) => BackendError::Attach {
                            program: spec.program.to_string(),
                            entry_point,
                            reason,
                        },
                    };
                    error!(error = %err, rollback = attached.len(), "kprobe attach failed");

                    let failures = detach_all(collection, attached);
                    if !failures.is_empty() {
                        warn!(
                            error = %BackendError::Detach(failures),
                            "rollback left probes attached"
                        );
                    }
                    return Err(err);
                }
            }
        }

        Ok(attached)
    }
}

/// Detach in reverse acquisition order, attempting every attachment.
fn detach_all<C: ProbeCollection>(
    collection: &mut C,
    attachments: Vec<Attachment<C::Link>>,
) -> Vec<DetachFailure> {
    let mut failures = Vec::new();

    for attachment in attachments.into_iter().rev() {
        let Attachment {
            spec,
            entry_point,
            link,
        } = attachment;

        match collection.detach_kprobe(spec.program, link) {
            Ok(()) => debug!(program = spec.program, %entry_point, "kprobe detached"),
            Err(reason) => {
                warn!(program = spec.program, %entry_point, %reason, "kprobe detach failed");
                failures.push(DetachFailure {
                    syscall: spec.syscall,
                    entry_point,
                    reason,
                });
            }
        }
    }

    failures
}

#[async_trait]
impl<L> Backend for ProbeBackend<L>
where
    L: ProbeLoader,
    L::Collection: Send,
{
    fn kind(&self) -> &'static str {
        "probe"
    }

    async fn start(&mut self, cancel: CancellationToken) -> Result<(), BackendError> {
        let mut collection = self
            .loader
            .load(&self.object)
            .map_err(|reason| BackendError::Load {
                path: self.object.clone(),
                reason,
            })?;
        info!(object = %self.object.display(), "probe collection loaded");

        // On failure the collection is dropped here, after the rollback
        let attachments = Self::attach_all(&mut collection)?;

        if let Err(reason) =
            collection.start_event_reader(Arc::clone(&self.telemetry), cancel)
        {
            warn!(%reason, "block events will not be counted");
        }

        self.attachments = attachments;
        self.collection = Some(collection);
        Ok(())
    }

    async fn stop(&mut self, _grace_period: Duration) -> Result<(), BackendError> {
        let Some(mut collection) = self.collection.take() else {
            return Ok(());
        };

        let attachments = std::mem::take(&mut self.attachments);
        let failures = detach_all(&mut collection, attachments);

        drop(collection);
        info!(object = %self.object.display(), "probe collection released");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BackendError::Detach(failures))
        }
    }
}

impl<L: ProbeLoader> Drop for ProbeBackend<L> {
    fn drop(&mut self) {
        if let Some(mut collection) = self.collection.take() {
            let attachments = std::mem::take(&mut self.attachments);
            let _ = detach_all(&mut collection, attachments);
        }
    }
}

impl<L: ProbeLoader> std::fmt::Debug for ProbeBackend<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeBackend")
            .field("object", &self.object)
            .field("attached", &self.attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory stand-in for the kernel side of a collection
    #[derive(Default)]
    struct FakeKernel {
        missing_programs: Vec<&'static str>,
        refuse_attach: Vec<&'static str>,
        refuse_detach: Vec<&'static str>,
        fail_load: bool,
        attached: Vec<String>,
        detached: Vec<String>,
        released: bool,
        readers: usize,
    }

    struct FakeLoader(Arc<Mutex<FakeKernel>>);

    struct FakeCollection(Arc<Mutex<FakeKernel>>);

    impl ProbeLoader for FakeLoader {
        type Collection = FakeCollection;

        fn load(&self, _object: &Path) -> Result<FakeCollection, String> {
            if self.0.lock().unwrap().fail_load {
                return Err("invalid ELF header".to_string());
            }
            Ok(FakeCollection(Arc::clone(&self.0)))
        }
    }

    impl ProbeCollection for FakeCollection {
        type Link = String;

        fn attach_kprobe(
            &mut self,
            program: &str,
            entry_point: &str,
        ) -> Result<String, AttachFailure> {
            let mut kernel = self.0.lock().unwrap();
            if kernel.missing_programs.iter().any(|p| *p == program) {
                return Err(AttachFailure::ProgramNotFound);
            }
            if kernel.refuse_attach.iter().any(|p| *p == program) {
                return Err(AttachFailure::Refused("EPERM".to_string()));
            }
            kernel.attached.push(entry_point.to_string());
            Ok(entry_point.to_string())
        }

        fn detach_kprobe(&mut self, program: &str, link: String) -> Result<(), String> {
            let mut kernel = self.0.lock().unwrap();
            if kernel.refuse_detach.iter().any(|p| *p == program) {
                return Err("EBUSY".to_string());
            }
            kernel.attached.retain(|entry| entry != &link);
            kernel.detached.push(link);
            Ok(())
        }

        fn start_event_reader(
            &mut self,
            _telemetry: Arc<Telemetry>,
            _cancel: CancellationToken,
        ) -> Result<(), String> {
            self.0.lock().unwrap().readers += 1;
            Ok(())
        }
    }

    impl Drop for FakeCollection {
        fn drop(&mut self) {
            self.0.lock().unwrap().released = true;
        }
    }

    fn backend(kernel: FakeKernel) -> (ProbeBackend<FakeLoader>, Arc<Mutex<FakeKernel>>) {
        let kernel = Arc::new(Mutex::new(kernel));
        let telemetry = Arc::new(Telemetry::new().unwrap());
        let backend = ProbeBackend::new(
            FakeLoader(Arc::clone(&kernel)),
            "/usr/local/lib/lock/lock.bpf.o",
            telemetry,
        );
        (backend, kernel)
    }

    fn entry(function: &str) -> String {
        format!("{}{}", SYSCALL_SYMBOL_PREFIX, function)
    }

    #[test]
    fn test_entry_points() {
        assert_eq!(PROBES[0].entry_point(), entry("sys_clone"));
        assert_eq!(PROBES[1].entry_point(), entry("sys_connect"));
    }

    #[tokio::test]
    async fn test_start_attaches_in_table_order() {
        let (mut backend, kernel) = backend(FakeKernel::default());

        backend.start(CancellationToken::new()).await.unwrap();

        let kernel = kernel.lock().unwrap();
        assert_eq!(kernel.attached, vec![entry("sys_clone"), entry("sys_connect")]);
        assert_eq!(kernel.readers, 1);
        assert!(!kernel.released);
        drop(kernel);
        assert_eq!(backend.attached(), vec!["clone", "connect"]);
    }

    #[tokio::test]
    async fn test_stop_detaches_in_reverse_order() {
        let (mut backend, kernel) = backend(FakeKernel::default());
        backend.start(CancellationToken::new()).await.unwrap();

        backend.stop(Duration::from_secs(5)).await.unwrap();

        let kernel = kernel.lock().unwrap();
        assert!(kernel.attached.is_empty());
        assert_eq!(kernel.detached, vec![entry("sys_connect"), entry("sys_clone")]);
        assert!(kernel.released);
    }

    #[tokio::test]
    async fn test_missing_program_rolls_back() {
        let (mut backend, kernel) = backend(FakeKernel {
            missing_programs: vec!["lock_connect"],
            ..Default::default()
        });

        let err = backend.start(CancellationToken::new()).await.unwrap_err();
        match err {
            BackendError::ProgramNotFound { program } => assert_eq!(program, "lock_connect"),
            other => panic!("expected ProgramNotFound, got {other:?}"),
        }

        let kernel = kernel.lock().unwrap();
        assert!(kernel.attached.is_empty(), "no kprobe may stay attached");
        assert_eq!(kernel.detached, vec![entry("sys_clone")]);
        assert!(kernel.released);
        assert_eq!(kernel.readers, 0);
        drop(kernel);
        assert!(backend.attached().is_empty());
    }

    #[tokio::test]
    async fn test_refused_attach_is_attach_error() {
        let (mut backend, kernel) = backend(FakeKernel {
            refuse_attach: vec!["lock_clone"],
            ..Default::default()
        });

        let err = backend.start(CancellationToken::new()).await.unwrap_err();
        match err {
            BackendError::Attach {
                program,
                entry_point,
                reason,
            } => {
                assert_eq!(program, "lock_clone");
                assert_eq!(entry_point, entry("sys_clone"));
                assert_eq!(reason, "EPERM");
            }
            other => panic!("expected Attach error, got {other:?}"),
        }
        assert!(kernel.lock().unwrap().attached.is_empty());
    }

    #[tokio::test]
    async fn test_load_failure() {
        let (mut backend, kernel) = backend(FakeKernel {
            fail_load: true,
            ..Default::default()
        });

        let err = backend.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BackendError::Load { .. }));
        assert!(err.to_string().contains("lock.bpf.o"));
        assert!(kernel.lock().unwrap().attached.is_empty());
    }

    #[tokio::test]
    async fn test_failed_detach_does_not_stop_the_rest() {
        let (mut backend, kernel) = backend(FakeKernel {
            refuse_detach: vec!["lock_connect"],
            ..Default::default()
        });
        backend.start(CancellationToken::new()).await.unwrap();

        let err = backend.stop(Duration::from_secs(5)).await.unwrap_err();
        match err {
            BackendError::Detach(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].syscall, "connect");
                assert_eq!(failures[0].entry_point, entry("sys_connect"));
                assert_eq!(failures[0].reason, "EBUSY");
            }
            other => panic!("expected Detach error, got {other:?}"),
        }

        let kernel = kernel.lock().unwrap();
        // connect was attempted first and refused, clone still detached
        assert_eq!(kernel.detached, vec![entry("sys_clone")]);
        assert_eq!(kernel.attached, vec![entry("sys_connect")]);
        assert!(kernel.released);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let (mut backend, kernel) = backend(FakeKernel::default());

        backend.stop(Duration::from_secs(5)).await.unwrap();

        let kernel = kernel.lock().unwrap();
        assert!(kernel.detached.is_empty());
        assert!(!kernel.released);
    }

    #[tokio::test]
    async fn test_drop_releases_attachments() {
        let (mut backend, kernel) = backend(FakeKernel::default());
        backend.start(CancellationToken::new()).await.unwrap();

        drop(backend);

        let kernel = kernel.lock().unwrap();
        assert!(kernel.attached.is_empty());
        assert!(kernel.released);
    }
}
