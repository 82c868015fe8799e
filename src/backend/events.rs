//! Block events reported by enforcement backends
//!
//! Both backends report "a syscall was blocked" back into the telemetry
//! registry, each through its own channel:
//!
//! - the enforcement binary prints one line per block on stdout, of the form
//!   `BLOCKED syscall=<label> [key=value ...]`
//! - the probe programs push a [`BlockEvent`] into the `EVENTS` perf array

/// Prefix marking a block report in the enforcement binary's stdout.
const BLOCK_LINE_PREFIX: &str = "BLOCKED";

/// Perf event record emitted by the probe programs (must match kernel layout)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEvent {
    pub pid: u32,
    pub uid: u32,
    pub syscall: u32,
    pub timestamp: u64,
}

impl BlockEvent {
    /// Size of one record in the perf buffer
    pub const SIZE: usize = std::mem::size_of::<BlockEvent>();

    /// Decode a record read from the perf buffer.
    ///
    /// Returns `None` if the buffer is too short to hold a full record.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        // SAFETY: length checked above and BlockEvent is plain old data.
        Some(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const BlockEvent) })
    }

    /// Telemetry label for this event's syscall.
    pub fn label(&self) -> String {
        syscall_label(self.syscall)
    }
}

/// Convert a syscall number to its label (Linux x86_64 numbering)
pub fn syscall_label(nr: u32) -> String {
    match nr {
        41 => "socket".to_string(),
        42 => "connect".to_string(),
        56 => "clone".to_string(),
        57 => "fork".to_string(),
        58 => "vfork".to_string(),
        59 => "execve".to_string(),
        322 => "execveat".to_string(),
        435 => "clone3".to_string(),
        _ => format!("syscall_{}", nr),
    }
}

/// Extract the syscall label from a block report line.
///
/// Accepts `BLOCKED syscall=connect pid=42` and ignores anything else.
pub fn parse_block_line(line: &str) -> Option<&str> {
    let mut fields = line.split_whitespace();
    if fields.next()? != BLOCK_LINE_PREFIX {
        return None;
    }

    fields
        .filter_map(|field| field.strip_prefix("syscall="))
        .find(|label| !label.is_empty())
}
