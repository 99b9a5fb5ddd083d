use thiserror::Error;

/// Failures of the guest memory model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemError {
    /// Nothing is mapped at the address.
    #[error("invalid guest address {addr:#010x}")]
    InvalidAddress { addr: u32 },
    #[error("write to read-only guest memory at {addr:#010x}")]
    ReadOnly { addr: u32 },
    #[error("region {base:#010x}+{size:#x} overlaps an existing mapping")]
    Overlap { base: u32, size: u32 },
    #[error("region {base:#010x}+{size:#x} is not page aligned or exceeds physical space")]
    BadRegion { base: u32, size: u32 },
    #[error("backing store exhausted: {requested:#x} bytes requested, {available:#x} left")]
    OutOfBacking { requested: usize, available: usize },
    #[error("host mmap of {size:#x} bytes failed (errno {errno})")]
    HostMap { size: usize, errno: i32 },
}

impl MemError {
    /// Guest address a fault should report in BadVAddr.
    pub fn fault_addr(&self) -> Option<u32> {
        match *self {
            Self::InvalidAddress { addr } | Self::ReadOnly { addr } => Some(addr),
            _ => None,
        }
    }
}

/// An internal translator bug. Never caused by guest behavior.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("compilation of block at {pc:#010x} failed: {reason}")]
pub struct CompileError {
    pub pc: u32,
    pub reason: String,
}

impl CompileError {
    pub fn new(pc: u32, reason: impl Into<String>) -> Self {
        Self {
            pc,
            reason: reason.into(),
        }
    }
}
