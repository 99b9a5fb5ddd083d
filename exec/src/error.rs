use std::io;

use ee_core::{CompileError, MemError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// Every block that could make room is pinned.
    #[error("translation cache full: {needed:#x} code bytes requested, {pinned} blocks pinned")]
    CapacityExceeded { needed: usize, pinned: usize },
    /// A page the block was decoded from changed before insertion.
    #[error("block at {pc:#010x} is stale: page {page:#x} changed while it was compiled")]
    StaleBlock { pc: u32, page: u32 },
    #[error("translation cache corrupted: {0}")]
    Corrupted(String),
    #[error("cannot map executable memory: {0}")]
    Arena(#[from] io::Error),
}

/// Errors that stop an emulated core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Mem(#[from] MemError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("block at {pc:#010x} returned unknown exit code {raw}")]
    BadExit { pc: u32, raw: u32 },
    #[error("exception exit at {pc:#010x} carries unknown code {code}")]
    BadExceptionCode { pc: u32, code: u32 },
}
