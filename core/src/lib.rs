//! Shared vocabulary of the Emotion Engine recompiler: CPU state,
//! decoded operations, basic blocks, guest semantics, errors and
//! configuration.

pub mod block;
pub mod config;
pub mod cpu;
pub mod dump;
pub mod error;
pub mod op;
pub mod semantics;

pub use block::{BasicBlock, BlockExit, DecodedInsn, PageSnapshot, Terminator};
pub use config::{CacheConfig, CoreConfig, ExceptionPolicy, ExecMode, MachineConfig, MemoryConfig};
pub use cpu::{ArchState, CpuState, ExcCode, Gpr};
pub use error::{CompileError, MemError};
pub use op::{GuestReg, GuestRegSet, Operation, RegList, RegUses};

/// Guest page size used for code tracking and the page table.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u32 = PAGE_SIZE - 1;

/// Translate a guest virtual address to physical. There is no TLB:
/// every segment maps to the low 512 MiB by dropping the top three
/// bits.
#[inline]
pub const fn virt_to_phys(vaddr: u32) -> u32 {
    vaddr & 0x1FFF_FFFF
}
