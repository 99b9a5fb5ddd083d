pub mod code_buffer;
pub mod exec_mem;
pub mod helpers;
pub mod label;
pub mod regalloc;
pub mod translate;
pub mod x86_64;

use std::io;

use ee_core::{BasicBlock, CompileError, CpuState};

pub use code_buffer::CodeBuffer;
pub use exec_mem::ExecArena;
pub use regalloc::{allocate, Move, OpPlan, RegisterAllocation};
pub use translate::{clobbered_regs, translate, CompiledCode};
pub use x86_64::X86_64CodeGen;

/// Trait for host architecture code generators.
///
/// A backend emits two things: a trampoline that enters compiled code
/// with the host ABI set up, and the body of each translated block.
pub trait HostCodeGen {
    /// Emit the entry trampoline:
    /// `extern "C" fn(env: *mut CpuState, code: *const u8) -> u32`.
    /// Saves callee-saved registers, installs `env` in the
    /// environment register and calls `code`. The block's exit code
    /// is returned unchanged.
    fn emit_trampoline(&self, buf: &mut CodeBuffer);

    /// Emit host code for `block` under the register plan `alloc`.
    ///
    /// The code is position independent; it may be copied anywhere in
    /// executable memory before it runs.
    fn emit_block(
        &self,
        buf: &mut CodeBuffer,
        block: &BasicBlock,
        alloc: &RegisterAllocation,
    ) -> Result<(), CompileError>;
}

type EntryFn = unsafe extern "C" fn(*mut CpuState, *const u8) -> u32;

/// The entry trampoline, placed in its own executable mapping.
pub struct Trampoline {
    arena: ExecArena,
    entry: usize,
}

impl Trampoline {
    pub fn new(backend: &impl HostCodeGen) -> io::Result<Self> {
        let mut buf = CodeBuffer::new();
        backend.emit_trampoline(&mut buf);
        let mut arena = ExecArena::new(buf.offset())?;
        let entry = arena
            .alloc(buf.as_slice())
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "trampoline does not fit"))?;
        Ok(Self { arena, entry })
    }

    /// Run the block at `code` and return its raw exit code.
    ///
    /// # Safety
    /// `code` must point at a live block emitted by the same backend,
    /// and `env` at a `CpuState` whose `memory` is a live
    /// `GuestMemory`. Nothing else may touch `env` while the block runs.
    pub unsafe fn enter(&self, env: *mut CpuState, code: *const u8) -> u32 {
        let f: EntryFn = std::mem::transmute(self.arena.ptr_at(self.entry));
        f(env, code)
    }
}
