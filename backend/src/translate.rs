use ee_core::{BasicBlock, CompileError, GuestRegSet};
use tracing::debug;

use crate::code_buffer::CodeBuffer;
use crate::regalloc::allocate;
use crate::HostCodeGen;

/// Host code for one block, not yet placed in executable memory.
#[derive(Debug, Clone)]
pub struct CompiledCode {
    pub code: Vec<u8>,
    /// Values the allocator sent to the spill area.
    pub spills: usize,
    /// Guest registers the block may write, HI/LO included.
    pub clobbers: GuestRegSet,
}

/// Every guest value written by some instruction of `block`, whether
/// held in a host register or updated by a helper.
pub fn clobbered_regs(block: &BasicBlock) -> GuestRegSet {
    block.insns.iter().fold(GuestRegSet::EMPTY, |set, insn| {
        let u = insn.op.reg_uses();
        u.writes.iter().chain(u.env_writes.iter()).fold(set, GuestRegSet::insert)
    })
}

/// Full translation pipeline: register allocation, then emission.
pub fn translate(backend: &impl HostCodeGen, block: &BasicBlock) -> Result<CompiledCode, CompileError> {
    let alloc = allocate(block)?;
    let mut buf = CodeBuffer::with_capacity(block.insns.len() * 64 + 64);
    backend.emit_block(&mut buf, block, &alloc)?;
    let spills = alloc.spill_count();
    let clobbers = clobbered_regs(block);
    debug!(
        pc = format_args!("{:#010x}", block.start),
        insns = block.insns.len(),
        bytes = buf.offset(),
        spills,
        clobbers = clobbers.count(),
        "translated block"
    );
    Ok(CompiledCode {
        code: buf.into_vec(),
        spills,
        clobbers,
    })
}
