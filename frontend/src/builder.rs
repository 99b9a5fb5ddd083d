//! Block builder: walks guest code from an entry address and forms a
//! `BasicBlock`.

use std::collections::BTreeSet;

use ee_core::block::{page_of, BasicBlock, DecodedInsn, PageSnapshot, Terminator};
use ee_core::op::Operation;
use ee_core::{virt_to_phys, MemError, PAGE_MASK};
use ee_mem::GuestMemory;
use tracing::trace;

use crate::decode::decode;

/// Build progress, mirroring a disassembly context: the next PC to
/// decode and how many instructions have been taken so far.
struct BuildContext {
    pc_first: u32,
    pc_next: u32,
    num_insns: u32,
    max_insns: u32,
    insns: Vec<DecodedInsn>,
    pages: Vec<PageSnapshot>,
}

/// Forms basic blocks from guest memory.
pub struct BlockBuilder<'a> {
    memory: &'a GuestMemory,
    max_insns: u32,
    stop_points: Option<&'a BTreeSet<u32>>,
}

impl<'a> BlockBuilder<'a> {
    pub fn new(memory: &'a GuestMemory, max_insns: u32) -> Self {
        Self {
            memory,
            max_insns: max_insns.max(1),
            stop_points: None,
        }
    }

    /// End blocks before any of these addresses (breakpoints), so
    /// the dispatcher regains control exactly there.
    pub fn with_stop_points(mut self, points: &'a BTreeSet<u32>) -> Self {
        self.stop_points = Some(points);
        self
    }

    /// Fetch a word, marking its page as code first.
    fn fetch(&self, ctx: &mut BuildContext, addr: u32) -> Result<u32, MemError> {
        let page = page_of(virt_to_phys(addr));
        if !ctx.pages.iter().any(|p| p.page == page) {
            let version = self
                .memory
                .mark_code_page(page)
                .ok_or(MemError::InvalidAddress { addr })?;
            ctx.pages.push(PageSnapshot { page, version });
        }
        self.memory.fetch(addr)
    }

    fn push(ctx: &mut BuildContext, addr: u32, word: u32, op: Operation, in_delay_slot: bool) {
        ctx.insns.push(DecodedInsn {
            addr,
            word,
            op,
            in_delay_slot,
        });
        ctx.num_insns += 1;
        ctx.pc_next = addr.wrapping_add(4);
    }

    /// Decode sequentially from `entry` until a block terminator.
    ///
    /// Fails with `InvalidAddress` only when the entry itself cannot
    /// be fetched; later fetch faults are recorded in the terminator.
    pub fn build(&self, entry: u32) -> Result<BasicBlock, MemError> {
        let mut ctx = BuildContext {
            pc_first: entry,
            pc_next: entry,
            num_insns: 0,
            max_insns: self.max_insns,
            insns: Vec::new(),
            pages: Vec::new(),
        };
        let mut word = self.fetch(&mut ctx, entry)?;

        let terminator = loop {
            let pc = ctx.pc_next;
            let op = decode(word);
            Self::push(&mut ctx, pc, word, op, false);

            if op.has_delay_slot() {
                let slot = pc.wrapping_add(4);
                match self.fetch(&mut ctx, slot) {
                    Ok(w) => {
                        let mut slot_op = decode(w);
                        if !slot_op.allowed_in_delay_slot() {
                            slot_op = Operation::Reserved { word: w };
                        }
                        Self::push(&mut ctx, slot, w, slot_op, true);
                        break classify(&op);
                    }
                    Err(_) => {
                        ctx.insns.pop();
                        ctx.num_insns -= 1;
                        ctx.pc_next = pc;
                        break Terminator::FetchFault {
                            addr: slot,
                            branch_pc: Some(pc),
                        };
                    }
                }
            }
            if op.ends_block() {
                break classify(&op);
            }

            let next = pc.wrapping_add(4);
            if ctx.num_insns >= ctx.max_insns {
                break Terminator::Limit;
            }
            if next & PAGE_MASK == 0 {
                break Terminator::PageEnd;
            }
            if self.stop_points.is_some_and(|s| s.contains(&next)) {
                break Terminator::Limit;
            }
            match self.fetch(&mut ctx, next) {
                Ok(w) => word = w,
                Err(_) => {
                    break Terminator::FetchFault {
                        addr: next,
                        branch_pc: None,
                    }
                }
            }
        };

        trace!(
            pc = format_args!("{:#010x}", ctx.pc_first),
            insns = ctx.num_insns,
            ?terminator,
            "built block"
        );
        Ok(BasicBlock {
            start: ctx.pc_first,
            end: ctx.pc_next,
            insns: ctx.insns,
            terminator,
            pages: ctx.pages,
        })
    }
}

fn classify(op: &Operation) -> Terminator {
    match *op {
        Operation::Jump { link: true, .. }
        | Operation::JumpReg { link: Some(_), .. }
        | Operation::Branch { link: true, .. } => Terminator::Call,
        Operation::JumpReg { rs: 31, link: None } | Operation::Eret => Terminator::Return,
        Operation::Jump { .. } | Operation::JumpReg { .. } => Terminator::Jump,
        Operation::Branch { .. } | Operation::FpuBranch { .. } => Terminator::Branch,
        Operation::Ei | Operation::Di | Operation::Cop0Move { .. } => Terminator::System,
        _ => Terminator::Trap,
    }
}
