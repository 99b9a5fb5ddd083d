use ee_core::block::{BasicBlock, BlockExit, Terminator};
use ee_core::cpu::{self, cop0, fcr31, ExcCode, FCR0_VALUE};
use ee_core::op::{
    branch_target, jump_target, AluImmOp, AluOp, BranchCond, CondMoveOp, Cop0Op, FpuMoveOp,
    GuestReg, HiLoOp, LoadOp, MulDivOp, Operation, ShiftOp, ShiftVarOp, StoreOp,
};
use ee_core::semantics::simm;
use ee_core::CompileError;

use crate::code_buffer::CodeBuffer;
use crate::helpers;
use crate::label::{LabelId, Labels, RelocKind};
use crate::regalloc::{Move, OpPlan, RegisterAllocation};
use crate::x86_64::emitter::*;
use crate::x86_64::regs::{Reg, CALLEE_SAVED, CALL_ARG_REGS, ENV, SCRATCH0, SCRATCH1, SCRATCH2};
use crate::HostCodeGen;

/// x86-64 backend code generator.
///
/// Blocks are entered through a trampoline,
/// `extern "C" fn(env: *mut CpuState, code: *const u8) -> u32`, which
/// saves the callee-saved registers, points RBP at the CPU state and
/// calls the block. A block returns its `BlockExit` in EAX with the
/// next guest PC stored in `CpuState::pc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct X86_64CodeGen;

impl X86_64CodeGen {
    pub fn new() -> Self {
        Self
    }
}

impl HostCodeGen for X86_64CodeGen {
    fn emit_trampoline(&self, buf: &mut CodeBuffer) {
        for &reg in CALLEE_SAVED {
            emit_push(buf, reg);
        }
        // mov rbp, rdi (first argument)
        emit_mov_rr(buf, true, ENV, CALL_ARG_REGS[0]);
        // Six pushes on top of the return address leave RSP 16-byte
        // aligned minus 8, so the call below enters the block with
        // the ABI alignment helpers expect.
        emit_call_reg(buf, CALL_ARG_REGS[1]);
        for &reg in CALLEE_SAVED.iter().rev() {
            emit_pop(buf, reg);
        }
        emit_ret(buf);
    }

    fn emit_block(
        &self,
        buf: &mut CodeBuffer,
        block: &BasicBlock,
        alloc: &RegisterAllocation,
    ) -> Result<(), CompileError> {
        if alloc.steps.len() != block.insns.len() {
            return Err(CompileError::new(
                block.start,
                "allocation does not match block length",
            ));
        }
        let mut e = BlockEmitter {
            buf,
            block,
            alloc,
            labels: Labels::default(),
            stubs: Vec::new(),
        };
        e.emit_body()?;
        e.emit_stubs();
        e.resolve_labels()
    }
}

/// Out-of-line exit paths, emitted after the block body.
#[derive(Debug, Clone, Copy)]
enum StubKind {
    /// A guest exception. `code` is set for exceptions raised inline;
    /// helpers record their own.
    Fault { code: Option<ExcCode> },
    /// Branch-likely not taken: skip the delay slot.
    LikelySkip,
    /// A store invalidated this block.
    CodeModified,
}

struct Stub {
    label: LabelId,
    insn: usize,
    kind: StubKind,
}

struct BlockEmitter<'a> {
    buf: &'a mut CodeBuffer,
    block: &'a BasicBlock,
    alloc: &'a RegisterAllocation,
    labels: Labels,
    stubs: Vec<Stub>,
}

fn branch_cond(cond: BranchCond) -> X86Cond {
    match cond {
        BranchCond::Eq => X86Cond::Je,
        BranchCond::Ne => X86Cond::Jne,
        BranchCond::Lez => X86Cond::Jle,
        BranchCond::Gtz => X86Cond::Jg,
        BranchCond::Ltz => X86Cond::Jl,
        BranchCond::Gez => X86Cond::Jge,
    }
}

fn off(o: usize) -> i32 {
    o as i32
}

impl<'a> BlockEmitter<'a> {
    fn plan(&self, i: usize) -> &'a OpPlan {
        &self.alloc.steps[i]
    }

    fn err(&self, i: usize, reason: impl Into<String>) -> CompileError {
        let pc = self.block.insns.get(i).map_or(self.block.start, |x| x.addr);
        CompileError::new(pc, reason)
    }

    fn host(&self, i: usize, g: GuestReg) -> Result<Reg, CompileError> {
        self.plan(i)
            .host(g)
            .ok_or_else(|| self.err(i, format!("{g} has no host register")))
    }

    // -- Labels and stubs --

    fn stub(&mut self, insn: usize, kind: StubKind) -> LabelId {
        let label = self.labels.new_label();
        self.stubs.push(Stub { label, insn, kind });
        label
    }

    fn jump_to(&mut self, cond: Option<X86Cond>, label: LabelId) {
        let at = match cond {
            Some(c) => emit_jcc_rel32(self.buf, c),
            None => emit_jmp_rel32(self.buf),
        };
        self.labels.add_use(label, at, RelocKind::Rel32);
    }

    fn fault_if(&mut self, i: usize, cond: Option<X86Cond>, code: Option<ExcCode>) {
        let l = self.stub(i, StubKind::Fault { code });
        self.jump_to(cond, l);
    }

    /// Branch to a fault exit if the last helper recorded one.
    fn check_fault_pending(&mut self, i: usize) {
        emit_arith_mi(self.buf, ArithOp::Cmp, ENV, off(cpu::FAULT_PENDING_OFFSET), 0);
        self.fault_if(i, Some(X86Cond::Jne), None);
    }

    fn resolve_labels(&mut self) -> Result<(), CompileError> {
        let mut patches = Vec::new();
        for (id, label) in self.labels.iter() {
            let target = match label.value {
                Some(v) => v,
                None if label.uses.is_empty() => continue,
                None => {
                    return Err(CompileError::new(
                        self.block.start,
                        format!("label {} used but never placed", id.0),
                    ))
                }
            };
            for u in &label.uses {
                match u.kind {
                    RelocKind::Rel32 => {
                        let disp = target as i64 - (u.offset as i64 + 4);
                        patches.push((u.offset, disp as i32 as u32));
                    }
                }
            }
        }
        for (at, v) in patches {
            self.buf.patch_u32(at, v);
        }
        Ok(())
    }

    // -- Moves and operand access --

    fn emit_move(&mut self, m: Move) {
        match m {
            Move::LoadHome { guest, reg } => {
                emit_load(self.buf, true, reg, ENV, off(guest.home_offset()))
            }
            Move::Reload { guest, reg } => emit_load(
                self.buf,
                true,
                reg,
                ENV,
                off(cpu::spill_offset(guest.spill_slot())),
            ),
            Move::Spill { guest, reg } => emit_store(
                self.buf,
                true,
                reg,
                ENV,
                off(cpu::spill_offset(guest.spill_slot())),
            ),
            Move::WriteBack { guest, reg } => {
                emit_store(self.buf, true, reg, ENV, off(guest.home_offset()))
            }
            Move::SpillToHome { guest } => {
                emit_load(
                    self.buf,
                    true,
                    SCRATCH0,
                    ENV,
                    off(cpu::spill_offset(guest.spill_slot())),
                );
                emit_store(self.buf, true, SCRATCH0, ENV, off(guest.home_offset()));
            }
        }
    }

    fn emit_moves(&mut self, moves: &[Move]) {
        for &m in moves {
            self.emit_move(m);
        }
    }

    /// dst <- guest value. Reading r0 yields zero (and clobbers flags).
    fn read(&mut self, i: usize, dst: Reg, g: GuestReg) -> Result<(), CompileError> {
        if g == GuestReg::Gpr(0) {
            emit_mov_ri(self.buf, true, dst, 0);
        } else {
            let src = self.host(i, g)?;
            emit_mov_rr(self.buf, true, dst, src);
        }
        Ok(())
    }

    fn read_gpr(&mut self, i: usize, dst: Reg, r: u8) -> Result<(), CompileError> {
        self.read(i, dst, GuestReg::Gpr(r))
    }

    /// guest value <- src. Writes to r0 are dropped.
    fn write(&mut self, i: usize, g: GuestReg, src: Reg) -> Result<(), CompileError> {
        if g != GuestReg::Gpr(0) {
            let dst = self.host(i, g)?;
            emit_mov_rr(self.buf, true, dst, src);
        }
        Ok(())
    }

    fn write_gpr(&mut self, i: usize, r: u8, src: Reg) -> Result<(), CompileError> {
        self.write(i, GuestReg::Gpr(r), src)
    }

    fn write_gpr_imm(&mut self, i: usize, r: u8, v: u64) -> Result<(), CompileError> {
        if r != 0 {
            let dst = self.host(i, GuestReg::Gpr(r))?;
            emit_mov_ri(self.buf, true, dst, v);
        }
        Ok(())
    }

    /// Sign-extend EAX into RAX.
    fn sext_eax(&mut self) {
        emit_movx(self.buf, OPC_MOVSLQ, SCRATCH0, SCRATCH0);
    }

    fn store_pc(&mut self, pc: u32) {
        emit_store_imm(self.buf, ENV, off(cpu::PC_OFFSET), pc);
    }

    fn emit_exit(&mut self, exit: BlockExit) {
        emit_mov_ri32(self.buf, SCRATCH0, exit as u32);
        emit_ret(self.buf);
    }

    fn call(&mut self, f: usize) {
        emit_mov_ri(self.buf, true, SCRATCH0, f as u64);
        emit_call_reg(self.buf, SCRATCH0);
    }

    fn env_arg(&mut self) {
        emit_mov_rr(self.buf, true, CALL_ARG_REGS[0], ENV);
    }

    fn imm_arg(&mut self, n: usize, v: u32) {
        emit_mov_ri32(self.buf, CALL_ARG_REGS[n], v);
    }

    /// ESI <- base + offset (32-bit wrap).
    fn effective_addr(&mut self, i: usize, base: u8, offset: i16) -> Result<(), CompileError> {
        self.read_gpr(i, Reg::Rsi, base)?;
        if offset != 0 {
            emit_arith_ri(self.buf, ArithOp::Add, false, Reg::Rsi, offset as i32);
        }
        Ok(())
    }

    // -- Block body --

    fn emit_body(&mut self) -> Result<(), CompileError> {
        for i in 0..self.block.insns.len() {
            let plan = self.plan(i);
            self.emit_moves(&plan.before);
            self.emit_op(i)?;
            self.emit_moves(&plan.after);
        }
        let alloc = self.alloc;
        self.emit_moves(&alloc.exit_flush);
        self.emit_block_end();
        Ok(())
    }

    fn emit_block_end(&mut self) {
        let block = self.block;
        if let Terminator::FetchFault { addr, branch_pc } = block.terminator {
            emit_store_imm(self.buf, ENV, off(cpu::cop0_offset(cop0::BADVADDR)), addr);
            emit_store_imm(
                self.buf,
                ENV,
                off(cpu::EXC_CODE_OFFSET),
                ExcCode::InstructionBus as u32,
            );
            emit_store_imm(self.buf, ENV, off(cpu::FAULT_PENDING_OFFSET), 1);
            emit_store_imm(
                self.buf,
                ENV,
                off(cpu::EXC_DELAY_SLOT_OFFSET),
                branch_pc.is_some() as u32,
            );
            self.store_pc(branch_pc.unwrap_or(addr));
            self.emit_exit(BlockExit::Exception);
            return;
        }
        let ends_in_eret = matches!(block.insns.last(), Some(x) if x.op == Operation::Eret);
        if block.branch_index().is_some() || ends_in_eret {
            // The branch (or ERET) already stored the next pc.
            self.emit_exit(BlockExit::Branch);
        } else if block.terminator == Terminator::System {
            self.store_pc(block.fallthrough_pc());
            self.emit_exit(BlockExit::Interrupt);
        } else {
            self.store_pc(block.fallthrough_pc());
            self.emit_exit(BlockExit::Fallthrough);
        }
    }

    fn emit_stubs(&mut self) {
        let stubs = std::mem::take(&mut self.stubs);
        for stub in &stubs {
            self.labels.set_value(stub.label, self.buf.offset());
            let insn = self.block.insns[stub.insn];
            let plan = self.plan(stub.insn);
            match stub.kind {
                StubKind::Fault { code } => {
                    self.emit_moves(&plan.flush_pre_write);
                    if let Some(code) = code {
                        emit_store_imm(self.buf, ENV, off(cpu::EXC_CODE_OFFSET), code as u32);
                    }
                    let (pc, bd) = if insn.in_delay_slot {
                        (insn.addr.wrapping_sub(4), 1)
                    } else {
                        (insn.addr, 0)
                    };
                    self.store_pc(pc);
                    emit_store_imm(self.buf, ENV, off(cpu::EXC_DELAY_SLOT_OFFSET), bd);
                    self.emit_exit(BlockExit::Exception);
                }
                StubKind::LikelySkip => {
                    self.emit_moves(&plan.flush_post_write);
                    self.store_pc(insn.addr.wrapping_add(8));
                    self.emit_exit(BlockExit::Fallthrough);
                }
                StubKind::CodeModified => {
                    self.emit_moves(&plan.flush_post_write);
                    // In a delay slot, pc already holds the branch outcome.
                    if !insn.in_delay_slot {
                        self.store_pc(insn.addr.wrapping_add(4));
                    }
                    self.emit_exit(BlockExit::CodeModified);
                }
            }
        }
    }

    // -- Operations --

    fn emit_op(&mut self, i: usize) -> Result<(), CompileError> {
        let insn = self.block.insns[i];
        let pc = insn.addr;
        match insn.op {
            Operation::Nop | Operation::Sync => {}
            Operation::Alu { op, rd, rs, rt } => self.emit_alu(i, op, rd, rs, rt)?,
            Operation::AluImm { op, rt, rs, imm } => self.emit_alu_imm(i, op, rt, rs, imm)?,
            Operation::Lui { rt, imm } => {
                self.write_gpr_imm(i, rt, simm(imm) << 16)?;
            }
            Operation::Shift { op, rd, rt, sa } => self.emit_shift(i, op, rd, rt, sa)?,
            Operation::ShiftVar { op, rd, rt, rs } => self.emit_shift_var(i, op, rd, rt, rs)?,
            Operation::MulDiv { op, rd, rs, rt } => self.emit_muldiv(i, op, rd, rs, rt)?,
            Operation::HiLo { op, reg } => {
                let (src, dst) = match op {
                    HiLoOp::Mfhi => (GuestReg::Hi, GuestReg::Gpr(reg)),
                    HiLoOp::Mflo => (GuestReg::Lo, GuestReg::Gpr(reg)),
                    HiLoOp::Mthi => (GuestReg::Gpr(reg), GuestReg::Hi),
                    HiLoOp::Mtlo => (GuestReg::Gpr(reg), GuestReg::Lo),
                };
                self.read(i, SCRATCH0, src)?;
                self.write(i, dst, SCRATCH0)?;
            }
            Operation::CondMove { op, rd, rs, rt } => {
                self.read_gpr(i, SCRATCH0, rt)?;
                self.read_gpr(i, SCRATCH1, rs)?;
                self.read_gpr(i, SCRATCH2, rd)?;
                emit_test_rr(self.buf, true, SCRATCH0, SCRATCH0);
                let cond = match op {
                    CondMoveOp::Movz => X86Cond::Je,
                    CondMoveOp::Movn => X86Cond::Jne,
                };
                emit_cmovcc(self.buf, cond, true, SCRATCH2, SCRATCH1);
                self.write_gpr(i, rd, SCRATCH2)?;
            }
            Operation::Load { op, rt, base, offset } => self.emit_load(i, op, rt, base, offset)?,
            Operation::Store { op, rt, base, offset } => {
                self.emit_store(i, op, rt, base, offset)?
            }
            Operation::Branch {
                cond,
                rs,
                rt,
                offset,
                likely,
                link,
            } => {
                self.read_gpr(i, SCRATCH0, rs)?;
                self.read_gpr(i, SCRATCH1, if cond.uses_rt() { rt } else { 0 })?;
                if link {
                    self.write_gpr_imm(i, 31, sign_extend_pc(pc.wrapping_add(8)))?;
                }
                emit_arith_rr(self.buf, ArithOp::Cmp, true, SCRATCH0, SCRATCH1);
                self.emit_branch_outcome(i, branch_cond(cond), branch_target(pc, offset), likely);
            }
            Operation::FpuBranch {
                on_true,
                likely,
                offset,
            } => {
                emit_test_mi(self.buf, ENV, off(cpu::FCR31_OFFSET), fcr31::C);
                let cond = if on_true { X86Cond::Jne } else { X86Cond::Je };
                self.emit_branch_outcome(i, cond, branch_target(pc, offset), likely);
            }
            Operation::Jump { index, link } => {
                if link {
                    self.write_gpr_imm(i, 31, sign_extend_pc(pc.wrapping_add(8)))?;
                }
                self.store_pc(jump_target(pc, index));
            }
            Operation::JumpReg { rs, link } => {
                self.read_gpr(i, SCRATCH0, rs)?;
                if let Some(rd) = link {
                    self.write_gpr_imm(i, rd, sign_extend_pc(pc.wrapping_add(8)))?;
                }
                emit_store(self.buf, false, SCRATCH0, ENV, off(cpu::PC_OFFSET));
            }
            Operation::Syscall { .. } => self.fault_if(i, None, Some(ExcCode::Syscall)),
            Operation::Break { .. } => self.fault_if(i, None, Some(ExcCode::Breakpoint)),
            Operation::Reserved { .. } => {
                self.fault_if(i, None, Some(ExcCode::ReservedInstruction))
            }
            Operation::Cop0Move { op, rt, rd } => match op {
                Cop0Op::Mfc0 => {
                    self.env_arg();
                    self.imm_arg(1, rd as u32);
                    self.call(helpers::mfc0 as *const () as usize);
                    self.check_fault_pending(i);
                    self.sext_eax();
                    self.write_gpr(i, rt, SCRATCH0)?;
                }
                Cop0Op::Mtc0 => {
                    self.read_gpr(i, CALL_ARG_REGS[2], rt)?;
                    self.env_arg();
                    self.imm_arg(1, rd as u32);
                    self.call(helpers::mtc0 as *const () as usize);
                    emit_test_rr(self.buf, false, SCRATCH0, SCRATCH0);
                    self.fault_if(i, Some(X86Cond::Je), None);
                }
            },
            Operation::Eret => {
                self.env_arg();
                self.call(helpers::eret as *const () as usize);
                emit_test_rr(self.buf, false, SCRATCH0, SCRATCH0);
                self.fault_if(i, Some(X86Cond::Je), None);
            }
            Operation::Ei | Operation::Di => {
                self.env_arg();
                self.imm_arg(1, (insn.op == Operation::Ei) as u32);
                self.call(helpers::set_eie as *const () as usize);
                emit_test_rr(self.buf, false, SCRATCH0, SCRATCH0);
                self.fault_if(i, Some(X86Cond::Je), None);
            }
            Operation::FpuMove { op, rt, fs } => self.emit_fpu_move(i, op, rt, fs)?,
            Operation::FpuLoad { ft, base, offset } => {
                self.effective_addr(i, base, offset)?;
                self.env_arg();
                self.call(helpers::load_u32 as *const () as usize);
                self.check_fault_pending(i);
                emit_store(self.buf, false, SCRATCH0, ENV, off(cpu::fpr_offset(ft as usize)));
            }
            Operation::FpuStore { ft, base, offset } => {
                self.effective_addr(i, base, offset)?;
                emit_load(
                    self.buf,
                    false,
                    CALL_ARG_REGS[2],
                    ENV,
                    off(cpu::fpr_offset(ft as usize)),
                );
                self.env_arg();
                self.call(helpers::store_u32 as *const () as usize);
                self.check_store_status(i);
            }
            Operation::FpuArith { op, fd, fs, ft } => {
                self.env_arg();
                self.imm_arg(1, op as u32);
                self.imm_arg(2, fd as u32);
                self.imm_arg(3, fs as u32);
                self.imm_arg(4, ft as u32);
                self.call(helpers::fpu_arith as *const () as usize);
            }
            Operation::FpuCompare { cond, fs, ft } => {
                self.env_arg();
                self.imm_arg(1, cond as u32);
                self.imm_arg(2, fs as u32);
                self.imm_arg(3, ft as u32);
                self.call(helpers::fpu_compare as *const () as usize);
            }
            Operation::Mmi { op, rd, rs, rt } => {
                self.env_arg();
                self.imm_arg(1, op as u32);
                self.imm_arg(2, rd as u32);
                self.imm_arg(3, rs as u32);
                self.imm_arg(4, rt as u32);
                self.call(helpers::mmi as *const () as usize);
            }
        }
        Ok(())
    }

    /// Record the outcome of a conditional branch whose condition is
    /// in the flags.
    fn emit_branch_outcome(&mut self, i: usize, cond: X86Cond, target: u32, likely: bool) {
        let pc = self.block.insns[i].addr;
        if likely {
            let skip = self.stub(i, StubKind::LikelySkip);
            self.jump_to(Some(cond.invert()), skip);
            self.store_pc(target);
        } else {
            emit_mov_ri32(self.buf, SCRATCH2, target);
            emit_mov_ri32(self.buf, Reg::Rsi, pc.wrapping_add(8));
            emit_cmovcc(self.buf, cond, false, Reg::Rsi, SCRATCH2);
            emit_store(self.buf, false, Reg::Rsi, ENV, off(cpu::PC_OFFSET));
        }
    }

    fn emit_alu(&mut self, i: usize, op: AluOp, rd: u8, rs: u8, rt: u8) -> Result<(), CompileError> {
        self.read_gpr(i, SCRATCH0, rs)?;
        self.read_gpr(i, SCRATCH1, rt)?;
        let (a, b) = (SCRATCH0, SCRATCH1);
        match op {
            AluOp::Add | AluOp::Addu | AluOp::Sub | AluOp::Subu => {
                let x = if matches!(op, AluOp::Add | AluOp::Addu) {
                    ArithOp::Add
                } else {
                    ArithOp::Sub
                };
                emit_arith_rr(self.buf, x, false, a, b);
                if op.traps_on_overflow() {
                    self.fault_if(i, Some(X86Cond::Jo), Some(ExcCode::Overflow));
                }
                self.sext_eax();
            }
            AluOp::Dadd | AluOp::Daddu | AluOp::Dsub | AluOp::Dsubu => {
                let x = if matches!(op, AluOp::Dadd | AluOp::Daddu) {
                    ArithOp::Add
                } else {
                    ArithOp::Sub
                };
                emit_arith_rr(self.buf, x, true, a, b);
                if op.traps_on_overflow() {
                    self.fault_if(i, Some(X86Cond::Jo), Some(ExcCode::Overflow));
                }
            }
            AluOp::And => emit_arith_rr(self.buf, ArithOp::And, true, a, b),
            AluOp::Or => emit_arith_rr(self.buf, ArithOp::Or, true, a, b),
            AluOp::Xor => emit_arith_rr(self.buf, ArithOp::Xor, true, a, b),
            AluOp::Nor => {
                emit_arith_rr(self.buf, ArithOp::Or, true, a, b);
                emit_not(self.buf, true, a);
            }
            AluOp::Slt | AluOp::Sltu => {
                emit_arith_rr(self.buf, ArithOp::Cmp, true, a, b);
                let c = if op == AluOp::Slt { X86Cond::Jl } else { X86Cond::Jb };
                emit_setcc(self.buf, c, a);
                emit_movx(self.buf, OPC_MOVZBL, a, a);
            }
        }
        self.write_gpr(i, rd, SCRATCH0)
    }

    fn emit_alu_imm(
        &mut self,
        i: usize,
        op: AluImmOp,
        rt: u8,
        rs: u8,
        imm: u16,
    ) -> Result<(), CompileError> {
        self.read_gpr(i, SCRATCH0, rs)?;
        let a = SCRATCH0;
        let s = imm as i16 as i32;
        let z = imm as i32;
        match op {
            AluImmOp::Addi | AluImmOp::Addiu => {
                emit_arith_ri(self.buf, ArithOp::Add, false, a, s);
                if op.traps_on_overflow() {
                    self.fault_if(i, Some(X86Cond::Jo), Some(ExcCode::Overflow));
                }
                self.sext_eax();
            }
            AluImmOp::Daddi | AluImmOp::Daddiu => {
                emit_arith_ri(self.buf, ArithOp::Add, true, a, s);
                if op.traps_on_overflow() {
                    self.fault_if(i, Some(X86Cond::Jo), Some(ExcCode::Overflow));
                }
            }
            AluImmOp::Slti | AluImmOp::Sltiu => {
                emit_arith_ri(self.buf, ArithOp::Cmp, true, a, s);
                let c = if op == AluImmOp::Slti { X86Cond::Jl } else { X86Cond::Jb };
                emit_setcc(self.buf, c, a);
                emit_movx(self.buf, OPC_MOVZBL, a, a);
            }
            AluImmOp::Andi => emit_arith_ri(self.buf, ArithOp::And, true, a, z),
            AluImmOp::Ori => emit_arith_ri(self.buf, ArithOp::Or, true, a, z),
            AluImmOp::Xori => emit_arith_ri(self.buf, ArithOp::Xor, true, a, z),
        }
        self.write_gpr(i, rt, SCRATCH0)
    }

    fn emit_shift(&mut self, i: usize, op: ShiftOp, rd: u8, rt: u8, sa: u8) -> Result<(), CompileError> {
        use crate::x86_64::emitter::ShiftOp as X;
        self.read_gpr(i, SCRATCH0, rt)?;
        let (x, wide, amount) = match op {
            ShiftOp::Sll => (X::Shl, false, sa),
            ShiftOp::Srl => (X::Shr, false, sa),
            ShiftOp::Sra => (X::Sar, false, sa),
            ShiftOp::Dsll => (X::Shl, true, sa),
            ShiftOp::Dsrl => (X::Shr, true, sa),
            ShiftOp::Dsra => (X::Sar, true, sa),
            ShiftOp::Dsll32 => (X::Shl, true, sa + 32),
            ShiftOp::Dsrl32 => (X::Shr, true, sa + 32),
            ShiftOp::Dsra32 => (X::Sar, true, sa + 32),
        };
        if amount != 0 {
            emit_shift_ri(self.buf, x, wide, SCRATCH0, amount);
        }
        if !wide {
            self.sext_eax();
        }
        self.write_gpr(i, rd, SCRATCH0)
    }

    fn emit_shift_var(
        &mut self,
        i: usize,
        op: ShiftVarOp,
        rd: u8,
        rt: u8,
        rs: u8,
    ) -> Result<(), CompileError> {
        use crate::x86_64::emitter::ShiftOp as X;
        self.read_gpr(i, SCRATCH0, rt)?;
        // The host masks CL to 5 bits for 32-bit shifts and 6 bits for
        // 64-bit ones, exactly like the guest.
        self.read_gpr(i, Reg::Rcx, rs)?;
        let (x, wide) = match op {
            ShiftVarOp::Sllv => (X::Shl, false),
            ShiftVarOp::Srlv => (X::Shr, false),
            ShiftVarOp::Srav => (X::Sar, false),
            ShiftVarOp::Dsllv => (X::Shl, true),
            ShiftVarOp::Dsrlv => (X::Shr, true),
            ShiftVarOp::Dsrav => (X::Sar, true),
        };
        emit_shift_cl(self.buf, x, wide, SCRATCH0);
        if !wide {
            self.sext_eax();
        }
        self.write_gpr(i, rd, SCRATCH0)
    }

    fn emit_muldiv(&mut self, i: usize, op: MulDivOp, rd: u8, rs: u8, rt: u8) -> Result<(), CompileError> {
        match op {
            MulDivOp::Mult | MulDivOp::Multu => {
                self.read_gpr(i, SCRATCH0, rs)?;
                self.read_gpr(i, SCRATCH1, rt)?;
                if op == MulDivOp::Mult {
                    emit_movx(self.buf, OPC_MOVSLQ, SCRATCH0, SCRATCH0);
                    emit_movx(self.buf, OPC_MOVSLQ, SCRATCH1, SCRATCH1);
                } else {
                    emit_mov_rr(self.buf, false, SCRATCH0, SCRATCH0);
                    emit_mov_rr(self.buf, false, SCRATCH1, SCRATCH1);
                }
                // The full 64-bit product fits in RAX for both forms.
                emit_imul_rr(self.buf, true, SCRATCH0, SCRATCH1);
                self.split_hi_lo();
                self.write(i, GuestReg::Hi, SCRATCH2)?;
                self.write(i, GuestReg::Lo, SCRATCH0)?;
                self.write_gpr(i, rd, SCRATCH0)
            }
            MulDivOp::Div | MulDivOp::Divu => {
                self.read_gpr(i, CALL_ARG_REGS[0], rs)?;
                self.read_gpr(i, CALL_ARG_REGS[1], rt)?;
                let f = if op == MulDivOp::Div {
                    helpers::div as *const () as usize
                } else {
                    helpers::divu as *const () as usize
                };
                self.call(f);
                self.split_hi_lo();
                self.write(i, GuestReg::Hi, SCRATCH2)?;
                self.write(i, GuestReg::Lo, SCRATCH0)
            }
        }
    }

    /// RAX holds `hi:lo` as two words. Leave sign-extended LO in RAX
    /// and HI in RDX.
    fn split_hi_lo(&mut self) {
        use crate::x86_64::emitter::ShiftOp as X;
        emit_mov_rr(self.buf, true, SCRATCH2, SCRATCH0);
        emit_shift_ri(self.buf, X::Sar, true, SCRATCH2, 32);
        self.sext_eax();
    }

    fn emit_load(&mut self, i: usize, op: LoadOp, rt: u8, base: u8, offset: i16) -> Result<(), CompileError> {
        self.effective_addr(i, base, offset)?;
        self.env_arg();
        if op == LoadOp::Lq {
            self.imm_arg(2, rt as u32);
            self.call(helpers::load_quad as *const () as usize);
            self.check_fault_pending(i);
            return Ok(());
        }
        let f = match op.size() {
            1 => helpers::load_u8 as *const () as usize,
            2 => helpers::load_u16 as *const () as usize,
            4 => helpers::load_u32 as *const () as usize,
            _ => helpers::load_u64 as *const () as usize,
        };
        self.call(f);
        self.check_fault_pending(i);
        match op {
            LoadOp::Lb => emit_movx(self.buf, OPC_MOVSBQ, SCRATCH0, SCRATCH0),
            LoadOp::Lh => emit_movx(self.buf, OPC_MOVSWQ, SCRATCH0, SCRATCH0),
            LoadOp::Lw => self.sext_eax(),
            // Helpers return the raw value zero-extended.
            LoadOp::Lbu | LoadOp::Lhu | LoadOp::Lwu | LoadOp::Ld | LoadOp::Lq => {}
        }
        self.write_gpr(i, rt, SCRATCH0)
    }

    fn emit_store(&mut self, i: usize, op: StoreOp, rt: u8, base: u8, offset: i16) -> Result<(), CompileError> {
        self.effective_addr(i, base, offset)?;
        let f = if op == StoreOp::Sq {
            self.imm_arg(2, rt as u32);
            helpers::store_quad as *const () as usize
        } else {
            self.read_gpr(i, CALL_ARG_REGS[2], rt)?;
            match op.size() {
                1 => helpers::store_u8 as *const () as usize,
                2 => helpers::store_u16 as *const () as usize,
                4 => helpers::store_u32 as *const () as usize,
                _ => helpers::store_u64 as *const () as usize,
            }
        };
        self.env_arg();
        self.call(f);
        self.check_store_status(i);
        Ok(())
    }

    fn check_store_status(&mut self, i: usize) {
        emit_arith_ri(self.buf, ArithOp::Cmp, false, SCRATCH0, helpers::STORE_FAULT as i32);
        self.fault_if(i, Some(X86Cond::Je), None);
        emit_arith_ri(
            self.buf,
            ArithOp::Cmp,
            false,
            SCRATCH0,
            helpers::STORE_CODE_MODIFIED as i32,
        );
        let smc = self.stub(i, StubKind::CodeModified);
        self.jump_to(Some(X86Cond::Je), smc);
    }

    fn emit_fpu_move(&mut self, i: usize, op: FpuMoveOp, rt: u8, fs: u8) -> Result<(), CompileError> {
        match op {
            FpuMoveOp::Mfc1 => {
                emit_load_sx(self.buf, OPC_MOVSLQ, SCRATCH0, ENV, off(cpu::fpr_offset(fs as usize)));
                self.write_gpr(i, rt, SCRATCH0)
            }
            FpuMoveOp::Mtc1 => {
                self.read_gpr(i, SCRATCH0, rt)?;
                emit_store(self.buf, false, SCRATCH0, ENV, off(cpu::fpr_offset(fs as usize)));
                Ok(())
            }
            FpuMoveOp::Cfc1 => {
                match fs {
                    0 => emit_mov_ri(self.buf, true, SCRATCH0, FCR0_VALUE as u64),
                    31 => emit_load_sx(self.buf, OPC_MOVSLQ, SCRATCH0, ENV, off(cpu::FCR31_OFFSET)),
                    _ => emit_mov_ri(self.buf, true, SCRATCH0, 0),
                }
                self.write_gpr(i, rt, SCRATCH0)
            }
            FpuMoveOp::Ctc1 => {
                if fs == 31 {
                    self.read_gpr(i, SCRATCH0, rt)?;
                    emit_arith_ri(self.buf, ArithOp::And, false, SCRATCH0, fcr31::WRITABLE as i32);
                    emit_store(self.buf, false, SCRATCH0, ENV, off(cpu::FCR31_OFFSET));
                }
                Ok(())
            }
        }
    }
}

/// Link value: a 32-bit address sign-extended to 64 bits.
fn sign_extend_pc(pc: u32) -> u64 {
    pc as i32 as i64 as u64
}
