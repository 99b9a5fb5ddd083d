//! Reference interpreter.
//!
//! Executes a `BasicBlock` directly with exactly the exit protocol of
//! compiled code: the same `BlockExit` values, the next PC in
//! `CpuState::pc`, and the same exception fields. The dispatcher uses
//! it for blocks that cannot be cached, and tests use it as the
//! oracle for compiled code.

use ee_core::block::{BasicBlock, BlockExit, DecodedInsn, Terminator};
use ee_core::cpu::{CpuState, ExcCode};
use ee_core::op::*;
use ee_core::semantics::{cop0, fpu, mmi, muldiv, sext32, simm};
use ee_mem::access::{self, StoreStatus};
use ee_mem::GuestMemory;

/// Control flow after one instruction.
enum Flow {
    Next,
    /// A guest exception; raised faults already sit in the CPU state.
    Fault(ExcCode),
    /// Branch-likely not taken: skip the delay slot.
    SkipDelaySlot,
    /// The instruction set `pc` itself (ERET).
    Redirect,
    /// A store invalidated the running block.
    CodeModified,
}

pub struct Interpreter;

impl Interpreter {
    /// Run `block` from its first instruction.
    pub fn exec_block(cpu: &mut CpuState, mem: &GuestMemory, block: &BasicBlock) -> BlockExit {
        cpu.clear_exit();
        cpu.block_first_page = block.first_page();
        cpu.block_last_page = block.last_page();

        for insn in &block.insns {
            match exec_insn(cpu, mem, insn) {
                Flow::Next => {}
                Flow::Fault(code) => return raise(cpu, insn, code),
                Flow::SkipDelaySlot => {
                    cpu.pc = insn.addr.wrapping_add(8);
                    return BlockExit::Fallthrough;
                }
                Flow::Redirect => return BlockExit::Branch,
                Flow::CodeModified => {
                    if !insn.in_delay_slot {
                        cpu.pc = insn.addr.wrapping_add(4);
                    }
                    return BlockExit::CodeModified;
                }
            }
        }

        match block.terminator {
            Terminator::FetchFault { addr, branch_pc } => {
                cpu.raise_fault(ExcCode::InstructionBus, Some(addr));
                cpu.pc = branch_pc.unwrap_or(addr);
                cpu.exc_delay_slot = branch_pc.is_some() as u32;
                BlockExit::Exception
            }
            _ if block.branch_index().is_some() => BlockExit::Branch,
            Terminator::System => {
                cpu.pc = block.fallthrough_pc();
                BlockExit::Interrupt
            }
            _ => {
                cpu.pc = block.fallthrough_pc();
                BlockExit::Fallthrough
            }
        }
    }
}

/// Record an exception taken at `insn`.
fn raise(cpu: &mut CpuState, insn: &DecodedInsn, code: ExcCode) -> BlockExit {
    cpu.exc_code = code as u32;
    if insn.in_delay_slot {
        cpu.pc = insn.addr.wrapping_sub(4);
        cpu.exc_delay_slot = 1;
    } else {
        cpu.pc = insn.addr;
        cpu.exc_delay_slot = 0;
    }
    BlockExit::Exception
}

fn pending_fault(cpu: &CpuState) -> Flow {
    match ExcCode::from_raw(cpu.exc_code) {
        Some(code) => Flow::Fault(code),
        None => Flow::Fault(ExcCode::DataBus),
    }
}

fn store_flow(cpu: &CpuState, status: StoreStatus) -> Flow {
    match status {
        StoreStatus::Ok => Flow::Next,
        StoreStatus::Fault => pending_fault(cpu),
        StoreStatus::CodeModified => Flow::CodeModified,
    }
}

fn alu(op: AluOp, a: u64, b: u64) -> Option<u64> {
    Some(match op {
        AluOp::Add => sext32((a as i32).checked_add(b as i32)? as u32 as u64),
        AluOp::Addu => sext32(a.wrapping_add(b)),
        AluOp::Sub => sext32((a as i32).checked_sub(b as i32)? as u32 as u64),
        AluOp::Subu => sext32(a.wrapping_sub(b)),
        AluOp::And => a & b,
        AluOp::Or => a | b,
        AluOp::Xor => a ^ b,
        AluOp::Nor => !(a | b),
        AluOp::Slt => ((a as i64) < (b as i64)) as u64,
        AluOp::Sltu => (a < b) as u64,
        AluOp::Dadd => (a as i64).checked_add(b as i64)? as u64,
        AluOp::Daddu => a.wrapping_add(b),
        AluOp::Dsub => (a as i64).checked_sub(b as i64)? as u64,
        AluOp::Dsubu => a.wrapping_sub(b),
    })
}

fn alu_imm(op: AluImmOp, a: u64, imm: u16) -> Option<u64> {
    let s = simm(imm);
    let z = imm as u64;
    Some(match op {
        AluImmOp::Addi => sext32((a as i32).checked_add(s as i32)? as u32 as u64),
        AluImmOp::Addiu => sext32(a.wrapping_add(s)),
        AluImmOp::Slti => ((a as i64) < (s as i64)) as u64,
        AluImmOp::Sltiu => (a < s) as u64,
        AluImmOp::Andi => a & z,
        AluImmOp::Ori => a | z,
        AluImmOp::Xori => a ^ z,
        AluImmOp::Daddi => (a as i64).checked_add(s as i64)? as u64,
        AluImmOp::Daddiu => a.wrapping_add(s),
    })
}

fn shift(op: ShiftOp, v: u64, sa: u32) -> u64 {
    match op {
        ShiftOp::Sll => sext32(((v as u32) << sa) as u64),
        ShiftOp::Srl => sext32(((v as u32) >> sa) as u64),
        ShiftOp::Sra => ((v as i32) >> sa) as i64 as u64,
        ShiftOp::Dsll => v << sa,
        ShiftOp::Dsrl => v >> sa,
        ShiftOp::Dsra => ((v as i64) >> sa) as u64,
        ShiftOp::Dsll32 => v << (sa + 32),
        ShiftOp::Dsrl32 => v >> (sa + 32),
        ShiftOp::Dsra32 => ((v as i64) >> (sa + 32)) as u64,
    }
}

fn shift_var(op: ShiftVarOp, v: u64, amount: u64) -> u64 {
    let s5 = (amount & 31) as u32;
    let s6 = (amount & 63) as u32;
    match op {
        ShiftVarOp::Sllv => shift(ShiftOp::Sll, v, s5),
        ShiftVarOp::Srlv => shift(ShiftOp::Srl, v, s5),
        ShiftVarOp::Srav => shift(ShiftOp::Sra, v, s5),
        ShiftVarOp::Dsllv => v << s6,
        ShiftVarOp::Dsrlv => v >> s6,
        ShiftVarOp::Dsrav => ((v as i64) >> s6) as u64,
    }
}

fn effective_addr(cpu: &CpuState, base: u8, offset: i16) -> u32 {
    (cpu.reg(base) as u32).wrapping_add(offset as i32 as u32)
}

fn exec_load(cpu: &mut CpuState, mem: &GuestMemory, op: LoadOp, rt: u8, addr: u32) -> Flow {
    let v = match op {
        LoadOp::Lb => access::load::<u8>(cpu, mem, addr).map(|v| v as i8 as i64 as u64),
        LoadOp::Lbu => access::load::<u8>(cpu, mem, addr).map(|v| v as u64),
        LoadOp::Lh => access::load::<u16>(cpu, mem, addr).map(|v| v as i16 as i64 as u64),
        LoadOp::Lhu => access::load::<u16>(cpu, mem, addr).map(|v| v as u64),
        LoadOp::Lw => access::load::<u32>(cpu, mem, addr).map(|v| sext32(v as u64)),
        LoadOp::Lwu => access::load::<u32>(cpu, mem, addr).map(|v| v as u64),
        LoadOp::Ld => access::load::<u64>(cpu, mem, addr),
        LoadOp::Lq => {
            return match access::load::<u128>(cpu, mem, addr) {
                Some(v) => {
                    cpu.set_reg128(rt, v);
                    Flow::Next
                }
                None => pending_fault(cpu),
            };
        }
    };
    match v {
        Some(v) => {
            cpu.set_reg(rt, v);
            Flow::Next
        }
        None => pending_fault(cpu),
    }
}

fn exec_store(cpu: &mut CpuState, mem: &GuestMemory, op: StoreOp, rt: u8, addr: u32) -> Flow {
    let v = cpu.reg(rt);
    let status = match op {
        StoreOp::Sb => access::store::<u8>(cpu, mem, addr, v as u8),
        StoreOp::Sh => access::store::<u16>(cpu, mem, addr, v as u16),
        StoreOp::Sw => access::store::<u32>(cpu, mem, addr, v as u32),
        StoreOp::Sd => access::store::<u64>(cpu, mem, addr, v),
        StoreOp::Sq => {
            let q = cpu.reg128(rt);
            access::store::<u128>(cpu, mem, addr, q)
        }
    };
    store_flow(cpu, status)
}

fn exec_insn(cpu: &mut CpuState, mem: &GuestMemory, insn: &DecodedInsn) -> Flow {
    let pc = insn.addr;
    match insn.op {
        Operation::Nop | Operation::Sync => {}
        Operation::Alu { op, rd, rs, rt } => match alu(op, cpu.reg(rs), cpu.reg(rt)) {
            Some(v) => cpu.set_reg(rd, v),
            None => return Flow::Fault(ExcCode::Overflow),
        },
        Operation::AluImm { op, rt, rs, imm } => match alu_imm(op, cpu.reg(rs), imm) {
            Some(v) => cpu.set_reg(rt, v),
            None => return Flow::Fault(ExcCode::Overflow),
        },
        Operation::Lui { rt, imm } => cpu.set_reg(rt, sext32((imm as u64) << 16)),
        Operation::Shift { op, rd, rt, sa } => cpu.set_reg(rd, shift(op, cpu.reg(rt), sa as u32)),
        Operation::ShiftVar { op, rd, rt, rs } => {
            cpu.set_reg(rd, shift_var(op, cpu.reg(rt), cpu.reg(rs)))
        }
        Operation::MulDiv { op, rd, rs, rt } => {
            let (a, b) = (cpu.reg(rs), cpu.reg(rt));
            let (lo, hi) = match op {
                MulDivOp::Mult => muldiv::mult(a, b),
                MulDivOp::Multu => muldiv::multu(a, b),
                MulDivOp::Div => muldiv::div(a, b),
                MulDivOp::Divu => muldiv::divu(a, b),
            };
            cpu.lo = lo;
            cpu.hi = hi;
            if matches!(op, MulDivOp::Mult | MulDivOp::Multu) {
                cpu.set_reg(rd, lo);
            }
        }
        Operation::HiLo { op, reg } => match op {
            HiLoOp::Mfhi => cpu.set_reg(reg, cpu.hi),
            HiLoOp::Mflo => cpu.set_reg(reg, cpu.lo),
            HiLoOp::Mthi => cpu.hi = cpu.reg(reg),
            HiLoOp::Mtlo => cpu.lo = cpu.reg(reg),
        },
        Operation::CondMove { op, rd, rs, rt } => {
            let zero = cpu.reg(rt) == 0;
            if zero == (op == CondMoveOp::Movz) {
                cpu.set_reg(rd, cpu.reg(rs));
            }
        }
        Operation::Load { op, rt, base, offset } => {
            let addr = effective_addr(cpu, base, offset);
            return exec_load(cpu, mem, op, rt, addr);
        }
        Operation::Store { op, rt, base, offset } => {
            let addr = effective_addr(cpu, base, offset);
            return exec_store(cpu, mem, op, rt, addr);
        }
        Operation::Branch { cond, rs, rt, offset, likely, link } => {
            let taken = cond.holds(cpu.reg(rs), cpu.reg(rt));
            if link {
                cpu.set_reg(31, sext32(pc.wrapping_add(8) as u64));
            }
            if taken {
                cpu.pc = branch_target(pc, offset);
            } else if likely {
                return Flow::SkipDelaySlot;
            } else {
                cpu.pc = pc.wrapping_add(8);
            }
        }
        Operation::FpuBranch { on_true, likely, offset } => {
            if fpu::condition(cpu) == on_true {
                cpu.pc = branch_target(pc, offset);
            } else if likely {
                return Flow::SkipDelaySlot;
            } else {
                cpu.pc = pc.wrapping_add(8);
            }
        }
        Operation::Jump { index, link } => {
            if link {
                cpu.set_reg(31, sext32(pc.wrapping_add(8) as u64));
            }
            cpu.pc = jump_target(pc, index);
        }
        Operation::JumpReg { rs, link } => {
            let target = cpu.reg(rs) as u32;
            if let Some(rd) = link {
                cpu.set_reg(rd, sext32(pc.wrapping_add(8) as u64));
            }
            cpu.pc = target;
        }
        Operation::Syscall { .. } => return Flow::Fault(ExcCode::Syscall),
        Operation::Break { .. } => return Flow::Fault(ExcCode::Breakpoint),
        Operation::Reserved { .. } => return Flow::Fault(ExcCode::ReservedInstruction),
        Operation::Cop0Move { op, rt, rd } => match op {
            Cop0Op::Mfc0 => match cop0::mfc0(cpu, rd) {
                Some(v) => cpu.set_reg(rt, sext32(v as u64)),
                None => return pending_fault(cpu),
            },
            Cop0Op::Mtc0 => {
                if !cop0::mtc0(cpu, rd, cpu.reg(rt) as u32) {
                    return pending_fault(cpu);
                }
            }
        },
        Operation::Eret => {
            return if cop0::eret(cpu) {
                Flow::Redirect
            } else {
                pending_fault(cpu)
            };
        }
        Operation::Ei | Operation::Di => {
            if !cop0::set_eie(cpu, insn.op == Operation::Ei) {
                return pending_fault(cpu);
            }
        }
        Operation::FpuMove { op, rt, fs } => match op {
            FpuMoveOp::Mfc1 => cpu.set_reg(rt, sext32(cpu.fpr[fs as usize] as u64)),
            FpuMoveOp::Mtc1 => cpu.fpr[fs as usize] = cpu.reg(rt) as u32,
            FpuMoveOp::Cfc1 => cpu.set_reg(rt, sext32(fpu::read_control(cpu, fs) as u64)),
            FpuMoveOp::Ctc1 => fpu::write_control(cpu, fs, cpu.reg(rt) as u32),
        },
        Operation::FpuLoad { ft, base, offset } => {
            let addr = effective_addr(cpu, base, offset);
            match access::load::<u32>(cpu, mem, addr) {
                Some(v) => cpu.fpr[ft as usize] = v,
                None => return pending_fault(cpu),
            }
        }
        Operation::FpuStore { ft, base, offset } => {
            let addr = effective_addr(cpu, base, offset);
            let v = cpu.fpr[ft as usize];
            let status = access::store::<u32>(cpu, mem, addr, v);
            return store_flow(cpu, status);
        }
        Operation::FpuArith { op, fd, fs, ft } => fpu::arith(cpu, op, fd, fs, ft),
        Operation::FpuCompare { cond, fs, ft } => fpu::compare(cpu, cond, fs, ft),
        Operation::Mmi { op, rd, rs, rt } => {
            let v = mmi::eval(op, cpu.reg128(rs), cpu.reg128(rt));
            cpu.set_reg128(rd, v);
        }
    }
    Flow::Next
}
