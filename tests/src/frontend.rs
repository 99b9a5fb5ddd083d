//! Decoder, block builder and reference interpreter.

use std::collections::BTreeSet;

use ee_core::op::{AluImmOp, AluOp, BranchCond, Cop0Op, FpuOp, LoadOp, MmiOp, MulDivOp, StoreOp};
use ee_core::{BlockExit, CpuState, ExcCode, Operation, Terminator};
use ee_frontend::{decode, BlockBuilder, Interpreter};
use ee_mem::GuestMemory;

use crate::asm::*;
use crate::harness::{build, load, memory, CODE, DATA, RAM_SIZE};

// ── Decoder ───────────────────────────────────────────────────

#[test]
fn test_decode_alu() {
    assert_eq!(
        decode(addu(3, 1, 2)),
        Operation::Alu { op: AluOp::Addu, rd: 3, rs: 1, rt: 2 }
    );
    assert_eq!(
        decode(addiu(4, 5, -1)),
        Operation::AluImm { op: AluImmOp::Addiu, rt: 4, rs: 5, imm: 0xFFFF }
    );
    assert_eq!(decode(NOP), Operation::Nop);
}

#[test]
fn test_decode_memory() {
    assert_eq!(
        decode(lw(8, 29, -16)),
        Operation::Load { op: LoadOp::Lw, rt: 8, base: 29, offset: -16 }
    );
    assert_eq!(
        decode(sq(2, 4, 0x20)),
        Operation::Store { op: StoreOp::Sq, rt: 2, base: 4, offset: 0x20 }
    );
    assert_eq!(
        decode(lq(2, 4, 0x10)),
        Operation::Load { op: LoadOp::Lq, rt: 2, base: 4, offset: 0x10 }
    );
}

#[test]
fn test_decode_branches() {
    assert_eq!(
        decode(bgezal(7, -3)),
        Operation::Branch {
            cond: BranchCond::Gez,
            rs: 7,
            rt: 0,
            offset: -3,
            likely: false,
            link: true,
        }
    );
    assert_eq!(
        decode(bnel(1, 2, 4)),
        Operation::Branch {
            cond: BranchCond::Ne,
            rs: 1,
            rt: 2,
            offset: 4,
            likely: true,
            link: false,
        }
    );
    assert_eq!(decode(jalr(31, 9)), Operation::JumpReg { rs: 9, link: Some(31) });
    assert_eq!(
        decode(j(0x2000)),
        Operation::Jump { index: 0x800, link: false }
    );
}

#[test]
fn test_decode_muldiv() {
    assert_eq!(
        decode(mult(3, 1, 2)),
        Operation::MulDiv { op: MulDivOp::Mult, rd: 3, rs: 1, rt: 2 }
    );
    assert_eq!(
        decode(divu(1, 2)),
        Operation::MulDiv { op: MulDivOp::Divu, rd: 0, rs: 1, rt: 2 }
    );
}

#[test]
fn test_decode_coprocessors() {
    assert_eq!(decode(mfc0(2, 12)), Operation::Cop0Move { op: Cop0Op::Mfc0, rt: 2, rd: 12 });
    assert_eq!(decode(ERET), Operation::Eret);
    assert_eq!(decode(EI), Operation::Ei);
    assert_eq!(decode(DI), Operation::Di);
    assert_eq!(
        decode(add_s(2, 0, 1)),
        Operation::FpuArith { op: FpuOp::Add, fd: 2, fs: 0, ft: 1 }
    );
    assert_eq!(
        decode(bc1t(2)),
        Operation::FpuBranch { on_true: true, likely: false, offset: 2 }
    );
    assert_eq!(
        decode(paddw(3, 1, 2)),
        Operation::Mmi { op: MmiOp::Paddw, rd: 3, rs: 1, rt: 2 }
    );
}

#[test]
fn test_decode_reserved() {
    // Unassigned primary opcode.
    let w = 0x3B << 26;
    assert_eq!(decode(w), Operation::Reserved { word: w });
    // Unassigned SPECIAL function.
    let w = r_type(1, 2, 3, 0, 0x01);
    assert_eq!(decode(w), Operation::Reserved { word: w });
}

#[test]
fn test_decode_is_pure() {
    for w in [addu(3, 1, 2), lq(1, 2, 3), ERET, 0xFFFF_FFFF, 0x1234_5678] {
        assert_eq!(decode(w), decode(w));
    }
}

// ── Block builder ─────────────────────────────────────────────

fn block_at(code: &[u32]) -> (std::sync::Arc<GuestMemory>, ee_core::BasicBlock) {
    let mem = memory();
    load(&mem, CODE, code);
    let block = build(&mem, CODE);
    (mem, block)
}

#[test]
fn test_block_includes_delay_slot() {
    let (_mem, block) = block_at(&[addiu(1, 0, 1), beq(1, 2, 4), addu(3, 1, 2), addiu(4, 0, 4)]);
    assert_eq!(block.start, CODE);
    assert_eq!(block.end, CODE + 12);
    assert_eq!(block.insns.len(), 3);
    assert_eq!(block.terminator, Terminator::Branch);
    assert!(block.insns[2].in_delay_slot);
    assert!(!block.insns[1].in_delay_slot);
    assert_eq!(block.branch_index(), Some(1));
}

#[test]
fn test_block_terminators() {
    let (_, b) = block_at(&[j(0x2000), NOP]);
    assert_eq!(b.terminator, Terminator::Jump);
    let (_, b) = block_at(&[jal(0x2000), NOP]);
    assert_eq!(b.terminator, Terminator::Call);
    let (_, b) = block_at(&[jr(31), NOP]);
    assert_eq!(b.terminator, Terminator::Return);
    let (_, b) = block_at(&[addiu(1, 0, 1), syscall(0)]);
    assert_eq!(b.terminator, Terminator::Trap);
    assert_eq!(b.insns.len(), 2);
    let (_, b) = block_at(&[mtc0(1, 12), NOP]);
    assert_eq!(b.terminator, Terminator::System);
    assert_eq!(b.insns.len(), 1);
}

#[test]
fn test_block_stops_at_page_end() {
    let mem = memory();
    load(&mem, 0x1FF8, &[addiu(1, 0, 1), addiu(2, 0, 2), addiu(3, 0, 3)]);
    let block = build(&mem, 0x1FF8);
    assert_eq!(block.terminator, Terminator::PageEnd);
    assert_eq!(block.end, 0x2000);
    assert_eq!(block.pages.len(), 1);
}

#[test]
fn test_delay_slot_may_cross_page() {
    let mem = memory();
    load(&mem, 0x1FFC, &[j(0x3000), addiu(1, 0, 1)]);
    let block = build(&mem, 0x1FFC);
    assert_eq!(block.terminator, Terminator::Jump);
    assert_eq!(block.end, 0x2004);
    assert_eq!(block.first_page(), 1);
    assert_eq!(block.last_page(), 2);
}

#[test]
fn test_block_instruction_limit() {
    let mem = memory();
    load(&mem, CODE, &[NOP; 8]);
    let block = BlockBuilder::new(&mem, 3).build(CODE).unwrap();
    assert_eq!(block.terminator, Terminator::Limit);
    assert_eq!(block.insns.len(), 3);
    assert_eq!(block.end, CODE + 12);
}

#[test]
fn test_block_stop_points() {
    let mem = memory();
    load(&mem, CODE, &[NOP; 8]);
    let stops = BTreeSet::from([CODE + 8]);
    let block = BlockBuilder::new(&mem, 512)
        .with_stop_points(&stops)
        .build(CODE)
        .unwrap();
    assert_eq!(block.end, CODE + 8);
    assert_eq!(block.terminator, Terminator::Limit);
}

#[test]
fn test_block_marks_code_pages() {
    let (mem, block) = block_at(&[j(0x2000), NOP]);
    assert!(mem.is_code_page(CODE >> 12));
    assert_eq!(block.pages[0].page, CODE >> 12);
    assert_eq!(block.pages[0].version, mem.page_version(CODE >> 12));
}

#[test]
fn test_unmapped_entry_is_an_error() {
    let mem = memory();
    assert!(BlockBuilder::new(&mem, 512).build(RAM_SIZE).is_err());
}

#[test]
fn test_fetch_fault_after_entry() {
    let mem = memory();
    let last = RAM_SIZE - 8;
    load(&mem, last, &[addiu(1, 0, 1), j(0)]);
    // The delay slot of the jump lies outside RAM.
    let block = build(&mem, last);
    assert_eq!(
        block.terminator,
        Terminator::FetchFault {
            addr: RAM_SIZE,
            branch_pc: Some(last + 4),
        }
    );
    assert_eq!(block.insns.len(), 1);
}

// ── Interpreter ───────────────────────────────────────────────

fn interpret(code: &[u32], setup: impl FnOnce(&mut CpuState)) -> (CpuState, BlockExit) {
    let (mem, block) = block_at(code);
    let mut cpu = CpuState::new();
    cpu.pc = CODE;
    setup(&mut cpu);
    let exit = Interpreter::exec_block(&mut cpu, &mem, &block);
    (cpu, exit)
}

#[test]
fn test_interp_syscall() {
    let (cpu, exit) = interpret(&[addiu(1, 0, 7), sll(2, 1, 4), syscall(0)], |_| {});
    assert_eq!(exit, BlockExit::Exception);
    assert_eq!(cpu.reg(1), 7);
    assert_eq!(cpu.reg(2), 0x70);
    assert_eq!(cpu.exc_code, ExcCode::Syscall as u32);
    assert_eq!(cpu.pc, CODE + 8);
}

#[test]
fn test_interp_branch_taken_runs_delay_slot() {
    let (cpu, exit) = interpret(&[beq(0, 0, 3), addiu(1, 0, 1)], |_| {});
    assert_eq!(exit, BlockExit::Branch);
    assert_eq!(cpu.reg(1), 1);
    assert_eq!(cpu.pc, CODE + 16);
}

#[test]
fn test_interp_likely_not_taken_skips_delay_slot() {
    let (cpu, exit) = interpret(&[bnel(0, 0, 3), addiu(1, 0, 1)], |_| {});
    assert_eq!(exit, BlockExit::Fallthrough);
    assert_eq!(cpu.reg(1), 0);
    assert_eq!(cpu.pc, CODE + 8);
}

#[test]
fn test_interp_link_register() {
    let (cpu, _) = interpret(&[jal(0x8000), NOP], |_| {});
    assert_eq!(cpu.reg(31), (CODE + 8) as u64);
    assert_eq!(cpu.pc, 0x8000);
}

#[test]
fn test_interp_overflow_in_delay_slot() {
    let (cpu, exit) = interpret(&[j(0x2000), add(3, 1, 2)], |cpu| {
        cpu.set_reg(1, 0x7FFF_FFFF);
        cpu.set_reg(2, 1);
    });
    assert_eq!(exit, BlockExit::Exception);
    assert_eq!(cpu.exc_code, ExcCode::Overflow as u32);
    assert_eq!(cpu.pc, CODE);
    assert_eq!(cpu.exc_delay_slot, 1);
    assert_eq!(cpu.reg(3), 0);
}

#[test]
fn test_interp_load_fault() {
    let (cpu, exit) = interpret(&[lw(1, 0, 0x4002)], |_| {});
    assert_eq!(exit, BlockExit::Exception);
    assert_eq!(cpu.exc_code, ExcCode::AddressLoad as u32);
    assert_eq!(cpu.cop0[ee_core::cpu::cop0::BADVADDR], DATA + 2);
    assert_eq!(cpu.pc, CODE);
}

#[test]
fn test_interp_fpu_store() {
    let code = [
        swc1(2, 0, DATA as i32),
        lwc1(3, 0, DATA as i32),
        swc1(2, 0, DATA as i32 + 2),
        syscall(0),
    ];
    let (mem, block) = block_at(&code);
    let mut cpu = CpuState::new();
    cpu.pc = CODE;
    cpu.fpr[2] = 0x4070_0000;
    let exit = Interpreter::exec_block(&mut cpu, &mem, &block);
    assert_eq!(exit, BlockExit::Exception);
    assert_eq!(mem.read::<u32>(DATA).unwrap(), 0x4070_0000);
    assert_eq!(cpu.fpr[3], 0x4070_0000);
    assert_eq!(cpu.exc_code, ExcCode::AddressStore as u32);
    assert_eq!(cpu.cop0[ee_core::cpu::cop0::BADVADDR], DATA + 2);
    assert_eq!(cpu.pc, CODE + 8);
}

#[test]
fn test_interp_user_mode_ei_faults() {
    let (mem, block) = block_at(&[addiu(1, 0, 7), EI]);
    let mut cpu = CpuState::new();
    cpu.pc = CODE;
    cpu.cop0[ee_core::cpu::cop0::STATUS] = 0b10 << 3;
    let exit = Interpreter::exec_block(&mut cpu, &mem, &block);
    assert_eq!(exit, BlockExit::Exception);
    assert_eq!(cpu.exc_code, ExcCode::CoprocessorUnusable as u32);
    assert_eq!(cpu.pc, CODE + 4);
    assert_eq!(cpu.reg(1), 7);
}

#[test]
fn test_block_fallthrough_and_page() {
    let (_, b) = block_at(&[addiu(1, 0, 1), addiu(2, 0, 2), syscall(0)]);
    assert_eq!(b.fallthrough_pc(), CODE + 12);
    assert_eq!(b.pages.len(), 1);
    assert_eq!(b.pages[0].page, ee_core::block::page_of(CODE));
    assert_eq!(b.first_page(), b.last_page());
}
