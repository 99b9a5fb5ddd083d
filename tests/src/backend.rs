//! Code buffer, executable arena and the x86-64 code generator.

use std::ffi::c_void;
use std::sync::Arc;

use ee_backend::{allocate, CodeBuffer, ExecArena, Trampoline, X86_64CodeGen};
use ee_core::{BlockExit, CpuState, ExcCode, GuestReg};

use crate::asm::*;
use crate::harness::{build, compile, load, memory, CODE, DATA};

// ── Code buffer ───────────────────────────────────────────────

#[test]
fn test_emit_and_read() {
    let mut buf = CodeBuffer::new();
    buf.emit_u8(0x90);
    buf.emit_u32(0xDEADBEEF);
    assert_eq!(buf.offset(), 5);
    assert_eq!(buf.as_slice()[0], 0x90);
    assert_eq!(buf.read_u32(1), 0xDEADBEEF);
}

#[test]
fn test_patch() {
    let mut buf = CodeBuffer::new();
    buf.emit_u32(0);
    buf.patch_u32(0, 0x12345678);
    assert_eq!(buf.read_u32(0), 0x12345678);
    assert_eq!(buf.into_vec(), vec![0x78, 0x56, 0x34, 0x12]);
}

// ── Translation ───────────────────────────────────────────────

#[test]
fn test_translation_is_deterministic() {
    let mem = memory();
    load(
        &mem,
        CODE,
        &[lui(1, 0x1234), ori(1, 1, 0x5678), lw(2, 1, 4), beq(1, 2, 8), addu(3, 1, 2)],
    );
    let block = build(&mem, CODE);
    assert_eq!(compile(&block).code, compile(&block).code);
}

#[test]
fn test_register_pressure_spills() {
    let mem = memory();
    let mut code: Vec<u32> = (1..=7).map(|r| addiu(r, 0, r as i32)).collect();
    code.extend((1..=7).map(|r| addu(r + 10, r, r)));
    code.push(syscall(0));
    load(&mem, CODE, &code);
    let block = build(&mem, CODE);
    let alloc = allocate(&block).unwrap();
    let compiled = compile(&block);
    assert!(compiled.spills > 0);
    assert_eq!(compiled.spills, alloc.spill_count());
}

#[test]
fn test_clobber_set_lists_written_registers() {
    let mem = memory();
    load(
        &mem,
        CODE,
        &[addiu(1, 0, 5), mult(3, 1, 1), sw(1, 2, 0), jal(0x2000), NOP],
    );
    let block = build(&mem, CODE);
    let clobbers = compile(&block).clobbers;
    for r in [GuestReg::Gpr(1), GuestReg::Gpr(3), GuestReg::Gpr(31), GuestReg::Hi, GuestReg::Lo] {
        assert!(clobbers.contains(r), "{r} missing from {clobbers:?}");
    }
    assert!(!clobbers.contains(GuestReg::Gpr(2)));
    assert!(!clobbers.contains(GuestReg::Gpr(0)));
    assert_eq!(clobbers.count(), 5);
}

/// Compile the block at `CODE` and run it once on a fresh CPU.
fn run_compiled(code: &[u32], setup: impl FnOnce(&mut CpuState)) -> (CpuState, BlockExit) {
    let mem = memory();
    load(&mem, CODE, code);
    let block = build(&mem, CODE);
    let compiled = compile(&block);

    let mut arena = ExecArena::new(1 << 16).unwrap();
    let off = arena.alloc(&compiled.code).unwrap();
    let trampoline = Trampoline::new(&X86_64CodeGen::new()).unwrap();

    let mut cpu = CpuState::new();
    cpu.pc = CODE;
    setup(&mut cpu);
    cpu.block_first_page = block.first_page();
    cpu.block_last_page = block.last_page();
    cpu.memory = Arc::as_ptr(&mem) as *const c_void;
    // SAFETY: the arena holds the whole block and `mem` outlives the call.
    let raw = unsafe { trampoline.enter(&mut cpu, arena.ptr_at(off)) };
    cpu.memory = std::ptr::null();
    (cpu, BlockExit::from_raw(raw).unwrap())
}

#[test]
fn test_compiled_block_updates_registers() {
    let (cpu, exit) = run_compiled(&[addiu(1, 0, 5), addiu(2, 0, 10), j(0x2000), addu(1, 1, 2)], |_| {});
    assert_eq!(exit, BlockExit::Branch);
    assert_eq!(cpu.reg(1), 15);
    assert_eq!(cpu.reg(2), 10);
    assert_eq!(cpu.pc, 0x2000);
}

#[test]
fn test_compiled_block_preserves_upper_halves() {
    let (cpu, _) = run_compiled(&[addiu(1, 1, 1), syscall(0)], |cpu| {
        cpu.set_reg128(1, (0xAAAA_u128 << 64) | 41);
    });
    assert_eq!(cpu.reg128(1), (0xAAAA_u128 << 64) | 42);
}

#[test]
fn test_compiled_user_mode_di_faults() {
    let (cpu, exit) = run_compiled(&[addiu(1, 0, 7), DI], |cpu| {
        cpu.cop0[ee_core::cpu::cop0::STATUS] = 0b10 << 3;
    });
    assert_eq!(exit, BlockExit::Exception);
    assert_eq!(cpu.exc_code, ExcCode::CoprocessorUnusable as u32);
    assert_eq!(cpu.pc, CODE + 4);
    assert_eq!(cpu.reg(1), 7);
}

#[test]
fn test_compiled_fault_reports_pc() {
    let (cpu, exit) = run_compiled(&[addiu(1, 0, 3), lw(2, 0, DATA as i32 + 2)], |_| {});
    assert_eq!(exit, BlockExit::Exception);
    assert_eq!(cpu.exc_code, ExcCode::AddressLoad as u32);
    assert_eq!(cpu.pc, CODE + 4);
    assert_eq!(cpu.exc_delay_slot, 0);
    // Completed instructions are visible.
    assert_eq!(cpu.reg(1), 3);
}

#[test]
fn test_compiled_fault_in_delay_slot() {
    let (cpu, exit) = run_compiled(&[jr(4), sw(0, 0, DATA as i32 + 1)], |cpu| cpu.set_reg(4, 0x3000));
    assert_eq!(exit, BlockExit::Exception);
    assert_eq!(cpu.exc_code, ExcCode::AddressStore as u32);
    assert_eq!(cpu.pc, CODE);
    assert_eq!(cpu.exc_delay_slot, 1);
}

#[test]
fn test_compiled_fallthrough() {
    let mem = memory();
    load(&mem, CODE, &[addiu(1, 1, 1); 4]);
    // Blocks cut by the instruction limit fall through.
    let block = ee_frontend::BlockBuilder::new(&mem, 2).build(CODE).unwrap();
    let compiled = compile(&block);
    let mut arena = ExecArena::new(1 << 16).unwrap();
    let off = arena.alloc(&compiled.code).unwrap();
    let trampoline = Trampoline::new(&X86_64CodeGen::new()).unwrap();
    let mut cpu = CpuState::new();
    cpu.memory = Arc::as_ptr(&mem) as *const c_void;
    // SAFETY: as in `run_compiled`.
    let raw = unsafe { trampoline.enter(&mut cpu, arena.ptr_at(off)) };
    assert_eq!(BlockExit::from_raw(raw), Some(BlockExit::Fallthrough));
    assert_eq!(cpu.pc, CODE + 8);
    assert_eq!(cpu.reg(1), 2);
}
