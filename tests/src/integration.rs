//! Whole-program tests. Every program runs twice, compiled and
//! interpreted, and both runs must agree exactly.

use ee_core::{ArchState, CpuState, ExcCode, ExecMode};
use ee_exec::{RunExit, StepOutcome};
use proptest::prelude::*;

use crate::asm::*;
use crate::harness::{machine, CODE, DATA};

const DATA_LEN: usize = 0x100;

struct Outcome {
    exit: RunExit,
    state: ArchState,
    data: Vec<u8>,
}

fn run_mode(code: &[u32], mode: ExecMode, setup: &dyn Fn(&mut CpuState)) -> Outcome {
    let mut core = machine(code, mode);
    setup(core.cpu_mut());
    let exit = core.run_blocks(10_000).unwrap();
    let mut data = vec![0; DATA_LEN];
    core.memory().read_bytes(DATA, &mut data).unwrap();
    Outcome {
        exit,
        state: core.cpu().arch_state(),
        data,
    }
}

/// Run `code` under both tiers until it halts and return the
/// (identical) result.
fn run_both(code: &[u32], setup: impl Fn(&mut CpuState)) -> Outcome {
    let jit = run_mode(code, ExecMode::Jit, &setup);
    let interp = run_mode(code, ExecMode::Interpreter, &setup);
    assert_eq!(jit.exit, interp.exit);
    assert_eq!(jit.state, interp.state);
    assert_eq!(jit.data, interp.data);
    jit
}

fn syscall_at(pc: u32) -> RunExit {
    RunExit::GuestException {
        code: ExcCode::Syscall,
        pc,
        delay_slot: false,
    }
}

// ── Scenarios ─────────────────────────────────────────────────

#[test]
fn test_entry_block_ends_in_branch() {
    let mut core = machine(&[NOP, j(0x2000), addu(1, 1, 2)], ExecMode::Jit);
    core.cpu_mut().set_reg(1, 5);
    core.cpu_mut().set_reg(2, 10);

    assert_eq!(core.step().unwrap(), StepOutcome::Continue);
    assert_eq!(core.cpu().reg(1), 15);
    assert_eq!(core.cpu().reg(2), 10);
    assert_eq!(core.pc(), 0x2000);
    assert_eq!(core.cache().block_at(CODE).unwrap().icount, 3);
}

#[test]
fn test_write_to_cached_page_forces_rebuild() {
    let mut core = machine(&[addiu(3, 0, 1), j(0x2000), NOP], ExecMode::Jit);
    core.step().unwrap();
    assert_eq!(core.cpu().reg(3), 1);
    assert!(core.cache().lookup(CODE).is_some());

    core.memory().write::<u32>(CODE, addiu(3, 0, 7)).unwrap();
    assert!(core.cache().lookup(CODE).is_none());

    core.set_pc(CODE);
    core.step().unwrap();
    assert_eq!(core.cpu().reg(3), 7);
    assert_eq!(core.cache().stats().inserts, 2);
}

#[test]
fn test_block_patches_itself() {
    let patch = addiu(3, 0, 2);
    let code = [
        lui(5, (patch >> 16) as i32),
        ori(5, 5, (patch & 0xFFFF) as i32),
        sw(5, 0, CODE as i32 + 0x10),
        NOP,
        addiu(3, 0, 1),
        syscall(0),
    ];
    let out = run_both(&code, |_| {});
    assert_eq!(out.exit, syscall_at(CODE + 0x14));
    assert_eq!(out.state.gpr[3].lo, 2);
}

#[test]
fn test_patching_a_finished_block_takes_effect_next_time() {
    // The store targets an instruction that already ran.
    let patch = addiu(4, 0, 9);
    let code = [
        addiu(6, 6, 1),
        addiu(4, 0, 1),
        lui(5, (patch >> 16) as i32),
        ori(5, 5, (patch & 0xFFFF) as i32),
        sw(5, 0, CODE as i32 + 4),
        slti(7, 6, 2),
        bne(7, 0, -7),
        NOP,
        syscall(0),
    ];
    let out = run_both(&code, |_| {});
    assert_eq!(out.exit, syscall_at(CODE + 0x20));
    assert_eq!(out.state.gpr[6].lo, 2);
    assert_eq!(out.state.gpr[4].lo, 9);
}

// ── Programs ──────────────────────────────────────────────────

#[test]
fn test_counting_loop() {
    let code = [
        addiu(1, 0, 10),
        addiu(2, 0, 0),
        addu(2, 2, 1),
        addiu(1, 1, -1),
        bgtz(1, -3),
        NOP,
        syscall(0),
    ];
    let out = run_both(&code, |_| {});
    assert_eq!(out.exit, syscall_at(CODE + 0x18));
    assert_eq!(out.state.gpr[2].lo, 55);
    assert_eq!(out.state.gpr[1].lo, 0);
}

#[test]
fn test_call_and_return() {
    let mut code = vec![jal(CODE + 0x100), NOP, syscall(0)];
    code.resize(0x40, NOP);
    code.extend([addiu(4, 0, 9), jr(31), addiu(5, 0, 3)]);
    let out = run_both(&code, |_| {});
    assert_eq!(out.exit, syscall_at(CODE + 8));
    assert_eq!(out.state.gpr[4].lo, 9);
    assert_eq!(out.state.gpr[5].lo, 3);
    assert_eq!(out.state.gpr[31].lo, (CODE + 8) as u64);
}

#[test]
fn test_branch_likely() {
    let code = [
        beql(0, 1, 2),
        addiu(2, 0, 1),
        addiu(3, 0, 1),
        bnel(0, 1, 2),
        addiu(4, 0, 1),
        addiu(5, 0, 1),
        syscall(0),
    ];
    let out = run_both(&code, |cpu| cpu.set_reg(1, 1));
    // Not taken: delay slot skipped.
    assert_eq!(out.state.gpr[2].lo, 0);
    assert_eq!(out.state.gpr[3].lo, 1);
    // Taken: delay slot runs, target skips the next instruction.
    assert_eq!(out.state.gpr[4].lo, 1);
    assert_eq!(out.state.gpr[5].lo, 0);
}

#[test]
fn test_mult_and_divide() {
    let code = [
        mult(3, 1, 2),
        mfhi(4),
        div(1, 2),
        mflo(5),
        mfhi(6),
        divu(1, 0),
        syscall(0),
    ];
    let out = run_both(&code, |cpu| {
        cpu.set_reg(1, (-100i64) as u64);
        cpu.set_reg(2, 7);
    });
    assert_eq!(out.state.gpr[3].lo, (-700i64) as u64);
    assert_eq!(out.state.gpr[4].lo, u64::MAX);
    assert_eq!(out.state.gpr[5].lo, (-14i64) as u64);
    assert_eq!(out.state.gpr[6].lo, (-2i64) as u64);
}

#[test]
fn test_doubleword_shifts() {
    let code = [
        dsll32(2, 1, 0),
        dsra32(3, 2, 0),
        sra(4, 1, 4),
        dsrlv(5, 1, 6),
        syscall(0),
    ];
    let out = run_both(&code, |cpu| {
        cpu.set_reg(1, 0x8000_0000);
        cpu.set_reg(6, 35);
    });
    assert_eq!(out.state.gpr[2].lo, 0x8000_0000_0000_0000);
    assert_eq!(out.state.gpr[3].lo, 0xFFFF_FFFF_8000_0000);
    assert_eq!(out.state.gpr[4].lo, 0xFFFF_FFFF_F800_0000);
    assert_eq!(out.state.gpr[5].lo, 0);
}

#[test]
fn test_sign_extending_loads() {
    let code = [
        addiu(1, 0, -2),
        sw(1, 0, DATA as i32),
        lb(2, 0, DATA as i32),
        lbu(3, 0, DATA as i32),
        lh(4, 0, DATA as i32 + 2),
        lwu(5, 0, DATA as i32),
        sd(1, 0, DATA as i32 + 8),
        ld(6, 0, DATA as i32 + 8),
        syscall(0),
    ];
    let out = run_both(&code, |_| {});
    assert_eq!(out.state.gpr[2].lo, u64::MAX - 1);
    assert_eq!(out.state.gpr[3].lo, 0xFE);
    assert_eq!(out.state.gpr[4].lo, u64::MAX);
    assert_eq!(out.state.gpr[5].lo, 0xFFFF_FFFE);
    assert_eq!(out.state.gpr[6].lo, u64::MAX - 1);
    assert_eq!(&out.data[8..16], &[0xFE, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
}

#[test]
fn test_quadword_multimedia() {
    let code = [
        lq(1, 0, DATA as i32),
        lq(2, 0, DATA as i32 + 0x10),
        paddw(3, 1, 2),
        sq(3, 0, DATA as i32 + 0x20),
        syscall(0),
    ];
    let a = [1u32, 2, 3, 4];
    let b = [10u32, 20, 30, 40];
    let words = |w: [u32; 4]| w.iter().enumerate().fold(0u128, |q, (i, &x)| q | (x as u128) << (32 * i));
    let out = run_both(&code, |cpu| {
        // Loaded values replace these.
        cpu.set_reg128(1, u128::MAX);
        cpu.set_reg128(2, u128::MAX);
    });
    assert_eq!(out.state.gpr[1].as_u128(), 0);
    assert_eq!(out.state.gpr[3].as_u128(), 0);

    // Again with data in memory.
    let mut core = machine(&code, ExecMode::Jit);
    core.memory().write::<u128>(DATA, words(a)).unwrap();
    core.memory().write::<u128>(DATA + 0x10, words(b)).unwrap();
    core.run().unwrap();
    assert_eq!(core.cpu().reg128(3), words([11, 22, 33, 44]));
    assert_eq!(core.memory().read::<u128>(DATA + 0x20).unwrap(), words([11, 22, 33, 44]));
}

#[test]
fn test_float_add_and_compare() {
    let code = [
        lui(1, 0x3FC0),
        lui(2, 0x4010),
        mtc1(1, 0),
        mtc1(2, 1),
        add_s(2, 0, 1),
        mfc1(3, 2),
        c_lt_s(0, 1),
        bc1t(2),
        NOP,
        addiu(4, 0, 1),
        cfc1(5, 0),
        syscall(0),
    ];
    let out = run_both(&code, |_| {});
    assert_eq!(out.state.gpr[3].lo, 3.75f32.to_bits() as u64);
    assert_eq!(out.state.gpr[4].lo, 0);
    assert_eq!(out.state.gpr[5].lo, ee_core::cpu::FCR0_VALUE as u64);
}

#[test]
fn test_overflow_leaves_destination_untouched() {
    let out = run_both(&[addiu(2, 0, 9), add(2, 1, 1), syscall(0)], |cpu| cpu.set_reg(1, 0x7FFF_FFFF));
    assert_eq!(
        out.exit,
        RunExit::GuestException {
            code: ExcCode::Overflow,
            pc: CODE + 4,
            delay_slot: false,
        }
    );
    assert_eq!(out.state.gpr[2].lo, 9);
}

#[test]
fn test_exception_return() {
    let mut code = vec![mtc0(1, 30), ERET];
    code.resize(0x10, NOP);
    code.push(syscall(0));
    let out = run_both(&code, |cpu| cpu.set_reg(1, (CODE + 0x40) as u64));
    // ERL was set by reset: ERET returns through ErrorEPC.
    assert_eq!(out.exit, syscall_at(CODE + 0x40));
    assert_eq!(out.state.cop0[ee_core::cpu::cop0::STATUS] & ee_core::cpu::status::ERL, 0);
}

#[test]
fn test_compilation_is_reproducible() {
    let code = [addiu(1, 1, 3), sw(1, 0, DATA as i32), bne(1, 0, -3), NOP];
    let mut a = machine(&code, ExecMode::Jit);
    let mut b = machine(&code, ExecMode::Jit);
    a.step().unwrap();
    b.step().unwrap();
    let code_a = a.cache().code_at(CODE).unwrap();
    assert_eq!(code_a, b.cache().code_at(CODE).unwrap());
    assert!(!code_a.is_empty());
}

// ── Differential testing ──────────────────────────────────────

fn reg() -> impl Strategy<Value = u32> {
    1u32..8
}

fn imm() -> impl Strategy<Value = i32> {
    any::<i16>().prop_map(i32::from)
}

fn alu_insn() -> impl Strategy<Value = u32> {
    prop_oneof![
        (reg(), reg(), reg()).prop_map(|(d, s, t)| addu(d, s, t)),
        (reg(), reg(), reg()).prop_map(|(d, s, t)| add(d, s, t)),
        (reg(), reg(), reg()).prop_map(|(d, s, t)| subu(d, s, t)),
        (reg(), reg(), reg()).prop_map(|(d, s, t)| sub(d, s, t)),
        (reg(), reg(), reg()).prop_map(|(d, s, t)| and(d, s, t)),
        (reg(), reg(), reg()).prop_map(|(d, s, t)| nor(d, s, t)),
        (reg(), reg(), reg()).prop_map(|(d, s, t)| slt(d, s, t)),
        (reg(), reg(), reg()).prop_map(|(d, s, t)| sltu(d, s, t)),
        (reg(), reg(), reg()).prop_map(|(d, s, t)| daddu(d, s, t)),
        (reg(), reg(), reg()).prop_map(|(d, s, t)| dadd(d, s, t)),
    ]
}

fn imm_insn() -> impl Strategy<Value = u32> {
    prop_oneof![
        (reg(), reg(), imm()).prop_map(|(t, s, i)| addiu(t, s, i)),
        (reg(), reg(), imm()).prop_map(|(t, s, i)| addi(t, s, i)),
        (reg(), reg(), imm()).prop_map(|(t, s, i)| slti(t, s, i)),
        (reg(), reg(), imm()).prop_map(|(t, s, i)| sltiu(t, s, i)),
        (reg(), reg(), imm()).prop_map(|(t, s, i)| andi(t, s, i)),
        (reg(), reg(), imm()).prop_map(|(t, s, i)| xori(t, s, i)),
        (reg(), reg(), imm()).prop_map(|(t, s, i)| daddiu(t, s, i)),
        (reg(), reg(), imm()).prop_map(|(t, s, i)| daddi(t, s, i)),
        (reg(), imm()).prop_map(|(t, i)| lui(t, i)),
    ]
}

fn shift_insn() -> impl Strategy<Value = u32> {
    prop_oneof![
        (reg(), reg(), 0u32..32).prop_map(|(d, t, sa)| sll(d, t, sa)),
        (reg(), reg(), 0u32..32).prop_map(|(d, t, sa)| srl(d, t, sa)),
        (reg(), reg(), 0u32..32).prop_map(|(d, t, sa)| sra(d, t, sa)),
        (reg(), reg(), 0u32..32).prop_map(|(d, t, sa)| dsll(d, t, sa)),
        (reg(), reg(), 0u32..32).prop_map(|(d, t, sa)| dsra32(d, t, sa)),
        (reg(), reg(), reg()).prop_map(|(d, t, s)| sllv(d, t, s)),
        (reg(), reg(), reg()).prop_map(|(d, t, s)| srav(d, t, s)),
        (reg(), reg(), reg()).prop_map(|(d, t, s)| dsllv(d, t, s)),
        (reg(), reg(), reg()).prop_map(|(d, t, s)| dsrav(d, t, s)),
    ]
}

fn misc_insn() -> impl Strategy<Value = u32> {
    prop_oneof![
        (reg(), reg(), reg()).prop_map(|(d, s, t)| mult(d, s, t)),
        (reg(), reg(), reg()).prop_map(|(d, s, t)| multu(d, s, t)),
        (reg(), reg()).prop_map(|(s, t)| div(s, t)),
        (reg(), reg()).prop_map(|(s, t)| divu(s, t)),
        reg().prop_map(mfhi),
        reg().prop_map(mflo),
        reg().prop_map(mtlo),
        (reg(), reg(), reg()).prop_map(|(d, s, t)| movz(d, s, t)),
        (reg(), reg(), reg()).prop_map(|(d, s, t)| movn(d, s, t)),
        (reg(), reg(), reg()).prop_map(|(d, s, t)| por(d, s, t)),
    ]
}

fn mem_insn() -> impl Strategy<Value = u32> {
    let slot = |align: i32| (0..DATA_LEN as i32 / align).prop_map(move |i| DATA as i32 + i * align);
    prop_oneof![
        (reg(), slot(4)).prop_map(|(t, a)| sw(t, 0, a)),
        (reg(), slot(4)).prop_map(|(t, a)| lw(t, 0, a)),
        (reg(), slot(1)).prop_map(|(t, a)| sb(t, 0, a)),
        (reg(), slot(1)).prop_map(|(t, a)| lb(t, 0, a)),
        (reg(), slot(8)).prop_map(|(t, a)| sd(t, 0, a)),
        (reg(), slot(8)).prop_map(|(t, a)| ld(t, 0, a)),
        (reg(), slot(16)).prop_map(|(t, a)| sq(t, 0, a)),
        (reg(), slot(16)).prop_map(|(t, a)| lq(t, 0, a)),
        // Address taken from a register: usually faults.
        (reg(), reg(), imm()).prop_map(|(t, b, i)| lh(t, b, i)),
    ]
}

fn fpu_insn() -> impl Strategy<Value = u32> {
    let f = || 0u32..4;
    prop_oneof![
        (reg(), f()).prop_map(|(t, s)| mtc1(t, s)),
        (reg(), f()).prop_map(|(t, s)| mfc1(t, s)),
        (f(), f(), f()).prop_map(|(d, s, t)| add_s(d, s, t)),
        (f(), f(), f()).prop_map(|(d, s, t)| mul_s(d, s, t)),
        (f(), f()).prop_map(|(s, t)| c_lt_s(s, t)),
        reg().prop_map(|t| cfc1(t, 31)),
    ]
}

fn insn() -> impl Strategy<Value = u32> {
    prop_oneof![
        3 => alu_insn(),
        3 => imm_insn(),
        2 => shift_insn(),
        2 => misc_insn(),
        2 => mem_insn(),
        1 => fpu_insn(),
    ]
}

/// A straight-line body, optionally closed by a forward branch whose
/// delay slot is another random instruction.
fn program() -> impl Strategy<Value = Vec<u32>> {
    (
        prop::collection::vec(insn(), 1..32),
        prop::option::of((reg(), reg(), insn(), any::<bool>())),
    )
        .prop_map(|(mut body, tail)| {
            if let Some((s, t, slot, likely)) = tail {
                body.push(if likely { beql(s, t, 2) } else { bne(s, t, 2) });
                body.push(slot);
                body.push(addiu(7, 7, 1));
                body.push(NOP);
            }
            body.push(syscall(0));
            body
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_jit_matches_interpreter(
        code in program(),
        regs in prop::array::uniform8(any::<u64>()),
        uppers in prop::array::uniform8(any::<u64>()),
    ) {
        let setup = |cpu: &mut CpuState| {
            for r in 1..8 {
                cpu.set_reg128(r as u8, (uppers[r] as u128) << 64 | regs[r] as u128);
            }
        };
        let jit = run_mode(&code, ExecMode::Jit, &setup);
        let interp = run_mode(&code, ExecMode::Interpreter, &setup);
        prop_assert_eq!(jit.exit, interp.exit);
        prop_assert_eq!(jit.state, interp.state);
        prop_assert_eq!(jit.data, interp.data);
    }
}

#[test]
fn test_core_exit_states_match_after_fault() {
    // A load fault in the middle of a block: earlier writes stay.
    let code = [addiu(1, 0, 1), addiu(2, 0, 2), lw(3, 2, 0), addiu(4, 0, 4), syscall(0)];
    let out = run_both(&code, |_| {});
    assert_eq!(
        out.exit,
        RunExit::GuestException {
            code: ExcCode::AddressLoad,
            pc: CODE + 8,
            delay_slot: false,
        }
    );
    assert_eq!(out.state.gpr[2].lo, 2);
    assert_eq!(out.state.gpr[4].lo, 0);
    assert_eq!(out.state.cop0[ee_core::cpu::cop0::BADVADDR], 2);
}
