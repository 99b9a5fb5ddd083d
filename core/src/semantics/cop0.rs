//! System control coprocessor: privilege checks, exception entry and
//! interrupt delivery.

use crate::cpu::{cause, cop0, status, CpuState, ExcCode};

/// General exception vector offset.
pub const VECTOR_GENERAL: u32 = 0x180;
/// Interrupt vector offset.
pub const VECTOR_INTERRUPT: u32 = 0x200;
const BASE_NORMAL: u32 = 0x8000_0000;
const BASE_BOOTSTRAP: u32 = 0xBFC0_0200;

/// COP0 instructions need kernel mode or Status.CU0.
pub fn usable(cpu: &CpuState) -> bool {
    cpu.in_kernel_mode() || cpu.status() & status::CU0 != 0
}

/// Record a coprocessor-unusable fault for COP0.
pub fn raise_unusable(cpu: &mut CpuState) {
    cpu.cop0[cop0::CAUSE] &= !cause::CE_MASK;
    cpu.raise_fault(ExcCode::CoprocessorUnusable, None);
}

/// MFC0. Returns `None` after recording a fault.
pub fn mfc0(cpu: &mut CpuState, rd: u8) -> Option<u32> {
    if !usable(cpu) {
        raise_unusable(cpu);
        return None;
    }
    Some(cpu.cop0[rd as usize & 31])
}

/// MTC0. Returns `false` after recording a fault.
pub fn mtc0(cpu: &mut CpuState, rd: u8, value: u32) -> bool {
    if !usable(cpu) {
        raise_unusable(cpu);
        return false;
    }
    match rd as usize & 31 {
        cop0::PRID => {}
        cop0::CAUSE => {
            // Only the two software interrupt bits are writable.
            let c = &mut cpu.cop0[cop0::CAUSE];
            *c = (*c & !0x300) | (value & 0x300);
        }
        cop0::COMPARE => {
            cpu.cop0[cop0::COMPARE] = value;
            cpu.cop0[cop0::CAUSE] &= !cause::IP_TIMER;
        }
        n => cpu.cop0[n] = value,
    }
    true
}

/// ERET: return from exception or error level.
pub fn eret(cpu: &mut CpuState) -> bool {
    if !usable(cpu) {
        raise_unusable(cpu);
        return false;
    }
    let st = cpu.status();
    if st & status::ERL != 0 {
        cpu.pc = cpu.cop0[cop0::ERROR_EPC];
        cpu.cop0[cop0::STATUS] = st & !status::ERL;
    } else {
        cpu.pc = cpu.cop0[cop0::EPC];
        cpu.cop0[cop0::STATUS] = st & !status::EXL;
    }
    true
}

/// EI/DI toggle Status.EIE. Without COP0 access they fault like any
/// other COP0 instruction. With access through CU0 alone, outside
/// kernel mode, they only take effect when Status.EDI is set and are
/// no-ops otherwise. Returns `false` after recording a fault.
pub fn set_eie(cpu: &mut CpuState, enable: bool) -> bool {
    if !usable(cpu) {
        raise_unusable(cpu);
        return false;
    }
    let st = cpu.status();
    if cpu.in_kernel_mode() || st & status::EDI != 0 {
        cpu.cop0[cop0::STATUS] = if enable {
            st | status::EIE
        } else {
            st & !status::EIE
        };
    }
    true
}

/// Latch external interrupt lines into Cause.IP (bits 10-15). A
/// pending timer interrupt stays set until Compare is written.
pub fn latch_interrupts(cpu: &mut CpuState, pending: u32) {
    let c = &mut cpu.cop0[cop0::CAUSE];
    let keep = *c & cause::IP_TIMER;
    *c = (*c & !cause::IP_MASK) | (pending & cause::IP_MASK) | keep;
}

/// Advance Count by `insns` executed instructions, raising the timer
/// interrupt when it passes Compare.
pub fn advance_count(cpu: &mut CpuState, insns: u32) {
    let before = cpu.cop0[cop0::COUNT];
    cpu.cop0[cop0::COUNT] = before.wrapping_add(insns);
    let until_match = cpu.cop0[cop0::COMPARE].wrapping_sub(before).wrapping_sub(1);
    if until_match < insns {
        cpu.cop0[cop0::CAUSE] |= cause::IP_TIMER;
    }
}

/// Whether an unmasked interrupt can be taken now.
pub fn interrupt_deliverable(cpu: &CpuState) -> bool {
    let st = cpu.status();
    let enabled = st & status::IE != 0 && st & status::EIE != 0;
    let blocked = st & (status::EXL | status::ERL) != 0;
    let pending = st & status::IM_MASK & cpu.cop0[cop0::CAUSE] & cause::IP_MASK;
    enabled && !blocked && pending != 0
}

/// Enter the exception handler for `code`.
///
/// `pc` is the address to restart at: the faulting instruction, or
/// the branch owning the delay slot when `delay_slot` is set.
pub fn enter_exception(cpu: &mut CpuState, code: ExcCode, pc: u32, delay_slot: bool) {
    let st = cpu.status();
    let mut c = cpu.cop0[cop0::CAUSE] & !cause::EXC_CODE_MASK;
    c |= (code as u32) << cause::EXC_CODE_SHIFT;
    if st & status::EXL == 0 {
        cpu.cop0[cop0::EPC] = pc;
        if delay_slot {
            c |= cause::BD;
        } else {
            c &= !cause::BD;
        }
    }
    cpu.cop0[cop0::CAUSE] = c;
    cpu.cop0[cop0::STATUS] = st | status::EXL;
    let offset = if code == ExcCode::Interrupt {
        VECTOR_INTERRUPT
    } else {
        VECTOR_GENERAL
    };
    cpu.pc = if st & status::BEV != 0 {
        BASE_BOOTSTRAP + offset
    } else {
        BASE_NORMAL + offset
    };
}
