//! Emotion Engine CPU state shared by every execution tier.

use std::ffi::c_void;
use std::mem::offset_of;

/// Number of general-purpose registers (r0-r31).
pub const NUM_GPRS: usize = 32;
/// Number of FPU registers (f0-f31).
pub const NUM_FPRS: usize = 32;
/// Number of COP0 registers.
pub const NUM_COP0: usize = 32;
/// Spill slots available to generated code: one per allocatable
/// guest value (r1-r31, HI, LO) plus one spare.
pub const SPILL_SLOTS: usize = 34;

/// A 128-bit general purpose register.
///
/// Scalar instructions only see `lo`; the multimedia (MMI) and
/// quadword load/store instructions operate on both halves.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Gpr {
    pub lo: u64,
    pub hi: u64,
}

impl Gpr {
    pub const ZERO: Gpr = Gpr { lo: 0, hi: 0 };

    #[inline]
    pub const fn from_u128(v: u128) -> Self {
        Self {
            lo: v as u64,
            hi: (v >> 64) as u64,
        }
    }

    #[inline]
    pub const fn as_u128(self) -> u128 {
        (self.lo as u128) | ((self.hi as u128) << 64)
    }
}

/// Emotion Engine architectural state plus the exit exchange used
/// by compiled blocks.
///
/// Layout must be `#[repr(C)]`: generated code addresses every
/// field relative to the env pointer held in RBP.
#[repr(C)]
pub struct CpuState {
    /// General-purpose registers. r0 always reads as zero; every
    /// writer discards values targeted at it.
    pub gpr: [Gpr; NUM_GPRS],
    pub hi: u64,
    pub lo: u64,
    /// Program counter. Between blocks this is the address of the
    /// next instruction to execute.
    pub pc: u32,
    /// FPU control/status register (FCR31).
    pub fcr31: u32,
    /// FPU registers, raw single-precision bit patterns.
    pub fpr: [u32; NUM_FPRS],
    pub cop0: [u32; NUM_COP0],
    /// Per-core spill area used by the register allocator.
    pub spill: [u64; SPILL_SLOTS],
    /// Exception code of the last synchronous exit.
    pub exc_code: u32,
    /// Non-zero when the faulting instruction sat in a delay slot.
    pub exc_delay_slot: u32,
    /// Set by runtime helpers when an access raised a guest exception.
    pub fault_pending: u32,
    /// Physical page range of the block currently executing.
    pub block_first_page: u32,
    pub block_last_page: u32,
    pub _pad: u32,
    /// Guest memory used by runtime helpers. Only valid while the
    /// dispatcher is inside a compiled block.
    pub memory: *const c_void,
}

// SAFETY: `memory` is only dereferenced by runtime helpers while the
// owning dispatcher keeps the pointee alive for the duration of a
// block; it is reset to null in between.
unsafe impl Send for CpuState {}

// Field offsets (bytes) from the start of CpuState, used by the
// code emitter.

pub const GPR_OFFSET: usize = offset_of!(CpuState, gpr);
pub const HI_OFFSET: usize = offset_of!(CpuState, hi);
pub const LO_OFFSET: usize = offset_of!(CpuState, lo);
pub const PC_OFFSET: usize = offset_of!(CpuState, pc);
pub const FCR31_OFFSET: usize = offset_of!(CpuState, fcr31);
pub const FPR_OFFSET: usize = offset_of!(CpuState, fpr);
pub const COP0_OFFSET: usize = offset_of!(CpuState, cop0);
pub const SPILL_OFFSET: usize = offset_of!(CpuState, spill);
pub const EXC_CODE_OFFSET: usize = offset_of!(CpuState, exc_code);
pub const EXC_DELAY_SLOT_OFFSET: usize = offset_of!(CpuState, exc_delay_slot);
pub const FAULT_PENDING_OFFSET: usize = offset_of!(CpuState, fault_pending);

/// Byte offset of the low 64 bits of `gpr[i]`.
pub const fn gpr_offset(i: usize) -> usize {
    GPR_OFFSET + i * 16
}

/// Byte offset of `fpr[i]`.
pub const fn fpr_offset(i: usize) -> usize {
    FPR_OFFSET + i * 4
}

/// Byte offset of `cop0[i]`.
pub const fn cop0_offset(i: usize) -> usize {
    COP0_OFFSET + i * 4
}

/// Byte offset of `spill[slot]`.
pub const fn spill_offset(slot: usize) -> usize {
    SPILL_OFFSET + slot * 8
}

/// COP0 register numbers.
pub mod cop0 {
    pub const BADVADDR: usize = 8;
    pub const COUNT: usize = 9;
    pub const COMPARE: usize = 11;
    pub const STATUS: usize = 12;
    pub const CAUSE: usize = 13;
    pub const EPC: usize = 14;
    pub const PRID: usize = 15;
    pub const CONFIG: usize = 16;
    pub const ERROR_EPC: usize = 30;
}

/// COP0 Status bits.
pub mod status {
    pub const IE: u32 = 1 << 0;
    pub const EXL: u32 = 1 << 1;
    pub const ERL: u32 = 1 << 2;
    pub const KSU_MASK: u32 = 0b11 << 3;
    pub const IM_MASK: u32 = 0xFC00;
    pub const EIE: u32 = 1 << 16;
    pub const EDI: u32 = 1 << 17;
    pub const BEV: u32 = 1 << 22;
    pub const CU0: u32 = 1 << 28;
    pub const CU1: u32 = 1 << 29;
}

/// COP0 Cause bits.
pub mod cause {
    pub const EXC_CODE_SHIFT: u32 = 2;
    pub const EXC_CODE_MASK: u32 = 0x1F << 2;
    pub const IP_MASK: u32 = 0xFC00;
    /// IP7: Count reached Compare.
    pub const IP_TIMER: u32 = 1 << 15;
    pub const CE_SHIFT: u32 = 28;
    pub const CE_MASK: u32 = 0b11 << 28;
    pub const BD: u32 = 1 << 31;
}

/// FCR31 bits.
pub mod fcr31 {
    pub const C: u32 = 1 << 23;
    pub const I: u32 = 1 << 17;
    pub const D: u32 = 1 << 16;
    pub const O: u32 = 1 << 15;
    pub const U: u32 = 1 << 14;
    pub const SI: u32 = 1 << 6;
    pub const SD: u32 = 1 << 5;
    pub const SO: u32 = 1 << 4;
    pub const SU: u32 = 1 << 3;
    /// Bits a CTC1 may change.
    pub const WRITABLE: u32 = C | I | D | O | U | SI | SD | SO | SU | 0x3;
}

/// FCR0: implementation/revision, read-only.
pub const FCR0_VALUE: u32 = 0x2E30;
/// Processor revision reported by PRId.
pub const PRID_VALUE: u32 = 0x2E20;
/// Reset vector.
pub const RESET_PC: u32 = 0xBFC0_0000;

/// Guest exception codes (Cause.ExcCode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ExcCode {
    Interrupt = 0,
    AddressLoad = 4,
    AddressStore = 5,
    InstructionBus = 6,
    DataBus = 7,
    Syscall = 8,
    Breakpoint = 9,
    ReservedInstruction = 10,
    CoprocessorUnusable = 11,
    Overflow = 12,
}

impl ExcCode {
    pub fn from_raw(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::Interrupt,
            4 => Self::AddressLoad,
            5 => Self::AddressStore,
            6 => Self::InstructionBus,
            7 => Self::DataBus,
            8 => Self::Syscall,
            9 => Self::Breakpoint,
            10 => Self::ReservedInstruction,
            11 => Self::CoprocessorUnusable,
            12 => Self::Overflow,
            _ => return None,
        })
    }

    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Interrupt => "Int",
            Self::AddressLoad => "AdEL",
            Self::AddressStore => "AdES",
            Self::InstructionBus => "IBE",
            Self::DataBus => "DBE",
            Self::Syscall => "Sys",
            Self::Breakpoint => "Bp",
            Self::ReservedInstruction => "RI",
            Self::CoprocessorUnusable => "CpU",
            Self::Overflow => "Ov",
        }
    }
}

impl std::fmt::Display for ExcCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

impl CpuState {
    pub fn new() -> Self {
        let mut cpu = Self {
            gpr: [Gpr::ZERO; NUM_GPRS],
            hi: 0,
            lo: 0,
            pc: 0,
            fcr31: 0,
            fpr: [0; NUM_FPRS],
            cop0: [0; NUM_COP0],
            spill: [0; SPILL_SLOTS],
            exc_code: 0,
            exc_delay_slot: 0,
            fault_pending: 0,
            block_first_page: 0,
            block_last_page: 0,
            _pad: 0,
            memory: std::ptr::null(),
        };
        cpu.reset();
        cpu
    }

    /// Put the core into its power-on state.
    pub fn reset(&mut self) {
        self.gpr = [Gpr::ZERO; NUM_GPRS];
        self.hi = 0;
        self.lo = 0;
        self.pc = RESET_PC;
        self.fcr31 = 0;
        self.fpr = [0; NUM_FPRS];
        self.cop0 = [0; NUM_COP0];
        self.cop0[cop0::STATUS] = status::ERL | status::BEV;
        self.cop0[cop0::PRID] = PRID_VALUE;
        self.clear_exit();
    }

    /// Clear the exit exchange before entering a block.
    #[inline]
    pub fn clear_exit(&mut self) {
        self.exc_code = 0;
        self.exc_delay_slot = 0;
        self.fault_pending = 0;
    }

    /// Low 64 bits of `gpr[r]`.
    #[inline]
    pub fn reg(&self, r: u8) -> u64 {
        self.gpr[r as usize].lo
    }

    /// Write the low 64 bits of `gpr[r]`; writes to r0 are dropped.
    #[inline]
    pub fn set_reg(&mut self, r: u8, v: u64) {
        if r != 0 {
            self.gpr[r as usize].lo = v;
        }
    }

    #[inline]
    pub fn reg128(&self, r: u8) -> u128 {
        self.gpr[r as usize].as_u128()
    }

    #[inline]
    pub fn set_reg128(&mut self, r: u8, v: u128) {
        if r != 0 {
            self.gpr[r as usize] = Gpr::from_u128(v);
        }
    }

    #[inline]
    pub fn status(&self) -> u32 {
        self.cop0[cop0::STATUS]
    }

    /// Kernel mode: KSU == 0, or EXL/ERL set.
    pub fn in_kernel_mode(&self) -> bool {
        let st = self.status();
        st & status::KSU_MASK == 0 || st & (status::EXL | status::ERL) != 0
    }

    /// Record a synchronous exception raised by a runtime helper.
    pub fn raise_fault(&mut self, code: ExcCode, badvaddr: Option<u32>) {
        self.exc_code = code as u32;
        self.fault_pending = 1;
        if let Some(addr) = badvaddr {
            self.cop0[cop0::BADVADDR] = addr;
        }
    }

    /// Owned copy of the architectural registers.
    pub fn arch_state(&self) -> ArchState {
        ArchState {
            gpr: self.gpr,
            hi: self.hi,
            lo: self.lo,
            pc: self.pc,
            fpr: self.fpr,
            fcr31: self.fcr31,
            cop0: self.cop0,
        }
    }

    /// Restore the architectural registers from a snapshot.
    pub fn load_arch_state(&mut self, s: &ArchState) {
        self.gpr = s.gpr;
        self.gpr[0] = Gpr::ZERO;
        self.hi = s.hi;
        self.lo = s.lo;
        self.pc = s.pc;
        self.fpr = s.fpr;
        self.fcr31 = s.fcr31;
        self.cop0 = s.cop0;
    }
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CpuState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuState")
            .field("pc", &format_args!("{:#010x}", self.pc))
            .field("gpr", &self.gpr)
            .field("hi", &self.hi)
            .field("lo", &self.lo)
            .field("fcr31", &self.fcr31)
            .finish_non_exhaustive()
    }
}

/// Architectural register snapshot, valid at block boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchState {
    pub gpr: [Gpr; NUM_GPRS],
    pub hi: u64,
    pub lo: u64,
    pub pc: u32,
    pub fpr: [u32; NUM_FPRS],
    pub fcr31: u32,
    pub cop0: [u32; NUM_COP0],
}

/// MIPS register names, indexed by number.
pub const GPR_NAMES: [&str; NUM_GPRS] = [
    "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3", "t0", "t1", "t2", "t3", "t4", "t5", "t6",
    "t7", "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "t8", "t9", "k0", "k1", "gp", "sp",
    "fp", "ra",
];
