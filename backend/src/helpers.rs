//! Runtime helpers called from generated code.
//!
//! Every helper takes the `CpuState` pointer first (System V `rdi`)
//! and finds guest memory through `CpuState::memory`. Faults are
//! recorded in the CPU state (`fault_pending`, `exc_code`, BadVAddr);
//! generated code checks for them after the call returns.

use ee_core::cpu::CpuState;
use ee_core::op::{FpuCond, FpuOp, MmiOp};
use ee_core::semantics::{cop0, fpu, mmi, muldiv};
use ee_mem::access::{self, StoreStatus};
use ee_mem::{GuestMemory, MemValue};

/// # Safety
/// `env` must be the CPU state of the running block, with `memory`
/// pointing at a live `GuestMemory`.
#[inline]
unsafe fn split<'a>(env: *mut CpuState) -> (&'a mut CpuState, &'a GuestMemory) {
    let cpu = &mut *env;
    let mem = &*(cpu.memory as *const GuestMemory);
    (cpu, mem)
}

#[inline]
unsafe fn load<T: MemValue + Into<u64>>(env: *mut CpuState, vaddr: u32) -> u64 {
    let (cpu, mem) = split(env);
    access::load::<T>(cpu, mem, vaddr).map_or(0, Into::into)
}

#[inline]
unsafe fn store<T: MemValue>(env: *mut CpuState, vaddr: u32, value: T) -> u32 {
    let (cpu, mem) = split(env);
    access::store::<T>(cpu, mem, vaddr, value) as u32
}

// -- Loads: zero-extended raw value; extension is done inline. --

pub unsafe extern "C" fn load_u8(env: *mut CpuState, vaddr: u32) -> u64 {
    load::<u8>(env, vaddr)
}

pub unsafe extern "C" fn load_u16(env: *mut CpuState, vaddr: u32) -> u64 {
    load::<u16>(env, vaddr)
}

pub unsafe extern "C" fn load_u32(env: *mut CpuState, vaddr: u32) -> u64 {
    load::<u32>(env, vaddr)
}

pub unsafe extern "C" fn load_u64(env: *mut CpuState, vaddr: u32) -> u64 {
    load::<u64>(env, vaddr)
}

/// LQ writes all 128 bits of `rt` in the register file.
pub unsafe extern "C" fn load_quad(env: *mut CpuState, vaddr: u32, rt: u32) {
    let (cpu, mem) = split(env);
    if let Some(v) = access::load::<u128>(cpu, mem, vaddr) {
        cpu.set_reg128(rt as u8, v);
    }
}

// -- Stores: return a `StoreStatus`. --

pub unsafe extern "C" fn store_u8(env: *mut CpuState, vaddr: u32, value: u64) -> u32 {
    store::<u8>(env, vaddr, value as u8)
}

pub unsafe extern "C" fn store_u16(env: *mut CpuState, vaddr: u32, value: u64) -> u32 {
    store::<u16>(env, vaddr, value as u16)
}

pub unsafe extern "C" fn store_u32(env: *mut CpuState, vaddr: u32, value: u64) -> u32 {
    store::<u32>(env, vaddr, value as u32)
}

pub unsafe extern "C" fn store_u64(env: *mut CpuState, vaddr: u32, value: u64) -> u32 {
    store::<u64>(env, vaddr, value)
}

/// SQ stores all 128 bits of `rt` from the register file.
pub unsafe extern "C" fn store_quad(env: *mut CpuState, vaddr: u32, rt: u32) -> u32 {
    let (cpu, mem) = split(env);
    let v = cpu.reg128(rt as u8);
    access::store::<u128>(cpu, mem, vaddr, v) as u32
}

// -- Divide: `(lo, hi)` packed into one word. --

pub extern "C" fn div(rs: u64, rt: u64) -> u64 {
    let (lo, hi) = muldiv::div(rs, rt);
    muldiv::pack(lo, hi)
}

pub extern "C" fn divu(rs: u64, rt: u64) -> u64 {
    let (lo, hi) = muldiv::divu(rs, rt);
    muldiv::pack(lo, hi)
}

// -- COP0 --

pub unsafe extern "C" fn mfc0(env: *mut CpuState, rd: u32) -> u64 {
    cop0::mfc0(&mut *env, rd as u8).map_or(0, u64::from)
}

/// Returns 0 after recording a fault.
pub unsafe extern "C" fn mtc0(env: *mut CpuState, rd: u32, value: u64) -> u32 {
    cop0::mtc0(&mut *env, rd as u8, value as u32) as u32
}

/// Returns 0 after recording a fault; otherwise `pc` holds the
/// return address.
pub unsafe extern "C" fn eret(env: *mut CpuState) -> u32 {
    cop0::eret(&mut *env) as u32
}

/// Returns 0 after recording a fault.
pub unsafe extern "C" fn set_eie(env: *mut CpuState, enable: u32) -> u32 {
    cop0::set_eie(&mut *env, enable != 0) as u32
}

// -- COP1 --

pub unsafe extern "C" fn fpu_arith(env: *mut CpuState, op: u32, fd: u32, fs: u32, ft: u32) {
    if let Some(op) = FpuOp::from_u8(op as u8) {
        fpu::arith(&mut *env, op, fd as u8, fs as u8, ft as u8);
    }
}

pub unsafe extern "C" fn fpu_compare(env: *mut CpuState, cond: u32, fs: u32, ft: u32) {
    if let Some(cond) = FpuCond::from_u8(cond as u8) {
        fpu::compare(&mut *env, cond, fs as u8, ft as u8);
    }
}

// -- MMI: operands and result live in the register file. --

pub unsafe extern "C" fn mmi(env: *mut CpuState, op: u32, rd: u32, rs: u32, rt: u32) {
    let cpu = &mut *env;
    if let Some(op) = MmiOp::from_u8(op as u8) {
        let v = mmi::eval(op, cpu.reg128(rs as u8), cpu.reg128(rt as u8));
        cpu.set_reg128(rd as u8, v);
    }
}

/// Status values a store helper can return.
pub const STORE_FAULT: u32 = StoreStatus::Fault as u32;
pub const STORE_CODE_MODIFIED: u32 = StoreStatus::CodeModified as u32;
