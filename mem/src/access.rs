//! Guest data accesses with CPU semantics: alignment checks, bus
//! errors and self-modifying-code detection. Both execution tiers go
//! through these functions, so a store can never bypass the code-page
//! check.

use ee_core::cpu::CpuState;
use ee_core::ExcCode;

use crate::memory::GuestMemory;
use crate::value::MemValue;

/// Result of a guest store, as returned to generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StoreStatus {
    Ok = 0,
    /// The store raised a guest exception (recorded in the CPU state).
    Fault = 1,
    /// The store succeeded and invalidated the block that is running.
    CodeModified = 2,
}

/// Load a value from `vaddr`.
///
/// Returns `None` after recording an address error or bus error.
/// Quadword accesses ignore the low four address bits; every other
/// width must be naturally aligned.
pub fn load<T: MemValue>(cpu: &mut CpuState, mem: &GuestMemory, vaddr: u32) -> Option<T> {
    let addr = if T::SIZE == 16 { vaddr & !0xF } else { vaddr };
    if addr as usize % T::SIZE != 0 {
        cpu.raise_fault(ExcCode::AddressLoad, Some(vaddr));
        return None;
    }
    match mem.read::<T>(addr) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(addr = format_args!("{vaddr:#010x}"), %e, "guest load fault");
            cpu.raise_fault(ExcCode::DataBus, Some(vaddr));
            None
        }
    }
}

/// Store `v` at `vaddr`.
///
/// A store that invalidates a page of the block currently executing
/// (the range in `cpu.block_first_page..=cpu.block_last_page`)
/// reports `CodeModified` so the block stops right after it.
pub fn store<T: MemValue>(cpu: &mut CpuState, mem: &GuestMemory, vaddr: u32, v: T) -> StoreStatus {
    let addr = if T::SIZE == 16 { vaddr & !0xF } else { vaddr };
    if addr as usize % T::SIZE != 0 {
        cpu.raise_fault(ExcCode::AddressStore, Some(vaddr));
        return StoreStatus::Fault;
    }
    match mem.write::<T>(addr, v) {
        Ok(effect) if effect.hits(cpu.block_first_page, cpu.block_last_page) => {
            StoreStatus::CodeModified
        }
        Ok(_) => StoreStatus::Ok,
        Err(e) => {
            tracing::warn!(addr = format_args!("{vaddr:#010x}"), %e, "guest store fault");
            cpu.raise_fault(ExcCode::DataBus, Some(vaddr));
            StoreStatus::Fault
        }
    }
}
