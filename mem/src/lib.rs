//! Guest memory model: a page-table fast path over host-backed RAM
//! and ROM, device dispatch on the slow path, and code-page tracking
//! for self-modifying code.

pub mod access;
pub mod backing;
pub mod device;
pub mod memory;
pub mod value;

pub use access::StoreStatus;
pub use device::{CodePageObserver, MmioDevice};
pub use memory::{GuestMemory, WriteEffect, NUM_PAGES, PHYS_SPACE};
pub use value::MemValue;
