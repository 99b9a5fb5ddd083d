use std::sync::Mutex;

/// A memory-mapped device. Accesses are synchronous and must
/// complete immediately; `offset` is relative to the start of the
/// mapped range and `size` is 1, 2, 4, 8 or 16 bytes.
pub trait MmioDevice: Send {
    fn read(&mut self, offset: u32, size: u32) -> u128;
    fn write(&mut self, offset: u32, size: u32, value: u128);
}

pub(crate) struct DeviceRange {
    pub base: u32,
    pub size: u32,
    pub dev: Mutex<Box<dyn MmioDevice>>,
}

impl DeviceRange {
    pub fn contains(&self, paddr: u32) -> bool {
        paddr >= self.base && paddr - self.base < self.size
    }

    pub fn overlaps(&self, base: u32, size: u32) -> bool {
        let end = base as u64 + size as u64;
        let self_end = self.base as u64 + self.size as u64;
        (base as u64) < self_end && (self.base as u64) < end
    }
}

/// Receives notification that a page holding translated code was
/// written. Called synchronously on the writing thread, before the
/// write returns.
pub trait CodePageObserver: Send + Sync {
    fn code_page_written(&self, page: u32);
}
