use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock, Weak};

use ee_core::block::page_of;
use ee_core::{virt_to_phys, MemError, MemoryConfig, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
use tracing::{debug, trace};

use crate::backing::HostBacking;
use crate::device::{CodePageObserver, DeviceRange, MmioDevice};
use crate::value::MemValue;

/// Physical address space covered by the page table.
pub const PHYS_SPACE: u64 = 1 << 29;
/// Number of physical pages.
pub const NUM_PAGES: usize = (PHYS_SPACE >> PAGE_SHIFT) as usize;

// Page table entry layout:
//   bit 0       page holds translated code
//   bit 1       read-only
//   bits 2..32  backing page number
//   bits 32..64 version, bumped on every code-page write
const CODE: u64 = 1 << 0;
const READ_ONLY: u64 = 1 << 1;
const FLAGS: u64 = CODE | READ_ONLY;
const FRAME_SHIFT: u32 = 2;
const VERSION_SHIFT: u32 = 32;
const VERSION_ONE: u64 = 1 << VERSION_SHIFT;
/// Low word of an unmapped entry. Both flag bits are set so the
/// write fast path needs a single test.
const UNMAPPED: u64 = 0xFFFF_FFFF;

#[inline]
const fn is_unmapped(e: u64) -> bool {
    e & 0xFFFF_FFFF == UNMAPPED
}

#[inline]
const fn frame_of(e: u64) -> usize {
    ((e & 0xFFFF_FFFF) >> FRAME_SHIFT) as usize
}

#[inline]
const fn version_of(e: u64) -> u32 {
    (e >> VERSION_SHIFT) as u32
}

/// What a successful write did besides storing the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteEffect {
    Plain,
    /// Pages `first..=last` held translated code, which has been
    /// invalidated.
    CodeInvalidated { first: u32, last: u32 },
}

impl WriteEffect {
    /// Whether the invalidated pages intersect `first..=last`.
    pub fn hits(&self, first: u32, last: u32) -> bool {
        match *self {
            Self::Plain => false,
            Self::CodeInvalidated { first: f, last: l } => f <= last && first <= l,
        }
    }

    fn merge(self, other: WriteEffect) -> WriteEffect {
        match (self, other) {
            (Self::Plain, e) | (e, Self::Plain) => e,
            (
                Self::CodeInvalidated { first: a, last: b },
                Self::CodeInvalidated { first: c, last: d },
            ) => Self::CodeInvalidated {
                first: a.min(c),
                last: b.max(d),
            },
        }
    }
}

struct Layout {
    /// Next free backing page.
    next_frame: usize,
}

/// The guest physical address space.
///
/// All methods take `&self`: one instance is shared by every core.
/// Page-table entries are atomics; mapping changes are serialized by
/// an internal lock.
pub struct GuestMemory {
    backing: HostBacking,
    table: Box<[AtomicU64]>,
    layout: Mutex<Layout>,
    devices: RwLock<Vec<DeviceRange>>,
    observers: RwLock<Vec<Weak<dyn CodePageObserver>>>,
}

impl GuestMemory {
    /// Create an empty address space with `backing_size` bytes of
    /// host memory available for RAM and ROM.
    pub fn new(backing_size: usize) -> Result<Self, MemError> {
        let backing = HostBacking::new(backing_size)?;
        let table = (0..NUM_PAGES).map(|_| AtomicU64::new(UNMAPPED)).collect();
        Ok(Self {
            backing,
            table,
            layout: Mutex::new(Layout { next_frame: 0 }),
            devices: RwLock::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
        })
    }

    /// Create an address space with RAM mapped per `cfg`.
    pub fn with_config(cfg: &MemoryConfig) -> Result<Self, MemError> {
        let mem = Self::new(cfg.ram_size as usize + cfg.rom_reserve as usize)?;
        mem.map_ram(cfg.ram_base, cfg.ram_size)?;
        Ok(mem)
    }

    fn check_region(&self, base: u32, size: u32) -> Result<(), MemError> {
        let end = base as u64 + size as u64;
        if size == 0 || base & PAGE_MASK != 0 || size & PAGE_MASK != 0 || end > PHYS_SPACE {
            return Err(MemError::BadRegion { base, size });
        }
        let first = page_of(base) as usize;
        let count = (size >> PAGE_SHIFT) as usize;
        let mapped = self.table[first..first + count]
            .iter()
            .any(|e| !is_unmapped(e.load(Ordering::Relaxed)));
        let device = self
            .devices
            .read()
            .map_or(false, |d| d.iter().any(|r| r.overlaps(base, size)));
        if mapped || device {
            return Err(MemError::Overlap { base, size });
        }
        Ok(())
    }

    fn map_frames(&self, base: u32, size: u32, flags: u64) -> Result<usize, MemError> {
        let mut layout = self.layout.lock().unwrap_or_else(|e| e.into_inner());
        self.check_region(base, size)?;
        let count = (size >> PAGE_SHIFT) as usize;
        let total = self.backing.size() / PAGE_SIZE as usize;
        if layout.next_frame + count > total {
            return Err(MemError::OutOfBacking {
                requested: size as usize,
                available: (total - layout.next_frame) * PAGE_SIZE as usize,
            });
        }
        let frame0 = layout.next_frame;
        layout.next_frame += count;
        let first = page_of(base) as usize;
        for i in 0..count {
            let e = (((frame0 + i) as u64) << FRAME_SHIFT) | flags;
            self.table[first + i].store(e, Ordering::Release);
        }
        Ok(frame0)
    }

    /// Map zero-filled RAM at physical `base`.
    pub fn map_ram(&self, base: u32, size: u32) -> Result<(), MemError> {
        self.map_frames(base, size, 0)?;
        debug!(base = format_args!("{base:#010x}"), size, "mapped ram");
        Ok(())
    }

    /// Map a read-only image at physical `base`. The mapping is
    /// rounded up to whole pages.
    pub fn map_rom(&self, base: u32, image: &[u8]) -> Result<(), MemError> {
        let size = (image.len() as u32).max(1).next_multiple_of(PAGE_SIZE);
        let frame0 = self.map_frames(base, size, READ_ONLY)?;
        let dst = self.backing.ptr(frame0 * PAGE_SIZE as usize);
        // SAFETY: the frames were just allocated and hold `size` bytes.
        unsafe { std::ptr::copy_nonoverlapping(image.as_ptr(), dst, image.len()) };
        debug!(base = format_args!("{base:#010x}"), size, "mapped rom");
        Ok(())
    }

    /// Route physical `base..base+size` to a device handler.
    pub fn map_device(
        &self,
        base: u32,
        size: u32,
        dev: Box<dyn MmioDevice>,
    ) -> Result<(), MemError> {
        let _layout = self.layout.lock().unwrap_or_else(|e| e.into_inner());
        let end = base as u64 + size as u64;
        if size == 0 || end > PHYS_SPACE {
            return Err(MemError::BadRegion { base, size });
        }
        let first = page_of(base) as usize;
        let last = page_of((end - 1) as u32) as usize;
        let ram = self.table[first..=last]
            .iter()
            .any(|e| !is_unmapped(e.load(Ordering::Relaxed)));
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        if ram || devices.iter().any(|r| r.overlaps(base, size)) {
            return Err(MemError::Overlap { base, size });
        }
        let pos = devices.partition_point(|r| r.base < base);
        devices.insert(
            pos,
            DeviceRange {
                base,
                size,
                dev: Mutex::new(dev),
            },
        );
        debug!(base = format_args!("{base:#010x}"), size, "mapped device");
        Ok(())
    }

    /// Register a callback run whenever a code page is written.
    /// Observers that have been dropped are skipped and pruned.
    pub fn register_code_page_observer(&self, observer: Weak<dyn CodePageObserver>) {
        let mut obs = self.observers.write().unwrap_or_else(|e| e.into_inner());
        obs.retain(|o| o.strong_count() > 0);
        obs.push(observer);
    }

    #[inline]
    fn entry(&self, page: u32) -> u64 {
        self.table[page as usize].load(Ordering::Acquire)
    }

    #[inline]
    fn host(&self, e: u64, off: u32) -> *mut u8 {
        self.backing.ptr(frame_of(e) * PAGE_SIZE as usize + off as usize)
    }

    /// Whether a virtual address is backed by RAM, ROM or a device.
    pub fn is_mapped(&self, vaddr: u32) -> bool {
        let paddr = virt_to_phys(vaddr);
        !is_unmapped(self.entry(page_of(paddr))) || self.device_at(paddr).is_some()
    }

    fn device_at(&self, paddr: u32) -> Option<usize> {
        let devices = self.devices.read().ok()?;
        let pos = devices.partition_point(|r| r.base <= paddr);
        pos.checked_sub(1).filter(|&i| devices[i].contains(paddr))
    }

    /// Typed read of a little-endian value.
    #[inline]
    pub fn read<T: MemValue>(&self, vaddr: u32) -> Result<T, MemError> {
        let paddr = virt_to_phys(vaddr);
        let off = paddr & PAGE_MASK;
        if off as usize + T::SIZE <= PAGE_SIZE as usize {
            let e = self.entry(page_of(paddr));
            if !is_unmapped(e) {
                // SAFETY: the entry maps a live backing frame and the
                // access stays inside it.
                return Ok(unsafe { T::load(self.host(e, off)) });
            }
        }
        self.read_slow(vaddr)
    }

    #[cold]
    fn read_slow<T: MemValue>(&self, vaddr: u32) -> Result<T, MemError> {
        let paddr = virt_to_phys(vaddr);
        if (paddr & PAGE_MASK) as usize + T::SIZE > PAGE_SIZE as usize {
            let mut buf = [0u8; 16];
            self.read_bytes(vaddr, &mut buf[..T::SIZE])?;
            return Ok(T::from_u128(u128::from_le_bytes(buf)));
        }
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        let pos = devices.partition_point(|r| r.base <= paddr);
        match pos.checked_sub(1).map(|i| &devices[i]) {
            Some(r) if r.contains(paddr) => {
                let mut dev = r.dev.lock().unwrap_or_else(|e| e.into_inner());
                Ok(T::from_u128(dev.read(paddr - r.base, T::SIZE as u32)))
            }
            _ => Err(MemError::InvalidAddress { addr: vaddr }),
        }
    }

    /// Typed write of a little-endian value.
    ///
    /// A write to a page holding translated code invalidates every
    /// dependent block (through the registered observers) before it
    /// returns.
    #[inline]
    pub fn write<T: MemValue>(&self, vaddr: u32, v: T) -> Result<WriteEffect, MemError> {
        let paddr = virt_to_phys(vaddr);
        let off = paddr & PAGE_MASK;
        if off as usize + T::SIZE <= PAGE_SIZE as usize {
            let e = self.entry(page_of(paddr));
            if e & FLAGS == 0 {
                // SAFETY: mapped, writable, in-bounds.
                unsafe { T::store(self.host(e, off), v) };
                return Ok(WriteEffect::Plain);
            }
        }
        self.write_slow(vaddr, v)
    }

    #[cold]
    fn write_slow<T: MemValue>(&self, vaddr: u32, v: T) -> Result<WriteEffect, MemError> {
        let paddr = virt_to_phys(vaddr);
        if (paddr & PAGE_MASK) as usize + T::SIZE > PAGE_SIZE as usize {
            let bytes = v.to_u128().to_le_bytes();
            return self.write_bytes(vaddr, &bytes[..T::SIZE]);
        }
        let page = page_of(paddr);
        let e = self.entry(page);
        if is_unmapped(e) {
            let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
            let pos = devices.partition_point(|r| r.base <= paddr);
            return match pos.checked_sub(1).map(|i| &devices[i]) {
                Some(r) if r.contains(paddr) => {
                    let mut dev = r.dev.lock().unwrap_or_else(|e| e.into_inner());
                    dev.write(paddr - r.base, T::SIZE as u32, v.to_u128());
                    Ok(WriteEffect::Plain)
                }
                _ => Err(MemError::InvalidAddress { addr: vaddr }),
            };
        }
        if e & READ_ONLY != 0 {
            return Err(MemError::ReadOnly { addr: vaddr });
        }
        // SAFETY: mapped, writable, in-bounds.
        unsafe { T::store(self.host(e, paddr & PAGE_MASK), v) };
        if e & CODE != 0 {
            self.invalidate_code_page(page);
            return Ok(WriteEffect::CodeInvalidated {
                first: page,
                last: page,
            });
        }
        Ok(WriteEffect::Plain)
    }

    /// Clear the code flag, bump the version and tell observers.
    fn invalidate_code_page(&self, page: u32) {
        let slot = &self.table[page as usize];
        let mut cur = slot.load(Ordering::Acquire);
        loop {
            if cur & CODE == 0 {
                // Another writer got here first; its notification
                // covers our store as well.
                return;
            }
            let next = (cur & !CODE).wrapping_add(VERSION_ONE);
            match slot.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        trace!(page, "code page written");
        let observers = self.observers.read().unwrap_or_else(|e| e.into_inner());
        for obs in observers.iter().filter_map(Weak::upgrade) {
            obs.code_page_written(page);
        }
    }

    /// Read an arbitrary byte range, crossing pages as needed.
    pub fn read_bytes(&self, vaddr: u32, buf: &mut [u8]) -> Result<(), MemError> {
        let mut addr = vaddr;
        let mut done = 0;
        while done < buf.len() {
            let paddr = virt_to_phys(addr);
            let off = (paddr & PAGE_MASK) as usize;
            let chunk = (PAGE_SIZE as usize - off).min(buf.len() - done);
            let e = self.entry(page_of(paddr));
            if is_unmapped(e) {
                for b in &mut buf[done..done + chunk] {
                    *b = self.read_slow::<u8>(addr)?;
                    addr = addr.wrapping_add(1);
                }
            } else {
                // SAFETY: chunk stays inside one mapped frame.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.host(e, off as u32),
                        buf[done..].as_mut_ptr(),
                        chunk,
                    )
                };
                addr = addr.wrapping_add(chunk as u32);
            }
            done += chunk;
        }
        Ok(())
    }

    /// Write an arbitrary byte range, crossing pages as needed.
    /// Stops at the first page that cannot be written; bytes before
    /// it remain written.
    pub fn write_bytes(&self, vaddr: u32, data: &[u8]) -> Result<WriteEffect, MemError> {
        let mut effect = WriteEffect::Plain;
        let mut addr = vaddr;
        let mut done = 0;
        while done < data.len() {
            let paddr = virt_to_phys(addr);
            let page = page_of(paddr);
            let off = (paddr & PAGE_MASK) as usize;
            let chunk = (PAGE_SIZE as usize - off).min(data.len() - done);
            let e = self.entry(page);
            if is_unmapped(e) {
                for &b in &data[done..done + chunk] {
                    effect = effect.merge(self.write_slow::<u8>(addr, b)?);
                    addr = addr.wrapping_add(1);
                }
            } else {
                if e & READ_ONLY != 0 {
                    return Err(MemError::ReadOnly { addr });
                }
                // SAFETY: chunk stays inside one mapped, writable frame.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data[done..].as_ptr(),
                        self.host(e, off as u32),
                        chunk,
                    )
                };
                if e & CODE != 0 {
                    self.invalidate_code_page(page);
                    effect = effect.merge(WriteEffect::CodeInvalidated {
                        first: page,
                        last: page,
                    });
                }
                addr = addr.wrapping_add(chunk as u32);
            }
            done += chunk;
        }
        Ok(effect)
    }

    /// Fetch an instruction word. Only RAM and ROM are executable.
    #[inline]
    pub fn fetch(&self, vaddr: u32) -> Result<u32, MemError> {
        let paddr = virt_to_phys(vaddr);
        let e = self.entry(page_of(paddr));
        if is_unmapped(e) || vaddr & 3 != 0 {
            return Err(MemError::InvalidAddress { addr: vaddr });
        }
        // SAFETY: aligned word inside a mapped frame.
        Ok(unsafe { u32::load(self.host(e, paddr & PAGE_MASK)) })
    }

    /// Flag a physical page as holding translated code and return
    /// its current version, or `None` if the page is not backed by
    /// RAM or ROM.
    ///
    /// Call this before reading the instructions that will be
    /// translated: any later write then bumps the version.
    pub fn mark_code_page(&self, page: u32) -> Option<u32> {
        let slot = self.table.get(page as usize)?;
        let old = slot.fetch_or(CODE, Ordering::AcqRel);
        if is_unmapped(old) {
            return None;
        }
        Some(version_of(old))
    }

    /// Current version of a physical page.
    pub fn page_version(&self, page: u32) -> u32 {
        self.table
            .get(page as usize)
            .map_or(0, |e| version_of(e.load(Ordering::Acquire)))
    }

    pub fn is_code_page(&self, page: u32) -> bool {
        self.table.get(page as usize).is_some_and(|e| {
            let e = e.load(Ordering::Acquire);
            !is_unmapped(e) && e & CODE != 0
        })
    }
}
