//! Guest memory: mappings, devices, typed accesses and code-page
//! tracking.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use ee_core::{CpuState, ExcCode, MemError};
use ee_mem::access::{load, store};
use ee_mem::{CodePageObserver, GuestMemory, MmioDevice, StoreStatus, WriteEffect};

use crate::harness::{memory, CODE, DATA};

// ── Mappings ──────────────────────────────────────────────────

#[test]
fn test_typed_access_is_little_endian() {
    let mem = memory();
    mem.write::<u64>(DATA, 0x0102_0304_0506_0708).unwrap();
    assert_eq!(mem.read::<u8>(DATA).unwrap(), 0x08);
    assert_eq!(mem.read::<u16>(DATA + 6).unwrap(), 0x0102);
    assert_eq!(mem.read::<u32>(DATA + 4).unwrap(), 0x0102_0304);
}

#[test]
fn test_access_across_page_boundary() {
    let mem = memory();
    mem.write::<u32>(0x1FFE, 0xAABB_CCDD).unwrap();
    assert_eq!(mem.read::<u32>(0x1FFE).unwrap(), 0xAABB_CCDD);
    assert_eq!(mem.read::<u16>(0x2000).unwrap(), 0xAABB);
}

#[test]
fn test_unmapped_access_fails() {
    let mem = memory();
    assert_eq!(
        mem.read::<u32>(0x0800_0000),
        Err(MemError::InvalidAddress { addr: 0x0800_0000 })
    );
    assert!(mem.write::<u8>(0x0800_0000, 1).is_err());
}

#[test]
fn test_overlapping_map_is_rejected() {
    let mem = memory();
    assert!(matches!(
        mem.map_ram(0x1000, 0x1000),
        Err(MemError::Overlap { .. })
    ));
    assert!(matches!(
        mem.map_ram(0x20_0800, 0x1000),
        Err(MemError::BadRegion { .. })
    ));
}

#[test]
fn test_rom_is_read_only() {
    let mem = GuestMemory::new(0x2000).unwrap();
    mem.map_rom(0x1FC0_0000, &[0x78, 0x56, 0x34, 0x12]).unwrap();
    assert_eq!(mem.fetch(0xBFC0_0000).unwrap(), 0x1234_5678);
    assert_eq!(
        mem.write::<u32>(0xBFC0_0000, 0),
        Err(MemError::ReadOnly { addr: 0xBFC0_0000 })
    );
}

// ── Devices ───────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    writes: Arc<Mutex<Vec<(u32, u32, u128)>>>,
}

impl MmioDevice for Recorder {
    fn read(&mut self, offset: u32, size: u32) -> u128 {
        (offset as u128) << 8 | size as u128
    }

    fn write(&mut self, offset: u32, size: u32, value: u128) {
        self.writes.lock().unwrap().push((offset, size, value));
    }
}

#[test]
fn test_device_dispatch() {
    let mem = memory();
    let dev = Recorder::default();
    let writes = dev.writes.clone();
    mem.map_device(0x1000_F000, 0x100, Box::new(dev)).unwrap();

    mem.write::<u32>(0xB000_F010, 0xCAFE).unwrap();
    assert_eq!(*writes.lock().unwrap(), vec![(0x10, 4, 0xCAFE)]);
    assert_eq!(mem.read::<u16>(0x1000_F020).unwrap(), 0x2002);
    assert!(mem.is_mapped(0x1000_F0FF));
    assert!(!mem.is_mapped(0x1000_F100));
}

#[test]
fn test_device_is_not_executable() {
    let mem = memory();
    mem.map_device(0x1000_F000, 0x100, Box::new(Recorder::default()))
        .unwrap();
    assert!(mem.fetch(0x1000_F000).is_err());
}

// ── Code pages ────────────────────────────────────────────────

#[derive(Default)]
struct PageLog(Mutex<Vec<u32>>);

impl CodePageObserver for PageLog {
    fn code_page_written(&self, page: u32) {
        self.0.lock().unwrap().push(page);
    }
}

#[test]
fn test_code_page_write_bumps_version() {
    let mem = memory();
    let page = CODE >> 12;
    let v0 = mem.mark_code_page(page).unwrap();
    assert!(mem.is_code_page(page));

    let effect = mem.write::<u32>(CODE + 0x10, 1).unwrap();
    assert_eq!(effect, WriteEffect::CodeInvalidated { first: page, last: page });
    assert!(mem.page_version(page) != v0);
    assert!(!mem.is_code_page(page));

    // Not code any more: plain writes, no further bumps.
    let v1 = mem.page_version(page);
    assert_eq!(mem.write::<u32>(CODE + 0x10, 2).unwrap(), WriteEffect::Plain);
    assert_eq!(mem.page_version(page), v1);
}

#[test]
fn test_observer_sees_code_writes_only() {
    let mem = memory();
    let log = Arc::new(PageLog::default());
    let weak: Weak<dyn CodePageObserver> = Arc::downgrade(&log) as Weak<dyn CodePageObserver>;
    mem.register_code_page_observer(weak);

    mem.mark_code_page(1).unwrap();
    mem.write::<u8>(DATA, 1).unwrap();
    mem.write_bytes(0x0FFE, &[0; 4]).unwrap();
    assert_eq!(*log.0.lock().unwrap(), vec![1]);
}

#[test]
fn test_dropped_observer_is_skipped() {
    let mem = memory();
    let count = Arc::new(AtomicU32::new(0));
    struct Counter(Arc<AtomicU32>);
    impl CodePageObserver for Counter {
        fn code_page_written(&self, _page: u32) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }
    let obs: Arc<dyn CodePageObserver> = Arc::new(Counter(count.clone()));
    mem.register_code_page_observer(Arc::downgrade(&obs));
    drop(obs);

    mem.mark_code_page(1).unwrap();
    mem.write::<u32>(CODE, 0).unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 0);
}

// ── Guest accesses ────────────────────────────────────────────

#[test]
fn test_misaligned_access_raises_address_error() {
    let mem = memory();
    let mut cpu = CpuState::new();
    assert_eq!(load::<u32>(&mut cpu, &mem, DATA + 1), None);
    assert_eq!(cpu.exc_code, ExcCode::AddressLoad as u32);
    assert_eq!(cpu.fault_pending, 1);

    let mut cpu = CpuState::new();
    assert_eq!(store::<u16>(&mut cpu, &mem, DATA + 1, 0), StoreStatus::Fault);
    assert_eq!(cpu.exc_code, ExcCode::AddressStore as u32);
}

#[test]
fn test_unmapped_access_raises_bus_error() {
    let mem = memory();
    let mut cpu = CpuState::new();
    assert_eq!(load::<u32>(&mut cpu, &mem, 0x0800_0000), None);
    assert_eq!(cpu.exc_code, ExcCode::DataBus as u32);
}

#[test]
fn test_quadword_ignores_low_bits() {
    let mem = memory();
    let mut cpu = CpuState::new();
    let q = 0x0011_2233_4455_6677_8899_AABB_CCDD_EEFFu128;
    assert_eq!(store::<u128>(&mut cpu, &mem, DATA + 7, q), StoreStatus::Ok);
    assert_eq!(mem.read::<u128>(DATA).unwrap(), q);
    assert_eq!(load::<u128>(&mut cpu, &mem, DATA + 15), Some(q));
}

#[test]
fn test_store_into_running_block_reports_code_modified() {
    let mem = memory();
    let page = CODE >> 12;
    let mut cpu = CpuState::new();
    cpu.block_first_page = page;
    cpu.block_last_page = page;

    mem.mark_code_page(page).unwrap();
    assert_eq!(store::<u32>(&mut cpu, &mem, CODE + 0x40, 0), StoreStatus::CodeModified);

    // A code page outside the running block is invalidated quietly.
    mem.mark_code_page(page + 1).unwrap();
    assert_eq!(store::<u32>(&mut cpu, &mem, CODE + 0x1000, 0), StoreStatus::Ok);
    assert!(!mem.is_code_page(page + 1));
}
