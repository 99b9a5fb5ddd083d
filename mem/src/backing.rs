use std::ptr;

use ee_core::MemError;

/// Anonymous host mapping that backs guest RAM and ROM.
///
/// Pages are handed out front to back and never returned.
pub struct HostBacking {
    base: *mut u8,
    size: usize,
}

// SAFETY: HostBacking owns its mmap'd memory exclusively; concurrent
// guest accesses go through raw unaligned reads/writes.
unsafe impl Send for HostBacking {}
unsafe impl Sync for HostBacking {}

impl HostBacking {
    pub fn new(size: usize) -> Result<Self, MemError> {
        let size = size.max(1).next_multiple_of(ee_core::PAGE_SIZE as usize);
        // SAFETY: fresh anonymous mapping, no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(MemError::HostMap { size, errno });
        }
        Ok(Self {
            base: ptr as *mut u8,
            size,
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Host pointer for a byte offset into the backing.
    #[inline]
    pub fn ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.size);
        // SAFETY: callers only pass offsets derived from allocated pages.
        unsafe { self.base.add(offset) }
    }
}

impl Drop for HostBacking {
    fn drop(&mut self) {
        // SAFETY: base/size came from a successful mmap.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}
