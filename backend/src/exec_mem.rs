use std::collections::BTreeMap;
use std::io;
use std::ptr;

/// Allocation granularity; also the alignment of every block.
pub const ARENA_ALIGN: usize = 16;

/// Executable memory for translated blocks.
///
/// One anonymous RWX mapping carved up with a first-fit free list.
/// Freed ranges are coalesced with their neighbours, so the arena
/// never needs compaction: a block's code never moves while it is
/// cached.
pub struct ExecArena {
    ptr: *mut u8,
    size: usize,
    /// Free ranges, offset -> length.
    free: BTreeMap<usize, usize>,
    used: usize,
}

// SAFETY: the arena owns its mapping; callers serialize mutation.
unsafe impl Send for ExecArena {}
unsafe impl Sync for ExecArena {}

impl ExecArena {
    /// Map an arena of `size` bytes (rounded up to the host page size).
    pub fn new(size: usize) -> io::Result<Self> {
        let page_size = page_size();
        let size = (size.max(1) + page_size - 1) & !(page_size - 1);

        // SAFETY: anonymous private mapping, no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let mut free = BTreeMap::new();
        free.insert(0, size);
        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            free,
            used: 0,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Bytes currently allocated (after rounding).
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Rounded size an allocation of `len` bytes occupies.
    #[inline]
    pub const fn footprint(len: usize) -> usize {
        (if len == 0 { 1 } else { len } + ARENA_ALIGN - 1) & !(ARENA_ALIGN - 1)
    }

    /// Copy `code` into the first free range large enough to hold it.
    /// Returns the offset, or `None` if no range fits.
    pub fn alloc(&mut self, code: &[u8]) -> Option<usize> {
        let need = Self::footprint(code.len());
        let (&off, &len) = self.free.iter().find(|(_, &len)| len >= need)?;
        self.free.remove(&off);
        if len > need {
            self.free.insert(off + need, len - need);
        }
        // SAFETY: off..off+need lies inside the mapping and is not
        // referenced by any live block.
        unsafe { ptr::copy_nonoverlapping(code.as_ptr(), self.ptr.add(off), code.len()) };
        self.used += need;
        Some(off)
    }

    /// Return the range allocated for `len` bytes at `off`.
    pub fn free(&mut self, off: usize, len: usize) {
        let mut start = off;
        let mut size = Self::footprint(len);
        self.used -= size;

        if let Some((&prev, &prev_len)) = self.free.range(..off).next_back() {
            if prev + prev_len == off {
                self.free.remove(&prev);
                start = prev;
                size += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(off + Self::footprint(len))) {
            self.free.remove(&(off + Self::footprint(len)));
            size += next_len;
        }
        self.free.insert(start, size);
    }

    /// Release every allocation at once.
    pub fn reset(&mut self) {
        self.free.clear();
        self.free.insert(0, self.size);
        self.used = 0;
    }

    /// Host address of the code at `off`.
    #[inline]
    pub fn ptr_at(&self, off: usize) -> *const u8 {
        debug_assert!(off < self.size);
        // SAFETY: in bounds of the mapping.
        unsafe { self.ptr.add(off) as *const u8 }
    }

    /// Number of disjoint free ranges.
    pub fn free_ranges(&self) -> usize {
        self.free.len()
    }

    /// Sum of the free ranges; equals `capacity() - used()` when the
    /// free list is consistent.
    pub fn free_bytes(&self) -> usize {
        self.free.values().sum()
    }

    /// Copy of the host code at `off`.
    pub fn read(&self, off: usize, len: usize) -> Vec<u8> {
        assert!(off + len <= self.size);
        // SAFETY: in bounds of the mapping.
        unsafe { std::slice::from_raw_parts(self.ptr.add(off), len).to_vec() }
    }
}

impl Drop for ExecArena {
    fn drop(&mut self) {
        // SAFETY: ptr/size describe the mapping created in `new`.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
