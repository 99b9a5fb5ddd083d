//! Translation cache: compiled blocks keyed by guest address, with a
//! page-overlap index for self-modifying-code invalidation and LRU
//! eviction.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use ee_backend::{CompiledCode, ExecArena};
use ee_core::{BasicBlock, CacheConfig, GuestRegSet, PageSnapshot};
use ee_mem::{CodePageObserver, GuestMemory};
use tracing::{debug, error};

use crate::error::CacheError;

/// Stable identity of a cached block. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u64);

/// Handle to a cached block, valid while the block is pinned.
#[derive(Debug, Clone, Copy)]
pub struct CachedBlock {
    pub id: BlockId,
    pub start: u32,
    pub end: u32,
    pub first_page: u32,
    pub last_page: u32,
    pub icount: u32,
    /// Host entry point of the compiled code.
    pub entry: *const u8,
}

/// Read-only block metadata for debugging tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub start: u32,
    pub end: u32,
    pub icount: u32,
    pub code_size: usize,
    pub spills: usize,
    pub clobbers: GuestRegSet,
    pub pages: Vec<u32>,
    pub pinned: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub invalidations: u64,
    pub evictions: u64,
    /// Blocks currently indexed.
    pub blocks: usize,
    /// Arena bytes held, including retired blocks still pinned.
    pub code_bytes: usize,
}

struct Entry {
    start: u32,
    end: u32,
    icount: u32,
    pages: Vec<PageSnapshot>,
    offset: usize,
    len: usize,
    spills: usize,
    clobbers: GuestRegSet,
    last_exec: u64,
    pins: u32,
}

/// Code of an invalidated block that was still executing.
struct Retired {
    offset: usize,
    len: usize,
    pins: u32,
}

struct CacheInner {
    arena: ExecArena,
    max_blocks: usize,
    max_code_bytes: usize,
    next_id: u64,
    tick: u64,
    blocks: HashMap<BlockId, Entry>,
    by_addr: HashMap<u32, BlockId>,
    by_page: HashMap<u32, HashSet<BlockId>>,
    /// (last execution tick, block) in eviction order.
    lru: BTreeSet<(u64, BlockId)>,
    retired: HashMap<BlockId, Retired>,
    stats: CacheStats,
}

/// The translation cache. Shareable between cores: every operation
/// takes the internal lock.
pub struct TranslationCache {
    inner: Mutex<CacheInner>,
}

impl TranslationCache {
    pub fn new(cfg: &CacheConfig) -> Result<Arc<Self>, CacheError> {
        let arena = ExecArena::new(cfg.max_code_bytes)?;
        Ok(Arc::new(Self {
            inner: Mutex::new(CacheInner {
                arena,
                max_blocks: cfg.max_blocks.max(1),
                max_code_bytes: cfg.max_code_bytes,
                next_id: 0,
                tick: 0,
                blocks: HashMap::new(),
                by_addr: HashMap::new(),
                by_page: HashMap::new(),
                lru: BTreeSet::new(),
                retired: HashMap::new(),
                stats: CacheStats::default(),
            }),
        }))
    }

    /// Subscribe to code-page writes on `mem`.
    pub fn attach(self: &Arc<Self>, mem: &GuestMemory) {
        let weak: Weak<dyn CodePageObserver> = Arc::downgrade(self) as Weak<dyn CodePageObserver>;
        mem.register_code_page_observer(weak);
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find the block starting at `pc` and mark it as most recently
    /// executed.
    pub fn lookup(&self, pc: u32) -> Option<CachedBlock> {
        self.lock().lookup(pc, false)
    }

    /// `lookup`, and pin the block so it survives until `unpin`.
    pub fn pin(&self, pc: u32) -> Option<CachedBlock> {
        self.lock().lookup(pc, true)
    }

    pub fn unpin(&self, id: BlockId) {
        let mut inner = self.lock();
        if let Some(e) = inner.blocks.get_mut(&id) {
            e.pins = e.pins.saturating_sub(1);
            return;
        }
        let done = match inner.retired.get_mut(&id) {
            Some(r) => {
                r.pins = r.pins.saturating_sub(1);
                r.pins == 0
            }
            None => false,
        };
        if done {
            if let Some(r) = inner.retired.remove(&id) {
                inner.arena.free(r.offset, r.len);
                debug!(?id, "freed retired block");
            }
        }
    }

    /// Insert the compiled code for `block`.
    ///
    /// Fails with `StaleBlock` when a page the block was decoded from
    /// has been written since, and with `CapacityExceeded` when no
    /// unpinned block is left to evict. A block already cached at the
    /// same address is replaced.
    pub fn insert(
        &self,
        block: &BasicBlock,
        code: &CompiledCode,
        mem: &GuestMemory,
    ) -> Result<CachedBlock, CacheError> {
        let mut inner = self.lock();
        // Checked under the lock: a write that bumps a version after
        // this point notifies `invalidate_page`, which waits for us.
        for snap in &block.pages {
            if mem.page_version(snap.page) != snap.version || !mem.is_code_page(snap.page) {
                return Err(CacheError::StaleBlock {
                    pc: block.start,
                    page: snap.page,
                });
            }
        }
        if let Some(old) = inner.by_addr.get(&block.start).copied() {
            inner.remove(old);
        }
        let handle = inner.insert(block, code)?;
        inner.verify()?;
        Ok(handle)
    }

    /// Drop every block overlapping physical page `page`. Returns the
    /// number of blocks removed.
    pub fn invalidate_page(&self, page: u32) -> usize {
        let mut inner = self.lock();
        let ids: Vec<BlockId> = inner
            .by_page
            .get(&page)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for &id in &ids {
            inner.remove(id);
        }
        inner.stats.invalidations += ids.len() as u64;
        if !ids.is_empty() {
            debug!(page = format_args!("{page:#x}"), blocks = ids.len(), "invalidated code page");
        }
        if let Err(e) = inner.verify() {
            error!(%e, "cache inconsistent after invalidation");
        }
        ids.len()
    }

    /// Drop every block.
    pub fn flush_all(&self) {
        let mut inner = self.lock();
        let ids: Vec<BlockId> = inner.blocks.keys().copied().collect();
        for &id in &ids {
            inner.remove(id);
        }
        inner.stats.invalidations += ids.len() as u64;
        debug!(blocks = ids.len(), "flushed translation cache");
    }

    pub fn block_at(&self, pc: u32) -> Option<BlockInfo> {
        let inner = self.lock();
        let id = inner.by_addr.get(&pc)?;
        let e = inner.blocks.get(id)?;
        Some(BlockInfo {
            start: e.start,
            end: e.end,
            icount: e.icount,
            code_size: e.len,
            spills: e.spills,
            clobbers: e.clobbers,
            pages: e.pages.iter().map(|p| p.page).collect(),
            pinned: e.pins > 0,
        })
    }

    /// Copy of the host code of the block at `pc`.
    pub fn code_at(&self, pc: u32) -> Option<Vec<u8>> {
        let inner = self.lock();
        let e = inner.blocks.get(inner.by_addr.get(&pc)?)?;
        Some(inner.arena.read(e.offset, e.len))
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            blocks: inner.blocks.len(),
            code_bytes: inner.arena.used(),
            ..inner.stats
        }
    }

    pub fn len(&self) -> usize {
        self.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate both indices, the LRU order and the byte accounting.
    pub fn check_consistency(&self) -> Result<(), CacheError> {
        self.lock().check()
    }
}

impl CodePageObserver for TranslationCache {
    fn code_page_written(&self, page: u32) {
        self.invalidate_page(page);
    }
}

impl CacheInner {
    fn lookup(&mut self, pc: u32, pin: bool) -> Option<CachedBlock> {
        let Some(&id) = self.by_addr.get(&pc) else {
            self.stats.misses += 1;
            return None;
        };
        self.tick += 1;
        let tick = self.tick;
        let e = self.blocks.get_mut(&id)?;
        self.lru.remove(&(e.last_exec, id));
        e.last_exec = tick;
        self.lru.insert((tick, id));
        if pin {
            e.pins += 1;
        }
        self.stats.hits += 1;
        Some(CachedBlock {
            id,
            start: e.start,
            end: e.end,
            first_page: e.pages.first().map_or(0, |p| p.page),
            last_page: e.pages.last().map_or(0, |p| p.page),
            icount: e.icount,
            entry: self.arena.ptr_at(e.offset),
        })
    }

    fn pinned(&self) -> usize {
        self.blocks.values().filter(|e| e.pins > 0).count()
    }

    /// Evict the least recently executed unpinned block.
    fn evict_one(&mut self) -> bool {
        let victim = self
            .lru
            .iter()
            .map(|&(_, id)| id)
            .find(|id| self.blocks.get(id).is_some_and(|e| e.pins == 0));
        match victim {
            Some(id) => {
                if let Some(e) = self.blocks.get(&id) {
                    debug!(pc = format_args!("{:#010x}", e.start), "evicting block");
                }
                self.remove(id);
                self.stats.evictions += 1;
                true
            }
            None => false,
        }
    }

    fn insert(&mut self, block: &BasicBlock, code: &CompiledCode) -> Result<CachedBlock, CacheError> {
        let need = ExecArena::footprint(code.code.len());
        let full = CacheError::CapacityExceeded {
            needed: need,
            pinned: 0,
        };
        if need > self.max_code_bytes {
            return Err(full);
        }
        while self.blocks.len() >= self.max_blocks || self.arena.used() + need > self.max_code_bytes {
            if !self.evict_one() {
                return Err(CacheError::CapacityExceeded {
                    needed: need,
                    pinned: self.pinned(),
                });
            }
        }
        // Fragmentation can defeat the byte budget; evict until it fits.
        let offset = loop {
            if let Some(off) = self.arena.alloc(&code.code) {
                break off;
            }
            if !self.evict_one() {
                return Err(CacheError::CapacityExceeded {
                    needed: need,
                    pinned: self.pinned(),
                });
            }
        };

        let id = BlockId(self.next_id);
        self.next_id += 1;
        self.tick += 1;
        let entry = Entry {
            start: block.start,
            end: block.end,
            icount: block.icount(),
            pages: block.pages.clone(),
            offset,
            len: code.code.len(),
            spills: code.spills,
            clobbers: code.clobbers,
            last_exec: self.tick,
            pins: 0,
        };
        for p in &entry.pages {
            self.by_page.entry(p.page).or_default().insert(id);
        }
        self.by_addr.insert(block.start, id);
        self.lru.insert((self.tick, id));
        self.blocks.insert(id, entry);
        self.stats.inserts += 1;
        debug!(
            pc = format_args!("{:#010x}", block.start),
            bytes = code.code.len(),
            blocks = self.blocks.len(),
            "cached block"
        );
        Ok(CachedBlock {
            id,
            start: block.start,
            end: block.end,
            first_page: block.first_page(),
            last_page: block.last_page(),
            icount: block.icount(),
            entry: self.arena.ptr_at(offset),
        })
    }

    /// Unlink a block from every index. Code of a pinned block is
    /// retired instead of freed.
    fn remove(&mut self, id: BlockId) {
        let Some(e) = self.blocks.remove(&id) else {
            return;
        };
        if self.by_addr.get(&e.start) == Some(&id) {
            self.by_addr.remove(&e.start);
        }
        for p in &e.pages {
            if let Some(set) = self.by_page.get_mut(&p.page) {
                set.remove(&id);
                if set.is_empty() {
                    self.by_page.remove(&p.page);
                }
            }
        }
        self.lru.remove(&(e.last_exec, id));
        if e.pins > 0 {
            self.retired.insert(
                id,
                Retired {
                    offset: e.offset,
                    len: e.len,
                    pins: e.pins,
                },
            );
        } else {
            self.arena.free(e.offset, e.len);
        }
    }

    fn verify(&self) -> Result<(), CacheError> {
        if cfg!(debug_assertions) {
            self.check().inspect_err(|e| error!(%e, "translation cache invariant violated"))
        } else {
            Ok(())
        }
    }

    fn check(&self) -> Result<(), CacheError> {
        let bad = |msg: String| Err(CacheError::Corrupted(msg));
        if self.by_addr.len() != self.blocks.len() {
            return bad(format!(
                "{} addresses indexed for {} blocks",
                self.by_addr.len(),
                self.blocks.len()
            ));
        }
        for (&pc, id) in &self.by_addr {
            match self.blocks.get(id) {
                Some(e) if e.start == pc => {}
                _ => return bad(format!("address {pc:#010x} maps to a missing block")),
            }
        }
        let mut page_refs = 0;
        for (page, ids) in &self.by_page {
            for id in ids {
                let covers = self
                    .blocks
                    .get(id)
                    .is_some_and(|e| e.pages.iter().any(|p| p.page == *page));
                if !covers {
                    return bad(format!("page {page:#x} lists {id:?}, which does not cover it"));
                }
                page_refs += 1;
            }
        }
        let mut bytes = 0;
        for (id, e) in &self.blocks {
            if self.by_addr.get(&e.start) != Some(id) {
                return bad(format!("block {:#010x} missing from the address index", e.start));
            }
            for p in &e.pages {
                if !self.by_page.get(&p.page).is_some_and(|s| s.contains(id)) {
                    return bad(format!("block {:#010x} missing from page {:#x}", e.start, p.page));
                }
            }
            if !self.lru.contains(&(e.last_exec, *id)) {
                return bad(format!("block {:#010x} missing from the LRU list", e.start));
            }
            bytes += ExecArena::footprint(e.len);
        }
        let expected_refs: usize = self.blocks.values().map(|e| e.pages.len()).sum();
        if page_refs != expected_refs {
            return bad(format!("{page_refs} page references, expected {expected_refs}"));
        }
        if self.lru.len() != self.blocks.len() {
            return bad(format!("{} LRU entries for {} blocks", self.lru.len(), self.blocks.len()));
        }
        bytes += self
            .retired
            .values()
            .map(|r| ExecArena::footprint(r.len))
            .sum::<usize>();
        if bytes != self.arena.used() {
            return bad(format!("{bytes} code bytes accounted, arena holds {}", self.arena.used()));
        }
        Ok(())
    }
}
