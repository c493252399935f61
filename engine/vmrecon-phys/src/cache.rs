use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use vmrecon_addresses::{PAGE_SIZE, PhysicalAddress};

use crate::page::CachedPage;
use crate::set::AddressSet;
use crate::source::{PhysicalMemory, ReadError, ScatterRead};
use crate::flags::ReadFlags;

/// Shared map of physical page base → cached page image.
///
/// Both caches below are this structure; they are kept as distinct types
/// because their contents have different lifecycles (page-table pages are
/// hot and long-lived, data pages are prefetch fodder) and because handing
/// a walker the data cache by accident should not type-check.
#[derive(Default)]
struct PageMap {
    pages: Mutex<HashMap<u64, Arc<CachedPage>>>,
}

impl PageMap {
    fn cached(&self, page_pa: u64) -> Option<Arc<CachedPage>> {
        self.pages.lock().expect("page cache lock").get(&page_pa).cloned()
    }

    fn insert(&self, page_pa: u64, page: Arc<CachedPage>) {
        self.pages.lock().expect("page cache lock").insert(page_pa, page);
    }

    fn fetch(&self, mem: &dyn PhysicalMemory, page_pa: u64) -> Option<Arc<CachedPage>> {
        let mut bytes = [0u8; PAGE_SIZE as usize];
        mem.read(PhysicalAddress::new(page_pa), &mut bytes).ok()?;
        let page = Arc::new(CachedPage::new(bytes));
        self.insert(page_pa, Arc::clone(&page));
        Some(page)
    }

    /// Scatter-read every page in `pages` that is not yet cached.
    fn prefetch(&self, mem: &dyn PhysicalMemory, pages: impl Iterator<Item = u64>) {
        let mut reads: Vec<ScatterRead> = {
            let held = self.pages.lock().expect("page cache lock");
            pages
                .map(|pa| pa & !(PAGE_SIZE - 1))
                .filter(|pa| !held.contains_key(pa))
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .map(|pa| ScatterRead::new(PhysicalAddress::new(pa), PAGE_SIZE as usize))
                .collect()
        };
        if reads.is_empty() {
            return;
        }
        mem.read_scatter(&mut reads);
        let mut held = self.pages.lock().expect("page cache lock");
        let mut hits = 0usize;
        for r in &reads {
            if r.ok {
                let mut bytes = [0u8; PAGE_SIZE as usize];
                bytes.copy_from_slice(&r.data);
                held.insert(r.pa.as_u64(), Arc::new(CachedPage::new(bytes)));
                hits += 1;
            }
        }
        log::trace!("prefetched {hits}/{} physical pages", reads.len());
    }

    fn len(&self) -> usize {
        self.pages.lock().expect("page cache lock").len()
    }
}

/// Cache of page-*table* pages, as consumed by the paging walkers.
#[derive(Default)]
pub struct TlbCache {
    map: PageMap,
}

impl TlbCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached 4 KiB page-table read. `force_refresh` drops any cached copy
    /// and re-reads from the source.
    pub fn page_table(
        &self,
        mem: &dyn PhysicalMemory,
        pa: PhysicalAddress,
        force_refresh: bool,
    ) -> Option<Arc<CachedPage>> {
        let key = pa.page_base().as_u64();
        if !force_refresh {
            if let Some(p) = self.map.cached(key) {
                return Some(p);
            }
        }
        self.map.fetch(mem, key)
    }

    /// Bulk-read the page-table pages in `pas` into the cache.
    pub fn prefetch(&self, mem: &dyn PhysicalMemory, pas: &AddressSet) {
        self.map.prefetch(mem, pas.iter());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }
}

/// Cache of data pages backing the engine's flagged read path.
#[derive(Default)]
pub struct PageCache {
    map: PageMap,
}

impl PageCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bulk-read the physical pages covering `pages` into the cache.
    /// Addresses are rounded down; duplicates collapse.
    pub fn prefetch(&self, mem: &dyn PhysicalMemory, pages: impl Iterator<Item = u64>) {
        self.map.prefetch(mem, pages);
    }

    #[must_use]
    pub fn cached(&self, page_pa: u64) -> Option<Arc<CachedPage>> {
        self.map.cached(page_pa & !(PAGE_SIZE - 1))
    }

    /// Flagged physical read through the cache.
    ///
    /// Reads span pages; each page is satisfied from cache when possible.
    /// [`ReadFlags::FORCECACHE_READ`] makes a miss a hard
    /// [`ReadError::CacheMiss`] with no source round-trip;
    /// [`ReadFlags::NOCACHE`] bypasses the cache in both directions.
    /// A partially satisfiable request fails as a whole.
    ///
    /// # Errors
    /// See above; source errors propagate.
    pub fn read(
        &self,
        mem: &dyn PhysicalMemory,
        pa: PhysicalAddress,
        buf: &mut [u8],
        flags: ReadFlags,
    ) -> Result<(), ReadError> {
        let mut done = 0usize;
        while done < buf.len() {
            let cur = pa + done as u64;
            let page_pa = cur.page_base().as_u64();
            let in_page = usize::try_from(cur.page_offset()).expect("page offset");
            let take = usize::min(buf.len() - done, PAGE_SIZE as usize - in_page);

            let page = if flags.contains(ReadFlags::NOCACHE) {
                None
            } else {
                self.cached(page_pa)
            };
            let page = match page {
                Some(p) => p,
                None if flags.contains(ReadFlags::FORCECACHE_READ) => {
                    return Err(ReadError::CacheMiss(PhysicalAddress::new(page_pa)));
                }
                None => {
                    let mut bytes = [0u8; PAGE_SIZE as usize];
                    mem.read(PhysicalAddress::new(page_pa), &mut bytes)?;
                    let p = Arc::new(CachedPage::new(bytes));
                    if !flags.contains(ReadFlags::NOCACHE) {
                        self.map.insert(page_pa, Arc::clone(&p));
                    }
                    p
                }
            };
            buf[done..done + take].copy_from_slice(&page.bytes()[in_page..in_page + take]);
            done += take;
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }
}
