//! In-memory kernel address space honouring the cache-only read contract,
//! so the two-tier protocol is observable: reads with
//! `FORCECACHE_READ` succeed only for pages a prior `prefetch` covered.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use vmrecon_addresses::{PAGE_SIZE, PhysicalAddress};
use vmrecon_phys::{AddressSet, ReadError, ReadFlags};

use crate::reader::KernelRead;

pub(crate) struct TestKernel {
    pages: Mutex<HashMap<u64, Box<[u8; PAGE_SIZE as usize]>>>,
    cached: Mutex<BTreeSet<u64>>,
    prefetches: AtomicUsize,
}

impl TestKernel {
    pub(crate) fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            cached: Mutex::new(BTreeSet::new()),
            prefetches: AtomicUsize::new(0),
        }
    }

    /// Install `bytes` at kernel VA `va` (may span pages).
    pub(crate) fn put(&self, va: u64, bytes: &[u8]) {
        let mut pages = self.pages.lock().unwrap();
        for (i, b) in bytes.iter().enumerate() {
            let cur = va + i as u64;
            let page = pages
                .entry(cur & !(PAGE_SIZE - 1))
                .or_insert_with(|| Box::new([0; PAGE_SIZE as usize]));
            page[(cur & (PAGE_SIZE - 1)) as usize] = *b;
        }
    }

    pub(crate) fn prefetch_calls(&self) -> usize {
        self.prefetches.load(Ordering::Relaxed)
    }
}

impl KernelRead for TestKernel {
    fn read(&self, va: u64, buf: &mut [u8], flags: ReadFlags) -> Result<(), ReadError> {
        let pages = self.pages.lock().unwrap();
        let cached = self.cached.lock().unwrap();
        let mut done = 0usize;
        while done < buf.len() {
            let cur = va + done as u64;
            let base = cur & !(PAGE_SIZE - 1);
            let off = (cur & (PAGE_SIZE - 1)) as usize;
            let take = usize::min(buf.len() - done, PAGE_SIZE as usize - off);
            if flags.contains(ReadFlags::FORCECACHE_READ) && !cached.contains(&base) {
                return Err(ReadError::CacheMiss(PhysicalAddress::new(base)));
            }
            let page = pages
                .get(&base)
                .ok_or(ReadError::Partial(PhysicalAddress::new(base)))?;
            buf[done..done + take].copy_from_slice(&page[off..off + take]);
            done += take;
        }
        Ok(())
    }

    fn prefetch(&self, vas: &AddressSet, cb: usize) {
        self.prefetches.fetch_add(1, Ordering::Relaxed);
        let pages = self.pages.lock().unwrap();
        let mut cached = self.cached.lock().unwrap();
        for va in vas.iter() {
            let first = va & !(PAGE_SIZE - 1);
            let last = (va + cb as u64 - 1) & !(PAGE_SIZE - 1);
            let mut p = first;
            while p <= last {
                if pages.contains_key(&p) {
                    cached.insert(p);
                }
                p += PAGE_SIZE;
            }
        }
    }
}
