//! Sparse in-memory physical image for walker tests.
//!
//! Pages exist only once written; reads into unwritten pages fail like a
//! hole in a real dump, while `max_phys_addr` can be set far beyond the
//! populated range so literal PTE values pass the pa-max filters.

use std::collections::HashMap;

use vmrecon_addresses::{PAGE_SIZE, PhysicalAddress};
use vmrecon_phys::{PhysicalMemory, ReadError};

pub(crate) struct TestMem {
    pages: HashMap<u64, Box<[u8; PAGE_SIZE as usize]>>,
    limit: u64,
}

impl TestMem {
    pub(crate) fn new(limit: u64) -> Self {
        Self {
            pages: HashMap::new(),
            limit,
        }
    }

    pub(crate) fn ensure_page(&mut self, pa: u64) -> &mut [u8; PAGE_SIZE as usize] {
        self.pages
            .entry(pa & !(PAGE_SIZE - 1))
            .or_insert_with(|| Box::new([0; PAGE_SIZE as usize]))
    }

    pub(crate) fn put(&mut self, pa: u64, bytes: &[u8]) {
        let off = (pa & (PAGE_SIZE - 1)) as usize;
        assert!(off + bytes.len() <= PAGE_SIZE as usize, "write spans pages");
        self.ensure_page(pa)[off..off + bytes.len()].copy_from_slice(bytes);
    }

    pub(crate) fn put_dword(&mut self, pa: u64, v: u32) {
        self.put(pa, &v.to_le_bytes());
    }

    pub(crate) fn put_qword(&mut self, pa: u64, v: u64) {
        self.put(pa, &v.to_le_bytes());
    }
}

impl PhysicalMemory for TestMem {
    fn read(&self, pa: PhysicalAddress, buf: &mut [u8]) -> Result<(), ReadError> {
        if pa.as_u64() + buf.len() as u64 > self.limit {
            return Err(ReadError::OutOfRange(pa));
        }
        let mut done = 0usize;
        while done < buf.len() {
            let cur = pa.as_u64() + done as u64;
            let base = cur & !(PAGE_SIZE - 1);
            let off = (cur & (PAGE_SIZE - 1)) as usize;
            let take = usize::min(buf.len() - done, PAGE_SIZE as usize - off);
            let page = self
                .pages
                .get(&base)
                .ok_or(ReadError::Partial(PhysicalAddress::new(base)))?;
            buf[done..done + take].copy_from_slice(&page[off..off + take]);
            done += take;
        }
        Ok(())
    }

    fn max_phys_addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.limit.saturating_sub(1))
    }
}
