//! # Prototype-PTE Cache
//!
//! A shared-section VAD references an array of prototype PTEs in the
//! kernel heap describing the true fate of each shared page; they are
//! what the engine consults when a hardware PTE says "not present" but
//! the region is file-backed. Arrays are fetched at most once per kernel
//! address and cached engine-wide; a failed fetch caches an empty array
//! so the address is not retried.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use vmrecon_info::WindowsProfile;
use vmrecon_phys::{AddressSet, ReadFlags};

use crate::TAG_MM_ST;
use crate::map::{VadEntry, VadMap};
use crate::reader::KernelRead;

/// Arrays above this size are implausible and recomputed or refused.
const PROTO_BYTES_MAX: usize = 0x1_0000;

/// Arrays below this size participate in the one-shot bulk prefetch.
const PROTO_BULK_LIMIT: u32 = 0x1000;

/// Engine-wide cache of prototype-PTE arrays, keyed by guest VA.
///
/// Insertions are idempotent: concurrent fetchers of the same address
/// produce identical bytes under the same source, so last-writer-wins is
/// harmless.
#[derive(Default)]
pub struct ProtoPteCache {
    map: Mutex<HashMap<u64, Arc<[u8]>>>,
}

/// `true` when `MmSt` is found within the `hdr` bytes preceding the
/// array (scanned in 4-byte strides for the large legacy headers).
fn verify_pool_header(pb: &[u8], hdr: usize) -> bool {
    let tag_at = |o: usize| u32::from_le_bytes(pb[o..o + 4].try_into().unwrap()) == TAG_MM_ST;
    if hdr == 0 {
        return true;
    }
    if hdr < 0x10 {
        return tag_at(0);
    }
    (0..hdr).step_by(4).any(tag_at)
}

impl ProtoPteCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn cached(&self, va: u64) -> Option<Arc<[u8]>> {
        self.map.lock().expect("proto pte cache lock").get(&va).cloned()
    }

    fn contains(&self, va: u64) -> bool {
        self.map.lock().expect("proto pte cache lock").contains_key(&va)
    }

    /// The prototype-PTE array backing `entry`, fetched on demand.
    ///
    /// The first call against a given map opportunistically prefetches
    /// *every* sub-4 KiB array in it (one bulk round-trip), guarded by
    /// the map's one-shot flag.
    pub fn get(
        &self,
        reader: &dyn KernelRead,
        profile: &WindowsProfile,
        map: &VadMap,
        entry: &VadEntry,
        flags: ReadFlags,
    ) -> Option<Arc<[u8]>> {
        if entry.va_proto_pte == 0 || entry.cb_proto_pte == 0 {
            return None;
        }
        if let Some(a) = self.cached(entry.va_proto_pte) {
            return Some(a);
        }
        let bulk = entry.cb_proto_pte < PROTO_BULK_LIMIT
            && !map.proto_bulk_done.swap(true, Ordering::AcqRel);
        if bulk {
            let wanted = |e: &VadEntry| {
                e.va_proto_pte != 0
                    && e.cb_proto_pte != 0
                    && e.cb_proto_pte < PROTO_BULK_LIMIT
                    && !self.contains(e.va_proto_pte)
            };
            let set: AddressSet = map
                .entries()
                .iter()
                .filter(|e| wanted(e))
                .map(|e| e.va_proto_pte)
                .collect();
            reader.prefetch(&set, PROTO_BULK_LIMIT as usize);
            for e in map.entries().iter().filter(|e| wanted(e)) {
                self.fetch_new(reader, profile, e, flags | ReadFlags::FORCECACHE_READ);
            }
        } else {
            self.fetch_new(reader, profile, entry, flags);
        }
        self.cached(entry.va_proto_pte)
    }

    /// Fetch one array, sniffing the pool header when the array is not
    /// page aligned.
    fn fetch_new(
        &self,
        reader: &dyn KernelRead,
        profile: &WindowsProfile,
        entry: &VadEntry,
        flags: ReadFlags,
    ) {
        let mut cb = entry.cb_proto_pte as usize;
        if cb > PROTO_BYTES_MAX {
            cb = (profile.arch.pte_size() * entry.page_count()) as usize;
            if cb > PROTO_BYTES_MAX {
                log::warn!(
                    "prototype pte array at 0x{:016X} implausibly large, skipped",
                    entry.va_proto_pte
                );
                return;
            }
        }
        let mut hdr = 0usize;
        if entry.va_proto_pte & 0xFFF != 0 {
            hdr = profile.proto_pte_pool_header_offset() as usize;
            // XP..7: no header when the in-page offset cannot hold one
            if profile.proto_pte_pool_header_is_legacy()
                && ((entry.va_proto_pte & 0xFFF) as usize) < hdr
            {
                hdr = 0;
            }
        }
        let mut pb = vec![0u8; cb + hdr];
        let ok = reader
            .read(entry.va_proto_pte - hdr as u64, &mut pb, flags)
            .is_ok()
            && verify_pool_header(&pb, hdr);
        let data: Arc<[u8]> = if ok {
            Arc::from(&pb[hdr..])
        } else {
            Arc::from(Vec::new())
        };
        self.map
            .lock()
            .expect("proto pte cache lock")
            .insert(entry.va_proto_pte, data);
    }
}

/// Index the array for the prototype PTE covering `va` within `entry`.
/// Out-of-range indexes read as zero.
#[must_use]
pub fn proto_pte_at(bytes: &[u8], entry: &VadEntry, va: u64, pte_size: u64) -> u64 {
    let idx = (va - entry.va_start) >> 12;
    let off = (idx * pte_size) as usize;
    if pte_size == 4 {
        bytes
            .get(off..off + 4)
            .map_or(0, |b| u64::from(u32::from_le_bytes(b.try_into().unwrap())))
    } else {
        bytes
            .get(off..off + 8)
            .map_or(0, |b| u64::from_le_bytes(b.try_into().unwrap()))
    }
}
