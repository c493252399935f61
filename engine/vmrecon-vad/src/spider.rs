//! # VAD Tree Spider
//!
//! Walks the per-process VAD tree with a two-tier read protocol that pays
//! at most two physical round-trips per tree level:
//!
//! - `try2` — addresses queued for (re-)prefetch: one bulk prefetch, then
//!   a cache-only parse; failure here is final.
//! - `try1` — freshly discovered children: parsed cache-only immediately
//!   (the bulk prefetch often covered them); failures are demoted to
//!   `try2` for one more round.
//! - `all` — every address ever seen; published afterwards so the *next*
//!   build of this process prefetches last-known nodes up front and the
//!   warm case collapses to a single round-trip.

use vmrecon_addresses::kaddr_8_16;
use vmrecon_info::{VadCountSource, WindowsProfile};
use vmrecon_phys::{AddressSet, ReadFlags};

use crate::map::{VadEntry, VadMap, VadType};
use crate::parse::{NODE_PREFETCH_SIZE, RawNode, VadParser};
use crate::reader::{KernelRead, VadError};

/// Ceiling on the node count read from `EPROCESS`; anything above is a
/// corrupt or smeared value.
const VAD_COUNT_MAX: u32 = 0x1000;

/// Borrowed view of a cached `EPROCESS` image.
///
/// The engine reads the process object once; the spider only picks
/// pointer- and dword-sized fields out of it. Out-of-range offsets read
/// as zero, which downstream validation rejects naturally.
pub struct EprocessView<'a> {
    bytes: &'a [u8],
    is32: bool,
}

impl<'a> EprocessView<'a> {
    #[must_use]
    pub const fn new(bytes: &'a [u8], profile: &WindowsProfile) -> Self {
        Self {
            bytes,
            is32: profile.is32(),
        }
    }

    /// Guest-pointer-sized field at `off`, zero when out of range.
    #[must_use]
    pub fn ptr_at(&self, off: u32) -> u64 {
        let o = off as usize;
        if self.is32 {
            self.bytes
                .get(o..o + 4)
                .map_or(0, |b| u64::from(u32::from_le_bytes(b.try_into().unwrap())))
        } else {
            self.bytes
                .get(o..o + 8)
                .map_or(0, |b| u64::from_le_bytes(b.try_into().unwrap()))
        }
    }

    /// Dword field at `off`, zero when out of range.
    #[must_use]
    pub fn dword_at(&self, off: u32) -> u32 {
        let o = off as usize;
        self.bytes
            .get(o..o + 4)
            .map_or(0, |b| u32::from_le_bytes(b.try_into().unwrap()))
    }
}

/// Build the flattened VAD map of one process.
///
/// `prefetch_seed` holds the node addresses published by the previous run
/// (empty on the first). Returns the map plus the set of every node
/// address seen, for the caller to publish as the next seed.
///
/// # Errors
/// [`VadError::UnsupportedVersion`] when no parser exists for the build;
/// [`VadError::NoRoot`] when no probe slot yields a plausible root.
pub fn spider_vad_map(
    reader: &dyn KernelRead,
    profile: &WindowsProfile,
    pid: u32,
    eprocess: &EprocessView<'_>,
    prefetch_seed: &AddressSet,
    flags: ReadFlags,
) -> Result<(VadMap, AddressSet), VadError> {
    let parser = VadParser::for_profile(profile).ok_or(VadError::UnsupportedVersion)?;
    let is32 = profile.is32();
    let pool_hdr = profile.arch.pool_header_size();

    // 1: expected node count, used as traversal cap and allocation hint
    let mut count = match profile.vad_count_source() {
        VadCountSource::Balanced { offset } => eprocess.ptr_at(offset) as u32,
        VadCountSource::AvlShifted { offset } => (eprocess.ptr_at(offset) as u32) >> 8,
        VadCountSource::XpDword { offset } => eprocess.dword_at(offset),
    };
    if count > VAD_COUNT_MAX {
        log::warn!("pid {pid}: implausible VAD count 0x{count:x}, clamping");
        count = VAD_COUNT_MAX;
    }
    if count == 0 {
        log::debug!("pid {pid}: no VADs");
        return Ok((VadMap::empty(), AddressSet::new()));
    }

    // 2: root candidates
    let mut all = AddressSet::new();
    let mut try1 = AddressSet::new();
    let mut try2 = AddressSet::new();
    for off in profile.vad_root_probe_offsets() {
        let va = eprocess.ptr_at(off);
        if kaddr_8_16(is32, va) {
            let node = va - pool_hdr;
            all.push(node);
            try2.push(node);
        }
    }
    if try2.is_empty() {
        return Err(VadError::NoRoot);
    }

    // 3: warm the cache with last-known node addresses
    if !prefetch_seed.is_empty() {
        reader.prefetch(prefetch_seed, NODE_PREFETCH_SIZE);
    }

    let cmax = count as usize;
    let mut entries: Vec<VadEntry> = Vec::with_capacity(cmax);
    let mut buf = vec![0u8; parser.node_size()];
    let node_flags = flags | ReadFlags::FORCECACHE_READ;

    let accept = |raw: RawNode,
                      va: u64,
                      entries: &mut Vec<VadEntry>,
                      all: &mut AddressSet,
                      try1: &mut AddressSet| {
        for child in raw.children {
            if kaddr_8_16(is32, child) {
                let node = child - pool_hdr;
                all.push(node);
                try1.push(node);
            }
        }
        entries.push(entry_from(&raw, va + pool_hdr, profile));
    };

    // 4: the two-tier rounds
    while entries.len() < cmax && !try2.is_empty() {
        reader.prefetch(&try2, NODE_PREFETCH_SIZE);
        // second chance: a failure here is final
        while entries.len() < cmax {
            let Some(va) = try2.pop() else { break };
            if reader.read(va, &mut buf, node_flags).is_ok() {
                if let Some(raw) = parser.parse(&buf) {
                    accept(raw, va, &mut entries, &mut all, &mut try1);
                }
            } else {
                log::debug!("pid {pid}: dropping unreadable VAD node at 0x{va:016X}");
            }
        }
        // first chance: a failure earns one more prefetch round
        while entries.len() < cmax {
            let Some(va) = try1.pop() else { break };
            if reader.read(va, &mut buf, node_flags).is_ok() {
                if let Some(raw) = parser.parse(&buf) {
                    accept(raw, va, &mut entries, &mut all, &mut try1);
                }
            } else {
                try2.push(va);
            }
        }
    }

    // 5: sort and drop anything overlapping its predecessor
    entries.sort_by_key(|e| e.va_start);
    let mut sorted: Vec<VadEntry> = Vec::with_capacity(entries.len());
    for e in entries {
        if let Some(prev) = sorted.last() {
            if e.va_start <= prev.va_end {
                log::warn!(
                    "pid {pid}: dropping overlapping VAD [0x{:X}..0x{:X}] (node 0x{:016X})",
                    e.va_start,
                    e.va_end,
                    e.va_node
                );
                continue;
            }
        }
        sorted.push(e);
    }
    log::debug!("pid {pid}: {} VAD entries reconstructed", sorted.len());

    Ok((VadMap::from_parts(sorted, vec![0], false), all))
}

/// Convert a parsed node, applying the per-entry sanity clamps.
fn entry_from(raw: &RawNode, va_node: u64, profile: &WindowsProfile) -> VadEntry {
    let pages = (raw.va_end + 1 - raw.va_start) >> 12;
    // a commit charge exceeding the region marks the node as suspicious;
    // the region is kept with the charge zeroed
    let commit_charge = if u64::from(raw.commit_charge) > pages {
        0
    } else {
        raw.commit_charge
    };
    let mut cb_proto_pte = raw.cb_proto_pte;
    if cb_proto_pte > 0x0100_0000 {
        cb_proto_pte = (profile.arch.pte_size() * pages) as u32;
    }
    VadEntry {
        va_start: raw.va_start,
        va_end: raw.va_end,
        va_node,
        commit_charge,
        mem_commit: raw.mem_commit,
        vad_type: VadType::from_bits(raw.vad_type),
        protection: raw.protection,
        private_memory: raw.private_memory,
        va_subsection: raw.va_subsection,
        va_proto_pte: raw.va_proto_pte,
        cb_proto_pte,
        ..VadEntry::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestKernel;
    use vmrecon_info::{Arch, EprocessOffsets};

    fn xp_profile() -> WindowsProfile {
        WindowsProfile::new(Arch::X86, 2600, EprocessOffsets { vad_root: 0x11C })
    }

    fn w10_profile() -> WindowsProfile {
        WindowsProfile::new(Arch::X64, 19041, EprocessOffsets { vad_root: 0x7D8 })
    }

    /// Minimal XP EPROCESS: root pointer and node count.
    fn xp_eprocess(root: u32, count: u32) -> Vec<u8> {
        let mut e = vec![0u8; 0x300];
        e[0x11C..0x120].copy_from_slice(&root.to_le_bytes());
        e[0x240..0x244].copy_from_slice(&count.to_le_bytes());
        e
    }

    fn xp_short_node(start: u32, end: u32) -> Vec<u8> {
        let mut b = vec![0u8; 0x30];
        b[0x04..0x08].copy_from_slice(b"VadS");
        b[0x08..0x0C].copy_from_slice(&start.to_le_bytes());
        b[0x0C..0x10].copy_from_slice(&end.to_le_bytes());
        b
    }

    #[test]
    fn xp_single_leaf() {
        let kernel = TestKernel::new();
        kernel.put(0x8000_1000, &xp_short_node(0x20, 0x2F));
        let profile = xp_profile();
        let ep = xp_eprocess(0x8000_1008, 1);
        let (map, all) = spider_vad_map(
            &kernel,
            &profile,
            4,
            &EprocessView::new(&ep, &profile),
            &AddressSet::new(),
            ReadFlags::NOVAD,
        )
        .unwrap();
        assert_eq!(map.entries().len(), 1);
        let e = &map.entries()[0];
        assert_eq!(e.va_start, 0x20000);
        assert_eq!(e.va_end, 0x2FFFF);
        assert_eq!(e.va_node, 0x8000_1008);
        assert_eq!(e.vad_type, VadType::None);
        assert!(!e.private_memory);
        assert!(all.contains(0x8000_1000));
    }

    #[test]
    fn two_tier_protocol_prefetches_children_in_second_round() {
        let kernel = TestKernel::new();
        // root (full Vad) with a left child pointing at a short node
        let mut root = xp_short_node(0x10, 0x1F);
        root[0x04..0x08].copy_from_slice(b"Vad ");
        root[0x14..0x18].copy_from_slice(&0x8000_2008u32.to_le_bytes()); // left child
        kernel.put(0x8000_1000, &root);
        kernel.put(0x8000_2000, &xp_short_node(0x30, 0x3F));

        let profile = xp_profile();
        let ep = xp_eprocess(0x8000_1008, 2);
        let (map, all) = spider_vad_map(
            &kernel,
            &profile,
            4,
            &EprocessView::new(&ep, &profile),
            &AddressSet::new(),
            ReadFlags::NOVAD,
        )
        .unwrap();
        assert_eq!(map.entries().len(), 2);
        // sorted by va_start
        assert_eq!(map.entries()[0].va_start, 0x10000);
        assert_eq!(map.entries()[1].va_start, 0x30000);
        // root round + child retry round
        assert_eq!(kernel.prefetch_calls(), 2);
        assert!(all.contains(0x8000_2000));
    }

    #[test]
    fn warm_seed_collapses_to_one_round() {
        let kernel = TestKernel::new();
        let mut root = xp_short_node(0x10, 0x1F);
        root[0x04..0x08].copy_from_slice(b"Vad ");
        root[0x14..0x18].copy_from_slice(&0x8000_2008u32.to_le_bytes());
        kernel.put(0x8000_1000, &root);
        kernel.put(0x8000_2000, &xp_short_node(0x30, 0x3F));

        let profile = xp_profile();
        let ep = xp_eprocess(0x8000_1008, 2);
        let seed: AddressSet = [0x8000_1000u64, 0x8000_2000].into_iter().collect();
        let (map, _) = spider_vad_map(
            &kernel,
            &profile,
            4,
            &EprocessView::new(&ep, &profile),
            &seed,
            ReadFlags::NOVAD,
        )
        .unwrap();
        assert_eq!(map.entries().len(), 2);
        // seed prefetch + the root round; the child parses warm
        assert_eq!(kernel.prefetch_calls(), 2);
    }

    #[test]
    fn zero_count_publishes_empty_map() {
        let kernel = TestKernel::new();
        let profile = xp_profile();
        let ep = xp_eprocess(0x8000_1008, 0);
        let (map, all) = spider_vad_map(
            &kernel,
            &profile,
            4,
            &EprocessView::new(&ep, &profile),
            &AddressSet::new(),
            ReadFlags::NOVAD,
        )
        .unwrap();
        assert!(map.entries().is_empty());
        assert!(all.is_empty());
    }

    #[test]
    fn missing_root_is_an_error() {
        let kernel = TestKernel::new();
        let profile = xp_profile();
        let ep = xp_eprocess(0x1234, 5); // user-space value: no root
        let r = spider_vad_map(
            &kernel,
            &profile,
            4,
            &EprocessView::new(&ep, &profile),
            &AddressSet::new(),
            ReadFlags::NOVAD,
        );
        assert!(matches!(r, Err(VadError::NoRoot)));
    }

    #[test]
    fn overlapping_node_dropped() {
        let kernel = TestKernel::new();
        let mut root = xp_short_node(0x10, 0x2F);
        root[0x04..0x08].copy_from_slice(b"Vad ");
        root[0x14..0x18].copy_from_slice(&0x8000_2008u32.to_le_bytes());
        kernel.put(0x8000_1000, &root);
        // child overlaps the root's range
        kernel.put(0x8000_2000, &xp_short_node(0x20, 0x3F));

        let profile = xp_profile();
        let ep = xp_eprocess(0x8000_1008, 2);
        let (map, _) = spider_vad_map(
            &kernel,
            &profile,
            4,
            &EprocessView::new(&ep, &profile),
            &AddressSet::new(),
            ReadFlags::NOVAD,
        )
        .unwrap();
        assert_eq!(map.entries().len(), 1);
        assert_eq!(map.entries()[0].va_start, 0x10000);
    }

    #[test]
    fn excessive_commit_charge_clamps_to_zero() {
        let kernel = TestKernel::new();
        let mut node = xp_short_node(0x10, 0x1F); // 16 pages
        let u: u32 = 0x100; // commit charge 256 > 16
        node[0x1C..0x20].copy_from_slice(&u.to_le_bytes());
        kernel.put(0x8000_1000, &node);
        let profile = xp_profile();
        let ep = xp_eprocess(0x8000_1008, 1);
        let (map, _) = spider_vad_map(
            &kernel,
            &profile,
            4,
            &EprocessView::new(&ep, &profile),
            &AddressSet::new(),
            ReadFlags::NOVAD,
        )
        .unwrap();
        assert_eq!(map.entries()[0].commit_charge, 0);
    }

    #[test]
    fn w10_x64_extended_vpn_and_balanced_root() {
        let kernel = TestKernel::new();
        let mut node = vec![0u8; 0x98];
        node[0x04..0x08].copy_from_slice(b"VadS");
        node[0x30] = 1; // StartingVpnHigh
        node[0x31] = 1; // EndingVpnHigh
        kernel.put(0xFFFF_8000_0100_0010, &node);

        let profile = w10_profile();
        let mut ep = vec![0u8; 0x800];
        ep[0x7D8..0x7E0].copy_from_slice(&0xFFFF_8000_0100_0020u64.to_le_bytes());
        ep[0x7E8..0x7F0].copy_from_slice(&1u64.to_le_bytes()); // count
        let (map, _) = spider_vad_map(
            &kernel,
            &profile,
            100,
            &EprocessView::new(&ep, &profile),
            &AddressSet::new(),
            ReadFlags::NOVAD,
        )
        .unwrap();
        assert_eq!(map.entries().len(), 1);
        assert_eq!(map.entries()[0].va_start, 1u64 << 44);
        assert_eq!(map.entries()[0].va_node, 0xFFFF_8000_0100_0020);
    }

    #[test]
    fn unsupported_build_fails() {
        let kernel = TestKernel::new();
        let profile = WindowsProfile::new(Arch::X64, 2600, EprocessOffsets::default());
        let ep = vec![0u8; 0x100];
        let r = spider_vad_map(
            &kernel,
            &profile,
            4,
            &EprocessView::new(&ep, &profile),
            &AddressSet::new(),
            ReadFlags::NOVAD,
        );
        assert!(matches!(r, Err(VadError::UnsupportedVersion)));
    }
}
