//! # VAD Map Enrichment
//!
//! Resolves what each region *is*: the subsection → control area → file
//! object → `FileName` chain gives file- and image-backed regions their
//! path, the collaborator heap and thread maps tag heap, TEB and stack
//! regions. Five phases, each one bulk prefetch followed by cache-only
//! reads, so the whole pass costs a handful of physical round-trips
//! regardless of map size.
//!
//! Enrichment never mutates the published structural map; it produces a
//! new map value (same entries, labels attached) for the facade to
//! publish under its text lock.

use vmrecon_addresses::{kaddr_4_8, kaddr_8_16};
use vmrecon_info::{BUILD_VISTA, WindowsProfile};
use vmrecon_phys::{AddressSet, ReadFlags};

use crate::map::{VadEntry, VadMap};
use crate::reader::{HeapMap, KernelRead, ThreadMap};
use crate::{TAG_MM_CA, TAG_MM_CI};

/// UTF-16 units fetched per name at most (clamp from the original).
const NAME_CHARS_MAX: u16 = 0xFF;

/// Offset of the object within its prefetched pool window: reads below
/// start one pool header before the object.
const OBJ_OFF: usize = 0x10;

/// One name chase in flight: entry index plus the address the next phase
/// dereferences (zero once the chase died).
struct Chase {
    idx: usize,
    va: u64,
    chars: u16,
}

/// `true` when the pool tag for the object at `obj_off` matches `tag`
/// (the tag dword sits at the end of the preceding pool header).
fn prepended_tag(pb: &[u8], obj_off: usize, is32: bool, tag: u32) -> bool {
    let o = obj_off - if is32 { 4 } else { 12 };
    u32::from_le_bytes(pb[o..o + 4].try_into().unwrap()) == tag
}

fn ptr_from(pb: &[u8], is32: bool) -> u64 {
    if is32 {
        u64::from(u32::from_le_bytes(pb[..4].try_into().unwrap()))
    } else {
        u64::from_le_bytes(pb[..8].try_into().unwrap())
    }
}

fn read_ptr(reader: &dyn KernelRead, is32: bool, va: u64, flags: ReadFlags) -> u64 {
    let mut pb = [0u8; 8];
    let len = if is32 { 4 } else { 8 };
    if reader.read(va, &mut pb[..len], flags).is_err() {
        return 0;
    }
    ptr_from(&pb, is32)
}

/// Append `label` to the arena and point `entry` at it.
fn set_label(entry: &mut VadEntry, arena: &mut Vec<u16>, label: &str) {
    entry.text_off = u32::try_from(arena.len()).unwrap_or(0);
    let start = arena.len();
    arena.extend(label.encode_utf16());
    entry.text_chars = u16::try_from(arena.len() - start).unwrap_or(0);
    arena.push(0);
}

/// Sorted lookup of the entry containing `va`.
fn index_containing(entries: &[VadEntry], va: u64) -> Option<usize> {
    let i = entries.partition_point(|e| e.va_start <= va).checked_sub(1)?;
    (va <= entries[i].va_end).then_some(i)
}

/// Produce an enriched copy of `map`.
///
/// Failures stay local throughout: a chase that dies at any phase simply
/// leaves its entry unlabelled.
#[must_use]
pub fn enrich_vad_map(
    reader: &dyn KernelRead,
    profile: &WindowsProfile,
    map: &VadMap,
    heap: Option<&HeapMap>,
    threads: Option<&ThreadMap>,
    flags: ReadFlags,
) -> VadMap {
    let is32 = profile.is32();
    let cache_flags = flags | ReadFlags::FORCECACHE_READ;
    let mut entries: Vec<VadEntry> = map.entries().to_vec();
    let mut arena: Vec<u16> = vec![0];

    // phase 1: harvest subsection pointers
    let mut chases: Vec<Chase> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| kaddr_4_8(is32, e.va_subsection))
        .map(|(idx, e)| Chase {
            idx,
            va: e.va_subsection,
            chars: 0,
        })
        .collect();

    if profile.build >= BUILD_VISTA {
        // _SUBSECTION leads with the control-area pointer
        let set: AddressSet = chases.iter().map(|c| c.va).collect();
        reader.prefetch(&set, 8);
        for c in &mut chases {
            let va = read_ptr(reader, is32, c.va, cache_flags);
            c.va = if kaddr_8_16(is32, va) {
                va - OBJ_OFF as u64
            } else {
                0
            };
        }
    } else {
        // XP stores the control area in the map directly
        for c in &mut chases {
            c.va -= OBJ_OFF as u64;
        }
    }

    // phase 2: control area -> file object (EX_FAST_REF)
    let fp_off = OBJ_OFF + profile.control_area_file_pointer_offset() as usize;
    let set: AddressSet = chases.iter().map(|c| c.va).collect();
    reader.prefetch(&set, 0x60);
    for c in &mut chases {
        if c.va == 0 {
            continue;
        }
        let mut pb = [0u8; 0x60];
        if reader.read(c.va, &mut pb, cache_flags).is_err() {
            c.va = 0;
            continue;
        }
        let is_ca = prepended_tag(&pb, OBJ_OFF, is32, TAG_MM_CA);
        let is_ci = prepended_tag(&pb, OBJ_OFF, is32, TAG_MM_CI);
        if !is_ca && !is_ci {
            c.va = 0;
            continue;
        }
        let e = &mut entries[c.idx];
        e.va_control_area = c.va + OBJ_OFF as u64;
        let fo = ptr_from(&pb[fp_off..], is32) & profile.ex_fast_ref_mask();
        if kaddr_8_16(is32, fo) {
            if is_ca {
                e.file = true;
            } else {
                e.image = true;
            }
            e.va_file_object = fo;
            c.va = fo;
        } else {
            // a control area without a resolvable file backs a pagefile
            // section; there is no name to fetch
            if is_ca {
                e.page_file = true;
            }
            c.va = 0;
        }
    }

    // phase 3: file object -> FileName UNICODE_STRING
    let fn_off = profile.file_object_filename_offset() as usize;
    let set: AddressSet = chases.iter().map(|c| c.va).collect();
    reader.prefetch(&set, 0x68);
    for c in &mut chases {
        if c.va == 0 {
            continue;
        }
        let mut pb = [0u8; 0x68];
        if reader.read(c.va, &mut pb, cache_flags).is_err() {
            c.va = 0;
            continue;
        }
        let len = u16::from_le_bytes(pb[fn_off..fn_off + 2].try_into().unwrap());
        let max_len = u16::from_le_bytes(pb[fn_off + 2..fn_off + 4].try_into().unwrap());
        let buf_ptr = ptr_from(&pb[fn_off + if is32 { 4 } else { 8 }..], is32);
        if len == 0 || len > max_len || !kaddr_8_16(is32, buf_ptr) {
            c.va = 0;
            continue;
        }
        c.chars = u16::min(NAME_CHARS_MAX, len >> 1);
        c.va = buf_ptr;
    }

    // phase 4: fetch the names into the single arena
    let set: AddressSet = chases.iter().map(|c| c.va).collect();
    reader.prefetch(&set, usize::from(NAME_CHARS_MAX) * 2);
    for c in &chases {
        if c.va == 0 || c.chars == 0 {
            continue;
        }
        let mut pb = vec![0u8; usize::from(c.chars) * 2];
        if reader.read(c.va, &mut pb, cache_flags).is_err() {
            continue;
        }
        let e = &mut entries[c.idx];
        e.text_off = u32::try_from(arena.len()).unwrap_or(0);
        e.text_chars = c.chars;
        arena.extend(
            pb.chunks_exact(2)
                .map(|w| u16::from_le_bytes([w[0], w[1]])),
        );
        arena.push(0);
    }

    // phase 5a: heap segments
    if let Some(heap) = heap {
        for seg in &heap.segments {
            let Some(i) = index_containing(&entries, seg.va_segment) else {
                continue;
            };
            let e = &mut entries[i];
            e.heap = true;
            e.heap_id = seg.heap_id;
            if !e.has_text() {
                set_label(e, &mut arena, &format!("HEAP-{:02X}", seg.heap_id));
            }
        }
    }

    // phase 5b: TEB and stack regions
    if let Some(threads) = threads {
        for t in &threads.threads {
            let tid = u32::min(t.tid, 0xFFFF);
            if let Some(i) = index_containing(&entries, t.va_teb) {
                let e = &mut entries[i];
                e.teb = true;
                if !e.has_text() {
                    set_label(e, &mut arena, &format!("TEB-{tid:04X}"));
                }
            }
            if let Some(i) = index_containing(&entries, t.va_stack_limit_user) {
                let e = &mut entries[i];
                e.stack = true;
                if !e.has_text() {
                    set_label(e, &mut arena, &format!("STACK-{tid:04X}"));
                }
            }
        }
    }

    VadMap::from_parts(entries, arena, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::VadEntry;
    use crate::reader::{HeapSegment, ThreadRegions};
    use crate::test_support::TestKernel;
    use vmrecon_info::{Arch, EprocessOffsets};

    fn w10_profile() -> WindowsProfile {
        WindowsProfile::new(Arch::X64, 19041, EprocessOffsets::default())
    }

    fn entry(start: u64, end: u64, subsection: u64) -> VadEntry {
        VadEntry {
            va_start: start,
            va_end: end,
            va_subsection: subsection,
            ..VadEntry::default()
        }
    }

    /// Lay out subsection -> control area -> file object -> name in the
    /// fake kernel and return the subsection VA.
    fn install_file_chain(kernel: &TestKernel, tag: &[u8; 4], name: &str) -> u64 {
        let va_subsection = 0xFFFF_8000_0001_0000u64;
        let va_ca = 0xFFFF_8000_0002_0010u64; // control area proper
        let va_fo = 0xFFFF_8000_0003_0000u64;
        let va_name = 0xFFFF_8000_0004_0000u64;

        kernel.put(va_subsection, &va_ca.to_le_bytes());
        // pool header precedes the control area; tag at (base - 12)
        kernel.put(va_ca - 12, tag);
        // FilePointer (EX_FAST_REF with low bits set) at CA + 0x40
        kernel.put(va_ca + 0x40, &(va_fo | 0x9).to_le_bytes());
        // FILE_OBJECT.FileName at +0x58: Length, MaximumLength, Buffer
        let len = (name.encode_utf16().count() * 2) as u16;
        kernel.put(va_fo + 0x58, &len.to_le_bytes());
        kernel.put(va_fo + 0x5A, &len.to_le_bytes());
        kernel.put(va_fo + 0x60, &va_name.to_le_bytes());
        let utf16: Vec<u8> = name
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        kernel.put(va_name, &utf16);
        va_subsection
    }

    #[test]
    fn file_backed_region_gets_its_name() {
        let kernel = TestKernel::new();
        let sub = install_file_chain(&kernel, b"MmCa", r"\Windows\System32\ntdll.dll");
        let map = VadMap::from_parts(vec![entry(0x10000, 0x1FFFF, sub)], vec![0], false);
        let out = enrich_vad_map(
            &kernel,
            &w10_profile(),
            &map,
            None,
            None,
            ReadFlags::NOVAD,
        );
        let e = &out.entries()[0];
        assert!(e.file);
        assert!(!e.image && !e.page_file);
        assert_eq!(e.va_control_area, 0xFFFF_8000_0002_0010);
        assert_eq!(e.va_file_object, 0xFFFF_8000_0003_0000);
        assert_eq!(out.text_string(e), r"\Windows\System32\ntdll.dll");
        assert!(out.has_text());
    }

    #[test]
    fn image_tag_sets_image_not_file() {
        let kernel = TestKernel::new();
        let sub = install_file_chain(&kernel, b"MmCi", r"\x.exe");
        let map = VadMap::from_parts(vec![entry(0x10000, 0x1FFFF, sub)], vec![0], false);
        let out = enrich_vad_map(
            &kernel,
            &w10_profile(),
            &map,
            None,
            None,
            ReadFlags::NOVAD,
        );
        let e = &out.entries()[0];
        assert!(e.image);
        assert!(!e.file);
    }

    #[test]
    fn control_area_without_file_is_pagefile_backed() {
        let kernel = TestKernel::new();
        let va_subsection = 0xFFFF_8000_0001_0000u64;
        let va_ca = 0xFFFF_8000_0002_0010u64;
        kernel.put(va_subsection, &va_ca.to_le_bytes());
        kernel.put(va_ca - 12, b"MmCa");
        kernel.put(va_ca + 0x40, &0u64.to_le_bytes()); // null FilePointer
        let map = VadMap::from_parts(
            vec![entry(0x10000, 0x1FFFF, va_subsection)],
            vec![0],
            false,
        );
        let out = enrich_vad_map(
            &kernel,
            &w10_profile(),
            &map,
            None,
            None,
            ReadFlags::NOVAD,
        );
        let e = &out.entries()[0];
        assert!(e.page_file);
        assert!(!e.file);
        assert!(!e.has_text());
    }

    #[test]
    fn heap_without_filename_is_synthesised() {
        let kernel = TestKernel::new();
        let map = VadMap::from_parts(vec![entry(0x30_0000, 0x30_FFFF, 0)], vec![0], false);
        let heap = HeapMap {
            segments: vec![HeapSegment {
                va_segment: 0x30_0000,
                heap_id: 3,
            }],
        };
        let out = enrich_vad_map(
            &kernel,
            &w10_profile(),
            &map,
            Some(&heap),
            None,
            ReadFlags::NOVAD,
        );
        let e = &out.entries()[0];
        assert!(e.heap);
        assert_eq!(e.heap_id, 3);
        assert_eq!(out.text_string(e), "HEAP-03");
    }

    #[test]
    fn teb_and_stack_tagging() {
        let kernel = TestKernel::new();
        let map = VadMap::from_parts(
            vec![
                entry(0x100_0000, 0x100_FFFF, 0), // stack region
                entry(0x7FF_0000, 0x7FF_1FFF, 0), // teb region
            ],
            vec![0],
            false,
        );
        let threads = ThreadMap {
            threads: vec![ThreadRegions {
                tid: 0x1C4,
                va_teb: 0x7FF_0000,
                va_stack_limit_user: 0x100_2000,
            }],
        };
        let out = enrich_vad_map(
            &kernel,
            &w10_profile(),
            &map,
            None,
            Some(&threads),
            ReadFlags::NOVAD,
        );
        let stack = &out.entries()[0];
        let teb = &out.entries()[1];
        assert!(teb.teb);
        assert_eq!(out.text_string(teb), "TEB-01C4");
        assert!(stack.stack);
        assert_eq!(out.text_string(stack), "STACK-01C4");
    }

    #[test]
    fn existing_name_is_not_overwritten() {
        let kernel = TestKernel::new();
        let sub = install_file_chain(&kernel, b"MmCa", r"\heap-backing.dat");
        let map = VadMap::from_parts(vec![entry(0x30_0000, 0x30_FFFF, sub)], vec![0], false);
        let heap = HeapMap {
            segments: vec![HeapSegment {
                va_segment: 0x30_0000,
                heap_id: 7,
            }],
        };
        let out = enrich_vad_map(
            &kernel,
            &w10_profile(),
            &map,
            Some(&heap),
            None,
            ReadFlags::NOVAD,
        );
        let e = &out.entries()[0];
        assert!(e.heap);
        assert_eq!(out.text_string(e), r"\heap-backing.dat");
    }

    #[test]
    fn labels_are_nul_terminated_inside_the_arena() {
        let kernel = TestKernel::new();
        let sub = install_file_chain(&kernel, b"MmCa", r"\a.dll");
        let map = VadMap::from_parts(
            vec![entry(0x10000, 0x1FFFF, sub), entry(0x30000, 0x3FFFF, 0)],
            vec![0],
            false,
        );
        let heap = HeapMap {
            segments: vec![HeapSegment {
                va_segment: 0x30000,
                heap_id: 1,
            }],
        };
        let out = enrich_vad_map(
            &kernel,
            &w10_profile(),
            &map,
            Some(&heap),
            None,
            ReadFlags::NOVAD,
        );
        let arena = out.text_arena();
        assert_eq!(arena[0], 0);
        for e in out.entries() {
            let end = e.text_off as usize + e.text_chars as usize;
            assert!(end < arena.len());
            assert_eq!(arena[end], 0);
        }
    }
}
