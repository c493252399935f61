//! # x64 Memory Model (long mode)
//!
//! Four-level walk: PML4 → PDPT → PD → PT, nine index bits per level,
//! 48-bit canonical virtual addresses. Large leaves terminate the walk at
//! the PDPT (1 GiB) or PD (2 MiB) level via the PS bit.

use bitfield_struct::bitfield;

use vmrecon_addresses::{PhysicalAddress, VirtualAddress};
use vmrecon_info::Arch;
use vmrecon_phys::{AddressSet, CachedPage};

use crate::info::{Phys2VirtInfo, Virt2PhysInfo};
use crate::model::{MemoryModel, TranslateError, WalkContext};
use crate::pte_map::{PTE_FLAGS_MASK, PteMap, PteMapBuilder};

/// Bits of VA consumed below each level (1 = PT .. 4 = PML4).
const REGION_SHIFT: [u32; 5] = [0, 12, 21, 30, 39];

/// Physical-frame bits of a long-mode entry.
const FRAME_MASK: u64 = 0x0000_FFFF_FFFF_F000;

/// 64-bit paging entry, hardware view (any level).
#[bitfield(u64)]
struct Pte64 {
    present: bool,
    writable: bool,
    user: bool,
    write_through: bool,
    cache_disable: bool,
    accessed: bool,
    dirty: bool,
    /// PS in PDPTE/PDE; PAT in a PTE.
    page_size: bool,
    global: bool,
    #[bits(3)]
    os_available: u8,
    #[bits(40)]
    frame: u64,
    #[bits(7)]
    os_available_high: u8,
    #[bits(4)]
    protection_key: u8,
    no_execute: bool,
}

/// `true` when bits 63:47 are a sign extension of bit 47.
const fn is_canonical(va: u64) -> bool {
    let top = va >> 47;
    top == 0 || top == 0x1_FFFF
}

/// Windows x64 transition PTE, rewritten for map building only.
const fn transition_pte(raw: u64) -> Option<u64> {
    if raw & 0x0C01 == 0x0800 {
        Some((raw & FRAME_MASK) | 0x005)
    } else {
        None
    }
}

/// Sign-extend a VA assembled from table indices.
const fn canonicalize(va: u64) -> u64 {
    if va & 0x0000_8000_0000_0000 != 0 {
        va | 0xFFFF_0000_0000_0000
    } else {
        va
    }
}

/// The long-mode memory model.
#[derive(Default)]
pub struct MmX64;

impl MmX64 {
    #[allow(clippy::too_many_arguments)]
    fn map_index(
        &self,
        ctx: &WalkContext<'_>,
        b: &mut PteMapBuilder,
        va_base: u64,
        level: usize,
        page: &CachedPage,
        supervisor_pml: bool,
        user_only: bool,
    ) {
        let pa_max = ctx.pa_max();
        for i in 0..512 {
            if !b.has_room() {
                return;
            }
            let mut raw = page.qword(i);
            let software;
            if raw & 1 == 0 {
                if raw == 0 {
                    continue;
                }
                raw = match transition_pte(raw) {
                    Some(t) => t,
                    None if level == 1 => 0x0000_0005,
                    None => continue,
                };
                software = true;
            } else {
                software = false;
            }
            if raw & FRAME_MASK > pa_max {
                continue;
            }
            if supervisor_pml {
                raw &= !0x4;
            }
            if user_only && raw & 0x4 == 0 {
                continue;
            }
            let va = canonicalize(va_base + ((i as u64) << REGION_SHIFT[level]));
            let pte = Pte64::from_bits(raw);
            if level == 1 || (pte.page_size() && level <= 3) {
                let pages = 1u64 << (REGION_SHIFT[level] - 12);
                if !b.push_run(va, pages, raw & PTE_FLAGS_MASK, software) {
                    return;
                }
                continue;
            }
            let next_supervisor = !pte.user();
            let Some(pt) = ctx.page_table(self, PhysicalAddress::new(raw & FRAME_MASK)) else {
                continue;
            };
            self.map_index(ctx, b, va, level - 1, &pt, next_supervisor, user_only);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn p2v_index(
        &self,
        ctx: &WalkContext<'_>,
        va_base: u64,
        level: usize,
        page: &CachedPage,
        user_only: bool,
        out: &mut Phys2VirtInfo,
    ) {
        let pa_max = ctx.pa_max();
        let target = out.pa_target.as_u64();
        for i in 0..512 {
            if out.full() {
                return;
            }
            let raw = page.qword(i);
            let pte = Pte64::from_bits(raw);
            if !pte.present() {
                continue;
            }
            if raw & FRAME_MASK > pa_max {
                continue;
            }
            if user_only && !pte.user() {
                continue;
            }
            let va = canonicalize(va_base + ((i as u64) << REGION_SHIFT[level]));
            if level == 1 {
                if raw & FRAME_MASK == target & FRAME_MASK {
                    out.vas.push(va | (target & 0xFFF));
                }
                continue;
            }
            if pte.page_size() && level <= 3 {
                let span = (1u64 << REGION_SHIFT[level]) - 1;
                if raw & FRAME_MASK & !span == target & !span {
                    out.vas.push(va | (target & span));
                }
                continue;
            }
            let Some(pt) = ctx.page_table(self, PhysicalAddress::new(raw & FRAME_MASK)) else {
                continue;
            };
            self.p2v_index(ctx, va, level - 1, &pt, user_only, out);
        }
    }

    /// Collect next-level table pages referenced by `page`.
    fn collect_tables(page: &CachedPage, user_only: bool, out: &mut AddressSet) {
        for i in 0..512 {
            let raw = page.qword(i);
            let pte = Pte64::from_bits(raw);
            if !pte.present() || pte.page_size() {
                continue;
            }
            if user_only && !pte.user() {
                continue;
            }
            out.push(raw & FRAME_MASK);
        }
    }
}

impl MemoryModel for MmX64 {
    fn arch(&self) -> Arch {
        Arch::X64
    }

    fn virt_to_phys(
        &self,
        ctx: &WalkContext<'_>,
        dtb: PhysicalAddress,
        user_only: bool,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, TranslateError> {
        let va = va.as_u64();
        if !is_canonical(va) {
            return Err(TranslateError::NotCanonical);
        }
        let mut pa_table = dtb.as_u64() & FRAME_MASK;
        let mut level = 4usize;
        loop {
            let page = ctx
                .page_table(self, PhysicalAddress::new(pa_table))
                .ok_or(TranslateError::PageTableUnreadable)?;
            let i = ((va >> REGION_SHIFT[level]) & 0x1FF) as usize;
            let raw = page.qword(i);
            let pte = Pte64::from_bits(raw);
            if !pte.present() {
                return Err(TranslateError::NotPresent { pte: raw });
            }
            if user_only && !pte.user() {
                return Err(TranslateError::Supervisor);
            }
            if level == 1 || (pte.page_size() && level <= 3) {
                let span = (1u64 << REGION_SHIFT[level]) - 1;
                return Ok(PhysicalAddress::new((raw & FRAME_MASK & !span) | (va & span)));
            }
            pa_table = raw & FRAME_MASK;
            level -= 1;
        }
    }

    fn virt_to_phys_info(
        &self,
        ctx: &WalkContext<'_>,
        dtb: PhysicalAddress,
        user_only: bool,
        va: VirtualAddress,
    ) -> Virt2PhysInfo {
        let mut info = Virt2PhysInfo::new(Arch::X64, va);
        let va = va.as_u64();
        if !is_canonical(va) {
            return info;
        }
        let mut pa_table = dtb.as_u64() & FRAME_MASK;
        let mut level = 4usize;
        loop {
            let Some(page) = ctx.page_table(self, PhysicalAddress::new(pa_table)) else {
                return info;
            };
            let i = ((va >> REGION_SHIFT[level]) & 0x1FF) as usize;
            let raw = page.qword(i);
            info.pas[level] = pa_table;
            info.indexes[level] = i as u16;
            info.ptes[level] = raw;
            let pte = Pte64::from_bits(raw);
            if !pte.present() || (user_only && !pte.user()) {
                return info;
            }
            if level == 1 || (pte.page_size() && level <= 3) {
                let span = (1u64 << REGION_SHIFT[level]) - 1;
                info.pas[0] = raw & FRAME_MASK & !span;
                info.pa = Some(PhysicalAddress::new(info.pas[0] | (va & span)));
                return info;
            }
            pa_table = raw & FRAME_MASK;
            level -= 1;
        }
    }

    fn phys_to_virt_info(
        &self,
        ctx: &WalkContext<'_>,
        dtb: PhysicalAddress,
        user_only: bool,
        pa: PhysicalAddress,
    ) -> Phys2VirtInfo {
        let mut out = Phys2VirtInfo::new(pa);
        if pa.as_u64() > ctx.pa_max() {
            return out;
        }
        let Some(pml4) = ctx.page_table(self, PhysicalAddress::new(dtb.as_u64() & FRAME_MASK))
        else {
            return out;
        };
        self.p2v_index(ctx, 0, 4, &pml4, user_only, &mut out);
        out
    }

    fn pte_map(&self, ctx: &WalkContext<'_>, dtb: PhysicalAddress, user_only: bool) -> PteMap {
        let mut b = PteMapBuilder::new();
        if let Some(pml4) = ctx.page_table(self, PhysicalAddress::new(dtb.as_u64() & FRAME_MASK)) {
            self.map_index(ctx, &mut b, 0, 4, &pml4, false, user_only);
        }
        b.finish()
    }

    fn tlb_spider(&self, ctx: &WalkContext<'_>, dtb: PhysicalAddress, user_only: bool) {
        // one prefetch batch per level: PML4 -> PDPTs -> PDs -> PTs
        let Some(pml4) = ctx.page_table(self, PhysicalAddress::new(dtb.as_u64() & FRAME_MASK))
        else {
            return;
        };
        let mut level_pas = AddressSet::new();
        Self::collect_tables(&pml4, user_only, &mut level_pas);
        for level in (1..=3).rev() {
            ctx.tlb.prefetch(ctx.mem, &level_pas);
            if level == 1 {
                break;
            }
            let mut next = AddressSet::new();
            for pa in level_pas.iter() {
                if let Some(page) = ctx.tlb.page_table(ctx.mem, PhysicalAddress::new(pa), false) {
                    Self::collect_tables(&page, user_only, &mut next);
                }
            }
            log::trace!("x64 tlb spider level {level}: {} tables queued", next.len());
            level_pas = next;
        }
    }
}
