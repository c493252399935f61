//! # x86 Memory Model (32-bit protected mode)
//!
//! Two-level walk: page directory at `DTB & 0xFFFF_F000` indexed by
//! `VA >> 22`, page table indexed by `(VA >> 12) & 0x3FF`. A PDE with the
//! PS bit maps a 4 MiB page whose physical base extends into the PSE-36
//! range through bits 16:13 of the entry; entries with bits `0x003E_0000`
//! set are reserved and rejected.

use bitfield_struct::bitfield;

use vmrecon_addresses::{PhysicalAddress, VirtualAddress};
use vmrecon_info::Arch;
use vmrecon_phys::{AddressSet, CachedPage};

use crate::info::{Phys2VirtInfo, Virt2PhysInfo};
use crate::model::{MemoryModel, TranslateError, WalkContext};
use crate::pte_map::{PTE_FLAGS_MASK, PteMap, PteMapBuilder};

/// Bits of VA consumed below each level (level 1 = PT, level 2 = PD).
const REGION_SHIFT: [u32; 3] = [0, 12, 22];

/// 32-bit page-table / page-directory entry, hardware view.
#[bitfield(u32)]
struct Pte32 {
    present: bool,
    writable: bool,
    user: bool,
    write_through: bool,
    cache_disable: bool,
    accessed: bool,
    dirty: bool,
    /// PS in a PDE; PAT in a PTE.
    page_size: bool,
    global: bool,
    #[bits(3)]
    os_available: u8,
    #[bits(20)]
    frame: u32,
}

/// Windows x86 transition PTE: hardware-invalid, but the payload still
/// names the frame holding the page (standby/modified lists). Rewritten to
/// a present user read-only entry for map building only.
const fn transition_pte(raw: u32) -> Option<u32> {
    if raw & 0x0C01 == 0x0800 {
        Some((raw & 0xFFFF_F000) | 0x005)
    } else {
        None
    }
}

/// Physical base + in-page offset of a 4 MiB (PSE-36) mapping.
const fn large_page_base(raw: u32) -> u64 {
    ((raw & 0x0001_E000) as u64) << (32 - 13) | (raw & 0xFFC0_0000) as u64
}

/// The 32-bit protected-mode memory model.
#[derive(Default)]
pub struct MmX86;

impl MmX86 {
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
        for i in 0..1024 {
            if !b.has_room() {
                return;
            }
            let mut raw = page.dword(i);
            let software;
            if raw & 1 == 0 {
                if raw == 0 {
                    continue;
                }
                raw = match transition_pte(raw) {
                    Some(t) => t,
                    // non-transition software PTE: only leaves are guessed
                    None if level == 1 => 0x0000_0005,
                    None => continue,
                };
                software = true;
            } else {
                software = false;
            }
            if u64::from(raw & 0xFFFF_F000) > pa_max {
                continue;
            }
            if supervisor_pml {
                raw &= !0x4;
            }
            if user_only && raw & 0x4 == 0 {
                continue;
            }
            let va = va_base + ((i as u64) << REGION_SHIFT[level]);
            let pte = Pte32::from_bits(raw);
            if level == 1 || pte.page_size() {
                let pages = 1u64 << (REGION_SHIFT[level] - 12);
                let flags = u64::from(raw) & PTE_FLAGS_MASK;
                if !b.push_run(va, pages, flags, software) {
                    return;
                }
                continue;
            }
            let next_supervisor = !pte.user();
            let Some(pt) = ctx.page_table(self, PhysicalAddress::new(u64::from(raw & 0xFFFF_F000)))
            else {
                continue;
            };
            self.map_index(ctx, b, va, 1, &pt, next_supervisor, user_only);
        }
    }

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
        for i in 0..1024 {
            if out.full() {
                return;
            }
            let raw = page.dword(i);
            let pte = Pte32::from_bits(raw);
            if !pte.present() {
                continue;
            }
            if u64::from(raw & 0xFFFF_F000) > pa_max {
                continue;
            }
            if user_only && !pte.user() {
                continue;
            }
            let va = va_base + ((i as u64) << REGION_SHIFT[level]);
            if level == 1 {
                if u64::from(raw & 0xFFFF_F000) == target & 0xFFFF_F000 {
                    out.vas.push(va | (target & 0xFFF));
                }
                continue;
            }
            if pte.page_size() {
                if large_page_base(raw) == target & !0x003F_FFFF {
                    out.vas.push(va | (target & 0x003F_FFFF));
                }
                continue;
            }
            let Some(pt) = ctx.page_table(self, PhysicalAddress::new(u64::from(raw & 0xFFFF_F000)))
            else {
                continue;
            };
            self.p2v_index(ctx, va, 1, &pt, user_only, out);
        }
    }
}

impl MemoryModel for MmX86 {
    fn arch(&self) -> Arch {
        Arch::X86
    }

    fn virt_to_phys(
        &self,
        ctx: &WalkContext<'_>,
        dtb: PhysicalAddress,
        user_only: bool,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, TranslateError> {
        let va = va.as_u64();
        if va > 0xFFFF_FFFF || dtb.as_u64() > 0xFFFF_FFFF {
            return Err(TranslateError::NotCanonical);
        }
        let mut pa_table = dtb.as_u64() & 0xFFFF_F000;
        let mut level = 2usize;
        loop {
            let page = ctx
                .page_table(self, PhysicalAddress::new(pa_table))
                .ok_or(TranslateError::PageTableUnreadable)?;
            let i = ((va >> REGION_SHIFT[level]) & 0x3FF) as usize;
            let raw = page.dword(i);
            let pte = Pte32::from_bits(raw);
            if !pte.present() {
                return Err(TranslateError::NotPresent {
                    pte: u64::from(raw),
                });
            }
            if user_only && !pte.user() {
                return Err(TranslateError::Supervisor);
            }
            if level == 1 {
                return Ok(PhysicalAddress::new(
                    u64::from(raw & 0xFFFF_F000) | (va & 0xFFF),
                ));
            }
            if pte.page_size() {
                if raw & 0x003E_0000 != 0 {
                    return Err(TranslateError::Reserved);
                }
                return Ok(PhysicalAddress::new(
                    large_page_base(raw) | (va & 0x003F_FFFF),
                ));
            }
            pa_table = u64::from(raw & 0xFFFF_F000);
            level = 1;
        }
    }

    fn virt_to_phys_info(
        &self,
        ctx: &WalkContext<'_>,
        dtb: PhysicalAddress,
        user_only: bool,
        va: VirtualAddress,
    ) -> Virt2PhysInfo {
        let mut info = Virt2PhysInfo::new(Arch::X86, va);
        let va = va.as_u64();
        if va > 0xFFFF_FFFF {
            return info;
        }
        let mut pa_table = dtb.as_u64() & 0xFFFF_F000;
        let mut level = 2usize;
        loop {
            let Some(page) = ctx.page_table(self, PhysicalAddress::new(pa_table)) else {
                return info;
            };
            let i = ((va >> REGION_SHIFT[level]) & 0x3FF) as usize;
            let raw = page.dword(i);
            info.pas[level] = pa_table;
            info.indexes[level] = i as u16;
            info.ptes[level] = u64::from(raw);
            let pte = Pte32::from_bits(raw);
            if !pte.present() || (user_only && !pte.user()) {
                return info;
            }
            if level == 1 {
                info.pas[0] = u64::from(raw & 0xFFFF_F000);
                info.pa = Some(PhysicalAddress::new(info.pas[0] | (va & 0xFFF)));
                return info;
            }
            if pte.page_size() {
                if raw & 0x003E_0000 != 0 {
                    return info;
                }
                info.pas[0] = large_page_base(raw);
                info.pa = Some(PhysicalAddress::new(info.pas[0] | (va & 0x003F_FFFF)));
                return info;
            }
            pa_table = u64::from(raw & 0xFFFF_F000);
            level = 1;
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
        let Some(pd) = ctx.page_table(self, PhysicalAddress::new(dtb.as_u64() & 0xFFFF_F000))
        else {
            return out;
        };
        self.p2v_index(ctx, 0, 2, &pd, user_only, &mut out);
        out
    }

    fn pte_map(&self, ctx: &WalkContext<'_>, dtb: PhysicalAddress, user_only: bool) -> PteMap {
        let mut b = PteMapBuilder::new();
        if let Some(pd) = ctx.page_table(self, PhysicalAddress::new(dtb.as_u64() & 0xFFFF_F000)) {
            self.map_index(ctx, &mut b, 0, 2, &pd, false, user_only);
        }
        b.finish()
    }

    fn tlb_spider(&self, ctx: &WalkContext<'_>, dtb: PhysicalAddress, user_only: bool) {
        let Some(pd) = ctx.page_table(self, PhysicalAddress::new(dtb.as_u64() & 0xFFFF_F000))
        else {
            return;
        };
        let mut set = AddressSet::new();
        for i in 0..1024 {
            let raw = pd.dword(i);
            let pte = Pte32::from_bits(raw);
            if !pte.present() || pte.page_size() {
                continue;
            }
            if user_only && !pte.user() {
                continue;
            }
            set.push(u64::from(raw & 0xFFFF_F000));
        }
        log::trace!("x86 tlb spider queueing {} page tables", set.len());
        ctx.tlb.prefetch(ctx.mem, &set);
    }
}
