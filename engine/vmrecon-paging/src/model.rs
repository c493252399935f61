use std::sync::Arc;

use vmrecon_addresses::{PhysicalAddress, VirtualAddress};
use vmrecon_info::Arch;
use vmrecon_phys::{CachedPage, PhysicalMemory, TlbCache};

use crate::info::{Phys2VirtInfo, Virt2PhysInfo};
use crate::pte_map::PteMap;

/// Why a forward translation failed.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    /// The leaf (or an intermediate) entry is not hardware-valid. The raw
    /// entry is carried for diagnostics; for leaf PTEs it may still name a
    /// transition frame or a pagefile slot.
    #[error("entry not present (raw pte 0x{pte:016X})")]
    NotPresent {
        /// Raw entry value.
        pte: u64,
    },
    /// A supervisor entry was hit in a user-only walk.
    #[error("supervisor page in user-only walk")]
    Supervisor,
    /// Reserved bits set (x86 PSE-36 range).
    #[error("reserved bits set in large-page entry")]
    Reserved,
    /// The address is outside the model's virtual range.
    #[error("address not canonical for this memory model")]
    NotCanonical,
    /// A required page-table page could not be read.
    #[error("page-table page unreadable")]
    PageTableUnreadable,
}

/// Everything a walker needs to touch physical memory.
///
/// A borrow bundle rather than an owner: the engine context owns the
/// source and the TLB cache and lends them to walks.
pub struct WalkContext<'a> {
    /// The physical-memory source.
    pub mem: &'a dyn PhysicalMemory,
    /// Cache of page-table pages.
    pub tlb: &'a TlbCache,
}

impl WalkContext<'_> {
    /// Cached page-table fetch, verified by the model hook.
    pub(crate) fn page_table(
        &self,
        model: &dyn MemoryModel,
        pa: PhysicalAddress,
    ) -> Option<Arc<CachedPage>> {
        let page = self.tlb.page_table(self.mem, pa, false)?;
        model.verify_page_table(&page, pa).then_some(page)
    }

    /// Highest physical address worth following.
    pub(crate) fn pa_max(&self) -> u64 {
        self.mem.max_phys_addr().as_u64()
    }
}

/// One target memory model (paging layout), selected once per analysed
/// system and dispatched through dynamically thereafter.
pub trait MemoryModel: Send + Sync {
    /// The architecture this model decodes.
    fn arch(&self) -> Arch;

    /// Translate `va` under the paging hierarchy rooted at `dtb`.
    ///
    /// # Errors
    /// [`TranslateError`] for non-present, supervisor-in-user-walk,
    /// reserved-bit and non-canonical failures.
    fn virt_to_phys(
        &self,
        ctx: &WalkContext<'_>,
        dtb: PhysicalAddress,
        user_only: bool,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, TranslateError>;

    /// Diagnostic translation: record the table page, index and raw entry
    /// at every level walked, valid or not.
    fn virt_to_phys_info(
        &self,
        ctx: &WalkContext<'_>,
        dtb: PhysicalAddress,
        user_only: bool,
        va: VirtualAddress,
    ) -> Virt2PhysInfo;

    /// Reverse search: scan the hierarchy for virtual pages mapping the
    /// page containing `pa`, capped at
    /// [`PHYS2VIRT_MAX_RESULTS`](crate::PHYS2VIRT_MAX_RESULTS).
    fn phys_to_virt_info(
        &self,
        ctx: &WalkContext<'_>,
        dtb: PhysicalAddress,
        user_only: bool,
        pa: PhysicalAddress,
    ) -> Phys2VirtInfo;

    /// Build the coalesced [`PteMap`] of every mapped run.
    fn pte_map(&self, ctx: &WalkContext<'_>, dtb: PhysicalAddress, user_only: bool) -> PteMap;

    /// Bulk-load the page-table pages reachable from `dtb` into the TLB
    /// cache, one scatter batch per level.
    fn tlb_spider(&self, ctx: &WalkContext<'_>, dtb: PhysicalAddress, user_only: bool);

    /// Sanity hook consulted on every page-table fetch. Both shipped
    /// models accept everything; a model for a hostile target can reject
    /// or patch obviously-bogus tables here.
    fn verify_page_table(&self, _page: &CachedPage, _pa: PhysicalAddress) -> bool {
        true
    }
}
