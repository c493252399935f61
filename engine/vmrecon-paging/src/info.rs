use vmrecon_addresses::{PhysicalAddress, VirtualAddress};
use vmrecon_info::Arch;

/// Cap on reverse-translation results per process.
pub const PHYS2VIRT_MAX_RESULTS: usize = 0x10;

/// Diagnostic record of one translation attempt.
///
/// Slots are indexed by paging level (x86 uses 2 and 1, x64 uses 4 through
/// 1); slot 0 holds the physical *page base* the walk resolved to, or zero.
/// [`Virt2PhysInfo::pa`] additionally joins the in-page offset for the
/// leaf size that terminated the walk.
#[derive(Clone, Debug)]
pub struct Virt2PhysInfo {
    /// Memory model that produced the record.
    pub arch: Arch,
    /// The queried virtual address.
    pub va: VirtualAddress,
    /// Physical address of the table page consulted at each level;
    /// slot 0 is the final page base.
    pub pas: [u64; 5],
    /// Index into the table at each level.
    pub indexes: [u16; 5],
    /// Raw entry read at each level.
    pub ptes: [u64; 5],
    /// Full physical address (page base + offset) on success.
    pub pa: Option<PhysicalAddress>,
}

impl Virt2PhysInfo {
    #[must_use]
    pub const fn new(arch: Arch, va: VirtualAddress) -> Self {
        Self {
            arch,
            va,
            pas: [0; 5],
            indexes: [0; 5],
            ptes: [0; 5],
            pa: None,
        }
    }

    /// Raw leaf entry (level 1), zero when the walk never got there.
    #[inline]
    #[must_use]
    pub const fn leaf_pte(&self) -> u64 {
        self.ptes[1]
    }
}

/// Result of a reverse (physical → virtual) search in one process.
#[derive(Clone, Debug)]
pub struct Phys2VirtInfo {
    /// The physical address searched for.
    pub pa_target: PhysicalAddress,
    /// Virtual addresses found to map it, at most
    /// [`PHYS2VIRT_MAX_RESULTS`].
    pub vas: Vec<u64>,
}

impl Phys2VirtInfo {
    #[must_use]
    pub const fn new(pa_target: PhysicalAddress) -> Self {
        Self {
            pa_target,
            vas: Vec::new(),
        }
    }

    /// `true` once the result list is full and the scan should stop.
    #[inline]
    #[must_use]
    pub fn full(&self) -> bool {
        self.vas.len() >= PHYS2VIRT_MAX_RESULTS
    }
}
