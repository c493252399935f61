use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};

use vmrecon_addresses::PhysicalAddress;
use vmrecon_paging::PteMap;
use vmrecon_phys::AddressSet;
use vmrecon_vad::VadMap;

/// Host-supplied facts about one target process.
pub struct ProcessParams {
    /// Process id (for logging and collaborator queries).
    pub pid: u32,
    /// Image name.
    pub name: String,
    /// Physical address of the page-directory root (CR3 of the process).
    pub pa_dtb: u64,
    /// Restrict walks to user-accessible pages.
    pub user_only: bool,
    /// Cached image of the process's `EPROCESS` object.
    pub eprocess: Vec<u8>,
}

/// One attached target process with its published maps.
///
/// Two locks, by design: `update` guards structural map construction
/// (PTE and VAD core), `text` guards enrichment, so translation clients
/// keep running while names are fetched. Published maps are immutable;
/// readers clone the `Arc` and traverse lock-free.
pub struct Process {
    /// Process id.
    pub pid: u32,
    /// Image name.
    pub name: String,
    /// Page-directory root.
    pub pa_dtb: PhysicalAddress,
    /// Restrict walks to user-accessible pages.
    pub user_only: bool,
    pub(crate) eprocess: Vec<u8>,
    pub(crate) pte_map: RwLock<Option<Arc<PteMap>>>,
    pub(crate) vad_map: RwLock<Option<Arc<VadMap>>>,
    pub(crate) update_lock: Mutex<()>,
    pub(crate) text_lock: Mutex<()>,
    pub(crate) vad_prefetch: Mutex<AddressSet>,
    pub(crate) tlb_spider_done: AtomicBool,
}

impl Process {
    #[must_use]
    pub fn new(params: ProcessParams) -> Self {
        Self {
            pid: params.pid,
            name: params.name,
            pa_dtb: PhysicalAddress::new(params.pa_dtb),
            user_only: params.user_only,
            eprocess: params.eprocess,
            pte_map: RwLock::new(None),
            vad_map: RwLock::new(None),
            update_lock: Mutex::new(()),
            text_lock: Mutex::new(()),
            vad_prefetch: Mutex::new(AddressSet::new()),
            tlb_spider_done: AtomicBool::new(false),
        }
    }

    /// The node addresses seen by the last VAD build; seeding a fresh
    /// process object with these collapses its first build to a single
    /// prefetch round.
    #[must_use]
    pub fn vad_prefetch_seed(&self) -> AddressSet {
        self.vad_prefetch.lock().expect("prefetch lock").clone()
    }

    /// Install a prefetch seed (e.g. carried over from a previous
    /// analysis run of the same target).
    pub fn seed_vad_prefetch(&self, seed: AddressSet) {
        *self.vad_prefetch.lock().expect("prefetch lock") = seed;
    }
}
