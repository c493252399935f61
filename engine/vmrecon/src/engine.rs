use std::sync::Arc;
use std::sync::atomic::Ordering;

use vmrecon_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use vmrecon_info::{Arch, WindowsProfile};
use vmrecon_paging::{
    MemoryModel, MmX64, MmX86, Phys2VirtInfo, PteMap, TranslateError, Virt2PhysInfo, WalkContext,
};
use vmrecon_phys::{AddressSet, PageCache, PhysicalMemory, ReadError, ReadFlags, TlbCache};
use vmrecon_vad::{
    EprocessView, HeapMap, KernelRead, ProtoPteCache, ThreadMap, VadError, VadMap,
    enrich_vad_map, proto_pte_at, spider_vad_map,
};

use crate::process::Process;

/// Failures the facade reports to callers.
///
/// Each of these also publishes an empty map for the affected process,
/// so repeated calls observe the empty map instead of re-attempting.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The build number maps to no supported memory model / VAD layout.
    #[error("unsupported windows build")]
    UnsupportedVersion,
    /// The process DTB does not resolve any page table.
    #[error("dtb resolves no page table")]
    DtbUnusable,
    /// VAD reconstruction failed outright.
    #[error(transparent)]
    Vad(#[from] VadError),
    /// A translation entry point failed.
    #[error(transparent)]
    Translate(#[from] TranslateError),
    /// A physical read failed.
    #[error(transparent)]
    Read(#[from] ReadError),
}

/// Collaborator producing per-process heap maps.
pub trait HeapMapProvider: Send + Sync {
    /// Heap segments of `pid`, `None` when unknown.
    fn heap_map(&self, pid: u32) -> Option<HeapMap>;
}

/// Collaborator producing per-process thread maps.
pub trait ThreadMapProvider: Send + Sync {
    /// Thread regions of `pid`, `None` when unknown.
    fn thread_map(&self, pid: u32) -> Option<ThreadMap>;
}

/// The engine context: one per analysed system.
///
/// Owns the physical source, both page caches, the selected memory
/// model, the target profile and the prototype-PTE cache. All state that
/// the original design note calls "process-wide singletons" lives here,
/// behind one handle.
pub struct VmmEngine {
    mem: Arc<dyn PhysicalMemory>,
    profile: WindowsProfile,
    model: Box<dyn MemoryModel>,
    kernel_dtb: PhysicalAddress,
    tlb: TlbCache,
    data: PageCache,
    proto: ProtoPteCache,
    heap_provider: Option<Box<dyn HeapMapProvider>>,
    thread_provider: Option<Box<dyn ThreadMapProvider>>,
}

impl VmmEngine {
    /// Create an engine for one target system.
    ///
    /// `kernel_dtb` is the system process's page-directory root, used to
    /// translate kernel virtual addresses during VAD reconstruction.
    ///
    /// # Errors
    /// [`EngineError::UnsupportedVersion`] when the profile names a
    /// build/architecture combination without a VAD layout.
    pub fn new(
        mem: Arc<dyn PhysicalMemory>,
        profile: WindowsProfile,
        kernel_dtb: PhysicalAddress,
    ) -> Result<Self, EngineError> {
        if profile.vad_variant().is_none() {
            return Err(EngineError::UnsupportedVersion);
        }
        let model: Box<dyn MemoryModel> = match profile.arch {
            Arch::X86 => Box::new(MmX86),
            Arch::X64 => Box::new(MmX64),
        };
        Ok(Self {
            mem,
            profile,
            model,
            kernel_dtb,
            tlb: TlbCache::new(),
            data: PageCache::new(),
            proto: ProtoPteCache::new(),
            heap_provider: None,
            thread_provider: None,
        })
    }

    /// Attach the heap-map collaborator.
    pub fn set_heap_provider(&mut self, p: Box<dyn HeapMapProvider>) {
        self.heap_provider = Some(p);
    }

    /// Attach the thread-map collaborator.
    pub fn set_thread_provider(&mut self, p: Box<dyn ThreadMapProvider>) {
        self.thread_provider = Some(p);
    }

    /// The target profile this engine decodes.
    #[must_use]
    pub const fn profile(&self) -> &WindowsProfile {
        &self.profile
    }

    fn walk_ctx(&self) -> WalkContext<'_> {
        WalkContext {
            mem: &*self.mem,
            tlb: &self.tlb,
        }
    }

    /// Run the TLB spider for `process` at most once.
    fn tlb_spider_once(&self, process: &Process) {
        if !process.tlb_spider_done.swap(true, Ordering::AcqRel) {
            self.model
                .tlb_spider(&self.walk_ctx(), process.pa_dtb, process.user_only);
        }
    }

    /// Translate a virtual address in `process`.
    ///
    /// # Errors
    /// [`TranslateError`] as produced by the memory model.
    pub fn virt_to_phys(
        &self,
        process: &Process,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, TranslateError> {
        self.model
            .virt_to_phys(&self.walk_ctx(), process.pa_dtb, process.user_only, va)
    }

    /// Diagnostic translation record for `va` in `process`.
    #[must_use]
    pub fn virt_to_phys_info(&self, process: &Process, va: VirtualAddress) -> Virt2PhysInfo {
        self.model
            .virt_to_phys_info(&self.walk_ctx(), process.pa_dtb, process.user_only, va)
    }

    /// Scan `process` for virtual addresses mapping `pa`.
    #[must_use]
    pub fn phys_to_virt_info(&self, process: &Process, pa: PhysicalAddress) -> Phys2VirtInfo {
        self.tlb_spider_once(process);
        self.model
            .phys_to_virt_info(&self.walk_ctx(), process.pa_dtb, process.user_only, pa)
    }

    /// Lazily build and publish the PTE map of `process`.
    ///
    /// # Errors
    /// [`EngineError::DtbUnusable`] when the DTB resolves no page table;
    /// an empty map is published so the failure is reported once.
    pub fn ensure_pte_map(&self, process: &Process) -> Result<Arc<PteMap>, EngineError> {
        if let Some(m) = process.pte_map.read().expect("pte map lock").clone() {
            return Ok(m);
        }
        let _g = process.update_lock.lock().expect("update lock");
        if let Some(m) = process.pte_map.read().expect("pte map lock").clone() {
            return Ok(m);
        }
        self.tlb_spider_once(process);
        let root_readable = self
            .tlb
            .page_table(&*self.mem, process.pa_dtb, false)
            .is_some();
        let map = Arc::new(
            self.model
                .pte_map(&self.walk_ctx(), process.pa_dtb, process.user_only),
        );
        log::debug!(
            "pid {}: pte map published ({} runs)",
            process.pid,
            map.entries().len()
        );
        *process.pte_map.write().expect("pte map lock") = Some(Arc::clone(&map));
        if !root_readable {
            return Err(EngineError::DtbUnusable);
        }
        Ok(map)
    }

    /// Lazily build and publish the VAD map of `process`; with
    /// `extended`, also run the enrichment pass (names, heap/TEB/stack
    /// tags) and republish the enriched map.
    ///
    /// # Errors
    /// [`VadError`] variants via [`EngineError`]; an empty map is
    /// published on failure so subsequent calls do not re-spider.
    pub fn ensure_vad_map(
        &self,
        process: &Process,
        extended: bool,
    ) -> Result<Arc<VadMap>, EngineError> {
        let core = {
            let published = process.vad_map.read().expect("vad map lock").clone();
            if let Some(m) = published {
                m
            } else {
                let _g = process.update_lock.lock().expect("update lock");
                let published = process.vad_map.read().expect("vad map lock").clone();
                if let Some(m) = published {
                    m
                } else {
                    self.tlb_spider_once(process);
                    let reader = KernelSpace { engine: self };
                    let seed = process.vad_prefetch_seed();
                    let ep = EprocessView::new(&process.eprocess, &self.profile);
                    match spider_vad_map(
                        &reader,
                        &self.profile,
                        process.pid,
                        &ep,
                        &seed,
                        ReadFlags::NOVAD,
                    ) {
                        Ok((map, all)) => {
                            process.seed_vad_prefetch(all);
                            let map = Arc::new(map);
                            *process.vad_map.write().expect("vad map lock") =
                                Some(Arc::clone(&map));
                            map
                        }
                        Err(e) => {
                            log::warn!("pid {}: vad reconstruction failed: {e}", process.pid);
                            *process.vad_map.write().expect("vad map lock") =
                                Some(Arc::new(VadMap::empty()));
                            return Err(e.into());
                        }
                    }
                }
            }
        };
        if !extended || core.has_text() {
            return Ok(core);
        }
        let _t = process.text_lock.lock().expect("text lock");
        // someone may have published the enriched map while we waited
        if let Some(m) = process.vad_map.read().expect("vad map lock").clone() {
            if m.has_text() {
                return Ok(m);
            }
        }
        let heap = self.heap_provider.as_ref().and_then(|p| p.heap_map(process.pid));
        let threads = self
            .thread_provider
            .as_ref()
            .and_then(|p| p.thread_map(process.pid));
        let reader = KernelSpace { engine: self };
        let enriched = Arc::new(enrich_vad_map(
            &reader,
            &self.profile,
            &core,
            heap.as_ref(),
            threads.as_ref(),
            ReadFlags::NOVAD,
        ));
        *process.vad_map.write().expect("vad map lock") = Some(Arc::clone(&enriched));
        Ok(enriched)
    }

    /// Prototype PTE covering `va`, and whether `va` lies inside a VAD
    /// at all. Returns zero when no prototype exists or resolves.
    #[must_use]
    pub fn prototype_pte(&self, process: &Process, va: VirtualAddress) -> (u64, bool) {
        let Ok(map) = self.ensure_vad_map(process, false) else {
            return (0, false);
        };
        let Some(entry) = map.entry_containing(va.as_u64()) else {
            return (0, false);
        };
        let reader = KernelSpace { engine: self };
        let Some(bytes) = self
            .proto
            .get(&reader, &self.profile, &map, entry, ReadFlags::NOVAD)
        else {
            return (0, true);
        };
        (
            proto_pte_at(&bytes, entry, va.as_u64(), self.profile.arch.pte_size()),
            true,
        )
    }
}

/// The engine's kernel-space reader: translates through the kernel DTB,
/// then reads physical memory through the data cache. This is the
/// [`KernelRead`] seam the VAD machinery is written against.
struct KernelSpace<'e> {
    engine: &'e VmmEngine,
}

impl KernelSpace<'_> {
    fn translate(&self, va: u64) -> Option<PhysicalAddress> {
        self.engine
            .model
            .virt_to_phys(
                &self.engine.walk_ctx(),
                self.engine.kernel_dtb,
                false,
                VirtualAddress::new(va),
            )
            .ok()
    }
}

impl KernelRead for KernelSpace<'_> {
    fn read(&self, va: u64, buf: &mut [u8], flags: ReadFlags) -> Result<(), ReadError> {
        let e = self.engine;
        let mut done = 0usize;
        while done < buf.len() {
            let cur = va + done as u64;
            let in_page = (cur & (PAGE_SIZE - 1)) as usize;
            let take = usize::min(buf.len() - done, PAGE_SIZE as usize - in_page);
            let pa = self.translate(cur).ok_or(ReadError::Unmapped(cur))?;
            e.data.read(&*e.mem, pa, &mut buf[done..done + take], flags)?;
            done += take;
        }
        Ok(())
    }

    fn prefetch(&self, vas: &AddressSet, cb: usize) {
        let e = self.engine;
        let mut pages: Vec<u64> = Vec::with_capacity(vas.len());
        for va in vas.iter() {
            let first = va & !(PAGE_SIZE - 1);
            let last = (va + cb as u64 - 1) & !(PAGE_SIZE - 1);
            let mut page = first;
            while page <= last {
                if let Some(pa) = self.translate(page) {
                    pages.push(pa.as_u64());
                }
                page += PAGE_SIZE;
            }
        }
        e.data.prefetch(&*e.mem, pages.into_iter());
    }
}
