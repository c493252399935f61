use vmrecon_phys::{AddressSet, ReadError, ReadFlags};

/// Unrecoverable VAD reconstruction failures.
///
/// Everything else — unreadable nodes, bad pool tags, inverted VPNs — is
/// recovered locally by dropping the node.
#[derive(Debug, thiserror::Error)]
pub enum VadError {
    /// No probe slot yielded a plausible root pointer.
    #[error("no VAD root located in EPROCESS")]
    NoRoot,
    /// The build number maps to no known node layout.
    #[error("unsupported windows build for VAD reconstruction")]
    UnsupportedVersion,
}

/// Read access to the target's *kernel* virtual address space.
///
/// Implemented by the engine over the paging walker and the page caches.
/// The contract the spider and enricher rely on:
///
/// - [`ReadFlags::FORCECACHE_READ`] must fail without any source
///   round-trip when the backing pages are not cached;
/// - [`prefetch`](Self::prefetch) is one best-effort bulk operation, the
///   only place a round-trip is paid.
pub trait KernelRead: Send + Sync {
    /// Read `buf.len()` bytes of kernel memory at `va`.
    ///
    /// # Errors
    /// [`ReadError`] on translation failure, unreadable backing pages, or
    /// a cache miss under [`ReadFlags::FORCECACHE_READ`].
    fn read(&self, va: u64, buf: &mut [u8], flags: ReadFlags) -> Result<(), ReadError>;

    /// Bulk-load the pages covering `cb` bytes at each address in `vas`
    /// into the cache.
    fn prefetch(&self, vas: &AddressSet, cb: usize);
}

/// One heap segment reported by the heap-map collaborator.
#[derive(Copy, Clone, Debug)]
pub struct HeapSegment {
    /// Guest VA of the segment.
    pub va_segment: u64,
    /// Heap number within the process.
    pub heap_id: u16,
}

/// Heap map produced by an external collaborator.
#[derive(Clone, Debug, Default)]
pub struct HeapMap {
    /// Segments, in no particular order.
    pub segments: Vec<HeapSegment>,
}

/// Per-thread user-space regions reported by the thread-map collaborator.
#[derive(Copy, Clone, Debug)]
pub struct ThreadRegions {
    /// Thread id.
    pub tid: u32,
    /// Guest VA of the thread's TEB.
    pub va_teb: u64,
    /// Guest VA of the thread's user stack limit.
    pub va_stack_limit_user: u64,
}

/// Thread map produced by an external collaborator.
#[derive(Clone, Debug, Default)]
pub struct ThreadMap {
    /// Threads, in no particular order.
    pub threads: Vec<ThreadRegions>,
}
