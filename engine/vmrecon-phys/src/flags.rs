bitflags::bitflags! {
    /// Flags threaded through every engine read path.
    ///
    /// These do not change *what* is read, only *how hard* the engine tries
    /// and what it is allowed to touch on the way.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct ReadFlags: u64 {
        /// Satisfy the read from cache only; a miss is a hard failure with
        /// no source round-trip. This is the cooperative-cancellation /
        /// second-chance bit of the two-tier prefetch protocol.
        const FORCECACHE_READ = 1 << 0;

        /// Bypass the data cache entirely: read from the source and do not
        /// pollute the cache with the result.
        const NOCACHE = 1 << 1;

        /// Suppress recursion into VAD resolution while servicing the
        /// read. Set on every read issued *by* the VAD machinery itself.
        const NOVAD = 1 << 2;
    }
}
