//! # Physical Memory Access Layer
//!
//! The engine never touches hardware: it reads an opaque physical-memory
//! source through the [`PhysicalMemory`] trait — a raw dump file, a live DMA
//! channel, a hypervisor snapshot. Reads are unreliable (holes, smearing)
//! and expensive (a DMA round-trip per request), which shapes everything
//! above this layer:
//!
//! - [`ScatterRead`] batches: a source that can satisfy many disjoint page
//!   reads in one round-trip overrides
//!   [`read_scatter`](PhysicalMemory::read_scatter); the default loops.
//! - Two page caches, both keyed by physical page base:
//!   [`TlbCache`] holds page-table pages for the walkers, [`PageCache`]
//!   holds data pages for the spider/enricher read paths.
//! - [`ReadFlags::FORCECACHE_READ`] turns a read into a cache probe that
//!   *hard-fails* on a miss instead of going to the source — the retry
//!   protocol in the VAD spider is built on exactly this.
//! - [`AddressSet`] is the owning, ordered address set that prefetch APIs
//!   take; the spider mutates its sets while draining them, so sharing a
//!   list is not an option.
//!
//! Two concrete sources ship with the crate: [`SliceSource`] over an
//! in-memory image (also the test backbone) and [`FileDumpSource`] over a
//! raw dump file.

#![allow(clippy::cast_possible_truncation)]

mod cache;
mod flags;
mod page;
mod set;
mod source;

pub use cache::{PageCache, TlbCache};
pub use flags::ReadFlags;
pub use page::CachedPage;
pub use set::AddressSet;
pub use source::{FileDumpSource, PhysicalMemory, ReadError, ScatterRead, SliceSource};
