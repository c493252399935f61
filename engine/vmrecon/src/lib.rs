//! # vmrecon — Windows Virtual-Memory Reconstruction
//!
//! Given read access to an opaque physical-memory source (raw dump, DMA
//! channel, hypervisor snapshot) and a target process's Directory Table
//! Base, the engine reconstructs the process's address space view:
//!
//! - the **PTE map** — contiguous runs of mapped virtual pages with their
//!   hardware attributes, including transition and guessed pages;
//! - the **VAD map** — the kernel's Virtual Address Descriptor tree,
//!   flattened, sorted, and (optionally) enriched with the backing
//!   file/image name, pagefile flag, and heap/TEB/stack labels;
//! - forward, diagnostic and reverse **translation primitives**;
//! - the **prototype-PTE** lookup for shared-section pages.
//!
//! ## Usage sketch
//!
//! ```no_run
//! use std::sync::Arc;
//! use vmrecon::{
//!     Arch, EprocessOffsets, FileDumpSource, Process, ProcessParams, VmmEngine,
//!     WindowsProfile,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mem = Arc::new(FileDumpSource::open("memory.raw")?);
//! let profile = WindowsProfile::new(Arch::X64, 19041, EprocessOffsets { vad_root: 0x7D8 });
//! let engine = VmmEngine::new(mem, profile, 0x1AB000.into())?;
//!
//! let process = Process::new(ProcessParams {
//!     pid: 4711,
//!     name: "explorer.exe".into(),
//!     pa_dtb: 0x77D4000,
//!     user_only: true,
//!     eprocess: vec![/* EPROCESS image read by the host */],
//! });
//!
//! let vads = engine.ensure_vad_map(&process, true)?;
//! for entry in vads.entries() {
//!     println!("{:016X}-{:016X} {}", entry.va_start, entry.va_end, vads.text_string(entry));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The engine is best-effort by design: corrupt or unreadable kernel
//! structures cost entries, never panics, and the only hard failures are
//! an unusable DTB, a missing VAD root, and an unknown Windows build.

mod engine;
mod process;

pub use engine::{EngineError, HeapMapProvider, ThreadMapProvider, VmmEngine};
pub use process::{Process, ProcessParams};

pub use vmrecon_addresses::{PhysicalAddress, VirtualAddress};
pub use vmrecon_info::{Arch, EprocessOffsets, WindowsProfile};
pub use vmrecon_paging::{
    MemoryModel, Phys2VirtInfo, PteMap, PteMapEntry, TranslateError, Virt2PhysInfo,
};
pub use vmrecon_phys::{
    AddressSet, FileDumpSource, PhysicalMemory, ReadError, ReadFlags, ScatterRead, SliceSource,
};
pub use vmrecon_vad::{
    HeapMap, HeapSegment, ThreadMap, ThreadRegions, VadEntry, VadError, VadMap, VadType,
};
