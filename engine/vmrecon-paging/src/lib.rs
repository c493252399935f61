//! # Paging Walkers
//!
//! Reconstruction of per-process address translation from paging structures
//! found in an untrusted physical image. Two models are provided behind the
//! [`MemoryModel`] trait:
//!
//! - [`MmX86`] — 32-bit protected-mode paging: PD → PT, 4 KiB and 4 MiB
//!   (PSE-36) pages;
//! - [`MmX64`] — long-mode paging: PML4 → PDPT → PD → PT, 4 KiB / 2 MiB /
//!   1 GiB pages.
//!
//! Every model offers the same five operations: forward translation, the
//! diagnostic per-level translation record ([`Virt2PhysInfo`]), reverse
//! search ([`Phys2VirtInfo`]), [`PteMap`] construction, and the TLB spider
//! that bulk-loads a process's page-table pages into the cache ahead of a
//! walk.
//!
//! ## Forensic reading of invalid PTEs
//!
//! Map construction is deliberately more generous than hardware: a
//! *transition* PTE (payload still naming the frame on the standby or
//! modified list) contributes its frame to the map, and an all-zero leaf is
//! recorded as a guessed read-only user page. Both are counted per run in
//! [`PteMapEntry::software_page_count`] so consumers can tell reconstructed
//! pages from hardware-valid ones. Translation proper never follows either.

#![allow(clippy::cast_possible_truncation)]

mod info;
mod model;
mod pte_map;
#[cfg(test)]
mod test_support;
mod x64;
mod x86;

pub use info::{PHYS2VIRT_MAX_RESULTS, Phys2VirtInfo, Virt2PhysInfo};
pub use model::{MemoryModel, TranslateError, WalkContext};
pub use pte_map::{MEMMAP_ENTRIES_MAX, PTE_FLAGS_MASK, PteMap, PteMapEntry};
pub use x64::MmX64;
pub use x86::MmX86;
