//! # Windows VAD Reconstruction
//!
//! The kernel keeps one Virtual Address Descriptor per allocation in a
//! per-process binary tree. This crate spiders that tree out of an
//! untrusted physical image and flattens it into a sorted [`VadMap`],
//! then optionally *enriches* the map by chasing each descriptor's
//! subsection → control area → file object chain to a UTF-16 name, and by
//! tagging heap, TEB and stack regions from collaborator-supplied maps.
//!
//! ## Why this is not a simple tree walk
//!
//! Every pointer in a VAD node is a guest *kernel virtual* address that
//! must itself be translated before it can be read, every read may fail
//! (paged-out, smeared, truncated dump), and a read round-trip can be as
//! expensive as a DMA transaction. The spider therefore never follows a
//! pointer directly: candidate node addresses accumulate in owning
//! [`AddressSet`](vmrecon_phys::AddressSet)s, each round is one bulk
//! prefetch followed by cache-only parses, and a node gets exactly two
//! prefetch chances before it is dropped. Corrupt nodes are dropped, not
//! fatal: the pool tag, VPN ordering and kernel-pointer predicates decide.
//!
//! ## Node layout zoo
//!
//! The descriptor layout changed with nearly every Windows generation;
//! seven parsers are carried, selected once per target from the build
//! number. Each parser decodes its own layout with explicit offsets and
//! shifts: the kernel aliases these fields through unions from version
//! to version, and sharing a decoded layout across versions invites
//! exactly the kind of subtle drift this crate exists to survive.

#![allow(clippy::cast_possible_truncation)]

mod enrich;
mod map;
mod parse;
mod proto;
mod reader;
mod spider;
#[cfg(test)]
mod test_support;

pub use enrich::enrich_vad_map;
pub use map::{VadEntry, VadMap, VadType};
pub use proto::{ProtoPteCache, proto_pte_at};
pub use reader::{
    HeapMap, HeapSegment, KernelRead, ThreadMap, ThreadRegions, VadError,
};
pub use spider::{EprocessView, spider_vad_map};

/// Pool tags accepted as VAD node signatures (as read little-endian).
pub(crate) const TAG_VAD: u32 = u32::from_le_bytes(*b"Vad ");
pub(crate) const TAG_VAD_S: u32 = u32::from_le_bytes(*b"VadS");
pub(crate) const TAG_VAD_F: u32 = u32::from_le_bytes(*b"VadF");
pub(crate) const TAG_VAD_L: u32 = u32::from_le_bytes(*b"Vadl");
pub(crate) const TAG_VAD_M: u32 = u32::from_le_bytes(*b"Vadm");
/// Control area pool tags (file/pagefile vs. image backed).
pub(crate) const TAG_MM_CA: u32 = u32::from_le_bytes(*b"MmCa");
pub(crate) const TAG_MM_CI: u32 = u32::from_le_bytes(*b"MmCi");
/// Prototype-PTE array pool tag.
pub(crate) const TAG_MM_ST: u32 = u32::from_le_bytes(*b"MmSt");

/// `true` when `tag` is any accepted VAD node signature.
pub(crate) const fn is_vad_pool_tag(tag: u32) -> bool {
    matches!(tag, TAG_VAD | TAG_VAD_S | TAG_VAD_F | TAG_VAD_L | TAG_VAD_M)
}
