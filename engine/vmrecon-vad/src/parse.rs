//! # Per-Version VAD Node Parsers
//!
//! Seven layouts, one per Windows generation and width. Each parser
//! decodes its own byte image with explicit offsets and shifts; nothing is
//! shared between layouts beyond the [`RawNode`] they produce. The byte
//! image handed to a parser starts at the node's *pool-header base* (the
//! address the spider tracks), so the pool tag is part of the window.
//!
//! A parser rejects a node when the pool tag is not a VAD signature or the
//! VPN range is inverted; rejection is silent — the tree is untrusted and
//! dead candidates are normal.

use vmrecon_addresses::{kaddr32_4, kaddr32_8, kaddr64_8};
use vmrecon_info::{VadVariant, WindowsProfile};

use crate::{TAG_VAD_L, TAG_VAD_S, is_vad_pool_tag};

/// Largest node image (the 8.1/10 64-bit layout); the prefetch size used
/// for every variant.
pub(crate) const NODE_PREFETCH_SIZE: usize = 0x98;

/// A successfully decoded node, version differences erased.
#[derive(Clone, Debug, Default)]
pub(crate) struct RawNode {
    pub va_start: u64,
    pub va_end: u64,
    pub commit_charge: u32,
    pub mem_commit: bool,
    pub vad_type: u8,
    pub protection: u8,
    pub private_memory: bool,
    /// Raw child pointers, unvalidated; zero when absent.
    pub children: [u64; 2],
    pub va_subsection: u64,
    pub va_proto_pte: u64,
    pub cb_proto_pte: u32,
}

#[inline]
fn u32_at(b: &[u8], o: usize) -> u32 {
    u32::from_le_bytes(b[o..o + 4].try_into().unwrap())
}

#[inline]
fn u64_at(b: &[u8], o: usize) -> u64 {
    u64::from_le_bytes(b[o..o + 8].try_into().unwrap())
}

/// Decode the single Win8.1+ flags word through the per-build shift mask
/// (`0x00VV_PPTT`: PrivateMemory / Protection / VadType shifts).
const fn shifted_flags(u: u32, mask: u32) -> (u8, u8, bool) {
    let vad_type = (u >> (mask & 0xFF)) & 0x07;
    let protection = (u >> ((mask >> 8) & 0xFF)) & 0x1F;
    let private = (u >> ((mask >> 16) & 0xFF)) & 0x01;
    (vad_type as u8, protection as u8, private != 0)
}

/// One selected node parser, built once per target.
pub(crate) struct VadParser {
    variant: VadVariant,
    flags_mask: u32,
    pte_size: u64,
}

impl VadParser {
    pub(crate) fn for_profile(profile: &WindowsProfile) -> Option<Self> {
        Some(Self {
            variant: profile.vad_variant()?,
            flags_mask: profile.vad_flags_shift_mask(),
            pte_size: profile.arch.pte_size(),
        })
    }

    /// Byte window a node of this layout occupies.
    pub(crate) const fn node_size(&self) -> usize {
        match self.variant {
            VadVariant::Xp32 => 0x30,
            VadVariant::Win7X86 => 0x44,
            VadVariant::Win7X64 => 0x88,
            VadVariant::Win80X86 => 0x58,
            VadVariant::Win80X64 => 0x90,
            VadVariant::Win10X86 => 0x54,
            VadVariant::Win10X64 => 0x98,
        }
    }

    /// Decode `buf` (at least [`node_size`](Self::node_size) bytes).
    pub(crate) fn parse(&self, buf: &[u8]) -> Option<RawNode> {
        match self.variant {
            VadVariant::Xp32 => self.parse_xp32(buf),
            VadVariant::Win7X86 => self.parse_w7_x86(buf),
            VadVariant::Win7X64 => self.parse_w7_x64(buf),
            VadVariant::Win80X86 => self.parse_w80_x86(buf),
            VadVariant::Win80X64 => self.parse_w80_x64(buf),
            VadVariant::Win10X86 => self.parse_w10_x86(buf),
            VadVariant::Win10X64 => self.parse_w10_x64(buf),
        }
    }

    /// Size of the prototype-PTE array, inclusive of the last entry.
    fn proto_size(&self, first: u64, last: u64) -> u32 {
        last.wrapping_sub(first).wrapping_add(self.pte_size) as u32
    }

    fn parse_xp32(&self, b: &[u8]) -> Option<RawNode> {
        let tag = u32_at(b, 0x04);
        let start = u32_at(b, 0x08);
        let end = u32_at(b, 0x0C);
        if end < start || !is_vad_pool_tag(tag) {
            return None;
        }
        let u = u32_at(b, 0x1C);
        let mut n = RawNode {
            va_start: u64::from(start) << 12,
            va_end: (u64::from(end) << 12) | 0xFFF,
            commit_charge: u & 0x0007_FFFF,
            mem_commit: u >> 30 & 1 != 0,
            // XP has no VadType field; large-page nodes carry their own tag
            vad_type: if tag == TAG_VAD_L { 5 } else { 0 },
            protection: (u >> 24 & 0x1F) as u8,
            private_memory: u >> 31 != 0,
            children: [u64::from(u32_at(b, 0x14)), u64::from(u32_at(b, 0x18))],
            ..RawNode::default()
        };
        if tag == TAG_VAD_S {
            return Some(n);
        }
        // the XP layout stores the control area itself in the map's
        // subsection slot
        n.va_subsection = u64::from(u32_at(b, 0x20));
        let first = u64::from(u32_at(b, 0x24));
        if kaddr32_4(first) {
            n.va_proto_pte = first;
            n.cb_proto_pte = self.proto_size(first, u64::from(u32_at(b, 0x28)));
        }
        Some(n)
    }

    fn parse_w7_x86(&self, b: &[u8]) -> Option<RawNode> {
        let tag = u32_at(b, 0x04);
        let start = u32_at(b, 0x14);
        let end = u32_at(b, 0x18);
        if end < start || !is_vad_pool_tag(tag) {
            return None;
        }
        let u = u32_at(b, 0x1C);
        let mut n = RawNode {
            va_start: u64::from(start) << 12,
            va_end: (u64::from(end) << 12) | 0xFFF,
            commit_charge: u & 0x0007_FFFF,
            mem_commit: u >> 23 & 1 != 0,
            vad_type: (u >> 20 & 0x7) as u8,
            protection: (u >> 24 & 0x1F) as u8,
            private_memory: u >> 31 != 0,
            children: [u64::from(u32_at(b, 0x0C)), u64::from(u32_at(b, 0x10))],
            ..RawNode::default()
        };
        if tag == TAG_VAD_S {
            return Some(n);
        }
        n.va_subsection = u64::from(u32_at(b, 0x2C));
        let first = u64::from(u32_at(b, 0x30));
        if kaddr32_4(first) {
            n.va_proto_pte = first;
            n.cb_proto_pte = self.proto_size(first, u64::from(u32_at(b, 0x34)));
        }
        Some(n)
    }

    fn parse_w7_x64(&self, b: &[u8]) -> Option<RawNode> {
        let tag = u32_at(b, 0x04);
        let start = u64_at(b, 0x28);
        let end = u64_at(b, 0x30);
        if end < start || !is_vad_pool_tag(tag) {
            return None;
        }
        let u = u64_at(b, 0x38);
        let mut n = RawNode {
            va_start: start << 12,
            va_end: (end << 12) | 0xFFF,
            commit_charge: (u & 0x0007_FFFF_FFFF_FFFF) as u32,
            mem_commit: u >> 55 & 1 != 0,
            vad_type: (u >> 52 & 0x7) as u8,
            protection: (u >> 56 & 0x1F) as u8,
            private_memory: u >> 63 != 0,
            children: [u64_at(b, 0x18), u64_at(b, 0x20)],
            ..RawNode::default()
        };
        if tag == TAG_VAD_S {
            return Some(n);
        }
        n.va_subsection = u64_at(b, 0x58);
        let first = u64_at(b, 0x60);
        if kaddr64_8(first) {
            n.va_proto_pte = first;
            n.cb_proto_pte = self.proto_size(first, u64_at(b, 0x68));
        }
        Some(n)
    }

    fn parse_w80_x86(&self, b: &[u8]) -> Option<RawNode> {
        // this is the one layout whose pool tag leads the image
        let tag = u32_at(b, 0x00);
        let start = u32_at(b, 0x1C);
        let end = u32_at(b, 0x20);
        if end < start || !is_vad_pool_tag(tag) {
            return None;
        }
        let u = u32_at(b, 0x28);
        let u1 = u32_at(b, 0x2C);
        let mut n = RawNode {
            va_start: u64::from(start) << 12,
            va_end: (u64::from(end) << 12) | 0xFFF,
            commit_charge: u1 & 0x7FFF_FFFF,
            mem_commit: u1 >> 31 != 0,
            vad_type: (u & 0x7) as u8,
            protection: (u >> 3 & 0x1F) as u8,
            private_memory: u >> 15 & 1 != 0,
            children: [u64::from(u32_at(b, 0x14)), u64::from(u32_at(b, 0x18))],
            ..RawNode::default()
        };
        if tag == TAG_VAD_S {
            return Some(n);
        }
        n.va_subsection = u64::from(u32_at(b, 0x3C));
        let first = u64::from(u32_at(b, 0x40));
        if kaddr32_8(first) {
            n.va_proto_pte = first;
            n.cb_proto_pte = self.proto_size(first, u64::from(u32_at(b, 0x44)));
        }
        Some(n)
    }

    fn parse_w80_x64(&self, b: &[u8]) -> Option<RawNode> {
        let tag = u32_at(b, 0x04);
        let start = u32_at(b, 0x28);
        let end = u32_at(b, 0x2C);
        if end < start || !is_vad_pool_tag(tag) {
            return None;
        }
        let u = u32_at(b, 0x38);
        let u1 = u32_at(b, 0x3C);
        let mut n = RawNode {
            va_start: u64::from(start) << 12,
            va_end: (u64::from(end) << 12) | 0xFFF,
            commit_charge: u1 & 0x7FFF_FFFF,
            mem_commit: u1 >> 31 != 0,
            vad_type: (u & 0x7) as u8,
            protection: (u >> 3 & 0x1F) as u8,
            private_memory: u >> 15 & 1 != 0,
            children: [u64_at(b, 0x18), u64_at(b, 0x20)],
            ..RawNode::default()
        };
        if tag == TAG_VAD_S {
            return Some(n);
        }
        n.va_subsection = u64_at(b, 0x58);
        let first = u64_at(b, 0x60);
        if kaddr64_8(first) {
            n.va_proto_pte = first;
            n.cb_proto_pte = self.proto_size(first, u64_at(b, 0x68));
        }
        Some(n)
    }

    fn parse_w10_x86(&self, b: &[u8]) -> Option<RawNode> {
        let tag = u32_at(b, 0x04);
        let start = u32_at(b, 0x14);
        let end = u32_at(b, 0x18);
        if end < start || !is_vad_pool_tag(tag) {
            return None;
        }
        let (vad_type, protection, private_memory) =
            shifted_flags(u32_at(b, 0x24), self.flags_mask);
        let u1 = u32_at(b, 0x28);
        let mut n = RawNode {
            va_start: u64::from(start) << 12,
            va_end: (u64::from(end) << 12) | 0xFFF,
            commit_charge: u1 & 0x7FFF_FFFF,
            mem_commit: u1 >> 31 != 0,
            vad_type,
            protection,
            private_memory,
            children: [u64::from(u32_at(b, 0x08)), u64::from(u32_at(b, 0x0C))],
            ..RawNode::default()
        };
        if tag == TAG_VAD_S {
            return Some(n);
        }
        n.va_subsection = u64::from(u32_at(b, 0x34));
        let first = u64::from(u32_at(b, 0x38));
        if kaddr32_4(first) {
            n.va_proto_pte = first;
            n.cb_proto_pte = self.proto_size(first, u64::from(u32_at(b, 0x3C)));
        }
        Some(n)
    }

    fn parse_w10_x64(&self, b: &[u8]) -> Option<RawNode> {
        let tag = u32_at(b, 0x04);
        let start = u32_at(b, 0x28);
        let end = u32_at(b, 0x2C);
        let start_high = b[0x30];
        let end_high = b[0x31];
        if end_high < start_high || end < start || !is_vad_pool_tag(tag) {
            return None;
        }
        let (vad_type, protection, private_memory) =
            shifted_flags(u32_at(b, 0x40), self.flags_mask);
        let u1 = u32_at(b, 0x44);
        let mut n = RawNode {
            // 52-bit VPN: high byte carries VA bits 51:44
            va_start: (u64::from(start_high) << 44) | (u64::from(start) << 12),
            va_end: (u64::from(end_high) << 44) | (u64::from(end) << 12) | 0xFFF,
            commit_charge: u1 & 0x7FFF_FFFF,
            mem_commit: u1 >> 31 != 0,
            vad_type,
            protection,
            private_memory,
            children: [u64_at(b, 0x10), u64_at(b, 0x18)],
            ..RawNode::default()
        };
        if tag == TAG_VAD_S {
            return Some(n);
        }
        n.va_subsection = u64_at(b, 0x58);
        let first = u64_at(b, 0x60);
        if kaddr64_8(first) {
            n.va_proto_pte = first;
            n.cb_proto_pte = self.proto_size(first, u64_at(b, 0x68));
        }
        Some(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmrecon_info::{Arch, EprocessOffsets};

    fn parser(arch: Arch, build: u32) -> VadParser {
        let p = WindowsProfile::new(arch, build, EprocessOffsets::default());
        VadParser::for_profile(&p).unwrap()
    }

    fn put32(b: &mut [u8], o: usize, v: u32) {
        b[o..o + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put64(b: &mut [u8], o: usize, v: u64) {
        b[o..o + 8].copy_from_slice(&v.to_le_bytes());
    }

    #[test]
    fn xp32_short_node() {
        let p = parser(Arch::X86, 2600);
        let mut b = vec![0u8; p.node_size()];
        b[0x04..0x08].copy_from_slice(b"VadS");
        put32(&mut b, 0x08, 0x20); // StartingVpn
        put32(&mut b, 0x0C, 0x2F); // EndingVpn
        let n = p.parse(&b).unwrap();
        assert_eq!(n.va_start, 0x20000);
        assert_eq!(n.va_end, 0x2FFFF);
        assert_eq!(n.vad_type, 0);
        assert!(!n.private_memory);
        assert_eq!(n.va_subsection, 0); // short node stops early
    }

    #[test]
    fn xp32_full_node_with_prototype() {
        let p = parser(Arch::X86, 2600);
        let mut b = vec![0u8; p.node_size()];
        b[0x04..0x08].copy_from_slice(b"Vad ");
        put32(&mut b, 0x08, 0x100);
        put32(&mut b, 0x0C, 0x10F);
        put32(&mut b, 0x1C, (1 << 31) | (4 << 24) | 0x10); // private, prot 4, commit 0x10
        put32(&mut b, 0x14, 0x8040_0008); // left child
        put32(&mut b, 0x20, 0x8050_0000); // control area
        put32(&mut b, 0x24, 0x8060_0000); // first proto pte
        put32(&mut b, 0x28, 0x8060_0018); // last contiguous pte
        let n = p.parse(&b).unwrap();
        assert_eq!(n.commit_charge, 0x10);
        assert_eq!(n.protection, 4);
        assert!(n.private_memory);
        assert_eq!(n.children[0], 0x8040_0008);
        assert_eq!(n.va_subsection, 0x8050_0000);
        assert_eq!(n.va_proto_pte, 0x8060_0000);
        assert_eq!(n.cb_proto_pte, 0x18 + 4); // size includes the last entry
    }

    #[test]
    fn xp32_large_page_tag_sets_type() {
        let p = parser(Arch::X86, 2600);
        let mut b = vec![0u8; p.node_size()];
        b[0x04..0x08].copy_from_slice(b"Vadl");
        put32(&mut b, 0x0C, 1);
        let n = p.parse(&b).unwrap();
        assert_eq!(n.vad_type, 5); // LargePages
    }

    #[test]
    fn bad_tag_or_inverted_vpn_rejected() {
        let p = parser(Arch::X86, 2600);
        let mut b = vec![0u8; p.node_size()];
        b[0x04..0x08].copy_from_slice(b"Xxxx");
        assert!(p.parse(&b).is_none());
        b[0x04..0x08].copy_from_slice(b"VadS");
        put32(&mut b, 0x08, 5);
        put32(&mut b, 0x0C, 4); // EndingVpn < StartingVpn
        assert!(p.parse(&b).is_none());
    }

    #[test]
    fn w10_x64_high_vpn_bytes() {
        let p = parser(Arch::X64, 19041);
        let mut b = vec![0u8; p.node_size()];
        b[0x04..0x08].copy_from_slice(b"VadS");
        put32(&mut b, 0x28, 0); // StartingVpn
        put32(&mut b, 0x2C, 0); // EndingVpn
        b[0x30] = 1; // StartingVpnHigh
        b[0x31] = 1;
        let n = p.parse(&b).unwrap();
        assert_eq!(n.va_start, 1u64 << 44);
        assert_eq!(n.va_end, (1u64 << 44) | 0xFFF);
    }

    #[test]
    fn w10_x64_flags_by_build() {
        // 19041: VadType at shift 4, Protection at 7, PrivateMemory at 20
        let p = parser(Arch::X64, 19041);
        let mut b = vec![0u8; p.node_size()];
        b[0x04..0x08].copy_from_slice(b"VadS");
        put32(&mut b, 0x40, (2 << 4) | (3 << 7) | (1 << 20));
        let n = p.parse(&b).unwrap();
        assert_eq!(n.vad_type, 2);
        assert_eq!(n.protection, 3);
        assert!(n.private_memory);

        // 9600: VadType at 0, Protection at 3, PrivateMemory at 15
        let p = parser(Arch::X64, 9600);
        let mut b = vec![0u8; p.node_size()];
        b[0x04..0x08].copy_from_slice(b"VadS");
        put32(&mut b, 0x40, 2 | (3 << 3) | (1 << 15));
        let n = p.parse(&b).unwrap();
        assert_eq!(n.vad_type, 2);
        assert_eq!(n.protection, 3);
        assert!(n.private_memory);
    }

    #[test]
    fn w80_x86_tag_leads_the_image() {
        let p = parser(Arch::X86, 9200);
        let mut b = vec![0u8; p.node_size()];
        b[0x00..0x04].copy_from_slice(b"Vad ");
        put32(&mut b, 0x1C, 0x30); // StartingVpn
        put32(&mut b, 0x20, 0x3F);
        put32(&mut b, 0x28, 2 | (5 << 3)); // VadType 2, protection 5
        put32(&mut b, 0x2C, 0x8000_0004); // MemCommit | commit 4
        let n = p.parse(&b).unwrap();
        assert_eq!(n.va_start, 0x30000);
        assert_eq!(n.vad_type, 2);
        assert_eq!(n.protection, 5);
        assert!(n.mem_commit);
        assert_eq!(n.commit_charge, 4);
    }

    #[test]
    fn w7_x64_bitfield_positions() {
        let p = parser(Arch::X64, 7601);
        let mut b = vec![0u8; p.node_size()];
        b[0x04..0x08].copy_from_slice(b"Vad ");
        put64(&mut b, 0x28, 0x500);
        put64(&mut b, 0x30, 0x5FF);
        let u: u64 = 0x20 | (2u64 << 52) | (1u64 << 55) | (6u64 << 56) | (1u64 << 63);
        put64(&mut b, 0x38, u);
        put64(&mut b, 0x58, 0xFFFF_8000_1234_0000); // subsection
        put64(&mut b, 0x60, 0xFFFF_8000_0200_0000); // first proto pte
        put64(&mut b, 0x68, 0xFFFF_8000_0200_0038);
        let n = p.parse(&b).unwrap();
        assert_eq!(n.va_start, 0x50_0000);
        assert_eq!(n.commit_charge, 0x20);
        assert_eq!(n.vad_type, 2);
        assert!(n.mem_commit);
        assert_eq!(n.protection, 6);
        assert!(n.private_memory);
        assert_eq!(n.cb_proto_pte, 0x38 + 8);
    }
}
