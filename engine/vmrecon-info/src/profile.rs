use crate::{BUILD_8_0, BUILD_8_1, BUILD_10_1803, BUILD_10_1903, BUILD_VISTA};

/// Target architecture the engine reconstructs.
///
/// Only the two paging layouts Windows actually ships on x86 hardware are
/// modelled: legacy 32-bit two-level paging and x64 four-level paging.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Arch {
    /// 32-bit protected-mode paging (two levels, PSE-36 large pages).
    X86,
    /// x64 long-mode paging (four levels).
    X64,
}

impl Arch {
    /// `true` for the 32-bit target.
    #[inline]
    #[must_use]
    pub const fn is32(self) -> bool {
        matches!(self, Self::X86)
    }

    /// Size in bytes of a (hardware or prototype) PTE on this target.
    #[inline]
    #[must_use]
    pub const fn pte_size(self) -> u64 {
        match self {
            Self::X86 => 4,
            Self::X64 => 8,
        }
    }

    /// Size in bytes of a guest pointer.
    #[inline]
    #[must_use]
    pub const fn ptr_size(self) -> u64 {
        match self {
            Self::X86 => 4,
            Self::X64 => 8,
        }
    }

    /// Size in bytes of a kernel pool header on this target.
    #[inline]
    #[must_use]
    pub const fn pool_header_size(self) -> u64 {
        match self {
            Self::X86 => 8,
            Self::X64 => 16,
        }
    }
}

/// `EPROCESS` field offsets the engine consumes.
///
/// These arrive from whatever symbol knowledge the host has; the engine
/// derives every *relative* offset (count slots, root probe slots) itself.
#[derive(Copy, Clone, Debug, Default)]
pub struct EprocessOffsets {
    /// Offset of `VadRoot` within `EPROCESS`.
    pub vad_root: u32,
}

/// Which VAD node layout to parse for a given target.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VadVariant {
    /// Windows XP, 32-bit.
    Xp32,
    /// Windows Vista / 7, 32-bit.
    Win7X86,
    /// Windows Vista / 7, 64-bit.
    Win7X64,
    /// Windows 8.0, 32-bit.
    Win80X86,
    /// Windows 8.0, 64-bit.
    Win80X64,
    /// Windows 8.1 / 10, 32-bit.
    Win10X86,
    /// Windows 8.1 / 10, 64-bit.
    Win10X64,
}

/// Where (and how) the expected VAD node count is read from `EPROCESS`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VadCountSource {
    /// Win8.1+: pointer-sized count next to the `RtlBalancedNode` root.
    Balanced {
        /// Offset within `EPROCESS`.
        offset: u32,
    },
    /// Vista..Win8.0: AVL table field, count in the high 24 bits.
    AvlShifted {
        /// Offset within `EPROCESS`.
        offset: u32,
    },
    /// Windows XP: plain `u32` at a fixed offset.
    XpDword {
        /// Offset within `EPROCESS`.
        offset: u32,
    },
}

/// Architecture + kernel build + host-supplied offsets for one target.
///
/// Constructed once per analysed system and shared read-only.
#[derive(Copy, Clone, Debug)]
pub struct WindowsProfile {
    /// Target architecture.
    pub arch: Arch,
    /// Kernel build number (e.g. 2600, 7601, 9600, 19041).
    pub build: u32,
    /// Host-supplied `EPROCESS` offsets.
    pub eprocess: EprocessOffsets,
}

impl WindowsProfile {
    #[must_use]
    pub const fn new(arch: Arch, build: u32, eprocess: EprocessOffsets) -> Self {
        Self {
            arch,
            build,
            eprocess,
        }
    }

    /// Shorthand for `self.arch.is32()`.
    #[inline]
    #[must_use]
    pub const fn is32(&self) -> bool {
        self.arch.is32()
    }

    /// VAD node layout for this target, `None` for combinations Windows
    /// never shipped (64-bit XP-era kernels).
    #[must_use]
    pub const fn vad_variant(&self) -> Option<VadVariant> {
        match (self.arch, self.build) {
            (Arch::X86, b) if b < BUILD_VISTA => Some(VadVariant::Xp32),
            (Arch::X86, b) if b < BUILD_8_0 => Some(VadVariant::Win7X86),
            (Arch::X86, b) if b < BUILD_8_1 => Some(VadVariant::Win80X86),
            (Arch::X86, _) => Some(VadVariant::Win10X86),
            (Arch::X64, b) if b < BUILD_VISTA => None,
            (Arch::X64, b) if b < BUILD_8_0 => Some(VadVariant::Win7X64),
            (Arch::X64, b) if b < BUILD_8_1 => Some(VadVariant::Win80X64),
            (Arch::X64, _) => Some(VadVariant::Win10X64),
        }
    }

    /// Byte-shift mask decoding the single 32-bit VAD flags word on
    /// Win8.1+ targets: `0x00VV_PPTT` with shift amounts for
    /// PrivateMemory / Protection / VadType respectively.
    #[must_use]
    pub const fn vad_flags_shift_mask(&self) -> u32 {
        if self.build >= BUILD_10_1903 {
            0x0014_0704
        } else if self.build >= BUILD_10_1803 {
            0x000E_0300
        } else {
            0x000F_0300
        }
    }

    /// Offsets of the root-pointer probe slots within `EPROCESS`.
    ///
    /// The Vista..8.0 AVL tree embeds the root pointer at one of three
    /// positions after the table header; everything else keeps a single
    /// root pointer at `VadRoot` itself.
    #[must_use]
    pub fn vad_root_probe_offsets(&self) -> impl Iterator<Item = u32> {
        let avl = self.build >= BUILD_VISTA && self.build < BUILD_8_1;
        let ptr = self.arch.ptr_size() as u32;
        let base = self.eprocess.vad_root;
        let range = if avl { 1..4 } else { 0..1 };
        range.map(move |i| base + i * ptr)
    }

    /// Where the expected node count lives for this target.
    #[must_use]
    pub const fn vad_count_source(&self) -> VadCountSource {
        let base = self.eprocess.vad_root;
        if self.build >= BUILD_8_1 {
            VadCountSource::Balanced {
                offset: base + if self.is32() { 8 } else { 0x10 },
            }
        } else if self.build >= BUILD_VISTA {
            let rel = if self.build < BUILD_8_0 {
                if self.is32() { 0x14 } else { 0x28 }
            } else if self.is32() {
                0x1C
            } else {
                0x18
            };
            VadCountSource::AvlShifted { offset: base + rel }
        } else {
            VadCountSource::XpDword { offset: 0x240 }
        }
    }

    /// Offset of `FilePointer` within `_CONTROL_AREA`.
    #[must_use]
    pub const fn control_area_file_pointer_offset(&self) -> u64 {
        if self.is32() {
            if self.build <= 7601 { 0x24 } else { 0x20 }
        } else if self.build <= BUILD_VISTA {
            0x30
        } else {
            0x40
        }
    }

    /// Offset of the `FileName` `_UNICODE_STRING` within `_FILE_OBJECT`.
    #[inline]
    #[must_use]
    pub const fn file_object_filename_offset(&self) -> u64 {
        if self.is32() { 0x30 } else { 0x58 }
    }

    /// Low bits to clear on an `EX_FAST_REF` to recover the object pointer.
    #[inline]
    #[must_use]
    pub const fn ex_fast_ref_mask(&self) -> u64 {
        if self.is32() { !0x7 } else { !0xF }
    }

    /// Pool-header bytes preceding an unaligned prototype-PTE array.
    ///
    /// Win8.0+ keeps the array directly after a small header; XP..7 place
    /// it behind a full pool block header, but only when the in-page
    /// offset leaves room for one (the caller checks).
    #[inline]
    #[must_use]
    pub const fn proto_pte_pool_header_offset(&self) -> u64 {
        if self.build >= BUILD_8_0 {
            if self.is32() { 0x04 } else { 0x0C }
        } else if self.is32() {
            0x34
        } else {
            0x5C
        }
    }

    /// `true` for the XP..7 prototype-PTE pool-header scheme, where the
    /// header is skipped entirely when the in-page offset cannot hold it.
    #[inline]
    #[must_use]
    pub const fn proto_pte_pool_header_is_legacy(&self) -> bool {
        self.build < BUILD_8_0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn profile(arch: Arch, build: u32, vad_root: u32) -> WindowsProfile {
        WindowsProfile::new(arch, build, EprocessOffsets { vad_root })
    }

    #[test]
    fn variant_dispatch() {
        assert_eq!(profile(Arch::X86, 2600, 0x11C).vad_variant(), Some(VadVariant::Xp32));
        assert_eq!(profile(Arch::X86, 7601, 0x278).vad_variant(), Some(VadVariant::Win7X86));
        assert_eq!(profile(Arch::X64, 7601, 0x448).vad_variant(), Some(VadVariant::Win7X64));
        assert_eq!(profile(Arch::X64, 9200, 0x590).vad_variant(), Some(VadVariant::Win80X64));
        assert_eq!(profile(Arch::X64, 19041, 0x7D8).vad_variant(), Some(VadVariant::Win10X64));
        assert_eq!(profile(Arch::X64, 2600, 0).vad_variant(), None);
    }

    #[test]
    fn flags_mask_by_build() {
        assert_eq!(profile(Arch::X64, 19041, 0).vad_flags_shift_mask(), 0x0014_0704);
        assert_eq!(profile(Arch::X64, 17134, 0).vad_flags_shift_mask(), 0x000E_0300);
        assert_eq!(profile(Arch::X64, 9600, 0).vad_flags_shift_mask(), 0x000F_0300);
    }

    #[test]
    fn root_probe_slots() {
        fn alloc_probe(p: WindowsProfile) -> Vec<u32> {
            p.vad_root_probe_offsets().collect()
        }
        let avl = alloc_probe(profile(Arch::X64, 7601, 0x448));
        assert_eq!(avl, vec![0x450, 0x458, 0x460]);
        let single = alloc_probe(profile(Arch::X64, 19041, 0x7D8));
        assert_eq!(single, vec![0x7D8]);
        let xp = alloc_probe(profile(Arch::X86, 2600, 0x11C));
        assert_eq!(xp, vec![0x11C]);
    }

    #[test]
    fn count_sources() {
        assert_eq!(
            profile(Arch::X64, 9600, 0x608).vad_count_source(),
            VadCountSource::Balanced { offset: 0x618 }
        );
        assert_eq!(
            profile(Arch::X86, 7601, 0x278).vad_count_source(),
            VadCountSource::AvlShifted { offset: 0x28C }
        );
        assert_eq!(
            profile(Arch::X86, 2600, 0x11C).vad_count_source(),
            VadCountSource::XpDword { offset: 0x240 }
        );
    }

    #[test]
    fn control_area_offsets() {
        assert_eq!(profile(Arch::X86, 7601, 0).control_area_file_pointer_offset(), 0x24);
        assert_eq!(profile(Arch::X86, 9600, 0).control_area_file_pointer_offset(), 0x20);
        assert_eq!(profile(Arch::X64, 6000, 0).control_area_file_pointer_offset(), 0x30);
        assert_eq!(profile(Arch::X64, 19041, 0).control_area_file_pointer_offset(), 0x40);
    }
}
