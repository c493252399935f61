use std::sync::atomic::AtomicBool;

use vmrecon_addresses::PAGE_SHIFT;

/// Windows VAD type field (3 bits).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
pub enum VadType {
    /// Plain private or mapped memory.
    #[default]
    None = 0,
    /// `\Device\PhysicalMemory` mapping.
    DevicePhysicalMemory = 1,
    /// Image section.
    ImageMap = 2,
    /// Address Windowing Extensions region.
    Awe = 3,
    /// Write-watch region.
    WriteWatch = 4,
    /// Large-page region.
    LargePages = 5,
    /// Rotate-physical region.
    RotatePhysical = 6,
    /// Large-page section.
    LargePageSection = 7,
}

impl VadType {
    /// Decode the 3-bit field.
    #[must_use]
    pub const fn from_bits(v: u8) -> Self {
        match v & 0x7 {
            1 => Self::DevicePhysicalMemory,
            2 => Self::ImageMap,
            3 => Self::Awe,
            4 => Self::WriteWatch,
            5 => Self::LargePages,
            6 => Self::RotatePhysical,
            7 => Self::LargePageSection,
            _ => Self::None,
        }
    }
}

/// One flattened VAD.
///
/// Everything here is *data* recovered from the node and its enrichment
/// chain; entries never reference each other (the guest's tree pointers
/// die in the spider).
#[derive(Clone, Debug, Default)]
pub struct VadEntry {
    /// First virtual address of the region (page aligned).
    pub va_start: u64,
    /// Last virtual address of the region (low 12 bits all set).
    pub va_end: u64,
    /// Guest VA of the node header; the entry's identity.
    pub va_node: u64,
    /// Committed pages; clamped to zero when the node claims more pages
    /// than the region holds.
    pub commit_charge: u32,
    /// `MemCommit` flag.
    pub mem_commit: bool,
    /// VAD type field.
    pub vad_type: VadType,
    /// 5-bit Windows protection code.
    pub protection: u8,
    /// Private (non-shareable) memory.
    pub private_memory: bool,
    /// Pagefile-backed section (control area without a file).
    pub page_file: bool,
    /// File-backed section.
    pub file: bool,
    /// Image section.
    pub image: bool,
    /// Region holds a heap segment.
    pub heap: bool,
    /// Region holds a user stack.
    pub stack: bool,
    /// Region holds a TEB.
    pub teb: bool,
    /// Guest VA of the `_SUBSECTION` (on XP: the control area itself).
    pub va_subsection: u64,
    /// Guest VA of the `_CONTROL_AREA`, once verified by pool tag.
    pub va_control_area: u64,
    /// Guest VA of the `_FILE_OBJECT` behind the control area.
    pub va_file_object: u64,
    /// Guest VA of the first prototype PTE.
    pub va_proto_pte: u64,
    /// Size in bytes of the prototype-PTE array.
    pub cb_proto_pte: u32,
    /// Heap number when `heap` is set.
    pub heap_id: u16,
    /// Offset of the entry's label in the map's text arena.
    pub(crate) text_off: u32,
    /// Label length in UTF-16 units, NUL not included.
    pub(crate) text_chars: u16,
}

impl VadEntry {
    /// Pages spanned by the region.
    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> u64 {
        (self.va_end + 1 - self.va_start) >> PAGE_SHIFT
    }

    /// `true` when the entry carries a label.
    #[inline]
    #[must_use]
    pub const fn has_text(&self) -> bool {
        self.text_chars != 0
    }
}

/// Flattened, sorted VAD map of one process.
///
/// All labels live in one contiguous UTF-16 arena owned by the map;
/// entries carry offsets into it. The arena dies with the map.
#[derive(Debug)]
pub struct VadMap {
    entries: Vec<VadEntry>,
    text_arena: Vec<u16>,
    has_text: bool,
    /// One-shot flag for the prototype-PTE bulk prefetch.
    pub(crate) proto_bulk_done: AtomicBool,
}

impl VadMap {
    /// An empty map (published on unrecoverable failures so callers do
    /// not re-attempt).
    #[must_use]
    pub fn empty() -> Self {
        Self::from_parts(Vec::new(), vec![0], false)
    }

    pub(crate) fn from_parts(entries: Vec<VadEntry>, text_arena: Vec<u16>, has_text: bool) -> Self {
        debug_assert!(!text_arena.is_empty() && text_arena[0] == 0);
        Self {
            entries,
            text_arena,
            has_text,
            proto_bulk_done: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[VadEntry] {
        &self.entries
    }

    /// `true` once the enrichment pass has run.
    #[must_use]
    pub const fn has_text(&self) -> bool {
        self.has_text
    }

    /// The UTF-16 label arena (slot 0 is the shared empty string).
    #[must_use]
    pub fn text_arena(&self) -> &[u16] {
        &self.text_arena
    }

    /// Binary search for the entry containing `va`.
    #[must_use]
    pub fn entry_containing(&self, va: u64) -> Option<&VadEntry> {
        let i = self.entries.partition_point(|e| e.va_start <= va);
        let e = self.entries.get(i.checked_sub(1)?)?;
        (va <= e.va_end).then_some(e)
    }

    /// The entry's label as UTF-16 units (empty slice when unlabelled).
    #[must_use]
    pub fn text(&self, entry: &VadEntry) -> &[u16] {
        let start = entry.text_off as usize;
        &self.text_arena[start..start + entry.text_chars as usize]
    }

    /// The entry's label decoded lossily to a `String`.
    #[must_use]
    pub fn text_string(&self, entry: &VadEntry) -> String {
        String::from_utf16_lossy(self.text(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(start: u64, end: u64) -> VadEntry {
        VadEntry {
            va_start: start,
            va_end: end,
            ..VadEntry::default()
        }
    }

    #[test]
    fn containing_lookup() {
        let map = VadMap::from_parts(
            vec![
                entry(0x10000, 0x1FFFF),
                entry(0x30000, 0x30FFF),
                entry(0x50000, 0x5FFFF),
            ],
            vec![0],
            false,
        );
        assert_eq!(map.entry_containing(0x10000).unwrap().va_start, 0x10000);
        assert_eq!(map.entry_containing(0x1FFFF).unwrap().va_start, 0x10000);
        assert_eq!(map.entry_containing(0x30FFF).unwrap().va_start, 0x30000);
        assert!(map.entry_containing(0x20000).is_none());
        assert!(map.entry_containing(0xFFFF).is_none());
        assert!(map.entry_containing(0x60000).is_none());
    }

    #[test]
    fn vad_type_decoding() {
        assert_eq!(VadType::from_bits(0), VadType::None);
        assert_eq!(VadType::from_bits(2), VadType::ImageMap);
        assert_eq!(VadType::from_bits(5), VadType::LargePages);
        assert_eq!(VadType::from_bits(7), VadType::LargePageSection);
    }

    #[test]
    fn empty_map_has_shared_empty_string() {
        let map = VadMap::empty();
        assert!(map.entries().is_empty());
        assert_eq!(map.text_arena(), &[0]);
        assert!(!map.has_text());
    }
}
