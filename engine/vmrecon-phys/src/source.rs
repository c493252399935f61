use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use vmrecon_addresses::PhysicalAddress;

/// Failure of a physical read.
///
/// Partial reads are failures: a caller that got half a VAD node has
/// nothing it can safely parse.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The address lies beyond the end of the source.
    #[error("physical address {0} out of source range")]
    OutOfRange(PhysicalAddress),
    /// The source returned fewer bytes than requested.
    #[error("short read at {0}")]
    Partial(PhysicalAddress),
    /// The underlying transport failed.
    #[error("physical source i/o: {0}")]
    Io(#[from] std::io::Error),
    /// A cache-only read missed the cache.
    #[error("page {0} not cached (cache-only read)")]
    CacheMiss(PhysicalAddress),
    /// A virtual address on the read path did not translate.
    #[error("virtual address 0x{0:016X} not translatable")]
    Unmapped(u64),
}

/// One element of a scatter batch: a destination buffer bound to a
/// physical address, plus the per-element outcome.
pub struct ScatterRead {
    /// Source address of this element.
    pub pa: PhysicalAddress,
    /// Destination bytes, fully written on success.
    pub data: Box<[u8]>,
    /// Set by [`PhysicalMemory::read_scatter`].
    pub ok: bool,
}

impl ScatterRead {
    /// A zero-filled element of `len` bytes at `pa`.
    #[must_use]
    pub fn new(pa: PhysicalAddress, len: usize) -> Self {
        Self {
            pa,
            data: vec![0; len].into_boxed_slice(),
            ok: false,
        }
    }
}

/// An opaque physical-memory source.
///
/// Implementations must be cheap to share between threads; the engine
/// issues concurrent reads from map builders and translation clients.
///
/// Round-trips are assumed expensive. Sources backed by transports with a
/// native scatter primitive (DMA engines, hypervisor APIs) should override
/// [`read_scatter`](Self::read_scatter); everything above this trait
/// batches through it.
pub trait PhysicalMemory: Send + Sync {
    /// Read `buf.len()` bytes at `pa`. Partial reads must report `Err`.
    ///
    /// # Errors
    /// [`ReadError`] when the range is unreadable, out of bounds, or only
    /// partially available.
    fn read(&self, pa: PhysicalAddress, buf: &mut [u8]) -> Result<(), ReadError>;

    /// Highest readable physical address (inclusive).
    fn max_phys_addr(&self) -> PhysicalAddress;

    /// Best-effort batch read. Elements fail independently; `ok` records
    /// the per-element outcome. The default loops over [`read`](Self::read).
    fn read_scatter(&self, reads: &mut [ScatterRead]) {
        for r in reads {
            r.ok = self.read(r.pa, &mut r.data).is_ok();
        }
    }
}

/// Physical memory backed by an in-memory byte image.
///
/// The backbone of the test suites, and the right source for images small
/// enough to map or slurp whole.
pub struct SliceSource {
    data: Vec<u8>,
}

impl SliceSource {
    #[must_use]
    pub const fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// A zero-filled image of `len` bytes.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self { data: vec![0; len] }
    }

    /// Mutable view for image fabrication (tests, converters).
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copy `bytes` into the image at `pa`.
    ///
    /// # Panics
    /// When the destination range is out of bounds.
    pub fn write(&mut self, pa: u64, bytes: &[u8]) {
        let o = usize::try_from(pa).expect("image offset");
        self.data[o..o + bytes.len()].copy_from_slice(bytes);
    }
}

impl PhysicalMemory for SliceSource {
    fn read(&self, pa: PhysicalAddress, buf: &mut [u8]) -> Result<(), ReadError> {
        let start = usize::try_from(pa.as_u64()).map_err(|_| ReadError::OutOfRange(pa))?;
        let end = start
            .checked_add(buf.len())
            .ok_or(ReadError::OutOfRange(pa))?;
        if end > self.data.len() {
            return Err(ReadError::OutOfRange(pa));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn max_phys_addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.data.len().saturating_sub(1) as u64)
    }
}

/// Physical memory backed by a raw dump file (flat layout, offset == PA).
pub struct FileDumpSource {
    file: Mutex<File>,
    len: u64,
}

impl FileDumpSource {
    /// Open a raw dump.
    ///
    /// # Errors
    /// Propagates file-system errors.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReadError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }
}

impl PhysicalMemory for FileDumpSource {
    fn read(&self, pa: PhysicalAddress, buf: &mut [u8]) -> Result<(), ReadError> {
        if pa.as_u64() + buf.len() as u64 > self.len {
            return Err(ReadError::OutOfRange(pa));
        }
        let mut file = self.file.lock().expect("dump file lock");
        file.seek(SeekFrom::Start(pa.as_u64()))?;
        file.read_exact(buf).map_err(|_| ReadError::Partial(pa))
    }

    fn max_phys_addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.len.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_source_bounds() {
        let mut src = SliceSource::zeroed(0x2000);
        src.write(0x10, &[1, 2, 3, 4]);
        let mut buf = [0u8; 4];
        src.read(PhysicalAddress::new(0x10), &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert!(src.read(PhysicalAddress::new(0x1FFF), &mut buf).is_err());
        assert_eq!(src.max_phys_addr().as_u64(), 0x1FFF);
    }

    #[test]
    fn scatter_default_is_per_element() {
        let mut src = SliceSource::zeroed(0x1000);
        src.write(0x100, &[0xAA; 8]);
        let mut reads = vec![
            ScatterRead::new(PhysicalAddress::new(0x100), 8),
            ScatterRead::new(PhysicalAddress::new(0x2000), 8),
        ];
        src.read_scatter(&mut reads);
        assert!(reads[0].ok);
        assert_eq!(&reads[0].data[..], &[0xAA; 8]);
        assert!(!reads[1].ok);
    }
}
