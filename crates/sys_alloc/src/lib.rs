//! OS-backed memory regions for collector semispaces.
//!
//! A [`Region`] is a page-aligned, zero-initialised, read/write mapping that
//! is returned to the operating system when dropped. The collector maps one
//! region per nursery semispace and uses [`Region::zero`] to hand back a
//! clean tospace after every copy pass.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Rounds `len` up to a whole number of pages.
#[must_use]
pub fn round_to_pages(len: usize) -> usize {
    let page = page_size();
    len.div_ceil(page) * page
}

/// A zero-initialised anonymous mapping.
///
/// The mapping is released when the handle is dropped.
pub struct Region {
    inner: os::RegionInner,
}

impl Region {
    /// Maps a fresh region of at least `len` bytes.
    ///
    /// The length is rounded up to the page size.
    ///
    /// # Errors
    ///
    /// Returns an error when `len` is zero or the operating system refuses
    /// the mapping.
    pub fn map(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "region length must be greater than 0",
            ));
        }
        let len = round_to_pages(len);
        // SAFETY: the mapping is anonymous and fresh, no existing memory is
        // aliased.
        let inner = unsafe { os::RegionInner::map_anon(len)? };
        Ok(Self { inner })
    }

    /// First byte of the region.
    #[must_use]
    pub fn start(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// One past the last byte of the region.
    #[must_use]
    pub fn end(&self) -> *mut u8 {
        // SAFETY: `len` bytes were mapped starting at `ptr`.
        unsafe { self.inner.ptr().add(self.inner.len()) }
    }

    /// Mapped length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Regions are never empty; kept for API symmetry with slices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Whether `addr` falls inside `[start, end)`.
    #[must_use]
    pub fn contains(&self, addr: *const u8) -> bool {
        let a = addr as usize;
        a >= self.start() as usize && a < self.end() as usize
    }

    /// Zeroes `len` bytes starting at `offset`.
    ///
    /// Whole pages inside the range are returned to the OS where the
    /// platform guarantees they read back as zero; the unaligned edges are
    /// cleared in place.
    ///
    /// # Safety
    ///
    /// `offset + len` must not exceed [`Region::len`] and no live data may
    /// remain in the range.
    pub unsafe fn zero(&self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.len());
        if len == 0 {
            return;
        }
        let page = page_size();
        let from = self.start() as usize + offset;
        let to = from + len;
        let aligned_from = from.next_multiple_of(page);
        let aligned_to = to - to % page;

        if aligned_to > aligned_from && os::discard(aligned_from as *mut u8, aligned_to - aligned_from)
        {
            // SAFETY: both edges lie inside the caller-validated range.
            unsafe {
                std::ptr::write_bytes(from as *mut u8, 0, aligned_from - from);
                std::ptr::write_bytes(aligned_to as *mut u8, 0, to - aligned_to);
            }
        } else {
            // SAFETY: caller guarantees the range is inside the mapping.
            unsafe { std::ptr::write_bytes(from as *mut u8, 0, len) };
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("start", &self.start())
            .field("len", &self.len())
            .finish()
    }
}

// SAFETY: the region is plain memory with no thread affinity.
unsafe impl Send for Region {}
// SAFETY: shared access only exposes raw pointers.
unsafe impl Sync for Region {}
