use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns the system page size, cached after the first query.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            // SAFETY: sysconf has no preconditions.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            let size = usize::try_from(raw).unwrap_or(4096);
            PAGE_SIZE.store(size, Ordering::Relaxed);
            size
        }
        size => size,
    }
}

/// Returns `[ptr, ptr + len)` to the kernel.
///
/// Private anonymous pages read back as zero after `MADV_DONTNEED` on
/// Linux; elsewhere the caller falls back to clearing in place.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn discard(ptr: *mut u8, len: usize) -> bool {
    // SAFETY: the caller passes a page-aligned range inside one mapping.
    unsafe { libc::madvise(ptr.cast(), len, libc::MADV_DONTNEED) == 0 }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const fn discard(_ptr: *mut u8, _len: usize) -> bool {
    false
}

pub struct RegionInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl RegionInner {
    /// Maps `len` bytes of private anonymous memory.
    ///
    /// # Safety
    ///
    /// `len` must be a non-zero multiple of the page size.
    pub unsafe fn map_anon(len: usize) -> io::Result<Self> {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON;
        let prot = libc::PROT_READ | libc::PROT_WRITE;

        // SAFETY: anonymous mapping with no address hint.
        let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };

        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        Ok(Self { ptr, len })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for RegionInner {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap.
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}
