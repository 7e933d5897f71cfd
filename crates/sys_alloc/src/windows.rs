use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

pub fn page_size() -> usize {
    // SAFETY: GetSystemInfo fills a caller-owned struct.
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        match info.dwPageSize as usize {
            0 => 4096,
            size => size,
        }
    }
}

/// `MEM_RESET` does not guarantee zeroed pages, so ranges are always cleared
/// in place.
pub const fn discard(_ptr: *mut u8, _len: usize) -> bool {
    false
}

pub struct RegionInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl RegionInner {
    /// Reserves and commits `len` bytes.
    ///
    /// # Safety
    ///
    /// `len` must be a non-zero multiple of the page size.
    pub unsafe fn map_anon(len: usize) -> io::Result<Self> {
        // SAFETY: no address hint, fresh reservation.
        let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for RegionInner {
    fn drop(&mut self) {
        // SAFETY: MEM_RELEASE requires a zero size and the base address.
        unsafe {
            VirtualFree(self.ptr, 0, MEM_RELEASE);
        }
    }
}
