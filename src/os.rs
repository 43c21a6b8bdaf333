//! Anonymous page source. Requests and releases writable memory pages
//! from the OS in page-aligned multiples; never returns pages to the OS
//! except for the page-aligned suffix of an exhausted bump region
//! (preserved as-is — see DESIGN.md Open Question 2).

use core::ptr::null_mut;
use log::warn;

use crate::config::PAGE;

/// Request `size` bytes of fresh, writable, anonymous memory from the OS.
/// `size` must already be a multiple of `PAGE`. Returns null on failure.
pub(crate) fn map(size: usize) -> *mut u8 {
    debug_assert!(size > 0 && size % PAGE == 0);

    #[cfg(unix)]
    {
        let p = unsafe {
            libc::mmap(
                null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            warn!("mmap failed: {}, size {}", errno::errno(), size);
            return null_mut();
        }
        p as *mut u8
    }

    #[cfg(windows)]
    {
        use winapi::um::memoryapi::VirtualAlloc;
        use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};
        let p = unsafe { VirtualAlloc(null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) };
        if p.is_null() {
            use winapi::um::errhandlingapi::GetLastError;
            warn!(
                "VirtualAlloc failed: error {}, size {}",
                unsafe { GetLastError() },
                size
            );
            return null_mut();
        }
        p as *mut u8
    }
}

/// Release `size` bytes starting at `addr`, previously obtained from `map`
/// (or a page-aligned suffix of such a region). No-op if `addr` is null or
/// `size` is zero.
pub(crate) fn unmap(addr: *mut u8, size: usize) {
    if addr.is_null() || size == 0 {
        return;
    }
    debug_assert!(addr as usize % PAGE == 0 && size % PAGE == 0);

    #[cfg(unix)]
    {
        let err = unsafe { libc::munmap(addr as *mut libc::c_void, size) } == -1;
        if err {
            warn!(
                "munmap failed: {}, addr {:p}, size {}",
                errno::errno(),
                addr,
                size
            );
        }
    }

    #[cfg(windows)]
    {
        use winapi::um::memoryapi::VirtualFree;
        use winapi::um::winnt::MEM_RELEASE;
        let err = unsafe { VirtualFree(addr as _, 0, MEM_RELEASE) } == 0;
        if err {
            use winapi::um::errhandlingapi::GetLastError;
            warn!(
                "VirtualFree failed: error {}, addr {:p}, size {}",
                unsafe { GetLastError() },
                addr,
                size
            );
        }
    }
}
