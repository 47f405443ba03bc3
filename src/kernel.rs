use std::{ptr::NonNull, sync::OnceLock};

/// Virtual memory page size of the computer. This is usually 4096.
/// We can't know it at compile time, so it is queried once and cached.
static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// Zero-sized handle the platform implementations hang off.
///
/// Both allocators get their backing blocks from here, never from the
/// global allocator, so arenas are always page aligned and zero filled.
pub(crate) struct Kernel;

/// Page level memory syscalls, one implementation per platform. Arenas and
/// packed buffers only ever see [`request_memory`] and [`return_memory`].
trait PlatformMemory {
    /// Maps `len` bytes of zeroed read/write memory, or `None` if the
    /// syscall fails.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Unmaps `len` bytes at `addr`, previously returned by `request_memory`.
    unsafe fn return_memory(addr: *mut u8, len: usize);

    unsafe fn page_size() -> usize;
}

#[inline]
pub(crate) fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| unsafe { Kernel::page_size() })
}

/// See [`PlatformMemory::request_memory`].
#[inline]
pub(crate) unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
    unsafe { Kernel::request_memory(len) }
}

/// See [`PlatformMemory::return_memory`].
#[inline]
pub(crate) unsafe fn return_memory(addr: *mut u8, len: usize) {
    unsafe { Kernel::return_memory(addr, len); }
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::{self, NonNull},
    };

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Private anonymous mapping, not backed by any file.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            let addr = unsafe { mmap(ptr::null_mut::<c_void>(), len as size_t, PROT, FLAGS, -1, 0 as off_t) };

            if addr == libc::MAP_FAILED {
                None
            } else {
                NonNull::new(addr.cast::<u8>())
            }
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) {
            // Failure here means the arguments were not a mapping we made.
            let _ = unsafe { munmap(addr.cast::<c_void>(), len as size_t) };
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use crate::kernel::{Kernel, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;
            let addr = unsafe { Memory::VirtualAlloc(None, len, flags, Memory::PAGE_READWRITE) };

            NonNull::new(addr.cast())
        }

        unsafe fn return_memory(addr: *mut u8, _len: usize) {
            // MEM_RELEASE frees the whole reservation and wants a zero size.
            let _ = unsafe { Memory::VirtualFree(addr.cast::<c_void>(), 0, Memory::MEM_RELEASE) };
        }

        unsafe fn page_size() -> usize {
            let mut info = MaybeUninit::uninit();

            unsafe {
                SystemInformation::GetSystemInfo(info.as_mut_ptr());
                info.assume_init().dwPageSize as usize
            }
        }
    }
}
