//! Named POSIX shared memory.
//!
//! A [`SharedMapping`] maps a segment created with [`libc::shm_open`] into the
//! address space of the process. Every process (or every second mapping in
//! the same process) may get the segment at a different address:
//!
//! ```text
//!    process A                 /relalloc-demo                 process B
//! +-------------+           +------------------+          +-------------+
//! | 0x7f3a_0000 | --------> |  arena bytes     | <------- | 0x7fe1_0000 |
//! +-------------+           +------------------+          +-------------+
//! ```
//!
//! Handing the mapping to [`crate::FreeListAllocator::with_external`] with a
//! [`crate::Base`] set to the mapping address makes every [`crate::RelPtr`]
//! stored in the segment valid in all of them.

use std::{
    ffi::{CStr, CString},
    io,
    os::raw::{c_int, c_void},
    ptr::{self, NonNull},
};

use libc::{off_t, size_t};
use tracing::{debug, warn};

use crate::error::{AllocError, AllocResult};

/// A mapped shared memory segment. Unmapped on drop; the segment name is
/// removed when the mapping that created it is dropped.
pub struct SharedMapping {
    name: CString,
    ptr: NonNull<u8>,
    len: usize,
    creator: bool,
}

// The mapping is plain memory. Synchronizing access to its contents is up to
// the users of the segment.
unsafe impl Send for SharedMapping {}

impl SharedMapping {
    /// Creates a new segment of `len` bytes. Fails if `name` already exists.
    pub fn create(name: &str, len: usize) -> AllocResult<Self> {
        let name = segment_name(name)?;
        let fd = unsafe { shm_open(&name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR) };

        if fd == -1 {
            return Err(AllocError::last_os_error("shm_open"));
        }

        if unsafe { libc::ftruncate(fd, len as off_t) } == -1 {
            let err = AllocError::last_os_error("ftruncate");
            unsafe {
                libc::close(fd);
                libc::shm_unlink(name.as_ptr());
            }
            return Err(err);
        }

        Self::map(name, fd, len, true)
    }

    /// Maps an existing segment.
    pub fn open(name: &str, len: usize) -> AllocResult<Self> {
        let name = segment_name(name)?;
        let fd = unsafe { shm_open(&name, libc::O_RDWR) };

        if fd == -1 {
            return Err(AllocError::last_os_error("shm_open"));
        }

        Self::map(name, fd, len, false)
    }

    /// Opens `name`, creating it when it doesn't exist yet. The flag tells
    /// whether this call created it, i.e. whether the caller has to lay out
    /// the initial contents.
    pub fn open_or_create(name: &str, len: usize) -> AllocResult<(Self, bool)> {
        match Self::open(name, len) {
            Ok(mapping) => Ok((mapping, false)),
            Err(AllocError::Os { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Self::create(name, len).map(|mapping| (mapping, true))
            }
            Err(err) => Err(err),
        }
    }

    fn map(name: CString, fd: c_int, len: usize, creator: bool) -> AllocResult<Self> {
        const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;

        let addr = unsafe { libc::mmap(ptr::null_mut(), len as size_t, PROT, libc::MAP_SHARED, fd, 0) };
        let err = (addr == libc::MAP_FAILED).then(|| AllocError::last_os_error("mmap"));

        unsafe { libc::close(fd) };

        match (err, NonNull::new(addr.cast::<u8>())) {
            (None, Some(ptr)) => {
                debug!(name = ?name, len, creator, addr = ptr.as_ptr() as usize, "mapped shared segment");
                Ok(Self { name, ptr, len, creator })
            }
            (err, _) => {
                if creator {
                    unsafe { libc::shm_unlink(name.as_ptr()) };
                }
                Err(err.unwrap_or(AllocError::GrowthFailed { requested: len }))
            }
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True for the mapping that created the segment.
    #[inline]
    pub fn is_creator(&self) -> bool {
        self.creator
    }

    pub fn name(&self) -> &CStr {
        &self.name
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        unsafe {
            if libc::munmap(self.ptr.as_ptr().cast::<c_void>(), self.len as size_t) == -1 {
                warn!(name = ?self.name, error = %io::Error::last_os_error(), "munmap failed");
            }

            if self.creator {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

/// POSIX wants the name to start with a slash.
fn segment_name(name: &str) -> AllocResult<CString> {
    let name = if name.starts_with('/') {
        name.to_owned()
    } else {
        format!("/{name}")
    };

    CString::new(name).map_err(|err| AllocError::Os {
        op: "shm_open",
        source: io::Error::new(io::ErrorKind::InvalidInput, err),
    })
}

unsafe fn shm_open(name: &CStr, flags: c_int) -> c_int {
    let mode = libc::S_IRUSR | libc::S_IWUSR;

    // Variadic on Apple platforms.
    #[cfg(target_vendor = "apple")]
    let mode = mode as libc::c_uint;

    unsafe { libc::shm_open(name.as_ptr(), flags, mode) }
}
