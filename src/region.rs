use std::{ptr::NonNull, slice};

use tracing::debug;

use crate::{
    error::{AllocError, AllocResult},
    kernel::{page_size, request_memory, return_memory},
    utils::align,
};

/// An owned, contiguous, page-backed block of memory.
///
/// This is the growth primitive both allocators are built on: they ask for a
/// [`Region`] of at least `len` bytes, lay out their own bookkeeping inside
/// it, and when it runs out they request a bigger one, move the contents
/// over, and drop the old one.
///
/// ```text
/// +--------------------------------------------+ <- ptr (page aligned)
/// |        len bytes usable by the arena       |
/// +--------------------------------------------+
/// |   slack up to the next page boundary       |
/// +--------------------------------------------+ <- ptr + mapped
/// ```
///
/// [`libc::mmap`] hands out whole pages, so the mapping is rounded up to
/// [`page_size`]; only `len` bytes are exposed.
pub struct Region {
    ptr: NonNull<u8>,
    /// Bytes exposed to the arena.
    len: usize,
    /// Bytes actually mapped, needed to give the pages back.
    mapped: usize,
}

// The region is plain memory owned by exactly one allocator.
unsafe impl Send for Region {}

impl Region {
    /// Maps a new zero filled region of at least `len` bytes.
    pub fn request(len: usize) -> AllocResult<Self> {
        if len == 0 {
            return Err(AllocError::InvalidSize(len));
        }

        let mapped = align(len, page_size());

        let ptr = unsafe { request_memory(mapped) }
            .ok_or(AllocError::GrowthFailed { requested: len })?;

        debug!(len, mapped, addr = ptr.as_ptr() as usize, "mapped region");

        Ok(Self { ptr, len, mapped })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
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

    /// The exposed bytes.
    ///
    /// Only call this on regions that hold plain bytes. Regions holding typed
    /// values with padding must be accessed through raw pointers.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        debug!(len = self.len, addr = self.addr(), "unmapping region");
        unsafe { return_memory(self.ptr.as_ptr(), self.mapped) }
    }
}
