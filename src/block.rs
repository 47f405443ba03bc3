use std::{mem, ptr};

use crate::pointer::RelPtr;

/// Header size of an allocated block. It sits right before the pointer
/// handed to the user.
pub(crate) const HEADER_SIZE: usize = mem::size_of::<AllocationHeader>();

/// Smallest block the free-list arena ever carves out. Every block must be
/// able to host a [`FreeNode`] once it is freed again.
pub(crate) const MIN_BLOCK_SIZE: usize = mem::size_of::<FreeNode>();

/// Metadata written at the start of every free block. Free blocks form a
/// singly-linked list sorted by address, see [`crate::list::FreeList`].
///
/// ```text
/// +---------------------+ <------+
/// |     block_size      |        |
/// +---------------------+        | -> FreeNode
/// |  next (RelPtr)      |        |
/// +---------------------+ <------+
/// |                     |
/// |    Free Payload     |
/// |      (unused)       |
/// +---------------------+
/// ```
///
/// `next` is relative to the arena's base so the list survives the arena
/// being moved or mapped at another address.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct FreeNode {
    /// Size of the whole free block, node included.
    pub block_size: usize,
    /// Next free block in address order.
    pub next: RelPtr<FreeNode>,
}

/// Metadata of an allocated block. This is the structure of a used block:
///
/// ```text
/// +---------------------+ <------+ block start
/// |   alignment slack   |        |
/// +---------------------+        |
/// |     block_size      |        | -> padding
/// +---------------------+        |
/// |      padding        |        |
/// +---------------------+ <------+ pointer returned to the user
/// |       Content       |
/// |         ...         |
/// +---------------------+ <------- block start + block_size
/// ```
///
/// `padding` covers the slack and the header itself, so
/// `user pointer - padding` is always the true block start.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AllocationHeader {
    /// Size of the whole block, padding included.
    pub block_size: usize,
    /// Bytes between block start and the user pointer.
    pub padding: usize,
}

/// Reads an in-band record at `addr`.
///
/// **SAFETY**: `addr..addr + size_of::<T>()` must lie inside a live arena.
/// Records are not guaranteed to be aligned when the arena was supplied
/// externally, so this never creates a reference.
#[inline]
pub(crate) unsafe fn read<T: Copy>(addr: usize) -> T {
    unsafe { ptr::read_unaligned(addr as *const T) }
}

/// Writes an in-band record at `addr`. Same contract as [`read`].
#[inline]
pub(crate) unsafe fn write<T: Copy>(addr: usize, value: T) {
    unsafe { ptr::write_unaligned(addr as *mut T, value) }
}
