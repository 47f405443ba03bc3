//! In-band metadata of the packed arena.
//!
//! Every block is framed by two identical boundary tags:
//!
//! ```text
//!   block start                                   block end
//!   |                                                     |
//!   v                                                     v
//!   +-------+-----+--------+------+---------------+-------+
//!   | state | slk | rsvd   | size |  size bytes   | footer|
//!   +-------+-----+--------+------+---------------+-------+
//!   |<--------- header ---------->|<- payload  -->|
//!   1 byte   1     2         4 LE                   = header
//! ```
//!
//! Leftovers too small to be framed by two tags are filled with holes. A one
//! byte hole is a single [`HOLE_REGION`], anything longer starts with
//! [`HOLE_START`], ends with [`HOLE_END`] and has zeros in between. The first
//! byte of a tag or a hole is always one of the sentinels below, which is what
//! lets the arena be walked front to back.

use std::ptr;

/// Bytes taken by one boundary tag.
pub const TAG_SIZE: usize = 8;

/// Leftovers shorter than this become holes instead of free blocks.
pub(crate) const MIN_FREE_BLOCK: usize = 2 * TAG_SIZE;

pub(crate) const USED: u8 = 1;
pub(crate) const FREE: u8 = 2;
pub(crate) const HOLE_START: u8 = 3;
pub(crate) const HOLE_END: u8 = 4;
pub(crate) const HOLE_REGION: u8 = 5;

/// Decoded boundary tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Tag {
    pub state: u8,
    /// Bytes the request was rounded up by. Always zero on free blocks.
    pub slack: u8,
    /// Payload bytes between header and footer.
    pub size: u32,
}

impl Tag {
    pub fn used(size: u32, slack: u8) -> Self {
        Self { state: USED, slack, size }
    }

    pub fn free(size: u32) -> Self {
        Self { state: FREE, slack: 0, size }
    }

    #[inline]
    pub fn is_used(&self) -> bool {
        self.state == USED
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.state == FREE
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Bytes the caller asked for.
    #[inline]
    pub fn requested(&self) -> usize {
        self.size().saturating_sub(self.slack as usize)
    }

    pub fn encode(&self) -> [u8; TAG_SIZE] {
        let mut bytes = [0u8; TAG_SIZE];
        bytes[0] = self.state;
        bytes[1] = self.slack;
        bytes[4..].copy_from_slice(&self.size.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8; TAG_SIZE]) -> Self {
        Self {
            state: bytes[0],
            slack: bytes[1],
            size: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// Reads the tag at `buf + at`.
///
/// **SAFETY**: `at + TAG_SIZE` bytes from `buf` must be initialized.
#[inline]
pub(crate) unsafe fn read(buf: *const u8, at: usize) -> Tag {
    let bytes = unsafe { ptr::read_unaligned(buf.add(at).cast::<[u8; TAG_SIZE]>()) };
    Tag::decode(&bytes)
}

/// Writes `tag` at `buf + at`. Same contract as [`read`], for writes.
#[inline]
pub(crate) unsafe fn write(buf: *mut u8, at: usize, tag: Tag) {
    unsafe { ptr::write_unaligned(buf.add(at).cast::<[u8; TAG_SIZE]>(), tag.encode()) }
}

/// Fills `len` bytes at `buf + at` with a hole. Zero length writes nothing.
///
/// **SAFETY**: the range must be writable.
pub(crate) unsafe fn write_hole(buf: *mut u8, at: usize, len: usize) {
    unsafe {
        match len {
            0 => {}
            1 => *buf.add(at) = HOLE_REGION,
            _ => {
                ptr::write_bytes(buf.add(at), 0, len);
                *buf.add(at) = HOLE_START;
                *buf.add(at + len - 1) = HOLE_END;
            }
        }
    }
}

/// Length of the hole starting at `at`, or `None` if there is no hole there
/// or it runs past `len`.
///
/// **SAFETY**: `buf..buf + len` must be initialized.
pub(crate) unsafe fn hole_len(buf: *const u8, at: usize, len: usize) -> Option<usize> {
    unsafe {
        match *buf.add(at) {
            HOLE_REGION => Some(1),
            HOLE_START => (at + 1..len)
                .find(|i| *buf.add(*i) == HOLE_END)
                .map(|end| end + 1 - at),
            _ => None,
        }
    }
}
