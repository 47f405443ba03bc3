use std::io;

use thiserror::Error;

/// Result type returned by every fallible allocator operation.
pub type AllocResult<T> = Result<T, AllocError>;

/// Errors reported by the allocators.
///
/// Exhaustion is the only "expected" failure. Everything from
/// [`AllocError::InvalidPointer`] down means the caller handed us something
/// we never gave out, or that the in-band bookkeeping no longer adds up; the
/// allocator reports it and leaves its state untouched.
#[derive(Error, Debug)]
pub enum AllocError {
    #[error("arena exhausted: requested {requested} bytes, {available} bytes free")]
    Exhausted { requested: usize, available: usize },

    #[error("failed to grow the backing block to {requested} bytes")]
    GrowthFailed { requested: usize },

    #[error("invalid size: {0}")]
    InvalidSize(usize),

    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),

    #[error("alignment {alignment} exceeds the supported maximum of {max}")]
    UnsupportedAlignment { alignment: usize, max: usize },

    #[error("offset 0x{0:x} does not belong to this allocator")]
    InvalidPointer(usize),

    #[error("double free at offset 0x{0:x}")]
    DoubleFree(usize),

    #[error("corruption detected at offset 0x{offset:x}: {reason}")]
    Corruption { offset: usize, reason: &'static str },

    #[error("size {0} does not fit in a boundary tag")]
    TooLarge(usize),

    #[error("{op} failed")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl AllocError {
    /// Captures `errno` (or `GetLastError`) for a failed syscall.
    pub(crate) fn last_os_error(op: &'static str) -> Self {
        Self::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// True for errors that mean the bookkeeping was handed a bad pointer or
    /// is inconsistent, as opposed to running out of memory.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::InvalidPointer(_) | Self::DoubleFree(_) | Self::Corruption { .. }
        )
    }
}
