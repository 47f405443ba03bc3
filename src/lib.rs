//! Relocatable memory allocators.
//!
//! Two allocators that work over one contiguous arena each and hand out
//! pointers as offsets from a base address instead of absolute addresses.
//! That way an arena can be moved (when it grows) or mapped at a different
//! address in another process (when it lives in shared memory) and every
//! pointer stored in it still decodes correctly.
//!
//! ```text
//!          RelPtr<T> = { offset }         address = base + offset
//!
//!   Base ---+
//!           v
//!           +---------+--------------------------------------+
//!           |  ...    |                arena                 |
//!           +---------+--------------------------------------+
//!           |<------ offset ------>|
//!                                  ^
//!                                  T
//! ```
//!
//! * [`FreeListAllocator`]: general purpose allocator with an address ordered
//!   free list embedded in the arena, first-fit or best-fit placement,
//!   coalescing and optional growth. Works over memory it maps itself or
//!   over memory supplied by the caller, like a [`SharedMapping`].
//! * [`PackedAllocator`]: dense allocator framing each block with boundary
//!   tags and indexing free blocks by size. [`PackedHeap`] puts typed arrays
//!   on top of it.
//! * [`OwnedAdapter`] and [`StatefulAdapter`] implement [`ElementAllocator`],
//!   the interface containers storing [`RelPtr`]s are written against.
//!
//! None of the allocators lock. They are [`Send`] but not [`Sync`]: share one
//! between threads behind a mutex.

mod block;
mod kernel;
mod list;
mod tag;

pub mod adapter;
pub mod error;
pub mod freelist;
pub mod heap;
#[cfg(unix)]
pub mod mmap;
pub mod packed;
pub mod pointer;
pub mod region;
pub mod utils;

pub use adapter::{ElementAllocator, OwnedAdapter, RawAllocator, StatefulAdapter};
pub use error::{AllocError, AllocResult};
pub use freelist::{FreeListAllocator, FreeListOptions, PlacementPolicy};
pub use heap::PackedHeap;
#[cfg(unix)]
pub use mmap::SharedMapping;
pub use packed::{PackedAllocator, PackedOptions, PackedStats, Segment};
pub use pointer::{Base, NULL_OFFSET, RelPtr};
pub use region::Region;
pub use tag::TAG_SIZE;
