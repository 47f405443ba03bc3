use std::{cmp, ptr::{self, NonNull}};

use tracing::{debug, trace, warn};

use crate::{
    block::{self, AllocationHeader, FreeNode, HEADER_SIZE, MIN_BLOCK_SIZE},
    error::{AllocError, AllocResult},
    list::{Cursor, FreeList},
    pointer::{Base, RelPtr},
    region::Region,
    utils::{align, padding_with_header},
};

/// Every block and every user pointer is aligned to at least this.
pub const MIN_ALIGNMENT: usize = 8;

/// How the allocator picks a free block for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementPolicy {
    /// First free block, in address order, that is large enough.
    #[default]
    FindFirst,
    /// The large enough free block that leaves the least space over.
    FindBest,
}

/// Construction parameters of a [`FreeListAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeListOptions {
    /// Initial arena size in bytes.
    pub size: usize,
    pub policy: PlacementPolicy,
    /// Reallocate the arena instead of failing when no block fits.
    pub growable: bool,
}

impl Default for FreeListOptions {
    fn default() -> Self {
        Self {
            size: 10_000,
            policy: PlacementPolicy::FindFirst,
            growable: false,
        }
    }
}

/// Where the arena bytes come from.
enum Backing {
    /// Mapped by us, unmapped on drop.
    Owned(Region),
    /// Supplied by the caller (e.g. a shared memory segment). Never freed.
    External(NonNull<u8>),
}

/// A free block that can hold a request, as found by the placement search.
struct Fit {
    prev: RelPtr<FreeNode>,
    node: RelPtr<FreeNode>,
    data: FreeNode,
    padding: usize,
}

/// General purpose allocator over one contiguous arena.
///
/// Free blocks are kept in an address-ordered singly-linked list embedded in
/// the blocks themselves ([`FreeList`]). Allocated blocks carry an
/// [`AllocationHeader`] right before the user pointer.
///
/// ```text
///               arena start                                     arena end
///                   |                                               |
///                   v                                               v
///  base ... offset  +--------+---------------+--------+-------------+
///                   | Free   | hdr | data    | Free   | hdr | data  |
///                   +--------+---------------+--------+-------------+
///                      |                        ^
///                      +------ next ------------+
/// ```
///
/// Every pointer, both the ones handed out and the ones inside the arena, is
/// a [`RelPtr`] relative to [`FreeListAllocator::base`]. When the arena is
/// supplied externally the caller picks the base, which is how one arena can
/// be used from several processes mapping it at different addresses.
///
/// The allocator does no locking. Callers that share it between threads must
/// serialize access themselves.
pub struct FreeListAllocator {
    base: Base,
    /// Distance from `base` to the first byte of the arena.
    base_offset: usize,
    backing: Backing,
    total_size: usize,
    used: usize,
    peak: usize,
    policy: PlacementPolicy,
    growable: bool,
    free_list: FreeList,
}

// All raw memory reachable from the allocator is owned by it (or lent to it
// for its whole lifetime), and nothing is shared with other instances.
unsafe impl Send for FreeListAllocator {}

impl FreeListAllocator {
    /// Creates a fixed size allocator over a freshly mapped arena.
    pub fn new(size: usize, policy: PlacementPolicy) -> AllocResult<Self> {
        Self::with_options(FreeListOptions { size, policy, growable: false })
    }

    /// Creates an allocator that grows its arena when a request does not fit.
    pub fn growable(size: usize, policy: PlacementPolicy) -> AllocResult<Self> {
        Self::with_options(FreeListOptions { size, policy, growable: true })
    }

    pub fn with_options(options: FreeListOptions) -> AllocResult<Self> {
        Self::check_size(options.size)?;

        let region = Region::request(options.size)?;
        let base = Base::new(region.addr());

        Ok(Self::init(base, 0, Backing::Owned(region), options))
    }

    /// Creates an allocator over memory the caller owns, typically a shared
    /// memory mapping. `base` is the address every [`RelPtr`] of this arena
    /// is relative to; it may sit below `ptr`.
    ///
    /// The memory is never freed by the allocator. If it is growable and
    /// runs out, the arena is moved into memory the allocator owns and `base`
    /// is updated so existing [`RelPtr`]s keep decoding correctly.
    ///
    /// **SAFETY**: `ptr..ptr + size` must be valid for reads and writes for
    /// the whole life of the allocator and must not be used by anything else.
    pub unsafe fn with_external(
        ptr: NonNull<u8>,
        size: usize,
        policy: PlacementPolicy,
        growable: bool,
        base: Base,
    ) -> AllocResult<Self> {
        Self::check_size(size)?;

        let base_offset = (ptr.as_ptr() as usize).wrapping_sub(base.addr());
        let options = FreeListOptions { size, policy, growable };

        Ok(Self::init(base, base_offset, Backing::External(ptr), options))
    }

    fn check_size(size: usize) -> AllocResult<()> {
        if size < HEADER_SIZE + MIN_BLOCK_SIZE {
            return Err(AllocError::InvalidSize(size));
        }

        Ok(())
    }

    fn init(base: Base, base_offset: usize, backing: Backing, options: FreeListOptions) -> Self {
        let mut allocator = Self {
            base,
            base_offset,
            backing,
            total_size: options.size,
            used: 0,
            peak: 0,
            policy: options.policy,
            growable: options.growable,
            free_list: FreeList::new(),
        };

        allocator.base.set_span(base_offset + options.size);
        allocator.reset();

        debug!(
            size = options.size,
            policy = ?options.policy,
            growable = options.growable,
            external = !allocator.owns_memory(),
            "initialized free-list arena"
        );

        allocator
    }

    /// The base every pointer of this arena is relative to. Clones observe
    /// the base moving when the arena grows.
    #[inline]
    pub fn base(&self) -> &Base {
        &self.base
    }

    #[inline]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Bytes currently taken by live blocks, padding included.
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Highest value [`FreeListAllocator::used`] reached since the last reset.
    #[inline]
    pub fn peak(&self) -> usize {
        self.peak
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.total_size - self.used
    }

    #[inline]
    pub fn policy(&self) -> PlacementPolicy {
        self.policy
    }

    #[inline]
    pub fn is_growable(&self) -> bool {
        self.growable
    }

    /// False when the arena was supplied through [`FreeListAllocator::with_external`]
    /// and has not been grown yet.
    #[inline]
    pub fn owns_memory(&self) -> bool {
        matches!(self.backing, Backing::Owned(_))
    }

    /// Number of nodes in the free list.
    pub fn free_block_count(&self) -> usize {
        unsafe { self.free_list.iter(&self.base) }.count()
    }

    /// Absolute address of the first arena byte.
    #[inline]
    fn arena_start(&self) -> usize {
        match &self.backing {
            Backing::Owned(region) => region.addr(),
            Backing::External(ptr) => ptr.as_ptr() as usize,
        }
    }

    /// The arena as a pointer relative to [`FreeListAllocator::base`].
    #[inline]
    fn arena_ptr(&self) -> RelPtr<u8> {
        RelPtr::from_offset(self.base_offset)
    }

    /// Allocates `size` bytes aligned to `alignment`.
    ///
    /// `size` is rounded up so the block can later host a free-list node and
    /// `alignment` is raised to [`MIN_ALIGNMENT`]. Fails with
    /// [`AllocError::Exhausted`] when nothing fits and the arena can't grow.
    pub fn allocate(&mut self, size: usize, alignment: usize) -> AllocResult<RelPtr<u8>> {
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(alignment));
        }

        if size > isize::MAX as usize / 2 {
            return Err(AllocError::InvalidSize(size));
        }

        let alignment = cmp::max(alignment, MIN_ALIGNMENT);
        let size = align(cmp::max(size, MIN_BLOCK_SIZE), MIN_ALIGNMENT);

        let fit = match self.find(size, alignment) {
            Some(fit) => fit,
            None if self.growable => {
                self.grow(size + alignment + HEADER_SIZE)?;
                self.find(size, alignment).ok_or(AllocError::Exhausted {
                    requested: size,
                    available: self.available(),
                })?
            }
            None => {
                return Err(AllocError::Exhausted {
                    requested: size,
                    available: self.available(),
                });
            }
        };

        let mut required = size + fit.padding;
        let rest = fit.data.block_size - required;

        unsafe {
            if rest >= MIN_BLOCK_SIZE {
                // Split: the tail of the block stays free and takes our place
                // in the list.
                let tail = fit.node.cast::<u8>().byte_add(required).cast::<FreeNode>();
                self.free_list.set(tail, FreeNode { block_size: rest, next: fit.data.next }, &self.base);

                if fit.prev.is_null() {
                    self.free_list.head = tail;
                } else {
                    let mut prev = self.free_list.get(fit.prev, &self.base);
                    prev.next = tail;
                    self.free_list.set(fit.prev, prev, &self.base);
                }
            } else {
                // Too small to host a node, hand the whole block out.
                required = fit.data.block_size;
                self.free_list.remove(fit.prev, fit.node, &self.base);
            }

            let block_start = fit.node.addr(&self.base);
            let user = block_start + fit.padding;

            block::write(
                user - HEADER_SIZE,
                AllocationHeader { block_size: required, padding: fit.padding },
            );

            self.used += required;
            self.peak = cmp::max(self.peak, self.used);

            let ptr = RelPtr::from_addr(user, &self.base);
            trace!(size, alignment, block = required, offset = ptr.offset(), "allocate");

            Ok(ptr)
        }
    }

    /// Returns a block to the free list and merges it with its neighbours.
    ///
    /// Freeing a null pointer does nothing. A pointer that was never handed
    /// out, or one that is already free, is reported and nothing changes.
    pub fn free(&mut self, ptr: RelPtr<u8>) -> AllocResult<()> {
        if ptr.is_null() {
            return Ok(());
        }

        // Reject foreign offsets before decoding them.
        let first = self.base_offset + HEADER_SIZE;
        if ptr.offset() < first || ptr.offset() >= self.base_offset + self.total_size {
            return Err(AllocError::InvalidPointer(ptr.offset()));
        }

        let user = ptr.addr(&self.base);
        let start = self.arena_start();
        let end = start + self.total_size;

        unsafe {
            if let Some(cursor) = self.free_node_containing(user) {
                warn!(offset = ptr.offset(), free_block = cursor.node.offset(), "double free");
                return Err(AllocError::DoubleFree(ptr.offset()));
            }

            let header: AllocationHeader = block::read(user - HEADER_SIZE);

            if header.padding < HEADER_SIZE
                || header.padding > user - start
                || header.block_size < header.padding + MIN_BLOCK_SIZE
                || user - header.padding + header.block_size > end
            {
                warn!(offset = ptr.offset(), ?header, "allocation header corrupted");
                return Err(AllocError::Corruption {
                    offset: ptr.offset(),
                    reason: "allocation header out of bounds",
                });
            }

            let block_start = user - header.padding;
            let node = RelPtr::<FreeNode>::from_addr(block_start, &self.base);

            // Insert sorted by address.
            let mut prev = RelPtr::null();
            for cursor in self.free_list.iter(&self.base) {
                if cursor.node > node {
                    if block_start + header.block_size > cursor.node.addr(&self.base) {
                        warn!(offset = ptr.offset(), "freed block overlaps a free block");
                        return Err(AllocError::Corruption {
                            offset: ptr.offset(),
                            reason: "block overlaps the next free block",
                        });
                    }
                    break;
                }
                prev = cursor.node;
            }

            self.free_list.set(node, FreeNode { block_size: header.block_size, next: RelPtr::null() }, &self.base);
            self.free_list.insert(prev, node, &self.base);

            self.used -= header.block_size;
            trace!(offset = ptr.offset(), block = header.block_size, "free");

            self.coalesce(prev, node);
        }

        Ok(())
    }

    /// Forgets every allocation and turns the whole arena into one free
    /// block. The bytes are not cleared.
    pub fn reset(&mut self) {
        self.used = 0;
        self.peak = 0;

        let first = self.arena_ptr().cast::<FreeNode>();

        unsafe {
            self.free_list.head = RelPtr::null();
            self.free_list.set(first, FreeNode { block_size: self.total_size, next: RelPtr::null() }, &self.base);
            self.free_list.insert(RelPtr::null(), first, &self.base);
        }

        debug!(size = self.total_size, "reset free-list arena");
    }

    /// Merges `node` with the next free block and then `prev` with `node`,
    /// when they touch.
    unsafe fn coalesce(&mut self, prev: RelPtr<FreeNode>, node: RelPtr<FreeNode>) {
        unsafe {
            let mut data = self.free_list.get(node, &self.base);

            if !data.next.is_null()
                && node.addr(&self.base) + data.block_size == data.next.addr(&self.base)
            {
                let next = self.free_list.get(data.next, &self.base);
                data.block_size += next.block_size;
                data.next = next.next;
                self.free_list.set(node, data, &self.base);
            }

            if !prev.is_null() {
                let mut prev_data = self.free_list.get(prev, &self.base);

                if prev.addr(&self.base) + prev_data.block_size == node.addr(&self.base) {
                    prev_data.block_size += data.block_size;
                    prev_data.next = data.next;
                    self.free_list.set(prev, prev_data, &self.base);
                }
            }
        }
    }

    /// The free block `addr` falls into, if any.
    unsafe fn free_node_containing(&self, addr: usize) -> Option<Cursor> {
        unsafe { self.free_list.iter(&self.base) }
            .take_while(|cursor| cursor.node.addr(&self.base) <= addr)
            .find(|cursor| addr < cursor.node.addr(&self.base) + cursor.data.block_size)
    }

    fn find(&self, size: usize, alignment: usize) -> Option<Fit> {
        match self.policy {
            PlacementPolicy::FindFirst => self.find_first(size, alignment),
            PlacementPolicy::FindBest => self.find_best(size, alignment),
        }
    }

    /// This implementation of the search uses the first-fit algorithm, it
    /// returns the first block on the list that we can use.
    fn find_first(&self, size: usize, alignment: usize) -> Option<Fit> {
        unsafe { self.free_list.iter(&self.base) }.find_map(|cursor| self.fits(cursor, size, alignment))
    }

    /// Walks the whole list and keeps the block with the smallest leftover.
    fn find_best(&self, size: usize, alignment: usize) -> Option<Fit> {
        unsafe { self.free_list.iter(&self.base) }
            .filter_map(|cursor| self.fits(cursor, size, alignment))
            .min_by_key(|fit| fit.data.block_size - (size + fit.padding))
    }

    fn fits(&self, cursor: Cursor, size: usize, alignment: usize) -> Option<Fit> {
        let padding = padding_with_header(cursor.node.addr(&self.base), alignment, HEADER_SIZE);

        (cursor.data.block_size >= size + padding).then_some(Fit {
            prev: cursor.prev,
            node: cursor.node,
            data: cursor.data,
            padding,
        })
    }

    /// Moves the arena into a new block of `2 * (total + needed)` bytes and
    /// frees the added tail.
    ///
    /// The base is moved along with the arena, so every [`RelPtr`] stays
    /// valid; raw addresses decoded before the call do not.
    fn grow(&mut self, needed: usize) -> AllocResult<()> {
        let old_size = self.total_size;
        let new_size = 2 * (old_size + needed);

        let region = Region::request(new_size)?;

        unsafe {
            ptr::copy_nonoverlapping(self.arena_start() as *const u8, region.as_ptr(), old_size);
        }

        self.base.set(region.addr().wrapping_sub(self.base_offset));
        self.base.set_span(self.base_offset + new_size);
        // An owned old arena is unmapped here, an external one is left alone.
        self.backing = Backing::Owned(region);
        self.total_size = new_size;

        debug!(old_size, new_size, base = self.base.addr(), "grew free-list arena");

        unsafe {
            let last = self
                .free_list
                .iter(&self.base)
                .last()
                .map_or(RelPtr::null(), |cursor| cursor.node);

            let tail = self.arena_ptr().byte_add(old_size).cast::<FreeNode>();
            self.free_list.set(tail, FreeNode { block_size: new_size - old_size, next: RelPtr::null() }, &self.base);
            self.free_list.insert(last, tail, &self.base);
            self.coalesce(last, tail);
        }

        Ok(())
    }
}
