use std::{
    collections::{BTreeMap, BTreeSet},
    ptr, slice,
};

use tracing::{debug, trace, warn};

use crate::{
    error::{AllocError, AllocResult},
    pointer::Base,
    region::Region,
    tag::{self, MIN_FREE_BLOCK, TAG_SIZE, Tag},
    utils::align,
};

/// Construction parameters of a [`PackedAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedOptions {
    /// Bytes mapped up front. Zero maps lazily on the first allocation.
    pub capacity: usize,
    /// Every request is rounded up to a multiple of this, and every data
    /// offset is aligned to it. Either 4 or 8.
    pub granularity: usize,
    /// Merge a freed block with free neighbours. Off by default: in
    /// measurements it made fragmentation worse.
    pub merge_regions: bool,
}

impl Default for PackedOptions {
    fn default() -> Self {
        Self {
            capacity: 0,
            granularity: 4,
            merge_regions: false,
        }
    }
}

/// Lifetime counters of a [`PackedAllocator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackedStats {
    pub allocations: u64,
    pub frees: u64,
    /// Allocations that did not fit a free block and were appended.
    pub resizes: u64,
    /// Times the buffer was moved into a bigger one.
    pub reallocations: u64,
}

/// One piece of the arena, as seen by [`PackedAllocator::segments`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// A live block. `offset` is the data offset handed out by `alloc`.
    Used { offset: usize, size: usize, requested: usize },
    /// A free block. `offset` is where its header starts.
    Free { offset: usize, size: usize },
    /// In-band filler.
    Hole { offset: usize, len: usize },
}

/// Dense allocator over a flat byte buffer framed by boundary tags.
///
/// Free blocks are indexed by size, so a request takes the smallest free
/// block that is large enough in `O(log n)`. Leftovers that can't be framed
/// by two [tags](crate::tag) are filled with holes instead of being tracked.
/// When no free block fits, the block is appended and the buffer doubles
/// until it has room.
///
/// Allocations are identified by their data offset into the buffer. Offsets
/// never change, the buffer address does: decode them through
/// [`PackedAllocator::base`] or the accessors, and do not keep raw pointers
/// across an allocation.
pub struct PackedAllocator {
    buffer: Option<Region>,
    /// Bytes in use at the front of the buffer, tags and holes included.
    len: usize,
    granularity: usize,
    merge_regions: bool,
    /// Block size -> header offsets of the free blocks of that size.
    free_regions: BTreeMap<u32, BTreeSet<usize>>,
    stats: PackedStats,
    base: Base,
}

unsafe impl Send for PackedAllocator {}

impl Default for PackedAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PackedAllocator {
    /// Lazily mapped allocator with the default options.
    pub fn new() -> Self {
        Self::lazy(PackedOptions::default())
    }

    pub fn with_options(options: PackedOptions) -> AllocResult<Self> {
        if !options.granularity.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(options.granularity));
        }

        if !(4..=8).contains(&options.granularity) {
            return Err(AllocError::UnsupportedAlignment {
                alignment: options.granularity,
                max: 8,
            });
        }

        let mut allocator = Self::lazy(options);
        if options.capacity > 0 {
            allocator.reserve(options.capacity)?;
        }

        Ok(allocator)
    }

    pub(crate) fn lazy(options: PackedOptions) -> Self {
        Self {
            buffer: None,
            len: 0,
            granularity: options.granularity,
            merge_regions: options.merge_regions,
            free_regions: BTreeMap::new(),
            stats: PackedStats::default(),
            base: Base::new(0),
        }
    }

    /// Address data offsets are relative to. Moves when the buffer grows.
    #[inline]
    pub fn base(&self) -> &Base {
        &self.base
    }

    /// Bytes in use, metadata included.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, Region::len)
    }

    #[inline]
    pub fn granularity(&self) -> usize {
        self.granularity
    }

    #[inline]
    pub fn stats(&self) -> PackedStats {
        self.stats
    }

    /// Number of free blocks tracked by the index.
    pub fn free_region_count(&self) -> usize {
        self.free_regions.values().map(BTreeSet::len).sum()
    }

    #[inline]
    fn buf(&self) -> *mut u8 {
        self.buffer.as_ref().map_or(ptr::null_mut(), Region::as_ptr)
    }

    /// Raw pointer to the data at `offset`. Only valid until the next
    /// allocation.
    #[inline]
    pub(crate) fn data_ptr(&self, offset: usize) -> *mut u8 {
        self.buf().wrapping_add(offset)
    }

    /// Allocates `size` bytes and returns the offset of the data. The offset
    /// is never zero, so zero can stand for "no allocation".
    pub fn alloc(&mut self, size: usize) -> AllocResult<usize> {
        if size > u32::MAX as usize - MIN_FREE_BLOCK - self.granularity {
            return Err(AllocError::TooLarge(size));
        }

        let rounded = if size == 0 {
            self.granularity
        } else {
            align(size, self.granularity)
        };

        // Slack is below the granularity, except for zero sized requests
        // where it equals it. Both fit a byte.
        let slack = (rounded - size) as u8;
        let used = Tag::used(rounded as u32, slack);

        let offset = match self.take_free(rounded)? {
            Some((address, block_size)) => unsafe {
                let buf = self.buf();
                let data = address + TAG_SIZE;

                tag::write(buf, address, used);
                tag::write(buf, data + rounded, used);

                let delta = block_size - rounded;
                let rest = data + rounded + TAG_SIZE;

                if delta < MIN_FREE_BLOCK {
                    tag::write_hole(buf, rest, delta);
                } else {
                    self.insert_free(rest, delta - MIN_FREE_BLOCK);
                }

                data
            },
            None => {
                let hole_start = self.len;
                let hole_end = align(hole_start, self.granularity);
                let end = hole_end + MIN_FREE_BLOCK + rounded;

                // Keeps every block size, merged ones included, in 32 bits.
                if end > u32::MAX as usize {
                    return Err(AllocError::TooLarge(size));
                }

                self.reserve(end)?;
                self.stats.resizes += 1;

                let buf = self.buf();
                let data = hole_end + TAG_SIZE;

                unsafe {
                    tag::write_hole(buf, hole_start, hole_end - hole_start);
                    tag::write(buf, hole_end, used);
                    tag::write(buf, data + rounded, used);
                }

                self.len = end;
                data
            }
        };

        self.stats.allocations += 1;
        trace!(size, block = rounded, offset, "packed alloc");

        Ok(offset)
    }

    /// Releases the block at data offset `offset`. Zero is ignored.
    ///
    /// A block that is not in use, or whose tags disagree, is reported and
    /// left as it is.
    pub fn free(&mut self, offset: usize) -> AllocResult<()> {
        if offset == 0 {
            return Ok(());
        }

        let (header, mut upper) = self.releasable(offset)?;
        let buf = self.buf();
        let mut lower = offset - TAG_SIZE;

        if self.merge_regions {
            if let Some(above) = self.free_block_at(upper) {
                self.remove_free(upper, above.size);
                upper += MIN_FREE_BLOCK + above.size();
            }

            if lower >= MIN_FREE_BLOCK {
                let below = unsafe { tag::read(buf, lower - TAG_SIZE) };
                let below_start = (lower - MIN_FREE_BLOCK).checked_sub(below.size());

                let is_block = |start: &usize| {
                    below.is_free()
                        && self.is_indexed(*start, below.size)
                        && unsafe { tag::read(buf, *start) } == below
                };

                if let Some(start) = below_start.filter(is_block) {
                    self.remove_free(start, below.size);
                    lower = start;
                }
            }
        }

        self.insert_free(lower, upper - lower - MIN_FREE_BLOCK);
        self.stats.frees += 1;

        trace!(offset, size = header.size(), "packed free");

        Ok(())
    }

    /// Forgets every allocation. The buffer is kept.
    pub fn clear(&mut self) {
        self.len = 0;
        self.free_regions.clear();

        debug!(capacity = self.capacity(), "cleared packed arena");
    }

    /// Deep copy of the arena and its index into a new buffer.
    pub fn try_clone(&self) -> AllocResult<Self> {
        let mut copy = Self::lazy(PackedOptions {
            capacity: 0,
            granularity: self.granularity,
            merge_regions: self.merge_regions,
        });

        if let Some(region) = &self.buffer {
            copy.reserve(region.len())?;
            unsafe { ptr::copy_nonoverlapping(region.as_ptr(), copy.buf(), self.len) };
        }

        copy.len = self.len;
        copy.free_regions = self.free_regions.clone();
        copy.stats = self.stats;

        Ok(copy)
    }

    /// The bytes the caller asked for at `offset`, or `None` if no live
    /// block starts there.
    pub fn get(&self, offset: usize) -> Option<&[u8]> {
        let header = self.used_block(offset).ok()?;
        Some(unsafe { slice::from_raw_parts(self.data_ptr(offset), header.requested()) })
    }

    pub fn get_mut(&mut self, offset: usize) -> Option<&mut [u8]> {
        let header = self.used_block(offset).ok()?;
        Some(unsafe { slice::from_raw_parts_mut(self.data_ptr(offset), header.requested()) })
    }

    /// Size originally requested for the live block at `offset`.
    pub fn requested_len(&self, offset: usize) -> AllocResult<usize> {
        self.used_block(offset).map(|header| header.requested())
    }

    /// Walks the arena front to back.
    pub fn segments(&self) -> Segments<'_> {
        Segments {
            allocator: self,
            position: 0,
            failed: false,
        }
    }

    /// Checks every tag pair and that the index holds exactly the free
    /// blocks.
    pub fn verify(&self) -> AllocResult<()> {
        let mut free_blocks = 0;

        for segment in self.segments() {
            if let Segment::Free { offset, size } = segment? {
                free_blocks += 1;

                if !self.is_indexed(offset, size as u32) {
                    return Err(AllocError::Corruption {
                        offset,
                        reason: "free block missing from the index",
                    });
                }
            }
        }

        if free_blocks != self.free_region_count() {
            return Err(AllocError::Corruption {
                offset: 0,
                reason: "index tracks blocks that are not free",
            });
        }

        Ok(())
    }

    /// Validates the block at data offset `offset` and returns its header.
    pub(crate) fn used_block(&self, offset: usize) -> AllocResult<Tag> {
        if offset < TAG_SIZE || offset + TAG_SIZE > self.len {
            return Err(AllocError::InvalidPointer(offset));
        }

        let buf = self.buf();
        let header = unsafe { tag::read(buf, offset - TAG_SIZE) };

        if !header.is_used() {
            warn!(offset, state = header.state, "packed free of a block that is not in use");

            return Err(if header.is_free() {
                AllocError::DoubleFree(offset)
            } else {
                AllocError::Corruption { offset, reason: "header is not a used tag" }
            });
        }

        let footer_at = offset + header.size();
        if footer_at + TAG_SIZE > self.len || unsafe { tag::read(buf, footer_at) } != header {
            warn!(offset, ?header, "packed block footer does not match its header");

            return Err(AllocError::Corruption {
                offset,
                reason: "footer does not match header",
            });
        }

        Ok(header)
    }

    /// Runs every check [`PackedAllocator::free`] can fail on without
    /// touching the arena. Returns the block header and the end of the
    /// block, holes right after it included since they belong to it.
    pub(crate) fn releasable(&self, offset: usize) -> AllocResult<(Tag, usize)> {
        let header = self.used_block(offset)?;
        let end = self.skip_holes(offset + header.size() + TAG_SIZE)?;

        Ok((header, end))
    }

    /// First position past the holes starting at `at`.
    fn skip_holes(&self, mut at: usize) -> AllocResult<usize> {
        let buf = self.buf();

        while at < self.len {
            let byte = unsafe { *buf.add(at) };
            if byte == tag::USED || byte == tag::FREE {
                break;
            }

            match unsafe { tag::hole_len(buf, at, self.len) } {
                Some(len) => at += len,
                None => {
                    return Err(AllocError::Corruption {
                        offset: at,
                        reason: "unknown byte after block",
                    });
                }
            }
        }

        Ok(at)
    }

    /// The indexed free block whose header is at `at`.
    fn free_block_at(&self, at: usize) -> Option<Tag> {
        if at + TAG_SIZE > self.len {
            return None;
        }

        let tag = unsafe { tag::read(self.buf(), at) };
        (tag.is_free() && self.is_indexed(at, tag.size)).then_some(tag)
    }

    fn is_indexed(&self, at: usize, size: u32) -> bool {
        self.free_regions
            .get(&size)
            .is_some_and(|offsets| offsets.contains(&at))
    }

    /// Writes free tags for a block of `size` payload bytes at `at` and
    /// indexes it.
    fn insert_free(&mut self, at: usize, size: usize) {
        let free = Tag::free(size as u32);
        let buf = self.buf();

        unsafe {
            tag::write(buf, at, free);
            tag::write(buf, at + TAG_SIZE + size, free);
        }

        self.free_regions.entry(free.size).or_default().insert(at);
    }

    fn remove_free(&mut self, at: usize, size: u32) {
        if let Some(offsets) = self.free_regions.get_mut(&size) {
            offsets.remove(&at);
            if offsets.is_empty() {
                self.free_regions.remove(&size);
            }
        }
    }

    /// Takes the smallest free block that can hold `size` bytes out of the
    /// index. Among blocks of that size, the one at the highest offset.
    fn take_free(&mut self, size: usize) -> AllocResult<Option<(usize, usize)>> {
        let Some((&block_size, offsets)) = self.free_regions.range(size as u32..).next() else {
            return Ok(None);
        };

        let Some(&address) = offsets.last() else {
            return Ok(None);
        };

        let tag = unsafe { tag::read(self.buf(), address) };
        if tag != Tag::free(block_size) {
            warn!(address, ?tag, "indexed free block has a bad tag");
            return Err(AllocError::Corruption {
                offset: address,
                reason: "indexed free block has a bad tag",
            });
        }

        self.remove_free(address, block_size);

        Ok(Some((address, block_size as usize)))
    }

    /// Makes sure the buffer can hold `needed` bytes, doubling it as many
    /// times as it takes. Offsets survive, addresses don't.
    fn reserve(&mut self, needed: usize) -> AllocResult<()> {
        let capacity = self.capacity();
        if capacity >= needed {
            return Ok(());
        }

        let mut new_capacity = if capacity == 0 { needed } else { capacity };
        while new_capacity < needed {
            new_capacity *= 2;
        }

        let region = Region::request(new_capacity)?;

        if let Some(old) = &self.buffer {
            unsafe { ptr::copy_nonoverlapping(old.as_ptr(), region.as_ptr(), self.len) };
            self.stats.reallocations += 1;
        }

        self.base.set(region.addr());
        self.base.set_span(new_capacity);
        self.buffer = Some(region);

        debug!(old_capacity = capacity, new_capacity, len = self.len, "grew packed arena");

        Ok(())
    }
}

/// Iterator returned by [`PackedAllocator::segments`]. Yields an error and
/// stops at the first inconsistent tag.
pub struct Segments<'a> {
    allocator: &'a PackedAllocator,
    position: usize,
    failed: bool,
}

impl Segments<'_> {
    fn fail(&mut self, reason: &'static str) -> Option<AllocResult<Segment>> {
        self.failed = true;
        Some(Err(AllocError::Corruption { offset: self.position, reason }))
    }
}

impl Iterator for Segments<'_> {
    type Item = AllocResult<Segment>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.allocator.len;
        let at = self.position;

        if self.failed || at >= len {
            return None;
        }

        let buf = self.allocator.buf();

        if let Some(hole) = unsafe { tag::hole_len(buf, at, len) } {
            self.position += hole;
            return Some(Ok(Segment::Hole { offset: at, len: hole }));
        }

        if at + TAG_SIZE > len {
            return self.fail("truncated tag");
        }

        let header = unsafe { tag::read(buf, at) };
        let footer_at = at + TAG_SIZE + header.size();

        if !(header.is_used() || header.is_free()) {
            return self.fail("unknown tag");
        }

        if footer_at + TAG_SIZE > len || unsafe { tag::read(buf, footer_at) } != header {
            return self.fail("footer does not match header");
        }

        self.position = footer_at + TAG_SIZE;

        let segment = if header.is_used() {
            Segment::Used {
                offset: at + TAG_SIZE,
                size: header.size(),
                requested: header.requested(),
            }
        } else {
            Segment::Free { offset: at, size: header.size() }
        };

        Some(Ok(segment))
    }
}
