//! Common utilities for the integration tests.

#![allow(dead_code)]

use std::{collections::BTreeMap, ptr};

use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use relalloc::{AllocResult, ElementAllocator, RelPtr};

pub const SEED: u64 = 0x5EED_A110C;

/// Size of the record the randomized workloads allocate arrays of.
pub const RECORD_SIZE: usize = 80;

pub fn rng() -> StdRng {
    StdRng::seed_from_u64(SEED)
}

/// The four phase workload: fill a window of `ops / 4` live allocations,
/// then for every further allocation free one of the previous window (in
/// shuffled order), and finally drain the last window.
pub struct Workload {
    pub sizes: Vec<usize>,
    /// `free_order[i]` is the allocation released right before allocation
    /// `i + ops / 4` is made.
    pub free_order: Vec<usize>,
}

impl Workload {
    pub fn new(ops: usize, rng: &mut StdRng) -> Self {
        let quarter = ops / 4;

        let sizes = (0..ops).map(|_| RECORD_SIZE * rng.gen_range(1..=10)).collect();

        let mut free_order: Vec<usize> = (0..ops).collect();
        for phase in free_order.chunks_mut(quarter) {
            phase.shuffle(rng);
        }

        Self { sizes, free_order }
    }

    pub fn quarter(&self) -> usize {
        self.sizes.len() / 4
    }

    /// Runs the workload, handing every step to `step`.
    pub fn run(&self, mut step: impl FnMut(Step)) {
        let ops = self.sizes.len();
        let quarter = self.quarter();

        for i in 0..ops + quarter {
            if i >= quarter {
                step(Step::Free { id: self.free_order[i - quarter] });
            }

            if i < ops {
                step(Step::Alloc { id: i, size: self.sizes[i] });
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Step {
    Alloc { id: usize, size: usize },
    Free { id: usize },
}

/// Live byte ranges, checked for overlap on insertion.
#[derive(Default)]
pub struct LiveRanges {
    ranges: BTreeMap<usize, usize>,
    bytes: usize,
    peak: usize,
}

impl LiveRanges {
    pub fn insert(&mut self, start: usize, len: usize) {
        let end = start + len;

        if let Some((&prev_start, &prev_end)) = self.ranges.range(..=start).next_back() {
            assert!(prev_end <= start, "[{start}, {end}) overlaps [{prev_start}, {prev_end})");
        }
        if let Some((&next_start, &next_end)) = self.ranges.range(start..).next() {
            assert!(end <= next_start, "[{start}, {end}) overlaps [{next_start}, {next_end})");
        }

        self.ranges.insert(start, end);
        self.bytes += len;
        self.peak = self.peak.max(self.bytes);
    }

    pub fn remove(&mut self, start: usize) {
        let end = self.ranges.remove(&start).expect("range is not live");
        self.bytes -= end - start;
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Byte pattern written into allocation `id`.
pub fn stamp(id: usize) -> [u8; 8] {
    (id as u64 ^ SEED).to_le_bytes()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Growable array of `Copy` values whose storage comes from an
/// [`ElementAllocator`]. Only the relative pointer is kept, so the vector
/// stays valid when the arena moves.
pub struct RelVec<T: Copy, A: ElementAllocator<T>> {
    data: RelPtr<T>,
    len: usize,
    capacity: usize,
    alloc: A,
}

impl<T: Copy, A: ElementAllocator<T>> RelVec<T, A> {
    pub fn new(alloc: A) -> Self {
        Self {
            data: RelPtr::null(),
            len: 0,
            capacity: 0,
            alloc,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Start of the storage, relative to the arena base.
    pub fn data(&self) -> RelPtr<T> {
        self.data
    }

    pub fn push(&mut self, value: T) -> AllocResult<()> {
        if self.len == self.capacity {
            let capacity = (self.capacity * 2).max(4);
            let data = self.alloc.allocate(capacity)?;

            // Decode both only after the allocation, which may have moved
            // the arena.
            if self.len > 0 {
                unsafe {
                    ptr::copy_nonoverlapping(self.alloc.resolve(self.data), self.alloc.resolve(data), self.len);
                }
            }

            self.alloc.deallocate(self.data, self.capacity)?;
            self.data = data;
            self.capacity = capacity;
        }

        unsafe { self.alloc.resolve(self.data + self.len).write(value) };
        self.len += 1;

        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<T> {
        (index < self.len).then(|| unsafe { self.alloc.resolve(self.data + index).read() })
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len).filter_map(|index| self.get(index))
    }
}

impl<T: Copy, A: ElementAllocator<T>> Drop for RelVec<T, A> {
    fn drop(&mut self) {
        let _ = self.alloc.deallocate(self.data, self.capacity);
    }
}
