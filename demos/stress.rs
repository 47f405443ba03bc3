//! Runs the four phase randomized workload over both allocators and prints
//! how much arena each needed compared with the peak of live bytes.
//!
//! `cargo run --release --example stress -- 400000`

use std::{cell::RefCell, env, time::Instant};

use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use relalloc::{AllocResult, FreeListAllocator, PackedAllocator, PackedOptions, PlacementPolicy, RelPtr};
use tracing_subscriber::EnvFilter;

const RECORD_SIZE: usize = 80;

struct Workload {
    sizes: Vec<usize>,
    free_order: Vec<usize>,
}

impl Workload {
    fn new(ops: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let sizes = (0..ops).map(|_| RECORD_SIZE * rng.gen_range(1..=10)).collect();

        let mut free_order: Vec<usize> = (0..ops).collect();
        for phase in free_order.chunks_mut((ops / 4).max(1)) {
            phase.shuffle(&mut rng);
        }

        Self { sizes, free_order }
    }

    /// Calls `alloc(id, size)` and `free(id)` in workload order and returns
    /// the peak of live bytes.
    fn run(
        &self,
        mut alloc: impl FnMut(usize, usize) -> AllocResult<()>,
        mut free: impl FnMut(usize) -> AllocResult<()>,
    ) -> AllocResult<usize> {
        let ops = self.sizes.len();
        let quarter = ops / 4;
        let (mut live, mut peak) = (0, 0);

        for i in 0..ops + quarter {
            if i >= quarter {
                let id = self.free_order[i - quarter];
                free(id)?;
                live -= self.sizes[id];
            }

            if i < ops {
                alloc(i, self.sizes[i])?;
                live += self.sizes[i];
                peak = usize::max(peak, live);
            }
        }

        Ok(peak)
    }
}

fn packed(workload: &Workload, merge_regions: bool) -> AllocResult<()> {
    let allocator = RefCell::new(PackedAllocator::with_options(PackedOptions {
        merge_regions,
        ..Default::default()
    })?);
    let offsets = RefCell::new(vec![0; workload.sizes.len()]);

    let start = Instant::now();
    let peak = workload.run(
        |id, size| {
            offsets.borrow_mut()[id] = allocator.borrow_mut().alloc(size)?;
            Ok(())
        },
        |id| allocator.borrow_mut().free(offsets.borrow()[id]),
    )?;
    let elapsed = start.elapsed();

    let allocator = allocator.into_inner();
    println!(
        "packed (merge {merge_regions}): {elapsed:?}, span {} bytes, peak live {peak} bytes, ratio {:.2}, {:?}",
        allocator.len(),
        allocator.len() as f64 / peak as f64,
        allocator.stats()
    );

    Ok(())
}

fn free_list(workload: &Workload, policy: PlacementPolicy) -> AllocResult<()> {
    let allocator = RefCell::new(FreeListAllocator::growable(4096, policy)?);
    let ptrs = RefCell::new(vec![RelPtr::<u8>::null(); workload.sizes.len()]);

    let start = Instant::now();
    let peak = workload.run(
        |id, size| {
            ptrs.borrow_mut()[id] = allocator.borrow_mut().allocate(size, 8)?;
            Ok(())
        },
        |id| allocator.borrow_mut().free(ptrs.borrow()[id]),
    )?;
    let elapsed = start.elapsed();

    let allocator = allocator.into_inner();
    println!(
        "free list ({policy:?}): {elapsed:?}, arena {} bytes, peak used {} bytes, peak live {peak} bytes",
        allocator.total_size(),
        allocator.peak(),
    );

    Ok(())
}

fn main() -> AllocResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let ops = env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(400_000);
    let workload = Workload::new(ops);

    packed(&workload, false)?;
    packed(&workload, true)?;
    free_list(&workload, PlacementPolicy::FindFirst)?;
    free_list(&workload, PlacementPolicy::FindBest)
}
