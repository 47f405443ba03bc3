//! Allocates a few blocks from each allocator and prints where they land.
//!
//! Run with `RUST_LOG=relalloc=trace` to see every allocation logged.

use relalloc::{AllocError, AllocResult, FreeListAllocator, PackedAllocator, PlacementPolicy};
use tracing_subscriber::EnvFilter;

fn free_list() -> AllocResult<()> {
    let mut allocator = FreeListAllocator::growable(256, PlacementPolicy::FindFirst)?;

    let a = allocator.allocate(8, 8)?;
    let b = allocator.allocate(24, 16)?;
    println!("u64 at offset {}, 24 bytes at offset {}", a.offset(), b.offset());

    allocator.free(a)?;
    let c = allocator.allocate(8, 8)?;
    println!("After freeing the first block, 8 bytes land at offset {}", c.offset());

    let big = allocator.allocate(1024, 8)?;
    println!(
        "1024 bytes at offset {} after growing to {} bytes; b still decodes to {:p}",
        big.offset(),
        allocator.total_size(),
        b.as_ptr(allocator.base())
    );

    println!("used {} / peak {} bytes", allocator.used(), allocator.peak());
    Ok(())
}

fn packed() -> AllocResult<()> {
    let mut packed = PackedAllocator::new();

    let hello = packed.alloc(5)?;
    packed.get_mut(hello).ok_or(AllocError::InvalidPointer(hello))?.copy_from_slice(b"hello");

    let world = packed.alloc(5)?;
    packed.get_mut(world).ok_or(AllocError::InvalidPointer(world))?.copy_from_slice(b"world");

    packed.free(hello)?;
    let again = packed.alloc(3)?;

    println!("'hello' at {hello}, 'world' at {world}, 3 bytes reuse offset {again}");
    for segment in packed.segments() {
        println!("  {:?}", segment?);
    }
    println!("{:?}", packed.stats());

    Ok(())
}

fn main() -> AllocResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    free_list()?;
    packed()
}
