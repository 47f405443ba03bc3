use std::{cmp, marker::PhantomData, mem, ptr, slice};

use tracing::debug;

use crate::{
    error::{AllocError, AllocResult},
    packed::{PackedAllocator, PackedOptions, PackedStats, Segment},
};

/// Typed arrays on top of a [`PackedAllocator`].
///
/// Each allocation holds `count` values of `T` constructed in place and is
/// identified by its data offset, like the untyped allocator. Values are
/// dropped on [`PackedHeap::delete`], on [`PackedHeap::clear`] and when the
/// heap itself is dropped.
///
/// Growing the buffer moves every live value to the new buffer. A Rust move
/// is a bitwise copy and the old buffer is unmapped without running any
/// destructor, so a value is never dropped twice nor leaked by growth.
pub struct PackedHeap<T> {
    raw: PackedAllocator,
    marker: PhantomData<T>,
}

impl<T> PackedHeap<T> {
    /// Data offsets are aligned to the granularity, which tops out at 8.
    const LAYOUT_OK: () = assert!(
        mem::align_of::<T>() <= 8 && mem::size_of::<T>() != 0,
        "PackedHeap elements must be sized and aligned to at most 8 bytes"
    );

    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::LAYOUT_OK;

        Self {
            raw: PackedAllocator::lazy(PackedOptions {
                granularity: cmp::max(4, mem::align_of::<T>()),
                ..Default::default()
            }),
            marker: PhantomData,
        }
    }

    /// Allocates `count` default constructed values.
    pub fn new_elements(&mut self, count: usize) -> AllocResult<usize>
    where
        T: Default,
    {
        let bytes = count
            .checked_mul(mem::size_of::<T>())
            .ok_or(AllocError::InvalidSize(count))?;

        let offset = self.raw.alloc(bytes)?;
        let mut guard = Construction {
            raw: &mut self.raw,
            offset,
            written: 0,
            marker: PhantomData::<T>,
        };
        let data = guard.raw.data_ptr(offset).cast::<T>();

        while guard.written < count {
            unsafe { data.add(guard.written).write(T::default()) };
            guard.written += 1;
        }

        mem::forget(guard);
        Ok(offset)
    }

    /// Drops the values at `offset` and frees their block.
    ///
    /// The block is validated first; when that fails nothing is dropped.
    pub fn delete(&mut self, offset: usize) -> AllocResult<()> {
        if offset == 0 {
            return Ok(());
        }

        let (header, _) = self.raw.releasable(offset)?;
        let count = header.requested() / mem::size_of::<T>();

        unsafe {
            let data = self.raw.data_ptr(offset).cast::<T>();
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(data, count));
        }

        self.raw.free(offset)
    }

    /// Number of values in the allocation at `offset`.
    pub fn count(&self, offset: usize) -> AllocResult<usize> {
        self.raw
            .used_block(offset)
            .map(|header| header.requested() / mem::size_of::<T>())
    }

    pub fn get(&self, offset: usize) -> Option<&[T]> {
        let count = self.count(offset).ok()?;
        let data = self.raw.data_ptr(offset).cast::<T>();

        Some(unsafe { slice::from_raw_parts(data, count) })
    }

    pub fn get_mut(&mut self, offset: usize) -> Option<&mut [T]> {
        let count = self.count(offset).ok()?;
        let data = self.raw.data_ptr(offset).cast::<T>();

        Some(unsafe { slice::from_raw_parts_mut(data, count) })
    }

    /// Drops every live value and forgets every allocation.
    pub fn clear(&mut self) {
        self.drop_all();
        self.raw.clear();
    }

    #[inline]
    pub fn stats(&self) -> PackedStats {
        self.raw.stats()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    /// The untyped allocator underneath, for inspection.
    #[inline]
    pub fn raw(&self) -> &PackedAllocator {
        &self.raw
    }

    fn drop_all(&mut self) {
        let live: Vec<(usize, usize)> = self
            .raw
            .segments()
            .map_while(Result::ok)
            .filter_map(|segment| match segment {
                Segment::Used { offset, requested, .. } => Some((offset, requested / mem::size_of::<T>())),
                _ => None,
            })
            .collect();

        debug!(blocks = live.len(), "dropping live heap values");

        for (offset, count) in live {
            unsafe {
                let data = self.raw.data_ptr(offset).cast::<T>();
                ptr::drop_in_place(ptr::slice_from_raw_parts_mut(data, count));
            }
        }
    }
}

/// Values of a block under construction. If a constructor panics, the
/// values already written are dropped and the block is released.
struct Construction<'a, T> {
    raw: &'a mut PackedAllocator,
    offset: usize,
    written: usize,
    marker: PhantomData<T>,
}

impl<T> Drop for Construction<'_, T> {
    fn drop(&mut self) {
        unsafe {
            let data = self.raw.data_ptr(self.offset).cast::<T>();
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(data, self.written));
        }

        let _ = self.raw.free(self.offset);
    }
}

impl<T> Default for PackedHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for PackedHeap<T> {
    fn drop(&mut self) {
        self.drop_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::Cell,
        panic::{self, AssertUnwindSafe},
        rc::Rc,
        sync::atomic::{AtomicIsize, Ordering},
    };

    use super::*;
    use crate::tag::TAG_SIZE;

    #[derive(Default)]
    struct Point {
        x: f64,
        y: f64,
        tag: u32,
    }

    #[test]
    fn values_are_default_constructed() {
        let mut heap = PackedHeap::<Point>::new();

        let offset = heap.new_elements(3).unwrap();
        let points = heap.get_mut(offset).unwrap();
        assert_eq!(points.len(), 3);
        assert!(points.iter().all(|p| p.x == 0.0 && p.y == 0.0 && p.tag == 0));

        points[1].x = 1.5;
        assert_eq!(heap.get(offset).unwrap()[1].x, 1.5);
        assert_eq!(offset % mem::align_of::<Point>(), 0);
    }

    #[test]
    fn values_move_with_the_buffer() {
        let mut heap = PackedHeap::<Vec<u32>>::new();

        let first = heap.new_elements(2).unwrap();
        heap.get_mut(first).unwrap()[0].extend([1, 2, 3]);

        for _ in 0..50 {
            heap.new_elements(4).unwrap();
        }

        assert!(heap.stats().reallocations > 0);
        assert_eq!(heap.get(first).unwrap()[0], vec![1, 2, 3]);
        assert!(heap.get(first).unwrap()[1].is_empty());
    }

    #[test]
    fn zero_count_allocations() {
        let mut heap = PackedHeap::<u64>::new();

        let offset = heap.new_elements(0).unwrap();
        assert_eq!(heap.count(offset).unwrap(), 0);
        assert!(heap.get(offset).unwrap().is_empty());
        heap.delete(offset).unwrap();
    }

    static LIVE: AtomicIsize = AtomicIsize::new(0);

    struct Counted(#[allow(dead_code)] u32);

    impl Default for Counted {
        fn default() -> Self {
            LIVE.fetch_add(1, Ordering::SeqCst);
            Self(7)
        }
    }

    impl Drop for Counted {
        fn drop(&mut self) {
            LIVE.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn delete_and_drop_run_destructors() {
        let mut heap = PackedHeap::<Counted>::new();

        let a = heap.new_elements(5).unwrap();
        let b = heap.new_elements(3).unwrap();
        assert_eq!(LIVE.load(Ordering::SeqCst), 8);

        heap.delete(a).unwrap();
        assert_eq!(LIVE.load(Ordering::SeqCst), 3);
        assert!(matches!(heap.delete(a), Err(AllocError::DoubleFree(_))));
        assert_eq!(LIVE.load(Ordering::SeqCst), 3);

        let _c = heap.new_elements(2).unwrap();
        assert_eq!(heap.count(b).unwrap(), 3);

        drop(heap);
        assert_eq!(LIVE.load(Ordering::SeqCst), 0);
    }

    #[derive(Default)]
    struct Shared(Option<Rc<Cell<u32>>>);

    #[test]
    fn clear_drops_everything() {
        let counter = Rc::new(Cell::new(0));
        let mut heap = PackedHeap::<Shared>::new();

        for _ in 0..4 {
            let offset = heap.new_elements(2).unwrap();
            for value in heap.get_mut(offset).unwrap() {
                value.0 = Some(Rc::clone(&counter));
            }
        }

        assert_eq!(Rc::strong_count(&counter), 9);
        heap.clear();
        assert_eq!(Rc::strong_count(&counter), 1);
        assert_eq!(heap.raw().len(), 0);
    }

    thread_local! {
        static FRAGILE_LIVE: Cell<isize> = const { Cell::new(0) };
        static FRAGILE_BUILT: Cell<usize> = const { Cell::new(0) };
        static FRAGILE_PANIC_AT: Cell<usize> = const { Cell::new(usize::MAX) };
    }

    fn fragile_live() -> isize {
        FRAGILE_LIVE.with(Cell::get)
    }

    /// Owns a heap value and panics when it is the `FRAGILE_PANIC_AT`th one
    /// built on this thread.
    struct Fragile(#[allow(dead_code)] Box<u32>);

    impl Default for Fragile {
        fn default() -> Self {
            let built = FRAGILE_BUILT.with(|built| {
                built.set(built.get() + 1);
                built.get()
            });
            if built == FRAGILE_PANIC_AT.with(Cell::get) {
                panic!("constructor {built} fails");
            }

            FRAGILE_LIVE.with(|live| live.set(live.get() + 1));
            Self(Box::new(built as u32))
        }
    }

    impl Drop for Fragile {
        fn drop(&mut self) {
            FRAGILE_LIVE.with(|live| live.set(live.get() - 1));
        }
    }

    #[test]
    fn panicking_constructor_releases_the_block() {
        let mut heap = PackedHeap::<Fragile>::new();

        let first = heap.new_elements(2).unwrap();
        heap.delete(first).unwrap();
        assert_eq!(fragile_live(), 0);

        FRAGILE_PANIC_AT.with(|at| at.set(FRAGILE_BUILT.with(Cell::get) + 2));
        let result = panic::catch_unwind(AssertUnwindSafe(|| heap.new_elements(2)));
        FRAGILE_PANIC_AT.with(|at| at.set(usize::MAX));

        assert!(result.is_err());
        assert_eq!(fragile_live(), 0);
        assert_eq!(heap.stats().frees, 2);
        heap.raw().verify().unwrap();

        let kept = heap.new_elements(3).unwrap();
        assert_eq!(heap.count(kept).unwrap(), 3);
        assert_eq!(fragile_live(), 3);

        drop(heap);
        assert_eq!(fragile_live(), 0);
    }

    #[test]
    fn failed_delete_drops_nothing() {
        let mut heap = PackedHeap::<Fragile>::new();

        let a = heap.new_elements(2).unwrap();
        let _b = heap.new_elements(1).unwrap();
        assert_eq!(fragile_live(), 3);

        // Clobber the first byte after a's footer, which is b's header.
        let after = a + 2 * mem::size_of::<Fragile>() + TAG_SIZE;
        let saved = unsafe { *heap.raw.data_ptr(after) };
        unsafe { *heap.raw.data_ptr(after) = 0x77 };

        let err = heap.delete(a).unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(fragile_live(), 3);

        unsafe { *heap.raw.data_ptr(after) = saved };
        heap.delete(a).unwrap();
        assert_eq!(fragile_live(), 1);

        drop(heap);
        assert_eq!(fragile_live(), 0);
    }
}
