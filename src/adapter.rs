//! Glue between the allocators and containers that store [`RelPtr`]s.
//!
//! Containers are written against [`ElementAllocator<T>`]: allocate `n`
//! values of `T`, give them back, compare two allocators, and rebind to
//! another element type while keeping the same arena. Two adapters come with
//! the crate:
//!
//! * [`OwnedAdapter`] shares ownership of the allocator through an `Rc`, so
//!   the arena lives as long as the last container using it.
//! * [`StatefulAdapter`] only borrows an allocator owned by someone else.
//!   It is `Copy`, and many containers of different element types can
//!   share one arena through it.
//!
//! Both hand out pointers relative to the allocator's [`Base`]; use
//! [`ElementAllocator::resolve`] to turn them into addresses, and never keep
//! those across a call that may allocate.

use std::{cell::RefCell, fmt, marker::PhantomData, mem, ptr, rc::Rc};

use crate::{
    error::{AllocError, AllocResult},
    freelist::FreeListAllocator,
    packed::PackedAllocator,
    pointer::{Base, RelPtr},
};

/// Untyped allocation interface shared by both allocators.
pub trait RawAllocator {
    /// The base every pointer returned by this allocator is relative to.
    fn base(&self) -> &Base;

    fn allocate_bytes(&mut self, size: usize, alignment: usize) -> AllocResult<RelPtr<u8>>;

    /// `size` is the size given to [`RawAllocator::allocate_bytes`]. Freeing
    /// a null pointer does nothing.
    fn deallocate_bytes(&mut self, ptr: RelPtr<u8>, size: usize) -> AllocResult<()>;
}

impl RawAllocator for FreeListAllocator {
    fn base(&self) -> &Base {
        FreeListAllocator::base(self)
    }

    fn allocate_bytes(&mut self, size: usize, alignment: usize) -> AllocResult<RelPtr<u8>> {
        self.allocate(size, alignment)
    }

    fn deallocate_bytes(&mut self, ptr: RelPtr<u8>, _size: usize) -> AllocResult<()> {
        self.free(ptr)
    }
}

impl RawAllocator for PackedAllocator {
    fn base(&self) -> &Base {
        PackedAllocator::base(self)
    }

    fn allocate_bytes(&mut self, size: usize, alignment: usize) -> AllocResult<RelPtr<u8>> {
        if !alignment.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(alignment));
        }

        if alignment > self.granularity() {
            return Err(AllocError::UnsupportedAlignment {
                alignment,
                max: self.granularity(),
            });
        }

        self.alloc(size).map(RelPtr::from_offset)
    }

    fn deallocate_bytes(&mut self, ptr: RelPtr<u8>, _size: usize) -> AllocResult<()> {
        if ptr.is_null() {
            return Ok(());
        }

        self.free(ptr.offset())
    }
}

/// Typed allocation interface containers are written against.
pub trait ElementAllocator<T>: Clone + PartialEq {
    /// The same allocator, handing out `U`s.
    type Rebind<U>: ElementAllocator<U>;

    /// Room for `count` values of `T`, uninitialized. Zero yields null.
    fn allocate(&self, count: usize) -> AllocResult<RelPtr<T>>;

    /// Releases what [`ElementAllocator::allocate`] returned for `count`.
    /// Values are not dropped.
    fn deallocate(&self, ptr: RelPtr<T>, count: usize) -> AllocResult<()>;

    /// Current base of the underlying arena.
    fn base(&self) -> Base;

    fn rebind<U>(&self) -> Self::Rebind<U>;

    /// Decodes `ptr` under the current base.
    fn resolve(&self, ptr: RelPtr<T>) -> *mut T {
        ptr.as_ptr(&self.base())
    }
}

fn allocate_array<T, A: RawAllocator>(allocator: &RefCell<A>, count: usize) -> AllocResult<RelPtr<T>> {
    if count == 0 {
        return Ok(RelPtr::null());
    }

    let size = count
        .checked_mul(mem::size_of::<T>())
        .ok_or(AllocError::InvalidSize(count))?;

    allocator
        .borrow_mut()
        .allocate_bytes(size, mem::align_of::<T>())
        .map(RelPtr::cast)
}

fn deallocate_array<T, A: RawAllocator>(allocator: &RefCell<A>, ptr: RelPtr<T>, count: usize) -> AllocResult<()> {
    if ptr.is_null() {
        return Ok(());
    }

    allocator
        .borrow_mut()
        .deallocate_bytes(ptr.cast(), count.saturating_mul(mem::size_of::<T>()))
}

/// Adapter that co-owns its allocator.
///
/// Clones and rebinds share the allocator; two adapters are equal when they
/// share it.
pub struct OwnedAdapter<T, A> {
    allocator: Rc<RefCell<A>>,
    marker: PhantomData<fn() -> T>,
}

impl<T, A: RawAllocator> OwnedAdapter<T, A> {
    pub fn new(allocator: A) -> Self {
        Self::from_shared(Rc::new(RefCell::new(allocator)))
    }

    pub fn from_shared(allocator: Rc<RefCell<A>>) -> Self {
        Self {
            allocator,
            marker: PhantomData,
        }
    }

    /// The shared allocator, e.g. to read its statistics.
    pub fn allocator(&self) -> &Rc<RefCell<A>> {
        &self.allocator
    }
}

impl<T, A> Clone for OwnedAdapter<T, A> {
    fn clone(&self) -> Self {
        Self {
            allocator: Rc::clone(&self.allocator),
            marker: PhantomData,
        }
    }
}

impl<T, A> PartialEq for OwnedAdapter<T, A> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.allocator, &other.allocator)
    }
}

impl<T, A> fmt::Debug for OwnedAdapter<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedAdapter")
            .field("allocator", &Rc::as_ptr(&self.allocator))
            .finish()
    }
}

impl<T, A: RawAllocator> ElementAllocator<T> for OwnedAdapter<T, A> {
    type Rebind<U> = OwnedAdapter<U, A>;

    fn allocate(&self, count: usize) -> AllocResult<RelPtr<T>> {
        allocate_array(&self.allocator, count)
    }

    fn deallocate(&self, ptr: RelPtr<T>, count: usize) -> AllocResult<()> {
        deallocate_array(&self.allocator, ptr, count)
    }

    fn base(&self) -> Base {
        self.allocator.borrow().base().clone()
    }

    fn rebind<U>(&self) -> OwnedAdapter<U, A> {
        OwnedAdapter::from_shared(Rc::clone(&self.allocator))
    }
}

/// Adapter that borrows an allocator owned elsewhere.
///
/// It is a plain reference, so copies are free and every container built on
/// it, whatever its element type, allocates from the same arena.
pub struct StatefulAdapter<'a, T, A> {
    allocator: &'a RefCell<A>,
    marker: PhantomData<fn() -> T>,
}

impl<'a, T, A: RawAllocator> StatefulAdapter<'a, T, A> {
    pub fn new(allocator: &'a RefCell<A>) -> Self {
        Self {
            allocator,
            marker: PhantomData,
        }
    }

    pub fn allocator(&self) -> &'a RefCell<A> {
        self.allocator
    }
}

impl<T, A> Clone for StatefulAdapter<'_, T, A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, A> Copy for StatefulAdapter<'_, T, A> {}

impl<T, A> PartialEq for StatefulAdapter<'_, T, A> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.allocator, other.allocator)
    }
}

impl<T, A> fmt::Debug for StatefulAdapter<'_, T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatefulAdapter")
            .field("allocator", &(self.allocator as *const RefCell<A>))
            .finish()
    }
}

impl<'a, T, A: RawAllocator> ElementAllocator<T> for StatefulAdapter<'a, T, A> {
    type Rebind<U> = StatefulAdapter<'a, U, A>;

    fn allocate(&self, count: usize) -> AllocResult<RelPtr<T>> {
        allocate_array(self.allocator, count)
    }

    fn deallocate(&self, ptr: RelPtr<T>, count: usize) -> AllocResult<()> {
        deallocate_array(self.allocator, ptr, count)
    }

    fn base(&self) -> Base {
        self.allocator.borrow().base().clone()
    }

    fn rebind<U>(&self) -> StatefulAdapter<'a, U, A> {
        StatefulAdapter::new(self.allocator)
    }
}
