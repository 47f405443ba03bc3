//! Offset pointers that stay valid when the memory they point into is mapped
//! at a different address.
//!
//! A [`RelPtr`] never stores an address. It stores the distance from a
//! [`Base`], and every encode/decode takes that base explicitly:
//!
//! ```text
//!   process A                       process B
//!   base = 0x7f00_0000              base = 0x5500_0000
//!   +--------------------+          +--------------------+
//!   |      ...           |          |      ...           |
//!   | node @ base + 0x40 | <------> | node @ base + 0x40 |
//!   +--------------------+          +--------------------+
//!
//!   RelPtr { offset: 0x40 } decodes correctly in both.
//! ```
//!
//! The base itself moves when a growable arena is reallocated, so it lives in
//! a shared cell ([`Base`]) owned by the allocator and cloned into every
//! adapter that needs to decode pointers.

use std::{
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    mem,
    ops::{Add, AddAssign, Sub, SubAssign},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

/// Offset value reserved for the null pointer. A zero offset is a valid
/// pointer to the base itself.
pub const NULL_OFFSET: usize = usize::MAX;

#[derive(Debug)]
struct BaseCell {
    addr: AtomicUsize,
    /// Size of the window above `addr` that valid offsets decode into.
    /// Zero means unknown, which disables the window check.
    span: AtomicUsize,
}

/// Shared handle to the address every [`RelPtr`] of an arena is relative to.
///
/// Cloning the handle shares the cell, so an allocator that moves its arena
/// can publish the new base and every clone observes it. Two handles compare
/// equal only when they share the same cell.
#[derive(Clone, Debug)]
pub struct Base(Arc<BaseCell>);

impl Base {
    pub fn new(addr: usize) -> Self {
        Self(Arc::new(BaseCell {
            addr: AtomicUsize::new(addr),
            span: AtomicUsize::new(0),
        }))
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self::new(ptr as usize)
    }

    /// Current base address.
    #[inline]
    pub fn addr(&self) -> usize {
        self.0.addr.load(Ordering::Acquire)
    }

    /// Publishes a new base address. Pointers decoded after this call resolve
    /// against the new address.
    #[inline]
    pub fn set(&self, addr: usize) {
        self.0.addr.store(addr, Ordering::Release);
    }

    #[inline]
    pub fn span(&self) -> usize {
        self.0.span.load(Ordering::Acquire)
    }

    /// Records how many bytes above the base hold valid targets. Only the
    /// `checked-pointers` feature reads it.
    #[inline]
    pub fn set_span(&self, span: usize) {
        self.0.span.store(span, Ordering::Release);
    }

    /// True when both handles share the same cell.
    #[inline]
    pub fn same_as(&self, other: &Base) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Base {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for Base {}

/// Pointer to a `T` encoded as an offset from a [`Base`].
///
/// Casting to another element type keeps the raw offset; arithmetic moves in
/// units of `size_of::<T>()` like raw pointer arithmetic does.
#[repr(transparent)]
pub struct RelPtr<T> {
    offset: usize,
    marker: PhantomData<fn() -> T>,
}

impl<T> RelPtr<T> {
    #[inline]
    pub const fn null() -> Self {
        Self::from_offset(NULL_OFFSET)
    }

    #[inline]
    pub const fn from_offset(offset: usize) -> Self {
        Self {
            offset,
            marker: PhantomData,
        }
    }

    /// Encodes `ptr` relative to `base`. A null `ptr` encodes as null.
    #[inline]
    pub fn from_raw(ptr: *const T, base: &Base) -> Self {
        if ptr.is_null() {
            return Self::null();
        }

        Self::from_addr(ptr as usize, base)
    }

    /// Encodes an absolute address relative to `base`.
    #[inline]
    pub fn from_addr(addr: usize, base: &Base) -> Self {
        let ptr = Self::from_offset(addr.wrapping_sub(base.addr()));
        ptr.check(base);
        ptr
    }

    #[inline]
    pub const fn offset(self) -> usize {
        self.offset
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.offset == NULL_OFFSET
    }

    /// Absolute address this pointer decodes to under `base`, or 0 for null.
    #[inline]
    pub fn addr(self, base: &Base) -> usize {
        if self.is_null() {
            return 0;
        }

        self.check(base);
        base.addr().wrapping_add(self.offset)
    }

    /// Decodes the pointer under `base`.
    ///
    /// The result is only meaningful until the arena behind `base` moves;
    /// do not keep it across an allocation that may grow the arena.
    #[inline]
    pub fn as_ptr(self, base: &Base) -> *mut T {
        self.addr(base) as *mut T
    }

    /// Reinterprets the pointee type. The offset is unchanged.
    #[inline]
    pub const fn cast<U>(self) -> RelPtr<U> {
        RelPtr::from_offset(self.offset)
    }

    /// Moves the pointer by `bytes` bytes regardless of `T`.
    #[inline]
    pub fn byte_add(self, bytes: usize) -> Self {
        debug_assert!(!self.is_null(), "arithmetic on a null RelPtr");
        Self::from_offset(self.offset.wrapping_add(bytes))
    }

    #[inline]
    pub fn byte_sub(self, bytes: usize) -> Self {
        debug_assert!(!self.is_null(), "arithmetic on a null RelPtr");
        Self::from_offset(self.offset.wrapping_sub(bytes))
    }

    /// Distance to `origin` in elements of `T`.
    #[inline]
    pub fn offset_from(self, origin: Self) -> isize {
        let bytes = self.offset.wrapping_sub(origin.offset) as isize;
        bytes / Self::stride() as isize
    }

    #[inline]
    const fn stride() -> usize {
        if mem::size_of::<T>() == 0 {
            1
        } else {
            mem::size_of::<T>()
        }
    }

    #[cfg(feature = "checked-pointers")]
    #[inline]
    fn check(self, base: &Base) {
        let span = base.span();
        assert!(
            self.is_null() || span == 0 || self.offset <= span,
            "RelPtr offset 0x{:x} decodes outside the {span} byte window",
            self.offset
        );
    }

    #[cfg(not(feature = "checked-pointers"))]
    #[inline(always)]
    fn check(self, _base: &Base) {}
}

impl<T> Clone for RelPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RelPtr<T> {}

impl<T> Default for RelPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> PartialEq for RelPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl<T> Eq for RelPtr<T> {}

impl<T> PartialOrd for RelPtr<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for RelPtr<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.offset.cmp(&other.offset)
    }
}

impl<T> Hash for RelPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.offset.hash(state);
    }
}

impl<T> fmt::Debug for RelPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "RelPtr(null)")
        } else {
            write!(f, "RelPtr(+0x{:x})", self.offset)
        }
    }
}

impl<T> Add<usize> for RelPtr<T> {
    type Output = Self;

    fn add(self, count: usize) -> Self {
        self.byte_add(count * Self::stride())
    }
}

impl<T> Sub<usize> for RelPtr<T> {
    type Output = Self;

    fn sub(self, count: usize) -> Self {
        self.byte_sub(count * Self::stride())
    }
}

impl<T> AddAssign<usize> for RelPtr<T> {
    fn add_assign(&mut self, count: usize) {
        *self = *self + count;
    }
}

impl<T> SubAssign<usize> for RelPtr<T> {
    fn sub_assign(&mut self, count: usize) {
        *self = *self - count;
    }
}

impl<T> Sub for RelPtr<T> {
    type Output = isize;

    fn sub(self, origin: Self) -> isize {
        self.offset_from(origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_distinct_from_zero_offset() {
        let base = Base::new(0x1000);
        let zero = RelPtr::<u32>::from_offset(0);

        assert!(RelPtr::<u32>::null().is_null());
        assert!(!zero.is_null());
        assert_eq!(zero.addr(&base), 0x1000);
        assert_eq!(RelPtr::<u32>::null().addr(&base), 0);
        assert!(RelPtr::<u32>::from_raw(std::ptr::null(), &base).is_null());
    }

    #[test]
    fn arithmetic_moves_in_elements() {
        let mut ptr = RelPtr::<u64>::from_offset(16);

        assert_eq!((ptr + 2).offset(), 32);
        assert_eq!((ptr - 1).offset(), 8);

        ptr += 1;
        assert_eq!(ptr.offset(), 24);
        ptr -= 3;
        assert_eq!(ptr.offset(), 0);

        assert_eq!(RelPtr::<u64>::from_offset(40) - RelPtr::from_offset(8), 4);
    }

    #[test]
    fn cast_keeps_raw_offset() {
        let ptr = RelPtr::<u64>::from_offset(24);
        let bytes: RelPtr<u8> = ptr.cast();

        assert_eq!(bytes.offset(), 24);
        assert_eq!((bytes + 1).offset(), 25);
    }

    #[test]
    fn decodes_against_moved_base() {
        let first = [10u32, 20, 30, 40];
        let second = first;

        let base = Base::from_ptr(first.as_ptr());
        let ptr = RelPtr::from_raw(&first[2] as *const u32, &base);

        // Same relative image, different address.
        let moved = Base::from_ptr(second.as_ptr());
        unsafe {
            assert_eq!(*ptr.as_ptr(&base), 30);
            assert_eq!(*ptr.as_ptr(&moved), 30);
        }
        assert_ne!(ptr.addr(&base), ptr.addr(&moved));
    }

    #[test]
    fn base_updates_are_shared_between_clones() {
        let base = Base::new(0x1000);
        let clone = base.clone();
        let other = Base::new(0x1000);

        base.set(0x2000);

        assert_eq!(clone.addr(), 0x2000);
        assert_eq!(base, clone);
        assert_ne!(base, other);
    }

    #[cfg(feature = "checked-pointers")]
    #[test]
    #[should_panic(expected = "decodes outside")]
    fn decoding_past_the_window_panics() {
        let base = Base::new(0x1000);
        base.set_span(64);

        let _ = RelPtr::<u8>::from_offset(128).addr(&base);
    }

    #[cfg(feature = "checked-pointers")]
    #[test]
    #[should_panic(expected = "decodes outside")]
    fn encoding_below_the_base_panics() {
        let base = Base::new(0x1000);
        base.set_span(64);

        let _ = RelPtr::<u8>::from_addr(0x800, &base);
    }

    #[cfg(feature = "checked-pointers")]
    #[test]
    fn window_edges_and_unknown_span() {
        let base = Base::new(0x1000);
        base.set_span(64);
        assert_eq!(RelPtr::<u8>::from_offset(64).addr(&base), 0x1040);
        assert!(RelPtr::<u8>::null().addr(&base) == 0);

        // Zero span means unknown, nothing is rejected.
        let open = Base::new(0x1000);
        assert_eq!(RelPtr::<u8>::from_offset(1 << 20).addr(&open), 0x1000 + (1 << 20));
        assert!(!RelPtr::<u8>::from_addr(0x800, &open).is_null());
    }
}
