use std::marker::PhantomData;

use crate::{
    block::{self, FreeNode},
    pointer::{Base, RelPtr},
};

/// Singly-linked list of free blocks, threaded through the blocks themselves.
///
/// It is very important for us that, because we are the actual memory
/// allocator, this list can not make allocations itself. Every node lives at
/// the start of the free block it describes, so the only state outside the
/// arena is `head`.
///
/// ```text
///  head
///   |
/// +-v------+--------+-------+--------+--------+-------+
/// | Free   |  used  | used  | Free   |  used  | Free  |
/// | next --|--------|-------|> next -|--------|> null |
/// +--------+--------+-------+--------+--------+-------+
/// ```
///
/// Links are [`RelPtr`]s, so every operation needs the arena's [`Base`].
pub(crate) struct FreeList {
    pub head: RelPtr<FreeNode>,
}

/// One step of a list walk: the node, its predecessor (null for the head) and
/// a copy of the node's contents.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Cursor {
    pub prev: RelPtr<FreeNode>,
    pub node: RelPtr<FreeNode>,
    pub data: FreeNode,
}

pub(crate) struct Iter<'a> {
    prev: RelPtr<FreeNode>,
    current: RelPtr<FreeNode>,
    base: &'a Base,
    marker: PhantomData<&'a FreeList>,
}

impl FreeList {
    /// Creates a new empty List
    pub const fn new() -> Self {
        Self { head: RelPtr::null() }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Reads the node at `node`.
    ///
    /// **SAFETY**: `node` must be a live node of this list under `base`.
    #[inline]
    pub unsafe fn get(&self, node: RelPtr<FreeNode>, base: &Base) -> FreeNode {
        unsafe { block::read(node.addr(base)) }
    }

    /// Overwrites the node at `node`. Same contract as [`FreeList::get`].
    #[inline]
    pub unsafe fn set(&mut self, node: RelPtr<FreeNode>, data: FreeNode, base: &Base) {
        unsafe { block::write(node.addr(base), data) }
    }

    /// Links `node` right after `prev`, or at the head when `prev` is null.
    /// Only the link of `node` is rewritten; its size must already be set.
    ///
    /// **SAFETY**: `node` must point at writable arena memory and `prev` must
    /// be null or a live node.
    pub unsafe fn insert(&mut self, prev: RelPtr<FreeNode>, node: RelPtr<FreeNode>, base: &Base) {
        unsafe {
            let mut data = self.get(node, base);

            if prev.is_null() {
                data.next = self.head;
                self.head = node;
            } else {
                let mut prev_data = self.get(prev, base);
                data.next = prev_data.next;
                prev_data.next = node;
                self.set(prev, prev_data, base);
            }

            self.set(node, data, base);
        }
    }

    /// Unlinks `node`, whose predecessor is `prev` (null when `node` is the head).
    ///
    /// **SAFETY**: both must be live nodes of this list and adjacent.
    pub unsafe fn remove(&mut self, prev: RelPtr<FreeNode>, node: RelPtr<FreeNode>, base: &Base) {
        unsafe {
            let next = self.get(node, base).next;

            if prev.is_null() {
                self.head = next;
            } else {
                let mut prev_data = self.get(prev, base);
                prev_data.next = next;
                self.set(prev, prev_data, base);
            }
        }
    }

    /// Walks the list in address order.
    ///
    /// **SAFETY**: the list must be consistent under `base` for as long as
    /// the iterator is used.
    pub unsafe fn iter<'a>(&'a self, base: &'a Base) -> Iter<'a> {
        Iter {
            prev: RelPtr::null(),
            current: self.head,
            base,
            marker: PhantomData,
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = Cursor;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_null() {
            return None;
        }

        let node = self.current;
        let data: FreeNode = unsafe { block::read(node.addr(self.base)) };
        let cursor = Cursor { prev: self.prev, node, data };

        self.prev = node;
        self.current = data.next;

        Some(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_at(base: &Base, offset: usize, size: usize) -> RelPtr<FreeNode> {
        let node = RelPtr::from_offset(offset);
        unsafe {
            block::write(
                node.addr(base),
                FreeNode { block_size: size, next: RelPtr::null() },
            );
        }
        node
    }

    #[test]
    fn new_list_is_empty() {
        let list = FreeList::new();
        let base = Base::new(0);

        assert!(list.is_empty());
        assert!(unsafe { list.iter(&base) }.next().is_none());
    }

    #[test]
    fn insert_and_remove_keep_order() {
        let mut buf = [0u8; 256];
        let base = Base::from_ptr(buf.as_mut_ptr());
        let mut list = FreeList::new();

        let a = node_at(&base, 0, 32);
        let b = node_at(&base, 64, 32);
        let c = node_at(&base, 128, 32);

        unsafe {
            list.insert(RelPtr::null(), c, &base);
            list.insert(RelPtr::null(), a, &base);
            list.insert(a, b, &base);

            let order: Vec<_> = list.iter(&base).map(|cursor| cursor.node.offset()).collect();
            assert_eq!(order, vec![0, 64, 128]);

            list.remove(a, b, &base);
            let order: Vec<_> = list.iter(&base).map(|cursor| cursor.node.offset()).collect();
            assert_eq!(order, vec![0, 128]);

            list.remove(RelPtr::null(), a, &base);
            let cursors: Vec<_> = list.iter(&base).collect();
            assert_eq!(cursors.len(), 1);
            assert!(cursors[0].prev.is_null());
            assert_eq!(cursors[0].node, c);
        }
    }
}
