//! Intrusive circular doubly linked list backed by a container implementing
//! `core::ops::Index`.
//!
//! The kernel links threads and wait/timeout nodes into queues without heap
//! allocation by storing the links inside the elements themselves. The
//! accessor is generic over the *pool* (how an index is turned into an
//! element reference) and over the *cell* holding each link (how a link is
//! read and written), so the same implementation serves plain `Cell`-based
//! lists in tests and CPU-Lock-keyed lists in the kernel.
#![allow(dead_code)]
use core::{fmt, ops, ptr::NonNull};

use super::Init;

/// Circular linked list header.
#[derive(Debug, Copy, Clone)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
}

impl<Index> Default for ListHead<Index> {
    fn default() -> Self {
        Self::INIT
    }
}

impl<Index> Init for ListHead<Index> {
    const INIT: Self = Self { first: None };
}

/// Links to neighbor items.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link<Index> {
    pub prev: Index,
    pub next: Index,
}

impl<Index: Init> Init for Link<Index> {
    const INIT: Self = Self {
        prev: Index::INIT,
        next: Index::INIT,
    };
}

impl<Index> ListHead<Index> {
    pub const fn new() -> Self {
        Self::INIT
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// A virtual container of `T`s that can be indexed by `Ident<&'static T>`.
#[derive(Debug, Clone, Copy)]
pub struct Static;

impl<T> ops::Index<Ident<&'static T>> for Static {
    type Output = T;

    fn index(&self, index: Ident<&'static T>) -> &Self::Output {
        index.0
    }
}

/// Reference wrapper that implements `PartialEq` and `Eq` by identity
/// comparison.
#[derive(Clone, Copy)]
pub struct Ident<T>(pub T);

impl<T> fmt::Debug for Ident<&'_ T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Do not print the pointee. This is a safe measure against infinite
        // recursion.
        f.debug_tuple("Ident").field(&(self.0 as *const T)).finish()
    }
}

impl<T: ?Sized> PartialEq for Ident<&'_ T> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}

impl<T: ?Sized> Eq for Ident<&'_ T> {}

/// Raw reference used as a list index. The pointee is not owned by the
/// list; whoever inserts an element guarantees it outlives its membership.
pub struct Ref<T>(pub NonNull<T>);

// Safety: `Ref` is just a pointer. The kernel only forms `Ref`s to objects
// that are `Send + Sync` and only dereferences them through `UnsafeRefPool`
// under the conditions stated there.
unsafe impl<T: Send + Sync> Send for Ref<T> {}
unsafe impl<T: Send + Sync> Sync for Ref<T> {}

impl<T> Ref<T> {
    #[inline]
    pub fn new(x: &T) -> Self {
        Self(NonNull::from(x))
    }
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Ref<T> {}

impl<T> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> Eq for Ref<T> {}

impl<T> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Ref").field(&self.0).finish()
    }
}

/// A virtual container of `T`s indexed by [`Ref`]`<T>`.
pub struct UnsafeRefPool {
    _nonexhaustive: (),
}

impl UnsafeRefPool {
    /// Construct an `UnsafeRefPool`.
    ///
    /// # Safety
    ///
    /// All pointees to be accessed through the constructed `UnsafeRefPool`
    /// must be valid for the duration of the access.
    #[inline]
    pub const unsafe fn new() -> &'static Self {
        &Self { _nonexhaustive: () }
    }
}

impl<T> ops::Index<Ref<T>> for UnsafeRefPool {
    type Output = T;

    #[inline]
    fn index(&self, index: Ref<T>) -> &Self::Output {
        // Safety: Upheld by the caller of `UnsafeRefPool::new`.
        unsafe { &*index.0.as_ptr() }
    }
}

/// An abstract interface to a mutable memory location, reachable only
/// through a key of type `Key`.
pub trait CellLike<Key> {
    type Target;

    fn get(&self, key: &Key) -> Self::Target;
    fn set(&self, key: &mut Key, value: Self::Target);

    fn modify(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target))
    where
        Self: Sized,
    {
        let mut x = self.get(key);
        f(&mut x);
        self.set(key, x);
    }
}

impl<Element: Copy> CellLike<()> for core::cell::Cell<Element> {
    type Target = Element;

    fn get(&self, _: &()) -> Self::Target {
        self.get()
    }
    fn set(&self, _: &mut (), value: Self::Target) {
        self.set(value);
    }
}

impl<Key, Element: CellLike<Key>> CellLike<Key> for &Element {
    type Target = Element::Target;

    fn get(&self, key: &Key) -> Self::Target {
        (*self).get(key)
    }
    fn set(&self, key: &mut Key, value: Self::Target) {
        (*self).set(key, value);
    }
}

/// `Cell`-based accessor to a linked list.
#[derive(Debug)]
pub struct ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey> {
    head: HeadCell,
    pool: &'a Pool,
    map_link: MapLink,
    /// `Key` used to read or write cells.
    cell_key: CellKey,
}

impl<'a, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey>
    ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: Fn(&Element) -> &LinkCell,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    pub fn new(head: HeadCell, pool: &'a Pool, map_link: MapLink, cell_key: CellKey) -> Self {
        ListAccessorCell {
            head,
            pool,
            map_link,
            cell_key,
        }
    }

    pub fn head(&self) -> ListHead<Index> {
        self.head.get(&self.cell_key)
    }

    pub fn set_head(&mut self, head: ListHead<Index>) {
        self.head.set(&mut self.cell_key, head);
    }

    pub fn cell_key(&self) -> &CellKey {
        &self.cell_key
    }

    pub fn cell_key_mut(&mut self) -> &mut CellKey {
        &mut self.cell_key
    }

    pub fn pool(&self) -> &Pool {
        self.pool
    }

    pub fn is_empty(&self) -> bool {
        self.head().is_empty()
    }

    pub fn front(&self) -> Option<Index> {
        self.head().first
    }

    pub fn back(&self) -> Option<Index> {
        self.head().first.map(|p| {
            (self.map_link)(&self.pool[p])
                .get(&self.cell_key)
                .unwrap()
                .prev
        })
    }

    pub fn front_data(&self) -> Option<&Element> {
        if let Some(p) = self.front() {
            Some(&self.pool[p])
        } else {
            None
        }
    }

    /// Get the successor of `item`, or `None` if `item` is the last element.
    pub fn next(&self, item: Index) -> Option<Index> {
        let next = (self.map_link)(&self.pool[item])
            .get(&self.cell_key)
            .unwrap()
            .next;
        if Some(&next) == self.head().first.as_ref() {
            None
        } else {
            Some(next)
        }
    }

    /// Get the predecessor of `item`, or `None` if `item` is the first
    /// element.
    pub fn prev(&self, item: Index) -> Option<Index> {
        if Some(&item) == self.head().first.as_ref() {
            None
        } else {
            Some(
                (self.map_link)(&self.pool[item])
                    .get(&self.cell_key)
                    .unwrap()
                    .prev,
            )
        }
    }

    /// Insert `item` before the position `p` (if `at` is `Some(p)`) or to
    /// the list's back (if `at` is `None`).
    pub fn insert(&mut self, item: Index, at: Option<Index>) {
        debug_assert!(
            (self.map_link)(&self.pool[item.clone()])
                .get(&self.cell_key)
                .is_none(),
            "item is already linked"
        );

        let mut head = self.head();

        if let Some(first) = head.first {
            let (next, update_first) = if let Some(at) = at {
                let update_first = at == first;
                (at, update_first)
            } else {
                (first, false)
            };

            let prev = (self.map_link)(&self.pool[next.clone()])
                .get(&self.cell_key)
                .unwrap()
                .prev;
            (self.map_link)(&self.pool[prev.clone()]).modify(&mut self.cell_key, |l| {
                l.as_mut().unwrap().next = item.clone()
            });
            (self.map_link)(&self.pool[next.clone()]).modify(&mut self.cell_key, |l| {
                l.as_mut().unwrap().prev = item.clone()
            });
            (self.map_link)(&self.pool[item.clone()])
                .set(&mut self.cell_key, Some(Link { prev, next }));

            if update_first {
                head.first = Some(item);
                self.set_head(head);
            }
        } else {
            debug_assert!(at.is_none());

            let link = (self.map_link)(&self.pool[item.clone()]);
            link.set(
                &mut self.cell_key,
                Some(Link {
                    prev: item.clone(),
                    next: item.clone(),
                }),
            );

            head.first = Some(item);
            self.set_head(head);
        }
    }

    pub fn push_back(&mut self, item: Index) {
        self.insert(item, None);
    }

    pub fn push_front(&mut self, item: Index) {
        let at = self.front();
        self.insert(item, at);
    }

    /// Remove `item` from the list. Returns `item`.
    pub fn remove(&mut self, item: Index) -> Index {
        debug_assert!(
            (self.map_link)(&self.pool[item.clone()])
                .get(&self.cell_key)
                .is_some(),
            "item is not linked"
        );

        let link: Link<Index> = {
            let link_ref = (self.map_link)(&self.pool[item.clone()]);
            let mut head = self.head();
            if head.first.as_ref() == Some(&item) {
                let next = link_ref.get(&self.cell_key).unwrap().next;
                if next == item {
                    // The list just became empty
                    head.first = None;
                    self.set_head(head);

                    link_ref.set(&mut self.cell_key, None);
                    return item;
                }

                // Move the head pointer
                head.first = Some(next);
                self.set_head(head);
            }

            link_ref.get(&self.cell_key).unwrap()
        };

        (self.map_link)(&self.pool[link.prev.clone()]).modify(&mut self.cell_key, |l| {
            l.as_mut().unwrap().next = link.next.clone()
        });
        (self.map_link)(&self.pool[link.next.clone()]).modify(&mut self.cell_key, |l| {
            l.as_mut().unwrap().prev = link.prev.clone()
        });
        (self.map_link)(&self.pool[item.clone()]).set(&mut self.cell_key, None);

        item
    }

    pub fn pop_back(&mut self) -> Option<Index> {
        self.back().map(|item| self.remove(item))
    }

    pub fn pop_front(&mut self) -> Option<Index> {
        self.front().map(|item| self.remove(item))
    }

    pub fn iter(&self) -> Iter<&Self, Index> {
        Iter {
            next: self.head().first,
            accessor: self,
        }
    }
}

/// An iterator over the elements of `ListAccessorCell`.
#[derive(Debug)]
pub struct Iter<Accessor, Index> {
    accessor: Accessor,
    next: Option<Index>,
}

impl<'a, 'b, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey> Iterator
    for Iter<&'b ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey>, Index>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: 'a + Fn(&Element) -> &LinkCell,
    Element: 'a + 'b,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    type Item = (Index, &'a Element);

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(next) = self.next.take() {
            let new_next = (self.accessor.map_link)(&self.accessor.pool[next.clone()])
                .get(&self.accessor.cell_key)
                .unwrap()
                .next;
            if Some(&new_next) == self.accessor.head().first.as_ref() {
                self.next = None;
            } else {
                self.next = Some(new_next);
            }
            Some((next.clone(), &self.accessor.pool[next]))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn push<Element>(this: &mut Vec<Element>, x: Element) -> usize {
        let i = this.len();
        this.push(x);
        i
    }

    #[test]
    fn basic_cell() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        macro_rules! get_accessor {
            () => {
                ListAccessorCell::new(&head, &pool, |(_, link)| link, ())
            };
        }

        let ptr1 = push(&mut pool, (1, Cell::new(None)));
        get_accessor!().push_back(ptr1);

        let ptr2 = push(&mut pool, (2, Cell::new(None)));
        get_accessor!().push_back(ptr2);

        let ptr3 = push(&mut pool, (3, Cell::new(None)));
        get_accessor!().push_front(ptr3);

        let mut accessor = get_accessor!();
        assert!(!accessor.is_empty());
        assert_eq!(accessor.front(), Some(ptr3));
        assert_eq!(accessor.back(), Some(ptr2));
        assert_eq!(accessor.front_data().unwrap().0, 3);

        let items: Vec<_> = accessor.iter().map(|(_, (x, _))| *x).collect();
        assert_eq!(items, vec![3, 1, 2]);

        assert_eq!(accessor.next(ptr3), Some(ptr1));
        assert_eq!(accessor.next(ptr1), Some(ptr2));
        assert_eq!(accessor.next(ptr2), None);
        assert_eq!(accessor.prev(ptr3), None);
        assert_eq!(accessor.prev(ptr1), Some(ptr3));
        assert_eq!(accessor.prev(ptr2), Some(ptr1));

        accessor.remove(ptr1);
        accessor.remove(ptr2);
        accessor.remove(ptr3);

        assert!(accessor.is_empty());
    }

    #[test]
    fn insert_before() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        macro_rules! get_accessor {
            () => {
                ListAccessorCell::new(&head, &pool, |(_, link)| link, ())
            };
        }

        let ptr1 = push(&mut pool, (1, Cell::new(None)));
        let ptr2 = push(&mut pool, (2, Cell::new(None)));
        let ptr3 = push(&mut pool, (3, Cell::new(None)));

        get_accessor!().push_back(ptr1);
        get_accessor!().push_back(ptr2);
        get_accessor!().insert(ptr3, Some(ptr2));

        let items: Vec<_> = get_accessor!().iter().map(|(_, (x, _))| *x).collect();
        assert_eq!(items, vec![1, 3, 2]);
    }

    #[test]
    fn clear_cell() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        macro_rules! get_accessor {
            () => {
                ListAccessorCell::new(&head, &pool, |(_, link)| link, ())
            };
        }

        let ptrs = [
            push(&mut pool, (1, Cell::new(None))),
            push(&mut pool, (2, Cell::new(None))),
            push(&mut pool, (3, Cell::new(None))),
        ];

        get_accessor!().push_back(ptrs[0]);
        get_accessor!().push_back(ptrs[1]);
        get_accessor!().push_front(ptrs[2]);

        while get_accessor!().pop_front().is_some() {}

        assert_eq!(head.get().first, None);
        for &ptr in &ptrs {
            let e = &pool[ptr];
            assert!(e.1.get().is_none());
        }
    }

    #[test]
    fn basic_cell_static() {
        #[derive(Debug)]
        struct El(u32, Cell<Option<Link<Ident<&'static El>>>>);

        fn push_static(x: El) -> Ident<&'static El> {
            Ident(Box::leak(Box::new(x)))
        }

        let head = Cell::new(ListHead::<Ident<&'static El>>::new());

        macro_rules! get_accessor {
            () => {
                ListAccessorCell::new(&head, &Static, |El(_, link)| link, ())
            };
        }

        let ptr1 = push_static(El(1, Cell::new(None)));
        get_accessor!().push_back(ptr1);

        let ptr2 = push_static(El(2, Cell::new(None)));
        get_accessor!().push_back(ptr2);

        let ptr3 = push_static(El(3, Cell::new(None)));
        get_accessor!().push_front(ptr3);

        let items: Vec<_> = get_accessor!().iter().map(|(_, El(x, _))| *x).collect();
        assert_eq!(items, vec![3, 1, 2]);

        let mut accessor = get_accessor!();
        assert_eq!(accessor.pop_back(), Some(ptr2));
        accessor.remove(ptr1);
        accessor.remove(ptr3);
        assert!(accessor.is_empty());
    }

    #[test]
    fn basic_ref_pool() {
        #[derive(Debug)]
        struct El(u32, Cell<Option<Link<Ref<El>>>>);

        fn push_leaked(x: El) -> Ref<El> {
            Ref::new(Box::leak(Box::new(x)))
        }

        // The elements are leaked above and thus live forever.
        let pool = unsafe { UnsafeRefPool::new() };
        let head = Cell::new(ListHead::<Ref<El>>::new());

        macro_rules! get_accessor {
            () => {
                ListAccessorCell::new(&head, pool, |El(_, link)| link, ())
            };
        }

        let ptr1 = push_leaked(El(1, Cell::new(None)));
        get_accessor!().push_back(ptr1);

        let ptr2 = push_leaked(El(2, Cell::new(None)));
        get_accessor!().push_back(ptr2);

        let ptr3 = push_leaked(El(3, Cell::new(None)));
        get_accessor!().push_front(ptr3);

        let items: Vec<_> = get_accessor!().iter().map(|(_, El(x, _))| *x).collect();
        assert_eq!(items, vec![3, 1, 2]);

        let mut accessor = get_accessor!();
        accessor.remove(ptr1);
        accessor.remove(ptr2);
        accessor.remove(ptr3);
        assert!(accessor.is_empty());
    }
}
