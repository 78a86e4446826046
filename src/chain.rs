//! # Index-Linked Chains
//!
//! A doubly-linked list whose links are slot indices into a slab owned by
//! the list itself. Insertion and removal are O(1) given a [`ChainHandle`]
//! and never allocate once the slab has grown to its working size.
//!
//! ```text
//!   head ──► [2] ◄──► [0] ◄──► [3] ◀── tail
//!   slab:  0: used   1: free ─► none   2: used   3: used
//! ```
//!
//! Handles stay valid until their element is removed. A removed slot is
//! recycled by the next insertion.

use alloc::vec::Vec;

/// Stable reference to one element of an [`IndexList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainHandle(usize);

#[derive(Debug)]
enum Link<T> {
    Used {
        value: T,
        prev: Option<usize>,
        next: Option<usize>,
    },
    Free {
        next_free: Option<usize>,
    },
}

/// Index-linked doubly-linked list.
#[derive(Debug)]
pub struct IndexList<T> {
    slab: Vec<Link<T>>,
    head: Option<usize>,
    tail: Option<usize>,
    free: Option<usize>,
    len: usize,
}

impl<T> IndexList<T> {
    pub const fn new() -> Self {
        Self {
            slab: Vec::new(),
            head: None,
            tail: None,
            free: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn alloc_slot(&mut self, value: T) -> usize {
        let link = Link::Used {
            value,
            prev: None,
            next: None,
        };
        match self.free {
            Some(slot) => {
                if let Link::Free { next_free } = self.slab[slot] {
                    self.free = next_free;
                }
                self.slab[slot] = link;
                slot
            }
            None => {
                self.slab.push(link);
                self.slab.len() - 1
            }
        }
    }

    fn set_prev(&mut self, slot: usize, to: Option<usize>) {
        if let Link::Used { prev, .. } = &mut self.slab[slot] {
            *prev = to;
        }
    }

    fn set_next(&mut self, slot: usize, to: Option<usize>) {
        if let Link::Used { next, .. } = &mut self.slab[slot] {
            *next = to;
        }
    }

    fn links(&self, slot: usize) -> Option<(Option<usize>, Option<usize>)> {
        match self.slab.get(slot) {
            Some(Link::Used { prev, next, .. }) => Some((*prev, *next)),
            _ => None,
        }
    }

    pub fn push_back(&mut self, value: T) -> ChainHandle {
        let slot = self.alloc_slot(value);
        self.set_prev(slot, self.tail);
        match self.tail {
            Some(tail) => self.set_next(tail, Some(slot)),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;
        ChainHandle(slot)
    }

    pub fn push_front(&mut self, value: T) -> ChainHandle {
        let slot = self.alloc_slot(value);
        self.set_next(slot, self.head);
        match self.head {
            Some(head) => self.set_prev(head, Some(slot)),
            None => self.tail = Some(slot),
        }
        self.head = Some(slot);
        self.len += 1;
        ChainHandle(slot)
    }

    /// Unlinks the element and returns its value. `None` for a stale handle.
    pub fn remove(&mut self, handle: ChainHandle) -> Option<T> {
        let slot = handle.0;
        let (prev, next) = self.links(slot)?;

        match prev {
            Some(p) => self.set_next(p, next),
            None => self.head = next,
        }
        match next {
            Some(n) => self.set_prev(n, prev),
            None => self.tail = prev,
        }

        let old = core::mem::replace(
            &mut self.slab[slot],
            Link::Free {
                next_free: self.free,
            },
        );
        self.free = Some(slot);
        self.len -= 1;

        match old {
            Link::Used { value, .. } => Some(value),
            Link::Free { .. } => None,
        }
    }

    /// Moves an element to the head of the chain.
    pub fn move_to_front(&mut self, handle: ChainHandle) -> Option<ChainHandle> {
        let value = self.remove(handle)?;
        Some(self.push_front(value))
    }

    pub fn get(&self, handle: ChainHandle) -> Option<&T> {
        match self.slab.get(handle.0) {
            Some(Link::Used { value, .. }) => Some(value),
            _ => None,
        }
    }

    pub fn first(&self) -> Option<&T> {
        self.head.and_then(|slot| self.get(ChainHandle(slot)))
    }

    pub fn first_handle(&self) -> Option<ChainHandle> {
        self.head.map(ChainHandle)
    }

    /// Handle of the first element matching `pred`, searching from the head.
    pub fn find<F>(&self, mut pred: F) -> Option<ChainHandle>
    where
        F: FnMut(&T) -> bool,
    {
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            match &self.slab[slot] {
                Link::Used { value, next, .. } => {
                    if pred(value) {
                        return Some(ChainHandle(slot));
                    }
                    cursor = *next;
                }
                Link::Free { .. } => break,
            }
        }
        None
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }
}

impl<T: PartialEq> IndexList<T> {
    pub fn contains(&self, value: &T) -> bool {
        self.find(|v| v == value).is_some()
    }
}

impl<T> Default for IndexList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Head-to-tail iterator over an [`IndexList`].
pub struct Iter<'a, T> {
    list: &'a IndexList<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let slot = self.cursor?;
        match &self.list.slab[slot] {
            Link::Used { value, next, .. } => {
                self.cursor = *next;
                Some(value)
            }
            Link::Free { .. } => {
                self.cursor = None;
                None
            }
        }
    }
}
