use std::{
    marker::PhantomData,
    ptr::{self, NonNull},
};

use crate::{error::Result, header::Header};

/// Singly linked list of every block currently handed out.
///
/// Membership says that a block exists, not that it is reachable. Blocks are
/// pushed at the head by the allocator and only leave through [`UsedList::retain`],
/// which the sweep uses.
pub(crate) struct UsedList {
    head: *mut Header,
    len: usize,
}

pub(crate) struct Iter<'a> {
    current: *mut Header,
    remaining: usize,
    marker: PhantomData<&'a UsedList>,
}

impl UsedList {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts `block` at the head of the list.
    ///
    /// **SAFETY**: `block` must be a valid block that is on no list.
    pub unsafe fn push(&mut self, block: NonNull<Header>) {
        unsafe {
            (*block.as_ptr()).link = self.head;
        }

        self.head = block.as_ptr();
        self.len += 1;
    }

    /// Walks the list once. Blocks for which `keep` returns false are unlinked
    /// and passed to `removed`, after which the list no longer touches them.
    ///
    /// Stops at the first error returned by `removed`; the list stays
    /// consistent in that case.
    ///
    /// **SAFETY**: every block on the list must be valid.
    pub unsafe fn retain<K, R>(&mut self, mut keep: K, mut removed: R) -> Result<()>
    where
        K: FnMut(&mut Header) -> bool,
        R: FnMut(NonNull<Header>) -> Result<()>,
    {
        let mut link: *mut *mut Header = &mut self.head;

        unsafe {
            while !(*link).is_null() {
                let current = *link;

                if keep(&mut *current) {
                    link = &mut (*current).link;
                    continue;
                }

                *link = (*current).link;
                (*current).link = ptr::null_mut();
                self.len -= 1;

                removed(NonNull::new_unchecked(current))?;
            }
        }

        Ok(())
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = NonNull<Header>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = NonNull::new(self.current)?;

        unsafe {
            self.current = node.as_ref().link;
        }
        self.remaining = self.remaining.saturating_sub(1);

        Some(node)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a> IntoIterator for &'a UsedList {
    type Item = NonNull<Header>;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
