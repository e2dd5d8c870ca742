use std::ptr::{self, NonNull};

use crate::{
    error::{Error, Result},
    header::{self, Header},
};

/// Circular, address ordered list of blocks that are not handed out.
///
/// The list is anchored by a zero sized sentinel so it is never empty. The
/// sentinel lives outside of any arena, takes its place in address order like
/// every other node and is never merged with a neighbour.
///
/// ```text
///          +-----------------------------------------------------+
///          v                                                     |
///   +------------+     +------------+     +------------+         |
///   |  sentinel  | --> | Free (low) | --> | Free (high)| --------+
///   |  size = 0  |     +------------+     +------------+
///   +------------+
/// ```
///
/// Two free blocks are never address adjacent: every insertion merges the
/// block with the neighbours it touches.
pub(crate) struct FreeList {
    /// The anchor node, owned by this list.
    base: NonNull<Header>,
    /// Node preceding the last block touched. Searches start right after it.
    cursor: *mut Header,
    /// Number of nodes, not counting the sentinel.
    len: usize,
}

/// Read-only view of a free block, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeSpan {
    pub addr: usize,
    pub units: u32,
}

impl FreeList {
    /// Creates a list holding only the sentinel.
    pub fn new() -> Self {
        let base = Box::into_raw(Box::new(Header::sentinel()));

        unsafe {
            (*base).link = base;

            Self {
                base: NonNull::new_unchecked(base),
                cursor: base,
                len: 0,
            }
        }
    }

    /// Number of free blocks, sentinel excluded.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// First fit search for a block of `units` units.
    ///
    /// The search starts right after the cursor and stops once it went around
    /// the list. An exact fit is unlinked entirely. A larger block is split:
    /// its lower part stays on the list with a reduced size and the upper
    /// `units` units are returned. The returned header is fully initialized
    /// with a cleared mark and a null link.
    ///
    /// Returns `Ok(None)` when no block is large enough.
    ///
    /// **SAFETY**: every node reachable from the sentinel must be a valid block.
    pub unsafe fn take(&mut self, units: u32) -> Result<Option<NonNull<Header>>> {
        debug_assert!(units > 0);

        unsafe {
            let mut prev = self.cursor;
            let mut current = (*prev).link;
            let mut steps = 0;

            loop {
                if (*current).size >= units {
                    if (*current).size == units {
                        (*prev).link = (*current).link;
                        self.len -= 1;
                    } else {
                        (*current).size -= units;
                        current = current.add((*current).size as usize);
                    }

                    ptr::write(
                        current,
                        Header {
                            size: units,
                            mark: false,
                            link: ptr::null_mut(),
                        },
                    );

                    self.cursor = prev;

                    return Ok(Some(NonNull::new_unchecked(current)));
                }

                if current == self.cursor {
                    return Ok(None);
                }

                steps += 1;
                if steps > self.len + 1 {
                    return Err(Error::InvariantViolation {
                        detail: "free list does not close while searching",
                    });
                }

                prev = current;
                current = (*current).link;
            }
        }
    }

    /// Puts `block` back on the list at its address ordered position and
    /// merges it with the free blocks right before and after it.
    ///
    /// The cursor is left on the node preceding the inserted (or merged) block.
    ///
    /// **SAFETY**: `block` must be a valid block that is not on any list, and
    /// every node reachable from the sentinel must be a valid block.
    pub unsafe fn insert(&mut self, block: NonNull<Header>) -> Result<()> {
        let bp = block.as_ptr();
        let base = self.base.as_ptr();

        unsafe {
            let mut p = self.cursor;
            let mut steps = 0;

            loop {
                let next = (*p).link;

                if bp == p || bp == next {
                    return Err(Error::InvariantViolation {
                        detail: "block is already on the free list",
                    });
                }

                // Either the block sits between two nodes, or we are at the
                // wrap point and the block is beyond one of its ends.
                if (bp > p && bp < next) || (p >= next && (bp > p || bp < next)) {
                    break;
                }

                steps += 1;
                if steps > self.len + 1 {
                    return Err(Error::InvariantViolation {
                        detail: "free list does not close while inserting",
                    });
                }

                p = next;
            }

            let next = (*p).link;

            if (next != base && bp < next && header::end(bp) > next)
                || (p != base && p < bp && header::end(p) > bp)
            {
                return Err(Error::InvariantViolation {
                    detail: "released block overlaps a free block",
                });
            }

            (*bp).mark = false;
            self.len += 1;

            // Upper neighbour
            match merged_size(bp, next, base) {
                Some(size) => {
                    (*bp).size = size;
                    (*bp).link = (*next).link;
                    // The absorbed header becomes payload; drop its free list link.
                    ptr::write(next, Header::sentinel());
                    self.len -= 1;
                }
                None => (*bp).link = next,
            }

            // Lower neighbour
            match merged_size(p, bp, base) {
                Some(size) => {
                    (*p).size = size;
                    (*p).link = (*bp).link;
                    ptr::write(bp, Header::sentinel());
                    self.len -= 1;
                }
                None => (*p).link = bp,
            }

            self.cursor = p;
        }

        Ok(())
    }

    /// Iterates over the free blocks in list order starting after the sentinel.
    pub fn spans(&self) -> impl Iterator<Item = FreeSpan> + '_ {
        let base = self.base.as_ptr();
        let mut current = unsafe { (*base).link };
        let mut remaining = self.len;

        std::iter::from_fn(move || {
            if current == base || remaining == 0 {
                return None;
            }

            unsafe {
                let span = FreeSpan {
                    addr: current as usize,
                    units: (*current).size,
                };
                current = (*current).link;
                remaining -= 1;

                Some(span)
            }
        })
    }

    /// Size of the largest free block in units.
    pub fn largest(&self) -> u32 {
        self.spans().map(|span| span.units).max().unwrap_or(0)
    }
}

/// Size of `low` after absorbing `high`, if `low` ends exactly where `high`
/// starts and neither is the sentinel.
///
/// **SAFETY**: both pointers must be valid headers.
unsafe fn merged_size(low: *mut Header, high: *mut Header, base: *mut Header) -> Option<u32> {
    if low == base || high == base {
        return None;
    }

    unsafe {
        if header::end(low) != high {
            return None;
        }

        (*low).size.checked_add((*high).size)
    }
}

impl Drop for FreeList {
    fn drop(&mut self) {
        unsafe { drop(Box::from_raw(self.base.as_ptr())) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Unit aligned backing memory for hand made blocks.
    fn backing(units: usize) -> Vec<Header> {
        (0..units).map(|_| Header::sentinel()).collect()
    }

    unsafe fn block_at(memory: &mut [Header], unit: usize, size: u32) -> NonNull<Header> {
        unsafe {
            let block = memory.as_mut_ptr().add(unit);
            (*block).size = size;
            (*block).mark = true;
            NonNull::new_unchecked(block)
        }
    }

    #[test]
    fn new_list_only_has_sentinel() {
        let list = FreeList::new();

        assert_eq!(0, list.len());
        assert_eq!(0, list.spans().count());
        assert_eq!(0, list.largest());
    }

    #[test]
    fn empty_list_has_no_fit() {
        let mut list = FreeList::new();

        unsafe {
            assert!(list.take(2).unwrap().is_none());
        }
    }

    #[test]
    fn split_returns_upper_part() {
        let mut memory = backing(16);
        let mut list = FreeList::new();

        unsafe {
            let block = block_at(&mut memory, 0, 16);
            list.insert(block).unwrap();

            let taken = list.take(4).unwrap().unwrap();

            assert_eq!(block.as_ptr().add(12), taken.as_ptr());
            assert_eq!(4, (*taken.as_ptr()).size);
            assert!(!(*taken.as_ptr()).mark);
            assert_eq!(12, (*block.as_ptr()).size);
            assert_eq!(1, list.len());
        }
    }

    #[test]
    fn exact_fit_unlinks_block() {
        let mut memory = backing(8);
        let mut list = FreeList::new();

        unsafe {
            let block = block_at(&mut memory, 0, 8);
            list.insert(block).unwrap();

            let taken = list.take(8).unwrap().unwrap();

            assert_eq!(block, taken);
            assert_eq!(0, list.len());
            assert!(list.take(2).unwrap().is_none());
        }
    }

    #[test]
    fn adjacent_blocks_coalesce_in_any_order() {
        let mut memory = backing(12);
        let mut list = FreeList::new();

        unsafe {
            let low = block_at(&mut memory, 0, 4);
            let mid = block_at(&mut memory, 4, 4);
            let high = block_at(&mut memory, 8, 4);

            list.insert(high).unwrap();
            list.insert(low).unwrap();
            assert_eq!(2, list.len());

            // Fills the hole and merges with both neighbours
            list.insert(mid).unwrap();

            assert_eq!(1, list.len());
            assert_eq!(12, list.largest());
            assert_eq!(
                vec![FreeSpan {
                    addr: low.as_ptr() as usize,
                    units: 12
                }],
                list.spans().collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn absorbed_headers_leave_no_links_behind() {
        let mut memory = backing(12);
        let mut list = FreeList::new();

        unsafe {
            let low = block_at(&mut memory, 0, 4);
            let mid = block_at(&mut memory, 4, 4);
            let high = block_at(&mut memory, 8, 4);

            list.insert(low).unwrap();
            list.insert(high).unwrap();
            list.insert(mid).unwrap();

            for absorbed in [mid, high] {
                assert!((*absorbed.as_ptr()).link.is_null());
                assert_eq!(0, (*absorbed.as_ptr()).size);
            }

            // Handing the merged block out again exposes no free list pointer
            let taken = list.take(12).unwrap().unwrap();
            let (start, end) = header::payload_span(taken.as_ptr());
            let base = list.base.as_ptr() as usize;
            for addr in (start..end).step_by(size_of::<usize>()) {
                let word = *(addr as *const usize);
                assert_ne!(base, word);
                assert!(!(start..end).contains(&word));
            }
        }
    }

    #[test]
    fn distant_blocks_stay_ordered() {
        let mut memory = backing(32);
        let mut list = FreeList::new();

        unsafe {
            let a = block_at(&mut memory, 20, 4);
            let b = block_at(&mut memory, 0, 4);
            let c = block_at(&mut memory, 10, 4);

            list.insert(a).unwrap();
            list.insert(b).unwrap();
            list.insert(c).unwrap();

            let mut addrs: Vec<usize> = list.spans().map(|span| span.addr).collect();
            assert_eq!(3, addrs.len());

            // One rotation of the circular list is ascending
            let min = addrs.iter().position(|addr| *addr == b.as_ptr() as usize).unwrap();
            addrs.rotate_left(min);
            assert!(addrs.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }

    #[test]
    fn search_wraps_around_from_cursor() {
        let mut memory = backing(32);
        let mut list = FreeList::new();

        unsafe {
            let big = block_at(&mut memory, 0, 10);
            let small = block_at(&mut memory, 20, 3);

            list.insert(big).unwrap();
            list.insert(small).unwrap();

            // Cursor now sits before `small`; a request only `big` can hold must
            // still be found by going around.
            let taken = list.take(10).unwrap().unwrap();
            assert_eq!(big, taken);
            assert_eq!(1, list.len());
        }
    }

    #[test]
    fn double_insert_is_detected() {
        let mut memory = backing(8);
        let mut list = FreeList::new();

        unsafe {
            let block = block_at(&mut memory, 0, 4);
            list.insert(block).unwrap();

            assert!(matches!(
                list.insert(block),
                Err(Error::InvariantViolation { .. })
            ));
        }
    }
}
