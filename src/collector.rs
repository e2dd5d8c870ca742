//! Mark and sweep over the used list.
//!
//! Marking is conservative: every aligned word of every root range is looked
//! up in a [`BlockIndex`] of the used blocks and, when it falls inside a
//! payload, that block is marked and queued. Queued blocks have their own
//! payload scanned the same way until the worklist is empty, which gives
//! reachability through data stored in the heap. A block is queued only when
//! its mark goes from clear to set, so every block is scanned at most once
//! and cycles terminate.
//!
//! Sweeping walks the used list once. Unmarked blocks go back to the free
//! list, where they coalesce with their neighbours. Marked blocks stay and
//! have their mark cleared for the next cycle.

use std::{
    ops::Range,
    ptr::{self, NonNull},
};

use crate::{
    error::Result,
    freelist::FreeList,
    header::{self, Header},
    index::BlockIndex,
    roots::RootSource,
    used::UsedList,
    utils::{word_bounds, WORD_SIZE},
};

/// State of one marking phase.
pub(crate) struct Marker {
    index: BlockIndex,
    worklist: Vec<NonNull<Header>>,
    marked: usize,
}

impl Marker {
    /// **SAFETY**: every block on `used` must be valid and unmarked.
    pub unsafe fn new(used: &UsedList) -> Self {
        Self {
            index: unsafe { BlockIndex::build(used) },
            worklist: Vec::new(),
            marked: 0,
        }
    }

    /// Number of blocks marked so far.
    pub fn marked(&self) -> usize {
        self.marked
    }

    /// Treats every aligned word in `range` as a pointer candidate.
    ///
    /// **SAFETY**: `range` must be readable.
    pub unsafe fn scan_range(&mut self, range: Range<usize>) {
        let (start, end) = word_bounds(range.start, range.end);

        for addr in (start..end).step_by(WORD_SIZE) {
            // The range may hold anything, including words nobody initialized.
            let candidate = unsafe { ptr::read_volatile(addr as *const usize) };
            self.consider(candidate);
        }
    }

    /// Marks and queues the block whose payload contains `candidate`, unless
    /// it is already marked.
    #[inline]
    fn consider(&mut self, candidate: usize) {
        let Some(block) = self.index.lookup(candidate) else {
            return;
        };

        unsafe {
            let header = &mut *block.as_ptr();

            if !header.mark {
                header.mark = true;
                self.marked += 1;
                self.worklist.push(block);
            }
        }
    }

    /// Scans the payload of queued blocks until no new block is found.
    ///
    /// **SAFETY**: every block in the index must be valid.
    pub unsafe fn drain(&mut self) {
        while let Some(block) = self.worklist.pop() {
            let (start, end) = unsafe { header::payload_span(block.as_ptr()) };

            unsafe { self.scan_range(start..end) };
        }
    }
}

/// Marks every used block reachable from `roots`, directly or through other
/// used blocks. Returns the number of marked blocks.
///
/// **SAFETY**: every block on `used` must be valid and unmarked, and `roots`
/// must only report readable ranges.
pub(crate) unsafe fn mark<R: RootSource + ?Sized>(used: &UsedList, roots: &mut R) -> usize {
    let mut marker = unsafe { Marker::new(used) };

    log::trace!("Marking over {} used blocks", marker.index.len());

    roots.visit_ranges(&mut |range| unsafe { marker.scan_range(range) });

    unsafe { marker.drain() };

    marker.marked()
}

/// What a sweep gave back.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Sweep {
    pub reclaimed_blocks: usize,
    pub reclaimed_units: usize,
    pub survivors: usize,
}

/// Releases every unmarked block of `used` to `free` and clears the mark of
/// the others.
///
/// **SAFETY**: both lists must only hold valid blocks.
pub(crate) unsafe fn sweep(used: &mut UsedList, free: &mut FreeList) -> Result<Sweep> {
    let mut outcome = Sweep::default();
    let mut reclaimed_units = 0;

    unsafe {
        used.retain(
            |block| {
                if block.mark {
                    block.mark = false;
                    return true;
                }

                false
            },
            |block| {
                let units = block.as_ref().size as usize;

                log::trace!(
                    "Reclaiming block at {:p} ({} units)",
                    block.as_ptr(),
                    units
                );

                reclaimed_units += units;
                outcome.reclaimed_blocks += 1;

                free.insert(block)
            },
        )?;
    }

    outcome.reclaimed_units = reclaimed_units;
    outcome.survivors = used.len();

    Ok(outcome)
}
