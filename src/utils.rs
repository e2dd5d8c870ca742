//! This file contains the helper functions for the allocator and the collector.
//! They don't particularly belong to any concrete module of the program.

use std::mem;

/// Size of a machine word. Every conservative scan walks memory in steps of this size.
pub(crate) const WORD_SIZE: usize = mem::size_of::<usize>();

/// It aligns `to_be_aligned` up using `aligment`, which must be a power of two.
///
/// Used to round arena requests to whole units and scan bounds to whole words.
pub fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// It aligns `to_be_aligned` down using `aligment`, which must be a power of two.
pub fn align_down(to_be_aligned: usize, aligment: usize) -> usize {
    to_be_aligned & !(aligment - 1)
}

/// Shrinks `lo..hi` to the largest sub range whose bounds are multiples of
/// [`WORD_SIZE`]. The result may be empty.
pub(crate) fn word_bounds(lo: usize, hi: usize) -> (usize, usize) {
    let start = align(lo, WORD_SIZE);
    let end = align_down(hi, WORD_SIZE);

    if start > end { (start, start) } else { (start, end) }
}
