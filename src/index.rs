use std::ptr::NonNull;

use crate::{header::{self, Header}, used::UsedList};

/// Payload span of one used block.
#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
    block: NonNull<Header>,
}

/// Address sorted snapshot of the used list.
///
/// Answers "which used block's payload contains this address" with a binary
/// search instead of a walk over the whole used list for every candidate word.
/// Spans never overlap since blocks never do.
pub(crate) struct BlockIndex {
    spans: Vec<Span>,
    low: usize,
    high: usize,
}

impl BlockIndex {
    /// Builds the index from the current content of `used`.
    ///
    /// **SAFETY**: every block on `used` must be valid.
    pub unsafe fn build(used: &UsedList) -> Self {
        let mut spans: Vec<Span> = used
            .iter()
            .map(|block| {
                let (start, end) = unsafe { header::payload_span(block.as_ptr()) };
                Span { start, end, block }
            })
            .filter(|span| span.start < span.end)
            .collect();

        spans.sort_unstable_by_key(|span| span.start);

        let low = spans.first().map_or(usize::MAX, |span| span.start);
        let high = spans.last().map_or(0, |span| span.end);

        Self { spans, low, high }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Block whose payload span `[start, end)` contains `addr`.
    #[inline]
    pub fn lookup(&self, addr: usize) -> Option<NonNull<Header>> {
        if addr < self.low || addr >= self.high {
            return None;
        }

        // First span starting after `addr`; the candidate is the one before it.
        let after = self.spans.partition_point(|span| span.start <= addr);
        let span = self.spans.get(after.checked_sub(1)?)?;

        (addr < span.end).then_some(span.block)
    }
}
