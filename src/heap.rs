use std::ptr::{self, NonNull};

use crate::{
    arena::{ArenaSource, BreakArena},
    collector,
    config::HeapConfig,
    error::{Error, Result},
    freelist::FreeList,
    header::{self, Header, UNIT},
    roots::{ProcessRoots, RootSource},
    stack,
    used::UsedList,
};

/// Counters kept by a [`Heap`] over its lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Successful arena growths.
    pub growths: usize,
    /// Bytes obtained from the arena.
    pub grown_bytes: usize,
    /// Successful allocations.
    pub allocations: usize,
    /// Collection cycles that ran (a cycle on an empty used list does not).
    pub collections: usize,
    /// Blocks returned to the free list by all sweeps.
    pub reclaimed_blocks: usize,
    /// Bytes returned to the free list by all sweeps, headers included.
    pub reclaimed_bytes: usize,
    /// Blocks currently on the used list.
    pub live_blocks: usize,
}

/// A garbage collected heap.
///
/// Memory comes from an [`ArenaSource`] and is handed out by a first fit
/// free list allocator. There is no way to free a block: a block is reclaimed
/// by [`Heap::collect`] once no root, and no block reachable from a root,
/// holds an address inside its payload.
///
/// ```text
///                 allocate                          collect
///  +-----------+  ------->  +-----------+  -------------------------+
///  | Free list |            | Used list |    unmarked blocks        |
///  +-----------+  <-------  +-----------+  <------------------------+
///        ^        (sweep + coalesce)
///        | grow
///  +-----------+
///  |   Arena   |
///  +-----------+
/// ```
///
/// The heap is single threaded. The stack it scans is the one of the thread
/// that initialized it, which is also the only thread that can use it.
pub struct Heap<A: ArenaSource = BreakArena> {
    arena: A,
    config: HeapConfig,
    free: FreeList,
    used: UsedList,
    /// Cached once by [`Heap::init`]; `Some` means initialized.
    stack_base: Option<usize>,
    stats: HeapStats,
}

impl Heap<BreakArena> {
    /// A heap growing the program break, with the default configuration.
    pub fn new() -> Self {
        Self::with_arena(BreakArena::new(), HeapConfig::default())
    }
}

impl Default for Heap<BreakArena> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: ArenaSource> Heap<A> {
    /// Creates an uninitialized heap over `arena`. Nothing is requested from
    /// the arena until the first allocation.
    pub fn with_arena(arena: A, config: HeapConfig) -> Self {
        Self {
            arena,
            config,
            free: FreeList::new(),
            used: UsedList::new(),
            stack_base: None,
            stats: HeapStats::default(),
        }
    }

    /// Validates the configuration and discovers the stack base. Calling it
    /// again once it succeeded does nothing.
    ///
    /// [`Heap::allocate`] initializes the heap on first use, so calling this
    /// is only needed to surface an initialization error early.
    pub fn init(&mut self) -> Result<()> {
        if self.stack_base.is_some() {
            return Ok(());
        }

        self.config.validate()?;
        let base = stack::discover()?;

        log::debug!("Heap initialized, stack base at {:#x}", base);

        self.stack_base = Some(base);
        Ok(())
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.stack_base.is_some()
    }

    /// Allocates at least `size` bytes and returns the address of the payload.
    ///
    /// The payload is [`UNIT`] aligned and its content is unspecified. It stays
    /// valid until a collection finds it unreachable. A size of zero is served
    /// like a one byte request.
    ///
    /// When no free block fits, the arena is grown once by at least the request
    /// (and at least [`HeapConfig::min_growth_units`] units) and the search is
    /// retried. If growth fails the request fails with [`Error::OutOfMemory`].
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.init()?;

        let units = header::units_for(size).ok_or(Error::RequestTooLarge { size })?;
        let mut grown = false;

        let block = loop {
            // SAFETY: the free list only ever holds blocks carved from arena spans.
            if let Some(block) = unsafe { self.free.take(units)? } {
                break block;
            }

            if grown {
                // The fresh span was large enough, so the list is inconsistent.
                return Err(Error::InvariantViolation {
                    detail: "grown arena span not found on the free list",
                });
            }

            self.grow(units, size)?;
            grown = true;
        };

        unsafe { self.used.push(block) };

        self.stats.allocations += 1;
        self.stats.live_blocks = self.used.len();

        let addr = header::payload(block.as_ptr());

        log::trace!("Allocated {} bytes ({} units) at {:p}", size, units, addr);

        // SAFETY: payload of a non null header
        Ok(unsafe { NonNull::new_unchecked(addr) })
    }

    /// Grows the arena by `max(units, min_growth_units)` units and puts the new
    /// span on the free list.
    fn grow(&mut self, units: u32, requested: usize) -> Result<()> {
        let units = (units as usize).max(self.config.min_growth_units);
        let len = units
            .checked_mul(UNIT)
            .ok_or(Error::OutOfMemory { requested })?;

        let Some(addr) = self.arena.grow(len) else {
            log::warn!(
                "Arena growth of {} bytes failed, cannot allocate {} bytes",
                len,
                requested
            );
            return Err(Error::OutOfMemory { requested });
        };

        if addr.as_ptr() as usize % UNIT != 0 {
            return Err(Error::InvariantViolation {
                detail: "arena returned a span that is not unit aligned",
            });
        }

        let block = addr.cast::<Header>();

        unsafe {
            ptr::write(
                block.as_ptr(),
                Header {
                    // `units` is bounded by both the request and the validated config.
                    size: units as u32,
                    mark: false,
                    link: ptr::null_mut(),
                },
            );

            self.free.insert(block)?;
        }

        self.stats.growths += 1;
        self.stats.grown_bytes += len;

        log::debug!(
            "Arena grown by {} bytes at {:p}, {} free blocks",
            len,
            addr,
            self.free.len()
        );

        Ok(())
    }

    /// Runs one full collection over the process roots: the static data segment
    /// and the stack of the calling thread, as enabled by the configuration.
    ///
    /// Any block whose payload is not reachable from them, directly or through
    /// other blocks, is reclaimed and must not be used afterwards.
    pub fn collect(&mut self) {
        let Some(base) = self.stack_base else {
            // Nothing was ever allocated
            return;
        };

        // SAFETY: `init` discovered the base on the thread that owns the heap.
        let mut roots = unsafe { ProcessRoots::new(base) }
            .scan_static(self.config.scan_static)
            .scan_stack(self.config.scan_stack);

        self.collect_with(&mut roots);
    }

    /// Runs one full collection using `roots` as the root set.
    ///
    /// # Panics
    ///
    /// If the free list turns out to be corrupted while reclaiming. The heap
    /// cannot be used safely after that.
    pub fn collect_with<R: RootSource + ?Sized>(&mut self, roots: &mut R) {
        if self.used.is_empty() {
            log::trace!("Collection skipped, no block in use");
            return;
        }

        // SAFETY: the used list only holds blocks handed out by `allocate`, all
        // unmarked outside of a cycle.
        let marked = unsafe { collector::mark(&self.used, roots) };

        let sweep = match unsafe { collector::sweep(&mut self.used, &mut self.free) } {
            Ok(sweep) => sweep,
            Err(err) => {
                log::error!("Collection aborted: {}", err);
                panic!("heap corrupted during collection: {err}");
            }
        };

        self.stats.collections += 1;
        self.stats.reclaimed_blocks += sweep.reclaimed_blocks;
        self.stats.reclaimed_bytes += sweep.reclaimed_units * UNIT;
        self.stats.live_blocks = sweep.survivors;

        log::debug!(
            "Collection #{}: {} marked, {} reclaimed ({} bytes), {} free blocks",
            self.stats.collections,
            marked,
            sweep.reclaimed_blocks,
            sweep.reclaimed_units * UNIT,
            self.free.len()
        );
    }

    /// Lifetime counters of this heap.
    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn arena(&self) -> &A {
        &self.arena
    }

    /// Stack base used by [`Heap::collect`], once initialized.
    pub fn stack_base(&self) -> Option<usize> {
        self.stack_base
    }

    /// Number of blocks currently handed out.
    pub fn used_blocks(&self) -> usize {
        self.used.len()
    }

    /// Number of entries on the free list.
    pub fn free_blocks(&self) -> usize {
        self.free.len()
    }

    /// Free blocks as `(address, size in bytes)` pairs, headers included, in
    /// free list order.
    pub fn free_spans(&self) -> Vec<(usize, usize)> {
        self.free
            .spans()
            .map(|span| (span.addr, span.units as usize * UNIT))
            .collect()
    }

    /// Size in bytes, header included, of the largest free block.
    pub fn largest_free(&self) -> usize {
        self.free.largest() as usize * UNIT
    }

    /// Whether `addr` points inside the payload of a block currently handed out.
    pub fn is_allocated(&self, addr: *const u8) -> bool {
        let addr = addr as usize;

        self.used.iter().any(|block| {
            let (start, end) = unsafe { header::payload_span(block.as_ptr()) };
            start <= addr && addr < end
        })
    }

    /// Usable size of the block whose payload starts at `addr`.
    ///
    /// Returns `None` if `addr` is not the start of a block handed out by this heap.
    pub fn usable_size(&self, addr: *const u8) -> Option<usize> {
        let block = header::from_payload(addr.cast_mut());

        self.used
            .iter()
            .find(|candidate| candidate.as_ptr() == block)
            .map(|block| unsafe { (block.as_ref().size as usize - 1) * UNIT })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{arena::ReservedArena, roots::RangeRoots};

    fn heap(capacity: usize) -> Heap<ReservedArena> {
        let _ = env_logger::builder().is_test(true).try_init();

        let arena = ReservedArena::new(capacity).unwrap();
        Heap::with_arena(arena, HeapConfig::default())
    }

    #[test]
    fn init_is_idempotent() {
        let mut heap = heap(64 * 1024);

        assert!(!heap.is_initialized());
        heap.init().unwrap();
        let base = heap.stack_base();
        heap.init().unwrap();

        assert!(heap.is_initialized());
        assert_eq!(base, heap.stack_base());
    }

    #[test]
    fn invalid_config_fails_init() {
        let arena = ReservedArena::new(4096).unwrap();
        let config = HeapConfig {
            min_growth_units: 0,
            ..HeapConfig::default()
        };
        let mut heap = Heap::with_arena(arena, config);

        assert!(matches!(heap.allocate(8), Err(Error::InvalidConfig(_))));
        assert!(!heap.is_initialized());
    }

    #[test]
    fn allocation_round_trip() {
        let mut heap = heap(64 * 1024);

        for size in [1, 7, 16, 40, 100, 1000] {
            let addr = heap.allocate(size).unwrap();
            assert_eq!(0, addr.as_ptr() as usize % UNIT);
            assert!(heap.usable_size(addr.as_ptr()).unwrap() >= size);

            unsafe {
                for i in 0..size {
                    addr.as_ptr().add(i).write(i as u8);
                }
                for i in 0..size {
                    assert_eq!(i as u8, *addr.as_ptr().add(i));
                }
            }
        }

        assert_eq!(6, heap.used_blocks());
        assert_eq!(1, heap.stats().growths);
    }

    #[test]
    fn zero_sized_requests_get_a_unit() {
        let mut heap = heap(64 * 1024);

        let addr = heap.allocate(0).unwrap();
        assert_eq!(Some(UNIT), heap.usable_size(addr.as_ptr()));
    }

    #[test]
    fn allocations_do_not_overlap() {
        let mut heap = heap(64 * 1024);
        let mut spans = Vec::new();

        for size in [24, 8, 64, 8, 200] {
            let addr = heap.allocate(size).unwrap().as_ptr() as usize;
            spans.push((addr, addr + size));
        }

        spans.sort();
        assert!(spans.windows(2).all(|pair| pair[0].1 <= pair[1].0));
    }

    #[test]
    fn growth_is_at_least_the_floor() {
        let mut heap = heap(64 * 1024);

        heap.allocate(8).unwrap();

        assert_eq!(1024 * UNIT, heap.stats().grown_bytes);
        // The rest of the span is one free block
        assert_eq!(1, heap.free_blocks());
        assert_eq!(1022 * UNIT, heap.largest_free());
    }

    #[test]
    fn large_requests_grow_by_their_own_size() {
        let mut heap = heap(1024 * 1024);
        let size = 4096 * UNIT;

        heap.allocate(size).unwrap();

        assert_eq!(1, heap.stats().growths);
        assert_eq!((4096 + 1) * UNIT, heap.stats().grown_bytes);
        assert_eq!(0, heap.free_blocks());
    }

    #[test]
    fn exhausted_arena_is_out_of_memory() {
        let arena = ReservedArena::new(4096).unwrap();
        let config = HeapConfig {
            min_growth_units: arena.capacity() / UNIT + 1,
            ..HeapConfig::default()
        };
        let mut heap = Heap::with_arena(arena, config);

        assert!(matches!(
            heap.allocate(8),
            Err(Error::OutOfMemory { requested: 8 })
        ));
        assert_eq!(0, heap.stats().growths);
    }

    #[test]
    fn oversized_request_is_rejected() {
        let mut heap = heap(4096);

        assert!(matches!(
            heap.allocate(usize::MAX),
            Err(Error::RequestTooLarge { .. })
        ));
    }

    #[test]
    fn collect_on_empty_heap_is_a_no_op() {
        let mut heap = heap(4096);

        heap.collect();
        heap.collect_with(&mut RangeRoots::new());

        assert_eq!(0, heap.stats().collections);
    }

    #[test]
    fn unrooted_blocks_are_reclaimed_and_reused() {
        let mut heap = heap(64 * 1024);

        let first = heap.allocate(40).unwrap().as_ptr() as usize;
        heap.collect_with(&mut RangeRoots::new());

        assert_eq!(0, heap.used_blocks());
        assert!(!heap.is_allocated(first as *const u8));
        assert_eq!(1, heap.stats().reclaimed_blocks);

        let second = heap.allocate(40).unwrap().as_ptr() as usize;

        assert_eq!(first, second);
        assert_eq!(1, heap.stats().growths);
    }

    #[test]
    fn rooted_blocks_survive_with_content() {
        let mut heap = heap(64 * 1024);

        let kept = heap.allocate(40).unwrap().cast::<u32>();
        let dropped = heap.allocate(40).unwrap();

        unsafe {
            for i in 0..10 {
                kept.as_ptr().add(i).write(i as u32);
            }
        }

        let root = [kept.as_ptr() as usize];
        let mut roots = RangeRoots::new();
        roots.push_slice(&root);
        heap.collect_with(&mut roots);

        assert!(heap.is_allocated(kept.as_ptr().cast::<u8>()));
        assert!(!heap.is_allocated(dropped.as_ptr()));
        assert_eq!(1, heap.stats().live_blocks);

        unsafe {
            for i in 0..10 {
                assert_eq!(i as u32, *kept.as_ptr().add(i));
            }
        }
    }

    #[test]
    fn survivors_are_unmarked_for_the_next_cycle() {
        let mut heap = heap(64 * 1024);

        let addr = heap.allocate(16).unwrap();
        let root = [addr.as_ptr() as usize];

        let mut roots = RangeRoots::new();
        roots.push_slice(&root);
        heap.collect_with(&mut roots);
        assert!(heap.is_allocated(addr.as_ptr()));

        // Without roots the survivor of the previous cycle is reclaimed
        heap.collect_with(&mut RangeRoots::new());
        assert!(!heap.is_allocated(addr.as_ptr()));
        assert_eq!(2, heap.stats().collections);
    }
}
