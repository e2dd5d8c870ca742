//! GC root discovery.
//!
//! Roots are address ranges whose every aligned word is treated as a possible
//! pointer into the heap. The process root set is made of:
//! - The static data segment (initialized data and BSS)
//! - The live part of the stack, from the stack pointer at collection time up
//!   to the stack base, with callee saved registers spilled onto it

use std::{marker::PhantomData, ops::Range, ptr};

use crate::{error::Result, stack};

/// Consumers implement this to provide GC roots.
///
/// Called once per collection, before any block is swept.
///
/// # Safety
///
/// Every range handed to `visit` must be readable for its whole length while
/// the call lasts. The collector reads each aligned word of it.
pub unsafe trait RootSource {
    fn visit_ranges(&mut self, visit: &mut dyn FnMut(Range<usize>));
}

/// Explicit set of root ranges.
///
/// Useful when the roots of a program live somewhere the process scan does not
/// see, and for deterministic tests. Ranges added through [`RangeRoots::push_slice`]
/// borrow their memory, so it outlives the collection.
#[derive(Debug, Default)]
pub struct RangeRoots<'a> {
    ranges: Vec<Range<usize>>,
    marker: PhantomData<&'a [u8]>,
}

impl<'a> RangeRoots<'a> {
    pub fn new() -> Self {
        Self {
            ranges: Vec::new(),
            marker: PhantomData,
        }
    }

    /// Adds the memory of `slice` as a root range.
    pub fn push_slice<T>(&mut self, slice: &'a [T]) -> &mut Self {
        let range = slice.as_ptr_range();
        self.ranges.push(range.start as usize..range.end as usize);
        self
    }

    /// Adds a raw address range.
    ///
    /// # Safety
    ///
    /// `range` must stay readable for as long as these roots are used.
    pub unsafe fn push_range(&mut self, range: Range<usize>) -> &mut Self {
        self.ranges.push(range);
        self
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

// SAFETY: slices are borrowed for `'a`, raw ranges are vouched for by `push_range`.
unsafe impl RootSource for RangeRoots<'_> {
    fn visit_ranges(&mut self, visit: &mut dyn FnMut(Range<usize>)) {
        for range in &self.ranges {
            visit(range.clone());
        }
    }
}

/// Root set of the running process: static data and the calling thread's stack.
#[derive(Debug, Clone)]
pub struct ProcessRoots {
    stack_base: usize,
    scan_static: bool,
    scan_stack: bool,
}

impl ProcessRoots {
    /// Roots of the calling thread, with its stack base discovered now.
    pub fn current() -> Result<Self> {
        let base = stack::discover()?;

        // SAFETY: discovered for this thread
        Ok(unsafe { Self::new(base) })
    }

    /// Roots bounded by `stack_base`.
    ///
    /// # Safety
    ///
    /// `stack_base` must be the stack base of the thread that will run the
    /// collection, as returned by [`crate::discover_stack_base`] on it.
    pub unsafe fn new(stack_base: usize) -> Self {
        Self {
            stack_base,
            scan_static: true,
            scan_stack: true,
        }
    }

    pub fn scan_static(mut self, yes: bool) -> Self {
        self.scan_static = yes;
        self
    }

    pub fn scan_stack(mut self, yes: bool) -> Self {
        self.scan_stack = yes;
        self
    }
}

// SAFETY: the static segment is mapped for the process lifetime and the stack
// range is live below the frame of `with_stack_top`.
unsafe impl RootSource for ProcessRoots {
    fn visit_ranges(&mut self, visit: &mut dyn FnMut(Range<usize>)) {
        if self.scan_static {
            match static_segment() {
                Some(range) => visit(range),
                None => log::warn!("Static data segment bounds unknown on this target"),
            }
        }

        if self.scan_stack {
            let base = self.stack_base;
            with_stack_top(&mut |top| visit(stack_range(top, base)));
        }
    }
}

/// Normalizes the stack between `top` and `base` to `lower..upper`, whichever
/// way the stack grows.
pub(crate) fn stack_range(top: usize, base: usize) -> Range<usize> {
    top.min(base)..top.max(base)
}

/// Calls `f` with the current stack top, after spilling the callee saved
/// registers into this frame so that pointers only held in registers are
/// inside the scanned range. The frame stays alive until `f` returns.
#[inline(never)]
fn with_stack_top(f: &mut dyn FnMut(usize)) {
    let registers = spill_registers();
    let top = ptr::addr_of!(registers) as usize;

    f(top);

    std::hint::black_box(&registers);
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn spill_registers() -> [usize; 6] {
    let mut registers = [0usize; 6];

    unsafe {
        std::arch::asm!(
            "mov [{0}], rbx",
            "mov [{0} + 8], rbp",
            "mov [{0} + 16], r12",
            "mov [{0} + 24], r13",
            "mov [{0} + 32], r14",
            "mov [{0} + 40], r15",
            in(reg) registers.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }

    registers
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn spill_registers() -> [usize; 12] {
    let mut registers = [0usize; 12];

    unsafe {
        std::arch::asm!(
            "stp x19, x20, [{0}]",
            "stp x21, x22, [{0}, #16]",
            "stp x23, x24, [{0}, #32]",
            "stp x25, x26, [{0}, #48]",
            "stp x27, x28, [{0}, #64]",
            "str x29, [{0}, #80]",
            in(reg) registers.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }

    registers
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
fn spill_registers() -> [usize; 1] {
    [0]
}

/// Bounds of the writable static data of the executable, `.data` through `.bss`.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn static_segment() -> Option<Range<usize>> {
    // Defined by the C runtime start files and the linker respectively.
    unsafe extern "C" {
        safe static __data_start: u8;
        safe static _end: u8;
    }

    let start = ptr::addr_of!(__data_start) as usize;
    let end = ptr::addr_of!(_end) as usize;

    (start < end).then_some(start..end)
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn static_segment() -> Option<Range<usize>> {
    None
}
