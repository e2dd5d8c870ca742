use std::ptr::NonNull;

use crate::utils::align;

/// This trait provides an abstraction over the OS facility that extends the
/// memory the heap can carve blocks out of. The allocator has nothing to do
/// with how each kernel hands out memory, it only needs a fresh span when its
/// free list runs dry.
///
/// # Safety
///
/// A span returned by [`ArenaSource::grow`] must be readable and writable for
/// `len` bytes, aligned to [`crate::UNIT`], disjoint from every span returned
/// before, and must stay valid for as long as the heap using this source is
/// alive.
pub unsafe trait ArenaSource {
    /// Extends the arena by at least `len` bytes and returns the start of the
    /// new span, or `None` if the underlying syscall fails.
    fn grow(&mut self, len: usize) -> Option<NonNull<u8>>;
}

/// Grows the arena by moving the program break with [`libc::sbrk`].
///
/// Consecutive growths are contiguous unless something else in the process
/// moved the break in between, so the new span usually coalesces with the
/// free tail of the previous one.
#[derive(Debug, Default)]
pub struct BreakArena;

impl BreakArena {
    pub const fn new() -> Self {
        Self
    }
}

/// Hands out spans from a single virtual reservation made up front.
///
/// Spans are contiguous and ascending, and growth fails once the reservation
/// is exhausted. This makes heaps independent of the program break and gives
/// them a hard memory limit.
#[derive(Debug)]
pub struct ReservedArena {
    start: NonNull<u8>,
    capacity: usize,
    used: usize,
}

impl ReservedArena {
    /// Reserves `capacity` bytes, rounded up to the page size. Returns `None`
    /// if the reservation fails.
    pub fn new(capacity: usize) -> Option<Self> {
        let capacity = align(capacity.max(1), page_size());

        unsafe {
            let start = request_memory(capacity)?;

            log::debug!("Reserved arena of {} bytes at {:p}", capacity, start);

            Some(Self {
                start,
                capacity,
                used: 0,
            })
        }
    }

    /// Bytes already handed out.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Total size of the reservation.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `addr` lies inside the reservation.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.start.as_ptr() as usize;
        start <= addr && addr < start + self.capacity
    }
}

// SAFETY: spans are bump allocated from a private mapping released on drop.
unsafe impl ArenaSource for ReservedArena {
    fn grow(&mut self, len: usize) -> Option<NonNull<u8>> {
        let len = align(len, crate::UNIT);

        if len > self.capacity - self.used {
            return None;
        }

        unsafe {
            let addr = NonNull::new_unchecked(self.start.as_ptr().add(self.used));
            self.used += len;

            Some(addr)
        }
    }
}

impl Drop for ReservedArena {
    fn drop(&mut self) {
        unsafe { return_memory(self.start.as_ptr(), self.capacity) }
    }
}

/// Low level memory operations and syscalls of the host.
trait PlatformMemory {
    /// Moves the program break up by `len` bytes and returns the old break.
    unsafe fn move_break(len: usize) -> Option<NonNull<u8>>;

    /// Request a fresh mapping of size `len`.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    unsafe fn return_memory(addr: *mut u8, len: usize);

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;
}

struct Kernel;

#[inline]
unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
    unsafe { Kernel::request_memory(len) }
}

#[inline]
unsafe fn return_memory(addr: *mut u8, len: usize) {
    unsafe { Kernel::return_memory(addr, len) }
}

#[inline]
fn page_size() -> usize {
    unsafe { Kernel::page_size() }
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{c_int, c_void, intptr_t, mmap, munmap, off_t, sbrk, size_t};

    use std::ptr::NonNull;

    impl PlatformMemory for Kernel {
        unsafe fn move_break(len: usize) -> Option<NonNull<u8>> {
            let len = intptr_t::try_from(len).ok()?;

            unsafe {
                let addr = sbrk(len);

                // sbrk signals failure with (void *) -1
                if addr as usize == usize::MAX {
                    return None;
                }

                NonNull::new(addr.cast())
            }
        }

        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                if addr == libc::MAP_FAILED {
                    return None;
                }

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) {
            unsafe {
                munmap(addr as *mut c_void, len as size_t);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(not(unix))]
mod unsupported {
    use super::{Kernel, PlatformMemory};

    use std::ptr::NonNull;

    // No arena can grow on these targets, so every heap reports `OutOfMemory`.
    impl PlatformMemory for Kernel {
        unsafe fn move_break(_len: usize) -> Option<NonNull<u8>> {
            None
        }

        unsafe fn request_memory(_len: usize) -> Option<NonNull<u8>> {
            None
        }

        unsafe fn return_memory(_addr: *mut u8, _len: usize) {}

        unsafe fn page_size() -> usize {
            4096
        }
    }
}

// SAFETY: memory below the program break is never returned to the kernel.
unsafe impl ArenaSource for BreakArena {
    fn grow(&mut self, len: usize) -> Option<NonNull<u8>> {
        let len = align(len, crate::UNIT);

        unsafe {
            // The current break is not necessarily unit aligned. Pad only by
            // what is missing so back to back growths stay contiguous.
            let current = Kernel::move_break(0)?;
            let pad = current.as_ptr().align_offset(crate::UNIT);

            let raw = Kernel::move_break(pad.checked_add(len)?)?;

            Some(NonNull::new_unchecked(raw.as_ptr().add(pad)))
        }
    }
}
