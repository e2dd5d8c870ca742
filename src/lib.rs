//! A free list allocator with a conservative, stop-the-world, mark-sweep
//! garbage collector.
//!
//! Blocks are never freed explicitly. [`Heap::collect`] treats every aligned
//! word of the static data segment and of the live stack as a possible
//! pointer, marks the blocks those words point into, follows the words stored
//! inside marked blocks, and returns everything left unmarked to the free list.
//!
//! ```no_run
//! use gcalloc::Heap;
//!
//! let mut heap = Heap::new();
//!
//! let array = heap.allocate(10 * size_of::<i32>()).unwrap().cast::<i32>();
//! unsafe {
//!     for i in 0..10 {
//!         array.as_ptr().add(i as usize).write(i);
//!     }
//! }
//!
//! // `array` is on the stack, so it survives.
//! heap.collect();
//! assert_eq!(9, unsafe { *array.as_ptr().add(9) });
//! ```
//!
//! Scanning is conservative: an integer that happens to look like an address
//! inside a block keeps that block alive. Heaps are independent values, so a
//! program (or a test) can run several of them side by side, each with its own
//! [`ArenaSource`].

mod arena;
mod collector;
mod config;
mod error;
mod freelist;
mod header;
mod heap;
mod index;
mod roots;
mod stack;
mod used;
mod utils;

pub use arena::{ArenaSource, BreakArena, ReservedArena};
pub use config::HeapConfig;
pub use error::{Error, Result};
pub use header::UNIT;
pub use heap::{Heap, HeapStats};
pub use roots::{ProcessRoots, RangeRoots, RootSource};

/// Discovers the stack base of the calling thread, the bound [`ProcessRoots`]
/// needs to scan its stack.
pub fn discover_stack_base() -> Result<usize> {
    stack::discover()
}
