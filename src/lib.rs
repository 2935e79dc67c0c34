#![no_std]

//! A segregated-fit memory allocator with optimized boundary tags.
//!
//! The heap is a single contiguous region that only grows, obtained from an
//! sbrk-style [`HeapExtender`]. Every block carries a 4-byte header packing
//! its size with a used bit and a "previous block is free" bit; free blocks
//! additionally carry a footer copy of the header and a pair of 32-bit
//! sibling links, stored as word offsets from the heap base rather than as
//! pointers. That keeps the minimum block at 16 bytes on any pointer width.
//!
//! Free blocks are indexed by nine size classes with best-fit selection
//! inside a class, splitting on placement, and eager coalescing on free.
//! `realloc` grows in place when the neighboring space or the end of the
//! heap allows it, and falls back to allocate-copy-free.
//!
//! [`RawAlloc`] exposes the classic `malloc`/`free`/`realloc`/`calloc`
//! surface for single-threaded use; [`UnixAllocator`] wraps it in a spin
//! lock so it can be installed as the global allocator:
//!
//! ```rust,ignore
//! use segalloc::UnixAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: UnixAllocator = UnixAllocator::new();
//! ```
//!
//! [`Heap::check`] walks every block and every free list, verifying the
//! boundary-tag and index invariants, and [`Heap::dump`] logs the heap's
//! shape through the `log` facade.

pub mod allocators;
pub mod blocks;
pub mod heap;
pub mod seglist;
#[cfg(not(feature = "use_libc"))]
mod unix;

#[cfg(feature = "use_libc")]
pub use allocators::LibcBrkExtender;
#[cfg(not(feature = "use_libc"))]
pub use allocators::MmapReserveExtender;
pub use allocators::{GenericAllocator, HeapExtender, RawAlloc, ToyHeap, UnixAllocator};
pub use blocks::{BlockPtr, ALIGNMENT};
pub use heap::{Heap, Stats, Validity};
