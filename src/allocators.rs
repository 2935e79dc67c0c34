//! Allocator front ends, generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded heap manager exposing the classic
//! allocation surface (`malloc`/`free`/`realloc`/`calloc`) over a [`Heap`].
//! Because it is not thread-safe, it cannot be used as the global allocator
//! directly.
//!
//! ### [`UnixAllocator`](struct.UnixAllocator.html)
//!
//! A `UnixAllocator` wraps `RawAlloc` in a spin lock to make it thread-safe,
//! allowing it to be used as the global allocator, and pairs it with a
//! platform extender for its underlying memory.
//!
//! ### [`HeapExtender`](trait.HeapExtender.html)
//!
//! `HeapExtender` abstracts the sbrk-style call that hands the heap more
//! memory. It can only grow a single contiguous region.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a fixed array pretending to be a growable heap, implementing
//! `HeapExtender` for tests and demos.

use core::alloc::{GlobalAlloc, Layout};
use core::mem::MaybeUninit;
use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};

#[cfg(feature = "use_libc")]
use errno::Errno;
use spin::{Mutex, MutexGuard};

use crate::blocks::ALIGNMENT;
use crate::heap::{Heap, Stats, Validity};
#[cfg(not(feature = "use_libc"))]
use crate::unix::{self, mmap, MmapError};

/// The sbrk-like primitive the heap draws memory from.
pub trait HeapExtender {
    type Err;

    /// Append exactly `size` bytes to the managed region and return the
    /// address of the first new byte.
    ///
    /// # Safety
    ///
    /// For the heap built on top of this to function:
    ///
    /// - every successful call must return memory contiguous with all
    ///   previously returned memory (the region only grows);
    /// - the new bytes must be readable, writable, initialized, and owned by
    ///   nothing else;
    /// - a failed call must leave the region unchanged.
    unsafe fn extend(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;
}

/// Grows the heap with `libc::sbrk`, the classic program-break extender.
///
/// Contiguity holds only while nothing else in the process moves the break.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct LibcBrkExtender {
    // Just for tracking, not really needed
    growths: usize,
}

#[cfg(feature = "use_libc")]
impl HeapExtender for LibcBrkExtender {
    type Err = Errno;

    unsafe fn extend(&mut self, size: usize) -> Result<NonNull<u8>, Errno> {
        if size > isize::MAX as usize {
            return Err(Errno(libc::ENOMEM));
        }
        let prev = libc::sbrk(size as libc::intptr_t);
        if prev as isize == -1 {
            return Err(errno::errno());
        }
        self.growths += 1;
        match NonNull::new(prev as *mut u8) {
            Some(ptr) => Ok(ptr),
            None => Err(Errno(libc::ENOMEM)),
        }
    }
}

/// Grows the heap inside a single large anonymous mapping.
///
/// `mmap` places pages wherever it likes, so calling it per growth cannot
/// satisfy the contiguity contract. Instead one big reservation is mapped up
/// front and handed out in exact-size slices.
#[cfg(not(feature = "use_libc"))]
pub struct MmapReserveExtender {
    region: *mut u8,
    used: usize,
}

/// Address space claimed by the reservation. Untouched pages cost nothing.
#[cfg(not(feature = "use_libc"))]
const RESERVATION: usize = 1 << 30;

#[cfg(not(feature = "use_libc"))]
impl Default for MmapReserveExtender {
    fn default() -> Self {
        MmapReserveExtender {
            region: null_mut(),
            used: 0,
        }
    }
}

// The region pointer is owned by this extender alone.
#[cfg(not(feature = "use_libc"))]
unsafe impl Send for MmapReserveExtender {}

#[cfg(not(feature = "use_libc"))]
impl HeapExtender for MmapReserveExtender {
    type Err = MmapError;

    unsafe fn extend(&mut self, size: usize) -> Result<NonNull<u8>, MmapError> {
        if self.region.is_null() {
            self.region = mmap(
                null_mut(),
                RESERVATION,
                unix::PROT_WRITE | unix::PROT_READ,
                unix::MAP_ANON | unix::MAP_PRIVATE,
                -1,
                0,
            )?;
        }
        if size > RESERVATION - self.used {
            return Err(MmapError(unix::ENOMEM));
        }
        let ptr = NonNull::new_unchecked(self.region.add(self.used));
        self.used += size;
        Ok(ptr)
    }
}

/// A raw allocator: grows the heap on demand, hands out payload pointers,
/// and recycles freed blocks.
///
/// Note: it never returns memory to the OS; that is not implemented.
pub struct RawAlloc<E> {
    pub extender: E,
    heap: Option<Heap>,
}

impl<E: HeapExtender + Default> Default for RawAlloc<E> {
    fn default() -> Self {
        RawAlloc {
            extender: E::default(),
            heap: None,
        }
    }
}

impl<E: HeapExtender> RawAlloc<E> {
    /// Create a new `RawAlloc`. The heap itself is laid out lazily on the
    /// first allocation.
    pub fn new(extender: E) -> Self {
        RawAlloc {
            extender,
            heap: None,
        }
    }

    /// Get statistics on this allocator, and verify the heap's invariants.
    pub fn stats(&self) -> (Validity, Stats) {
        match &self.heap {
            Some(heap) => heap.check(),
            None => Default::default(),
        }
    }

    /// The underlying heap, once anything has been allocated.
    pub fn heap(&self) -> Option<&Heap> {
        self.heap.as_ref()
    }

    unsafe fn parts(&mut self) -> Option<(&mut Heap, &mut E)> {
        if self.heap.is_none() {
            self.heap = Heap::init(&mut self.extender).ok();
        }
        match self.heap.as_mut() {
            Some(heap) => Some((heap, &mut self.extender)),
            None => None,
        }
    }

    /// Allocate `size` bytes. Null on zero-size requests and on exhaustion.
    ///
    /// # Safety
    ///
    /// The returned memory is uninitialized raw bytes; see `GlobalAlloc`.
    pub unsafe fn malloc(&mut self, size: usize) -> *mut u8 {
        match self.parts() {
            Some((heap, extender)) => heap.malloc(extender, size),
            None => null_mut(),
        }
    }

    /// Free an allocation. Null is a safe no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer this allocator returned that has not
    /// been freed since.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if let Some(heap) = self.heap.as_mut() {
            heap.free(ptr);
        }
    }

    /// Resize an allocation. With a null `ptr` this allocates; with a zero
    /// `size` it frees and returns null. On failure the original block is
    /// untouched and null is returned.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Self::free) for `ptr`.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        match self.parts() {
            Some((heap, extender)) => heap.realloc(extender, ptr, size),
            None => null_mut(),
        }
    }

    /// Allocate a zero-filled array of `nmemb` elements of `size` bytes
    /// each. Null on overflow or exhaustion.
    ///
    /// # Safety
    ///
    /// See [`malloc`](Self::malloc).
    pub unsafe fn calloc(&mut self, nmemb: usize, size: usize) -> *mut u8 {
        match self.parts() {
            Some((heap, extender)) => heap.calloc(extender, nmemb, size),
            None => null_mut(),
        }
    }
}

/// A thread-safe allocator, using a spin lock around a RawAlloc.
///
/// Thread-safety is required for an allocator to be used as a global
/// allocator, so that was easy to add with a spin lock.
///
/// The lock itself has to be built lazily: a `const fn new()` cannot
/// construct the inner mutex, so the first caller does, guarded by a
/// three-state flag.
pub struct GenericAllocator<E> {
    state: AtomicU8,
    raw: MaybeUninit<Mutex<RawAlloc<E>>>,
}

// States of the lazy-init flag.
const EMPTY: u8 = 0;
const BUILDING: u8 = 1;
const READY: u8 = 2;

impl<E: HeapExtender + Default> Default for GenericAllocator<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> GenericAllocator<E> {
    pub const fn new() -> Self {
        GenericAllocator {
            state: AtomicU8::new(EMPTY),
            raw: MaybeUninit::uninit(),
        }
    }

    /// Spin until the winner of the init race has published the mutex.
    fn wait_ready(&self) {
        while self.state.load(Ordering::SeqCst) != READY {
            core::hint::spin_loop();
        }
    }
}

impl<E: HeapExtender + Default> GenericAllocator<E> {
    /// Get a reference to the underlying RawAlloc.
    ///
    /// # Safety
    ///
    /// This blocks all allocation for as long as the guard is held.
    pub unsafe fn get_raw(&self) -> MutexGuard<RawAlloc<E>> {
        // Exactly one caller moves EMPTY to BUILDING and writes the mutex;
        // everyone who loses the race spins until it is published. SeqCst
        // throughout: one-time setup is not worth a weaker ordering.
        let won = self
            .state
            .compare_exchange(EMPTY, BUILDING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            let slot = self.raw.as_ptr() as *mut Mutex<RawAlloc<E>>;
            slot.write(Mutex::new(RawAlloc::default()));
            self.state.store(READY, Ordering::SeqCst);
        } else {
            self.wait_ready();
        }

        (*self.raw.as_ptr()).lock()
    }

    pub fn stats(&self) -> (Validity, Stats) {
        unsafe { self.get_raw().stats() }
    }
}

/// The allocator to install with `#[global_allocator]` on Unix targets.
#[derive(Default)]
pub struct UnixAllocator {
    #[cfg(not(feature = "use_libc"))]
    alloc: GenericAllocator<MmapReserveExtender>,

    #[cfg(feature = "use_libc")]
    alloc: GenericAllocator<LibcBrkExtender>,
}

impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: GenericAllocator::new(),
        }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.alloc.stats()
    }
}

unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Only alignment up to the block alignment is guaranteed.
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.alloc.get_raw().malloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.alloc.get_raw().free(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.alloc.get_raw().realloc(ptr, new_size)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.alloc.get_raw().calloc(1, layout.size())
    }
}

/// Size of the array backing [`ToyHeap`].
pub const TOY_HEAP_SIZE: usize = 256 * 1024;

/// A fixed array that can pretend to be a growable heap. Mainly useful for
/// testing.
#[repr(C, align(16))]
pub struct ToyHeap {
    pub heap: [u8; TOY_HEAP_SIZE],
    pub size: usize,
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap {
            heap: [0; TOY_HEAP_SIZE],
            size: 0,
        }
    }
}

/// The toy heap's array has run out.
#[derive(Debug)]
pub struct ToyHeapExhausted;

impl HeapExtender for ToyHeap {
    type Err = ToyHeapExhausted;

    unsafe fn extend(&mut self, size: usize) -> Result<NonNull<u8>, ToyHeapExhausted> {
        if size > self.heap.len() - self.size {
            return Err(ToyHeapExhausted);
        }
        let ptr = NonNull::new_unchecked(self.heap.as_mut_ptr().add(self.size));
        self.size += size;
        Ok(ptr)
    }
}
