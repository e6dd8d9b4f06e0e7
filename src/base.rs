//! The module of base allocators.
//!
//! See [`BaseAlloc`] for more information.

#[cfg(feature = "base-mmap")]
mod mmap;

use core::{
    alloc::Layout,
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering::*},
};
use std::alloc;

#[cfg(feature = "base-mmap")]
pub use self::mmap::Mmap;
use crate::config::PAGE_SHIFT;

/// The trait of base allocators, i.e. the page reservation collaborator.
///
/// The slab allocator serves itself as a middleware between the runtime and
/// its base allocator. Base allocators are allocating memory at a coarser
/// granularity, usually page-aligned: superblocks, descriptor batches and
/// oversized requests all come from here.
///
/// # Safety
///
/// `allocate` must return a valid & free memory block containing `layout`,
/// zeroed if `IS_ZEROED`, and its address must be aligned to
/// `layout.align()`. Superblock lookup masks addresses with the block size, so
/// a misaligned block corrupts the whole allocator.
pub unsafe trait BaseAlloc: Sized {
    /// Indicates if the base allocator are returning zeroed allocations by
    /// default.
    const IS_ZEROED: bool;

    /// The opaque handle of this allocator, usually its metadata or for RAII
    /// purposes.
    type Handle;
    /// The errors of the base allocator.
    type Error;

    /// Allocate a memory [`Chunk`] of `layout`.
    fn allocate(&self, layout: Layout) -> Result<Chunk<Self>, Self::Error>;

    /// Deallocate a memory [`Chunk`].
    ///
    /// Note that this function doesn't contain a receiver argument, since its
    /// additional information should be contained in the
    /// [`handle`](Chunk::handle) of the chunk.
    ///
    /// # Safety
    ///
    /// - `chunk` must point to a valid & owned memory block containing
    ///   `layout`, previously allocated by this allocator.
    /// - `chunk` must not be used any longer after the deallocation.
    unsafe fn deallocate(chunk: &mut Chunk<Self>);

    /// The granularity of this allocator, from which the superblock sizes are
    /// derived.
    fn page_size(&self) -> usize {
        1 << PAGE_SHIFT
    }
}

/// A base allocator backed by the global allocator of the process.
///
/// Mostly useful for tests and for hosts that already own the page level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct System;

/// The error returned by [`System`] when the global allocator fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocError(pub Layout);

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to reserve {} bytes", self.0.size())
    }
}

unsafe impl BaseAlloc for System {
    const IS_ZEROED: bool = true;

    type Handle = ();

    type Error = AllocError;

    fn allocate(&self, layout: Layout) -> Result<Chunk<Self>, Self::Error> {
        if layout.size() == 0 {
            return Err(AllocError(layout));
        }
        // SAFETY: `layout` is not zero-sized.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(AllocError(layout))?;
        // SAFETY: `ptr` is freshly allocated with `layout`.
        Ok(unsafe { Chunk::new(ptr, layout, ()) })
    }

    unsafe fn deallocate(chunk: &mut Chunk<Self>) {
        // SAFETY: The chunk was allocated by `alloc_zeroed` with the same layout.
        unsafe { alloc::dealloc(chunk.ptr.as_ptr(), chunk.layout) }
    }
}

/// A base allocator wrapper counting reservations and releases.
///
/// The counters are shared by every chunk allocated through the wrapper, so
/// they stay accurate no matter which thread releases a chunk.
#[derive(Debug)]
pub struct Counting<B> {
    base: B,
    counter: &'static Counter,
}

/// The reservation counters of a [`Counting`] base allocator.
#[derive(Debug, Default)]
pub struct Counter {
    reserved: AtomicUsize,
    released: AtomicUsize,
    reserved_bytes: AtomicUsize,
    released_bytes: AtomicUsize,
}

impl Counter {
    /// Creates a new set of counters.
    pub const fn new() -> Self {
        Counter {
            reserved: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            reserved_bytes: AtomicUsize::new(0),
            released_bytes: AtomicUsize::new(0),
        }
    }

    /// The number of successful reservations so far.
    pub fn reserved(&self) -> usize {
        self.reserved.load(Acquire)
    }

    /// The number of releases so far.
    pub fn released(&self) -> usize {
        self.released.load(Acquire)
    }

    /// The number of chunks currently reserved.
    pub fn outstanding(&self) -> usize {
        self.reserved() - self.released()
    }

    /// The number of bytes currently reserved.
    pub fn outstanding_bytes(&self) -> usize {
        self.reserved_bytes.load(Acquire) - self.released_bytes.load(Acquire)
    }
}

impl<B> Counting<B> {
    /// Wraps `base`, recording into `counter`.
    pub const fn new(base: B, counter: &'static Counter) -> Self {
        Counting { base, counter }
    }

    /// Retrieves the counters of this allocator.
    pub fn counter(&self) -> &'static Counter {
        self.counter
    }
}

/// The handle of chunks allocated by [`Counting`].
pub struct CountingHandle<B: BaseAlloc> {
    inner: Option<Chunk<B>>,
    counter: &'static Counter,
}

unsafe impl<B: BaseAlloc> BaseAlloc for Counting<B> {
    const IS_ZEROED: bool = B::IS_ZEROED;

    type Handle = CountingHandle<B>;

    type Error = B::Error;

    fn allocate(&self, layout: Layout) -> Result<Chunk<Self>, Self::Error> {
        let inner = self.base.allocate(layout)?;
        self.counter.reserved.fetch_add(1, AcqRel);
        self.counter.reserved_bytes.fetch_add(layout.size(), AcqRel);

        let ptr = inner.ptr;
        let handle = CountingHandle {
            inner: Some(inner),
            counter: self.counter,
        };
        // SAFETY: The inner chunk owns the memory, and is owned by the handle.
        Ok(unsafe { Chunk::new(ptr, layout, handle) })
    }

    unsafe fn deallocate(chunk: &mut Chunk<Self>) {
        let counter = chunk.handle.counter;
        counter.released.fetch_add(1, AcqRel);
        counter.released_bytes.fetch_add(chunk.layout.size(), AcqRel);
        // Dropping the inner chunk releases the memory.
        drop(chunk.handle.inner.take());
    }

    fn page_size(&self) -> usize {
        self.base.page_size()
    }
}

/// An owned representation of a valid memory block. Implementations like
/// `Clone` and `Copy` are banned for its unique ownership.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Chunk<B: BaseAlloc> {
    ptr: NonNull<u8>,
    layout: Layout,
    pub handle: B::Handle,
}

unsafe impl<B: BaseAlloc> Send for Chunk<B> where B::Handle: Send {}
unsafe impl<B: BaseAlloc> Sync for Chunk<B> where B::Handle: Sync {}

impl<B: BaseAlloc> Chunk<B> {
    /// Creates a memory chunk manually. This function should only be used by an
    /// implementation of a base allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must points to a valid & owned block of memory of `layout`, and
    /// must be allocated from the base allocator owning `handle`.
    pub unsafe fn new(ptr: NonNull<u8>, layout: Layout, handle: B::Handle) -> Self {
        Chunk { ptr, layout, handle }
    }

    /// Retrieves the layout information of this chunk.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Retrieves the pointer of this chunk.
    pub fn pointer(&self) -> NonNull<u8> {
        self.ptr
    }
}

impl<B: BaseAlloc> Drop for Chunk<B> {
    fn drop(&mut self) {
        // SAFETY: `chunk` points to a valid & owned memory block containing `layout`,
        // previously allocated by this allocator.
        unsafe { B::deallocate(self) }
    }
}
