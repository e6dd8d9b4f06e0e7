use core::{
    alloc::Layout,
    fmt, mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering::*},
};

use super::{Descriptor, State};
use crate::{
    base::{BaseAlloc, Chunk},
    config::DESC_BATCH,
    hazard::{HazardDomain, HazardGuard},
};

/// The hazard slot protecting the head of the available list.
pub(crate) const HAZARD_POOL: usize = 1;
/// The hazard slot a freeing thread holds on the descriptor it empties.
pub(crate) const HAZARD_FREE: usize = 0;

/// A block of descriptors reserved at once, living in its own chunk.
#[repr(C)]
struct Batch<B: BaseAlloc> {
    chunk: Chunk<B>,
    next: *mut Batch<B>,
    descs: [Descriptor<B>; DESC_BATCH],
}

/// The lock-free supply of descriptors.
///
/// Available descriptors form a Treiber stack threaded through
/// [`Descriptor::next`]. Popping reads the link of the head, so the head is
/// protected by a hazard pointer, and returned descriptors are retired
/// through the same hazard domain before they become available again.
pub(crate) struct DescriptorPool<B: BaseAlloc> {
    avail: AtomicPtr<Descriptor<B>>,
    batches: AtomicPtr<Batch<B>>,
    batch_count: AtomicUsize,
    hazards: HazardDomain<Descriptor<B>>,
}

// SAFETY: Batches are only freed by the exclusive owner of the pool.
unsafe impl<B: BaseAlloc> Send for DescriptorPool<B> where Chunk<B>: Send {}
unsafe impl<B: BaseAlloc> Sync for DescriptorPool<B> where Chunk<B>: Send {}

impl<B: BaseAlloc> fmt::Debug for DescriptorPool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("batch_count", &self.batch_count())
            .field("hazards", &self.hazards)
            .finish_non_exhaustive()
    }
}

impl<B: BaseAlloc> DescriptorPool<B> {
    pub const fn new() -> Self {
        DescriptorPool {
            avail: AtomicPtr::new(ptr::null_mut()),
            batches: AtomicPtr::new(ptr::null_mut()),
            batch_count: AtomicUsize::new(0),
            hazards: HazardDomain::new(),
        }
    }

    pub fn hazards(&self) -> HazardGuard<'_, Descriptor<B>> {
        self.hazards.acquire()
    }

    /// The number of descriptor batches reserved from the base allocator.
    pub fn batch_count(&self) -> usize {
        self.batch_count.load(Relaxed)
    }

    /// Reserves a fresh batch whose descriptors are linked in order.
    fn reserve_batch(base: &B) -> Result<NonNull<Batch<B>>, B::Error> {
        let chunk = base.allocate(Layout::new::<Batch<B>>())?;
        let batch = chunk.pointer().cast::<Batch<B>>();
        let raw = batch.as_ptr();

        // SAFETY: The chunk holds a `Batch<B>` and is exclusively owned.
        unsafe {
            let descs = (&raw mut (*raw).descs).cast::<Descriptor<B>>();
            for index in 0..DESC_BATCH {
                let desc = descs.add(index);
                desc.write(Descriptor::new());
                if index + 1 < DESC_BATCH {
                    (*desc).next.store(descs.add(index + 1), Relaxed);
                }
            }
            (&raw mut (*raw).next).write(ptr::null_mut());
            (&raw mut (*raw).chunk).write(chunk);
        }
        log!(trace, "reserved a batch of {DESC_BATCH} descriptors at {batch:p}");
        Ok(batch)
    }

    /// Frees a batch that was never published.
    ///
    /// # Safety
    ///
    /// `batch` must be exclusively owned and no descriptor in it may carry a
    /// superblock.
    unsafe fn free_batch(batch: NonNull<Batch<B>>) {
        // SAFETY: The descriptors own nothing, so reading out the chunk and
        // dropping it releases the whole batch.
        drop(unsafe { ptr::read(&raw const (*batch.as_ptr()).chunk) })
    }

    /// Takes an available descriptor, reserving a new batch if there is
    /// none.
    ///
    /// The returned descriptor is empty, marked in use, and exclusively owned
    /// by the caller.
    pub fn acquire(&self, base: &B) -> Result<NonNull<Descriptor<B>>, B::Error> {
        let guard = self.hazards.acquire();
        let desc = loop {
            let head = guard.protect(HAZARD_POOL, &self.avail);
            if let Some(desc) = NonNull::new(head) {
                // SAFETY: The head is protected, so it is not recycled under us
                // even if another thread pops it meanwhile.
                let next = unsafe { desc.as_ref() }.next.load(Acquire);
                if self
                    .avail
                    .compare_exchange(head, next, AcqRel, Acquire)
                    .is_ok()
                {
                    break desc;
                }
                continue;
            }

            let batch = Self::reserve_batch(base)?;
            // SAFETY: The batch is initialized and not yet published.
            let descs = unsafe { &(*batch.as_ptr()).descs };
            let rest = descs
                .get(1)
                .map_or(ptr::null_mut(), |d| ptr::from_ref(d).cast_mut());
            if self
                .avail
                .compare_exchange(ptr::null_mut(), rest, AcqRel, Acquire)
                .is_ok()
            {
                let mut head = self.batches.load(Relaxed);
                loop {
                    // SAFETY: The batch is ours until it is linked.
                    unsafe { (*batch.as_ptr()).next = head };
                    match self.batches.compare_exchange_weak(
                        head,
                        batch.as_ptr(),
                        AcqRel,
                        Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(h) => head = h,
                    }
                }
                self.batch_count.fetch_add(1, Relaxed);
                break NonNull::from(&descs[0]);
            }

            // Another thread refilled the list first.
            log!(debug, "dropping a surplus descriptor batch at {batch:p}");
            // SAFETY: The batch was never published.
            unsafe { Self::free_batch(batch) };
        };
        drop(guard);

        // SAFETY: The descriptor was popped and is owned by us.
        let d = unsafe { desc.as_ref() };
        assert_eq!(
            d.anchor.load().state(),
            State::Empty,
            "an available descriptor must be empty"
        );
        assert!(
            !d.in_use.swap(true, AcqRel),
            "descriptor {desc:p} was acquired twice"
        );
        d.next.store(ptr::null_mut(), Relaxed);
        Ok(desc)
    }

    fn push_avail(&self, desc: NonNull<Descriptor<B>>) {
        // SAFETY: The descriptor is reclaimed, hence owned by us.
        let d = unsafe { desc.as_ref() };
        debug_assert_eq!(d.anchor.load().state(), State::Empty);
        debug_assert!(!d.in_use.load(Relaxed));

        let mut head = self.avail.load(Relaxed);
        loop {
            d.next.store(head, Relaxed);
            match self
                .avail
                .compare_exchange_weak(head, desc.as_ptr(), AcqRel, Relaxed)
            {
                Ok(_) => break,
                Err(h) => head = h,
            }
        }
    }

    /// Returns an empty descriptor, making it available again once no hazard
    /// protects it.
    ///
    /// # Safety
    ///
    /// `desc` must be exclusively owned by the caller, empty, not in use, and
    /// unreachable from any heap or superblock header.
    pub unsafe fn release(&self, desc: NonNull<Descriptor<B>>) {
        // SAFETY: The descriptor is unreachable for new readers.
        unsafe { self.hazards.retire(desc, |desc| self.push_avail(desc)) }
    }

    /// Checks if `desc` is on the available list.
    ///
    /// Only meaningful while no thread allocates or frees.
    pub fn is_available(&self, desc: NonNull<Descriptor<B>>) -> bool {
        let mut cur = self.avail.load(Acquire);
        while let Some(d) = NonNull::new(cur) {
            if d == desc {
                return true;
            }
            // SAFETY: Descriptors are never freed before the pool.
            cur = unsafe { d.as_ref() }.next.load(Acquire);
        }
        false
    }

    /// Iterates every descriptor ever reserved.
    pub fn descriptors(&self) -> impl Iterator<Item = &Descriptor<B>> + '_ {
        let mut cur = self.batches.load(Acquire);
        core::iter::from_fn(move || {
            // SAFETY: Batches are never freed before the pool.
            let batch = unsafe { cur.as_ref() }?;
            cur = batch.next;
            Some(&batch.descs)
        })
        .flatten()
    }
}

impl<B: BaseAlloc> Drop for DescriptorPool<B> {
    fn drop(&mut self) {
        // Deferred descriptors need no recycling, their batches go away.
        self.hazards.drain(drop);

        let mut cur = mem::replace(self.batches.get_mut(), ptr::null_mut());
        while let Some(batch) = NonNull::new(cur) {
            // SAFETY: The pool is exclusively owned, so is every batch.
            unsafe {
                cur = (*batch.as_ptr()).next;
                for desc in &(*batch.as_ptr()).descs {
                    // Superblocks still owned at teardown go back to the base.
                    drop(desc.meta_mut().chunk.take());
                }
                Self::free_batch(batch);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashSet, thread, vec::Vec};

    use super::*;
    use crate::base::System;

    fn release(pool: &DescriptorPool<System>, desc: NonNull<Descriptor<System>>) {
        unsafe {
            desc.as_ref().in_use.store(false, Release);
            pool.release(desc);
        }
    }

    #[test]
    fn batches() {
        let pool = DescriptorPool::<System>::new();
        let descs = (0..DESC_BATCH + 1)
            .map(|_| pool.acquire(&System).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(pool.batch_count(), 2);
        assert_eq!(
            descs.iter().collect::<HashSet<_>>().len(),
            descs.len(),
            "a descriptor was handed out twice"
        );

        let first = descs[0];
        assert!(!pool.is_available(first));
        release(&pool, first);
        assert!(pool.is_available(first));
        assert_eq!(pool.acquire(&System).unwrap(), first);
        assert_eq!(pool.descriptors().count(), DESC_BATCH * 2);
    }

    #[test]
    fn protected_release_is_deferred() {
        let pool = DescriptorPool::<System>::new();
        let desc = pool.acquire(&System).unwrap();

        let guard = pool.hazards();
        guard.set(HAZARD_FREE, desc);
        release(&pool, desc);
        assert!(!pool.is_available(desc));
        drop(guard);

        pool.hazards.try_reclaim(|d| pool.push_avail(d));
        assert!(pool.is_available(desc));
    }

    #[test]
    fn concurrent() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 1000;

        let pool = DescriptorPool::<System>::new();
        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    let mut held = Vec::new();
                    for round in 0..ROUNDS {
                        held.push(pool.acquire(&System).unwrap());
                        if round % 3 == 0 {
                            for desc in held.drain(..) {
                                release(&pool, desc);
                            }
                        }
                    }
                    held.into_iter().for_each(|desc| release(&pool, desc));
                });
            }
        });
        assert!(pool.batch_count() >= 1);
    }
}
