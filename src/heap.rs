//! Per-size-class heaps and the lock-free allocation algorithm.
//!
//! A descriptor is owned by whoever takes it out of the active slot or the
//! partial queue. Only an owner allocates from a superblock, publishes it,
//! or retires it; any thread may free into it at any time. Every transition
//! of the anchor is a single compare-and-swap, and an empty anchor never
//! becomes non-empty again.

use core::{
    fmt,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering::*},
};

use crossbeam_utils::CachePadded;

use crate::{
    base::BaseAlloc,
    config::CLEANUP_BOUND,
    descriptor::{
        Anchor, Descriptor, State,
        pool::{DescriptorPool, HAZARD_FREE},
    },
    partial::PartialQueue,
    size_class::SizeClass,
    stat::ClassCounters,
    superblock::{self, LINK_SIZE},
    track,
};

pub(crate) struct Heap<B: BaseAlloc> {
    active: CachePadded<AtomicPtr<Descriptor<B>>>,
    partial: PartialQueue<B>,
    class: SizeClass,
    pub counters: ClassCounters,
}

impl<B: BaseAlloc> fmt::Debug for Heap<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("class", &self.class)
            .field("active", &self.active.load(Relaxed))
            .field("partial", &self.partial)
            .finish_non_exhaustive()
    }
}

impl<B: BaseAlloc> Heap<B> {
    pub fn new(class: SizeClass) -> Self {
        Heap {
            active: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            partial: PartialQueue::new(),
            class,
            counters: ClassCounters::default(),
        }
    }

    pub fn class(&self) -> SizeClass {
        self.class
    }

    /// Allocates a slot of this heap's slot size. The slot is not zeroed.
    pub fn allocate(&self, base: &B, pool: &DescriptorPool<B>) -> Result<NonNull<u8>, B::Error> {
        let slot = loop {
            if let Some(slot) = self.alloc_from_active_or_partial(pool) {
                break slot;
            }
            if let Some(slot) = self.alloc_from_new_superblock(base, pool)? {
                break slot;
            }
        };
        ClassCounters::bump(&self.counters.allocations);
        ClassCounters::bump(&self.counters.live_slots);
        track::allocate(slot, self.class.slot_size, false);
        Ok(slot)
    }

    fn alloc_from_active_or_partial(&self, pool: &DescriptorPool<B>) -> Option<NonNull<u8>> {
        'retry: loop {
            let desc = match NonNull::new(self.active.swap(ptr::null_mut(), AcqRel)) {
                Some(desc) => desc,
                None => self.pop_partial(pool)?,
            };
            // SAFETY: We own the descriptor, and it carries a superblock.
            let d = unsafe { desc.as_ref() };
            let meta = d.meta();
            let slots = meta.slots.expect("owned descriptor carries no superblock");

            let mut old = d.anchor.load();
            let (slot, new) = loop {
                match old.state() {
                    State::Empty => {
                        // SAFETY: We own it and every slot has been freed.
                        unsafe { self.retire(desc, pool) };
                        continue 'retry;
                    }
                    state => assert_eq!(
                        state,
                        State::Partial,
                        "owned descriptor {desc:p} must not be full"
                    ),
                }
                assert!(old.count() > 0, "partial descriptor {desc:p} has no free slot");

                let slot = superblock::slot_addr(slots, old.avail(), meta.slot_size);
                // SAFETY: `avail` indexes a free slot of a live superblock, and
                // only owners pop slots.
                let next = unsafe { superblock::read_link(slot) };
                let count = old.count() - 1;
                let new = Anchor::new(
                    next,
                    count,
                    if count == 0 { State::Full } else { State::Partial },
                );
                assert!(
                    count == 0 || next < meta.max_count,
                    "corrupted free list in {desc:p}: next slot {next} of {}",
                    meta.max_count
                );
                match d.anchor.compare_exchange(old, new) {
                    Ok(()) => break (slot, new),
                    Err(cur) => old = cur,
                }
            };

            if new.state() == State::Partial {
                self.publish(desc);
            }
            break Some(slot);
        }
    }

    /// Reserves a fresh superblock and takes its first slot.
    ///
    /// Returns `None` if another thread installed an active descriptor first,
    /// in which case the new superblock is released again.
    #[cold]
    fn alloc_from_new_superblock(
        &self,
        base: &B,
        pool: &DescriptorPool<B>,
    ) -> Result<Option<NonNull<u8>>, B::Error> {
        let desc = pool.acquire(base)?;
        // SAFETY: The descriptor is freshly acquired and exclusively owned.
        let d = unsafe { desc.as_ref() };
        let max_count = self.class.max_count() as u32;

        let (chunk, slots) = match superblock::reserve(base, self.class.block_size, desc) {
            Ok(reserved) => reserved,
            Err(err) => {
                d.in_use.store(false, Release);
                // SAFETY: It is still empty and nobody else can reach it.
                unsafe { pool.release(desc) };
                return Err(err);
            }
        };
        // SAFETY: As above.
        unsafe {
            let meta = d.meta_mut();
            meta.class = self.class.index;
            meta.slot_size = self.class.slot_size;
            meta.block_size = self.class.block_size;
            meta.max_count = max_count;
            meta.slots = Some(slots);
            meta.chunk = Some(chunk);
            superblock::thread(slots, self.class.slot_size, max_count);
        }
        d.anchor.store(Anchor::new(1, max_count - 1, State::Partial));
        ClassCounters::bump(&self.counters.reserved);
        log!(
            trace,
            "heap {}: reserved superblock {slots:p} with {max_count} slots",
            self.class.slot_size
        );

        if self
            .active
            .compare_exchange(ptr::null_mut(), desc.as_ptr(), AcqRel, Acquire)
            .is_ok()
        {
            return Ok(Some(slots));
        }

        log!(debug, "heap {}: lost the race for the active slot", self.class.slot_size);
        d.anchor.store(Anchor::new(0, max_count, State::Empty));
        // SAFETY: The descriptor was never published.
        unsafe { self.retire(desc, pool) };
        Ok(None)
    }

    /// Frees a slot of this heap.
    ///
    /// # Safety
    ///
    /// `slot` must have been allocated from this heap and not freed since.
    pub unsafe fn deallocate(&self, slot: NonNull<u8>, pool: &DescriptorPool<B>) {
        // SAFETY: The slot lives in a superblock of this class.
        let desc = unsafe { superblock::locate::<B>(slot, self.class.block_size) };
        // SAFETY: Holding a slot keeps the descriptor from being recycled.
        let d = unsafe { desc.as_ref() };
        let meta = d.meta();
        assert_eq!(
            (meta.class, meta.block_size),
            (self.class.index, self.class.block_size),
            "{slot:p} does not belong to the size class of {} bytes",
            self.class.slot_size
        );
        let slots = meta.slots.expect("superblock of a live slot is released");
        let max_count = meta.max_count;
        let index = superblock::slot_index(slots, slot, meta.slot_size);
        assert!(index < max_count, "{slot:p} lies outside its superblock");

        track::deallocate(slot);
        track::defined(slot, LINK_SIZE);
        ClassCounters::drop_one(&self.counters.live_slots);

        let mut guard = None;
        let mut old = d.anchor.load();
        let new = loop {
            assert!(
                old.state() != State::Empty && old.count() < max_count,
                "double free of {slot:p}"
            );
            // SAFETY: The slot is ours until the anchor says otherwise.
            unsafe { superblock::write_link(slot, old.avail()) };

            let count = old.count() + 1;
            let state = if count == max_count {
                // Keep the descriptor from being recycled before it is removed
                // from the active slot below.
                guard
                    .get_or_insert_with(|| pool.hazards())
                    .set(HAZARD_FREE, desc);
                State::Empty
            } else {
                State::Partial
            };
            let new = Anchor::new(index, count, state);
            match d.anchor.compare_exchange(old, new) {
                Ok(()) => break new,
                Err(cur) => old = cur,
            }
        };

        if new.state() == State::Empty {
            let claimed = self
                .active
                .compare_exchange(desc.as_ptr(), ptr::null_mut(), AcqRel, Acquire)
                .is_ok();
            drop(guard);
            if claimed {
                // SAFETY: We took it out of the active slot, so we own it.
                unsafe { self.retire(desc, pool) };
            } else {
                self.remove_empty(pool);
            }
        } else if old.state() == State::Full {
            // Nobody owned the full descriptor; this thread now does.
            self.publish(desc);
        }
    }

    /// Makes an owned descriptor the active one, or queues it as partial.
    fn publish(&self, desc: NonNull<Descriptor<B>>) {
        if self
            .active
            .compare_exchange(ptr::null_mut(), desc.as_ptr(), AcqRel, Acquire)
            .is_err()
        {
            self.partial.push(desc);
        }
    }

    /// Dequeues a partial descriptor, retiring every empty one on the way.
    fn pop_partial(&self, pool: &DescriptorPool<B>) -> Option<NonNull<Descriptor<B>>> {
        loop {
            let desc = self.partial.pop()?;
            // SAFETY: Dequeued descriptors are owned by us.
            if unsafe { desc.as_ref() }.anchor.load().state() != State::Empty {
                break Some(desc);
            }
            // SAFETY: As above.
            unsafe { self.retire(desc, pool) };
        }
    }

    /// Sweeps the partial queue for empty descriptors, stopping after
    /// [`CLEANUP_BOUND`] non-empty ones have been put back.
    ///
    /// The bound keeps a freeing thread from cycling through the whole queue,
    /// at the cost of leaving empty descriptors for later sweeps or
    /// allocations to find.
    fn remove_empty(&self, pool: &DescriptorPool<B>) {
        let mut non_empty = 0;
        while let Some(desc) = self.partial.pop() {
            // SAFETY: Dequeued descriptors are owned by us.
            if unsafe { desc.as_ref() }.anchor.load().state() == State::Empty {
                // SAFETY: As above.
                unsafe { self.retire(desc, pool) };
            } else {
                self.partial.push(desc);
                non_empty += 1;
                if non_empty >= CLEANUP_BOUND {
                    break;
                }
            }
        }
    }

    /// Releases the superblock of an empty descriptor and returns the
    /// descriptor to the pool.
    ///
    /// # Safety
    ///
    /// The caller must own `desc`, and it must not be reachable from the
    /// active slot or the partial queue.
    unsafe fn retire(&self, desc: NonNull<Descriptor<B>>, pool: &DescriptorPool<B>) {
        // SAFETY: We own the descriptor.
        let d = unsafe { desc.as_ref() };
        assert_eq!(
            d.anchor.load().state(),
            State::Empty,
            "retiring descriptor {desc:p} which is not empty"
        );
        assert!(
            d.in_use.swap(false, AcqRel),
            "descriptor {desc:p} is retired twice"
        );

        // SAFETY: As above.
        let meta = unsafe { d.meta_mut() };
        if let (Some(chunk), Some(slots)) = (meta.chunk.take(), meta.slots.take()) {
            superblock::release(chunk, slots);
            ClassCounters::bump(&self.counters.released);
            log!(trace, "heap {}: released superblock {slots:p}", self.class.slot_size);
        }
        log!(debug, "heap {}: retired descriptor {desc:p}", self.class.slot_size);
        // SAFETY: Not in use, empty, and unreachable.
        unsafe { pool.release(desc) };
    }

    /// Iterates the descriptors owned by the heap itself, draining the
    /// partial queue. The caller must [`restore`](Self::restore) them.
    ///
    /// Only meaningful while no thread allocates or frees.
    pub(crate) fn drain(&self) -> Vec<NonNull<Descriptor<B>>> {
        let active = NonNull::new(self.active.swap(ptr::null_mut(), AcqRel));
        let mut descs = active.into_iter().collect::<Vec<_>>();
        descs.extend(core::iter::from_fn(|| self.partial.pop()));
        descs
    }

    /// Puts back descriptors taken by [`drain`](Self::drain), the first one
    /// becoming active again.
    pub(crate) fn restore(&self, descs: Vec<NonNull<Descriptor<B>>>) {
        descs.into_iter().for_each(|desc| self.publish(desc));
    }
}
