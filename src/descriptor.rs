//! Superblock descriptors and their anchors.

pub(crate) mod pool;

use core::{
    cell::UnsafeCell,
    fmt,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering::*},
};

use crate::{
    base::{BaseAlloc, Chunk},
    hazard::Retirable,
};

/// The lifecycle state of a descriptor's superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub(crate) enum State {
    /// Every slot is allocated.
    Full = 0,
    /// Some slots are free.
    Partial = 1,
    /// Every slot is free, or the superblock is released.
    Empty = 2,
}

/// The packed control word of a descriptor.
///
/// ```text
/// | state: 2 | count: 31 | avail: 31 |
/// ```
///
/// The three fields are only ever updated together, by a single
/// compare-and-swap of the whole word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Anchor(u64);

impl Anchor {
    const FIELD_BITS: u32 = 31;
    const FIELD_MASK: u64 = (1 << Self::FIELD_BITS) - 1;
    const COUNT_SHIFT: u32 = Self::FIELD_BITS;
    const STATE_SHIFT: u32 = Self::FIELD_BITS * 2;

    /// The largest value `avail` or `count` can hold.
    pub const FIELD_MAX: u32 = Self::FIELD_MASK as u32;

    pub const fn new(avail: u32, count: u32, state: State) -> Self {
        debug_assert!(avail <= Self::FIELD_MAX && count <= Self::FIELD_MAX);
        Anchor(
            avail as u64 | (count as u64) << Self::COUNT_SHIFT | (state as u64) << Self::STATE_SHIFT,
        )
    }

    /// The index of the first free slot.
    pub const fn avail(self) -> u32 {
        (self.0 & Self::FIELD_MASK) as u32
    }

    /// The number of free slots.
    pub const fn count(self) -> u32 {
        ((self.0 >> Self::COUNT_SHIFT) & Self::FIELD_MASK) as u32
    }

    pub const fn state(self) -> State {
        match self.0 >> Self::STATE_SHIFT {
            0 => State::Full,
            1 => State::Partial,
            2 => State::Empty,
            _ => panic!("invalid descriptor state"),
        }
    }

    #[cfg(test)]
    pub const fn with_avail(self, avail: u32) -> Self {
        Anchor::new(avail, self.count(), self.state())
    }

    #[cfg(test)]
    pub const fn with_count(self, count: u32) -> Self {
        Anchor::new(self.avail(), count, self.state())
    }

    #[cfg(test)]
    pub const fn with_state(self, state: State) -> Self {
        Anchor::new(self.avail(), self.count(), state)
    }
}

impl fmt::Debug for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Anchor")
            .field("avail", &self.avail())
            .field("count", &self.count())
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Debug)]
pub(crate) struct AtomicAnchor(AtomicU64);

impl AtomicAnchor {
    pub const fn new(anchor: Anchor) -> Self {
        AtomicAnchor(AtomicU64::new(anchor.0))
    }

    pub fn load(&self) -> Anchor {
        Anchor(self.0.load(Acquire))
    }

    /// Overwrites the anchor of a descriptor that no other thread can reach.
    pub fn store(&self, anchor: Anchor) {
        self.0.store(anchor.0, Release)
    }

    /// Replaces `old` with `new`, returning the current anchor on failure.
    ///
    /// An empty anchor may only be replaced by another empty anchor.
    pub fn compare_exchange(&self, old: Anchor, new: Anchor) -> Result<(), Anchor> {
        assert!(
            old.state() != State::Empty || new.state() == State::Empty,
            "an empty descriptor cannot be revived: {old:?} -> {new:?}"
        );
        self.0
            .compare_exchange(old.0, new.0, AcqRel, Acquire)
            .map(drop)
            .map_err(Anchor)
    }
}

/// The geometry and memory of the superblock a descriptor manages.
pub(crate) struct Meta<B: BaseAlloc> {
    /// The index of the size class, and thus the heap, owning the descriptor.
    pub class: usize,
    pub slot_size: usize,
    pub block_size: usize,
    pub max_count: u32,
    /// The address of the first slot.
    pub slots: Option<NonNull<u8>>,
    pub chunk: Option<Chunk<B>>,
}

impl<B: BaseAlloc> Meta<B> {
    const UNSET: Self = Meta {
        class: usize::MAX,
        slot_size: 0,
        block_size: 0,
        max_count: 0,
        slots: None,
        chunk: None,
    };
}

/// The metadata record of a single superblock.
///
/// Descriptors live in batches owned by the
/// [`DescriptorPool`](pool::DescriptorPool) and are recycled, never freed,
/// until the whole pool is dropped. At any time a descriptor is either
/// available in the pool, or carries a live superblock and is reachable from
/// its superblock header.
pub(crate) struct Descriptor<B: BaseAlloc> {
    pub anchor: AtomicAnchor,
    /// The link of the pool's available list.
    pub next: AtomicPtr<Self>,
    retired: AtomicPtr<Self>,
    /// Set between its acquisition from and its return to the pool.
    pub in_use: AtomicBool,
    meta: UnsafeCell<Meta<B>>,
}

// SAFETY: `meta` is only written by the exclusive owner of an unpublished
// descriptor; every other field is atomic.
unsafe impl<B: BaseAlloc> Send for Descriptor<B> where Chunk<B>: Send {}
unsafe impl<B: BaseAlloc> Sync for Descriptor<B> where Chunk<B>: Send {}

// SAFETY: `retired` is used by nothing but the hazard domain.
unsafe impl<B: BaseAlloc> Retirable for Descriptor<B> {
    fn retired_link(&self) -> &AtomicPtr<Self> {
        &self.retired
    }
}

impl<B: BaseAlloc> Descriptor<B> {
    pub const fn new() -> Self {
        Descriptor {
            anchor: AtomicAnchor::new(Anchor::new(0, 0, State::Empty)),
            next: AtomicPtr::new(ptr::null_mut()),
            retired: AtomicPtr::new(ptr::null_mut()),
            in_use: AtomicBool::new(false),
            meta: UnsafeCell::new(Meta::UNSET),
        }
    }

    /// The superblock geometry.
    ///
    /// Only meaningful while the caller holds a slot of the superblock, owns
    /// the descriptor, or protects it with a hazard pointer after observing
    /// it carrying a superblock.
    pub fn meta(&self) -> &Meta<B> {
        // SAFETY: `meta` is never written while the descriptor is reachable
        // by other threads.
        unsafe { &*self.meta.get() }
    }

    /// # Safety
    ///
    /// The caller must exclusively own the descriptor, i.e. must have just
    /// acquired it from the pool or be retiring it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn meta_mut(&self) -> &mut Meta<B> {
        // SAFETY: See the contract above.
        unsafe { &mut *self.meta.get() }
    }
}

impl<B: BaseAlloc> fmt::Debug for Descriptor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = self.meta();
        f.debug_struct("Descriptor")
            .field("anchor", &self.anchor.load())
            .field("in_use", &self.in_use.load(Relaxed))
            .field("class", &meta.class)
            .field("slot_size", &meta.slot_size)
            .field("slots", &meta.slots)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn anchor_packing() {
        let anchor = Anchor::new(Anchor::FIELD_MAX, 3, State::Partial);
        assert_eq!(anchor.avail(), Anchor::FIELD_MAX);
        assert_eq!(anchor.count(), 3);
        assert_eq!(anchor.state(), State::Partial);

        let anchor = anchor.with_count(Anchor::FIELD_MAX).with_avail(0);
        assert_eq!(anchor.avail(), 0);
        assert_eq!(anchor.count(), Anchor::FIELD_MAX);
        assert_eq!(anchor.state(), State::Partial);

        let anchor = anchor.with_state(State::Empty);
        assert_eq!(anchor.count(), Anchor::FIELD_MAX);
        assert_eq!(anchor.state(), State::Empty);
        assert_eq!(Anchor::new(0, 0, State::Full).0, 0);
    }

    #[test]
    fn anchor_cas() {
        let atomic = AtomicAnchor::new(Anchor::new(1, 3, State::Partial));
        let stale = Anchor::new(0, 4, State::Partial);
        let cur = atomic.compare_exchange(stale, stale.with_count(3)).unwrap_err();
        assert_eq!(cur, Anchor::new(1, 3, State::Partial));

        let full = Anchor::new(0, 0, State::Full);
        atomic.compare_exchange(cur, full).unwrap();
        assert_eq!(atomic.load(), full);
    }

    #[test]
    #[should_panic = "cannot be revived"]
    fn empty_is_terminal() {
        let empty = Anchor::new(0, 4, State::Empty);
        let atomic = AtomicAnchor::new(empty);
        let _ = atomic.compare_exchange(empty, empty.with_state(State::Partial));
    }
}
