//! Hazard pointers.
//!
//! A reader publishes the pointer it is about to dereference in one of the
//! slots of its [`HazardGuard`]; a node retired through
//! [`HazardDomain::retire`] is not handed to its reclaim function while any
//! guard still publishes it.
//!
//! Guards are not bound to threads: every guard owns a record of the domain
//! exclusively until it is dropped, and records are recycled afterwards.
//! Records are never freed before the domain itself.

use core::{
    fmt,
    marker::PhantomData,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering::*, fence},
};

use crossbeam_utils::CachePadded;

use crate::config::RETIRE_THRESHOLD;

/// The number of pointers a single guard can protect at once.
pub const HAZARD_POINTER_COUNT: usize = 2;

/// Nodes that can be retired into a [`HazardDomain`].
///
/// # Safety
///
/// `retired_link` must return the same link every time, and the link must
/// not be used for anything else while the node is retired.
pub unsafe trait Retirable: Sized {
    fn retired_link(&self) -> &AtomicPtr<Self>;
}

struct Record {
    hazards: [AtomicPtr<()>; HAZARD_POINTER_COUNT],
    in_use: AtomicBool,
    // Immutable once the record is published.
    next: *mut CachePadded<Record>,
}

/// A collection of hazard records and the nodes waiting for them to clear.
pub struct HazardDomain<T: Retirable> {
    records: AtomicPtr<CachePadded<Record>>,
    retired: AtomicPtr<T>,
    retired_count: AtomicUsize,
}

// SAFETY: Records are only mutated through atomics after their publication,
// and retired nodes are handed out to one reclaiming thread at a time.
unsafe impl<T: Retirable + Send> Send for HazardDomain<T> {}
unsafe impl<T: Retirable + Send> Sync for HazardDomain<T> {}

impl<T: Retirable> fmt::Debug for HazardDomain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HazardDomain")
            .field("records", &self.records().count())
            .field("retired", &self.retired_count())
            .finish()
    }
}

impl<T: Retirable> Default for HazardDomain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Retirable> HazardDomain<T> {
    pub const fn new() -> Self {
        HazardDomain {
            records: AtomicPtr::new(ptr::null_mut()),
            retired: AtomicPtr::new(ptr::null_mut()),
            retired_count: AtomicUsize::new(0),
        }
    }

    fn records(&self) -> impl Iterator<Item = &Record> + '_ {
        let mut cur = self.records.load(Acquire);
        core::iter::from_fn(move || {
            // SAFETY: Records are never freed while the domain is alive.
            let record = unsafe { cur.as_ref() }?;
            cur = record.next;
            Some(&**record)
        })
    }

    /// Acquires a guard with all of its slots cleared.
    pub fn acquire(&self) -> HazardGuard<'_, T> {
        if let Some(record) = self.records().find(|record| {
            record
                .in_use
                .compare_exchange(false, true, Acquire, Relaxed)
                .is_ok()
        }) {
            return HazardGuard { record, marker: PhantomData };
        }

        let record = Box::into_raw(Box::new(CachePadded::new(Record {
            hazards: [const { AtomicPtr::new(ptr::null_mut()) }; HAZARD_POINTER_COUNT],
            in_use: AtomicBool::new(true),
            next: ptr::null_mut(),
        })));
        let mut head = self.records.load(Relaxed);
        loop {
            // SAFETY: The record is not published yet.
            unsafe { (&mut *record).next = head };
            match self
                .records
                .compare_exchange_weak(head, record, AcqRel, Relaxed)
            {
                Ok(_) => break,
                Err(h) => head = h,
            }
        }
        // SAFETY: The record is published and lives as long as the domain.
        let record = unsafe { &**record };
        HazardGuard { record, marker: PhantomData }
    }

    /// Checks whether any guard currently publishes `node`.
    pub fn is_protected(&self, node: NonNull<T>) -> bool {
        fence(SeqCst);
        let node = node.as_ptr().cast::<()>();
        self.records()
            .any(|record| record.hazards.iter().any(|h| h.load(SeqCst) == node))
    }

    /// The number of nodes waiting for their hazards to clear.
    pub fn retired_count(&self) -> usize {
        self.retired_count.load(Relaxed)
    }

    fn push_retired(&self, node: NonNull<T>) {
        // SAFETY: The node is retired and thus owned by the domain.
        let link = unsafe { node.as_ref() }.retired_link();
        let mut head = self.retired.load(Relaxed);
        loop {
            link.store(head, Relaxed);
            match self
                .retired
                .compare_exchange_weak(head, node.as_ptr(), AcqRel, Relaxed)
            {
                Ok(_) => break,
                Err(h) => head = h,
            }
        }
        self.retired_count.fetch_add(1, Relaxed);
    }

    /// Retires `node`, calling `reclaim` on it once no guard publishes it.
    ///
    /// `reclaim` may be called on `node` immediately, or later on any other
    /// thread that retires a node into or reclaims from this domain, so it
    /// must be the same function for every node of the domain.
    ///
    /// # Safety
    ///
    /// `node` must be unreachable for new readers, i.e. no guard will obtain
    /// it through [`HazardGuard::protect`] after this call.
    pub unsafe fn retire(&self, node: NonNull<T>, mut reclaim: impl FnMut(NonNull<T>)) {
        if self.is_protected(node) {
            self.push_retired(node);
        } else {
            reclaim(node);
        }

        if self.retired_count() >= RETIRE_THRESHOLD {
            self.try_reclaim(reclaim);
        }
    }

    /// Reclaims every retired node that is no longer protected.
    pub fn try_reclaim(&self, mut reclaim: impl FnMut(NonNull<T>)) {
        let mut cur = self.retired.swap(ptr::null_mut(), Acquire);
        while let Some(node) = NonNull::new(cur) {
            // SAFETY: We took the whole list, so we own every node on it.
            cur = unsafe { node.as_ref() }.retired_link().load(Relaxed);
            self.retired_count.fetch_sub(1, Relaxed);

            if self.is_protected(node) {
                self.push_retired(node);
            } else {
                reclaim(node);
            }
        }
    }

    /// Reclaims every retired node, regardless of hazards.
    ///
    /// No guard can be alive since the domain is exclusively borrowed.
    pub fn drain(&mut self, mut reclaim: impl FnMut(NonNull<T>)) {
        let mut cur = core::mem::replace(self.retired.get_mut(), ptr::null_mut());
        while let Some(node) = NonNull::new(cur) {
            // SAFETY: The list is exclusively owned.
            cur = unsafe { node.as_ref() }.retired_link().load(Relaxed);
            reclaim(node);
        }
        *self.retired_count.get_mut() = 0;
    }
}

impl<T: Retirable> Drop for HazardDomain<T> {
    fn drop(&mut self) {
        let mut cur = *self.records.get_mut();
        while !cur.is_null() {
            // SAFETY: Records were allocated by `Box` and no guard is alive.
            let record = unsafe { Box::from_raw(cur) };
            cur = record.next;
        }
    }
}

/// Exclusive access to a record of hazard slots.
///
/// Every slot is cleared when the guard is dropped.
pub struct HazardGuard<'a, T> {
    record: &'a Record,
    marker: PhantomData<*mut T>,
}

impl<'a, T> HazardGuard<'a, T> {
    /// Loads `src` and publishes the loaded pointer in slot `index`, retrying
    /// until the published value is still the current one.
    ///
    /// The returned pointer is protected until the slot is overwritten or
    /// cleared.
    pub fn protect(&self, index: usize, src: &AtomicPtr<T>) -> *mut T {
        let slot = &self.record.hazards[index];
        let mut ptr = src.load(Acquire);
        loop {
            slot.store(ptr.cast(), SeqCst);
            let reread = src.load(SeqCst);
            if reread == ptr {
                break ptr;
            }
            ptr = reread;
        }
    }

    /// Publishes `ptr` in slot `index` unconditionally.
    ///
    /// Only sound for pointers the caller already knows to be alive, such as
    /// a node it holds a reference into.
    pub fn set(&self, index: usize, ptr: NonNull<T>) {
        self.record.hazards[index].store(ptr.as_ptr().cast(), SeqCst);
    }

    pub fn clear(&self, index: usize) {
        self.record.hazards[index].store(ptr::null_mut(), Release);
    }
}

impl<T> Drop for HazardGuard<'_, T> {
    fn drop(&mut self) {
        for slot in &self.record.hazards {
            slot.store(ptr::null_mut(), Release);
        }
        self.record.in_use.store(false, Release);
    }
}

#[cfg(test)]
mod test {
    use std::{sync::atomic::AtomicUsize, thread, vec::Vec};

    use super::*;

    struct Node {
        value: usize,
        retired: AtomicPtr<Node>,
    }

    unsafe impl Retirable for Node {
        fn retired_link(&self) -> &AtomicPtr<Self> {
            &self.retired
        }
    }

    fn node(value: usize) -> NonNull<Node> {
        let node = Box::new(Node {
            value,
            retired: AtomicPtr::new(ptr::null_mut()),
        });
        NonNull::from(Box::leak(node))
    }

    fn free(node: NonNull<Node>) {
        drop(unsafe { Box::from_raw(node.as_ptr()) });
    }

    #[test]
    fn unprotected_is_reclaimed_at_once() {
        let domain = HazardDomain::<Node>::new();
        let mut reclaimed = Vec::new();
        unsafe { domain.retire(node(1), |n| reclaimed.push(n)) };
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(domain.retired_count(), 0);
        reclaimed.into_iter().for_each(free);
    }

    #[test]
    fn protected_is_deferred() {
        let domain = HazardDomain::<Node>::new();
        let a = node(1);
        let src = AtomicPtr::new(a.as_ptr());

        let guard = domain.acquire();
        let p = guard.protect(1, &src);
        assert_eq!(p, a.as_ptr());
        src.store(ptr::null_mut(), SeqCst);

        let mut reclaimed = Vec::new();
        unsafe { domain.retire(a, |n| reclaimed.push(n)) };
        assert!(reclaimed.is_empty());
        assert_eq!(domain.retired_count(), 1);
        // Still readable through the hazard.
        assert_eq!(unsafe { (*p).value }, 1);

        domain.try_reclaim(|n| reclaimed.push(n));
        assert!(reclaimed.is_empty());

        drop(guard);
        domain.try_reclaim(|n| reclaimed.push(n));
        assert_eq!(reclaimed, [a]);
        assert_eq!(domain.retired_count(), 0);
        free(a);
    }

    #[test]
    fn cleared_slot_releases_only_its_node() {
        let domain = HazardDomain::<Node>::new();
        let (a, b) = (node(1), node(2));
        let (src_a, src_b) = (AtomicPtr::new(a.as_ptr()), AtomicPtr::new(b.as_ptr()));

        let guard = domain.acquire();
        guard.protect(0, &src_a);
        guard.protect(1, &src_b);
        src_a.store(ptr::null_mut(), SeqCst);
        src_b.store(ptr::null_mut(), SeqCst);

        let mut reclaimed = Vec::new();
        unsafe {
            domain.retire(a, |n| reclaimed.push(n));
            domain.retire(b, |n| reclaimed.push(n));
        }
        assert!(reclaimed.is_empty());

        guard.clear(0);
        domain.try_reclaim(|n| reclaimed.push(n));
        assert_eq!(reclaimed, [a]);
        assert_eq!(domain.retired_count(), 1);

        guard.clear(1);
        domain.try_reclaim(|n| reclaimed.push(n));
        assert_eq!(reclaimed, [a, b]);
        assert_eq!(domain.retired_count(), 0);

        drop(guard);
        reclaimed.into_iter().for_each(free);
    }

    #[test]
    fn records_are_recycled() {
        let domain = HazardDomain::<Node>::new();
        let g1 = domain.acquire();
        let g2 = domain.acquire();
        drop(g1);
        let _g3 = domain.acquire();
        drop(g2);
        assert_eq!(domain.records().count(), 2);
    }

    #[test]
    fn concurrent_readers() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 2000;

        let domain = HazardDomain::<Node>::new();
        let src = AtomicPtr::new(node(0).as_ptr());
        let freed = AtomicUsize::new(0);

        thread::scope(|s| {
            for tid in 0..THREADS {
                let (domain, src, freed) = (&domain, &src, &freed);
                s.spawn(move || {
                    for round in 0..ROUNDS {
                        let guard = domain.acquire();
                        let cur = guard.protect(0, src);
                        // The protected node stays valid even if replaced meanwhile.
                        let value = unsafe { (*cur).value };
                        assert!(value <= THREADS * ROUNDS);
                        drop(guard);

                        let new = node(tid * ROUNDS + round + 1);
                        let old = src.swap(new.as_ptr(), AcqRel);
                        let old = NonNull::new(old).unwrap();
                        unsafe {
                            domain.retire(old, |n| {
                                freed.fetch_add(1, Relaxed);
                                free(n)
                            })
                        };
                    }
                });
            }
        });

        let mut domain = domain;
        domain.drain(|n| {
            freed.fetch_add(1, Relaxed);
            free(n)
        });
        assert_eq!(freed.load(Relaxed), THREADS * ROUNDS);
        free(NonNull::new(src.into_inner()).unwrap());
    }
}
