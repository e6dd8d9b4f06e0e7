use core::{fmt, ptr::NonNull};

use crossbeam_deque::{Injector, Steal};
use crossbeam_utils::Backoff;

use crate::{
    base::{BaseAlloc, Chunk},
    descriptor::Descriptor,
};

struct DescRef<B: BaseAlloc>(NonNull<Descriptor<B>>);

// SAFETY: A queued descriptor is owned by the queue, and handed to exactly
// one thread when dequeued.
unsafe impl<B: BaseAlloc> Send for DescRef<B> where Chunk<B>: Send {}

/// The unordered multi-producer multi-consumer queue of a heap's partial
/// descriptors.
///
/// Enqueuing hands the ownership of a descriptor over to the queue; a
/// descriptor is never queued twice, so a dequeued one is exclusively owned.
pub(crate) struct PartialQueue<B: BaseAlloc> {
    queue: Injector<DescRef<B>>,
}

impl<B: BaseAlloc> fmt::Debug for PartialQueue<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialQueue")
            .field("len", &self.queue.len())
            .finish()
    }
}

impl<B: BaseAlloc> PartialQueue<B> {
    pub fn new() -> Self {
        PartialQueue {
            queue: Injector::new(),
        }
    }

    pub fn push(&self, desc: NonNull<Descriptor<B>>) {
        self.queue.push(DescRef(desc))
    }

    pub fn pop(&self) -> Option<NonNull<Descriptor<B>>> {
        let backoff = Backoff::new();
        loop {
            match self.queue.steal() {
                Steal::Success(DescRef(desc)) => break Some(desc),
                Steal::Empty => break None,
                Steal::Retry => backoff.spin(),
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}
