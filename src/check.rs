//! Consistency checks over descriptors and their free lists.
//!
//! The checks read anchors and free lists without synchronizing with
//! allocating or freeing threads, so they are only meaningful at a quiescent
//! point.

use core::{fmt, ptr::NonNull, sync::atomic::Ordering::Relaxed};

use crate::{
    base::BaseAlloc,
    descriptor::{Descriptor, State, pool::DescriptorPool},
    heap::Heap,
    size_class::{SizeClass, sb_usable_size},
    superblock,
};

/// A violated descriptor invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Inconsistency {
    /// A descriptor owned by a heap is also available in the pool.
    Available { desc: usize },
    /// A descriptor owned by a heap carries no superblock.
    Unbacked { desc: usize },
    SlotSizeMismatch { desc: usize, slot_size: usize, expected: usize },
    /// The recorded slot count disagrees with the superblock geometry.
    MaxCount { desc: usize, recorded: u32, expected: u32 },
    /// The state of the anchor disagrees with its count.
    Count { desc: usize, state: &'static str, count: u32, max_count: u32 },
    /// A descriptor is in a place its state forbids.
    Misplaced { desc: usize, state: &'static str },
    /// The `nth` free slot is out of range.
    IndexOutOfRange { desc: usize, nth: u32, index: u32, linked_from: Option<u32>, max_count: u32 },
    /// The `nth` free slot was already visited, i.e. the free list has a
    /// cycle.
    LinkedTwice { desc: usize, nth: u32, index: u32 },
    /// The slots taken from the superblocks of a class disagree with the
    /// live slots counted by its heap.
    Conservation { slot_size: usize, allocated: usize, live: usize },
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Inconsistency::Available { desc } => {
                write!(f, "descriptor {desc:#x} is in the available list")
            }
            Inconsistency::Unbacked { desc } => {
                write!(f, "descriptor {desc:#x} carries no superblock")
            }
            Inconsistency::SlotSizeMismatch { desc, slot_size, expected } => write!(
                f,
                "descriptor {desc:#x}: slot size {slot_size} doesn't match size class {expected}"
            ),
            Inconsistency::MaxCount { desc, recorded, expected } => write!(
                f,
                "descriptor {desc:#x} records {recorded} slots but its superblock holds {expected}"
            ),
            Inconsistency::Count { desc, state, count, max_count } => write!(
                f,
                "descriptor {desc:#x} is {state} with {count} of {max_count} slots free"
            ),
            Inconsistency::Misplaced { desc, state } => {
                write!(f, "descriptor {desc:#x} is {state} but owned by its heap")
            }
            Inconsistency::IndexOutOfRange { desc, nth, index, linked_from, max_count } => {
                write!(
                    f,
                    "descriptor {desc:#x}: index {index} for {nth}th available slot, linked from "
                )?;
                match linked_from {
                    Some(from) => write!(f, "{from}")?,
                    None => f.write_str("the anchor")?,
                }
                write!(f, ", not in range [0 .. {max_count})")
            }
            Inconsistency::LinkedTwice { desc, nth, index } => write!(
                f,
                "descriptor {desc:#x}: {nth}th available slot {index} linked twice"
            ),
            Inconsistency::Conservation { slot_size, allocated, live } => write!(
                f,
                "{allocated} slot(s) of {slot_size} bytes are taken from superblocks, \
                 but {live} are live"
            ),
        }
    }
}

impl core::error::Error for Inconsistency {}

fn state_name(state: State) -> &'static str {
    match state {
        State::Full => "full",
        State::Partial => "partial",
        State::Empty => "empty",
    }
}

/// Checks a single descriptor of `class`.
pub(crate) fn check_descriptor<B: BaseAlloc>(
    desc: NonNull<Descriptor<B>>,
    class: &SizeClass,
    pool: &DescriptorPool<B>,
) -> Result<State, Inconsistency> {
    let addr = desc.as_ptr() as usize;
    if pool.is_available(desc) {
        return Err(Inconsistency::Available { desc: addr });
    }

    // SAFETY: Descriptors are never freed before the pool.
    let d = unsafe { desc.as_ref() };
    let meta = d.meta();
    if meta.slot_size != class.slot_size {
        return Err(Inconsistency::SlotSizeMismatch {
            desc: addr,
            slot_size: meta.slot_size,
            expected: class.slot_size,
        });
    }
    let slots = meta.slots.ok_or(Inconsistency::Unbacked { desc: addr })?;

    let anchor = d.anchor.load();
    let (state, count) = (anchor.state(), anchor.count());
    let max_count = (sb_usable_size(meta.block_size) / meta.slot_size) as u32;
    if meta.max_count != max_count {
        return Err(Inconsistency::MaxCount {
            desc: addr,
            recorded: meta.max_count,
            expected: max_count,
        });
    }
    let valid = match state {
        State::Full => count == 0,
        State::Partial => 0 < count && count < max_count,
        State::Empty => count == max_count,
    };
    if !valid {
        return Err(Inconsistency::Count {
            desc: addr,
            state: state_name(state),
            count,
            max_count,
        });
    }

    let mut linked = vec![false; max_count as usize];
    let mut index = anchor.avail();
    let mut last = None;
    for nth in 0..count {
        if index >= max_count {
            return Err(Inconsistency::IndexOutOfRange {
                desc: addr,
                nth,
                index,
                linked_from: last,
                max_count,
            });
        }
        if linked[index as usize] {
            return Err(Inconsistency::LinkedTwice { desc: addr, nth, index });
        }
        linked[index as usize] = true;
        last = Some(index);
        let slot = superblock::slot_addr(slots, index, meta.slot_size);
        // SAFETY: The index is in range of a live superblock.
        index = unsafe { superblock::read_link(slot) };
    }
    Ok(state)
}

/// Checks the active descriptor and every partial descriptor of `heap`.
///
/// The partial queue is drained and restored, so the order of its entries
/// may change.
pub(crate) fn check_heap<B: BaseAlloc>(
    heap: &Heap<B>,
    pool: &DescriptorPool<B>,
) -> Result<(), Inconsistency> {
    let descs = heap.drain();
    let class = heap.class();
    let result = descs.iter().try_for_each(|&desc| {
        match check_descriptor(desc, &class, pool)? {
            State::Full => Err(Inconsistency::Misplaced {
                desc: desc.as_ptr() as usize,
                state: state_name(State::Full),
            }),
            State::Partial | State::Empty => Ok(()),
        }
    });
    heap.restore(descs);
    result
}

/// Checks that every slot taken from a superblock is accounted for as live
/// by the heap of its class, whether or not the heap can reach the
/// superblock.
pub(crate) fn check_conservation<B: BaseAlloc>(
    heaps: &[Heap<B>],
    pool: &DescriptorPool<B>,
) -> Result<(), Inconsistency> {
    let mut allocated = vec![0; heaps.len()];
    for d in pool.descriptors() {
        let meta = d.meta();
        if meta.slots.is_none() {
            continue;
        }
        let count = d.anchor.load().count();
        allocated[meta.class] += meta.max_count.saturating_sub(count) as usize;
    }

    heaps.iter().zip(allocated).try_for_each(|(heap, allocated)| {
        let live = heap.counters.live_slots.load(Relaxed);
        if allocated == live {
            Ok(())
        } else {
            Err(Inconsistency::Conservation {
                slot_size: heap.class().slot_size,
                allocated,
                live,
            })
        }
    })
}

#[cfg(test)]
mod test {
    use array_macro::array;

    use super::*;
    use crate::{base::System, size_class::SIZE_CLASS_COUNT, stat::ClassCounters};

    fn heaps() -> [Heap<System>; SIZE_CLASS_COUNT] {
        array![index => Heap::new(SizeClass::new(index, 4096)); SIZE_CLASS_COUNT]
    }

    #[test]
    fn healthy_heap() {
        let pool = DescriptorPool::new();
        let heap = Heap::new(SizeClass::new(5, 4096));
        let slots = (0..100)
            .map(|_| heap.allocate(&System, &pool).unwrap())
            .collect::<Vec<_>>();
        check_heap(&heap, &pool).unwrap();

        for slot in slots.iter().step_by(3) {
            unsafe { heap.deallocate(*slot, &pool) };
        }
        check_heap(&heap, &pool).unwrap();
        // The heap still works after being drained and restored.
        let again = heap.allocate(&System, &pool).unwrap();
        assert!(slots.contains(&again));
    }

    #[test]
    fn cycle_is_found() {
        let pool = DescriptorPool::new();
        let class = SizeClass::new(0, 4096);
        let heap = Heap::new(class);
        let a = heap.allocate(&System, &pool).unwrap();

        let desc = unsafe { superblock::locate::<System>(a, class.block_size) };
        let d = unsafe { desc.as_ref() };
        let anchor = d.anchor.load();
        assert_eq!(check_descriptor(desc, &class, &pool), Ok(State::Partial));

        // Point the second free slot back to the first one.
        let slots = d.meta().slots.unwrap();
        let second = unsafe { superblock::read_link(superblock::slot_addr(slots, anchor.avail(), 8)) };
        unsafe { superblock::write_link(superblock::slot_addr(slots, second, 8), anchor.avail()) };

        let err = check_descriptor(desc, &class, &pool).unwrap_err();
        assert_eq!(err, Inconsistency::LinkedTwice {
            desc: desc.as_ptr() as usize,
            nth: 2,
            index: anchor.avail(),
        });
        assert!(err.to_string().contains("linked twice"));
    }

    #[test]
    fn recorded_max_count() {
        let pool = DescriptorPool::new();
        let class = SizeClass::new(2, 4096);
        let heap = Heap::new(class);
        let a = heap.allocate(&System, &pool).unwrap();

        let desc = unsafe { superblock::locate::<System>(a, class.block_size) };
        let expected = class.max_count() as u32;
        unsafe { desc.as_ref().meta_mut().max_count = expected - 1 };
        assert_eq!(check_descriptor(desc, &class, &pool), Err(Inconsistency::MaxCount {
            desc: desc.as_ptr() as usize,
            recorded: expected - 1,
            expected,
        }));
    }

    #[test]
    fn conservation_covers_full_superblocks() {
        let pool = DescriptorPool::new();
        let heaps = heaps();
        let heap = &heaps[5];
        let max_count = heap.class().max_count();

        // The first superblock ends up full and unreachable from the heap.
        let slots = (0..max_count + 10)
            .map(|_| heap.allocate(&System, &pool).unwrap())
            .collect::<Vec<_>>();
        let small = heaps[0].allocate(&System, &pool).unwrap();
        check_conservation(&heaps, &pool).unwrap();

        for slot in slots.iter().skip(max_count).step_by(2) {
            unsafe { heap.deallocate(*slot, &pool) };
        }
        check_conservation(&heaps, &pool).unwrap();

        ClassCounters::drop_one(&heap.counters.live_slots);
        let live = max_count + 4;
        assert_eq!(check_conservation(&heaps, &pool), Err(Inconsistency::Conservation {
            slot_size: heap.class().slot_size,
            allocated: live + 1,
            live,
        }));
        ClassCounters::bump(&heap.counters.live_slots);

        unsafe { heaps[0].deallocate(small, &pool) };
        check_conservation(&heaps, &pool).unwrap();
    }
}
