//! Raw superblock memory.
//!
//! A superblock is a chunk aligned to its own size. Its first
//! [`SB_HEADER_SIZE`] bytes hold a pointer to its descriptor, followed by
//! `max_count` slots of the same size. Masking any slot address with the
//! block size thus leads back to the descriptor.
//!
//! Free slots keep the index of the next free slot in their first 4 bytes,
//! accessed atomically since a stale allocating thread may read a link while
//! a freeing thread writes it. The list ends with `max_count`.

use core::{
    alloc::Layout,
    num::NonZeroUsize,
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering::*},
};

use crate::{
    base::{BaseAlloc, Chunk},
    descriptor::Descriptor,
    size_class::SB_HEADER_SIZE,
    track,
};

/// The bytes of a free slot taken by its link.
pub(crate) const LINK_SIZE: usize = size_of::<u32>();

/// Reserves a superblock of `block_size` and points its header to `desc`.
///
/// Returns the chunk and the address of its first slot.
pub(crate) fn reserve<B: BaseAlloc>(
    base: &B,
    block_size: usize,
    desc: NonNull<Descriptor<B>>,
) -> Result<(Chunk<B>, NonNull<u8>), B::Error> {
    debug_assert!(block_size.is_power_of_two());
    // SAFETY: `block_size` is a non-zero power of two.
    let layout = unsafe { Layout::from_size_align_unchecked(block_size, block_size) };
    let chunk = base.allocate(layout)?;

    let header = chunk.pointer();
    assert_eq!(
        header_of(header.as_ptr() as usize, block_size),
        header.as_ptr() as usize,
        "superblock {header:p} is not aligned to {block_size:#x}"
    );
    // SAFETY: The header is within the fresh chunk and aligned.
    unsafe {
        header.cast::<*mut Descriptor<B>>().write(desc.as_ptr());
        Ok((chunk, header.add(SB_HEADER_SIZE)))
    }
}

/// Releases the memory of a superblock back to the base allocator.
pub(crate) fn release<B: BaseAlloc>(chunk: Chunk<B>, slots: NonNull<u8>) {
    let header = chunk.pointer();
    debug_assert_eq!(header.as_ptr().wrapping_add(SB_HEADER_SIZE), slots.as_ptr());
    track::defined(header, chunk.layout().size());
    drop(chunk)
}

/// The address of the superblock header containing `addr`.
pub(crate) const fn header_of(addr: usize, block_size: usize) -> usize {
    addr & !(block_size - 1)
}

/// Finds the descriptor of the superblock containing `slot`.
///
/// # Safety
///
/// `slot` must be a slot of a live superblock of `block_size`.
pub(crate) unsafe fn locate<B: BaseAlloc>(
    slot: NonNull<u8>,
    block_size: usize,
) -> NonNull<Descriptor<B>> {
    let header = header_of(slot.as_ptr() as usize, block_size);
    let Some(header) = NonZeroUsize::new(header) else {
        panic!("{slot:p} does not belong to any superblock")
    };
    let header = slot.with_addr(header);
    // SAFETY: The header of a live superblock holds a valid descriptor pointer.
    let desc = unsafe { header.cast::<*mut Descriptor<B>>().read() };
    match NonNull::new(desc) {
        Some(desc) => desc,
        None => panic!("superblock {header:p} holds no descriptor"),
    }
}

/// The address of slot `index`.
pub(crate) fn slot_addr(slots: NonNull<u8>, index: u32, slot_size: usize) -> NonNull<u8> {
    slots.map_addr(|addr| addr.saturating_add(index as usize * slot_size))
}

/// The index of the slot at `slot`.
pub(crate) fn slot_index(slots: NonNull<u8>, slot: NonNull<u8>, slot_size: usize) -> u32 {
    let Some(offset) = (slot.as_ptr() as usize).checked_sub(slots.as_ptr() as usize) else {
        panic!("{slot:p} precedes the slots of its superblock")
    };
    assert_eq!(offset % slot_size, 0, "{slot:p} is not the start of a slot");
    (offset / slot_size) as u32
}

/// # Safety
///
/// `slot` must be a slot of a live superblock.
unsafe fn link<'a>(slot: NonNull<u8>) -> &'a AtomicU32 {
    // SAFETY: Slots are at least 8-byte aligned and hold at least 4 bytes.
    unsafe { slot.cast::<AtomicU32>().as_ref() }
}

/// Reads the free list link of `slot`.
///
/// # Safety
///
/// `slot` must be a slot of a live superblock.
pub(crate) unsafe fn read_link(slot: NonNull<u8>) -> u32 {
    unsafe { link(slot) }.load(Relaxed)
}

/// # Safety
///
/// `slot` must be a slot of a live superblock, not currently allocated to
/// anyone but the caller.
pub(crate) unsafe fn write_link(slot: NonNull<u8>, next: u32) {
    unsafe { link(slot) }.store(next, Relaxed)
}

/// Threads slots `1..max_count` of a fresh superblock into a free list
/// ending with `max_count`. Slot 0 is left for the reserving thread.
///
/// # Safety
///
/// `slots` must be the first slot of a superblock nobody else can reach.
pub(crate) unsafe fn thread(slots: NonNull<u8>, slot_size: usize, max_count: u32) {
    for index in 1..max_count {
        let slot = slot_addr(slots, index, slot_size);
        // SAFETY: The superblock is exclusively owned.
        unsafe { write_link(slot, index + 1) };
        // SAFETY: The slot body lies within the superblock.
        track::no_access(unsafe { slot.add(LINK_SIZE) }, slot_size - LINK_SIZE);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::System;

    #[test]
    fn locate_by_masking() {
        let desc = NonNull::<Descriptor<System>>::dangling();
        for block_size in [4096, 8192, 16384] {
            let (chunk, slots) = reserve(&System, block_size, desc).unwrap();
            assert_eq!(slots.as_ptr() as usize % 16, 0);

            let slot_size = 24;
            let max_count = ((block_size - SB_HEADER_SIZE) / slot_size) as u32;
            for index in [0, 1, max_count - 1] {
                let slot = slot_addr(slots, index, slot_size);
                assert_eq!(unsafe { locate::<System>(slot, block_size) }, desc);
                assert_eq!(slot_index(slots, slot, slot_size), index);
            }
            release(chunk, slots);
        }
    }

    #[test]
    fn threading() {
        let desc = NonNull::<Descriptor<System>>::dangling();
        let (chunk, slots) = reserve(&System, 4096, desc).unwrap();
        let (slot_size, max_count) = (1016, 4);
        unsafe { thread(slots, slot_size, max_count) };

        let mut next = 1;
        let mut visited = 0;
        while next < max_count {
            visited += 1;
            next = unsafe { read_link(slot_addr(slots, next, slot_size)) };
        }
        assert_eq!(visited, max_count - 1);
        assert_eq!(next, max_count);
        release(chunk, slots);
    }

    #[test]
    #[should_panic = "not the start of a slot"]
    fn interior_pointer() {
        let slots = NonNull::<u8>::dangling();
        slot_index(slots, slot_addr(slots, 0, 24).map_addr(|a| a.saturating_add(12)), 24);
    }
}
