//! Memory state annotations for valgrind's memcheck.
//!
//! Slots are reported as heap blocks, so that memcheck catches accesses to
//! freed slots. The free list link at the front of a free slot stays
//! accessible, since the allocator itself reads it.

#[cfg(feature = "track-valgrind")]
mod imp {
    use core::ptr::NonNull;

    use crabgrind::memcheck::*;

    pub fn allocate(slot: NonNull<u8>, size: usize, is_zeroed: bool) {
        alloc::malloc(slot.as_ptr().cast(), size, 0, is_zeroed)
    }

    pub fn deallocate(slot: NonNull<u8>) {
        alloc::free(slot.as_ptr().cast(), 0)
    }

    pub fn defined(ptr: NonNull<u8>, size: usize) {
        let _ = mark_mem(ptr.as_ptr().cast(), size, MemState::Defined);
    }

    pub fn no_access(ptr: NonNull<u8>, size: usize) {
        let _ = mark_mem(ptr.as_ptr().cast(), size, MemState::NoAccess);
    }
}
#[cfg(not(feature = "track-valgrind"))]
mod imp {
    use core::ptr::NonNull;

    pub fn allocate(slot: NonNull<u8>, size: usize, is_zeroed: bool) {
        let _ = (slot, size, is_zeroed);
    }

    pub fn deallocate(slot: NonNull<u8>) {
        let _ = slot;
    }

    pub fn defined(ptr: NonNull<u8>, size: usize) {
        let _ = (ptr, size);
    }

    pub fn no_access(ptr: NonNull<u8>, size: usize) {
        let _ = (ptr, size);
    }
}
pub(crate) use self::imp::*;
