//! The size class table.
//!
//! Every size is a multiple of 8, so that every slot can hold the embedded
//! free list link and stays word-aligned.

use crate::config::SB_MAX_SHIFT;

#[cfg(target_pointer_width = "64")]
pub const SLOT_SIZES: &[usize] = &[
    8, 16, 24, 32, 40, 48, 64, 80, //
    96, 128, 160, 192, 224, 248, 320, 328, //
    384, 448, 528, 584, 680, 816, 1016, 1088, //
    1360, 2040, 2336, 2728, 3272, 4088, 5456, 8184, //
];

#[cfg(not(target_pointer_width = "64"))]
pub const SLOT_SIZES: &[usize] = &[
    8, 16, 24, 32, 40, 48, 64, 80, //
    96, 128, 160, 192, 224, 248, 296, 320, //
    384, 448, 504, 528, 584, 680, 816, 1088, //
    1360, 2040, 2336, 2728, 3272, 4088, 5456, 8184, //
];

pub const SIZE_CLASS_COUNT: usize = SLOT_SIZES.len();

/// The largest size served from superblocks; anything above goes to the base
/// allocator directly.
pub const MAX_SLOT_SIZE: usize = SLOT_SIZES[SIZE_CLASS_COUNT - 1];

pub const SB_MAX_SIZE: usize = 1 << SB_MAX_SHIFT;

/// The bytes at the front of every superblock holding the descriptor back
/// pointer.
pub const SB_HEADER_SIZE: usize = 16;

// The largest superblock must hold two slots of every class.
const _: () = assert!(
    SB_MAX_SIZE - SB_HEADER_SIZE >= 2 * MAX_SLOT_SIZE,
    "SB_MAX_SHIFT is too small for the largest size class"
);

pub const fn sb_usable_size(block_size: usize) -> usize {
    block_size - SB_HEADER_SIZE
}

/// Finds the index of the smallest size class whose slots fit `size`.
///
/// Returns `None` if `size` exceeds [`MAX_SLOT_SIZE`].
pub fn index_for_size(size: usize) -> Option<usize> {
    match SLOT_SIZES.binary_search(&size) {
        Ok(index) => Some(index),
        Err(index) => (index < SIZE_CLASS_COUNT).then_some(index),
    }
}

/// The smallest power-of-two multiple of `page_size` that holds two slots of
/// `slot_size` besides the header, capped at [`SB_MAX_SIZE`].
pub fn block_size(slot_size: usize, page_size: usize) -> usize {
    debug_assert!(page_size.is_power_of_two());
    let mut size = page_size;
    while size < SB_MAX_SIZE {
        if slot_size * 2 <= sb_usable_size(size) {
            return size;
        }
        size <<= 1;
    }
    SB_MAX_SIZE
}

/// An immutable record of a slot size and its superblock size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SizeClass {
    pub index: usize,
    pub slot_size: usize,
    pub block_size: usize,
}

impl SizeClass {
    pub fn new(index: usize, page_size: usize) -> Self {
        let slot_size = SLOT_SIZES[index];
        SizeClass {
            index,
            slot_size,
            block_size: block_size(slot_size, page_size),
        }
    }

    /// The number of slots in each superblock of this class.
    pub fn max_count(&self) -> usize {
        sb_usable_size(self.block_size) / self.slot_size
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sorted_and_aligned() {
        assert!(SLOT_SIZES.windows(2).all(|w| w[0] < w[1]));
        assert!(SLOT_SIZES.iter().all(|&size| size % 8 == 0));
    }

    #[test]
    fn index_boundaries() {
        assert_eq!(index_for_size(0), Some(0));
        assert_eq!(index_for_size(1), Some(0));
        assert_eq!(index_for_size(8), Some(0));
        assert_eq!(index_for_size(9), Some(1));
        assert_eq!(index_for_size(MAX_SLOT_SIZE), Some(SIZE_CLASS_COUNT - 1));
        assert_eq!(index_for_size(MAX_SLOT_SIZE + 1), None);

        for (index, &size) in SLOT_SIZES.iter().enumerate() {
            assert_eq!(index_for_size(size), Some(index));
            if index > 0 {
                assert_eq!(index_for_size(SLOT_SIZES[index - 1] + 1), Some(index));
            }
        }
    }

    #[test]
    fn block_sizes() {
        for page_shift in [12, 14] {
            let page_size = 1 << page_shift;
            for index in 0..SIZE_CLASS_COUNT {
                let class = SizeClass::new(index, page_size);
                assert!(class.block_size.is_power_of_two());
                assert!(class.block_size <= SB_MAX_SIZE.max(page_size));
                assert!(class.max_count() >= 2, "{class:?} holds less than 2 slots");
                // Every slot index must fit into the anchor.
                assert!(class.max_count() < 1 << 31);
            }
        }

        assert_eq!(block_size(8, 4096), 4096);
        assert_eq!(block_size(2040, 4096), 4096);
        assert_eq!(block_size(2041, 4096), 8192);
        assert_eq!(block_size(MAX_SLOT_SIZE, 4096), SB_MAX_SIZE);
        assert!(sb_usable_size(SB_MAX_SIZE) / MAX_SLOT_SIZE >= 2);
    }
}
