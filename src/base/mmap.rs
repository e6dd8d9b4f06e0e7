use core::{alloc::Layout, mem::ManuallyDrop, ptr::NonNull};
use std::io;

use memmap2::{MmapMut, MmapOptions};

use super::{BaseAlloc, Chunk};
use crate::config::PAGE_SHIFT;

/// A base allocator reserving anonymous private mappings from the OS.
#[derive(Debug, Clone, Copy, Default, Hash)]
pub struct Mmap;

impl Mmap {
    pub const fn new() -> Self {
        Mmap
    }
}

fn map(len: usize) -> io::Result<MmapMut> {
    MmapOptions::new().len(len).map_anon()
}

unsafe impl BaseAlloc for Mmap {
    const IS_ZEROED: bool = true;

    type Error = io::Error;
    type Handle = ManuallyDrop<MmapMut>;

    fn allocate(&self, layout: Layout) -> Result<Chunk<Self>, Self::Error> {
        fn round_up(addr: usize, layout: Layout) -> usize {
            (addr + layout.align() - 1) & !(layout.align() - 1)
        }

        let mut trial = map(layout.size())?;
        if trial.as_ptr() as usize % layout.align() == 0 {
            let ptr = NonNull::new(trial.as_mut_ptr()).ok_or(io::ErrorKind::OutOfMemory)?;
            // SAFETY: `Chunk` is allocated from self.
            return Ok(unsafe { Chunk::new(ptr, layout, ManuallyDrop::new(trial)) });
        }

        drop(trial);
        let mut a = map(layout.size() + layout.align())?;
        let base = a.as_mut_ptr();
        let offset = round_up(base as usize, layout) - base as usize;
        // SAFETY: `offset < layout.align()`, so the result stays within the mapping.
        let ptr = NonNull::new(unsafe { base.add(offset) }).ok_or(io::ErrorKind::OutOfMemory)?;

        // SAFETY: `Chunk` is allocated from self.
        Ok(unsafe { Chunk::new(ptr, layout, ManuallyDrop::new(a)) })
    }

    unsafe fn deallocate(chunk: &mut Chunk<Self>) {
        unsafe { ManuallyDrop::drop(&mut chunk.handle) }
    }

    fn page_size(&self) -> usize {
        // SAFETY: `sysconf` has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 1 << PAGE_SHIFT }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn aligned_to_size() {
        let base = Mmap::new();
        for shift in [12, 13, 14] {
            let layout = Layout::from_size_align(1 << shift, 1 << shift).unwrap();
            let mut chunks = Vec::new();
            for _ in 0..8 {
                let chunk = base.allocate(layout).unwrap();
                assert_eq!(chunk.pointer().as_ptr() as usize % (1 << shift), 0);
                // SAFETY: The chunk owns at least `1 << shift` bytes.
                unsafe { chunk.pointer().as_ptr().add((1 << shift) - 1).write(0xaa) };
                chunks.push(chunk);
            }
        }
    }

    #[test]
    fn page_size() {
        assert!(Mmap.page_size().is_power_of_two());
    }
}
