use core::ptr::NonNull;
use std::sync::OnceLock;

use crate::{Inconsistency, MemKind, stat::Stat};

pub type Base = crate::base::Mmap;

pub type Context = crate::AllocatorContext<Base, MemKind>;
pub type Error = crate::Error<Base>;

static CONTEXT: OnceLock<Context> = OnceLock::new();

/// The process-wide internal allocator backed by anonymous mappings.
///
/// This is the interface of a single lazily created [`Context`]; every
/// function forwards to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Internal;

impl Internal {
    /// Retrieves the global context, creating it on first use.
    pub fn context(&self) -> &'static Context {
        CONTEXT.get_or_init(|| {
            let cx = Context::new(Base::new());
            log!(debug, "internal allocator initialized with {} byte pages", cx.page_size());
            cx
        })
    }

    /// Creates the global context eagerly.
    pub fn init(&self) {
        self.context();
    }

    /// See [`AllocatorContext::register_fixed_kind`](crate::AllocatorContext::register_fixed_kind).
    pub fn register_fixed_kind(&self, kind: MemKind, size: usize) {
        self.context().register_fixed_kind(kind, size)
    }

    pub fn try_alloc_fixed(&self, kind: MemKind) -> Result<NonNull<u8>, Error> {
        self.context().try_alloc_fixed(kind)
    }

    pub fn alloc_fixed(&self, kind: MemKind) -> NonNull<u8> {
        self.context().alloc_fixed(kind)
    }

    /// # Safety
    ///
    /// See [`AllocatorContext::free_fixed`](crate::AllocatorContext::free_fixed).
    pub unsafe fn free_fixed(&self, ptr: *mut u8, kind: MemKind) {
        unsafe { self.context().free_fixed(ptr, kind) }
    }

    pub fn try_alloc_dynamic(&self, size: usize, kind: MemKind) -> Result<NonNull<u8>, Error> {
        self.context().try_alloc_dynamic(size, kind)
    }

    pub fn alloc_dynamic(&self, size: usize, kind: MemKind) -> NonNull<u8> {
        self.context().alloc_dynamic(size, kind)
    }

    /// # Safety
    ///
    /// See [`AllocatorContext::free_dynamic`](crate::AllocatorContext::free_dynamic).
    pub unsafe fn free_dynamic(&self, ptr: *mut u8, size: usize, kind: MemKind) {
        unsafe { self.context().free_dynamic(ptr, size, kind) }
    }

    pub fn stat(&self) -> Stat {
        self.context().stat()
    }

    pub fn report(&self) {
        self.context().report()
    }

    /// See [`AllocatorContext::check_consistency`](crate::AllocatorContext::check_consistency).
    pub fn check_consistency(&self) -> Result<(), Inconsistency> {
        self.context().check_consistency()
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    #[test]
    fn shared() {
        Internal.init();
        Internal.register_fixed_kind(MemKind::EphemeronLink, 16);

        let addrs = thread::scope(|s| {
            let handles = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        let ptr = Internal.alloc_fixed(MemKind::EphemeronLink);
                        let buf = Internal.alloc_dynamic(300, MemKind::JobQueueEntry);
                        unsafe { Internal.free_dynamic(buf.as_ptr(), 300, MemKind::JobQueueEntry) };
                        ptr.as_ptr() as usize
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });

        let mut sorted = addrs.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), addrs.len());

        for addr in addrs {
            unsafe { Internal.free_fixed(addr as *mut u8, MemKind::EphemeronLink) };
        }
        assert!(std::ptr::eq(Internal.context(), Internal.context()));
    }
}
