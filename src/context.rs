use core::{
    alloc::Layout,
    fmt,
    marker::PhantomData,
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering::*},
};

use array_macro::array;

use crate::{
    base::{BaseAlloc, Chunk},
    check::{self, Inconsistency},
    descriptor::pool::DescriptorPool,
    heap::Heap,
    kind::{InternalKind, MemKind, Registry},
    size_class::{MAX_SLOT_SIZE, SIZE_CLASS_COUNT, SizeClass, index_for_size},
    stat::{KindStat, Stat},
};

/// The alignment of oversized allocations as seen by callers.
const LARGE_ALIGN: usize = 16;

/// The bytes in front of an oversized allocation recording its chunk.
const fn large_header<B: BaseAlloc>() -> usize {
    size_of::<Chunk<B>>().next_multiple_of(LARGE_ALIGN)
}

/// The errors of the fallible allocation functions.
#[derive(Debug)]
pub enum Error<B: BaseAlloc> {
    /// The base error returned when a reservation failed.
    Alloc(B::Error),
    /// The requested size cannot be laid out.
    Layout(usize),
}

impl<B: BaseAlloc> fmt::Display for Error<B>
where
    B::Error: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Alloc(err) => write!(f, "base allocation failed: {err}"),
            Error::Layout(size) => write!(f, "invalid allocation size: {size}"),
        }
    }
}

/// An internal memory allocator: one lock-free heap per size class, fed by
/// a shared descriptor pool and a base allocator.
///
/// Every function takes `&self` and may be called from any number of
/// threads concurrently. Dropping the context releases every superblock and
/// descriptor it still holds; slots allocated from it must not be used
/// afterwards.
///
/// # Examples
///
/// ```
/// use lfslab::{AllocatorContext, MemKind, base::System};
///
/// let cx = AllocatorContext::<_, MemKind>::new(System);
/// cx.register_fixed_kind(MemKind::Fragment, 48);
///
/// let ptr = cx.alloc_fixed(MemKind::Fragment);
/// unsafe { cx.free_fixed(ptr.as_ptr(), MemKind::Fragment) };
///
/// let buf = cx.alloc_dynamic(100, MemKind::PinQueue);
/// unsafe { cx.free_dynamic(buf.as_ptr(), 100, MemKind::PinQueue) };
/// ```
pub struct AllocatorContext<B: BaseAlloc, K: InternalKind = MemKind> {
    heaps: [Heap<B>; SIZE_CLASS_COUNT],
    pool: DescriptorPool<B>,
    registry: Registry,
    kind_bytes: Box<[AtomicUsize]>,
    large_size: AtomicUsize,
    large_count: AtomicUsize,
    page_size: usize,
    base: B,
    marker: PhantomData<fn(K)>,
}

impl<B: BaseAlloc, K: InternalKind> fmt::Debug for AllocatorContext<B, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorContext")
            .field("page_size", &self.page_size)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl<B: BaseAlloc + Default, K: InternalKind> Default for AllocatorContext<B, K> {
    fn default() -> Self {
        Self::new(B::default())
    }
}

impl<B: BaseAlloc, K: InternalKind> AllocatorContext<B, K> {
    /// Creates a new context, deriving every superblock size from the page
    /// size of `base`.
    ///
    /// Nothing is reserved until the first allocation.
    pub fn new(base: B) -> Self {
        let page_size = base.page_size();
        assert!(
            page_size.is_power_of_two(),
            "page size {page_size} is not a power of two"
        );
        AllocatorContext {
            heaps: array![index => Heap::new(SizeClass::new(index, page_size)); SIZE_CLASS_COUNT],
            pool: DescriptorPool::new(),
            registry: Registry::new(K::ALL.len()),
            kind_bytes: K::ALL.iter().map(|_| AtomicUsize::new(0)).collect(),
            large_size: AtomicUsize::new(0),
            large_count: AtomicUsize::new(0),
            page_size,
            base,
            marker: PhantomData,
        }
    }

    /// Retrieves the base allocator of this context.
    pub fn base(&self) -> &B {
        &self.base
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The size class at `index`, as derived for this context's page size.
    pub fn size_class(&self, index: usize) -> SizeClass {
        self.heaps[index].class()
    }

    /// Binds `kind` to the smallest size class holding `size` bytes.
    ///
    /// Registering a kind again with a size of the same class is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if `size` exceeds the largest size class, or if `kind` is
    /// already bound to another size class.
    pub fn register_fixed_kind(&self, kind: K, size: usize) {
        let Some(class) = index_for_size(size) else {
            panic!(
                "fixed size {size} of {} exceeds the largest size class {MAX_SLOT_SIZE}",
                kind.description()
            )
        };
        self.registry
            .register(kind.index(), class, kind.description());
    }

    fn fixed_heap(&self, kind: K) -> &Heap<B> {
        match self.registry.lookup(kind.index()) {
            Some(class) => &self.heaps[class],
            None => panic!("{} is not registered as a fixed-size kind", kind.description()),
        }
    }

    fn alloc_small(&self, heap: &Heap<B>, kind: K, zeroed: usize) -> Result<NonNull<u8>, Error<B>> {
        let slot = heap.allocate(&self.base, &self.pool).map_err(Error::Alloc)?;
        // SAFETY: The slot holds at least `zeroed` bytes.
        unsafe { slot.write_bytes(0, zeroed) };
        self.kind_bytes[kind.index()].fetch_add(heap.class().slot_size, Relaxed);
        Ok(slot)
    }

    /// # Safety
    ///
    /// See [`free_dynamic`](Self::free_dynamic).
    unsafe fn free_small(&self, heap: &Heap<B>, ptr: NonNull<u8>, kind: K) {
        // SAFETY: The contract is passed to the caller.
        unsafe { heap.deallocate(ptr, &self.pool) };
        self.kind_bytes[kind.index()].fetch_sub(heap.class().slot_size, Relaxed);
    }

    /// Allocates a zeroed object of a registered fixed-size kind.
    ///
    /// # Panics
    ///
    /// Panics if `kind` is not registered.
    pub fn try_alloc_fixed(&self, kind: K) -> Result<NonNull<u8>, Error<B>> {
        let heap = self.fixed_heap(kind);
        self.alloc_small(heap, kind, heap.class().slot_size)
    }

    /// Like [`try_alloc_fixed`](Self::try_alloc_fixed), treating the
    /// exhaustion of the base allocator as fatal.
    pub fn alloc_fixed(&self, kind: K) -> NonNull<u8>
    where
        B::Error: fmt::Display,
    {
        self.try_alloc_fixed(kind)
            .unwrap_or_else(|err| fatal(err, self.fixed_heap(kind).class().slot_size, kind))
    }

    /// Frees an object of a fixed-size kind. Freeing a null pointer is a
    /// no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or allocated from this context with
    /// [`alloc_fixed`](Self::alloc_fixed) of the same `kind`, and not freed
    /// since.
    pub unsafe fn free_fixed(&self, ptr: *mut u8, kind: K) {
        if let Some(ptr) = NonNull::new(ptr) {
            // SAFETY: The contract is passed to the caller.
            unsafe { self.free_small(self.fixed_heap(kind), ptr, kind) }
        }
    }

    /// Allocates `size` zeroed bytes, aligned to at least 8 bytes.
    ///
    /// Sizes beyond the largest size class are reserved from the base
    /// allocator directly.
    pub fn try_alloc_dynamic(&self, size: usize, kind: K) -> Result<NonNull<u8>, Error<B>> {
        match index_for_size(size) {
            Some(class) => self.alloc_small(&self.heaps[class], kind, size),
            None => self.alloc_large(size),
        }
    }

    /// Like [`try_alloc_dynamic`](Self::try_alloc_dynamic), treating the
    /// exhaustion of the base allocator as fatal.
    pub fn alloc_dynamic(&self, size: usize, kind: K) -> NonNull<u8>
    where
        B::Error: fmt::Display,
    {
        self.try_alloc_dynamic(size, kind)
            .unwrap_or_else(|err| fatal(err, size, kind))
    }

    /// Frees `size` bytes allocated by
    /// [`alloc_dynamic`](Self::alloc_dynamic). Freeing a null pointer is a
    /// no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or allocated from this context with the same
    /// `size` and `kind`, and not freed since.
    pub unsafe fn free_dynamic(&self, ptr: *mut u8, size: usize, kind: K) {
        let Some(ptr) = NonNull::new(ptr) else { return };
        match index_for_size(size) {
            // SAFETY: The contract is passed to the caller.
            Some(class) => unsafe { self.free_small(&self.heaps[class], ptr, kind) },
            // SAFETY: As above.
            None => unsafe { self.free_large(ptr, size) },
        }
    }

    fn alloc_large(&self, size: usize) -> Result<NonNull<u8>, Error<B>> {
        const { assert!(align_of::<Chunk<B>>() <= LARGE_ALIGN) };
        let header = large_header::<B>();

        let layout = size
            .checked_add(header)
            .and_then(|total| Layout::from_size_align(total, self.page_size).ok())
            .ok_or(Error::Layout(size))?;
        let chunk = self.base.allocate(layout).map_err(Error::Alloc)?;
        let start = chunk.pointer();
        if !B::IS_ZEROED {
            // SAFETY: The chunk holds `layout`.
            unsafe { start.write_bytes(0, layout.size()) };
        }
        // SAFETY: The header is within the chunk and aligned for `Chunk<B>`.
        let ptr = unsafe {
            start.cast::<Chunk<B>>().write(chunk);
            start.add(header)
        };

        self.large_size.fetch_add(size, Relaxed);
        self.large_count.fetch_add(1, Relaxed);
        log!(trace, "reserved {size} bytes of large internal memory at {ptr:p}");
        Ok(ptr)
    }

    /// # Safety
    ///
    /// `ptr` must come from [`alloc_large`](Self::alloc_large) with `size`.
    unsafe fn free_large(&self, ptr: NonNull<u8>, size: usize) {
        let header = large_header::<B>();
        // SAFETY: `alloc_large` put the chunk right in front of `ptr`.
        let chunk = unsafe {
            let start = ptr.sub(header);
            ptr::read(start.cast::<Chunk<B>>().as_ptr())
        };
        assert_eq!(
            chunk.layout().size(),
            size + header,
            "{ptr:p} was not allocated with {size} bytes"
        );
        self.large_size.fetch_sub(size, Relaxed);
        self.large_count.fetch_sub(1, Relaxed);
        log!(trace, "released {size} bytes of large internal memory at {ptr:p}");
        drop(chunk)
    }

    /// Takes a snapshot of the usage counters.
    pub fn stat(&self) -> Stat {
        let classes = self.heaps.iter().map(|heap| {
            let class = heap.class();
            (&heap.counters, class.slot_size, class.block_size)
        });
        let kinds = K::ALL
            .iter()
            .map(|kind| KindStat {
                description: kind.description(),
                bytes: self.kind_bytes[kind.index()].load(Relaxed),
            })
            .collect();
        Stat::collect(
            classes,
            kinds,
            self.large_size.load(Relaxed),
            self.large_count.load(Relaxed),
            self.pool.batch_count(),
        )
    }

    /// Logs the allocation counts of every size class in use.
    pub fn report(&self) {
        let stat = self.stat();
        for class in stat.classes.iter().filter(|class| class.allocations > 0) {
            log!(
                info,
                "{} bytes: {} allocations, {} live, {} superblock(s) of {} bytes",
                class.slot_size,
                class.allocations,
                class.live_slots,
                class.outstanding_superblocks(),
                class.block_size
            );
        }
        log!(
            info,
            "large: {} allocation(s) of {} bytes; {} descriptor batch(es)",
            stat.large_count,
            stat.large_size,
            stat.descriptor_batches
        );
    }

    /// Verifies the descriptors owned by every heap, and that the slots
    /// taken from every superblock, reachable or full, match the live slots
    /// of its class.
    ///
    /// Only meaningful at a quiescent point, i.e. while no other thread
    /// allocates from or frees into this context.
    pub fn check_consistency(&self) -> Result<(), Inconsistency> {
        self.heaps
            .iter()
            .try_for_each(|heap| check::check_heap(heap, &self.pool))?;
        check::check_conservation(&self.heaps, &self.pool)
    }
}

#[cold]
#[track_caller]
fn fatal<B: BaseAlloc, K: InternalKind>(err: Error<B>, size: usize, kind: K) -> !
where
    B::Error: fmt::Display,
{
    log!(
        error,
        "failed to allocate {size} bytes of internal memory for {}: {err}",
        kind.description()
    );
    panic!(
        "failed to allocate {size} bytes of internal memory for {}: {err}",
        kind.description()
    )
}

#[cfg(test)]
mod test {
    use core::alloc::Layout;
    use std::panic::{self, AssertUnwindSafe};

    use super::*;
    use crate::base::{AllocError, Counter, Counting, System};

    #[derive(Debug, Default)]
    struct Exhausted;

    unsafe impl BaseAlloc for Exhausted {
        const IS_ZEROED: bool = true;

        type Handle = ();
        type Error = AllocError;

        fn allocate(&self, layout: Layout) -> Result<Chunk<Self>, Self::Error> {
            Err(AllocError(layout))
        }

        unsafe fn deallocate(_: &mut Chunk<Self>) {}
    }

    #[test]
    fn fixed() {
        let cx = AllocatorContext::<_, MemKind>::new(System);
        cx.register_fixed_kind(MemKind::Dislink, 20);
        cx.register_fixed_kind(MemKind::Dislink, 24);

        let a = cx.alloc_fixed(MemKind::Dislink);
        let slice = unsafe { core::slice::from_raw_parts(a.as_ptr(), 24) };
        assert!(slice.iter().all(|&b| b == 0));
        assert_eq!(a.as_ptr() as usize % 8, 0);

        unsafe { a.write_bytes(0xcc, 24) };
        unsafe { cx.free_fixed(a.as_ptr(), MemKind::Dislink) };
        let b = cx.alloc_fixed(MemKind::Dislink);
        assert_eq!(a, b);
        let slice = unsafe { core::slice::from_raw_parts(b.as_ptr(), 24) };
        assert!(slice.iter().all(|&b| b == 0), "reused slot is not zeroed");

        unsafe { cx.free_fixed(b.as_ptr(), MemKind::Dislink) };
        unsafe { cx.free_fixed(ptr::null_mut(), MemKind::Dislink) };
        cx.stat().assert_clean();
    }

    #[test]
    #[should_panic = "not registered"]
    fn unregistered() {
        let cx = AllocatorContext::<_, MemKind>::new(System);
        cx.alloc_fixed(MemKind::Section);
    }

    #[test]
    #[should_panic = "exceeds the largest size class"]
    fn oversized_fixed() {
        let cx = AllocatorContext::<_, MemKind>::new(System);
        cx.register_fixed_kind(MemKind::Section, MAX_SLOT_SIZE + 1);
    }

    #[test]
    fn large() {
        static COUNTER: Counter = Counter::new();
        let cx = AllocatorContext::<_, MemKind>::new(Counting::new(System, &COUNTER));

        let size = MAX_SLOT_SIZE + 1;
        let ptr = cx.alloc_dynamic(size, MemKind::BinaryProtocol);
        assert_eq!(ptr.as_ptr() as usize % LARGE_ALIGN, 0);
        assert_eq!(COUNTER.reserved(), 1);
        assert_eq!(cx.stat().large_size, size);
        assert_eq!(cx.stat().descriptor_batches, 0);

        unsafe {
            ptr.write_bytes(0xaa, size);
            cx.free_dynamic(ptr.as_ptr(), size, MemKind::BinaryProtocol);
        }
        assert_eq!(COUNTER.outstanding(), 0);
        cx.stat().assert_clean();
    }

    #[test]
    fn exhaustion() {
        let cx = AllocatorContext::<_, MemKind>::new(Exhausted);
        assert!(matches!(
            cx.try_alloc_dynamic(64, MemKind::GrayQueue),
            Err(Error::Alloc(_))
        ));
        assert!(matches!(
            cx.try_alloc_dynamic(MAX_SLOT_SIZE * 2, MemKind::GrayQueue),
            Err(Error::Alloc(_))
        ));
        assert!(matches!(
            cx.try_alloc_dynamic(usize::MAX - 8, MemKind::GrayQueue),
            Err(Error::Layout(_))
        ));
    }

    #[test]
    fn fatal_exhaustion() {
        let cx = AllocatorContext::<_, MemKind>::new(Exhausted);
        let err = panic::catch_unwind(AssertUnwindSafe(|| {
            cx.alloc_dynamic(32, MemKind::WorkerData);
        }))
        .unwrap_err();
        let message = err.downcast_ref::<String>().unwrap();
        assert!(message.contains("worker-data"), "{message}");
        assert!(message.contains("32 bytes"), "{message}");
    }

    #[test]
    fn kind_accounting() {
        let cx = AllocatorContext::<_, MemKind>::new(System);
        let a = cx.alloc_dynamic(100, MemKind::RootRecord);
        let b = cx.alloc_dynamic(100, MemKind::RootRecord);
        let slot_size = cx.size_class(index_for_size(100).unwrap()).slot_size;

        let stat = cx.stat();
        let root = stat.kinds[MemKind::RootRecord.index()];
        assert_eq!(root.description, "root-record");
        assert_eq!(root.bytes, slot_size * 2);
        assert!(stat.to_string().contains(&format!(
            "<other-mem-usage type=\"root-record\" size=\"{}\"/>",
            slot_size * 2
        )));

        unsafe {
            cx.free_dynamic(a.as_ptr(), 100, MemKind::RootRecord);
            cx.free_dynamic(b.as_ptr(), 100, MemKind::RootRecord);
        }
        cx.stat().assert_clean();
        cx.check_consistency().unwrap();
    }
}
