//! Ported from `mstress`.

use std::{
    iter, mem,
    ptr::NonNull,
    slice,
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};

use lfslab::{AllocatorContext, MemKind, base::Mmap};

const COOKIE: usize = 0xbf58476d1ce4e5b9;
const THREADS: usize = 6;
#[cfg(not(debug_assertions))]
const SCALE: usize = 5000;
#[cfg(debug_assertions)]
const SCALE: usize = 10;
#[cfg(not(debug_assertions))]
const ITER: usize = 25;
#[cfg(debug_assertions)]
const ITER: usize = 1;
#[cfg(not(debug_assertions))]
const TRANSFER_COUNT: usize = 1000;
#[cfg(debug_assertions)]
const TRANSFER_COUNT: usize = 20;

type Context = AllocatorContext<Mmap, MemKind>;

fn main() {
    let cx = Context::new(Mmap::new());
    println!("lfslab: {:?}", do_bench(&cx));

    let stat = cx.stat();
    stat.assert_clean();
    cx.check_consistency().expect("allocator is inconsistent after the run");
    print!("{stat}");
}

fn do_bench(cx: &Context) -> Duration {
    let mut transfer: Vec<_> = iter::repeat_with(|| Mutex::new(None))
        .take(TRANSFER_COUNT)
        .collect();
    let start = Instant::now();
    for _i in 0..ITER {
        thread::scope(|s| {
            let transfer = &transfer;
            for tid in 0..THREADS {
                s.spawn(move || bench_one(tid, transfer, cx));
            }
        });
        (transfer.iter_mut().filter(|_| probably(50))).for_each(|t| *t.get_mut().unwrap() = None)
    }
    drop(transfer);
    start.elapsed()
}

fn bench_one<'a>(tid: usize, transfer: &[Mutex<Option<Items<'a>>>], cx: &'a Context) {
    let mut alloc_count: usize = SCALE * (tid % 8 + 1);
    let mut retain_count: usize = alloc_count / 2;

    let mut retained = Vec::with_capacity(retain_count);
    let mut data = Vec::new();

    while alloc_count > 0 || retain_count > 0 {
        if retain_count == 0 || (probably(50) && alloc_count > 0) {
            data.push(Some(Items::new(1 << fastrand::u32(0..5), cx)));
            alloc_count -= 1;
        } else {
            retained.push(Some(Items::new(1 << fastrand::u32(0..5), cx)));
            retain_count -= 1;
        }

        if probably(67) && !data.is_empty() {
            let index = fastrand::usize(0..data.len());
            data[index] = None;
        }

        if probably(25) && !data.is_empty() {
            let di = fastrand::usize(0..data.len());
            let ti = fastrand::usize(0..transfer.len());
            mem::swap(&mut data[di], &mut transfer[ti].lock().unwrap());
        }
    }
}

#[inline]
fn probably(p: u8) -> bool {
    fastrand::u8(0..=100) <= p
}

/// A block of words, each holding its distance to the end of the block.
struct Items<'a> {
    ptr: NonNull<usize>,
    len: usize,
    cx: &'a Context,
}

// SAFETY: The block is exclusively owned, and the context is shared.
unsafe impl Send for Items<'_> {}

impl<'a> Items<'a> {
    const KIND: MemKind = MemKind::WorkerJobData;

    fn new(count: usize, cx: &'a Context) -> Self {
        let len = if probably(1) {
            if probably(1) {
                count * 10000
            } else if probably(10) {
                count * 1000
            } else {
                count * 100
            }
        } else {
            count
        };

        let ptr = cx.alloc_dynamic(len * size_of::<usize>(), Self::KIND).cast::<usize>();
        let items = Items { ptr, len, cx };
        let words = unsafe { slice::from_raw_parts_mut(items.ptr.as_ptr(), len) };
        assert!(words.iter().all(|&w| w == 0), "fresh block {ptr:p} is not zeroed");
        for (index, word) in words.iter_mut().enumerate() {
            *word = (len - index) ^ COOKIE;
        }
        items
    }
}

impl Drop for Items<'_> {
    fn drop(&mut self) {
        let words = unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) };
        for (index, &value) in words.iter().enumerate() {
            assert_eq!(
                value ^ COOKIE,
                (self.len - index),
                "memory corruption at block {:p} at {index}",
                self.ptr
            )
        }
        let size = self.len * size_of::<usize>();
        unsafe { self.cx.free_dynamic(self.ptr.as_ptr().cast(), size, Self::KIND) };
    }
}
