#![no_main]

use std::{iter, ptr::NonNull, sync::Mutex, thread};

use lfslab::{AllocatorContext, InternalKind, MemKind, base::Mmap};
use libfuzzer_sys::{arbitrary::Arbitrary, fuzz_target};

const THREADS: usize = 12;
const TRANSFER_COUNT: usize = 1000;

type Context = AllocatorContext<Mmap, MemKind>;

#[derive(Debug, Arbitrary)]
enum Action {
    Allocate { size: u16, kind: u8 },
    Deallocate { index: u8 },
    Check { index: u8 },
    Transfer { from: u8, to: u8 },
}

fuzz_target!(|action_sets: [Vec<Action>; THREADS]| {
    let cx = Context::new(Mmap::new());
    let transfers: Vec<_> = iter::repeat_with(|| Mutex::new(None))
        .take(TRANSFER_COUNT)
        .collect();

    thread::scope(|s| {
        for actions in action_sets {
            let (cx, transfers) = (&cx, &transfers);
            s.spawn(move || fuzz_one(actions, transfers, cx));
        }
    });

    drop(transfers);
    cx.check_consistency().unwrap();
    cx.stat().assert_clean();
});

fn fuzz_one<'a>(actions: Vec<Action>, transfers: &[Mutex<Option<Allocation<'a>>>], cx: &'a Context) {
    let mut allocations = Vec::new();

    for action in actions {
        match action {
            Action::Allocate { size, kind } => {
                let kind = MemKind::ALL[kind as usize % MemKind::ALL.len()];
                allocations.push(Allocation::new(size as usize % 20000, kind, cx));
            }
            Action::Deallocate { index } => {
                if let Some(index) = (index as usize).checked_rem(allocations.len()) {
                    drop(allocations.swap_remove(index));
                }
            }
            Action::Check { index } => {
                if let Some(index) = (index as usize).checked_rem(allocations.len()) {
                    allocations[index].check();
                }
            }
            Action::Transfer { from, to } => {
                let Some(from) = (from as usize).checked_rem(allocations.len()) else {
                    continue;
                };
                let to = to as usize % transfers.len();
                let a = allocations.swap_remove(from);
                if let Some(a) = transfers[to].lock().unwrap().replace(a) {
                    allocations.push(a);
                }
            }
        }
    }
}

struct Allocation<'a> {
    ptr: NonNull<u8>,
    size: usize,
    kind: MemKind,
    cx: &'a Context,
}

// SAFETY: The allocation is exclusively owned, and the context is shared.
unsafe impl Send for Allocation<'_> {}

impl<'a> Allocation<'a> {
    fn new(size: usize, kind: MemKind, cx: &'a Context) -> Self {
        let ptr = cx.alloc_dynamic(size, kind);
        if size > 0 {
            unsafe {
                assert_eq!(ptr.read(), 0, "fresh block {ptr:p} is not zeroed");
                ptr.write(0xcc);
                ptr.add(size / 2).write(0xcc);
                ptr.add(size - 1).write(0xcc);
            }
        }
        Allocation { ptr, size, kind, cx }
    }

    fn check(&self) {
        if self.size > 0 {
            unsafe {
                assert_eq!(self.ptr.read(), 0xcc);
                assert_eq!(self.ptr.add(self.size / 2).read(), 0xcc);
                assert_eq!(self.ptr.add(self.size - 1).read(), 0xcc);
            }
        }
    }
}

impl Drop for Allocation<'_> {
    fn drop(&mut self) {
        self.check();
        unsafe { self.cx.free_dynamic(self.ptr.as_ptr(), self.size, self.kind) };
    }
}
