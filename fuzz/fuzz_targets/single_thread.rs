#![no_main]

use std::ptr::NonNull;

use lfslab::{AllocatorContext, InternalKind, MemKind, base::System};
use libfuzzer_sys::{arbitrary::Arbitrary, fuzz_target};

#[derive(Debug, Arbitrary)]
enum Action {
    Allocate { size: u16, kind: u8 },
    AllocateFixed { kind: u8 },
    Deallocate { index: u8 },
    Check,
}

fn kind(index: u8) -> MemKind {
    MemKind::ALL[index as usize % MemKind::ALL.len()]
}

/// The fixed size registered for a kind.
fn fixed_size(kind: MemKind) -> usize {
    (kind.index() + 1) * 24
}

fuzz_target!(|actions: Vec<Action>| {
    let cx = AllocatorContext::<_, MemKind>::new(System);
    for &kind in MemKind::ALL {
        cx.register_fixed_kind(kind, fixed_size(kind));
    }

    // (pointer, size, kind, fixed, marker)
    let mut allocations: Vec<(NonNull<u8>, usize, MemKind, bool, u8)> = Vec::new();

    for (round, action) in actions.into_iter().enumerate() {
        match action {
            Action::Allocate { size, kind: k } => {
                let size = size as usize % 20000;
                let kind = kind(k);
                let ptr = cx.alloc_dynamic(size, kind);
                let marker = round as u8;
                if size > 0 {
                    unsafe { ptr.add(size / 2).write(marker) };
                }
                allocations.push((ptr, size, kind, false, marker));
            }
            Action::AllocateFixed { kind: k } => {
                let kind = kind(k);
                let ptr = cx.alloc_fixed(kind);
                let size = fixed_size(kind);
                let marker = round as u8;
                unsafe { ptr.add(size / 2).write(marker) };
                allocations.push((ptr, size, kind, true, marker));
            }
            Action::Deallocate { index } => {
                if let Some(index) = (index as usize).checked_rem(allocations.len()) {
                    let (ptr, size, kind, fixed, marker) = allocations.swap_remove(index);
                    if size > 0 {
                        assert_eq!(unsafe { ptr.add(size / 2).read() }, marker);
                    }
                    if fixed {
                        unsafe { cx.free_fixed(ptr.as_ptr(), kind) };
                    } else {
                        unsafe { cx.free_dynamic(ptr.as_ptr(), size, kind) };
                    }
                }
            }
            Action::Check => cx.check_consistency().unwrap(),
        }
    }

    for (ptr, size, kind, fixed, marker) in allocations {
        if size > 0 {
            assert_eq!(unsafe { ptr.add(size / 2).read() }, marker);
        }
        if fixed {
            unsafe { cx.free_fixed(ptr.as_ptr(), kind) };
        } else {
            unsafe { cx.free_dynamic(ptr.as_ptr(), size, kind) };
        }
    }
    cx.check_consistency().unwrap();
    cx.stat().assert_clean();
});
