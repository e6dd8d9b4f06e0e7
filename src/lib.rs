//! A lock-free slab allocator for the internal metadata of a garbage
//! collector.
//!
//! Small objects are carved out of superblocks, one heap per size class.
//! Every superblock has a descriptor whose packed anchor records its free
//! list, the number of free slots and its state, all updated by a single
//! compare-and-swap. Empty superblocks are given back to the base allocator
//! eagerly, and their descriptors are recycled through a pool protected by
//! hazard pointers. Sizes beyond the largest class go to the base allocator
//! directly.
//!
//! See [`AllocatorContext`] for the interface, and [`Internal`] for the
//! process-wide instance.

/// Forwards to the `log` facade if `error-log` is enabled.
macro_rules! log {
    ($level:ident, $($arg:tt)+) => {{
        #[cfg(feature = "error-log")]
        ::log::$level!($($arg)+);
        #[cfg(not(feature = "error-log"))]
        let _ = format_args!($($arg)+);
    }};
}

pub mod base;
mod check;
pub mod config {
    include!(concat!(env!("OUT_DIR"), "/config.rs"));
}
mod context;
mod descriptor;
#[cfg(feature = "global")]
pub mod global;
pub mod hazard;
mod heap;
pub mod kind;
mod partial;
pub mod size_class;
pub mod stat;
mod superblock;
mod track;

pub use self::{
    check::Inconsistency,
    context::{AllocatorContext, Error},
    kind::{InternalKind, MemKind},
};
#[cfg(feature = "global")]
pub use self::global::Internal;
