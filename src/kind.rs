//! Kinds of internal memory and the fixed-size registry.

use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering::*},
};

/// A category of internal memory, used for fixed-size registration and for
/// usage accounting.
pub trait InternalKind: Copy + fmt::Debug + 'static {
    /// Every kind, in index order.
    const ALL: &'static [Self];

    /// The position of this kind in [`ALL`](Self::ALL).
    fn index(self) -> usize;

    /// A short human-readable name, used in usage dumps.
    fn description(self) -> &'static str;
}

macro_rules! mem_kinds {
    ($($(#[$attr:meta])* $name:ident => $desc:literal,)*) => {
        /// The kinds of internal memory of the garbage collector.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum MemKind {
            $($(#[$attr])* $name,)*
        }

        impl InternalKind for MemKind {
            const ALL: &'static [Self] = &[$(MemKind::$name,)*];

            fn index(self) -> usize {
                self as usize
            }

            fn description(self) -> &'static str {
                match self {
                    $(MemKind::$name => $desc,)*
                }
            }
        }
    };
}

mem_kinds! {
    PinQueue => "pin-queue",
    Fragment => "fragment",
    Section => "section",
    ScanStarts => "scan-starts",
    FinTable => "fin-table",
    FinalizeEntry => "finalize-entry",
    FinalizeReadyEntry => "finalize-ready-entry",
    DislinkTable => "dislink-table",
    Dislink => "dislink",
    RootsTable => "roots-table",
    RootRecord => "root-record",
    Statistics => "statistics",
    StatPinnedClass => "pinned-class",
    StatRemsetClass => "remset-class",
    GrayQueue => "gray-queue",
    MsTables => "marksweep-tables",
    MsBlockInfo => "marksweep-block-info",
    MsBlockInfoSort => "marksweep-block-info-sort",
    EphemeronLink => "ephemeron-link",
    WorkerData => "worker-data",
    WorkerJobData => "worker-job-data",
    BridgeData => "bridge-data",
    OldBridgeHashTable => "old-bridge-hash-table",
    OldBridgeHashTableEntry => "old-bridge-hash-table-entry",
    BridgeHashTable => "bridge-hash-table",
    BridgeHashTableEntry => "bridge-hash-table-entry",
    TarjanBridgeHashTable => "tarjan-bridge-hash-table",
    TarjanBridgeHashTableEntry => "tarjan-bridge-hash-table-entry",
    TarjanObjBucket => "tarjan-bridge-object-buckets",
    BridgeAliveHashTable => "bridge-alive-hash-table",
    BridgeAliveHashTableEntry => "bridge-alive-hash-table-entry",
    BridgeDebug => "bridge-debug",
    JobQueueEntry => "job-queue-entry",
    ToggleRefData => "toggleref-data",
    CardTableModUnion => "cardtable-mod-union",
    BinaryProtocol => "binary-protocol",
}

const UNREGISTERED: usize = usize::MAX;

/// The size class index registered for each kind.
#[derive(Debug)]
pub(crate) struct Registry {
    slots: Box<[AtomicUsize]>,
}

impl Registry {
    pub fn new(count: usize) -> Self {
        Registry {
            slots: (0..count).map(|_| AtomicUsize::new(UNREGISTERED)).collect(),
        }
    }

    /// Records `class` for the kind at `index`.
    ///
    /// Registering the same class again is a no-op; a different one is a
    /// fatal programming error.
    pub fn register(&self, index: usize, class: usize, description: &str) {
        let slot = &self.slots[index];
        if let Err(current) = slot.compare_exchange(UNREGISTERED, class, AcqRel, Acquire) {
            assert_eq!(
                current, class,
                "kind {description} is already registered with another size class"
            );
        }
    }

    pub fn lookup(&self, index: usize) -> Option<usize> {
        let class = self.slots[index].load(Acquire);
        (class != UNREGISTERED).then_some(class)
    }
}
