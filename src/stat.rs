use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering::*},
};

use crate::size_class::SIZE_CLASS_COUNT;

/// The live counters of a single heap.
#[derive(Debug, Default)]
pub(crate) struct ClassCounters {
    pub allocations: AtomicUsize,
    pub live_slots: AtomicUsize,
    pub reserved: AtomicUsize,
    pub released: AtomicUsize,
}

impl ClassCounters {
    pub fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Relaxed);
    }

    pub fn drop_one(counter: &AtomicUsize) {
        counter.fetch_sub(1, Relaxed);
    }

    fn snapshot(&self, slot_size: usize, block_size: usize) -> ClassStat {
        ClassStat {
            slot_size,
            block_size,
            allocations: self.allocations.load(Relaxed),
            live_slots: self.live_slots.load(Relaxed),
            superblocks_reserved: self.reserved.load(Relaxed),
            superblocks_released: self.released.load(Relaxed),
        }
    }
}

/// The usage of a single size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClassStat {
    pub slot_size: usize,
    pub block_size: usize,
    /// Every slot ever allocated from this class.
    pub allocations: usize,
    pub live_slots: usize,
    pub superblocks_reserved: usize,
    pub superblocks_released: usize,
}

impl ClassStat {
    pub fn outstanding_superblocks(&self) -> usize {
        self.superblocks_reserved - self.superblocks_released
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding_superblocks() * self.block_size
    }
}

/// The outstanding bytes charged to a kind of internal memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KindStat {
    pub description: &'static str,
    pub bytes: usize,
}

/// A snapshot of the allocator's usage.
///
/// Counters are read one by one while other threads may still allocate, so
/// a snapshot is only exact when taken at a quiescent point.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Stat {
    pub classes: [ClassStat; SIZE_CLASS_COUNT],
    pub kinds: Vec<KindStat>,

    pub large_size: usize,
    pub large_count: usize,

    pub descriptor_batches: usize,
}

impl Stat {
    pub(crate) fn collect<'a>(
        classes: impl Iterator<Item = (&'a ClassCounters, usize, usize)>,
        kinds: Vec<KindStat>,
        large_size: usize,
        large_count: usize,
        descriptor_batches: usize,
    ) -> Self {
        let mut stat = Stat {
            classes: [ClassStat::default(); SIZE_CLASS_COUNT],
            kinds,
            large_size,
            large_count,
            descriptor_batches,
        };
        for (slot, (counters, slot_size, block_size)) in stat.classes.iter_mut().zip(classes) {
            *slot = counters.snapshot(slot_size, block_size);
        }
        stat
    }

    /// The bytes of every superblock currently reserved.
    pub fn superblock_size(&self) -> usize {
        self.classes.iter().map(ClassStat::outstanding_bytes).sum()
    }

    pub fn live_slots(&self) -> usize {
        self.classes.iter().map(|class| class.live_slots).sum()
    }

    /// Asserts that nothing allocated is outstanding.
    ///
    /// Superblocks may still be cached as the active ones of their heaps, so
    /// only slots and oversized allocations are checked.
    pub fn assert_clean(&self) {
        assert_eq!(
            self.live_slots(),
            0,
            "{} slot(s) is(are) probably leaked",
            self.live_slots()
        );
        assert_eq!(
            self.large_count, 0,
            "{} large allocation(s) is(are) probably leaked",
            self.large_count
        );
        if let Some(kind) = self.kinds.iter().find(|kind| kind.bytes != 0) {
            panic!("{} byte(s) of {} are probably leaked", kind.bytes, kind.description);
        }
    }

    /// Dumps the usage per kind, one XML element per line, followed by the
    /// oversized allocations.
    pub fn dump(&self, f: &mut impl fmt::Write) -> fmt::Result {
        for kind in &self.kinds {
            writeln!(
                f,
                "<other-mem-usage type=\"{}\" size=\"{}\"/>",
                kind.description, kind.bytes
            )?;
        }
        writeln!(
            f,
            "<other-mem-usage type=\"large-internal\" size=\"{}\"/>",
            self.large_size
        )
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dump(f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dump() {
        let counters = ClassCounters::default();
        ClassCounters::bump(&counters.allocations);
        ClassCounters::bump(&counters.live_slots);
        ClassCounters::bump(&counters.reserved);

        let kinds = vec![
            KindStat { description: "pin-queue", bytes: 16 },
            KindStat { description: "fragment", bytes: 0 },
        ];
        let stat = Stat::collect(
            core::iter::repeat((&counters, 16, 4096)).take(SIZE_CLASS_COUNT),
            kinds,
            8192,
            1,
            1,
        );
        assert_eq!(stat.superblock_size(), 4096 * SIZE_CLASS_COUNT);
        assert_eq!(stat.live_slots(), SIZE_CLASS_COUNT);
        assert_eq!(
            stat.to_string(),
            "<other-mem-usage type=\"pin-queue\" size=\"16\"/>\n\
             <other-mem-usage type=\"fragment\" size=\"0\"/>\n\
             <other-mem-usage type=\"large-internal\" size=\"8192\"/>\n"
        );
    }

    #[test]
    #[should_panic = "probably leaked"]
    fn leak() {
        let counters = ClassCounters::default();
        ClassCounters::bump(&counters.live_slots);
        let stat = Stat::collect(
            core::iter::once((&counters, 8, 4096)),
            Vec::new(),
            0,
            0,
            0,
        );
        stat.assert_clean();
    }
}
