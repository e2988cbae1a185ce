use std::sync::atomic::{AtomicU64, Ordering};


/// Counters updated all over the data path. Reads are racy snapshots, which
/// is all a statistics interface needs.
#[derive(Debug, Default)]
pub(crate) struct Statistics {
    pub(crate) bios_in:                      AtomicU64,
    pub(crate) bios_acknowledged:            AtomicU64,
    pub(crate) reads:                        AtomicU64,
    pub(crate) writes:                       AtomicU64,
    pub(crate) discards:                     AtomicU64,
    pub(crate) flushes:                      AtomicU64,
    pub(crate) zero_writes:                  AtomicU64,
    pub(crate) dedupe_advice_valid:          AtomicU64,
    pub(crate) dedupe_advice_stale:          AtomicU64,
    pub(crate) compressed_blocks_written:    AtomicU64,
    pub(crate) compressed_fragments_written: AtomicU64,
    /// Gauge: fragments currently parked in packer bins.
    pub(crate) fragments_in_packer:          AtomicU64,
    pub(crate) compression_cancellations:    AtomicU64,
    pub(crate) read_through_hits:            AtomicU64,
    pub(crate) no_space_errors:              AtomicU64,
    pub(crate) read_only_rejections:         AtomicU64,
}

impl Statistics {
    #[inline]
    pub(crate) fn count(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatisticsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatisticsSnapshot {
            bios_in:                      load(&self.bios_in),
            bios_acknowledged:            load(&self.bios_acknowledged),
            reads:                        load(&self.reads),
            writes:                       load(&self.writes),
            discards:                     load(&self.discards),
            flushes:                      load(&self.flushes),
            zero_writes:                  load(&self.zero_writes),
            dedupe_advice_valid:          load(&self.dedupe_advice_valid),
            dedupe_advice_stale:          load(&self.dedupe_advice_stale),
            compressed_blocks_written:    load(&self.compressed_blocks_written),
            compressed_fragments_written: load(&self.compressed_fragments_written),
            fragments_in_packer:          load(&self.fragments_in_packer),
            compression_cancellations:    load(&self.compression_cancellations),
            read_through_hits:            load(&self.read_through_hits),
            no_space_errors:              load(&self.no_space_errors),
            read_only_rejections:         load(&self.read_only_rejections),
        }
    }
}

/// A point-in-time copy of the device counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub bios_in:                      u64,
    pub bios_acknowledged:            u64,
    pub reads:                        u64,
    pub writes:                       u64,
    pub discards:                     u64,
    pub flushes:                      u64,
    pub zero_writes:                  u64,
    pub dedupe_advice_valid:          u64,
    pub dedupe_advice_stale:          u64,
    pub compressed_blocks_written:    u64,
    pub compressed_fragments_written: u64,
    pub fragments_in_packer:          u64,
    pub compression_cancellations:    u64,
    pub read_through_hits:            u64,
    pub no_space_errors:              u64,
    pub read_only_rejections:         u64,
}
