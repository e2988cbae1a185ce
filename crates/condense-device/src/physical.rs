//! Physical zones: the per-PBN lock table and the reference-counting
//! allocator each zone draws from.
//!
//! A PBN belongs to exactly one physical zone (`pbn mod P`), and every
//! callback touching its lock runs in that zone. Reference counts live in
//! the slab depot, which the owning zone and the journal zone both update;
//! the lock table itself is zone-owned and needs no synchronization.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use condense_block::MappingState;

use crate::config::DeviceConfig;
use crate::data_op::{DataOp, HashLockRole, Phase, ZonedPbn};
use crate::dispatcher::{Priority, ZoneClass, ZoneId, ZoneMessage, assert_on_zone};
use crate::engine::{EngineInner, continue_cleanup, finish_op};
use crate::error::Status;
use crate::stats::Statistics;
use crate::types::{Pbn, ZERO_BLOCK};


/// How a PBN lock is held. Writers of any flavor are exclusive; readers
/// share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PbnLockKind {
    Read,
    Write,
    CompressedWrite,
    /// Held by the block map while rewriting one of its own tree pages.
    /// Data-path operations never take this kind, but it contends like any
    /// other writer.
    #[expect(dead_code, reason = "the block map's tree writer takes these, not the data path")]
    BlockMapWrite,
}

impl PbnLockKind {
    #[inline]
    #[must_use]
    pub(crate) fn is_exclusive(self) -> bool {
        !matches!(self, Self::Read)
    }
}

#[derive(Debug)]
struct PbnLock {
    kind:    PbnLockKind,
    holders: u32,
    /// The allocator granted a reference that has not been journaled yet;
    /// the slab depot is consulted at release time since the journal
    /// confirms references off this zone.
    has_provisional_reference: bool,
    waiters: VecDeque<Box<DataOp>>,
}


#[derive(Debug)]
pub(crate) struct PhysicalZone {
    zone:  u8,
    locks: HashMap<Pbn, PbnLock>,
}

impl PhysicalZone {
    #[must_use]
    pub(crate) fn new(zone: u8) -> Self {
        Self {
            zone,
            locks: HashMap::new(),
        }
    }

    fn id(&self) -> ZoneId {
        ZoneId::new(ZoneClass::Physical, self.zone)
    }
}


/// Try to allocate a block in this zone; on exhaustion, move on to the next
/// zone, failing with `NO_SPACE` only once every zone has been tried.
pub(crate) fn allocate_block(
    mut op: Box<DataOp>,
    zone:   &mut PhysicalZone,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());
    debug_assert_eq!(op.allocation.zone, zone.zone);

    let allocated = engine
        .depot
        .allocate(zone.zone, |pbn| !zone.locks.contains_key(&pbn));

    let Some(pbn) = allocated else {
        let next = (zone.zone + 1) % engine.config.physical_zones;
        if next == op.allocation.first_tried_zone {
            Statistics::count(&engine.stats.no_space_errors);
            finish_op(op, engine, Status::NoSpace);
        } else {
            op.allocation.zone = next;
            engine.launch_physical(next, op, Phase::AllocateBlock);
        }
        return;
    };

    zone.locks.insert(pbn, PbnLock {
        kind:    op.allocation.lock_kind,
        holders: 1,
        has_provisional_reference: true,
        waiters: VecDeque::new(),
    });
    op.allocation.pbn = pbn;
    op.allocation.has_lock = true;

    // The staging block is immutable from here on; publish it so contending
    // readers of this LBN can be served straight out of it.
    op.shared.publish_staged(op.staging.clone());

    if op.compression.is_compressible() && !op.shared.compression_canceled() {
        engine.launch_packer(op, Phase::AttemptPacking);
    } else {
        engine.launch_bio_submit(op, Phase::WriteData);
    }
}

/// Take a shared read lock on the mapped block before reading it.
pub(crate) fn acquire_pbn_read_lock(
    mut op: Box<DataOp>,
    zone:   &mut PhysicalZone,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());
    let pbn = op.mapped.pbn;

    if let Some(lock) = zone.locks.get_mut(&pbn) {
        if lock.kind.is_exclusive() {
            // A writer still holds the block; wait for the release to
            // relaunch this operation in the same phase.
            lock.waiters.push_back(op);
        } else {
            lock.holders += 1;
            op.held_shares.push((pbn, zone.zone));
            engine.launch_bio_submit(op, Phase::ReadData);
        }
        return;
    }

    zone.locks.insert(pbn, PbnLock {
        kind:    PbnLockKind::Read,
        holders: 1,
        has_provisional_reference: false,
        waiters: VecDeque::new(),
    });
    op.held_shares.push((pbn, zone.zone));
    engine.launch_bio_submit(op, Phase::ReadData);
}

/// Take a read lock on an advised duplicate before verifying it. Unlike a
/// plain read, a conflict here just means the advice is unusable right now;
/// the operation falls through to allocation instead of waiting.
pub(crate) fn lock_duplicate_pbn(
    mut op: Box<DataOp>,
    zone:   &mut PhysicalZone,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());
    let pbn = op.duplicate.pbn;

    if let Some(lock) = zone.locks.get_mut(&pbn) {
        if lock.kind.is_exclusive() {
            op.is_duplicate = false;
            engine.launch_hash(op, Phase::FinishVerification);
        } else {
            lock.holders += 1;
            op.held_shares.push((pbn, zone.zone));
            engine.launch_bio_submit(op, Phase::ReadDuplicateData);
        }
        return;
    }

    zone.locks.insert(pbn, PbnLock {
        kind:    PbnLockKind::Read,
        holders: 1,
        has_provisional_reference: false,
        waiters: VecDeque::new(),
    });
    op.held_shares.push((pbn, zone.zone));
    engine.launch_bio_submit(op, Phase::ReadDuplicateData);
}

/// After a compressed block lands on disk, the agent hands each packed
/// follower a share of its lock, its final mapping, and sends everyone on
/// their way.
pub(crate) fn share_packed_lock(
    mut op: Box<DataOp>,
    zone:   &mut PhysicalZone,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());
    let pbn = op.allocation.pbn;
    let followers = std::mem::take(&mut op.packed);

    let lock = zone
        .locks
        .get_mut(&pbn)
        .expect("the agent holds the compressed-write lock");
    lock.holders += u32::try_from(followers.len()).expect("at most 13 followers");

    for mut follower in followers {
        follower.new_mapped = ZonedPbn {
            pbn,
            state: MappingState::Compressed(follower.compression.slot),
            zone:  zone.zone,
        };
        follower.held_shares.push((pbn, zone.zone));
        // The follower's own allocation went unused; give it back before
        // journaling the shared mapping.
        if follower.allocation.has_lock {
            let allocated_zone = follower.allocation.zone;
            engine.launch_physical(allocated_zone, follower, Phase::ReleaseUnusedAllocation);
        } else {
            engine.launch_journal(follower, Phase::JournalMappingForCompression);
        }
    }

    op.new_mapped = ZonedPbn {
        pbn,
        state: MappingState::Compressed(0),
        zone:  zone.zone,
    };
    engine.launch_journal(op, Phase::JournalMappingForCompression);
}

/// A packed follower abandons the block it allocated but never wrote. The
/// provisional reference is still owed a journaled decrement, which rides
/// along on the follower's upcoming journal visit.
pub(crate) fn release_unused_allocation(
    mut op: Box<DataOp>,
    zone:   &mut PhysicalZone,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());
    let pbn = op.allocation.pbn;

    release_one_share(zone, pbn, engine);
    op.release_unused_pbn = Some(pbn);
    op.allocation.pbn = 0;
    op.allocation.has_lock = false;

    engine.launch_journal(op, Phase::JournalMappingForCompression);
}

/// Whether this operation's hold on `pbn` outlives it: a successful agent
/// leaves its hold on the block it decided on with its hash lock, which
/// keeps the block from being reallocated while followers are still
/// inheriting the mapping. The hash lock releases it when the last member
/// leaves.
fn hold_passes_to_hash_lock(op: &DataOp, pbn: Pbn) -> bool {
    op.status.is_none()
        && op.hash_member
        && op.hash_role == Some(HashLockRole::Agent)
        && !op.is_duplicate
        && pbn == op.new_mapped.pbn
}

/// Cleanup: drop the allocation lock. If the reference is still
/// provisional, no journal entry ever confirmed it, so a decrement is
/// routed through the journal to return the block to the allocator.
pub(crate) fn release_allocation_lock(
    mut op: Box<DataOp>,
    zone:   &mut PhysicalZone,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());
    let pbn = op.allocation.pbn;

    if !hold_passes_to_hash_lock(&op, pbn) {
        let still_provisional = zone
            .locks
            .get(&pbn)
            .is_some_and(|lock| lock.has_provisional_reference)
            && engine.depot.is_provisional(pbn);

        release_one_share(zone, pbn, engine);
        if still_provisional {
            engine.router.journal.send(
                Priority::Data,
                ZoneMessage::ReleaseProvisionalReference { pbn },
            );
        }
    }
    op.allocation.pbn = 0;
    op.allocation.has_lock = false;

    continue_cleanup(op, engine);
}

/// Cleanup: drop one held share (a read lock, a verify lock, or a packed
/// block share).
pub(crate) fn release_pbn_read_lock(
    mut op: Box<DataOp>,
    zone:   &mut PhysicalZone,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());
    let (pbn, share_zone) = op
        .held_shares
        .pop()
        .expect("a held share routed this operation here");
    debug_assert_eq!(share_zone, zone.zone);

    if !hold_passes_to_hash_lock(&op, pbn) {
        release_one_share(zone, pbn, engine);
    }
    continue_cleanup(op, engine);
}

/// A share release not tied to an operation: the hash lock dropping the
/// duplicate lock it kept on behalf of its members.
pub(crate) fn release_shared_lock_message(
    zone:   &mut PhysicalZone,
    pbn:    Pbn,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());
    release_one_share(zone, pbn, engine);
}

fn release_one_share(zone: &mut PhysicalZone, pbn: Pbn, engine: &Arc<EngineInner>) {
    let lock = zone
        .locks
        .get_mut(&pbn)
        .expect("releasing a PBN lock that is held");
    lock.holders -= 1;
    if lock.holders > 0 {
        return;
    }

    let lock = zone.locks.remove(&pbn).expect("lock entry present");
    for waiter in lock.waiters {
        let phase = waiter.phase;
        engine.launch_physical(zone.zone, waiter, phase);
    }
}


/// Reference counts for every physical block, partitioned by owning zone.
///
/// An allocation grants a provisional reference: the count is already 1,
/// but until a journaled increment confirms it, a decrement (or an
/// abandoned operation) returns the block to the free pool.
#[derive(Debug)]
pub(crate) struct SlabDepot {
    zones:          Vec<Mutex<RefCounts>>,
    physical_zones: u8,
}

#[derive(Debug)]
struct RefCounts {
    counts:      Vec<u32>,
    provisional: Vec<bool>,
    cursor:      usize,
}

impl SlabDepot {
    #[must_use]
    pub(crate) fn new(config: &DeviceConfig) -> Self {
        let physical_zones = config.physical_zones;
        let zones = (0..physical_zones)
            .map(|zone| {
                let blocks_in_zone = config
                    .physical_blocks
                    .saturating_sub(u64::from(zone))
                    .div_ceil(u64::from(physical_zones));
                let blocks_in_zone = usize::try_from(blocks_in_zone).expect("zone fits in memory");
                Mutex::new(RefCounts {
                    counts:      vec![0; blocks_in_zone],
                    provisional: vec![false; blocks_in_zone],
                    cursor:      0,
                })
            })
            .collect();
        Self {
            zones,
            physical_zones,
        }
    }

    fn slot_of(&self, pbn: Pbn) -> (usize, usize) {
        let stride = u64::from(self.physical_zones);
        let zone = usize::try_from(pbn % stride).expect("zone count fits in usize");
        let index = usize::try_from(pbn / stride).expect("slab index fits in usize");
        (zone, index)
    }

    /// Grant a provisional reference on a free block in `zone`, skipping
    /// blocks the caller cannot lock (an outstanding read or verify lock
    /// means the block is still interesting to someone).
    pub(crate) fn allocate(&self, zone: u8, lockable: impl Fn(Pbn) -> bool) -> Option<Pbn> {
        let stride = u64::from(self.physical_zones);
        let mut counts = self.zones[usize::from(zone)].lock();
        let slots = counts.counts.len();

        for step in 0..slots {
            let index = (counts.cursor + step) % slots;
            let pbn = u64::try_from(index).expect("slab index") * stride + u64::from(zone);
            if pbn == ZERO_BLOCK {
                continue;
            }
            if counts.counts[index] == 0 && !counts.provisional[index] && lockable(pbn) {
                counts.counts[index] = 1;
                counts.provisional[index] = true;
                counts.cursor = (index + 1) % slots;
                return Some(pbn);
            }
        }
        None
    }

    /// A journaled increment: confirm a provisional reference, or add a
    /// share to an established block.
    pub(crate) fn commit_increment(&self, pbn: Pbn) {
        let (zone, index) = self.slot_of(pbn);
        let mut counts = self.zones[zone].lock();
        if counts.provisional[index] {
            counts.provisional[index] = false;
        } else {
            counts.counts[index] += 1;
        }
    }

    /// A journaled decrement. Releasing a still-provisional reference
    /// returns the block to the free pool directly.
    pub(crate) fn commit_decrement(&self, pbn: Pbn) {
        let (zone, index) = self.slot_of(pbn);
        let mut counts = self.zones[zone].lock();
        if counts.provisional[index] {
            counts.provisional[index] = false;
            counts.counts[index] = 0;
        } else {
            debug_assert!(counts.counts[index] > 0, "decrement of a free block");
            counts.counts[index] = counts.counts[index].saturating_sub(1);
        }
    }

    #[must_use]
    pub(crate) fn is_provisional(&self, pbn: Pbn) -> bool {
        let (zone, index) = self.slot_of(pbn);
        self.zones[zone].lock().provisional[index]
    }

    #[must_use]
    pub(crate) fn reference_count(&self, pbn: Pbn) -> u32 {
        let (zone, index) = self.slot_of(pbn);
        self.zones[zone].lock().counts[index]
    }
}


#[cfg(test)]
mod tests {
    use crate::config::DeviceConfig;
    use super::SlabDepot;

    #[test]
    fn allocation_skips_the_zero_block() {
        let depot = SlabDepot::new(&DeviceConfig::new(16, 8).with_physical_zones(2));
        // Zone 0 owns pbns {0, 2, 4, 6}; pbn 0 must never be granted.
        let mut granted = Vec::new();
        while let Some(pbn) = depot.allocate(0, |_| true) {
            granted.push(pbn);
        }
        assert_eq!(granted, vec![2, 4, 6]);
    }

    #[test]
    fn provisional_references_confirm_and_release() {
        let depot = SlabDepot::new(&DeviceConfig::new(16, 8).with_physical_zones(2));
        let pbn = depot.allocate(1, |_| true).unwrap();
        assert_eq!(depot.reference_count(pbn), 1);
        assert!(depot.is_provisional(pbn));

        depot.commit_increment(pbn);
        assert!(!depot.is_provisional(pbn));
        assert_eq!(depot.reference_count(pbn), 1);

        depot.commit_increment(pbn);
        assert_eq!(depot.reference_count(pbn), 2);

        depot.commit_decrement(pbn);
        depot.commit_decrement(pbn);
        assert_eq!(depot.reference_count(pbn), 0);

        // The block is allocatable again.
        let again = depot.allocate(1, |candidate| candidate == pbn);
        assert_eq!(again, Some(pbn));
    }

    #[test]
    fn abandoned_provisional_reference_frees_the_block() {
        let depot = SlabDepot::new(&DeviceConfig::new(16, 8).with_physical_zones(2));
        let pbn = depot.allocate(0, |_| true).unwrap();
        depot.commit_decrement(pbn);
        assert_eq!(depot.reference_count(pbn), 0);
        assert!(!depot.is_provisional(pbn));
    }
}
