//! Hash zones: per-content serialization of the dedupe and write work.
//!
//! The first operation to arrive with a given record name becomes the
//! *agent* and does the expensive part once: probe the index, verify any
//! advised duplicate against the actual bytes, and otherwise allocate,
//! maybe pack, and write. Everyone else with the same name waits on the
//! lock and inherits the agent's decision, paying only for its own journal
//! entries and block-map update.
//!
//! An index answer is never trusted: the advised block is read back and
//! byte-compared before it is shared. The same comparison guards followers
//! against record-name collisions, so a block is only ever shared with
//! operations whose data is identical to what is on disk.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use condense_block::{Block, RecordName};

use crate::data_op::{DataOp, HashLockRole, Phase, ZonedPbn};
use crate::dedupe::{IndexAnswer, IndexMetadata, RequestKind};
use crate::dispatcher::{Priority, ZoneClass, ZoneId, ZoneMessage, assert_on_zone};
use crate::engine::{EngineInner, continue_cleanup, route_to_allocation};
use crate::stats::Statistics;
use crate::types::ZERO_BLOCK;


/// Where the agent is in its work. Purely descriptive bookkeeping; the
/// transitions are driven by the phases the agent moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashLockState {
    Querying,
    Verifying,
    Writing,
    Deduping,
}

#[derive(Debug)]
struct HashLock {
    state:          HashLockState,
    /// The agent's staged data; the content every member must match.
    data:           Arc<Block>,
    /// The agent's decision, once it has one.
    granted:        Option<ZonedPbn>,
    /// A read lock held on the verified duplicate on behalf of all
    /// members, released when the last member leaves.
    duplicate_lock: Option<ZonedPbn>,
    members:        u32,
    waiters:        VecDeque<Box<DataOp>>,
}

#[derive(Debug)]
pub(crate) struct HashZone {
    zone:  u8,
    table: HashMap<RecordName, HashLock>,
}

impl HashZone {
    #[must_use]
    pub(crate) fn new(zone: u8) -> Self {
        Self {
            zone,
            table: HashMap::new(),
        }
    }

    fn id(&self) -> ZoneId {
        ZoneId::new(ZoneClass::Hash, self.zone)
    }
}

fn name_of(op: &DataOp) -> RecordName {
    op.record_name.expect("hashing happened before the hash zone")
}


pub(crate) fn acquire_hash_lock(
    mut op: Box<DataOp>,
    zone:   &mut HashZone,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());
    let name = name_of(&op);

    if let Some(lock) = zone.table.get_mut(&name) {
        if let Some(granted) = lock.granted {
            // The decision already exists; consume it immediately.
            op.hash_role = Some(HashLockRole::Querier);
            grant_decision(op, lock, granted, engine);
        } else {
            op.hash_role = Some(HashLockRole::Follower);
            lock.waiters.push_back(op);
        }
        return;
    }

    zone.table.insert(name, HashLock {
        state:          HashLockState::Querying,
        data:           op.staging.clone(),
        granted:        None,
        duplicate_lock: None,
        members:        1,
        waiters:        VecDeque::new(),
    });
    op.hash_member = true;
    op.hash_role = Some(HashLockRole::Agent);
    check_for_duplication(op, zone, engine);
}

/// Hand a waiting or newly-arrived member the agent's decision, if its data
/// really is the data the lock serialized on. Returns whether the
/// operation joined the lock as a member.
fn grant_decision(
    mut op:  Box<DataOp>,
    lock:    &mut HashLock,
    granted: ZonedPbn,
    engine:  &Arc<EngineInner>,
) -> bool {
    if *op.staging == *lock.data {
        lock.members += 1;
        op.hash_member = true;
        op.is_duplicate = true;
        op.duplicate = granted;
        op.new_mapped = granted;
        engine.launch_journal(op, Phase::JournalMappingForDedupe);
        true
    } else {
        // A record-name collision. The operation is on its own; it
        // allocates a fresh block and never joins the lock.
        route_to_allocation(op, engine);
        false
    }
}

/// The agent probes the index and decides between verification and a fresh
/// write. Probe failures and `Queued` answers just mean no advice.
pub(crate) fn check_for_duplication(
    mut op: Box<DataOp>,
    zone:   &mut HashZone,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());
    op.phase = Phase::CheckForDuplication;
    let name = name_of(&op);

    let answer = engine.index.request(name, RequestKind::Query, None);
    let advice = match answer {
        IndexAnswer::Found(metadata) => usable_advice(metadata, engine),
        IndexAnswer::NotFound | IndexAnswer::Queued | IndexAnswer::Error => None,
    };

    let lock = zone.table.get_mut(&name).expect("the agent owns a hash lock");
    debug_assert_eq!(lock.state, HashLockState::Querying);
    if let Some(metadata) = advice {
        lock.state = HashLockState::Verifying;
        op.duplicate = ZonedPbn {
            pbn:   metadata.pbn,
            state: metadata.state,
            zone:  engine.physical_zone_of(metadata.pbn),
        };
        let duplicate_zone = op.duplicate.zone;
        engine.launch_physical(duplicate_zone, op, Phase::LockDuplicatePbn);
    } else {
        lock.state = HashLockState::Writing;
        route_to_allocation(op, engine);
    }
}

/// Advice sanity: the advised location must be a real, mapped block.
fn usable_advice(metadata: IndexMetadata, engine: &Arc<EngineInner>) -> Option<IndexMetadata> {
    let valid = metadata.pbn != ZERO_BLOCK
        && metadata.pbn < engine.config.physical_blocks
        && metadata.state != condense_block::MappingState::Unmapped;
    valid.then_some(metadata)
}

/// The agent returns from byte-comparing the advised duplicate.
pub(crate) fn finish_verification(
    mut op: Box<DataOp>,
    zone:   &mut HashZone,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());
    let name = name_of(&op);
    let lock = zone.table.get_mut(&name).expect("the agent owns a hash lock");
    debug_assert_eq!(lock.state, HashLockState::Verifying);

    if op.is_duplicate {
        Statistics::count(&engine.stats.dedupe_advice_valid);
        // The verify lock becomes the hash lock's duplicate lock, held for
        // every member until the last one leaves.
        let share = op.held_shares.pop();
        debug_assert!(share.is_some(), "verification succeeded without a verify lock");
        lock.state = HashLockState::Deduping;
        lock.granted = Some(op.duplicate);
        lock.duplicate_lock = Some(op.duplicate);
        op.new_mapped = op.duplicate;
        engine.launch_journal(op, Phase::JournalMappingForDedupe);
    } else {
        // Stale or unusable advice is not an error; write a fresh copy.
        Statistics::count(&engine.stats.dedupe_advice_stale);
        tracing::event!(
            tracing::Level::DEBUG,
            "dedupe advice for LBN {} did not verify; allocating fresh", op.lbn,
        );
        lock.state = HashLockState::Writing;
        route_to_allocation(op, engine);
    }
}

/// A member is completely done with its request. Update the lock: grant the
/// agent's decision, promote a new agent after a failure, wake the next
/// waiter, and tear the lock down after the last member.
pub(crate) fn hash_lock_member_done(
    mut op: Box<DataOp>,
    zone:   &mut HashZone,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());
    let name = name_of(&op);
    op.hash_member = false;

    let mut release_duplicate = None;
    let mut remove_lock = false;
    {
        let lock = zone.table.get_mut(&name).expect("members hold the lock open");
        lock.members -= 1;

        if op.hash_role == Some(HashLockRole::Agent) {
            if op.status.is_none() {
                if lock.granted.is_none() {
                    lock.state = HashLockState::Deduping;
                    lock.granted = Some(op.new_mapped);
                    // A fresh-write agent left its hold on the new block
                    // with this lock (see the release paths in the
                    // physical zone); keep the block pinned until the last
                    // member leaves.
                    if op.new_mapped.pbn != ZERO_BLOCK {
                        lock.duplicate_lock = Some(op.new_mapped);
                    }
                }
                if !op.is_duplicate && op.new_mapped.pbn != ZERO_BLOCK {
                    // Tell the index where this content now lives. For a
                    // verified duplicate the index was already right.
                    op.phase = Phase::UpdateDedupeIndex;
                    let metadata = IndexMetadata {
                        pbn:   op.new_mapped.pbn,
                        state: op.new_mapped.state,
                    };
                    engine.index.request(name, RequestKind::Update, Some(metadata));
                }
            } else if lock.granted.is_none() {
                // The agent failed before reaching a decision; the next
                // waiter retries the whole thing as the new agent. The
                // failure stays with the failed operation alone.
                if let Some(mut next) = lock.waiters.pop_front() {
                    lock.members += 1;
                    lock.state = HashLockState::Querying;
                    lock.data = next.staging.clone();
                    next.hash_member = true;
                    next.hash_role = Some(HashLockRole::Agent);
                    engine.launch_hash(next, Phase::CheckForDuplication);
                }
            }
        }

        // Wake one waiter per departing member once a decision exists. A
        // waiter that turns out to be a name collision leaves without
        // joining, so keep waking until one joins (and will wake the next
        // in turn) or none remain.
        if let Some(granted) = lock.granted {
            while let Some(next) = lock.waiters.pop_front() {
                if grant_decision(next, lock, granted, engine) {
                    break;
                }
            }
        }

        if lock.members == 0 && lock.waiters.is_empty() {
            release_duplicate = lock.duplicate_lock.take();
            remove_lock = true;
        }
    }
    if remove_lock {
        zone.table.remove(&name);
    }

    if let Some(duplicate) = release_duplicate {
        engine.router.physical[usize::from(duplicate.zone)].send(
            Priority::Data,
            ZoneMessage::ReleaseSharedPbnLock { pbn: duplicate.pbn },
        );
    }

    continue_cleanup(op, engine);
}
