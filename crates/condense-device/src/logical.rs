//! Logical zones: the per-LBN lock table and the front of the data path.
//!
//! Every external request starts here. The LBN lock totally orders
//! operations on one logical block; on a contended release the table entry
//! is handed to the first waiter in a single mutation, so there is no
//! instant at which the lock is observably free.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use condense_block::MappingState;

use crate::data_op::{DataOp, IoKind, OpShared, Phase, ZonedPbn};
use crate::dispatcher::{Priority, ZoneClass, ZoneId, ZoneMessage, assert_on_zone};
use crate::engine::{EngineInner, continue_cleanup, continue_write_after_staging, finish_op};
use crate::error::Status;
use crate::stats::Statistics;
use crate::types::{Lbn, ZERO_BLOCK};


#[derive(Debug)]
struct LbnLockEntry {
    holder:         Arc<OpShared>,
    holder_is_read: bool,
    waiters:        VecDeque<Box<DataOp>>,
}

#[derive(Debug)]
pub(crate) struct LogicalZone {
    zone:      u8,
    lbn_table: HashMap<Lbn, LbnLockEntry>,
}

impl LogicalZone {
    #[must_use]
    pub(crate) fn new(zone: u8) -> Self {
        Self {
            zone,
            lbn_table: HashMap::new(),
        }
    }

    fn id(&self) -> ZoneId {
        ZoneId::new(ZoneClass::Logical, self.zone)
    }
}


/// The start of the path for every external request.
pub(crate) fn attempt_logical_block_lock(
    mut op: Box<DataOp>,
    zone:   &mut LogicalZone,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());

    // A transferred lock relaunches here with the lock already assigned.
    if op.logical_locked {
        debug_assert!(op.requeued, "lock transfers trampoline through the queue");
        op.requeued = false;
        launch_locked_request(op, zone, engine);
        return;
    }

    if op.lbn >= engine.config.logical_blocks {
        finish_op(op, engine, Status::OutOfRange);
        return;
    }

    if let Some(entry) = zone.lbn_table.get_mut(&op.lbn) {
        // If a pure read contends with a writer that already has its
        // allocation, serve it straight out of the writer's staged data
        // rather than making it wait for a write that may be parked in the
        // packer. The staged block is immutable once the allocation is
        // granted.
        if op.kind == IoKind::Read {
            if let Some(staged) = entry.holder.staged() {
                op.user_data = staged.as_bytes()[op.offset..op.offset + op.len].to_vec();
                Statistics::count(&engine.stats.read_through_hits);
                engine.launch_ack(op);
                return;
            }
        }

        // Keep a writer holding the lock from idling in the packer while
        // others wait behind it.
        if !entry.holder_is_read && entry.holder.cancel_compression() {
            Statistics::count(&engine.stats.compression_cancellations);
            engine.router.packer.send(
                Priority::Data,
                ZoneMessage::CancelCompression { op_id: entry.holder.op_id() },
            );
        }

        entry.waiters.push_back(op);
        return;
    }

    zone.lbn_table.insert(op.lbn, LbnLockEntry {
        holder:         op.shared.clone(),
        holder_is_read: op.kind == IoKind::Read,
        waiters:        VecDeque::new(),
    });
    op.logical_locked = true;
    launch_locked_request(op, zone, engine);
}

/// Continue a request that holds its LBN lock: consult the block map and
/// fan out by request kind.
fn launch_locked_request(
    mut op: Box<DataOp>,
    zone:   &mut LogicalZone,
    engine: &Arc<EngineInner>,
) {
    if op.kind != IoKind::Read && engine.is_read_only() {
        Statistics::count(&engine.stats.read_only_rejections);
        finish_op(op, engine, Status::ReadOnly);
        return;
    }

    op.phase = if op.kind == IoKind::Read {
        Phase::GetMappedBlockForRead
    } else {
        Phase::GetMappedBlockForWrite
    };
    let (pbn, state) = match engine.block_map.get_mapping(zone.zone, op.lbn) {
        Ok(mapping) => mapping,
        Err(status) => {
            finish_op(op, engine, status);
            return;
        }
    };
    op.mapped = ZonedPbn {
        pbn,
        state,
        zone: engine.physical_zone_of(pbn),
    };

    if op.kind == IoKind::Read {
        if pbn == ZERO_BLOCK || state == MappingState::Unmapped {
            op.user_data = vec![0; op.len];
            engine.launch_ack(op);
        } else {
            let mapped_zone = op.mapped.zone;
            engine.launch_physical(mapped_zone, op, Phase::AcquirePbnReadLock);
        }
        return;
    }

    if op.is_discard && !op.is_partial {
        op.new_mapped = ZonedPbn::default();
        engine.launch_journal(op, Phase::JournalUnmappingForDiscard);
        return;
    }

    if op.is_partial {
        if pbn == ZERO_BLOCK || state == MappingState::Unmapped {
            // Nothing to read back; the staging block is already zeroed.
            engine.launch_cpu(op, Phase::ModifyForPartialWrite);
        } else {
            let mapped_zone = op.mapped.zone;
            engine.launch_physical(mapped_zone, op, Phase::AcquirePbnReadLock);
        }
        return;
    }

    continue_write_after_staging(op, engine);
}

/// Install the new mapping. The journal committed the mapping delta before
/// this runs, so a crash at any point now replays to the same state.
pub(crate) fn put_mapped_block(
    op:     Box<DataOp>,
    zone:   &mut LogicalZone,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());
    engine
        .block_map
        .put_mapping(zone.zone, op.lbn, op.new_mapped.pbn, op.new_mapped.state);
    engine.launch_ack(op);
}

/// Cleanup: release the LBN lock, transferring it to the first waiter if
/// there is one.
pub(crate) fn cleanup(
    mut op: Box<DataOp>,
    zone:   &mut LogicalZone,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());

    if op.logical_locked {
        op.logical_locked = false;
        let mut entry = zone
            .lbn_table
            .remove(&op.lbn)
            .expect("the lock holder owns a table entry");
        debug_assert_eq!(entry.holder.op_id(), op.shared.op_id(), "lock holder mismatch");

        if let Some(mut next) = entry.waiters.pop_front() {
            // Transfer the lock and the remaining waiters to the first
            // waiter in one table mutation.
            next.logical_locked = true;
            let inherited = std::mem::take(&mut entry.waiters);
            let has_waiters = !inherited.is_empty();
            zone.lbn_table.insert(op.lbn, LbnLockEntry {
                holder:         next.shared.clone(),
                holder_is_read: next.kind == IoKind::Read,
                waiters:        inherited,
            });

            // The new holder inherits waiters of its own; it must not be
            // allowed to linger in the packer while they wait.
            if has_waiters && next.shared.cancel_compression() {
                Statistics::count(&engine.stats.compression_cancellations);
                engine.router.packer.send(
                    Priority::Data,
                    ZoneMessage::CancelCompression { op_id: next.shared.op_id() },
                );
            }

            // Trampoline through the queue to bound stack depth on long
            // transfer chains.
            next.requeued = true;
            engine.launch_logical(next, Phase::AttemptLogicalBlockLock);
        }
    }

    continue_cleanup(op, engine);
}
