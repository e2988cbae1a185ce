//! The bio-submit zone (all data-path I/O against the backing store) and
//! the bio-ack zone (exactly-once completion of user requests).

use std::sync::Arc;

use condense_block::MappingState;

use crate::data_op::{DataOp, IoKind, Phase, ZonedPbn};
use crate::device::BioResult;
use crate::dispatcher::{ZoneClass, ZoneId, assert_on_zone};
use crate::engine::{EngineInner, continue_cleanup, finish_op};
use crate::stats::Statistics;


fn submit_zone() -> ZoneId {
    ZoneId::solo(ZoneClass::BioSubmit)
}

fn ack_zone() -> ZoneId {
    ZoneId::solo(ZoneClass::BioAck)
}


/// Read the mapped block for a read or a read-modify-write. Compressed
/// mappings land in the compression buffer for the CPU zone to unpack;
/// everything else lands in scratch. Read failures are hard failures.
pub(crate) fn read_data(mut op: Box<DataOp>, engine: &Arc<EngineInner>) {
    assert_on_zone(submit_zone());
    let pbn = op.mapped.pbn;

    let result = if op.mapped.state.is_compressed() {
        engine.store.read_block(pbn, op.compression.block.block_mut())
    } else {
        engine.store.read_block(pbn, &mut op.scratch)
    };

    match result {
        Ok(()) => engine.launch_cpu(op, Phase::CompleteRead),
        Err(status) => finish_op(op, engine, status),
    }
}

/// Read an advised duplicate for verification. Failures here are swallowed:
/// bad advice just means the operation allocates a fresh block.
pub(crate) fn read_duplicate_data(mut op: Box<DataOp>, engine: &Arc<EngineInner>) {
    assert_on_zone(submit_zone());
    let pbn = op.duplicate.pbn;

    match engine.store.read_block(pbn, &mut op.scratch) {
        Ok(()) => engine.launch_cpu(op, Phase::VerifyDuplication),
        Err(_) => {
            op.is_duplicate = false;
            engine.launch_hash(op, Phase::FinishVerification);
        }
    }
}

/// Write the staged block, uncompressed, to the operation's allocation.
pub(crate) fn write_data(mut op: Box<DataOp>, engine: &Arc<EngineInner>) {
    assert_on_zone(submit_zone());
    let pbn = op.allocation.pbn;
    debug_assert!(op.allocation.has_lock, "writing without an allocation");

    op.new_mapped = ZonedPbn {
        pbn,
        state: MappingState::Uncompressed,
        zone:  op.allocation.zone,
    };

    match engine.store.write_block(pbn, &op.staging) {
        Ok(()) => engine.launch_journal(op, Phase::JournalMappingForWrite),
        Err(status) => finish_op(op, engine, status),
    }
}

/// Write a packed compressed block to the agent's allocation. On success
/// the agent goes on to share its lock with the packed followers; on
/// failure every participant fails.
pub(crate) fn write_packed_block(mut op: Box<DataOp>, engine: &Arc<EngineInner>) {
    assert_on_zone(submit_zone());
    let pbn = op.allocation.pbn;

    match engine.store.write_block(pbn, op.compression.block.as_block()) {
        Ok(()) => {
            let allocated_zone = op.allocation.zone;
            engine.launch_physical(allocated_zone, op, Phase::SharePackedLock);
        }
        Err(status) => {
            for follower in std::mem::take(&mut op.packed) {
                finish_op(follower, engine, status);
            }
            finish_op(op, engine, status);
        }
    }
}

/// Acknowledge the user request, exactly once, then continue releasing
/// whatever the operation still holds.
pub(crate) fn acknowledge(mut op: Box<DataOp>, engine: &Arc<EngineInner>) {
    assert_on_zone(ack_zone());

    if let Some(completion) = op.completion.take() {
        Statistics::count(&engine.stats.bios_acknowledged);
        let result = match op.status {
            Some(status) => {
                tracing::event!(
                    tracing::Level::ERROR,
                    "completing {} for LBN {} with error {} after {}: {}",
                    match op.kind {
                        IoKind::Read            => "read",
                        IoKind::Write           => "write",
                        IoKind::ReadModifyWrite => "read-modify-write",
                    },
                    op.lbn,
                    status.to_errno(),
                    op.phase.name(),
                    status,
                );
                Err(status)
            }
            None => Ok(()),
        };
        let data = std::mem::take(&mut op.user_data);
        // The submitter may have stopped listening; that is its business.
        let _ = completion.send(BioResult { result, data });
    } else {
        debug_assert!(false, "operation acknowledged twice");
    }

    continue_cleanup(op, engine);
}
