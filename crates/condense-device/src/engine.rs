//! Engine wiring: the shared collaborators every zone can see, the launch
//! helpers that move operations between zones, and the zone threads
//! themselves.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use condense_block::{MappingState, RecordName};

use crate::block_map::BlockMap;
use crate::config::DeviceConfig;
use crate::data_op::{DataOp, Phase, ZonedPbn};
use crate::dedupe::DedupeIndex;
use crate::dispatcher::{
    Priority, ZoneClass, ZoneHandle, ZoneId, ZoneMessage, ZoneQueue, assert_on_zone,
    current_zone, set_current_zone,
};
use crate::error::Status;
use crate::journal::{self, RecoveryJournal};
use crate::logical::LogicalZone;
use crate::hash_lock::{self, HashZone};
use crate::cpu::{self, CpuZone};
use crate::packer::{self, PackerZone};
use crate::physical::{self, PbnLockKind, PhysicalZone, SlabDepot};
use crate::stats::Statistics;
use crate::store::PhysicalStore;
use crate::types::{Lbn, Pbn, ZERO_BLOCK};
use crate::{bio, logical};


/// One handle per zone, indexed the way work is routed.
#[derive(Debug)]
pub(crate) struct Router {
    pub(crate) logical:    Vec<ZoneHandle>,
    pub(crate) physical:   Vec<ZoneHandle>,
    pub(crate) hash:       Vec<ZoneHandle>,
    pub(crate) cpu:        Vec<ZoneHandle>,
    pub(crate) journal:    ZoneHandle,
    pub(crate) packer:     ZoneHandle,
    pub(crate) bio_ack:    ZoneHandle,
    pub(crate) bio_submit: ZoneHandle,
}

/// Everything shared across zones: the collaborators, the queues, and the
/// engine-wide flags. Zone-partitioned state (lock tables, packer bins)
/// lives with the zone threads, not here.
#[derive(Debug)]
pub(crate) struct EngineInner {
    pub(crate) config:    DeviceConfig,
    pub(crate) router:    Router,
    pub(crate) block_map: BlockMap,
    pub(crate) index:     Arc<dyn DedupeIndex>,
    pub(crate) depot:     SlabDepot,
    pub(crate) journal:   RecoveryJournal,
    pub(crate) store:     Arc<dyn PhysicalStore>,
    pub(crate) stats:     Statistics,

    read_only:       AtomicBool,
    next_alloc_zone: AtomicU32,
    next_op_id:      AtomicU64,
}

impl EngineInner {
    pub(crate) fn new(
        config: DeviceConfig,
        router: Router,
        index:  Arc<dyn DedupeIndex>,
        store:  Arc<dyn PhysicalStore>,
    ) -> Self {
        Self {
            block_map: BlockMap::new(&config),
            depot:     SlabDepot::new(&config),
            journal:   RecoveryJournal::new(),
            stats:     Statistics::default(),
            config,
            router,
            index,
            store,
            read_only:       AtomicBool::new(false),
            next_alloc_zone: AtomicU32::new(0),
            next_op_id:      AtomicU64::new(1),
        }
    }

    // Routing.

    #[must_use]
    pub(crate) fn logical_zone_of(&self, lbn: Lbn) -> u8 {
        u8::try_from(lbn % u64::from(self.config.logical_zones)).expect("zone index fits")
    }

    #[must_use]
    pub(crate) fn physical_zone_of(&self, pbn: Pbn) -> u8 {
        u8::try_from(pbn % u64::from(self.config.physical_zones)).expect("zone index fits")
    }

    #[must_use]
    pub(crate) fn hash_zone_of(&self, name: RecordName) -> u8 {
        let head = u64::from_le_bytes(name.as_bytes()[0..8].try_into().expect("8-byte slice"));
        u8::try_from(head % u64::from(self.config.hash_zones)).expect("zone index fits")
    }

    #[must_use]
    pub(crate) fn cpu_zone_of(&self, lbn: Lbn) -> u8 {
        u8::try_from(lbn % u64::from(self.config.cpu_zones)).expect("zone index fits")
    }

    /// Rotate allocations across physical zones so no zone empties first.
    #[must_use]
    pub(crate) fn next_allocation_zone(&self) -> u8 {
        let next = self.next_alloc_zone.fetch_add(1, Ordering::Relaxed);
        u8::try_from(next % u32::from(self.config.physical_zones)).expect("zone index fits")
    }

    #[must_use]
    pub(crate) fn new_op_id(&self) -> u64 {
        self.next_op_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    pub(crate) fn enter_read_only_mode(&self) {
        if !self.read_only.swap(true, Ordering::Relaxed) {
            tracing::event!(tracing::Level::WARN, "device entering read-only mode");
        }
    }

    // Launch helpers. Each sets the phase and transfers the operation to
    // the target zone's queue.

    pub(crate) fn launch(&self, mut op: Box<DataOp>, zone: ZoneId, phase: Phase, priority: Priority) {
        op.phase = phase;
        self.handle(zone).send(priority, ZoneMessage::Run(op));
    }

    pub(crate) fn launch_logical(&self, op: Box<DataOp>, phase: Phase) {
        let zone = ZoneId::new(ZoneClass::Logical, op.logical_zone);
        self.launch(op, zone, phase, Priority::Data);
    }

    pub(crate) fn launch_physical(&self, zone_index: u8, op: Box<DataOp>, phase: Phase) {
        let zone = ZoneId::new(ZoneClass::Physical, zone_index);
        self.launch(op, zone, phase, Priority::Data);
    }

    pub(crate) fn launch_hash(&self, op: Box<DataOp>, phase: Phase) {
        let zone = ZoneId::new(ZoneClass::Hash, op.hash_zone);
        self.launch(op, zone, phase, Priority::Data);
    }

    pub(crate) fn launch_cpu(&self, op: Box<DataOp>, phase: Phase) {
        let zone = ZoneId::new(ZoneClass::Cpu, self.cpu_zone_of(op.lbn));
        self.launch(op, zone, phase, Priority::Data);
    }

    pub(crate) fn launch_journal(&self, op: Box<DataOp>, phase: Phase) {
        self.launch(op, ZoneId::solo(ZoneClass::Journal), phase, Priority::Data);
    }

    pub(crate) fn launch_packer(&self, op: Box<DataOp>, phase: Phase) {
        self.launch(op, ZoneId::solo(ZoneClass::Packer), phase, Priority::Data);
    }

    pub(crate) fn launch_bio_submit(&self, op: Box<DataOp>, phase: Phase) {
        self.launch(op, ZoneId::solo(ZoneClass::BioSubmit), phase, Priority::Data);
    }

    /// Acknowledgements jump the queue: finishing a request the submitter
    /// is waiting on beats starting new work.
    pub(crate) fn launch_ack(&self, op: Box<DataOp>) {
        self.launch(
            op,
            ZoneId::solo(ZoneClass::BioAck),
            Phase::Acknowledge,
            Priority::High,
        );
    }

    fn handle(&self, zone: ZoneId) -> &ZoneHandle {
        match zone.class {
            ZoneClass::Logical   => &self.router.logical[usize::from(zone.index)],
            ZoneClass::Physical  => &self.router.physical[usize::from(zone.index)],
            ZoneClass::Hash      => &self.router.hash[usize::from(zone.index)],
            ZoneClass::Cpu       => &self.router.cpu[usize::from(zone.index)],
            ZoneClass::Journal   => &self.router.journal,
            ZoneClass::Packer    => &self.router.packer,
            ZoneClass::BioAck    => &self.router.bio_ack,
            ZoneClass::BioSubmit => &self.router.bio_submit,
        }
    }
}


/// Fail an operation and start unwinding it. The submitter hears about the
/// failure only after every lock is released.
pub(crate) fn finish_op(mut op: Box<DataOp>, engine: &Arc<EngineInner>, status: Status) {
    op.status.get_or_insert(status);
    continue_cleanup(op, engine);
}

/// Walk the operation through releasing everything it still holds, in a
/// fixed order, ending at the acknowledger if the request has not been
/// answered yet. Successful requests are acknowledged first and then enter
/// this chain; failed ones release first and are acknowledged last.
pub(crate) fn continue_cleanup(op: Box<DataOp>, engine: &Arc<EngineInner>) {
    if op.logical_locked {
        engine.launch_logical(op, Phase::Cleanup);
    } else if op.allocation.has_lock {
        let zone = op.allocation.zone;
        engine.launch_physical(zone, op, Phase::ReleaseAllocationLock);
    } else if let Some(&(_, zone)) = op.held_shares.last() {
        engine.launch_physical(zone, op, Phase::ReleasePbnReadLock);
    } else if op.hash_member {
        engine.launch_hash(op, Phase::HashLockMemberDone);
    } else if op.completion.is_some() {
        engine.launch_ack(op);
    } else {
        // Fully unwound; the operation ends here.
        debug_assert!(op.packed.is_empty(), "dropped an agent still carrying followers");
    }
}

/// Route a write that has its final data staged: zero blocks take the
/// short path straight to the journal, everything else goes to a CPU zone
/// to be compressed and hashed.
pub(crate) fn continue_write_after_staging(mut op: Box<DataOp>, engine: &Arc<EngineInner>) {
    if op.is_zero {
        Statistics::count(&engine.stats.zero_writes);
        op.new_mapped = ZonedPbn {
            pbn:   ZERO_BLOCK,
            state: MappingState::Uncompressed,
            zone:  0,
        };
        engine.launch_journal(op, Phase::JournalMappingForWrite);
    } else {
        engine.launch_cpu(op, Phase::CompressData);
    }
}

/// Send a write to the allocator, choosing the lock kind its eventual
/// write needs and the first zone to try.
pub(crate) fn route_to_allocation(mut op: Box<DataOp>, engine: &Arc<EngineInner>) {
    let compressible =
        op.compression.is_compressible() && !op.shared.compression_canceled();
    op.allocation.lock_kind = if compressible {
        PbnLockKind::CompressedWrite
    } else {
        PbnLockKind::Write
    };
    let zone = engine.next_allocation_zone();
    op.allocation.first_tried_zone = zone;
    op.allocation.zone = zone;
    engine.launch_physical(zone, op, Phase::AllocateBlock);
}


/// The state a zone thread owns. Exactly one variant matches the thread's
/// zone class.
#[derive(Debug)]
enum ZoneState {
    Logical(LogicalZone),
    Physical(PhysicalZone),
    Hash(HashZone),
    Cpu(CpuZone),
    Journal,
    Packer(PackerZone),
    BioAck,
    BioSubmit,
}

impl ZoneState {
    fn for_zone(id: ZoneId, config: &DeviceConfig) -> Self {
        match id.class {
            ZoneClass::Logical   => Self::Logical(LogicalZone::new(id.index)),
            ZoneClass::Physical  => Self::Physical(PhysicalZone::new(id.index)),
            ZoneClass::Hash      => Self::Hash(HashZone::new(id.index)),
            ZoneClass::Cpu       => Self::Cpu(CpuZone::new(id.index)),
            ZoneClass::Journal   => Self::Journal,
            ZoneClass::Packer    => Self::Packer(PackerZone::new(config)),
            ZoneClass::BioAck    => Self::BioAck,
            ZoneClass::BioSubmit => Self::BioSubmit,
        }
    }
}

/// A zone thread's main loop: drain the queue in priority order until told
/// to shut down.
pub(crate) fn run_zone(engine: Arc<EngineInner>, id: ZoneId, queue: ZoneQueue) {
    set_current_zone(id);
    let mut state = ZoneState::for_zone(id, &engine.config);

    loop {
        match queue.recv() {
            ZoneMessage::Run(op) => dispatch(op, &mut state, &engine),
            ZoneMessage::CancelCompression { op_id } => {
                let ZoneState::Packer(packer_state) = &mut state else {
                    unreachable!("cancellation is packer traffic");
                };
                packer::remove_lock_holder(packer_state, op_id, &engine);
            }
            ZoneMessage::ReleaseSharedPbnLock { pbn } => {
                let ZoneState::Physical(zone) = &mut state else {
                    unreachable!("share releases are physical-zone traffic");
                };
                physical::release_shared_lock_message(zone, pbn, &engine);
            }
            ZoneMessage::ReleaseProvisionalReference { pbn } => {
                journal::release_provisional_reference(&engine, pbn);
            }
            ZoneMessage::FlushPacker => {
                let ZoneState::Packer(packer_state) = &mut state else {
                    unreachable!("flushes are packer traffic");
                };
                packer::flush(packer_state, &engine);
            }
            ZoneMessage::FlushJournal { done } => {
                assert_on_zone(ZoneId::solo(ZoneClass::Journal));
                // Commits are synchronous on this zone, so reaching this
                // message means everything enqueued before it is durable.
                let _ = done.send(());
            }
            ZoneMessage::Shutdown => break,
        }
    }
}

/// The (phase, zone) continuation table. An operation arriving on a zone
/// that its phase does not belong to is a routing bug and fatal.
fn dispatch(op: Box<DataOp>, state: &mut ZoneState, engine: &Arc<EngineInner>) {
    match (op.phase, state) {
        (Phase::AttemptLogicalBlockLock, ZoneState::Logical(zone)) => {
            logical::attempt_logical_block_lock(op, zone, engine);
        }
        (Phase::PutMappedBlock, ZoneState::Logical(zone)) => {
            logical::put_mapped_block(op, zone, engine);
        }
        (Phase::Cleanup, ZoneState::Logical(zone)) => logical::cleanup(op, zone, engine),

        (Phase::CompressData, ZoneState::Cpu(zone)) => cpu::compress_data(op, zone, engine),
        (Phase::CompleteRead, ZoneState::Cpu(zone)) => cpu::complete_read(op, zone, engine),
        (Phase::ModifyForPartialWrite, ZoneState::Cpu(zone)) => {
            cpu::modify_for_partial_write(op, zone, engine);
        }
        (Phase::VerifyDuplication, ZoneState::Cpu(zone)) => {
            cpu::verify_duplication(op, zone, engine);
        }

        (Phase::AcquireHashLock, ZoneState::Hash(zone)) => {
            hash_lock::acquire_hash_lock(op, zone, engine);
        }
        (Phase::CheckForDuplication, ZoneState::Hash(zone)) => {
            hash_lock::check_for_duplication(op, zone, engine);
        }
        (Phase::FinishVerification, ZoneState::Hash(zone)) => {
            hash_lock::finish_verification(op, zone, engine);
        }
        (Phase::HashLockMemberDone, ZoneState::Hash(zone)) => {
            hash_lock::hash_lock_member_done(op, zone, engine);
        }

        (Phase::AllocateBlock, ZoneState::Physical(zone)) => {
            physical::allocate_block(op, zone, engine);
        }
        (Phase::AcquirePbnReadLock, ZoneState::Physical(zone)) => {
            physical::acquire_pbn_read_lock(op, zone, engine);
        }
        (Phase::LockDuplicatePbn, ZoneState::Physical(zone)) => {
            physical::lock_duplicate_pbn(op, zone, engine);
        }
        (Phase::SharePackedLock, ZoneState::Physical(zone)) => {
            physical::share_packed_lock(op, zone, engine);
        }
        (Phase::ReleaseUnusedAllocation, ZoneState::Physical(zone)) => {
            physical::release_unused_allocation(op, zone, engine);
        }
        (Phase::ReleaseAllocationLock, ZoneState::Physical(zone)) => {
            physical::release_allocation_lock(op, zone, engine);
        }
        (Phase::ReleasePbnReadLock, ZoneState::Physical(zone)) => {
            physical::release_pbn_read_lock(op, zone, engine);
        }

        (Phase::AttemptPacking, ZoneState::Packer(zone)) => {
            packer::attempt_packing(op, zone, engine);
        }

        (
            Phase::JournalMappingForWrite
            | Phase::JournalMappingForDedupe
            | Phase::JournalMappingForCompression
            | Phase::JournalUnmappingForDiscard,
            ZoneState::Journal,
        ) => journal::journal_op(op, engine),

        (Phase::ReadData, ZoneState::BioSubmit) => bio::read_data(op, engine),
        (Phase::ReadDuplicateData, ZoneState::BioSubmit) => bio::read_duplicate_data(op, engine),
        (Phase::WriteData, ZoneState::BioSubmit) => bio::write_data(op, engine),
        (Phase::WritePackedBlock, ZoneState::BioSubmit) => bio::write_packed_block(op, engine),

        (Phase::Acknowledge, ZoneState::BioAck) => bio::acknowledge(op, engine),

        (phase, _) => panic!(
            "operation in phase {} dispatched to zone {:?}",
            phase.name(),
            current_zone(),
        ),
    }
}
