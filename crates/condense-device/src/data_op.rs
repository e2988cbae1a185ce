//! The per-request operation record and its shared sidecar.

use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crossbeam_channel::Sender;

use condense_block::{BLOCK_SIZE, Block, CompressedBlock, MappingState, RecordName, SlotNumber};

use crate::device::BioResult;
use crate::error::Status;
use crate::physical::PbnLockKind;
use crate::types::Pbn;


/// The compression-size sentinel meaning "this block did not compress".
pub(crate) const INCOMPRESSIBLE: u16 = BLOCK_SIZE as u16 + 1;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoKind {
    Read,
    Write,
    /// A partial write: read the old block, splice the new bytes in, then
    /// continue as a write.
    ReadModifyWrite,
}

/// A physical location together with the zone that owns it and how the
/// block is represented there.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ZonedPbn {
    pub(crate) pbn:   Pbn,
    pub(crate) state: MappingState,
    pub(crate) zone:  u8,
}

impl Default for ZonedPbn {
    fn default() -> Self {
        Self {
            pbn:   0,
            state: MappingState::Unmapped,
            zone:  0,
        }
    }
}

/// The physical allocation an operation holds, if any.
///
/// `pbn` is nonzero exactly while the operation holds a PBN lock of
/// `lock_kind` on it.
#[derive(Debug)]
pub(crate) struct Allocation {
    pub(crate) pbn:              Pbn,
    pub(crate) zone:             u8,
    pub(crate) lock_kind:        PbnLockKind,
    pub(crate) first_tried_zone: u8,
    pub(crate) has_lock:         bool,
}

impl Default for Allocation {
    fn default() -> Self {
        Self {
            pbn:              0,
            zone:             0,
            lock_kind:        PbnLockKind::Write,
            first_tried_zone: 0,
            has_lock:         false,
        }
    }
}

/// The compression scratch state of an operation. The fragment lives at the
/// start of `block`'s data area so that, should this operation become the
/// agent of a compressed write, slot 0 is already in place.
#[derive(Debug)]
pub(crate) struct CompressionState {
    pub(crate) block: Box<CompressedBlock>,
    pub(crate) size:  u16,
    pub(crate) slot:  SlotNumber,
}

impl Default for CompressionState {
    fn default() -> Self {
        Self {
            block: Box::new(CompressedBlock::zeroed()),
            size:  INCOMPRESSIBLE,
            slot:  0,
        }
    }
}

impl CompressionState {
    #[inline]
    #[must_use]
    pub(crate) fn is_compressible(&self) -> bool {
        usize::from(self.size) <= condense_block::MAX_COMPRESSED_FRAGMENT_SIZE
    }
}


const COMPRESSION_IDLE:      u8 = 0;
const COMPRESSION_IN_PACKER: u8 = 1;
const COMPRESSION_WRITING:   u8 = 2;
const COMPRESSION_CANCELED:  u8 = 3;

/// The only cross-zone-visible state of an operation.
///
/// Other operations reach this sidecar through the lock tables (never
/// through the operation itself, which is exclusively owned by whichever
/// zone is running it). It carries the compression cancellation state
/// machine, and the staged data published once an allocation is granted so
/// contending readers can be served without waiting.
#[derive(Debug)]
pub(crate) struct OpShared {
    op_id:           u64,
    compression:     AtomicU8,
    allocation_done: AtomicBool,
    staged:          OnceLock<Arc<Block>>,
}

impl OpShared {
    #[must_use]
    pub(crate) fn new(op_id: u64) -> Self {
        Self {
            op_id,
            compression:     AtomicU8::new(COMPRESSION_IDLE),
            allocation_done: AtomicBool::new(false),
            staged:          OnceLock::new(),
        }
    }

    #[inline]
    #[must_use]
    pub(crate) fn op_id(&self) -> u64 {
        self.op_id
    }

    /// Publish the staged block once the allocation is granted. The staging
    /// block is immutable from this point on.
    pub(crate) fn publish_staged(&self, data: Arc<Block>) {
        let _ = self.staged.set(data);
        self.allocation_done.store(true, Ordering::Release);
    }

    /// The staged data of a writer that has been granted an allocation, or
    /// `None` if it has not gotten that far.
    #[must_use]
    pub(crate) fn staged(&self) -> Option<Arc<Block>> {
        if self.allocation_done.load(Ordering::Acquire) {
            self.staged.get().cloned()
        } else {
            None
        }
    }

    /// Try to enter the packer. Fails if compression was canceled first, in
    /// which case the operation writes its block uncompressed.
    #[must_use]
    pub(crate) fn try_enter_packer(&self) -> bool {
        self.compression
            .compare_exchange(
                COMPRESSION_IDLE,
                COMPRESSION_IN_PACKER,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Commit this operation's fragment to a compressed write. Once this
    /// succeeds, cancellation is too late to have any effect.
    #[must_use]
    pub(crate) fn try_begin_packed_write(&self) -> bool {
        self.compression
            .compare_exchange(
                COMPRESSION_IN_PACKER,
                COMPRESSION_WRITING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Cancel this operation's compression.
    ///
    /// Returns true when the operation is sitting in a packer bin and the
    /// caller must rendezvous with it there; false when the cancellation
    /// either took effect before the packer (the operation will see the flag
    /// at packer entry) or was too late to matter.
    #[must_use]
    pub(crate) fn cancel_compression(&self) -> bool {
        loop {
            let observed = self.compression.load(Ordering::Acquire);
            let in_packer = match observed {
                COMPRESSION_IDLE => false,
                COMPRESSION_IN_PACKER => true,
                _ => return false,
            };
            let exchanged = self.compression.compare_exchange(
                observed,
                COMPRESSION_CANCELED,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            if exchanged.is_ok() {
                return in_packer;
            }
        }
    }

    #[inline]
    #[must_use]
    pub(crate) fn compression_canceled(&self) -> bool {
        self.compression.load(Ordering::Acquire) == COMPRESSION_CANCELED
    }
}


/// The role an operation plays under a hash lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HashLockRole {
    /// Drives the probe, verification, allocation, and write on behalf of
    /// every operation with the same record name.
    Agent,
    /// Waits for the agent and inherits its decision.
    Follower,
    /// Arrived after the decision was already made and consumes it
    /// immediately.
    Querier,
}


/// Every asynchronous step of the pipeline, used both to dispatch an
/// operation on its target zone and to name where an operation was when
/// reporting errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Launch,
    AttemptLogicalBlockLock,
    GetMappedBlockForRead,
    GetMappedBlockForWrite,
    AcquirePbnReadLock,
    ReadData,
    CompleteRead,
    ModifyForPartialWrite,
    CompressData,
    HashData,
    AcquireHashLock,
    CheckForDuplication,
    LockDuplicatePbn,
    ReadDuplicateData,
    VerifyDuplication,
    FinishVerification,
    AllocateBlock,
    AttemptPacking,
    WriteData,
    WritePackedBlock,
    SharePackedLock,
    ReleaseUnusedAllocation,
    JournalMappingForWrite,
    JournalMappingForDedupe,
    JournalMappingForCompression,
    JournalUnmappingForDiscard,
    PutMappedBlock,
    UpdateDedupeIndex,
    Acknowledge,
    Cleanup,
    ReleaseAllocationLock,
    ReleasePbnReadLock,
    HashLockMemberDone,
}

impl Phase {
    #[must_use]
    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Launch                       => "launch",
            Self::AttemptLogicalBlockLock      => "attempt_logical_block_lock",
            Self::GetMappedBlockForRead        => "get_mapped_block/for_read",
            Self::GetMappedBlockForWrite       => "get_mapped_block/for_write",
            Self::AcquirePbnReadLock           => "acquire_pbn_read_lock",
            Self::ReadData                     => "read_data",
            Self::CompleteRead                 => "complete_read",
            Self::ModifyForPartialWrite        => "modify_for_partial_write",
            Self::CompressData                 => "compress_data",
            Self::HashData                     => "hash_data",
            Self::AcquireHashLock              => "acquire_hash_lock",
            Self::CheckForDuplication          => "check_for_duplication",
            Self::LockDuplicatePbn             => "lock_duplicate_pbn",
            Self::ReadDuplicateData            => "read_duplicate_data",
            Self::VerifyDuplication            => "verify_duplication",
            Self::FinishVerification           => "finish_verification",
            Self::AllocateBlock                => "allocate_block",
            Self::AttemptPacking               => "attempt_packing",
            Self::WriteData                    => "write_data",
            Self::WritePackedBlock             => "write_packed_block",
            Self::SharePackedLock              => "share_packed_lock",
            Self::ReleaseUnusedAllocation      => "release_unused_allocation",
            Self::JournalMappingForWrite       => "journal_mapping_for_write",
            Self::JournalMappingForDedupe      => "journal_mapping_for_dedupe",
            Self::JournalMappingForCompression => "journal_mapping_for_compression",
            Self::JournalUnmappingForDiscard   => "journal_unmapping_for_discard",
            Self::PutMappedBlock               => "put_mapped_block",
            Self::UpdateDedupeIndex            => "update_dedupe_index",
            Self::Acknowledge                  => "acknowledge",
            Self::Cleanup                      => "cleanup",
            Self::ReleaseAllocationLock        => "release_allocation_lock",
            Self::ReleasePbnReadLock           => "release_pbn_read_lock",
            Self::HashLockMemberDone           => "hash_lock_member_done",
        }
    }
}


/// The state of one 4 KiB request as it moves through the pipeline.
///
/// A `DataOp` is owned by exactly one place at a time: the zone running its
/// current phase, or the wait list it is parked on. Handing it to another
/// zone or parking it moves the `Box`, so it is on at most one wait list by
/// construction.
#[derive(Debug)]
pub(crate) struct DataOp {
    pub(crate) lbn:               u64,
    pub(crate) logical_zone:      u8,
    pub(crate) kind:              IoKind,
    pub(crate) fua:               bool,
    pub(crate) is_discard:        bool,
    pub(crate) is_partial:        bool,
    /// Byte offset of the user range within the block; 512-byte granular.
    pub(crate) offset:            usize,
    /// Byte length of the user range within this block.
    pub(crate) len:               usize,
    /// Bytes left in the discard train starting at this operation.
    pub(crate) remaining_discard: u64,

    /// Write payload on the way in; read payload on the way out.
    pub(crate) user_data:         Vec<u8>,
    pub(crate) completion:        Option<Sender<BioResult>>,

    /// The full 4 KiB this operation writes. Immutable once hashing begins.
    pub(crate) staging:           Arc<Block>,
    /// Landing area for blocks read back from the store.
    pub(crate) scratch:           Box<Block>,
    pub(crate) compression:       CompressionState,

    pub(crate) record_name:       Option<RecordName>,
    pub(crate) hash_zone:         u8,
    pub(crate) is_zero:           bool,

    /// The old LBN-to-PBN binding read from the block map.
    pub(crate) mapped:            ZonedPbn,
    /// The binding installed on success.
    pub(crate) new_mapped:        ZonedPbn,
    pub(crate) allocation:        Allocation,
    /// Advisory duplicate location from the index; trusted only after
    /// verification.
    pub(crate) duplicate:         ZonedPbn,
    pub(crate) is_duplicate:      bool,

    pub(crate) logical_locked:    bool,
    pub(crate) hash_member:       bool,
    pub(crate) hash_role:         Option<HashLockRole>,
    /// PBN lock shares held beyond the allocation lock: a read lock on the
    /// mapped block, a verify lock on a duplicate candidate, or a share of a
    /// packed block's lock.
    pub(crate) held_shares:       Vec<(Pbn, u8)>,
    /// A provisionally-referenced block abandoned by this operation, still
    /// owing a journaled decrement.
    pub(crate) release_unused_pbn: Option<Pbn>,

    pub(crate) phase:             Phase,
    pub(crate) status:            Option<Status>,
    pub(crate) shared:            Arc<OpShared>,
    /// While acting as the agent of a compressed write, the other
    /// operations whose fragments share the block.
    pub(crate) packed:            Vec<Box<DataOp>>,
    /// Forces the next same-zone continuation through the queue instead of
    /// running inline, bounding stack depth on lock transfer.
    pub(crate) requeued:          bool,
}
