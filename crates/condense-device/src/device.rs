//! The virtual block device: request validation and fragmentation upstream
//! of the data path, and the submitter-facing completion plumbing.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};

use condense_block::{BLOCK_SIZE, Block, MappingState, SECTOR_SIZE};

use crate::config::DeviceConfig;
use crate::data_op::{Allocation, CompressionState, DataOp, IoKind, OpShared, Phase, ZonedPbn};
use crate::dedupe::{DedupeIndex, MemoryIndex};
use crate::dispatcher::{Priority, ZoneHandle, ZoneMessage, make_zone, ZoneClass, ZoneId};
use crate::engine::{EngineInner, Router, run_zone};
use crate::error::{Result, Status};
use crate::journal::JournalEntry;
use crate::stats::{Statistics, StatisticsSnapshot};
use crate::store::{MemoryStore, PhysicalStore};
use crate::types::{Lbn, Pbn, ZERO_BLOCK};


/// What the pipeline hands back for one 4 KiB operation.
#[derive(Debug)]
pub(crate) struct BioResult {
    pub(crate) result: Result<()>,
    pub(crate) data:   Vec<u8>,
}

/// The in-flight half of a submitted request: one completion per 4 KiB
/// operation the request was fragmented into.
#[derive(Debug)]
pub struct PendingIo {
    receivers: Vec<Receiver<BioResult>>,
}

impl PendingIo {
    /// Wait for every fragment. Returns the concatenated data (for reads)
    /// or the first error any fragment reported.
    pub fn wait(self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut first_error = None;
        for receiver in self.receivers {
            let completion = receiver.recv().map_err(|_| Status::Io)?;
            if let Err(status) = completion.result {
                first_error.get_or_insert(status);
            }
            data.extend_from_slice(&completion.data);
        }
        match first_error {
            Some(status) => Err(status),
            None         => Ok(data),
        }
    }

    /// Like [`PendingIo::wait`], but periodically flushes the packer while
    /// waiting. A lone compressible write parks in a packer bin waiting for
    /// company; a submitter with nothing else outstanding has to kick the
    /// packer or it would wait forever.
    fn wait_nudging(self, device: &Device) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut first_error = None;
        for receiver in self.receivers {
            let completion = loop {
                match receiver.recv_timeout(Duration::from_millis(10)) {
                    Ok(completion) => break completion,
                    Err(RecvTimeoutError::Timeout) => device.flush_packer(),
                    Err(RecvTimeoutError::Disconnected) => return Err(Status::Io),
                }
            };
            if let Err(status) = completion.result {
                first_error.get_or_insert(status);
            }
            data.extend_from_slice(&completion.data);
        }
        match first_error {
            Some(status) => Err(status),
            None         => Ok(data),
        }
    }
}


/// A deduplicating, compressing virtual block device.
///
/// Requests address bytes at 512-byte granularity; the device fragments
/// them into 4 KiB operations before they enter the data path, so the core
/// pipeline only ever sees single-block work.
#[derive(Debug)]
pub struct Device {
    engine:  Arc<EngineInner>,
    threads: Vec<JoinHandle<()>>,
}

impl Device {
    /// Open a device backed by a fresh in-memory store and index.
    pub fn open(config: DeviceConfig) -> Result<Self> {
        let store = Arc::new(MemoryStore::new(config.physical_blocks));
        Self::open_with(config, Arc::new(MemoryIndex::new()), store)
    }

    /// Open a device with caller-provided collaborators, e.g. to share an
    /// index between runs or to inject faults.
    pub fn open_with(
        config: DeviceConfig,
        index:  Arc<dyn DedupeIndex>,
        store:  Arc<dyn PhysicalStore>,
    ) -> Result<Self> {
        config.validate()?;
        if store.block_count() < config.physical_blocks {
            return Err(Status::InvalidArgument);
        }

        let mut queues = Vec::new();
        let mut make_class = |class: ZoneClass, count: u8| -> Vec<ZoneHandle> {
            (0..count)
                .map(|index| {
                    let id = ZoneId::new(class, index);
                    let (handle, queue) = make_zone(id);
                    queues.push((id, queue));
                    handle
                })
                .collect()
        };

        let router = Router {
            logical:    make_class(ZoneClass::Logical, config.logical_zones),
            physical:   make_class(ZoneClass::Physical, config.physical_zones),
            hash:       make_class(ZoneClass::Hash, config.hash_zones),
            cpu:        make_class(ZoneClass::Cpu, config.cpu_zones),
            journal:    make_class(ZoneClass::Journal, 1).remove(0),
            packer:     make_class(ZoneClass::Packer, 1).remove(0),
            bio_ack:    make_class(ZoneClass::BioAck, 1).remove(0),
            bio_submit: make_class(ZoneClass::BioSubmit, 1).remove(0),
        };

        let engine = Arc::new(EngineInner::new(config, router, index, store));
        let threads = queues
            .into_iter()
            .map(|(id, queue)| {
                let engine = Arc::clone(&engine);
                std::thread::Builder::new()
                    .name(format!("condense-{id}"))
                    .spawn(move || run_zone(engine, id, queue))
                    .expect("spawning a zone thread")
            })
            .collect();

        tracing::event!(
            tracing::Level::INFO,
            "device open: {} logical blocks, {} physical blocks",
            engine.config.logical_blocks,
            engine.config.physical_blocks,
        );
        Ok(Self { engine, threads })
    }

    // Blocking convenience wrappers.

    /// Write `data` at byte offset `offset`, waiting for the mapping to be
    /// durable.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.submit_write(offset, data)?.wait_nudging(self).map(drop)
    }

    /// [`Device::write_at`] with force-unit-access semantics. Every write
    /// here is acknowledged only after its journal entries commit, so FUA
    /// is carried on the operation but adds no extra wait.
    pub fn write_at_fua(&self, offset: u64, data: &[u8]) -> Result<()> {
        let pending = self.submit(offset, data, true)?;
        pending.wait_nudging(self).map(drop)
    }

    /// Read `buf.len()` bytes from byte offset `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.submit_read(offset, buf.len())?.wait()?;
        buf.copy_from_slice(&data);
        Ok(())
    }

    /// Discard a byte range: full blocks unmap, partial blocks zero.
    pub fn discard_at(&self, offset: u64, len: u64) -> Result<()> {
        self.submit_discard(offset, len)?.wait().map(drop)
    }

    // Asynchronous submission.

    pub fn submit_write(&self, offset: u64, data: &[u8]) -> Result<PendingIo> {
        self.submit(offset, data, false)
    }

    fn submit(&self, offset: u64, data: &[u8], fua: bool) -> Result<PendingIo> {
        let fragments = fragment_range(offset, data.len() as u64)?;
        let mut receivers = Vec::with_capacity(fragments.len());
        let mut consumed = 0_usize;

        for piece in fragments {
            let chunk = &data[consumed..consumed + piece.len];
            consumed += piece.len;

            let (mut op, receiver) = self.new_op(&piece, IoKind::Write);
            op.fua = fua;
            if piece.is_full_block() {
                op.staging = Arc::new(
                    Block::copied_from(chunk).expect("full fragments are block-sized"),
                );
                op.is_zero = op.staging.is_zero();
            } else {
                op.kind = IoKind::ReadModifyWrite;
                op.user_data = chunk.to_vec();
            }
            Statistics::count(&self.engine.stats.writes);
            receivers.push(receiver);
            self.engine.launch_logical(op, Phase::AttemptLogicalBlockLock);
        }

        Ok(PendingIo { receivers })
    }

    pub fn submit_read(&self, offset: u64, len: usize) -> Result<PendingIo> {
        let fragments = fragment_range(offset, len as u64)?;
        let mut receivers = Vec::with_capacity(fragments.len());

        for piece in fragments {
            let (op, receiver) = self.new_op(&piece, IoKind::Read);
            Statistics::count(&self.engine.stats.reads);
            receivers.push(receiver);
            self.engine.launch_logical(op, Phase::AttemptLogicalBlockLock);
        }

        Ok(PendingIo { receivers })
    }

    pub fn submit_discard(&self, offset: u64, len: u64) -> Result<PendingIo> {
        let fragments = fragment_range(offset, len)?;
        let mut receivers = Vec::with_capacity(fragments.len());
        let mut remaining = len;

        for piece in fragments {
            let (mut op, receiver) = self.new_op(&piece, IoKind::Write);
            op.is_discard = true;
            op.remaining_discard = remaining;
            remaining -= piece.len as u64;
            if !piece.is_full_block() {
                // A partial discard zeroes a subrange in place.
                op.kind = IoKind::ReadModifyWrite;
            }
            Statistics::count(&self.engine.stats.discards);
            receivers.push(receiver);
            self.engine.launch_logical(op, Phase::AttemptLogicalBlockLock);
        }

        Ok(PendingIo { receivers })
    }

    /// Flush: drain the packer and wait for every journal entry committed
    /// so far. Write acknowledgements already imply journal commit, so this
    /// is a barrier, not a durability upgrade.
    pub fn flush(&self) -> Result<()> {
        Statistics::count(&self.engine.stats.flushes);
        self.flush_packer();
        let (done, wait) = bounded(1);
        self.engine
            .router
            .journal
            .send(Priority::Data, ZoneMessage::FlushJournal { done });
        wait.recv().map_err(|_| Status::Io)
    }

    /// Advance the packer's flush generation and write out its bins.
    pub fn flush_packer(&self) {
        self.engine
            .router
            .packer
            .send(Priority::Data, ZoneMessage::FlushPacker);
    }

    /// Fail all future writes with `READ_ONLY`; reads keep working.
    pub fn enter_read_only_mode(&self) {
        self.engine.enter_read_only_mode();
    }

    // Introspection, mostly for tools and tests.

    #[must_use]
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.engine.stats.snapshot()
    }

    /// The committed recovery-journal entries, in order.
    #[must_use]
    pub fn journal_entries(&self) -> Vec<JournalEntry> {
        self.engine.journal.snapshot()
    }

    /// The current reference count of a physical block.
    #[must_use]
    pub fn reference_count(&self, pbn: Pbn) -> u32 {
        self.engine.depot.reference_count(pbn)
    }

    /// The block-map entry for `lbn`, or `None` while unmapped.
    pub fn mapping_of(&self, lbn: Lbn) -> Result<Option<(Pbn, MappingState)>> {
        let zone = self.engine.logical_zone_of(lbn);
        let (pbn, state) = self.engine.block_map.get_mapping(zone, lbn)?;
        if pbn == ZERO_BLOCK && state == MappingState::Unmapped {
            Ok(None)
        } else {
            Ok(Some((pbn, state)))
        }
    }

    fn new_op(&self, piece: &Fragment, kind: IoKind) -> (Box<DataOp>, Receiver<BioResult>) {
        let engine = &self.engine;
        Statistics::count(&engine.stats.bios_in);
        let (sender, receiver) = bounded(1);
        let op = Box::new(DataOp {
            lbn:               piece.lbn,
            logical_zone:      engine.logical_zone_of(piece.lbn),
            kind,
            fua:               false,
            is_discard:        false,
            is_partial:        !piece.is_full_block(),
            offset:            piece.offset,
            len:               piece.len,
            remaining_discard: 0,
            user_data:         Vec::new(),
            completion:        Some(sender),
            staging:           Arc::new(Block::zeroed()),
            scratch:           Box::new(Block::zeroed()),
            compression:       CompressionState::default(),
            record_name:       None,
            hash_zone:         0,
            is_zero:           false,
            mapped:            ZonedPbn::default(),
            new_mapped:        ZonedPbn::default(),
            allocation:        Allocation::default(),
            duplicate:         ZonedPbn::default(),
            is_duplicate:      false,
            logical_locked:    false,
            hash_member:       false,
            hash_role:         None,
            held_shares:       Vec::new(),
            release_unused_pbn: None,
            phase:             Phase::Launch,
            status:            None,
            shared:            Arc::new(OpShared::new(engine.new_op_id())),
            packed:            Vec::new(),
            requeued:          false,
        });
        (op, receiver)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let router = &self.engine.router;
        let all = router
            .logical
            .iter()
            .chain(&router.physical)
            .chain(&router.hash)
            .chain(&router.cpu)
            .chain([&router.journal, &router.packer, &router.bio_ack, &router.bio_submit]);
        for handle in all {
            handle.send(Priority::Low, ZoneMessage::Shutdown);
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}


/// One 4 KiB slice of a user request.
#[derive(Debug, Clone, Copy)]
struct Fragment {
    lbn:    Lbn,
    offset: usize,
    len:    usize,
}

impl Fragment {
    fn is_full_block(self) -> bool {
        self.offset == 0 && self.len == BLOCK_SIZE
    }
}

/// Split a byte range into per-block fragments, validating the 512-byte
/// granularity contract.
fn fragment_range(offset: u64, len: u64) -> Result<Vec<Fragment>> {
    let sector = SECTOR_SIZE as u64;
    if len == 0 || offset % sector != 0 || len % sector != 0 {
        return Err(Status::InvalidArgument);
    }

    let block = BLOCK_SIZE as u64;
    let mut fragments = Vec::new();
    let mut at = offset;
    let end = offset + len;
    while at < end {
        let block_offset = at % block;
        let take = (block - block_offset).min(end - at);
        fragments.push(Fragment {
            lbn:    at / block,
            offset: usize::try_from(block_offset).expect("offset within a block"),
            len:    usize::try_from(take).expect("length within a block"),
        });
        at += take;
    }
    Ok(fragments)
}


#[cfg(test)]
mod tests {
    use crate::error::Status;
    use super::fragment_range;

    #[test]
    fn rejects_misaligned_ranges() {
        assert_eq!(fragment_range(0, 0).unwrap_err(), Status::InvalidArgument);
        assert_eq!(fragment_range(100, 512).unwrap_err(), Status::InvalidArgument);
        assert_eq!(fragment_range(512, 100).unwrap_err(), Status::InvalidArgument);
    }

    #[test]
    fn splits_on_block_boundaries() {
        // 512 bytes at the end of block 0, all of block 1, 512 into block 2.
        let fragments = fragment_range(4096 - 512, 512 + 4096 + 512).unwrap();
        assert_eq!(fragments.len(), 3);
        assert_eq!(
            (fragments[0].lbn, fragments[0].offset, fragments[0].len),
            (0, 4096 - 512, 512),
        );
        assert_eq!((fragments[1].lbn, fragments[1].offset, fragments[1].len), (1, 0, 4096));
        assert_eq!((fragments[2].lbn, fragments[2].offset, fragments[2].len), (2, 0, 512));
    }

    #[test]
    fn exact_block_boundary() {
        let fragments = fragment_range(4096, 4096).unwrap();
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].is_full_block());
        assert_eq!(fragments[0].lbn, 1);
    }
}
