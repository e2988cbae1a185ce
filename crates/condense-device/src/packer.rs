//! The packer: opportunistic batching of compressed fragments into shared
//! physical blocks.
//!
//! Each bin accumulates fragments that together still fit in one block's
//! data area. Operations park in a bin until it fills, is evicted to make
//! room, or a flush drains it; then the first uncanceled operation becomes
//! the agent, the other fragments are copied into the agent's compressed
//! block (the agent's own fragment is already in slot 0), and the agent
//! writes the block out. Cancellation pulls an operation out of its bin
//! into the canceled bin, where it waits for its canceller before carrying
//! on as an ordinary uncompressed write.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use condense_block::{
    COMPRESSED_BLOCK_DATA_SIZE_V2, CompressionType, MAX_COMPRESSION_SLOTS,
};

use crate::config::DeviceConfig;
use crate::data_op::{DataOp, Phase};
use crate::dispatcher::{ZoneClass, ZoneId, assert_on_zone};
use crate::engine::EngineInner;
use crate::stats::Statistics;


#[derive(Debug)]
struct PackerBin {
    slots:      Vec<Box<DataOp>>,
    free_space: usize,
    generation: u64,
    last_used:  u64,
}

impl PackerBin {
    fn empty(generation: u64) -> Self {
        Self {
            slots: Vec::new(),
            free_space: COMPRESSED_BLOCK_DATA_SIZE_V2,
            generation,
            last_used: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) struct PackerZone {
    bins:             Vec<PackerBin>,
    /// Operations pulled out of their bins by cancellation, waiting for
    /// their canceller to rendezvous with them.
    canceled_bin:     Vec<Box<DataOp>>,
    flush_generation: u64,
    max_bins:         usize,
    tick:             u64,
}

impl PackerZone {
    #[must_use]
    pub(crate) fn new(config: &DeviceConfig) -> Self {
        Self {
            bins:             Vec::new(),
            canceled_bin:     Vec::new(),
            flush_generation: 0,
            max_bins:         config.packer_bins,
            tick:             0,
        }
    }

    fn id(&self) -> ZoneId {
        ZoneId::solo(ZoneClass::Packer)
    }
}


/// A freshly-allocated compressible write arrives. Either it gets a bin
/// slot, or it falls back to writing its block uncompressed.
pub(crate) fn attempt_packing(
    op:     Box<DataOp>,
    zone:   &mut PackerZone,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());

    // The cancel flag is (only) read here: an operation whose compression
    // was canceled before arrival skips the packer entirely.
    if !op.compression.is_compressible() || !op.shared.try_enter_packer() {
        engine.launch_bio_submit(op, Phase::WriteData);
        return;
    }

    let size = usize::from(op.compression.size);
    zone.tick += 1;
    let now = zone.tick;

    // The narrowest bin that still fits this fragment.
    let mut chosen = zone
        .bins
        .iter()
        .enumerate()
        .filter(|(_, bin)| bin.free_space >= size && bin.slots.len() < MAX_COMPRESSION_SLOTS)
        .min_by_key(|(_, bin)| bin.free_space)
        .map(|(index, _)| index);

    if chosen.is_none() {
        if zone.bins.len() < zone.max_bins {
            zone.bins.push(PackerBin::empty(zone.flush_generation));
        } else {
            // Evict the least recently modified bin by writing it out.
            let evicted = zone
                .bins
                .iter()
                .enumerate()
                .min_by_key(|(_, bin)| bin.last_used)
                .map(|(index, _)| index)
                .expect("at least one bin is configured");
            write_bin(zone, evicted, engine);
        }
        chosen = zone
            .bins
            .iter()
            .position(|bin| bin.free_space >= size && bin.slots.is_empty());
    }

    let index = chosen.expect("an empty bin fits any compressible fragment");
    let bin = &mut zone.bins[index];
    if bin.slots.is_empty() {
        bin.generation = zone.flush_generation;
    }
    bin.free_space -= size;
    bin.last_used = now;
    bin.slots.push(op);
    engine.stats.fragments_in_packer.fetch_add(1, Ordering::Relaxed);

    if zone.bins[index].slots.len() == MAX_COMPRESSION_SLOTS {
        write_bin(zone, index, engine);
    }
}

/// Close a bin: elect the agent, pack the other fragments into its block,
/// and send the write down. Bins that end up with fewer than two live
/// fragments degrade to ordinary uncompressed writes, since a compressed
/// block with one fragment saves nothing.
fn write_bin(zone: &mut PackerZone, index: usize, engine: &Arc<EngineInner>) {
    let slots = {
        let bin = &mut zone.bins[index];
        bin.free_space = COMPRESSED_BLOCK_DATA_SIZE_V2;
        std::mem::take(&mut bin.slots)
    };
    engine.stats.fragments_in_packer.fetch_sub(
        slots.len() as u64,
        Ordering::Relaxed,
    );

    let mut live = Vec::with_capacity(slots.len());
    for op in slots {
        if op.shared.try_begin_packed_write() {
            live.push(op);
        } else {
            // Canceled while parked; its canceller's message is in flight
            // and will collect it from the canceled bin.
            zone.canceled_bin.push(op);
        }
    }

    if live.len() < 2 {
        if let Some(op) = live.pop() {
            engine.launch_bio_submit(op, Phase::WriteData);
        }
        return;
    }

    let mut agent = live.remove(0);
    agent.compression.slot = 0;
    let agent_size = agent.compression.size;
    agent.compression.block.initialize(agent_size, CompressionType::Lz4);

    let mut offset = usize::from(agent_size);
    for (position, mut follower) in live.into_iter().enumerate() {
        let slot = u8::try_from(position + 1).expect("slot count is bounded");
        let fragment_len = usize::from(follower.compression.size);
        offset = agent
            .compression
            .block
            .pack_fragment(slot, offset, &follower.compression.block.data()[..fragment_len])
            .expect("bin accounting keeps fragments inside the data area");
        follower.compression.slot = slot;
        agent.packed.push(follower);
    }

    Statistics::count(&engine.stats.compressed_blocks_written);
    engine.stats.compressed_fragments_written.fetch_add(
        1 + agent.packed.len() as u64,
        Ordering::Relaxed,
    );
    tracing::event!(
        tracing::Level::TRACE,
        "packing {} fragments into PBN {}", 1 + agent.packed.len(), agent.allocation.pbn,
    );

    engine.launch_bio_submit(agent, Phase::WritePackedBlock);
}

/// A canceller wants an operation out of the packer. Move it from its bin
/// to the canceled bin if the write-out has not already done so, then
/// complete the rendezvous by relaunching it as an uncompressed write.
pub(crate) fn remove_lock_holder(
    zone:   &mut PackerZone,
    op_id:  u64,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());

    for bin in &mut zone.bins {
        if let Some(position) = bin.slots.iter().position(|op| op.shared.op_id() == op_id) {
            let op = bin.slots.remove(position);
            bin.free_space += usize::from(op.compression.size);
            engine.stats.fragments_in_packer.fetch_sub(1, Ordering::Relaxed);
            zone.canceled_bin.push(op);
            break;
        }
    }

    if let Some(position) = zone
        .canceled_bin
        .iter()
        .position(|op| op.shared.op_id() == op_id)
    {
        let op = zone.canceled_bin.remove(position);
        engine.launch_bio_submit(op, Phase::WriteData);
    } else {
        // The cancellation lost the race with the write-out; the operation
        // is already part of a compressed write and needs no help.
        tracing::event!(
            tracing::Level::DEBUG,
            "canceled operation {op_id} already committed to a compressed write",
        );
    }
}

/// Advance the flush generation and drain every bin from an older one.
pub(crate) fn flush(zone: &mut PackerZone, engine: &Arc<EngineInner>) {
    assert_on_zone(zone.id());
    zone.flush_generation += 1;

    for index in 0..zone.bins.len() {
        let stale = !zone.bins[index].slots.is_empty()
            && zone.bins[index].generation < zone.flush_generation;
        if stale {
            write_bin(zone, index, engine);
        }
    }
}
