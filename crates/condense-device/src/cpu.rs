//! CPU zones: compression, hashing, decompression, verification, and the
//! other pure-computation steps. Each CPU zone owns its own compressor so
//! nothing here shares mutable state.

use std::sync::Arc;

use condense_block::{
    BLOCK_SIZE, Block, CompressedBlock, CompressionType, Compressor as _, Lz4Compressor,
    MAX_COMPRESSED_FRAGMENT_SIZE, RecordName,
};

use crate::data_op::{DataOp, INCOMPRESSIBLE, IoKind, Phase};
use crate::dispatcher::{ZoneClass, ZoneId, assert_on_zone};
use crate::engine::{EngineInner, continue_write_after_staging, finish_op, route_to_allocation};
use crate::error::Status;


#[derive(Debug)]
pub(crate) struct CpuZone {
    zone:       u8,
    compressor: Lz4Compressor,
}

impl CpuZone {
    #[must_use]
    pub(crate) fn new(zone: u8) -> Self {
        Self {
            zone,
            compressor: Lz4Compressor,
        }
    }

    fn id(&self) -> ZoneId {
        ZoneId::new(ZoneClass::Cpu, self.zone)
    }
}


/// Compress the staged block into the operation's fragment buffer, then
/// hash it and head for the hash zone that owns the name.
pub(crate) fn compress_data(
    mut op: Box<DataOp>,
    zone:   &mut CpuZone,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());
    debug_assert!(!op.is_zero, "zero blocks bypass compression");

    if engine.config.compression && !op.shared.compression_canceled() {
        // The fragment goes at the start of the compressed block's data
        // area, so a future agent election finds slot 0 already in place.
        let output = &mut op.compression.block.data_mut()[..MAX_COMPRESSED_FRAGMENT_SIZE];
        op.compression.size = match zone.compressor.encode_into(op.staging.as_bytes(), output) {
            Ok(fragment_len) => u16::try_from(fragment_len).unwrap_or(INCOMPRESSIBLE),
            Err(_) => INCOMPRESSIBLE,
        };
    } else {
        op.compression.size = INCOMPRESSIBLE;
    }

    op.phase = Phase::HashData;
    let name = RecordName::of_data(op.staging.as_bytes());
    op.record_name = Some(name);
    op.hash_zone = engine.hash_zone_of(name);

    if engine.config.deduplication {
        engine.launch_hash(op, Phase::AcquireHashLock);
    } else {
        route_to_allocation(op, engine);
    }
}

/// A block came back from the store for a read or the read half of a
/// read-modify-write: decompress if the mapping is compressed, then either
/// answer the read or splice and continue as a write.
pub(crate) fn complete_read(
    mut op: Box<DataOp>,
    zone:   &mut CpuZone,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());

    if op.mapped.state.is_compressed() {
        if let Err(status) = decompress_mapped_fragment(&mut op, zone) {
            finish_op(op, engine, status);
            return;
        }
    }

    if op.kind == IoKind::ReadModifyWrite {
        let staging = Arc::get_mut(&mut op.staging)
            .expect("staging block is uniquely owned before hashing");
        staging.as_mut_bytes().copy_from_slice(op.scratch.as_bytes());
        modify_for_partial_write(op, zone, engine);
        return;
    }

    op.user_data = op.scratch.as_bytes()[op.offset..op.offset + op.len].to_vec();
    engine.launch_ack(op);
}

/// Decode the mapped fragment out of the compressed block in
/// `op.compression.block` into `op.scratch`.
fn decompress_mapped_fragment(op: &mut DataOp, zone: &CpuZone) -> Result<(), Status> {
    let (fragment, compression_type) = op
        .compression
        .block
        .fragment(op.mapped.state)
        .map_err(|_| Status::InvalidFragment)?;
    if compression_type != CompressionType::Lz4 {
        return Err(Status::InvalidFragment);
    }
    let mut decoded = Block::zeroed();
    let decoded_len = zone
        .compressor
        .decode_into(fragment, decoded.as_mut_bytes())
        .map_err(|_| Status::InvalidFragment)?;
    if decoded_len != BLOCK_SIZE {
        return Err(Status::InvalidFragment);
    }
    *op.scratch = decoded;
    Ok(())
}

/// The modify half of read-modify-write: splice the user bytes (or zeros,
/// for a partial discard) into the staged old block, then continue on the
/// ordinary write path.
pub(crate) fn modify_for_partial_write(
    mut op: Box<DataOp>,
    zone:   &mut CpuZone,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());
    op.phase = Phase::ModifyForPartialWrite;

    let offset = op.offset;
    let len = op.len;
    let staging = Arc::get_mut(&mut op.staging)
        .expect("staging block is uniquely owned before hashing");
    if op.is_discard {
        let zero_len = len.min(
            usize::try_from(op.remaining_discard).unwrap_or(len).min(BLOCK_SIZE - offset),
        );
        staging.as_mut_bytes()[offset..offset + zero_len].fill(0);
    } else {
        staging.as_mut_bytes()[offset..offset + len].copy_from_slice(&op.user_data);
    }

    op.is_zero = op.staging.is_zero();
    op.kind = IoKind::Write;
    continue_write_after_staging(op, engine);
}

/// Byte-compare the operation's data against the advised duplicate that
/// was just read back (decompressing the named fragment first if the
/// advice points into a compressed block). Any failure to decode simply
/// means the advice was wrong.
pub(crate) fn verify_duplication(
    mut op: Box<DataOp>,
    zone:   &mut CpuZone,
    engine: &Arc<EngineInner>,
) {
    assert_on_zone(zone.id());

    let matches = if op.duplicate.state.is_compressed() {
        let candidate = CompressedBlock::from_block((*op.scratch).clone());
        match candidate.fragment(op.duplicate.state) {
            Ok((fragment, CompressionType::Lz4)) => {
                let mut decoded = Block::zeroed();
                match zone.compressor.decode_into(fragment, decoded.as_mut_bytes()) {
                    Ok(BLOCK_SIZE) => decoded == *op.staging,
                    _ => false,
                }
            }
            _ => false,
        }
    } else {
        *op.scratch == *op.staging
    };

    op.is_duplicate = matches;
    engine.launch_hash(op, Phase::FinishVerification);
}
