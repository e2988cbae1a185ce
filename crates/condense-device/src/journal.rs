//! The recovery journal gateway.
//!
//! Reference-count changes and mapping changes become durable in journal
//! order, and everything downstream of the journal (the block map write and
//! the write acknowledgement) may only happen after the entries for an
//! operation commit. For one operation the order is fixed: increments for
//! the new location, then the mapping, then decrements for the old
//! location. This in-memory journal commits synchronously on the journal
//! zone, records every entry for inspection, and applies the reference
//! count deltas as each entry commits.

use std::sync::Arc;

use parking_lot::Mutex;

use condense_block::MappingState;

use crate::data_op::{DataOp, Phase};
use crate::dispatcher::{ZoneClass, ZoneId, assert_on_zone};
use crate::engine::EngineInner;
use crate::types::{Lbn, Pbn, ZERO_BLOCK};


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEntryKind {
    Increment {
        pbn: Pbn,
    },
    Decrement {
        pbn: Pbn,
    },
    Mapping {
        lbn:       Lbn,
        old_pbn:   Pbn,
        new_pbn:   Pbn,
        new_state: MappingState,
    },
}

/// One committed journal entry. The checksum covers the encoded entry body,
/// the way the on-disk journal protects each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalEntry {
    pub sequence: u64,
    pub kind:     JournalEntryKind,
    pub checksum: u32,
}

impl JournalEntryKind {
    fn encode_body(self) -> [u8; 26] {
        let mut body = [0; 26];
        match self {
            Self::Increment { pbn } => {
                body[0] = 1;
                body[1..9].copy_from_slice(&pbn.to_le_bytes());
            }
            Self::Decrement { pbn } => {
                body[0] = 2;
                body[1..9].copy_from_slice(&pbn.to_le_bytes());
            }
            Self::Mapping { lbn, old_pbn, new_pbn, new_state } => {
                body[0] = 3;
                body[1..9].copy_from_slice(&lbn.to_le_bytes());
                body[9..17].copy_from_slice(&old_pbn.to_le_bytes());
                body[17..25].copy_from_slice(&new_pbn.to_le_bytes());
                body[25] = new_state.to_raw();
            }
        }
        body
    }
}


/// The committed entries, in total order. Appended to only from the journal
/// zone.
#[derive(Debug, Default)]
pub(crate) struct RecoveryJournal {
    entries: Mutex<Vec<JournalEntry>>,
}

impl RecoveryJournal {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&self, kind: JournalEntryKind) -> u64 {
        let mut entries = self.entries.lock();
        let sequence = entries.len() as u64;
        entries.push(JournalEntry {
            sequence,
            kind,
            checksum: crc32c::crc32c(&kind.encode_body()),
        });
        sequence
    }

    #[must_use]
    pub(crate) fn snapshot(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }
}


fn journal_zone() -> ZoneId {
    ZoneId::solo(ZoneClass::Journal)
}

/// Commit every journal entry one operation owes, then send it on to
/// install its mapping.
///
/// Entry order within the operation is what crash consistency depends on:
/// the new location's reference must be on stable storage before any
/// mapping points at it, and the old location's reference is only given
/// back after the mapping no longer points there.
pub(crate) fn journal_op(mut op: Box<DataOp>, engine: &Arc<EngineInner>) {
    assert_on_zone(journal_zone());

    // An abandoned provisional reference (a packed follower's unused
    // allocation) is unrelated to the mapping and goes first.
    if let Some(pbn) = op.release_unused_pbn.take() {
        engine.journal.append(JournalEntryKind::Decrement { pbn });
        engine.depot.commit_decrement(pbn);
    }

    let new = op.new_mapped;
    let old = op.mapped;

    if new.pbn != ZERO_BLOCK && new.state != MappingState::Unmapped {
        engine.journal.append(JournalEntryKind::Increment { pbn: new.pbn });
        engine.depot.commit_increment(new.pbn);
    }

    engine.journal.append(JournalEntryKind::Mapping {
        lbn:       op.lbn,
        old_pbn:   old.pbn,
        new_pbn:   new.pbn,
        new_state: new.state,
    });

    if old.pbn != ZERO_BLOCK && old.state != MappingState::Unmapped {
        engine.journal.append(JournalEntryKind::Decrement { pbn: old.pbn });
        engine.depot.commit_decrement(old.pbn);
    }

    if op.fua {
        // Commits here are synchronous, so force-unit-access needs no
        // extra wait; the mapping is durable before the acknowledgement.
        tracing::event!(tracing::Level::TRACE, "FUA write committed for LBN {}", op.lbn);
    }

    engine.launch_logical(op, Phase::PutMappedBlock);
}

/// An abandoned provisional reference with no operation attached (the
/// failure paths): journal the decrement that frees the block.
pub(crate) fn release_provisional_reference(engine: &Arc<EngineInner>, pbn: Pbn) {
    assert_on_zone(journal_zone());
    engine.journal.append(JournalEntryKind::Decrement { pbn });
    engine.depot.commit_decrement(pbn);
}
