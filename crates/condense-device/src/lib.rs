//! A block-level deduplication and compression engine for a virtual block
//! device.
//!
//! Above sits a generic block-device interface issuing reads, writes,
//! discards, and flushes by logical block number; below sits a single
//! backing store addressed by physical block number. In between, a
//! content-addressed index lets logically distinct blocks with identical
//! content share one physical block, and a packer lets several compressible
//! blocks share one.
//!
//! The pipeline is partitioned into zones (logical, physical, hash, CPU,
//! journal, packer, and the bio pair), each a single thread draining a
//! priority queue. All shared state is owned by exactly one zone; an
//! operation moves between zones by being enqueued, never by being shared.

mod bio;
mod block_map;
mod config;
mod cpu;
mod data_op;
mod dedupe;
mod device;
mod dispatcher;
mod engine;
mod error;
mod hash_lock;
mod journal;
mod logical;
mod packer;
mod physical;
mod stats;
mod store;
mod types;


pub use condense_block::{BLOCK_SIZE, Block, MappingState, RecordName, SECTOR_SIZE, SlotNumber};

pub use self::{
    config::{DEFAULT_PACKER_BINS, DeviceConfig},
    dedupe::{DedupeIndex, IndexAnswer, IndexMetadata, MemoryIndex, RequestKind},
    device::{Device, PendingIo},
    error::{Result, Status},
    journal::{JournalEntry, JournalEntryKind},
    stats::StatisticsSnapshot,
    store::{MemoryStore, PhysicalStore},
    types::{Lbn, MAX_LOGICAL_BLOCKS, Pbn, ZERO_BLOCK},
};
