//! The deduplication index contract.
//!
//! The index maps 16-byte record names to 16 bytes of caller metadata,
//! which the engine uses to pack a `(pbn, mapping state)` pair. Index
//! answers are only ever advice: the engine must verify the data at the
//! advised location before sharing it, because the index may be arbitrarily
//! stale.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use condense_block::{MappingState, RecordName};

use crate::types::Pbn;


/// The request types the index accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Look the name up; if it is absent and new metadata was supplied,
    /// record it.
    Query,
    /// Look the name up without updating anything.
    QueryNoUpdate,
    /// Record the name unconditionally.
    Post,
    /// Replace the metadata of a name already in the index.
    Update,
    Delete,
}

/// The 16 bytes of metadata stored with each record name: a packed physical
/// location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexMetadata {
    pub pbn:   Pbn,
    pub state: MappingState,
}

impl IndexMetadata {
    pub const ENCODED_LEN: usize = 16;

    #[must_use]
    pub fn encode(self) -> [u8; Self::ENCODED_LEN] {
        let mut encoded = [0; Self::ENCODED_LEN];
        encoded[0..8].copy_from_slice(&self.pbn.to_le_bytes());
        encoded[8] = self.state.to_raw();
        encoded
    }

    /// Decode a metadata blob. Unknown mapping states and nonzero reserved
    /// bytes mean the advice is garbage and must be ignored.
    #[must_use]
    pub fn decode(encoded: [u8; Self::ENCODED_LEN]) -> Option<Self> {
        let pbn = u64::from_le_bytes(encoded[0..8].try_into().expect("8-byte slice"));
        let state = MappingState::from_raw(encoded[8])?;
        if encoded[9..].iter().any(|&byte| byte != 0) {
            return None;
        }
        Some(Self { pbn, state })
    }
}

/// What the index said about a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexAnswer {
    Found(IndexMetadata),
    NotFound,
    /// The index is busy; the caller may retry later on the same request.
    /// The data path treats this the same as a miss.
    Queued,
    Error,
}

/// The deduplication index. Fire-and-forget from the engine's point of
/// view: every answer is advisory and failures are never fatal.
pub trait DedupeIndex: Debug + Send + Sync {
    fn request(
        &self,
        name:         RecordName,
        kind:         RequestKind,
        new_metadata: Option<IndexMetadata>,
    ) -> IndexAnswer;
}


/// An in-memory index, with injectable `Queued` and `Error` answers so
/// tests can exercise the fallthrough paths.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    entries:    Mutex<HashMap<RecordName, IndexMetadata>>,
    queue_next: AtomicBool,
    fail_next:  AtomicBool,
}

impl MemoryIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Plant advice directly, bypassing the request interface. Combined
    /// with overwriting the advised block, this reproduces a stale index.
    pub fn insert(&self, name: RecordName, metadata: IndexMetadata) {
        self.entries.lock().insert(name, metadata);
    }

    #[must_use]
    pub fn lookup(&self, name: RecordName) -> Option<IndexMetadata> {
        self.entries.lock().get(&name).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Answer the next request with `Queued`.
    pub fn inject_queued_answer(&self) {
        self.queue_next.store(true, Ordering::Relaxed);
    }

    /// Answer the next request with `Error`.
    pub fn inject_error(&self) {
        self.fail_next.store(true, Ordering::Relaxed);
    }
}

impl DedupeIndex for MemoryIndex {
    fn request(
        &self,
        name:         RecordName,
        kind:         RequestKind,
        new_metadata: Option<IndexMetadata>,
    ) -> IndexAnswer {
        if self.queue_next.swap(false, Ordering::Relaxed) {
            return IndexAnswer::Queued;
        }
        if self.fail_next.swap(false, Ordering::Relaxed) {
            return IndexAnswer::Error;
        }

        let mut entries = self.entries.lock();
        match kind {
            RequestKind::Query => {
                if let Some(found) = entries.get(&name) {
                    IndexAnswer::Found(*found)
                } else {
                    if let Some(metadata) = new_metadata {
                        entries.insert(name, metadata);
                    }
                    IndexAnswer::NotFound
                }
            }
            RequestKind::QueryNoUpdate => entries
                .get(&name)
                .map(|found| IndexAnswer::Found(*found))
                .unwrap_or(IndexAnswer::NotFound),
            RequestKind::Post | RequestKind::Update => {
                if let Some(metadata) = new_metadata {
                    entries.insert(name, metadata);
                }
                IndexAnswer::NotFound
            }
            RequestKind::Delete => {
                entries.remove(&name);
                IndexAnswer::NotFound
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use condense_block::{MappingState, RecordName};

    use super::{DedupeIndex as _, IndexAnswer, IndexMetadata, MemoryIndex, RequestKind};

    fn name(tag: u8) -> RecordName {
        RecordName::of_data(&[tag])
    }

    #[test]
    fn metadata_encoding_round_trips() {
        let metadata = IndexMetadata {
            pbn:   0x0123_4567_89AB,
            state: MappingState::Compressed(5),
        };
        assert_eq!(IndexMetadata::decode(metadata.encode()), Some(metadata));

        let mut corrupt = metadata.encode();
        corrupt[8] = 0xFF;
        assert_eq!(IndexMetadata::decode(corrupt), None);
        let mut reserved = metadata.encode();
        reserved[15] = 1;
        assert_eq!(IndexMetadata::decode(reserved), None);
    }

    #[test]
    fn query_records_when_absent() {
        let index = MemoryIndex::new();
        let metadata = IndexMetadata { pbn: 9, state: MappingState::Uncompressed };

        assert_eq!(
            index.request(name(1), RequestKind::Query, Some(metadata)),
            IndexAnswer::NotFound,
        );
        assert_eq!(
            index.request(name(1), RequestKind::QueryNoUpdate, None),
            IndexAnswer::Found(metadata),
        );
    }

    #[test]
    fn injected_answers_fire_once() {
        let index = MemoryIndex::new();
        index.inject_queued_answer();
        assert_eq!(
            index.request(name(2), RequestKind::Query, None),
            IndexAnswer::Queued,
        );
        assert_eq!(
            index.request(name(2), RequestKind::Query, None),
            IndexAnswer::NotFound,
        );
    }
}
