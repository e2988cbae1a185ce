//! The LBN-to-PBN mapping store.
//!
//! The real thing is a persistent radix tree with its own caches; the data
//! path only ever sees the two calls below, each made from the logical zone
//! that owns the LBN. This in-memory rendition keeps one table per logical
//! zone so the partitioning matches the callers.

use std::collections::HashMap;

use parking_lot::Mutex;

use condense_block::MappingState;

use crate::config::DeviceConfig;
use crate::error::{Result, Status};
use crate::types::{Lbn, Pbn, ZERO_BLOCK};


#[derive(Debug)]
pub(crate) struct BlockMap {
    zones:          Vec<Mutex<HashMap<Lbn, (Pbn, MappingState)>>>,
    logical_blocks: u64,
}

impl BlockMap {
    #[must_use]
    pub(crate) fn new(config: &DeviceConfig) -> Self {
        let zones = (0..config.logical_zones).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            zones,
            logical_blocks: config.logical_blocks,
        }
    }

    /// Look up the mapping for `lbn`. Absent entries read as unmapped.
    pub(crate) fn get_mapping(&self, zone: u8, lbn: Lbn) -> Result<(Pbn, MappingState)> {
        if lbn >= self.logical_blocks {
            return Err(Status::OutOfRange);
        }
        let mapping = self.zones[usize::from(zone)]
            .lock()
            .get(&lbn)
            .copied()
            .unwrap_or((ZERO_BLOCK, MappingState::Unmapped));
        Ok(mapping)
    }

    /// Install a new mapping for `lbn`. The caller must have journaled the
    /// mapping delta first.
    pub(crate) fn put_mapping(&self, zone: u8, lbn: Lbn, pbn: Pbn, state: MappingState) {
        let mut table = self.zones[usize::from(zone)].lock();
        if state == MappingState::Unmapped && pbn == ZERO_BLOCK {
            table.remove(&lbn);
        } else {
            table.insert(lbn, (pbn, state));
        }
    }
}


#[cfg(test)]
mod tests {
    use condense_block::MappingState;

    use crate::config::DeviceConfig;
    use crate::error::Status;
    use crate::types::ZERO_BLOCK;
    use super::BlockMap;

    #[test]
    fn absent_reads_as_unmapped() {
        let map = BlockMap::new(&DeviceConfig::new(64, 16));
        assert_eq!(map.get_mapping(0, 7), Ok((ZERO_BLOCK, MappingState::Unmapped)));
    }

    #[test]
    fn out_of_range_lbn() {
        let map = BlockMap::new(&DeviceConfig::new(64, 16));
        assert_eq!(map.get_mapping(0, 64), Err(Status::OutOfRange));
    }

    #[test]
    fn unmapping_removes_the_entry() {
        let map = BlockMap::new(&DeviceConfig::new(64, 16));
        map.put_mapping(1, 9, 5, MappingState::Uncompressed);
        assert_eq!(map.get_mapping(1, 9), Ok((5, MappingState::Uncompressed)));

        map.put_mapping(1, 9, ZERO_BLOCK, MappingState::Unmapped);
        assert_eq!(map.get_mapping(1, 9), Ok((ZERO_BLOCK, MappingState::Unmapped)));
    }
}
