//! The backing physical device, addressed by PBN.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use condense_block::{BLOCK_SIZE, Block};

use crate::error::{Result, Status};
use crate::types::Pbn;


/// Whole-block reads and writes against the device below the engine.
///
/// Implementations are shared across zones but only the bio-submit zone
/// issues data-path I/O, so they see one caller at a time in practice.
pub trait PhysicalStore: Debug + Send + Sync {
    fn block_count(&self) -> u64;

    fn read_block(&self, pbn: Pbn, buf: &mut Block) -> Result<()>;

    fn write_block(&self, pbn: Pbn, data: &Block) -> Result<()>;
}


/// An in-memory backing device.
#[derive(Debug)]
pub struct MemoryStore {
    blocks:      Mutex<Box<[u8]>>,
    block_count: u64,
    fail_reads:  AtomicBool,
}

impl MemoryStore {
    /// A zero-filled store of `block_count` blocks.
    #[must_use]
    pub fn new(block_count: u64) -> Self {
        let bytes = usize::try_from(block_count).unwrap_or(usize::MAX) * BLOCK_SIZE;
        Self {
            blocks: Mutex::new(vec![0; bytes].into_boxed_slice()),
            block_count,
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Make every subsequent read fail with an I/O error, or stop doing so.
    /// Lets tests exercise the hard-failure path without a real bad disk.
    pub fn set_read_fault(&self, enabled: bool) {
        self.fail_reads.store(enabled, Ordering::Relaxed);
    }

    fn range_of(&self, pbn: Pbn) -> Result<std::ops::Range<usize>> {
        if pbn >= self.block_count {
            return Err(Status::OutOfRange);
        }
        let start = usize::try_from(pbn).map_err(|_| Status::OutOfRange)? * BLOCK_SIZE;
        Ok(start..start + BLOCK_SIZE)
    }
}

impl PhysicalStore for MemoryStore {
    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, pbn: Pbn, buf: &mut Block) -> Result<()> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(Status::Io);
        }
        let range = self.range_of(pbn)?;
        buf.as_mut_bytes().copy_from_slice(&self.blocks.lock()[range]);
        Ok(())
    }

    fn write_block(&self, pbn: Pbn, data: &Block) -> Result<()> {
        let range = self.range_of(pbn)?;
        self.blocks.lock()[range].copy_from_slice(data.as_bytes());
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use condense_block::Block;

    use crate::error::Status;
    use super::{MemoryStore, PhysicalStore as _};

    #[test]
    fn read_back_what_was_written() {
        let store = MemoryStore::new(4);
        let mut block = Block::zeroed();
        block.as_mut_bytes()[0] = 0xC4;

        store.write_block(3, &block).unwrap();
        let mut read = Block::zeroed();
        store.read_block(3, &mut read).unwrap();
        assert_eq!(read, block);

        assert_eq!(store.read_block(4, &mut read), Err(Status::OutOfRange));
    }

    #[test]
    fn injected_read_faults() {
        let store = MemoryStore::new(1);
        let mut block = Block::zeroed();
        store.set_read_fault(true);
        assert_eq!(store.read_block(0, &mut block), Err(Status::Io));
        store.set_read_fault(false);
        assert_eq!(store.read_block(0, &mut block), Ok(()));
    }
}
