//! The on-disk block formats of the condense device: the 4 KiB data block,
//! the compressed block which packs several compressed fragments into one
//! physical block, the mapping-state encoding which addresses a fragment
//! within such a block, and the 16-byte record names used to identify block
//! contents in the deduplication index.

mod block;
mod compressed;
pub mod compressor;
mod mapping_state;
mod record_name;


pub use self::{
    block::{BLOCK_SIZE, Block, SECTOR_SIZE},
    compressed::{
        COMPRESSED_BLOCK_DATA_SIZE_V1, COMPRESSED_BLOCK_DATA_SIZE_V2, CompressedBlock,
        FragmentError, MAX_COMPRESSED_FRAGMENT_SIZE, MAX_COMPRESSION_SLOTS,
    },
    compressor::{CompressionType, Compressor, Lz4Compressor, NoneCompressor},
    mapping_state::{MappingState, SlotNumber},
    record_name::RecordName,
};
