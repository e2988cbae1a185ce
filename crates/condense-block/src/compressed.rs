use thiserror::Error;

use crate::{
    block::{BLOCK_SIZE, Block},
    compressor::CompressionType,
    mapping_state::{MappingState, SlotNumber},
};


/// The most fragments one compressed block can hold.
pub const MAX_COMPRESSION_SLOTS: usize = 14;

const VERSION_LEN: usize = 2 * size_of::<u32>();
const SIZES_LEN:   usize = MAX_COMPRESSION_SLOTS * size_of::<u16>();

/// Header length of the original format: major/minor version plus the
/// fragment size table. Fragments are implicitly LZ4.
const HEADER_SIZE_V1: usize = VERSION_LEN + SIZES_LEN;
/// Header length of the current format, which appends a compression-type
/// byte to the v1 header.
const HEADER_SIZE_V2: usize = HEADER_SIZE_V1 + size_of::<u8>();

pub const COMPRESSED_BLOCK_DATA_SIZE_V1: usize = BLOCK_SIZE - HEADER_SIZE_V1;
pub const COMPRESSED_BLOCK_DATA_SIZE_V2: usize = BLOCK_SIZE - HEADER_SIZE_V2;

/// A compressed block is only written when at least two fragments fit in it,
/// so a fragment filling the entire data area is too big to be useful.
pub const MAX_COMPRESSED_FRAGMENT_SIZE: usize = COMPRESSED_BLOCK_DATA_SIZE_V2 - 1;


/// A fragment could not be located inside a compressed block: the slot is
/// not a compressed mapping state, the header version or compression type
/// is unknown, or the size table runs past the data area.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid compressed block fragment")]
pub struct FragmentError;


/// One physical block holding up to [`MAX_COMPRESSION_SLOTS`] compressed
/// fragments behind a little-endian header.
///
/// Two header versions exist on disk. Version 1.0 has no compression-type
/// byte and its fragments are implicitly LZ4; version 2.0 carries the type
/// explicitly. Only version 2.0 is ever written. The fragment for slot `i`
/// starts at the sum of the sizes of slots `0..i` within the data area.
#[derive(Debug, Clone)]
pub struct CompressedBlock(Block);

impl CompressedBlock {
    #[inline]
    #[must_use]
    pub fn zeroed() -> Self {
        Self(Block::zeroed())
    }

    #[inline]
    #[must_use]
    pub fn from_block(block: Block) -> Self {
        Self(block)
    }

    #[inline]
    #[must_use]
    pub fn as_block(&self) -> &Block {
        &self.0
    }

    #[inline]
    #[must_use]
    pub fn into_block(self) -> Block {
        self.0
    }

    /// The raw block, for reading a compressed block in from the store.
    #[inline]
    #[must_use]
    pub fn block_mut(&mut self) -> &mut Block {
        &mut self.0
    }

    /// The v2 data area.
    #[inline]
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.0.as_bytes()[HEADER_SIZE_V2..]
    }

    /// The writable v2 data area.
    ///
    /// Compressors write the first fragment directly at the start of this
    /// area, so that if the owning operation is later elected as the agent
    /// for a compressed write, its fragment is already in place.
    #[inline]
    #[must_use]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.0.as_mut_bytes()[HEADER_SIZE_V2..]
    }

    /// Write a fresh version 2.0 header around a first fragment which is
    /// already present in the data area.
    pub fn initialize(&mut self, first_fragment_size: u16, compression_type: CompressionType) {
        let bytes = self.0.as_mut_bytes();
        bytes[0..4].copy_from_slice(&2_u32.to_le_bytes());
        bytes[4..8].copy_from_slice(&0_u32.to_le_bytes());
        bytes[VERSION_LEN..HEADER_SIZE_V1].fill(0);
        Self::set_fragment_size(bytes, 0, first_fragment_size);
        bytes[HEADER_SIZE_V1] = compression_type.to_raw();
    }

    /// Copy `fragment` into the data area at `offset` and record its length
    /// in the size table for `slot`.
    ///
    /// Returns the offset just past the new fragment, which is where the
    /// next slot's fragment belongs. Returns `None` without writing anything
    /// if the fragment would run past the data area.
    pub fn pack_fragment(
        &mut self,
        slot:     SlotNumber,
        offset:   usize,
        fragment: &[u8],
    ) -> Option<usize> {
        let end = offset.checked_add(fragment.len())?;
        if end > COMPRESSED_BLOCK_DATA_SIZE_V2 || usize::from(slot) >= MAX_COMPRESSION_SLOTS {
            return None;
        }
        let size = u16::try_from(fragment.len()).ok()?;

        let bytes = self.0.as_mut_bytes();
        bytes[HEADER_SIZE_V2 + offset..HEADER_SIZE_V2 + end].copy_from_slice(fragment);
        Self::set_fragment_size(bytes, slot, size);
        Some(end)
    }

    /// Locate the fragment a compressed mapping state refers to.
    pub fn fragment(
        &self,
        state: MappingState,
    ) -> Result<(&[u8], CompressionType), FragmentError> {
        let slot = state.slot().ok_or(FragmentError)?;
        let bytes = self.0.as_bytes();

        let major = u32::from_le_bytes(bytes[0..4].try_into().expect("4-byte slice"));
        let minor = u32::from_le_bytes(bytes[4..8].try_into().expect("4-byte slice"));
        let (data_offset, data_size, compression_type) = match (major, minor) {
            (1, 0) => (HEADER_SIZE_V1, COMPRESSED_BLOCK_DATA_SIZE_V1, CompressionType::Lz4),
            (2, 0) => {
                let compression_type =
                    CompressionType::from_raw(bytes[HEADER_SIZE_V1]).ok_or(FragmentError)?;
                (HEADER_SIZE_V2, COMPRESSED_BLOCK_DATA_SIZE_V2, compression_type)
            }
            _ => return Err(FragmentError),
        };
        if compression_type == CompressionType::None {
            return Err(FragmentError);
        }

        let mut fragment_offset = 0_usize;
        for prior in 0..slot {
            fragment_offset += usize::from(Self::fragment_size(bytes, prior));
        }
        let fragment_size = usize::from(Self::fragment_size(bytes, slot));

        let end = fragment_offset
            .checked_add(fragment_size)
            .ok_or(FragmentError)?;
        if end > data_size {
            return Err(FragmentError);
        }

        let fragment = &bytes[data_offset + fragment_offset..data_offset + end];
        Ok((fragment, compression_type))
    }

    fn fragment_size(bytes: &[u8; BLOCK_SIZE], slot: SlotNumber) -> u16 {
        let at = VERSION_LEN + usize::from(slot) * size_of::<u16>();
        u16::from_le_bytes(bytes[at..at + 2].try_into().expect("2-byte slice"))
    }

    fn set_fragment_size(bytes: &mut [u8; BLOCK_SIZE], slot: SlotNumber, size: u16) {
        let at = VERSION_LEN + usize::from(slot) * size_of::<u16>();
        bytes[at..at + 2].copy_from_slice(&size.to_le_bytes());
    }
}

impl Default for CompressedBlock {
    #[inline]
    fn default() -> Self {
        Self::zeroed()
    }
}


#[cfg(test)]
mod tests {
    use crate::{compressor::CompressionType, mapping_state::MappingState};
    use super::{
        BLOCK_SIZE, COMPRESSED_BLOCK_DATA_SIZE_V1, COMPRESSED_BLOCK_DATA_SIZE_V2, CompressedBlock,
        FragmentError, HEADER_SIZE_V1, MAX_COMPRESSION_SLOTS,
    };

    fn state_for_slot(slot: usize) -> MappingState {
        MappingState::from_slot(u8::try_from(slot).unwrap()).unwrap()
    }

    /// Printable bytes cycling through the ASCII range, as recognizable
    /// fragment filler.
    fn original_data() -> Vec<u8> {
        (0..BLOCK_SIZE)
            .map(|i| b' ' + u8::try_from(i % usize::from(b'~' - b' ' + 1)).unwrap())
            .collect()
    }

    fn fragment_offsets(data_size: usize) -> [usize; MAX_COMPRESSION_SLOTS + 1] {
        [
            0,
            200, 400, 440, 960, 1130, 1131, 1131,
            1290, 2055, 3012, 3994, 3994, 4050,
            data_size,
        ]
    }

    #[test]
    fn empty_block_has_no_fragments() {
        let block = CompressedBlock::zeroed();
        assert_eq!(block.fragment(MappingState::Unmapped), Err(FragmentError));
        assert_eq!(block.fragment(MappingState::Uncompressed), Err(FragmentError));
        // An all-zero block decodes as version 0.0, which is not readable.
        assert_eq!(block.fragment(state_for_slot(0)), Err(FragmentError));
    }

    #[test]
    fn invalid_version_rejected() {
        let mut block = CompressedBlock::zeroed();
        block.0.as_mut_bytes()[0..4].copy_from_slice(&u32::MAX.to_le_bytes());

        for slot in 0..MAX_COMPRESSION_SLOTS {
            assert_eq!(block.fragment(state_for_slot(slot)), Err(FragmentError));
        }
    }

    #[test]
    fn uncompressed_type_rejected() {
        let mut block = CompressedBlock::zeroed();
        block.initialize(101, CompressionType::None);

        for slot in 0..MAX_COMPRESSION_SLOTS {
            assert_eq!(block.fragment(state_for_slot(slot)), Err(FragmentError));
        }
    }

    #[test]
    fn absurd_sizes_rejected() {
        let mut block = CompressedBlock::zeroed();
        block.initialize(101, CompressionType::Lz4);
        for slot in 1..MAX_COMPRESSION_SLOTS {
            let absurd = u16::try_from(BLOCK_SIZE + slot * 101).unwrap();
            let at = 8 + slot * 2;
            block.0.as_mut_bytes()[at..at + 2].copy_from_slice(&absurd.to_le_bytes());
        }

        // Slot 0 still fits in the data area; everything after runs past it.
        assert!(block.fragment(state_for_slot(0)).is_ok());
        for slot in 1..MAX_COMPRESSION_SLOTS {
            assert_eq!(block.fragment(state_for_slot(slot)), Err(FragmentError));
        }
    }

    #[test]
    fn valid_v1_fragments() {
        let original = original_data();
        let offsets = fragment_offsets(COMPRESSED_BLOCK_DATA_SIZE_V1);

        let mut block = CompressedBlock::zeroed();
        let bytes = block.0.as_mut_bytes();
        bytes[0..4].copy_from_slice(&1_u32.to_le_bytes());
        for slot in 0..MAX_COMPRESSION_SLOTS {
            let size = offsets[slot + 1] - offsets[slot];
            let at = 8 + slot * 2;
            bytes[at..at + 2]
                .copy_from_slice(&u16::try_from(size).unwrap().to_le_bytes());
            bytes[HEADER_SIZE_V1 + offsets[slot]..HEADER_SIZE_V1 + offsets[slot + 1]]
                .copy_from_slice(&original[offsets[slot]..offsets[slot + 1]]);
        }

        for slot in 0..MAX_COMPRESSION_SLOTS {
            let (fragment, compression_type) = block.fragment(state_for_slot(slot)).unwrap();
            assert_eq!(compression_type, CompressionType::Lz4);
            assert_eq!(fragment, &original[offsets[slot]..offsets[slot + 1]]);
        }
    }

    #[test]
    fn valid_v2_fragments() {
        let original = original_data();
        let offsets = fragment_offsets(COMPRESSED_BLOCK_DATA_SIZE_V2);

        let mut block = CompressedBlock::zeroed();
        // The compressor leaves the first fragment in place before the
        // header is written.
        block.data_mut()[..offsets[1]].copy_from_slice(&original[..offsets[1]]);
        block.initialize(u16::try_from(offsets[1]).unwrap(), CompressionType::Lz4);

        for slot in 1..MAX_COMPRESSION_SLOTS {
            let fragment = &original[offsets[slot]..offsets[slot + 1]];
            let next = block
                .pack_fragment(u8::try_from(slot).unwrap(), offsets[slot], fragment)
                .unwrap();
            assert_eq!(next, offsets[slot + 1]);
        }

        for slot in 0..MAX_COMPRESSION_SLOTS {
            let (fragment, compression_type) = block.fragment(state_for_slot(slot)).unwrap();
            assert_eq!(compression_type, CompressionType::Lz4);
            assert_eq!(fragment, &original[offsets[slot]..offsets[slot + 1]]);
        }
    }

    #[test]
    fn pack_fragment_rejects_overflow() {
        let mut block = CompressedBlock::zeroed();
        block.initialize(0, CompressionType::Lz4);

        let oversized = vec![0xAB; COMPRESSED_BLOCK_DATA_SIZE_V2 + 1];
        assert_eq!(block.pack_fragment(1, 0, &oversized), None);
        assert_eq!(block.pack_fragment(1, COMPRESSED_BLOCK_DATA_SIZE_V2, &[0xAB]), None);
    }
}
