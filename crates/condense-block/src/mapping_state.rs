use crate::compressed::MAX_COMPRESSION_SLOTS;


/// The index of a fragment within a compressed block.
pub type SlotNumber = u8;

const COMPRESSED_BASE: u8 = 2;

/// How a logical block is represented at its mapped physical block.
///
/// The encoding is stable and stored both in the block map and in the
/// 16-byte metadata exchanged with the deduplication index: `0` is unmapped,
/// `1` is a whole uncompressed block, and `2 + slot` addresses one fragment
/// of a compressed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingState {
    Unmapped,
    Uncompressed,
    Compressed(SlotNumber),
}

impl MappingState {
    #[must_use]
    pub fn from_slot(slot: SlotNumber) -> Option<Self> {
        if usize::from(slot) < MAX_COMPRESSION_SLOTS {
            Some(Self::Compressed(slot))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub fn is_compressed(self) -> bool {
        matches!(self, Self::Compressed(_))
    }

    /// The slot this state addresses, for compressed states only.
    #[inline]
    #[must_use]
    pub fn slot(self) -> Option<SlotNumber> {
        match self {
            Self::Compressed(slot) => Some(slot),
            Self::Unmapped | Self::Uncompressed => None,
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Unmapped           => 0,
            Self::Uncompressed       => 1,
            Self::Compressed(slot)   => COMPRESSED_BASE + slot,
        }
    }

    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Unmapped),
            1 => Some(Self::Uncompressed),
            raw => Self::from_slot(raw - COMPRESSED_BASE),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{MAX_COMPRESSION_SLOTS, MappingState};

    #[test]
    fn raw_round_trip() {
        for raw in 0..=u8::MAX {
            let Some(state) = MappingState::from_raw(raw) else {
                assert!(usize::from(raw) >= 2 + MAX_COMPRESSION_SLOTS);
                continue;
            };
            assert_eq!(state.to_raw(), raw);
        }
    }

    #[test]
    fn slot_bounds() {
        assert_eq!(MappingState::from_slot(0), Some(MappingState::Compressed(0)));
        assert_eq!(MappingState::from_slot(13), Some(MappingState::Compressed(13)));
        assert_eq!(MappingState::from_slot(14), None);
    }
}
