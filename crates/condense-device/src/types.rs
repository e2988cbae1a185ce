/// A logical block number, the address space exposed upstream.
pub type Lbn = u64;

/// A physical block number on the backing device.
pub type Pbn = u64;

/// The distinguished physical block meaning "no block".
///
/// Logical blocks mapped here read back as zeros; the block carries no
/// reference counts and is never allocated.
pub const ZERO_BLOCK: Pbn = 0;

/// Logical block numbers are 48 bits wide.
pub const MAX_LOGICAL_BLOCKS: u64 = 1 << 48;
