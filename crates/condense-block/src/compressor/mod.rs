mod lz4_impl;
mod none_impl;

use std::fmt::{Debug, Display};

use thiserror::Error;


pub use self::{lz4_impl::Lz4Compressor, none_impl::NoneCompressor};


/// The compression type recorded in a compressed block's header.
///
/// Values other than the ones below are reserved; blocks carrying them are
/// unreadable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Lz4,
}

impl CompressionType {
    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Lz4  => 1,
        }
    }

    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            _ => None,
        }
    }
}


/// Compress or decompress single fragments.
///
/// Implementations must be deterministic: the same input always produces the
/// same fragment, since deduplication happens upstream of compression.
pub trait Compressor: Debug + Send + Sync {
    /// The type recorded in the headers of blocks this compressor fills.
    fn compression_type(&self) -> CompressionType;

    /// Write the result of compressing `source` into `output`, returning the
    /// fragment length.
    ///
    /// An error means the fragment would not fit in `output`; callers treat
    /// the source as incompressible rather than failing.
    fn encode_into(&self, source: &[u8], output: &mut [u8]) -> Result<usize, CompressionError>;

    /// Write the result of decompressing `source` into `output`, returning
    /// the decoded length.
    fn decode_into(&self, source: &[u8], output: &mut [u8]) -> Result<usize, DecompressionError>;
}


#[derive(Error, Debug, Clone)]
#[error("error while compressing fragment: {error_msg}")]
pub struct CompressionError {
    error_msg: String,
}

impl CompressionError {
    #[must_use]
    pub fn from_display<E: Display>(err: E) -> Self {
        Self {
            error_msg: err.to_string(),
        }
    }
}

#[derive(Error, Debug, Clone)]
#[error("error while decompressing fragment: {error_msg}")]
pub struct DecompressionError {
    error_msg: String,
}

impl DecompressionError {
    #[must_use]
    pub fn from_display<E: Display>(err: E) -> Self {
        Self {
            error_msg: err.to_string(),
        }
    }
}
