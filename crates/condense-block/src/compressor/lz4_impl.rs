use lz4_flex::block::{compress_into, decompress_into};

use super::{CompressionError, CompressionType, Compressor, DecompressionError};


/// LZ4 block-format compression, the format every compressed block written
/// by the device uses.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    #[inline]
    fn compression_type(&self) -> CompressionType {
        CompressionType::Lz4
    }

    fn encode_into(&self, source: &[u8], output: &mut [u8]) -> Result<usize, CompressionError> {
        // `compress_into` fails exactly when `output` is too small for the
        // compressed stream, which callers map to "incompressible".
        compress_into(source, output).map_err(CompressionError::from_display)
    }

    fn decode_into(&self, source: &[u8], output: &mut [u8]) -> Result<usize, DecompressionError> {
        decompress_into(source, output).map_err(DecompressionError::from_display)
    }
}
