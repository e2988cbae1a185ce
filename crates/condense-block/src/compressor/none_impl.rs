use super::{CompressionError, CompressionType, Compressor, DecompressionError};


/// The identity "compressor".
///
/// Never useful for real fragments (an uncompressed 4 KiB block can never
/// share a compressed block), but it gives tests and the compression-off
/// configuration a compressor to hold.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneCompressor;

impl Compressor for NoneCompressor {
    #[inline]
    fn compression_type(&self) -> CompressionType {
        CompressionType::None
    }

    fn encode_into(&self, source: &[u8], output: &mut [u8]) -> Result<usize, CompressionError> {
        let output = output
            .get_mut(..source.len())
            .ok_or_else(|| CompressionError::from_display("fragment larger than output"))?;
        output.copy_from_slice(source);
        Ok(source.len())
    }

    fn decode_into(&self, source: &[u8], output: &mut [u8]) -> Result<usize, DecompressionError> {
        let output = output
            .get_mut(..source.len())
            .ok_or_else(|| DecompressionError::from_display("fragment larger than output"))?;
        output.copy_from_slice(source);
        Ok(source.len())
    }
}
