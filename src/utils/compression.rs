//! DEFLATE (zlib-wrapped) compression for bundle payloads.
//!
//! Decompression is bounded: output beyond the caller's limit is treated as a
//! decompression bomb and rejected before it is fully materialized.

use crate::error::{ProtocolError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Compress `data` at `level` (0-9) into `out`, which is cleared first.
///
/// # Errors
/// Returns `ProtocolError::CompressionFailure` if the encoder fails
pub fn compress_into(data: &[u8], level: u32, out: &mut Vec<u8>) -> Result<()> {
    out.clear();
    let mut encoder = ZlibEncoder::new(out, Compression::new(level.min(9)));
    encoder
        .write_all(data)
        .map_err(|_| ProtocolError::CompressionFailure)?;
    encoder
        .finish()
        .map_err(|_| ProtocolError::CompressionFailure)?;
    Ok(())
}

/// Compress `data` into a fresh buffer.
pub fn compress(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2 + 16);
    compress_into(data, level, &mut out)?;
    Ok(out)
}

/// Decompress `data`, refusing to produce more than `max_output` bytes.
///
/// # Errors
/// Returns `ProtocolError::DecompressionFailure` if:
/// - the stream is corrupt or truncated
/// - output size exceeds `max_output`
pub fn decompress(data: &[u8], max_output: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    // One byte past the limit is enough to detect an overrun.
    let mut reader = ZlibDecoder::new(data).take(max_output as u64 + 1);
    reader
        .read_to_end(&mut out)
        .map_err(|_| ProtocolError::DecompressionFailure)?;

    if out.len() > max_output {
        return Err(ProtocolError::DecompressionFailure);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_deflate_roundtrip() {
        let original = b"Hello, World! This is a test of DEFLATE compression.";
        let compressed = compress(original, 6).unwrap();
        let decompressed = decompress(&compressed, 1024).unwrap();
        assert_eq!(original.as_slice(), decompressed.as_slice());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_empty_input_roundtrip() {
        let compressed = compress(&[], 6).unwrap();
        assert!(!compressed.is_empty());
        assert!(decompress(&compressed, 0).unwrap().is_empty());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_bomb_rejected() {
        // 1 MiB of zeros compresses to about a kilobyte
        let compressed = compress(&vec![0u8; 1 << 20], 9).unwrap();
        assert!(compressed.len() < 8 * 1024);
        let result = decompress(&compressed, 4096);
        assert!(matches!(result, Err(ProtocolError::DecompressionFailure)));
    }

    #[test]
    fn test_malformed_compressed_data() {
        let malformed = vec![0x78, 0x9c, 0xff, 0xff, 0xff, 0x00];
        let result = decompress(&malformed, 1024);
        assert!(result.is_err(), "Should reject malformed compressed data");
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_compress_into_reuses_buffer() {
        let mut out = vec![9u8; 32];
        compress_into(b"abcabcabc", 1, &mut out).unwrap();
        assert_eq!(decompress(&out, 64).unwrap(), b"abcabcabc");
    }
}
