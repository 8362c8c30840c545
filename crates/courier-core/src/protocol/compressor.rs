//! Cutoff-gated gzip compression of message payloads.

use crate::config::IpcConfig;
use crate::{CourierError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Compresses payloads whose size reaches a cutoff. A negative cutoff turns
/// compression off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compressor {
    cutoff_size: i64,
}

impl Compressor {
    pub fn new(cutoff_size: i64) -> Self {
        Self { cutoff_size }
    }

    pub fn off() -> Self {
        Self::new(IpcConfig::COMPRESS_CUTOFF_OFF)
    }

    pub fn cutoff_size(&self) -> i64 {
        self.cutoff_size
    }

    pub fn is_active(&self) -> bool {
        self.cutoff_size >= 0
    }

    pub fn needs_compression(&self, len: usize) -> bool {
        self.is_active() && i64::try_from(len).map_or(true, |len| len >= self.cutoff_size)
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder =
            GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
        encoder.write_all(data).map_err(compression_error)?;
        encoder.finish().map_err(compression_error)
    }

    /// Inflate `data`, refusing output larger than `expected_len`.
    pub fn decompress(data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(expected_len);
        let limit = u64::try_from(expected_len).unwrap_or(u64::MAX).saturating_add(1);
        GzDecoder::new(data)
            .take(limit)
            .read_to_end(&mut out)
            .map_err(compression_error)?;
        if out.len() != expected_len {
            return Err(CourierError::Compression {
                message: format!(
                    "decompressed size {} does not match declared size {}",
                    out.len(),
                    expected_len
                ),
            });
        }
        Ok(out)
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::off()
    }
}

fn compression_error(err: std::io::Error) -> CourierError {
    CourierError::Compression {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_off_never_compresses() {
        let compressor = Compressor::off();
        assert!(!compressor.is_active());
        assert!(!compressor.needs_compression(10_000_000));
    }

    #[test]
    fn test_cutoff_gate() {
        let compressor = Compressor::new(100);
        assert!(!compressor.needs_compression(99));
        assert!(compressor.needs_compression(100));

        let always = Compressor::new(0);
        assert!(always.needs_compression(0));
    }

    #[test]
    fn test_compress_shrinks_repetitive_payload() {
        let data = "abcdefgh".repeat(1_000);
        let compressed = Compressor::new(0).compress(data.as_bytes()).unwrap();
        assert!(compressed.len() < data.len() / 4);
        let restored = Compressor::decompress(&compressed, data.len()).unwrap();
        assert_eq!(restored, data.as_bytes());
    }

    #[test]
    fn test_decompress_rejects_size_mismatch() {
        let compressed = Compressor::new(0).compress(b"some payload").unwrap();
        assert!(Compressor::decompress(&compressed, 4).is_err());
        assert!(Compressor::decompress(b"not gzip", 8).is_err());
    }
}
