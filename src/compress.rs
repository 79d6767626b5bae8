//! zlib compression for session payloads
//!
//! Finalized raw audio bytes are stored zlib-compressed; recall inflates
//! them back. Both directions are lossless and handle empty input.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Compress raw audio bytes for storage.
pub fn deflate(raw: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw)?;
    encoder.finish()
}

/// Decompress a stored session payload.
pub fn inflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let raw = b"some pcm-ish bytes \x00\x01\x02 repeated repeated repeated";
        let compressed = deflate(raw).unwrap();
        assert_eq!(inflate(&compressed).unwrap(), raw);
    }

    #[test]
    fn test_roundtrip_empty() {
        let compressed = deflate(&[]).unwrap();
        assert!(inflate(&compressed).unwrap().is_empty());
    }

    #[test]
    fn test_roundtrip_large_repetitive() {
        let raw: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let compressed = deflate(&raw).unwrap();
        assert!(compressed.len() < raw.len());
        assert_eq!(inflate(&compressed).unwrap(), raw);
    }

    #[test]
    fn test_inflate_garbage_is_error() {
        assert!(inflate(b"definitely not zlib").is_err());
    }
}
