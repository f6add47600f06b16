// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transparent zstd compression for cached response bodies.
//!
//! Bodies are compressed at rest and decompressed on read. Detection is by
//! the zstd magic header, so raw and compressed entries can coexist in the
//! same store and a config change never invalidates existing rows.

/// Zstd frame magic number (little-endian 0xFD2FB528)
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Bodies below this size are stored raw; the frame overhead isn't worth it.
pub const COMPRESSION_FLOOR_BYTES: usize = 64;

/// Dashboard payloads are repetitive JSON and shrink well even at the fast
/// end of the scale.
const ZSTD_LEVEL: i32 = 3;

/// Compress a response body for storage.
///
/// Already-compressed bodies and bodies under the floor pass through raw,
/// as does anything the codec cannot actually shrink.
pub fn maybe_compress(data: &[u8]) -> Vec<u8> {
    if is_zstd_compressed(data) || data.len() < COMPRESSION_FLOOR_BYTES {
        return data.to_vec();
    }
    match zstd::encode_all(data, ZSTD_LEVEL) {
        Ok(compressed) if compressed.len() < data.len() => compressed,
        _ => data.to_vec(),
    }
}

/// Restore a stored body, decoding only when the frame header is present.
/// Raw rows pass through untouched.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    if is_zstd_compressed(data) {
        zstd::decode_all(data)
    } else {
        Ok(data.to_vec())
    }
}

/// True when the body starts with a zstd frame header.
pub fn is_zstd_compressed(data: &[u8]) -> bool {
    data.starts_with(&ZSTD_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maybe_compress_small_body() {
        let small = b"{\"ok\":true}";
        let result = maybe_compress(small);
        // Under the floor: stored raw
        assert_eq!(result, small.to_vec());
    }

    #[test]
    fn test_maybe_compress_already_zstd() {
        // Fake zstd header + some data
        let mut fake_zstd = ZSTD_MAGIC.to_vec();
        fake_zstd.extend_from_slice(b"already compressed data");

        let result = maybe_compress(&fake_zstd);
        // Should pass through unchanged
        assert_eq!(result, fake_zstd);
    }

    #[test]
    fn test_maybe_compress_json_roundtrip() {
        // A typical list response compresses well
        let json = r#"{"results":[{"id":1,"status":"active","priority":"high"},{"id":2,"status":"active","priority":"high"},{"id":3,"status":"active","priority":"high"}],"count":3}"#;
        let compressed = maybe_compress(json.as_bytes());
        assert!(compressed.len() < json.len());
        assert!(is_zstd_compressed(&compressed));

        let restored = maybe_decompress(&compressed).unwrap();
        assert_eq!(restored, json.as_bytes());
    }

    #[test]
    fn test_maybe_decompress_raw_passthrough() {
        let raw = b"plain body, never compressed";
        let result = maybe_decompress(raw).unwrap();
        assert_eq!(result, raw.to_vec());
    }

    #[test]
    fn test_incompressible_stays_raw() {
        // Pseudo-random bytes do not shrink under zstd
        let mut noise = Vec::with_capacity(512);
        let mut x: u32 = 0x12345678;
        for _ in 0..512 {
            x = x.wrapping_mul(1664525).wrapping_add(1013904223);
            noise.push((x >> 24) as u8);
        }
        let result = maybe_compress(&noise);
        assert_eq!(result, noise);
    }
}
