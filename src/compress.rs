//! Gzip response coding.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Gzips `data`, returning `None` unless the result is strictly smaller
/// than the input (an incompressible payload is sent as-is, without a
/// `Content-Encoding` header).
pub(crate) fn gzip_if_smaller(data: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len()), Compression::default());
    encoder.write_all(data).ok()?;
    let compressed = encoder.finish().ok()?;
    if compressed.len() < data.len() {
        Some(compressed)
    } else {
        None
    }
}

pub(crate) fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_compressible_payloads() {
        let data = b"hello hello hello hello hello hello hello hello".repeat(16);
        let compressed = gzip_if_smaller(&data).expect("repetitive data should shrink");
        assert!(compressed.len() < data.len());
        assert_eq!(gunzip(&compressed).unwrap(), data);
    }

    #[test]
    fn refuses_to_grow_incompressible_payloads() {
        // Tiny payloads always lose to the gzip header overhead.
        assert_eq!(gzip_if_smaller(b"ok"), None);
    }

    #[test]
    fn empty_payload_stays_identity() {
        assert_eq!(gzip_if_smaller(b""), None);
    }
}
