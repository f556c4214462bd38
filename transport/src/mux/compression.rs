use std::io::{Read, Write};

use anyhow::bail;
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::trace;

/// Returns the gzip compressed form of `data` if `data` is longer than `threshold` and the
///  compressed form is strictly shorter. Otherwise the payload is sent verbatim.
pub fn compress_if_smaller(data: &[u8], threshold: usize) -> Option<Bytes> {
    if data.len() <= threshold {
        return None;
    }

    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    if encoder.write_all(data).is_err() {
        return None;
    }
    let compressed = encoder.finish().ok()?;

    if compressed.len() < data.len() {
        trace!("compressed DATA payload from {} to {} bytes", data.len(), compressed.len());
        Some(Bytes::from(compressed))
    }
    else {
        None
    }
}

/// Fails for corrupt input and for payloads that decompress to more than `max_len` bytes.
pub fn decompress(data: &[u8], max_len: usize) -> anyhow::Result<Bytes> {
    let limit = (max_len as u64).saturating_add(1);
    let mut decoder = GzDecoder::new(data).take(limit);

    let mut decompressed = Vec::new();
    if let Err(e) = decoder.read_to_end(&mut decompressed) {
        bail!("decompress data failed: {}", e);
    }
    if decompressed.len() > max_len {
        bail!("decompressed data exceeds {} bytes", max_len);
    }
    Ok(Bytes::from(decompressed))
}
