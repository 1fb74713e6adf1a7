//! Conditional LZ4 compression for data datagrams.
//!
//! Full-state pushes can run to tens of kilobytes; per-entity updates are a
//! few dozen bytes. Payloads at or above a size threshold are compressed with
//! LZ4, small ones are sent as-is, and a leading flag byte tells the receiver
//! which it got.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

/// Flag byte: payload follows uncompressed.
pub const FLAG_RAW: u8 = 0x00;

/// Flag byte: payload follows LZ4-compressed with a prepended size.
pub const FLAG_LZ4: u8 = 0x01;

/// Controls when data payloads are compressed.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Minimum payload size (bytes) before compression kicks in. Default: 512.
    pub threshold: usize,
    /// Master switch. Default: enabled.
    pub enabled: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 512,
            enabled: true,
        }
    }
}

/// Errors that can occur while unwrapping a received data payload.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// The payload was empty — no flag byte.
    #[error("empty payload — no compression flag")]
    EmptyPayload,
    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    DecompressFailed(String),
    /// The flag byte was neither [`FLAG_RAW`] nor [`FLAG_LZ4`].
    #[error("unknown compression flag: 0x{0:02X}")]
    UnknownFlag(u8),
}

/// Wrap serialized envelope bytes for transmission, compressing when the
/// payload is large enough to be worth it.
pub fn wrap_payload(data: &[u8], config: &CompressionConfig) -> Vec<u8> {
    if config.enabled && data.len() >= config.threshold {
        let compressed = compress_prepend_size(data);
        let mut out = Vec::with_capacity(1 + compressed.len());
        out.push(FLAG_LZ4);
        out.extend_from_slice(&compressed);
        out
    } else {
        let mut out = Vec::with_capacity(1 + data.len());
        out.push(FLAG_RAW);
        out.extend_from_slice(data);
        out
    }
}

/// Unwrap a received data payload back into serialized envelope bytes.
pub fn unwrap_payload(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    match data.first() {
        None => Err(CompressionError::EmptyPayload),
        Some(&FLAG_RAW) => Ok(data[1..].to_vec()),
        Some(&FLAG_LZ4) => decompress_size_prepended(&data[1..])
            .map_err(|e| CompressionError::DecompressFailed(e.to_string())),
        Some(&flag) => Err(CompressionError::UnknownFlag(flag)),
    }
}
