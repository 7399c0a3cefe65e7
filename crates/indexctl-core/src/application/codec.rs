//! Encoding of status documents for the durable store
//!
//! Documents above the configured threshold are gzip-compressed. Decoding
//! accepts both forms: raw bytes are used when they parse as JSON, anything
//! else is gunzipped first.

use crate::CoreError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::IgnoredAny;
use std::io::{Read, Write};
use tracing::debug;

/// Compresses large documents on write, detects compression on read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateCodec {
    compress_threshold: usize,
}

impl StateCodec {
    /// Compress documents strictly larger than `compress_threshold` bytes
    pub fn new(compress_threshold: usize) -> Self {
        Self { compress_threshold }
    }

    /// Prepare a serialized document for the store
    pub fn encode(&self, raw: &[u8]) -> Result<Vec<u8>, CoreError> {
        if raw.len() <= self.compress_threshold {
            return Ok(raw.to_vec());
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw)?;
        let compressed = encoder.finish()?;
        debug!(raw = raw.len(), compressed = compressed.len(), "Compressed status document");
        Ok(compressed)
    }

    /// Turn stored bytes back into the serialized document
    pub fn decode(stored: &[u8]) -> Result<Vec<u8>, CoreError> {
        if serde_json::from_slice::<IgnoredAny>(stored).is_ok() {
            return Ok(stored.to_vec());
        }

        let mut buf = Vec::new();
        GzDecoder::new(stored)
            .read_to_end(&mut buf)
            .map_err(|e| CoreError::RecoveryError(format!("status document unreadable: {}", e)))?;
        serde_json::from_slice::<IgnoredAny>(&buf).map_err(|e| {
            CoreError::RecoveryError(format!("decompressed status document unparsable: {}", e))
        })?;
        Ok(buf)
    }
}

impl Default for StateCodec {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}
