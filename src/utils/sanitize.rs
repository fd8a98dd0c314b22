//! Lossy decoding of fetched bytes.
//!
//! Crawled pages arrive as raw bytes in whatever encoding the server chose.
//! Documents only hold UTF-8 text, so every invalid sequence is replaced with
//! `?` and the dropped bytes are logged for later inspection.

use crate::config::REPLACEMENT_CHAR;

/// Decodes `bytes` as UTF-8, replacing each invalid sequence with `?`.
///
/// `field` names the document field being decoded and only appears in the
/// log line emitted when something had to be replaced.
pub fn decode_lossy(bytes: &[u8], field: &str) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut dropped: Vec<u8> = Vec::new();

    for chunk in bytes.utf8_chunks() {
        out.push_str(chunk.valid());
        let invalid = chunk.invalid();
        if !invalid.is_empty() {
            out.push(REPLACEMENT_CHAR);
            dropped.extend_from_slice(invalid);
        }
    }

    if !dropped.is_empty() {
        log::warn!(
            "{field}: replaced invalid UTF-8 bytes 0x{}",
            hex::encode(&dropped)
        );
    }
    out
}
