//! Page codec: JSON compressed with zlib.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_json::{Map, Value as Json};

use crate::error_handling::Error;

/// Serializes `record` and deflates it into a zlib stream.
pub fn encode_page(record: &Map<String, Json>) -> Result<Vec<u8>, Error> {
    let json = serde_json::to_vec(record)?;
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Inflates a stored page and parses the JSON inside.
pub fn decode_page(page: &[u8]) -> Result<Json, Error> {
    let mut json = Vec::new();
    ZlibDecoder::new(page).read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}
