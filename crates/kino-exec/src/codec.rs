//! Per-column element codecs applied by the save stage and undone by the
//! load stage.

use kino_common::{KinoError, Result};
use kino_storage::CompressionSpec;

const DEFAULT_ZSTD_LEVEL: i32 = 3;

fn zstd_level(spec: &CompressionSpec) -> Result<i32> {
    match spec.options.get("level") {
        None => Ok(DEFAULT_ZSTD_LEVEL),
        Some(raw) => raw.parse().map_err(|_| {
            KinoError::InvalidConfig(format!("invalid zstd level '{raw}'"))
        }),
    }
}

/// Compress one element per the column's codec.
pub fn compress_element(spec: &CompressionSpec, element: &[u8]) -> Result<Vec<u8>> {
    match spec.codec.as_str() {
        "" | "none" => Ok(element.to_vec()),
        "lz4" => lz4::block::compress(element, None, true)
            .map_err(|e| KinoError::Storage(format!("lz4 compression failed: {e}"))),
        "zstd" => zstd::stream::encode_all(element, zstd_level(spec)?)
            .map_err(|e| KinoError::Storage(format!("zstd compression failed: {e}"))),
        other => Err(KinoError::InvalidConfig(format!(
            "unknown compression codec '{other}'"
        ))),
    }
}

/// Undo a column codec on one stored element.
pub fn decompress_element(spec: &CompressionSpec, element: &[u8]) -> Result<Vec<u8>> {
    match spec.codec.as_str() {
        "" | "none" => Ok(element.to_vec()),
        "lz4" => lz4::block::decompress(element, None)
            .map_err(|e| KinoError::Storage(format!("lz4 decompression failed: {e}"))),
        "zstd" => zstd::stream::decode_all(element)
            .map_err(|e| KinoError::Storage(format!("zstd decompression failed: {e}"))),
        other => Err(KinoError::InvalidConfig(format!(
            "unknown compression codec '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn spec(codec: &str) -> CompressionSpec {
        CompressionSpec {
            codec: codec.to_string(),
            options: HashMap::new(),
        }
    }

    #[test]
    fn codecs_round_trip() {
        let payload: Vec<u8> = (0..255u8).cycle().take(4096).collect();
        for codec in ["none", "lz4", "zstd"] {
            let spec = spec(codec);
            let packed = compress_element(&spec, &payload).expect("compress");
            let unpacked = decompress_element(&spec, &packed).expect("decompress");
            assert_eq!(unpacked, payload, "codec {codec}");
        }
    }

    #[test]
    fn unknown_codec_rejected() {
        let err = compress_element(&spec("brotli"), b"x").unwrap_err();
        assert!(matches!(err, KinoError::InvalidConfig(_)));
    }
}
