use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use karst_types::error::{KarstError, Result};

use crate::config::{CompressionAlgorithm, CompressionParams};

const TAG_NONE: u8 = 0x00;
const TAG_GZIP: u8 = 0x01;
const TAG_LZ4: u8 = 0x02;
const TAG_ZSTD: u8 = 0x03;

/// Maximum decompressed output size (64 MiB).
/// Prevents decompression bombs from consuming unbounded memory.
const MAX_DECOMPRESS_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip {
        level: u32,
    },
    Lz4,
    Zstd {
        level: i32,
    },
}

impl Compression {
    pub fn from_params(params: Option<&CompressionParams>) -> Self {
        match params {
            None => Compression::None,
            Some(p) => match p.algorithm {
                CompressionAlgorithm::Gzip => Compression::Gzip {
                    level: p.level.clamp(0, 9) as u32,
                },
                CompressionAlgorithm::Lz4 => Compression::Lz4,
                CompressionAlgorithm::Zstd => Compression::Zstd { level: p.level },
            },
        }
    }
}

/// Compress data and prepend a 1-byte tag identifying the codec.
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::None => {
            let mut out = Vec::with_capacity(1 + data.len());
            out.push(TAG_NONE);
            out.extend_from_slice(data);
            Ok(out)
        }
        Compression::Gzip { level } => {
            let mut encoder = flate2::write::GzEncoder::new(
                vec![TAG_GZIP],
                flate2::Compression::new(level),
            );
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        Compression::Lz4 => {
            let compressed = lz4_flex::compress_prepend_size(data);
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(TAG_LZ4);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
        Compression::Zstd { level } => {
            let compressed = zstd::bulk::compress(data, level)
                .map_err(|e| KarstError::Other(format!("zstd compress: {e}")))?;
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(TAG_ZSTD);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
    }
}

/// Decompress data by reading the 1-byte tag prefix and dispatching.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Err(KarstError::Decompression("empty buffer".into()));
    }
    let tag = data[0];
    let payload = &data[1..];
    match tag {
        TAG_NONE => Ok(payload.to_vec()),
        TAG_GZIP => {
            let mut decoder = flate2::read::GzDecoder::new(payload);
            let mut output = Vec::new();
            decoder
                .by_ref()
                .take(MAX_DECOMPRESS_SIZE + 1)
                .read_to_end(&mut output)
                .map_err(|e| KarstError::Decompression(format!("gzip: {e}")))?;
            check_decompressed_size(output.len())?;
            Ok(output)
        }
        TAG_LZ4 => {
            if payload.len() < 4 {
                return Err(KarstError::Decompression("lz4: payload too short".into()));
            }
            let uncompressed_size = u32::from_le_bytes(payload[..4].try_into().unwrap()) as u64;
            if uncompressed_size > MAX_DECOMPRESS_SIZE {
                return Err(KarstError::Decompression(format!(
                    "lz4: decompressed size ({uncompressed_size}) exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| KarstError::Decompression(format!("lz4: {e}")))
        }
        TAG_ZSTD => {
            let mut decoder = zstd::stream::Decoder::new(std::io::Cursor::new(payload))
                .map_err(|e| KarstError::Decompression(format!("zstd init: {e}")))?;
            let mut output = Vec::new();
            decoder
                .by_ref()
                .take(MAX_DECOMPRESS_SIZE + 1)
                .read_to_end(&mut output)
                .map_err(|e| KarstError::Decompression(format!("zstd: {e}")))?;
            check_decompressed_size(output.len())?;
            Ok(output)
        }
        _ => Err(KarstError::UnknownCompressionTag(tag)),
    }
}

fn check_decompressed_size(len: usize) -> Result<()> {
    if len as u64 > MAX_DECOMPRESS_SIZE {
        return Err(KarstError::Decompression(format!(
            "decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_codecs() {
        let payloads: &[&[u8]] = &[b"", b"short", b"a longer payload that should compress fine"];
        let codecs = [
            Compression::None,
            Compression::Gzip { level: 6 },
            Compression::Lz4,
            Compression::Zstd { level: 3 },
        ];
        for codec in codecs {
            for payload in payloads {
                let encoded = compress(codec, payload).unwrap();
                assert_eq!(decompress(&encoded).unwrap(), *payload);
            }
        }
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(matches!(
            decompress(&[0x7F, 1, 2, 3]),
            Err(KarstError::UnknownCompressionTag(0x7F))
        ));
    }

    #[test]
    fn rejects_empty_buffer() {
        assert!(decompress(&[]).is_err());
    }

    #[test]
    fn rejects_lz4_bomb() {
        // Huge size prefix (1 GiB) but tiny compressed data.
        let mut data = vec![TAG_LZ4];
        data.extend_from_slice(&(1u32 << 30).to_le_bytes());
        data.extend_from_slice(&[0u8; 10]);
        assert!(decompress(&data).is_err());
    }

    #[test]
    fn rejects_lz4_short_payload() {
        assert!(decompress(&[TAG_LZ4, 0x00, 0x00]).is_err());
    }
}
