use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use karst_types::error::{KarstError, Result};
use karst_types::version::Version;

use crate::crypto::key::EncryptionParams;

/// Current repository storage format version.
pub const STORAGE_VERSION: Version = Version::new(1, 0, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    #[serde(rename = "GZIP")]
    Gzip,
    #[serde(rename = "LZ4")]
    Lz4,
    #[serde(rename = "ZSTD")]
    Zstd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionParams {
    pub algorithm: CompressionAlgorithm,
    pub level: i32,
}

impl Default for CompressionParams {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Lz4,
            level: 0,
        }
    }
}

/// Content-defined chunking parameters, constant per repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingParams {
    pub algorithm: String,
    pub min_size: u32,
    pub normal_size: u32,
    pub max_size: u32,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            algorithm: "FASTCDC".to_string(),
            min_size: 64 * 1024,
            normal_size: 1024 * 1024,
            max_size: 4 * 1024 * 1024,
        }
    }
}

/// Hashing parameters. For repositories without encryption the MAC key is
/// stored here in the clear; encrypted repositories derive it from the
/// passphrase instead and leave this empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashingParams {
    pub algorithm: String,
    pub bits: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key: Vec<u8>,
}

impl Default for HashingParams {
    fn default() -> Self {
        Self {
            algorithm: "BLAKE2B-KEYED".to_string(),
            bits: 256,
            key: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackfileParams {
    /// Soft maximum on the data section of one packfile, in bytes.
    pub max_size: u32,
}

impl Default for PackfileParams {
    fn default() -> Self {
        Self {
            max_size: 20 * 1024 * 1024,
        }
    }
}

/// Repository configuration, written once at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    pub version: Version,
    pub repository_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub compression: Option<CompressionParams>,
    pub encryption: Option<EncryptionParams>,
    pub chunking: ChunkingParams,
    pub hashing: HashingParams,
    pub packfile: PackfileParams,
}

impl Configuration {
    pub fn new() -> Self {
        Self {
            version: STORAGE_VERSION,
            repository_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            compression: Some(CompressionParams::default()),
            encryption: None,
            chunking: ChunkingParams::default(),
            hashing: HashingParams::default(),
            packfile: PackfileParams::default(),
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

/// Self-describing envelope formats for the stored configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Auto,
    Msgpack,
    Json,
    JsonGz,
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| KarstError::Malformed(format!("gzip envelope: {e}")))?;
    Ok(out)
}

impl Configuration {
    /// Serialize in the given envelope format. `Auto` means the preferred
    /// format, gzipped msgpack.
    pub fn to_bytes(&self, format: ConfigFormat) -> Result<Vec<u8>> {
        match format {
            ConfigFormat::Auto | ConfigFormat::Msgpack => gzip(&rmp_serde::to_vec(self)?),
            ConfigFormat::Json => Ok(serde_json::to_vec(self)
                .map_err(|e| KarstError::Config(format!("json encode: {e}")))?),
            ConfigFormat::JsonGz => gzip(
                &serde_json::to_vec(self)
                    .map_err(|e| KarstError::Config(format!("json encode: {e}")))?,
            ),
        }
    }

    /// Parse a stored configuration document. `Auto` tries msgpack, json, and
    /// gzipped json, in that order.
    pub fn from_bytes(buffer: &[u8], format: ConfigFormat) -> Result<Self> {
        match format {
            ConfigFormat::Auto => {
                for candidate in [
                    ConfigFormat::Msgpack,
                    ConfigFormat::Json,
                    ConfigFormat::JsonGz,
                ] {
                    if let Ok(config) = Self::from_bytes(buffer, candidate) {
                        return Ok(config);
                    }
                }
                Err(KarstError::Malformed(
                    "could not detect configuration format".into(),
                ))
            }
            ConfigFormat::Msgpack => {
                let raw = gunzip(buffer)?;
                Ok(rmp_serde::from_slice(&raw)?)
            }
            ConfigFormat::Json => serde_json::from_slice(buffer)
                .map_err(|e| KarstError::Malformed(format!("json config: {e}"))),
            ConfigFormat::JsonGz => {
                let raw = gunzip(buffer)?;
                serde_json::from_slice(&raw)
                    .map_err(|e| KarstError::Malformed(format!("json config: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip_each_format() {
        let config = Configuration::new();
        for format in [ConfigFormat::Msgpack, ConfigFormat::Json, ConfigFormat::JsonGz] {
            let bytes = config.to_bytes(format).unwrap();
            let back = Configuration::from_bytes(&bytes, format).unwrap();
            assert_eq!(back.repository_id, config.repository_id);
            assert_eq!(back.version, config.version);
        }
    }

    #[test]
    fn autodetect_accepts_all_formats() {
        let config = Configuration::new();
        for format in [ConfigFormat::Msgpack, ConfigFormat::Json, ConfigFormat::JsonGz] {
            let bytes = config.to_bytes(format).unwrap();
            let back = Configuration::from_bytes(&bytes, ConfigFormat::Auto).unwrap();
            assert_eq!(back.repository_id, config.repository_id);
        }
    }

    #[test]
    fn autodetect_rejects_garbage() {
        assert!(Configuration::from_bytes(b"not a config", ConfigFormat::Auto).is_err());
    }

    #[test]
    fn default_chunking_params_are_ordered() {
        let params = ChunkingParams::default();
        assert!(params.min_size < params.normal_size);
        assert!(params.normal_size < params.max_size);
    }
}
