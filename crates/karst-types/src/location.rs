use serde::{Deserialize, Serialize};

use crate::error::{KarstError, Result};
use crate::kind::BlobKind;
use crate::mac::Mac;

/// Where a blob lives: the packfile that holds it and the byte range of its
/// encoded payload inside that packfile's data section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub packfile: Mac,
    pub offset: u32,
    pub length: u32,
}

/// One delta-state mapping: `(kind, blob) -> location`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaEntry {
    pub kind: BlobKind,
    pub blob: Mac,
    pub location: Location,
}

// Always keep these in sync with the serialized on-disk format. The structs
// may carry padding in memory, so size_of is not authoritative.
pub const LOCATION_SERIALIZED_SIZE: usize = 32 + 4 + 4;
pub const DELTA_ENTRY_SERIALIZED_SIZE: usize = 1 + 32 + LOCATION_SERIALIZED_SIZE;

impl Location {
    pub fn to_bytes(&self) -> [u8; LOCATION_SERIALIZED_SIZE] {
        let mut buf = [0u8; LOCATION_SERIALIZED_SIZE];
        buf[0..32].copy_from_slice(self.packfile.as_bytes());
        buf[32..36].copy_from_slice(&self.offset.to_le_bytes());
        buf[36..40].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < LOCATION_SERIALIZED_SIZE {
            return Err(KarstError::Malformed(format!(
                "short read while decoding location: {} bytes",
                buf.len()
            )));
        }
        let mut packfile = [0u8; 32];
        packfile.copy_from_slice(&buf[0..32]);
        Ok(Self {
            packfile: Mac(packfile),
            offset: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            length: u32::from_le_bytes(buf[36..40].try_into().unwrap()),
        })
    }
}

impl DeltaEntry {
    pub fn to_bytes(&self) -> [u8; DELTA_ENTRY_SERIALIZED_SIZE] {
        let mut buf = [0u8; DELTA_ENTRY_SERIALIZED_SIZE];
        buf[0] = self.kind.as_u8();
        buf[1..33].copy_from_slice(self.blob.as_bytes());
        buf[33..].copy_from_slice(&self.location.to_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < DELTA_ENTRY_SERIALIZED_SIZE {
            return Err(KarstError::Malformed(format!(
                "short read while decoding delta entry: {} bytes",
                buf.len()
            )));
        }
        let kind = BlobKind::from_u8(buf[0])?;
        let mut blob = [0u8; 32];
        blob.copy_from_slice(&buf[1..33]);
        Ok(Self {
            kind,
            blob: Mac(blob),
            location: Location::from_bytes(&buf[33..])?,
        })
    }
}
