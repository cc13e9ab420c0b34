use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use karst_types::error::Result;
use karst_types::mac::Mac;
use karst_types::version::Version;

use crate::vfs::Summary;

pub const HEADER_VERSION: Version = Version::new(1, 0, 0);

/// Where a source tree came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceImporter {
    #[serde(rename = "type")]
    pub importer_type: String,
    pub origin: String,
    pub directory: String,
}

/// The three index roots of one source's virtual filesystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VfsRoots {
    pub root: Mac,
    pub xattrs: Mac,
    pub errors: Mac,
}

/// An auxiliary index referenced from the header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    #[serde(rename = "type")]
    pub index_type: String,
    pub value: Mac,
}

/// One backed-up source tree inside a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub importer: SourceImporter,
    pub vfs: VfsRoots,
    #[serde(default)]
    pub indexes: Vec<Index>,
    #[serde(default)]
    pub summary: Summary,
}

/// Public half of the identity that signed a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderIdentity {
    pub identifier: Uuid,
    pub public_key: Vec<u8>,
}

/// Snapshot root record: everything needed to reach the snapshot's data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub identifier: Mac,
    pub version: Version,
    pub timestamp: DateTime<Utc>,
    /// Wall-clock duration of the backup, in nanoseconds.
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub identity: Option<HeaderIdentity>,
    pub sources: Vec<Source>,
}

impl Header {
    pub fn new(identifier: Mac) -> Self {
        Self {
            identifier,
            version: HEADER_VERSION,
            timestamp: Utc::now(),
            duration: 0,
            name: String::new(),
            tags: Vec::new(),
            identity: None,
            sources: vec![Source::default()],
        }
    }

    pub fn primary_source(&self) -> &Source {
        &self.sources[0]
    }

    pub fn primary_source_mut(&mut self) -> &mut Source {
        &mut self.sources[0]
    }

    /// First four identifier bytes, for logs.
    pub fn short_id(&self) -> String {
        self.identifier.to_hex()[..8].to_string()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_sources() {
        let mut header = Header::new(Mac([0x42; 32]));
        header.name = "etc @ host".to_string();
        header.tags = vec!["daily".to_string()];
        let source = header.primary_source_mut();
        source.importer.importer_type = "fs".to_string();
        source.importer.origin = "host".to_string();
        source.importer.directory = "/etc".to_string();
        source.vfs.root = Mac([1; 32]);
        source.indexes.push(Index {
            name: "content-type".to_string(),
            index_type: "btree".to_string(),
            value: Mac([2; 32]),
        });

        let bytes = header.to_bytes().unwrap();
        let back = Header::from_bytes(&bytes).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn serialization_is_deterministic() {
        let header = Header::new(Mac([0x42; 32]));
        assert_eq!(header.to_bytes().unwrap(), header.to_bytes().unwrap());
    }

    #[test]
    fn short_id_is_first_four_bytes() {
        let header = Header::new(Mac([0xAB; 32]));
        assert_eq!(header.short_id(), "abababab");
    }
}
