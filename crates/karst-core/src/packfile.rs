use std::collections::HashSet;

use chrono::Utc;

use karst_types::error::{KarstError, Result};
use karst_types::kind::BlobKind;
use karst_types::mac::Mac;
use karst_types::version::Version;

use crate::codec::BlobCodec;

/// Version of the packfile container format, stored in the version trailer.
pub const FORMAT_VERSION: u32 = 1;

/// Version of the packfile metadata structures (index entries and footer).
pub const METADATA_VERSION: Version = Version::new(1, 0, 0);

/// Byte length of the fixed tail: `[u32 LE format version][u8 footer length]`.
pub const TRAILER_SIZE: usize = 5;

/// One entry in the packfile index, describing a single encoded blob in the
/// data section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub mac: Mac,
    pub kind: BlobKind,
    pub version: Version,
    pub offset: u32,
    pub length: u32,
    pub flags: u32,
}

pub const INDEX_ENTRY_SERIALIZED_SIZE: usize = 32 + 1 + Version::SERIALIZED_SIZE + 4 + 4 + 4;

impl IndexEntry {
    pub fn to_bytes(&self) -> [u8; INDEX_ENTRY_SERIALIZED_SIZE] {
        let mut buf = [0u8; INDEX_ENTRY_SERIALIZED_SIZE];
        buf[0..32].copy_from_slice(self.mac.as_bytes());
        buf[32] = self.kind.as_u8();
        buf[33..39].copy_from_slice(&self.version.to_bytes());
        buf[39..43].copy_from_slice(&self.offset.to_le_bytes());
        buf[43..47].copy_from_slice(&self.length.to_le_bytes());
        buf[47..51].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < INDEX_ENTRY_SERIALIZED_SIZE {
            return Err(KarstError::Malformed(format!(
                "short read while decoding packfile index entry: {} bytes",
                buf.len()
            )));
        }
        let mut mac = [0u8; 32];
        mac.copy_from_slice(&buf[0..32]);
        Ok(Self {
            mac: Mac(mac),
            kind: BlobKind::from_u8(buf[32])?,
            version: Version::from_bytes(&buf[33..39])?,
            offset: u32::from_le_bytes(buf[39..43].try_into().unwrap()),
            length: u32::from_le_bytes(buf[43..47].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[47..51].try_into().unwrap()),
        })
    }
}

/// Self-describing packfile footer, codec-encoded at the tail of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub version: Version,
    /// Creation time, nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub count: u32,
    /// Byte position in the file where the encoded index begins.
    pub index_offset: u32,
    /// MAC of the decoded index bytes.
    pub index_mac: Mac,
    pub flags: u32,
}

pub const FOOTER_SERIALIZED_SIZE: usize = Version::SERIALIZED_SIZE + 8 + 4 + 4 + 32 + 4;

impl Footer {
    pub fn to_bytes(&self) -> [u8; FOOTER_SERIALIZED_SIZE] {
        let mut buf = [0u8; FOOTER_SERIALIZED_SIZE];
        buf[0..6].copy_from_slice(&self.version.to_bytes());
        buf[6..14].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[14..18].copy_from_slice(&self.count.to_le_bytes());
        buf[18..22].copy_from_slice(&self.index_offset.to_le_bytes());
        buf[22..54].copy_from_slice(self.index_mac.as_bytes());
        buf[54..58].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < FOOTER_SERIALIZED_SIZE {
            return Err(KarstError::Malformed(format!(
                "short read while decoding packfile footer: {} bytes",
                buf.len()
            )));
        }
        let mut index_mac = [0u8; 32];
        index_mac.copy_from_slice(&buf[22..54]);
        Ok(Self {
            version: Version::from_bytes(&buf[0..6])?,
            timestamp: i64::from_le_bytes(buf[6..14].try_into().unwrap()),
            count: u32::from_le_bytes(buf[14..18].try_into().unwrap()),
            index_offset: u32::from_le_bytes(buf[18..22].try_into().unwrap()),
            index_mac: Mac(index_mac),
            flags: u32::from_le_bytes(buf[54..58].try_into().unwrap()),
        })
    }
}

/// A sealed packfile ready to be written to storage.
pub struct SealedPackfile {
    pub mac: Mac,
    pub bytes: Vec<u8>,
    pub index: Vec<IndexEntry>,
}

/// Accumulates encoded blobs and assembles the immutable container.
pub struct PackfileWriter {
    data: Vec<u8>,
    index: Vec<IndexEntry>,
    seen: HashSet<(u8, Mac)>,
}

impl PackfileWriter {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            index: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Append an encoded blob to the data section. Returns `false` when the
    /// same `(kind, mac)` was already added to this packfile.
    pub fn add_blob(&mut self, kind: BlobKind, mac: Mac, encoded: &[u8]) -> bool {
        if !self.seen.insert((kind.as_u8(), mac)) {
            return false;
        }
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(encoded);
        self.index.push(IndexEntry {
            mac,
            kind,
            version: METADATA_VERSION,
            offset,
            length: encoded.len() as u32,
            flags: 0,
        });
        true
    }

    /// Current size of the data section in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn blob_count(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Assemble the container: data, encoded index, encoded footer, and the
    /// 5-byte trailer. The returned MAC covers the full serialized file.
    pub fn seal(self, codec: &BlobCodec, mac_key: &[u8; 32]) -> Result<SealedPackfile> {
        if self.index.is_empty() {
            return Err(KarstError::InvalidArgument(
                "cannot seal an empty packfile".into(),
            ));
        }

        let mut index_bytes = Vec::with_capacity(self.index.len() * INDEX_ENTRY_SERIALIZED_SIZE);
        for entry in &self.index {
            index_bytes.extend_from_slice(&entry.to_bytes());
        }
        let index_mac = Mac::compute(mac_key, &index_bytes);
        let encoded_index = codec.encode(&index_bytes)?;

        let footer = Footer {
            version: METADATA_VERSION,
            timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            count: self.index.len() as u32,
            index_offset: self.data.len() as u32,
            index_mac,
            flags: 0,
        };
        let encoded_footer = codec.encode(&footer.to_bytes())?;
        if encoded_footer.len() > u8::MAX as usize {
            return Err(KarstError::Malformed(format!(
                "encoded footer too large: {} bytes",
                encoded_footer.len()
            )));
        }

        let mut bytes = self.data;
        bytes.reserve(encoded_index.len() + encoded_footer.len() + TRAILER_SIZE);
        bytes.extend_from_slice(&encoded_index);
        bytes.extend_from_slice(&encoded_footer);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.push(encoded_footer.len() as u8);

        let mac = Mac::compute(mac_key, &bytes);
        Ok(SealedPackfile {
            mac,
            bytes,
            index: self.index,
        })
    }
}

impl Default for PackfileWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// A parsed packfile: index and footer, decoded and verified.
#[derive(Debug, Clone)]
pub struct Packfile {
    pub footer: Footer,
    pub index: Vec<IndexEntry>,
}

impl Packfile {
    /// Parse a full packfile from its serialized bytes.
    ///
    /// Walks from the tail: trailer, encoded footer, encoded index. The
    /// decoded index is verified against `footer.index_mac`.
    pub fn from_bytes(raw: &[u8], codec: &BlobCodec, mac_key: &[u8; 32]) -> Result<Self> {
        if raw.len() < TRAILER_SIZE {
            return Err(KarstError::Malformed(format!(
                "packfile too small for trailer: {} bytes",
                raw.len()
            )));
        }

        let trailer = &raw[raw.len() - TRAILER_SIZE..];
        let format_version = u32::from_le_bytes(trailer[0..4].try_into().unwrap());
        if format_version != FORMAT_VERSION {
            return Err(KarstError::UnsupportedVersion(format!(
                "packfile format {format_version}"
            )));
        }
        let footer_len = trailer[4] as usize;

        let body = &raw[..raw.len() - TRAILER_SIZE];
        if body.len() < footer_len {
            return Err(KarstError::Malformed(
                "packfile footer length trailer exceeds file size".into(),
            ));
        }
        let encoded_footer = &body[body.len() - footer_len..];
        let footer_bytes = codec.decode(encoded_footer).map_err(|e| match e {
            KarstError::AuthFailure => KarstError::Malformed("packfile footer decode".into()),
            other => other,
        })?;
        let footer = Footer::from_bytes(&footer_bytes)?;

        let data_and_index = &body[..body.len() - footer_len];
        let index_offset = footer.index_offset as usize;
        if index_offset > data_and_index.len() {
            return Err(KarstError::Malformed(
                "packfile index offset exceeds file size".into(),
            ));
        }
        let encoded_index = &data_and_index[index_offset..];
        let index_bytes = codec.decode(encoded_index)?;

        if Mac::compute(mac_key, &index_bytes) != footer.index_mac {
            return Err(KarstError::IntegrityMismatch(
                "packfile index MAC does not match footer".into(),
            ));
        }
        if index_bytes.len() != footer.count as usize * INDEX_ENTRY_SERIALIZED_SIZE {
            return Err(KarstError::Malformed(format!(
                "packfile index size {} does not match footer count {}",
                index_bytes.len(),
                footer.count
            )));
        }

        let mut index = Vec::with_capacity(footer.count as usize);
        for raw_entry in index_bytes.chunks_exact(INDEX_ENTRY_SERIALIZED_SIZE) {
            index.push(IndexEntry::from_bytes(raw_entry)?);
        }

        Ok(Self { footer, index })
    }

    pub fn find(&self, kind: BlobKind, mac: &Mac) -> Option<&IndexEntry> {
        self.index
            .iter()
            .find(|e| e.kind == kind && e.mac == *mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::Compression;
    use crate::crypto::PlaintextEngine;
    use std::sync::Arc;

    const MAC_KEY: [u8; 32] = [0x5A; 32];

    fn codec() -> BlobCodec {
        BlobCodec::new(Compression::None, Arc::new(PlaintextEngine::new(&MAC_KEY)))
    }

    fn seal_two_blobs() -> (SealedPackfile, BlobCodec) {
        let codec = codec();
        let mut writer = PackfileWriter::new();
        let first = codec.encode(b"first blob").unwrap();
        let second = codec.encode(b"second blob").unwrap();
        writer.add_blob(BlobKind::Chunk, Mac([1; 32]), &first);
        writer.add_blob(BlobKind::Object, Mac([2; 32]), &second);
        (writer.seal(&codec, &MAC_KEY).unwrap(), codec)
    }

    #[test]
    fn seal_and_parse_roundtrip() {
        let (sealed, codec) = seal_two_blobs();
        let parsed = Packfile::from_bytes(&sealed.bytes, &codec, &MAC_KEY).unwrap();
        assert_eq!(parsed.footer.count, 2);
        assert_eq!(parsed.index.len(), 2);
        assert_eq!(parsed.index, sealed.index);

        let entry = parsed.find(BlobKind::Chunk, &Mac([1; 32])).unwrap();
        let slice = &sealed.bytes[entry.offset as usize..(entry.offset + entry.length) as usize];
        assert_eq!(codec.decode(slice).unwrap(), b"first blob");
    }

    #[test]
    fn duplicate_blob_is_suppressed() {
        let codec = codec();
        let mut writer = PackfileWriter::new();
        let encoded = codec.encode(b"same").unwrap();
        assert!(writer.add_blob(BlobKind::Chunk, Mac([1; 32]), &encoded));
        assert!(!writer.add_blob(BlobKind::Chunk, Mac([1; 32]), &encoded));
        // Same MAC under a different kind is a distinct blob.
        assert!(writer.add_blob(BlobKind::Object, Mac([1; 32]), &encoded));
        assert_eq!(writer.blob_count(), 2);
    }

    #[test]
    fn empty_packfile_cannot_seal() {
        let writer = PackfileWriter::new();
        assert!(writer.seal(&codec(), &MAC_KEY).is_err());
    }

    #[test]
    fn truncated_by_one_byte_is_malformed() {
        let (sealed, codec) = seal_two_blobs();
        let truncated = &sealed.bytes[..sealed.bytes.len() - 1];
        let err = Packfile::from_bytes(truncated, &codec, &MAC_KEY).unwrap_err();
        assert!(
            matches!(err, KarstError::Malformed(_) | KarstError::UnsupportedVersion(_)),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn corrupted_index_fails_integrity() {
        let (sealed, codec) = seal_two_blobs();
        let mut bytes = sealed.bytes.clone();
        // Flip a byte inside the encoded index region.
        let footer_len = bytes[bytes.len() - 1] as usize;
        let index_region_end = bytes.len() - TRAILER_SIZE - footer_len;
        bytes[index_region_end - 1] ^= 0xFF;
        let err = Packfile::from_bytes(&bytes, &codec, &MAC_KEY).unwrap_err();
        assert!(matches!(err, KarstError::IntegrityMismatch(_)), "got {err}");
    }

    #[test]
    fn wrong_format_version_rejected() {
        let (sealed, codec) = seal_two_blobs();
        let mut bytes = sealed.bytes.clone();
        let len = bytes.len();
        bytes[len - 5..len - 1].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(
            Packfile::from_bytes(&bytes, &codec, &MAC_KEY),
            Err(KarstError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn offsets_are_data_section_positions() {
        let (sealed, _) = seal_two_blobs();
        assert_eq!(sealed.index[0].offset, 0);
        assert_eq!(sealed.index[1].offset, sealed.index[0].length);
    }
}
