pub mod path;
pub mod summary;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use karst_types::error::Result;
use karst_types::mac::Mac;
use karst_types::version::Version;

use crate::importer::{RecordType, ScanRecord};

pub use path::{join, normalize, path_cmp, split};
pub use summary::{Below, Directory, FileSummary, Summary};

pub const ENTRY_VERSION: Version = Version::new(1, 0, 0);

/// Stat-level metadata of a filesystem object. Structural equality on the
/// stable fields decides whether a cached entry can be reused.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    /// Modification time, nanoseconds since the Unix epoch.
    pub mod_time: i64,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub dev: u64,
    pub ino: u64,
}

impl FileInfo {
    /// Whether two stats describe the same unchanged file: mode, size,
    /// mtime, device, and inode all equal.
    pub fn equal(&self, other: &FileInfo) -> bool {
        self.mode == other.mode
            && self.size == other.size
            && self.mod_time == other.mod_time
            && self.dev == other.dev
            && self.ino == other.ino
    }

    #[cfg(unix)]
    pub fn from_metadata(name: &str, metadata: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            name: name.to_string(),
            size: metadata.size(),
            mode: metadata.mode(),
            mod_time: metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            nlink: metadata.nlink() as u32,
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }
}

/// One classification attached to an entry by an analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub analyzer: String,
    pub classes: Vec<String>,
}

/// A directory, file, or symlink entry in the virtual filesystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub version: Version,
    pub parent_path: String,
    pub name: String,
    pub record_type: RecordType,
    pub file_info: FileInfo,
    /// Symlink target.
    #[serde(default)]
    pub target: Option<String>,
    /// Root of this entry's extended-attribute index, when it has one.
    #[serde(default)]
    pub xattrs_root: Option<Mac>,
    /// Object reference; set only for regular files.
    #[serde(default)]
    pub object: Option<Mac>,
    #[serde(default)]
    pub classifications: Vec<Classification>,
    #[serde(default)]
    pub summary: Summary,
    #[serde(default)]
    pub custom_metadata: BTreeMap<String, Vec<u8>>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Entry {
    pub fn new(parent_path: &str, record: &ScanRecord) -> Self {
        let normalized = path::normalize(&record.pathname);
        let (_, name) = path::split(&normalized);
        Self {
            version: ENTRY_VERSION,
            parent_path: path::normalize(parent_path),
            name: name.to_string(),
            record_type: record.record_type,
            file_info: record.file_info.clone(),
            target: record.target.clone(),
            xattrs_root: None,
            object: None,
            classifications: Vec::new(),
            summary: Summary::default(),
            custom_metadata: BTreeMap::new(),
            tags: Vec::new(),
        }
    }

    pub fn path(&self) -> String {
        path::join(&self.parent_path, &self.name)
    }

    pub fn is_dir(&self) -> bool {
        self.record_type == RecordType::Directory
    }

    pub fn is_regular(&self) -> bool {
        self.record_type == RecordType::File
    }

    pub fn add_classification(&mut self, analyzer: &str, classes: Vec<String>) {
        self.classifications.push(Classification {
            analyzer: analyzer.to_string(),
            classes,
        });
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// An extended attribute, addressable in its own index under a synthetic
/// path derived from the owning file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Xattr {
    pub version: Version,
    pub path: String,
    pub name: String,
    pub object: Mac,
    pub size: u64,
}

impl Xattr {
    pub fn new(record: &ScanRecord, object: Mac, size: u64) -> Self {
        Self {
            version: ENTRY_VERSION,
            path: path::normalize(&record.pathname),
            name: record.xattr_name.clone().unwrap_or_default(),
            object,
            size,
        }
    }

    /// Synthetic path keying this attribute in the xattr index.
    pub fn to_path(&self) -> String {
        format!("{}#xattr={}", self.path, self.name)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// A path that failed during scan or chunking, recorded in the snapshot's
/// error index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorItem {
    pub name: String,
    pub error: String,
}

impl ErrorItem {
    pub fn new(name: &str, error: &str) -> Self {
        Self {
            name: name.to_string(),
            error: error.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}
