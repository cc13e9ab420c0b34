use serde::{Deserialize, Serialize};

use karst_types::error::Result;

use crate::importer::RecordType;

/// Per-file statistics cached alongside the entry, feeding directory
/// roll-ups without re-reading the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSummary {
    pub record_type: Option<RecordTypeTag>,
    pub size: u64,
    pub mode: u32,
    pub mod_time: i64,
    pub objects: u64,
    pub chunks: u64,
    pub entropy: f64,
    #[serde(default)]
    pub content_type: String,
}

/// Compact record-type tag stored in summaries.
pub type RecordTypeTag = RecordType;

impl FileSummary {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// Counters for a directory's direct children.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Directory {
    pub children: u64,
    pub directories: u64,
    pub files: u64,
    pub symlinks: u64,
    pub size: u64,
    pub objects: u64,
    pub chunks: u64,
    pub entropy: f64,
}

/// Cumulative counters for everything at or below a directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Below {
    pub directories: u64,
    pub files: u64,
    pub symlinks: u64,
    pub size: u64,
    pub objects: u64,
    pub chunks: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Averages {
    pub size: f64,
    pub entropy: f64,
}

/// Roll-up summary attached to every directory entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub directory: Directory,
    pub below: Below,
    pub averages: Averages,
}

impl Summary {
    /// Fold a direct child file (or symlink) into this directory's summary.
    pub fn update_with_file_summary(&mut self, file: &FileSummary) {
        match file.record_type {
            Some(RecordType::Symlink) => {
                self.directory.symlinks += 1;
                self.below.symlinks += 1;
            }
            _ => {
                self.directory.files += 1;
                self.below.files += 1;
            }
        }
        self.directory.size += file.size;
        self.directory.objects += file.objects;
        self.directory.chunks += file.chunks;
        self.directory.entropy += file.entropy;
        self.below.size += file.size;
        self.below.objects += file.objects;
        self.below.chunks += file.chunks;
    }

    /// Fold a completed direct child directory into this summary.
    pub fn update_below(&mut self, child: &Summary) {
        self.directory.directories += 1;
        self.below.directories += 1 + child.below.directories;
        self.below.files += child.below.files;
        self.below.symlinks += child.below.symlinks;
        self.below.size += child.below.size;
        self.below.objects += child.below.objects;
        self.below.chunks += child.below.chunks;
        self.below.errors += child.below.errors;
    }

    /// Compute per-directory averages once all children are folded in.
    pub fn update_averages(&mut self) {
        if self.directory.files > 0 {
            self.averages.size = self.directory.size as f64 / self.directory.files as f64;
            self.averages.entropy = self.directory.entropy / self.directory.files as f64;
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}
