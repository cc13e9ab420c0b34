pub mod db;
pub mod repository;
pub mod scan;
pub mod vfs;

use std::path::{Path, PathBuf};

use uuid::Uuid;

use karst_types::error::Result;
use karst_types::mac::Mac;

pub use repository::RepositoryCache;
pub use scan::ScanCache;
pub use vfs::VfsCache;

/// Owns the local cache directory and hands out the per-purpose stores.
#[derive(Debug, Clone)]
pub struct CacheManager {
    root: PathBuf,
}

impl CacheManager {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Per-snapshot scratch store, removed when the snapshot commits or
    /// aborts.
    pub fn scan(&self, snapshot_id: &Mac) -> Result<ScanCache> {
        ScanCache::open(self.root.join("scan"), snapshot_id)
    }

    /// Long-lived per-origin store reused across snapshots of the same
    /// source.
    pub fn vfs(&self, importer_type: &str, origin: &str) -> Result<VfsCache> {
        let dir = self
            .root
            .join("vfs")
            .join(importer_type)
            .join(hex::encode(origin.as_bytes()));
        VfsCache::open(dir)
    }

    /// Local mirror of the repository's aggregate state.
    pub fn repository(&self, repository_id: &Uuid) -> Result<RepositoryCache> {
        RepositoryCache::open(self.root.join("repository").join(repository_id.to_string()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
