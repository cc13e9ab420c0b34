use std::path::PathBuf;

use karst_types::error::Result;
use karst_types::mac::Mac;

use super::db::Db;

const FILENAME_PREFIX: &str = "__filename__:";
const OBJECT_PREFIX: &str = "__object__:";
const FILE_SUMMARY_PREFIX: &str = "__file_summary__:";

/// Long-lived cache keyed by `(importer type, origin)`. Stores the
/// serialized entry, object document, and file summary for every path seen,
/// so unchanged files can skip re-chunking on the next snapshot.
pub struct VfsCache {
    db: Db,
}

impl VfsCache {
    pub(super) fn open(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            db: Db::open(&dir)?,
        })
    }

    pub fn put_filename(&self, pathname: &str, data: &[u8]) -> Result<()> {
        self.db
            .put(format!("{FILENAME_PREFIX}{pathname}").as_bytes(), data)
    }

    pub fn get_filename(&self, pathname: &str) -> Result<Option<Vec<u8>>> {
        self.db
            .get(format!("{FILENAME_PREFIX}{pathname}").as_bytes())
    }

    pub fn put_object(&self, mac: &Mac, data: &[u8]) -> Result<()> {
        self.db
            .put(format!("{OBJECT_PREFIX}{}", mac.to_hex()).as_bytes(), data)
    }

    pub fn get_object(&self, mac: &Mac) -> Result<Option<Vec<u8>>> {
        self.db
            .get(format!("{OBJECT_PREFIX}{}", mac.to_hex()).as_bytes())
    }

    pub fn put_file_summary(&self, pathname: &str, data: &[u8]) -> Result<()> {
        self.db
            .put(format!("{FILE_SUMMARY_PREFIX}{pathname}").as_bytes(), data)
    }

    pub fn get_file_summary(&self, pathname: &str) -> Result<Option<Vec<u8>>> {
        self.db
            .get(format!("{FILE_SUMMARY_PREFIX}{pathname}").as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::CacheManager;

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CacheManager::new(dir.path()).unwrap();
        {
            let cache = manager.vfs("fs", "localhost").unwrap();
            cache.put_filename("/a", b"entry").unwrap();
            cache.put_object(&Mac([1; 32]), b"object").unwrap();
            cache.put_file_summary("/a", b"summary").unwrap();
        }
        let cache = manager.vfs("fs", "localhost").unwrap();
        assert_eq!(cache.get_filename("/a").unwrap().unwrap(), b"entry");
        assert_eq!(cache.get_object(&Mac([1; 32])).unwrap().unwrap(), b"object");
        assert_eq!(cache.get_file_summary("/a").unwrap().unwrap(), b"summary");
    }

    #[test]
    fn distinct_origins_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CacheManager::new(dir.path()).unwrap();
        let a = manager.vfs("fs", "host-a").unwrap();
        a.put_filename("/a", b"entry").unwrap();
        let b = manager.vfs("fs", "host-b").unwrap();
        assert!(b.get_filename("/a").unwrap().is_none());
    }
}
