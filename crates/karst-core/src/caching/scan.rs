use std::path::PathBuf;

use tracing::warn;

use karst_types::error::{KarstError, Result};
use karst_types::kind::BlobKind;
use karst_types::mac::Mac;

use crate::state::StateCache;

use super::db::Db;

const FILE_PREFIX: &str = "__file__:";
const DIRECTORY_PREFIX: &str = "__directory__:";
const SUMMARY_PREFIX: &str = "__summary__:";
const CHECKSUM_PREFIX: &str = "__checksum__:";
const DELTA_PREFIX: &str = "__delta__:";
const STATE_PREFIX: &str = "__state__:";

/// Per-snapshot scratch store for intermediate scan records, summaries, and
/// the snapshot's delta state. Removed from disk when closed.
pub struct ScanCache {
    snapshot_id: Mac,
    dir: PathBuf,
    db: Db,
}

fn trim_path(pathname: &str) -> &str {
    let trimmed = pathname.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

fn delta_key(kind: BlobKind, blob: &Mac) -> String {
    format!("{DELTA_PREFIX}{:03}:{}", kind.as_u8(), blob.to_hex())
}

fn mac_from_key_suffix(key: &str) -> Result<Mac> {
    let hex_part = key.rsplit(':').next().unwrap_or(key);
    Mac::from_hex(hex_part)
}

impl ScanCache {
    pub(super) fn open(base: PathBuf, snapshot_id: &Mac) -> Result<Self> {
        let dir = base.join(snapshot_id.to_hex());
        std::fs::create_dir_all(&dir)?;
        let db = Db::open(&dir)?;
        Ok(Self {
            snapshot_id: *snapshot_id,
            dir,
            db,
        })
    }

    pub fn snapshot_id(&self) -> &Mac {
        &self.snapshot_id
    }

    pub fn put_file(&self, pathname: &str, data: &[u8]) -> Result<()> {
        self.db
            .put(format!("{FILE_PREFIX}{pathname}").as_bytes(), data)
    }

    pub fn get_file(&self, pathname: &str) -> Result<Option<Vec<u8>>> {
        self.db.get(format!("{FILE_PREFIX}{pathname}").as_bytes())
    }

    pub fn put_directory(&self, pathname: &str, data: &[u8]) -> Result<()> {
        self.db
            .put(format!("{DIRECTORY_PREFIX}{pathname}").as_bytes(), data)
    }

    pub fn get_directory(&self, pathname: &str) -> Result<Option<Vec<u8>>> {
        self.db
            .get(format!("{DIRECTORY_PREFIX}{pathname}").as_bytes())
    }

    pub fn put_summary(&self, pathname: &str, data: &[u8]) -> Result<()> {
        let pathname = trim_path(pathname);
        self.db
            .put(format!("{SUMMARY_PREFIX}{pathname}").as_bytes(), data)
    }

    pub fn get_summary(&self, pathname: &str) -> Result<Option<Vec<u8>>> {
        let pathname = trim_path(pathname);
        self.db
            .get(format!("{SUMMARY_PREFIX}{pathname}").as_bytes())
    }

    pub fn put_checksum(&self, pathname: &str, mac: &Mac) -> Result<()> {
        let pathname = trim_path(pathname);
        self.db
            .put(format!("{CHECKSUM_PREFIX}{pathname}").as_bytes(), &mac.0)
    }

    pub fn get_checksum(&self, pathname: &str) -> Result<Option<Mac>> {
        let pathname = trim_path(pathname);
        match self
            .db
            .get(format!("{CHECKSUM_PREFIX}{pathname}").as_bytes())?
        {
            None => Ok(None),
            Some(raw) => {
                if raw.len() != Mac::SIZE {
                    return Err(KarstError::Malformed(format!(
                        "invalid cached checksum length: {}",
                        raw.len()
                    )));
                }
                let mut out = [0u8; 32];
                out.copy_from_slice(&raw);
                Ok(Some(Mac(out)))
            }
        }
    }

    /// Remember that `packfile` was produced for `snapshot`.
    pub fn put_packfile_ref(&self, snapshot: &Mac, packfile: &Mac) -> Result<()> {
        self.db.put(
            format!("__packfile__:{}:{}", snapshot.to_hex(), packfile.to_hex()).as_bytes(),
            &[],
        )
    }

    /// Packfiles produced while building `snapshot`.
    pub fn packfile_refs(&self, snapshot: &Mac) -> Result<Vec<Mac>> {
        self.db
            .scan_prefix(&format!("__packfile__:{}:", snapshot.to_hex()), false)
            .map(|(key, _)| Mac::from_hex(&key))
            .collect()
    }

    /// Scratch storage for B-tree nodes and other prefixed records.
    pub fn put_raw(&self, prefix: &str, key: &str, data: &[u8]) -> Result<()> {
        self.db.put(format!("{prefix}:{key}").as_bytes(), data)
    }

    pub fn get_raw(&self, prefix: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.db.get(format!("{prefix}:{key}").as_bytes())
    }

    /// Ordered iteration over keys under `prefix`, forward or reverse.
    pub fn enumerate_prefix<'a>(
        &'a self,
        prefix: &str,
        reverse: bool,
    ) -> impl Iterator<Item = (String, Vec<u8>)> + 'a {
        self.db.scan_prefix(prefix, reverse)
    }

    pub fn directories(&self, reverse: bool) -> impl Iterator<Item = (String, Vec<u8>)> + '_ {
        self.enumerate_prefix(DIRECTORY_PREFIX, reverse)
    }

    pub fn files_under<'a>(&'a self, prefix: &str) -> impl Iterator<Item = (String, Vec<u8>)> + 'a {
        self.db.scan_prefix(&format!("{FILE_PREFIX}{prefix}"), false)
    }

    pub fn directories_under<'a>(
        &'a self,
        prefix: &str,
    ) -> impl Iterator<Item = (String, Vec<u8>)> + 'a {
        self.db
            .scan_prefix(&format!("{DIRECTORY_PREFIX}{prefix}"), false)
    }

    /// Close the store and remove its backing directory. The scan cache
    /// never survives its snapshot.
    pub fn close(mut self) -> Result<()> {
        self.db.close();
        std::fs::remove_dir_all(&self.dir)?;
        Ok(())
    }
}

impl Drop for ScanCache {
    fn drop(&mut self) {
        self.db.close();
        if self.dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.dir) {
                warn!("failed to remove scan cache at {:?}: {e}", self.dir);
            }
        }
    }
}

impl StateCache for ScanCache {
    fn put_delta(&self, kind: BlobKind, blob: &Mac, data: &[u8]) -> Result<()> {
        self.db.put(delta_key(kind, blob).as_bytes(), data)
    }

    fn get_delta(&self, kind: BlobKind, blob: &Mac) -> Result<Option<Vec<u8>>> {
        self.db.get(delta_key(kind, blob).as_bytes())
    }

    fn has_delta(&self, kind: BlobKind, blob: &Mac) -> Result<bool> {
        self.db.has(delta_key(kind, blob).as_bytes())
    }

    fn deltas(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .db
            .scan_prefix(DELTA_PREFIX, false)
            .map(|(_, value)| value)
            .collect())
    }

    fn deltas_by_kind(&self, kind: BlobKind) -> Result<Vec<(Mac, Vec<u8>)>> {
        let prefix = format!("{DELTA_PREFIX}{:03}:", kind.as_u8());
        self.db
            .scan_prefix(&prefix, false)
            .map(|(key, value)| Ok((mac_from_key_suffix(&key)?, value)))
            .collect()
    }

    fn put_state(&self, id: &Mac, metadata: &[u8]) -> Result<()> {
        self.db
            .put(format!("{STATE_PREFIX}{}", id.to_hex()).as_bytes(), metadata)
    }

    fn has_state(&self, id: &Mac) -> Result<bool> {
        self.db
            .has(format!("{STATE_PREFIX}{}", id.to_hex()).as_bytes())
    }

    fn get_states(&self) -> Result<Vec<(Mac, Vec<u8>)>> {
        self.db
            .scan_prefix(STATE_PREFIX, false)
            .map(|(key, value)| Ok((Mac::from_hex(&key)?, value)))
            .collect()
    }

    fn del_state(&self, id: &Mac) -> Result<()> {
        self.db
            .delete(format!("{STATE_PREFIX}{}", id.to_hex()).as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::CacheManager;

    fn scratch() -> (tempfile::TempDir, ScanCache) {
        let dir = tempfile::tempdir().unwrap();
        let manager = CacheManager::new(dir.path()).unwrap();
        let cache = manager.scan(&Mac([0x11; 32])).unwrap();
        (dir, cache)
    }

    #[test]
    fn file_and_directory_namespaces_are_distinct() {
        let (_dir, cache) = scratch();
        cache.put_file("/a", b"file").unwrap();
        cache.put_directory("/a", b"dir").unwrap();
        assert_eq!(cache.get_file("/a").unwrap().unwrap(), b"file");
        assert_eq!(cache.get_directory("/a").unwrap().unwrap(), b"dir");
    }

    #[test]
    fn summary_path_is_normalized() {
        let (_dir, cache) = scratch();
        cache.put_summary("/a/", b"s").unwrap();
        assert_eq!(cache.get_summary("/a").unwrap().unwrap(), b"s");
        cache.put_summary("", b"root").unwrap();
        assert_eq!(cache.get_summary("/").unwrap().unwrap(), b"root");
    }

    #[test]
    fn directory_enumeration_reverse_is_deepest_first() {
        let (_dir, cache) = scratch();
        for path in ["/", "/a", "/a/b", "/a/b/c", "/d"] {
            cache.put_directory(path, path.as_bytes()).unwrap();
        }
        let order: Vec<String> = cache.directories(true).map(|(k, _)| k).collect();
        assert_eq!(order, vec!["/d", "/a/b/c", "/a/b", "/a", "/"]);
    }

    #[test]
    fn delta_state_cache_roundtrip() {
        let (_dir, cache) = scratch();
        cache
            .put_delta(BlobKind::Chunk, &Mac([1; 32]), &[0xAB; 73])
            .unwrap();
        assert!(cache.has_delta(BlobKind::Chunk, &Mac([1; 32])).unwrap());
        assert!(!cache.has_delta(BlobKind::Object, &Mac([1; 32])).unwrap());
        let by_kind = cache.deltas_by_kind(BlobKind::Chunk).unwrap();
        assert_eq!(by_kind.len(), 1);
        assert_eq!(by_kind[0].0, Mac([1; 32]));
    }

    #[test]
    fn close_removes_backing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CacheManager::new(dir.path()).unwrap();
        let cache = manager.scan(&Mac([0x22; 32])).unwrap();
        let backing = dir.path().join("scan").join(Mac([0x22; 32]).to_hex());
        assert!(backing.exists());
        cache.close().unwrap();
        assert!(!backing.exists());
    }
}
