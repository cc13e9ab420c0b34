use std::path::PathBuf;

use karst_types::error::Result;
use karst_types::kind::BlobKind;
use karst_types::mac::Mac;

use crate::state::StateCache;

use super::db::Db;

const DELTA_PREFIX: &str = "__delta__:";
const STATE_PREFIX: &str = "__state__:";

/// Local mirror of the repository's aggregate state: every persisted
/// per-snapshot delta merged into one lookup table, plus the metadata of the
/// states already merged.
pub struct RepositoryCache {
    db: Db,
}

fn delta_key(kind: BlobKind, blob: &Mac) -> String {
    format!("{DELTA_PREFIX}{:03}:{}", kind.as_u8(), blob.to_hex())
}

fn mac_from_key_suffix(key: &str) -> Result<Mac> {
    let hex_part = key.rsplit(':').next().unwrap_or(key);
    Mac::from_hex(hex_part)
}

impl RepositoryCache {
    pub(super) fn open(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            db: Db::open(&dir)?,
        })
    }
}

impl StateCache for RepositoryCache {
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
    use uuid::Uuid;

    #[test]
    fn aggregate_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CacheManager::new(dir.path()).unwrap();
        let repo_id = Uuid::new_v4();
        {
            let cache = manager.repository(&repo_id).unwrap();
            cache
                .put_delta(BlobKind::Chunk, &Mac([1; 32]), &[0u8; 73])
                .unwrap();
            cache.put_state(&Mac([2; 32]), b"metadata").unwrap();
        }
        let cache = manager.repository(&repo_id).unwrap();
        assert!(cache.has_delta(BlobKind::Chunk, &Mac([1; 32])).unwrap());
        assert!(cache.has_state(&Mac([2; 32])).unwrap());
    }
}
