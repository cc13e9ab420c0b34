use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use karst_types::error::{KarstError, Result};
use karst_types::kind::BlobKind;
use karst_types::mac::Mac;

use crate::caching::CacheManager;
use crate::config::{ChunkingParams, PackfileParams};
use crate::repository::{CreateOptions, Repository};
use crate::state::StateCache;
use crate::storage::StorageBackend;

/// In-memory state cache for unit tests. Keys sort the same way the
/// on-disk caches sort.
#[derive(Default)]
pub struct MemoryStateCache {
    deltas: Mutex<BTreeMap<(u8, Mac), Vec<u8>>>,
    states: Mutex<BTreeMap<Mac, Vec<u8>>>,
}

impl StateCache for MemoryStateCache {
    fn put_delta(&self, kind: BlobKind, blob: &Mac, data: &[u8]) -> Result<()> {
        self.deltas
            .lock()
            .unwrap()
            .insert((kind.as_u8(), *blob), data.to_vec());
        Ok(())
    }

    fn get_delta(&self, kind: BlobKind, blob: &Mac) -> Result<Option<Vec<u8>>> {
        Ok(self
            .deltas
            .lock()
            .unwrap()
            .get(&(kind.as_u8(), *blob))
            .cloned())
    }

    fn has_delta(&self, kind: BlobKind, blob: &Mac) -> Result<bool> {
        Ok(self
            .deltas
            .lock()
            .unwrap()
            .contains_key(&(kind.as_u8(), *blob)))
    }

    fn deltas(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.deltas.lock().unwrap().values().cloned().collect())
    }

    fn deltas_by_kind(&self, kind: BlobKind) -> Result<Vec<(Mac, Vec<u8>)>> {
        Ok(self
            .deltas
            .lock()
            .unwrap()
            .iter()
            .filter(|((k, _), _)| *k == kind.as_u8())
            .map(|((_, mac), data)| (*mac, data.clone()))
            .collect())
    }

    fn put_state(&self, id: &Mac, metadata: &[u8]) -> Result<()> {
        self.states.lock().unwrap().insert(*id, metadata.to_vec());
        Ok(())
    }

    fn has_state(&self, id: &Mac) -> Result<bool> {
        Ok(self.states.lock().unwrap().contains_key(id))
    }

    fn get_states(&self) -> Result<Vec<(Mac, Vec<u8>)>> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .iter()
            .map(|(id, data)| (*id, data.clone()))
            .collect())
    }

    fn del_state(&self, id: &Mac) -> Result<()> {
        self.states.lock().unwrap().remove(id);
        Ok(())
    }
}

/// In-memory storage backend. Thread-safe via mutexes.
#[derive(Default)]
pub struct MemoryStorage {
    config: Mutex<Option<Vec<u8>>>,
    states: Mutex<HashMap<Mac, Vec<u8>>>,
    packfiles: Mutex<HashMap<Mac, Vec<u8>>>,
    locks: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn location(&self) -> String {
        "memory://".to_string()
    }

    fn create(&self, configuration: &[u8]) -> Result<()> {
        let mut config = self.config.lock().unwrap();
        if config.is_some() {
            return Err(KarstError::AlreadyExists(self.location()));
        }
        *config = Some(configuration.to_vec());
        Ok(())
    }

    fn open(&self) -> Result<Vec<u8>> {
        self.config
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| KarstError::NotFound("repository at 'memory://'".into()))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn states(&self) -> Result<Vec<Mac>> {
        let mut out: Vec<Mac> = self.states.lock().unwrap().keys().copied().collect();
        out.sort();
        Ok(out)
    }

    fn get_state(&self, mac: &Mac) -> Result<Vec<u8>> {
        self.states
            .lock()
            .unwrap()
            .get(mac)
            .cloned()
            .ok_or_else(|| KarstError::NotFound(format!("states/{mac}")))
    }

    fn put_state(&self, mac: &Mac, data: &[u8]) -> Result<()> {
        self.states.lock().unwrap().insert(*mac, data.to_vec());
        Ok(())
    }

    fn delete_state(&self, mac: &Mac) -> Result<()> {
        self.states
            .lock()
            .unwrap()
            .remove(mac)
            .map(|_| ())
            .ok_or_else(|| KarstError::NotFound(format!("states/{mac}")))
    }

    fn packfiles(&self) -> Result<Vec<Mac>> {
        let mut out: Vec<Mac> = self.packfiles.lock().unwrap().keys().copied().collect();
        out.sort();
        Ok(out)
    }

    fn get_packfile(&self, mac: &Mac) -> Result<Vec<u8>> {
        self.packfiles
            .lock()
            .unwrap()
            .get(mac)
            .cloned()
            .ok_or_else(|| KarstError::NotFound(format!("packfiles/{mac}")))
    }

    fn get_packfile_blob(&self, mac: &Mac, offset: u32, length: u32) -> Result<Vec<u8>> {
        let packfiles = self.packfiles.lock().unwrap();
        let data = packfiles
            .get(mac)
            .ok_or_else(|| KarstError::NotFound(format!("packfiles/{mac}")))?;
        let start = offset as usize;
        let end = start + length as usize;
        if end > data.len() {
            return Err(KarstError::Malformed(format!(
                "short read of packfile {mac} at {offset}+{length}"
            )));
        }
        Ok(data[start..end].to_vec())
    }

    fn put_packfile(&self, mac: &Mac, data: &[u8]) -> Result<()> {
        self.packfiles.lock().unwrap().insert(*mac, data.to_vec());
        Ok(())
    }

    fn delete_packfile(&self, mac: &Mac) -> Result<()> {
        self.packfiles
            .lock()
            .unwrap()
            .remove(mac)
            .map(|_| ())
            .ok_or_else(|| KarstError::NotFound(format!("packfiles/{mac}")))
    }

    fn locks(&self) -> Result<Vec<String>> {
        Ok(self.locks.lock().unwrap().keys().cloned().collect())
    }

    fn get_lock(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.locks.lock().unwrap().get(name).cloned())
    }

    fn put_lock(&self, name: &str, data: &[u8]) -> Result<()> {
        self.locks
            .lock()
            .unwrap()
            .insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn delete_lock(&self, name: &str) -> Result<()> {
        self.locks.lock().unwrap().remove(name);
        Ok(())
    }
}

/// Chunking parameters small enough to exercise multi-chunk files with
/// kilobyte-sized fixtures.
pub fn small_chunking() -> ChunkingParams {
    ChunkingParams {
        algorithm: "FASTCDC".to_string(),
        min_size: 256,
        normal_size: 1024,
        max_size: 4096,
    }
}

pub fn test_create_options() -> CreateOptions {
    CreateOptions {
        compression: None,
        chunking: small_chunking(),
        packfile: PackfileParams { max_size: 64 * 1024 },
        encryption: None,
        passphrase: None,
    }
}

/// Plaintext repository over in-memory storage, caches under `cache_dir`.
pub fn memory_repository(cache_dir: &Path) -> Arc<Repository> {
    let cache = CacheManager::new(cache_dir).unwrap();
    let storage = Box::new(MemoryStorage::new());
    Arc::new(Repository::create(storage, cache, test_create_options()).unwrap())
}

/// Plaintext repository over local storage at `base/repo`, caches under
/// `base/cache`. Use when a test needs to reach the packfiles on disk.
pub fn local_repository(base: &Path) -> Arc<Repository> {
    let cache = CacheManager::new(base.join("cache")).unwrap();
    let storage = Box::new(crate::storage::local::LocalStorage::new(
        &base.join("repo").to_string_lossy(),
    ));
    Arc::new(Repository::create(storage, cache, test_create_options()).unwrap())
}

/// Write a fixture tree: `(relative path, contents)` pairs, directories
/// created as needed.
pub fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (relative, contents) in files {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
    }
}

/// Deterministic pseudo-random bytes for multi-chunk fixtures.
pub fn pattern_bytes(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        })
        .collect()
}
