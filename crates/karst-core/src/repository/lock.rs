use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use karst_types::error::{KarstError, Result};

use crate::importer::fs::hostname;
use crate::storage::StorageBackend;

/// An exclusive advisory lock stored as a small object in the repository.
/// Backups take it for their whole duration so two writers never race on
/// the same source's caches.
#[derive(Debug, Serialize, Deserialize)]
struct LockEntry {
    hostname: String,
    pid: u32,
    time: String,
}

const DEFAULT_STALE_LOCK_SECS: i64 = 6 * 60 * 60; // 6 hours

/// Handle to an acquired lock.
#[derive(Debug)]
pub struct LockGuard {
    key: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Acquire the exclusive repository lock.
///
/// Lock objects sort by creation time; after writing ours we re-list and
/// the oldest key wins, which stays correct on storage without
/// compare-and-swap.
pub fn acquire_lock(storage: &dyn StorageBackend) -> Result<LockGuard> {
    cleanup_stale_locks(storage, Duration::seconds(DEFAULT_STALE_LOCK_SECS))?;

    let now = Utc::now();
    let entry = LockEntry {
        hostname: hostname(),
        pid: std::process::id(),
        time: now.to_rfc3339(),
    };

    let uuid = format!("{:032x}", rand::random::<u128>());
    let ts = now.timestamp_micros();
    let key = format!("{ts:020}-{uuid}.json");
    let data = serde_json::to_vec(&entry)
        .map_err(|e| KarstError::Other(format!("lock serialize: {e}")))?;

    storage.put_lock(&key, &data)?;

    let mut keys = storage.locks()?;
    keys.sort();
    if keys.first() != Some(&key) {
        // Lost the race: remove our own lock object before reporting.
        let _ = storage.delete_lock(&key);
        let holder = keys.first().cloned().unwrap_or_else(|| "unknown".into());
        return Err(KarstError::Locked(holder));
    }

    Ok(LockGuard { key })
}

/// Release a previously acquired lock.
pub fn release_lock(storage: &dyn StorageBackend, guard: LockGuard) -> Result<()> {
    storage.delete_lock(&guard.key)
}

/// Forcibly remove every lock object. Recovery path for locks left behind
/// by killed processes. Returns the number removed.
pub fn break_lock(storage: &dyn StorageBackend) -> Result<usize> {
    let keys = storage.locks()?;
    let mut removed = 0;
    for key in keys {
        storage.delete_lock(&key)?;
        removed += 1;
    }
    Ok(removed)
}

fn cleanup_stale_locks(storage: &dyn StorageBackend, max_age: Duration) -> Result<()> {
    let now = Utc::now();
    for key in storage.locks()? {
        let Some(data) = storage.get_lock(&key)? else {
            continue;
        };
        let Ok(entry) = serde_json::from_slice::<LockEntry>(&data) else {
            continue;
        };
        let Ok(acquired) = chrono::DateTime::parse_from_rfc3339(&entry.time) else {
            continue;
        };
        if now.signed_duration_since(acquired.with_timezone(&Utc)) > max_age {
            let _ = storage.delete_lock(&key);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local::LocalStorage;

    fn storage() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(&dir.path().join("repo").to_string_lossy());
        storage.create(b"config").unwrap();
        (dir, storage)
    }

    #[test]
    fn acquire_and_release() {
        let (_dir, storage) = storage();
        let guard = acquire_lock(&storage).unwrap();
        assert_eq!(storage.locks().unwrap().len(), 1);
        release_lock(&storage, guard).unwrap();
        assert!(storage.locks().unwrap().is_empty());
    }

    #[test]
    fn second_acquire_is_locked() {
        let (_dir, storage) = storage();
        let guard = acquire_lock(&storage).unwrap();
        assert!(matches!(
            acquire_lock(&storage),
            Err(KarstError::Locked(_))
        ));
        // The loser's lock object must not linger.
        assert_eq!(storage.locks().unwrap().len(), 1);
        release_lock(&storage, guard).unwrap();
    }

    #[test]
    fn stale_lock_is_cleaned_up() {
        let (_dir, storage) = storage();
        let stale = LockEntry {
            hostname: "gone".into(),
            pid: 1,
            time: (Utc::now() - Duration::hours(24)).to_rfc3339(),
        };
        storage
            .put_lock(
                "00000000000000000001-stale.json",
                &serde_json::to_vec(&stale).unwrap(),
            )
            .unwrap();

        let guard = acquire_lock(&storage).unwrap();
        release_lock(&storage, guard).unwrap();
        assert!(storage.locks().unwrap().is_empty());
    }

    #[test]
    fn break_lock_removes_everything() {
        let (_dir, storage) = storage();
        let _guard = acquire_lock(&storage).unwrap();
        assert_eq!(break_lock(&storage).unwrap(), 1);
        assert!(storage.locks().unwrap().is_empty());
    }
}
