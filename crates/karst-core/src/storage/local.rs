use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use karst_types::error::{KarstError, Result};
use karst_types::mac::Mac;

use super::StorageBackend;

const CONFIG_FILE: &str = "CONFIG";

/// Local-filesystem storage backend. States and packfiles are sharded by
/// the first identifier byte; writes go through a temporary file plus
/// rename so a crash never leaves a partial object behind.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(location: &str) -> Self {
        Self {
            root: PathBuf::from(location),
        }
    }

    fn object_path(&self, namespace: &str, mac: &Mac) -> PathBuf {
        self.root
            .join(namespace)
            .join(mac.shard_prefix())
            .join(mac.to_hex())
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| KarstError::Other("object path has no parent".into()))?;
        std::fs::create_dir_all(parent)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn list_objects(&self, namespace: &str) -> Result<Vec<Mac>> {
        let dir = self.root.join(namespace);
        let mut out = Vec::new();
        if !dir.exists() {
            return Ok(out);
        }
        for shard in std::fs::read_dir(&dir)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for object in std::fs::read_dir(shard.path())? {
                let object = object?;
                if let Ok(mac) = Mac::from_hex(&object.file_name().to_string_lossy()) {
                    out.push(mac);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    fn read_object(&self, namespace: &str, mac: &Mac) -> Result<Vec<u8>> {
        let path = self.object_path(namespace, mac);
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => KarstError::NotFound(format!("{namespace}/{mac}")),
            _ => KarstError::Io(e),
        })
    }

    fn delete_object(&self, namespace: &str, mac: &Mac) -> Result<()> {
        let path = self.object_path(namespace, mac);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(KarstError::NotFound(format!("{namespace}/{mac}")))
            }
            Err(e) => Err(KarstError::Io(e)),
        }
    }
}

impl StorageBackend for LocalStorage {
    fn location(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    fn create(&self, configuration: &[u8]) -> Result<()> {
        let config_path = self.root.join(CONFIG_FILE);
        if config_path.exists() {
            return Err(KarstError::AlreadyExists(self.location()));
        }
        std::fs::create_dir_all(&self.root)?;
        for namespace in ["states", "packfiles", "locks"] {
            std::fs::create_dir_all(self.root.join(namespace))?;
        }
        self.write_atomic(&config_path, configuration)
    }

    fn open(&self) -> Result<Vec<u8>> {
        std::fs::read(self.root.join(CONFIG_FILE)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                KarstError::NotFound(format!("repository at '{}'", self.location()))
            }
            _ => KarstError::Io(e),
        })
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn states(&self) -> Result<Vec<Mac>> {
        self.list_objects("states")
    }

    fn get_state(&self, mac: &Mac) -> Result<Vec<u8>> {
        self.read_object("states", mac)
    }

    fn put_state(&self, mac: &Mac, data: &[u8]) -> Result<()> {
        self.write_atomic(&self.object_path("states", mac), data)
    }

    fn delete_state(&self, mac: &Mac) -> Result<()> {
        self.delete_object("states", mac)
    }

    fn packfiles(&self) -> Result<Vec<Mac>> {
        self.list_objects("packfiles")
    }

    fn get_packfile(&self, mac: &Mac) -> Result<Vec<u8>> {
        self.read_object("packfiles", mac)
    }

    fn get_packfile_blob(&self, mac: &Mac, offset: u32, length: u32) -> Result<Vec<u8>> {
        let path = self.object_path("packfiles", mac);
        let mut file = std::fs::File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => KarstError::NotFound(format!("packfiles/{mac}")),
            _ => KarstError::Io(e),
        })?;
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf).map_err(|e| {
            KarstError::Malformed(format!(
                "short read of packfile {mac} at {offset}+{length}: {e}"
            ))
        })?;
        Ok(buf)
    }

    fn put_packfile(&self, mac: &Mac, data: &[u8]) -> Result<()> {
        self.write_atomic(&self.object_path("packfiles", mac), data)
    }

    fn delete_packfile(&self, mac: &Mac) -> Result<()> {
        self.delete_object("packfiles", mac)
    }

    fn locks(&self) -> Result<Vec<String>> {
        let dir = self.root.join("locks");
        let mut out = Vec::new();
        if !dir.exists() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(&dir)? {
            out.push(entry?.file_name().to_string_lossy().into_owned());
        }
        out.sort();
        Ok(out)
    }

    fn get_lock(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.root.join("locks").join(name)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KarstError::Io(e)),
        }
    }

    fn put_lock(&self, name: &str, data: &[u8]) -> Result<()> {
        self.write_atomic(&self.root.join("locks").join(name), data)
    }

    fn delete_lock(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.root.join("locks").join(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KarstError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(&dir.path().join("repo").to_string_lossy());
        storage.create(b"config-bytes").unwrap();
        (dir, storage)
    }

    #[test]
    fn create_then_open_returns_configuration() {
        let (_dir, storage) = storage();
        assert_eq!(storage.open().unwrap(), b"config-bytes");
    }

    #[test]
    fn create_twice_is_already_exists() {
        let (_dir, storage) = storage();
        assert!(matches!(
            storage.create(b"again"),
            Err(KarstError::AlreadyExists(_))
        ));
    }

    #[test]
    fn open_missing_repository_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(&dir.path().join("absent").to_string_lossy());
        assert!(matches!(storage.open(), Err(KarstError::NotFound(_))));
    }

    #[test]
    fn packfile_roundtrip_and_listing() {
        let (_dir, storage) = storage();
        let mac = Mac([0xCD; 32]);
        storage.put_packfile(&mac, b"0123456789").unwrap();
        assert_eq!(storage.get_packfile(&mac).unwrap(), b"0123456789");
        assert_eq!(storage.packfiles().unwrap(), vec![mac]);
    }

    #[test]
    fn ranged_read_is_exact() {
        let (_dir, storage) = storage();
        let mac = Mac([0xCD; 32]);
        storage.put_packfile(&mac, b"0123456789").unwrap();
        assert_eq!(storage.get_packfile_blob(&mac, 2, 4).unwrap(), b"2345");
    }

    #[test]
    fn short_ranged_read_is_malformed() {
        let (_dir, storage) = storage();
        let mac = Mac([0xCD; 32]);
        storage.put_packfile(&mac, b"0123456789").unwrap();
        assert!(matches!(
            storage.get_packfile_blob(&mac, 8, 10),
            Err(KarstError::Malformed(_))
        ));
    }

    #[test]
    fn states_roundtrip_and_delete() {
        let (_dir, storage) = storage();
        let mac = Mac([0xEF; 32]);
        storage.put_state(&mac, b"state").unwrap();
        assert_eq!(storage.get_state(&mac).unwrap(), b"state");
        assert_eq!(storage.states().unwrap(), vec![mac]);
        storage.delete_state(&mac).unwrap();
        assert!(matches!(
            storage.get_state(&mac),
            Err(KarstError::NotFound(_))
        ));
    }

    #[test]
    fn locks_roundtrip() {
        let (_dir, storage) = storage();
        storage.put_lock("0001-abc.json", b"{}").unwrap();
        assert_eq!(storage.locks().unwrap(), vec!["0001-abc.json"]);
        assert_eq!(storage.get_lock("0001-abc.json").unwrap().unwrap(), b"{}");
        storage.delete_lock("0001-abc.json").unwrap();
        assert!(storage.get_lock("0001-abc.json").unwrap().is_none());
    }
}
