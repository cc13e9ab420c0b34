use std::io::Cursor;

use karst_types::error::{KarstError, Result};
use karst_types::kind::BlobKind;
use karst_types::mac::Mac;

use crate::btree::{self, StoredRoot};
use crate::objects::Object;
use crate::vfs::{self, Entry};

use super::Snapshot;

impl Snapshot {
    fn vfs_root(&self) -> Result<StoredRoot> {
        let root_mac = self.header.primary_source().vfs.root;
        let raw = self.get_blob(BlobKind::VfsBtree, &root_mac)?;
        StoredRoot::from_bytes(&raw)
    }

    /// Look up one VFS entry by its normalized path.
    pub fn find_entry(&self, pathname: &str) -> Result<Entry> {
        let pathname = vfs::normalize(pathname);
        let root = self.vfs_root()?;
        let fetch = |mac: &Mac| self.get_blob(BlobKind::VfsNode, mac);
        let entry_mac = btree::get_persisted(&root.root, &fetch, vfs::path_cmp, &pathname)?
            .ok_or_else(|| KarstError::NotFound(pathname.clone()))?;
        Entry::from_bytes(&self.get_blob(BlobKind::VfsEntry, &entry_mac)?)
    }

    /// The object document backing a regular file.
    pub fn find_object(&self, pathname: &str) -> Result<Object> {
        let entry = self.find_entry(pathname)?;
        let object_mac = entry
            .object
            .ok_or_else(|| KarstError::InvalidArgument(format!("{pathname} is not a regular file")))?;
        Object::from_bytes(&self.get_blob(BlobKind::Object, &object_mac)?)
    }

    /// Reconstruct a file's bytes by concatenating its chunks in order.
    pub fn read_file(&self, pathname: &str) -> Result<Vec<u8>> {
        let object = self.find_object(pathname)?;
        let mut out = Vec::with_capacity(object.size() as usize);
        for chunk in &object.chunks {
            if chunk.length == 0 {
                continue;
            }
            let data = self.get_blob(BlobKind::Chunk, &chunk.content_mac)?;
            if data.len() != chunk.length as usize {
                return Err(KarstError::IntegrityMismatch(format!(
                    "chunk {} length {} != recorded {}",
                    chunk.content_mac,
                    data.len(),
                    chunk.length
                )));
            }
            out.extend_from_slice(&data);
        }
        Ok(out)
    }

    /// Streaming variant of [`read_file`](Self::read_file).
    pub fn file_reader(&self, pathname: &str) -> Result<Box<dyn std::io::Read + Send>> {
        Ok(Box::new(Cursor::new(self.read_file(pathname)?)))
    }

    /// Every `(path, entry MAC)` pair in the snapshot's file index, in
    /// path order. Paths not under `prefix` are skipped when one is given.
    pub fn list_entries(&self, prefix: Option<&str>) -> Result<Vec<(String, Mac)>> {
        let root = self.vfs_root()?;
        let fetch = |mac: &Mac| self.get_blob(BlobKind::VfsNode, mac);
        let normalized_prefix = prefix.map(vfs::normalize);

        let mut out = Vec::new();
        btree::walk_persisted::<String>(&root.root, &fetch, &mut |pathname, entry_mac| {
            if let Some(wanted) = &normalized_prefix {
                let inside = wanted.as_str() == "/"
                    || pathname == wanted
                    || pathname.starts_with(&format!("{wanted}/"));
                if !inside {
                    return Ok(());
                }
            }
            out.push((pathname.clone(), *entry_mac));
            Ok(())
        })?;
        Ok(out)
    }
}
