use std::io::Read;
use std::path::{Path, PathBuf};

use crossbeam_channel::{bounded, Receiver};
use tracing::debug;
use walkdir::WalkDir;

use karst_types::error::{KarstError, Result};

use crate::vfs::FileInfo;

use super::{Importer, RecordType, ScanError, ScanRecord, ScanResult};

const SCAN_CHANNEL_DEPTH: usize = 1000;

/// Importer over the local filesystem (`fs://` locations and bare paths).
///
/// Scan records carry virtual paths rooted at `/`: the scan root itself is
/// `/`, and every other path is relative to it. Readers translate back to
/// real paths.
pub struct FsImporter {
    root: PathBuf,
}

impl FsImporter {
    pub fn new(location: &str) -> Result<Self> {
        if location.is_empty() {
            return Err(KarstError::InvalidArgument(
                "fs importer needs a root path".into(),
            ));
        }
        Ok(Self {
            root: PathBuf::from(location),
        })
    }

    /// Virtual `/`-rooted path for a real path under the scan root.
    fn virtual_path(root: &Path, path: &Path) -> String {
        match path.strip_prefix(root) {
            Ok(rest) if rest.as_os_str().is_empty() => "/".to_string(),
            Ok(rest) => format!("/{}", rest.to_string_lossy()),
            Err(_) => path.to_string_lossy().into_owned(),
        }
    }

    /// Real path for a virtual `/`-rooted path.
    fn real_path(&self, pathname: &str) -> PathBuf {
        let rest = pathname.trim_start_matches('/');
        if rest.is_empty() {
            return self.root.clone();
        }
        // A file root maps its single `/<name>` record onto itself.
        if !self.root.is_dir() {
            return self.root.clone();
        }
        self.root.join(rest)
    }

    fn record_for(root: &Path, path: &Path) -> std::io::Result<ScanRecord> {
        let metadata = std::fs::symlink_metadata(path)?;
        let file_type = metadata.file_type();
        let record_type = if file_type.is_dir() {
            RecordType::Directory
        } else if file_type.is_symlink() {
            RecordType::Symlink
        } else if file_type.is_file() {
            RecordType::File
        } else {
            record_type_special(&file_type)
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());
        let target = if record_type == RecordType::Symlink {
            std::fs::read_link(path)
                .ok()
                .map(|t| t.to_string_lossy().into_owned())
        } else {
            None
        };

        Ok(ScanRecord {
            record_type,
            pathname: Self::virtual_path(root, path),
            target,
            file_info: file_info_from(&name, &metadata),
            xattr_name: None,
            file_attributes: 0,
        })
    }
}

#[cfg(unix)]
fn record_type_special(file_type: &std::fs::FileType) -> RecordType {
    use std::os::unix::fs::FileTypeExt;
    if file_type.is_fifo() {
        RecordType::Pipe
    } else if file_type.is_socket() {
        RecordType::Socket
    } else {
        RecordType::Device
    }
}

#[cfg(not(unix))]
fn record_type_special(_file_type: &std::fs::FileType) -> RecordType {
    RecordType::Device
}

#[cfg(unix)]
fn file_info_from(name: &str, metadata: &std::fs::Metadata) -> FileInfo {
    FileInfo::from_metadata(name, metadata)
}

#[cfg(not(unix))]
fn file_info_from(name: &str, metadata: &std::fs::Metadata) -> FileInfo {
    FileInfo {
        name: name.to_string(),
        size: metadata.len(),
        mode: if metadata.permissions().readonly() {
            0o100444
        } else {
            0o100644
        },
        mod_time: 0,
        ..FileInfo::default()
    }
}

/// Extended attribute names of `path`, empty when unsupported.
#[cfg(unix)]
fn xattr_names(path: &Path) -> Vec<String> {
    match xattr::list(path) {
        Ok(names) => names
            .filter_map(|n| n.to_str().map(str::to_string))
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[cfg(not(unix))]
fn xattr_names(_path: &Path) -> Vec<String> {
    Vec::new()
}

impl Importer for FsImporter {
    fn origin(&self) -> String {
        hostname()
    }

    fn importer_type(&self) -> String {
        "fs".to_string()
    }

    fn root(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    fn scan(&self) -> Result<Receiver<ScanResult>> {
        let (tx, rx) = bounded(SCAN_CHANNEL_DEPTH);
        let root = self.root.clone();

        std::thread::Builder::new()
            .name("fs-importer".to_string())
            .spawn(move || {
                // A scan root that is itself a file still needs a `/`
                // directory entry so the tree has somewhere to hang.
                match std::fs::symlink_metadata(&root) {
                    Err(e) => {
                        let _ = tx.send(ScanResult::Error(ScanError {
                            pathname: "/".to_string(),
                            message: e.to_string(),
                        }));
                        return;
                    }
                    Ok(metadata) if !metadata.is_dir() => {
                        if let Some(parent) = root.parent() {
                            if let Ok(mut record) = FsImporter::record_for(parent, parent) {
                                record.pathname = "/".to_string();
                                if tx.send(ScanResult::Record(record)).is_err() {
                                    return;
                                }
                            }
                        }
                        let name = root
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        match FsImporter::record_for(&root, &root) {
                            Err(e) => {
                                let _ = tx.send(ScanResult::Error(ScanError {
                                    pathname: "/".to_string(),
                                    message: e.to_string(),
                                }));
                            }
                            Ok(mut record) => {
                                record.pathname = format!("/{name}");
                                let _ = tx.send(ScanResult::Record(record));
                            }
                        }
                        return;
                    }
                    Ok(_) => {}
                }

                for item in WalkDir::new(&root).follow_links(false) {
                    let result = match item {
                        Err(e) => {
                            let pathname = e
                                .path()
                                .map(|p| FsImporter::virtual_path(&root, p))
                                .unwrap_or_else(|| "/".to_string());
                            ScanResult::Error(ScanError {
                                pathname,
                                message: e.to_string(),
                            })
                        }
                        Ok(entry) => match FsImporter::record_for(&root, entry.path()) {
                            Err(e) => ScanResult::Error(ScanError {
                                pathname: FsImporter::virtual_path(&root, entry.path()),
                                message: e.to_string(),
                            }),
                            Ok(record) => ScanResult::Record(record),
                        },
                    };

                    // Synthetic per-xattr records follow their owner.
                    let xattrs = if let ScanResult::Record(record) = &result {
                        if record.record_type == RecordType::File {
                            let rest = record.pathname.trim_start_matches('/');
                            let real = root.join(rest);
                            xattr_names(&real)
                                .into_iter()
                                .map(|name| {
                                    let mut synthetic = record.clone();
                                    synthetic.xattr_name = Some(name);
                                    ScanResult::Record(synthetic)
                                })
                                .collect()
                        } else {
                            Vec::new()
                        }
                    } else {
                        Vec::new()
                    };

                    if tx.send(result).is_err() {
                        return;
                    }
                    for xattr_record in xattrs {
                        if tx.send(xattr_record).is_err() {
                            return;
                        }
                    }
                }
                debug!("fs importer finished scanning {:?}", root);
            })?;

        Ok(rx)
    }

    fn new_reader(&self, pathname: &str) -> Result<Box<dyn Read + Send>> {
        let real = self.real_path(pathname);
        let file = std::fs::File::open(&real).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => KarstError::NotFound(pathname.to_string()),
            _ => KarstError::Io(e),
        })?;
        Ok(Box::new(file))
    }

    #[cfg(unix)]
    fn new_extended_attribute_reader(
        &self,
        pathname: &str,
        name: &str,
    ) -> Result<Box<dyn Read + Send>> {
        match xattr::get(self.real_path(pathname), name) {
            Ok(Some(value)) => Ok(Box::new(std::io::Cursor::new(value))),
            Ok(None) => Err(KarstError::NotFound(format!("{pathname}#xattr={name}"))),
            Err(e) => Err(KarstError::Io(e)),
        }
    }

    #[cfg(not(unix))]
    fn new_extended_attribute_reader(
        &self,
        pathname: &str,
        name: &str,
    ) -> Result<Box<dyn Read + Send>> {
        Err(KarstError::UnsupportedBackend(format!(
            "extended attributes ({pathname}#xattr={name})"
        )))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        std::fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "localhost".to_string())
    })
}
