pub mod fs;

use std::collections::HashMap;
use std::io::Read;

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};

use karst_types::error::{KarstError, Result};

use crate::vfs::FileInfo;

/// Kind of filesystem object a scan record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    File,
    Directory,
    Symlink,
    Device,
    Pipe,
    Socket,
}

/// One object yielded by an importer scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    pub record_type: RecordType,
    pub pathname: String,
    /// Symlink target, when the record is a symlink.
    #[serde(default)]
    pub target: Option<String>,
    pub file_info: FileInfo,
    /// Set on synthetic records describing one extended attribute of
    /// `pathname`.
    #[serde(default)]
    pub xattr_name: Option<String>,
    #[serde(default)]
    pub file_attributes: u32,
}

impl ScanRecord {
    pub fn is_xattr(&self) -> bool {
        self.xattr_name.is_some()
    }
}

/// A path the importer could not read.
#[derive(Debug, Clone)]
pub struct ScanError {
    pub pathname: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum ScanResult {
    Record(ScanRecord),
    Error(ScanError),
}

/// Contract every source-tree importer satisfies.
pub trait Importer: Send + Sync {
    /// Host or service the source tree comes from.
    fn origin(&self) -> String;
    /// Importer scheme name, e.g. `fs`.
    fn importer_type(&self) -> String;
    /// Root path of the scan.
    fn root(&self) -> String;
    /// Start the scan; results stream on the returned channel.
    fn scan(&self) -> Result<Receiver<ScanResult>>;
    fn new_reader(&self, pathname: &str) -> Result<Box<dyn Read + Send>>;
    fn new_extended_attribute_reader(
        &self,
        pathname: &str,
        name: &str,
    ) -> Result<Box<dyn Read + Send>>;
    fn close(&self) -> Result<()>;
}

pub type ImporterFactory = fn(&str) -> Result<Box<dyn Importer>>;

/// Explicit importer registry threaded through the repository, so tests can
/// inject fakes instead of relying on process-wide lookup tables.
pub struct ImporterRegistry {
    factories: HashMap<String, ImporterFactory>,
}

impl ImporterRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("fs", |location| {
            Ok(Box::new(fs::FsImporter::new(location)?))
        });
        registry
    }

    pub fn register(&mut self, scheme: &str, factory: ImporterFactory) {
        self.factories.insert(scheme.to_string(), factory);
    }

    /// Resolve a location of the form `scheme://path`; bare paths default
    /// to `fs`.
    pub fn open(&self, location: &str) -> Result<Box<dyn Importer>> {
        let (scheme, rest) = parse_location(location)?;
        let factory = self.factories.get(scheme).ok_or_else(|| {
            KarstError::UnsupportedBackend(format!("no importer for scheme '{scheme}'"))
        })?;
        factory(rest)
    }
}

impl Default for ImporterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Split a location into `(scheme, remainder)`. Bare paths are `fs`.
pub fn parse_location(location: &str) -> Result<(&str, &str)> {
    if location.is_empty() {
        return Err(KarstError::InvalidArgument(
            "importer location must not be empty".into(),
        ));
    }
    match location.split_once("://") {
        None => Ok(("fs", location)),
        Some((scheme, rest)) => Ok((scheme, rest)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_path_defaults_to_fs() {
        assert_eq!(parse_location("/srv/data").unwrap(), ("fs", "/srv/data"));
    }

    #[test]
    fn scheme_is_split_off() {
        assert_eq!(
            parse_location("s3://bucket/prefix").unwrap(),
            ("s3", "bucket/prefix")
        );
        assert_eq!(parse_location("fs:///srv").unwrap(), ("fs", "/srv"));
    }

    #[test]
    fn unknown_scheme_is_rejected_by_registry() {
        let registry = ImporterRegistry::with_defaults();
        assert!(matches!(
            registry.open("ftp://host/path"),
            Err(KarstError::UnsupportedBackend(_))
        ));
    }
}
