pub mod local;

use std::collections::HashMap;

use karst_types::error::{KarstError, Result};
use karst_types::mac::Mac;

/// Abstract repository storage: a configuration document, per-snapshot
/// states, packfiles with ranged blob reads, and small lock objects.
///
/// All identifiers are 32-byte MACs. Ranged packfile reads are mandatory so
/// blob retrieval never downloads whole containers.
pub trait StorageBackend: Send + Sync {
    /// The location string this backend was opened with.
    fn location(&self) -> String;

    /// Initialize the store and persist the serialized configuration.
    /// Fails with `AlreadyExists` when a repository is already present.
    fn create(&self, configuration: &[u8]) -> Result<()>;

    /// Open an existing store and return the serialized configuration.
    fn open(&self) -> Result<Vec<u8>>;

    fn close(&self) -> Result<()>;

    fn states(&self) -> Result<Vec<Mac>>;
    fn get_state(&self, mac: &Mac) -> Result<Vec<u8>>;
    fn put_state(&self, mac: &Mac, data: &[u8]) -> Result<()>;
    fn delete_state(&self, mac: &Mac) -> Result<()>;

    fn packfiles(&self) -> Result<Vec<Mac>>;
    fn get_packfile(&self, mac: &Mac) -> Result<Vec<u8>>;
    /// Read exactly `length` bytes at `offset` from a packfile. A short
    /// read is an error, never a silent truncation.
    fn get_packfile_blob(&self, mac: &Mac, offset: u32, length: u32) -> Result<Vec<u8>>;
    fn put_packfile(&self, mac: &Mac, data: &[u8]) -> Result<()>;
    fn delete_packfile(&self, mac: &Mac) -> Result<()>;

    /// Small advisory lock objects under a flat namespace.
    fn locks(&self) -> Result<Vec<String>>;
    fn get_lock(&self, name: &str) -> Result<Option<Vec<u8>>>;
    fn put_lock(&self, name: &str, data: &[u8]) -> Result<()>;
    fn delete_lock(&self, name: &str) -> Result<()>;
}

pub type StorageFactory = fn(&str) -> Result<Box<dyn StorageBackend>>;

/// Explicit storage registry threaded through the repository, replacing
/// process-wide scheme tables so tests can inject fakes.
pub struct StorageRegistry {
    factories: HashMap<String, StorageFactory>,
}

impl StorageRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("fs", |location| {
            Ok(Box::new(local::LocalStorage::new(location)))
        });
        registry
    }

    pub fn register(&mut self, scheme: &str, factory: StorageFactory) {
        self.factories.insert(scheme.to_string(), factory);
    }

    /// Resolve `scheme://path` locations; bare paths default to `fs`.
    pub fn open(&self, location: &str) -> Result<Box<dyn StorageBackend>> {
        let (scheme, rest) = parse_location(location)?;
        let factory = self.factories.get(scheme).ok_or_else(|| {
            KarstError::UnsupportedBackend(format!("no storage backend for scheme '{scheme}'"))
        })?;
        factory(rest)
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Split a location into `(scheme, remainder)`. Bare paths are `fs`;
/// anything with a scheme must be a well-formed URL.
pub fn parse_location(location: &str) -> Result<(&str, &str)> {
    let trimmed = location.trim();
    if trimmed.is_empty() {
        return Err(KarstError::InvalidArgument(
            "storage location must not be empty".into(),
        ));
    }
    match trimmed.split_once("://") {
        None => Ok(("fs", trimmed)),
        Some((scheme, rest)) => {
            url::Url::parse(trimmed).map_err(|e| {
                KarstError::InvalidArgument(format!("invalid location '{trimmed}': {e}"))
            })?;
            Ok((scheme, rest))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_path_defaults_to_fs() {
        assert_eq!(parse_location("/srv/repo").unwrap(), ("fs", "/srv/repo"));
        assert_eq!(
            parse_location("fs:///srv/repo").unwrap(),
            ("fs", "/srv/repo")
        );
    }

    #[test]
    fn unknown_scheme_rejected() {
        let registry = StorageRegistry::with_defaults();
        assert!(matches!(
            registry.open("gopher://host/repo"),
            Err(KarstError::UnsupportedBackend(_))
        ));
    }

    #[test]
    fn empty_location_rejected() {
        assert!(parse_location("   ").is_err());
    }
}
