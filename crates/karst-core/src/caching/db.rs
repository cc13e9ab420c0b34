use std::path::Path;

use rocksdb::{Direction, IteratorMode, Options, DB};

use karst_types::error::{KarstError, Result};

/// Thin wrapper over a RocksDB instance with string keys and the error
/// mapping used throughout the caches.
pub struct Db {
    inner: Option<DB>,
}

fn cache_err(e: rocksdb::Error) -> KarstError {
    KarstError::Cache(e.to_string())
}

/// Smallest byte string strictly greater than every key starting with
/// `prefix`, or `None` when no such bound exists.
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.pop() {
        if last < u8::MAX {
            bound.push(last + 1);
            return Some(bound);
        }
    }
    None
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let inner = DB::open(&opts, path.as_ref()).map_err(cache_err)?;
        Ok(Self { inner: Some(inner) })
    }

    fn db(&self) -> &DB {
        self.inner.as_ref().expect("database is open")
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db().put(key, value).map_err(cache_err)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db().get(key).map_err(cache_err)
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.db().delete(key).map_err(cache_err)
    }

    /// Ordered iteration over all keys starting with `prefix`. Yields
    /// `(key-without-prefix, value)` pairs; `reverse` walks in descending
    /// key order.
    pub fn scan_prefix<'a>(
        &'a self,
        prefix: &str,
        reverse: bool,
    ) -> impl Iterator<Item = (String, Vec<u8>)> + 'a {
        let prefix_bytes = prefix.as_bytes().to_vec();
        let mode_bound;
        let mode = if reverse {
            match prefix_upper_bound(&prefix_bytes) {
                Some(bound) => {
                    mode_bound = bound;
                    IteratorMode::From(&mode_bound, Direction::Reverse)
                }
                None => IteratorMode::End,
            }
        } else {
            mode_bound = prefix_bytes.clone();
            IteratorMode::From(&mode_bound, Direction::Forward)
        };

        // A reverse seek lands on the last key <= upper bound, which may be a
        // single key just past the prefix range. Skip leading mismatches
        // until the first in-range key.
        let skip_prefix = prefix_bytes.clone();
        let mut in_range = false;
        let take_prefix = prefix_bytes;
        let prefix_len = take_prefix.len();
        self.db()
            .iterator(mode)
            .filter_map(|item| item.ok())
            .skip_while(move |(key, _)| {
                if in_range {
                    return false;
                }
                in_range = key.starts_with(&skip_prefix);
                !in_range
            })
            .take_while(move |(key, _)| key.starts_with(&take_prefix))
            .map(move |(key, value)| {
                let rest = String::from_utf8_lossy(&key[prefix_len..]).into_owned();
                (rest, value.into_vec())
            })
    }

    /// Close the database handle. Must be called before removing the
    /// directory that backs it.
    pub fn close(&mut self) {
        self.inner.take();
    }
}
