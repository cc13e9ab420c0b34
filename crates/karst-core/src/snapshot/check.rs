use std::collections::HashMap;

use tracing::info;

use karst_types::error::{KarstError, Result};
use karst_types::kind::BlobKind;
use karst_types::mac::Mac;

use crate::btree::{self, StoredRoot};
use crate::events::Event;
use crate::objects::Object;
use crate::packfile::Packfile;
use crate::repository::identity::verify_signature;
use crate::vfs::{self, Entry};

use super::Snapshot;

/// Options controlling verification depth.
#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    /// Index-level checks only; blob payloads are not re-MACed.
    pub fast: bool,
    /// Skip signature verification even when an identity is present.
    pub no_verify: bool,
}

/// Verifier state: parsed packfiles are cached so each container is read
/// and authenticated once.
struct Checker<'a> {
    snapshot: &'a Snapshot,
    options: &'a CheckOptions,
    packfiles: HashMap<Mac, Option<Packfile>>,
    failures: u64,
}

impl<'a> Checker<'a> {
    fn new(snapshot: &'a Snapshot, options: &'a CheckOptions) -> Self {
        Self {
            snapshot,
            options,
            packfiles: HashMap::new(),
            failures: 0,
        }
    }

    fn report(&mut self, pathname: &str, message: String) {
        self.failures += 1;
        self.snapshot.events().send(Event::CheckBlobFailed {
            snapshot: self.snapshot.header.identifier,
            pathname: pathname.to_string(),
            message,
        });
    }

    fn packfile(&mut self, mac: &Mac) -> Result<&Option<Packfile>> {
        if !self.packfiles.contains_key(mac) {
            let repository = self.snapshot.repository();
            let parsed = match repository.storage().get_packfile(mac) {
                Err(e) => Err(e),
                Ok(raw) => Packfile::from_bytes(&raw, repository.codec(), repository.mac_key()),
            };
            self.packfiles.insert(*mac, parsed.ok());
        }
        Ok(&self.packfiles[mac])
    }

    /// Verify one referenced blob: location resolves, the packfile index
    /// entry matches, and in full mode the decoded payload re-MACs to the
    /// identifier. Returns the payload when it was fetched.
    fn check_blob(&mut self, pathname: &str, kind: BlobKind, mac: &Mac) -> Option<Vec<u8>> {
        let repository = self.snapshot.repository();

        let location = match repository.get_blob_location(kind, mac) {
            Ok(location) => location,
            Err(e) => {
                self.report(pathname, format!("{kind} {mac}: {e}"));
                return None;
            }
        };

        // Decide on the index entry first; the cache borrow must end
        // before reporting.
        let index_failure: Option<String> = match self.packfile(&location.packfile) {
            Err(e) => Some(format!("packfile {}: {e}", location.packfile)),
            Ok(None) => Some(format!("packfile {} failed to parse", location.packfile)),
            Ok(Some(packfile)) => match packfile.find(kind, mac) {
                None => Some(format!("{kind} {mac} missing from packfile index")),
                Some(entry) => {
                    if entry.offset != location.offset || entry.length != location.length {
                        Some(format!(
                            "{kind} {mac} location disagrees with packfile index"
                        ))
                    } else {
                        None
                    }
                }
            },
        };
        if let Some(message) = index_failure {
            self.report(pathname, message);
            return None;
        }

        if self.options.fast {
            return None;
        }

        match repository.get_blob(kind, mac) {
            Ok(data) => Some(data),
            Err(e) => {
                self.report(pathname, format!("{kind} {mac}: {e}"));
                None
            }
        }
    }

    /// Like `check_blob`, but always yields the payload when it is
    /// readable. Fast mode skips the MAC pass yet still needs bytes to
    /// descend into indexes and objects.
    fn fetch_blob(&mut self, pathname: &str, kind: BlobKind, mac: &Mac) -> Option<Vec<u8>> {
        if let Some(data) = self.check_blob(pathname, kind, mac) {
            return Some(data);
        }
        if self.options.fast {
            return self.snapshot.repository().get_blob(kind, mac).ok();
        }
        None
    }

    fn check_file_entry(&mut self, pathname: &str, entry: &Entry) {
        let Some(object_mac) = entry.object else {
            return;
        };
        let Some(raw) = self.fetch_blob(pathname, BlobKind::Object, &object_mac) else {
            return;
        };
        let object = match Object::from_bytes(&raw) {
            Ok(object) => object,
            Err(e) => {
                self.report(pathname, format!("object {object_mac}: {e}"));
                return;
            }
        };

        let mut total: u64 = 0;
        for chunk in &object.chunks {
            total += u64::from(chunk.length);
            let _ = self.check_blob(pathname, BlobKind::Chunk, &chunk.content_mac);
        }
        if !object.chunks.is_empty() && total != entry.file_info.size {
            self.report(
                pathname,
                format!(
                    "chunk lengths sum to {total}, file size is {}",
                    entry.file_info.size
                ),
            );
        }
    }
}

impl Snapshot {
    /// Verify the snapshot's integrity, optionally restricted to a path
    /// prefix. Reports every mismatch and keeps going; the result is
    /// `false` when anything failed.
    pub fn check(&self, prefix: Option<&str>, options: &CheckOptions) -> Result<bool> {
        let mut checker = Checker::new(self, options);

        if let Some(identity) = &self.header.identity {
            if !options.no_verify {
                match self.verify() {
                    Ok(true) => info!(
                        snapshot = %self.header.short_id(),
                        "signature verification succeeded"
                    ),
                    Ok(false) => checker.report(
                        "/",
                        format!("signature by {} did not verify", identity.identifier),
                    ),
                    Err(e) => checker.report("/", format!("signature: {e}")),
                }
            }
        }

        // Auxiliary index roots referenced by the header.
        let source_roots = {
            let source = self.header.primary_source();
            let mut roots = vec![
                (BlobKind::ErrorBtree, source.vfs.errors),
                (BlobKind::XattrBtree, source.vfs.xattrs),
            ];
            for index in &source.indexes {
                roots.push((BlobKind::BtreeRoot, index.value));
            }
            roots
        };
        for (kind, mac) in source_roots {
            let _ = checker.check_blob("/", kind, &mac);
        }

        let root_mac = self.header.primary_source().vfs.root;
        let normalized_prefix = prefix.map(vfs::normalize);

        let root = match checker.fetch_blob("/", BlobKind::VfsBtree, &root_mac) {
            Some(raw) => match StoredRoot::from_bytes(&raw) {
                Ok(root) => Some(root),
                Err(e) => {
                    checker.report("/", format!("vfs root record: {e}"));
                    None
                }
            },
            None => None,
        };

        if let Some(root) = root {
            // Collect the index first so node blobs are verified during the
            // walk, then verify each entry.
            let mut entries: Vec<(String, Mac)> = Vec::new();
            let walk = {
                let fetch = |mac: &Mac| {
                    self.repository()
                        .get_blob(BlobKind::VfsNode, mac)
                };
                btree::walk_persisted::<String>(&root.root, &fetch, &mut |pathname, mac| {
                    entries.push((pathname.clone(), *mac));
                    Ok(())
                })
            };
            if let Err(e) = walk {
                checker.report("/", format!("vfs index walk: {e}"));
            }

            for (pathname, entry_mac) in entries {
                if let Some(wanted) = &normalized_prefix {
                    let inside = wanted.as_str() == "/"
                        || pathname == *wanted
                        || pathname.starts_with(&format!("{wanted}/"));
                    if !inside {
                        continue;
                    }
                }

                let Some(raw) = checker.fetch_blob(&pathname, BlobKind::VfsEntry, &entry_mac)
                else {
                    continue;
                };
                let entry = match Entry::from_bytes(&raw) {
                    Ok(entry) => entry,
                    Err(e) => {
                        checker.report(&pathname, format!("entry {entry_mac}: {e}"));
                        continue;
                    }
                };
                if entry.is_regular() {
                    checker.check_file_entry(&pathname, &entry);
                }
                checker.snapshot.events().send(Event::CheckBlobOk {
                    snapshot: checker.snapshot.header.identifier,
                    pathname: pathname.clone(),
                });
            }
        }

        Ok(checker.failures == 0)
    }

    /// Verify the header signature against the identity recorded in the
    /// header.
    pub fn verify(&self) -> Result<bool> {
        let identity = self
            .header
            .identity
            .as_ref()
            .ok_or_else(|| KarstError::InvalidArgument("snapshot carries no identity".into()))?;
        let signature = self
            .repository()
            .get_blob(BlobKind::Signature, &self.header.identifier)?;
        let header_mac = self.repository().compute_mac(&self.header.to_bytes()?);
        verify_signature(&identity.public_key, header_mac.as_bytes(), &signature)
    }
}
