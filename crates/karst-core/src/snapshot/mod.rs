pub mod backup;
pub mod check;
pub mod header;
pub(crate) mod packer;
pub mod reader;

use std::sync::Arc;

use rand::RngCore;
use tracing::{info, trace};

use karst_types::error::{KarstError, Result};
use karst_types::kind::BlobKind;
use karst_types::mac::Mac;

use crate::caching::ScanCache;
use crate::events::EventBus;
use crate::repository::Repository;
use crate::state::LocalState;

pub use backup::{BackupOptions, BackupOutcome};
pub use check::CheckOptions;
pub use header::Header;

use packer::PackerHandle;

/// A snapshot: either in-flight (being built by a backup) or loaded from
/// its committed header.
pub struct Snapshot {
    repository: Arc<Repository>,
    pub header: Header,
    scan_cache: Option<Arc<ScanCache>>,
    delta: Option<Arc<LocalState<Arc<ScanCache>>>>,
    packer: Option<PackerHandle>,
    events: EventBus,
}

impl Snapshot {
    /// Start a new in-flight snapshot with a freshly generated identifier.
    pub fn create(repository: Arc<Repository>, events: EventBus) -> Result<Self> {
        let mut identifier_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut identifier_bytes);
        let identifier = Mac(identifier_bytes);

        let scan_cache = Arc::new(repository.cache().scan(&identifier)?);
        let mut delta = LocalState::new(Arc::clone(&scan_cache));
        delta.metadata.serial = repository.serial();
        let delta = Arc::new(delta);

        let packer = PackerHandle::spawn(
            Arc::clone(&repository),
            Arc::clone(&delta),
            Arc::clone(&scan_cache),
            identifier,
        )?;

        trace!(snapshot = %identifier, "snapshot started");
        Ok(Self {
            repository,
            header: Header::new(identifier),
            scan_cache: Some(scan_cache),
            delta: Some(delta),
            packer: Some(packer),
            events,
        })
    }

    /// Load a committed snapshot from its header blob.
    pub fn load(repository: Arc<Repository>, identifier: &Mac) -> Result<Self> {
        let raw = repository.get_blob(BlobKind::Snapshot, identifier)?;
        let header = Header::from_bytes(&raw)?;
        Ok(Self {
            repository,
            header,
            scan_cache: None,
            delta: None,
            packer: None,
            events: EventBus::disabled(),
        })
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn set_events(&mut self, events: EventBus) {
        self.events = events;
    }

    pub(crate) fn scan_cache(&self) -> Result<&Arc<ScanCache>> {
        self.scan_cache
            .as_ref()
            .ok_or_else(|| KarstError::InvalidArgument("snapshot is not in-flight".into()))
    }

    /// Whether the blob is known to this snapshot's delta state or the
    /// repository aggregate. The orchestrator uses this to suppress
    /// duplicate writes before they reach the packer.
    pub fn blob_exists(&self, kind: BlobKind, mac: &Mac) -> bool {
        if let Some(delta) = &self.delta {
            if delta.blob_exists(kind, mac) {
                return true;
            }
        }
        self.repository.blob_exists(kind, mac)
    }

    /// Encode a blob and hand it to the packer.
    pub fn put_blob(&self, kind: BlobKind, mac: Mac, data: &[u8]) -> Result<()> {
        let packer = self
            .packer
            .as_ref()
            .ok_or_else(|| KarstError::InvalidArgument("snapshot is not in-flight".into()))?;
        let encoded = self.repository.codec().encode(data)?;
        packer.put(kind, mac, encoded)
    }

    /// Fetch a blob referenced by this snapshot.
    pub fn get_blob(&self, kind: BlobKind, mac: &Mac) -> Result<Vec<u8>> {
        self.repository.get_blob(kind, mac)
    }

    /// Seal the snapshot: write the signature and header blobs, drain the
    /// packer, persist the delta state, and discard the scan cache.
    pub(crate) fn commit(&mut self) -> Result<()> {
        let serialized = self.header.to_bytes()?;

        if let Some(identity) = self.repository.identity() {
            let header_mac = self.repository.compute_mac(&serialized);
            let signature = identity.sign(header_mac.as_bytes());
            self.put_blob(BlobKind::Signature, self.header.identifier, &signature)?;
        }
        self.put_blob(BlobKind::Snapshot, self.header.identifier, &serialized)?;

        // Record the snapshot blob mapping before the last flush happens,
        // then wait for the packer to drain.
        let packer = self
            .packer
            .take()
            .ok_or_else(|| KarstError::InvalidArgument("snapshot already committed".into()))?;
        packer.finish()?;

        let delta = self
            .delta
            .take()
            .ok_or_else(|| KarstError::InvalidArgument("snapshot already committed".into()))?;
        let mut stream = Vec::new();
        delta.serialize_to(&mut stream)?;
        self.repository
            .put_state_document(&self.header.identifier, &stream)?;
        drop(delta);

        if let Some(scan_cache) = self.scan_cache.take() {
            if let Ok(cache) = Arc::try_unwrap(scan_cache) {
                cache.close()?;
            }
        }

        info!(snapshot = %self.header.short_id(), "snapshot committed");
        Ok(())
    }

    /// Tear down an in-flight snapshot without publishing anything further.
    pub(crate) fn abort(&mut self) {
        if let Some(packer) = self.packer.take() {
            packer.abort();
        }
        self.delta.take();
        if let Some(scan_cache) = self.scan_cache.take() {
            if let Ok(cache) = Arc::try_unwrap(scan_cache) {
                let _ = cache.close();
            }
        }
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        if self.packer.is_some() {
            self.abort();
        }
    }
}
