pub mod identity;
pub mod lock;

use std::io::Read;
use std::sync::Arc;

use rand::RngCore;
use tracing::{debug, info};
use uuid::Uuid;

use karst_types::error::{KarstError, Result};
use karst_types::kind::BlobKind;
use karst_types::location::Location;
use karst_types::mac::{Mac, MacHasher};

use crate::caching::{CacheManager, RepositoryCache};
use crate::chunker::Chunker;
use crate::codec::BlobCodec;
use crate::compress::Compression;
use crate::config::{
    ChunkingParams, CompressionParams, Configuration, ConfigFormat, PackfileParams,
};
use crate::crypto::key::{init_encryption, open_encryption};
use crate::crypto::{CryptoEngine, EncryptionAlgorithm, PlaintextEngine};
use crate::packfile::SealedPackfile;
use crate::state::{LocalState, Metadata};
use crate::storage::StorageBackend;

pub use identity::Identity;

/// Options for creating a new repository.
pub struct CreateOptions {
    pub compression: Option<CompressionParams>,
    pub chunking: ChunkingParams,
    pub packfile: PackfileParams,
    /// Enables encryption when set, together with `passphrase`.
    pub encryption: Option<EncryptionAlgorithm>,
    pub passphrase: Option<String>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            compression: Some(CompressionParams::default()),
            chunking: ChunkingParams::default(),
            packfile: PackfileParams::default(),
            encryption: None,
            passphrase: None,
        }
    }
}

/// A handle to an opened repository: storage, codec, and the merged
/// aggregate state of every persisted snapshot.
pub struct Repository {
    storage: Box<dyn StorageBackend>,
    cache: CacheManager,
    configuration: Configuration,
    crypto: Arc<dyn CryptoEngine>,
    codec: BlobCodec,
    state: LocalState<RepositoryCache>,
    identity: Option<Identity>,
}

impl Repository {
    /// Initialize a new repository on `storage` and open it.
    pub fn create(
        storage: Box<dyn StorageBackend>,
        cache: CacheManager,
        options: CreateOptions,
    ) -> Result<Self> {
        let mut configuration = Configuration::new();
        configuration.compression = options.compression;
        configuration.chunking = options.chunking;
        configuration.packfile = options.packfile;

        let crypto: Arc<dyn CryptoEngine> = match options.encryption {
            Some(algorithm) => {
                let passphrase = options.passphrase.as_deref().ok_or_else(|| {
                    KarstError::InvalidArgument(
                        "encryption requires a passphrase at creation".into(),
                    )
                })?;
                let (params, engine) = init_encryption(algorithm, passphrase)?;
                configuration.encryption = Some(params);
                engine
            }
            None => {
                // The MAC key still has to be per-repository and stable, so
                // unencrypted repositories store a random one in the clear.
                let mut mac_key = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut mac_key);
                configuration.hashing.key = mac_key.to_vec();
                Arc::new(PlaintextEngine::new(&mac_key))
            }
        };

        storage.create(&configuration.to_bytes(ConfigFormat::Auto)?)?;
        info!(
            repository_id = %configuration.repository_id,
            location = %storage.location(),
            "repository created"
        );
        Self::assemble(storage, cache, configuration, crypto, None)
    }

    /// Open an existing repository and rebuild its aggregate state from
    /// persisted per-snapshot states.
    pub fn open(
        storage: Box<dyn StorageBackend>,
        cache: CacheManager,
        passphrase: Option<&str>,
        identity: Option<Identity>,
    ) -> Result<Self> {
        let raw = storage.open()?;
        let configuration = Configuration::from_bytes(&raw, ConfigFormat::Auto)?;

        let crypto: Arc<dyn CryptoEngine> = match &configuration.encryption {
            Some(params) => {
                let passphrase = passphrase.ok_or_else(|| {
                    KarstError::InvalidArgument("repository requires a passphrase".into())
                })?;
                open_encryption(params, passphrase)?
            }
            None => {
                let key: [u8; 32] =
                    configuration.hashing.key.as_slice().try_into().map_err(|_| {
                        KarstError::Malformed(format!(
                            "hashing key length {}",
                            configuration.hashing.key.len()
                        ))
                    })?;
                Arc::new(PlaintextEngine::new(&key))
            }
        };

        Self::assemble(storage, cache, configuration, crypto, identity)
    }

    fn assemble(
        storage: Box<dyn StorageBackend>,
        cache: CacheManager,
        configuration: Configuration,
        crypto: Arc<dyn CryptoEngine>,
        identity: Option<Identity>,
    ) -> Result<Self> {
        let codec = BlobCodec::new(
            Compression::from_params(configuration.compression.as_ref()),
            Arc::clone(&crypto),
        );
        let state_cache = cache.repository(&configuration.repository_id)?;
        let mut state = LocalState::new(state_cache);
        state.metadata.aggregate = true;

        let mut repository = Self {
            storage,
            cache,
            configuration,
            crypto,
            codec,
            state,
            identity,
        };
        repository.sync_aggregate_state()?;
        repository.state.update_serial_or(Uuid::new_v4())?;
        Ok(repository)
    }

    /// Merge every persisted state not yet in the local cache, newest
    /// first, so the first mapping seen for a blob is its most recent
    /// location.
    fn sync_aggregate_state(&mut self) -> Result<()> {
        let mut pending = Vec::new();
        for state_id in self.storage.states()? {
            if self.state.has_state(&state_id)? {
                continue;
            }
            let stream = self.get_state_document(&state_id)?;
            let metadata = Metadata::from_stream_tail(&stream)?;
            pending.push((metadata.timestamp, state_id, stream));
        }
        pending.sort_by(|a, b| b.0.cmp(&a.0));

        let merged = pending.len();
        for (_, state_id, stream) in pending {
            self.state.merge_stream(state_id, &mut stream.as_slice())?;
        }
        if merged > 0 {
            debug!(states = merged, "aggregate state synchronized");
        }
        Ok(())
    }

    pub fn location(&self) -> String {
        self.storage.location()
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn codec(&self) -> &BlobCodec {
        &self.codec
    }

    pub fn storage(&self) -> &dyn StorageBackend {
        self.storage.as_ref()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn state(&self) -> &LocalState<RepositoryCache> {
        &self.state
    }

    pub fn mac_key(&self) -> &[u8; 32] {
        self.crypto.mac_key()
    }

    pub fn compute_mac(&self, data: &[u8]) -> Mac {
        Mac::compute(self.crypto.mac_key(), data)
    }

    pub fn mac_hasher(&self) -> MacHasher {
        MacHasher::new(self.crypto.mac_key())
    }

    pub fn chunker<R: Read>(&self, source: R) -> Chunker<R> {
        Chunker::new(source, &self.configuration.chunking)
    }

    pub fn blob_exists(&self, kind: BlobKind, mac: &Mac) -> bool {
        self.state.blob_exists(kind, mac)
    }

    pub fn get_blob_location(&self, kind: BlobKind, mac: &Mac) -> Result<Location> {
        self.state
            .get_location(kind, mac)?
            .ok_or_else(|| KarstError::NotFound(format!("{kind} {mac}")))
    }

    /// Fetch and decode a blob. Content-addressed kinds are verified
    /// against their identifier; snapshot headers and signatures are
    /// addressed by random identifier and skip that check.
    pub fn get_blob(&self, kind: BlobKind, mac: &Mac) -> Result<Vec<u8>> {
        let location = self.get_blob_location(kind, mac)?;
        let raw =
            self.storage
                .get_packfile_blob(&location.packfile, location.offset, location.length)?;
        let decoded = self.codec.decode(&raw)?;
        if kind != BlobKind::Snapshot && kind != BlobKind::Signature {
            let actual = self.compute_mac(&decoded);
            if actual != *mac {
                return Err(KarstError::IntegrityMismatch(format!(
                    "{kind} blob {mac} decoded to {actual}"
                )));
            }
        }
        Ok(decoded)
    }

    pub fn put_packfile(&self, sealed: &SealedPackfile) -> Result<()> {
        debug!(packfile = %sealed.mac, blobs = sealed.index.len(), "writing packfile");
        self.storage.put_packfile(&sealed.mac, &sealed.bytes)
    }

    /// Persist a serialized delta-state stream under a snapshot identifier
    /// and fold it into the aggregate.
    pub fn put_state_document(&self, id: &Mac, stream: &[u8]) -> Result<()> {
        let encoded = self.codec.encode(stream)?;
        self.storage.put_state(id, &encoded)?;
        self.state.merge_stream(*id, &mut &stream[..])?;
        Ok(())
    }

    /// Fetch and decode a persisted state stream.
    pub fn get_state_document(&self, id: &Mac) -> Result<Vec<u8>> {
        let encoded = self.storage.get_state(id)?;
        self.codec.decode(&encoded)
    }

    pub fn list_snapshots(&self) -> Result<Vec<Mac>> {
        self.state.list_snapshots()
    }

    pub fn serial(&self) -> Uuid {
        self.state.metadata.serial
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        if let Err(e) = self.storage.close() {
            debug!("storage close: {e}");
        }
    }
}
