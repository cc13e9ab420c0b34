use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use karst_types::error::{KarstError, Result};
use karst_types::kind::BlobKind;
use karst_types::location::{DeltaEntry, Location};
use karst_types::mac::Mac;

use crate::caching::ScanCache;
use crate::packfile::PackfileWriter;
use crate::repository::Repository;
use crate::state::LocalState;

const PACKER_CHANNEL_DEPTH: usize = 1000;

pub(crate) enum PackerMessage {
    Blob {
        kind: BlobKind,
        mac: Mac,
        data: Vec<u8>,
    },
}

/// Handle to the snapshot's packer thread. Blobs arrive already encoded;
/// the packer batches them into packfiles, publishes each sealed packfile,
/// and records delta locations.
pub(crate) struct PackerHandle {
    tx: Option<Sender<PackerMessage>>,
    handle: Option<JoinHandle<Result<()>>>,
    aborted: Arc<AtomicBool>,
}

impl PackerHandle {
    pub fn spawn(
        repository: Arc<Repository>,
        delta: Arc<LocalState<Arc<ScanCache>>>,
        scan_cache: Arc<ScanCache>,
        snapshot_id: Mac,
    ) -> Result<Self> {
        let (tx, rx) = bounded(PACKER_CHANNEL_DEPTH);
        let aborted = Arc::new(AtomicBool::new(false));
        let aborted_flag = Arc::clone(&aborted);
        let handle = std::thread::Builder::new()
            .name("packer".to_string())
            .spawn(move || {
                packer_loop(repository, delta, scan_cache, snapshot_id, rx, aborted_flag)
            })?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            aborted,
        })
    }

    /// Submit one encoded blob. Fails when the packer thread has died.
    pub fn put(&self, kind: BlobKind, mac: Mac, data: Vec<u8>) -> Result<()> {
        let sender = self
            .tx
            .as_ref()
            .ok_or_else(|| KarstError::Other("packer already finished".into()))?;
        sender
            .send(PackerMessage::Blob { kind, mac, data })
            .map_err(|_| KarstError::Other("packer thread terminated".into()))
    }

    /// Close the channel and wait for the final flush.
    pub fn finish(mut self) -> Result<()> {
        self.tx.take();
        match self.handle.take() {
            None => Ok(()),
            Some(handle) => handle
                .join()
                .map_err(|_| KarstError::Other("packer thread panicked".into()))?,
        }
    }

    /// Stop without publishing the in-progress packfile.
    pub fn abort(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.join().unwrap_or(Ok(())) {
                warn!("packer shutdown: {e}");
            }
        }
    }
}

impl Drop for PackerHandle {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

fn packer_loop(
    repository: Arc<Repository>,
    delta: Arc<LocalState<Arc<ScanCache>>>,
    scan_cache: Arc<ScanCache>,
    snapshot_id: Mac,
    rx: Receiver<PackerMessage>,
    aborted: Arc<AtomicBool>,
) -> Result<()> {
    let target = repository.configuration().packfile.max_size as usize;
    let mut writer = PackfileWriter::new();

    for message in rx {
        if aborted.load(Ordering::SeqCst) {
            continue;
        }
        let PackerMessage::Blob { kind, mac, data } = message;
        // Blobs already located by this snapshot were sealed into an
        // earlier packfile of the same run.
        if delta.blob_exists(kind, &mac) {
            continue;
        }
        if !writer.add_blob(kind, mac, &data) {
            continue;
        }
        if writer.size() >= target {
            flush(
                &mut writer,
                &repository,
                &delta,
                &scan_cache,
                &snapshot_id,
            )?;
        }
    }

    if !aborted.load(Ordering::SeqCst) && !writer.is_empty() {
        flush(
            &mut writer,
            &repository,
            &delta,
            &scan_cache,
            &snapshot_id,
        )?;
    }
    Ok(())
}

fn flush(
    writer: &mut PackfileWriter,
    repository: &Repository,
    delta: &LocalState<Arc<ScanCache>>,
    scan_cache: &ScanCache,
    snapshot_id: &Mac,
) -> Result<()> {
    let sealed = std::mem::take(writer).seal(repository.codec(), repository.mac_key())?;
    repository.put_packfile(&sealed)?;

    for entry in &sealed.index {
        delta.put_delta(&DeltaEntry {
            kind: entry.kind,
            blob: entry.mac,
            location: Location {
                packfile: sealed.mac,
                offset: entry.offset,
                length: entry.length,
            },
        })?;
    }
    scan_cache.put_packfile_ref(snapshot_id, &sealed.mac)?;
    debug!(packfile = %sealed.mac, blobs = sealed.index.len(), "packfile sealed");
    Ok(())
}
