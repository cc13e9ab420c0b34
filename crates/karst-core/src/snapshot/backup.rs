use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::bounded;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;

use karst_types::error::{KarstError, Result};
use karst_types::kind::BlobKind;
use karst_types::mac::Mac;

use crate::btree::{BTree, CacheNodeStore, DEFAULT_ORDER};
use crate::caching::VfsCache;
use crate::classifier::ClassifierRegistry;
use crate::events::Event;
use crate::importer::{Importer, RecordType, ScanRecord, ScanResult};
use crate::objects::{content_type_by_extension, detect_content_type, entropy, Chunk, Object};
use crate::repository::lock;
use crate::snapshot::header::{HeaderIdentity, Index, VfsRoots};
use crate::storage::StorageBackend;
use crate::vfs::{self, Entry, ErrorItem, FileSummary, Summary, Xattr};

use super::Snapshot;

const FILES_CHANNEL_DEPTH: usize = 1000;

/// Options controlling one backup run.
pub struct BackupOptions {
    /// Worker fan-out; 0 means `8 * cpus + 1`.
    pub max_concurrency: usize,
    pub name: String,
    pub tags: Vec<String>,
    /// Glob patterns; matching paths are skipped entirely.
    pub excludes: Vec<String>,
    pub classifiers: ClassifierRegistry,
    /// Cooperative cancellation: set to true to stop the run.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            name: String::new(),
            tags: Vec::new(),
            excludes: Vec::new(),
            classifiers: ClassifierRegistry::new(),
            cancel: None,
        }
    }
}

/// Counters reported after a successful backup.
#[derive(Debug, Clone, Default)]
pub struct BackupOutcome {
    pub files: u64,
    pub directories: u64,
    pub size: u64,
    pub errors: u64,
}

fn default_concurrency() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    8 * cpus + 1
}

/// Releases the repository lock when the backup run ends, whichever way it
/// ends.
struct HeldLock<'a> {
    storage: &'a dyn StorageBackend,
    key: String,
}

impl<'a> HeldLock<'a> {
    fn acquire(storage: &'a dyn StorageBackend) -> Result<Self> {
        let guard = lock::acquire_lock(storage)?;
        Ok(Self {
            storage,
            key: guard.key().to_string(),
        })
    }
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        let _ = self.storage.delete_lock(&self.key);
    }
}

type StringBTree<V> = BTree<String, V, CacheNodeStore<String, V>>;

/// Shared state of one backup run, visible to the dispatcher and every
/// scanner worker.
struct BackupContext<'a> {
    snapshot: &'a Snapshot,
    importer: &'a dyn Importer,
    vfs_cache: VfsCache,
    classifiers: &'a ClassifierRegistry,
    excludes: GlobSet,
    repo_location: String,
    root: String,

    aborted: AtomicBool,
    aborted_reason: Mutex<Option<KarstError>>,
    cancel: Option<Arc<AtomicBool>>,

    erridx: Mutex<StringBTree<ErrorItem>>,
    xattridx: Mutex<StringBTree<Xattr>>,
    ctidx: Mutex<StringBTree<Mac>>,

    files: AtomicU64,
    directories: AtomicU64,
    size: AtomicU64,
}

/// Treat an idempotent re-insert as success.
fn ignore_exists(result: Result<()>) -> Result<()> {
    match result {
        Err(KarstError::AlreadyExists(_)) => Ok(()),
        other => other,
    }
}

impl BackupContext<'_> {
    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn abort(&self, reason: KarstError) {
        self.aborted.store(true, Ordering::SeqCst);
        let mut slot = self.aborted_reason.lock().unwrap();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    fn record_entry(&self, entry: &Entry) -> Result<()> {
        let pathname = entry.path();
        let bytes = entry.to_bytes()?;
        let scan_cache = self.snapshot.scan_cache()?;
        if entry.is_dir() {
            scan_cache.put_directory(&pathname, &bytes)
        } else {
            scan_cache.put_file(&pathname, &bytes)
        }
    }

    fn record_error(&self, pathname: &str, message: &str) {
        warn!(pathname, message, "path error recorded");
        self.snapshot.events().send(Event::PathError {
            snapshot: self.snapshot.header.identifier,
            pathname: pathname.to_string(),
            message: message.to_string(),
        });
        let mut index = self.erridx.lock().unwrap();
        let _ = ignore_exists(index.insert(
            vfs::normalize(pathname),
            ErrorItem::new(&vfs::normalize(pathname), message),
        ));
    }

    fn record_xattr(&self, record: &ScanRecord, object: Mac, size: u64) -> Result<()> {
        let xattr = Xattr::new(record, object, size);
        let mut index = self.xattridx.lock().unwrap();
        ignore_exists(index.insert(xattr.to_path(), xattr))
    }

    /// Stream one file (or one extended attribute) through the chunker,
    /// assembling its object and submitting missing chunks to the packer.
    fn chunkify(&self, record: &ScanRecord) -> Result<Object> {
        use std::io::Read;

        let snapshot = self.snapshot;
        let repository = snapshot.repository();

        let mut reader = match &record.xattr_name {
            Some(name) => self
                .importer
                .new_extended_attribute_reader(&record.pathname, name)?,
            None => self.importer.new_reader(&record.pathname)?,
        };

        let mut object = Object::new();
        if let Some(mime) = content_type_by_extension(&record.pathname) {
            object.content_type = mime.to_string();
        }

        let mut object_hasher = repository.mac_hasher();
        let mut first_chunk = true;
        let mut total_entropy = 0.0f64;
        let mut total_size = 0u64;

        let mut process_chunk = |data: &[u8]| -> Result<()> {
            if first_chunk {
                if object.content_type.is_empty() {
                    object.content_type = detect_content_type(data).to_string();
                }
                first_chunk = false;
            }
            object_hasher.update(data);

            let chunk_mac = repository.compute_mac(data);
            let score = entropy(data);
            object
                .chunks
                .push(Chunk::new(chunk_mac, data.len() as u32, score));
            total_entropy += score * data.len() as f64;
            total_size += data.len() as u64;

            if !snapshot.blob_exists(BlobKind::Chunk, &chunk_mac) {
                snapshot.put_blob(BlobKind::Chunk, chunk_mac, data)?;
            }
            Ok(())
        };

        let min_size = u64::from(repository.configuration().chunking.min_size);
        if record.is_xattr() {
            // Attribute values are small; read them whole.
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            process_chunk(&buf)?;
        } else if record.file_info.size == 0 {
            // An empty chunk keeps empty files addressable.
            process_chunk(&[])?;
        } else if record.file_info.size < min_size {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            process_chunk(&buf)?;
        } else {
            for chunk in repository.chunker(reader) {
                process_chunk(&chunk?)?;
            }
        }

        object.entropy = if total_size > 0 {
            total_entropy / total_size as f64
        } else {
            0.0
        };
        object.content_mac = object_hasher.finalize();
        Ok(object)
    }

    fn process_file(&self, record: ScanRecord) {
        self.snapshot.events().send(Event::File {
            snapshot: self.snapshot.header.identifier,
            pathname: record.pathname.clone(),
        });
        if let Err(e) = self.try_process_file(&record) {
            self.record_error(&record.pathname, &e.to_string());
        }
    }

    fn try_process_file(&self, record: &ScanRecord) -> Result<()> {
        let snapshot = self.snapshot;
        let repository = snapshot.repository();

        let mut file_entry: Option<Entry> = None;
        let mut cached_entry_mac = Mac::default();
        let mut object: Option<Object> = None;
        let mut serialized_object: Option<Vec<u8>> = None;
        let mut object_mac = Mac::default();

        // Reuse the previous run's entry when the stat is unchanged.
        if !record.is_xattr() {
            match self.vfs_cache.get_filename(&record.pathname) {
                Err(e) => warn!("vfs cache read: {e}"),
                Ok(None) => {}
                Ok(Some(buf)) => match Entry::from_bytes(&buf) {
                    Err(e) => warn!("vfs cache entry decode: {e}"),
                    Ok(cached) => {
                        cached_entry_mac = repository.compute_mac(&buf);
                        if cached.file_info.equal(&record.file_info) {
                            if cached.is_regular() {
                                if let Some(cached_object_mac) = cached.object {
                                    match self.vfs_cache.get_object(&cached_object_mac) {
                                        Err(e) => warn!("vfs cache object read: {e}"),
                                        Ok(None) => {}
                                        Ok(Some(obj_buf)) => {
                                            object_mac = repository.compute_mac(&obj_buf);
                                            match Object::from_bytes(&obj_buf) {
                                                Err(e) => {
                                                    warn!("vfs cache object decode: {e}")
                                                }
                                                Ok(cached_object) => {
                                                    object = Some(cached_object);
                                                    serialized_object = Some(obj_buf);
                                                }
                                            }
                                        }
                                    }
                                }
                            }
                            file_entry = Some(cached);
                        }
                    }
                },
            }
        }

        // Chunk when there is no reusable object still present in the
        // repository.
        let needs_object = record.record_type == RecordType::File || record.is_xattr();
        if needs_object
            && (object.is_none() || !snapshot.blob_exists(BlobKind::Object, &object_mac))
        {
            let built = self.chunkify(record)?;
            let bytes = built.to_bytes()?;
            object_mac = repository.compute_mac(&bytes);
            self.vfs_cache.put_object(&object_mac, &bytes)?;
            object = Some(built);
            serialized_object = Some(bytes);
        }

        if let Some(bytes) = &serialized_object {
            if !snapshot.blob_exists(BlobKind::Object, &object_mac) {
                snapshot.put_blob(BlobKind::Object, object_mac, bytes)?;
            }
        }

        if record.is_xattr() {
            let size = object.as_ref().map(Object::size).unwrap_or(0);
            return self.record_xattr(record, object_mac, size);
        }

        let entry_mac;
        let entry = match file_entry {
            Some(cached) if snapshot.blob_exists(BlobKind::VfsEntry, &cached_entry_mac) => {
                entry_mac = cached_entry_mac;
                cached
            }
            _ => {
                let normalized = vfs::normalize(&record.pathname);
                let (parent, _) = vfs::split(&normalized);
                let mut entry = Entry::new(parent, record);
                if object.is_some() {
                    entry.object = Some(object_mac);
                }
                for classification in self.classifiers.classify_file(&record.pathname, &entry) {
                    entry.classifications.push(classification);
                }

                let serialized = entry.to_bytes()?;
                entry_mac = repository.compute_mac(&serialized);
                if !snapshot.blob_exists(BlobKind::VfsEntry, &entry_mac) {
                    snapshot.put_blob(BlobKind::VfsEntry, entry_mac, &serialized)?;
                }
                self.vfs_cache.put_filename(&record.pathname, &serialized)?;

                let mut summary = FileSummary {
                    record_type: Some(record.record_type),
                    size: record.file_info.size,
                    mode: record.file_info.mode,
                    mod_time: record.file_info.mod_time,
                    ..FileSummary::default()
                };
                if let Some(built) = &object {
                    summary.objects = 1;
                    summary.chunks = built.chunks.len() as u64;
                    summary.content_type = built.content_type.clone();
                    summary.entropy = built.entropy;
                }
                self.vfs_cache
                    .put_file_summary(&record.pathname, &summary.to_bytes()?)?;
                entry
            }
        };

        if let Some(built) = &object {
            let mime = built.content_type.split(';').next().unwrap_or("");
            let key = format!("/{}{}", mime, entry.path());
            let mut index = self.ctidx.lock().unwrap();
            ignore_exists(index.insert(key, entry_mac))?;
        }

        self.record_entry(&entry)?;
        self.snapshot.events().send(Event::FileOk {
            snapshot: self.snapshot.header.identifier,
            pathname: record.pathname.clone(),
            size: record.file_info.size,
        });
        Ok(())
    }
}

struct RunOutput {
    roots: VfsRoots,
    content_type_root: Mac,
    root_summary: Summary,
    files: u64,
    directories: u64,
    size: u64,
}

impl Snapshot {
    /// Run a full backup of `importer`'s tree into this snapshot and
    /// commit it.
    pub fn backup(&mut self, importer: &dyn Importer, options: BackupOptions) -> Result<BackupOutcome> {
        let begin = Instant::now();

        // Exclusive advisory lock for the whole run, commit included.
        let repository = Arc::clone(&self.repository);
        let _lock = HeldLock::acquire(repository.storage())?;

        {
            let source = self.header.primary_source_mut();
            source.importer.importer_type = importer.importer_type();
            source.importer.origin = importer.origin();
            source.importer.directory = importer.root();
        }
        self.header.tags.extend(options.tags.iter().cloned());
        self.header.name = if options.name.is_empty() {
            format!("{} @ {}", importer.root(), importer.origin())
        } else {
            options.name.clone()
        };
        if let Some(identity) = self.repository().identity() {
            self.header.identity = Some(HeaderIdentity {
                identifier: identity.identifier,
                public_key: identity.public_key().to_vec(),
            });
        }

        match run_backup(self, importer, &options) {
            Err(e) => {
                self.abort();
                Err(e)
            }
            Ok(output) => {
                {
                    let source = self.header.primary_source_mut();
                    source.vfs = output.roots;
                    source.indexes = vec![Index {
                        name: "content-type".to_string(),
                        index_type: "btree".to_string(),
                        value: output.content_type_root,
                    }];
                    source.summary = output.root_summary.clone();
                }
                self.header.duration = begin.elapsed().as_nanos() as u64;

                if let Err(e) = self.commit() {
                    self.abort();
                    return Err(e);
                }
                Ok(BackupOutcome {
                    files: output.files,
                    directories: output.directories,
                    size: output.size,
                    errors: output.root_summary.below.errors,
                })
            }
        }
    }
}

fn build_excludes(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            KarstError::InvalidArgument(format!("invalid exclude pattern '{pattern}': {e}"))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| KarstError::InvalidArgument(format!("exclude matcher: {e}")))
}

fn run_backup(
    snapshot: &Snapshot,
    importer: &dyn Importer,
    options: &BackupOptions,
) -> Result<RunOutput> {
    let repository = snapshot.repository();
    // Scan records use virtual `/`-rooted paths, so the reuse cache must be
    // scoped to the origin AND the scanned root.
    let vfs_cache = repository.cache().vfs(
        &importer.importer_type(),
        &format!("{}:{}", importer.origin(), importer.root()),
    )?;

    let scan_cache = Arc::clone(snapshot.scan_cache()?);
    let ctx = BackupContext {
        snapshot,
        importer,
        vfs_cache,
        classifiers: &options.classifiers,
        excludes: build_excludes(&options.excludes)?,
        repo_location: repository.location(),
        root: importer.root(),
        aborted: AtomicBool::new(false),
        aborted_reason: Mutex::new(None),
        cancel: options.cancel.clone(),
        erridx: Mutex::new(BTree::new(
            CacheNodeStore::new(Arc::clone(&scan_cache), "__error__"),
            |a: &String, b: &String| a.cmp(b),
            DEFAULT_ORDER,
        )?),
        xattridx: Mutex::new(BTree::new(
            CacheNodeStore::new(Arc::clone(&scan_cache), "__xattr__"),
            vfs::path_cmp,
            DEFAULT_ORDER,
        )?),
        ctidx: Mutex::new(BTree::new(
            CacheNodeStore::new(Arc::clone(&scan_cache), "__contenttype__"),
            |a: &String, b: &String| a.cmp(b),
            DEFAULT_ORDER,
        )?),
        files: AtomicU64::new(0),
        directories: AtomicU64::new(0),
        size: AtomicU64::new(0),
    };

    let scan_rx = importer.scan()?;
    let (files_tx, files_rx) = bounded::<ScanRecord>(FILES_CHANNEL_DEPTH);
    let workers = if options.max_concurrency == 0 {
        default_concurrency()
    } else {
        options.max_concurrency
    };

    snapshot.events().send(Event::ImporterStarted {
        snapshot: snapshot.header.identifier,
    });

    std::thread::scope(|scope| {
        let ctx_ref = &ctx;

        scope.spawn(move || {
            for result in scan_rx.iter() {
                if ctx_ref.aborted.load(Ordering::SeqCst) || ctx_ref.is_cancelled() {
                    break;
                }
                dispatch_scan_result(ctx_ref, &files_tx, result);
            }
            // files_tx drops here; workers drain and exit.
        });

        for _ in 0..workers {
            let worker_rx = files_rx.clone();
            scope.spawn(move || {
                for record in worker_rx.iter() {
                    if ctx_ref.aborted.load(Ordering::SeqCst) || ctx_ref.is_cancelled() {
                        continue;
                    }
                    ctx_ref.process_file(record);
                }
            });
        }
        drop(files_rx);
    });

    snapshot.events().send(Event::ImporterDone {
        snapshot: snapshot.header.identifier,
        files: ctx.files.load(Ordering::SeqCst),
        directories: ctx.directories.load(Ordering::SeqCst),
        size: ctx.size.load(Ordering::SeqCst),
    });

    if ctx.is_cancelled() {
        return Err(KarstError::Cancelled);
    }
    if ctx.aborted.load(Ordering::SeqCst) {
        let reason = ctx.aborted_reason.lock().unwrap().take();
        return Err(reason.unwrap_or_else(|| KarstError::Aborted("source scan failed".into())));
    }

    // Error index first: the roll-up reads it to count per-directory
    // errors.
    let errors_root = {
        let index = ctx.erridx.lock().unwrap();
        persist_index(snapshot, &index, BlobKind::ErrorBtree, BlobKind::ErrorNode, |item| {
            let serialized = item.to_bytes()?;
            let mac = snapshot.repository().compute_mac(&serialized);
            if !snapshot.blob_exists(BlobKind::ErrorEntry, &mac) {
                snapshot.put_blob(BlobKind::ErrorEntry, mac, &serialized)?;
            }
            Ok(mac)
        })?
    };

    let root_summary = roll_up(&ctx)?;

    let fileidx = build_file_index(&ctx)?;
    let vfs_root = persist_index(snapshot, &fileidx, BlobKind::VfsBtree, BlobKind::VfsNode, |entry| {
        let serialized = entry.to_bytes()?;
        let mac = snapshot.repository().compute_mac(&serialized);
        if !snapshot.blob_exists(BlobKind::VfsEntry, &mac) {
            snapshot.put_blob(BlobKind::VfsEntry, mac, &serialized)?;
        }
        Ok(mac)
    })?;

    let xattrs_root = {
        let index = ctx.xattridx.lock().unwrap();
        persist_index(snapshot, &index, BlobKind::XattrBtree, BlobKind::XattrNode, |xattr| {
            let serialized = xattr.to_bytes()?;
            let mac = snapshot.repository().compute_mac(&serialized);
            if !snapshot.blob_exists(BlobKind::XattrEntry, &mac) {
                snapshot.put_blob(BlobKind::XattrEntry, mac, &serialized)?;
            }
            Ok(mac)
        })?
    };

    let content_type_root = {
        let index = ctx.ctidx.lock().unwrap();
        persist_index(
            snapshot,
            &index,
            BlobKind::BtreeRoot,
            BlobKind::BtreeNode,
            |mac| Ok(*mac),
        )?
    };

    Ok(RunOutput {
        roots: VfsRoots {
            root: vfs_root,
            xattrs: xattrs_root,
            errors: errors_root,
        },
        content_type_root,
        root_summary,
        files: ctx.files.load(Ordering::SeqCst),
        directories: ctx.directories.load(Ordering::SeqCst),
        size: ctx.size.load(Ordering::SeqCst),
    })
}

fn dispatch_scan_result(
    ctx: &BackupContext<'_>,
    files_tx: &crossbeam_channel::Sender<ScanRecord>,
    result: ScanResult,
) {
    let snapshot_id = ctx.snapshot.header.identifier;
    let pathname = match &result {
        ScanResult::Record(record) => record.pathname.clone(),
        ScanResult::Error(error) => error.pathname.clone(),
    };
    if pathname != "/" && ctx.excludes.is_match(&pathname) {
        return;
    }

    match result {
        ScanResult::Error(error) => {
            // A failure on the scan root itself dooms the backup.
            if error.pathname == "/" || error.pathname == ctx.root {
                ctx.abort(KarstError::Aborted(format!(
                    "{}: {}",
                    error.pathname, error.message
                )));
            } else {
                ctx.record_error(&error.pathname, &error.message);
            }
        }
        ScanResult::Record(record) => {
            ctx.snapshot.events().send(Event::Path {
                snapshot: snapshot_id,
                pathname: record.pathname.clone(),
            });

            // Never back the repository's own storage into itself. Virtual
            // paths are mapped back under the scan root for the comparison.
            let real_pathname = if record.pathname == "/" {
                ctx.root.clone()
            } else {
                format!(
                    "{}{}",
                    ctx.root.trim_end_matches('/'),
                    record.pathname
                )
            };
            if real_pathname == ctx.repo_location
                || real_pathname.starts_with(&format!("{}/", ctx.repo_location))
            {
                warn!(pathname = %record.pathname, "skipping entry from repository storage");
                ctx.snapshot.events().send(Event::Warning {
                    snapshot: snapshot_id,
                    message: format!("skipping entry from repository: {}", record.pathname),
                });
                return;
            }

            if record.record_type == RecordType::Directory {
                ctx.directories.fetch_add(1, Ordering::SeqCst);
                let normalized = vfs::normalize(&record.pathname);
                let (parent, _) = vfs::split(&normalized);
                let entry = Entry::new(parent, &record);
                if let Err(e) = ctx.record_entry(&entry) {
                    ctx.record_error(&record.pathname, &e.to_string());
                }
            } else {
                if !record.is_xattr() {
                    ctx.files.fetch_add(1, Ordering::SeqCst);
                    if record.record_type == RecordType::File {
                        ctx.size.fetch_add(record.file_info.size, Ordering::SeqCst);
                    }
                }
                if files_tx.send(record).is_err() {
                    ctx.abort(KarstError::Other("scanner pool terminated".into()));
                }
            }
        }
    }
}

/// Bottom-up summary roll-up: directories in descending path order, so
/// every parent sees completed child summaries.
fn roll_up(ctx: &BackupContext<'_>) -> Result<Summary> {
    let snapshot = ctx.snapshot;
    let scan_cache = snapshot.scan_cache()?;
    let mut root_summary: Option<Summary> = None;

    let directories: Vec<(String, Vec<u8>)> = scan_cache.directories(true).collect();
    for (dir_path, bytes) in directories {
        if ctx.is_cancelled() {
            return Err(KarstError::Cancelled);
        }

        let mut dir_entry = Entry::from_bytes(&bytes)?;
        let prefix = if dir_path == "/" {
            "/".to_string()
        } else {
            format!("{dir_path}/")
        };

        // Direct child files.
        for (relpath, _) in scan_cache.files_under(&prefix) {
            if relpath.contains('/') {
                continue;
            }
            let child_path = format!("{prefix}{relpath}");
            let Some(raw_summary) = ctx.vfs_cache.get_file_summary(&child_path)? else {
                continue;
            };
            let Ok(file_summary) = FileSummary::from_bytes(&raw_summary) else {
                continue;
            };
            dir_entry.summary.directory.children += 1;
            dir_entry.summary.update_with_file_summary(&file_summary);
        }

        // Direct child directories, already rolled up.
        for (relpath, _) in scan_cache.directories_under(&prefix) {
            if relpath.is_empty() || relpath.contains('/') {
                continue;
            }
            let child_path = format!("{prefix}{relpath}");
            let Some(raw_summary) = scan_cache.get_summary(&child_path)? else {
                continue;
            };
            let Ok(child_summary) = Summary::from_bytes(&raw_summary) else {
                continue;
            };
            dir_entry.summary.directory.children += 1;
            dir_entry.summary.update_below(&child_summary);
        }

        // Direct errors below this directory.
        {
            let erridx = ctx.erridx.lock().unwrap();
            for item in erridx.scan_from(&prefix)? {
                let (name, _) = item?;
                if !name.starts_with(&prefix) {
                    break;
                }
                if name[prefix.len()..].contains('/') {
                    continue;
                }
                dir_entry.summary.below.errors += 1;
            }
        }

        dir_entry.summary.update_averages();
        for classification in ctx.classifiers.classify_directory(&dir_path, &dir_entry) {
            dir_entry.classifications.push(classification);
        }

        scan_cache.put_summary(&dir_path, &dir_entry.summary.to_bytes()?)?;
        ctx.record_entry(&dir_entry)?;

        snapshot.events().send(Event::DirectoryOk {
            snapshot: snapshot.header.identifier,
            pathname: dir_path.clone(),
        });
        if dir_path == "/" {
            root_summary = Some(dir_entry.summary.clone());
        }
    }

    root_summary.ok_or_else(|| KarstError::Other("scan produced no root directory".into()))
}

/// Assemble the file index from the scan cache, in path-comparator order.
fn build_file_index(ctx: &BackupContext<'_>) -> Result<StringBTree<Entry>> {
    let snapshot = ctx.snapshot;
    let scan_cache = snapshot.scan_cache()?;
    let mut fileidx = BTree::<String, Entry, _>::new(
        CacheNodeStore::new(Arc::clone(scan_cache), "__fileidx__"),
        vfs::path_cmp,
        DEFAULT_ORDER,
    )?;

    for (pathname, bytes) in scan_cache.enumerate_prefix("__file__:", false) {
        let entry = Entry::from_bytes(&bytes)?;
        ignore_exists(fileidx.insert(pathname, entry))?;
    }
    for (pathname, bytes) in scan_cache.enumerate_prefix("__directory__:", false) {
        let entry = Entry::from_bytes(&bytes)?;
        ignore_exists(fileidx.insert(pathname, entry))?;
    }
    Ok(fileidx)
}

/// Flush an index: nodes become `node_kind` blobs, the root record becomes
/// a `root_kind` blob whose MAC is returned.
fn persist_index<V: Clone + serde::Serialize + serde::de::DeserializeOwned>(
    snapshot: &Snapshot,
    tree: &StringBTree<V>,
    root_kind: BlobKind,
    node_kind: BlobKind,
    mut materialize: impl FnMut(&V) -> Result<Mac>,
) -> Result<Mac> {
    let stored_root = tree.persist(&mut materialize, &mut |bytes| {
        let mac = snapshot.repository().compute_mac(bytes);
        if !snapshot.blob_exists(node_kind, &mac) {
            snapshot.put_blob(node_kind, mac, bytes)?;
        }
        Ok(mac)
    })?;

    let serialized = stored_root.to_bytes()?;
    let mac = snapshot.repository().compute_mac(&serialized);
    if !snapshot.blob_exists(root_kind, &mac) {
        snapshot.put_blob(root_kind, mac, &serialized)?;
    }
    Ok(mac)
}
