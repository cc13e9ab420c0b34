use std::path::{Path, PathBuf};
use std::sync::Arc;

use karst_types::kind::BlobKind;
use karst_types::mac::Mac;

use crate::caching::CacheManager;
use crate::events::{Event, EventBus};
use crate::importer::fs::FsImporter;
use crate::repository::{Identity, Repository};
use crate::snapshot::{BackupOptions, CheckOptions, Snapshot};
use crate::storage::local::LocalStorage;
use crate::testutil::{local_repository, pattern_bytes, write_tree};

fn backup_dir(repository: &Arc<Repository>, source: &Path) -> Mac {
    let importer = FsImporter::new(&source.to_string_lossy()).unwrap();
    let mut snapshot = Snapshot::create(Arc::clone(repository), EventBus::disabled()).unwrap();
    snapshot
        .backup(&importer, BackupOptions::default())
        .unwrap();
    snapshot.header.identifier
}

fn packfile_path(base: &Path, mac: &Mac) -> PathBuf {
    base.join("repo")
        .join("packfiles")
        .join(mac.shard_prefix())
        .join(mac.to_hex())
}

fn check_with_failures(
    snapshot: &mut Snapshot,
    options: &CheckOptions,
) -> (bool, Vec<String>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    snapshot.set_events(EventBus::new(tx));
    let valid = snapshot.check(None, options).unwrap();
    snapshot.set_events(EventBus::disabled());

    let mut failures = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Event::CheckBlobFailed { message, .. } = event {
            failures.push(message);
        }
    }
    (valid, failures)
}

#[test]
fn intact_snapshot_checks_clean() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    write_tree(
        &source,
        &[
            ("a.txt", b"alpha".as_slice()),
            ("big.bin", &pattern_bytes(50_000, 5)),
            ("sub/empty", b""),
        ],
    );

    let repository = local_repository(dir.path());
    let snapshot_id = backup_dir(&repository, &source);
    let mut snapshot = Snapshot::load(Arc::clone(&repository), &snapshot_id).unwrap();

    let (valid, failures) = check_with_failures(&mut snapshot, &CheckOptions::default());
    assert!(valid, "unexpected failures: {failures:?}");

    let (valid, _) = check_with_failures(
        &mut snapshot,
        &CheckOptions {
            fast: true,
            no_verify: false,
        },
    );
    assert!(valid);
}

#[test]
fn truncated_packfile_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    write_tree(&source, &[("a.txt", b"alpha")]);

    let repository = local_repository(dir.path());
    let snapshot_id = backup_dir(&repository, &source);

    let packfiles = repository.storage().packfiles().unwrap();
    assert_eq!(packfiles.len(), 1);
    let path = packfile_path(dir.path(), &packfiles[0]);
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();

    let mut snapshot = Snapshot::load(Arc::clone(&repository), &snapshot_id).unwrap();
    let (valid, failures) = check_with_failures(&mut snapshot, &CheckOptions::default());
    assert!(!valid);
    assert!(
        failures.iter().any(|m| m.contains("failed to parse")),
        "failures: {failures:?}"
    );
}

#[test]
fn flipped_chunk_byte_is_detected_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    write_tree(
        &source,
        &[
            ("victim.bin", pattern_bytes(600, 9).as_slice()),
            ("witness.txt", b"untouched"),
        ],
    );

    let repository = local_repository(dir.path());
    let snapshot_id = backup_dir(&repository, &source);
    let snapshot = Snapshot::load(Arc::clone(&repository), &snapshot_id).unwrap();

    let object = snapshot.find_object("/victim.bin").unwrap();
    let chunk_mac = object.chunks[0].content_mac;
    let location = repository
        .get_blob_location(BlobKind::Chunk, &chunk_mac)
        .unwrap();

    // Flip a payload byte past the compression tag.
    let path = packfile_path(dir.path(), &location.packfile);
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[location.offset as usize + 1] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let mut snapshot = Snapshot::load(Arc::clone(&repository), &snapshot_id).unwrap();
    let (valid, failures) = check_with_failures(&mut snapshot, &CheckOptions::default());
    assert!(!valid);
    let mismatches: Vec<&String> = failures
        .iter()
        .filter(|m| m.contains(&chunk_mac.to_hex()))
        .collect();
    assert_eq!(mismatches.len(), 1, "failures: {failures:?}");

    // Everything else is still intact.
    assert_eq!(snapshot.read_file("/witness.txt").unwrap(), b"untouched");

    // Fast mode stops at the index and misses the payload corruption.
    let (fast_valid, _) = check_with_failures(
        &mut snapshot,
        &CheckOptions {
            fast: true,
            no_verify: false,
        },
    );
    assert!(fast_valid);
}

#[test]
fn signed_snapshot_verifies() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    write_tree(&source, &[("a.txt", b"alpha")]);

    let repo_dir = dir.path().join("repo");
    let cache = CacheManager::new(dir.path().join("cache")).unwrap();
    Repository::create(
        Box::new(LocalStorage::new(&repo_dir.to_string_lossy())),
        cache.clone(),
        crate::testutil::test_create_options(),
    )
    .unwrap();

    let repository = Arc::new(
        Repository::open(
            Box::new(LocalStorage::new(&repo_dir.to_string_lossy())),
            cache,
            None,
            Some(Identity::generate()),
        )
        .unwrap(),
    );

    let snapshot_id = backup_dir(&repository, &source);
    let snapshot = Snapshot::load(Arc::clone(&repository), &snapshot_id).unwrap();
    assert!(snapshot.header.identity.is_some());
    assert!(snapshot.verify().unwrap());
    assert!(snapshot.check(None, &CheckOptions::default()).unwrap());
}

#[test]
fn aggregate_state_rebuilds_from_storage() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    write_tree(&source, &[("persist.txt", b"durable bytes")]);

    let repository = local_repository(dir.path());
    let snapshot_id = backup_dir(&repository, &source);
    drop(repository);

    // Fresh cache directory: the aggregate must be rebuilt from the
    // persisted per-snapshot states alone.
    let cache = CacheManager::new(dir.path().join("fresh-cache")).unwrap();
    let repository = Arc::new(
        Repository::open(
            Box::new(LocalStorage::new(
                &dir.path().join("repo").to_string_lossy(),
            )),
            cache,
            None,
            None,
        )
        .unwrap(),
    );

    assert_eq!(repository.list_snapshots().unwrap(), vec![snapshot_id]);
    let snapshot = Snapshot::load(Arc::clone(&repository), &snapshot_id).unwrap();
    assert_eq!(
        snapshot.read_file("/persist.txt").unwrap(),
        b"durable bytes"
    );
    assert!(snapshot.check(None, &CheckOptions::default()).unwrap());
}

#[test]
fn check_with_prefix_restricts_scope() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    write_tree(
        &source,
        &[("safe/ok.txt", b"fine".as_slice()), ("hurt/bad.bin", &pattern_bytes(600, 2))],
    );

    let repository = local_repository(dir.path());
    let snapshot_id = backup_dir(&repository, &source);
    let snapshot = Snapshot::load(Arc::clone(&repository), &snapshot_id).unwrap();

    let object = snapshot.find_object("/hurt/bad.bin").unwrap();
    let location = repository
        .get_blob_location(BlobKind::Chunk, &object.chunks[0].content_mac)
        .unwrap();
    let path = packfile_path(dir.path(), &location.packfile);
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[location.offset as usize + 1] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let snapshot = Snapshot::load(Arc::clone(&repository), &snapshot_id).unwrap();
    assert!(snapshot
        .check(Some("/safe"), &CheckOptions::default())
        .unwrap());
    assert!(!snapshot
        .check(Some("/hurt"), &CheckOptions::default())
        .unwrap());
}
