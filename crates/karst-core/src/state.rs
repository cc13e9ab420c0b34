use std::io::{Read, Write};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use karst_types::error::{KarstError, Result};
use karst_types::kind::BlobKind;
use karst_types::location::{DeltaEntry, Location, DELTA_ENTRY_SERIALIZED_SIZE};
use karst_types::mac::Mac;

pub const STATE_VERSION: u32 = 1;

/// Entry-type tags of the state stream format.
const ET_METADATA: u8 = 1;
const ET_LOCATIONS: u8 = 2;

/// Byte length of the metadata block at the end of a serialized state:
/// tag, version, timestamp, aggregate flag, serial.
pub const METADATA_STREAM_SIZE: usize = 1 + 4 + 8 + 1 + 16;

/// State metadata. The serial identifies a logical backup lineage: every
/// delta state derived from the same chain shares it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub aggregate: bool,
    pub serial: Uuid,
}

impl Metadata {
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION,
            timestamp: Utc::now(),
            aggregate: false,
            serial: Uuid::nil(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }

    fn timestamp_nanos(&self) -> i64 {
        self.timestamp.timestamp_nanos_opt().unwrap_or_default()
    }

    /// Parse the fixed-width metadata block that terminates a serialized
    /// state stream (without the leading tag byte).
    fn from_stream_block(buf: &[u8]) -> Result<Self> {
        if buf.len() < METADATA_STREAM_SIZE - 1 {
            return Err(KarstError::Malformed(
                "short read while decoding state metadata".into(),
            ));
        }
        let version = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let nanos = u64::from_le_bytes(buf[4..12].try_into().unwrap()) as i64;
        let aggregate = buf[12] == 1;
        let mut serial = [0u8; 16];
        serial.copy_from_slice(&buf[13..29]);
        Ok(Self {
            version,
            timestamp: Utc.timestamp_nanos(nanos),
            aggregate,
            serial: Uuid::from_bytes(serial),
        })
    }

    /// Parse the metadata block from the tail of a fully serialized state.
    /// Used to order states by timestamp without replaying their deltas.
    pub fn from_stream_tail(stream: &[u8]) -> Result<Self> {
        if stream.len() < METADATA_STREAM_SIZE {
            return Err(KarstError::Malformed(
                "state stream too small for metadata".into(),
            ));
        }
        let tail = &stream[stream.len() - METADATA_STREAM_SIZE..];
        if tail[0] != ET_METADATA {
            return Err(KarstError::Malformed(
                "state stream does not end with a metadata block".into(),
            ));
        }
        Self::from_stream_block(&tail[1..])
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Key-value backing for a state: delta entries in a prefix-separated
/// namespace plus published per-snapshot state metadata.
pub trait StateCache: Send + Sync {
    fn put_delta(&self, kind: BlobKind, blob: &Mac, data: &[u8]) -> Result<()>;
    fn get_delta(&self, kind: BlobKind, blob: &Mac) -> Result<Option<Vec<u8>>>;
    fn has_delta(&self, kind: BlobKind, blob: &Mac) -> Result<bool>;
    /// All delta entries, grouped by kind, in key order.
    fn deltas(&self) -> Result<Vec<Vec<u8>>>;
    fn deltas_by_kind(&self, kind: BlobKind) -> Result<Vec<(Mac, Vec<u8>)>>;

    fn put_state(&self, id: &Mac, metadata: &[u8]) -> Result<()>;
    fn has_state(&self, id: &Mac) -> Result<bool>;
    fn get_states(&self) -> Result<Vec<(Mac, Vec<u8>)>>;
    fn del_state(&self, id: &Mac) -> Result<()>;
}

impl<T: StateCache + ?Sized> StateCache for Arc<T> {
    fn put_delta(&self, kind: BlobKind, blob: &Mac, data: &[u8]) -> Result<()> {
        (**self).put_delta(kind, blob, data)
    }
    fn get_delta(&self, kind: BlobKind, blob: &Mac) -> Result<Option<Vec<u8>>> {
        (**self).get_delta(kind, blob)
    }
    fn has_delta(&self, kind: BlobKind, blob: &Mac) -> Result<bool> {
        (**self).has_delta(kind, blob)
    }
    fn deltas(&self) -> Result<Vec<Vec<u8>>> {
        (**self).deltas()
    }
    fn deltas_by_kind(&self, kind: BlobKind) -> Result<Vec<(Mac, Vec<u8>)>> {
        (**self).deltas_by_kind(kind)
    }
    fn put_state(&self, id: &Mac, metadata: &[u8]) -> Result<()> {
        (**self).put_state(id, metadata)
    }
    fn has_state(&self, id: &Mac) -> Result<bool> {
        (**self).has_state(id)
    }
    fn get_states(&self) -> Result<Vec<(Mac, Vec<u8>)>> {
        (**self).get_states()
    }
    fn del_state(&self, id: &Mac) -> Result<()> {
        (**self).del_state(id)
    }
}

/// A local state, possibly aggregated, backed by on-disk storage.
pub struct LocalState<C: StateCache> {
    pub metadata: Metadata,
    cache: C,
}

impl<C: StateCache> LocalState<C> {
    pub fn new(cache: C) -> Self {
        Self {
            metadata: Metadata::new(),
            cache,
        }
    }

    /// A new state carrying over the serial of an existing lineage.
    pub fn derive(&self, cache: C) -> LocalState<C> {
        let mut state = LocalState::new(cache);
        state.metadata.serial = self.metadata.serial;
        state
    }

    /// Adopt the serial of the most recent published state, or `fallback`
    /// when none exists yet.
    pub fn update_serial_or(&mut self, fallback: Uuid) -> Result<()> {
        let mut latest: Option<Metadata> = None;
        for (_, raw) in self.cache.get_states()? {
            let metadata = Metadata::from_bytes(&raw)?;
            if latest
                .as_ref()
                .map_or(true, |current| current.timestamp < metadata.timestamp)
            {
                latest = Some(metadata);
            }
        }
        self.metadata.serial = match latest {
            Some(metadata) => metadata.serial,
            None => fallback,
        };
        Ok(())
    }

    pub fn put_delta(&self, entry: &DeltaEntry) -> Result<()> {
        self.cache
            .put_delta(entry.kind, &entry.blob, &entry.to_bytes())
    }

    pub fn blob_exists(&self, kind: BlobKind, blob: &Mac) -> bool {
        self.cache.has_delta(kind, blob).unwrap_or(false)
    }

    pub fn get_location(&self, kind: BlobKind, blob: &Mac) -> Result<Option<Location>> {
        match self.cache.get_delta(kind, blob)? {
            None => Ok(None),
            Some(raw) => Ok(Some(DeltaEntry::from_bytes(&raw)?.location)),
        }
    }

    pub fn has_state(&self, id: &Mac) -> Result<bool> {
        self.cache.has_state(id)
    }

    pub fn del_state(&self, id: &Mac) -> Result<()> {
        self.cache.del_state(id)
    }

    pub fn list_snapshots(&self) -> Result<Vec<Mac>> {
        Ok(self
            .cache
            .deltas_by_kind(BlobKind::Snapshot)?
            .into_iter()
            .map(|(mac, _)| mac)
            .collect())
    }

    pub fn list_by_kind(&self, kind: BlobKind) -> Result<Vec<DeltaEntry>> {
        self.cache
            .deltas_by_kind(kind)?
            .into_iter()
            .map(|(_, raw)| DeltaEntry::from_bytes(&raw))
            .collect()
    }

    /// Stable on-disk stream: every delta entry tagged LOCATIONS, then one
    /// trailing METADATA block.
    pub fn serialize_to(&self, w: &mut dyn Write) -> Result<()> {
        for raw in self.cache.deltas()? {
            w.write_all(&[ET_LOCATIONS])?;
            w.write_all(&raw)?;
        }

        w.write_all(&[ET_METADATA])?;
        w.write_all(&self.metadata.version.to_le_bytes())?;
        w.write_all(&(self.metadata.timestamp_nanos() as u64).to_le_bytes())?;
        w.write_all(&[u8::from(self.metadata.aggregate)])?;
        w.write_all(self.metadata.serial.as_bytes())?;
        Ok(())
    }

    /// Read a serialized state stream into this state's cache, then publish
    /// the source state's metadata under `state_id`. Entries already present
    /// are left untouched, so merging newest-first resolves every blob to
    /// its most recent location.
    pub fn merge_stream(&self, state_id: Mac, r: &mut dyn Read) -> Result<Metadata> {
        if self.cache.has_state(&state_id)? {
            let existing = self
                .cache
                .get_states()?
                .into_iter()
                .find(|(id, _)| *id == state_id);
            if let Some((_, raw)) = existing {
                return Metadata::from_bytes(&raw);
            }
        }

        let metadata = self.replay_stream(r)?;
        self.cache.put_state(&state_id, &metadata.to_bytes()?)?;
        Ok(metadata)
    }

    fn replay_stream(&self, r: &mut dyn Read) -> Result<Metadata> {
        let mut tag = [0u8; 1];
        let mut entry_buf = [0u8; DELTA_ENTRY_SERIALIZED_SIZE];
        loop {
            r.read_exact(&mut tag)
                .map_err(|e| KarstError::Malformed(format!("state stream entry tag: {e}")))?;
            match tag[0] {
                ET_METADATA => break,
                ET_LOCATIONS => {
                    r.read_exact(&mut entry_buf).map_err(|e| {
                        KarstError::Malformed(format!("state stream delta entry: {e}"))
                    })?;
                    let entry = DeltaEntry::from_bytes(&entry_buf)?;
                    if !self.cache.has_delta(entry.kind, &entry.blob)? {
                        self.cache.put_delta(entry.kind, &entry.blob, &entry_buf)?;
                    }
                }
                other => return Err(KarstError::UnknownStateEntryTag(other)),
            }
        }

        let mut metadata_buf = [0u8; METADATA_STREAM_SIZE - 1];
        r.read_exact(&mut metadata_buf)
            .map_err(|e| KarstError::Malformed(format!("state stream metadata: {e}")))?;
        Metadata::from_stream_block(&metadata_buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryStateCache;
    use karst_types::location::Location;

    fn entry(kind: BlobKind, blob: u8, pack: u8) -> DeltaEntry {
        DeltaEntry {
            kind,
            blob: Mac([blob; 32]),
            location: Location {
                packfile: Mac([pack; 32]),
                offset: 16,
                length: 32,
            },
        }
    }

    fn new_state() -> LocalState<MemoryStateCache> {
        LocalState::new(MemoryStateCache::default())
    }

    #[test]
    fn put_and_lookup_delta() {
        let state = new_state();
        let e = entry(BlobKind::Chunk, 1, 9);
        state.put_delta(&e).unwrap();
        assert!(state.blob_exists(BlobKind::Chunk, &e.blob));
        assert!(!state.blob_exists(BlobKind::Object, &e.blob));
        assert_eq!(
            state.get_location(BlobKind::Chunk, &e.blob).unwrap(),
            Some(e.location)
        );
    }

    #[test]
    fn missing_blob_is_none_not_error() {
        let state = new_state();
        assert_eq!(
            state.get_location(BlobKind::Chunk, &Mac([7; 32])).unwrap(),
            None
        );
    }

    #[test]
    fn put_delta_is_idempotent() {
        let state = new_state();
        let e = entry(BlobKind::Chunk, 1, 9);
        state.put_delta(&e).unwrap();
        state.put_delta(&e).unwrap();
        assert_eq!(
            state.get_location(BlobKind::Chunk, &e.blob).unwrap(),
            Some(e.location)
        );
    }

    #[test]
    fn stream_roundtrip() {
        let mut source = new_state();
        source.metadata.serial = Uuid::new_v4();
        source.put_delta(&entry(BlobKind::Chunk, 1, 9)).unwrap();
        source.put_delta(&entry(BlobKind::Object, 2, 9)).unwrap();
        source.put_delta(&entry(BlobKind::Snapshot, 3, 9)).unwrap();

        let mut stream = Vec::new();
        source.serialize_to(&mut stream).unwrap();

        let target = new_state();
        let metadata = target
            .merge_stream(Mac([0xAB; 32]), &mut stream.as_slice())
            .unwrap();
        assert_eq!(metadata.serial, source.metadata.serial);
        assert_eq!(metadata.version, STATE_VERSION);
        assert!(target.blob_exists(BlobKind::Chunk, &Mac([1; 32])));
        assert!(target.blob_exists(BlobKind::Object, &Mac([2; 32])));
        assert_eq!(target.list_snapshots().unwrap(), vec![Mac([3; 32])]);
        assert!(target.has_state(&Mac([0xAB; 32])).unwrap());
    }

    #[test]
    fn metadata_tail_matches_stream() {
        let mut source = new_state();
        source.metadata.serial = Uuid::new_v4();
        source.put_delta(&entry(BlobKind::Chunk, 1, 9)).unwrap();

        let mut stream = Vec::new();
        source.serialize_to(&mut stream).unwrap();

        let tail = Metadata::from_stream_tail(&stream).unwrap();
        assert_eq!(tail.serial, source.metadata.serial);
        assert!(!tail.aggregate);
    }

    #[test]
    fn unknown_tag_rejected() {
        let target = new_state();
        let stream = vec![0xEEu8; 80];
        let err = target
            .merge_stream(Mac([1; 32]), &mut stream.as_slice())
            .unwrap_err();
        assert!(matches!(err, KarstError::UnknownStateEntryTag(0xEE)));
    }

    #[test]
    fn truncated_stream_is_malformed() {
        let mut source = new_state();
        source.put_delta(&entry(BlobKind::Chunk, 1, 9)).unwrap();
        let mut stream = Vec::new();
        source.serialize_to(&mut stream).unwrap();
        stream.truncate(stream.len() - 4);

        let target = new_state();
        let err = target
            .merge_stream(Mac([1; 32]), &mut stream.as_slice())
            .unwrap_err();
        assert!(matches!(err, KarstError::Malformed(_)));
    }

    #[test]
    fn newest_first_merge_keeps_first_match() {
        let aggregate = new_state();

        // Newer state maps the blob to packfile 0xBB.
        let mut newer = new_state();
        newer.metadata.timestamp = Utc::now();
        newer.put_delta(&entry(BlobKind::Chunk, 1, 0xBB)).unwrap();
        let mut newer_stream = Vec::new();
        newer.serialize_to(&mut newer_stream).unwrap();

        // Older state maps the same blob to packfile 0xCC.
        let older = new_state();
        older.put_delta(&entry(BlobKind::Chunk, 1, 0xCC)).unwrap();
        let mut older_stream = Vec::new();
        older.serialize_to(&mut older_stream).unwrap();

        aggregate
            .merge_stream(Mac([0x01; 32]), &mut newer_stream.as_slice())
            .unwrap();
        aggregate
            .merge_stream(Mac([0x02; 32]), &mut older_stream.as_slice())
            .unwrap();

        let location = aggregate
            .get_location(BlobKind::Chunk, &Mac([1; 32]))
            .unwrap()
            .unwrap();
        assert_eq!(location.packfile, Mac([0xBB; 32]));
    }

    #[test]
    fn serial_inherited_from_latest_state() {
        let aggregate = new_state();
        let old_serial = Uuid::new_v4();
        let new_serial = Uuid::new_v4();

        let old = Metadata {
            version: STATE_VERSION,
            timestamp: Utc.timestamp_nanos(1_000),
            aggregate: false,
            serial: old_serial,
        };
        let newer = Metadata {
            version: STATE_VERSION,
            timestamp: Utc.timestamp_nanos(2_000),
            aggregate: false,
            serial: new_serial,
        };
        let cache = MemoryStateCache::default();
        cache
            .put_state(&Mac([1; 32]), &old.to_bytes().unwrap())
            .unwrap();
        cache
            .put_state(&Mac([2; 32]), &newer.to_bytes().unwrap())
            .unwrap();

        let mut state = LocalState::new(cache);
        state.update_serial_or(Uuid::new_v4()).unwrap();
        assert_eq!(state.metadata.serial, new_serial);

        let mut fresh = aggregate.derive(MemoryStateCache::default());
        let fallback = Uuid::new_v4();
        fresh.update_serial_or(fallback).unwrap();
        assert_eq!(fresh.metadata.serial, fallback);
    }
}
