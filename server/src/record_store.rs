//! Record Store: hierarchical file-backed store of
//! records, each a `metadata.json` blob plus a fixed-size-page `data.bin`
//! file. A single internal lock guards the open-handles table and metadata
//! edits; per-file I/O is serialized within one writer/reader handle, the
//! same separation the teacher's `recording::manager::RecordingManager`
//! draws between directory bookkeeping and the individual `.mrr` file
//! readers/writers in `recording/recorder.rs` and `recording/player.rs`.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use sdr_core::{Page, Record, RecordId, SdrError, Tag, TagId, TagKind, PAGE_PAYLOAD_SIZE, PAGE_SIZE};

use crate::error::ServerError;

const METADATA_FILE: &str = "metadata.json";
const DATA_FILE: &str = "data.bin";
const SCHEMA_VERSION: u32 = 1;

/// On-disk JSON shape for `metadata.json`. `SchemaVersion` is an explicit
/// forward-compatibility field; its absence on load is treated as version 1.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MetadataFile {
    #[serde(default = "default_schema_version")]
    schema_version: u32,
    name: String,
    mode: sdr_core::WorkModeKind,
    frequency: u64,
    duration_sec: f64,
    created_at_us: u64,
    page_count: u32,
    tags: Vec<TagFile>,
}

fn default_schema_version() -> u32 {
    1
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TagFile {
    id: String,
    #[serde(rename = "Type")]
    kind: TagKind,
    name: String,
    value: Vec<u8>,
}

impl MetadataFile {
    fn from_record(record: &Record) -> Self {
        MetadataFile {
            schema_version: SCHEMA_VERSION,
            name: record.name.clone(),
            mode: record.mode,
            frequency: record.frequency_hz,
            duration_sec: record.duration_sec,
            created_at_us: record.created_at_us,
            page_count: record.page_count,
            tags: record
                .tags
                .iter()
                .map(|t| TagFile {
                    id: format!("{:032x}", t.id.0),
                    kind: t.kind,
                    name: t.name.clone(),
                    value: t.value_bytes().to_vec(),
                })
                .collect(),
        }
    }

    fn into_record(self, id: RecordId) -> Result<Record, ServerError> {
        let mut record = Record::new(id, self.name, self.mode, self.frequency, self.created_at_us);
        record.duration_sec = self.duration_sec;
        record.page_count = self.page_count;
        for tag_file in self.tags {
            let tag_id = TagId(
                u128::from_str_radix(&tag_file.id, 16)
                    .map_err(|e| ServerError::Sdr(SdrError::Failed(format!("bad tag id: {e}"))))?,
            );
            let mut restored = Tag::new(&tag_file.name, tag_file.kind, &tag_file.value, id)
                .map_err(ServerError::Sdr)?;
            restored.id = tag_id;
            record.tags.push(restored);
        }
        Ok(record)
    }
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// A cached, shared file handle for reads. Multiple `Reader` handles for the
/// same id within the cache window share this `Arc<Mutex<File>>`, serializing
/// their I/O.
struct CachedReader {
    file: Arc<Mutex<File>>,
    last_used: Instant,
}

struct StoreState {
    /// Record id currently held open for writing, if any. `CreateFile` fails
    /// if any writer is currently open, with no per-id qualifier, so this is
    /// a single global slot: at most one current-record writer exists across
    /// the whole payload at a time, matching the Mode Switcher's exclusive
    /// ownership of the current record writer.
    open_writer: Option<RecordId>,
    reader_cache: HashMap<RecordId, CachedReader>,
    metadata: HashMap<RecordId, Record>,
    creation_order: Vec<RecordId>,
}

/// File-backed record store.
pub struct RecordStore {
    base_dir: PathBuf,
    file_cache_time_ms: u64,
    state: Mutex<StoreState>,
}

impl RecordStore {
    /// Opens (and, if needed, creates) the store root, loading any existing
    /// records' metadata so `Count`/`Size` and `GetFiles` reflect a prior run.
    pub fn open(base_dir: impl Into<PathBuf>, file_cache_time_ms: u64) -> Result<Arc<Self>, ServerError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;

        let mut metadata = HashMap::new();
        let mut creation_order = Vec::new();
        let mut entries: Vec<(RecordId, u64)> = Vec::new();
        if let Ok(dir) = fs::read_dir(&base_dir) {
            for entry in dir.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
                let Ok(id) = name.parse::<RecordId>() else {
                    log::warn!("skipping non-record-id directory {name} under record store root");
                    continue;
                };
                let meta_path = path.join(METADATA_FILE);
                if !meta_path.exists() {
                    continue;
                }
                let text = fs::read_to_string(&meta_path)?;
                let parsed: MetadataFile = serde_json::from_str(&text)?;
                let created_at_us = parsed.created_at_us;
                let record = parsed.into_record(id)?;
                entries.push((id, created_at_us));
                metadata.insert(id, record);
            }
        }
        entries.sort_by_key(|(_, created)| *created);
        creation_order.extend(entries.into_iter().map(|(id, _)| id));

        log::info!(
            "record store opened at {} with {} existing record(s)",
            base_dir.display(),
            creation_order.len()
        );

        Ok(Arc::new(RecordStore {
            base_dir,
            file_cache_time_ms,
            state: Mutex::new(StoreState {
                open_writer: None,
                reader_cache: HashMap::new(),
                metadata,
                creation_order,
            }),
        }))
    }

    fn record_dir(&self, id: RecordId) -> PathBuf {
        self.base_dir.join(id.to_string())
    }

    /// Number of records currently in the store.
    pub fn count(self: &Arc<Self>) -> usize {
        self.state.lock().unwrap().metadata.len()
    }

    /// Total on-disk byte size of all records (metadata + data files).
    pub fn size(self: &Arc<Self>) -> u64 {
        let state = self.state.lock().unwrap();
        state
            .metadata
            .values()
            .map(|r| r.page_count as u64 * PAGE_SIZE as u64)
            .sum()
    }

    /// Evicts cached reader handles idle past `file_cache_time_ms`.
    fn evict_stale_readers(state: &mut StoreState, window: Duration) {
        let now = Instant::now();
        state
            .reader_cache
            .retain(|_, cached| now.duration_since(cached.last_used) <= window);
    }

    /// `CreateFile(id, name) -> Writer`.
    pub fn create_file(
        self: &Arc<Self>,
        id: RecordId,
        name: impl Into<String>,
        mode: sdr_core::WorkModeKind,
        frequency_hz: u64,
    ) -> Result<RecordWriter, ServerError> {
        let mut state = self.state.lock().unwrap();
        if state.metadata.contains_key(&id) {
            return Err(ServerError::Sdr(SdrError::Failed(format!("record {id} already exists"))));
        }
        if state.open_writer.is_some() {
            return Err(ServerError::Sdr(SdrError::Busy));
        }

        let dir = self.record_dir(id);
        fs::create_dir_all(&dir)?;
        let record = Record::new(id, name.into(), mode, frequency_hz, now_us());
        let meta_path = dir.join(METADATA_FILE);
        fs::write(&meta_path, serde_json::to_vec_pretty(&MetadataFile::from_record(&record))?)?;

        let data_path = dir.join(DATA_FILE);
        let file = OpenOptions::new().create(true).read(true).write(true).open(&data_path)?;

        state.metadata.insert(id, record);
        state.creation_order.push(id);
        state.open_writer = Some(id);
        log::info!("created record {id} ({:?})", self.record_dir(id));

        Ok(RecordWriter {
            store: self.clone(),
            id,
            file: Mutex::new(file),
        })
    }

    /// `OpenFile(id) -> Reader`. Fails if no such record, or if a
    /// writer currently holds it open.
    pub fn open_file(self: &Arc<Self>, id: RecordId) -> Result<RecordReader, ServerError> {
        let mut state = self.state.lock().unwrap();
        if !state.metadata.contains_key(&id) {
            return Err(ServerError::Sdr(SdrError::NotFound(format!("record {id}"))));
        }
        if state.open_writer == Some(id) {
            return Err(ServerError::Sdr(SdrError::Denied(format!("writer open for record {id}"))));
        }

        Self::evict_stale_readers(&mut state, Duration::from_millis(self.file_cache_time_ms));

        let file = if let Some(cached) = state.reader_cache.get_mut(&id) {
            cached.last_used = Instant::now();
            cached.file.clone()
        } else {
            let data_path = self.record_dir(id).join(DATA_FILE);
            let file = Arc::new(Mutex::new(OpenOptions::new().read(true).open(&data_path)?));
            state.reader_cache.insert(
                id,
                CachedReader {
                    file: file.clone(),
                    last_used: Instant::now(),
                },
            );
            file
        };

        Ok(RecordReader {
            store: self.clone(),
            id,
            file,
        })
    }

    /// `DeleteFile(id)`: fails iff a writer for `id` exists.
    pub fn delete_file(self: &Arc<Self>, id: RecordId) -> Result<(), ServerError> {
        let mut state = self.state.lock().unwrap();
        if !state.metadata.contains_key(&id) {
            return Err(ServerError::Sdr(SdrError::NotFound(format!("record {id}"))));
        }
        if state.open_writer == Some(id) {
            return Err(ServerError::Sdr(SdrError::Busy));
        }
        state.metadata.remove(&id);
        state.creation_order.retain(|existing| *existing != id);
        state.reader_cache.remove(&id);
        drop(state);

        fs::remove_dir_all(self.record_dir(id))?;
        log::info!("deleted record {id}");
        Ok(())
    }

    /// `GetFiles()`: lazy enumeration of all record ids in creation order.
    pub fn list_ids(self: &Arc<Self>) -> Vec<RecordId> {
        self.state.lock().unwrap().creation_order.clone()
    }

    /// `TryGetEntry(id) -> (name, size, created, ...)`.
    pub fn try_get_entry(self: &Arc<Self>, id: RecordId) -> Option<Record> {
        self.state.lock().unwrap().metadata.get(&id).cloned()
    }

    /// True while a writer is open anywhere in the store (used by request
    /// handlers to answer `RecordBusy` for an in-flight delete).
    pub fn has_open_writer(self: &Arc<Self>, id: RecordId) -> bool {
        self.state.lock().unwrap().open_writer == Some(id)
    }
}

/// The unique mutator for one record.
pub struct RecordWriter {
    store: Arc<RecordStore>,
    id: RecordId,
    file: Mutex<File>,
}

impl RecordWriter {
    pub fn id(&self) -> RecordId {
        self.id
    }

    /// Random-access write: serializes `payload`, appends its CRC, writes at
    /// `page_index * PAGE_SIZE`.
    pub fn write(&self, page_index: u32, payload: [u8; PAGE_PAYLOAD_SIZE]) -> Result<(), ServerError> {
        let page = Page::from_payload(payload);
        let encoded = page.encode();
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(page_index as u64 * PAGE_SIZE as u64))?;
        file.write_all(&encoded)?;

        let mut state = self.store.state.lock().unwrap();
        if let Some(record) = state.metadata.get_mut(&self.id) {
            if page_index + 1 > record.page_count {
                record.page_count = page_index + 1;
            }
        }
        Ok(())
    }

    pub fn write_tag(&self, kind: TagKind, name: &str, value: &[u8]) -> Result<TagId, ServerError> {
        let tag = Tag::new(name, kind, value, self.id).map_err(ServerError::Sdr)?;
        let tag_id = tag.id;
        let mut state = self.store.state.lock().unwrap();
        let record = state
            .metadata
            .get_mut(&self.id)
            .ok_or_else(|| ServerError::Sdr(SdrError::NotFound(format!("record {}", self.id))))?;
        record.add_tag(tag).map_err(ServerError::Sdr)?;
        Self::persist_locked(&self.store.base_dir, record)?;
        Ok(tag_id)
    }

    pub fn delete_tag(&self, tag_id: TagId) -> Result<(), ServerError> {
        let mut state = self.store.state.lock().unwrap();
        let record = state
            .metadata
            .get_mut(&self.id)
            .ok_or_else(|| ServerError::Sdr(SdrError::NotFound(format!("record {}", self.id))))?;
        record.delete_tag(tag_id).map_err(ServerError::Sdr)?;
        Self::persist_locked(&self.store.base_dir, record)?;
        Ok(())
    }

    /// Atomic metadata edit under the store's internal lock.
    pub fn edit_metadata(&self, edit: impl FnOnce(&mut Record)) -> Result<(), ServerError> {
        let mut state = self.store.state.lock().unwrap();
        let record = state
            .metadata
            .get_mut(&self.id)
            .ok_or_else(|| ServerError::Sdr(SdrError::NotFound(format!("record {}", self.id))))?;
        edit(record);
        Self::persist_locked(&self.store.base_dir, record)?;
        Ok(())
    }

    fn persist_locked(base_dir: &Path, record: &Record) -> Result<(), ServerError> {
        let meta_path = base_dir.join(record.id.to_string()).join(METADATA_FILE);
        let bytes = serde_json::to_vec_pretty(&MetadataFile::from_record(record))?;
        fs::write(meta_path, bytes)?;
        Ok(())
    }
}

impl Drop for RecordWriter {
    fn drop(&mut self) {
        let mut state = self.store.state.lock().unwrap();
        if state.open_writer == Some(self.id) {
            state.open_writer = None;
        }
        log::debug!("closed writer for record {}", self.id);
    }
}

/// A read handle on one record. Multiple
/// readers may be open concurrently; their underlying file handle may be a
/// cached, shared one.
pub struct RecordReader {
    store: Arc<RecordStore>,
    id: RecordId,
    file: Arc<Mutex<File>>,
}

impl RecordReader {
    pub fn id(&self) -> RecordId {
        self.id
    }

    /// Verifies the CRC on read; fails with `Corrupt` on mismatch.
    pub fn read(&self, page_index: u32) -> Result<[u8; PAGE_PAYLOAD_SIZE], ServerError> {
        let mut buf = [0u8; PAGE_SIZE];
        {
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(page_index as u64 * PAGE_SIZE as u64))?;
            file.read_exact(&mut buf)?;
        }
        let page = Page::decode(&buf, page_index).map_err(ServerError::Sdr)?;
        Ok(page.payload)
    }

    pub fn read_tag(&self, tag_id: TagId) -> Result<Tag, ServerError> {
        let state = self.store.state.lock().unwrap();
        let record = state
            .metadata
            .get(&self.id)
            .ok_or_else(|| ServerError::Sdr(SdrError::NotFound(format!("record {}", self.id))))?;
        record
            .tags
            .iter()
            .find(|t| t.id == tag_id)
            .cloned()
            .ok_or_else(|| ServerError::Sdr(SdrError::NotFound(format!("tag {tag_id:?}"))))
    }

    /// Page count of the underlying data file, independent of metadata.
    pub fn item_count(&self) -> Result<u32, ServerError> {
        let file = self.file.lock().unwrap();
        let len = file.metadata()?.len();
        Ok((len / PAGE_SIZE as u64) as u32)
    }

    /// Clamped pagination over page indices.
    pub fn page_range(&self, skip: u32, count: u32) -> Result<Vec<u32>, ServerError> {
        let total = self.item_count()?;
        if skip >= total {
            return Ok(Vec::new());
        }
        let end = total.min(skip.saturating_add(count));
        Ok((skip..end).collect())
    }

    pub fn tag_ids(&self, skip: u32, count: u32) -> Result<Vec<TagId>, ServerError> {
        let state = self.store.state.lock().unwrap();
        let record = state
            .metadata
            .get(&self.id)
            .ok_or_else(|| ServerError::Sdr(SdrError::NotFound(format!("record {}", self.id))))?;
        let total = record.tags.len() as u32;
        if skip >= total {
            return Ok(Vec::new());
        }
        let end = total.min(skip.saturating_add(count));
        Ok(record.tags[skip as usize..end as usize].iter().map(|t| t.id).collect())
    }

    pub fn read_metadata(&self) -> Result<Record, ServerError> {
        self.store
            .state
            .lock()
            .unwrap()
            .metadata
            .get(&self.id)
            .cloned()
            .ok_or_else(|| ServerError::Sdr(SdrError::NotFound(format!("record {}", self.id))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdr_core::WorkModeKind;

    fn sample_payload(fill: u8) -> [u8; PAGE_PAYLOAD_SIZE] {
        [fill; PAGE_PAYLOAD_SIZE]
    }

    #[test]
    fn create_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path(), 5_000).unwrap();
        let id = RecordId::from_u128(1);
        let writer = store.create_file(id, "flight-01", WorkModeKind::Llz, 109_500_000).unwrap();
        writer.write(0, sample_payload(0xAB)).unwrap();
        writer.write(1, sample_payload(0xCD)).unwrap();
        drop(writer);

        let reader = store.open_file(id).unwrap();
        assert_eq!(reader.read(0).unwrap(), sample_payload(0xAB));
        assert_eq!(reader.read(1).unwrap(), sample_payload(0xCD));
        assert_eq!(reader.item_count().unwrap(), 2);
    }

    #[test]
    fn second_writer_fails_while_one_is_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path(), 5_000).unwrap();
        let id1 = RecordId::from_u128(1);
        let id2 = RecordId::from_u128(2);
        let _writer = store.create_file(id1, "a", WorkModeKind::Llz, 1).unwrap();
        assert!(store.create_file(id2, "b", WorkModeKind::Llz, 1).is_err());
    }

    #[test]
    fn open_reader_while_writer_open_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path(), 5_000).unwrap();
        let id = RecordId::from_u128(1);
        let _writer = store.create_file(id, "a", WorkModeKind::Llz, 1).unwrap();
        assert!(store.open_file(id).is_err());
    }

    #[test]
    fn reader_available_after_writer_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path(), 5_000).unwrap();
        let id = RecordId::from_u128(1);
        let writer = store.create_file(id, "a", WorkModeKind::Llz, 1).unwrap();
        drop(writer);
        assert!(store.open_file(id).is_ok());
    }

    #[test]
    fn delete_fails_iff_writer_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path(), 5_000).unwrap();
        let id = RecordId::from_u128(1);
        let writer = store.create_file(id, "a", WorkModeKind::Llz, 1).unwrap();
        assert!(matches!(store.delete_file(id), Err(ServerError::Sdr(SdrError::Busy))));
        drop(writer);
        assert!(store.delete_file(id).is_ok());
    }

    #[test]
    fn open_nonexistent_record_is_not_found_and_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path(), 5_000).unwrap();
        let id = RecordId::from_u128(42);
        assert!(store.open_file(id).is_err());
        assert!(!dir.path().join(id.to_string()).exists());
    }

    #[test]
    fn corrupt_page_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path(), 5_000).unwrap();
        let id = RecordId::from_u128(1);
        let writer = store.create_file(id, "a", WorkModeKind::Llz, 1).unwrap();
        writer.write(0, sample_payload(1)).unwrap();
        drop(writer);

        // Flip a byte inside the CRC field directly on disk.
        let data_path = dir.path().join(id.to_string()).join(DATA_FILE);
        let mut bytes = fs::read(&data_path).unwrap();
        bytes[0] ^= 0xFF;
        fs::write(&data_path, bytes).unwrap();

        let reader = store.open_file(id).unwrap();
        let err = reader.read(0).unwrap_err();
        assert!(matches!(err, ServerError::Sdr(SdrError::Corrupt { index: 0 })));
    }

    #[test]
    fn reload_from_disk_preserves_count_and_attributes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RecordStore::open(dir.path(), 5_000).unwrap();
            let id = RecordId::from_u128(7);
            let writer = store.create_file(id, "flight-02", WorkModeKind::Gp, 329_150_000).unwrap();
            writer.write(0, sample_payload(1)).unwrap();
            writer.write_tag(TagKind::String, "note", b"hello").unwrap();
        }
        let store = RecordStore::open(dir.path(), 5_000).unwrap();
        assert_eq!(store.count(), 1);
        let ids = store.list_ids();
        let record = store.try_get_entry(ids[0]).unwrap();
        assert_eq!(record.name, "flight-02");
        assert_eq!(record.page_count, 1);
        assert_eq!(record.tags.len(), 1);
    }

    #[test]
    fn pagination_clamps_to_file_length() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path(), 5_000).unwrap();
        let id = RecordId::from_u128(1);
        let writer = store.create_file(id, "a", WorkModeKind::Llz, 1).unwrap();
        for i in 0..5u32 {
            writer.write(i, sample_payload(i as u8)).unwrap();
        }
        drop(writer);
        let reader = store.open_file(id).unwrap();
        assert_eq!(reader.page_range(10, 5).unwrap(), Vec::<u32>::new());
        assert_eq!(reader.page_range(3, 10).unwrap(), vec![3, 4]);
    }
}
