//! Log device: the segmented, append-only record store shared by every raft
//! log of a process.
//!
//! This module provides:
//! - Replay of all segment files on open to rebuild each store's index
//! - Staging of records in memory until a flush makes them durable
//! - Coalescing of concurrent flush requests into one physical sync
//! - Segment rotation with a checkpoint at the head of each new segment
//! - Deletion of sealed segments no live record points into

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::anyhow;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::LogStoreError;
use crate::traits::{FlushCompletion, IndexBounds, StoreResult};
use crate::{LogStoreId, Lsn};

use super::entry::{
    CheckpointRecord, RecordKind, RecordLocation, StoreIndex, StoreOpRecord, WriteRecord,
    decode_body, encode_body,
};
use super::segment::{LogSegment, parse_segment_file_name};
use super::store::DeviceLogStore;

/// Default maximum segment size (64MB)
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Segments smaller than this are never rotated.
pub const MIN_SEGMENT_SIZE: u64 = 4 * 1024;

#[derive(Clone, Debug)]
pub struct LogDeviceOptions {
    /// Directory holding the segment files
    pub dir: PathBuf,
    /// Size in bytes after which the active segment is sealed
    pub max_segment_size: u64,
    /// Maximum number of concurrent blocking reads
    pub max_io_threads: usize,
    /// Maximum number of flush requests served by one physical sync
    pub flush_batch_size: usize,
    /// Whether a flush calls fsync on the segment file
    pub sync_on_flush: bool,
}

impl Default for LogDeviceOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/logs"),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_io_threads: 4,
            flush_batch_size: 64,
            sync_on_flush: true,
        }
    }
}

impl LogDeviceOptions {
    pub fn with_dir<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskStats {
    pub segment_count: usize,
    pub store_count: usize,
    /// Bytes durably written across all segments
    pub disk_usage: u64,
    /// Bytes staged and waiting for a flush
    pub pending_bytes: u64,
}

pub struct FlushRequest {
    pub response_tx: oneshot::Sender<StoreResult<()>>,
}

struct SealedSegment {
    file_name: PathBuf,
    file: Arc<File>,
    size: u64,
}

pub(crate) struct DeviceState {
    active: LogSegment,
    sealed: BTreeMap<u64, SealedSegment>,
    next_segment_id: u64,
    next_store_id: LogStoreId,
    stores: HashMap<LogStoreId, StoreIndex>,
    needs_cleanup: bool,
    closed: bool,
}

/// Where the bytes of one record can be found at the time of a lookup.
pub(crate) enum RecordSource {
    Staged(Vec<u8>),
    OnDisk {
        file: Arc<File>,
        location: RecordLocation,
    },
}

pub struct LogDeviceInner {
    pub(crate) options: LogDeviceOptions,
    pub(crate) io_semaphore: Arc<Semaphore>,
    state: Mutex<DeviceState>,
}

#[derive(Clone)]
pub struct LogDevice {
    pub(crate) inner: Arc<LogDeviceInner>,
    flush_sender: mpsc::UnboundedSender<FlushRequest>,
}

impl LogDevice {
    /// Open the device, replaying every segment in `options.dir`.
    ///
    /// Returns the device and the receiver that must be handed to `start`.
    pub fn open(
        options: LogDeviceOptions,
    ) -> StoreResult<(Self, mpsc::UnboundedReceiver<FlushRequest>)> {
        fs::create_dir_all(&options.dir).map_err(|e| {
            warn!("Failed to create log device dir {:?}: {}", options.dir, e);
            LogStoreError::io(e)
        })?;

        let state = LogDeviceInner::recover(&options)?;
        let (tx, rx) = mpsc::unbounded_channel();

        info!(
            "Log device opened: dir={:?}, segments={}, stores={}",
            options.dir,
            state.sealed.len() + 1,
            state.stores.len()
        );

        let inner = LogDeviceInner {
            io_semaphore: Arc::new(Semaphore::new(options.max_io_threads.max(1))),
            options,
            state: Mutex::new(state),
        };

        Ok((
            Self {
                inner: Arc::new(inner),
                flush_sender: tx,
            },
            rx,
        ))
    }

    /// Start the flush worker. Requests queued while a sync is running are
    /// served together by the following sync.
    pub fn start(&self, mut receiver: mpsc::UnboundedReceiver<FlushRequest>) {
        let inner = self.inner.clone();
        let batch_size = self.inner.options.flush_batch_size.max(1);

        tokio::spawn(async move {
            loop {
                let mut buf = Vec::with_capacity(batch_size);
                let size = receiver.recv_many(&mut buf, batch_size).await;
                if size == 0 {
                    debug!("Flush request receiver closed");
                    break;
                }

                let flush_inner = inner.clone();
                let result = tokio::task::spawn_blocking(move || flush_inner.flush_pending())
                    .await
                    .unwrap_or_else(|e| {
                        Err(LogStoreError::io(anyhow!("Flush task join error: {}", e)))
                    });

                debug!("Served {} flush request(s): ok={}", size, result.is_ok());
                for req in buf {
                    let _ = req.response_tx.send(result.clone());
                }
            }
        });
    }

    pub fn flush_async(&self) -> FlushCompletion {
        let (tx, rx) = oneshot::channel();
        if let Err(e) = self.flush_sender.send(FlushRequest { response_tx: tx }) {
            warn!("Failed to send flush request: flush worker stopped");
            let _ = e.0.response_tx.send(Err(LogStoreError::io(anyhow!(
                "flush worker stopped"
            ))));
        }
        rx
    }

    /// Make every record staged before this call durable.
    pub async fn flush(&self) -> StoreResult<()> {
        self.flush_async().await.map_err(|e| {
            warn!("Failed to receive flush response: {}", e);
            LogStoreError::io(anyhow!("flush worker dropped the request"))
        })?
    }

    /// Allocate a new store id. The store exists durably once this returns.
    pub async fn create_store(&self) -> StoreResult<LogStoreId> {
        let store_id = self.inner.create_store()?;
        self.flush().await?;
        info!("Created log store {}", store_id);
        Ok(store_id)
    }

    pub fn open_store(&self, store_id: LogStoreId) -> StoreResult<DeviceLogStore> {
        self.inner.ensure_store(store_id)?;
        debug!("Opened log store {}", store_id);
        Ok(DeviceLogStore::new(store_id, self.clone()))
    }

    pub async fn remove_store(&self, store_id: LogStoreId) -> StoreResult<()> {
        self.inner.remove_store(store_id)?;
        self.flush().await?;
        info!("Removed log store {}", store_id);
        Ok(())
    }

    pub fn store_ids(&self) -> Vec<LogStoreId> {
        let state = self.inner.state.lock();
        let mut ids: Vec<_> = state.stores.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Flush staged records and refuse every later operation. Dropping a
    /// device without calling this loses whatever was staged.
    pub async fn shutdown(&self) -> StoreResult<()> {
        self.flush().await?;
        self.inner.state.lock().closed = true;
        info!("Log device {:?} shut down", self.inner.options.dir);
        Ok(())
    }

    pub fn disk_stats(&self) -> DiskStats {
        let state = self.inner.state.lock();
        DiskStats {
            segment_count: state.sealed.len() + 1,
            store_count: state.stores.len(),
            disk_usage: state.active.synced_len
                + state.sealed.values().map(|s| s.size).sum::<u64>(),
            pending_bytes: state.active.unsynced_len(),
        }
    }
}

impl LogDeviceInner {
    fn recover(options: &LogDeviceOptions) -> StoreResult<DeviceState> {
        let mut segment_files: Vec<(u64, PathBuf)> = Vec::new();
        let entries = fs::read_dir(&options.dir).map_err(LogStoreError::io)?;
        for entry in entries.flatten() {
            let path = entry.path();
            if let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_segment_file_name)
            {
                segment_files.push((id, path));
            }
        }
        segment_files.sort_by_key(|(id, _)| *id);

        let mut replay = ReplayState::default();
        let mut sealed = BTreeMap::new();
        let mut active = None;
        let last = segment_files.len().saturating_sub(1);

        let mut active_has_checkpoint = false;

        for (pos, (id, path)) in segment_files.into_iter().enumerate() {
            let mut segment = LogSegment::open(path.clone(), id).map_err(|e| {
                warn!("Failed to open segment {:?}: {}", path, e);
                LogStoreError::io(e)
            })?;

            let mut first_kind = None;
            let valid_len = segment
                .replay_segment(|location, kind, body| {
                    first_kind.get_or_insert(kind);
                    replay.apply(location, kind, body)
                })
                .map_err(|e| {
                    warn!("Failed to replay segment {:?}: {}", path, e);
                    LogStoreError::CorruptRecord(format!("segment {}: {}", id, e))
                })?;

            if pos == last {
                segment.truncate_file(valid_len).map_err(LogStoreError::io)?;
                active_has_checkpoint = first_kind == Some(RecordKind::Checkpoint);
                active = Some(segment);
            } else {
                if valid_len < segment.synced_len {
                    warn!(
                        "Sealed segment {} has {} unreadable trailing bytes",
                        id,
                        segment.synced_len - valid_len
                    );
                }
                sealed.insert(
                    id,
                    SealedSegment {
                        file_name: segment.file_name.clone(),
                        file: segment.file.clone(),
                        size: segment.synced_len,
                    },
                );
            }
        }

        let active = match active {
            Some(segment) => segment,
            None => LogSegment::create(&options.dir, 0).map_err(LogStoreError::io)?,
        };

        for (store_id, index) in &replay.stores {
            debug!(
                "Recovered log store {}: start={}, next={}, hole={:?}",
                store_id, index.start_lsn, index.next_lsn, index.hole
            );
        }

        let mut state = DeviceState {
            next_segment_id: active.segment_id + 1,
            active,
            sealed,
            next_store_id: replay.next_store_id,
            stores: replay.stores,
            needs_cleanup: true,
            closed: false,
        };

        // Segments after the first must open with a checkpoint, or deleting
        // the sealed ones would lose the store metadata recorded in them. A
        // crash during rotation leaves the last segment without one.
        if !state.sealed.is_empty() && !active_has_checkpoint {
            warn!(
                "Segment {} has no checkpoint at its head, rotating",
                state.active.segment_id
            );
            Self::rotate_segment(&options.dir, &mut state)?;
        }
        Ok(state)
    }

    fn ensure_open(state: &DeviceState, store_id: LogStoreId) -> StoreResult<()> {
        if state.closed || !state.stores.contains_key(&store_id) {
            return Err(LogStoreError::StoreUnavailable(store_id));
        }
        Ok(())
    }

    pub(crate) fn ensure_store(&self, store_id: LogStoreId) -> StoreResult<()> {
        Self::ensure_open(&self.state.lock(), store_id)
    }

    fn stage_op(state: &mut DeviceState, kind: RecordKind, store_id: LogStoreId, lsn: Lsn) -> StoreResult<()> {
        let body = encode_body(&StoreOpRecord { store_id, lsn }).map_err(LogStoreError::io)?;
        state.active.stage_record(kind, &body);
        Ok(())
    }

    fn create_store(&self) -> StoreResult<LogStoreId> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(LogStoreError::StoreUnavailable(state.next_store_id));
        }
        let store_id = state.next_store_id;
        Self::stage_op(&mut state, RecordKind::CreateStore, store_id, 0)?;
        state.next_store_id += 1;
        state.stores.insert(store_id, StoreIndex::default());
        Ok(store_id)
    }

    fn remove_store(&self, store_id: LogStoreId) -> StoreResult<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state, store_id)?;
        Self::stage_op(&mut state, RecordKind::RemoveStore, store_id, 0)?;
        state.stores.remove(&store_id);
        state.needs_cleanup = true;
        Ok(())
    }

    pub(crate) fn write(&self, store_id: LogStoreId, lsn: Lsn, data: Vec<u8>) -> StoreResult<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state, store_id)?;

        let next = state.stores[&store_id].next_lsn;
        if lsn != next {
            return Err(LogStoreError::InvalidRange(format!(
                "write at lsn {} on store {} whose next lsn is {}",
                lsn, store_id, next
            )));
        }
        if lsn == Lsn::MAX {
            return Err(LogStoreError::InvalidRange(format!(
                "store {} has no lsn left after {}",
                store_id, lsn
            )));
        }

        let body = encode_body(&WriteRecord { store_id, lsn, data }).map_err(LogStoreError::io)?;
        let location = state.active.stage_record(RecordKind::Write, &body);
        if let Some(index) = state.stores.get_mut(&store_id) {
            index.push(lsn, location).map_err(LogStoreError::io)?;
        }
        Ok(())
    }

    pub(crate) fn truncate_from(&self, store_id: LogStoreId, lsn: Lsn) -> StoreResult<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state, store_id)?;
        if lsn >= state.stores[&store_id].next_lsn {
            return Ok(());
        }
        Self::stage_op(&mut state, RecordKind::TruncateFrom, store_id, lsn)?;
        if let Some(index) = state.stores.get_mut(&store_id) {
            index.truncate_from(lsn);
        }
        state.needs_cleanup = true;
        Ok(())
    }

    pub(crate) fn trim_before(&self, store_id: LogStoreId, lsn: Lsn) -> StoreResult<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state, store_id)?;
        if lsn <= state.stores[&store_id].start_lsn {
            return Ok(());
        }
        Self::stage_op(&mut state, RecordKind::TrimBefore, store_id, lsn)?;
        if let Some(index) = state.stores.get_mut(&store_id) {
            index.trim_before(lsn);
        }
        state.needs_cleanup = true;
        Ok(())
    }

    pub(crate) fn bounds(&self, store_id: LogStoreId) -> StoreResult<IndexBounds> {
        let state = self.state.lock();
        Self::ensure_open(&state, store_id)?;
        Ok(state.stores[&store_id].bounds())
    }

    /// Resolve `[from, to)` of one store to staged bytes or file locations.
    pub(crate) fn locate(
        &self,
        store_id: LogStoreId,
        from: Lsn,
        to: Lsn,
    ) -> StoreResult<Vec<RecordSource>> {
        let state = self.state.lock();
        Self::ensure_open(&state, store_id)?;
        let index = &state.stores[&store_id];
        if from >= to {
            return Ok(Vec::new());
        }

        for lsn in [from, to - 1] {
            if !index.is_valid_index(lsn) {
                return Err(LogStoreError::OutOfRange {
                    lsn,
                    start: index.start_lsn,
                    next: index.next_lsn,
                });
            }
        }

        let mut sources = Vec::with_capacity((to - from) as usize);
        for lsn in from..to {
            let Some(location) = index.get_entry(lsn).copied() else {
                return Err(LogStoreError::OutOfRange {
                    lsn,
                    start: index.start_lsn,
                    next: index.next_lsn,
                });
            };
            if location.is_missing() {
                return Err(LogStoreError::CorruptRecord(format!(
                    "lsn {} of store {} has no backing record",
                    lsn, store_id
                )));
            }

            if let Some(bytes) = state.active.read_staged(&location) {
                sources.push(RecordSource::Staged(bytes));
                continue;
            }

            let file = if location.segment_id == state.active.segment_id {
                state.active.file.clone()
            } else {
                match state.sealed.get(&location.segment_id) {
                    Some(sealed) => sealed.file.clone(),
                    None => {
                        return Err(LogStoreError::CorruptRecord(format!(
                            "lsn {} of store {} points into missing segment {}",
                            lsn, store_id, location.segment_id
                        )));
                    }
                }
            };
            sources.push(RecordSource::OnDisk { file, location });
        }
        Ok(sources)
    }

    /// Write staged records, rotate the active segment when it is full and
    /// delete sealed segments that are no longer referenced.
    ///
    /// The write and sync run without the device lock; appends and reads of
    /// every store go on meanwhile. Only the flush worker calls this, so one
    /// flush is in flight at a time.
    pub(crate) fn flush_pending(&self) -> StoreResult<()> {
        let job = {
            let mut state = self.state.lock();
            if state.closed {
                if state.active.has_pending() {
                    return Err(LogStoreError::io(anyhow!("log device is shut down")));
                }
                return Ok(());
            }
            state.active.begin_flush()
        };

        let written = job
            .as_ref()
            .map(|job| job.write(self.options.sync_on_flush));

        let mut state = self.state.lock();
        if let Some(job) = &job {
            debug_assert_eq!(job.segment_id, state.active.segment_id);
            let ok = written.as_ref().is_some_and(|r| r.is_ok());
            state.active.complete_flush(ok);
            debug!(
                "Flushed {} bytes to segment {}: ok={}",
                job.len(),
                job.segment_id,
                ok
            );
        }
        if let Some(result) = written {
            result.map_err(LogStoreError::io)?;
        }

        let max_size = self.options.max_segment_size.max(MIN_SEGMENT_SIZE);
        if state.active.len() >= max_size {
            Self::rotate_segment(&self.options.dir, &mut state)?;
        }

        if state.needs_cleanup {
            self.cleanup_obsolete_segments(&mut state);
            state.needs_cleanup = false;
        }
        Ok(())
    }

    fn rotate_segment(dir: &Path, state: &mut DeviceState) -> StoreResult<()> {
        // Records staged while the last write was in flight belong to the
        // segment being sealed.
        state.active.flush(true).map_err(LogStoreError::io)?;

        let segment_id = state.next_segment_id;
        let mut segment = LogSegment::create(dir, segment_id).map_err(LogStoreError::io)?;

        let mut checkpoint = CheckpointRecord {
            next_store_id: state.next_store_id,
            stores: state
                .stores
                .iter()
                .map(|(store_id, index)| index.checkpoint(*store_id))
                .collect(),
        };
        checkpoint.stores.sort_by_key(|cp| cp.store_id);

        let body = encode_body(&checkpoint).map_err(LogStoreError::io)?;
        segment.stage_record(RecordKind::Checkpoint, &body);
        segment.flush(true).map_err(LogStoreError::io)?;

        state.next_segment_id += 1;
        let old = std::mem::replace(&mut state.active, segment);
        info!(
            "Rotated segment {} ({} bytes) to segment {}",
            old.segment_id, old.synced_len, segment_id
        );
        state.sealed.insert(
            old.segment_id,
            SealedSegment {
                file_name: old.file_name,
                file: old.file,
                size: old.synced_len,
            },
        );
        state.needs_cleanup = true;
        Ok(())
    }

    fn cleanup_obsolete_segments(&self, state: &mut DeviceState) {
        let mut referenced = HashSet::new();
        for index in state.stores.values() {
            index.collect_segments(&mut referenced);
        }

        let obsolete: Vec<u64> = state
            .sealed
            .keys()
            .filter(|id| !referenced.contains(id))
            .copied()
            .collect();

        for segment_id in obsolete {
            if let Some(sealed) = state.sealed.remove(&segment_id) {
                match fs::remove_file(&sealed.file_name) {
                    Ok(()) => info!(
                        "Deleted obsolete segment {} ({} bytes)",
                        segment_id, sealed.size
                    ),
                    Err(e) => {
                        warn!("Failed to delete obsolete segment {:?}: {}", sealed.file_name, e);
                        state.sealed.insert(segment_id, sealed);
                    }
                }
            }
        }
    }
}

/// Store indexes rebuilt while replaying segments in order.
struct ReplayState {
    next_store_id: LogStoreId,
    stores: HashMap<LogStoreId, StoreIndex>,
}

impl Default for ReplayState {
    fn default() -> Self {
        Self {
            next_store_id: 1,
            stores: HashMap::new(),
        }
    }
}

impl ReplayState {
    fn apply(&mut self, location: RecordLocation, kind: RecordKind, body: &[u8]) -> anyhow::Result<()> {
        match kind {
            RecordKind::Write => {
                let record: WriteRecord = decode_body(body)?;
                match self.stores.get_mut(&record.store_id) {
                    Some(index) => index.replay_write(record.lsn, location),
                    None => warn!(
                        "Write for unknown store {} at lsn {}, skipping",
                        record.store_id, record.lsn
                    ),
                }
            }
            RecordKind::CreateStore => {
                let record: StoreOpRecord = decode_body(body)?;
                self.stores.entry(record.store_id).or_default();
                self.next_store_id = self.next_store_id.max(record.store_id + 1);
            }
            RecordKind::RemoveStore => {
                let record: StoreOpRecord = decode_body(body)?;
                self.stores.remove(&record.store_id);
            }
            RecordKind::TruncateFrom => {
                let record: StoreOpRecord = decode_body(body)?;
                if let Some(index) = self.stores.get_mut(&record.store_id) {
                    index.truncate_from(record.lsn);
                }
            }
            RecordKind::TrimBefore => {
                let record: StoreOpRecord = decode_body(body)?;
                if let Some(index) = self.stores.get_mut(&record.store_id) {
                    index.trim_before(record.lsn);
                }
            }
            RecordKind::Checkpoint => {
                let record: CheckpointRecord = decode_body(body)?;
                self.next_store_id = self.next_store_id.max(record.next_store_id);
                let live: HashSet<LogStoreId> =
                    record.stores.iter().map(|cp| cp.store_id).collect();
                self.stores.retain(|store_id, _| live.contains(store_id));
                for checkpoint in &record.stores {
                    self.stores
                        .entry(checkpoint.store_id)
                        .or_default()
                        .apply_checkpoint(checkpoint);
                }
            }
        }
        Ok(())
    }
}
