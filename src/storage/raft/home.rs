use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::{
    LogStoreId, Lsn,
    error::LogStoreError,
    message::LogEntry,
    storage::log::{DeviceLogStore, LogDevice},
    traits::{PhysicalLogStore, RaftLogStore, StoreResult},
};

use super::{
    codec::{decode_entry, encode_entry},
    pack::{pack_entries, unpack_entries},
};

/// Entries fetched per physical read by `log_entries_with_limit`.
const LIMITED_READ_CHUNK: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Closed,
    Opening,
    Recovering,
    Ready,
}

/// In-memory view of the log bounds, derived from the physical index on open
/// and maintained by the writer afterwards.
#[derive(Debug, Clone)]
struct LogBounds {
    start: Lsn,
    next: Lsn,
    /// LSNs skipped by a compaction past the next slot; ends at `start`.
    hole: Option<Range<Lsn>>,
}

impl LogBounds {
    fn in_hole(&self, lsn: Lsn) -> bool {
        self.hole.as_ref().is_some_and(|hole| hole.contains(&lsn))
    }

    fn out_of_range(&self, lsn: Lsn) -> LogStoreError {
        LogStoreError::OutOfRange {
            lsn,
            start: self.start,
            next: self.next,
        }
    }

    fn lowest_readable(&self) -> Lsn {
        self.hole.as_ref().map_or(self.start, |hole| hole.start)
    }

    fn compact_to(&mut self, new_start: Lsn) {
        if new_start >= self.next {
            self.hole = if new_start > self.next {
                let hole_start = match &self.hole {
                    Some(hole) if hole.end == self.next => hole.start,
                    _ => self.next,
                };
                Some(hole_start..new_start)
            } else {
                None
            };
            self.next = new_start;
        } else {
            self.hole = None;
        }
        self.start = new_start;
    }
}

/// Raft log store backed by one store of a physical log device.
///
/// `append`, `write_at`, `compact` and `apply_pack` are expected from the single
/// task that owns the raft log; readers may run alongside it.
pub struct HomeRaftLogStore<S: PhysicalLogStore = DeviceLogStore> {
    store_id: LogStoreId,
    physical: S,
    state: RwLock<StoreState>,
    bounds: RwLock<LogBounds>,
    /// Next slot as of the last completed flush.
    durable_next: AtomicU64,
}

impl HomeRaftLogStore<DeviceLogStore> {
    /// Allocate a new store on `device` and open it.
    pub async fn create(device: &LogDevice) -> StoreResult<Self> {
        let store_id = device.create_store().await?;
        Self::open(device, store_id).await
    }

    /// Reopen a store created earlier, rebuilding its bounds from the device.
    pub async fn open(device: &LogDevice, store_id: LogStoreId) -> StoreResult<Self> {
        debug!(
            "Log store {}: {:?} -> {:?}",
            store_id,
            StoreState::Closed,
            StoreState::Opening
        );
        let physical = device.open_store(store_id).map_err(|e| {
            e.report(store_id, "open");
            e
        })?;
        Self::recover(physical)
    }

    /// Close the store and delete it from the device.
    pub async fn remove_store(&self) -> StoreResult<()> {
        let result = self.physical.remove().await;
        self.reported("remove_store", result)?;
        self.set_state(StoreState::Closed);
        info!("Removed raft log store {}", self.store_id);
        Ok(())
    }
}

impl<S: PhysicalLogStore> HomeRaftLogStore<S> {
    /// Bring `physical` to `Ready`. Fails if its index cannot be reconstructed.
    pub fn recover(physical: S) -> StoreResult<Self> {
        let store_id = physical.store_id();
        debug!(
            "Log store {}: {:?} -> {:?}",
            store_id,
            StoreState::Opening,
            StoreState::Recovering
        );

        let recovered = physical.recovered_index_bounds().map_err(|e| {
            e.report(store_id, "recover");
            e
        })?;
        if recovered.start > recovered.next {
            let err = LogStoreError::CorruptRecord(format!(
                "recovered start {} is past next {}",
                recovered.start, recovered.next
            ));
            err.report(store_id, "recover");
            return Err(err);
        }

        debug!(
            "Log store {}: {:?} -> {:?}",
            store_id,
            StoreState::Recovering,
            StoreState::Ready
        );
        info!(
            "Log store {} ready: start={}, next={}, hole={:?}",
            store_id, recovered.start, recovered.next, recovered.hole
        );

        Ok(Self {
            store_id,
            physical,
            state: RwLock::new(StoreState::Ready),
            durable_next: AtomicU64::new(recovered.next),
            bounds: RwLock::new(LogBounds {
                start: recovered.start,
                next: recovered.next,
                hole: recovered.hole,
            }),
        })
    }

    pub fn store_id(&self) -> LogStoreId {
        self.store_id
    }

    pub fn state(&self) -> StoreState {
        *self.state.read()
    }

    pub fn physical(&self) -> &S {
        &self.physical
    }

    /// Flush outstanding appends and refuse every later operation.
    pub async fn close(&self) -> StoreResult<()> {
        if self.state() != StoreState::Ready {
            return Ok(());
        }
        let result = self.flush_physical().await;
        self.set_state(StoreState::Closed);
        self.reported("close", result)
    }

    fn set_state(&self, to: StoreState) {
        let mut state = self.state.write();
        if *state != to {
            debug!("Log store {}: {:?} -> {:?}", self.store_id, *state, to);
            *state = to;
        }
    }

    fn ensure_ready(&self) -> StoreResult<()> {
        match self.state() {
            StoreState::Ready => Ok(()),
            _ => Err(LogStoreError::StoreUnavailable(self.store_id)),
        }
    }

    fn reported<T>(&self, operation: &str, result: StoreResult<T>) -> StoreResult<T> {
        result.map_err(|e| {
            e.report(self.store_id, operation);
            e
        })
    }

    fn bounds(&self) -> LogBounds {
        self.bounds.read().clone()
    }

    fn out_of_range(&self, lsn: Lsn) -> LogStoreError {
        self.bounds.read().out_of_range(lsn)
    }

    fn append_locked(&self, bounds: &mut LogBounds, entry: &LogEntry) -> StoreResult<Lsn> {
        let lsn = bounds.next;
        let Some(next) = lsn.checked_add(1) else {
            return Err(LogStoreError::InvalidRange(format!(
                "no lsn left after {}",
                lsn
            )));
        };
        self.physical.write(lsn, encode_entry(entry))?;
        bounds.next = next;
        Ok(lsn)
    }

    async fn flush_physical(&self) -> StoreResult<()> {
        let target = self.bounds.read().next;
        self.physical
            .flush_async()
            .await
            .map_err(|_| LogStoreError::io(anyhow!("flush completion dropped")))??;

        // A rollback issued while the flush was in flight lowers the next slot.
        let next = self.bounds.read().next;
        self.durable_next.fetch_max(target.min(next), Ordering::AcqRel);
        Ok(())
    }

    async fn read_entries(&self, from: Lsn, to: Lsn) -> StoreResult<Vec<LogEntry>> {
        self.ensure_ready()?;
        if from > to {
            return Err(LogStoreError::InvalidRange(format!(
                "range [{}, {}) is reversed",
                from, to
            )));
        }
        if from == to {
            return Ok(Vec::new());
        }

        let bounds = self.bounds();
        if from < bounds.lowest_readable() || from >= bounds.next {
            return Err(bounds.out_of_range(from));
        }
        if to > bounds.next {
            return Err(bounds.out_of_range(to - 1));
        }

        let mut entries = Vec::with_capacity((to - from) as usize);
        let stored_from = from.max(bounds.start).min(to);
        for lsn in from..stored_from {
            debug_assert!(bounds.in_hole(lsn));
            entries.push(LogEntry::dummy());
        }
        if stored_from < to {
            for record in self.physical.read_range(stored_from, to).await? {
                entries.push(decode_entry(&record)?);
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl<S: PhysicalLogStore> RaftLogStore for HomeRaftLogStore<S> {
    fn start_index(&self) -> Lsn {
        self.bounds.read().start
    }

    fn next_slot(&self) -> Lsn {
        self.bounds.read().next
    }

    fn last_durable_index(&self) -> Lsn {
        let durable_next = self.durable_next.load(Ordering::Acquire);
        if durable_next > self.bounds.read().start {
            durable_next - 1
        } else {
            0
        }
    }

    fn append(&self, entry: &LogEntry) -> StoreResult<Lsn> {
        self.ensure_ready()?;
        let mut bounds = self.bounds.write();
        let result = self.append_locked(&mut bounds, entry);
        self.reported("append", result)
    }

    async fn write_at(&self, lsn: Lsn, entry: &LogEntry) -> StoreResult<()> {
        self.ensure_ready()?;
        let result = {
            let mut bounds = self.bounds.write();
            if lsn < bounds.start || lsn > bounds.next {
                Err(LogStoreError::InvalidRange(format!(
                    "write_at lsn {} outside [{}, {}]",
                    lsn, bounds.start, bounds.next
                )))
            } else {
                let dropped = bounds.next - lsn;
                match self.physical.truncate_from(lsn) {
                    Ok(()) => {
                        bounds.next = lsn;
                        self.durable_next.fetch_min(lsn, Ordering::AcqRel);
                        self.append_locked(&mut bounds, entry).map(|_| dropped)
                    }
                    Err(e) => Err(e),
                }
            }
        };
        let dropped = self.reported("write_at", result)?;

        info!(
            "Rolled back log store {} to lsn {} with term {}, dropped {} entries",
            self.store_id, lsn, entry.term, dropped
        );
        let result = self.flush_physical().await;
        self.reported("write_at", result)
    }

    async fn entry_at(&self, lsn: Lsn) -> StoreResult<LogEntry> {
        let result = match self.read_entries(lsn, lsn.saturating_add(1)).await {
            Ok(mut entries) => entries.pop().ok_or_else(|| self.out_of_range(lsn)),
            Err(e) => Err(e),
        };
        self.reported("entry_at", result)
    }

    async fn term_at(&self, lsn: Lsn) -> StoreResult<u64> {
        self.ensure_ready()?;
        if self.bounds.read().in_hole(lsn) {
            return Ok(0);
        }
        self.entry_at(lsn).await.map(|entry| entry.term)
    }

    async fn last_entry(&self) -> StoreResult<LogEntry> {
        self.ensure_ready()?;
        let bounds = self.bounds();
        if bounds.next == bounds.start {
            return Err(LogStoreError::EmptyLog);
        }
        self.entry_at(bounds.next - 1).await
    }

    async fn log_entries(&self, from: Lsn, to: Lsn) -> StoreResult<Vec<LogEntry>> {
        let result = self.read_entries(from, to).await;
        self.reported("log_entries", result)
    }

    async fn log_entries_with_limit(
        &self,
        from: Lsn,
        to: Lsn,
        max_bytes: usize,
    ) -> StoreResult<Vec<LogEntry>> {
        if from >= to {
            return self.log_entries(from, to).await;
        }

        let mut entries = Vec::new();
        let mut total_bytes = 0usize;
        let mut chunk_from = from;

        while chunk_from < to {
            let chunk_to = (chunk_from + LIMITED_READ_CHUNK).min(to);
            let chunk = self.read_entries(chunk_from, chunk_to).await;
            for entry in self.reported("log_entries_with_limit", chunk)? {
                total_bytes += entry.payload.len();
                if total_bytes > max_bytes && !entries.is_empty() {
                    return Ok(entries);
                }
                entries.push(entry);
            }
            chunk_from = chunk_to;
        }
        Ok(entries)
    }

    async fn compact(&self, up_to: Lsn) -> StoreResult<()> {
        self.ensure_ready()?;
        // The new start must leave room for the next append.
        let Some(new_start) = up_to.checked_add(1).filter(|start| *start < Lsn::MAX) else {
            let err = LogStoreError::InvalidRange(format!("compact up to lsn {}", up_to));
            return self.reported("compact", Err(err));
        };
        let result = {
            let mut bounds = self.bounds.write();
            if new_start <= bounds.start {
                return Ok(());
            }
            self.physical.trim_before(new_start).map(|()| {
                bounds.compact_to(new_start);
                bounds.clone()
            })
        };
        let bounds = self.reported("compact", result)?;

        info!(
            "Compacted log store {} up to lsn {}: start={}, next={}, hole={:?}",
            self.store_id, up_to, bounds.start, bounds.next, bounds.hole
        );
        let result = self.flush_physical().await;
        self.reported("compact", result)
    }

    async fn flush(&self) -> StoreResult<()> {
        self.ensure_ready()?;
        let result = self.flush_physical().await;
        self.reported("flush", result)
    }

    async fn pack(&self, from: Lsn, count: u64) -> StoreResult<Vec<u8>> {
        self.ensure_ready()?;
        let bounds = self.bounds();
        let to = from.checked_add(count);
        let to = match to {
            Some(to) if from >= bounds.start && to <= bounds.next => to,
            _ => {
                let err = LogStoreError::InvalidRange(format!(
                    "pack of {} entries from lsn {} outside [{}, {})",
                    count, from, bounds.start, bounds.next
                ));
                return self.reported("pack", Err(err));
            }
        };

        let result = self.read_entries(from, to).await;
        let entries = self.reported("pack", result)?;
        debug!(
            "Packed {} entries [{}, {}) of log store {}",
            entries.len(),
            from,
            to,
            self.store_id
        );
        Ok(pack_entries(&entries))
    }

    async fn apply_pack(&self, dest: Lsn, blob: &[u8]) -> StoreResult<()> {
        self.ensure_ready()?;
        let entries = self.reported("apply_pack", unpack_entries(blob))?;

        let result = {
            let mut bounds = self.bounds.write();
            if dest != bounds.next {
                Err(LogStoreError::InvalidRange(format!(
                    "apply_pack at lsn {} but next slot is {}",
                    dest, bounds.next
                )))
            } else {
                entries
                    .iter()
                    .try_for_each(|entry| self.append_locked(&mut bounds, entry).map(|_| ()))
            }
        };
        self.reported("apply_pack", result)?;

        info!(
            "Applied pack of {} entries to log store {} at lsn {}",
            entries.len(),
            self.store_id,
            dest
        );
        let result = self.flush_physical().await;
        self.reported("apply_pack", result)
    }
}
