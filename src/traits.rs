use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::LogStoreError;
use crate::message::LogEntry;
use crate::{LogStoreId, Lsn};

pub type StoreResult<T> = Result<T, LogStoreError>;

/// Completion handle for an asynchronous flush request.
pub type FlushCompletion = oneshot::Receiver<StoreResult<()>>;

/// Bounds of one store's index as reconstructed by the physical layer.
///
/// `hole`, when present, is the LSN range skipped by a compaction that went past
/// the next slot. It always lies below `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBounds {
    pub start: Lsn,
    pub next: Lsn,
    pub hole: Option<std::ops::Range<Lsn>>,
}

/// The physical, append-oriented record store backing one raft log.
///
/// Records are opaque bytes addressed by LSN. Writes are staged and become
/// durable once a flush issued after them completes.
#[async_trait]
pub trait PhysicalLogStore: Send + Sync {
    fn store_id(&self) -> LogStoreId;

    /// Stage `record` at `lsn`, which must equal the current next LSN.
    fn write(&self, lsn: Lsn, record: Vec<u8>) -> StoreResult<()>;

    async fn read(&self, lsn: Lsn) -> StoreResult<Vec<u8>>;

    /// Read `[from, to)` in ascending LSN order.
    async fn read_range(&self, from: Lsn, to: Lsn) -> StoreResult<Vec<Vec<u8>>>;

    /// Drop every record at LSN >= `lsn`.
    fn truncate_from(&self, lsn: Lsn) -> StoreResult<()>;

    /// Drop every record at LSN < `lsn`. Moving past the next LSN leaves the
    /// store empty with `start == next == lsn`.
    fn trim_before(&self, lsn: Lsn) -> StoreResult<()>;

    fn flush_async(&self) -> FlushCompletion;

    fn recovered_index_bounds(&self) -> StoreResult<IndexBounds>;
}

/// The log-store contract a raft consensus engine drives.
///
/// Writers (`append`, `write_at`, `compact`, `apply_pack`) are expected from a
/// single owner task per store; readers may run concurrently with them.
#[async_trait]
pub trait RaftLogStore: Send + Sync {
    fn start_index(&self) -> Lsn;

    fn next_slot(&self) -> Lsn;

    fn last_durable_index(&self) -> Lsn;

    fn append(&self, entry: &LogEntry) -> StoreResult<Lsn>;

    async fn write_at(&self, lsn: Lsn, entry: &LogEntry) -> StoreResult<()>;

    async fn entry_at(&self, lsn: Lsn) -> StoreResult<LogEntry>;

    async fn term_at(&self, lsn: Lsn) -> StoreResult<u64>;

    async fn last_entry(&self) -> StoreResult<LogEntry>;

    async fn log_entries(&self, from: Lsn, to: Lsn) -> StoreResult<Vec<LogEntry>>;

    async fn log_entries_with_limit(
        &self,
        from: Lsn,
        to: Lsn,
        max_bytes: usize,
    ) -> StoreResult<Vec<LogEntry>>;

    async fn compact(&self, up_to: Lsn) -> StoreResult<()>;

    async fn flush(&self) -> StoreResult<()>;

    async fn pack(&self, from: Lsn, count: u64) -> StoreResult<Vec<u8>>;

    async fn apply_pack(&self, dest: Lsn, blob: &[u8]) -> StoreResult<()>;
}
