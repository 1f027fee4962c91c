// faulty_store.rs
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use home_raft_log::{
    DeviceLogStore, FlushCompletion, IndexBounds, LogStoreError, LogStoreId, Lsn,
    PhysicalLogStore, StoreResult,
};
use tokio::sync::oneshot;

/// Physical store wrapper that fails selected operations on demand.
pub struct FaultyLogStore {
    inner: DeviceLogStore,
    pub fail_writes: AtomicBool,
    pub fail_reads: AtomicBool,
    pub corrupt_reads: AtomicBool,
    pub fail_flush: AtomicBool,
    pub fail_recovery: AtomicBool,
}

impl FaultyLogStore {
    pub fn new(inner: DeviceLogStore) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            corrupt_reads: AtomicBool::new(false),
            fail_flush: AtomicBool::new(false),
            fail_recovery: AtomicBool::new(false),
        }
    }

    fn check(flag: &AtomicBool, operation: &str) -> StoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(LogStoreError::io(anyhow!("injected {} failure", operation)));
        }
        Ok(())
    }

    fn mangle(&self, mut record: Vec<u8>) -> Vec<u8> {
        if self.corrupt_reads.load(Ordering::SeqCst) {
            if let Some(byte) = record.last_mut() {
                *byte ^= 0xFF;
            } else {
                record.push(0xFF);
            }
        }
        record
    }
}

#[async_trait]
impl PhysicalLogStore for FaultyLogStore {
    fn store_id(&self) -> LogStoreId {
        self.inner.store_id()
    }

    fn write(&self, lsn: Lsn, record: Vec<u8>) -> StoreResult<()> {
        Self::check(&self.fail_writes, "write")?;
        self.inner.write(lsn, record)
    }

    async fn read(&self, lsn: Lsn) -> StoreResult<Vec<u8>> {
        Self::check(&self.fail_reads, "read")?;
        self.inner.read(lsn).await.map(|r| self.mangle(r))
    }

    async fn read_range(&self, from: Lsn, to: Lsn) -> StoreResult<Vec<Vec<u8>>> {
        Self::check(&self.fail_reads, "read")?;
        let records = self.inner.read_range(from, to).await?;
        Ok(records.into_iter().map(|r| self.mangle(r)).collect())
    }

    fn truncate_from(&self, lsn: Lsn) -> StoreResult<()> {
        Self::check(&self.fail_writes, "truncate")?;
        self.inner.truncate_from(lsn)
    }

    fn trim_before(&self, lsn: Lsn) -> StoreResult<()> {
        Self::check(&self.fail_writes, "trim")?;
        self.inner.trim_before(lsn)
    }

    fn flush_async(&self) -> FlushCompletion {
        if let Err(e) = Self::check(&self.fail_flush, "flush") {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Err(e));
            return rx;
        }
        self.inner.flush_async()
    }

    fn recovered_index_bounds(&self) -> StoreResult<IndexBounds> {
        Self::check(&self.fail_recovery, "recovery")?;
        self.inner.recovered_index_bounds()
    }
}
