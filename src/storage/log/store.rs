use std::{fs::File, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::{
    LogStoreId, Lsn,
    error::LogStoreError,
    traits::{FlushCompletion, IndexBounds, PhysicalLogStore, StoreResult},
};

use super::{
    device::{LogDevice, RecordSource},
    entry::{RecordLocation, WriteRecord, decode_body, unframe_record},
    segment::read_contiguous_records,
};

/// Handle on one store of a `LogDevice`.
#[derive(Clone)]
pub struct DeviceLogStore {
    store_id: LogStoreId,
    device: LogDevice,
}

enum ReadBatch {
    Staged(Vec<u8>),
    OnDisk {
        file: Arc<File>,
        locations: Vec<RecordLocation>,
    },
}

impl DeviceLogStore {
    pub(crate) fn new(store_id: LogStoreId, device: LogDevice) -> Self {
        Self { store_id, device }
    }

    pub fn device(&self) -> &LogDevice {
        &self.device
    }

    /// Remove this store from the device durably.
    pub async fn remove(&self) -> StoreResult<()> {
        self.device.remove_store(self.store_id).await
    }

    /// Merge records that sit back to back in the same file so each run is
    /// served by one positioned read.
    fn merge_sources(sources: Vec<RecordSource>) -> Vec<ReadBatch> {
        let mut batches: Vec<ReadBatch> = Vec::new();
        for source in sources {
            match source {
                RecordSource::Staged(bytes) => batches.push(ReadBatch::Staged(bytes)),
                RecordSource::OnDisk { file, location } => {
                    if let Some(ReadBatch::OnDisk { locations, .. }) = batches.last_mut() {
                        let contiguous = locations.last().is_some_and(|last| {
                            last.segment_id == location.segment_id
                                && last.offset + last.size as u64 == location.offset
                        });
                        if contiguous {
                            locations.push(location);
                            continue;
                        }
                    }
                    batches.push(ReadBatch::OnDisk {
                        file,
                        locations: vec![location],
                    });
                }
            }
        }
        batches
    }

    async fn read_batch(&self, batch: ReadBatch) -> StoreResult<Vec<Vec<u8>>> {
        match batch {
            ReadBatch::Staged(record) => Ok(vec![record]),
            ReadBatch::OnDisk { file, locations } => {
                let permit = self
                    .device
                    .inner
                    .io_semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| LogStoreError::io(anyhow!("io semaphore closed: {}", e)))?;

                tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    read_contiguous_records(&file, &locations)
                })
                .await
                .map_err(|e| LogStoreError::io(anyhow!("read task join error: {}", e)))?
            }
        }
    }

    fn decode_write(&self, lsn: Lsn, framed: &[u8]) -> StoreResult<Vec<u8>> {
        let (_, body) = unframe_record(framed)?;
        let record: WriteRecord = decode_body(body).map_err(|e| {
            LogStoreError::CorruptRecord(format!(
                "lsn {} of store {}: {}",
                lsn, self.store_id, e
            ))
        })?;
        if record.store_id != self.store_id || record.lsn != lsn {
            return Err(LogStoreError::CorruptRecord(format!(
                "expected store {} lsn {}, found store {} lsn {}",
                self.store_id, lsn, record.store_id, record.lsn
            )));
        }
        Ok(record.data)
    }
}

#[async_trait]
impl PhysicalLogStore for DeviceLogStore {
    fn store_id(&self) -> LogStoreId {
        self.store_id
    }

    fn write(&self, lsn: Lsn, record: Vec<u8>) -> StoreResult<()> {
        self.device.inner.write(self.store_id, lsn, record)
    }

    async fn read(&self, lsn: Lsn) -> StoreResult<Vec<u8>> {
        let mut records = self.read_range(lsn, lsn + 1).await?;
        records
            .pop()
            .ok_or_else(|| LogStoreError::io(anyhow!("empty read for lsn {}", lsn)))
    }

    async fn read_range(&self, from: Lsn, to: Lsn) -> StoreResult<Vec<Vec<u8>>> {
        if from > to {
            return Err(LogStoreError::InvalidRange(format!(
                "read range [{}, {}) is reversed",
                from, to
            )));
        }

        let sources = self.device.inner.locate(self.store_id, from, to)?;
        let batches = Self::merge_sources(sources);
        debug!(
            "Reading [{}, {}) of store {} in {} batch(es)",
            from,
            to,
            self.store_id,
            batches.len()
        );

        let results = join_all(batches.into_iter().map(|batch| self.read_batch(batch))).await;

        let mut data = Vec::with_capacity((to - from) as usize);
        let mut lsn = from;
        for result in results {
            for framed in result? {
                data.push(self.decode_write(lsn, &framed)?);
                lsn += 1;
            }
        }

        if lsn != to {
            warn!(
                "Short read on store {}: wanted [{}, {}), got up to {}",
                self.store_id, from, to, lsn
            );
            return Err(LogStoreError::io(anyhow!("short read ending at lsn {}", lsn)));
        }
        Ok(data)
    }

    fn truncate_from(&self, lsn: Lsn) -> StoreResult<()> {
        self.device.inner.truncate_from(self.store_id, lsn)
    }

    fn trim_before(&self, lsn: Lsn) -> StoreResult<()> {
        self.device.inner.trim_before(self.store_id, lsn)
    }

    fn flush_async(&self) -> FlushCompletion {
        self.device.flush_async()
    }

    fn recovered_index_bounds(&self) -> StoreResult<IndexBounds> {
        self.device.inner.bounds(self.store_id)
    }
}
