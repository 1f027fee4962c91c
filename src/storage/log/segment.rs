use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use tracing::{info, warn};

use crate::error::LogStoreError;
use crate::traits::StoreResult;

use super::entry::{
    ENTRY_HEADER_SIZE, EntryHeader, RecordKind, RecordLocation, frame_record, unframe_record,
};

// LogSegment file format:
// | EntryHeader | body | EntryHeader | body | ...
// The first record of every segment but the first is a Checkpoint.

pub(crate) const SEGMENT_FILE_PREFIX: &str = "segment_";
pub(crate) const SEGMENT_FILE_EXT: &str = ".log";

pub fn segment_file_name(segment_id: u64) -> String {
    format!("{}{:010}{}", SEGMENT_FILE_PREFIX, segment_id, SEGMENT_FILE_EXT)
}

pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_FILE_PREFIX)?
        .strip_suffix(SEGMENT_FILE_EXT)?
        .parse()
        .ok()
}

/// One segment file. Records are staged in `pending` and reach the file on
/// `flush`; `synced_len` is the length of the durable prefix.
///
/// A flush can also be split so the write runs without the device lock:
/// `begin_flush` moves the staged bytes to `in_flight`, `FlushJob::write`
/// writes them, and `complete_flush` publishes or restores them. Bytes in
/// flight stay readable through `read_staged` until then.
pub struct LogSegment {
    pub(crate) segment_id: u64,
    pub(crate) file_name: PathBuf,
    pub(crate) file: Arc<File>,
    pub(crate) synced_len: u64,
    pub(crate) in_flight: Option<Arc<Vec<u8>>>,
    pub(crate) pending: Vec<u8>,
}

/// Staged bytes taken out of a segment, to be written at `offset`.
pub struct FlushJob {
    pub(crate) segment_id: u64,
    file: Arc<File>,
    offset: u64,
    data: Arc<Vec<u8>>,
}

impl FlushJob {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Positioned write of the taken bytes, then `sync_data` when asked.
    pub fn write(&self, sync: bool) -> Result<()> {
        self.file.write_all_at(&self.data, self.offset).map_err(|e| {
            warn!("Failed to write segment {}: {}", self.segment_id, e);
            e
        })?;

        if sync {
            self.file.sync_data().map_err(|e| {
                warn!("Failed to sync segment {}: {}", self.segment_id, e);
                e
            })?;
        }
        Ok(())
    }
}

impl LogSegment {
    pub fn create(dir: &Path, segment_id: u64) -> Result<Self> {
        let file_name = dir.join(segment_file_name(segment_id));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&file_name)?;

        info!("Created new segment: id={}, path={:?}", segment_id, file_name);

        Ok(Self {
            segment_id,
            file_name,
            file: Arc::new(file),
            synced_len: 0,
            in_flight: None,
            pending: Vec::new(),
        })
    }

    pub fn open(file_name: PathBuf, segment_id: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&file_name)?;
        let synced_len = file.metadata()?.len();

        Ok(Self {
            segment_id,
            file_name,
            file: Arc::new(file),
            synced_len,
            in_flight: None,
            pending: Vec::new(),
        })
    }

    fn in_flight_len(&self) -> u64 {
        self.in_flight.as_ref().map_or(0, |data| data.len() as u64)
    }

    pub fn len(&self) -> u64 {
        self.synced_len + self.in_flight_len() + self.pending.len() as u64
    }

    /// Bytes staged or in flight that are not durable yet.
    pub fn unsynced_len(&self) -> u64 {
        self.len() - self.synced_len
    }

    pub fn has_pending(&self) -> bool {
        self.unsynced_len() > 0
    }

    /// Stage a record; it becomes durable with the next `flush`.
    pub fn stage_record(&mut self, kind: RecordKind, body: &[u8]) -> RecordLocation {
        let framed = frame_record(kind, body);
        let location = RecordLocation {
            segment_id: self.segment_id,
            offset: self.len(),
            size: framed.len() as u32,
        };
        self.pending.extend_from_slice(&framed);
        location
    }

    /// Bytes of a record that is not durable yet, staged or in flight.
    pub fn read_staged(&self, location: &RecordLocation) -> Option<Vec<u8>> {
        if location.segment_id != self.segment_id || location.offset < self.synced_len {
            return None;
        }
        let mut begin = (location.offset - self.synced_len) as usize;
        let size = location.size as usize;

        let in_flight_len = self.in_flight_len() as usize;
        if begin < in_flight_len {
            return self
                .in_flight
                .as_ref()
                .and_then(|data| data.get(begin..begin + size))
                .map(|bytes| bytes.to_vec());
        }
        begin -= in_flight_len;
        self.pending.get(begin..begin + size).map(|bytes| bytes.to_vec())
    }

    /// Take the staged bytes for a write outside the device lock. Returns
    /// `None` when nothing is staged or a flush is already in flight.
    pub fn begin_flush(&mut self) -> Option<FlushJob> {
        if self.pending.is_empty() || self.in_flight.is_some() {
            return None;
        }
        let data = Arc::new(std::mem::take(&mut self.pending));
        self.in_flight = Some(data.clone());
        Some(FlushJob {
            segment_id: self.segment_id,
            file: self.file.clone(),
            offset: self.synced_len,
            data,
        })
    }

    /// Publish the in-flight bytes as durable, or put them back in front of
    /// the records staged since so a later flush retries them.
    pub fn complete_flush(&mut self, written: bool) {
        let Some(data) = self.in_flight.take() else {
            return;
        };
        if written {
            self.synced_len += data.len() as u64;
        } else {
            let mut restored = Arc::unwrap_or_clone(data);
            restored.append(&mut self.pending);
            self.pending = restored;
        }
    }

    /// Write staged records at the end of the durable prefix. On failure the
    /// staged records are kept so a later flush can retry them.
    pub fn flush(&mut self, sync: bool) -> Result<()> {
        let Some(job) = self.begin_flush() else {
            return Ok(());
        };
        let result = job.write(sync);
        self.complete_flush(result.is_ok());
        result
    }

    /// Drop everything past `len`, used to cut a torn tail after replay.
    pub fn truncate_file(&mut self, len: u64) -> Result<()> {
        if len < self.synced_len {
            warn!(
                "Truncating segment {} from {} to {} bytes",
                self.segment_id, self.synced_len, len
            );
            self.file.set_len(len)?;
            self.file.sync_data()?;
            self.synced_len = len;
        }
        Ok(())
    }

    /// Replay the segment record by record, handing each verified record to
    /// `apply`. Stops at the first incomplete or corrupt record and returns the
    /// length of the valid prefix.
    pub fn replay_segment<F>(&self, mut apply: F) -> Result<u64>
    where
        F: FnMut(RecordLocation, RecordKind, &[u8]) -> Result<()>,
    {
        let file_size = self.synced_len;
        let mut offset: u64 = 0;
        let mut header_buf = [0u8; ENTRY_HEADER_SIZE as usize];

        while offset < file_size {
            if offset + ENTRY_HEADER_SIZE as u64 > file_size {
                warn!(
                    "Incomplete header at offset {} of segment {}, stopping replay",
                    offset, self.segment_id
                );
                break;
            }

            self.file.read_exact_at(&mut header_buf, offset)?;
            let header = match EntryHeader::deserialize(&header_buf) {
                Ok(h) => h,
                Err(e) => {
                    warn!(
                        "Failed to deserialize header at offset {} of segment {}: {}",
                        offset, self.segment_id, e
                    );
                    break;
                }
            };

            if offset + header.size as u64 > file_size {
                warn!(
                    "Incomplete record at offset {} of segment {}, stopping replay",
                    offset, self.segment_id
                );
                break;
            }

            let mut body = vec![0u8; header.body_size()];
            self.file
                .read_exact_at(&mut body, offset + ENTRY_HEADER_SIZE as u64)?;

            let actual_crc = crc32fast::hash(&body);
            if actual_crc != header.crc {
                warn!(
                    "CRC mismatch at offset {} of segment {}: expected {}, got {}",
                    offset, self.segment_id, header.crc, actual_crc
                );
                break;
            }

            let location = RecordLocation {
                segment_id: self.segment_id,
                offset,
                size: header.size,
            };
            apply(location, header.kind, &body)?;

            offset += header.size as u64;
        }

        Ok(offset)
    }
}

/// Read records that sit back to back in one file with a single positioned
/// read, returning each full framed record with its header verified.
pub fn read_contiguous_records(
    file: &File,
    locations: &[RecordLocation],
) -> StoreResult<Vec<Vec<u8>>> {
    let Some(first) = locations.first() else {
        return Ok(Vec::new());
    };

    let total: usize = locations.iter().map(|loc| loc.size as usize).sum();
    let mut buf = vec![0u8; total];
    file.read_exact_at(&mut buf, first.offset).map_err(|e| {
        warn!(
            "Failed to read {} bytes at offset {} of segment {}: {}",
            total, first.offset, first.segment_id, e
        );
        LogStoreError::io(e)
    })?;

    let mut records = Vec::with_capacity(locations.len());
    let mut at = 0usize;
    for loc in locations {
        let record = &buf[at..at + loc.size as usize];
        unframe_record(record)?;
        records.push(record.to_vec());
        at += loc.size as usize;
    }
    Ok(records)
}
