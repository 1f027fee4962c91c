use std::collections::{HashSet, VecDeque};
use std::ops::Range;

use anyhow::{Result, anyhow};
use bincode::{Decode, Encode};
use tracing::warn;

use crate::error::LogStoreError;
use crate::traits::{IndexBounds, StoreResult};
use crate::{LogStoreId, Lsn};

pub const ENTRY_MAGIC_NUM: u32 = 0x_4C47_5354;
pub const ENTRY_HEADER_SIZE: u32 = 16; // size + kind + magic + crc

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    CreateStore,
    Write,
    TruncateFrom,
    TrimBefore,
    RemoveStore,
    Checkpoint,
}

impl RecordKind {
    fn code(self) -> u32 {
        match self {
            RecordKind::CreateStore => 1,
            RecordKind::Write => 2,
            RecordKind::TruncateFrom => 3,
            RecordKind::TrimBefore => 4,
            RecordKind::RemoveStore => 5,
            RecordKind::Checkpoint => 6,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(RecordKind::CreateStore),
            2 => Some(RecordKind::Write),
            3 => Some(RecordKind::TruncateFrom),
            4 => Some(RecordKind::TrimBefore),
            5 => Some(RecordKind::RemoveStore),
            6 => Some(RecordKind::Checkpoint),
            _ => None,
        }
    }
}

/// Fixed-size header preceding every record in a segment file.
/// `size` covers the header and the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub size: u32,
    pub kind: RecordKind,
    pub magic_num: u32,
    pub crc: u32,
}

impl EntryHeader {
    pub fn for_body(kind: RecordKind, body: &[u8]) -> Self {
        Self {
            size: body.len() as u32 + ENTRY_HEADER_SIZE,
            kind,
            magic_num: ENTRY_MAGIC_NUM,
            crc: crc32fast::hash(body),
        }
    }

    pub fn body_size(&self) -> usize {
        (self.size - ENTRY_HEADER_SIZE) as usize
    }

    pub fn serialize(&self) -> [u8; ENTRY_HEADER_SIZE as usize] {
        let mut buf = [0u8; ENTRY_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.kind.code().to_le_bytes());
        buf[8..12].copy_from_slice(&self.magic_num.to_le_bytes());
        buf[12..16].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < ENTRY_HEADER_SIZE as usize {
            return Err(anyhow!("Invalid header length {}", data.len()));
        }

        let read_u32 = |at: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&data[at..at + 4]);
            u32::from_le_bytes(bytes)
        };

        let magic_num = read_u32(8);
        if magic_num != ENTRY_MAGIC_NUM {
            return Err(anyhow!("Invalid magic number {:#x}", magic_num));
        }

        let size = read_u32(0);
        if size < ENTRY_HEADER_SIZE {
            return Err(anyhow!("Invalid record size {}", size));
        }

        let kind = RecordKind::from_code(read_u32(4))
            .ok_or_else(|| anyhow!("Invalid record kind {}", read_u32(4)))?;

        Ok(Self {
            size,
            kind,
            magic_num,
            crc: read_u32(12),
        })
    }
}

/// Header followed by body, ready to be staged into a segment.
pub fn frame_record(kind: RecordKind, body: &[u8]) -> Vec<u8> {
    let header = EntryHeader::for_body(kind, body);
    let mut buf = Vec::with_capacity(header.size as usize);
    buf.extend_from_slice(&header.serialize());
    buf.extend_from_slice(body);
    buf
}

/// Split a full framed record into its header and verified body.
pub fn unframe_record(data: &[u8]) -> StoreResult<(EntryHeader, &[u8])> {
    let header = EntryHeader::deserialize(data)
        .map_err(|e| LogStoreError::CorruptRecord(e.to_string()))?;
    if data.len() != header.size as usize {
        return Err(LogStoreError::CorruptRecord(format!(
            "record size {} does not match header size {}",
            data.len(),
            header.size
        )));
    }
    let body = &data[ENTRY_HEADER_SIZE as usize..];
    let actual_crc = crc32fast::hash(body);
    if actual_crc != header.crc {
        return Err(LogStoreError::CorruptRecord(format!(
            "crc mismatch: expected {:#x}, got {:#x}",
            header.crc, actual_crc
        )));
    }
    Ok((header, body))
}

pub fn encode_body<T: Encode>(body: &T) -> Result<Vec<u8>> {
    Ok(bincode::encode_to_vec(body, bincode::config::standard())?)
}

pub fn decode_body<T: Decode<()>>(data: &[u8]) -> Result<T> {
    let (body, _) = bincode::decode_from_slice(data, bincode::config::standard()).map_err(|e| {
        warn!("Failed to decode segment record body: {}", e);
        e
    })?;
    Ok(body)
}

/// A raft record written for one store.
#[derive(Debug, Clone, Decode, Encode)]
pub struct WriteRecord {
    pub store_id: LogStoreId,
    pub lsn: Lsn,
    pub data: Vec<u8>,
}

/// Create, remove, truncate and trim operations. `lsn` is unused for create
/// and remove.
#[derive(Debug, Clone, Decode, Encode)]
pub struct StoreOpRecord {
    pub store_id: LogStoreId,
    pub lsn: Lsn,
}

#[derive(Debug, Clone, PartialEq, Eq, Decode, Encode)]
pub struct StoreCheckpoint {
    pub store_id: LogStoreId,
    pub start_lsn: Lsn,
    pub next_lsn: Lsn,
    pub hole: Option<(Lsn, Lsn)>,
}

/// Written at the head of every rotated-in segment so that sealed segments
/// can be deleted without losing store metadata recorded in them.
#[derive(Debug, Clone, Default, Decode, Encode)]
pub struct CheckpointRecord {
    pub next_store_id: LogStoreId,
    pub stores: Vec<StoreCheckpoint>,
}

/// Where a framed record lives. `offset` points at the header and `size`
/// covers header and body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    pub segment_id: u64,
    pub offset: u64,
    pub size: u32,
}

impl RecordLocation {
    pub const MISSING: RecordLocation = RecordLocation {
        segment_id: u64::MAX,
        offset: 0,
        size: 0,
    };

    pub fn is_missing(&self) -> bool {
        self.segment_id == u64::MAX
    }
}

/// Per-store index over the records of the device.
///
/// `entries[i]` locates LSN `start_lsn + i`; `entries.len() == next_lsn - start_lsn`.
#[derive(Debug, Clone)]
pub struct StoreIndex {
    pub start_lsn: Lsn,
    pub next_lsn: Lsn,
    pub hole: Option<Range<Lsn>>,
    pub entries: VecDeque<RecordLocation>,
}

impl Default for StoreIndex {
    fn default() -> Self {
        Self {
            start_lsn: 1,
            next_lsn: 1,
            hole: None,
            entries: VecDeque::new(),
        }
    }
}

impl StoreIndex {
    pub fn bounds(&self) -> IndexBounds {
        IndexBounds {
            start: self.start_lsn,
            next: self.next_lsn,
            hole: self.hole.clone(),
        }
    }

    pub fn is_valid_index(&self, lsn: Lsn) -> bool {
        lsn >= self.start_lsn && lsn < self.next_lsn
    }

    pub fn get_entry(&self, lsn: Lsn) -> Option<&RecordLocation> {
        if !self.is_valid_index(lsn) {
            return None;
        }
        self.entries.get((lsn - self.start_lsn) as usize)
    }

    pub fn push(&mut self, lsn: Lsn, location: RecordLocation) -> Result<()> {
        if lsn != self.next_lsn {
            return Err(anyhow!(
                "write at lsn {} but next lsn is {}",
                lsn,
                self.next_lsn
            ));
        }
        let next_lsn = lsn
            .checked_add(1)
            .ok_or_else(|| anyhow!("no lsn left after {}", lsn))?;
        self.entries.push_back(location);
        self.next_lsn = next_lsn;
        Ok(())
    }

    /// Drop every entry at LSN >= `lsn`. The start never moves.
    pub fn truncate_from(&mut self, lsn: Lsn) {
        if lsn >= self.next_lsn {
            return;
        }
        if lsn <= self.start_lsn {
            self.entries.clear();
            self.next_lsn = self.start_lsn;
            return;
        }
        self.entries.truncate((lsn - self.start_lsn) as usize);
        self.next_lsn = lsn;
    }

    /// Drop every entry at LSN < `lsn`. Trimming past the next LSN empties the
    /// index and records the skipped LSNs as a hole. A hole always ends at
    /// `start_lsn`; any other trim forgets it.
    pub fn trim_before(&mut self, lsn: Lsn) {
        if lsn <= self.start_lsn {
            return;
        }
        if lsn >= self.next_lsn {
            self.hole = if lsn > self.next_lsn {
                let hole_start = match &self.hole {
                    Some(hole) if hole.end == self.next_lsn => hole.start,
                    _ => self.next_lsn,
                };
                Some(hole_start..lsn)
            } else {
                None
            };
            self.entries.clear();
            self.start_lsn = lsn;
            self.next_lsn = lsn;
            return;
        }
        self.entries.drain(0..(lsn - self.start_lsn) as usize);
        self.start_lsn = lsn;
        self.hole = None;
    }

    /// Replay-time write. Unlike `push`, a write that does not land on the
    /// next LSN repositions the index instead of failing; later records in the
    /// same replay restore the exact bounds.
    pub fn replay_write(&mut self, lsn: Lsn, location: RecordLocation) {
        if lsn != self.next_lsn {
            if lsn >= self.start_lsn && lsn < self.next_lsn {
                self.truncate_from(lsn);
            } else {
                self.entries.clear();
                self.start_lsn = lsn;
                self.next_lsn = lsn;
            }
        }
        self.entries.push_back(location);
        self.next_lsn += 1;
    }

    pub fn checkpoint(&self, store_id: LogStoreId) -> StoreCheckpoint {
        StoreCheckpoint {
            store_id,
            start_lsn: self.start_lsn,
            next_lsn: self.next_lsn,
            hole: self.hole.as_ref().map(|h| (h.start, h.end)),
        }
    }

    pub fn apply_checkpoint(&mut self, checkpoint: &StoreCheckpoint) {
        self.truncate_from(checkpoint.next_lsn);
        self.trim_before(checkpoint.start_lsn);
        if self.next_lsn < checkpoint.next_lsn {
            // Records of deleted segments. A later trim or truncate in this
            // replay removes the placeholders.
            if self.entries.is_empty() {
                self.start_lsn = checkpoint.start_lsn;
                self.next_lsn = checkpoint.start_lsn;
            }
            while self.next_lsn < checkpoint.next_lsn {
                self.entries.push_back(RecordLocation::MISSING);
                self.next_lsn += 1;
            }
        }
        self.hole = checkpoint.hole.map(|(start, end)| start..end);
    }

    pub fn collect_segments(&self, into: &mut HashSet<u64>) {
        into.extend(
            self.entries
                .iter()
                .filter(|loc| !loc.is_missing())
                .map(|loc| loc.segment_id),
        );
    }
}
