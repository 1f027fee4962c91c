//! Snapshot transfer blob.
//!
//! `count u32 | (len u32 | record)*`, little endian, where each record is a
//! codec-encoded entry. The blob carries no LSNs so it can be applied at any
//! destination slot.

use tracing::warn;

use crate::error::LogStoreError;
use crate::message::LogEntry;
use crate::traits::StoreResult;

use super::codec::{decode_entry, encode_entry};

pub fn pack_entries(entries: &[LogEntry]) -> Vec<u8> {
    let records: Vec<Vec<u8>> = entries.iter().map(encode_entry).collect();
    let total: usize = 4 + records.iter().map(|r| 4 + r.len()).sum::<usize>();

    let mut blob = Vec::with_capacity(total);
    blob.extend_from_slice(&(records.len() as u32).to_le_bytes());
    for record in &records {
        blob.extend_from_slice(&(record.len() as u32).to_le_bytes());
        blob.extend_from_slice(record);
    }
    blob
}

fn read_u32(blob: &[u8], at: usize) -> StoreResult<u32> {
    blob.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| {
            warn!("Pack blob truncated at offset {} of {}", at, blob.len());
            LogStoreError::CorruptRecord(format!("pack blob truncated at offset {}", at))
        })
}

pub fn unpack_entries(blob: &[u8]) -> StoreResult<Vec<LogEntry>> {
    let count = read_u32(blob, 0)? as usize;
    let mut at = 4;
    // Each entry takes at least its four byte length prefix.
    let mut entries = Vec::with_capacity(count.min(blob.len() / 4));

    for _ in 0..count {
        let len = read_u32(blob, at)? as usize;
        at += 4;
        let record = blob.get(at..at + len).ok_or_else(|| {
            LogStoreError::CorruptRecord(format!(
                "pack record of {} bytes at offset {} exceeds blob of {} bytes",
                len,
                at,
                blob.len()
            ))
        })?;
        entries.push(decode_entry(record)?);
        at += len;
    }

    if at != blob.len() {
        return Err(LogStoreError::CorruptRecord(format!(
            "pack blob has {} trailing bytes",
            blob.len() - at
        )));
    }
    Ok(entries)
}
