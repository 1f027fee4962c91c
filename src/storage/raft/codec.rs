use tracing::warn;

use crate::error::LogStoreError;
use crate::message::{EntryType, LogEntry};
use crate::traits::StoreResult;

pub const RECORD_MAGIC_NUM: u32 = 0x_5246_544C;
pub const RECORD_HEADER_SIZE: usize = 24; // magic + type + term + payload_len + crc

// Record layout (little endian):
// | magic u32 | entry_type u32 | term u64 | payload_len u32 | crc32(payload) u32 | payload |

pub fn encode_entry(entry: &LogEntry) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + entry.payload.len());
    buf.extend_from_slice(&RECORD_MAGIC_NUM.to_le_bytes());
    buf.extend_from_slice(&entry.entry_type.code().to_le_bytes());
    buf.extend_from_slice(&entry.term.to_le_bytes());
    buf.extend_from_slice(&(entry.payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&entry.payload).to_le_bytes());
    buf.extend_from_slice(&entry.payload);
    buf
}

fn corrupt(msg: String) -> LogStoreError {
    warn!("Failed to decode raft record: {}", msg);
    LogStoreError::CorruptRecord(msg)
}

pub fn decode_entry(data: &[u8]) -> StoreResult<LogEntry> {
    if data.len() < RECORD_HEADER_SIZE {
        return Err(corrupt(format!("record too short: {} bytes", data.len())));
    }

    let u32_at = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);

    let magic = u32_at(0);
    if magic != RECORD_MAGIC_NUM {
        return Err(corrupt(format!("invalid magic number {:#x}", magic)));
    }

    let entry_type = EntryType::from_code(u32_at(4))
        .ok_or_else(|| corrupt(format!("unknown entry type {}", u32_at(4))))?;

    let mut term_bytes = [0u8; 8];
    term_bytes.copy_from_slice(&data[8..16]);
    let term = u64::from_le_bytes(term_bytes);

    let payload_len = u32_at(16) as usize;
    let payload = &data[RECORD_HEADER_SIZE..];
    if payload.len() != payload_len {
        return Err(corrupt(format!(
            "payload length {} does not match header length {}",
            payload.len(),
            payload_len
        )));
    }

    let crc = u32_at(20);
    let actual_crc = crc32fast::hash(payload);
    if crc != actual_crc {
        return Err(corrupt(format!(
            "crc mismatch: expected {:#x}, got {:#x}",
            crc, actual_crc
        )));
    }

    Ok(LogEntry::with_type(term, payload.to_vec(), entry_type))
}
