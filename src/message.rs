use std::fmt;

/// Kind of a raft log entry, using the consensus library's numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EntryType {
    #[default]
    App,
    Conf,
    ClusterServer,
    LogPack,
    SnapshotSyncRequest,
    Custom,
}

impl EntryType {
    pub fn code(self) -> u32 {
        match self {
            EntryType::App => 1,
            EntryType::Conf => 2,
            EntryType::ClusterServer => 3,
            EntryType::LogPack => 4,
            EntryType::SnapshotSyncRequest => 5,
            EntryType::Custom => 231,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(EntryType::App),
            2 => Some(EntryType::Conf),
            3 => Some(EntryType::ClusterServer),
            4 => Some(EntryType::LogPack),
            5 => Some(EntryType::SnapshotSyncRequest),
            231 => Some(EntryType::Custom),
            _ => None,
        }
    }
}

/// A logical raft log entry. The LSN is not part of the entry; it is the
/// position the store assigns.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct LogEntry {
    pub term: u64,
    pub payload: Vec<u8>,
    pub entry_type: EntryType,
}

impl LogEntry {
    pub fn new(term: u64, payload: Vec<u8>) -> Self {
        Self {
            term,
            payload,
            entry_type: EntryType::App,
        }
    }

    pub fn with_type(term: u64, payload: Vec<u8>, entry_type: EntryType) -> Self {
        Self {
            term,
            payload,
            entry_type,
        }
    }

    /// Placeholder returned for an LSN skipped by compaction past the next slot.
    pub fn dummy() -> Self {
        Self::default()
    }

    pub fn is_dummy(&self) -> bool {
        self.term == 0 && self.payload.is_empty() && self.entry_type == EntryType::App
    }
}

impl fmt::Debug for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogEntry")
            .field("term", &self.term)
            .field("entry_type", &self.entry_type)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
