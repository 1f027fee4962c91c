use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::{LogStoreId, Lsn};

/// Errors surfaced by the raft log store and its physical collaborator.
///
/// The type is `Clone` so that one coalesced flush result can be handed to
/// every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum LogStoreError {
    #[error("Log store {0} is not open")]
    StoreUnavailable(LogStoreId),

    #[error("Lsn {lsn} out of range (valid range: [{start}, {next}))")]
    OutOfRange { lsn: Lsn, start: Lsn, next: Lsn },

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Log is empty")]
    EmptyLog,

    #[error("IO failure: {0}")]
    IoFailure(Arc<anyhow::Error>),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
}

impl LogStoreError {
    pub fn io(err: impl Into<anyhow::Error>) -> Self {
        LogStoreError::IoFailure(Arc::new(err.into()))
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            LogStoreError::StoreUnavailable(_) => ErrorSeverity::Fatal,
            LogStoreError::CorruptRecord(_) => ErrorSeverity::Fatal,
            LogStoreError::IoFailure(_) => ErrorSeverity::Recoverable,
            LogStoreError::OutOfRange { .. } => ErrorSeverity::Protocol,
            LogStoreError::InvalidRange(_) => ErrorSeverity::Protocol,
            LogStoreError::EmptyLog => ErrorSeverity::Protocol,
        }
    }

    /// Log the failure of `operation` on `store_id` at a level matching its severity.
    pub fn report(&self, store_id: LogStoreId, operation: &str) {
        match self.severity() {
            ErrorSeverity::Fatal => {
                error!("[FATAL] {} on log store {} failed: {}", operation, store_id, self)
            }
            ErrorSeverity::Recoverable => {
                warn!("[RECOVERABLE] {} on log store {} failed: {}", operation, store_id, self)
            }
            ErrorSeverity::Protocol => {
                info!("[PROTOCOL] {} on log store {} rejected: {}", operation, store_id, self)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// The store cannot serve further requests without intervention.
    Fatal,
    /// The physical layer failed; the consensus engine decides whether to retry.
    Recoverable,
    /// The caller violated a log invariant.
    Protocol,
}
