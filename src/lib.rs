pub mod error;
pub mod message;
pub mod storage;
pub mod traits;

// 类型定义

/// Log sequence number. LSNs start at 1; 0 means "no entry".
pub type Lsn = u64;
pub type LogStoreId = u32;

pub use error::{ErrorSeverity, LogStoreError};
pub use message::{EntryType, LogEntry};
pub use storage::{DeviceLogStore, DiskStats, HomeRaftLogStore, LogDevice, LogDeviceOptions, StoreState};
pub use traits::{FlushCompletion, IndexBounds, PhysicalLogStore, RaftLogStore, StoreResult};
