//! Physical log device shared by all raft logs of a process.
//!
//! Every store writes into the same sequence of segment files. Operations
//! (create, write, truncate, trim, remove) are appended as records and an
//! in-memory index per store is rebuilt by replaying them on open.
//!
//! # Module Structure
//!
//! - `entry`: Record framing, record bodies and the per-store index
//! - `segment`: Segment file operations
//! - `device`: Multi-segment device with flush batching, rotation and cleanup
//! - `store`: Per-store handle implementing `PhysicalLogStore`

mod device;
mod entry;
mod segment;
mod store;


pub use device::{
    DEFAULT_MAX_SEGMENT_SIZE, DiskStats, FlushRequest, LogDevice, LogDeviceOptions,
    MIN_SEGMENT_SIZE,
};

pub use entry::{ENTRY_HEADER_SIZE, ENTRY_MAGIC_NUM, EntryHeader, RecordKind};

pub use segment::segment_file_name;

pub use store::DeviceLogStore;
