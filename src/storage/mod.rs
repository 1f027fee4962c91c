pub mod log;
pub mod raft;

pub use log::{DeviceLogStore, DiskStats, LogDevice, LogDeviceOptions};
pub use raft::{HomeRaftLogStore, StoreState};
