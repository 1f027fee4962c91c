//! Raft log store on top of the physical log device.
//!
//! - `codec`: logical entry to record bytes and back
//! - `pack`: blob format used to ship a log range to another store
//! - `home`: `HomeRaftLogStore`, the adapter the consensus engine drives

mod codec;
mod home;
mod pack;


pub use codec::{RECORD_HEADER_SIZE, RECORD_MAGIC_NUM, decode_entry, encode_entry};
pub use home::{HomeRaftLogStore, StoreState};
pub use pack::{pack_entries, unpack_entries};
