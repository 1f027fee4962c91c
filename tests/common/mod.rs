#![allow(dead_code)]

pub mod faulty_store;
pub mod test_client;

use home_raft_log::{LogDevice, LogDeviceOptions};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn open_device(options: LogDeviceOptions) -> LogDevice {
    let (device, rx) = LogDevice::open(options).unwrap();
    device.start(rx);
    device
}
