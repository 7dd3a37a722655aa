//! Sensor module for BLE fitness machine communication.

pub mod backend;
pub mod ftms;
pub mod manager;
pub mod platform;
pub mod types;

pub use backend::{Advertisement, BleBackend, BleLink};
pub use ftms::{decode, DecodeError};
pub use manager::{ConnectionManager, SampleSink};
pub use platform::BtleplugBackend;
pub use types::{
    ConnectionConfig, DeviceDescriptor, DeviceKind, LinkEvent, LinkState, Sample, SensorError,
};
