//! Seam between the connection manager and the BLE stack.
//!
//! [`BleBackend`] scans and opens links, [`BleLink`] is one open link. The
//! btleplug implementation lives in [`crate::sensors::platform`].

use crate::sensors::types::SensorError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// One advertisement as reported by the adapter.
#[derive(Debug, Clone)]
pub struct Advertisement {
    /// BLE device address/identifier
    pub address: String,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength (dBm)
    pub rssi: Option<i16>,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
    /// Service data keyed by service UUID
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// When the advertisement was observed
    pub seen_at: Instant,
}

/// Access to a BLE adapter.
#[async_trait]
pub trait BleBackend: Send + Sync {
    /// Scan for `duration` and report what was heard.
    async fn scan(&self, duration: Duration) -> Result<Vec<Advertisement>, SensorError>;

    /// Open a link to the device at `address` with services discovered.
    async fn connect(&self, address: &str) -> Result<Box<dyn BleLink>, SensorError>;

    /// Tear down whatever a timed-out or abandoned `connect` left behind.
    async fn cancel_connect(&self, address: &str);
}

/// An open link to one peripheral.
#[async_trait]
pub trait BleLink: Send {
    /// Subscribe to notifications on `characteristic`.
    ///
    /// Fails with `ConnectRejected` if the peer does not expose it.
    async fn subscribe(&mut self, characteristic: Uuid) -> Result<(), SensorError>;

    /// Next notification payload. `None` means the link is gone.
    async fn next_notification(&mut self) -> Option<Vec<u8>>;

    /// Close the link.
    async fn disconnect(&mut self) -> Result<(), SensorError>;
}
