//! Sensor types for FTMS fitness machines.
//!
//! Device identity, link state, decoded samples and the connection
//! configuration shared by the decoder and the connection manager.

use crate::sensors::ftms::{INDOOR_BIKE_DATA_UUID, ROWER_DATA_UUID};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Kind of fitness machine on the other end of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Indoor bike (Indoor Bike Data, 0x2AD2)
    Bike,
    /// Rowing machine (Rower Data, 0x2AD1)
    Rower,
}

impl DeviceKind {
    /// The notify characteristic carrying telemetry for this kind.
    pub fn data_characteristic(&self) -> Uuid {
        match self {
            DeviceKind::Bike => INDOOR_BIKE_DATA_UUID,
            DeviceKind::Rower => ROWER_DATA_UUID,
        }
    }

    /// Lowercase name used in filenames and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Bike => "bike",
            DeviceKind::Rower => "rower",
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bike" => Ok(DeviceKind::Bike),
            "rower" => Ok(DeviceKind::Rower),
            other => Err(format!("unknown device kind '{}'", other)),
        }
    }
}

/// State of the BLE link to the fitness machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// No link and no activity
    #[default]
    Idle,
    /// Discovery scan in progress
    Scanning,
    /// Connection attempt in progress
    Connecting,
    /// Link up and subscribed
    Connected,
    /// Link lost, retrying
    Reconnecting,
    /// Reconnection attempts exhausted
    Failed,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Idle => write!(f, "Idle"),
            LinkState::Scanning => write!(f, "Scanning..."),
            LinkState::Connecting => write!(f, "Connecting..."),
            LinkState::Connected => write!(f, "Connected"),
            LinkState::Reconnecting => write!(f, "Reconnecting..."),
            LinkState::Failed => write!(f, "Failed"),
        }
    }
}

/// A fitness machine seen during discovery.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    /// BLE device address/identifier
    pub address: String,
    /// Advertised name
    pub name: String,
    /// Machine kind
    pub kind: DeviceKind,
    /// Last observed signal strength (dBm)
    pub rssi: Option<i16>,
    /// When the device was last heard from
    pub last_seen: Instant,
}

/// One decoded telemetry reading.
///
/// Every field is optional: a field the machine did not report is `None`,
/// never zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// When the frame was received
    pub timestamp: DateTime<Utc>,
    /// Machine kind that produced the frame
    pub kind: DeviceKind,
    /// Instantaneous power in watts
    pub power_watts: Option<i16>,
    /// Cadence in RPM (bike)
    pub cadence_rpm: Option<f32>,
    /// Speed in km/h
    pub speed_kmh: Option<f32>,
    /// Stroke rate in strokes per minute (rower)
    pub stroke_rate_spm: Option<f32>,
    /// Total strokes since the machine started (rower)
    pub stroke_count: Option<u16>,
    /// Heart rate in BPM
    pub heart_rate_bpm: Option<u8>,
    /// Total distance in meters
    pub distance_m: Option<u32>,
    /// Total expended energy in kcal
    pub calories_kcal: Option<u16>,
    /// Resistance level
    pub resistance_level: Option<i16>,
    /// Machine-reported elapsed time in seconds
    pub elapsed_time_s: Option<u16>,
}

impl Sample {
    /// Create an empty sample.
    pub fn new(kind: DeviceKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            kind,
            power_watts: None,
            cadence_rpm: None,
            speed_kmh: None,
            stroke_rate_spm: None,
            stroke_count: None,
            heart_rate_bpm: None,
            distance_m: None,
            calories_kcal: None,
            resistance_level: None,
            elapsed_time_s: None,
        }
    }

    /// The value used to decide whether the athlete is moving.
    ///
    /// Power for bikes, stroke rate for rowers.
    pub fn activity_metric(&self) -> Option<f32> {
        match self.kind {
            DeviceKind::Bike => self.power_watts.map(f32::from),
            DeviceKind::Rower => self.stroke_rate_spm,
        }
    }

    /// Cadence for bikes, stroke rate for rowers.
    pub fn cadence_like(&self) -> Option<f32> {
        match self.kind {
            DeviceKind::Bike => self.cadence_rpm,
            DeviceKind::Rower => self.stroke_rate_spm,
        }
    }
}

/// Lifecycle events published by the connection manager.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Link state changed
    StateChanged(LinkState),
    /// Link established to a device
    Connected(DeviceDescriptor),
    /// Link dropped unexpectedly
    LinkLost { address: String },
    /// Link re-established after a loss
    Reconnected { address: String, attempt: u32 },
    /// Reconnection attempts exhausted
    Failed { address: String, attempts: u32 },
    /// Link closed on request
    Disconnected { address: String },
}

/// Configuration for the connection manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Preferred machine kind; devices of the other kind are skipped
    pub device_kind: Option<DeviceKind>,
    /// Devices weaker than this are ignored (dBm)
    pub signal_threshold_dbm: i16,
    /// Duration of a discovery scan in seconds
    pub scan_timeout_secs: u64,
    /// Timeout for each connection attempt in seconds
    pub connection_timeout_secs: u64,
    /// Reconnection attempts before giving up
    pub reconnect_attempts: u32,
    /// Delay between reconnection attempts in seconds
    pub reconnect_delay_secs: u64,
    /// A descriptor older than this is refreshed by a scan before reconnecting
    pub staleness_window_secs: u64,
}

impl ConnectionConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_window_secs)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            device_kind: None,
            signal_threshold_dbm: -70,
            scan_timeout_secs: 10,
            connection_timeout_secs: 30,
            reconnect_attempts: 3,
            reconnect_delay_secs: 5,
            staleness_window_secs: 60,
        }
    }
}

/// Errors that can occur on the BLE side.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    /// BLE adapter not found or unavailable
    #[error("Bluetooth adapter not found")]
    AdapterNotFound,

    /// Adapter could not be engaged for scanning in time
    #[error("Scan timed out")]
    ScanTimeout,

    /// Device is no longer visible to the adapter
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Connection attempt timed out
    #[error("Connection timed out")]
    ConnectTimeout,

    /// Peer refused the connection or lacks the telemetry characteristic
    #[error("Connection rejected: {0}")]
    ConnectRejected(String),

    /// A link is already being established or is up
    #[error("A connection is already active")]
    Busy,

    /// Operation needs a link that is not there
    #[error("Not connected")]
    NotConnected,

    /// Reconnection gave up
    #[error("Reconnection failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Generic BLE error
    #[error("BLE error: {0}")]
    BleError(String),
}
