//! ftmsbridge - Bluetooth FTMS to FIT activity bridge
//!
//! Connects to an indoor bike or rowing machine over Bluetooth Low Energy,
//! decodes its Fitness Machine Service telemetry, records workout sessions
//! with auto-pause and writes Garmin FIT activity files.

pub mod bridge;
pub mod metrics;
pub mod recording;
pub mod sensors;
pub mod storage;

// Re-export commonly used types
pub use bridge::{Bridge, BridgeStatus};
pub use recording::exporter_fit::encode;
pub use recording::recorder::SessionRecorder;
pub use sensors::manager::ConnectionManager;
pub use storage::config::AppConfig;
