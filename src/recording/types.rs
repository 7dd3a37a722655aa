//! Recording types for workout sessions and export.

use crate::sensors::types::{DeviceKind, Sample};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// State of a workout session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Accepting samples
    Recording,
    /// Auto-paused or paused after a link failure; still accepting samples
    Paused,
    /// Ended normally, summary available
    Completed,
    /// Abandoned, no summary
    Aborted,
}

impl SessionState {
    /// Completed and Aborted sessions never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Recording => "recording",
            SessionState::Paused => "paused",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Recording => write!(f, "Recording"),
            SessionState::Paused => write!(f, "Paused"),
            SessionState::Completed => write!(f, "Completed"),
            SessionState::Aborted => write!(f, "Aborted"),
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recording" => Ok(SessionState::Recording),
            "paused" => Ok(SessionState::Paused),
            "completed" => Ok(SessionState::Completed),
            "aborted" => Ok(SessionState::Aborted),
            other => Err(format!("unknown session state '{}'", other)),
        }
    }
}

/// A stretch of time the session spent paused.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PauseInterval {
    pub started_at: DateTime<Utc>,
    /// `None` while the pause is still open
    pub ended_at: Option<DateTime<Utc>>,
}

impl PauseInterval {
    /// Length of the pause, closing an open pause at `until`.
    pub fn duration(&self, until: DateTime<Utc>) -> chrono::Duration {
        let end = self.ended_at.unwrap_or(until);
        (end - self.started_at).max(chrono::Duration::zero())
    }
}

/// Aggregate statistics over a session's retained samples.
///
/// An aggregate over zero reporting samples is `None`, never zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Wall time from start to end in seconds
    pub total_elapsed_secs: f64,
    /// Elapsed time minus paused time in seconds
    pub total_timer_secs: f64,
    /// Average power in watts
    pub avg_power: Option<f32>,
    /// Maximum power in watts
    pub max_power: Option<i16>,
    /// Average cadence in RPM (bike)
    pub avg_cadence: Option<f32>,
    /// Maximum cadence in RPM (bike)
    pub max_cadence: Option<f32>,
    /// Average stroke rate in spm (rower)
    pub avg_stroke_rate: Option<f32>,
    /// Maximum stroke rate in spm (rower)
    pub max_stroke_rate: Option<f32>,
    /// Average heart rate in BPM
    pub avg_heart_rate: Option<f32>,
    /// Maximum heart rate in BPM
    pub max_heart_rate: Option<u8>,
    /// Average speed in km/h
    pub avg_speed_kmh: Option<f32>,
    /// Maximum speed in km/h
    pub max_speed_kmh: Option<f32>,
    /// Total distance in meters
    pub total_distance_m: Option<u32>,
    /// Total energy in kcal
    pub total_calories: Option<u16>,
    /// Total strokes (rower)
    pub total_strokes: Option<u16>,
    /// Number of pauses
    pub pause_count: u32,
}

/// A finalized session. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub kind: DeviceKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub state: SessionState,
    /// Why the session was aborted
    pub abort_reason: Option<String>,
    /// Present for completed sessions
    pub summary: Option<SessionSummary>,
    /// Retained samples in arrival order, power smoothed
    pub samples: Vec<Sample>,
    pub pauses: Vec<PauseInterval>,
}

/// What happened to an ingested sample.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Sample retained, state unchanged
    Appended,
    /// Sample retained and the session auto-paused
    Paused,
    /// Sample retained and the session resumed
    Resumed,
    /// Sample retained and the duration ceiling ended the session
    Completed(Box<SessionRecord>),
    /// Sample dropped (no session, terminal session or wrong device kind)
    Ignored,
}

/// Snapshot of the active session for status queries.
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    pub session_id: Option<Uuid>,
    pub kind: Option<DeviceKind>,
    pub state: Option<SessionState>,
    pub sample_count: usize,
    pub last_sample: Option<Sample>,
}

/// Configuration for workout sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Moving average width for power, in samples
    pub smoothing_window: usize,
    /// Idle time before auto-pause in seconds (0 disables auto-pause)
    pub auto_pause_threshold_secs: u64,
    /// Sessions are completed automatically after this many seconds
    pub max_duration_secs: u64,
}

impl SessionConfig {
    pub fn auto_pause_threshold(&self) -> Option<Duration> {
        (self.auto_pause_threshold_secs > 0)
            .then(|| Duration::from_secs(self.auto_pause_threshold_secs))
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            smoothing_window: 3,
            auto_pause_threshold_secs: 30,
            max_duration_secs: 4 * 60 * 60,
        }
    }
}

/// Configuration for FIT export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// FIT manufacturer id (255 = development)
    pub manufacturer: u16,
    /// FIT product id
    pub product: u16,
    /// Software version in hundredths (100 = 1.00)
    pub software_version: u16,
    /// Hardware version
    pub hardware_version: u8,
    /// Offset of the rider's local time from UTC, for the activity's local
    /// timestamp. Unset means UTC.
    pub utc_offset_minutes: Option<i32>,
    /// Where activity files are written
    pub output_dir: Option<std::path::PathBuf>,
}

impl ExportConfig {
    pub fn utc_offset_secs(&self) -> i64 {
        i64::from(self.utc_offset_minutes.unwrap_or(0)) * 60
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            manufacturer: 255,
            product: 1,
            software_version: 100,
            hardware_version: 1,
            utc_offset_minutes: None,
            output_dir: None,
        }
    }
}

/// Errors from the session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Another session is still recording or paused
    #[error("Session {0} is already active")]
    SessionAlreadyActive(Uuid),

    /// No recording or paused session
    #[error("No active session")]
    NoActiveSession,

    /// The session task has stopped
    #[error("Session task is not running")]
    ActorUnavailable,
}

/// Errors during activity export.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    /// No samples to export
    #[error("Session has no samples to export")]
    EmptySession,

    /// Session has no summary (aborted or never finished)
    #[error("Session is {0}, only completed sessions can be exported")]
    NotCompleted(SessionState),

    /// Storage lookup failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
