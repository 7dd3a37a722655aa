//! FIT file export for finished workout sessions.
//!
//! Implements the FIT (Flexible and Interoperable Data Transfer) binary
//! activity layout:
//! - 14-byte file header with header CRC
//! - `file_id`, `activity`, `session` and a single `lap`
//! - `device_info` for the recording device
//! - one `record` per retained sample, with timer `event`s at the start, at
//!   each pause and resume, and at the end
//! - trailing file CRC

use crate::recording::types::{ExportConfig, ExportError, SessionRecord, SessionSummary};
use crate::sensors::types::{DeviceKind, Sample};
use chrono::{DateTime, Utc};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// FIT epoch offset: FIT timestamps are seconds since 1989-12-31 00:00:00 UTC
const FIT_EPOCH_OFFSET: i64 = 631065600;

/// FIT file header size (14 bytes for header + protocol version)
const FIT_HEADER_SIZE: u8 = 14;

/// FIT protocol version
const FIT_PROTOCOL_VERSION: u8 = 0x20; // 2.0

/// FIT profile version (21.00)
const FIT_PROFILE_VERSION: u16 = 2100;

/// FIT message types
mod message_type {
    pub const FILE_ID: u16 = 0;
    pub const SESSION: u16 = 18;
    pub const LAP: u16 = 19;
    pub const RECORD: u16 = 20;
    pub const EVENT: u16 = 21;
    pub const DEVICE_INFO: u16 = 23;
    pub const ACTIVITY: u16 = 34;
}

/// Local message numbers used in this file
mod local {
    pub const FILE_ID: u8 = 0;
    pub const ACTIVITY: u8 = 1;
    pub const SESSION: u8 = 2;
    pub const LAP: u8 = 3;
    pub const RECORD: u8 = 4;
    pub const DEVICE_INFO: u8 = 5;
    pub const EVENT: u8 = 6;
}

/// FIT base types
mod base_type {
    pub const ENUM: u8 = 0x00;
    pub const UINT8: u8 = 0x02;
    pub const UINT16: u8 = 0x84;
    pub const UINT32: u8 = 0x86;
    pub const UINT32Z: u8 = 0x8C;
}

/// Invalid values per base type
mod invalid {
    pub const UINT8: u8 = 0xFF;
    pub const UINT16: u16 = 0xFFFF;
    pub const UINT32: u32 = 0xFFFF_FFFF;
}

/// `record` message field numbers
mod record_field {
    pub const TIMESTAMP: u8 = 253;
    pub const HEART_RATE: u8 = 3;
    pub const CADENCE: u8 = 4;
    pub const DISTANCE: u8 = 5;
    pub const SPEED: u8 = 6;
    pub const POWER: u8 = 7;
    pub const TOTAL_CYCLES: u8 = 19;
    pub const CALORIES: u8 = 33;
}

/// Profile enum values
mod profile {
    pub const FILE_TYPE_ACTIVITY: u8 = 4;
    pub const ACTIVITY_MANUAL: u8 = 0;
    pub const EVENT_TIMER: u8 = 0;
    pub const EVENT_SESSION: u8 = 8;
    pub const EVENT_LAP: u8 = 9;
    pub const EVENT_ACTIVITY: u8 = 26;
    pub const EVENT_TYPE_START: u8 = 0;
    pub const EVENT_TYPE_STOP: u8 = 1;
    pub const EVENT_TYPE_STOP_ALL: u8 = 4;
    pub const DEVICE_INDEX_CREATOR: u8 = 0;
    pub const SESSION_TRIGGER_ACTIVITY_END: u8 = 0;
    pub const LAP_TRIGGER_SESSION_END: u8 = 7;
    pub const SPORT_CYCLING: u8 = 2;
    pub const SPORT_ROWING: u8 = 15;
    pub const SUB_SPORT_INDOOR_CYCLING: u8 = 6;
    pub const SUB_SPORT_INDOOR_ROWING: u8 = 14;
}

/// FIT file writer
struct FitWriter {
    buffer: Cursor<Vec<u8>>,
    data_size: u32,
}

impl FitWriter {
    fn new() -> Self {
        Self {
            buffer: Cursor::new(Vec::new()),
            data_size: 0,
        }
    }

    /// Write the FIT file header with placeholders for data size and CRC
    fn write_header(&mut self) -> Result<(), ExportError> {
        self.buffer.write_all(&[FIT_HEADER_SIZE])?;
        self.buffer.write_all(&[FIT_PROTOCOL_VERSION])?;
        self.buffer.write_all(&FIT_PROFILE_VERSION.to_le_bytes())?;
        self.buffer.write_all(&0u32.to_le_bytes())?;
        self.buffer.write_all(b".FIT")?;
        self.buffer.write_all(&0u16.to_le_bytes())?;
        Ok(())
    }

    /// Write a definition message
    fn write_definition(
        &mut self,
        local_mesg_num: u8,
        global_mesg_num: u16,
        fields: &[(u8, u8, u8)], // (field_def_num, size, base_type)
    ) -> Result<(), ExportError> {
        // Record header: definition message (bit 6 set), local message num in bits 0-3
        self.write_byte(0x40 | (local_mesg_num & 0x0F))?;
        // Reserved
        self.write_byte(0)?;
        // Architecture: 0 = little endian
        self.write_byte(0)?;
        self.write_u16(global_mesg_num)?;
        self.write_byte(fields.len() as u8)?;

        for (field_num, size, base_type) in fields {
            self.write_byte(*field_num)?;
            self.write_byte(*size)?;
            self.write_byte(*base_type)?;
        }

        Ok(())
    }

    /// Write a data message header
    fn write_data_header(&mut self, local_mesg_num: u8) -> Result<(), ExportError> {
        self.write_byte(local_mesg_num & 0x0F)
    }

    fn write_byte(&mut self, value: u8) -> Result<(), ExportError> {
        self.buffer.write_all(&[value])?;
        self.data_size += 1;
        Ok(())
    }

    fn write_u16(&mut self, value: u16) -> Result<(), ExportError> {
        self.buffer.write_all(&value.to_le_bytes())?;
        self.data_size += 2;
        Ok(())
    }

    fn write_u32(&mut self, value: u32) -> Result<(), ExportError> {
        self.buffer.write_all(&value.to_le_bytes())?;
        self.data_size += 4;
        Ok(())
    }

    /// Patch data size and header CRC, then append the file CRC
    fn finalize(self) -> Vec<u8> {
        let mut data = self.buffer.into_inner();

        data[4..8].copy_from_slice(&self.data_size.to_le_bytes());
        let header_crc = calculate_crc(&data[0..12]);
        data[12..14].copy_from_slice(&header_crc.to_le_bytes());

        let file_crc = calculate_crc(&data);
        data.extend_from_slice(&file_crc.to_le_bytes());

        data
    }
}

/// Calculate the FIT CRC-16.
pub fn calculate_crc(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    let crc_table: [u16; 16] = [
        0x0000, 0xCC01, 0xD801, 0x1400, 0xF001, 0x3C00, 0x2800, 0xE401, 0xA001, 0x6C00, 0x7800,
        0xB401, 0x5000, 0x9C01, 0x8801, 0x4400,
    ];

    for byte in data {
        let tmp = crc_table[(crc & 0xF) as usize];
        crc = (crc >> 4) & 0x0FFF;
        crc = crc ^ tmp ^ crc_table[(*byte & 0xF) as usize];

        let tmp = crc_table[(crc & 0xF) as usize];
        crc = (crc >> 4) & 0x0FFF;
        crc = crc ^ tmp ^ crc_table[((*byte >> 4) & 0xF) as usize];
    }

    crc
}

/// Convert a UTC time to a FIT timestamp.
pub fn fit_timestamp(dt: DateTime<Utc>) -> u32 {
    (dt.timestamp() - FIT_EPOCH_OFFSET).clamp(0, u32::MAX as i64 - 1) as u32
}

fn fit_u8(value: Option<f64>) -> u8 {
    value
        .filter(|v| v.is_finite())
        .map(|v| v.round().clamp(0.0, (invalid::UINT8 - 1) as f64) as u8)
        .unwrap_or(invalid::UINT8)
}

fn fit_u16(value: Option<f64>) -> u16 {
    value
        .filter(|v| v.is_finite())
        .map(|v| v.round().clamp(0.0, (invalid::UINT16 - 1) as f64) as u16)
        .unwrap_or(invalid::UINT16)
}

fn fit_u32(value: Option<f64>) -> u32 {
    value
        .filter(|v| v.is_finite())
        .map(|v| v.round().clamp(0.0, (invalid::UINT32 - 1) as f64) as u32)
        .unwrap_or(invalid::UINT32)
}

/// km/h to FIT speed (m/s × 1000).
fn fit_speed(kmh: Option<f32>) -> u16 {
    fit_u16(kmh.map(|v| v as f64 / 3.6 * 1000.0))
}

/// Seconds to FIT time (s × 1000).
fn fit_duration(secs: f64) -> u32 {
    fit_u32(Some(secs * 1000.0))
}

/// Meters to FIT distance (m × 100).
fn fit_distance(meters: Option<u32>) -> u32 {
    fit_u32(meters.map(|m| m as f64 * 100.0))
}

fn sport(kind: DeviceKind) -> (u8, u8) {
    match kind {
        DeviceKind::Bike => (profile::SPORT_CYCLING, profile::SUB_SPORT_INDOOR_CYCLING),
        DeviceKind::Rower => (profile::SPORT_ROWING, profile::SUB_SPORT_INDOOR_ROWING),
    }
}

/// Fold a session id into a non-zero serial number.
fn serial_number(id: Uuid) -> u32 {
    let bits = id.as_u128();
    let folded = (bits as u32) ^ ((bits >> 32) as u32) ^ ((bits >> 64) as u32) ^ ((bits >> 96) as u32);
    folded.max(1)
}

/// Encode a completed session with the default device identity.
pub fn encode(record: &SessionRecord) -> Result<Vec<u8>, ExportError> {
    encode_with(record, &ExportConfig::default())
}

/// Encode a completed session as a FIT activity file.
pub fn encode_with(record: &SessionRecord, config: &ExportConfig) -> Result<Vec<u8>, ExportError> {
    if record.samples.is_empty() {
        return Err(ExportError::EmptySession);
    }
    let summary = record
        .summary
        .as_ref()
        .ok_or(ExportError::NotCompleted(record.state))?;

    let ended_at = record
        .ended_at
        .or_else(|| record.samples.last().map(|s| s.timestamp))
        .unwrap_or(record.started_at);

    let mut writer = FitWriter::new();
    writer.write_header()?;

    write_file_id(&mut writer, record, config)?;
    write_activity(&mut writer, ended_at, summary, config)?;
    write_session(&mut writer, record, ended_at, summary)?;
    write_lap(&mut writer, record, ended_at, summary)?;
    write_device_info(&mut writer, record, config)?;
    writer.write_definition(local::EVENT, message_type::EVENT, &EVENT_FIELDS)?;
    write_records(&mut writer, &record.samples, &timer_events(record, ended_at))?;

    let bytes = writer.finalize();
    tracing::debug!(
        session_id = %record.id,
        records = record.samples.len(),
        bytes = bytes.len(),
        "Encoded FIT activity"
    );
    Ok(bytes)
}

/// Suggested filename, e.g. `bike_20240131_075501.fit`.
pub fn suggested_filename(record: &SessionRecord) -> String {
    format!(
        "{}_{}.fit",
        record.kind.as_str(),
        record.started_at.format("%Y%m%d_%H%M%S")
    )
}

/// Encode a session and write it into `dir` under its suggested filename.
pub fn write_activity_file(
    record: &SessionRecord,
    config: &ExportConfig,
    dir: &Path,
) -> Result<PathBuf, ExportError> {
    let bytes = encode_with(record, config)?;
    std::fs::create_dir_all(dir)?;
    let path = dir.join(suggested_filename(record));
    std::fs::write(&path, bytes)?;
    tracing::info!("Wrote activity file {}", path.display());
    Ok(path)
}

fn write_file_id(
    writer: &mut FitWriter,
    record: &SessionRecord,
    config: &ExportConfig,
) -> Result<(), ExportError> {
    let fields = [
        (0, 1, base_type::ENUM),    // type
        (1, 2, base_type::UINT16),  // manufacturer
        (2, 2, base_type::UINT16),  // product
        (3, 4, base_type::UINT32Z), // serial_number
        (4, 4, base_type::UINT32),  // time_created
    ];
    writer.write_definition(local::FILE_ID, message_type::FILE_ID, &fields)?;

    writer.write_data_header(local::FILE_ID)?;
    writer.write_byte(profile::FILE_TYPE_ACTIVITY)?;
    writer.write_u16(config.manufacturer)?;
    writer.write_u16(config.product)?;
    writer.write_u32(serial_number(record.id))?;
    writer.write_u32(fit_timestamp(record.started_at))?;

    Ok(())
}

fn write_activity(
    writer: &mut FitWriter,
    ended_at: DateTime<Utc>,
    summary: &SessionSummary,
    config: &ExportConfig,
) -> Result<(), ExportError> {
    let fields = [
        (253, 4, base_type::UINT32), // timestamp
        (0, 4, base_type::UINT32),   // total_timer_time
        (1, 2, base_type::UINT16),   // num_sessions
        (2, 1, base_type::ENUM),     // type
        (3, 1, base_type::ENUM),     // event
        (4, 1, base_type::ENUM),     // event_type
        (5, 4, base_type::UINT32),   // local_timestamp
    ];
    writer.write_definition(local::ACTIVITY, message_type::ACTIVITY, &fields)?;

    let offset = config.utc_offset_secs();
    let timestamp = fit_timestamp(ended_at);

    writer.write_data_header(local::ACTIVITY)?;
    writer.write_u32(timestamp)?;
    writer.write_u32(fit_duration(summary.total_timer_secs))?;
    writer.write_u16(1)?;
    writer.write_byte(profile::ACTIVITY_MANUAL)?;
    writer.write_byte(profile::EVENT_ACTIVITY)?;
    writer.write_byte(profile::EVENT_TYPE_STOP)?;
    writer.write_u32((timestamp as i64 + offset).clamp(0, u32::MAX as i64 - 1) as u32)?;

    Ok(())
}

/// Cadence-like aggregates: cadence for bikes, stroke rate for rowers.
fn cadence_aggregates(kind: DeviceKind, summary: &SessionSummary) -> (Option<f32>, Option<f32>) {
    match kind {
        DeviceKind::Bike => (summary.avg_cadence, summary.max_cadence),
        DeviceKind::Rower => (summary.avg_stroke_rate, summary.max_stroke_rate),
    }
}

fn write_session(
    writer: &mut FitWriter,
    record: &SessionRecord,
    ended_at: DateTime<Utc>,
    summary: &SessionSummary,
) -> Result<(), ExportError> {
    let fields = [
        (253, 4, base_type::UINT32), // timestamp
        (0, 1, base_type::ENUM),     // event
        (1, 1, base_type::ENUM),     // event_type
        (2, 4, base_type::UINT32),   // start_time
        (5, 1, base_type::ENUM),     // sport
        (6, 1, base_type::ENUM),     // sub_sport
        (7, 4, base_type::UINT32),   // total_elapsed_time
        (8, 4, base_type::UINT32),   // total_timer_time
        (9, 4, base_type::UINT32),   // total_distance
        (10, 4, base_type::UINT32),  // total_cycles
        (11, 2, base_type::UINT16),  // total_calories
        (14, 2, base_type::UINT16),  // avg_speed
        (15, 2, base_type::UINT16),  // max_speed
        (16, 1, base_type::UINT8),   // avg_heart_rate
        (17, 1, base_type::UINT8),   // max_heart_rate
        (18, 1, base_type::UINT8),   // avg_cadence
        (19, 1, base_type::UINT8),   // max_cadence
        (20, 2, base_type::UINT16),  // avg_power
        (21, 2, base_type::UINT16),  // max_power
        (25, 2, base_type::UINT16),  // first_lap_index
        (26, 2, base_type::UINT16),  // num_laps
        (28, 1, base_type::ENUM),    // trigger
    ];
    writer.write_definition(local::SESSION, message_type::SESSION, &fields)?;

    let (sport, sub_sport) = sport(record.kind);
    let (avg_cadence, max_cadence) = cadence_aggregates(record.kind, summary);

    writer.write_data_header(local::SESSION)?;
    writer.write_u32(fit_timestamp(ended_at))?;
    writer.write_byte(profile::EVENT_SESSION)?;
    writer.write_byte(profile::EVENT_TYPE_STOP)?;
    writer.write_u32(fit_timestamp(record.started_at))?;
    writer.write_byte(sport)?;
    writer.write_byte(sub_sport)?;
    writer.write_u32(fit_duration(summary.total_elapsed_secs))?;
    writer.write_u32(fit_duration(summary.total_timer_secs))?;
    writer.write_u32(fit_distance(summary.total_distance_m))?;
    writer.write_u32(fit_u32(summary.total_strokes.map(f64::from)))?;
    writer.write_u16(fit_u16(summary.total_calories.map(f64::from)))?;
    writer.write_u16(fit_speed(summary.avg_speed_kmh))?;
    writer.write_u16(fit_speed(summary.max_speed_kmh))?;
    writer.write_byte(fit_u8(summary.avg_heart_rate.map(f64::from)))?;
    writer.write_byte(fit_u8(summary.max_heart_rate.map(f64::from)))?;
    writer.write_byte(fit_u8(avg_cadence.map(f64::from)))?;
    writer.write_byte(fit_u8(max_cadence.map(f64::from)))?;
    writer.write_u16(fit_u16(summary.avg_power.map(f64::from)))?;
    writer.write_u16(fit_u16(summary.max_power.map(f64::from)))?;
    writer.write_u16(0)?;
    writer.write_u16(1)?;
    writer.write_byte(profile::SESSION_TRIGGER_ACTIVITY_END)?;

    Ok(())
}

fn write_lap(
    writer: &mut FitWriter,
    record: &SessionRecord,
    ended_at: DateTime<Utc>,
    summary: &SessionSummary,
) -> Result<(), ExportError> {
    let fields = [
        (253, 4, base_type::UINT32), // timestamp
        (0, 1, base_type::ENUM),     // event
        (1, 1, base_type::ENUM),     // event_type
        (2, 4, base_type::UINT32),   // start_time
        (7, 4, base_type::UINT32),   // total_elapsed_time
        (8, 4, base_type::UINT32),   // total_timer_time
        (9, 4, base_type::UINT32),   // total_distance
        (10, 4, base_type::UINT32),  // total_cycles
        (11, 2, base_type::UINT16),  // total_calories
        (13, 2, base_type::UINT16),  // avg_speed
        (14, 2, base_type::UINT16),  // max_speed
        (15, 1, base_type::UINT8),   // avg_heart_rate
        (16, 1, base_type::UINT8),   // max_heart_rate
        (17, 1, base_type::UINT8),   // avg_cadence
        (18, 1, base_type::UINT8),   // max_cadence
        (19, 2, base_type::UINT16),  // avg_power
        (20, 2, base_type::UINT16),  // max_power
        (24, 1, base_type::ENUM),    // lap_trigger
        (25, 1, base_type::ENUM),    // sport
    ];
    writer.write_definition(local::LAP, message_type::LAP, &fields)?;

    let (sport, _) = sport(record.kind);
    let (avg_cadence, max_cadence) = cadence_aggregates(record.kind, summary);

    writer.write_data_header(local::LAP)?;
    writer.write_u32(fit_timestamp(ended_at))?;
    writer.write_byte(profile::EVENT_LAP)?;
    writer.write_byte(profile::EVENT_TYPE_STOP)?;
    writer.write_u32(fit_timestamp(record.started_at))?;
    writer.write_u32(fit_duration(summary.total_elapsed_secs))?;
    writer.write_u32(fit_duration(summary.total_timer_secs))?;
    writer.write_u32(fit_distance(summary.total_distance_m))?;
    writer.write_u32(fit_u32(summary.total_strokes.map(f64::from)))?;
    writer.write_u16(fit_u16(summary.total_calories.map(f64::from)))?;
    writer.write_u16(fit_speed(summary.avg_speed_kmh))?;
    writer.write_u16(fit_speed(summary.max_speed_kmh))?;
    writer.write_byte(fit_u8(summary.avg_heart_rate.map(f64::from)))?;
    writer.write_byte(fit_u8(summary.max_heart_rate.map(f64::from)))?;
    writer.write_byte(fit_u8(avg_cadence.map(f64::from)))?;
    writer.write_byte(fit_u8(max_cadence.map(f64::from)))?;
    writer.write_u16(fit_u16(summary.avg_power.map(f64::from)))?;
    writer.write_u16(fit_u16(summary.max_power.map(f64::from)))?;
    writer.write_byte(profile::LAP_TRIGGER_SESSION_END)?;
    writer.write_byte(sport)?;

    Ok(())
}

fn write_device_info(
    writer: &mut FitWriter,
    record: &SessionRecord,
    config: &ExportConfig,
) -> Result<(), ExportError> {
    let fields = [
        (253, 4, base_type::UINT32), // timestamp
        (0, 1, base_type::UINT8),    // device_index
        (2, 2, base_type::UINT16),   // manufacturer
        (3, 4, base_type::UINT32Z),  // serial_number
        (4, 2, base_type::UINT16),   // product
        (5, 2, base_type::UINT16),   // software_version
        (6, 1, base_type::UINT8),    // hardware_version
    ];
    writer.write_definition(local::DEVICE_INFO, message_type::DEVICE_INFO, &fields)?;

    writer.write_data_header(local::DEVICE_INFO)?;
    writer.write_u32(fit_timestamp(record.started_at))?;
    writer.write_byte(profile::DEVICE_INDEX_CREATOR)?;
    writer.write_u16(config.manufacturer)?;
    writer.write_u32(serial_number(record.id))?;
    writer.write_u16(config.product)?;
    writer.write_u16(config.software_version)?;
    writer.write_byte(config.hardware_version)?;

    Ok(())
}

const EVENT_FIELDS: [(u8, u8, u8); 3] = [
    (253, 4, base_type::UINT32), // timestamp
    (0, 1, base_type::ENUM),     // event
    (1, 1, base_type::ENUM),     // event_type
];

/// A timer `event` placed among the records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimerEvent {
    at: DateTime<Utc>,
    event_type: u8,
}

impl TimerEvent {
    /// Whether the event goes before a record stamped `timestamp`.
    ///
    /// A stop follows the record that shares its timestamp, a start precedes it.
    fn precedes(&self, timestamp: DateTime<Utc>) -> bool {
        if self.event_type == profile::EVENT_TYPE_START {
            self.at <= timestamp
        } else {
            self.at < timestamp
        }
    }

    fn write(&self, writer: &mut FitWriter) -> Result<(), ExportError> {
        writer.write_data_header(local::EVENT)?;
        writer.write_u32(fit_timestamp(self.at))?;
        writer.write_byte(profile::EVENT_TIMER)?;
        writer.write_byte(self.event_type)
    }
}

/// Timer start, stop-all and start around each pause, and the final stop.
fn timer_events(record: &SessionRecord, ended_at: DateTime<Utc>) -> Vec<TimerEvent> {
    let event = |at, event_type| TimerEvent { at, event_type };

    let mut events = vec![event(record.started_at, profile::EVENT_TYPE_START)];
    for pause in &record.pauses {
        events.push(event(pause.started_at, profile::EVENT_TYPE_STOP_ALL));
        if let Some(resumed) = pause.ended_at {
            events.push(event(resumed, profile::EVENT_TYPE_START));
        }
    }
    events.push(event(ended_at, profile::EVENT_TYPE_STOP));
    events
}

/// Optional fields of the `record` message, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordField {
    HeartRate,
    Cadence,
    Distance,
    Speed,
    Power,
    TotalCycles,
    Calories,
}

impl RecordField {
    const ALL: [RecordField; 7] = [
        RecordField::HeartRate,
        RecordField::Cadence,
        RecordField::Distance,
        RecordField::Speed,
        RecordField::Power,
        RecordField::TotalCycles,
        RecordField::Calories,
    ];

    fn definition(self) -> (u8, u8, u8) {
        match self {
            RecordField::HeartRate => (record_field::HEART_RATE, 1, base_type::UINT8),
            RecordField::Cadence => (record_field::CADENCE, 1, base_type::UINT8),
            RecordField::Distance => (record_field::DISTANCE, 4, base_type::UINT32),
            RecordField::Speed => (record_field::SPEED, 2, base_type::UINT16),
            RecordField::Power => (record_field::POWER, 2, base_type::UINT16),
            RecordField::TotalCycles => (record_field::TOTAL_CYCLES, 4, base_type::UINT32),
            RecordField::Calories => (record_field::CALORIES, 2, base_type::UINT16),
        }
    }

    fn is_present(self, sample: &Sample) -> bool {
        match self {
            RecordField::HeartRate => sample.heart_rate_bpm.is_some(),
            RecordField::Cadence => sample.cadence_like().is_some(),
            RecordField::Distance => sample.distance_m.is_some(),
            RecordField::Speed => sample.speed_kmh.is_some(),
            RecordField::Power => sample.power_watts.is_some(),
            RecordField::TotalCycles => sample.stroke_count.is_some(),
            RecordField::Calories => sample.calories_kcal.is_some(),
        }
    }

    fn write(self, writer: &mut FitWriter, sample: &Sample) -> Result<(), ExportError> {
        match self {
            RecordField::HeartRate => {
                writer.write_byte(fit_u8(sample.heart_rate_bpm.map(f64::from)))
            }
            RecordField::Cadence => writer.write_byte(fit_u8(sample.cadence_like().map(f64::from))),
            RecordField::Distance => writer.write_u32(fit_distance(sample.distance_m)),
            RecordField::Speed => writer.write_u16(fit_speed(sample.speed_kmh)),
            // Negative power is recorded as zero
            RecordField::Power => writer.write_u16(fit_u16(
                sample.power_watts.map(|p| f64::from(p.max(0))),
            )),
            RecordField::TotalCycles => {
                writer.write_u32(fit_u32(sample.stroke_count.map(f64::from)))
            }
            RecordField::Calories => {
                writer.write_u16(fit_u16(sample.calories_kcal.map(f64::from)))
            }
        }
    }
}

/// Write the record definition and one record per sample, placing each
/// timer event by its timestamp. The event definition must already be written.
fn write_records(
    writer: &mut FitWriter,
    samples: &[Sample],
    events: &[TimerEvent],
) -> Result<(), ExportError> {
    let present: Vec<RecordField> = RecordField::ALL
        .into_iter()
        .filter(|field| samples.iter().any(|s| field.is_present(s)))
        .collect();

    let mut fields = vec![(record_field::TIMESTAMP, 4, base_type::UINT32)];
    fields.extend(present.iter().map(|field| field.definition()));
    writer.write_definition(local::RECORD, message_type::RECORD, &fields)?;

    let mut pending = events.iter().peekable();
    for sample in samples {
        while let Some(event) = pending.next_if(|e| e.precedes(sample.timestamp)) {
            event.write(writer)?;
        }
        writer.write_data_header(local::RECORD)?;
        writer.write_u32(fit_timestamp(sample.timestamp))?;
        for field in &present {
            field.write(writer, sample)?;
        }
    }
    for event in pending {
        event.write(writer)?;
    }

    Ok(())
}
