//! FTMS (Fitness Machine Service) protocol implementation.
//!
//! Parses Indoor Bike Data (0x2AD2) and Rower Data (0x2AD1) notifications
//! into [`Sample`]s and classifies advertisements by machine type.

use crate::sensors::types::{DeviceKind, Sample};
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// FTMS Service UUID (0x1826)
pub const FTMS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);

/// Indoor Bike Data Characteristic UUID (0x2AD2)
pub const INDOOR_BIKE_DATA_UUID: Uuid = Uuid::from_u128(0x0000_2ad2_0000_1000_8000_0080_5f9b_34fb);

/// Rower Data Characteristic UUID (0x2AD1)
pub const ROWER_DATA_UUID: Uuid = Uuid::from_u128(0x0000_2ad1_0000_1000_8000_0080_5f9b_34fb);

/// Machine-type bits in the FTMS advertisement service data.
const MACHINE_TYPE_ROWER: u16 = 1 << 4;
const MACHINE_TYPE_INDOOR_BIKE: u16 = 1 << 5;

/// "Data not available" marker for total energy.
const ENERGY_NOT_AVAILABLE: u16 = 0xFFFF;

/// Errors while decoding a telemetry frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A flagged field runs past the end of the frame
    #[error("Truncated frame: {field} needs {needed} bytes at offset {offset}, frame has {len}")]
    TruncatedFrame {
        field: &'static str,
        offset: usize,
        needed: usize,
        len: usize,
    },
}

/// Little-endian cursor over a notification payload.
struct FrameReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> FrameReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, field: &'static str, needed: usize) -> Result<&'a [u8], DecodeError> {
        if self.offset + needed > self.data.len() {
            return Err(DecodeError::TruncatedFrame {
                field,
                offset: self.offset,
                needed,
                len: self.data.len(),
            });
        }
        let bytes = &self.data[self.offset..self.offset + needed];
        self.offset += needed;
        Ok(bytes)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(field, 1)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, DecodeError> {
        let b = self.take(field, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i16(&mut self, field: &'static str) -> Result<i16, DecodeError> {
        let b = self.take(field, 2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    fn u24(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        let b = self.take(field, 3)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    /// Expended energy block: total (u16), per hour (u16), per minute (u8).
    fn energy(&mut self) -> Result<Option<u16>, DecodeError> {
        let b = self.take("expended energy", 5)?;
        let total = u16::from_le_bytes([b[0], b[1]]);
        Ok((total != ENERGY_NOT_AVAILABLE).then_some(total))
    }
}

/// Parsed data from Indoor Bike Data characteristic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndoorBikeData {
    /// Instantaneous speed in km/h (if present)
    pub speed_kmh: Option<f32>,
    /// Average speed in km/h (if present)
    pub avg_speed_kmh: Option<f32>,
    /// Instantaneous cadence in RPM (if present)
    pub cadence_rpm: Option<f32>,
    /// Average cadence in RPM (if present)
    pub avg_cadence_rpm: Option<f32>,
    /// Total distance in meters (if present)
    pub total_distance_m: Option<u32>,
    /// Resistance level (if present)
    pub resistance_level: Option<i16>,
    /// Instantaneous power in watts (if present)
    pub power_watts: Option<i16>,
    /// Average power in watts (if present)
    pub avg_power_watts: Option<i16>,
    /// Expended energy in kCal (if present)
    pub energy_kcal: Option<u16>,
    /// Heart rate in BPM (if present)
    pub heart_rate_bpm: Option<u8>,
    /// Metabolic equivalent (if present)
    pub metabolic_equivalent: Option<f32>,
    /// Elapsed time in seconds (if present)
    pub elapsed_time_s: Option<u16>,
    /// Remaining time in seconds (if present)
    pub remaining_time_s: Option<u16>,
}

/// Indoor Bike Data flags (first 2 bytes).
#[derive(Debug, Clone, Copy)]
struct IndoorBikeDataFlags(u16);

impl IndoorBikeDataFlags {
    /// Bit 0 is inverted: instantaneous speed is present when it is clear.
    fn inst_speed_present(self) -> bool {
        self.0 & 0x0001 == 0
    }

    fn has(self, bit: u8) -> bool {
        self.0 & (1 << bit) != 0
    }
}

/// Parse Indoor Bike Data notification.
///
/// The data format is:
/// - Bytes 0-1: Flags (indicates which fields are present)
/// - Remaining bytes: Data fields in order based on flags
///
/// Reserved flag bits (13-15) are ignored.
pub fn parse_indoor_bike_data(data: &[u8]) -> Result<IndoorBikeData, DecodeError> {
    let mut reader = FrameReader::new(data);
    let flags = IndoorBikeDataFlags(reader.u16("flags")?);
    let mut result = IndoorBikeData::default();

    // Speed is in 0.01 km/h units
    if flags.inst_speed_present() {
        result.speed_kmh = Some(reader.u16("instantaneous speed")? as f32 / 100.0);
    }
    if flags.has(1) {
        result.avg_speed_kmh = Some(reader.u16("average speed")? as f32 / 100.0);
    }

    // Cadence is in 0.5 RPM units
    if flags.has(2) {
        result.cadence_rpm = Some(reader.u16("instantaneous cadence")? as f32 * 0.5);
    }
    if flags.has(3) {
        result.avg_cadence_rpm = Some(reader.u16("average cadence")? as f32 * 0.5);
    }

    if flags.has(4) {
        result.total_distance_m = Some(reader.u24("total distance")?);
    }
    if flags.has(5) {
        result.resistance_level = Some(reader.i16("resistance level")?);
    }
    if flags.has(6) {
        result.power_watts = Some(reader.i16("instantaneous power")?);
    }
    if flags.has(7) {
        result.avg_power_watts = Some(reader.i16("average power")?);
    }
    if flags.has(8) {
        result.energy_kcal = reader.energy()?;
    }
    if flags.has(9) {
        result.heart_rate_bpm = Some(reader.u8("heart rate")?);
    }
    if flags.has(10) {
        result.metabolic_equivalent = Some(reader.u8("metabolic equivalent")? as f32 / 10.0);
    }
    if flags.has(11) {
        result.elapsed_time_s = Some(reader.u16("elapsed time")?);
    }
    if flags.has(12) {
        result.remaining_time_s = Some(reader.u16("remaining time")?);
    }

    Ok(result)
}

/// Parsed data from Rower Data characteristic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowerData {
    /// Stroke rate in strokes per minute (if present)
    pub stroke_rate_spm: Option<f32>,
    /// Stroke count (if present)
    pub stroke_count: Option<u16>,
    /// Average stroke rate (if present)
    pub avg_stroke_rate_spm: Option<f32>,
    /// Total distance in meters (if present)
    pub total_distance_m: Option<u32>,
    /// Instantaneous pace in seconds per 500m (if present)
    pub pace_s_per_500m: Option<u16>,
    /// Average pace in seconds per 500m (if present)
    pub avg_pace_s_per_500m: Option<u16>,
    /// Instantaneous power in watts (if present)
    pub power_watts: Option<i16>,
    /// Average power in watts (if present)
    pub avg_power_watts: Option<i16>,
    /// Resistance level (if present)
    pub resistance_level: Option<i16>,
    /// Expended energy in kCal (if present)
    pub energy_kcal: Option<u16>,
    /// Heart rate in BPM (if present)
    pub heart_rate_bpm: Option<u8>,
    /// Metabolic equivalent (if present)
    pub metabolic_equivalent: Option<f32>,
    /// Elapsed time in seconds (if present)
    pub elapsed_time_s: Option<u16>,
    /// Remaining time in seconds (if present)
    pub remaining_time_s: Option<u16>,
}

impl RowerData {
    /// Speed derived from instantaneous pace. Zero pace means standing still
    /// on some machines and "unknown" on others, so it yields `None`.
    pub fn speed_kmh(&self) -> Option<f32> {
        self.pace_s_per_500m
            .filter(|pace| *pace > 0)
            .map(|pace| 1800.0 / pace as f32)
    }
}

/// Parse Rower Data notification.
///
/// Same layout rules as Indoor Bike Data: bit 0 clear means stroke rate and
/// stroke count lead the payload.
pub fn parse_rower_data(data: &[u8]) -> Result<RowerData, DecodeError> {
    let mut reader = FrameReader::new(data);
    let flags = reader.u16("flags")?;
    let has = |bit: u8| flags & (1 << bit) != 0;
    let mut result = RowerData::default();

    if flags & 0x0001 == 0 {
        result.stroke_rate_spm = Some(reader.u8("stroke rate")? as f32 * 0.5);
        result.stroke_count = Some(reader.u16("stroke count")?);
    }
    if has(1) {
        result.avg_stroke_rate_spm = Some(reader.u8("average stroke rate")? as f32 * 0.5);
    }
    if has(2) {
        result.total_distance_m = Some(reader.u24("total distance")?);
    }
    if has(3) {
        result.pace_s_per_500m = Some(reader.u16("instantaneous pace")?);
    }
    if has(4) {
        result.avg_pace_s_per_500m = Some(reader.u16("average pace")?);
    }
    if has(5) {
        result.power_watts = Some(reader.i16("instantaneous power")?);
    }
    if has(6) {
        result.avg_power_watts = Some(reader.i16("average power")?);
    }
    if has(7) {
        result.resistance_level = Some(reader.i16("resistance level")?);
    }
    if has(8) {
        result.energy_kcal = reader.energy()?;
    }
    if has(9) {
        result.heart_rate_bpm = Some(reader.u8("heart rate")?);
    }
    if has(10) {
        result.metabolic_equivalent = Some(reader.u8("metabolic equivalent")? as f32 / 10.0);
    }
    if has(11) {
        result.elapsed_time_s = Some(reader.u16("elapsed time")?);
    }
    if has(12) {
        result.remaining_time_s = Some(reader.u16("remaining time")?);
    }

    Ok(result)
}

/// Decode one telemetry frame into a [`Sample`].
pub fn decode(
    kind: DeviceKind,
    frame: &[u8],
    timestamp: DateTime<Utc>,
) -> Result<Sample, DecodeError> {
    let mut sample = Sample::new(kind, timestamp);

    match kind {
        DeviceKind::Bike => {
            let parsed = parse_indoor_bike_data(frame)?;
            sample.power_watts = parsed.power_watts;
            sample.cadence_rpm = parsed.cadence_rpm;
            sample.speed_kmh = parsed.speed_kmh;
            sample.heart_rate_bpm = parsed.heart_rate_bpm;
            sample.distance_m = parsed.total_distance_m;
            sample.calories_kcal = parsed.energy_kcal;
            sample.resistance_level = parsed.resistance_level;
            sample.elapsed_time_s = parsed.elapsed_time_s;
        }
        DeviceKind::Rower => {
            let parsed = parse_rower_data(frame)?;
            sample.speed_kmh = parsed.speed_kmh();
            sample.power_watts = parsed.power_watts;
            sample.stroke_rate_spm = parsed.stroke_rate_spm;
            sample.stroke_count = parsed.stroke_count;
            sample.heart_rate_bpm = parsed.heart_rate_bpm;
            sample.distance_m = parsed.total_distance_m;
            sample.calories_kcal = parsed.energy_kcal;
            sample.resistance_level = parsed.resistance_level;
            sample.elapsed_time_s = parsed.elapsed_time_s;
        }
    }

    Ok(sample)
}

/// Machine kind from the FTMS service data of an advertisement.
///
/// Service data is one flags byte followed by the 16-bit machine type field.
pub fn kind_from_service_data(service_data: &[u8]) -> Option<DeviceKind> {
    if service_data.len() < 3 {
        return None;
    }
    let machine_type = u16::from_le_bytes([service_data[1], service_data[2]]);
    if machine_type & MACHINE_TYPE_ROWER != 0 {
        Some(DeviceKind::Rower)
    } else if machine_type & MACHINE_TYPE_INDOOR_BIKE != 0 {
        Some(DeviceKind::Bike)
    } else {
        None
    }
}

/// Machine kind guessed from the advertised name.
pub fn kind_from_name(name: &str) -> Option<DeviceKind> {
    let name = name.to_ascii_lowercase();
    if name.contains("row") {
        Some(DeviceKind::Rower)
    } else if ["bike", "echo", "cycle"].iter().any(|hint| name.contains(hint)) {
        Some(DeviceKind::Bike)
    } else {
        None
    }
}
