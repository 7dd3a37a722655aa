//! Database operations using rusqlite.

use crate::recording::types::{PauseInterval, SessionRecord, SessionState, SessionSummary};
use crate::sensors::types::{DeviceKind, Sample};
use crate::storage::schema::{CURRENT_VERSION, SCHEMA, SCHEMA_VERSION_TABLE};
use crate::storage::store::WorkoutStore;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Result as SqliteResult};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

/// Database wrapper for SQLite operations.
pub struct Database {
    conn: Connection,
}

/// Workout metadata without samples, for listings.
#[derive(Debug, Clone)]
pub struct WorkoutOverview {
    pub id: Uuid,
    pub kind: DeviceKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub state: SessionState,
    pub summary: Option<SessionSummary>,
    pub sample_count: usize,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::IoError(e.to_string()))?;
        }

        let conn =
            Connection::open(path).map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        let db = Self { conn };
        db.initialize()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        let db = Self { conn };
        db.initialize()?;

        Ok(db)
    }

    /// Initialize the database schema.
    fn initialize(&self) -> Result<(), DatabaseError> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        // Create schema version table
        self.conn
            .execute_batch(SCHEMA_VERSION_TABLE)
            .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;

        // Check current version
        let current_version = self.get_schema_version()?;

        if current_version < CURRENT_VERSION {
            self.migrate(current_version)?;
        }

        Ok(())
    }

    /// Get the current schema version.
    fn get_schema_version(&self) -> Result<i32, DatabaseError> {
        let result: SqliteResult<i32> = self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        );

        match result {
            Ok(version) => Ok(version),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(DatabaseError::QueryFailed(e.to_string())),
        }
    }

    /// Run database migrations.
    fn migrate(&self, from_version: i32) -> Result<(), DatabaseError> {
        if from_version < 1 {
            self.conn
                .execute_batch(SCHEMA)
                .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;

            self.conn
                .execute(
                    "INSERT INTO schema_version (version, applied_at) VALUES (?, datetime('now'))",
                    [CURRENT_VERSION],
                )
                .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;

            tracing::info!("Database migrated to version {}", CURRENT_VERSION);
        }

        Ok(())
    }

    // ========== Workout Operations ==========

    /// List workouts, newest first.
    pub fn list_workouts(
        &self,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<WorkoutOverview>, DatabaseError> {
        let limit = limit.unwrap_or(100);
        let offset = offset.unwrap_or(0);

        let mut stmt = self
            .conn
            .prepare(
                "SELECT w.id, w.device_kind, w.started_at, w.ended_at, w.state, w.abort_reason,
                 w.summary_json, w.pauses_json,
                 (SELECT COUNT(*) FROM workout_samples s WHERE s.workout_id = w.id)
                 FROM workouts w ORDER BY w.started_at DESC LIMIT ?1 OFFSET ?2",
            )
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;

        let rows = stmt
            .query_map(params![limit, offset], |row| {
                Ok((WorkoutRow::from_row(row)?, row.get::<_, i64>(8)?))
            })
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;

        let mut workouts = Vec::new();
        for row in rows {
            let (row, count) = row.map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;
            let record = row.into_record(Vec::new())?;
            workouts.push(WorkoutOverview {
                id: record.id,
                kind: record.kind,
                started_at: record.started_at,
                ended_at: record.ended_at,
                state: record.state,
                summary: record.summary,
                sample_count: count as usize,
            });
        }

        Ok(workouts)
    }

    /// Delete a workout by ID (cascades to samples).
    pub fn delete_workout(&self, id: &Uuid) -> Result<(), DatabaseError> {
        let rows_affected = self
            .conn
            .execute("DELETE FROM workouts WHERE id = ?1", params![id.to_string()])
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;

        if rows_affected == 0 {
            return Err(DatabaseError::NotFound(format!("Workout {}", id)));
        }

        Ok(())
    }

    /// Count stored workouts.
    pub fn count_workouts(&self) -> Result<usize, DatabaseError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM workouts", [], |row| row.get(0))
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;

        Ok(count as usize)
    }

    /// Get the samples of a workout in arrival order.
    pub fn get_workout_samples(
        &self,
        workout_id: &Uuid,
        kind: DeviceKind,
    ) -> Result<Vec<Sample>, DatabaseError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT timestamp, power_watts, cadence_rpm, speed_kmh, stroke_rate_spm,
                 stroke_count, heart_rate_bpm, distance_m, calories_kcal, resistance_level,
                 elapsed_time_s
                 FROM workout_samples WHERE workout_id = ?1 ORDER BY id",
            )
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;

        let rows = stmt
            .query_map(params![workout_id.to_string()], |row| {
                Ok(SampleRow {
                    timestamp: row.get(0)?,
                    power_watts: row.get(1)?,
                    cadence_rpm: row.get(2)?,
                    speed_kmh: row.get(3)?,
                    stroke_rate_spm: row.get(4)?,
                    stroke_count: row.get(5)?,
                    heart_rate_bpm: row.get(6)?,
                    distance_m: row.get(7)?,
                    calories_kcal: row.get(8)?,
                    resistance_level: row.get(9)?,
                    elapsed_time_s: row.get(10)?,
                })
            })
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;

        let mut samples = Vec::new();
        for row in rows {
            let row = row.map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;
            samples.push(row.into_sample(kind)?);
        }

        Ok(samples)
    }
}

impl WorkoutStore for Database {
    fn create_workout(
        &mut self,
        workout_id: Uuid,
        kind: DeviceKind,
        started_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO workouts (id, device_kind, started_at, state, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    workout_id.to_string(),
                    kind.as_str(),
                    started_at.to_rfc3339(),
                    SessionState::Recording.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;

        Ok(())
    }

    fn append_data_point(&mut self, workout_id: Uuid, sample: &Sample) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO workout_samples (workout_id, timestamp, power_watts, cadence_rpm,
                 speed_kmh, stroke_rate_spm, stroke_count, heart_rate_bpm, distance_m,
                 calories_kcal, resistance_level, elapsed_time_s)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    workout_id.to_string(),
                    sample.timestamp.to_rfc3339(),
                    sample.power_watts,
                    sample.cadence_rpm,
                    sample.speed_kmh,
                    sample.stroke_rate_spm,
                    sample.stroke_count,
                    sample.heart_rate_bpm,
                    sample.distance_m,
                    sample.calories_kcal,
                    sample.resistance_level,
                    sample.elapsed_time_s,
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, msg)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    DatabaseError::ConstraintViolation(msg.unwrap_or_else(|| err.to_string()))
                }
                other => DatabaseError::QueryFailed(other.to_string()),
            })?;

        Ok(())
    }

    fn finalize_workout(
        &mut self,
        workout_id: Uuid,
        record: &SessionRecord,
    ) -> Result<(), DatabaseError> {
        let summary_json = record
            .summary
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::SerializationError(e.to_string()))?;
        let pauses_json = serde_json::to_string(&record.pauses)
            .map_err(|e| DatabaseError::SerializationError(e.to_string()))?;

        let rows_affected = self
            .conn
            .execute(
                "UPDATE workouts SET ended_at = ?2, state = ?3, abort_reason = ?4,
                 summary_json = ?5, pauses_json = ?6 WHERE id = ?1",
                params![
                    workout_id.to_string(),
                    record.ended_at.map(|dt| dt.to_rfc3339()),
                    record.state.as_str(),
                    record.abort_reason,
                    summary_json,
                    pauses_json,
                ],
            )
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;

        if rows_affected == 0 {
            return Err(DatabaseError::NotFound(format!("Workout {}", workout_id)));
        }

        Ok(())
    }

    fn get_workout(&self, workout_id: Uuid) -> Result<Option<SessionRecord>, DatabaseError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, device_kind, started_at, ended_at, state, abort_reason,
                 summary_json, pauses_json
                 FROM workouts WHERE id = ?1",
            )
            .map_err(|e| DatabaseError::QueryFailed(e.to_string()))?;

        let result = stmt.query_row(params![workout_id.to_string()], WorkoutRow::from_row);

        match result {
            Ok(row) => {
                let kind = parse_kind(&row.device_kind)?;
                let samples = self.get_workout_samples(&workout_id, kind)?;
                Ok(Some(row.into_record(samples)?))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DatabaseError::QueryFailed(e.to_string())),
        }
    }
}

/// Intermediate struct for reading workout rows from database.
struct WorkoutRow {
    id: String,
    device_kind: String,
    started_at: String,
    ended_at: Option<String>,
    state: String,
    abort_reason: Option<String>,
    summary_json: Option<String>,
    pauses_json: Option<String>,
}

impl WorkoutRow {
    fn from_row(row: &rusqlite::Row<'_>) -> SqliteResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            device_kind: row.get(1)?,
            started_at: row.get(2)?,
            ended_at: row.get(3)?,
            state: row.get(4)?,
            abort_reason: row.get(5)?,
            summary_json: row.get(6)?,
            pauses_json: row.get(7)?,
        })
    }

    fn into_record(self, samples: Vec<Sample>) -> Result<SessionRecord, DatabaseError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| DatabaseError::DeserializationError(format!("Invalid UUID: {}", e)))?;

        let kind = parse_kind(&self.device_kind)?;

        let state: SessionState = self
            .state
            .parse()
            .map_err(DatabaseError::DeserializationError)?;

        let started_at = parse_timestamp(&self.started_at, "start date")?;
        let ended_at = self
            .ended_at
            .map(|s| parse_timestamp(&s, "end date"))
            .transpose()?;

        let summary: Option<SessionSummary> = self
            .summary_json
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| {
                DatabaseError::DeserializationError(format!("Invalid summary JSON: {}", e))
            })?;

        let pauses: Vec<PauseInterval> = self
            .pauses_json
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| DatabaseError::DeserializationError(format!("Invalid pauses JSON: {}", e)))?
            .unwrap_or_default();

        Ok(SessionRecord {
            id,
            kind,
            started_at,
            ended_at,
            state,
            abort_reason: self.abort_reason,
            summary,
            samples,
            pauses,
        })
    }
}

/// Intermediate struct for reading sample rows from database.
struct SampleRow {
    timestamp: String,
    power_watts: Option<i16>,
    cadence_rpm: Option<f32>,
    speed_kmh: Option<f32>,
    stroke_rate_spm: Option<f32>,
    stroke_count: Option<u16>,
    heart_rate_bpm: Option<u8>,
    distance_m: Option<u32>,
    calories_kcal: Option<u16>,
    resistance_level: Option<i16>,
    elapsed_time_s: Option<u16>,
}

impl SampleRow {
    fn into_sample(self, kind: DeviceKind) -> Result<Sample, DatabaseError> {
        Ok(Sample {
            timestamp: parse_timestamp(&self.timestamp, "sample timestamp")?,
            kind,
            power_watts: self.power_watts,
            cadence_rpm: self.cadence_rpm,
            speed_kmh: self.speed_kmh,
            stroke_rate_spm: self.stroke_rate_spm,
            stroke_count: self.stroke_count,
            heart_rate_bpm: self.heart_rate_bpm,
            distance_m: self.distance_m,
            calories_kcal: self.calories_kcal,
            resistance_level: self.resistance_level,
            elapsed_time_s: self.elapsed_time_s,
        })
    }
}

fn parse_kind(value: &str) -> Result<DeviceKind, DatabaseError> {
    value.parse().map_err(DatabaseError::DeserializationError)
}

fn parse_timestamp(value: &str, what: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::DeserializationError(format!("Invalid {}: {}", what, e)))
}

/// Database errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}
