//! Database schema definitions for recorded workouts.

/// SQL schema for creating all database tables.
pub const SCHEMA: &str = r#"
-- Workouts table
CREATE TABLE IF NOT EXISTS workouts (
    id TEXT PRIMARY KEY,
    device_kind TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    state TEXT NOT NULL,
    abort_reason TEXT,
    summary_json TEXT,
    pauses_json TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_workouts_started_at ON workouts(started_at);

-- Workout samples table
CREATE TABLE IF NOT EXISTS workout_samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workout_id TEXT NOT NULL REFERENCES workouts(id) ON DELETE CASCADE,
    timestamp TEXT NOT NULL,
    power_watts INTEGER,
    cadence_rpm REAL,
    speed_kmh REAL,
    stroke_rate_spm REAL,
    stroke_count INTEGER,
    heart_rate_bpm INTEGER,
    distance_m INTEGER,
    calories_kcal INTEGER,
    resistance_level INTEGER,
    elapsed_time_s INTEGER
);

CREATE INDEX IF NOT EXISTS idx_workout_samples_workout_id ON workout_samples(workout_id);
"#;

/// Schema version table for migrations.
pub const SCHEMA_VERSION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);
"#;

/// Current schema version.
pub const CURRENT_VERSION: i32 = 1;
