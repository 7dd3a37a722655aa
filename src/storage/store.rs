//! Persistence interface used by the session recorder.

use crate::recording::types::SessionRecord;
use crate::sensors::types::{DeviceKind, Sample};
use crate::storage::database::DatabaseError;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Storage for workouts and their data points.
pub trait WorkoutStore: Send {
    /// Create the workout row for a new session.
    fn create_workout(
        &mut self,
        workout_id: Uuid,
        kind: DeviceKind,
        started_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Append one retained sample.
    fn append_data_point(&mut self, workout_id: Uuid, sample: &Sample)
        -> Result<(), DatabaseError>;

    /// Store the terminal state, end time, summary and pauses.
    fn finalize_workout(
        &mut self,
        workout_id: Uuid,
        record: &SessionRecord,
    ) -> Result<(), DatabaseError>;

    /// Load a workout with its samples.
    fn get_workout(&self, workout_id: Uuid) -> Result<Option<SessionRecord>, DatabaseError>;
}

/// Store handle shared between the session task and the bridge.
pub type SharedStore = Arc<Mutex<dyn WorkoutStore>>;

/// Wrap a store for sharing.
pub fn shared<S: WorkoutStore + 'static>(store: S) -> SharedStore {
    Arc::new(Mutex::new(store))
}
