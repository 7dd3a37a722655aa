//! Background writer for workout persistence.
//!
//! Store calls run on a dedicated thread fed by an unbounded channel, so the
//! session task never waits on the database. Requests are applied in the
//! order they were queued.

use crate::recording::types::SessionRecord;
use crate::sensors::types::{DeviceKind, Sample};
use crate::storage::database::DatabaseError;
use crate::storage::store::{SharedStore, WorkoutStore};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

enum WriteRequest {
    Create {
        id: Uuid,
        kind: DeviceKind,
        started_at: DateTime<Utc>,
    },
    Append {
        id: Uuid,
        sample: Sample,
    },
    Finalize(Box<SessionRecord>),
    Flush(oneshot::Sender<()>),
}

/// Queues workout writes for a background thread.
///
/// Dropping the writer waits for every queued request to be applied.
pub struct StoreWriter {
    tx: Option<mpsc::UnboundedSender<WriteRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl StoreWriter {
    /// Start the writer thread for `store`.
    pub fn spawn(store: SharedStore) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = std::thread::Builder::new()
            .name("workout-writer".to_string())
            .spawn(move || write_loop(store, rx));

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!("Could not start workout writer, persistence disabled: {}", e);
                None
            }
        };

        Self {
            tx: Some(tx),
            worker,
        }
    }

    /// Queue creation of the workout row.
    pub fn create(&self, id: Uuid, kind: DeviceKind, started_at: DateTime<Utc>) {
        self.queue(WriteRequest::Create {
            id,
            kind,
            started_at,
        });
    }

    /// Queue one retained sample.
    pub fn append(&self, id: Uuid, sample: Sample) {
        self.queue(WriteRequest::Append { id, sample });
    }

    /// Queue the terminal state of a workout.
    pub fn finalize(&self, record: &SessionRecord) {
        self.queue(WriteRequest::Finalize(Box::new(record.clone())));
    }

    /// Resolves once every request queued before this call is applied.
    pub fn flush(&self) -> oneshot::Receiver<()> {
        let (done, rx) = oneshot::channel();
        self.queue(WriteRequest::Flush(done));
        rx
    }

    fn queue(&self, request: WriteRequest) {
        let sent = self.tx.as_ref().map(|tx| tx.send(request).is_ok());
        if sent != Some(true) {
            tracing::debug!("Workout writer stopped, dropping write");
        }
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Workout writer thread panicked");
            }
        }
    }
}

fn write_loop(store: SharedStore, mut rx: mpsc::UnboundedReceiver<WriteRequest>) {
    // Workouts whose row could not be created; their later writes are skipped
    let mut unpersisted: HashSet<Uuid> = HashSet::new();

    while let Some(request) = rx.blocking_recv() {
        match request {
            WriteRequest::Create {
                id,
                kind,
                started_at,
            } => {
                if let Err(e) = store_call(&store, |s| s.create_workout(id, kind, started_at)) {
                    tracing::warn!(
                        session_id = %id,
                        "Could not create workout in store, recording without persistence: {}",
                        e
                    );
                    unpersisted.insert(id);
                }
            }
            WriteRequest::Append { id, sample } => {
                if unpersisted.contains(&id) {
                    continue;
                }
                if let Err(first) = store_call(&store, |s| s.append_data_point(id, &sample)) {
                    tracing::warn!(session_id = %id, "Data point write failed, retrying: {}", first);
                    if let Err(e) = store_call(&store, |s| s.append_data_point(id, &sample)) {
                        tracing::error!(session_id = %id, "Dropping data point after retry: {}", e);
                    }
                }
            }
            WriteRequest::Finalize(record) => {
                if unpersisted.remove(&record.id) {
                    continue;
                }
                if let Err(e) = store_call(&store, |s| s.finalize_workout(record.id, &record)) {
                    tracing::error!(
                        session_id = %record.id,
                        "Could not finalize workout in store: {}",
                        e
                    );
                }
            }
            WriteRequest::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    tracing::debug!("Workout writer stopped");
}

fn store_call<T>(
    store: &SharedStore,
    op: impl FnOnce(&mut dyn WorkoutStore) -> Result<T, DatabaseError>,
) -> Result<T, DatabaseError> {
    let mut guard = store
        .lock()
        .map_err(|_| DatabaseError::ConnectionFailed("store lock poisoned".to_string()))?;
    op(&mut *guard)
}
