//! Session recorder: one active workout session plus its persistence.

use crate::recording::session::WorkoutSession;
use crate::recording::types::{
    IngestOutcome, SessionConfig, SessionError, SessionRecord, SessionStatus,
};
use crate::sensors::types::{DeviceKind, Sample};
use crate::storage::store::SharedStore;
use crate::storage::writer::StoreWriter;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Records workout sessions, at most one non-terminal at a time.
pub struct SessionRecorder {
    /// Configuration
    config: SessionConfig,
    /// Active session, if any
    current: Option<WorkoutSession>,
    /// Background persistence (optional)
    writer: Option<StoreWriter>,
}

impl SessionRecorder {
    /// Create a recorder without persistence.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            current: None,
            writer: None,
        }
    }

    /// Create a recorder that writes through to `store` on a background
    /// thread.
    pub fn with_store(config: SessionConfig, store: SharedStore) -> Self {
        Self {
            writer: Some(StoreWriter::spawn(store)),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// True while a session is Recording or Paused.
    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    /// Start a new session now.
    pub fn start(&mut self, kind: DeviceKind) -> Result<Uuid, SessionError> {
        self.start_at(kind, Utc::now())
    }

    /// Start a new session with an explicit start time.
    pub fn start_at(
        &mut self,
        kind: DeviceKind,
        started_at: DateTime<Utc>,
    ) -> Result<Uuid, SessionError> {
        if let Some(active) = &self.current {
            return Err(SessionError::SessionAlreadyActive(active.id()));
        }

        let id = Uuid::new_v4();
        if let Some(writer) = &self.writer {
            writer.create(id, kind, started_at);
        }

        self.current = Some(WorkoutSession::new(id, kind, started_at, self.config.clone()));
        tracing::info!(session_id = %id, kind = %kind, "Started recording session");
        Ok(id)
    }

    /// Apply a sample to the active session.
    ///
    /// Store writes are queued, never awaited.
    pub fn ingest(&mut self, sample: Sample) -> IngestOutcome {
        let Some(session) = self.current.as_mut() else {
            tracing::warn!("Sample received with no active session");
            return IngestOutcome::Ignored;
        };

        let outcome = session.ingest(sample);
        match &outcome {
            IngestOutcome::Ignored => {}
            IngestOutcome::Completed(record) => {
                if let (Some(writer), Some(last)) = (&self.writer, record.samples.last()) {
                    writer.append(record.id, last.clone());
                }
                self.current = None;
                self.persist_final(record);
            }
            _ => {
                if let (Some(writer), Some(last)) = (&self.writer, session.last_sample()) {
                    writer.append(session.id(), last.clone());
                }
            }
        }
        outcome
    }

    /// Pause the active session.
    ///
    /// Pausing an already paused session is a no-op.
    pub fn pause(&mut self) -> Result<(), SessionError> {
        let session = self.current.as_mut().ok_or(SessionError::NoActiveSession)?;
        let at = session
            .last_sample()
            .map(|s| s.timestamp)
            .unwrap_or_else(Utc::now)
            .max(Utc::now());
        session.pause(at);
        Ok(())
    }

    /// Complete the active session and return its record.
    pub fn end(&mut self) -> Result<SessionRecord, SessionError> {
        let mut session = self.current.take().ok_or(SessionError::NoActiveSession)?;
        let record = session.finish(Utc::now());
        self.persist_final(&record);
        Ok(record)
    }

    /// Abort the active session.
    pub fn abort(&mut self, reason: &str) -> Result<SessionRecord, SessionError> {
        let mut session = self.current.take().ok_or(SessionError::NoActiveSession)?;
        let record = session.abort(reason, Utc::now());
        self.persist_final(&record);
        Ok(record)
    }

    /// Snapshot of the active session.
    pub fn status(&self) -> SessionStatus {
        match &self.current {
            Some(session) => SessionStatus {
                session_id: Some(session.id()),
                kind: Some(session.kind()),
                state: Some(session.state()),
                sample_count: session.samples().len(),
                last_sample: session.last_sample().cloned(),
            },
            None => SessionStatus::default(),
        }
    }

    /// Resolves once every write queued so far has reached the store.
    pub fn flush(&self) -> oneshot::Receiver<()> {
        match &self.writer {
            Some(writer) => writer.flush(),
            None => {
                let (done, rx) = oneshot::channel();
                let _ = done.send(());
                rx
            }
        }
    }

    fn persist_final(&self, record: &SessionRecord) {
        if let Some(writer) = &self.writer {
            writer.finalize(record);
        }
    }
}
