//! Session task.
//!
//! Samples and control commands share one ordered channel consumed by a
//! single task that owns the [`SessionRecorder`]. Finalized records are
//! published on a broadcast channel.

use crate::recording::recorder::SessionRecorder;
use crate::recording::types::{
    IngestOutcome, SessionError, SessionRecord, SessionStatus,
};
use crate::sensors::manager::SampleSink;
use crate::sensors::types::{DeviceKind, Sample};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Capacity of the finalized-record broadcast.
const RECORD_CHANNEL_CAPACITY: usize = 16;

/// Messages processed by the session task.
#[derive(Debug)]
pub enum SessionCommand {
    Start {
        kind: DeviceKind,
        reply: oneshot::Sender<Result<Uuid, SessionError>>,
    },
    Sample(Sample),
    Pause {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    End {
        reply: oneshot::Sender<Result<SessionRecord, SessionError>>,
    },
    Abort {
        reason: String,
        reply: oneshot::Sender<Result<SessionRecord, SessionError>>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the session task.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
    records: broadcast::Sender<Arc<SessionRecord>>,
}

impl SessionHandle {
    /// Start a session.
    pub async fn start(&self, kind: DeviceKind) -> Result<Uuid, SessionError> {
        self.request(|reply| SessionCommand::Start { kind, reply })
            .await?
    }

    /// Queue a sample behind everything already sent.
    pub fn send_sample(&self, sample: Sample) -> bool {
        self.tx.send(SessionCommand::Sample(sample)).is_ok()
    }

    /// Pause the active session.
    pub async fn pause(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Pause { reply }).await?
    }

    /// End the active session once all queued samples are applied.
    pub async fn end(&self) -> Result<SessionRecord, SessionError> {
        self.request(|reply| SessionCommand::End { reply }).await?
    }

    /// Abort the active session.
    pub async fn abort(&self, reason: impl Into<String>) -> Result<SessionRecord, SessionError> {
        let reason = reason.into();
        self.request(|reply| SessionCommand::Abort { reason, reply })
            .await?
    }

    /// Snapshot of the active session.
    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        self.request(|reply| SessionCommand::Status { reply }).await
    }

    /// Wait until every store write queued so far has been applied.
    pub async fn flush(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Flush { reply }).await
    }

    /// Receive every record finalized after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<SessionRecord>> {
        self.records.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| SessionError::ActorUnavailable)?;
        rx.await.map_err(|_| SessionError::ActorUnavailable)
    }
}

impl SampleSink for SessionHandle {
    fn deliver(&self, sample: Sample) -> bool {
        self.send_sample(sample)
    }
}

/// Spawn the session task.
///
/// The task stops once every handle has been dropped.
pub fn spawn_session_task(recorder: SessionRecorder) -> (SessionHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (records, _) = broadcast::channel(RECORD_CHANNEL_CAPACITY);

    let handle = SessionHandle {
        tx,
        records: records.clone(),
    };
    let task = tokio::spawn(run(recorder, rx, records));
    (handle, task)
}

async fn run(
    mut recorder: SessionRecorder,
    mut rx: mpsc::UnboundedReceiver<SessionCommand>,
    records: broadcast::Sender<Arc<SessionRecord>>,
) {
    tracing::debug!("Session task started");

    while let Some(command) = rx.recv().await {
        match command {
            SessionCommand::Start { kind, reply } => {
                let _ = reply.send(recorder.start(kind));
            }
            SessionCommand::Sample(sample) => {
                if let IngestOutcome::Completed(record) = recorder.ingest(sample) {
                    publish(&records, *record);
                }
            }
            SessionCommand::Pause { reply } => {
                let _ = reply.send(recorder.pause());
            }
            SessionCommand::End { reply } => {
                let result = recorder.end();
                if let Ok(record) = &result {
                    publish(&records, record.clone());
                }
                let _ = reply.send(result);
            }
            SessionCommand::Abort { reason, reply } => {
                let result = recorder.abort(&reason);
                if let Ok(record) = &result {
                    publish(&records, record.clone());
                }
                let _ = reply.send(result);
            }
            SessionCommand::Status { reply } => {
                let _ = reply.send(recorder.status());
            }
            SessionCommand::Flush { reply } => {
                // Wait off the command loop so samples keep flowing
                let written = recorder.flush();
                tokio::spawn(async move {
                    let _ = written.await;
                    let _ = reply.send(());
                });
            }
        }
    }

    if recorder.is_active() {
        if let Err(e) = recorder.abort("session task stopped") {
            tracing::warn!("Could not abort session on shutdown: {}", e);
        }
    }
    tracing::debug!("Session task stopped");
}

fn publish(records: &broadcast::Sender<Arc<SessionRecord>>, record: SessionRecord) {
    tracing::debug!(session_id = %record.id, state = %record.state, "Publishing finalized session");
    // No subscribers is fine
    let _ = records.send(Arc::new(record));
}
