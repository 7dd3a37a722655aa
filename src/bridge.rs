//! Bridge between a connected fitness machine and workout sessions.
//!
//! Wires the connection manager's samples into the session task, pauses the
//! session when the link fails for good, keeps finalized records and
//! produces activity files on request.

use crate::recording::actor::{spawn_session_task, SessionHandle};
use crate::recording::exporter_fit::{encode_with, suggested_filename};
use crate::recording::recorder::SessionRecorder;
use crate::recording::types::{ExportConfig, ExportError, SessionError, SessionRecord, SessionStatus};
use crate::sensors::backend::BleBackend;
use crate::sensors::manager::ConnectionManager;
use crate::sensors::types::{DeviceDescriptor, DeviceKind, LinkEvent, LinkState, Sample};
use crate::storage::store::SharedStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Snapshot returned by [`Bridge::status`].
#[derive(Debug, Clone)]
pub struct BridgeStatus {
    pub link: LinkState,
    pub device: Option<DeviceDescriptor>,
    pub session: SessionStatus,
    /// Most recent decoded sample, in or out of a session
    pub last_sample: Option<Sample>,
}

/// Running bridge for one connected machine.
pub struct Bridge {
    session: SessionHandle,
    kind: DeviceKind,
    device: watch::Receiver<Option<DeviceDescriptor>>,
    export: ExportConfig,
    store: Option<SharedStore>,
    /// Finalized records seen so far
    records: Mutex<HashMap<Uuid, Arc<SessionRecord>>>,
    /// Subscribed at launch so no finalized record is missed
    finished: Mutex<broadcast::Receiver<Arc<SessionRecord>>>,
    link_state: watch::Receiver<LinkState>,
    latest_sample: watch::Receiver<Option<Sample>>,
    shutdown_tx: watch::Sender<bool>,
    link_task: JoinHandle<LinkState>,
    watchers: Vec<JoinHandle<()>>,
}

impl Bridge {
    /// Start streaming from a connected manager.
    ///
    /// The recorder should share `store` if finished workouts are to be
    /// exported from storage later.
    pub fn launch<B: BleBackend + 'static>(
        mut manager: ConnectionManager<B>,
        recorder: SessionRecorder,
        export: ExportConfig,
        store: Option<SharedStore>,
    ) -> Self {
        let (session, _session_task) = spawn_session_task(recorder);
        manager.set_sink(Arc::new(session.clone()));

        let kind = manager
            .current_device()
            .map(|d| d.kind)
            .or(manager.config().device_kind)
            .unwrap_or(DeviceKind::Bike);

        let events = manager.event_receiver();
        let link_state = manager.subscribe_state();
        let latest_sample = manager.subscribe_samples();
        let device = manager.subscribe_device();

        let finished = Mutex::new(session.subscribe());
        let watchers = vec![tokio::spawn(watch_link(events, session.clone()))];

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let link_task = tokio::spawn(async move { manager.run(shutdown_rx).await });

        tracing::info!(kind = %kind, "Bridge started");

        Self {
            session,
            kind,
            device,
            export,
            store,
            records: Mutex::new(HashMap::new()),
            finished,
            link_state,
            latest_sample,
            shutdown_tx,
            link_task,
            watchers,
        }
    }

    /// Link state, active session and the latest sample.
    pub async fn status(&self) -> Result<BridgeStatus, SessionError> {
        let session = self.session.status().await?;
        let link = *self.link_state.borrow();
        let last_sample = self.latest_sample.borrow().clone();
        let device = self.device.borrow().clone();
        Ok(BridgeStatus {
            link,
            device,
            session,
            last_sample,
        })
    }

    /// Start a session for the connected machine.
    pub async fn start_session(&self) -> Result<Uuid, SessionError> {
        self.session.start(self.kind).await
    }

    /// End the active session.
    pub async fn end_session(&self) -> Result<Arc<SessionRecord>, SessionError> {
        let record = self.session.end().await;
        self.absorb_finished();
        Ok(Arc::new(record?))
    }

    /// End session `id`, or return its record when it already completed on
    /// its own at the maximum duration.
    pub async fn finish_session(&self, id: Uuid) -> Result<Arc<SessionRecord>, SessionError> {
        match self.end_session().await {
            Err(SessionError::NoActiveSession) => {
                self.cached(id).ok_or(SessionError::NoActiveSession)
            }
            other => other,
        }
    }

    /// Abort the active session.
    pub async fn abort_session(&self, reason: &str) -> Result<Arc<SessionRecord>, SessionError> {
        let record = self.session.abort(reason).await;
        self.absorb_finished();
        Ok(Arc::new(record?))
    }

    /// FIT bytes and suggested filename for a finished session.
    pub fn activity_file(&self, id: Uuid) -> Result<(Vec<u8>, String), ExportError> {
        let record = self.find_record(id)?;
        let bytes = encode_with(&record, &self.export)?;
        Ok((bytes, suggested_filename(&record)))
    }

    /// Watch the link state.
    pub fn subscribe_link_state(&self) -> watch::Receiver<LinkState> {
        self.link_state.clone()
    }

    /// Receive records as sessions finish.
    pub fn subscribe_records(&self) -> broadcast::Receiver<Arc<SessionRecord>> {
        self.session.subscribe()
    }

    /// Handle to the session task.
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Disconnect, flush queued workout writes and stop background tasks.
    ///
    /// A session still active when the last handle goes away is aborted.
    pub async fn shutdown(self) -> LinkState {
        let _ = self.shutdown_tx.send(true);
        let final_state = match self.link_task.await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("Link task failed: {}", e);
                LinkState::Failed
            }
        };
        if let Err(e) = self.session.flush().await {
            tracing::warn!("Could not flush workout writes: {}", e);
        }
        for watcher in self.watchers {
            watcher.abort();
        }
        tracing::info!("Bridge stopped");
        final_state
    }

    /// Move records published since the last call into the cache.
    fn absorb_finished(&self) {
        let (Ok(mut records), Ok(mut finished)) = (self.records.lock(), self.finished.lock())
        else {
            return;
        };
        loop {
            match finished.try_recv() {
                Ok(record) => {
                    records.insert(record.id, record);
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("Record cache skipped {} record(s)", skipped);
                }
                Err(_) => break,
            }
        }
    }

    fn cached(&self, id: Uuid) -> Option<Arc<SessionRecord>> {
        self.absorb_finished();
        self.records.lock().ok()?.get(&id).cloned()
    }

    fn find_record(&self, id: Uuid) -> Result<Arc<SessionRecord>, ExportError> {
        if let Some(record) = self.cached(id) {
            return Ok(record);
        }

        let store = self.store.as_ref().ok_or(ExportError::SessionNotFound(id))?;
        let stored = store
            .lock()
            .map_err(|_| ExportError::Storage("store lock poisoned".to_string()))?
            .get_workout(id)
            .map_err(|e| ExportError::Storage(e.to_string()))?;

        stored.map(Arc::new).ok_or(ExportError::SessionNotFound(id))
    }
}

/// React to link lifecycle events.
async fn watch_link(mut events: mpsc::UnboundedReceiver<LinkEvent>, session: SessionHandle) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::LinkLost { address } => {
                tracing::warn!(address = %address, "Link lost, reconnecting");
            }
            LinkEvent::Reconnected { address, attempt } => {
                tracing::info!(address = %address, attempt, "Link restored");
            }
            LinkEvent::Failed { address, attempts } => {
                tracing::error!(address = %address, attempts, "Link failed, pausing session");
                if let Err(e) = session.pause().await {
                    tracing::debug!("No session to pause: {}", e);
                }
            }
            _ => {}
        }
    }
}
