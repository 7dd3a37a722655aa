//! Connection manager for one FTMS fitness machine.
//!
//! Drives discovery, connect, notification decoding and bounded reconnection
//! against a [`BleBackend`]. All mutating operations take `&mut self`, so the
//! owner serializes them.

use crate::sensors::backend::{Advertisement, BleBackend, BleLink};
use crate::sensors::ftms::{decode, kind_from_name, kind_from_service_data, FTMS_SERVICE_UUID};
use crate::sensors::types::{
    ConnectionConfig, DeviceDescriptor, DeviceKind, LinkEvent, LinkState, Sample, SensorError,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Destination for decoded samples.
pub trait SampleSink: Send + Sync {
    /// Hand over one sample. Returns false if the receiver is gone.
    fn deliver(&self, sample: Sample) -> bool;
}

impl SampleSink for mpsc::UnboundedSender<Sample> {
    fn deliver(&self, sample: Sample) -> bool {
        self.send(sample).is_ok()
    }
}

/// Manages discovery, connection and data streaming for one machine.
pub struct ConnectionManager<B: BleBackend> {
    /// Configuration
    config: ConnectionConfig,
    /// BLE stack
    backend: B,
    /// Open link, if any
    link: Option<Box<dyn BleLink>>,
    /// Last successfully connected device
    current: Option<DeviceDescriptor>,
    /// Published device, updated on connect and reconnect
    device_tx: watch::Sender<Option<DeviceDescriptor>>,
    /// Where decoded samples go
    sink: Option<Arc<dyn SampleSink>>,
    /// Published link state
    state_tx: watch::Sender<LinkState>,
    /// Most recent decoded sample
    sample_tx: watch::Sender<Option<Sample>>,
    /// Lifecycle events
    event_tx: Option<mpsc::UnboundedSender<LinkEvent>>,
}

impl<B: BleBackend> ConnectionManager<B> {
    /// Create a new connection manager.
    pub fn new(config: ConnectionConfig, backend: B) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Idle);
        let (sample_tx, _) = watch::channel(None);
        let (device_tx, _) = watch::channel(None);
        Self {
            config,
            backend,
            link: None,
            current: None,
            device_tx,
            sink: None,
            state_tx,
            sample_tx,
            event_tx: None,
        }
    }

    /// Register the destination for decoded samples.
    pub fn set_sink(&mut self, sink: Arc<dyn SampleSink>) {
        self.sink = Some(sink);
    }

    /// Get an event receiver for link lifecycle events.
    pub fn event_receiver(&mut self) -> mpsc::UnboundedReceiver<LinkEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_tx = Some(tx);
        rx
    }

    /// Watch the link state.
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Watch the most recent decoded sample.
    pub fn subscribe_samples(&self) -> watch::Receiver<Option<Sample>> {
        self.sample_tx.subscribe()
    }

    /// Watch the attached device. A reconnect after a rescan publishes the
    /// refreshed descriptor.
    pub fn subscribe_device(&self) -> watch::Receiver<Option<DeviceDescriptor>> {
        self.device_tx.subscribe()
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    /// The device the link is (or was last) attached to.
    pub fn current_device(&self) -> Option<&DeviceDescriptor> {
        self.current.as_ref()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn send_event(&self, event: LinkEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Link state changed");
            self.send_event(LinkEvent::StateChanged(state));
        }
    }

    fn attach(&mut self, link: Box<dyn BleLink>, descriptor: &DeviceDescriptor) {
        self.link = Some(link);
        self.current = Some(descriptor.clone());
        self.device_tx.send_replace(Some(descriptor.clone()));
        self.set_state(LinkState::Connected);
    }

    fn link_busy(&self) -> bool {
        self.link.is_some()
            || matches!(
                self.state(),
                LinkState::Connecting | LinkState::Connected | LinkState::Reconnecting
            )
    }

    /// Scan for fitness machines.
    ///
    /// Devices below the signal threshold are dropped; devices without an
    /// RSSI reading are kept. Results are sorted strongest first.
    pub async fn discover(
        &mut self,
        timeout: Duration,
    ) -> Result<Vec<DeviceDescriptor>, SensorError> {
        if self.link_busy() {
            return Err(SensorError::Busy);
        }

        tracing::info!("Starting device discovery");
        self.set_state(LinkState::Scanning);
        let result = Self::scan_descriptors(&self.backend, &self.config, timeout).await;
        self.set_state(LinkState::Idle);

        let descriptors = result?;
        tracing::info!("Discovery found {} device(s)", descriptors.len());
        Ok(descriptors)
    }

    async fn scan_descriptors(
        backend: &B,
        config: &ConnectionConfig,
        timeout: Duration,
    ) -> Result<Vec<DeviceDescriptor>, SensorError> {
        // The backend scans for `timeout`; allow as long again for the adapter to respond.
        let advertisements = tokio::time::timeout(timeout * 2, backend.scan(timeout))
            .await
            .map_err(|_| SensorError::ScanTimeout)??;

        Ok(filter_advertisements(config, advertisements))
    }

    /// Connect to a discovered device and subscribe to its telemetry.
    pub async fn connect(&mut self, descriptor: &DeviceDescriptor) -> Result<(), SensorError> {
        if self.link_busy() {
            return Err(SensorError::Busy);
        }

        tracing::info!("Connecting to device: {} ({})", descriptor.name, descriptor.address);
        self.set_state(LinkState::Connecting);

        match Self::open_link(&self.backend, &self.config, descriptor).await {
            Ok(link) => {
                self.attach(link, descriptor);
                self.send_event(LinkEvent::Connected(descriptor.clone()));
                tracing::info!("Connected to device: {}", descriptor.address);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Connection to {} failed: {}", descriptor.address, e);
                self.set_state(LinkState::Idle);
                Err(e)
            }
        }
    }

    /// One bounded connection attempt. Partial state is torn down on failure.
    async fn open_link(
        backend: &B,
        config: &ConnectionConfig,
        descriptor: &DeviceDescriptor,
    ) -> Result<Box<dyn BleLink>, SensorError> {
        let characteristic = descriptor.kind.data_characteristic();
        let attempt = async {
            let mut link = backend.connect(&descriptor.address).await?;
            if let Err(e) = link.subscribe(characteristic).await {
                let _ = link.disconnect().await;
                return Err(e);
            }
            Ok::<_, SensorError>(link)
        };

        match tokio::time::timeout(config.connection_timeout(), attempt).await {
            Ok(Ok(link)) => Ok(link),
            Ok(Err(e)) => {
                backend.cancel_connect(&descriptor.address).await;
                Err(e)
            }
            Err(_) => {
                backend.cancel_connect(&descriptor.address).await;
                Err(SensorError::ConnectTimeout)
            }
        }
    }

    /// Decode one notification and forward it. Malformed frames are dropped.
    fn on_notification(&mut self, frame: &[u8]) {
        let Some(device) = self.current.as_mut() else {
            return;
        };
        device.last_seen = Instant::now();

        match decode(device.kind, frame, Utc::now()) {
            Ok(sample) => {
                self.sample_tx.send_replace(Some(sample.clone()));
                if let Some(sink) = &self.sink {
                    if !sink.deliver(sample) {
                        tracing::debug!("Sample sink closed, dropping sample");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(address = %device.address, "Dropping malformed frame: {}", e);
            }
        }
    }

    /// Retry the last device after an unexpected drop.
    ///
    /// Every wait (delay, rescan, connect) is cut short when `shutdown` is
    /// raised.
    async fn on_link_lost(&mut self, shutdown: &mut watch::Receiver<bool>) -> Recovery {
        self.link = None;
        let Some(mut descriptor) = self.current.clone() else {
            self.set_state(LinkState::Idle);
            return Recovery::GaveUp;
        };

        tracing::warn!("Link to {} lost, reconnecting", descriptor.address);
        self.set_state(LinkState::Reconnecting);
        self.send_event(LinkEvent::LinkLost {
            address: descriptor.address.clone(),
        });

        let attempts = self.config.reconnect_attempts;
        for attempt in 1..=attempts {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return Recovery::Stopped,
                _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
            }

            if descriptor.last_seen.elapsed() >= self.config.staleness_window() {
                let refreshed = tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => return Recovery::Stopped,
                    fresh = Self::refresh_descriptor(&self.backend, &self.config, &descriptor) => fresh,
                };
                match refreshed {
                    Some(fresh) => descriptor = fresh,
                    None => {
                        tracing::info!(
                            "Reconnect attempt {}/{}: {} not seen in scan",
                            attempt,
                            attempts,
                            descriptor.address
                        );
                        continue;
                    }
                }
            }

            let result = tokio::select! {
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    self.backend.cancel_connect(&descriptor.address).await;
                    return Recovery::Stopped;
                }
                result = Self::open_link(&self.backend, &self.config, &descriptor) => result,
            };

            match result {
                Ok(link) => {
                    tracing::info!(
                        "Reconnected to {} on attempt {}/{}",
                        descriptor.address,
                        attempt,
                        attempts
                    );
                    self.attach(link, &descriptor);
                    self.send_event(LinkEvent::Reconnected {
                        address: descriptor.address,
                        attempt,
                    });
                    return Recovery::Restored;
                }
                Err(e) => {
                    tracing::info!("Reconnect attempt {}/{} failed: {}", attempt, attempts, e);
                }
            }
        }

        tracing::error!(
            "Giving up on {} after {} reconnect attempts",
            descriptor.address,
            attempts
        );
        self.set_state(LinkState::Failed);
        self.send_event(LinkEvent::Failed {
            address: descriptor.address,
            attempts,
        });
        Recovery::GaveUp
    }

    async fn refresh_descriptor(
        backend: &B,
        config: &ConnectionConfig,
        stale: &DeviceDescriptor,
    ) -> Option<DeviceDescriptor> {
        match Self::scan_descriptors(backend, config, config.scan_timeout()).await {
            Ok(found) => found.into_iter().find(|d| d.address == stale.address),
            Err(e) => {
                tracing::info!("Rescan before reconnect failed: {}", e);
                None
            }
        }
    }

    /// Pump notifications until the link fails for good or `shutdown` fires.
    ///
    /// Returns the final link state: `Idle` after shutdown or when no link
    /// was open, `Failed` when reconnection was exhausted.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> LinkState {
        loop {
            if *shutdown.borrow() {
                self.disconnect().await;
                return LinkState::Idle;
            }

            let Some(link) = self.link.as_mut() else {
                return self.state();
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.disconnect().await;
                        return LinkState::Idle;
                    }
                }
                frame = link.next_notification() => match frame {
                    Some(bytes) => self.on_notification(&bytes),
                    None => match self.on_link_lost(&mut shutdown).await {
                        Recovery::Restored => {}
                        Recovery::Stopped => {
                            tracing::info!("Shutdown requested while reconnecting");
                            self.disconnect().await;
                            return LinkState::Idle;
                        }
                        Recovery::GaveUp => return self.state(),
                    },
                },
            }
        }
    }

    /// Close the link. Safe to call in any state.
    pub async fn disconnect(&mut self) {
        if let Some(mut link) = self.link.take() {
            let address = self
                .current
                .as_ref()
                .map(|d| d.address.clone())
                .unwrap_or_default();
            tracing::info!("Disconnecting from device: {}", address);
            if let Err(e) = link.disconnect().await {
                tracing::debug!("Disconnect reported: {}", e);
            }
            self.send_event(LinkEvent::Disconnected { address });
        }
        self.set_state(LinkState::Idle);
    }
}

/// How a reconnection sequence ended.
enum Recovery {
    Restored,
    /// Shutdown was raised mid-sequence
    Stopped,
    GaveUp,
}

/// Keep FTMS devices above the signal threshold, one per address.
///
/// Devices without an RSSI reading are kept. Sorted strongest first.
fn filter_advertisements(
    config: &ConnectionConfig,
    advertisements: Vec<Advertisement>,
) -> Vec<DeviceDescriptor> {
    let mut latest: HashMap<String, DeviceDescriptor> = HashMap::new();

    for adv in advertisements {
        let ftms_data = adv.service_data.get(&FTMS_SERVICE_UUID);
        if !adv.services.contains(&FTMS_SERVICE_UUID) && ftms_data.is_none() {
            continue;
        }

        if let Some(rssi) = adv.rssi {
            if rssi < config.signal_threshold_dbm {
                tracing::debug!(address = %adv.address, rssi, "Skipping weak device");
                continue;
            }
        }

        let Some(kind) = classify(config, &adv, ftms_data.map(Vec::as_slice)) else {
            continue;
        };

        let descriptor = DeviceDescriptor {
            name: adv.name.clone().unwrap_or_else(|| "Unknown Device".to_string()),
            address: adv.address,
            kind,
            rssi: adv.rssi,
            last_seen: adv.seen_at,
        };

        match latest.get(&descriptor.address) {
            Some(existing) if existing.last_seen > descriptor.last_seen => {}
            _ => {
                latest.insert(descriptor.address.clone(), descriptor);
            }
        }
    }

    let mut descriptors: Vec<DeviceDescriptor> = latest.into_values().collect();
    descriptors.sort_by(|a, b| {
        b.rssi
            .unwrap_or(i16::MIN)
            .cmp(&a.rssi.unwrap_or(i16::MIN))
            .then_with(|| a.address.cmp(&b.address))
    });
    descriptors
}

/// Machine kind from service data, then name, then the configured kind.
/// Devices conclusively of the non-preferred kind are skipped.
fn classify(
    config: &ConnectionConfig,
    adv: &Advertisement,
    ftms_data: Option<&[u8]>,
) -> Option<DeviceKind> {
    let detected = ftms_data
        .and_then(kind_from_service_data)
        .or_else(|| adv.name.as_deref().and_then(kind_from_name));

    match (detected, config.device_kind) {
        (Some(found), Some(wanted)) if found != wanted => None,
        (Some(found), _) => Some(found),
        (None, Some(wanted)) => Some(wanted),
        (None, None) => Some(DeviceKind::Bike),
    }
}
