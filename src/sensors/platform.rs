//! btleplug-backed implementation of [`BleBackend`].

use crate::sensors::backend::{Advertisement, BleBackend, BleLink};
use crate::sensors::ftms::FTMS_SERVICE_UUID;
use crate::sensors::types::SensorError;
use async_trait::async_trait;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter, ValueNotification};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::time::{Duration, Instant};
use uuid::Uuid;

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

/// Map a btleplug error onto the sensor error taxonomy.
fn map_ble_error(error: btleplug::Error) -> SensorError {
    match error {
        btleplug::Error::TimedOut(_) => SensorError::ConnectTimeout,
        btleplug::Error::PermissionDenied => {
            SensorError::ConnectRejected("Bluetooth permission denied".to_string())
        }
        btleplug::Error::NotSupported(what) => SensorError::ConnectRejected(what),
        btleplug::Error::DeviceNotFound => SensorError::DeviceNotFound("unknown".to_string()),
        btleplug::Error::NotConnected => SensorError::NotConnected,
        other => SensorError::BleError(other.to_string()),
    }
}

/// BLE backend using the first system adapter.
pub struct BtleplugBackend {
    adapter: Adapter,
}

impl BtleplugBackend {
    /// Initialize the BLE adapter.
    pub async fn new() -> Result<Self, SensorError> {
        tracing::info!("Initializing BLE adapter");

        let manager = Manager::new()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))?;

        let adapters = manager
            .adapters()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(SensorError::AdapterNotFound)?;

        tracing::info!("BLE adapter initialized");
        Ok(Self { adapter })
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral, SensorError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))?;

        peripherals
            .into_iter()
            .find(|p| p.id().to_string() == address)
            .ok_or_else(|| SensorError::DeviceNotFound(address.to_string()))
    }

    async fn advertisement(peripheral: &Peripheral) -> Option<Advertisement> {
        let properties = peripheral.properties().await.ok()??;

        Some(Advertisement {
            address: peripheral.id().to_string(),
            name: properties.local_name,
            rssi: properties.rssi,
            services: properties.services,
            service_data: properties.service_data,
            seen_at: Instant::now(),
        })
    }
}

#[async_trait]
impl BleBackend for BtleplugBackend {
    async fn scan(&self, duration: Duration) -> Result<Vec<Advertisement>, SensorError> {
        let scan_filter = ScanFilter {
            services: vec![FTMS_SERVICE_UUID],
        };

        tokio::time::timeout(duration, self.adapter.start_scan(scan_filter))
            .await
            .map_err(|_| SensorError::ScanTimeout)?
            .map_err(|e| {
                tracing::warn!("Failed to start scanning: {}", e);
                SensorError::ScanTimeout
            })?;

        tokio::time::sleep(duration).await;

        if let Err(e) = self.adapter.stop_scan().await {
            tracing::debug!("Failed to stop scan: {}", e);
        }

        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))?;

        let mut found = Vec::with_capacity(peripherals.len());
        for peripheral in &peripherals {
            if let Some(adv) = Self::advertisement(peripheral).await {
                found.push(adv);
            }
        }

        Ok(found)
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn BleLink>, SensorError> {
        let peripheral = self.find_peripheral(address).await?;

        peripheral.connect().await.map_err(map_ble_error)?;
        peripheral.discover_services().await.map_err(map_ble_error)?;

        Ok(Box::new(PlatformLink {
            peripheral,
            notifications: None,
            characteristic: None,
        }))
    }

    async fn cancel_connect(&self, address: &str) {
        if let Ok(peripheral) = self.find_peripheral(address).await {
            if let Err(e) = peripheral.disconnect().await {
                tracing::debug!("Cleanup disconnect of {} failed: {}", address, e);
            }
        }
    }
}

/// A connected btleplug peripheral.
struct PlatformLink {
    peripheral: Peripheral,
    notifications: Option<NotificationStream>,
    characteristic: Option<Uuid>,
}

#[async_trait]
impl BleLink for PlatformLink {
    async fn subscribe(&mut self, characteristic: Uuid) -> Result<(), SensorError> {
        let target = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or_else(|| {
                SensorError::ConnectRejected(format!("missing characteristic {}", characteristic))
            })?;

        self.peripheral
            .subscribe(&target)
            .await
            .map_err(map_ble_error)?;

        let stream = self
            .peripheral
            .notifications()
            .await
            .map_err(map_ble_error)?;

        tracing::debug!("Subscribed to characteristic: {}", characteristic);
        self.notifications = Some(stream);
        self.characteristic = Some(characteristic);
        Ok(())
    }

    async fn next_notification(&mut self) -> Option<Vec<u8>> {
        let stream = self.notifications.as_mut()?;
        while let Some(notification) = stream.next().await {
            if Some(notification.uuid) == self.characteristic {
                return Some(notification.value);
            }
        }
        // Stream ended - peripheral disconnected
        None
    }

    async fn disconnect(&mut self) -> Result<(), SensorError> {
        self.notifications = None;
        self.peripheral.disconnect().await.map_err(map_ble_error)
    }
}
