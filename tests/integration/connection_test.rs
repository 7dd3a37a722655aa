//! Connection manager against the scripted BLE backend.

use crate::mock_ble::{ftms_advert, steady_bike_frames, LinkScript, MockBackend, MockSensorData};
use ftmsbridge::sensors::ftms::{INDOOR_BIKE_DATA_UUID, ROWER_DATA_UUID};
use ftmsbridge::sensors::manager::ConnectionManager;
use ftmsbridge::sensors::types::{
    ConnectionConfig, DeviceDescriptor, DeviceKind, LinkEvent, LinkState, Sample, SensorError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        connection_timeout_secs: 1,
        reconnect_delay_secs: 0,
        reconnect_attempts: 3,
        ..Default::default()
    }
}

fn bike_backend() -> MockBackend {
    MockBackend::new(vec![ftms_advert("AA:BB", "Echo Bike", Some(-55), DeviceKind::Bike)])
}

async fn discover_one(manager: &mut ConnectionManager<MockBackend>) -> DeviceDescriptor {
    let mut found = manager.discover(Duration::from_secs(1)).await.unwrap();
    assert_eq!(found.len(), 1);
    found.remove(0)
}

type RunTask = JoinHandle<(ConnectionManager<MockBackend>, LinkState)>;

fn spawn_run(mut manager: ConnectionManager<MockBackend>) -> (RunTask, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let state = manager.run(shutdown_rx).await;
        (manager, state)
    });
    (task, shutdown_tx)
}

async fn next_sample(rx: &mut mpsc::UnboundedReceiver<Sample>) -> Sample {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a sample")
        .expect("sample channel closed")
}

fn drain(events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Vec<LinkEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn test_discover_filters_and_sorts() {
    let mut hr_strap = ftms_advert("CC", "HRM", Some(-40), DeviceKind::Bike);
    hr_strap.services.clear();
    hr_strap.service_data.clear();

    let backend = MockBackend::new(vec![
        ftms_advert("AA", "Echo Bike", Some(-65), DeviceKind::Bike),
        ftms_advert("BB", "RowErg", Some(-50), DeviceKind::Rower),
        ftms_advert("DD", "Far Bike", Some(-90), DeviceKind::Bike),
        ftms_advert("EE", "Quiet Bike", None, DeviceKind::Bike),
        hr_strap,
    ]);
    let mut manager = ConnectionManager::new(fast_config(), backend.clone());
    let mut state = manager.subscribe_state();

    let found = manager.discover(Duration::from_secs(1)).await.unwrap();

    let addresses: Vec<&str> = found.iter().map(|d| d.address.as_str()).collect();
    assert_eq!(addresses, vec!["BB", "AA", "EE"]);
    assert_eq!(found[0].kind, DeviceKind::Rower);
    assert_eq!(found[2].rssi, None);
    assert_eq!(backend.scans(), 1);
    assert_eq!(*state.borrow_and_update(), LinkState::Idle);
}

#[tokio::test]
async fn test_discover_preferred_kind() {
    let backend = MockBackend::new(vec![
        ftms_advert("AA", "Echo Bike", Some(-50), DeviceKind::Bike),
        ftms_advert("BB", "RowErg", Some(-60), DeviceKind::Rower),
    ]);
    let config = ConnectionConfig {
        device_kind: Some(DeviceKind::Rower),
        ..fast_config()
    };
    let mut manager = ConnectionManager::new(config, backend);

    let found = manager.discover(Duration::from_secs(1)).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].address, "BB");
}

#[tokio::test]
async fn test_connect_streams_samples_until_shutdown() {
    let backend = bike_backend();
    backend.script(LinkScript::Accept {
        frames: steady_bike_frames(3),
        keep_open: true,
    });

    let mut manager = ConnectionManager::new(fast_config(), backend.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.set_sink(Arc::new(tx));
    let mut events = manager.event_receiver();

    let device = discover_one(&mut manager).await;
    manager.connect(&device).await.unwrap();
    assert_eq!(manager.state(), LinkState::Connected);
    assert_eq!(backend.subscribed(), vec![INDOOR_BIKE_DATA_UUID]);

    let latest = manager.subscribe_samples();
    let (task, shutdown) = spawn_run(manager);

    for i in 0..3 {
        let sample = next_sample(&mut rx).await;
        assert_eq!(sample.kind, DeviceKind::Bike);
        assert_eq!(sample.power_watts, Some(150));
        assert_eq!(sample.distance_m, Some(i * 8));
    }

    assert!(backend.feed(
        MockSensorData {
            power: 210,
            ..Default::default()
        }
        .bike_frame()
    ));
    assert_eq!(next_sample(&mut rx).await.power_watts, Some(210));
    assert_eq!(
        latest.borrow().as_ref().and_then(|s| s.power_watts),
        Some(210)
    );

    shutdown.send(true).unwrap();
    let (manager, final_state) = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert_eq!(final_state, LinkState::Idle);
    assert_eq!(manager.state(), LinkState::Idle);

    let seen = drain(&mut events);
    assert!(seen.iter().any(|e| matches!(e, LinkEvent::Connected(d) if d.address == "AA:BB")));
    assert!(seen
        .iter()
        .any(|e| matches!(e, LinkEvent::Disconnected { address } if address == "AA:BB")));
}

#[tokio::test]
async fn test_rower_subscribes_rower_characteristic() {
    let backend = MockBackend::new(vec![ftms_advert("R1", "RowErg", Some(-50), DeviceKind::Rower)]);
    backend.script(LinkScript::Accept {
        frames: vec![MockSensorData::default().rower_frame(48, 12)],
        keep_open: true,
    });
    let mut manager = ConnectionManager::new(fast_config(), backend.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.set_sink(Arc::new(tx));

    let device = discover_one(&mut manager).await;
    manager.connect(&device).await.unwrap();
    assert_eq!(backend.subscribed(), vec![ROWER_DATA_UUID]);

    let (task, shutdown) = spawn_run(manager);
    let sample = next_sample(&mut rx).await;
    assert_eq!(sample.kind, DeviceKind::Rower);
    assert_eq!(sample.stroke_rate_spm, Some(24.0));
    assert_eq!(sample.stroke_count, Some(12));

    shutdown.send(true).unwrap();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connect_rejected_returns_to_idle() {
    let backend = bike_backend();
    backend.script(LinkScript::Reject);
    let mut manager = ConnectionManager::new(fast_config(), backend.clone());

    let device = discover_one(&mut manager).await;
    let err = manager.connect(&device).await.unwrap_err();

    assert!(matches!(err, SensorError::ConnectRejected(_)));
    assert_eq!(manager.state(), LinkState::Idle);
    assert_eq!(backend.cancels(), 1);
    assert!(manager.current_device().is_none());
}

#[tokio::test]
async fn test_connect_timeout() {
    let backend = bike_backend();
    backend.script(LinkScript::Hang);
    let mut manager = ConnectionManager::new(fast_config(), backend.clone());

    let device = discover_one(&mut manager).await;
    let err = tokio::time::timeout(WAIT, manager.connect(&device))
        .await
        .expect("connect should give up on its own")
        .unwrap_err();

    assert_eq!(err, SensorError::ConnectTimeout);
    assert_eq!(manager.state(), LinkState::Idle);
    assert_eq!(backend.cancels(), 1);
}

#[tokio::test]
async fn test_busy_while_connected() {
    let backend = bike_backend();
    backend.script(LinkScript::Accept {
        frames: Vec::new(),
        keep_open: true,
    });
    let mut manager = ConnectionManager::new(fast_config(), backend.clone());

    let device = discover_one(&mut manager).await;
    manager.connect(&device).await.unwrap();

    assert_eq!(manager.connect(&device).await.unwrap_err(), SensorError::Busy);
    assert_eq!(
        manager.discover(Duration::from_secs(1)).await.unwrap_err(),
        SensorError::Busy
    );
    assert_eq!(backend.connects(), 1);
    assert_eq!(manager.state(), LinkState::Connected);

    manager.disconnect().await;
    assert_eq!(manager.state(), LinkState::Idle);
    manager.disconnect().await;
    assert_eq!(manager.state(), LinkState::Idle);
}

#[tokio::test]
async fn test_reconnects_after_link_loss() {
    let backend = bike_backend();
    backend
        .script(LinkScript::Accept {
            frames: steady_bike_frames(2),
            keep_open: false,
        })
        .script(LinkScript::Reject)
        .script(LinkScript::Accept {
            frames: vec![MockSensorData {
                power: 175,
                ..Default::default()
            }
            .bike_frame()],
            keep_open: true,
        });

    let mut manager = ConnectionManager::new(fast_config(), backend.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.set_sink(Arc::new(tx));
    let mut events = manager.event_receiver();

    let device = discover_one(&mut manager).await;
    manager.connect(&device).await.unwrap();
    let (task, shutdown) = spawn_run(manager);

    assert_eq!(next_sample(&mut rx).await.power_watts, Some(150));
    assert_eq!(next_sample(&mut rx).await.power_watts, Some(150));
    assert_eq!(next_sample(&mut rx).await.power_watts, Some(175));

    shutdown.send(true).unwrap();
    let (_, final_state) = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert_eq!(final_state, LinkState::Idle);
    assert_eq!(backend.connects(), 3);

    let seen = drain(&mut events);
    assert!(seen.iter().any(|e| matches!(e, LinkEvent::LinkLost { .. })));
    assert!(seen
        .iter()
        .any(|e| matches!(e, LinkEvent::Reconnected { attempt: 2, .. })));
    assert!(seen
        .iter()
        .any(|e| matches!(e, LinkEvent::StateChanged(LinkState::Reconnecting))));
    assert!(!seen.iter().any(|e| matches!(e, LinkEvent::Failed { .. })));
}

#[tokio::test]
async fn test_reconnect_exhaustion_fails() {
    let backend = bike_backend();
    backend
        .script(LinkScript::Accept {
            frames: steady_bike_frames(1),
            keep_open: false,
        })
        .script(LinkScript::Reject)
        .script(LinkScript::Reject)
        .script(LinkScript::Reject);

    let mut manager = ConnectionManager::new(fast_config(), backend.clone());
    let mut events = manager.event_receiver();
    let mut state = manager.subscribe_state();

    let device = discover_one(&mut manager).await;
    manager.connect(&device).await.unwrap();
    let (task, _shutdown) = spawn_run(manager);

    let (manager, final_state) = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert_eq!(final_state, LinkState::Failed);
    assert_eq!(manager.state(), LinkState::Failed);
    assert_eq!(*state.borrow_and_update(), LinkState::Failed);
    assert_eq!(backend.connects(), 4);

    let seen = drain(&mut events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, LinkEvent::Failed { attempts: 3, .. })));
}

#[tokio::test]
async fn test_stale_device_rescanned_before_reconnect() {
    let backend = bike_backend();
    backend.script(LinkScript::Accept {
        frames: Vec::new(),
        keep_open: true,
    });
    let config = ConnectionConfig {
        staleness_window_secs: 0,
        scan_timeout_secs: 1,
        reconnect_attempts: 2,
        ..fast_config()
    };

    let mut manager = ConnectionManager::new(config, backend.clone());
    let device = discover_one(&mut manager).await;
    manager.connect(&device).await.unwrap();
    let (task, _shutdown) = spawn_run(manager);

    // The machine disappears for good
    backend.set_adverts(Vec::new());
    backend.drop_link();

    let (_, final_state) = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert_eq!(final_state, LinkState::Failed);
    // One discovery plus one rescan per attempt, no connect to a vanished device
    assert_eq!(backend.scans(), 3);
    assert_eq!(backend.connects(), 1);
}

#[tokio::test]
async fn test_malformed_frames_dropped() {
    let backend = bike_backend();
    backend.script(LinkScript::Accept {
        frames: vec![
            MockSensorData {
                power: 100,
                ..Default::default()
            }
            .bike_frame(),
            // Flags say power follows, frame ends early
            vec![0x40, 0x00, 0xB8],
            MockSensorData {
                power: 120,
                ..Default::default()
            }
            .bike_frame(),
        ],
        keep_open: true,
    });

    let mut manager = ConnectionManager::new(fast_config(), backend.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.set_sink(Arc::new(tx));
    let device = discover_one(&mut manager).await;
    manager.connect(&device).await.unwrap();
    let (task, shutdown) = spawn_run(manager);

    assert_eq!(next_sample(&mut rx).await.power_watts, Some(100));
    assert_eq!(next_sample(&mut rx).await.power_watts, Some(120));

    shutdown.send(true).unwrap();
    let (manager, _) = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert_eq!(manager.state(), LinkState::Idle);
}

#[tokio::test]
async fn test_shutdown_during_reconnect_delay() {
    let backend = bike_backend();
    backend.script(LinkScript::Accept {
        frames: Vec::new(),
        keep_open: true,
    });
    let config = ConnectionConfig {
        reconnect_delay_secs: 20,
        ..fast_config()
    };

    let mut manager = ConnectionManager::new(config, backend.clone());
    let mut state = manager.subscribe_state();
    let device = discover_one(&mut manager).await;
    manager.connect(&device).await.unwrap();
    let (task, shutdown) = spawn_run(manager);

    backend.drop_link();
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == LinkState::Reconnecting))
        .await
        .expect("never started reconnecting")
        .unwrap();

    shutdown.send(true).unwrap();
    let (manager, final_state) = tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .expect("shutdown waited out the reconnect delay")
        .unwrap();
    assert_eq!(final_state, LinkState::Idle);
    assert_eq!(manager.state(), LinkState::Idle);
    assert_eq!(backend.connects(), 1);
}

#[tokio::test]
async fn test_shutdown_cancels_pending_reconnect() {
    let backend = bike_backend();
    backend
        .script(LinkScript::Accept {
            frames: Vec::new(),
            keep_open: true,
        })
        .script(LinkScript::Hang);
    let config = ConnectionConfig {
        connection_timeout_secs: 60,
        ..fast_config()
    };

    let mut manager = ConnectionManager::new(config, backend.clone());
    let device = discover_one(&mut manager).await;
    manager.connect(&device).await.unwrap();
    let (task, shutdown) = spawn_run(manager);

    backend.drop_link();
    let deadline = tokio::time::Instant::now() + WAIT;
    while backend.connects() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "reconnect never attempted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.send(true).unwrap();
    let (_, final_state) = tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .expect("shutdown waited out the connection timeout")
        .unwrap();
    assert_eq!(final_state, LinkState::Idle);
    assert_eq!(backend.cancels(), 1);
}

#[tokio::test]
async fn test_device_watch_follows_rescan() {
    let backend = bike_backend();
    backend
        .script(LinkScript::Accept {
            frames: Vec::new(),
            keep_open: true,
        })
        .script(LinkScript::Accept {
            frames: Vec::new(),
            keep_open: true,
        });
    let config = ConnectionConfig {
        staleness_window_secs: 0,
        scan_timeout_secs: 1,
        ..fast_config()
    };

    let mut manager = ConnectionManager::new(config, backend.clone());
    let mut device_rx = manager.subscribe_device();
    assert!(device_rx.borrow_and_update().is_none());

    let device = discover_one(&mut manager).await;
    manager.connect(&device).await.unwrap();
    assert_eq!(
        device_rx.borrow_and_update().as_ref().and_then(|d| d.rssi),
        Some(-55)
    );
    let (task, shutdown) = spawn_run(manager);

    // The machine comes back closer, under a new name
    backend.set_adverts(vec![ftms_advert("AA:BB", "Echo Bike 2", Some(-42), DeviceKind::Bike)]);
    backend.drop_link();

    let refreshed = tokio::time::timeout(
        WAIT,
        device_rx.wait_for(|d| d.as_ref().and_then(|d| d.rssi) == Some(-42)),
    )
    .await
    .expect("device watch never saw the rescanned descriptor")
    .unwrap()
    .clone();
    let refreshed = refreshed.unwrap();
    assert_eq!(refreshed.address, "AA:BB");
    assert_eq!(refreshed.name, "Echo Bike 2");

    shutdown.send(true).unwrap();
    let (_, final_state) = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert_eq!(final_state, LinkState::Idle);
}
