//! End-to-end bridge runs: mock machine to FIT file.

use crate::fit_fields::{assert_close, number, of_kind, unix_timestamp, value};
use crate::mock_ble::{ftms_advert, steady_bike_frames, LinkScript, MockBackend, MockSensorData};
use chrono::{Duration as ChronoDuration, Utc};
use ftmsbridge::bridge::Bridge;
use ftmsbridge::recording::recorder::SessionRecorder;
use ftmsbridge::recording::types::{
    ExportConfig, ExportError, SessionConfig, SessionError, SessionState, SessionStatus,
};
use ftmsbridge::sensors::manager::ConnectionManager;
use ftmsbridge::sensors::types::{ConnectionConfig, DeviceKind, LinkState, Sample};
use ftmsbridge::storage::database::Database;
use ftmsbridge::storage::store::{shared, WorkoutStore};
use std::time::Duration;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

fn link_config() -> ConnectionConfig {
    ConnectionConfig {
        connection_timeout_secs: 1,
        reconnect_delay_secs: 0,
        reconnect_attempts: 2,
        ..Default::default()
    }
}

/// A manager connected to a mock bike whose link stays open.
async fn connected_bike() -> (ConnectionManager<MockBackend>, MockBackend) {
    connected_bike_with(link_config()).await
}

async fn connected_bike_with(
    config: ConnectionConfig,
) -> (ConnectionManager<MockBackend>, MockBackend) {
    let backend = MockBackend::new(vec![ftms_advert(
        "E8:9F:6D:00:11:22",
        "Echo Bike",
        Some(-58),
        DeviceKind::Bike,
    )]);
    backend.script(LinkScript::Accept {
        frames: Vec::new(),
        keep_open: true,
    });

    let mut manager = ConnectionManager::new(config, backend.clone());
    let device = manager
        .discover(Duration::from_secs(1))
        .await
        .unwrap()
        .remove(0);
    manager.connect(&device).await.unwrap();
    (manager, backend)
}

async fn wait_for_status(bridge: &Bridge, check: impl Fn(&SessionStatus) -> bool) -> SessionStatus {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let status = bridge.status().await.unwrap().session;
        if check(&status) {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session never reached the expected status: {:?}",
            status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_ride_to_activity_file() {
    let (manager, backend) = connected_bike().await;
    let bridge = Bridge::launch(
        manager,
        SessionRecorder::new(SessionConfig::default()),
        ExportConfig::default(),
        None,
    );

    let id = bridge.start_session().await.unwrap();
    for frame in steady_bike_frames(30) {
        assert!(backend.feed(frame));
    }
    wait_for_status(&bridge, |s| s.sample_count == 30).await;

    let status = bridge.status().await.unwrap();
    assert_eq!(status.link, LinkState::Connected);
    assert_eq!(status.device.as_ref().map(|d| d.kind), Some(DeviceKind::Bike));
    assert_eq!(status.session.session_id, Some(id));
    assert_eq!(status.session.state, Some(SessionState::Recording));
    assert_eq!(
        status.last_sample.and_then(|s| s.distance_m),
        Some(29 * 8)
    );

    let record = bridge.end_session().await.unwrap();
    assert_eq!(record.id, id);
    assert_eq!(record.state, SessionState::Completed);
    assert_eq!(record.samples.len(), 30);
    let summary = record.summary.as_ref().unwrap();
    assert_eq!(summary.avg_power, Some(150.0));
    assert_eq!(summary.avg_cadence, Some(80.0));
    assert_eq!(summary.max_heart_rate, None);

    let (bytes, filename) = bridge.activity_file(id).unwrap();
    assert!(filename.starts_with("bike_"));
    assert!(filename.ends_with(".fit"));

    let messages = fitparser::from_bytes(&bytes).unwrap();
    let records = of_kind(&messages, "record");
    assert_eq!(records.len(), 30);
    for (i, (sample, message)) in record.samples.iter().zip(&records).enumerate() {
        assert_eq!(unix_timestamp(message), Some(sample.timestamp.timestamp()));
        assert_close(number(message, "power"), 150.0, "power");
        assert_close(number(message, "cadence"), 80.0, "cadence");
        assert_close(number(message, "distance"), (i * 8) as f64, "distance");
        assert_close(number(message, "enhanced_speed"), 8.333, "enhanced_speed");
        assert!(value(message, "heart_rate").is_none());
    }

    let session = of_kind(&messages, "session")[0];
    assert_close(number(session, "avg_power"), 150.0, "avg_power");
    assert_close(number(session, "max_power"), 150.0, "max_power");
    assert_close(number(session, "avg_cadence"), 80.0, "avg_cadence");
    assert_close(number(session, "total_distance"), 232.0, "total_distance");

    assert_eq!(bridge.shutdown().await, LinkState::Idle);
}

#[tokio::test]
async fn test_link_failure_pauses_session() {
    let (manager, backend) = connected_bike().await;
    backend.script(LinkScript::Reject).script(LinkScript::Reject);
    let bridge = Bridge::launch(
        manager,
        SessionRecorder::new(SessionConfig::default()),
        ExportConfig::default(),
        None,
    );

    bridge.start_session().await.unwrap();
    for frame in steady_bike_frames(3) {
        backend.feed(frame);
    }
    wait_for_status(&bridge, |s| s.sample_count == 3).await;

    let mut link_state = bridge.subscribe_link_state();
    backend.drop_link();
    tokio::time::timeout(WAIT, link_state.wait_for(|s| *s == LinkState::Failed))
        .await
        .expect("link never failed")
        .unwrap();

    wait_for_status(&bridge, |s| s.state == Some(SessionState::Paused)).await;

    let record = bridge.end_session().await.unwrap();
    assert_eq!(record.state, SessionState::Completed);
    assert_eq!(record.samples.len(), 3);
    assert_eq!(record.pauses.len(), 1);
    assert!(record.pauses[0].ended_at.is_some());
    assert_eq!(record.summary.as_ref().unwrap().pause_count, 1);

    assert_eq!(bridge.shutdown().await, LinkState::Failed);
}

#[tokio::test]
async fn test_only_one_session_starts() {
    let (manager, _backend) = connected_bike().await;
    let bridge = Bridge::launch(
        manager,
        SessionRecorder::new(SessionConfig::default()),
        ExportConfig::default(),
        None,
    );

    let (a, b) = tokio::join!(bridge.start_session(), bridge.start_session());
    let winner = match (&a, &b) {
        (Ok(id), Err(SessionError::SessionAlreadyActive(active)))
        | (Err(SessionError::SessionAlreadyActive(active)), Ok(id)) => {
            assert_eq!(id, active);
            *id
        }
        other => panic!("expected exactly one session to start: {:?}", other),
    };

    let status = bridge.status().await.unwrap();
    assert_eq!(status.session.session_id, Some(winner));
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_export_errors() {
    let (manager, backend) = connected_bike().await;
    let bridge = Bridge::launch(
        manager,
        SessionRecorder::new(SessionConfig::default()),
        ExportConfig::default(),
        None,
    );

    assert!(matches!(
        bridge.activity_file(Uuid::new_v4()),
        Err(ExportError::SessionNotFound(_))
    ));
    assert_eq!(
        bridge.end_session().await.unwrap_err(),
        SessionError::NoActiveSession
    );

    bridge.start_session().await.unwrap();
    backend.feed(MockSensorData::default().bike_frame());
    wait_for_status(&bridge, |s| s.sample_count == 1).await;
    let aborted = bridge.abort_session("rider left").await.unwrap();
    assert_eq!(aborted.state, SessionState::Aborted);
    assert!(matches!(
        bridge.activity_file(aborted.id),
        Err(ExportError::NotCompleted(SessionState::Aborted))
    ));

    bridge.start_session().await.unwrap();
    let empty = bridge.end_session().await.unwrap();
    assert!(matches!(
        bridge.activity_file(empty.id),
        Err(ExportError::EmptySession)
    ));

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_records_broadcast_on_completion() {
    let (manager, _backend) = connected_bike().await;
    let bridge = Bridge::launch(
        manager,
        SessionRecorder::new(SessionConfig::default()),
        ExportConfig::default(),
        None,
    );
    let mut records = bridge.subscribe_records();

    let id = bridge.start_session().await.unwrap();
    bridge.end_session().await.unwrap();

    let record = tokio::time::timeout(WAIT, records.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.id, id);
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_export_from_store() {
    let store = shared(Database::open_in_memory().unwrap());

    // A workout recorded before this bridge was launched
    let mut earlier = SessionRecorder::with_store(SessionConfig::default(), store.clone());
    let started = Utc::now() - ChronoDuration::hours(2);
    let earlier_id = earlier.start_at(DeviceKind::Bike, started).unwrap();
    for t in 1..=20 {
        let mut sample = Sample::new(DeviceKind::Bike, started + ChronoDuration::seconds(t));
        sample.power_watts = Some(180);
        earlier.ingest(sample);
    }
    earlier.end().unwrap();
    // Waits for the queued writes
    drop(earlier);

    let (manager, backend) = connected_bike().await;
    let bridge = Bridge::launch(
        manager,
        SessionRecorder::with_store(SessionConfig::default(), store.clone()),
        ExportConfig::default(),
        Some(store.clone()),
    );

    let (bytes, _) = bridge.activity_file(earlier_id).unwrap();
    let messages = fitparser::from_bytes(&bytes).unwrap();
    let records = of_kind(&messages, "record");
    assert_eq!(records.len(), 20);
    for message in records {
        assert_close(number(message, "power"), 180.0, "power");
    }

    let id = bridge.start_session().await.unwrap();
    for frame in steady_bike_frames(5) {
        backend.feed(frame);
    }
    wait_for_status(&bridge, |s| s.sample_count == 5).await;
    bridge.end_session().await.unwrap();
    bridge.shutdown().await;

    let stored = store.lock().unwrap().get_workout(id).unwrap().unwrap();
    assert_eq!(stored.state, SessionState::Completed);
    assert_eq!(stored.samples.len(), 5);
}

#[tokio::test]
async fn test_shutdown_while_reconnecting() {
    let (manager, backend) = connected_bike_with(ConnectionConfig {
        reconnect_delay_secs: 20,
        ..link_config()
    })
    .await;
    let bridge = Bridge::launch(
        manager,
        SessionRecorder::new(SessionConfig::default()),
        ExportConfig::default(),
        None,
    );

    let mut link_state = bridge.subscribe_link_state();
    backend.drop_link();
    tokio::time::timeout(WAIT, link_state.wait_for(|s| *s == LinkState::Reconnecting))
        .await
        .expect("never started reconnecting")
        .unwrap();

    let final_state = tokio::time::timeout(Duration::from_secs(3), bridge.shutdown())
        .await
        .expect("shutdown waited out the reconnect delay");
    assert_eq!(final_state, LinkState::Idle);
}

#[tokio::test]
async fn test_session_ended_by_duration_limit() {
    let (manager, backend) = connected_bike().await;
    let bridge = Bridge::launch(
        manager,
        SessionRecorder::new(SessionConfig {
            max_duration_secs: 1,
            ..Default::default()
        }),
        ExportConfig::default(),
        None,
    );

    let id = bridge.start_session().await.unwrap();
    backend.feed(MockSensorData::default().bike_frame());
    tokio::time::sleep(Duration::from_millis(1200)).await;
    backend.feed(
        MockSensorData {
            distance: 8,
            ..Default::default()
        }
        .bike_frame(),
    );
    wait_for_status(&bridge, |s| s.session_id.is_none()).await;

    assert_eq!(
        bridge.end_session().await.unwrap_err(),
        SessionError::NoActiveSession
    );
    let record = bridge.finish_session(id).await.unwrap();
    assert_eq!(record.id, id);
    assert_eq!(record.state, SessionState::Completed);
    assert_eq!(record.samples.len(), 2);

    let (bytes, _) = bridge.activity_file(id).unwrap();
    assert!(!bytes.is_empty());
    assert_eq!(
        bridge.finish_session(Uuid::new_v4()).await.unwrap_err(),
        SessionError::NoActiveSession
    );

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_finish_session_ends_active_session() {
    let (manager, backend) = connected_bike().await;
    let bridge = Bridge::launch(
        manager,
        SessionRecorder::new(SessionConfig::default()),
        ExportConfig::default(),
        None,
    );

    let id = bridge.start_session().await.unwrap();
    backend.feed(MockSensorData::default().bike_frame());
    wait_for_status(&bridge, |s| s.sample_count == 1).await;

    let record = bridge.finish_session(id).await.unwrap();
    assert_eq!(record.id, id);
    assert_eq!(record.state, SessionState::Completed);
    assert!(bridge.status().await.unwrap().session.session_id.is_none());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_status_device_follows_reconnect() {
    let (manager, backend) = connected_bike_with(ConnectionConfig {
        staleness_window_secs: 0,
        scan_timeout_secs: 1,
        ..link_config()
    })
    .await;
    backend.script(LinkScript::Accept {
        frames: Vec::new(),
        keep_open: true,
    });
    let bridge = Bridge::launch(
        manager,
        SessionRecorder::new(SessionConfig::default()),
        ExportConfig::default(),
        None,
    );
    let before = bridge.status().await.unwrap().device.unwrap();
    assert_eq!(before.rssi, Some(-58));

    backend.set_adverts(vec![ftms_advert(
        "E8:9F:6D:00:11:22",
        "Echo Bike",
        Some(-47),
        DeviceKind::Bike,
    )]);
    backend.drop_link();

    let deadline = tokio::time::Instant::now() + WAIT;
    let after = loop {
        let status = bridge.status().await.unwrap();
        let device = status.device.unwrap();
        if status.link == LinkState::Connected && device.rssi != before.rssi {
            break device;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "status never showed the rescanned device"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(after.address, before.address);
    assert_eq!(after.rssi, Some(-47));
    assert!(after.last_seen > before.last_seen);

    assert_eq!(bridge.shutdown().await, LinkState::Idle);
}
